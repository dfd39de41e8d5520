// src/standard.rs
//
// =============================================================================
// KILN: BUILT-IN METHODS
// =============================================================================
//
// dataset_type: rewrite a source dataset's byteslike columns into typed
// columns under a new dataset. Supports per-column defaults, diverting
// failing rows to a sibling "bad" dataset (filter_bad), carrying
// untyped columns along, and repartitioning on a (possibly new)
// hashlabel. When repartitioning, each source slice produces its own
// chained output dataset ("default.0" ... "default", linked by
// previous), so the analysis workers never share files.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::{InputSpec, MethodSpec, OptionSpec, Outcome, PhaseMask, Value};
use crate::dataset::typing::{self, ColumnPlan, TypePlan, BYTESLIKE};
use crate::dataset::write::WriterConfig;
use crate::dataset::ColumnType;
use crate::error::{KilnError, Result};
use crate::launch::{JobContext, MethodRuntime, SliceContext};
use crate::methods::{MethodRegistry, BUILTIN_PACKAGE};

pub fn register_builtins(registry: &mut MethodRegistry) {
    registry.provide(dataset_type_spec(), Arc::new(DatasetType));
}

fn dataset_type_spec() -> MethodSpec {
    MethodSpec {
        name: "dataset_type".into(),
        package: BUILTIN_PACKAGE.into(),
        description: "convert byteslike columns to typed columns".into(),
        options: vec![
            (
                "column2type".into(),
                OptionSpec::Map {
                    value: Box::new(OptionSpec::Str { default: None }),
                    ordered: false,
                },
            ),
            (
                "defaults".into(),
                OptionSpec::Map {
                    value: Box::new(OptionSpec::Str { default: None }),
                    ordered: false,
                },
            ),
            ("hashlabel".into(), OptionSpec::Str { default: None }),
            ("filter_bad".into(), OptionSpec::Bool { default: Some(false) }),
            (
                "discard_untyped".into(),
                OptionSpec::Bool { default: Some(false) },
            ),
            (
                "decimal_separator".into(),
                OptionSpec::Str {
                    default: Some(".".into()),
                },
            ),
            ("caption".into(), OptionSpec::Str { default: None }),
        ],
        datasets: vec![InputSpec::single("source"), InputSpec::single("previous")],
        jobs: vec![],
        phases: PhaseMask {
            prepare: true,
            analysis: true,
            synthesis: true,
        },
    }
}

/// Everything analysis needs, carried through prepare_res.
#[derive(Serialize, Deserialize)]
struct Prepared {
    plan: TypePlan,
    /// Output dataset name per source slice (all "default" when not
    /// repartitioning).
    names: Vec<String>,
    filter_bad: bool,
}

struct DatasetType;

fn str_map(value: &Value) -> BTreeMap<String, Option<String>> {
    match value {
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::Unicode(s) | Value::Ascii(s) => Some(s.clone()),
                    _ => None,
                };
                (k.clone(), v)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

impl MethodRuntime for DatasetType {
    fn prepare(&self, ctx: &JobContext) -> Result<Outcome> {
        let source = ctx.dataset("source")?.clone();
        let column2type = str_map(&ctx.option("column2type"));
        let defaults = str_map(&ctx.option("defaults"));
        if column2type.is_empty() {
            return Err(KilnError::BadOption("column2type is empty".into()));
        }
        let filter_bad = matches!(ctx.option("filter_bad"), Value::Bool(true));
        let discard_untyped = matches!(ctx.option("discard_untyped"), Value::Bool(true));
        let decimal_separator = match ctx.option("decimal_separator") {
            Value::Unicode(s) if s.chars().count() == 1 => s.chars().next().unwrap(),
            Value::None => '.',
            other => {
                return Err(KilnError::BadOption(format!(
                    "decimal_separator must be a single character, not {:?}",
                    other,
                )))
            }
        };

        // Validate the requested columns and compile the plan.
        let mut columns: Vec<ColumnPlan> = Vec::new();
        let mut none_support: BTreeMap<String, bool> = BTreeMap::new();
        for (colname, type_spec) in &column2type {
            let type_spec = match type_spec {
                Some(t) => t.clone(),
                None => {
                    return Err(KilnError::BadOption(format!(
                        "no type for column {:?}",
                        colname,
                    )))
                }
            };
            let dc = source.meta.columns.get(colname).ok_or_else(|| {
                KilnError::BadOption(format!(
                    "dataset {} doesn't have a column named {:?}",
                    source.id, colname,
                ))
            })?;
            if !BYTESLIKE.contains(&dc.typ) {
                return Err(KilnError::BadOption(format!(
                    "dataset {} column {:?} is type {}, must be bytes/ascii/unicode",
                    source.id, colname, dc.typ,
                )));
            }
            let conv = typing::Converter::parse(&type_spec, decimal_separator)?;
            let default = defaults.get(colname).map(|d| d.clone());
            none_support.insert(
                colname.clone(),
                conv.empty_as_none || dc.none_support || default == Some(None),
            );
            columns.push(ColumnPlan {
                name: colname.clone(),
                type_spec,
                default,
                requested: true,
            });
        }

        // Hashlabel and repartitioning.
        let (hashlabel, hashlabel_override) = match ctx.option("hashlabel") {
            Value::None => (source.meta.hashlabel.clone(), false),
            Value::Unicode(s) if s.is_empty() => (None, true),
            Value::Unicode(s) => (Some(s), true),
            other => {
                return Err(KilnError::BadOption(format!(
                    "bad hashlabel {:?}",
                    other,
                )))
            }
        };
        let rehashing = match (&hashlabel, hashlabel_override) {
            (Some(h), false) => column2type.contains_key(h),
            (Some(_), true) => true,
            (None, _) => false,
        };
        if let (Some(h), true) = (&hashlabel, rehashing) {
            if !column2type.contains_key(h) {
                return Err(KilnError::BadOption(format!(
                    "can't rehash {} on untyped column {:?}",
                    source.id, h,
                )));
            }
        }

        // Carry the untyped columns along unless discarded.
        if (filter_bad || rehashing) && !discard_untyped {
            for (colname, dc) in &source.meta.columns {
                if column2type.contains_key(colname) {
                    continue;
                }
                none_support.insert(colname.clone(), dc.none_support);
                columns.push(ColumnPlan {
                    name: colname.clone(),
                    type_spec: format!("null_{}", dc.typ),
                    default: None,
                    requested: false,
                });
            }
        }

        let parent = if filter_bad || rehashing || discard_untyped {
            None
        } else {
            Some(source.id.clone())
        };
        let previous = ctx.datasets.get("previous").and_then(|v| v.first());
        let caption = match ctx.option("caption") {
            Value::Unicode(s) => s,
            _ => format!("typed from {}", source.id),
        };

        // Output column declarations.
        let mut out_columns: Vec<(String, ColumnType, bool)> = Vec::new();
        for col in &columns {
            let conv = typing::Converter::parse(&col.type_spec, decimal_separator)?;
            out_columns.push((
                col.name.clone(),
                conv.output,
                *none_support.get(&col.name).unwrap_or(&true),
            ));
        }

        let mut names = Vec::new();
        if rehashing {
            // One chained dataset per source slice; the last one is the
            // chain tip named "default".
            let mut prev = previous.map(|d| d.id.clone());
            for sliceno in 0..ctx.slices {
                let name = if sliceno == ctx.slices - 1 {
                    "default".to_string()
                } else {
                    format!("default.{}", sliceno)
                };
                let config = WriterConfig {
                    name: name.clone(),
                    columns: out_columns.clone(),
                    hashlabel: hashlabel.clone(),
                    hashlabel_override,
                    caption: Some(format!("{} (slice {})", caption, sliceno)),
                    filename: source.meta.filename.clone(),
                    previous: prev.clone(),
                    parent: None,
                    allow_missing_slices: false,
                    meta_only: true,
                };
                let dw = ctx.create_writer(config)?;
                prev = Some(dw.ds_id());
                names.push(name);
            }
        } else {
            let config = WriterConfig {
                name: "default".into(),
                columns: out_columns,
                hashlabel: hashlabel.clone(),
                hashlabel_override,
                caption: Some(caption),
                filename: source.meta.filename.clone(),
                previous: previous.map(|d| d.id.clone()),
                parent,
                allow_missing_slices: false,
                meta_only: true,
            };
            ctx.create_writer(config)?;
            names = vec!["default".to_string(); ctx.slices];
        }

        if filter_bad {
            let bad_columns: Vec<(String, ColumnType, bool)> = columns
                .iter()
                .filter(|c| c.requested)
                .map(|c| (c.name.clone(), ColumnType::Bytes, true))
                .collect();
            ctx.create_writer(WriterConfig {
                name: "bad".into(),
                columns: bad_columns,
                hashlabel: None,
                hashlabel_override: false,
                caption: Some("failed to type".into()),
                filename: source.meta.filename.clone(),
                previous: None,
                parent: None,
                allow_missing_slices: false,
                meta_only: true,
            })?;
        }

        let prepared = Prepared {
            plan: TypePlan {
                columns,
                filter_bad,
                rehash: rehashing.then(|| hashlabel.clone().unwrap()),
                decimal_separator,
            },
            names,
            filter_bad,
        };
        Ok(Outcome::Continue(Some(serde_json::to_value(&prepared)?)))
    }

    fn analysis(&self, sctx: &SliceContext) -> Result<Outcome> {
        let ctx = sctx.ctx;
        let prepared: Prepared = serde_json::from_value(
            ctx.prepare_res()
                .ok_or_else(|| KilnError::Server("missing prepare result".into()))?,
        )?;
        let source = ctx.dataset("source")?;
        let dw = ctx.writer(&prepared.names[sctx.sliceno])?;
        let dw_bad = if prepared.filter_bad {
            Some(ctx.writer("bad")?)
        } else {
            None
        };
        let result = typing::type_slice(
            &ctx.workdirs,
            source,
            sctx.sliceno,
            ctx.slices,
            &prepared.plan,
            &dw,
            dw_bad.as_deref(),
        )?;
        for (dest, stats) in result.stats {
            sctx.record_stats(&dw.name, dest, stats);
        }
        if let (Some(dwb), Some(stats)) = (&dw_bad, result.bad_stats) {
            sctx.record_stats(&dwb.name, sctx.sliceno, stats);
        }
        let bad_total: u64 = result.bad_count.values().sum();
        if bad_total > 0 {
            sctx.say(format!("slice {}: {} bad values", sctx.sliceno, bad_total));
        }
        Ok(Outcome::Continue(Some(json!({
            "bad": result.bad_count,
            "defaulted": result.default_count,
        }))))
    }

    fn synthesis(&self, ctx: &JobContext) -> Result<Outcome> {
        let mut bad_total = 0u64;
        let mut defaulted_total = 0u64;
        for res in ctx.analysis_res().into_iter().flatten() {
            if let Some(map) = res.get("bad").and_then(|v| v.as_object()) {
                bad_total += map.values().filter_map(|v| v.as_u64()).sum::<u64>();
            }
            if let Some(map) = res.get("defaulted").and_then(|v| v.as_object()) {
                defaulted_total += map.values().filter_map(|v| v.as_u64()).sum::<u64>();
            }
        }
        if bad_total > 0 || defaulted_total > 0 {
            ctx.say(format!(
                "{} bad values, {} defaulted",
                bad_total, defaulted_total,
            ));
        }
        Ok(Outcome::Continue(Some(json!({
            "bad": bad_total,
            "defaulted": defaulted_total,
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_registers_and_declares_phases() {
        let spec = dataset_type_spec();
        assert!(spec.phases.prepare && spec.phases.analysis && spec.phases.synthesis);
        assert!(spec.option("column2type").is_some());
        assert!(spec.datasets.iter().any(|i| i.name == "source"));
    }
}
