// src/options.rs
//
// =============================================================================
// KILN: OPTION TYPING & FINGERPRINTS
// =============================================================================
//
// One coercion routine turns submitted JSON into typed Values per the
// method's OptionSpec (strings may be parsed into dates/paths/numbers;
// None is allowed iff the spec permits; required options must be
// present). The canonical fingerprint is the sorted set of
// "<method> <group>-<key> <canonical json>" lines over the fully
// defaulted option/dataset/job map; two submissions reuse the same job
// iff their fingerprints are byte-equal.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{json, Value as Json};

use crate::core::{DatasetId, JobId, MethodSpec, OptionSpec, RefOrList, Value};
use crate::error::{KilnError, Result};

pub type Fingerprint = BTreeSet<String>;

// ----------------------------------------------------------------------------
// Coercion
// ----------------------------------------------------------------------------

fn bad(key: &str, msg: impl std::fmt::Display) -> KilnError {
    KilnError::BadOption(format!("{}: {}", key, msg))
}

pub fn default_value(spec: &OptionSpec) -> Value {
    match spec {
        OptionSpec::Bool { default } => default.map_or(Value::None, Value::Bool),
        OptionSpec::Int { default } => default.map_or(Value::None, Value::Int),
        OptionSpec::Float { default } => default.map_or(Value::None, Value::Float),
        OptionSpec::Str { default } => default
            .clone()
            .map_or(Value::None, Value::Unicode),
        OptionSpec::RequiredStr => Value::None,
        OptionSpec::Enum { default, .. } => default
            .clone()
            .map_or(Value::None, Value::Unicode),
        OptionSpec::Date { default } => default.map_or(Value::None, Value::Date),
        OptionSpec::Time { default } => default.map_or(Value::None, Value::Time),
        OptionSpec::DateTime { default } => default.map_or(Value::None, Value::DateTime),
        OptionSpec::Path { default } => default
            .clone()
            .map_or(Value::None, Value::Path),
        OptionSpec::Json { default } => {
            if default.is_null() {
                Value::None
            } else {
                Value::Json(default.clone())
            }
        }
        OptionSpec::List { .. } => Value::List(vec![]),
        OptionSpec::Set { .. } => Value::Set(vec![]),
        OptionSpec::Map { .. } => Value::Map(vec![]),
        OptionSpec::Required { inner, .. } => default_value(inner),
    }
}

/// Convert one provided JSON value to its declared type. `key` is only
/// for error messages.
pub fn coerce(key: &str, spec: &OptionSpec, provided: &Json) -> Result<Value> {
    if provided.is_null() {
        return match spec {
            OptionSpec::Required { none_ok: true, .. } => Ok(Value::None),
            OptionSpec::Required { .. } | OptionSpec::RequiredStr => {
                Err(bad(key, "may not be None"))
            }
            OptionSpec::Enum { none_ok: false, .. } => Err(bad(key, "may not be None")),
            _ => Ok(Value::None),
        };
    }
    match spec {
        OptionSpec::Required { inner, .. } => coerce(key, inner, provided),
        OptionSpec::Bool { .. } => match provided {
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(Value::Bool(n.as_f64() != Some(0.0))),
            _ => Err(bad(key, format!("can't convert {} to bool", provided))),
        },
        OptionSpec::Int { .. } => match provided {
            Json::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| bad(key, format!("{} is not an integer", n))),
            Json::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| bad(key, format!("can't parse {:?} as int", s))),
            Json::Bool(b) => Ok(Value::Int(*b as i64)),
            _ => Err(bad(key, format!("can't convert {} to int", provided))),
        },
        OptionSpec::Float { .. } => match provided {
            Json::Number(n) => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
            Json::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| bad(key, format!("can't parse {:?} as float", s))),
            _ => Err(bad(key, format!("can't convert {} to float", provided))),
        },
        OptionSpec::Str { .. } => match provided {
            Json::String(s) => Ok(Value::Unicode(s.clone())),
            Json::Number(n) => Ok(Value::Unicode(n.to_string())),
            Json::Bool(b) => Ok(Value::Unicode(b.to_string())),
            _ => Err(bad(key, format!("can't convert {} to str", provided))),
        },
        OptionSpec::RequiredStr => match provided {
            Json::String(s) if !s.is_empty() => Ok(Value::Unicode(s.clone())),
            _ => Err(bad(key, "requires a non-empty string")),
        },
        OptionSpec::Enum { values, .. } => match provided {
            Json::String(s) => {
                if values.iter().any(|v| v == s) {
                    Ok(Value::Unicode(s.clone()))
                } else {
                    Err(bad(
                        key,
                        format!("{:?} not in enum [{}]", s, values.join(", ")),
                    ))
                }
            }
            _ => Err(bad(key, format!("can't convert {} to enum", provided))),
        },
        OptionSpec::Date { .. } => parse_calendar(key, provided, 3).map(|d| Value::Date(d.date())),
        OptionSpec::Time { .. } => parse_calendar(key, provided, 7).map(|d| Value::Time(d.time())),
        OptionSpec::DateTime { .. } => parse_calendar(key, provided, 7).map(Value::DateTime),
        OptionSpec::Path { .. } => match provided {
            Json::String(s) => Ok(Value::Path(PathBuf::from(s))),
            _ => Err(bad(key, format!("can't convert {} to path", provided))),
        },
        OptionSpec::Json { .. } => Ok(Value::Json(provided.clone())),
        OptionSpec::List { elem } => match provided {
            Json::Array(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|v| coerce(key, elem, v))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(Value::List(vec![coerce(key, elem, other)?])),
        },
        OptionSpec::Set { elem } => match provided {
            Json::Array(items) => {
                let mut vals: Vec<Value> = items
                    .iter()
                    .map(|v| coerce(key, elem, v))
                    .collect::<Result<_>>()?;
                sort_set(&mut vals);
                vals.dedup();
                Ok(Value::Set(vals))
            }
            other => Ok(Value::Set(vec![coerce(key, elem, other)?])),
        },
        OptionSpec::Map { value, .. } => match provided {
            Json::Object(map) => Ok(Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), coerce(key, value, v)?)))
                    .collect::<Result<_>>()?,
            )),
            _ => Err(bad(key, format!("can't convert {} to map", provided))),
        },
    }
}

/// Dates arrive either as strings ("2023-01-02", "2023-01-02 03:04:05")
/// or as the setup-encoded arrays [y, m, d(, H, M, S, us)].
fn parse_calendar(key: &str, provided: &Json, want_len: usize) -> Result<NaiveDateTime> {
    match provided {
        Json::String(s) => {
            let s = s.trim();
            for fmt in [
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
            ] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(dt);
                }
            }
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(d.and_hms_opt(0, 0, 0).unwrap());
            }
            if want_len == 7 {
                if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                    return Ok(epoch_date().and_time(t));
                }
                if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S") {
                    return Ok(epoch_date().and_time(t));
                }
            }
            Err(bad(key, format!("can't parse {:?} as date/time", s)))
        }
        Json::Array(parts) => {
            let mut nums = [0i64; 7];
            if parts.len() > 7 || parts.is_empty() {
                return Err(bad(key, "bad calendar array"));
            }
            for (i, p) in parts.iter().enumerate() {
                nums[i] = p
                    .as_i64()
                    .ok_or_else(|| bad(key, "bad calendar array"))?;
            }
            let date = NaiveDate::from_ymd_opt(nums[0] as i32, nums[1] as u32, nums[2] as u32)
                .ok_or_else(|| bad(key, "bad calendar values"))?;
            let time = NaiveTime::from_hms_micro_opt(
                nums[3] as u32,
                nums[4] as u32,
                nums[5] as u32,
                nums[6] as u32,
            )
            .ok_or_else(|| bad(key, "bad calendar values"))?;
            Ok(date.and_time(time))
        }
        _ => Err(bad(key, format!("can't convert {} to date/time", provided))),
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

fn sort_set(vals: &mut [Value]) {
    // Sorted, except None sorts last (like the canonical set encoding).
    vals.sort_by(|a, b| match (a.is_none(), b.is_none()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => a.cmp_value(b),
    });
}

/// Type and default a full submission against the schema. Rejects
/// unknown keys; fails on missing required options.
pub fn typed_options(
    spec: &MethodSpec,
    provided: &serde_json::Map<String, Json>,
) -> Result<Vec<(String, Value)>> {
    for key in provided.keys() {
        if spec.option(key).is_none() {
            return Err(KilnError::BadOption(format!(
                "unknown option {:?} for method {}",
                key, spec.name,
            )));
        }
    }
    let mut out = Vec::with_capacity(spec.options.len());
    for (key, ospec) in &spec.options {
        let value = match provided.get(key) {
            Some(v) => coerce(key, ospec, v)?,
            None => {
                if ospec.is_required() {
                    return Err(KilnError::BadOption(format!(
                        "option {:?} is required for method {}",
                        key, spec.name,
                    )));
                }
                default_value(ospec)
            }
        };
        out.push((key.clone(), value));
    }
    Ok(out)
}

// ----------------------------------------------------------------------------
// Canonical encoding (setup.json option values + fingerprint reprs)
// ----------------------------------------------------------------------------

/// Encode a typed value the way setup.json stores it: calendar types as
/// arrays, sets as sorted lists (None last), paths as strings, maps
/// sorted unless the schema declared them ordered.
pub fn value_to_setup_json(value: &Value, ordered: bool) -> Json {
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Complex { re, im } => json!([re, im]),
        Value::Number(n) => match n {
            crate::core::Number::Int(i) => json!(i),
            crate::core::Number::Float(f) => json!(f),
            crate::core::Number::Big(b) => json!(b.to_string()),
        },
        Value::Bytes(b) => json!(String::from_utf8_lossy(b)),
        Value::Ascii(s) | Value::Unicode(s) => json!(s),
        Value::Json(j) => j.clone(),
        Value::Date(d) => {
            use chrono::Datelike;
            json!([d.year(), d.month(), d.day()])
        }
        Value::Time(t) => {
            use chrono::Timelike;
            json!([1970, 1, 1, t.hour(), t.minute(), t.second(), t.nanosecond() / 1000])
        }
        Value::DateTime(dt) => {
            use chrono::{Datelike, Timelike};
            json!([
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second(),
                dt.and_utc().timestamp_subsec_micros(),
            ])
        }
        Value::Path(p) => json!(p.to_string_lossy()),
        Value::List(items) => {
            Json::Array(items.iter().map(|v| value_to_setup_json(v, ordered)).collect())
        }
        Value::Set(items) => {
            let mut items = items.clone();
            sort_set(&mut items);
            Json::Array(items.iter().map(|v| value_to_setup_json(v, ordered)).collect())
        }
        Value::Map(entries) => {
            let mut entries: Vec<_> = entries.iter().collect();
            if !ordered {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), value_to_setup_json(v, ordered));
            }
            Json::Object(map)
        }
    }
}

fn spec_is_ordered(spec: &OptionSpec) -> bool {
    match spec {
        OptionSpec::Map { ordered, .. } => *ordered,
        OptionSpec::Required { inner, .. } => spec_is_ordered(inner),
        _ => false,
    }
}

/// The `_typing` pairs for setup.json: option leaves whose plain JSON
/// form needs coercion back to a richer type on load.
pub fn typing_pairs(spec: &MethodSpec) -> Vec<(String, String)> {
    fn leaf_type(ospec: &OptionSpec) -> Option<String> {
        match ospec {
            OptionSpec::Date { .. } => Some("date".into()),
            OptionSpec::Time { .. } => Some("time".into()),
            OptionSpec::DateTime { .. } => Some("datetime".into()),
            OptionSpec::Path { .. } => Some("Path".into()),
            OptionSpec::Set { .. } => Some("set".into()),
            OptionSpec::Required { inner, .. } => leaf_type(inner),
            _ => None,
        }
    }
    let mut out = Vec::new();
    for (name, ospec) in &spec.options {
        match ospec {
            OptionSpec::List { elem } => {
                if let Some(t) = leaf_type(elem) {
                    out.push((name.clone(), format!("[{}]", t)));
                }
            }
            OptionSpec::Map { value, .. } => {
                if let Some(t) = leaf_type(value) {
                    out.push((format!("{}/*", name), t));
                }
            }
            other => {
                if let Some(t) = leaf_type(other) {
                    out.push((name.clone(), t));
                }
            }
        }
    }
    // Longest path first, so entries inside a mapping are coerced
    // before the mapping itself.
    out.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));
    out
}

// ----------------------------------------------------------------------------
// Fingerprints
// ----------------------------------------------------------------------------

fn repr(value: &Value, ordered: bool) -> String {
    serde_json::to_string(&value_to_setup_json(value, ordered)).expect("value encodes")
}

/// Build the canonical option-set for a fully typed submission.
pub fn fingerprint(
    spec: &MethodSpec,
    options: &[(String, Value)],
    datasets: &[(String, RefOrList<DatasetId>)],
    jobs: &[(String, RefOrList<JobId>)],
) -> Fingerprint {
    let mut set = BTreeSet::new();
    for (key, value) in options {
        let ordered = spec.option(key).map(spec_is_ordered).unwrap_or(false);
        set.insert(format!(
            "{} options-{} {}",
            spec.name,
            key,
            repr(value, ordered)
        ));
    }
    // Every declared input appears, provided or not, so fingerprints
    // of equal submissions are equal regardless of which defaults the
    // caller spelled out.
    for input in &spec.datasets {
        let entry = datasets.iter().find(|(n, _)| *n == input.name);
        set.insert(format!(
            "{} datasets-{} {}",
            spec.name,
            input.name,
            input_repr(entry.map(|(_, v)| v), input.is_list)
        ));
    }
    for input in &spec.jobs {
        let entry = jobs.iter().find(|(n, _)| *n == input.name);
        set.insert(format!(
            "{} jobs-{} {}",
            spec.name,
            input.name,
            input_repr(entry.map(|(_, v)| v), input.is_list)
        ));
    }
    set
}

fn input_repr<T: std::fmt::Display>(value: Option<&RefOrList<T>>, is_list: bool) -> String {
    match value {
        None => {
            if is_list {
                "[]".to_string()
            } else {
                "null".to_string()
            }
        }
        Some(RefOrList::One(v)) => format!("{:?}", v.to_string()),
        Some(RefOrList::Many(vs)) => {
            let items: Vec<String> = vs.iter().map(|v| format!("{:?}", v.to_string())).collect();
            format!("[{}]", items.join(","))
        }
    }
}

/// Fingerprint for a stored job: the current schema's defaults merged
/// with the recorded options. Lenient where the recorded value no
/// longer coerces (such a job can simply never match a new submission).
pub fn fingerprint_for_stored(
    spec: &MethodSpec,
    stored: &serde_json::Map<String, Json>,
    datasets: &[(String, RefOrList<DatasetId>)],
    jobs: &[(String, RefOrList<JobId>)],
) -> Fingerprint {
    let mut typed = Vec::with_capacity(spec.options.len());
    for (key, ospec) in &spec.options {
        let value = match stored.get(key) {
            Some(v) => coerce(key, ospec, v).unwrap_or_else(|_| Value::Json(v.clone())),
            None => default_value(ospec),
        };
        typed.push((key.clone(), value));
    }
    fingerprint(spec, &typed, datasets, jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InputSpec, PhaseMask};

    fn spec(options: Vec<(&str, OptionSpec)>) -> MethodSpec {
        MethodSpec {
            name: "m".into(),
            package: "pkg".into(),
            description: String::new(),
            options: options
                .into_iter()
                .map(|(n, s)| (n.to_string(), s))
                .collect(),
            datasets: vec![InputSpec::single("source")],
            jobs: vec![],
            phases: PhaseMask::default(),
        }
    }

    #[test]
    fn unknown_option_rejected() {
        let spec = spec(vec![("a", OptionSpec::Str { default: None })]);
        let mut provided = serde_json::Map::new();
        provided.insert("b".into(), json!("x"));
        assert!(matches!(
            typed_options(&spec, &provided),
            Err(KilnError::BadOption(_))
        ));
    }

    #[test]
    fn required_without_default_fails_when_missing() {
        let spec = spec(vec![(
            "a",
            OptionSpec::required(OptionSpec::Int { default: None }),
        )]);
        assert!(typed_options(&spec, &serde_json::Map::new()).is_err());
        let mut provided = serde_json::Map::new();
        provided.insert("a".into(), json!(3));
        let typed = typed_options(&spec, &provided).unwrap();
        assert_eq!(typed[0].1, Value::Int(3));
    }

    #[test]
    fn strings_parse_to_declared_types() {
        let spec = spec(vec![
            ("n", OptionSpec::Int { default: None }),
            ("d", OptionSpec::Date { default: None }),
            ("p", OptionSpec::Path { default: None }),
        ]);
        let mut provided = serde_json::Map::new();
        provided.insert("n".into(), json!("42"));
        provided.insert("d".into(), json!("2023-01-05"));
        provided.insert("p".into(), json!("/tmp/x"));
        let typed = typed_options(&spec, &provided).unwrap();
        assert_eq!(typed[0].1, Value::Int(42));
        assert_eq!(
            typed[1].1,
            Value::Date(NaiveDate::from_ymd_opt(2023, 1, 5).unwrap())
        );
        assert_eq!(typed[2].1, Value::Path(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn enum_checks_membership() {
        let spec = spec(vec![("e", OptionSpec::enumeration(&["a", "b", "c"]))]);
        let mut provided = serde_json::Map::new();
        provided.insert("e".into(), json!("nope"));
        assert!(typed_options(&spec, &provided).is_err());
        provided.insert("e".into(), json!("b"));
        assert!(typed_options(&spec, &provided).is_ok());
    }

    #[test]
    fn fingerprint_equal_for_spelled_out_defaults() {
        let spec = spec(vec![(
            "a",
            OptionSpec::Str {
                default: Some("x".into()),
            },
        )]);
        let defaulted = typed_options(&spec, &serde_json::Map::new()).unwrap();
        let mut provided = serde_json::Map::new();
        provided.insert("a".into(), json!("x"));
        let explicit = typed_options(&spec, &provided).unwrap();
        assert_eq!(
            fingerprint(&spec, &defaulted, &[], &[]),
            fingerprint(&spec, &explicit, &[], &[])
        );
    }

    #[test]
    fn unordered_maps_sort_ordered_maps_do_not() {
        let unordered = Value::Map(vec![
            ("b".into(), Value::Int(1)),
            ("a".into(), Value::Int(2)),
        ]);
        assert_eq!(
            repr(&unordered, false),
            r#"{"a":2,"b":1}"#
        );
        assert_eq!(
            repr(&unordered, true),
            r#"{"b":1,"a":2}"#
        );
    }

    #[test]
    fn set_canonical_form_sorts_none_last() {
        let set = Value::Set(vec![Value::None, Value::Int(3), Value::Int(1)]);
        assert_eq!(repr(&set, false), "[1,3,null]");
    }

    #[test]
    fn typing_pairs_cover_calendar_and_nested() {
        let spec = spec(vec![
            ("d", OptionSpec::Date { default: None }),
            (
                "m",
                OptionSpec::Map {
                    value: Box::new(OptionSpec::DateTime { default: None }),
                    ordered: false,
                },
            ),
            (
                "l",
                OptionSpec::List {
                    elem: Box::new(OptionSpec::Path { default: None }),
                },
            ),
        ]);
        let pairs = typing_pairs(&spec);
        assert!(pairs.contains(&("d".into(), "date".into())));
        assert!(pairs.contains(&("m/*".into(), "datetime".into())));
        assert!(pairs.contains(&("l".into(), "[Path]".into())));
    }
}
