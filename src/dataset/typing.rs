// src/dataset/typing.rs
//
// =============================================================================
// KILN: VALUE TYPING (dataset_type support)
// =============================================================================
//
// Rewrites a source dataset's bytes/ascii/unicode columns into typed
// columns. The converter catalogue is closed; parametric types are
// templated from the type string ("int32_10", "datetime:%Y-%m-%d",
// "unicode:utf-8/replace", ...). Integer subtypes carry their base in
// the name (_0 auto, _8, _10, _16), an "i" suffix accepts trailing
// garbage, and a "+None" suffix adds None support with empty input
// read as None.
//
// A row fails typing when any of its typed columns fails and has no
// default. With filter_bad the whole row is diverted to the sibling
// "bad" dataset instead of failing the job; this uses a badmap (one
// bit per source row) built on the first lap and consulted on the
// second. Rehashing types the hashlabel column first into a slicemap
// (u16 per source row: destination slice), then streams every other
// column through the same map, so nothing is materialised twice.
//
// The decimal separator is an argument of each numeric converter, not
// process state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::core::{BigInt, Number, Value};
use crate::error::{KilnError, Result};

use super::codec::{slice_for, ColumnType, ColumnWriter};
use super::write::{DatasetWriter, SliceStats};
use super::{Dataset, WorkdirSet};

pub const BYTESLIKE: &[ColumnType] = &[ColumnType::Bytes, ColumnType::Ascii, ColumnType::Unicode];

// ============================================================================
// 1. CONVERTERS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum ConvKind {
    /// Carried untyped column: the source value goes through unchanged
    /// (the "null_<type>" converters).
    PassThrough,
    CopyBytes,
    CopyAscii { replace: bool },
    CopyUnicode { errors: UnicodeErrors },
    Json,
    Int {
        bits32: bool,
        base: u32,
        allow_garbage: bool,
    },
    Float {
        bits32: bool,
        allow_garbage: bool,
    },
    Number { int_only: bool },
    StrBool,
    Date { fmt: String, allow_garbage: bool },
    Time { fmt: String, allow_garbage: bool },
    DateTime { fmt: String, allow_garbage: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnicodeErrors {
    Strict,
    Replace,
    Ignore,
}

/// A compiled converter for one column.
#[derive(Debug, Clone)]
pub struct Converter {
    pub spec: String,
    kind: ConvKind,
    pub output: ColumnType,
    /// "+None" suffix: column gets none_support and empty input reads
    /// as None.
    pub empty_as_none: bool,
    decimal_separator: char,
}

/// What one cell converted to.
pub enum Converted {
    Ok(Value),
    Bad,
}

impl Converter {
    /// Compile a type string from the catalogue. `decimal_separator`
    /// only affects the numeric converters.
    pub fn parse(spec: &str, decimal_separator: char) -> Result<Converter> {
        let full = spec;
        let (spec, empty_as_none) = match spec.split_once(':') {
            // "+None" binds to the type name, before any parameter
            Some((head, tail)) if head.ends_with("+None") => {
                (format!("{}:{}", &head[..head.len() - 5], tail), true)
            }
            _ if spec.ends_with("+None") => (spec[..spec.len() - 5].to_string(), true),
            _ => (spec.to_string(), false),
        };
        let (kind, output) = Self::compile(&spec)
            .ok_or_else(|| KilnError::BadOption(format!("unknown column type {:?}", full)))?;
        Ok(Converter {
            spec: full.to_string(),
            kind,
            output,
            empty_as_none,
            decimal_separator,
        })
    }

    fn compile(spec: &str) -> Option<(ConvKind, ColumnType)> {
        use ColumnType as T;
        // carried untyped columns: null_<type>
        if let Some(typ) = spec.strip_prefix("null_") {
            return typ
                .parse::<ColumnType>()
                .ok()
                .map(|t| (ConvKind::PassThrough, t));
        }
        // parametric types: name:param
        if let Some((name, param)) = spec.split_once(':') {
            let (allow_garbage, name) = match name.strip_suffix('i') {
                Some(base) if matches!(base, "date" | "time" | "datetime") => (true, base),
                _ => (false, name),
            };
            return match name {
                "date" => Some((
                    ConvKind::Date {
                        fmt: param.to_string(),
                        allow_garbage,
                    },
                    T::Date,
                )),
                "time" => Some((
                    ConvKind::Time {
                        fmt: param.to_string(),
                        allow_garbage,
                    },
                    T::Time,
                )),
                "datetime" => Some((
                    ConvKind::DateTime {
                        fmt: param.to_string(),
                        allow_garbage,
                    },
                    T::DateTime,
                )),
                "unicode" => {
                    let (_codec, errors) = match param.split_once('/') {
                        Some((c, e)) => (c, e),
                        None => (param, "strict"),
                    };
                    let errors = match errors {
                        "strict" => UnicodeErrors::Strict,
                        "replace" => UnicodeErrors::Replace,
                        "ignore" => UnicodeErrors::Ignore,
                        _ => return None,
                    };
                    Some((ConvKind::CopyUnicode { errors }, T::Unicode))
                }
                "ascii" => match param {
                    "strict" => Some((ConvKind::CopyAscii { replace: false }, T::Ascii)),
                    "replace" => Some((ConvKind::CopyAscii { replace: true }, T::Ascii)),
                    _ => None,
                },
                "number" => match param {
                    "int" => Some((ConvKind::Number { int_only: true }, T::Number)),
                    _ => None,
                },
                _ => None,
            };
        }
        // integer subtypes: int32_10, int64_16i, ...
        if let Some(rest) = spec.strip_prefix("int32_").or_else(|| spec.strip_prefix("int64_")) {
            let bits32 = spec.starts_with("int32");
            let (digits, allow_garbage) = match rest.strip_suffix('i') {
                Some(d) => (d, true),
                None => (rest, false),
            };
            let base: u32 = match digits {
                "0" => 0,
                "8" => 8,
                "10" => 10,
                "16" => 16,
                _ => return None,
            };
            return Some((
                ConvKind::Int {
                    bits32,
                    base,
                    allow_garbage,
                },
                if bits32 { T::Int32 } else { T::Int64 },
            ));
        }
        match spec {
            "bytes" => Some((ConvKind::CopyBytes, T::Bytes)),
            "ascii" => Some((ConvKind::CopyAscii { replace: false }, T::Ascii)),
            "unicode" => Some((
                ConvKind::CopyUnicode {
                    errors: UnicodeErrors::Strict,
                },
                T::Unicode,
            )),
            "json" => Some((ConvKind::Json, T::Json)),
            "float32" => Some((
                ConvKind::Float {
                    bits32: true,
                    allow_garbage: false,
                },
                T::Float32,
            )),
            "float64" => Some((
                ConvKind::Float {
                    bits32: false,
                    allow_garbage: false,
                },
                T::Float64,
            )),
            "float32i" => Some((
                ConvKind::Float {
                    bits32: true,
                    allow_garbage: true,
                },
                T::Float32,
            )),
            "float64i" => Some((
                ConvKind::Float {
                    bits32: false,
                    allow_garbage: true,
                },
                T::Float64,
            )),
            "number" => Some((ConvKind::Number { int_only: false }, T::Number)),
            "strbool" => Some((ConvKind::StrBool, T::Bool)),
            _ => None,
        }
    }

    /// Convert one source cell (the Value as read from the byteslike
    /// source column).
    pub fn convert_value(&self, v: &Value) -> Converted {
        if self.kind == ConvKind::PassThrough {
            return Converted::Ok(v.clone());
        }
        match v {
            Value::None => self.convert(None),
            Value::Bytes(b) => self.convert(Some(b)),
            Value::Ascii(s) | Value::Unicode(s) => self.convert(Some(s.as_bytes())),
            _ => Converted::Bad,
        }
    }

    /// Convert one raw cell. None input stays None; empty input becomes
    /// None under "+None".
    pub fn convert(&self, raw: Option<&[u8]>) -> Converted {
        let raw = match raw {
            None => return Converted::Ok(Value::None),
            Some(b) if b.is_empty() && self.empty_as_none => return Converted::Ok(Value::None),
            Some(b) => b,
        };
        match &self.kind {
            ConvKind::PassThrough => unreachable!("handled in convert_value"),
            ConvKind::CopyBytes => Converted::Ok(Value::Bytes(raw.to_vec())),
            ConvKind::CopyAscii { replace } => {
                if raw.is_ascii() {
                    Converted::Ok(Value::Ascii(String::from_utf8(raw.to_vec()).unwrap()))
                } else if *replace {
                    let s: String = raw
                        .iter()
                        .map(|&b| if b.is_ascii() { b as char } else { '?' })
                        .collect();
                    Converted::Ok(Value::Ascii(s))
                } else {
                    Converted::Bad
                }
            }
            ConvKind::CopyUnicode { errors } => match std::str::from_utf8(raw) {
                Ok(s) => Converted::Ok(Value::Unicode(s.to_string())),
                Err(_) => match errors {
                    UnicodeErrors::Strict => Converted::Bad,
                    UnicodeErrors::Replace => {
                        Converted::Ok(Value::Unicode(String::from_utf8_lossy(raw).into_owned()))
                    }
                    UnicodeErrors::Ignore => {
                        let s: String = raw
                            .iter()
                            .filter(|b| b.is_ascii())
                            .map(|&b| b as char)
                            .collect();
                        Converted::Ok(Value::Unicode(s))
                    }
                },
            },
            ConvKind::Json => match serde_json::from_slice(raw) {
                Ok(j) => Converted::Ok(Value::Json(j)),
                Err(_) => Converted::Bad,
            },
            ConvKind::Int {
                bits32,
                base,
                allow_garbage,
            } => self.convert_int(raw, *bits32, *base, *allow_garbage),
            ConvKind::Float {
                bits32,
                allow_garbage,
            } => self.convert_float(raw, *bits32, *allow_garbage),
            ConvKind::Number { int_only } => self.convert_number(raw, *int_only),
            ConvKind::StrBool => {
                let s = String::from_utf8_lossy(raw).trim().to_lowercase();
                let falsy = ["", "0", "false", "f", "no", "off", "nil", "null"];
                Converted::Ok(Value::Bool(!falsy.contains(&s.as_str())))
            }
            ConvKind::Date { fmt, allow_garbage } => match std::str::from_utf8(raw) {
                Ok(s) => {
                    let s = s.trim();
                    let parsed = if *allow_garbage {
                        NaiveDate::parse_and_remainder(s, fmt).map(|(d, _)| d)
                    } else {
                        NaiveDate::parse_from_str(s, fmt)
                    };
                    match parsed {
                        Ok(d) => Converted::Ok(Value::Date(d)),
                        Err(_) => Converted::Bad,
                    }
                }
                Err(_) => Converted::Bad,
            },
            ConvKind::Time { fmt, allow_garbage } => match std::str::from_utf8(raw) {
                Ok(s) => {
                    let s = s.trim();
                    let parsed = if *allow_garbage {
                        NaiveTime::parse_and_remainder(s, fmt).map(|(t, _)| t)
                    } else {
                        NaiveTime::parse_from_str(s, fmt)
                    };
                    match parsed {
                        Ok(t) => Converted::Ok(Value::Time(t)),
                        Err(_) => Converted::Bad,
                    }
                }
                Err(_) => Converted::Bad,
            },
            ConvKind::DateTime { fmt, allow_garbage } => match std::str::from_utf8(raw) {
                Ok(s) => {
                    let s = s.trim();
                    let parsed = if *allow_garbage {
                        NaiveDateTime::parse_and_remainder(s, fmt).map(|(dt, _)| dt)
                    } else {
                        NaiveDateTime::parse_from_str(s, fmt)
                    };
                    match parsed {
                        Ok(dt) => Converted::Ok(Value::DateTime(dt)),
                        Err(_) => Converted::Bad,
                    }
                }
                Err(_) => Converted::Bad,
            },
        }
    }

    fn convert_int(&self, raw: &[u8], bits32: bool, base: u32, allow_garbage: bool) -> Converted {
        let s = match std::str::from_utf8(raw) {
            Ok(s) => s.trim(),
            Err(_) => return Converted::Bad,
        };
        let (negative, s) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (base, s) = if base == 0 {
            // auto: 0x/0o/0b prefixes, otherwise decimal
            if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                (16, rest)
            } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
                (8, rest)
            } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
                (2, rest)
            } else {
                (10, s)
            }
        } else if base == 16 {
            (16, s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s))
        } else if base == 8 {
            (8, s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")).unwrap_or(s))
        } else {
            (base, s)
        };
        let digits_end = s
            .bytes()
            .position(|b| !(b as char).is_digit(base))
            .unwrap_or(s.len());
        if digits_end == 0 {
            return Converted::Bad;
        }
        if digits_end != s.len() && !allow_garbage {
            return Converted::Bad;
        }
        let mut value: i64 = 0;
        for b in s[..digits_end].bytes() {
            let digit = (b as char).to_digit(base).unwrap() as i64;
            value = match value.checked_mul(base as i64).and_then(|v| {
                if negative {
                    v.checked_sub(digit)
                } else {
                    v.checked_add(digit)
                }
            }) {
                Some(v) => v,
                None => return Converted::Bad,
            };
        }
        if bits32 && (value < i32::MIN as i64 + 1 || value > i32::MAX as i64) {
            return Converted::Bad;
        }
        if !bits32 && value == i64::MIN {
            return Converted::Bad;
        }
        Converted::Ok(Value::Int(value))
    }

    fn convert_float(&self, raw: &[u8], bits32: bool, allow_garbage: bool) -> Converted {
        let s = match std::str::from_utf8(raw) {
            Ok(s) => s.trim(),
            Err(_) => return Converted::Bad,
        };
        let s = s.replace(self.decimal_separator, ".");
        let s = if allow_garbage {
            let end = s
                .bytes()
                .position(|b| !matches!(b, b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-'))
                .unwrap_or(s.len());
            &s[..end]
        } else {
            &s[..]
        };
        match s.parse::<f64>() {
            Ok(f) => {
                let f = if bits32 { f as f32 as f64 } else { f };
                Converted::Ok(Value::Float(f))
            }
            Err(_) => Converted::Bad,
        }
    }

    fn convert_number(&self, raw: &[u8], int_only: bool) -> Converted {
        let s = match std::str::from_utf8(raw) {
            Ok(s) => s.trim(),
            Err(_) => return Converted::Bad,
        };
        if s.is_empty() {
            return Converted::Bad;
        }
        let normalized = s.replace(self.decimal_separator, ".");
        let looks_float = normalized
            .bytes()
            .any(|b| matches!(b, b'.' | b'e' | b'E'))
            || normalized.to_lowercase().contains("inf")
            || normalized.to_lowercase().contains("nan");
        if looks_float {
            if int_only {
                return Converted::Bad;
            }
            return match normalized.parse::<f64>() {
                Ok(f) => Converted::Ok(Value::Number(Number::Float(f))),
                Err(_) => Converted::Bad,
            };
        }
        // signed parse first, so i64::MIN stays an Int
        if let Ok(v) = normalized.parse::<i64>() {
            return Converted::Ok(Value::Number(Number::Int(v)));
        }
        let (negative, digits) = match normalized.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, normalized.strip_prefix('+').unwrap_or(&normalized)),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Converted::Bad;
        }
        match BigInt::parse_decimal(digits, negative) {
            Some(b) => Converted::Ok(Value::Number(Number::Big(b))),
            None => Converted::Bad,
        }
    }
}

// ============================================================================
// 2. THE TYPING LAP ENGINE
// ============================================================================

/// One column's plan entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPlan {
    pub name: String,
    pub type_spec: String,
    /// Raw default applied when conversion fails (None inside the
    /// Option means "default to the None value").
    pub default: Option<Option<String>>,
    /// Requested by the caller (participates in bad-row handling);
    /// false for carried untyped columns.
    pub requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypePlan {
    pub columns: Vec<ColumnPlan>,
    pub filter_bad: bool,
    /// Output hashlabel when repartitioning.
    pub rehash: Option<String>,
    pub decimal_separator: char,
}

/// Result of typing one source slice.
pub struct SliceTypeResult {
    /// destination slice -> stats for the main writer
    pub stats: BTreeMap<usize, SliceStats>,
    /// own-slice stats for the bad writer
    pub bad_stats: Option<SliceStats>,
    pub bad_count: BTreeMap<String, u64>,
    pub default_count: BTreeMap<String, u64>,
}

fn raw_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::None => None,
        Value::Bytes(b) => Some(b.clone()),
        Value::Ascii(s) | Value::Unicode(s) => Some(s.as_bytes().to_vec()),
        other => Some(format!("{:?}", other).into_bytes()),
    }
}

struct Badmap {
    bits: Vec<u64>,
    any: bool,
}

impl Badmap {
    fn new(lines: usize) -> Badmap {
        Badmap {
            bits: vec![0; lines / 64 + 1],
            any: false,
        }
    }

    fn set(&mut self, ix: usize) {
        self.bits[ix / 64] |= 1 << (ix % 64);
        self.any = true;
    }

    fn get(&self, ix: usize) -> bool {
        self.bits[ix / 64] & (1 << (ix % 64)) != 0
    }
}

/// Type one source slice into `dw` (and bad rows into `dw_bad`).
///
/// Without rehash the output goes to this slice's files of `dw`. With
/// rehash the first pass types the hashlabel column into the slicemap
/// and every output slice of `dw` is written (the caller gives each
/// source slice its own dataset, so no two workers share files).
pub fn type_slice(
    workdirs: &WorkdirSet,
    source: &Dataset,
    sliceno: usize,
    slices: usize,
    plan: &TypePlan,
    dw: &DatasetWriter,
    dw_bad: Option<&DatasetWriter>,
) -> Result<SliceTypeResult> {
    let lines = source.meta.lines[sliceno] as usize;
    let mut badmap = Badmap::new(lines.max(1));
    let mut bad_count: BTreeMap<String, u64> = BTreeMap::new();
    let mut default_count: BTreeMap<String, u64> = BTreeMap::new();

    let mut converters: BTreeMap<&str, (Converter, Option<Option<Value>>)> = BTreeMap::new();
    for col in &plan.columns {
        let conv = Converter::parse(&col.type_spec, plan.decimal_separator)?;
        let default = match &col.default {
            None => None,
            Some(None) => Some(Some(Value::None)),
            Some(Some(raw)) => match conv.convert(Some(raw.as_bytes())) {
                Converted::Ok(v) => Some(Some(v)),
                Converted::Bad => {
                    return Err(KilnError::BadOption(format!(
                        "default {:?} for column {:?} does not convert",
                        raw, col.name,
                    )))
                }
            },
        };
        converters.insert(col.name.as_str(), (conv, default));
    }

    // Rehash first pass: the hashlabel column decides every row's
    // destination slice. Unconvertible keys go to slice 0 here; the
    // real pass for that column records them bad.
    let slicemap: Option<Vec<u16>> = match &plan.rehash {
        Some(hashcol) => {
            let (conv, default) = &converters[hashcol.as_str()];
            let mut map = Vec::with_capacity(lines);
            if let Some(mut reader) = source.column_reader(workdirs, hashcol, sliceno)? {
                for v in reader.by_ref() {
                    let typed = match conv.convert_value(&v?) {
                        Converted::Ok(v) => v,
                        Converted::Bad => match default {
                            Some(Some(d)) => d.clone(),
                            _ => Value::None,
                        },
                    };
                    map.push(slice_for(&typed, slices) as u16);
                }
            }
            Some(map)
        }
        None => None,
    };

    // A lap types every column; the second lap (only reached with bad
    // rows) rewrites with bad rows skipped and captured.
    let run_lap = |skip_bad: bool,
                   badmap: &mut Badmap,
                   bad_count: &mut BTreeMap<String, u64>,
                   default_count: &mut BTreeMap<String, u64>,
                   bad_writers: &mut BTreeMap<String, ColumnWriter>|
     -> Result<BTreeMap<String, Vec<super::codec::ColumnStats>>> {
        let mut per_column = BTreeMap::new();
        for col in &plan.columns {
            let (conv, default) = &converters[col.name.as_str()];
            let decl = dw.decl(&col.name).ok_or_else(|| {
                KilnError::DatasetUsage(format!("writer lacks column {:?}", col.name))
            })?;
            // one writer per destination slice with rehash, else one
            let dests: Vec<usize> = match &slicemap {
                Some(_) => (0..slices).collect(),
                None => vec![sliceno],
            };
            let mut writers: BTreeMap<usize, ColumnWriter> = BTreeMap::new();
            for d in &dests {
                writers.insert(
                    *d,
                    ColumnWriter::create(&dw.column_filename(decl, *d), conv.output, true)?,
                );
            }
            if let Some(mut reader) = source.column_reader(workdirs, &col.name, sliceno)? {
                for (ix, v) in reader.by_ref().enumerate() {
                    let dest = match &slicemap {
                        Some(map) => map[ix] as usize,
                        None => sliceno,
                    };
                    let v = v?;
                    if skip_bad && badmap.get(ix) {
                        *bad_count.entry(col.name.clone()).or_insert(0) += 1;
                        if col.requested {
                            if let Some(bw) = bad_writers.get_mut(&col.name) {
                                match raw_bytes(&v) {
                                    Some(b) => bw.write(&Value::Bytes(b))?,
                                    None => bw.write(&Value::None)?,
                                }
                            }
                        }
                        continue;
                    }
                    let typed = match conv.convert_value(&v) {
                        Converted::Ok(v) => v,
                        Converted::Bad => match default {
                            Some(d) => {
                                *default_count.entry(col.name.clone()).or_insert(0) += 1;
                                d.clone().unwrap_or(Value::None)
                            }
                            None => {
                                if plan.filter_bad && col.requested {
                                    if !skip_bad {
                                        badmap.set(ix);
                                        *bad_count.entry(col.name.clone()).or_insert(0) += 1;
                                        continue;
                                    }
                                    // row survived the badmap but fails
                                    // now: a later column went bad first
                                    // lap; can't happen, bad rows are
                                    // skipped above.
                                    unreachable!("bad row not in badmap");
                                }
                                return Err(KilnError::DatasetUsage(format!(
                                    "invalid value {:?} with no default in {:?} in {}",
                                    raw_bytes(&v).map(|b| String::from_utf8_lossy(&b).into_owned()),
                                    col.name,
                                    source.id,
                                )));
                            }
                        },
                    };
                    writers.get_mut(&dest).unwrap().write(&typed)?;
                }
            }
            let mut stats = Vec::with_capacity(slices);
            let mut writers = writers;
            for d in dests {
                stats.push((d, writers.remove(&d).unwrap().finish()?));
            }
            per_column.insert(
                col.name.clone(),
                {
                    let mut by_slice = vec![super::codec::ColumnStats::default(); slices];
                    for (d, s) in stats {
                        by_slice[d] = s;
                    }
                    by_slice
                },
            );
        }
        Ok(per_column)
    };

    let mut no_bad_writers = BTreeMap::new();
    let mut per_column = run_lap(
        false,
        &mut badmap,
        &mut bad_count,
        &mut default_count,
        &mut no_bad_writers,
    )?;

    let mut bad_stats = None;
    if badmap.any && plan.filter_bad {
        // Second lap: rewrite everything skipping bad rows, and save
        // the original bytes of every typed column for those rows.
        let mut bad_writers = BTreeMap::new();
        if let Some(dwb) = dw_bad {
            for col in plan.columns.iter().filter(|c| c.requested) {
                if let Some(decl) = dwb.decl(&col.name) {
                    bad_writers.insert(
                        col.name.clone(),
                        ColumnWriter::create(
                            &dwb.column_filename(decl, sliceno),
                            ColumnType::Bytes,
                            true,
                        )?,
                    );
                }
            }
        }
        bad_count.clear();
        default_count.clear();
        per_column = run_lap(
            true,
            &mut badmap,
            &mut bad_count,
            &mut default_count,
            &mut bad_writers,
        )?;
        let mut lens = BTreeMap::new();
        let mut minmax = BTreeMap::new();
        for (name, w) in bad_writers {
            let stats = w.finish()?;
            lens.insert(name.clone(), stats.count);
            minmax.insert(name, (stats.min, stats.max));
        }
        let counts: BTreeSet<u64> = lens.values().copied().collect();
        if counts.len() > 1 {
            return Err(KilnError::DatasetUsage(format!(
                "bad dataset columns disagree on line count in slice {}: {:?}",
                sliceno, lens,
            )));
        }
        bad_stats = Some(SliceStats {
            lines: counts.into_iter().next().unwrap_or(0),
            minmax,
            compression: super::DEFAULT_COMPRESSION.into(),
        });
    } else if dw_bad.is_some() {
        // no bad rows in this slice, but the bad dataset still needs
        // its line count recorded
        let mut minmax = BTreeMap::new();
        for col in plan.columns.iter().filter(|c| c.requested) {
            minmax.insert(col.name.clone(), (None, None));
        }
        bad_stats = Some(SliceStats {
            lines: 0,
            minmax,
            compression: super::DEFAULT_COMPRESSION.into(),
        });
    }

    // Assemble per-destination stats for the main writer.
    let dests: Vec<usize> = match &slicemap {
        Some(_) => (0..slices).collect(),
        None => vec![sliceno],
    };
    let mut stats = BTreeMap::new();
    for d in dests {
        let mut lens = BTreeSet::new();
        let mut minmax = BTreeMap::new();
        for (name, by_slice) in &per_column {
            let s = &by_slice[d];
            lens.insert(s.count);
            minmax.insert(name.clone(), (s.min.clone(), s.max.clone()));
        }
        if lens.len() > 1 {
            return Err(KilnError::DatasetUsage(format!(
                "typed columns disagree on line count for slice {}",
                d,
            )));
        }
        stats.insert(
            d,
            SliceStats {
                lines: lens.into_iter().next().unwrap_or(0),
                minmax,
                compression: super::DEFAULT_COMPRESSION.into(),
            },
        );
    }

    Ok(SliceTypeResult {
        stats,
        bad_stats,
        bad_count,
        default_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(spec: &str) -> Converter {
        Converter::parse(spec, '.').unwrap()
    }

    fn ok(c: &Converter, s: &str) -> Value {
        match c.convert(Some(s.as_bytes())) {
            Converted::Ok(v) => v,
            Converted::Bad => panic!("{:?} failed on {:?}", c.spec, s),
        }
    }

    fn bad(c: &Converter, s: &str) -> bool {
        matches!(c.convert(Some(s.as_bytes())), Converted::Bad)
    }

    #[test]
    fn int_bases_and_garbage() {
        assert_eq!(ok(&conv("int32_10"), "42"), Value::Int(42));
        assert_eq!(ok(&conv("int32_10"), "-17"), Value::Int(-17));
        assert_eq!(ok(&conv("int32_16"), "ff"), Value::Int(255));
        assert_eq!(ok(&conv("int32_16"), "0xff"), Value::Int(255));
        assert_eq!(ok(&conv("int32_8"), "17"), Value::Int(15));
        assert_eq!(ok(&conv("int64_0"), "0x10"), Value::Int(16));
        assert_eq!(ok(&conv("int64_0"), "0b101"), Value::Int(5));
        assert!(bad(&conv("int32_10"), "12x"));
        assert_eq!(ok(&conv("int32_10i"), "12x"), Value::Int(12));
        assert!(bad(&conv("int32_10i"), "x12"));
        assert!(bad(&conv("int32_10"), "99999999999"));
    }

    #[test]
    fn float_and_decimal_separator() {
        assert_eq!(ok(&conv("float64"), "2.5"), Value::Float(2.5));
        let comma = Converter::parse("float64", ',').unwrap();
        assert_eq!(ok(&comma, "2,5"), Value::Float(2.5));
        assert!(bad(&conv("float64"), "2.5kg"));
        assert_eq!(ok(&conv("float64i"), "2.5kg"), Value::Float(2.5));
    }

    #[test]
    fn number_int_float_and_big() {
        assert_eq!(
            ok(&conv("number"), "12"),
            Value::Number(Number::Int(12))
        );
        assert_eq!(
            ok(&conv("number"), "1.5"),
            Value::Number(Number::Float(1.5))
        );
        assert_eq!(
            ok(&conv("number"), "1e3"),
            Value::Number(Number::Float(1000.0))
        );
        match ok(&conv("number"), "123456789012345678901234567890") {
            Value::Number(Number::Big(b)) => {
                assert_eq!(b.to_string(), "123456789012345678901234567890")
            }
            other => panic!("expected big, got {:?}", other),
        }
        assert!(bad(&conv("number:int"), "1.5"));
        assert_eq!(
            ok(&conv("number:int"), "15"),
            Value::Number(Number::Int(15))
        );
    }

    #[test]
    fn calendar_formats() {
        assert_eq!(
            ok(&conv("date:%Y-%m-%d"), "2023-01-05"),
            Value::Date(NaiveDate::from_ymd_opt(2023, 1, 5).unwrap())
        );
        assert!(bad(&conv("date:%Y-%m-%d"), "2023-01-05T12"));
        assert_eq!(
            ok(&conv("datei:%Y-%m-%d"), "2023-01-05T12"),
            Value::Date(NaiveDate::from_ymd_opt(2023, 1, 5).unwrap())
        );
        assert_eq!(
            ok(&conv("datetime:%Y-%m-%d %H:%M:%S"), "2023-01-05 06:07:08"),
            Value::DateTime(
                NaiveDate::from_ymd_opt(2023, 1, 5)
                    .unwrap()
                    .and_hms_opt(6, 7, 8)
                    .unwrap()
            )
        );
    }

    #[test]
    fn none_suffix_and_empty() {
        let c = conv("int32_10+None");
        match c.convert(Some(b"")) {
            Converted::Ok(v) => assert_eq!(v, Value::None),
            Converted::Bad => panic!("empty should become None under +None"),
        }
        assert_eq!(ok(&c, "5"), Value::Int(5));
        let strict = conv("int32_10");
        assert!(bad(&strict, ""));
    }

    #[test]
    fn unicode_error_modes() {
        let invalid = [0x66u8, 0xff, 0x67];
        let strict = conv("unicode:utf-8");
        assert!(matches!(strict.convert(Some(&invalid)), Converted::Bad));
        let replace = conv("unicode:utf-8/replace");
        match replace.convert(Some(&invalid)) {
            Converted::Ok(Value::Unicode(s)) => assert!(s.contains('\u{fffd}')),
            _ => panic!(),
        }
        let ignore = conv("unicode:utf-8/ignore");
        match ignore.convert(Some(&invalid)) {
            Converted::Ok(Value::Unicode(s)) => assert_eq!(s, "fg"),
            _ => panic!(),
        }
    }

    #[test]
    fn strbool_falsy_set() {
        let c = conv("strbool");
        for s in ["0", "false", "F", "no", "OFF", "nil", "null", ""] {
            assert_eq!(ok(&c, s), Value::Bool(false), "{:?}", s);
        }
        assert_eq!(ok(&c, "yes"), Value::Bool(true));
        assert_eq!(ok(&c, "1"), Value::Bool(true));
    }
}
