// src/core.rs
//
// =============================================================================
// KILN: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The strict data contracts shared by every subsystem:
// - Job and dataset identifiers and their on-disk string forms.
// - The typed Value model used for option sets and dataset cells.
// - Declarative method schemas (tagged option variants + one coercion
//   routine, see options.rs).
// - The submit request/response contracts the server facade speaks.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::KilnError;

// ============================================================================
// 1. IDENTIFIERS
// ============================================================================

/// A job identifier `<workdirName>-<N>`.
///
/// The workdir name may itself contain `-`; the number is always the
/// part after the last dash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub workdir: String,
    pub number: u64,
}

impl JobId {
    pub fn new(workdir: &str, number: u64) -> Self {
        JobId {
            workdir: workdir.to_string(),
            number,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.workdir, self.number)
    }
}

impl FromStr for JobId {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, KilnError> {
        let (workdir, number) = s
            .rsplit_once('-')
            .ok_or_else(|| KilnError::NoSuchJob(s.to_string()))?;
        if workdir.is_empty() {
            return Err(KilnError::NoSuchJob(s.to_string()));
        }
        let number = number
            .parse::<u64>()
            .map_err(|_| KilnError::NoSuchJob(s.to_string()))?;
        Ok(JobId::new(workdir, number))
    }
}

impl Serialize for JobId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A dataset identifier `jobid/name`. A bare jobid means the dataset
/// named "default" in that job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetId {
    pub job: JobId,
    pub name: String,
}

impl DatasetId {
    pub fn new(job: JobId, name: impl Into<String>) -> Self {
        DatasetId {
            job,
            name: name.into(),
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == "default" {
            write!(f, "{}", self.job)
        } else {
            write!(f, "{}/{}", self.job, self.name)
        }
    }
}

impl FromStr for DatasetId {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, KilnError> {
        let (job, name) = match s.split_once('/') {
            Some((job, name)) if !name.is_empty() => (job, name),
            Some((job, _)) => (job, "default"),
            None => (s, "default"),
        };
        Ok(DatasetId::new(job.parse()?, name))
    }
}

impl Serialize for DatasetId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatasetId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// 2. ARBITRARY-PRECISION NUMBER
// ============================================================================

/// Magnitude of an integer outside the i64 range: big-endian bytes,
/// no leading zeros. Supports up to +/-(2^1007 - 1), the width limit
/// of the on-disk "number" encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigInt {
    pub negative: bool,
    pub magnitude: Vec<u8>,
}

impl BigInt {
    /// Parse a decimal digit string. Returns None on non-digits or when
    /// the magnitude exceeds the 126-byte encoding limit.
    pub fn parse_decimal(digits: &str, negative: bool) -> Option<BigInt> {
        if digits.is_empty() {
            return None;
        }
        let mut mag: Vec<u8> = Vec::new(); // little-endian while building
        for c in digits.bytes() {
            if !c.is_ascii_digit() {
                return None;
            }
            let mut carry = (c - b'0') as u32;
            for byte in mag.iter_mut() {
                let v = (*byte as u32) * 10 + carry;
                *byte = (v & 0xff) as u8;
                carry = v >> 8;
            }
            while carry > 0 {
                mag.push((carry & 0xff) as u8);
                carry >>= 8;
            }
        }
        while mag.last() == Some(&0) {
            mag.pop();
        }
        if mag.len() > 126 {
            return None;
        }
        mag.reverse();
        Some(BigInt {
            negative,
            magnitude: mag,
        })
    }

    pub fn to_f64(&self) -> f64 {
        let mut v = 0.0f64;
        for &b in &self.magnitude {
            v = v * 256.0 + b as f64;
        }
        if self.negative {
            -v
        } else {
            v
        }
    }

    fn cmp_magnitude(&self, other: &BigInt) -> Ordering {
        self.magnitude
            .len()
            .cmp(&other.magnitude.len())
            .then_with(|| self.magnitude.cmp(&other.magnitude))
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Repeated division by 10 over the big-endian magnitude.
        let mut mag = self.magnitude.clone();
        let mut digits = Vec::new();
        while mag.iter().any(|&b| b != 0) {
            let mut rem = 0u32;
            for byte in mag.iter_mut() {
                let v = (rem << 8) | *byte as u32;
                *byte = (v / 10) as u8;
                rem = v % 10;
            }
            digits.push(b'0' + rem as u8);
        }
        if digits.is_empty() {
            digits.push(b'0');
        }
        if self.negative {
            write!(f, "-")?;
        }
        digits.reverse();
        f.write_str(std::str::from_utf8(&digits).unwrap())
    }
}

/// The "number" column type: integer of arbitrary precision, or float.
/// Invariant: Big is only used for values outside the i64 range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Number {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Big(b) => b.to_f64(),
            Number::Float(f) => *f,
        }
    }

    /// Order used for min/max tracking. The caller skips NaN before
    /// comparing.
    pub fn cmp_value(&self, other: &Number) -> Ordering {
        use Number::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Big(a), Big(b)) => match (a.negative, b.negative) {
                (false, false) => a.cmp_magnitude(b),
                (true, true) => b.cmp_magnitude(a),
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
            },
            // A Big is always outside the i64 range.
            (Int(_), Big(b)) => {
                if b.negative {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (Big(a), Int(_)) => {
                if a.negative {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Big(b) => write!(f, "{}", b),
            Number::Float(v) => write!(f, "{:?}", v),
        }
    }
}

// ============================================================================
// 3. TYPED VALUES
// ============================================================================

/// A typed value: an option leaf after coercion, or a dataset cell.
/// Serialises tagged, so metadata min/max round-trips exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Number(Number),
    Bytes(Vec<u8>),
    Ascii(String),
    Unicode(String),
    Json(Json),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Path(PathBuf),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// Insertion-ordered; canonicalisation sorts it unless the schema
    /// declared the default as an ordered mapping.
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Order for min/max tracking within one column type. Values of
    /// different types do not occur in one column.
    pub fn cmp_value(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Number(a), Number(b)) => a.cmp_value(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Ascii(a) | Unicode(a), Ascii(b) | Unicode(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }

    /// NaN never participates in min/max.
    pub fn is_nan(&self) -> bool {
        match self {
            Value::Float(f) => f.is_nan(),
            Value::Number(n) => matches!(n, Number::Float(f) if f.is_nan()),
            _ => false,
        }
    }
}

// ============================================================================
// 4. OPTION SCHEMAS
// ============================================================================

/// Tagged option schema. Each variant carries its default; a missing
/// default means the option defaults to None (and None is accepted
/// unless the spec is wrapped in Required).
#[derive(Debug, Clone, PartialEq)]
pub enum OptionSpec {
    Bool {
        default: Option<bool>,
    },
    Int {
        default: Option<i64>,
    },
    Float {
        default: Option<f64>,
    },
    Str {
        default: Option<String>,
    },
    /// Mandatory non-empty string.
    RequiredStr,
    Enum {
        values: Vec<String>,
        default: Option<String>,
        none_ok: bool,
    },
    Date {
        default: Option<NaiveDate>,
    },
    Time {
        default: Option<NaiveTime>,
    },
    DateTime {
        default: Option<NaiveDateTime>,
    },
    Path {
        default: Option<PathBuf>,
    },
    /// Free-form JSON leaf; the provided value is taken as-is.
    Json {
        default: Json,
    },
    List {
        elem: Box<OptionSpec>,
    },
    Set {
        elem: Box<OptionSpec>,
    },
    Map {
        value: Box<OptionSpec>,
        /// Preserve caller order in the canonical form (the schema's
        /// default was an ordered mapping).
        ordered: bool,
    },
    /// The caller must provide a value.
    Required {
        inner: Box<OptionSpec>,
        none_ok: bool,
    },
}

impl OptionSpec {
    pub fn required(inner: OptionSpec) -> OptionSpec {
        OptionSpec::Required {
            inner: Box::new(inner),
            none_ok: false,
        }
    }

    pub fn enumeration(values: &[&str]) -> OptionSpec {
        OptionSpec::Enum {
            values: values.iter().map(|s| s.to_string()).collect(),
            default: None,
            none_ok: false,
        }
    }

    /// Whether a submission must provide this option.
    pub fn is_required(&self) -> bool {
        match self {
            OptionSpec::Required { .. } | OptionSpec::RequiredStr => true,
            OptionSpec::Enum {
                default, none_ok, ..
            } => default.is_none() && !none_ok,
            _ => false,
        }
    }
}

/// Dataset- or job-input declaration: a name, possibly list-valued.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub name: String,
    pub is_list: bool,
}

impl InputSpec {
    pub fn single(name: &str) -> Self {
        InputSpec {
            name: name.to_string(),
            is_list: false,
        }
    }

    pub fn list(name: &str) -> Self {
        InputSpec {
            name: name.to_string(),
            is_list: true,
        }
    }
}

/// Which phases a method defines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseMask {
    pub prepare: bool,
    pub analysis: bool,
    pub synthesis: bool,
}

/// The declarative half of a method: schemas only. The executable half
/// is a MethodRuntime registered under the same name (methods.rs).
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub package: String,
    pub description: String,
    /// Declaration order is meaningful for _typing emission.
    pub options: Vec<(String, OptionSpec)>,
    pub datasets: Vec<InputSpec>,
    pub jobs: Vec<InputSpec>,
    pub phases: PhaseMask,
}

impl MethodSpec {
    pub fn option(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

// ============================================================================
// 5. PHASE OUTCOMES
// ============================================================================

/// What a phase returned. FinishEarly skips all later phases; in
/// analysis every slice must agree, and no result may be attached.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Continue(Option<Json>),
    FinishEarly(Option<Json>),
}

impl Outcome {
    pub fn done() -> Self {
        Outcome::Continue(None)
    }
}

// ============================================================================
// 6. SUBMIT CONTRACTS (Server Facade)
// ============================================================================

/// One dataset/job input value in a submission: single or list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefOrList<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> RefOrList<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            RefOrList::One(v) => std::slice::from_ref(v),
            RefOrList::Many(v) => v.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub method: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub options: serde_json::Map<String, Json>,
    #[serde(default)]
    pub datasets: Vec<(String, RefOrList<DatasetId>)>,
    #[serde(default)]
    pub jobs: Vec<(String, RefOrList<JobId>)>,
    #[serde(default)]
    pub force_build: bool,
    #[serde(default)]
    pub why_build: bool,
    /// Target workdir; server default when unset.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Analysis concurrency cap; slices when unset.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub parent: Option<JobId>,
}

/// Per-method link in a submit response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLink {
    pub link: JobId,
    pub make: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
}

/// The `{jobs: ...}` / `{why_build: ...}` / `{error: ...}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubmitResponse {
    #[serde(rename = "jobs")]
    Jobs(Vec<(String, JobLink)>),
    /// method -> candidate job -> option diffs that prevented reuse.
    #[serde(rename = "why_build")]
    WhyBuild(Vec<(String, Vec<(JobId, Vec<(String, Json)>)>)>),
    #[serde(rename = "error")]
    Error(String),
}
