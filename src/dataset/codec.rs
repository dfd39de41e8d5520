// src/dataset/codec.rs
//
// =============================================================================
// KILN: COLUMN BINARY CODECS
// =============================================================================
//
// One codec per column type. Fixed-size numeric types are little-endian
// with a sentinel bit pattern for None; variable-size blobs use a
// length prefix; "number" is a variable-width encoding selected by its
// first byte. Every column file is a gzip stream (per slice - merged
// files concatenate independent streams), with the compression name
// recorded per column so readers never need a type hint to decompress.
//
// Sentinels:
//   int32/int64    i32::MIN / i64::MIN
//   float32/64     a fixed signalling-NaN payload (stored payloads of
//                  real NaN values are preserved; only the exact
//                  sentinel bits read back as None)
//   bool           255
//   date/time/datetime   first word 0
//   blobs          0xff marker with length 0
//   number         first byte 0xff

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::core::{BigInt, Number, Value};
use crate::error::{KilnError, Result};

pub const F64_NONE_BITS: u64 = 0x7ff0_0000_0000_0001;
pub const F32_NONE_BITS: u32 = 0x7f80_0001;
const BOOL_NONE: u8 = 255;

/// NaN bit pattern used when hashing (stored bytes keep their payload).
const F64_CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

pub const DEFAULT_COMPRESSION: &str = "gzip";

// ============================================================================
// 1. COLUMN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int32,
    Int64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Bool,
    Number,
    Ascii,
    Unicode,
    Bytes,
    Json,
    Object,
    Date,
    Time,
    DateTime,
}

impl ColumnType {
    pub const ALL: &'static [ColumnType] = &[
        ColumnType::Int32,
        ColumnType::Int64,
        ColumnType::Float32,
        ColumnType::Float64,
        ColumnType::Complex64,
        ColumnType::Complex128,
        ColumnType::Bool,
        ColumnType::Number,
        ColumnType::Ascii,
        ColumnType::Unicode,
        ColumnType::Bytes,
        ColumnType::Json,
        ColumnType::Object,
        ColumnType::Date,
        ColumnType::Time,
        ColumnType::DateTime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::Float32 => "float32",
            ColumnType::Float64 => "float64",
            ColumnType::Complex64 => "complex64",
            ColumnType::Complex128 => "complex128",
            ColumnType::Bool => "bool",
            ColumnType::Number => "number",
            ColumnType::Ascii => "ascii",
            ColumnType::Unicode => "unicode",
            ColumnType::Bytes => "bytes",
            ColumnType::Json => "json",
            ColumnType::Object => "object",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::DateTime => "datetime",
        }
    }

    /// Whether min/max is tracked for this type.
    pub fn has_minmax(&self) -> bool {
        !matches!(
            self,
            ColumnType::Json | ColumnType::Object | ColumnType::Complex64 | ColumnType::Complex128
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColumnType {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<ColumnType> {
        ColumnType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| KilnError::Dataset(format!("unknown column type {:?}", s)))
    }
}

// ============================================================================
// 2. PACKED CALENDAR WORDS
// ============================================================================

fn pack_date(d: &NaiveDate) -> u32 {
    ((d.year() as u32) << 9) | (d.month() << 5) | d.day()
}

fn unpack_date(w: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((w >> 9) as i32, (w >> 5) & 0xf, w & 0x1f)
}

fn pack_time(t: &NaiveTime) -> (u32, u32) {
    (
        0x8000_0000 | ((t.hour()) << 12) | (t.minute() << 6) | t.second(),
        t.nanosecond() / 1000,
    )
}

fn unpack_time(w1: u32, w2: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_micro_opt((w1 >> 12) & 0x1f, (w1 >> 6) & 0x3f, w1 & 0x3f, w2)
}

fn pack_datetime(dt: &NaiveDateTime) -> (u32, u32) {
    (
        ((dt.year() as u32) << 14) | (dt.month() << 10) | (dt.day() << 5) | dt.hour(),
        (dt.minute() << 26) | (dt.second() << 20) | (dt.and_utc().timestamp_subsec_micros()),
    )
}

fn unpack_datetime(w1: u32, w2: u32) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt((w1 >> 14) as i32, (w1 >> 10) & 0xf, (w1 >> 5) & 0x1f)?;
    let time =
        NaiveTime::from_hms_micro_opt(w1 & 0x1f, (w2 >> 26) & 0x3f, (w2 >> 20) & 0x3f, w2 & 0xfffff)?;
    Some(date.and_time(time))
}

// ============================================================================
// 3. ENCODING
// ============================================================================

fn usage(msg: impl Into<String>) -> KilnError {
    KilnError::DatasetUsage(msg.into())
}

fn write_blob<W: Write>(out: &mut W, data: &[u8]) -> Result<()> {
    if data.len() < 255 {
        out.write_all(&[data.len() as u8])?;
    } else {
        if data.len() > u32::MAX as usize {
            return Err(usage("blob value too large"));
        }
        out.write_all(&[255])?;
        out.write_all(&(data.len() as u32).to_le_bytes())?;
    }
    out.write_all(data)?;
    Ok(())
}

fn write_blob_none<W: Write>(out: &mut W) -> Result<()> {
    out.write_all(&[255, 0, 0, 0, 0])?;
    Ok(())
}

fn write_number<W: Write>(out: &mut W, n: &Number) -> Result<()> {
    match n {
        Number::Float(f) => {
            out.write_all(&[0])?;
            out.write_all(&f.to_le_bytes())?;
        }
        Number::Int(i) => {
            let i = *i;
            if (-5..=121).contains(&i) {
                out.write_all(&[(i + 0x85) as u8])?;
            } else if let Ok(v) = i16::try_from(i) {
                out.write_all(&[2])?;
                out.write_all(&v.to_le_bytes())?;
            } else if let Ok(v) = i32::try_from(i) {
                out.write_all(&[4])?;
                out.write_all(&v.to_le_bytes())?;
            } else {
                out.write_all(&[8])?;
                out.write_all(&i.to_le_bytes())?;
            }
        }
        Number::Big(b) => {
            let bytes = bigint_to_twos_complement(b);
            if !(9..=126).contains(&bytes.len()) {
                return Err(usage("number out of range for the wire encoding"));
            }
            out.write_all(&[bytes.len() as u8])?;
            out.write_all(&bytes)?;
        }
    }
    Ok(())
}

/// Big-endian two's complement of a sign+magnitude big integer.
fn bigint_to_twos_complement(b: &BigInt) -> Vec<u8> {
    let mut bytes = b.magnitude.clone();
    if !b.negative {
        if bytes.first().map_or(true, |&hi| hi & 0x80 != 0) {
            bytes.insert(0, 0);
        }
        return bytes;
    }
    // invert + 1, big-endian
    for byte in bytes.iter_mut() {
        *byte = !*byte;
    }
    let mut carry = true;
    for byte in bytes.iter_mut().rev() {
        if carry {
            let (v, c) = byte.overflowing_add(1);
            *byte = v;
            carry = c;
        }
    }
    if carry || bytes.first().map_or(true, |&hi| hi & 0x80 == 0) {
        bytes.insert(0, 0xff);
    }
    bytes
}

fn twos_complement_to_number(bytes: &[u8]) -> Number {
    let negative = bytes.first().map_or(false, |&hi| hi & 0x80 != 0);
    if bytes.len() <= 8 {
        let mut v: i64 = if negative { -1 } else { 0 };
        for &b in bytes {
            v = (v << 8) | b as i64;
        }
        return Number::Int(v);
    }
    let mut mag = bytes.to_vec();
    if negative {
        // two's complement -> magnitude: invert + 1
        for byte in mag.iter_mut() {
            *byte = !*byte;
        }
        let mut carry = true;
        for byte in mag.iter_mut().rev() {
            if carry {
                let (v, c) = byte.overflowing_add(1);
                *byte = v;
                carry = c;
            }
        }
    }
    while mag.first() == Some(&0) {
        mag.remove(0);
    }
    // Normalise back to Int when the magnitude fits after all.
    if mag.len() <= 8 {
        let mut v: u64 = 0;
        for &b in &mag {
            v = (v << 8) | b as u64;
        }
        if negative && v <= i64::MAX as u64 + 1 {
            return Number::Int((v as i128 * -1) as i64);
        }
        if !negative && v <= i64::MAX as u64 {
            return Number::Int(v as i64);
        }
    }
    Number::Big(BigInt {
        negative,
        magnitude: mag,
    })
}

/// Encode one value. The caller has already checked none_support.
fn encode_value<W: Write>(out: &mut W, typ: ColumnType, value: &Value) -> Result<()> {
    use ColumnType as T;
    match (typ, value) {
        (T::Int32, Value::None) => out.write_all(&i32::MIN.to_le_bytes())?,
        (T::Int32, Value::Int(i)) => {
            let v = i32::try_from(*i)
                .map_err(|_| usage(format!("{} does not fit in int32", i)))?;
            if v == i32::MIN {
                return Err(usage("int32 minimum is reserved for None"));
            }
            out.write_all(&v.to_le_bytes())?;
        }
        (T::Int64, Value::None) => out.write_all(&i64::MIN.to_le_bytes())?,
        (T::Int64, Value::Int(i)) => {
            if *i == i64::MIN {
                return Err(usage("int64 minimum is reserved for None"));
            }
            out.write_all(&i.to_le_bytes())?;
        }
        (T::Float64, Value::None) => out.write_all(&F64_NONE_BITS.to_le_bytes())?,
        (T::Float64, v) => {
            let f = value_as_f64(v).ok_or_else(|| type_error(typ, v))?;
            out.write_all(&f.to_le_bytes())?;
        }
        (T::Float32, Value::None) => out.write_all(&F32_NONE_BITS.to_le_bytes())?,
        (T::Float32, v) => {
            let f = value_as_f64(v).ok_or_else(|| type_error(typ, v))? as f32;
            out.write_all(&f.to_le_bytes())?;
        }
        (T::Complex128, Value::None) => {
            out.write_all(&F64_NONE_BITS.to_le_bytes())?;
            out.write_all(&0f64.to_le_bytes())?;
        }
        (T::Complex128, Value::Complex { re, im }) => {
            out.write_all(&re.to_le_bytes())?;
            out.write_all(&im.to_le_bytes())?;
        }
        (T::Complex64, Value::None) => {
            out.write_all(&F32_NONE_BITS.to_le_bytes())?;
            out.write_all(&0f32.to_le_bytes())?;
        }
        (T::Complex64, Value::Complex { re, im }) => {
            out.write_all(&(*re as f32).to_le_bytes())?;
            out.write_all(&(*im as f32).to_le_bytes())?;
        }
        (T::Bool, Value::None) => out.write_all(&[BOOL_NONE])?,
        (T::Bool, Value::Bool(b)) => out.write_all(&[*b as u8])?,
        (T::Number, Value::None) => out.write_all(&[0xff])?,
        (T::Number, Value::Number(n)) => write_number(out, n)?,
        (T::Number, Value::Int(i)) => write_number(out, &Number::Int(*i))?,
        (T::Number, Value::Float(f)) => write_number(out, &Number::Float(*f))?,
        (T::Bytes, Value::None)
        | (T::Ascii, Value::None)
        | (T::Unicode, Value::None)
        | (T::Json, Value::None)
        | (T::Object, Value::None) => write_blob_none(out)?,
        (T::Bytes, Value::Bytes(b)) => write_blob(out, b)?,
        (T::Ascii, Value::Ascii(s)) => {
            if !s.is_ascii() {
                return Err(usage(format!("non-ascii value in ascii column: {:?}", s)));
            }
            write_blob(out, s.as_bytes())?;
        }
        (T::Ascii, Value::Unicode(s)) => {
            if !s.is_ascii() {
                return Err(usage(format!("non-ascii value in ascii column: {:?}", s)));
            }
            write_blob(out, s.as_bytes())?;
        }
        (T::Unicode, Value::Unicode(s)) | (T::Unicode, Value::Ascii(s)) => {
            write_blob(out, s.as_bytes())?;
        }
        (T::Json, Value::Json(j)) => write_blob(out, &serde_json::to_vec(j)?)?,
        (T::Object, Value::Json(j)) => write_blob(out, &serde_json::to_vec(j)?)?,
        (T::Date, Value::None) => out.write_all(&0u32.to_le_bytes())?,
        (T::Date, Value::Date(d)) => out.write_all(&pack_date(d).to_le_bytes())?,
        (T::Time, Value::None) => out.write_all(&[0u8; 8])?,
        (T::Time, Value::Time(t)) => {
            let (w1, w2) = pack_time(t);
            out.write_all(&w1.to_le_bytes())?;
            out.write_all(&w2.to_le_bytes())?;
        }
        (T::DateTime, Value::None) => out.write_all(&[0u8; 8])?,
        (T::DateTime, Value::DateTime(dt)) => {
            let (w1, w2) = pack_datetime(dt);
            out.write_all(&w1.to_le_bytes())?;
            out.write_all(&w2.to_le_bytes())?;
        }
        (typ, v) => return Err(type_error(typ, v)),
    }
    Ok(())
}

fn type_error(typ: ColumnType, v: &Value) -> KilnError {
    usage(format!("can't store {:?} in a {} column", v, typ))
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::Number(n) => Some(n.as_f64()),
        _ => None,
    }
}

// ============================================================================
// 4. DECODING
// ============================================================================

fn read_exact<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_blob<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>> {
    let [first] = read_exact::<_, 1>(r)?;
    let len = if first < 255 {
        first as usize
    } else {
        let len = u32::from_le_bytes(read_exact::<_, 4>(r)?) as usize;
        if len == 0 {
            return Ok(None);
        }
        len
    };
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Some(data))
}

fn decode_value<R: Read>(r: &mut R, typ: ColumnType, none_support: bool) -> Result<Value> {
    use ColumnType as T;
    Ok(match typ {
        T::Int32 => {
            let v = i32::from_le_bytes(read_exact::<_, 4>(r)?);
            if none_support && v == i32::MIN {
                Value::None
            } else {
                Value::Int(v as i64)
            }
        }
        T::Int64 => {
            let v = i64::from_le_bytes(read_exact::<_, 8>(r)?);
            if none_support && v == i64::MIN {
                Value::None
            } else {
                Value::Int(v)
            }
        }
        T::Float64 => {
            let bits = u64::from_le_bytes(read_exact::<_, 8>(r)?);
            if none_support && bits == F64_NONE_BITS {
                Value::None
            } else {
                Value::Float(f64::from_bits(bits))
            }
        }
        T::Float32 => {
            let bits = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            if none_support && bits == F32_NONE_BITS {
                Value::None
            } else {
                Value::Float(f32::from_bits(bits) as f64)
            }
        }
        T::Complex128 => {
            let re_bits = u64::from_le_bytes(read_exact::<_, 8>(r)?);
            let im = f64::from_le_bytes(read_exact::<_, 8>(r)?);
            if none_support && re_bits == F64_NONE_BITS {
                Value::None
            } else {
                Value::Complex {
                    re: f64::from_bits(re_bits),
                    im,
                }
            }
        }
        T::Complex64 => {
            let re_bits = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            let im = f32::from_le_bytes(read_exact::<_, 4>(r)?) as f64;
            if none_support && re_bits == F32_NONE_BITS {
                Value::None
            } else {
                Value::Complex {
                    re: f32::from_bits(re_bits) as f64,
                    im,
                }
            }
        }
        T::Bool => {
            let [b] = read_exact::<_, 1>(r)?;
            match b {
                BOOL_NONE if none_support => Value::None,
                0 => Value::Bool(false),
                _ => Value::Bool(true),
            }
        }
        T::Number => {
            let [first] = read_exact::<_, 1>(r)?;
            match first {
                0xff => Value::None,
                0 => Value::Number(Number::Float(f64::from_le_bytes(read_exact::<_, 8>(r)?))),
                2 => Value::Number(Number::Int(
                    i16::from_le_bytes(read_exact::<_, 2>(r)?) as i64
                )),
                4 => Value::Number(Number::Int(
                    i32::from_le_bytes(read_exact::<_, 4>(r)?) as i64
                )),
                8 => Value::Number(Number::Int(i64::from_le_bytes(read_exact::<_, 8>(r)?))),
                len @ 9..=126 => {
                    let mut bytes = vec![0u8; len as usize];
                    r.read_exact(&mut bytes)?;
                    Value::Number(twos_complement_to_number(&bytes))
                }
                b @ 0x80..=0xfa => Value::Number(Number::Int(b as i64 - 0x85)),
                b => {
                    return Err(KilnError::Dataset(format!(
                        "corrupt number column (selector byte {:#x})",
                        b
                    )))
                }
            }
        }
        T::Bytes => match read_blob(r)? {
            Some(b) => Value::Bytes(b),
            None => Value::None,
        },
        T::Ascii => match read_blob(r)? {
            Some(b) => Value::Ascii(
                String::from_utf8(b)
                    .map_err(|_| KilnError::Dataset("corrupt ascii column".into()))?,
            ),
            None => Value::None,
        },
        T::Unicode => match read_blob(r)? {
            Some(b) => Value::Unicode(
                String::from_utf8(b)
                    .map_err(|_| KilnError::Dataset("corrupt unicode column".into()))?,
            ),
            None => Value::None,
        },
        T::Json | T::Object => match read_blob(r)? {
            Some(b) => Value::Json(serde_json::from_slice(&b)?),
            None => Value::None,
        },
        T::Date => {
            let w = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            if w == 0 {
                Value::None
            } else {
                unpack_date(w)
                    .map(Value::Date)
                    .ok_or_else(|| KilnError::Dataset("corrupt date column".into()))?
            }
        }
        T::Time => {
            let w1 = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            let w2 = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            if w1 == 0 {
                Value::None
            } else {
                unpack_time(w1, w2)
                    .map(Value::Time)
                    .ok_or_else(|| KilnError::Dataset("corrupt time column".into()))?
            }
        }
        T::DateTime => {
            let w1 = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            let w2 = u32::from_le_bytes(read_exact::<_, 4>(r)?);
            if w1 == 0 {
                Value::None
            } else {
                unpack_datetime(w1, w2)
                    .map(Value::DateTime)
                    .ok_or_else(|| KilnError::Dataset("corrupt datetime column".into()))?
            }
        }
    })
}

// ============================================================================
// 5. WRITERS & READERS (gzip container)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ColumnStats {
    pub count: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

pub struct ColumnWriter {
    typ: ColumnType,
    none_support: bool,
    out: GzEncoder<BufWriter<File>>,
    stats: ColumnStats,
}

impl ColumnWriter {
    pub fn create(path: &Path, typ: ColumnType, none_support: bool) -> Result<ColumnWriter> {
        let file = File::create(path)?;
        Ok(ColumnWriter {
            typ,
            none_support,
            out: GzEncoder::new(BufWriter::new(file), flate2::Compression::default()),
            stats: ColumnStats::default(),
        })
    }

    pub fn typ(&self) -> ColumnType {
        self.typ
    }

    pub fn compression(&self) -> &'static str {
        DEFAULT_COMPRESSION
    }

    pub fn count(&self) -> u64 {
        self.stats.count
    }

    pub fn write(&mut self, value: &Value) -> Result<()> {
        // Number columns accept plain ints/floats; normalise before
        // stats tracking so min/max compares one representation.
        let normalized;
        let value = if self.typ == ColumnType::Number {
            match value {
                Value::Int(i) => {
                    normalized = Value::Number(Number::Int(*i));
                    &normalized
                }
                Value::Float(f) => {
                    normalized = Value::Number(Number::Float(*f));
                    &normalized
                }
                v => v,
            }
        } else {
            value
        };
        if value.is_none() && !self.none_support {
            return Err(usage(format!(
                "tried to write None to a {} column without none_support",
                self.typ,
            )));
        }
        encode_value(&mut self.out, self.typ, value)?;
        self.stats.count += 1;
        if self.typ.has_minmax() && !value.is_none() && !value.is_nan() {
            match &self.stats.min {
                Some(m) if m.cmp_value(value) != std::cmp::Ordering::Greater => {}
                _ => self.stats.min = Some(value.clone()),
            }
            match &self.stats.max {
                Some(m) if m.cmp_value(value) != std::cmp::Ordering::Less => {}
                _ => self.stats.max = Some(value.clone()),
            }
        }
        Ok(())
    }

    /// Flush and close the gzip stream, returning count + min/max.
    pub fn finish(self) -> Result<ColumnStats> {
        let buf = self.out.finish()?;
        buf.into_inner()
            .map_err(|e| KilnError::Server(format!("column flush failed: {}", e)))?
            .sync_all()
            .ok();
        Ok(self.stats)
    }
}

pub struct ColumnReader {
    typ: ColumnType,
    none_support: bool,
    reader: GzDecoder<BufReader<File>>,
    remaining: u64,
}

impl ColumnReader {
    /// Open a column file; for merged files `offset` is the start byte
    /// of this slice's gzip stream.
    pub fn open(
        path: &Path,
        offset: Option<u64>,
        typ: ColumnType,
        none_support: bool,
        want_count: u64,
    ) -> Result<ColumnReader> {
        let mut file = File::open(path)?;
        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(ColumnReader {
            typ,
            none_support,
            reader: GzDecoder::new(BufReader::new(file)),
            remaining: want_count,
        })
    }
}

impl Iterator for ColumnReader {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(decode_value(&mut self.reader, self.typ, self.none_support))
    }
}

// ============================================================================
// 6. SLICE HASHING
// ============================================================================

/// Canonical bytes for hash partitioning. Numerically equal integers
/// hash identically whatever their column type; NaN payloads are
/// canonicalised here (and only here).
fn hash_bytes(value: &Value, buf: &mut Vec<u8>) {
    buf.clear();
    match value {
        Value::None => {}
        Value::Bool(b) => buf.push(*b as u8),
        Value::Int(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Float(f) => float_hash_bytes(*f, buf),
        Value::Number(Number::Int(i)) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Number(Number::Float(f)) => float_hash_bytes(*f, buf),
        Value::Number(Number::Big(b)) => {
            buf.push(b.negative as u8);
            buf.extend_from_slice(&b.magnitude);
        }
        Value::Bytes(b) => buf.extend_from_slice(b),
        Value::Ascii(s) | Value::Unicode(s) => buf.extend_from_slice(s.as_bytes()),
        Value::Json(j) => {
            buf.extend_from_slice(&serde_json::to_vec(j).unwrap_or_default())
        }
        Value::Date(d) => buf.extend_from_slice(&pack_date(d).to_le_bytes()),
        Value::Time(t) => {
            let (w1, w2) = pack_time(t);
            buf.extend_from_slice(&w1.to_le_bytes());
            buf.extend_from_slice(&w2.to_le_bytes());
        }
        Value::DateTime(dt) => {
            let (w1, w2) = pack_datetime(dt);
            buf.extend_from_slice(&w1.to_le_bytes());
            buf.extend_from_slice(&w2.to_le_bytes());
        }
        Value::Complex { re, im } => {
            float_hash_bytes(*re, buf);
            float_hash_bytes(*im, buf);
        }
        Value::Path(p) => buf.extend_from_slice(p.to_string_lossy().as_bytes()),
        Value::List(vs) | Value::Set(vs) => {
            let mut inner = Vec::new();
            for v in vs {
                hash_bytes(v, &mut inner);
                buf.extend_from_slice(&inner);
            }
        }
        Value::Map(entries) => {
            let mut inner = Vec::new();
            for (k, v) in entries {
                buf.extend_from_slice(k.as_bytes());
                hash_bytes(v, &mut inner);
                buf.extend_from_slice(&inner);
            }
        }
    }
}

fn float_hash_bytes(f: f64, buf: &mut Vec<u8>) {
    if f.is_nan() {
        buf.extend_from_slice(&F64_CANONICAL_NAN.to_le_bytes());
    } else if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        // integral floats hash like the equal integer
        buf.extend_from_slice(&(f as i64).to_le_bytes());
    } else {
        buf.extend_from_slice(&f.to_le_bytes());
    }
}

pub fn slice_hash(value: &Value) -> u64 {
    use std::hash::Hasher;
    if value.is_none() {
        return 0;
    }
    let mut buf = Vec::with_capacity(16);
    hash_bytes(value, &mut buf);
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&buf);
    hasher.finish()
}

pub fn slice_for(value: &Value, slices: usize) -> usize {
    (slice_hash(value) % slices as u64) as usize
}
