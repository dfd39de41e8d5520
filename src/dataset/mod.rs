// src/dataset/mod.rs
//
// =============================================================================
// KILN: DATASET ENGINE
// =============================================================================
//
// On-disk, sliced, chained, typed columnar storage.
//
// A dataset lives inside a job as DS/<fsSafeName>.p (metadata record,
// version [3, 3]) plus, when it has own columns, DS/<fsSafeName>.d/
// with one file per column (per slice, or merged with an offset
// table). Untouched columns of a parent dataset are shared by
// location, never copied. `previous` links form append-only chains; a
// full metadata snapshot of the older chain is embedded every 64
// predecessors so reaching a chain tip stays O(1).

pub mod codec;
pub mod iterate;
pub mod typing;
pub mod write;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{DatasetId, JobId, Value};
use crate::error::{KilnError, Result};
use crate::setupfile::{load_json, save_json};
use crate::workdir::JobDir;

pub use codec::{ColumnType, DEFAULT_COMPRESSION};

pub const META_VERSION: (u32, u32) = (3, 3);
/// Mean per-slice size under which a column's slice files are merged.
pub const MERGE_THRESHOLD: u64 = 524288;
/// Total size under which all merged columns share one dataset file.
pub const FULL_MERGE_THRESHOLD: u64 = 16 * 524288;

// ============================================================================
// 1. JOB PATH RESOLUTION
// ============================================================================

/// workdir name -> workdir path, for resolving "jobid/relpath" column
/// locations and dataset ids anywhere on the filesystem.
#[derive(Debug, Clone, Default)]
pub struct WorkdirSet {
    dirs: BTreeMap<String, PathBuf>,
}

impl WorkdirSet {
    pub fn new(dirs: impl IntoIterator<Item = (String, PathBuf)>) -> WorkdirSet {
        WorkdirSet {
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, name: &str, path: PathBuf) {
        self.dirs.insert(name.to_string(), path);
    }

    pub fn job_path(&self, id: &JobId) -> Result<PathBuf> {
        let wd = self
            .dirs
            .get(&id.workdir)
            .ok_or_else(|| KilnError::NoSuchWorkdir(id.workdir.clone()))?;
        Ok(wd.join(id.to_string()))
    }

    pub fn job_dir(&self, id: &JobId) -> Result<JobDir> {
        Ok(JobDir {
            id: id.clone(),
            path: self.job_path(id)?,
        })
    }
}

// ============================================================================
// 2. FILESYSTEM-SAFE NAMES
// ============================================================================

/// Escape control characters, '%' and '/' as \xNN and '\' as '\\',
/// so any dataset name maps to a unique, safe file name.
pub fn fs_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '%' | '/' => out.push_str(&format!("\\x{:02x}", c as u32)),
            c if (c as u32) < 32 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// ============================================================================
// 3. METADATA RECORDS
// ============================================================================

/// Start offsets per slice in a merged column file. None means the
/// slice is empty and consumes no space (the `false` sentinel).
pub type Offsets = Vec<Option<u64>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetColumn {
    #[serde(rename = "type")]
    pub typ: ColumnType,
    pub compression: String,
    /// "jobid/relpath" with a %s slot for the slice number, or the
    /// merged file when offsets is set. None for columns whose every
    /// slice is empty.
    pub location: Option<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<Offsets>,
    pub none_support: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsMeta {
    pub version: (u32, u32),
    pub filename: Option<String>,
    pub hashlabel: Option<String>,
    pub caption: String,
    pub columns: BTreeMap<String, DatasetColumn>,
    pub previous: Option<DatasetId>,
    pub parent: Option<DatasetId>,
    /// Line count per slice; authoritative for every column.
    pub lines: Vec<u64>,
    /// Snapshot of all older chain entries, embedded every 64 steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Vec<(String, DsMeta)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_distance: Option<u64>,
}

impl DsMeta {
    pub fn new(slices: usize) -> DsMeta {
        DsMeta {
            version: META_VERSION,
            filename: None,
            hashlabel: None,
            caption: String::new(),
            columns: BTreeMap::new(),
            previous: None,
            parent: None,
            lines: vec![0; slices],
            cache: None,
            cache_distance: None,
        }
    }
}

// ============================================================================
// 4. THE DATASET HANDLE
// ============================================================================

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: DatasetId,
    pub meta: DsMeta,
}

impl Dataset {
    pub fn meta_path(workdirs: &WorkdirSet, id: &DatasetId) -> Result<PathBuf> {
        Ok(workdirs
            .job_path(&id.job)?
            .join("DS")
            .join(format!("{}.p", fs_name(&id.name))))
    }

    pub fn load(workdirs: &WorkdirSet, id: &DatasetId) -> Result<Dataset> {
        let path = Self::meta_path(workdirs, id)?;
        if !path.is_file() {
            let extra = match job_datasets_names(workdirs, &id.job) {
                Ok(names) if names.is_empty() => {
                    format!(" ({} contains no datasets)", id.job)
                }
                Ok(names) if names.len() == 1 => {
                    format!(" (did you mean {}/{}?)", id.job, names[0])
                }
                _ => String::new(),
            };
            return Err(KilnError::NoSuchDataset(id.to_string(), extra));
        }
        let meta: DsMeta = load_json(&path)?;
        if meta.version.0 != 3 {
            return Err(KilnError::Dataset(format!(
                "{}: unsupported dataset metadata version {:?}",
                id, meta.version,
            )));
        }
        Ok(Dataset {
            id: id.clone(),
            meta,
        })
    }

    pub fn save(&self, workdirs: &WorkdirSet) -> Result<()> {
        let path = Self::meta_path(workdirs, &self.id)?;
        fs::create_dir_all(path.parent().unwrap())?;
        save_json(&path, &self.meta)
    }

    pub fn lines_total(&self) -> u64 {
        self.meta.lines.iter().sum()
    }

    pub fn shape(&self) -> (usize, u64) {
        (self.meta.columns.len(), self.lines_total())
    }

    pub fn min(&self, column: &str) -> Option<&Value> {
        self.meta.columns.get(column)?.min.as_ref()
    }

    pub fn max(&self, column: &str) -> Option<&Value> {
        self.meta.columns.get(column)?.max.as_ref()
    }

    /// Path of one column's data (and the start offset, for merged
    /// storage).
    pub fn column_file(
        &self,
        workdirs: &WorkdirSet,
        column: &str,
        sliceno: usize,
    ) -> Result<Option<(PathBuf, Option<u64>)>> {
        let dc = self
            .meta
            .columns
            .get(column)
            .ok_or_else(|| {
                KilnError::Dataset(format!("column {:?} not found in {}", column, self.id))
            })?;
        let location = match &dc.location {
            Some(l) => l,
            None => return Ok(None), // empty column
        };
        let (jobid, relpath) = location.split_once('/').ok_or_else(|| {
            KilnError::Dataset(format!("corrupt column location {:?} in {}", location, self.id))
        })?;
        let job_path = workdirs.job_path(&jobid.parse()?)?;
        match &dc.offsets {
            Some(offsets) => {
                let offset = offsets.get(sliceno).copied().flatten();
                match offset {
                    Some(o) => Ok(Some((job_path.join(relpath), Some(o)))),
                    None => Ok(None), // empty slice in merged storage
                }
            }
            None => Ok(Some((
                job_path.join(relpath.replace("%s", &sliceno.to_string())),
                None,
            ))),
        }
    }

    /// Open a streaming reader over one column of one slice.
    pub fn column_reader(
        &self,
        workdirs: &WorkdirSet,
        column: &str,
        sliceno: usize,
    ) -> Result<Option<codec::ColumnReader>> {
        let want = self.meta.lines[sliceno];
        if want == 0 {
            return Ok(None);
        }
        let dc = &self.meta.columns[column];
        match self.column_file(workdirs, column, sliceno)? {
            Some((path, offset)) => Ok(Some(codec::ColumnReader::open(
                &path,
                offset,
                dc.typ,
                dc.none_support,
                want,
            )?)),
            None => Ok(None),
        }
    }

    /// Walk `previous` links, newest first, at most `length` steps
    /// (negative length means unbounded), stopping before `stop_ds`.
    /// Returns the chain oldest first; the last element is self.
    pub fn chain(
        &self,
        workdirs: &WorkdirSet,
        length: i64,
        stop_ds: Option<&DatasetId>,
    ) -> Result<Vec<Dataset>> {
        let mut chain: Vec<Dataset> = Vec::new();
        let mut memo: BTreeMap<String, DsMeta> = BTreeMap::new();
        let mut current = self.clone();
        loop {
            if length >= 0 && chain.len() as i64 == length {
                break;
            }
            if let Some(stop) = stop_ds {
                if current.id == *stop {
                    break;
                }
            }
            // Embedded snapshots let the walk skip file loads.
            if let Some(cache) = &current.meta.cache {
                for (id, meta) in cache {
                    memo.entry(id.clone()).or_insert_with(|| meta.clone());
                }
            }
            let previous = current.meta.previous.clone();
            chain.push(current);
            let previous = match previous {
                Some(p) => p,
                None => break,
            };
            current = match memo.get(&previous.to_string()) {
                Some(meta) => Dataset {
                    id: previous,
                    meta: meta.clone(),
                },
                None => Dataset::load(workdirs, &previous)?,
            };
        }
        chain.reverse();
        Ok(chain)
    }

    /// Refresh the chain cache fields after (re)setting previous.
    pub fn update_cache(&mut self, workdirs: &WorkdirSet) -> Result<()> {
        self.meta.cache = None;
        self.meta.cache_distance = None;
        let previous = match &self.meta.previous {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let prev = Dataset::load(workdirs, &previous)?;
        let mut distance = prev.meta.cache_distance.unwrap_or(1) + 1;
        if distance == 64 {
            distance = 0;
            let chain = self.chain(workdirs, 64, None)?;
            let snapshot: Vec<(String, DsMeta)> = chain
                [..chain.len().saturating_sub(1)]
                .iter()
                .map(|d| (d.id.to_string(), d.meta.clone()))
                .collect();
            self.meta.cache = Some(snapshot);
        }
        self.meta.cache_distance = Some(distance);
        Ok(())
    }
}

// ============================================================================
// 5. PER-JOB DATASET LIST
// ============================================================================

fn list_path(workdirs: &WorkdirSet, job: &JobId) -> Result<PathBuf> {
    Ok(workdirs.job_path(job)?.join("DS").join("LIST"))
}

/// Names of all datasets in a job, in finish order.
pub fn job_datasets_names(workdirs: &WorkdirSet, job: &JobId) -> Result<Vec<String>> {
    let path = list_path(workdirs, job)?;
    if !path.is_file() {
        // Not an error to list datasets in a job without them.
        return Ok(Vec::new());
    }
    load_json(&path)
}

pub fn job_datasets(workdirs: &WorkdirSet, job: &JobId) -> Result<Vec<Dataset>> {
    job_datasets_names(workdirs, job)?
        .into_iter()
        .map(|name| Dataset::load(workdirs, &DatasetId::new(job.clone(), name)))
        .collect()
}

pub(crate) fn register_dataset_name(workdirs: &WorkdirSet, job: &JobId, name: &str) -> Result<()> {
    let path = list_path(workdirs, job)?;
    fs::create_dir_all(path.parent().unwrap())?;
    let mut names = job_datasets_names(workdirs, job)?;
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
        save_json(&path, &names)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_name_escapes_separators() {
        assert_eq!(fs_name("plain_name.1"), "plain_name.1");
        assert_eq!(fs_name("a/b"), "a\\x2fb");
        assert_eq!(fs_name("50%"), "50\\x25");
        assert_eq!(fs_name("back\\slash"), "back\\\\slash");
        assert_eq!(fs_name("tab\there"), "tab\\x09here");
        // escaping cannot collide
        assert_ne!(fs_name("a\\x2fb"), fs_name("a/b"));
    }

    #[test]
    fn meta_round_trip() {
        let t = tempfile::tempdir().unwrap();
        let mut workdirs = WorkdirSet::default();
        workdirs.insert("w", t.path().to_path_buf());
        let job = JobId::new("w", 0);
        fs::create_dir_all(t.path().join("w-0")).unwrap();
        let mut meta = DsMeta::new(3);
        meta.caption = "cap".into();
        meta.lines = vec![1, 2, 0];
        meta.columns.insert(
            "x".into(),
            DatasetColumn {
                typ: ColumnType::Int64,
                compression: DEFAULT_COMPRESSION.into(),
                location: Some("w-0/DS/default.d/%s.a".into()),
                min: Some(Value::Int(1)),
                max: Some(Value::Int(5)),
                offsets: None,
                none_support: false,
            },
        );
        let ds = Dataset {
            id: DatasetId::new(job, "default"),
            meta,
        };
        ds.save(&workdirs).unwrap();
        let loaded = Dataset::load(&workdirs, &ds.id).unwrap();
        assert_eq!(loaded.meta.lines, vec![1, 2, 0]);
        assert_eq!(loaded.meta.columns["x"].typ, ColumnType::Int64);
        assert_eq!(loaded.meta.columns["x"].min, Some(Value::Int(1)));
    }

    #[test]
    fn missing_dataset_reports_alternatives() {
        let t = tempfile::tempdir().unwrap();
        let mut workdirs = WorkdirSet::default();
        workdirs.insert("w", t.path().to_path_buf());
        let job = JobId::new("w", 1);
        fs::create_dir_all(t.path().join("w-1")).unwrap();
        let err = Dataset::load(&workdirs, &DatasetId::new(job, "nope")).unwrap_err();
        assert!(matches!(err, KilnError::NoSuchDataset(_, _)));
    }
}
