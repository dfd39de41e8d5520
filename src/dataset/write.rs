// src/dataset/write.rs
//
// =============================================================================
// KILN: DATASET WRITERS
// =============================================================================
//
// DatasetWriter is built in prepare and consumed in analysis: columns
// are declared before the first write, then either each slice owns one
// SliceWriter (set_slice), or a single SplitWriter routes rows to
// slices by hashlabel (round robin without one). The two modes are
// mutually exclusive per writer.
//
// When all slices have reported, finish() builds the metadata record:
// inherit-from-parent columns are shared by location, per-column slice
// files below the merge threshold are concatenated into one file with
// an offset table, and a sufficiently small dataset is concatenated
// into a single fully-merged file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use log::debug;

use crate::core::{DatasetId, Value};
use crate::error::{KilnError, Result};
use crate::workdir::JobDir;

use super::codec::{slice_for, ColumnReader, ColumnStats, ColumnType, ColumnWriter};
use super::{
    fs_name, register_dataset_name, Dataset, DatasetColumn, DsMeta, WorkdirSet, DEFAULT_COMPRESSION,
    FULL_MERGE_THRESHOLD, MERGE_THRESHOLD,
};

fn usage(msg: impl Into<String>) -> KilnError {
    KilnError::DatasetUsage(msg.into())
}

// ----------------------------------------------------------------------------
// Short, non-colliding column file names: a, b, ..., 9, _, aa, ab, ...
// ----------------------------------------------------------------------------

const FN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789_";

pub(crate) fn short_name(ix: usize) -> String {
    let mut ix = ix;
    let mut out = Vec::new();
    loop {
        out.push(FN_CHARS[ix % FN_CHARS.len()]);
        ix /= FN_CHARS.len();
        if ix == 0 {
            break;
        }
        ix -= 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

// ----------------------------------------------------------------------------
// Declaration & shared state
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ColumnDecl {
    pub name: String,
    pub typ: ColumnType,
    pub none_support: bool,
    /// Short file name inside the .d directory.
    file: String,
}

/// None in Collected.mode means unstarted.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    SetSlice,
    Split,
}

/// Per-slice results collected through the aggregation channel.
#[derive(Debug, Clone, Default)]
pub struct SliceStats {
    pub lines: u64,
    /// column -> (min, max)
    pub minmax: BTreeMap<String, (Option<Value>, Option<Value>)>,
    pub compression: String,
}

#[derive(Default)]
struct Collected {
    /// sliceno -> stats
    slices: BTreeMap<usize, SliceStats>,
    mode: Option<Mode>,
    finished: bool,
}

/// The writer definition: created in prepare (or synthesis), shared
/// with analysis slices, finished by the launcher.
pub struct DatasetWriter {
    pub name: String,
    pub job: JobDir,
    pub slices: usize,
    pub hashlabel: Option<String>,
    pub hashlabel_override: bool,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub previous: Option<DatasetId>,
    pub parent: Option<DatasetId>,
    pub allow_missing_slices: bool,
    /// The caller writes the column files itself and only reports
    /// stats; the row-writing API is unavailable.
    pub meta_only: bool,
    columns: Vec<ColumnDecl>,
    workdirs: WorkdirSet,
    state: Mutex<Collected>,
}

/// Construction arguments; columns can also be added with add().
#[derive(Default)]
pub struct WriterConfig {
    pub name: String,
    pub columns: Vec<(String, ColumnType, bool)>,
    pub hashlabel: Option<String>,
    pub hashlabel_override: bool,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub previous: Option<DatasetId>,
    pub parent: Option<DatasetId>,
    pub allow_missing_slices: bool,
    pub meta_only: bool,
}

impl WriterConfig {
    pub fn named(name: &str) -> WriterConfig {
        WriterConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn column(mut self, name: &str, typ: ColumnType, none_support: bool) -> Self {
        self.columns.push((name.to_string(), typ, none_support));
        self
    }

    pub fn hashlabel(mut self, label: &str) -> Self {
        self.hashlabel = Some(label.to_string());
        self
    }

    pub fn previous(mut self, previous: DatasetId) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn parent(mut self, parent: DatasetId) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl DatasetWriter {
    pub fn create(
        job: &JobDir,
        workdirs: &WorkdirSet,
        slices: usize,
        config: WriterConfig,
    ) -> Result<DatasetWriter> {
        let name = if config.name.is_empty() {
            "default".to_string()
        } else {
            config.name
        };
        let ds_dir = job.path.join("DS");
        let data_dir = ds_dir.join(format!("{}.d", fs_name(&name)));
        if job
            .path
            .join("DS")
            .join(format!("{}.p", fs_name(&name)))
            .exists()
            || data_dir.exists()
        {
            return Err(usage(format!("duplicate dataset name {:?}", name)));
        }
        fs::create_dir_all(&data_dir)?;

        let mut hashlabel = config.hashlabel;
        if let Some(parent_id) = &config.parent {
            let parent = Dataset::load(workdirs, parent_id)?;
            if !config.hashlabel_override {
                match (&hashlabel, &parent.meta.hashlabel) {
                    (Some(h), p) if p.as_deref() != Some(h.as_str()) => {
                        return Err(usage(format!(
                            "hashlabel mismatch {:?} != {:?}",
                            h, parent.meta.hashlabel,
                        )));
                    }
                    (None, Some(p)) => {
                        // Writing a new column over the parent's
                        // hashlabel makes this writer responsible for
                        // hashing it correctly.
                        if config.columns.iter().any(|(n, _, _)| n == p) {
                            hashlabel = Some(p.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut columns = Vec::with_capacity(config.columns.len());
        let mut sorted = config.columns;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (ix, (name, typ, none_support)) in sorted.into_iter().enumerate() {
            if columns.iter().any(|c: &ColumnDecl| c.name == name) {
                return Err(usage(format!("column {:?} already exists", name)));
            }
            columns.push(ColumnDecl {
                name,
                typ,
                none_support,
                file: short_name(ix),
            });
        }
        if columns.is_empty() && config.parent.is_none() {
            return Err(usage("no columns in dataset"));
        }
        if let Some(h) = &hashlabel {
            if config.parent.is_none() && !columns.iter().any(|c| &c.name == h) {
                return Err(usage(format!("hashed column ({:?}) missing", h)));
            }
        }

        Ok(DatasetWriter {
            name,
            job: job.clone(),
            slices,
            hashlabel,
            hashlabel_override: config.hashlabel_override,
            caption: config.caption,
            filename: config.filename,
            previous: config.previous,
            parent: config.parent,
            allow_missing_slices: config.allow_missing_slices,
            meta_only: config.meta_only,
            columns,
            workdirs: workdirs.clone(),
            state: Mutex::new(Collected::default()),
        })
    }

    pub fn columns(&self) -> &[ColumnDecl] {
        &self.columns
    }

    pub fn decl(&self, name: &str) -> Option<&ColumnDecl> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_order(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn ds_id(&self) -> DatasetId {
        DatasetId::new(self.job.id.clone(), self.name.clone())
    }

    fn data_dir(&self) -> PathBuf {
        self.job.path.join("DS").join(format!("{}.d", fs_name(&self.name)))
    }

    pub fn column_filename(&self, decl: &ColumnDecl, sliceno: usize) -> PathBuf {
        self.data_dir().join(format!("{}.{}", sliceno, decl.file))
    }

    fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.state.lock().expect("writer state poisoned");
        if state.finished {
            return Err(usage("don't use a writer after finishing it"));
        }
        match state.mode {
            None => {
                state.mode = Some(mode);
                Ok(())
            }
            Some(m) if m == mode => Ok(()),
            Some(_) => Err(usage(
                "don't use both set_slice and a split writer on one dataset",
            )),
        }
    }

    /// Whether the launcher should open a per-slice row writer for this
    /// dataset in each analysis worker.
    pub fn wants_slice_writers(&self) -> bool {
        if self.meta_only {
            return false;
        }
        let state = self.state.lock().expect("writer state poisoned");
        !state.finished && state.mode != Some(Mode::Split)
    }

    /// Per-slice writer for analysis. One per slice; wrong-slice rows
    /// are an error unless hash discard is enabled.
    pub fn set_slice(&self, sliceno: usize) -> Result<SliceWriter> {
        if self.meta_only {
            return Err(usage("meta_only writers don't write rows"));
        }
        if sliceno >= self.slices {
            return Err(usage(format!(
                "sliceno must be in range({})",
                self.slices
            )));
        }
        self.set_mode(Mode::SetSlice)?;
        let mut writers = Vec::with_capacity(self.columns.len());
        for decl in &self.columns {
            writers.push(ColumnWriter::create(
                &self.column_filename(decl, sliceno),
                decl.typ,
                decl.none_support,
            )?);
        }
        Ok(SliceWriter {
            sliceno,
            slices: self.slices,
            hash_ix: self.hash_ix(),
            discard: false,
            columns: self.columns.clone(),
            writers,
        })
    }

    /// Split writer: routes each row to its slice (hashlabel, or round
    /// robin without one). Not available together with set_slice.
    pub fn split_writer(&self) -> Result<SplitWriter> {
        if self.meta_only {
            return Err(usage("meta_only writers don't write rows"));
        }
        if self.allow_missing_slices {
            return Err(usage("don't use a split writer with allow_missing_slices"));
        }
        self.set_mode(Mode::Split)?;
        let mut per_slice = Vec::with_capacity(self.slices);
        for sliceno in 0..self.slices {
            let mut writers = Vec::with_capacity(self.columns.len());
            for decl in &self.columns {
                writers.push(ColumnWriter::create(
                    &self.column_filename(decl, sliceno),
                    decl.typ,
                    decl.none_support,
                )?);
            }
            per_slice.push(writers);
        }
        // Specialised router built once at construction: hash on the
        // declared column, or cycle.
        let router: Router = match self.hash_ix() {
            Some(ix) => Router::Hash { ix },
            None => Router::RoundRobin { next: 0 },
        };
        Ok(SplitWriter {
            slices: self.slices,
            columns: self.columns.clone(),
            per_slice,
            router,
        })
    }

    fn hash_ix(&self) -> Option<usize> {
        let h = self.hashlabel.as_ref()?;
        self.columns.iter().position(|c| &c.name == h)
    }

    /// Record one slice's results (called by the launcher with the
    /// stats from the aggregation channel).
    pub fn apply_slice(&self, sliceno: usize, stats: SliceStats) -> Result<()> {
        let mut state = self.state.lock().expect("writer state poisoned");
        if state.finished {
            return Err(usage("writer already finished"));
        }
        state.slices.insert(sliceno, stats);
        Ok(())
    }

    /// Build the dataset from the collected per-slice results. Merges
    /// small columns, then possibly the whole dataset, then writes the
    /// metadata record and registers the name.
    pub fn finish(&self) -> Result<Dataset> {
        let mut state = self.state.lock().expect("writer state poisoned");
        if state.finished {
            return Err(usage(format!(
                "dataset {:?} already finished",
                self.name
            )));
        }
        if state.mode.is_none() && state.slices.is_empty() && self.parent.is_none() {
            return Err(usage(format!(
                "DatasetWriter {:?} was never started",
                self.name
            )));
        }
        let mut lines = vec![0u64; self.slices];
        let mut missing = Vec::new();
        for sliceno in 0..self.slices {
            match state.slices.get(&sliceno) {
                Some(stats) => lines[sliceno] = stats.lines,
                None => missing.push(sliceno),
            }
        }
        if !missing.is_empty()
            && !self.allow_missing_slices
            && (state.mode == Some(Mode::SetSlice) || self.meta_only)
        {
            return Err(usage(format!(
                "not all slices written, missing {:?}",
                missing
            )));
        }
        state.finished = true;

        // Merge min/max across slices per column.
        let mut minmax: BTreeMap<String, (Option<Value>, Option<Value>)> = BTreeMap::new();
        for stats in state.slices.values() {
            for (col, (min, max)) in &stats.minmax {
                let entry = minmax.entry(col.clone()).or_default();
                if let Some(min) = min {
                    match &entry.0 {
                        Some(m) if m.cmp_value(min) != std::cmp::Ordering::Greater => {}
                        _ => entry.0 = Some(min.clone()),
                    }
                }
                if let Some(max) = max {
                    match &entry.1 {
                        Some(m) if m.cmp_value(max) != std::cmp::Ordering::Less => {}
                        _ => entry.1 = Some(max.clone()),
                    }
                }
            }
        }
        drop(state);

        // Start from the parent's record when inheriting.
        let mut meta = match &self.parent {
            Some(parent_id) => {
                let parent = Dataset::load(&self.workdirs, parent_id)?;
                if parent.meta.lines != lines {
                    return Err(usage(format!(
                        "new columns don't have the same number of lines as parent columns \
                         (expected {:?} but got {:?})",
                        parent.meta.lines, lines,
                    )));
                }
                let mut meta = parent.meta.clone();
                meta.cache = None;
                meta.cache_distance = None;
                if self.hashlabel_override {
                    meta.hashlabel = self.hashlabel.clone();
                }
                meta
            }
            None => {
                let mut meta = DsMeta::new(self.slices);
                meta.hashlabel = self.hashlabel.clone();
                meta.lines = lines.clone();
                meta
            }
        };
        meta.lines = lines.clone();
        meta.previous = self.previous.clone();
        if let Some(filename) = &self.filename {
            meta.filename = Some(filename.clone());
        }
        meta.caption = self
            .caption
            .clone()
            .unwrap_or_else(|| self.job.id.to_string());

        let fsn = fs_name(&self.name);
        for decl in &self.columns {
            let (min, max) = minmax.get(&decl.name).cloned().unwrap_or((None, None));
            meta.columns.insert(
                decl.name.clone(),
                DatasetColumn {
                    typ: decl.typ,
                    compression: DEFAULT_COMPRESSION.into(),
                    location: Some(format!(
                        "{}/DS/{}.d/%s.{}",
                        self.job.id, fsn, decl.file
                    )),
                    min,
                    max,
                    offsets: None,
                    none_support: decl.none_support,
                },
            );
        }

        for decl in &self.columns {
            self.maybe_merge(&mut meta, decl, &lines)?;
        }
        if lines.iter().sum::<u64>() == 0 {
            let _ = fs::remove_dir(self.data_dir());
        } else {
            self.maybe_merge_fully(&mut meta)?;
        }

        let mut ds = Dataset {
            id: self.ds_id(),
            meta,
        };
        if ds.meta.previous.is_some() {
            ds.update_cache(&self.workdirs)?;
        }
        ds.save(&self.workdirs)?;
        register_dataset_name(&self.workdirs, &self.job.id, &self.name)?;
        debug!("finished dataset {}", ds.id);
        Ok(ds)
    }

    /// Concatenate one column's slice files into a merged file when the
    /// mean per-slice size is below the threshold. Empty slices get an
    /// absent offset and no space.
    fn maybe_merge(&self, meta: &mut DsMeta, decl: &ColumnDecl, lines: &[u64]) -> Result<()> {
        if self.slices < 2 {
            return Ok(());
        }
        let mut sizes: Vec<Option<u64>> = Vec::with_capacity(self.slices);
        for sliceno in 0..self.slices {
            let fn_ = self.column_filename(decl, sliceno);
            if lines[sliceno] == 0 {
                // unused slice files shouldn't exist
                let _ = fs::remove_file(&fn_);
                sizes.push(None);
                continue;
            }
            match fs::metadata(&fn_) {
                Ok(m) => sizes.push(Some(m.len())),
                Err(_) => sizes.push(None),
            }
        }
        let present: Vec<u64> = sizes.iter().copied().flatten().collect();
        let total: u64 = present.iter().sum();
        if !present.is_empty() && total / present.len() as u64 > MERGE_THRESHOLD {
            return Ok(());
        }
        if total == 0 {
            // all slices empty: the column needs no location at all
            meta.columns.get_mut(&decl.name).unwrap().location = None;
            return Ok(());
        }
        let merged_path = self.data_dir().join(format!("m.{}", decl.file));
        let mut out = fs::File::create(&merged_path)?;
        let mut offsets: Vec<Option<u64>> = Vec::with_capacity(self.slices);
        let mut pos = 0u64;
        for (sliceno, size) in sizes.iter().enumerate() {
            match size {
                Some(size) => {
                    let fn_ = self.column_filename(decl, sliceno);
                    let data = fs::read(&fn_)?;
                    if data.len() as u64 != *size {
                        return Err(KilnError::Server(format!(
                            "slice {} of column {} changed size during merge",
                            sliceno, decl.name,
                        )));
                    }
                    out.write_all(&data)?;
                    fs::remove_file(&fn_)?;
                    offsets.push(Some(pos));
                    pos += size;
                }
                None => offsets.push(None),
            }
        }
        out.sync_all().ok();
        let col = meta.columns.get_mut(&decl.name).unwrap();
        col.offsets = Some(offsets);
        col.location = Some(format!(
            "{}/DS/{}.d/m.{}",
            self.job.id,
            fs_name(&self.name),
            decl.file
        ));
        Ok(())
    }

    /// When every column is merged, shares one compression and the
    /// total stays small, concatenate all columns into one dataset
    /// file and drop the .d directory.
    fn maybe_merge_fully(&self, meta: &mut DsMeta) -> Result<()> {
        let mut total = 0u64;
        let mut compressions = std::collections::BTreeSet::new();
        let mut own: Vec<&ColumnDecl> = Vec::new();
        for decl in &self.columns {
            let col = &meta.columns[&decl.name];
            if col.location.is_none() {
                continue;
            }
            if col.offsets.is_none() {
                return Ok(());
            }
            compressions.insert(col.compression.clone());
            if compressions.len() > 1 {
                return Ok(());
            }
            let path = self.data_dir().join(format!("m.{}", decl.file));
            total += fs::metadata(&path)?.len();
            if total > FULL_MERGE_THRESHOLD {
                return Ok(());
            }
            own.push(decl);
        }
        if own.is_empty() {
            return Ok(());
        }
        let fsn = fs_name(&self.name);
        let m_path = self.job.path.join("DS").join(format!("{}.m", fsn));
        let m_location = format!("{}/DS/{}.m", self.job.id, fsn);
        let mut out = fs::File::create(&m_path)?;
        let mut pos = 0u64;
        for decl in own {
            let path = self.data_dir().join(format!("m.{}", decl.file));
            let data = fs::read(&path)?;
            fs::remove_file(&path)?;
            let col = meta.columns.get_mut(&decl.name).unwrap();
            let offsets = col.offsets.as_mut().unwrap();
            for o in offsets.iter_mut().flatten() {
                *o += pos;
            }
            col.location = Some(m_location.clone());
            out.write_all(&data)?;
            pos += data.len() as u64;
        }
        out.sync_all().ok();
        let _ = fs::remove_dir(self.data_dir());
        Ok(())
    }

}

// ----------------------------------------------------------------------------
// Slice & split writers
// ----------------------------------------------------------------------------

pub struct SliceWriter {
    sliceno: usize,
    slices: usize,
    hash_ix: Option<usize>,
    discard: bool,
    columns: Vec<ColumnDecl>,
    writers: Vec<ColumnWriter>,
}

impl SliceWriter {
    pub fn sliceno(&self) -> usize {
        self.sliceno
    }

    /// Does this value belong in this slice?
    pub fn hashcheck(&self, value: &Value) -> Result<bool> {
        match self.hash_ix {
            Some(_) => Ok(slice_for(value, self.slices) == self.sliceno),
            None => Err(usage("hashcheck needs a hashlabel")),
        }
    }

    /// Silently discard rows whose hashlabel belongs elsewhere instead
    /// of failing.
    pub fn enable_hash_discard(&mut self) -> Result<()> {
        if self.hash_ix.is_none() {
            return Err(usage("can't enable hash discard without hashlabel"));
        }
        self.discard = true;
        Ok(())
    }

    /// Write one row, values in column declaration order.
    pub fn write(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(usage(format!(
                "row has {} values, dataset has {} columns",
                row.len(),
                self.columns.len(),
            )));
        }
        if let Some(ix) = self.hash_ix {
            if slice_for(&row[ix], self.slices) != self.sliceno {
                if self.discard {
                    return Ok(());
                }
                return Err(usage("attempted to write data for wrong slice"));
            }
        }
        for (w, v) in self.writers.iter_mut().zip(row) {
            w.write(v)?;
        }
        Ok(())
    }

    /// Close all column files and return this slice's stats for the
    /// aggregation channel.
    pub fn close(self) -> Result<SliceStats> {
        let mut lens = BTreeMap::new();
        let mut minmax = BTreeMap::new();
        for (decl, w) in self.columns.iter().zip(self.writers) {
            let stats: ColumnStats = w.finish()?;
            lens.insert(decl.name.clone(), stats.count);
            minmax.insert(decl.name.clone(), (stats.min, stats.max));
        }
        let counts: std::collections::BTreeSet<u64> = lens.values().copied().collect();
        if counts.len() > 1 {
            return Err(usage(format!(
                "not all columns have the same linecount in slice {}: {:?}",
                self.sliceno, lens,
            )));
        }
        Ok(SliceStats {
            lines: counts.into_iter().next().unwrap_or(0),
            minmax,
            compression: DEFAULT_COMPRESSION.into(),
        })
    }
}

enum Router {
    Hash { ix: usize },
    RoundRobin { next: usize },
}

pub struct SplitWriter {
    slices: usize,
    columns: Vec<ColumnDecl>,
    per_slice: Vec<Vec<ColumnWriter>>,
    router: Router,
}

impl SplitWriter {
    /// Write one row, routed to the correct slice.
    pub fn write(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(usage(format!(
                "row has {} values, dataset has {} columns",
                row.len(),
                self.columns.len(),
            )));
        }
        let sliceno = match &mut self.router {
            Router::Hash { ix } => slice_for(&row[*ix], self.slices),
            Router::RoundRobin { next } => {
                let s = *next;
                *next = (s + 1) % self.slices;
                s
            }
        };
        for (w, v) in self.per_slice[sliceno].iter_mut().zip(row) {
            w.write(v)?;
        }
        Ok(())
    }

    /// Close every slice and return all stats (sliceno -> stats).
    pub fn close(self) -> Result<BTreeMap<usize, SliceStats>> {
        let mut out = BTreeMap::new();
        for (sliceno, writers) in self.per_slice.into_iter().enumerate() {
            let mut lens = BTreeMap::new();
            let mut minmax = BTreeMap::new();
            for (decl, w) in self.columns.iter().zip(writers) {
                let stats = w.finish()?;
                lens.insert(decl.name.clone(), stats.count);
                minmax.insert(decl.name.clone(), (stats.min, stats.max));
            }
            let counts: std::collections::BTreeSet<u64> = lens.values().copied().collect();
            if counts.len() > 1 {
                return Err(usage(format!(
                    "not all columns have the same linecount in slice {}: {:?}",
                    sliceno, lens,
                )));
            }
            out.insert(
                sliceno,
                SliceStats {
                    lines: counts.into_iter().next().unwrap_or(0),
                    minmax,
                    compression: DEFAULT_COMPRESSION.into(),
                },
            );
        }
        Ok(out)
    }
}

/// Sanity check used by readers that re-open written columns.
pub fn reopen_column(
    workdirs: &WorkdirSet,
    ds: &Dataset,
    column: &str,
    sliceno: usize,
) -> Result<Option<ColumnReader>> {
    ds.column_reader(workdirs, column, sliceno)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobId;

    fn setup(_slices: usize) -> (tempfile::TempDir, WorkdirSet, JobDir) {
        let t = tempfile::tempdir().unwrap();
        let mut workdirs = WorkdirSet::default();
        workdirs.insert("w", t.path().to_path_buf());
        let job = JobDir {
            id: JobId::new("w", 0),
            path: t.path().join("w-0"),
        };
        fs::create_dir_all(&job.path).unwrap();
        (t, workdirs, job)
    }

    fn write_through(
        job: &JobDir,
        workdirs: &WorkdirSet,
        slices: usize,
        config: WriterConfig,
        rows_per_slice: &[Vec<Vec<Value>>],
    ) -> Dataset {
        let dw = DatasetWriter::create(job, workdirs, slices, config).unwrap();
        for (sliceno, rows) in rows_per_slice.iter().enumerate() {
            let mut w = dw.set_slice(sliceno).unwrap();
            for row in rows {
                w.write(row).unwrap();
            }
            let stats = w.close().unwrap();
            dw.apply_slice(sliceno, stats).unwrap();
        }
        dw.finish().unwrap()
    }

    #[test]
    fn short_names_do_not_collide() {
        let names: std::collections::BTreeSet<String> = (0..100).map(short_name).collect();
        assert_eq!(names.len(), 100);
        assert_eq!(short_name(0), "a");
        assert_eq!(short_name(36), "_");
        assert_eq!(short_name(37), "aa");
    }

    #[test]
    fn write_read_round_trip_small_dataset_fully_merges() {
        let (_t, workdirs, job) = setup(2);
        let config = WriterConfig::named("default")
            .column("num", ColumnType::Int64, false)
            .column("txt", ColumnType::Unicode, false);
        let rows = vec![
            vec![
                vec![Value::Int(1), Value::Unicode("a".into())],
                vec![Value::Int(2), Value::Unicode("b".into())],
            ],
            vec![vec![Value::Int(3), Value::Unicode("c".into())]],
        ];
        let ds = write_through(&job, &workdirs, 2, config, &rows);
        assert_eq!(ds.meta.lines, vec![2, 1]);
        // small columns merge, then the whole dataset merges
        let col = &ds.meta.columns["num"];
        assert!(col.offsets.is_some());
        assert!(col.location.as_ref().unwrap().ends_with(".m"));
        assert_eq!(col.min, Some(Value::Int(1)));
        assert_eq!(col.max, Some(Value::Int(3)));
        // read back via the merged file
        let loaded = Dataset::load(&workdirs, &ds.id).unwrap();
        let values: Vec<Value> = loaded
            .column_reader(&workdirs, "num", 0)
            .unwrap()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
        let values: Vec<Value> = loaded
            .column_reader(&workdirs, "txt", 1)
            .unwrap()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values, vec![Value::Unicode("c".into())]);
    }

    #[test]
    fn empty_slice_offset_is_absent() {
        let (_t, workdirs, job) = setup(3);
        let config = WriterConfig::named("default").column("x", ColumnType::Int32, false);
        let rows = vec![
            vec![vec![Value::Int(1)]],
            vec![], // empty slice
            vec![vec![Value::Int(2)]],
        ];
        let ds = write_through(&job, &workdirs, 3, config, &rows);
        assert_eq!(ds.meta.lines, vec![1, 0, 1]);
        let col = &ds.meta.columns["x"];
        let offsets = col.offsets.as_ref().unwrap();
        assert!(offsets[0].is_some());
        assert!(offsets[1].is_none());
        assert!(offsets[2].is_some());
        assert!(ds.column_reader(&workdirs, "x", 1).unwrap().is_none());
    }

    #[test]
    fn wrong_slice_write_fails_unless_discarded() {
        let (_t, workdirs, job) = setup(4);
        let config = WriterConfig::named("default")
            .column("k", ColumnType::Unicode, false)
            .hashlabel("k");
        let dw = DatasetWriter::create(&job, &workdirs, 4, config).unwrap();
        let value = Value::Unicode("somekey".into());
        let home = slice_for(&value, 4);
        let wrong = (home + 1) % 4;
        let mut w = dw.set_slice(wrong).unwrap();
        assert!(w.write(&[value.clone()]).is_err());
        w.enable_hash_discard().unwrap();
        w.write(&[value.clone()]).unwrap(); // silently dropped
        let stats = w.close().unwrap();
        assert_eq!(stats.lines, 0);
    }

    #[test]
    fn split_writer_routes_by_hash() {
        let (_t, workdirs, job) = setup(3);
        let config = WriterConfig::named("default")
            .column("k", ColumnType::Int64, false)
            .hashlabel("k");
        let dw = DatasetWriter::create(&job, &workdirs, 3, config).unwrap();
        let mut sw = dw.split_writer().unwrap();
        for i in 0..100 {
            sw.write(&[Value::Int(i)]).unwrap();
        }
        for (sliceno, stats) in sw.close().unwrap() {
            dw.apply_slice(sliceno, stats).unwrap();
        }
        let ds = dw.finish().unwrap();
        assert_eq!(ds.lines_total(), 100);
        for sliceno in 0..3 {
            if let Some(reader) = ds.column_reader(&workdirs, "k", sliceno).unwrap() {
                for v in reader {
                    assert_eq!(slice_for(&v.unwrap(), 3), sliceno);
                }
            }
        }
    }

    #[test]
    fn split_writer_excludes_set_slice() {
        let (_t, workdirs, job) = setup(2);
        let config = WriterConfig::named("default").column("x", ColumnType::Int64, false);
        let dw = DatasetWriter::create(&job, &workdirs, 2, config).unwrap();
        let _sw = dw.split_writer().unwrap();
        assert!(dw.set_slice(0).is_err());
    }

    #[test]
    fn duplicate_dataset_name_rejected() {
        let (_t, workdirs, job) = setup(2);
        let config = WriterConfig::named("dup").column("x", ColumnType::Int64, false);
        let _dw = DatasetWriter::create(&job, &workdirs, 2, config).unwrap();
        let config = WriterConfig::named("dup").column("x", ColumnType::Int64, false);
        assert!(DatasetWriter::create(&job, &workdirs, 2, config).is_err());
    }

    #[test]
    fn parent_shares_untouched_columns_by_location() {
        let (_t, workdirs, job) = setup(2);
        let config = WriterConfig::named("base")
            .column("a", ColumnType::Int64, false)
            .column("b", ColumnType::Unicode, false);
        let rows = vec![
            vec![vec![Value::Int(1), Value::Unicode("x".into())]],
            vec![vec![Value::Int(2), Value::Unicode("y".into())]],
        ];
        let base = write_through(&job, &workdirs, 2, config, &rows);

        let config = WriterConfig::named("derived")
            .column("c", ColumnType::Float64, false)
            .parent(base.id.clone());
        let rows = vec![
            vec![vec![Value::Float(0.5)]],
            vec![vec![Value::Float(1.5)]],
        ];
        let derived = write_through(&job, &workdirs, 2, config, &rows);
        assert_eq!(derived.meta.columns.len(), 3);
        // untouched columns share the parent's location bytes
        assert_eq!(
            derived.meta.columns["a"].location,
            base.meta.columns["a"].location
        );
        let vals: Vec<Value> = derived
            .column_reader(&workdirs, "a", 1)
            .unwrap()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(vals, vec![Value::Int(2)]);
    }

    #[test]
    fn parent_line_mismatch_rejected() {
        let (_t, workdirs, job) = setup(2);
        let config = WriterConfig::named("base").column("a", ColumnType::Int64, false);
        let rows = vec![vec![vec![Value::Int(1)]], vec![vec![Value::Int(2)]]];
        let base = write_through(&job, &workdirs, 2, config, &rows);
        let config = WriterConfig::named("bad")
            .column("c", ColumnType::Int64, false)
            .parent(base.id.clone());
        let dw = DatasetWriter::create(&job, &workdirs, 2, config).unwrap();
        for sliceno in 0..2 {
            let mut w = dw.set_slice(sliceno).unwrap();
            // two rows instead of one
            w.write(&[Value::Int(0)]).unwrap();
            w.write(&[Value::Int(0)]).unwrap();
            let stats = w.close().unwrap();
            dw.apply_slice(sliceno, stats).unwrap();
        }
        assert!(dw.finish().is_err());
    }

    #[test]
    fn chain_cache_appears_every_64_steps() {
        let (_t, workdirs, job) = setup(1);
        let mut previous: Option<DatasetId> = None;
        let mut last = None;
        for i in 0..65 {
            let mut config =
                WriterConfig::named(&format!("ds{}", i)).column("x", ColumnType::Int64, false);
            if let Some(p) = previous.clone() {
                config = config.previous(p);
            }
            let rows = vec![vec![vec![Value::Int(i)]]];
            let ds = write_through(&job, &workdirs, 1, config, &rows);
            previous = Some(ds.id.clone());
            last = Some(ds);
        }
        let last = last.unwrap();
        let chain = last.chain(&workdirs, -1, None).unwrap();
        assert_eq!(chain.len(), 65);
        assert_eq!(chain.last().unwrap().id, last.id);
        // someone in the chain carries a snapshot
        let cached = chain.iter().filter(|d| d.meta.cache.is_some()).count();
        assert_eq!(cached, 1);
    }
}
