// src/dataset/iterate.rs
//
// =============================================================================
// KILN: DATASET ITERATION
// =============================================================================
//
// Streaming iteration over one dataset or a chain. Filtering is applied
// in this fixed order:
//   1. per-dataset range filter (datasets entirely outside the range
//      are skipped by their recorded min/max; others check per row),
//   2. hashlabel rehash (when the dataset's declared hashlabel differs
//      from the requested one and rehash was allowed),
//   3. per-column translators,
//   4. per-row filter predicate,
//   5. the outer slice window (skip/stop/step over the whole chain).
//
// If a hashlabel is requested with rehash=false, any dataset in the
// chain whose declared hashlabel differs fails the iteration with
// HashMismatch before anything is yielded.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::Value;
use crate::error::{KilnError, Result};

use super::codec::{slice_for, ColumnReader};
use super::{Dataset, WorkdirSet};

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

pub type Translator = Box<dyn FnMut(Value) -> Value + Send>;
pub type ColumnPredicate = Box<dyn FnMut(&Value) -> bool + Send>;
pub type RowPredicate = Box<dyn FnMut(&[Value]) -> bool + Send>;

pub enum RowFilter {
    /// Called with the whole row.
    Func(RowPredicate),
    /// Per-column predicates; every one must accept the row.
    Columns(Vec<(String, ColumnPredicate)>),
}

/// Which slice(s) to read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceSel {
    One(usize),
    /// All slices, one slice at a time.
    All,
    /// All slices, one value at a time across slices (original file
    /// order for round-robin-written datasets).
    RoundRobin,
}

/// `start <= value < stop`; either end may be open.
#[derive(Debug, Clone)]
pub struct RangeFilter {
    pub column: String,
    pub bottom: Option<Value>,
    pub top: Option<Value>,
    /// Only skip whole datasets by min/max, never check rows.
    pub sloppy: bool,
}

#[derive(Default)]
pub struct IterateOptions {
    /// Empty means all columns of the first dataset, in name order.
    pub columns: Vec<String>,
    pub range: Option<RangeFilter>,
    pub hashlabel: Option<String>,
    pub rehash: bool,
    pub translators: BTreeMap<String, Translator>,
    pub filter: Option<RowFilter>,
    /// (start, stop, step) over the filtered stream; stop=None is open.
    pub window: Option<(u64, Option<u64>, u64)>,
}

impl IterateOptions {
    pub fn columns(names: &[&str]) -> IterateOptions {
        IterateOptions {
            columns: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Range checking
// ----------------------------------------------------------------------------

impl RangeFilter {
    fn accepts(&self, value: &Value) -> bool {
        if value.is_none() {
            return false;
        }
        if let Some(b) = &self.bottom {
            if value.cmp_value(b) == Ordering::Less {
                return false;
            }
        }
        if let Some(t) = &self.top {
            if value.cmp_value(t) != Ordering::Less {
                return false;
            }
        }
        true
    }

    /// Dataset disposition by recorded min/max: skip it, take it all,
    /// or check per row.
    fn dataset_disposition(&self, ds: &Dataset) -> RangeDisposition {
        let col = match ds.meta.columns.get(&self.column) {
            Some(c) => c,
            None => return RangeDisposition::Skip,
        };
        let (min, max) = match (&col.min, &col.max) {
            (Some(min), Some(max)) => (min, max),
            // no recorded values: can't prove anything, check rows
            _ => return RangeDisposition::CheckRows,
        };
        if let Some(top) = &self.top {
            if min.cmp_value(top) != Ordering::Less {
                return RangeDisposition::Skip;
            }
        }
        if let Some(bottom) = &self.bottom {
            if max.cmp_value(bottom) == Ordering::Less {
                return RangeDisposition::Skip;
            }
        }
        if self.accepts(min) && self.accepts(max) && !col.none_support {
            RangeDisposition::TakeAll
        } else {
            RangeDisposition::CheckRows
        }
    }
}

enum RangeDisposition {
    Skip,
    TakeAll,
    CheckRows,
}

// ----------------------------------------------------------------------------
// Planning
// ----------------------------------------------------------------------------

struct UnitPlan {
    ds: Dataset,
    /// Source slices to read (one entry normally; all slices when
    /// rehashing or interleaving).
    src_slices: Vec<usize>,
    /// Rehash target slice: keep rows whose hashlabel hashes here.
    rehash_target: Option<usize>,
    check_range: bool,
    round_robin: bool,
}

pub struct ChainIter {
    workdirs: WorkdirSet,
    columns: Vec<String>,
    range: Option<RangeFilter>,
    hash_column: Option<String>,
    translators: BTreeMap<usize, Translator>,
    filter: Option<RowFilter>,
    filter_ixs: Vec<(usize, ColumnPredicate)>,
    plans: std::vec::IntoIter<UnitPlan>,
    current: Option<UnitIter>,
    // window state
    skip: u64,
    remaining: Option<u64>,
    step: u64,
    step_phase: u64,
    done: bool,
}

/// Iterate a list of datasets (a chain, oldest first, usually).
pub fn iterate_list(
    workdirs: &WorkdirSet,
    sliceno: SliceSel,
    datasets: &[Dataset],
    mut opts: IterateOptions,
) -> Result<ChainIter> {
    if datasets.is_empty() {
        return Ok(ChainIter::empty(workdirs));
    }
    let slices = datasets[0].meta.lines.len();
    let columns: Vec<String> = if opts.columns.is_empty() {
        datasets[0].meta.columns.keys().cloned().collect()
    } else {
        opts.columns.clone()
    };
    for ds in datasets {
        let missing: Vec<&String> = columns
            .iter()
            .filter(|c| !ds.meta.columns.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            return Err(KilnError::Dataset(format!(
                "columns {:?} not found in {}",
                missing, ds.id,
            )));
        }
    }

    // Requested hashlabel must hold (or be fixable) for every dataset
    // before anything is yielded.
    let mut rehash_needed: Vec<bool> = Vec::with_capacity(datasets.len());
    if let Some(wanted) = &opts.hashlabel {
        for ds in datasets {
            if ds.meta.hashlabel.as_deref() == Some(wanted.as_str()) {
                rehash_needed.push(false);
            } else if !opts.rehash {
                return Err(KilnError::HashMismatch {
                    dataset: ds.id.to_string(),
                    actual: ds.meta.hashlabel.clone(),
                    wanted: wanted.clone(),
                });
            } else {
                if !ds.meta.columns.contains_key(wanted) {
                    return Err(KilnError::DatasetUsage(format!(
                        "can't rehash {} on non-existent column {:?}",
                        ds.id, wanted,
                    )));
                }
                rehash_needed.push(true);
            }
        }
    } else {
        rehash_needed = vec![false; datasets.len()];
    }

    // Window fast-skip at dataset level is only sound when nothing
    // filters rows before the window.
    let can_fast_skip = opts.range.is_none()
        && opts.filter.is_none()
        && !rehash_needed.iter().any(|&b| b);
    let (mut win_start, win_stop, win_step) = match opts.window {
        Some((start, stop, step)) => {
            if step == 0 {
                return Err(KilnError::DatasetUsage(
                    "only positive window steps are supported".into(),
                ));
            }
            (start, stop, step)
        }
        None => (0, None, 1),
    };
    let win_budget = win_stop.map(|stop| stop.saturating_sub(win_start));

    let mut plans = Vec::new();
    for (ds, &needs_rehash) in datasets.iter().zip(&rehash_needed) {
        let lines_here: u64 = match (sliceno, needs_rehash) {
            (SliceSel::One(s), false) => ds.meta.lines[s],
            _ => ds.lines_total(),
        };
        if lines_here == 0 {
            continue;
        }
        if can_fast_skip && win_start >= lines_here {
            win_start -= lines_here;
            continue;
        }
        let check_range = match &opts.range {
            Some(range) => match range.dataset_disposition(ds) {
                RangeDisposition::Skip => continue,
                RangeDisposition::TakeAll => false,
                RangeDisposition::CheckRows => !range.sloppy,
            },
            None => false,
        };
        let (src_slices, rehash_target, round_robin) = match (sliceno, needs_rehash) {
            (SliceSel::One(s), false) => (vec![s], None, false),
            (SliceSel::One(s), true) => ((0..slices).collect(), Some(s), false),
            // No per-slice order promises with All, so rehashing is
            // irrelevant there.
            (SliceSel::All, _) => ((0..slices).collect(), None, false),
            (SliceSel::RoundRobin, _) => ((0..slices).collect(), None, true),
        };
        plans.push(UnitPlan {
            ds: ds.clone(),
            src_slices,
            rehash_target,
            check_range,
            round_robin,
        });
    }

    // Map translators and per-column filters to column indices.
    let mut translators = BTreeMap::new();
    for (name, t) in std::mem::take(&mut opts.translators) {
        let ix = columns.iter().position(|c| *c == name).ok_or_else(|| {
            KilnError::DatasetUsage(format!("translator for unselected column {:?}", name))
        })?;
        translators.insert(ix, t);
    }
    let mut filter_ixs = Vec::new();
    let filter = match opts.filter.take() {
        Some(RowFilter::Columns(cols)) => {
            for (name, f) in cols {
                let ix = columns.iter().position(|c| *c == name).ok_or_else(|| {
                    KilnError::DatasetUsage(format!("filter on unselected column {:?}", name))
                })?;
                filter_ixs.push((ix, f));
            }
            None
        }
        other => other,
    };

    Ok(ChainIter {
        workdirs: workdirs.clone(),
        columns,
        range: opts.range,
        hash_column: opts.hashlabel,
        translators,
        filter,
        filter_ixs,
        plans: plans.into_iter(),
        current: None,
        skip: win_start,
        remaining: win_budget,
        step: win_step,
        step_phase: 0,
        done: false,
    })
}

impl ChainIter {
    fn empty(workdirs: &WorkdirSet) -> ChainIter {
        ChainIter {
            workdirs: workdirs.clone(),
            columns: Vec::new(),
            range: None,
            hash_column: None,
            translators: BTreeMap::new(),
            filter: None,
            filter_ixs: Vec::new(),
            plans: Vec::new().into_iter(),
            current: None,
            skip: 0,
            remaining: None,
            step: 1,
            step_phase: 0,
            done: true,
        }
    }

    fn next_unit(&mut self) -> Result<bool> {
        match self.plans.next() {
            Some(plan) => {
                self.current = Some(UnitIter::open(
                    &self.workdirs,
                    &self.columns,
                    self.range.as_ref().filter(|_| plan.check_range).cloned(),
                    self.hash_column.clone(),
                    plan,
                )?);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn raw_next(&mut self) -> Option<Result<Vec<Value>>> {
        loop {
            if self.current.is_none() {
                match self.next_unit() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            match self.current.as_mut().unwrap().next() {
                Some(row) => return Some(row),
                None => self.current = None,
            }
        }
    }
}

impl Iterator for ChainIter {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let row = match self.raw_next() {
                Some(Ok(row)) => row,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            // translators then filters
            let row = match self.postprocess(row) {
                Some(row) => row,
                None => continue,
            };
            // outer slice window, applied to the filtered stream
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(rem) = &mut self.remaining {
                if *rem == 0 {
                    self.done = true;
                    return None;
                }
                *rem -= 1;
            }
            if self.step > 1 {
                let phase = self.step_phase;
                self.step_phase = (self.step_phase + 1) % self.step;
                if phase != 0 {
                    continue;
                }
            }
            return Some(Ok(row));
        }
    }
}

// ----------------------------------------------------------------------------
// One dataset's worth of reading
// ----------------------------------------------------------------------------

struct SliceStreams {
    readers: Vec<ColumnReader>,
    range_reader: Option<ColumnReader>,
    range_ix: Option<usize>,
    hash_reader: Option<ColumnReader>,
    hash_ix: Option<usize>,
}

struct UnitIter {
    columns: usize,
    range: Option<RangeFilter>,
    rehash_target: Option<usize>,
    slices: Vec<Option<SliceStreams>>,
    round_robin: bool,
    cursor: usize,
}

impl UnitIter {
    fn open(
        workdirs: &WorkdirSet,
        columns: &[String],
        range: Option<RangeFilter>,
        hash_column: Option<String>,
        plan: UnitPlan,
    ) -> Result<UnitIter> {
        let mut slices = Vec::with_capacity(plan.src_slices.len());
        let range_ix = range
            .as_ref()
            .and_then(|r| columns.iter().position(|c| *c == r.column));
        let hash_ix = match (&plan.rehash_target, &hash_column) {
            (Some(_), Some(h)) => columns.iter().position(|c| c == h),
            _ => None,
        };
        for &src in &plan.src_slices {
            if plan.ds.meta.lines[src] == 0 {
                slices.push(None);
                continue;
            }
            let mut readers = Vec::with_capacity(columns.len());
            let mut ok = true;
            for col in columns {
                match plan.ds.column_reader(workdirs, col, src)? {
                    Some(r) => readers.push(r),
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                slices.push(None);
                continue;
            }
            let range_reader = match (&range, range_ix) {
                (Some(r), None) => plan.ds.column_reader(workdirs, &r.column, src)?,
                _ => None,
            };
            let hash_reader = match (&plan.rehash_target, hash_ix, &hash_column) {
                (Some(_), None, Some(h)) => plan.ds.column_reader(workdirs, h, src)?,
                _ => None,
            };
            slices.push(Some(SliceStreams {
                readers,
                range_reader,
                range_ix,
                hash_reader,
                hash_ix,
            }));
        }
        Ok(UnitIter {
            columns: columns.len(),
            range,
            rehash_target: plan.rehash_target,
            slices,
            round_robin: plan.round_robin,
            cursor: 0,
        })
    }

    /// Read one raw row from one slice's streams; applies range and
    /// rehash filters, loops past rejected rows.
    fn next_from(
        streams: &mut SliceStreams,
        columns: usize,
        range: &Option<RangeFilter>,
        rehash_target: Option<usize>,
        total_slices: usize,
    ) -> Option<Result<Vec<Value>>> {
        'row: loop {
            let mut row = Vec::with_capacity(columns);
            for r in streams.readers.iter_mut() {
                match r.next() {
                    Some(Ok(v)) => row.push(v),
                    Some(Err(e)) => return Some(Err(e)),
                    None => return None,
                }
            }
            if row.is_empty() {
                return None;
            }
            let aux_range = match streams.range_reader.as_mut() {
                Some(r) => match r.next() {
                    Some(Ok(v)) => Some(v),
                    Some(Err(e)) => return Some(Err(e)),
                    None => return None,
                },
                None => None,
            };
            let aux_hash = match streams.hash_reader.as_mut() {
                Some(r) => match r.next() {
                    Some(Ok(v)) => Some(v),
                    Some(Err(e)) => return Some(Err(e)),
                    None => return None,
                },
                None => None,
            };
            if let Some(range) = range {
                let value = match streams.range_ix {
                    Some(ix) => &row[ix],
                    None => aux_range.as_ref().expect("range reader opened"),
                };
                if !range.accepts(value) {
                    continue 'row;
                }
            }
            if let Some(target) = rehash_target {
                let value = match streams.hash_ix {
                    Some(ix) => &row[ix],
                    None => aux_hash.as_ref().expect("hash reader opened"),
                };
                if slice_for(value, total_slices) != target {
                    continue 'row;
                }
            }
            return Some(Ok(row));
        }
    }
}

impl Iterator for UnitIter {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.slices.len().max(1);
        if self.round_robin {
            // one value at a time across slices
            let mut exhausted = 0;
            while exhausted < self.slices.len() {
                let ix = self.cursor % self.slices.len();
                self.cursor += 1;
                match self.slices[ix].as_mut() {
                    Some(streams) => {
                        match Self::next_from(
                            streams,
                            self.columns,
                            &self.range,
                            self.rehash_target,
                            total,
                        ) {
                            Some(row) => return Some(row),
                            None => {
                                self.slices[ix] = None;
                                exhausted = 0;
                            }
                        }
                    }
                    None => exhausted += 1,
                }
            }
            None
        } else {
            while self.cursor < self.slices.len() {
                if let Some(streams) = self.slices[self.cursor].as_mut() {
                    match Self::next_from(
                        streams,
                        self.columns,
                        &self.range,
                        self.rehash_target,
                        total,
                    ) {
                        Some(row) => return Some(row),
                        None => {}
                    }
                }
                self.cursor += 1;
            }
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Translator/filter application wrapper
// ----------------------------------------------------------------------------

impl ChainIter {
    /// Apply translators and filters to a raw row. Returns None when a
    /// filter rejects it.
    fn postprocess(&mut self, mut row: Vec<Value>) -> Option<Vec<Value>> {
        for (ix, t) in self.translators.iter_mut() {
            let v = std::mem::replace(&mut row[*ix], Value::None);
            row[*ix] = t(v);
        }
        for (ix, f) in self.filter_ixs.iter_mut() {
            if !f(&row[*ix]) {
                return None;
            }
        }
        if let Some(RowFilter::Func(f)) = self.filter.as_mut() {
            if !f(&row) {
                return None;
            }
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    // Exercised end to end in the write/typing tests and the
    // integration suite; unit coverage here focuses on the window.
    use super::*;

    #[test]
    fn empty_list_iterates_nothing() {
        let workdirs = WorkdirSet::default();
        let it = iterate_list(&workdirs, SliceSel::All, &[], IterateOptions::default()).unwrap();
        assert_eq!(it.count(), 0);
    }
}
