// src/launch.rs
//
// =============================================================================
// KILN: JOB LAUNCHER
// =============================================================================
//
// Executes one job in three ordered phases: prepare (one thread) ->
// analysis (one worker per slice, gated by a concurrency semaphore) ->
// synthesis (one thread). A phase may be absent and contributes zero
// time. Workers report on an mpsc aggregation channel; the launcher
// polls liveness on a timeout, so a worker that dies without reporting
// is detected. Output is captured per slice to OUTPUT/<sliceno> with a
// live tail in the status registry.
//
// post.json is written only on success: a failed job stays invalid and
// is ignored by the database. The failing component is reported as
// "prepare" / "analysis(N)" / "synthesis".

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use serde_json::Value as Json;

use crate::core::{JobId, MethodSpec, Outcome, Value};
use crate::dataset::write::{DatasetWriter, SliceStats, SliceWriter, SplitWriter, WriterConfig};
use crate::dataset::{Dataset, WorkdirSet};
use crate::error::{JobStatus, KilnError, Result};
use crate::logs::{OutputWriter, StatusRegistry};
use crate::options;
use crate::setupfile::{self, ExecTime, Post, Setup, POST_VERSION};
use crate::workdir::JobDir;

const AGGREGATION_TIMEOUT: Duration = Duration::from_secs(10);
const FAILURE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// 1. METHOD RUNTIME
// ============================================================================

/// The executable half of a method. Implement the phases the spec's
/// phase mask declares; the defaults do nothing.
pub trait MethodRuntime: Send + Sync {
    fn prepare(&self, _ctx: &JobContext) -> Result<Outcome> {
        Ok(Outcome::done())
    }

    fn analysis(&self, _ctx: &SliceContext) -> Result<Outcome> {
        Ok(Outcome::done())
    }

    fn synthesis(&self, _ctx: &JobContext) -> Result<Outcome> {
        Ok(Outcome::done())
    }
}

/// Runtime with no phases at all (still a valid job).
pub struct NoopRuntime;

impl MethodRuntime for NoopRuntime {}

// ============================================================================
// 2. CONTEXTS (parameter injection)
// ============================================================================

pub struct JobContext {
    pub job: JobDir,
    pub method: String,
    pub slices: usize,
    pub seed: u64,
    pub options: BTreeMap<String, Value>,
    /// Resolved dataset inputs (list-valued inputs keep their order).
    pub datasets: BTreeMap<String, Vec<Dataset>>,
    pub jobs: BTreeMap<String, Vec<JobDir>>,
    pub workdirs: WorkdirSet,
    pub input_directory: Option<PathBuf>,
    status: StatusRegistry,
    prepare_res: Mutex<Option<Json>>,
    analysis_res: Mutex<Vec<Option<Json>>>,
    writers: Mutex<BTreeMap<String, Arc<DatasetWriter>>>,
    split_handles: Mutex<Vec<(String, SplitHandle)>>,
    files: Mutex<BTreeSet<String>>,
    subjobs: Mutex<BTreeMap<String, bool>>,
    output: Mutex<Option<OutputWriter>>,
}

impl JobContext {
    pub fn option(&self, name: &str) -> Value {
        self.options.get(name).cloned().unwrap_or(Value::None)
    }

    pub fn dataset(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .and_then(|v| v.first())
            .ok_or_else(|| KilnError::NoSuchDataset(name.to_string(), String::new()))
    }

    pub fn dataset_list(&self, name: &str) -> &[Dataset] {
        self.datasets.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn job_input(&self, name: &str) -> Result<&JobDir> {
        self.jobs
            .get(name)
            .and_then(|v| v.first())
            .ok_or_else(|| KilnError::NoSuchJob(name.to_string()))
    }

    /// The prepare return value (for analysis and synthesis).
    pub fn prepare_res(&self) -> Option<Json> {
        self.prepare_res.lock().unwrap().clone()
    }

    /// Analysis return values, indexed by sliceno (for synthesis).
    pub fn analysis_res(&self) -> Vec<Option<Json>> {
        self.analysis_res.lock().unwrap().clone()
    }

    /// Create a dataset writer (prepare or synthesis).
    pub fn create_writer(&self, config: WriterConfig) -> Result<Arc<DatasetWriter>> {
        let dw = Arc::new(DatasetWriter::create(
            &self.job,
            &self.workdirs,
            self.slices,
            config,
        )?);
        let mut writers = self.writers.lock().unwrap();
        if writers.contains_key(&dw.name) {
            return Err(KilnError::DatasetUsage(format!(
                "duplicate dataset name {:?}",
                dw.name,
            )));
        }
        writers.insert(dw.name.clone(), dw.clone());
        Ok(dw)
    }

    pub fn writer(&self, name: &str) -> Result<Arc<DatasetWriter>> {
        self.writers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                KilnError::DatasetUsage(format!("dataset writer {:?} not created", name))
            })
    }

    /// Split writer for single-threaded phases; closed by the launcher
    /// at the end of the phase.
    pub fn split_writer(&self, name: &str) -> Result<SplitHandle> {
        let dw = self.writer(name)?;
        let handle = SplitHandle(Arc::new(Mutex::new(Some(dw.split_writer()?))));
        self.split_handles
            .lock()
            .unwrap()
            .push((name.to_string(), handle.clone()));
        Ok(handle)
    }

    /// Write a line of captured output for the current phase.
    pub fn say(&self, line: impl AsRef<str>) {
        let mut out = self.output.lock().unwrap();
        if let Some(w) = out.as_mut() {
            let _ = writeln!(w, "{}", line.as_ref());
        }
    }

    pub fn register_file(&self, relpath: impl Into<String>) {
        self.files.lock().unwrap().insert(relpath.into());
    }

    pub fn register_subjob(&self, id: &JobId, make_was_needed: bool) {
        self.subjobs
            .lock()
            .unwrap()
            .insert(id.to_string(), make_was_needed);
    }

    pub fn status(&self, msg: impl Into<String>) -> crate::logs::StatusGuard {
        self.status.status(msg)
    }

    fn switch_output(&self, writer: Option<OutputWriter>) {
        *self.output.lock().unwrap() = writer;
    }

    fn drain_split_handles(&self) -> Result<Vec<(String, BTreeMap<usize, SliceStats>)>> {
        let handles = std::mem::take(&mut *self.split_handles.lock().unwrap());
        let mut out = Vec::new();
        for (name, handle) in handles {
            if let Some(sw) = handle.0.lock().unwrap().take() {
                out.push((name, sw.close()?));
            }
        }
        Ok(out)
    }
}

/// Shareable split-writer handle; the launcher takes the writer back
/// when the phase ends.
#[derive(Clone)]
pub struct SplitHandle(Arc<Mutex<Option<SplitWriter>>>);

impl SplitHandle {
    pub fn write(&self, row: &[Value]) -> Result<()> {
        match self.0.lock().unwrap().as_mut() {
            Some(sw) => sw.write(row),
            None => Err(KilnError::DatasetUsage(
                "split writer already closed".into(),
            )),
        }
    }
}

/// Per-slice view for analysis workers.
pub struct SliceContext<'a> {
    pub ctx: &'a JobContext,
    pub sliceno: usize,
    output: Mutex<Option<OutputWriter>>,
    slice_writers: Mutex<BTreeMap<String, SliceHandle>>,
    extra_stats: Mutex<BTreeMap<String, BTreeMap<usize, SliceStats>>>,
}

#[derive(Clone)]
pub struct SliceHandle(Arc<Mutex<Option<SliceWriter>>>);

impl SliceHandle {
    pub fn write(&self, row: &[Value]) -> Result<()> {
        match self.0.lock().unwrap().as_mut() {
            Some(w) => w.write(row),
            None => Err(KilnError::DatasetUsage("slice writer already closed".into())),
        }
    }

    pub fn hashcheck(&self, value: &Value) -> Result<bool> {
        match self.0.lock().unwrap().as_ref() {
            Some(w) => w.hashcheck(value),
            None => Err(KilnError::DatasetUsage("slice writer already closed".into())),
        }
    }

    pub fn enable_hash_discard(&self) -> Result<()> {
        match self.0.lock().unwrap().as_mut() {
            Some(w) => w.enable_hash_discard(),
            None => Err(KilnError::DatasetUsage("slice writer already closed".into())),
        }
    }
}

impl<'a> SliceContext<'a> {
    /// This slice's writer for a dataset created in prepare.
    pub fn writer(&self, name: &str) -> Result<SliceHandle> {
        let mut cache = self.slice_writers.lock().unwrap();
        if let Some(h) = cache.get(name) {
            return Ok(h.clone());
        }
        let dw = self.ctx.writer(name)?;
        let handle = SliceHandle(Arc::new(Mutex::new(Some(dw.set_slice(self.sliceno)?))));
        cache.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Contribute writer stats produced outside the row API (typing
    /// writes column files directly).
    pub fn record_stats(&self, writer: &str, dest_slice: usize, stats: SliceStats) {
        self.extra_stats
            .lock()
            .unwrap()
            .entry(writer.to_string())
            .or_default()
            .insert(dest_slice, stats);
    }

    pub fn say(&self, line: impl AsRef<str>) {
        let mut out = self.output.lock().unwrap();
        if let Some(w) = out.as_mut() {
            let _ = writeln!(w, "{}", line.as_ref());
        }
    }

    fn close_writers(&self) -> Result<BTreeMap<String, BTreeMap<usize, SliceStats>>> {
        let mut out: BTreeMap<String, BTreeMap<usize, SliceStats>> =
            std::mem::take(&mut *self.extra_stats.lock().unwrap());
        let handles = std::mem::take(&mut *self.slice_writers.lock().unwrap());
        for (name, handle) in handles {
            if let Some(w) = handle.0.lock().unwrap().take() {
                let stats = w.close()?;
                out.entry(name).or_default().insert(self.sliceno, stats);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// 3. AGGREGATION CHANNEL
// ============================================================================

/// What each worker sends on completion. The launcher treats an exited
/// worker with no report as a fatal error.
struct SliceReport {
    sliceno: usize,
    elapsed: f64,
    result: Option<Json>,
    dw_stats: BTreeMap<String, BTreeMap<usize, SliceStats>>,
    error: Option<String>,
    finish_early: bool,
}

/// Counting semaphore gating delayed analysis slices.
struct Gate {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Gate {
    fn new(permits: usize) -> Gate {
        Gate {
            count: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self, n: usize) {
        *self.count.lock().unwrap() += n;
        self.cv.notify_all();
    }
}

// ============================================================================
// 4. THE LAUNCH
// ============================================================================

pub struct LaunchParams {
    pub job: JobDir,
    pub setup: Setup,
    pub spec: MethodSpec,
    pub runtime: Arc<dyn MethodRuntime>,
    pub workdirs: WorkdirSet,
    pub concurrency: Option<usize>,
    pub status: StatusRegistry,
    pub input_directory: Option<PathBuf>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn fail(
    job: &JobDir,
    method: &str,
    component: &str,
    msg: String,
) -> KilnError {
    let mut status = JobStatus::default();
    status.0.insert(component.to_string(), msg);
    KilnError::JobFailed {
        job: job.id.to_string(),
        method: method.to_string(),
        status,
    }
}

/// Invoke one phase, turning panics into failure reports.
fn invoke(f: impl FnOnce() -> Result<Outcome>) -> std::result::Result<Outcome, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e.format_msg()),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic with non-string payload".to_string());
            Err(format!("panic: {}", msg))
        }
    }
}

/// Execute a job whose setup.json is already on disk. Writes post.json
/// (and the updated setup) on success; on failure nothing is written
/// and the job stays invalid.
pub fn run_job(params: &LaunchParams) -> Result<Post> {
    let LaunchParams {
        job,
        setup,
        spec,
        runtime,
        workdirs,
        concurrency,
        status,
        input_directory,
    } = params;
    let slices = setup.slices;
    let concurrency = concurrency.unwrap_or(slices).clamp(1, slices);
    let starttime = epoch_now();

    let _top = status.status(format!("{} {}", job.id, setup.method));
    info!("launching {} ({})", job.id, setup.method);

    // Re-derive the typed options and resolve the inputs.
    let typed = options::typed_options(spec, &setup.options)?;
    let mut datasets = BTreeMap::new();
    for (name, refs) in &setup.datasets {
        let loaded: Vec<Dataset> = refs
            .as_slice()
            .iter()
            .map(|id| Dataset::load(workdirs, id))
            .collect::<Result<_>>()?;
        datasets.insert(name.clone(), loaded);
    }
    let mut jobs = BTreeMap::new();
    for (name, refs) in &setup.jobs {
        let resolved: Vec<JobDir> = refs
            .as_slice()
            .iter()
            .map(|id| workdirs.job_dir(id))
            .collect::<Result<_>>()?;
        jobs.insert(name.clone(), resolved);
    }

    let ctx = JobContext {
        job: job.clone(),
        method: setup.method.clone(),
        slices,
        seed: setup.seed,
        options: typed.into_iter().collect(),
        datasets,
        jobs,
        workdirs: workdirs.clone(),
        input_directory: input_directory.clone(),
        status: status.clone(),
        prepare_res: Mutex::new(None),
        analysis_res: Mutex::new(Vec::new()),
        writers: Mutex::new(BTreeMap::new()),
        split_handles: Mutex::new(Vec::new()),
        files: Mutex::new(BTreeSet::new()),
        subjobs: Mutex::new(BTreeMap::new()),
        output: Mutex::new(None),
    };

    // Record the start in setup.json before running anything.
    {
        let mut setup = setup.clone();
        setup.starttime = Some(starttime);
        setupfile::save_setup(job, &setup)?;
    }

    let mut exectime = ExecTime::default();
    let mut finish_early = false;
    let mut early_result: Option<Json> = None;

    // ---- prepare --------------------------------------------------------
    if spec.phases.prepare {
        if status.abort_requested() {
            return Err(fail(job, &setup.method, "prepare", "aborted".into()));
        }
        let t = Instant::now();
        let _st = status.status("prepare");
        ctx.switch_output(Some(
            OutputWriter::open(&job.path, "prepare", status.tail("prepare"))
                .map_err(KilnError::Io)?,
        ));
        let outcome = invoke(|| runtime.prepare(&ctx));
        ctx.switch_output(None);
        match outcome {
            Ok(Outcome::Continue(res)) => {
                *ctx.prepare_res.lock().unwrap() = res;
            }
            Ok(Outcome::FinishEarly(res)) => {
                finish_early = true;
                early_result = res;
            }
            Err(msg) => return Err(fail(job, &setup.method, "prepare", msg)),
        }
        apply_split_stats(&ctx).map_err(|e| fail(job, &setup.method, "prepare", e.format_msg()))?;
        exectime.prepare = t.elapsed().as_secs_f64();
    }

    // ---- analysis -------------------------------------------------------
    if spec.phases.analysis && !finish_early {
        let t = Instant::now();
        let _st = status.status("waiting for all slices to finish analysis");
        let (per_slice, results, early) =
            run_analysis(&ctx, runtime.as_ref(), slices, concurrency, status)
                .map_err(|(component, msg)| fail(job, &setup.method, &component, msg))?;
        exectime.per_slice = per_slice;
        *ctx.analysis_res.lock().unwrap() = results;
        finish_early = early;
        exectime.analysis = t.elapsed().as_secs_f64();
    }

    // ---- synthesis ------------------------------------------------------
    if spec.phases.synthesis && !finish_early {
        if status.abort_requested() {
            return Err(fail(job, &setup.method, "synthesis", "aborted".into()));
        }
        let t = Instant::now();
        let _st = status.status("synthesis");
        ctx.switch_output(Some(
            OutputWriter::open(&job.path, "synthesis", status.tail("synthesis"))
                .map_err(KilnError::Io)?,
        ));
        let outcome = invoke(|| runtime.synthesis(&ctx));
        ctx.switch_output(None);
        match outcome {
            Ok(Outcome::Continue(res)) | Ok(Outcome::FinishEarly(res)) => {
                early_result = res;
            }
            Err(msg) => return Err(fail(job, &setup.method, "synthesis", msg)),
        }
        apply_split_stats(&ctx)
            .map_err(|e| fail(job, &setup.method, "synthesis", e.format_msg()))?;
        exectime.synthesis = t.elapsed().as_secs_f64();
    }

    // ---- finalise -------------------------------------------------------
    if let Some(result) = &early_result {
        setupfile::save_json(&job.filename("result.json"), result)?;
        ctx.register_file("result.json");
    }
    finish_datasets(&ctx).map_err(|e| fail(job, &setup.method, "synthesis", e.format_msg()))?;

    // Produced files: everything registered plus loose top-level files.
    let mut files: BTreeSet<String> = ctx.files.lock().unwrap().clone();
    for entry in std::fs::read_dir(&job.path)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                if !matches!(name, "setup.json" | "post.json" | "method.tar.gz") {
                    files.insert(name.to_string());
                }
            }
        }
    }

    let endtime = epoch_now();
    exectime.total = exectime.prepare + exectime.analysis + exectime.synthesis;
    let post = Post {
        version: POST_VERSION,
        starttime,
        endtime,
        exectime: exectime.clone(),
        files: files.into_iter().collect(),
        subjobs: ctx.subjobs.lock().unwrap().clone(),
    };
    {
        let mut setup = setup.clone();
        setup.starttime = Some(starttime);
        setup.endtime = Some(endtime);
        setup.exectime = Some(exectime);
        setupfile::save_setup(job, &setup)?;
    }
    setupfile::save_post(job, &post)?;
    info!(
        "{} finished in {:.3}s",
        job.id, post.exectime.total
    );
    Ok(post)
}

/// Close split writers opened during a single-threaded phase and apply
/// their stats.
fn apply_split_stats(ctx: &JobContext) -> Result<()> {
    for (name, stats) in ctx.drain_split_handles()? {
        let dw = ctx.writer(&name)?;
        for (sliceno, s) in stats {
            dw.apply_slice(sliceno, s)?;
        }
    }
    Ok(())
}

/// Run all analysis slices; returns (per-slice seconds, per-slice
/// results, finish_early). The error is (failing component, message).
fn run_analysis(
    ctx: &JobContext,
    runtime: &dyn MethodRuntime,
    slices: usize,
    concurrency: usize,
    status: &StatusRegistry,
) -> std::result::Result<(Vec<f64>, Vec<Option<Json>>, bool), (String, String)> {
    let (tx, rx) = mpsc::channel::<SliceReport>();
    let gate = Gate::new(0);
    let cancelled = AtomicBool::new(false);
    let mut delayed_todo = slices.saturating_sub(concurrency);

    let mut per_slice = vec![0.0f64; slices];
    let mut results: Vec<Option<Json>> = vec![None; slices];
    let mut early_flags: BTreeSet<bool> = BTreeSet::new();
    let mut failure: Option<(String, String)> = None;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(slices);
        for sliceno in 0..slices {
            let tx = tx.clone();
            let gate = &gate;
            let cancelled = &cancelled;
            let ctx_ref = &*ctx;
            let status = status.clone();
            let handle = scope.spawn(move || {
                if sliceno >= concurrency {
                    let _wait =
                        status.status(format!("waiting for concurrency limit ({})", sliceno));
                    gate.acquire();
                }
                if cancelled.load(Ordering::Relaxed) {
                    return;
                }
                let _st = status.status(format!("analysis({})", sliceno));
                let output = OutputWriter::open(
                    &ctx_ref.job.path,
                    &sliceno.to_string(),
                    status.tail(&sliceno.to_string()),
                );
                let sctx = SliceContext {
                    ctx: ctx_ref,
                    sliceno,
                    output: Mutex::new(output.ok()),
                    slice_writers: Mutex::new(BTreeMap::new()),
                    extra_stats: Mutex::new(BTreeMap::new()),
                };
                // Every row-writing dataset gets this slice's writer up
                // front, so unwritten slices still record zero lines.
                let preopen: Vec<(String, Arc<DatasetWriter>)> = ctx_ref
                    .writers
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, dw)| dw.wants_slice_writers())
                    .map(|(n, dw)| (n.clone(), dw.clone()))
                    .collect();
                for (name, dw) in preopen {
                    match dw.set_slice(sliceno) {
                        Ok(w) => {
                            sctx.slice_writers
                                .lock()
                                .unwrap()
                                .insert(name, SliceHandle(Arc::new(Mutex::new(Some(w)))));
                        }
                        Err(e) => {
                            let _ = tx.send(SliceReport {
                                sliceno,
                                elapsed: 0.0,
                                result: None,
                                dw_stats: BTreeMap::new(),
                                error: Some(e.format_msg()),
                                finish_early: false,
                            });
                            return;
                        }
                    }
                }
                let t = Instant::now();
                let outcome = invoke(|| runtime.analysis(&sctx));
                let elapsed = t.elapsed().as_secs_f64();
                let report = match outcome {
                    Ok(outcome) => {
                        let (result, finish_early) = match outcome {
                            Outcome::Continue(res) => (res, false),
                            Outcome::FinishEarly(res) => {
                                if res.is_some() {
                                    let _ = tx.send(SliceReport {
                                        sliceno,
                                        elapsed,
                                        result: None,
                                        dw_stats: BTreeMap::new(),
                                        error: Some(
                                            "can not return a result with finish_early() \
                                             in analysis"
                                                .into(),
                                        ),
                                        finish_early: true,
                                    });
                                    return;
                                }
                                (None, true)
                            }
                        };
                        match sctx.close_writers() {
                            Ok(dw_stats) => SliceReport {
                                sliceno,
                                elapsed,
                                result,
                                dw_stats,
                                error: None,
                                finish_early,
                            },
                            Err(e) => SliceReport {
                                sliceno,
                                elapsed,
                                result: None,
                                dw_stats: BTreeMap::new(),
                                error: Some(e.format_msg()),
                                finish_early: false,
                            },
                        }
                    }
                    Err(msg) => {
                        sctx.say(&msg);
                        SliceReport {
                            sliceno,
                            elapsed,
                            result: None,
                            dw_stats: BTreeMap::new(),
                            error: Some(msg),
                            finish_early: false,
                        }
                    }
                };
                let _ = tx.send(report);
            });
            handles.push(handle);
        }
        drop(tx);

        let mut received = 0usize;
        let mut deadline: Option<Instant> = None;
        while received < slices {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break; // grace for stragglers expired
                }
            }
            if status.abort_requested() && failure.is_none() {
                failure = Some(("analysis".to_string(), "aborted".to_string()));
                cancelled.store(true, Ordering::Relaxed);
                gate.release(slices);
                deadline = Some(Instant::now() + FAILURE_GRACE);
            }
            match rx.recv_timeout(AGGREGATION_TIMEOUT) {
                Ok(report) => {
                    received += 1;
                    if delayed_todo > 0 {
                        gate.release(1);
                        delayed_todo -= 1;
                    }
                    per_slice[report.sliceno] = report.elapsed;
                    results[report.sliceno] = report.result.clone();
                    early_flags.insert(report.finish_early);
                    if let Some(msg) = report.error {
                        if failure.is_none() {
                            failure =
                                Some((format!("analysis({})", report.sliceno), msg));
                            cancelled.store(true, Ordering::Relaxed);
                            gate.release(slices);
                            deadline = Some(Instant::now() + FAILURE_GRACE);
                        }
                        continue;
                    }
                    if early_flags.len() > 1 && failure.is_none() {
                        failure = Some((
                            format!("analysis({})", report.sliceno),
                            "not all slices agreed about finish_early() in analysis".into(),
                        ));
                        cancelled.store(true, Ordering::Relaxed);
                        gate.release(slices);
                        deadline = Some(Instant::now() + FAILURE_GRACE);
                        continue;
                    }
                    // apply dataset writer stats as reports arrive
                    if failure.is_none() {
                        for (name, stats) in report.dw_stats {
                            if let Ok(dw) = ctx.writer(&name) {
                                for (dest, s) in stats {
                                    if let Err(e) = dw.apply_slice(dest, s) {
                                        failure = Some((
                                            format!("analysis({})", report.sliceno),
                                            e.format_msg(),
                                        ));
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // poll child liveness: an exited worker that never
                    // reported is fatal
                    if handles.iter().all(|h| h.is_finished()) {
                        if failure.is_none() {
                            failure = Some((
                                "analysis".to_string(),
                                "all analysis workers exited, but not all returned a result"
                                    .into(),
                            ));
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if received < slices && failure.is_none() {
                        failure = Some((
                            "analysis".to_string(),
                            "analysis worker died without reporting".into(),
                        ));
                    }
                    break;
                }
            }
        }
        // Unblock any still-gated workers so the scope can join.
        cancelled.store(true, Ordering::Relaxed);
        gate.release(slices);
    });

    if let Some((component, msg)) = failure {
        error!("job failed in {}: {}", component, msg.lines().next().unwrap_or(""));
        return Err((component, msg));
    }
    debug!("all {} analysis slices reported", slices);
    let finish_early = early_flags.contains(&true);
    Ok((per_slice, results, finish_early))
}

/// Finish all dataset writers, ancestors first: a dataset whose
/// `previous` is another writer in this job is finished after it.
fn finish_datasets(ctx: &JobContext) -> Result<()> {
    let writers: Vec<Arc<DatasetWriter>> =
        ctx.writers.lock().unwrap().values().cloned().collect();
    let own_job = &ctx.job.id;
    let mut finished: BTreeSet<String> = BTreeSet::new();
    let mut pending: Vec<Arc<DatasetWriter>> = writers;
    while !pending.is_empty() {
        let mut progressed = false;
        let mut still_pending = Vec::new();
        for dw in pending {
            let blocked = match &dw.previous {
                Some(prev) if prev.job == *own_job => {
                    !finished.contains(&prev.name)
                        && ctx.writers.lock().unwrap().contains_key(&prev.name)
                }
                _ => false,
            };
            if blocked {
                still_pending.push(dw);
            } else {
                dw.finish()?;
                finished.insert(dw.name.clone());
                progressed = true;
            }
        }
        if !progressed && !still_pending.is_empty() {
            return Err(KilnError::DatasetUsage(format!(
                "circular previous references between datasets: {:?}",
                still_pending.iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
            )));
        }
        pending = still_pending;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_blocks_until_released() {
        let gate = Arc::new(Gate::new(0));
        let g2 = gate.clone();
        let started = Arc::new(AtomicBool::new(false));
        let s2 = started.clone();
        let h = std::thread::spawn(move || {
            g2.acquire();
            s2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!started.load(Ordering::SeqCst));
        gate.release(1);
        h.join().unwrap();
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn invoke_turns_panics_into_messages() {
        let res = invoke(|| panic!("kaboom"));
        assert!(res.unwrap_err().contains("kaboom"));
        let res = invoke(|| Ok(Outcome::done()));
        assert!(res.is_ok());
    }
}
