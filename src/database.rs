// src/database.rs
//
// =============================================================================
// KILN: JOB DATABASE
// =============================================================================
//
// In-memory index over all workdirs, rebuilt from the filesystem.
// Only valid jobs are indexed: setup.json and post.json present, the
// recorded source hash matches a currently loaded method, and every
// recorded subjob is itself valid (applied to a fixed point).
//
// Update protocol: begin -> refresh(workdir)... -> finish. Refresh
// scans one workdir and loads new setup/post pairs with a small worker
// pool; finish drops vanished jobs, filters by hash and subjobs, and
// rebuilds the per-method newest-first lists. The server serialises
// updates and lets queries run in parallel (RwLock around this type).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use log::{debug, info};

use crate::core::JobId;
use crate::error::Result;
use crate::methods::MethodRegistry;
use crate::options::{self, Fingerprint};
use crate::setupfile::{self, Setup};
use crate::workdir::Workdir;

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub method: String,
    pub fingerprint: Fingerprint,
    pub source_hash: String,
    pub start_time: f64,
    pub total_time: f64,
}

#[derive(Debug, Clone)]
pub struct WorkdirEntry {
    pub method: String,
    pub total_time: f64,
    pub current: bool,
}

/// Cached on-disk state of one candidate job.
#[derive(Clone)]
struct CachedJob {
    setup: Setup,
    subjobs: Vec<JobId>,
}

#[derive(Default)]
pub struct JobDatabase {
    by_id: BTreeMap<JobId, JobRecord>,
    /// Newest first, only current-hash jobs with valid subjobs.
    by_method_current: BTreeMap<String, Vec<JobId>>,
    /// Newest first, all finished jobs regardless of hash.
    by_method_all: BTreeMap<String, Vec<JobId>>,
    by_workdir: BTreeMap<String, BTreeMap<JobId, WorkdirEntry>>,
    cache: HashMap<JobId, CachedJob>,
    fs_ids: BTreeSet<JobId>,
}

fn load_one(wd: &Workdir, id: &JobId) -> Option<CachedJob> {
    let dir = wd.job_dir(id);
    let setup = setupfile::load_setup(&dir).ok()?;
    let post = setupfile::load_post(&dir).ok()?;
    let subjobs = post
        .subjobs
        .keys()
        .filter_map(|s| s.parse().ok())
        .collect();
    Some(CachedJob { setup, subjobs })
}

impl JobDatabase {
    pub fn new() -> JobDatabase {
        JobDatabase::default()
    }

    /// Start an update pass: forget which ids were seen on disk.
    pub fn update_begin(&mut self) {
        self.fs_ids.clear();
    }

    /// Scan one workdir, loading any jobs not yet cached. setup/post
    /// pairs are read on a small worker pool.
    pub fn refresh_workdir(&mut self, wd: &Workdir) -> Result<()> {
        let on_disk = wd.valid_jobs()?;
        debug!("{}: {} candidate jobs on disk", wd.name, on_disk.len());
        let new_ids: Vec<JobId> = on_disk
            .iter()
            .filter(|id| !self.cache.contains_key(*id))
            .cloned()
            .collect();
        self.fs_ids.extend(on_disk);
        if new_ids.is_empty() {
            return Ok(());
        }
        let loaded: Mutex<Vec<(JobId, CachedJob)>> = Mutex::new(Vec::new());
        let next: Mutex<usize> = Mutex::new(0);
        let workers = num_cpus::get().min(new_ids.len()).max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let ix = {
                        let mut next = next.lock().unwrap();
                        let ix = *next;
                        *next += 1;
                        ix
                    };
                    let Some(id) = new_ids.get(ix) else { break };
                    if let Some(job) = load_one(wd, id) {
                        loaded.lock().unwrap().push((id.clone(), job));
                    }
                });
            }
        });
        for (id, job) in loaded.into_inner().unwrap() {
            self.cache.insert(id, job);
        }
        Ok(())
    }

    /// Finish an update pass: filter on current hashes and surviving
    /// subjobs, then rebuild the indexes.
    pub fn update_finish(&mut self, registry: &MethodRegistry) {
        // drop cached state of jobs gone from disk
        let gone: Vec<JobId> = self
            .cache
            .keys()
            .filter(|id| !self.fs_ids.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.cache.remove(&id);
        }

        let hashes = registry.hashes();
        self.by_workdir.clear();
        self.by_method_all.clear();

        // Keep only jobs whose recorded hash matches a loaded method.
        let mut candidates: BTreeSet<JobId> = BTreeSet::new();
        for (id, job) in &self.cache {
            if hashes.get(&job.setup.method) == Some(&job.setup.hash) {
                candidates.insert(id.clone());
            }
            self.by_workdir.entry(id.workdir.clone()).or_default().insert(
                id.clone(),
                WorkdirEntry {
                    method: job.setup.method.clone(),
                    total_time: job.setup.total_time().unwrap_or(0.0),
                    current: true,
                },
            );
            self.by_method_all
                .entry(job.setup.method.clone())
                .or_default()
                .push(id.clone());
        }

        // Keep only jobs whose subjobs all survive; iterate to a fixed
        // point since dropping one may invalidate another.
        loop {
            let dropped: Vec<JobId> = candidates
                .iter()
                .filter(|id| {
                    self.cache[*id]
                        .subjobs
                        .iter()
                        .any(|sj| !candidates.contains(sj))
                })
                .cloned()
                .collect();
            if dropped.is_empty() {
                break;
            }
            for id in dropped {
                candidates.remove(&id);
            }
        }

        for (wd, entries) in self.by_workdir.iter_mut() {
            for (id, entry) in entries.iter_mut() {
                entry.current = candidates.contains(id);
            }
            debug!("{}: {} known jobs", wd, entries.len());
        }

        self.by_id.clear();
        self.by_method_current.clear();
        for id in &candidates {
            let job = &self.cache[id];
            let record = self.make_record(registry, id, &job.setup);
            self.by_method_current
                .entry(record.method.clone())
                .or_default()
                .push(id.clone());
            self.by_id.insert(id.clone(), record);
        }
        // newest first
        let starttimes: HashMap<JobId, f64> = self
            .cache
            .iter()
            .map(|(id, j)| (id.clone(), j.setup.starttime.unwrap_or(0.0)))
            .collect();
        for list in self.by_method_current.values_mut() {
            list.sort_by(|a, b| {
                let ta = starttimes.get(a).copied().unwrap_or(0.0);
                let tb = starttimes.get(b).copied().unwrap_or(0.0);
                tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        for list in self.by_method_all.values_mut() {
            list.sort_by(|a, b| {
                let ta = starttimes.get(a).copied().unwrap_or(0.0);
                let tb = starttimes.get(b).copied().unwrap_or(0.0);
                tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        info!("database contains {} current jobs", self.by_id.len());
    }

    fn make_record(&self, registry: &MethodRegistry, id: &JobId, setup: &Setup) -> JobRecord {
        // The fingerprint merges the *current* schema's defaults with
        // the recorded options, so a job built before a defaulted
        // option was added still matches submissions that leave the
        // new option at its default.
        let fingerprint = match registry.get(&setup.method) {
            Ok(m) => options::fingerprint_for_stored(
                &m.spec,
                &setup.options,
                &setup.datasets,
                &setup.jobs,
            ),
            Err(_) => Fingerprint::new(),
        };
        JobRecord {
            id: id.clone(),
            method: setup.method.clone(),
            fingerprint,
            source_hash: setup.hash.clone(),
            start_time: setup.starttime.unwrap_or(0.0),
            total_time: setup.total_time().unwrap_or(0.0),
        }
    }

    /// Absorb one newly finished job without a full rescan.
    pub fn add_single_job(&mut self, wd: &Workdir, id: &JobId, registry: &MethodRegistry) -> Result<()> {
        let dir = wd.job_dir(id);
        let setup = setupfile::load_setup(&dir)?;
        let post = setupfile::load_post(&dir)?;
        let subjobs = post.subjobs.keys().filter_map(|s| s.parse().ok()).collect();
        let record = self.make_record(registry, id, &setup);
        self.by_workdir.entry(id.workdir.clone()).or_default().insert(
            id.clone(),
            WorkdirEntry {
                method: setup.method.clone(),
                total_time: setup.total_time().unwrap_or(0.0),
                current: true,
            },
        );
        self.by_method_current
            .entry(setup.method.clone())
            .or_default()
            .insert(0, id.clone());
        self.by_method_all
            .entry(setup.method.clone())
            .or_default()
            .insert(0, id.clone());
        self.by_id.insert(id.clone(), record);
        self.cache.insert(id.clone(), CachedJob { setup, subjobs });
        self.fs_ids.insert(id.clone());
        Ok(())
    }

    /// Newest job whose option-set equals the fingerprint.
    pub fn match_exact(&self, method: &str, fingerprint: &Fingerprint) -> Option<&JobRecord> {
        self.by_method_current.get(method)?.iter().find_map(|id| {
            let record = &self.by_id[id];
            (record.fingerprint == *fingerprint).then_some(record)
        })
    }

    /// Newest job whose option-set is a superset of the given subset
    /// (used to explain why a submission would build).
    pub fn match_subset(&self, method: &str, subset: &Fingerprint) -> Option<&JobRecord> {
        self.by_method_current.get(method)?.iter().find_map(|id| {
            let record = &self.by_id[id];
            subset.is_subset(&record.fingerprint).then_some(record)
        })
    }

    pub fn get(&self, id: &JobId) -> Option<&JobRecord> {
        self.by_id.get(id)
    }

    pub fn is_current(&self, id: &JobId) -> bool {
        self.by_id.contains_key(id)
    }

    /// method -> jobs, newest first; `current` restricts to jobs whose
    /// source matches the loaded method.
    pub fn method_jobs(&self, method: &str, current: bool) -> &[JobId] {
        let map = if current {
            &self.by_method_current
        } else {
            &self.by_method_all
        };
        map.get(method).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn workdir_jobs(&self, workdir: &str) -> Option<&BTreeMap<JobId, WorkdirEntry>> {
        self.by_workdir.get(workdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::{MethodSpec, OptionSpec, PhaseMask};
    use crate::launch::NoopRuntime;
    use crate::setupfile::{ExecTime, Post, POST_VERSION, SETUP_VERSION};
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    fn registry_with(dir: &std::path::Path, sources: &[(&str, &str)]) -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        for (name, body) in sources {
            std::fs::write(dir.join(format!("a_{}.src", name)), body).unwrap();
            reg.provide(
                MethodSpec {
                    name: name.to_string(),
                    package: "pkg".into(),
                    description: String::new(),
                    options: vec![("a".into(), OptionSpec::Str { default: None })],
                    datasets: vec![],
                    jobs: vec![],
                    phases: PhaseMask::default(),
                },
                Arc::new(NoopRuntime),
            );
        }
        let cfg = Config {
            slices: 2,
            workdirs: vec![("test".into(), dir.join("wd"))],
            method_packages: vec![dir.to_path_buf()],
            target_workdir: "test".into(),
            listen: None,
            board_listen: None,
            urd: None,
            result_directory: None,
            input_directory: None,
            project_directory: dir.to_path_buf(),
        };
        reg.discover(&cfg).unwrap();
        reg
    }

    fn write_job(
        wd: &Workdir,
        reg: &MethodRegistry,
        method: &str,
        a: &str,
        starttime: f64,
        subjobs: &[&JobId],
        with_post: bool,
    ) -> JobId {
        let dirs = wd.allocate(1).unwrap();
        let job = &dirs[0];
        let mut options = serde_json::Map::new();
        options.insert("a".into(), serde_json::json!(a));
        let setup = Setup {
            version: SETUP_VERSION,
            method: method.into(),
            package: None,
            caption: String::new(),
            jobid: job.id.clone(),
            hash: reg
                .get(method)
                .map(|m| m.hash.clone())
                .unwrap_or_else(|_| "deadbeef".repeat(8)),
            slices: 2,
            seed: 1,
            options,
            datasets: vec![],
            jobs: vec![],
            parent: None,
            input_directory: None,
            starttime: Some(starttime),
            endtime: Some(starttime + 1.0),
            exectime: Some(ExecTime {
                total: 1.0,
                ..Default::default()
            }),
            versions: Map::new(),
            typing: vec![],
        };
        setupfile::save_setup(job, &setup).unwrap();
        if with_post {
            let post = Post {
                version: POST_VERSION,
                starttime,
                endtime: starttime + 1.0,
                exectime: ExecTime::default(),
                files: vec![],
                subjobs: subjobs
                    .iter()
                    .map(|id| (id.to_string(), true))
                    .collect(),
            };
            setupfile::save_post(job, &post).unwrap();
        }
        job.id.clone()
    }

    fn update(db: &mut JobDatabase, wd: &Workdir, reg: &MethodRegistry) {
        db.update_begin();
        db.refresh_workdir(wd).unwrap();
        db.update_finish(reg);
    }

    #[test]
    fn match_exact_returns_newest_matching() {
        let t = tempfile::tempdir().unwrap();
        let reg = registry_with(t.path(), &[("demo", "v1")]);
        let wd = Workdir::open("test", t.path().join("wd"), 2).unwrap();
        let _old = write_job(&wd, &reg, "demo", "x", 100.0, &[], true);
        let newer = write_job(&wd, &reg, "demo", "x", 200.0, &[], true);
        let other = write_job(&wd, &reg, "demo", "y", 300.0, &[], true);
        let mut db = JobDatabase::new();
        update(&mut db, &wd, &reg);

        let spec = &reg.get("demo").unwrap().spec;
        let mut options = serde_json::Map::new();
        options.insert("a".into(), serde_json::json!("x"));
        let typed = options::typed_options(spec, &options).unwrap();
        let fp = options::fingerprint(spec, &typed, &[], &[]);
        assert_eq!(db.match_exact("demo", &fp).unwrap().id, newer);

        let mut options = serde_json::Map::new();
        options.insert("a".into(), serde_json::json!("y"));
        let typed = options::typed_options(spec, &options).unwrap();
        let fp = options::fingerprint(spec, &typed, &[], &[]);
        assert_eq!(db.match_exact("demo", &fp).unwrap().id, other);
    }

    #[test]
    fn jobs_without_post_are_invalid() {
        let t = tempfile::tempdir().unwrap();
        let reg = registry_with(t.path(), &[("demo", "v1")]);
        let wd = Workdir::open("test", t.path().join("wd"), 2).unwrap();
        let id = write_job(&wd, &reg, "demo", "x", 100.0, &[], false);
        let mut db = JobDatabase::new();
        update(&mut db, &wd, &reg);
        assert!(!db.is_current(&id));
    }

    #[test]
    fn hash_change_invalidates_jobs() {
        let t = tempfile::tempdir().unwrap();
        let reg = registry_with(t.path(), &[("demo", "v1")]);
        let wd = Workdir::open("test", t.path().join("wd"), 2).unwrap();
        let id = write_job(&wd, &reg, "demo", "x", 100.0, &[], true);
        let mut db = JobDatabase::new();
        update(&mut db, &wd, &reg);
        assert!(db.is_current(&id));
        // method source changes, job becomes invalid but stays listed
        let reg2 = registry_with(t.path(), &[("demo", "v2")]);
        update(&mut db, &wd, &reg2);
        assert!(!db.is_current(&id));
        let entry = &db.workdir_jobs("test").unwrap()[&id];
        assert!(!entry.current);
    }

    #[test]
    fn subjob_invalidation_reaches_fixed_point() {
        let t = tempfile::tempdir().unwrap();
        let reg = registry_with(t.path(), &[("demo", "v1"), ("other", "v1")]);
        let wd = Workdir::open("test", t.path().join("wd"), 2).unwrap();
        // leaf has an unknown method -> invalid
        let leaf = write_job(&wd, &reg, "ghost_method", "x", 1.0, &[], true);
        // mid depends on leaf, top depends on mid
        let mid = write_job(&wd, &reg, "demo", "x", 2.0, &[&leaf], true);
        let top = write_job(&wd, &reg, "other", "x", 3.0, &[&mid], true);
        let mut db = JobDatabase::new();
        update(&mut db, &wd, &reg);
        assert!(!db.is_current(&leaf));
        assert!(!db.is_current(&mid));
        assert!(!db.is_current(&top));
    }
}
