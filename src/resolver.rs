// src/resolver.rs
//
// =============================================================================
// KILN: DEPENDENCY RESOLVER
// =============================================================================
//
// Decides build vs. reuse for one submission. Options are typed and
// defaulted against the method schema (rejections happen before any
// job id exists), dataset inputs are validated by loading them, the
// canonical fingerprint is computed, and either an existing job is
// returned or a fresh id is allocated and its setup.json written.
//
// A submission is transactional: if the setup write fails after
// allocation the id is never returned (the empty directory is left for
// GC; the store itself never deletes).

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{JobId, JobLink, SubmitRequest};
use crate::database::JobDatabase;
use crate::dataset::{Dataset, WorkdirSet};
use crate::error::{KilnError, Result};
use crate::methods::MethodRegistry;
use crate::options::{self, Fingerprint};
use crate::setupfile::{self, Setup, SETUP_VERSION};
use crate::workdir::{JobDir, Workdir};

pub enum ResolveOutcome {
    /// An existing job matches; nothing to run.
    Reuse(JobLink),
    /// A new id was allocated and its setup written; run it.
    Build { job: JobDir, setup: Setup },
    /// why_build: candidate jobs and the option diffs preventing reuse.
    WhyBuild(Vec<(JobId, Vec<(String, Json)>)>),
}

pub fn resolve(
    registry: &MethodRegistry,
    db: &JobDatabase,
    workdir: &Workdir,
    workdirs: &WorkdirSet,
    config: &Config,
    req: &SubmitRequest,
) -> Result<ResolveOutcome> {
    let method = registry.get(&req.method)?;
    let spec = &method.spec;

    // Unknown dataset/job inputs are rejected against the schema, and
    // every referenced dataset must actually exist.
    for (name, refs) in &req.datasets {
        let input = spec
            .datasets
            .iter()
            .find(|i| i.name == *name)
            .ok_or_else(|| {
                KilnError::BadOption(format!(
                    "unknown dataset input {:?} for method {}",
                    name, spec.name,
                ))
            })?;
        if !input.is_list && refs.as_slice().len() > 1 {
            return Err(KilnError::BadOption(format!(
                "dataset input {:?} takes a single dataset",
                name,
            )));
        }
        for id in refs.as_slice() {
            Dataset::load(workdirs, id)?;
        }
    }
    for (name, refs) in &req.jobs {
        let input = spec.jobs.iter().find(|i| i.name == *name).ok_or_else(|| {
            KilnError::BadOption(format!(
                "unknown job input {:?} for method {}",
                name, spec.name,
            ))
        })?;
        if !input.is_list && refs.as_slice().len() > 1 {
            return Err(KilnError::BadOption(format!(
                "job input {:?} takes a single job",
                name,
            )));
        }
        for id in refs.as_slice() {
            if workdirs.job_path(id)?.join("setup.json").is_file() {
                continue;
            }
            return Err(KilnError::NoSuchJob(id.to_string()));
        }
    }

    let typed = options::typed_options(spec, &req.options)?;
    let fingerprint = options::fingerprint(spec, &typed, &req.datasets, &req.jobs);

    if !req.force_build {
        if let Some(record) = db.match_exact(&spec.name, &fingerprint) {
            debug!("{} reused as {}", spec.name, record.id);
            return Ok(ResolveOutcome::Reuse(JobLink {
                link: record.id.clone(),
                make: false,
                total_time: Some(record.total_time),
            }));
        }
    }

    if req.why_build {
        return Ok(ResolveOutcome::WhyBuild(explain(db, &spec.name, &fingerprint)));
    }

    // Allocate and write the setup; the store guarantees a fresh id.
    let allocated = workdir.allocate(1)?;
    let job = allocated.into_iter().next().expect("allocated one id");
    registry.package_source(&spec.name, &job)?;

    let mut stored_options = serde_json::Map::new();
    for (key, value) in &typed {
        let ordered = spec
            .option(key)
            .map(spec_is_ordered)
            .unwrap_or(false);
        stored_options.insert(key.clone(), options::value_to_setup_json(value, ordered));
    }
    let mut versions = BTreeMap::new();
    versions.insert("kiln".to_string(), env!("CARGO_PKG_VERSION").to_string());

    let setup = Setup {
        version: SETUP_VERSION,
        method: spec.name.clone(),
        package: Some(spec.package.clone()),
        caption: req.caption.clone(),
        jobid: job.id.clone(),
        hash: method.hash.clone(),
        slices: workdir.slices,
        seed: Uuid::new_v4().as_u128() as u64,
        options: stored_options,
        datasets: req.datasets.clone(),
        jobs: req.jobs.clone(),
        parent: req.parent.clone(),
        input_directory: config.input_directory.clone(),
        starttime: None,
        endtime: None,
        exectime: None,
        versions,
        typing: options::typing_pairs(spec),
    };
    setupfile::save_setup(&job, &setup)?;
    info!("allocated {} for {}", job.id, spec.name);
    Ok(ResolveOutcome::Build { job, setup })
}

fn spec_is_ordered(spec: &crate::core::OptionSpec) -> bool {
    use crate::core::OptionSpec;
    match spec {
        OptionSpec::Map { ordered, .. } => *ordered,
        OptionSpec::Required { inner, .. } => spec_is_ordered(inner),
        _ => false,
    }
}

/// Find near-miss jobs: drop ever more option lines from the wanted
/// fingerprint until something matches as a subset, and report which
/// recorded values differ.
fn explain(
    db: &JobDatabase,
    method: &str,
    wanted: &Fingerprint,
) -> Vec<(JobId, Vec<(String, Json)>)> {
    if let Some(record) = db.match_exact(method, wanted) {
        return vec![(record.id.clone(), vec![])];
    }
    let lines: Vec<&String> = wanted.iter().collect();
    // increasing number of removed lines, single candidate per subset
    for remcount in 1..=lines.len().min(3) {
        let mut found: Vec<(JobId, Vec<(String, Json)>)> = Vec::new();
        for removed in combinations(&lines, remcount) {
            let subset: Fingerprint = wanted
                .iter()
                .filter(|l| !removed.contains(&l.as_str()))
                .cloned()
                .collect();
            if let Some(record) = db.match_subset(method, &subset) {
                if found.iter().any(|(id, _)| *id == record.id) {
                    continue;
                }
                let diffs = record
                    .fingerprint
                    .difference(wanted)
                    .filter_map(|line| parse_optline(line))
                    .collect();
                found.push((record.id.clone(), diffs));
            }
        }
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// "method group-key value" -> (group-key, value)
fn parse_optline(line: &str) -> Option<(String, Json)> {
    let mut parts = line.splitn(3, ' ');
    let _method = parts.next()?;
    let key = parts.next()?;
    let value = parts.next()?;
    Some((
        key.to_string(),
        serde_json::from_str(value).unwrap_or(Json::String(value.to_string())),
    ))
}

fn combinations<'a>(items: &[&'a String], k: usize) -> Vec<Vec<&'a str>> {
    fn rec<'a>(items: &[&'a String], k: usize, start: usize, acc: &mut Vec<&'a str>, out: &mut Vec<Vec<&'a str>>) {
        if acc.len() == k {
            out.push(acc.clone());
            return;
        }
        for ix in start..items.len() {
            acc.push(items[ix].as_str());
            rec(items, k, ix + 1, acc, out);
            acc.pop();
        }
    }
    let mut out = Vec::new();
    rec(items, k, 0, &mut Vec::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MethodSpec, OptionSpec, PhaseMask};
    use crate::launch::NoopRuntime;
    use std::sync::Arc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        registry: MethodRegistry,
        db: JobDatabase,
        workdir: Workdir,
        workdirs: WorkdirSet,
        config: Config,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a_demo.src"), "demo v1").unwrap();
        let mut registry = MethodRegistry::new();
        registry.provide(
            MethodSpec {
                name: "demo".into(),
                package: "pkg".into(),
                description: String::new(),
                options: vec![
                    ("foo".into(), OptionSpec::Str { default: None }),
                    ("a".into(), OptionSpec::Str { default: None }),
                ],
                datasets: vec![],
                jobs: vec![],
                phases: PhaseMask::default(),
            },
            Arc::new(NoopRuntime),
        );
        let config = Config {
            slices: 3,
            workdirs: vec![("test".into(), tmp.path().join("wd"))],
            method_packages: vec![tmp.path().to_path_buf()],
            target_workdir: "test".into(),
            listen: None,
            board_listen: None,
            urd: None,
            result_directory: None,
            input_directory: None,
            project_directory: tmp.path().to_path_buf(),
        };
        registry.discover(&config).unwrap();
        let workdir = Workdir::open("test", tmp.path().join("wd"), 3).unwrap();
        let mut workdirs = WorkdirSet::default();
        workdirs.insert("test", tmp.path().join("wd"));
        Fixture {
            _tmp: tmp,
            registry,
            db: JobDatabase::new(),
            workdir,
            workdirs,
            config,
        }
    }

    fn request(options: &[(&str, &str)]) -> SubmitRequest {
        let mut map = serde_json::Map::new();
        for (k, v) in options {
            map.insert(k.to_string(), serde_json::json!(v));
        }
        SubmitRequest {
            method: "demo".into(),
            options: map,
            ..Default::default()
        }
    }

    #[test]
    fn first_submission_builds_and_writes_setup() {
        let f = fixture();
        let req = request(&[("foo", "foo"), ("a", "a")]);
        match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req).unwrap() {
            ResolveOutcome::Build { job, setup } => {
                assert_eq!(job.id, JobId::new("test", 0));
                assert!(job.has_setup());
                assert!(job.filename("method.tar.gz").is_file());
                assert_eq!(setup.slices, 3);
                assert_eq!(setup.hash, f.registry.get("demo").unwrap().hash);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn unknown_option_is_rejected_before_allocation() {
        let f = fixture();
        let req = request(&[("nope", "x")]);
        assert!(matches!(
            resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req),
            Err(KilnError::BadOption(_))
        ));
        // nothing was allocated
        assert!(f.workdir.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn force_build_skips_reuse() {
        let mut f = fixture();
        let req = request(&[("foo", "x"), ("a", "y")]);
        let built = match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req)
            .unwrap()
        {
            ResolveOutcome::Build { job, setup } => {
                // simulate a completed job so the database sees it
                setupfile::save_post(
                    &job,
                    &crate::setupfile::Post {
                        version: crate::setupfile::POST_VERSION,
                        starttime: 1.0,
                        endtime: 2.0,
                        exectime: Default::default(),
                        files: vec![],
                        subjobs: Default::default(),
                    },
                )
                .unwrap();
                let mut setup = setup;
                setup.starttime = Some(1.0);
                setup.exectime = Some(Default::default());
                setupfile::save_setup(&job, &setup).unwrap();
                job.id
            }
            _ => panic!("expected build"),
        };
        f.db.update_begin();
        f.db.refresh_workdir(&f.workdir).unwrap();
        f.db.update_finish(&f.registry);

        // same options: reuse
        match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req).unwrap() {
            ResolveOutcome::Reuse(link) => {
                assert_eq!(link.link, built);
                assert!(!link.make);
            }
            _ => panic!("expected reuse"),
        }
        // force_build: a new id
        let mut req = request(&[("foo", "x"), ("a", "y")]);
        req.force_build = true;
        match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req).unwrap() {
            ResolveOutcome::Build { job, .. } => assert_ne!(job.id, built),
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn why_build_reports_option_diffs() {
        let mut f = fixture();
        let req = request(&[("foo", "old"), ("a", "same")]);
        match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req).unwrap() {
            ResolveOutcome::Build { job, setup } => {
                setupfile::save_post(
                    &job,
                    &crate::setupfile::Post {
                        version: crate::setupfile::POST_VERSION,
                        starttime: 1.0,
                        endtime: 2.0,
                        exectime: Default::default(),
                        files: vec![],
                        subjobs: Default::default(),
                    },
                )
                .unwrap();
                let mut setup = setup;
                setup.starttime = Some(1.0);
                setupfile::save_setup(&job, &setup).unwrap();
            }
            _ => panic!("expected build"),
        }
        f.db.update_begin();
        f.db.refresh_workdir(&f.workdir).unwrap();
        f.db.update_finish(&f.registry);

        let mut req = request(&[("foo", "new"), ("a", "same")]);
        req.why_build = true;
        match resolve(&f.registry, &f.db, &f.workdir, &f.workdirs, &f.config, &req).unwrap() {
            ResolveOutcome::WhyBuild(candidates) => {
                assert_eq!(candidates.len(), 1);
                let (_, diffs) = &candidates[0];
                assert!(diffs.iter().any(|(k, v)| {
                    k == "options-foo" && v == &serde_json::json!("old")
                }));
            }
            _ => panic!("expected why_build"),
        }
    }
}
