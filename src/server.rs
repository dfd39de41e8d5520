// src/server.rs
//
// =============================================================================
// KILN: SERVER FACADE
// =============================================================================
//
// The operations the HTTP front-end exposes, as a plain API: submit,
// status, abort, method/workdir listings, database refresh. Transport
// is someone else's problem; every response here is a serde type with
// the documented shape.
//
// Submits are serialised (one at a time); database updates are
// exclusive with queries through the RwLock. Racing identical submits
// from different clients are therefore resolved by ordering, never by
// coordination.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use log::{error, info};
use serde::Serialize;

use crate::config::Config;
use crate::core::{JobId, JobLink, SubmitRequest, SubmitResponse};
use crate::database::JobDatabase;
use crate::dataset::WorkdirSet;
use crate::error::{KilnError, Result};
use crate::launch::{self, LaunchParams};
use crate::logs::{StatusRegistry, StatusSnapshot};
use crate::methods::MethodRegistry;
use crate::resolver::{self, ResolveOutcome};
use crate::workdir::Workdir;

#[derive(Debug, Clone, Serialize)]
pub struct WorkdirInfo {
    pub name: String,
    pub path: PathBuf,
    pub slices: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkdirJobInfo {
    pub id: JobId,
    pub method: String,
    pub total_time: f64,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub package: String,
    pub description: String,
    pub hash: String,
    pub options: Vec<String>,
    pub datasets: Vec<String>,
    pub jobs: Vec<String>,
}

pub struct Server {
    config: Config,
    registry: RwLock<MethodRegistry>,
    db: RwLock<JobDatabase>,
    workdirs: BTreeMap<String, Workdir>,
    workdir_set: WorkdirSet,
    status: StatusRegistry,
    submit_lock: Mutex<()>,
}

impl Server {
    /// Boot: open all workdirs, discover methods, scan the database.
    pub fn new(config: Config, mut registry: MethodRegistry) -> Result<Server> {
        registry.discover(&config)?;
        let mut workdirs = BTreeMap::new();
        let mut workdir_set = WorkdirSet::default();
        for (name, path) in &config.workdirs {
            workdirs.insert(
                name.clone(),
                Workdir::open(name, path, config.slices)?,
            );
            workdir_set.insert(name, path.clone());
        }
        let server = Server {
            config,
            registry: RwLock::new(registry),
            db: RwLock::new(JobDatabase::new()),
            workdirs,
            workdir_set,
            status: StatusRegistry::new(),
            submit_lock: Mutex::new(()),
        };
        info!("scanning all workdirs...");
        server.update_database()?;
        Ok(server)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workdir_set(&self) -> &WorkdirSet {
        &self.workdir_set
    }

    pub fn status_registry(&self) -> &StatusRegistry {
        &self.status
    }

    /// Rescan every workdir; exclusive with queries.
    pub fn update_database(&self) -> Result<()> {
        let registry = self.registry.read().unwrap();
        let mut db = self.db.write().unwrap();
        db.update_begin();
        for wd in self.workdirs.values() {
            db.refresh_workdir(wd)?;
        }
        db.update_finish(&registry);
        Ok(())
    }

    /// Re-discover methods, then rescan (hashes may have changed).
    /// Returns the list of methods that failed to load, if any.
    pub fn update_methods(&self) -> Result<Vec<String>> {
        {
            let mut registry = self.registry.write().unwrap();
            registry.discover(&self.config)?;
        }
        self.update_database()?;
        Ok(self.registry.read().unwrap().failed().to_vec())
    }

    /// Resolve a submission, running the job if it has to be built.
    /// The response mirrors the documented submit surface.
    pub fn submit(&self, req: &SubmitRequest) -> SubmitResponse {
        let _serial = self.submit_lock.lock().unwrap();
        self.status.clear_abort();
        self.status.set_idle(false);
        let res = self.submit_inner(req);
        self.status.set_idle(true);
        match res {
            Ok(response) => response,
            Err(e) => {
                let msg = e.format_msg();
                error!("submit failed: {}", msg.lines().next().unwrap_or(""));
                self.status.set_last_error(Some(msg.clone()));
                SubmitResponse::Error(msg)
            }
        }
    }

    fn submit_inner(&self, req: &SubmitRequest) -> Result<SubmitResponse> {
        let workdir_name = req
            .workdir
            .clone()
            .unwrap_or_else(|| self.config.target_workdir.clone());
        let workdir = self
            .workdirs
            .get(&workdir_name)
            .ok_or_else(|| KilnError::NoSuchWorkdir(workdir_name.clone()))?;

        let registry = self.registry.read().unwrap();
        let outcome = {
            let db = self.db.read().unwrap();
            resolver::resolve(&registry, &db, workdir, &self.workdir_set, &self.config, req)?
        };
        match outcome {
            ResolveOutcome::Reuse(link) => {
                Ok(SubmitResponse::Jobs(vec![(req.method.clone(), link)]))
            }
            ResolveOutcome::WhyBuild(candidates) => Ok(SubmitResponse::WhyBuild(vec![(
                req.method.clone(),
                candidates,
            )])),
            ResolveOutcome::Build { job, setup } => {
                let method = registry.get(&req.method)?;
                let params = LaunchParams {
                    job: job.clone(),
                    setup,
                    spec: method.spec.clone(),
                    runtime: method.runtime.clone(),
                    workdirs: self.workdir_set.clone(),
                    concurrency: req.concurrency,
                    status: self.status.clone(),
                    input_directory: self.config.input_directory.clone(),
                };
                self.status.clear_tails();
                let post = launch::run_job(&params)?;
                // absorb the new job so the next submit can reuse it
                let mut db = self.db.write().unwrap();
                db.add_single_job(workdir, &job.id, &registry)?;
                Ok(SubmitResponse::Jobs(vec![(
                    req.method.clone(),
                    JobLink {
                        link: job.id,
                        make: true,
                        total_time: Some(post.exectime.total),
                    },
                )]))
            }
        }
    }

    pub fn status(&self, full: bool) -> StatusSnapshot {
        self.status.snapshot(full)
    }

    /// Kill whatever is running. Individual methods cannot observe
    /// this; they just die at the launcher's next scheduling point.
    pub fn abort(&self) -> bool {
        let idle = self.status.snapshot(false).idle;
        if !idle {
            self.status.request_abort();
        }
        !idle
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    pub fn list_workdirs(&self) -> Vec<WorkdirInfo> {
        self.workdirs
            .values()
            .map(|w| WorkdirInfo {
                name: w.name.clone(),
                path: w.path.clone(),
                slices: w.slices,
            })
            .collect()
    }

    pub fn workdir(&self, name: &str) -> Result<Vec<WorkdirJobInfo>> {
        if !self.workdirs.contains_key(name) {
            return Err(KilnError::NoSuchWorkdir(name.to_string()));
        }
        let db = self.db.read().unwrap();
        Ok(db
            .workdir_jobs(name)
            .map(|jobs| {
                jobs.iter()
                    .map(|(id, e)| WorkdirJobInfo {
                        id: id.clone(),
                        method: e.method.clone(),
                        total_time: e.total_time,
                        current: e.current,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn methods(&self) -> Vec<String> {
        self.registry.read().unwrap().names()
    }

    pub fn method_info(&self, name: &str) -> Result<MethodInfo> {
        let registry = self.registry.read().unwrap();
        let method = registry.get(name)?;
        Ok(MethodInfo {
            name: method.spec.name.clone(),
            package: method.spec.package.clone(),
            description: method.spec.description.clone(),
            hash: method.hash.clone(),
            options: method.spec.options.iter().map(|(n, _)| n.clone()).collect(),
            datasets: method.spec.datasets.iter().map(|i| i.name.clone()).collect(),
            jobs: method.spec.jobs.iter().map(|i| i.name.clone()).collect(),
        })
    }

    /// Resolve a method name to a job id: `offset` steps back from the
    /// newest (0 = newest), optionally through non-current jobs too.
    pub fn method2job(&self, method: &str, offset: usize, current: bool) -> Result<JobId> {
        let db = self.db.read().unwrap();
        db.method_jobs(method, current)
            .get(offset)
            .cloned()
            .ok_or_else(|| {
                KilnError::NoSuchJob(format!("{} (offset {})", method, offset))
            })
    }

    pub fn jobs_are_current(&self, ids: &[JobId]) -> Vec<bool> {
        let db = self.db.read().unwrap();
        ids.iter().map(|id| db.is_current(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MethodSpec, Outcome, PhaseMask};
    use crate::launch::{JobContext, MethodRuntime};
    use std::sync::Arc;

    struct Hello;

    impl MethodRuntime for Hello {
        fn synthesis(&self, ctx: &JobContext) -> crate::error::Result<Outcome> {
            ctx.say("hello from synthesis");
            Ok(Outcome::Continue(Some(serde_json::json!(42))))
        }
    }

    fn server() -> (tempfile::TempDir, Server) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a_hello.src"), "hello v1").unwrap();
        let mut registry = MethodRegistry::new();
        registry.provide(
            MethodSpec {
                name: "hello".into(),
                package: "pkg".into(),
                description: "test method".into(),
                options: vec![],
                datasets: vec![],
                jobs: vec![],
                phases: PhaseMask {
                    synthesis: true,
                    ..Default::default()
                },
            },
            Arc::new(Hello),
        );
        let config = Config {
            slices: 2,
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
        let server = Server::new(config, registry).unwrap();
        (tmp, server)
    }

    #[test]
    fn submit_builds_then_reuses() {
        let (_tmp, server) = server();
        let req = SubmitRequest {
            method: "hello".into(),
            ..Default::default()
        };
        match server.submit(&req) {
            SubmitResponse::Jobs(jobs) => {
                assert!(jobs[0].1.make);
                assert_eq!(jobs[0].1.link, JobId::new("test", 0));
            }
            other => panic!("unexpected response: {:?}", other),
        }
        match server.submit(&req) {
            SubmitResponse::Jobs(jobs) => {
                assert!(!jobs[0].1.make, "second submit must reuse");
                assert_eq!(jobs[0].1.link, JobId::new("test", 0));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn unknown_method_is_an_error_response() {
        let (_tmp, server) = server();
        let req = SubmitRequest {
            method: "nope".into(),
            ..Default::default()
        };
        assert!(matches!(server.submit(&req), SubmitResponse::Error(_)));
        assert!(server.last_error().is_some());
    }

    #[test]
    fn method_listing_and_info() {
        let (_tmp, server) = server();
        assert!(server.methods().contains(&"hello".to_string()));
        let info = server.method_info("hello").unwrap();
        assert_eq!(info.package, "pkg");
        assert!(!info.hash.is_empty());
    }

    #[test]
    fn jobs_are_current_reflects_database() {
        let (_tmp, server) = server();
        let req = SubmitRequest {
            method: "hello".into(),
            ..Default::default()
        };
        server.submit(&req);
        let known = JobId::new("test", 0);
        let unknown = JobId::new("test", 99);
        assert_eq!(
            server.jobs_are_current(&[known, unknown]),
            vec![true, false]
        );
    }
}
