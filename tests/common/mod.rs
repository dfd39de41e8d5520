// tests/common/mod.rs
//
// Shared fixture for the integration tests: a configured server with a
// few registered test methods, backed by a temporary workdir tree.
// Each test binary uses a different subset of this.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use kiln::core::{
    DatasetId, InputSpec, MethodSpec, OptionSpec, Outcome, PhaseMask, RefOrList, SubmitRequest,
    SubmitResponse, Value,
};
use kiln::dataset::write::WriterConfig;
use kiln::dataset::ColumnType;
use kiln::launch::{JobContext, MethodRuntime, SliceContext};
use kiln::methods::MethodRegistry;
use kiln::server::Server;
use kiln::Config;

pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub server: Server,
}

pub fn env_with(
    methods: Vec<(MethodSpec, Arc<dyn MethodRuntime>)>,
    slices: usize,
) -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let mut registry = MethodRegistry::new();
    for (spec, runtime) in methods {
        std::fs::write(
            tmp.path().join(format!("a_{}.src", spec.name)),
            format!("{} source", spec.name),
        )
        .unwrap();
        registry.provide(spec, runtime);
    }
    let config = Config {
        slices,
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
    TestEnv { tmp, server }
}

impl TestEnv {
    pub fn job_path(&self, id: &kiln::JobId) -> PathBuf {
        self.tmp.path().join("wd").join(id.to_string())
    }
}

/// Submit and expect a single job link back.
pub fn submit_ok(server: &Server, req: &SubmitRequest) -> (kiln::JobId, bool) {
    match server.submit(req) {
        SubmitResponse::Jobs(jobs) => (jobs[0].1.link.clone(), jobs[0].1.make),
        other => panic!("submit failed: {:?}", other),
    }
}

pub fn request(method: &str, options: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        method: method.into(),
        options: options.as_object().cloned().unwrap_or_default(),
        ..Default::default()
    }
}

pub fn with_dataset(mut req: SubmitRequest, name: &str, ds: DatasetId) -> SubmitRequest {
    req.datasets.push((name.into(), RefOrList::One(ds)));
    req
}

// ----------------------------------------------------------------------------
// Test methods
// ----------------------------------------------------------------------------

/// Synthesis-only method with two string options (reuse testing).
pub struct BuildKws;

impl MethodRuntime for BuildKws {
    fn synthesis(&self, ctx: &JobContext) -> kiln::Result<Outcome> {
        ctx.say("built");
        Ok(Outcome::done())
    }
}

pub fn build_kws_spec() -> MethodSpec {
    MethodSpec {
        name: "test_build_kws".into(),
        package: "test".into(),
        description: String::new(),
        options: vec![
            ("foo".into(), OptionSpec::Str { default: None }),
            ("a".into(), OptionSpec::Str { default: None }),
            ("b".into(), OptionSpec::Str { default: None }),
        ],
        datasets: vec![],
        jobs: vec![],
        phases: PhaseMask {
            synthesis: true,
            ..Default::default()
        },
    }
}

/// Analysis returns its sliceno, synthesis prints the sum.
pub struct SlicenoSum;

impl MethodRuntime for SlicenoSum {
    fn analysis(&self, sctx: &SliceContext) -> kiln::Result<Outcome> {
        Ok(Outcome::Continue(Some(json!(sctx.sliceno))))
    }

    fn synthesis(&self, ctx: &JobContext) -> kiln::Result<Outcome> {
        let sum: u64 = ctx
            .analysis_res()
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_u64())
            .sum();
        ctx.say(format!("Sum of all sliceno: {}", sum));
        Ok(Outcome::Continue(Some(json!(sum))))
    }
}

pub fn sliceno_sum_spec() -> MethodSpec {
    MethodSpec {
        name: "test_sliceno_sum".into(),
        package: "test".into(),
        description: String::new(),
        options: vec![],
        datasets: vec![],
        jobs: vec![],
        phases: PhaseMask {
            analysis: true,
            synthesis: true,
            ..Default::default()
        },
    }
}

/// Prepare finishes the job early with a result.
pub struct FinishEarly;

impl MethodRuntime for FinishEarly {
    fn prepare(&self, _ctx: &JobContext) -> kiln::Result<Outcome> {
        Ok(Outcome::FinishEarly(Some(json!(42))))
    }
}

pub fn finish_early_spec() -> MethodSpec {
    MethodSpec {
        name: "test_finish_early".into(),
        package: "test".into(),
        description: String::new(),
        options: vec![],
        datasets: vec![],
        jobs: vec![],
        phases: PhaseMask {
            prepare: true,
            analysis: true,
            synthesis: true,
        },
    }
}

/// Writes a hashed single-column unicode dataset from the "values"
/// option (split writer, so rows land in their hash slices).
pub struct WriteStrings;

impl MethodRuntime for WriteStrings {
    fn synthesis(&self, ctx: &JobContext) -> kiln::Result<Outcome> {
        let values = match ctx.option("values") {
            Value::List(vs) => vs,
            other => panic!("bad values option: {:?}", other),
        };
        ctx.create_writer(WriterConfig {
            name: "default".into(),
            columns: vec![("a".into(), ColumnType::Unicode, false)],
            hashlabel: Some("a".into()),
            ..Default::default()
        })?;
        let sw = ctx.split_writer("default")?;
        for v in values {
            sw.write(&[v])?;
        }
        Ok(Outcome::done())
    }
}

pub fn write_strings_spec() -> MethodSpec {
    MethodSpec {
        name: "test_write_strings".into(),
        package: "test".into(),
        description: String::new(),
        options: vec![(
            "values".into(),
            OptionSpec::List {
                elem: Box::new(OptionSpec::Str { default: None }),
            },
        )],
        datasets: vec![],
        jobs: vec![],
        phases: PhaseMask {
            synthesis: true,
            ..Default::default()
        },
    }
}

/// Writes ix = start..stop as an int64 column, chained on the optional
/// "previous" dataset input.
pub struct WriteRange;

impl MethodRuntime for WriteRange {
    fn synthesis(&self, ctx: &JobContext) -> kiln::Result<Outcome> {
        let (start, stop) = match (ctx.option("start"), ctx.option("stop")) {
            (Value::Int(a), Value::Int(b)) => (a, b),
            other => panic!("bad range options: {:?}", other),
        };
        let mut config = WriterConfig {
            name: "default".into(),
            columns: vec![("ix".into(), ColumnType::Int64, false)],
            ..Default::default()
        };
        if let Some(prev) = ctx.datasets.get("previous").and_then(|v| v.first()) {
            config.previous = Some(prev.id.clone());
        }
        ctx.create_writer(config)?;
        let sw = ctx.split_writer("default")?;
        for ix in start..stop {
            sw.write(&[Value::Int(ix)])?;
        }
        Ok(Outcome::done())
    }
}

pub fn write_range_spec() -> MethodSpec {
    MethodSpec {
        name: "test_write_range".into(),
        package: "test".into(),
        description: String::new(),
        options: vec![
            (
                "start".into(),
                OptionSpec::required(OptionSpec::Int { default: None }),
            ),
            (
                "stop".into(),
                OptionSpec::required(OptionSpec::Int { default: None }),
            ),
        ],
        datasets: vec![InputSpec::single("previous")],
        jobs: vec![],
        phases: PhaseMask {
            synthesis: true,
            ..Default::default()
        },
    }
}
