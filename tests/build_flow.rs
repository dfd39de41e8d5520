// tests/build_flow.rs
//
// End-to-end submission flows: fingerprint reuse, parallel analysis
// with ordered phases, finish-early.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use kiln::core::SubmitResponse;

#[test]
fn identical_submissions_reuse_the_job() {
    let env = env_with(vec![(build_kws_spec(), Arc::new(BuildKws))], 3);
    let req = request("test_build_kws", json!({"foo": "foo", "a": "a"}));
    let (first, made) = submit_ok(&env.server, &req);
    assert!(made);
    let (second, made) = submit_ok(&env.server, &req);
    assert!(!made, "second submission must not rebuild");
    assert_eq!(first, second);

    // spelling out a defaulted option does not change the fingerprint
    let req = request(
        "test_build_kws",
        json!({"foo": "foo", "a": "a", "b": null}),
    );
    let (third, made) = submit_ok(&env.server, &req);
    assert!(!made);
    assert_eq!(first, third);

    // different options build a new job
    let req = request("test_build_kws", json!({"foo": "foo", "a": "other"}));
    let (fourth, made) = submit_ok(&env.server, &req);
    assert!(made);
    assert_ne!(first, fourth);
}

#[test]
fn force_build_makes_a_new_job() {
    let env = env_with(vec![(build_kws_spec(), Arc::new(BuildKws))], 2);
    let req = request("test_build_kws", json!({"foo": "x", "a": "y"}));
    let (first, _) = submit_ok(&env.server, &req);
    let mut req = request("test_build_kws", json!({"foo": "x", "a": "y"}));
    req.force_build = true;
    let (second, made) = submit_ok(&env.server, &req);
    assert!(made);
    assert_ne!(first, second);
}

#[test]
fn why_build_explains_the_difference() {
    let env = env_with(vec![(build_kws_spec(), Arc::new(BuildKws))], 2);
    let req = request("test_build_kws", json!({"foo": "old", "a": "same"}));
    submit_ok(&env.server, &req);
    let mut req = request("test_build_kws", json!({"foo": "new", "a": "same"}));
    req.why_build = true;
    match env.server.submit(&req) {
        SubmitResponse::WhyBuild(methods) => {
            let (_method, candidates) = &methods[0];
            assert!(!candidates.is_empty());
            let (_job, diffs) = &candidates[0];
            assert!(diffs
                .iter()
                .any(|(k, v)| k == "options-foo" && v == &json!("old")));
        }
        other => panic!("expected why_build, got {:?}", other),
    }
}

#[test]
fn parallel_analysis_sums_slicenos_in_synthesis() {
    let slices = 5;
    let env = env_with(vec![(sliceno_sum_spec(), Arc::new(SlicenoSum))], slices);
    let req = request("test_sliceno_sum", json!({}));
    let (job, made) = submit_ok(&env.server, &req);
    assert!(made);

    let expected = (slices * (slices - 1) / 2) as u64;
    let output =
        std::fs::read_to_string(env.job_path(&job).join("OUTPUT/synthesis")).unwrap();
    assert!(
        output.contains(&format!("Sum of all sliceno: {}", expected)),
        "synthesis output was: {:?}",
        output,
    );

    // per-slice capture files exist
    for sliceno in 0..slices {
        assert!(env
            .job_path(&job)
            .join("OUTPUT")
            .join(sliceno.to_string())
            .exists());
    }

    // post.json records per-slice times
    let post: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.job_path(&job).join("post.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        post["exectime"]["per_slice"].as_array().unwrap().len(),
        slices,
    );
}

#[test]
fn finish_early_in_prepare_skips_later_phases() {
    let env = env_with(vec![(finish_early_spec(), Arc::new(FinishEarly))], 3);
    let req = request("test_finish_early", json!({}));
    let (job, made) = submit_ok(&env.server, &req);
    assert!(made);

    let path = env.job_path(&job);
    assert!(path.join("post.json").exists());
    let post: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path.join("post.json")).unwrap()).unwrap();
    assert_eq!(post["exectime"]["analysis"], json!(0.0));
    assert_eq!(post["exectime"]["synthesis"], json!(0.0));
    let result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path.join("result.json")).unwrap())
            .unwrap();
    assert_eq!(result, json!(42));

    // finishing early is still a success: the job is reusable
    let (again, made) = submit_ok(&env.server, &req);
    assert!(!made);
    assert_eq!(again, job);
}

#[test]
fn method_source_is_packaged_with_the_job() {
    let env = env_with(vec![(build_kws_spec(), Arc::new(BuildKws))], 2);
    let req = request("test_build_kws", json!({"foo": "f", "a": "a"}));
    let (job, _) = submit_ok(&env.server, &req);
    assert!(env.job_path(&job).join("method.tar.gz").exists());
    // the recorded hash matches the loaded method
    let setup: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.job_path(&job).join("setup.json")).unwrap(),
    )
    .unwrap();
    let info = env.server.method_info("test_build_kws").unwrap();
    assert_eq!(setup["hash"].as_str().unwrap(), info.hash);
}
