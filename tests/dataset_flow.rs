// tests/dataset_flow.rs
//
// Dataset engine end to end: hash partitioning through dataset_type
// (with bad-row diversion), and chain iteration with a range filter.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use kiln::core::{DatasetId, Value};
use kiln::dataset::codec::slice_for;
use kiln::dataset::iterate::{self, IterateOptions, RangeFilter, SliceSel};
use kiln::dataset::Dataset;

#[test]
fn typing_rehashes_and_diverts_bad_rows() {
    let slices = 3;
    let env = env_with(vec![(write_strings_spec(), Arc::new(WriteStrings))], slices);
    let values = ["a", "42", "137", "209", "3", "nope", "-17"];
    let req = request("test_write_strings", json!({ "values": values }));
    let (source_job, _) = submit_ok(&env.server, &req);

    // the source is hash partitioned on the *string* values
    let workdirs = env.server.workdir_set().clone();
    let source = Dataset::load(&workdirs, &DatasetId::new(source_job.clone(), "default")).unwrap();
    assert_eq!(source.lines_total(), values.len() as u64);
    assert_eq!(source.meta.hashlabel.as_deref(), Some("a"));

    // type column a to int32_10; unparseable rows go to "bad"
    let req = with_dataset(
        request(
            "dataset_type",
            json!({"column2type": {"a": "int32_10"}, "filter_bad": true}),
        ),
        "source",
        source.id.clone(),
    );
    let (typed_job, made) = submit_ok(&env.server, &req);
    assert!(made);

    // the typed output is a chain (one dataset per source slice); every
    // row must now hash into its slice by the *typed* value
    let tip = Dataset::load(&workdirs, &DatasetId::new(typed_job.clone(), "default")).unwrap();
    let chain = tip.chain(&workdirs, -1, None).unwrap();
    assert_eq!(chain.len(), slices);
    let mut typed_values = Vec::new();
    for ds in &chain {
        assert_eq!(ds.meta.hashlabel.as_deref(), Some("a"));
        assert_eq!(ds.meta.columns["a"].typ.name(), "int32");
        for sliceno in 0..slices {
            if let Some(reader) = ds.column_reader(&workdirs, "a", sliceno).unwrap() {
                for v in reader {
                    let v = v.unwrap();
                    assert_eq!(
                        slice_for(&v, slices),
                        sliceno,
                        "row {:?} in wrong slice",
                        v,
                    );
                    typed_values.push(v);
                }
            }
        }
    }
    let mut got: Vec<i64> = typed_values
        .iter()
        .map(|v| match v {
            Value::Int(i) => *i,
            other => panic!("expected int, got {:?}", other),
        })
        .collect();
    got.sort();
    assert_eq!(got, vec![-17, 3, 42, 137, 209]);

    // the bad dataset holds the original bytes of the failing rows
    let bad = Dataset::load(&workdirs, &DatasetId::new(typed_job, "bad")).unwrap();
    assert_eq!(bad.lines_total(), 2);
    let mut bad_rows = Vec::new();
    for sliceno in 0..slices {
        if let Some(reader) = bad.column_reader(&workdirs, "a", sliceno).unwrap() {
            for v in reader {
                match v.unwrap() {
                    Value::Bytes(b) => bad_rows.push(String::from_utf8(b).unwrap()),
                    other => panic!("expected bytes, got {:?}", other),
                }
            }
        }
    }
    bad_rows.sort();
    assert_eq!(bad_rows, vec!["a", "nope"]);
}

#[test]
fn chain_iteration_with_range() {
    let env = env_with(vec![(write_range_spec(), Arc::new(WriteRange))], 3);
    let req = request("test_write_range", json!({"start": 1, "stop": 100}));
    let (job_a, _) = submit_ok(&env.server, &req);
    let ds_a = DatasetId::new(job_a, "default");

    let req = with_dataset(
        request("test_write_range", json!({"start": 100, "stop": 1000})),
        "previous",
        ds_a.clone(),
    );
    let (job_b, _) = submit_ok(&env.server, &req);

    let workdirs = env.server.workdir_set().clone();
    let b = Dataset::load(&workdirs, &DatasetId::new(job_b, "default")).unwrap();

    // chain invariants
    let chain = b.chain(&workdirs, -1, None).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].id, ds_a);
    assert_eq!(chain[1].id, b.id);
    let short = b.chain(&workdirs, 1, None).unwrap();
    assert_eq!(short.len(), 1);
    assert_eq!(short[0].id, b.id);

    // range [50, 200): both datasets contribute; all of A's rows come
    // before B's, order preserved within each dataset's slices
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        range: Some(RangeFilter {
            column: "ix".into(),
            bottom: Some(Value::Int(50)),
            top: Some(Value::Int(200)),
            sloppy: false,
        }),
        ..Default::default()
    };
    let rows: Vec<i64> = iterate::iterate_list(&workdirs, SliceSel::All, &chain, opts)
        .unwrap()
        .map(|r| match r.unwrap().remove(0) {
            Value::Int(i) => i,
            other => panic!("expected int, got {:?}", other),
        })
        .collect();
    let mut sorted = rows.clone();
    sorted.sort();
    let expected: Vec<i64> = (50..200).collect();
    assert_eq!(sorted, expected);
    // A yields [50, 100), then B yields [100, 200)
    assert!(rows[..50].iter().all(|&v| v < 100));
    assert!(rows[50..].iter().all(|&v| v >= 100));

    // a dataset entirely outside the range is skipped by min/max alone
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        range: Some(RangeFilter {
            column: "ix".into(),
            bottom: Some(Value::Int(500)),
            top: None,
            sloppy: false,
        }),
        ..Default::default()
    };
    let n = iterate::iterate_list(&workdirs, SliceSel::All, &chain, opts)
        .unwrap()
        .count();
    assert_eq!(n, 500); // 500..1000
}

#[test]
fn hash_mismatch_fails_before_yielding() {
    let env = env_with(vec![(write_range_spec(), Arc::new(WriteRange))], 2);
    let req = request("test_write_range", json!({"start": 0, "stop": 10}));
    let (job, _) = submit_ok(&env.server, &req);
    let workdirs = env.server.workdir_set().clone();
    let ds = Dataset::load(&workdirs, &DatasetId::new(job, "default")).unwrap();
    // dataset has no hashlabel; asking for one without rehash fails
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        hashlabel: Some("ix".into()),
        rehash: false,
        ..Default::default()
    };
    let err = iterate::iterate_list(&workdirs, SliceSel::One(0), &[ds.clone()], opts);
    assert!(matches!(err, Err(kiln::KilnError::HashMismatch { .. })));

    // with rehash=true slice 0 only yields its own rows
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        hashlabel: Some("ix".into()),
        rehash: true,
        ..Default::default()
    };
    for row in iterate::iterate_list(&workdirs, SliceSel::One(0), &[ds], opts).unwrap() {
        let row = row.unwrap();
        assert_eq!(slice_for(&row[0], 2), 0);
    }
}

#[test]
fn translators_run_before_filters() {
    let env = env_with(vec![(write_range_spec(), Arc::new(WriteRange))], 2);
    let req = request("test_write_range", json!({"start": 0, "stop": 20}));
    let (job, _) = submit_ok(&env.server, &req);
    let workdirs = env.server.workdir_set().clone();
    let ds = Dataset::load(&workdirs, &DatasetId::new(job, "default")).unwrap();

    let mut translators: std::collections::BTreeMap<String, iterate::Translator> =
        Default::default();
    translators.insert(
        "ix".into(),
        Box::new(|v| match v {
            Value::Int(i) => Value::Int(i * 2),
            other => other,
        }),
    );
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        translators,
        // the filter sees translated values: keeps doubled ix >= 30
        filter: Some(iterate::RowFilter::Columns(vec![(
            "ix".into(),
            Box::new(|v| matches!(v, Value::Int(i) if *i >= 30)),
        )])),
        ..Default::default()
    };
    let mut rows: Vec<i64> = iterate::iterate_list(
        &workdirs,
        SliceSel::All,
        std::slice::from_ref(&ds),
        opts,
    )
    .unwrap()
    .map(|r| match r.unwrap().remove(0) {
        Value::Int(i) => i,
        other => panic!("expected int, got {:?}", other),
    })
    .collect();
    rows.sort();
    // source 15..=19 doubled
    assert_eq!(rows, vec![30, 32, 34, 36, 38]);
}

#[test]
fn window_limits_the_filtered_stream() {
    let env = env_with(vec![(write_range_spec(), Arc::new(WriteRange))], 2);
    let req = request("test_write_range", json!({"start": 0, "stop": 30}));
    let (job, _) = submit_ok(&env.server, &req);
    let workdirs = env.server.workdir_set().clone();
    let ds = Dataset::load(&workdirs, &DatasetId::new(job, "default")).unwrap();
    let opts = IterateOptions {
        columns: vec!["ix".into()],
        window: Some((5, Some(15), 1)),
        ..Default::default()
    };
    let rows: Vec<_> = iterate::iterate_list(
        &workdirs,
        SliceSel::RoundRobin,
        std::slice::from_ref(&ds),
        opts,
    )
    .unwrap()
    .collect();
    assert_eq!(rows.len(), 10);
}
