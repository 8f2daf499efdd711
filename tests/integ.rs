use std::path::Path;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tempfile::tempdir;

use jobflow::context::{BasicEvaluator, RecordingSubmitter};
use jobflow::{App, Args, Config, Context, Settings, Workflow};
use store::{Error as StoreError, StoreFormat, WorkflowDoc};
use workflow::{
    EarIdx, EarStatus, ElementIdx, ElementPropagation, Error as WorkflowError, InsertId, ParamId,
    ParamRef, TaskTemplate, WorkflowTemplate,
};

fn template(value: Value) -> Result<WorkflowTemplate> {
    Ok(serde_json::from_value(value)?)
}

/// t1 turns each p1 into p2; t2 turns each p2 into p3.
fn two_task_template() -> Result<WorkflowTemplate> {
    template(json!({
        "name": "w1",
        "tasks": [
            {
                "schemas": [{
                    "objective": "t1",
                    "inputs": [{"parameter": "p1"}],
                    "outputs": [{"parameter": "p2"}],
                    "actions": [{"commands": [{"command": "doit <<parameter:p1>>", "stdout": "<<parameter:p2>>"}]}]
                }],
                "element_sets": [{
                    "sequences": [{"path": "inputs.p1", "values": [1, 2, 3], "nesting_order": 0}]
                }]
            },
            {
                "schemas": [{
                    "objective": "t2",
                    "inputs": [{"parameter": "p2"}],
                    "outputs": [{"parameter": "p3"}],
                    "actions": [{"commands": [{"command": "doit <<parameter:p2>>", "stdout": "<<parameter:p3>>"}]}]
                }],
                "element_sets": [{"resources": [{"scope": "any", "num_cores": 2}]}]
            }
        ]
    }))
}

fn task(value: Value) -> Result<TaskTemplate> {
    Ok(serde_json::from_value(value)?)
}

fn ctx_for(format: StoreFormat) -> Context {
    let config = Config {
        store_format: format,
        chunk_size: 2,
        ..Default::default()
    };
    Context::new(config, Box::new(BasicEvaluator))
}

/// Counts that must not change when a batch fails.
fn counts(doc: &WorkflowDoc) -> (usize, usize, Vec<(usize, usize, usize)>) {
    let per_task = doc
        .tasks
        .iter()
        .map(|t| (t.elements.len(), t.iterations.len(), t.runs.len()))
        .collect();
    (doc.template.tasks.len(), doc.parameters.len(), per_task)
}

fn output_param(wf: &Workflow, task: InsertId, element: usize, key: &str) -> ParamId {
    let records = wf.doc().records(task).unwrap();
    let iter = records.elements.as_slice()[element].iterations[0];
    match &records.iterations.get(iter).data_idx[key] {
        ParamRef::One(id) => *id,
        other => panic!("expected a single parameter, got {other:?}"),
    }
}

#[test]
fn elements_follow_nesting_orders() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [{
            "schemas": [{"objective": "t1", "inputs": [{"parameter": "p1"}, {"parameter": "p2"}, {"parameter": "p3"}]}],
            "element_sets": [{
                "inputs": [{"parameter": "p3", "value": "fixed"}],
                "sequences": [
                    {"path": "inputs.p1", "values": [1, 2], "nesting_order": 0},
                    {"path": "inputs.p2", "values": ["a", "b", "c"], "nesting_order": 1}
                ]
            }]
        }]
    }))?;
    let wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let t1 = wf.task_by_name("t1").unwrap();
    let elements = &wf.doc().records(t1)?.elements;
    assert_eq!(elements.len(), 6);

    let order: Vec<(usize, usize)> = elements
        .iter()
        .map(|e| (e.seq_idx["inputs.p1"], e.seq_idx["inputs.p2"]))
        .collect();
    assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    // single values are not sequences:
    assert!(!elements.iter().any(|e| e.seq_idx.contains_key("inputs.p3")));
    Ok(())
}

#[test]
fn inputs_are_sourced_from_upstream_outputs() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let wf = Workflow::create(&ctx, &two_task_template()?, &dir.path().join("wf"), false)?;
    let (t1, t2) = (wf.task_by_name("t1").unwrap(), wf.task_by_name("t2").unwrap());
    assert_eq!(wf.doc().records(t2)?.elements.len(), 3);

    for e in 0..3 {
        let upstream = output_param(&wf, t1, e, "outputs.p2");
        assert_eq!(output_param(&wf, t2, e, "inputs.p2"), upstream);
        assert_eq!(wf.parameter_value(upstream)?, None);
    }
    let views = wf.get_elements_from_ids(&[workflow::ElementId {
        task_insert_id: t2,
        element_idx: ElementIdx::new(1),
    }])?;
    assert_eq!(views[0].input_sources["p2"].to_string(), "task.0.output");
    Ok(())
}

#[test]
fn validation_errors_leave_workflow_unchanged() -> Result<()> {
    for format in [StoreFormat::Json, StoreFormat::Chunked] {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let ctx = ctx_for(format);
        let mut wf = Workflow::create(&ctx, &two_task_template()?, &path, false)?;
        let before = counts(wf.doc());

        let missing = task(json!({"schemas": [{"objective": "t3", "inputs": [{"parameter": "q"}]}]}))?;
        let err = wf.add_task(missing, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MissingInputs { .. })
        ));

        let unexpected = task(json!({
            "schemas": [{"objective": "t3", "inputs": [{"parameter": "p2"}]}],
            "element_sets": [{"inputs": [{"parameter": "nope", "value": 1}]}]
        }))?;
        assert!(wf.add_task(unexpected, None).is_err());

        let not_upstream = task(json!({
            "schemas": [{"objective": "t0", "inputs": [{"parameter": "p2"}]}],
            "element_sets": [{"input_sources": {"p2": [{"type": "task", "task": 1}]}}]
        }))?;
        let err = wf.add_task(not_upstream, Some(0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::InvalidInputSource { .. })
        ));

        assert_eq!(counts(wf.doc()), before);
        assert_eq!(counts(Workflow::open(&ctx, &path)?.doc()), before);
    }
    Ok(())
}

#[test]
fn failed_batch_discards_everything() -> Result<()> {
    for format in [StoreFormat::Json, StoreFormat::Chunked] {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let ctx = ctx_for(format);
        let mut wf = Workflow::create(&ctx, &two_task_template()?, &path, false)?;
        let before = counts(wf.doc());

        let extra = task(json!({
            "schemas": [{"objective": "t3", "inputs": [{"parameter": "p3"}]}]
        }))?;
        let err = wf
            .batch_update(|wf| -> Result<()> {
                wf.add_task(extra, None)?;
                assert_eq!(wf.doc().template.tasks.len(), 3);
                anyhow::bail!("something went wrong")
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("pending changes discarded"));
        assert_eq!(counts(wf.doc()), before);
        assert!(wf.task_by_name("t3").is_none());

        let reopened = Workflow::open(&ctx, &path)?;
        assert_eq!(counts(reopened.doc()), before);
    }
    Ok(())
}

#[test]
fn failed_creation_removes_directory() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("wf");
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [{"schemas": [{"objective": "t1", "inputs": [{"parameter": "p1"}]}]}]
    }))?;
    assert!(Workflow::create(&ctx, &tmpl, &path, false).is_err());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn conditions_on_unset_parameters_defer_ears() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let mut tmpl = two_task_template()?;
    tmpl.tasks[1].schemas[0].actions[0].rules = serde_json::from_value(json!([
        {"condition": {"path": "inputs.p2", "predicate": {"greater_than": 5.0}}}
    ]))?;
    let mut wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let (t1, t2) = (wf.task_by_name("t1").unwrap(), wf.task_by_name("t2").unwrap());

    assert_eq!(wf.ear_ids(t1)?.len(), 3);
    assert!(wf.ear_ids(t2)?.is_empty());
    assert!(wf.doc().records(t2)?.iterations.iter().all(|it| !it.ears_initialised));

    // nothing new to evaluate; repeated passes add nothing:
    assert_eq!(wf.initialise_ears()?, 0);
    assert_eq!(wf.initialise_ears()?, 0);
    assert_eq!(wf.ear_ids(t1)?.len(), 3);

    wf.set_parameter(output_param(&wf, t1, 0, "outputs.p2"), json!(10))?;
    wf.set_parameter(output_param(&wf, t1, 1, "outputs.p2"), json!(1))?;

    let iterations = &wf.doc().records(t2)?.iterations;
    let state: Vec<(bool, usize)> = iterations
        .iter()
        .map(|it| (it.ears_initialised, it.actions.len()))
        .collect();
    assert_eq!(state, vec![(true, 1), (true, 0), (false, 0)]);
    assert_eq!(wf.ear_ids(t2)?.len(), 1);

    assert_eq!(wf.initialise_ears()?, 0);
    assert_eq!(wf.ear_ids(t2)?.len(), 1);
    Ok(())
}

#[test]
fn parameters_are_assigned_once() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let mut wf = Workflow::create(&ctx, &two_task_template()?, &dir.path().join("wf"), false)?;
    let t1 = wf.task_by_name("t1").unwrap();

    let local = output_param(&wf, t1, 0, "inputs.p1");
    assert_eq!(wf.parameter_value(local)?, Some(&json!(1)));
    let err = wf.set_parameter(local, json!(7)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::ParameterAlreadySet(_))
    ));

    let out = output_param(&wf, t1, 0, "outputs.p2");
    wf.set_parameter(out, json!("first"))?;
    assert!(wf.set_parameter(out, json!("second")).is_err());
    assert_eq!(wf.parameter_value(out)?, Some(&json!("first")));
    Ok(())
}

#[test]
fn concurrent_modification_is_detected() -> Result<()> {
    for format in [StoreFormat::Json, StoreFormat::Chunked] {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let ctx = ctx_for(format);
        Workflow::create(&ctx, &two_task_template()?, &path, false)?;

        let mut a = Workflow::open(&ctx, &path)?;
        let mut b = Workflow::open(&ctx, &path)?;
        let extra = || task(json!({"schemas": [{"objective": "t3", "inputs": [{"parameter": "p3"}]}]}));

        a.add_task(extra()?, None)?;
        let err = b.add_task(extra()?, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::WorkflowBatchUpdateFailed(_))
        ));
        assert_eq!(b.doc().template.tasks.len(), 2);

        b.reload()?;
        assert_eq!(b.doc().template.tasks.len(), 3);
    }
    Ok(())
}

#[test]
fn jobscripts_are_resource_homogeneous() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let wf = Workflow::create(&ctx, &two_task_template()?, &dir.path().join("wf"), false)?;

    let jobscripts = wf.resolve_jobscripts()?;
    assert_eq!(jobscripts.len(), 2);
    let total: usize = jobscripts.iter().map(|js| js.cells().count()).sum();
    assert_eq!(total, 6);

    for (i, js) in jobscripts.iter().enumerate() {
        for (row, _, ear) in js.cells() {
            let task = js.task_actions[row].task_insert_id;
            assert_eq!(wf.ear(task, ear)?.resources, js.resources);
        }
        assert!(js.dependencies.keys().all(|&dep| dep < i));
    }
    let dep = &jobscripts[1].dependencies[&0];
    assert!(dep.is_array);
    assert_eq!(dep.js_element_mapping.len(), 3);

    // resolving claims nothing:
    assert!(wf.doc().submissions.is_empty());
    Ok(())
}

#[test]
fn submission_lifecycle() -> Result<()> {
    for format in [StoreFormat::Json, StoreFormat::Chunked] {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let ctx = ctx_for(format);
        let mut wf = Workflow::create(&ctx, &two_task_template()?, &path, false)?;
        let t1 = wf.task_by_name("t1").unwrap();

        let mut submitter = RecordingSubmitter::default();
        let err = wf.submit(&mut submitter).unwrap_err();
        assert!(err.to_string().contains("No prepared submissions"));

        assert_eq!(wf.add_submission()?, Some(0));
        assert_eq!(wf.ear_status(t1, EarIdx::new(0))?, EarStatus::Prepared);
        // every EAR is claimed, so there is nothing left to prepare:
        assert_eq!(wf.add_submission()?, None);

        assert_eq!(wf.submit(&mut submitter)?, vec![0]);
        let refs: Vec<(&str, Vec<String>)> = submitter
            .submitted
            .iter()
            .map(|s| (s.job_ref.as_str(), s.dependencies.clone()))
            .collect();
        assert_eq!(refs, vec![("job-0", vec![]), ("job-1", vec!["job-0".to_owned()])]);
        assert_eq!(wf.ear_status(t1, EarIdx::new(0))?, EarStatus::Submitted);
        assert!(wf.doc().submissions[0].is_dispatched());

        // a running job reports back through a separate handle:
        let mut job = Workflow::open(&ctx, &path)?;
        let id = job.set_ear_start(0, 0, 0, 0)?;
        assert_eq!((id.task_insert_id, usize::from(id.element_idx)), (t1, 0));
        let saved = job.save_parameter("p2", json!(10), 0, 0, 0, 0)?;
        job.set_ear_end(0, 0, 0, 0)?;
        assert!(job.save_parameter("nope", json!(1), 0, 0, 0, 0).is_err());
        assert!(job.set_ear_start(0, 0, 7, 0).is_err());

        wf.reload()?;
        assert_eq!(wf.ear_status(t1, id.ear_idx)?, EarStatus::Complete);
        assert_eq!(wf.parameter_value(saved)?, Some(&json!(10)));
        let ears = wf.get_ears_from_ids(&[id])?;
        assert!(ears[0].start_time.is_some() && ears[0].end_time.is_some());
        assert_eq!(ears[0].submission_idx, Some(0));
        assert!(wf.submit(&mut submitter).is_err());
    }
    Ok(())
}

#[test]
fn new_elements_propagate_downstream() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let mut wf = Workflow::create(&ctx, &two_task_template()?, &dir.path().join("wf"), false)?;
    let (t1, t2) = (wf.task_by_name("t1").unwrap(), wf.task_by_name("t2").unwrap());

    let set = serde_json::from_value(json!({
        "sequences": [{"path": "inputs.p1", "values": [4, 5], "nesting_order": 0}]
    }))?;
    let propagate: Vec<ElementPropagation> = serde_json::from_value(json!([{"task": 1}]))?;
    let added = wf.add_elements(t1, set, &propagate)?;
    assert_eq!(added.len(), 2);
    assert_eq!(wf.doc().records(t1)?.elements.len(), 5);
    assert_eq!(wf.doc().records(t2)?.elements.len(), 5);
    assert_eq!(output_param(&wf, t2, 3, "inputs.p2"), output_param(&wf, t1, 3, "outputs.p2"));
    assert_eq!(wf.ear_ids(t2)?.len(), 5);

    // propagation only flows downstream:
    let set = serde_json::from_value(json!({}))?;
    let upstream: Vec<ElementPropagation> = serde_json::from_value(json!([{"task": 0}]))?;
    assert!(wf.add_elements(t2, set, &upstream).is_err());
    assert_eq!(wf.doc().records(t2)?.elements.len(), 5);
    Ok(())
}

#[test]
fn loops_iterate_outputs_into_inputs() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [{
            "schemas": [{
                "objective": "t1",
                "inputs": [{"parameter": "p1"}],
                "outputs": [{"parameter": "p1"}],
                "actions": [{"commands": [{"command": "step <<parameter:p1>>", "stdout": "<<parameter:p1>>"}]}]
            }],
            "element_sets": [{"sequences": [{"path": "inputs.p1", "values": [1, 2], "nesting_order": 0}]}]
        }],
        "loops": [{"name": "outer", "tasks": [0], "num_iterations": 3}]
    }))?;
    let mut wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let t1 = wf.task_by_name("t1").unwrap();

    let lp = &wf.doc().loops[0];
    assert_eq!(lp.num_added_iterations, 3);
    assert!(lp.iterable_parameters.contains_key("p1"));

    let records = wf.doc().records(t1)?;
    assert_eq!(records.iterations.len(), 6);
    let first = &records.elements.as_slice()[0];
    assert_eq!(first.iterations.len(), 3);
    for pass in 1..3 {
        let prev = records.iterations.get(first.iterations[pass - 1]);
        let this = records.iterations.get(first.iterations[pass]);
        assert_eq!(this.data_idx["inputs.p1"], prev.data_idx["outputs.p1"]);
        assert_eq!(this.loop_idx["outer"], pass as u32);
    }
    assert_eq!(wf.ear_ids(t1)?.len(), 6);

    let jobscripts = wf.resolve_jobscripts()?;
    let total: usize = jobscripts.iter().map(|js| js.cells().count()).sum();
    assert_eq!(total, 6);
    for (i, js) in jobscripts.iter().enumerate() {
        assert!(js.dependencies.keys().all(|&dep| dep < i));
    }

    assert_eq!(wf.add_iteration("outer")?, 3);
    assert_eq!(wf.doc().records(t1)?.iterations.len(), 8);
    assert!(wf.add_iteration("inner").is_err());
    let again = serde_json::from_value(json!({"name": "outer", "tasks": [0], "num_iterations": 2}))?;
    assert!(wf.add_loop(again).is_err());
    Ok(())
}

#[test]
fn sub_parameters_overlay_their_parent() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [{
            "schemas": [{
                "objective": "t1",
                "inputs": [{"parameter": "p1"}],
                "actions": [
                    {
                        "rules": [{"condition": {"path": "inputs.p1.a", "predicate": {"equal": 2}}}],
                        "commands": [{"command": "run <<parameter:p1.a>>"}]
                    },
                    {
                        "rules": [{"check_missing": "inputs.p1.c"}, {"check_exists": "inputs.p1.b"}],
                        "commands": [{"command": "other <<parameter:p1>>"}]
                    }
                ]
            }],
            "element_sets": [{
                "inputs": [{"parameter": "p1", "value": {"a": 0, "b": "x"}}],
                "sequences": [{"path": "inputs.p1.a", "values": [1, 2, 3], "nesting_order": 0}]
            }]
        }]
    }))?;
    let wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let t1 = wf.task_by_name("t1").unwrap();
    let records = wf.doc().records(t1)?;
    assert_eq!(records.elements.len(), 3);
    assert!(records.elements.iter().all(|e| e.seq_idx.contains_key("inputs.p1.a")));

    // only the element whose overlaid `a` is 2 runs the first action:
    let actions: Vec<usize> = records.iterations.iter().map(|it| it.actions.len()).collect();
    assert_eq!(actions, vec![1, 2, 1]);
    assert_eq!(wf.ear_ids(t1)?.len(), 4);

    // EARs reading `p1` carry its sub-parameters too:
    for run in records.runs.iter() {
        assert!(run.data_idx.contains_key("inputs.p1"));
        assert!(run.data_idx.contains_key("inputs.p1.a"));
    }

    let mut bad = tmpl.clone();
    bad.tasks[0].element_sets[0].sequences[0].path = "inputs.q.a".to_owned();
    let err = Workflow::create(&ctx, &bad, &dir.path().join("bad"), false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::TaskTemplateUnexpectedInput { .. })
    ));
    Ok(())
}

#[test]
fn grouped_inputs_follow_group_filters() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [
            {
                "schemas": [{"objective": "t1", "inputs": [{"parameter": "p1"}, {"parameter": "p3"}]}],
                "element_sets": [{
                    "sequences": [
                        {"path": "inputs.p1", "values": [1, 2, 3, 4], "nesting_order": 0},
                        {"path": "inputs.p3", "values": ["a", "b", "a", "b"], "nesting_order": 0}
                    ]
                }],
                "groups": [
                    {
                        "name": "big",
                        "where": [{"condition": {"path": "inputs.p1", "predicate": {"greater_than": 1.5}}}]
                    },
                    {"name": "parity", "group_by_distinct": "inputs.p3"}
                ]
            },
            {"schemas": [{"objective": "t2", "inputs": [{"parameter": "p1", "group": "big"}]}]},
            {"schemas": [{"objective": "t3", "inputs": [{"parameter": "p3", "group": "parity"}]}]}
        ]
    }))?;
    let wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let (t2, t3) = (wf.task_by_name("t2").unwrap(), wf.task_by_name("t3").unwrap());
    let elems = |task: InsertId| -> Result<Vec<Vec<usize>>> {
        Ok(wf
            .doc()
            .records(task)?
            .elements
            .iter()
            .map(|e| e.source_elements.values().flatten().map(|&i| usize::from(i)).collect())
            .collect())
    };

    assert_eq!(elems(t2)?, vec![vec![1, 2, 3]]);
    let records = wf.doc().records(t2)?;
    match &records.iterations.as_slice()[0].data_idx["inputs.p1"] {
        ParamRef::Many(ids) => assert_eq!(ids.len(), 3),
        other => panic!("expected a grouped reference, got {other:?}"),
    }

    assert_eq!(elems(t3)?, vec![vec![0, 2], vec![1, 3]]);
    Ok(())
}

#[test]
fn loops_rebind_propagated_elements_to_their_own_sources() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let tmpl = template(json!({
        "name": "w",
        "tasks": [
            {
                "schemas": [{"objective": "t1", "inputs": [{"parameter": "p1"}], "outputs": [{"parameter": "p2"}]}],
                "element_sets": [{"sequences": [{"path": "inputs.p1", "values": [1, 2, 3], "nesting_order": 0}]}]
            },
            {"schemas": [{"objective": "t2", "inputs": [{"parameter": "p2"}], "outputs": [{"parameter": "p1"}]}]}
        ]
    }))?;
    let mut wf = Workflow::create(&ctx, &tmpl, &dir.path().join("wf"), false)?;
    let (t1, t2) = (wf.task_by_name("t1").unwrap(), wf.task_by_name("t2").unwrap());

    let set = serde_json::from_value(json!({
        "sequences": [{"path": "inputs.p1", "values": [4, 5], "nesting_order": 0}]
    }))?;
    let propagate: Vec<ElementPropagation> = serde_json::from_value(json!([{"task": 1}]))?;
    wf.add_elements(t1, set, &propagate)?;
    let propagated = &wf.doc().records(t2)?.elements.as_slice()[4];
    assert_eq!(propagated.source_elements["inputs.p2"], vec![ElementIdx::new(4)]);

    let lp = serde_json::from_value(json!({"name": "l", "tasks": [0, 1], "num_iterations": 2}))?;
    wf.add_loop(lp)?;

    let doc = wf.doc();
    let (up, down) = (doc.records(t1)?, doc.records(t2)?);
    for e in 0..5 {
        let up_iter = up.iterations.get(up.elements.as_slice()[e].iterations[1]);
        let down_iter = down.iterations.get(down.elements.as_slice()[e].iterations[1]);
        assert_eq!(down_iter.loop_idx["l"], 1);
        assert_eq!(down_iter.data_idx["inputs.p2"], up_iter.data_idx["outputs.p2"]);
    }
    Ok(())
}

#[test]
fn loop_tasks_must_be_contiguous() -> Result<()> {
    let dir = tempdir()?;
    let ctx = Context::default();
    let mut wf = Workflow::create(&ctx, &two_task_template()?, &dir.path().join("wf"), false)?;
    wf.add_task(
        task(json!({"schemas": [{"objective": "t3", "inputs": [{"parameter": "p3"}]}]}))?,
        None,
    )?;
    let gap = serde_json::from_value(json!({"name": "l", "tasks": [0, 2], "num_iterations": 2}))?;
    let err = wf.add_loop(gap).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::LoopTasksNotContiguous(_))
    ));
    assert!(wf.doc().loops.is_empty());
    Ok(())
}

fn python_template(num_cores: u32) -> Result<WorkflowTemplate> {
    template(json!({
        "name": "w",
        "resources": [{"scope": "any", "num_cores": num_cores}],
        "tasks": [{
            "schemas": [{
                "objective": "t1",
                "inputs": [{"parameter": "p1", "default_value": 0}],
                "actions": [{
                    "commands": [{"command": "<<executable:python>> run.py <<parameter:p1>>"}],
                    "environments": ["py"]
                }]
            }]
        }]
    }))
}

#[test]
fn environments_must_provide_executables() -> Result<()> {
    let dir = tempdir()?;
    let bare = Context::default();
    let wf = Workflow::create(&bare, &python_template(1)?, &dir.path().join("a"), false)?;
    let err = wf.resolve_jobscripts().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::MissingEnvironment(_))
    ));

    let config: Config = serde_json::from_value(json!({
        "environments": [{
            "name": "py",
            "executables": [{
                "label": "python",
                "instances": [{"command": "python3", "num_cores": {"start": 1, "stop": 4}}]
            }]
        }]
    }))?;
    let ctx = Context::new(config, Box::new(BasicEvaluator));
    let wf = Workflow::create(&ctx, &python_template(2)?, &dir.path().join("b"), false)?;
    assert_eq!(wf.resolve_jobscripts()?.len(), 1);

    let wf = Workflow::create(&ctx, &python_template(8)?, &dir.path().join("c"), false)?;
    let err = wf.resolve_jobscripts().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::MissingEnvironmentExecutable { num_cores: 8, .. })
    ));
    Ok(())
}

fn run_app(args: &[&str]) -> Result<()> {
    let args = Args::parse_from(std::iter::once("jf").chain(args.iter().copied()));
    let settings: Settings = args.try_into()?;
    App::new(settings).run()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn app_runs_a_workflow_through_submission() -> Result<()> {
    simple_logging::log_to_stderr(log::LevelFilter::Debug);
    let dir = tempdir()?;
    let tmpl_path = dir.path().join("template.json");
    std::fs::write(&tmpl_path, serde_json::to_string(&two_task_template()?)?)?;
    let wf_path = dir.path().join("wf");
    let wf = path_str(&wf_path);

    run_app(&["-y", "make", path_str(&tmpl_path), "--path", wf, "--store", "chunked"])?;
    run_app(&["show", wf])?;
    run_app(&["jobscripts", wf])?;
    run_app(&["-y", "submit", wf])?;
    run_app(&["internal", wf, "ear-start", "0", "0", "1", "0"])?;
    run_app(&["internal", wf, "save-parameter", "p2", "{\"x\": 1}", "0", "0", "1", "0"])?;
    run_app(&["internal", wf, "ear-end", "0", "0", "1", "0"])?;
    run_app(&["init-ears", wf])?;
    run_app(&["prepare", wf])?;

    // make refuses to replace an existing workflow without --overwrite:
    assert!(run_app(&["make", path_str(&tmpl_path), "--path", wf]).is_err());

    let ctx = Context::default();
    let wf = Workflow::open(&ctx, &wf_path)?;
    assert_eq!(wf.name(), "w1");
    assert_eq!(wf.doc().submissions.len(), 1);
    assert!(wf.doc().submissions[0].is_dispatched());
    let t1 = wf.task_by_name("t1").unwrap();
    let saved = output_param(&wf, t1, 1, "outputs.p2");
    assert_eq!(wf.parameter_value(saved)?, Some(&json!({"x": 1})));
    Ok(())
}
