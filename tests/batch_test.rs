//! Batch Engine Integration Tests
//!
//! Partial failure, line independence, aggregation ordering and the JSONL
//! artifact, under both schedulers.

use std::fs;
use std::sync::Arc;

use flowline::batch::{BatchStatus, InputMapping, Status};
use flowline::config::{EngineConfig, SchedulerMode};
use flowline::event::EventKind;
use flowline::runtime::FlowPlan;
use flowline::tool::ToolRegistry;
use flowline::{BatchEngine, FlowError};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

// ═══════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════

const QA_FLOW: &str = r#"
name: qa
inputs:
  q: {}
  bad: { default: false }
  delay: { default: 0 }
outputs:
  answer: "${grade.output.text}"
  gathered: "${gather.output}"
  avg_tokens: "${tokens.output}"
nodes:
  - name: wait
    tool: sleep
    inputs: { ms: "${inputs.delay}", value: "${inputs.q}" }
  - name: check
    tool: fail
    inputs: { when: "${inputs.bad}", message: "bad row", value: "${wait.output}" }
  - name: grade
    tool: mock_llm
    inputs: { prompt: "${check.output}" }
  - name: gather
    tool: collect
    aggregation: true
    inputs: { items: "${grade.output.text}" }
  - name: tokens
    tool: mean
    aggregation: true
    inputs: { items: "${grade.output.usage.total_tokens}" }
"#;

fn engine(scheduler: SchedulerMode) -> BatchEngine {
    let plan = FlowPlan::from_yaml(QA_FLOW, &ToolRegistry::with_builtins()).unwrap();
    let config = EngineConfig {
        scheduler,
        line_concurrency: 3,
        ..EngineConfig::default()
    };
    BatchEngine::new(Arc::new(plan), config)
}

fn rows(values: Value) -> Vec<Map<String, Value>> {
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

fn read_jsonl(dir: &TempDir) -> Vec<Value> {
    fs::read_to_string(dir.path().join("output.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const SCHEDULERS: [SchedulerMode; 2] = [SchedulerMode::Sync, SchedulerMode::Async];

// ═══════════════════════════════════════════════════════════════
// PARTIAL FAILURE
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_one_failing_row_out_of_three() {
    for scheduler in SCHEDULERS {
        let dir = TempDir::new().unwrap();
        let result = engine(scheduler)
            .run(
                rows(json!([{"q": "a"}, {"q": "b", "bad": true}, {"q": "c"}])),
                None,
                Some(dir.path()),
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(result.total_lines, 3);
        assert_eq!(result.completed_lines, 2);
        assert_eq!(result.failed_lines, 1);
        assert_eq!(result.status, BatchStatus::PartiallyCompleted);
        assert_eq!(result.failed_line_numbers(), vec![1]);

        let summary = result.summary().unwrap();
        assert!(summary.starts_with("1/3 lines failed, indexes: [1]"), "{}", summary);
        assert!(summary.contains("bad row"));
        assert_eq!(result.error_summary.failed_user_error_lines, 1);
        assert_eq!(result.error_summary.error_list[0].line_number, 1);

        let records = read_jsonl(&dir);
        assert_eq!(records.len(), 2, "{:?}", scheduler);
        assert_eq!(records[0]["line_number"], json!(0));
        assert_eq!(records[0]["answer"], json!("echo: a"));
        assert_eq!(records[1]["line_number"], json!(2));
        assert!(records[0].get("gathered").is_none());
    }
}

#[tokio::test]
async fn test_raise_on_line_failure_aborts_batch() {
    let dir = TempDir::new().unwrap();
    let err = engine(SchedulerMode::Async)
        .run(
            rows(json!([{"q": "a", "delay": 200}, {"q": "b", "bad": true}, {"q": "c", "delay": 200}])),
            None,
            Some(dir.path()),
            None,
            true,
        )
        .await
        .unwrap_err();

    match err {
        FlowError::LineFailed { line, error } => {
            assert_eq!(line, 1);
            assert!(error.contains("bad row"));
        }
        other => panic!("expected LineFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_unmappable_row_fails_only_its_line() {
    let result = engine(SchedulerMode::Async)
        .run(
            rows(json!([{"q": "a"}, {"question": "no q column"}])),
            None,
            None,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(result.completed_lines, 1);
    let error = result.line_results[1].error().unwrap();
    assert_eq!(error.code, "FLOW-043");
}

// ═══════════════════════════════════════════════════════════════
// LINE INDEPENDENCE
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_lines_do_not_share_state() {
    for scheduler in SCHEDULERS {
        let input = json!([
            {"q": "l0", "delay": 30},
            {"q": "l1"},
            {"q": "l2", "bad": true},
            {"q": "l3", "delay": 10},
            {"q": "l4"}
        ]);
        let result = engine(scheduler)
            .run(rows(input), None, None, None, false)
            .await
            .unwrap();

        assert_eq!(result.line_results.len(), 5);
        for (i, line) in result.line_results.iter().enumerate() {
            assert_eq!(line.line_number, i);
            assert_eq!(line.run_info.line_number, Some(i));
            if i == 2 {
                assert_eq!(line.run_info.status, Status::Failed);
                assert_eq!(line.node_run_infos["check"].status, Status::Failed);
                assert!(line.output.is_empty());
            } else {
                assert_eq!(line.output["answer"], json!(format!("echo: l{}", i)));
                assert!(line.node_run_infos.values().all(|n| n.line_number == Some(i)));
                assert_eq!(line.node_run_infos.len(), 3);
            }
        }
        assert_eq!(result.node_status["grade"][&Status::Completed], 4);
        assert_eq!(result.node_status["check"][&Status::Failed], 1);
    }
}

#[tokio::test]
async fn test_timed_out_line_leaves_siblings_untouched() {
    for scheduler in SCHEDULERS {
        let plan = FlowPlan::from_yaml(QA_FLOW, &ToolRegistry::with_builtins()).unwrap();
        let config = EngineConfig {
            scheduler,
            line_concurrency: 3,
            line_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let engine = BatchEngine::new(Arc::new(plan), config);

        let result = engine
            .run(
                rows(json!([{"q": "a"}, {"q": "slow", "delay": 2500}, {"q": "c"}])),
                None,
                None,
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(result.completed_lines, 2, "{:?}", scheduler);
        assert_eq!(result.failed_line_numbers(), vec![1]);
        assert_eq!(result.line_results[1].error().unwrap().code, "FLOW-054");
        assert_eq!(result.line_results[0].output["answer"], json!("echo: a"));
        assert_eq!(result.line_results[2].output["answer"], json!("echo: c"));

        let aggr = result.aggr_results.unwrap();
        assert_eq!(aggr.output["gathered"], json!(["echo: a", "echo: c"]));
    }
}

// ═══════════════════════════════════════════════════════════════
// AGGREGATION
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_aggregation_receives_lines_in_index_order() {
    for scheduler in SCHEDULERS {
        // Later lines finish first
        let input = json!([
            {"q": "first", "delay": 60},
            {"q": "second", "delay": 30},
            {"q": "third"}
        ]);
        let result = engine(scheduler)
            .run(rows(input), None, None, None, false)
            .await
            .unwrap();

        let aggr = result.aggr_results.as_ref().unwrap();
        assert!(aggr.is_success());
        assert_eq!(
            aggr.output["gathered"],
            json!(["echo: first", "echo: second", "echo: third"]),
            "{:?}",
            scheduler
        );
        assert!(aggr.output["avg_tokens"].is_number());
        assert_eq!(aggr.node_run_infos["gather"].status, Status::Completed);
    }
}

#[tokio::test]
async fn test_aggregation_skips_failed_lines() {
    let result = engine(SchedulerMode::Sync)
        .run(
            rows(json!([{"q": "a"}, {"q": "b", "bad": true}, {"q": "c"}])),
            None,
            None,
            None,
            false,
        )
        .await
        .unwrap();
    let aggr = result.aggr_results.unwrap();
    assert_eq!(aggr.output["gathered"], json!(["echo: a", "echo: c"]));
}

// ═══════════════════════════════════════════════════════════════
// MAPPING, LIMITS, METRICS, EVENTS
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_mapping_and_max_lines() {
    let mapping = InputMapping::from_pairs(["q=${data.prompt.text}"]).unwrap();
    let engine = engine(SchedulerMode::Async);
    let result = engine
        .run(
            rows(json!([
                {"prompt": {"text": "one"}},
                {"prompt": {"text": "two"}},
                {"prompt": {"text": "three"}}
            ])),
            Some(&mapping),
            None,
            Some(2),
            false,
        )
        .await
        .unwrap();

    assert_eq!(result.total_lines, 2);
    let answers: Vec<&Value> = result.outputs().map(|(_, o)| &o["answer"]).collect();
    assert_eq!(answers, vec![&json!("echo: one"), &json!("echo: two")]);
    assert!(result.system_metrics.total_tokens > 0);

    let started = engine
        .events()
        .with_events(|events| {
            events
                .iter()
                .filter(|e| matches!(e.kind, EventKind::LineStarted { .. }))
                .count()
        });
    assert_eq!(started, 2);
    let events = engine.events().events();
    assert!(matches!(events.first().map(|e| &e.kind), Some(EventKind::BatchStarted { total_lines: 2, .. })));
    assert!(matches!(events.last().map(|e| &e.kind), Some(EventKind::BatchCompleted { completed_lines: 2, .. })));
}

#[tokio::test]
async fn test_canceled_batch_is_reported() {
    let engine = engine(SchedulerMode::Async);
    engine.cancel_token().cancel();
    let result = engine
        .run(rows(json!([{"q": "a"}, {"q": "b"}])), None, None, None, false)
        .await
        .unwrap();
    assert_eq!(result.status, BatchStatus::Canceled);
    assert!(result.aggr_results.is_none());
    assert!(result
        .line_results
        .iter()
        .all(|l| l.run_info.status == Status::Canceled));
}
