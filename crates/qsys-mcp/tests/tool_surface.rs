//! Tool calls end to end through the handler.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use qsys_mcp::engine::ControlValue;
use qsys_mcp::recorder::{RecordRequest, Recorder, StopReason, CSV_HEADER};
use qsys_mcp::{QsysHandler, ToolError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn call(h: &Harness, tool: &str, args: Value) -> Value {
    h.handler.dispatch(tool, args).await.unwrap()
}

async fn call_err(h: &Harness, tool: &str, args: Value) -> ToolError {
    h.handler.dispatch(tool, args).await.unwrap_err()
}

fn text_of(result: &rmcp::model::CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text())
        .map(|t| t.text.clone())
        .collect()
}

#[tokio::test]
async fn test_connect_tool() {
    let h = Harness::new();
    let info = call(&h, "qsys_connect", json!({"host": "core.local", "pollingInterval": 10})).await;

    assert_eq!(info["connected"], true);
    assert_eq!(info["componentsLoaded"], 4);
    assert_eq!(info["pollingInterval"], 34);
    assert!(info.get("alreadyConnected").is_none());

    let again = call(&h, "qsys_connect", json!({"host": "core.local", "pollingInterval": 10})).await;
    assert_eq!(again["alreadyConnected"], true);
}

#[tokio::test]
async fn test_connect_tool_falls_back_to_default_host() {
    let h = Harness::new();
    let info = call(&h, "qsys_connect", json!({})).await;
    assert_eq!(info["host"], "core.local");
}

#[tokio::test]
async fn test_connect_tool_filter_no_match() {
    let h = Harness::new();
    let err = call_err(&h, "qsys_connect", json!({"host": "core.local", "filter": "NoSuchThing"})).await;
    assert_eq!(err.code(), "FilterNoMatch");

    let status = call(&h, "qsys_status", json!({})).await;
    assert_eq!(status["connected"], false);
    assert_eq!(status["connectionState"], "disconnected");
}

#[tokio::test]
async fn test_status_never_connects() {
    let h = Harness::new();
    let status = call(&h, "qsys_status", json!({"detailed": true})).await;

    assert_eq!(status["connected"], false);
    assert_eq!(status["host"], Value::Null);
    assert_eq!(h.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_get_auto_connects_and_reads() {
    let h = Harness::new();
    let items = call(&h, "qsys_get", json!({"controls": ["Mixer.gain", "Mixer.input.1.gain"]})).await;

    assert_eq!(h.connector.connect_count(), 1);
    assert_eq!(items[0]["control"], "Mixer.gain");
    assert_eq!(items[0]["value"], json!(-10.0));
    assert_eq!(items[0]["string"], "-10.0");
    assert_eq!(items[0]["type"], "Float");
    assert_eq!(items[0]["direction"], "Read/Write");
    assert_eq!(items[0]["min"], json!(-60.0));
    assert_eq!(items[0]["choices"], Value::Null);
    assert_eq!(items[1]["value"], json!(-5.0));
}

#[tokio::test]
async fn test_get_unresolvable_path_reports_item() {
    let h = Harness::new();
    let items = call(&h, "qsys_get", json!({"controls": ["Mixer.gian", "Mixr.gain", "nodot", "Zone1.gain"]})).await;
    let items = items.as_array().unwrap();

    assert_eq!(items.len(), 4);
    assert_eq!(items[0]["code"], "NotFound");
    assert!(items[0].get("value").is_none());
    assert!(items[0]["alternatives"].as_array().unwrap().len() <= 5);

    assert_eq!(items[1]["code"], "NotFound");
    assert_eq!(items[1]["alternatives"][0], "Mixer");

    assert_eq!(items[2]["code"], "InvalidPath");
    assert_eq!(items[3]["value"], json!(-20.0));
}

#[tokio::test]
async fn test_get_batch_limits() {
    let h = Harness::new();
    let err = call_err(&h, "qsys_get", json!({"controls": []})).await;
    assert_eq!(err.code(), "InvalidArgument");

    let many: Vec<String> = (0..101).map(|i| format!("Mixer.c{}", i)).collect();
    let err = call_err(&h, "qsys_get", json!({"controls": many})).await;
    assert_eq!(err.code(), "InvalidArgument");
}

#[tokio::test]
async fn test_set_preserves_order_and_settles_each_item() {
    let h = Harness::new();
    let items = call(
        &h,
        "qsys_set",
        json!({"controls": [
            {"path": "Mixer.gain", "value": -6},
            {"path": "Mixer.gain", "value": -100},
            {"path": "Master.mute", "value": true},
            {"path": "Mixer.meter", "value": 0},
            {"path": "Mixer.mute", "value": "yes"},
            {"path": "Zone1.limit", "value": 75},
            {"path": "Matrix.recall", "value": 1},
            {"path": "Nope.x", "value": 1}
        ]}),
    )
    .await;
    let items = items.as_array().unwrap();

    let controls: Vec<&str> = items.iter().map(|i| i["control"].as_str().unwrap()).collect();
    assert_eq!(
        controls,
        vec![
            "Mixer.gain",
            "Mixer.gain",
            "Master.mute",
            "Mixer.meter",
            "Mixer.mute",
            "Zone1.limit",
            "Matrix.recall",
            "Nope.x"
        ]
    );

    assert_eq!(items[0]["confirmed"], true);
    assert_eq!(items[0]["value"], json!(-6.0));

    assert_eq!(items[1]["code"], "Validation");
    assert!(items[1]["error"].as_str().unwrap().contains("below minimum -60"));

    assert_eq!(items[2]["code"], "Protected");
    assert_eq!(items[3]["code"], "ReadOnly");
    assert_eq!(items[4]["code"], "Validation");

    assert_eq!(items[5]["code"], "WriteRejected");
    assert_eq!(items[5]["confirmed"], false);
    assert_eq!(items[5]["requested"], json!(75));
    assert_eq!(items[5]["actual"], json!(50.0));
    assert!(items[5]["suggestion"].is_string());

    assert_eq!(items[6]["confirmed"], true);
    assert_eq!(items[7]["code"], "NotFound");
}

#[tokio::test]
async fn test_set_validation_failure_never_writes() {
    let h = Harness::new();
    call(&h, "qsys_connect", json!({"host": "core.local"})).await;
    let engine = session(&h.connector);

    let items = call(&h, "qsys_set", json!({"controls": [{"path": "Mixer.mute", "value": 1}]})).await;
    assert_eq!(items[0]["code"], "Validation");
    assert_eq!(engine.write_count(), 0);

    let items = call(&h, "qsys_set", json!({"controls": [{"path": "Master.mute", "value": true}]})).await;
    assert_eq!(items[0]["code"], "Protected");
    assert_eq!(engine.write_count(), 0);
}

#[tokio::test]
async fn test_set_force_runs_validation_and_writes() {
    let h = Harness::new();

    let items = call(
        &h,
        "qsys_set",
        json!({"controls": [
            {"path": "Master.mute", "value": true, "force": true},
            {"path": "Master.gain", "value": "loud", "force": true},
            {"path": "zone1.POWER", "value": false}
        ]}),
    )
    .await;

    assert_eq!(items[0]["confirmed"], true);
    assert_eq!(items[1]["code"], "Validation");
    // Guards are case-insensitive but the path still has to resolve.
    assert_eq!(items[2]["code"], "NotFound");

    let check = call(&h, "qsys_get", json!({"controls": ["Master.mute"]})).await;
    assert_eq!(check[0]["value"], true);
}

#[tokio::test]
async fn test_set_string_choice() {
    let h = Harness::new();
    let items = call(
        &h,
        "qsys_set",
        json!({"controls": [
            {"path": "Mixer.mode", "value": "Manual"},
            {"path": "Mixer.mode", "value": "Turbo"}
        ]}),
    )
    .await;

    assert_eq!(items[0]["confirmed"], true);
    assert_eq!(items[0]["string"], "Manual");
    assert_eq!(items[1]["code"], "Validation");
}

#[tokio::test(start_paused = true)]
async fn test_discover_cache_serves_identical_payload_within_ttl() {
    let h = Harness::new();

    let first = call(&h, "qsys_discover", json!({"includeControls": true})).await;
    session(&h.connector)
        .emit_change("Mixer", "gain", ControlValue::Number(3.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = call(&h, "qsys_discover", json!({"includeControls": true})).await;

    assert_eq!(first, second);
    assert_eq!(h.handler.discovery().rebuild_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let third = call(&h, "qsys_discover", json!({"includeControls": true})).await;
    assert_ne!(first, third);
    assert_eq!(h.handler.discovery().rebuild_count(), 2);
}

#[tokio::test]
async fn test_discover_filter_and_control_stripping() {
    let h = Harness::new();

    let all = call(&h, "qsys_discover", json!({})).await;
    assert_eq!(all.as_array().unwrap().len(), 4);
    assert!(all[0].get("controls").is_none());
    assert_eq!(all[0]["controlCount"], 6);

    let zones = call(&h, "qsys_discover", json!({"component": "^zone", "includeControls": true})).await;
    assert_eq!(zones.as_array().unwrap().len(), 1);
    assert_eq!(zones[0]["name"], "Zone1");
    assert_eq!(zones[0]["controls"].as_array().unwrap().len(), 3);

    let err = call_err(&h, "qsys_discover", json!({"component": "["})).await;
    assert_eq!(err.code(), "InvalidArgument");
}

#[tokio::test]
async fn test_monitor_reads_drain_exactly_once() {
    let h = Harness::new();

    let started = call(
        &h,
        "qsys_monitor",
        json!({"action": "start", "id": "m1", "controls": ["Mixer.gain", "Nope.x"]}),
    )
    .await;
    assert_eq!(started["monitoring"], json!(["Mixer.gain"]));
    assert_eq!(started["skipped"], json!(["Nope.x"]));

    let engine = session(&h.connector);
    engine.emit_change("Mixer", "gain", ControlValue::Number(-3.0)).unwrap();
    engine.emit_change("Mixer", "mute", ControlValue::Bool(true)).unwrap();
    settle().await;

    let read = call(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(read["count"], 1);
    assert_eq!(read["events"][0]["path"], "Mixer.gain");
    assert_eq!(read["events"][0]["value"], json!(-3.0));
    assert_eq!(read["attached"], true);

    let again = call(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(again["count"], 0);

    let stopped = call(&h, "qsys_monitor", json!({"action": "stop", "id": "m1"})).await;
    assert_eq!(stopped["stopped"], true);

    let err = call_err(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(err.code(), "NotFound");
}

#[tokio::test]
async fn test_monitor_restart_same_id_detaches_old_listener() {
    let h = Harness::new();
    call(&h, "qsys_monitor", json!({"action": "start", "id": "m1", "controls": ["Mixer.gain"]})).await;
    let restarted = call(&h, "qsys_monitor", json!({"action": "start", "id": "m1", "controls": ["Mixer.mute"]})).await;
    assert_eq!(restarted["replaced"], true);

    let engine = session(&h.connector);
    engine.emit_change("Mixer", "gain", ControlValue::Number(-3.0)).unwrap();
    engine.emit_change("Mixer", "mute", ControlValue::Bool(true)).unwrap();
    settle().await;

    let read = call(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(read["count"], 1);
    assert_eq!(read["events"][0]["path"], "Mixer.mute");
}

#[tokio::test]
async fn test_monitor_buffer_caps_at_capacity() {
    let h = Harness::new();
    call(&h, "qsys_monitor", json!({"action": "start", "id": "m", "controls": ["Mixer.steps"]})).await;

    let engine = session(&h.connector);
    for i in 0..130 {
        engine
            .emit_change("Mixer", "steps", ControlValue::Number((i % 10) as f64))
            .unwrap();
    }
    settle().await;

    let read = call(&h, "qsys_monitor", json!({"action": "read", "id": "m"})).await;
    assert_eq!(read["count"], 100);
    assert_eq!(read["evicted"], 30);
}

#[tokio::test]
async fn test_monitor_unknown_id_lists_known() {
    let h = Harness::new();
    call(&h, "qsys_monitor", json!({"action": "start", "id": "a", "controls": ["Mixer.gain"]})).await;

    let err = call_err(&h, "qsys_monitor", json!({"action": "read", "id": "b"})).await;
    match err {
        ToolError::NotFound { alternatives, .. } => assert_eq!(alternatives, vec!["a".to_string()]),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_monitor_detaches_on_loss_and_reattaches() {
    let h = Harness::new();
    call(&h, "qsys_monitor", json!({"action": "start", "id": "m1", "controls": ["Mixer.gain"]})).await;

    session(&h.connector)
        .emit_change("Mixer", "gain", ControlValue::Number(1.0))
        .unwrap();
    settle().await;
    session(&h.connector).drop_session();
    settle().await;

    let read = call(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(read["attached"], false);
    assert_eq!(read["count"], 1);

    // Backoff reconnects after one second.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    session(&h.connector)
        .emit_change("Mixer", "gain", ControlValue::Number(2.0))
        .unwrap();
    settle().await;

    let read = call(&h, "qsys_monitor", json!({"action": "read", "id": "m1"})).await;
    assert_eq!(read["attached"], true);
    assert_eq!(read["count"], 1);
    assert_eq!(read["events"][0]["value"], json!(2.0));
}

#[tokio::test(start_paused = true)]
async fn test_record_with_unmatched_filter_completes_empty() {
    let h = Harness::new();
    call(&h, "qsys_connect", json!({"host": "core.local"})).await;

    let engine = session(&h.connector);
    let emitter = tokio::spawn(async move {
        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = engine.emit_change("Mixer", "gain", ControlValue::Number(i as f64));
        }
    });

    let summary = call(
        &h,
        "qsys_record_controls",
        json!({"duration": 1, "filter": "^NoSuchThing", "filename": "../../etc/empty"}),
    )
    .await;
    emitter.await.unwrap();

    assert_eq!(summary["eventsRecorded"], 0);
    assert_eq!(summary["reason"], "completed");
    assert_eq!(summary["autoStopped"], false);
    assert_eq!(summary["data"], CSV_HEADER);

    let file = summary["file"].as_str().unwrap();
    assert!(file.ends_with("empty.csv"));
    assert!(file.starts_with(h.dir.path().join("recordings").to_str().unwrap()));
    assert_eq!(std::fs::read_to_string(file).unwrap(), CSV_HEADER);
}

#[tokio::test(start_paused = true)]
async fn test_record_captures_matching_events() {
    let h = Harness::new();
    call(&h, "qsys_connect", json!({"host": "core.local"})).await;

    let engine = session(&h.connector);
    let emitter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.emit_change("Mixer", "gain", ControlValue::Number(-12.0)).unwrap();
        engine.emit_change("Zone1", "gain", ControlValue::Number(-30.0)).unwrap();
        engine.emit_change("Mixer", "mode", ControlValue::Text("Manual".into())).unwrap();
    });

    let summary = call(&h, "qsys_record_controls", json!({"duration": 1, "filter": "^mixer\\."})).await;
    emitter.await.unwrap();

    assert_eq!(summary["eventsRecorded"], 2);
    let data = summary["data"].as_str().unwrap();
    let rows: Vec<&str> = data.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains(",Mixer,gain,-12,\"-12.0\",0.6,,-60,20"));
    assert!(rows[1].contains(",Mixer,mode,Manual,\"Manual\",,,,"));
}

#[tokio::test(start_paused = true)]
async fn test_record_supersedes_previous_recording() {
    let h = Harness::new();
    call(&h, "qsys_connect", json!({"host": "core.local"})).await;

    let handler = h.handler.clone();
    let first = tokio::spawn(async move {
        handler
            .dispatch("qsys_record_controls", json!({"duration": 60, "filename": "first"}))
            .await
    });
    while !h.handler.recorder().is_recording().await {
        tokio::task::yield_now().await;
    }

    let second = call(&h, "qsys_record_controls", json!({"duration": 1, "filename": "second"})).await;
    let first = first.await.unwrap().unwrap();

    assert_eq!(first["reason"], "superseded");
    assert!(first["file"].as_str().unwrap().ends_with("first.csv"));
    assert_eq!(second["reason"], "completed");
    assert!(second["file"].as_str().unwrap().ends_with("second.csv"));
    assert!(!h.handler.recorder().is_recording().await);
}

#[tokio::test]
async fn test_record_duration_bounds() {
    let h = Harness::new();
    for duration in [0.5, 301.0] {
        let err = call_err(&h, "qsys_record_controls", json!({"duration": duration})).await;
        assert_eq!(err.code(), "InvalidArgument");
    }
    let err = call_err(&h, "qsys_record_controls", json!({"duration": 2, "filter": "("})).await;
    assert_eq!(err.code(), "InvalidArgument");
    assert_eq!(h.connector.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_record_stops_at_byte_cap_before_writing_row() {
    let dir = tempfile::tempdir().unwrap();
    let connector = connector();
    let manager = manager(&connector);
    let cap = CSV_HEADER.len() as u64 + 200;
    let recorder = Recorder::with_byte_cap(manager.clone(), dir.path(), cap);
    manager.add_observer(Arc::new(recorder.clone()));
    manager.connect(target()).await.unwrap();

    let task = {
        let recorder = recorder.clone();
        tokio::spawn(async move {
            recorder
                .record(RecordRequest {
                    duration_secs: 60.0,
                    filename: Some("capped".to_string()),
                    filter: None,
                })
                .await
        })
    };
    while !recorder.is_recording().await {
        tokio::task::yield_now().await;
    }

    let engine = session(&connector);
    for i in 0..50 {
        engine
            .emit_change("Mixer", "gain", ControlValue::Number(-(i as f64)))
            .unwrap();
    }

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.reason, StopReason::SizeLimit);
    assert!(summary.auto_stopped);
    assert!(summary.bytes <= cap);
    assert!(summary.events_recorded >= 1);
    assert!(summary.events_recorded < 50);
    assert_eq!(summary.data.len() as u64, summary.bytes);
    assert!(!recorder.is_recording().await);

    let on_disk = std::fs::read_to_string(dir.path().join("capped.csv")).unwrap();
    assert_eq!(on_disk, summary.data);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_halts_recording() {
    let h = Harness::new();
    call(&h, "qsys_connect", json!({"host": "core.local"})).await;

    let handler: QsysHandler = h.handler.clone();
    let task = tokio::spawn(async move {
        handler
            .dispatch("qsys_record_controls", json!({"duration": 120}))
            .await
    });
    while !h.handler.recorder().is_recording().await {
        tokio::task::yield_now().await;
    }

    session(&h.connector).drop_session();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary["reason"], "disconnected");
    assert!(summary["elapsedSeconds"].as_f64().unwrap() < 1.0);
}

#[tokio::test]
async fn test_unknown_tool_and_bad_arguments() {
    let h = Harness::new();

    let err = call_err(&h, "qsys_reboot", json!({})).await;
    assert_eq!(err.code(), "NotFound");

    let err = call_err(&h, "qsys_set", json!({"controls": [{"value": 1}]})).await;
    assert_eq!(err.code(), "InvalidArgument");
}

#[tokio::test]
async fn test_call_renders_error_envelope() {
    let h = Harness::new();
    let result = h.handler.call("qsys_monitor", json!({"action": "read", "id": "ghost"})).await;

    assert_eq!(result.is_error, Some(true));
    let body: Value = serde_json::from_str(&text_of(&result)).unwrap();
    assert_eq!(body["code"], "NotFound");
    assert!(body["error"].as_str().unwrap().contains("ghost"));
    assert!(body["suggestion"].is_string());
}

#[tokio::test]
async fn test_call_spills_oversized_response() {
    let h = Harness::with_threshold(512);
    let result = h.handler.call("qsys_discover", json!({"includeControls": true})).await;

    assert_ne!(result.is_error, Some(true));
    let body: Value = serde_json::from_str(&text_of(&result)).unwrap();
    assert_eq!(body["spilled"], true);
    assert_eq!(body["summary"]["length"], 4);

    let spilled: Value = serde_json::from_str(&std::fs::read_to_string(body["file"].as_str().unwrap()).unwrap()).unwrap();
    assert_eq!(spilled.as_array().unwrap().len(), 4);
    assert_eq!(h.handler.envelope().cleanup_all(), 1);
}
