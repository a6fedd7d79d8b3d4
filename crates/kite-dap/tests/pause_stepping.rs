mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{attach, attach_with_transformers, call_frame, parse_script, paused_params, FakeSourceMap};
use kite_dap::dap::{SetBreakpointsArguments, SourceArgument, SourceBreakpoint};
use kite_dap::transform::Transformers;
use kite_dap::AttachConfig;
use kite_rdp::mock::MockRuntimeConfig;
use serde_json::json;

#[tokio::test]
async fn debugger_statement_is_the_fallback_reason() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf1",
            "main",
            "file:///app.js",
            "1",
            2,
        )]))
        .await;

    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "debugger_statement");
    assert_eq!(stopped["threadId"], 1);
}

#[tokio::test]
async fn exception_pauses_carry_the_first_description_line() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    let mut params = paused_params(vec![call_frame("cf1", "main", "file:///app.js", "1", 2)]);
    params["reason"] = json!("exception");
    params["data"] = json!({
        "type": "object",
        "className": "Error",
        "description": "Error: boom\n    at main (file:///app.js:3:1)",
        "objectId": "ex1",
    });
    fixture.mock.emit_paused(params).await;

    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "exception");
    assert_eq!(stopped["text"], "Error: boom");

    let info = fixture.adapter.exception_info(1).await.unwrap();
    assert_eq!(info["exceptionId"], "Error");
    assert_eq!(info["breakMode"], "unhandled");

    assert!(fixture.adapter.exception_info(2).await.is_err());
}

#[tokio::test]
async fn promise_rejection_is_its_own_stop_reason() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    let mut params = paused_params(vec![call_frame("cf1", "main", "file:///app.js", "1", 2)]);
    params["reason"] = json!("promiseRejection");
    params["data"] = json!({ "type": "object", "description": "Error: rejected" });
    fixture.mock.emit_paused(params).await;

    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "promise_rejection");
}

#[tokio::test]
async fn hit_condition_misses_resume_silently() {
    let fixture = attach(
        MockRuntimeConfig {
            script_for_url: vec![("file:///app.js".to_string(), "1".to_string())],
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;
    parse_script(&fixture, "1", "file:///app.js").await;

    let args = SetBreakpointsArguments {
        source: SourceArgument {
            path: Some("file:///app.js".to_string()),
            ..Default::default()
        },
        breakpoints: vec![SourceBreakpoint {
            line: 5,
            hit_condition: Some("% 2".to_string()),
            ..Default::default()
        }],
    };
    fixture.adapter.set_breakpoints(args, 2, None).await.unwrap();
    let runtime_id = fixture
        .mock
        .breakpoints()
        .await
        .keys()
        .next()
        .cloned()
        .expect("a committed runtime breakpoint");

    let hit = || {
        let mut params = paused_params(vec![call_frame("cf1", "f", "file:///app.js", "1", 4)]);
        params["hitBreakpoints"] = json!([runtime_id]);
        params
    };

    // Hit 1: miss, silent resume, no stopped.
    fixture.mock.emit_paused(hit()).await;
    fixture.mock.wait_for_calls("Debugger.resume", 1).await;
    assert_eq!(fixture.sink.count("stopped"), 0);
    assert_eq!(fixture.sink.count("continued"), 0);

    // Hit 2: stop.
    fixture.mock.emit_paused(hit()).await;
    let stopped = fixture.sink.wait_for_event_count("stopped", 1).await;
    assert_eq!(stopped["reason"], "breakpoint");

    // Hit 3: miss again.
    fixture.mock.emit_paused(hit()).await;
    fixture.mock.wait_for_calls("Debugger.resume", 2).await;
    assert_eq!(fixture.sink.count("stopped"), 1);

    // Hit 4: stop again.
    fixture.mock.emit_paused(hit()).await;
    fixture.sink.wait_for_event_count("stopped", 2).await;
}

#[tokio::test]
async fn steps_report_the_step_reason_and_suppress_continued() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture.adapter.step_over().await.unwrap();
    fixture.mock.emit_resumed().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        fixture.sink.count("continued"),
        0,
        "a step-induced resume must not surface as Continued"
    );

    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf1",
            "f",
            "file:///app.js",
            "1",
            3,
        )]))
        .await;
    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "step");
}

#[tokio::test]
async fn pause_requests_report_the_pause_reason() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture.adapter.pause().await.unwrap();
    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf1",
            "f",
            "file:///app.js",
            "1",
            3,
        )]))
        .await;

    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "pause");
}

#[tokio::test]
async fn spontaneous_resumes_emit_continued() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture.mock.emit_resumed().await;
    let continued = fixture.sink.wait_for_event("continued").await;
    assert_eq!(continued["threadId"], 1);
}

#[tokio::test]
async fn smart_step_keeps_stepping_through_unmapped_frames() {
    let mut transformers = Transformers::default();
    transformers.source_map =
        Arc::new(FakeSourceMap::new().with_script("file:///app.js", &[("/src/app.ts", 0)]));

    let fixture = attach_with_transformers(
        MockRuntimeConfig::default(),
        AttachConfig {
            smart_step: true,
            ..Default::default()
        },
        transformers,
    )
    .await;

    fixture.adapter.step_into().await.unwrap();
    assert_eq!(fixture.mock.calls_of("Debugger.stepInto").await.len(), 1);

    // The step lands in a frame with no authored mapping: the adapter steps
    // again instead of stopping.
    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf1",
            "helper",
            "file:///lib.js",
            "2",
            1,
        )]))
        .await;
    fixture.mock.wait_for_calls("Debugger.stepInto", 2).await;
    assert_eq!(fixture.sink.count("stopped"), 0);

    // Landing in mapped code finally stops.
    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf2",
            "main",
            "file:///app.js",
            "1",
            3,
        )]))
        .await;
    let stopped = fixture.sink.wait_for_event("stopped").await;
    assert_eq!(stopped["reason"], "step");
}

#[tokio::test]
async fn restart_frame_reenters_with_frame_entry() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf9",
            "f",
            "file:///app.js",
            "1",
            3,
        )]))
        .await;
    fixture.sink.wait_for_event("stopped").await;

    let (frames, _) = fixture.adapter.stack_trace(None, None).await.unwrap();
    fixture.adapter.restart_frame(frames[0].id).await.unwrap();

    let restarts = fixture.mock.calls_of("Debugger.restartFrame").await;
    assert_eq!(restarts[0]["callFrameId"], "cf9");

    fixture
        .mock
        .emit_paused(paused_params(vec![call_frame(
            "cf9",
            "f",
            "file:///app.js",
            "1",
            1,
        )]))
        .await;
    let stopped = fixture.sink.wait_for_event_count("stopped", 2).await;
    assert_eq!(stopped["reason"], "frame_entry");
}

#[tokio::test]
async fn navigation_before_attach_is_rejected() {
    let sink = Arc::new(harness::TestSink::default());
    let adapter = kite_dap::DebugAdapter::new(sink, Transformers::default());
    assert!(adapter.step_over().await.is_err());
    assert!(adapter.continue_().await.is_err());
    assert!(adapter
        .evaluate("1 + 1", None, None)
        .await
        .is_err());
}
