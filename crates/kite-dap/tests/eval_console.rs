mod harness;

use std::collections::HashMap;

use harness::{attach, call_frame, parse_script, paused_params};
use kite_dap::eval::completions_expression;
use kite_dap::AttachConfig;
use kite_rdp::mock::MockRuntimeConfig;
use serde_json::json;

#[tokio::test]
async fn scripts_meta_command_lists_known_scripts() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;
    parse_script(&fixture, "1", "file:///app.js").await;
    parse_script(&fixture, "2", "file:///lib.js").await;

    let body = fixture
        .adapter
        .evaluate(".scripts", None, Some("repl"))
        .await
        .unwrap();
    assert_eq!(body.result, "");
    assert_eq!(body.variables_reference, 0);

    let output = fixture.sink.wait_for_event("output").await;
    assert_eq!(output["category"], "stdout");
    let text = output["output"].as_str().unwrap();
    assert!(text.contains("› file:///app.js"));
    assert!(text.contains("› file:///lib.js"));
}

#[tokio::test]
async fn scripts_meta_command_dumps_a_script_source() {
    let mut script_sources = HashMap::new();
    script_sources.insert("1".to_string(), "console.log('hi');".to_string());
    let fixture = attach(
        MockRuntimeConfig {
            script_sources,
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;
    parse_script(&fixture, "1", "file:///app.js").await;

    fixture
        .adapter
        .evaluate(".scripts app.js", None, Some("repl"))
        .await
        .unwrap();

    let output = fixture.sink.wait_for_event("output").await;
    assert!(output["output"]
        .as_str()
        .unwrap()
        .contains("console.log('hi');"));
}

#[tokio::test]
async fn evaluation_errors_are_softened_outside_the_repl() {
    let mut evaluate_results = HashMap::new();
    evaluate_results.insert(
        "foo".to_string(),
        json!({
            "result": { "type": "undefined" },
            "exceptionDetails": {
                "exceptionId": 1,
                "text": "Uncaught",
                "lineNumber": 0,
                "columnNumber": 0,
                "exception": { "type": "object", "description": "ReferenceError: foo is not defined" },
            }
        }),
    );
    let fixture = attach(
        MockRuntimeConfig {
            evaluate_results,
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;

    let err = fixture
        .adapter
        .evaluate("foo", None, Some("watch"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "not available");

    let err = fixture
        .adapter
        .evaluate("foo", None, Some("repl"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "ReferenceError: foo is not defined");
}

#[tokio::test]
async fn evaluate_returns_converted_results() {
    let mut evaluate_results = HashMap::new();
    evaluate_results.insert(
        "user".to_string(),
        json!({
            "result": {
                "type": "object",
                "className": "Object",
                "description": "Object",
                "objectId": "user-1",
            }
        }),
    );
    let fixture = attach(
        MockRuntimeConfig {
            evaluate_results,
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;

    let body = fixture
        .adapter
        .evaluate("user", None, Some("repl"))
        .await
        .unwrap();
    assert_eq!(body.result, "Object");
    assert!(body.variables_reference > 0);
}

#[tokio::test]
async fn evaluate_targets_the_live_call_frame() {
    let mut evaluate_results = HashMap::new();
    evaluate_results.insert(
        "x".to_string(),
        json!({ "result": { "type": "number", "value": 3, "description": "3" } }),
    );
    let fixture = attach(
        MockRuntimeConfig {
            evaluate_results,
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;

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
    fixture.sink.wait_for_event("stopped").await;

    let (frames, _) = fixture.adapter.stack_trace(None, None).await.unwrap();
    let body = fixture
        .adapter
        .evaluate("x", Some(frames[0].id), Some("watch"))
        .await
        .unwrap();
    assert_eq!(body.result, "3");

    let on_frame = fixture.mock.calls_of("Debugger.evaluateOnCallFrame").await;
    assert_eq!(on_frame.len(), 1);
    assert_eq!(on_frame[0]["callFrameId"], "cf1");
    assert_eq!(on_frame[0]["silent"], true);

    // A stale frame id falls back to a global evaluation.
    fixture
        .adapter
        .evaluate("x", Some(frames[0].id + 9999), Some("watch"))
        .await
        .unwrap();
    assert_eq!(fixture.mock.calls_of("Runtime.evaluate").await.len(), 1);
}

#[tokio::test]
async fn completions_walk_the_prototype_chain() {
    let mut evaluate_results = HashMap::new();
    evaluate_results.insert(
        completions_expression("items"),
        json!({
            "result": {
                "type": "object",
                "value": [["length", "0", "1", "push"], ["toString", "push"]],
            }
        }),
    );
    let fixture = attach(
        MockRuntimeConfig {
            evaluate_results,
            ..Default::default()
        },
        AttachConfig::default(),
    )
    .await;

    let targets = fixture
        .adapter
        .completions("items.", 7, None)
        .await
        .unwrap();
    let labels: Vec<&str> = targets.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(labels, vec!["length", "push", "toString"]);
    assert!(targets.iter().all(|t| t.item_type == "property"));
}

#[tokio::test]
async fn console_calls_become_output_events() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture
        .mock
        .emit_console_api(
            "log",
            json!([
                { "type": "string", "value": "hello" },
                { "type": "number", "value": 3, "description": "3" },
            ]),
        )
        .await;
    let output = fixture.sink.wait_for_event("output").await;
    assert_eq!(output["category"], "stdout");
    assert_eq!(output["output"], "hello 3\n");
    assert!(output.get("variablesReference").is_none());

    fixture
        .mock
        .emit_console_api("error", json!([{ "type": "string", "value": "bad" }]))
        .await;
    let output = fixture.sink.wait_for_event_count("output", 2).await;
    assert_eq!(output["category"], "stderr");
}

#[tokio::test]
async fn structured_console_args_get_a_variables_reference() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture
        .mock
        .emit_console_api(
            "log",
            json!([
                { "type": "string", "value": "state:" },
                { "type": "object", "className": "Object", "description": "Object", "objectId": "o1" },
            ]),
        )
        .await;

    let output = fixture.sink.wait_for_event("output").await;
    let reference = output["variablesReference"].as_i64().unwrap();
    assert!(reference > 0);

    let variables = fixture.adapter.variables(reference, None, None, None).await;
    assert_eq!(variables.len(), 2);
    assert_eq!(variables[0].name, "0");
    assert_eq!(variables[1].name, "1");
    assert_eq!(variables[1].value, "Object");
}

#[tokio::test]
async fn legacy_console_messages_are_remapped() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture.mock.emit_console_message_added("error", "kaboom").await;
    let output = fixture.sink.wait_for_event("output").await;
    assert_eq!(output["category"], "stderr");
    assert_eq!(output["output"], "kaboom\n");
}

#[tokio::test]
async fn thrown_exceptions_surface_on_stderr() {
    let fixture = attach(MockRuntimeConfig::default(), AttachConfig::default()).await;

    fixture
        .mock
        .emit_exception_thrown(json!({
            "exceptionId": 7,
            "text": "Uncaught",
            "lineNumber": 2,
            "columnNumber": 0,
            "exception": {
                "type": "object",
                "className": "Error",
                "description": "Error: kaboom\n    at f (file:///app.js:3:1)",
            }
        }))
        .await;

    let output = fixture.sink.wait_for_event("output").await;
    assert_eq!(output["category"], "stderr");
    assert!(output["output"].as_str().unwrap().contains("Error: kaboom"));
}
