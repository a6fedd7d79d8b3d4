//! An in-process fake runtime used for unit/integration testing.
//!
//! It intentionally supports a *small* subset of the protocol sufficient to
//! exercise the adapter without a real script runtime on the other end of a
//! socket. Replies are canned or configured per test; domain events are
//! emitted by driver methods.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::client::{RdpClient, RdpClientConfig};
use crate::transport::{pair, PairTransport, RdpTransport};

#[derive(Debug, Clone, Default)]
pub struct MockRuntimeConfig {
    /// Reply to `Console.enable` with an error (older runtimes do).
    pub fail_console_enable: bool,
    /// Reject the blackbox methods with "not implemented".
    pub reject_blackbox: bool,
    /// Reply to every `Debugger.setBreakpointByUrl` after the first per
    /// (urlRegex, line) with the runtime's duplicate-breakpoint error.
    pub breakpoint_already_exists: bool,
    /// Script sources served by `Debugger.getScriptSource`, keyed by script id.
    pub script_sources: HashMap<String, String>,
    /// Script URL -> script id. A set-by-url call binds to the first URL its
    /// `urlRegex` matches; with no match the reply carries no locations (an
    /// unbound breakpoint).
    pub script_for_url: Vec<(String, String)>,
    /// Locations served by `Debugger.getPossibleBreakpoints`.
    pub possible_breakpoints: Vec<Value>,
    /// Expression -> `result` RemoteObject JSON for the evaluate commands.
    pub evaluate_results: HashMap<String, Value>,
    /// Object id -> full `Runtime.getProperties` result JSON.
    pub properties: HashMap<String, Value>,
}

struct MockState {
    config: MockRuntimeConfig,
    calls: Mutex<Vec<(String, Value)>>,
    next_breakpoint: AtomicU64,
    breakpoints: Mutex<BTreeMap<String, Value>>,
    call_function_results: Mutex<Vec<Value>>,
}

pub struct MockRuntime {
    state: Arc<MockState>,
    to_client: Arc<PairTransport>,
}

impl MockRuntime {
    /// Spawn a mock runtime and a client connected to it.
    pub fn spawn(config: MockRuntimeConfig) -> (RdpClient, MockRuntime) {
        Self::spawn_with_client_config(config, RdpClientConfig::default())
    }

    pub fn spawn_with_client_config(
        config: MockRuntimeConfig,
        client_config: RdpClientConfig,
    ) -> (RdpClient, MockRuntime) {
        let (client_side, runtime_side) = pair();
        let client = RdpClient::connect_with_config(Arc::new(client_side), client_config);

        let runtime_side = Arc::new(runtime_side);
        let state = Arc::new(MockState {
            config,
            calls: Mutex::new(Vec::new()),
            next_breakpoint: AtomicU64::new(1),
            breakpoints: Mutex::new(BTreeMap::new()),
            call_function_results: Mutex::new(Vec::new()),
        });

        tokio::spawn(serve(state.clone(), runtime_side.clone()));

        (
            client,
            MockRuntime {
                state,
                to_client: runtime_side,
            },
        )
    }

    /// Every command received so far, in order.
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().await.clone()
    }

    pub async fn calls_of(&self, method: &str) -> Vec<Value> {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Wait until at least `count` commands with `method` have been received.
    pub async fn wait_for_calls(&self, method: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let calls = self.calls_of(method).await;
            if calls.len() >= count {
                return calls;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} {method} call(s); saw {calls:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Currently-installed runtime breakpoints, keyed by breakpoint id.
    pub async fn breakpoints(&self) -> BTreeMap<String, Value> {
        self.state.breakpoints.lock().await.clone()
    }

    /// Queue a reply for the next `Runtime.callFunctionOn` (FIFO).
    pub async fn push_call_function_result(&self, result: Value) {
        self.state.call_function_results.lock().await.push(result);
    }

    pub fn close(&self) {
        self.to_client.close();
    }

    async fn emit(&self, method: &str, params: Value) {
        let _ = self
            .to_client
            .send(json!({ "method": method, "params": params }).to_string())
            .await;
    }

    pub async fn emit_script_parsed(&self, script_id: &str, url: &str, source_map_url: Option<&str>) {
        let mut params = json!({
            "scriptId": script_id,
            "url": url,
            "startLine": 0,
            "startColumn": 0,
            "endLine": 100,
            "endColumn": 0,
        });
        if let Some(map) = source_map_url {
            params["sourceMapURL"] = json!(map);
        }
        self.emit("Debugger.scriptParsed", params).await;
    }

    pub async fn emit_paused(&self, params: Value) {
        self.emit("Debugger.paused", params).await;
    }

    pub async fn emit_resumed(&self) {
        self.emit("Debugger.resumed", json!({})).await;
    }

    pub async fn emit_breakpoint_resolved(&self, breakpoint_id: &str, location: Value) {
        self.emit(
            "Debugger.breakpointResolved",
            json!({ "breakpointId": breakpoint_id, "location": location }),
        )
        .await;
    }

    pub async fn emit_console_api(&self, call_type: &str, args: Value) {
        self.emit(
            "Runtime.consoleAPICalled",
            json!({ "type": call_type, "args": args }),
        )
        .await;
    }

    pub async fn emit_exception_thrown(&self, exception_details: Value) {
        self.emit(
            "Runtime.exceptionThrown",
            json!({ "exceptionDetails": exception_details }),
        )
        .await;
    }

    pub async fn emit_execution_contexts_cleared(&self) {
        self.emit("Runtime.executionContextsCleared", json!({})).await;
    }

    pub async fn emit_console_message_added(&self, level: &str, text: &str) {
        self.emit(
            "Console.messageAdded",
            json!({ "message": { "level": level, "text": text } }),
        )
        .await;
    }
}

async fn serve(state: Arc<MockState>, transport: Arc<PairTransport>) {
    loop {
        let frame = match transport.recv().await {
            Ok(Some(text)) => text,
            Ok(None) | Err(_) => break,
        };

        let message: Value = match serde_json::from_str(&frame) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let Some(id) = message.get("id").and_then(|v| v.as_u64()) else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        {
            let mut calls = state.calls.lock().await;
            calls.push((method.clone(), params.clone()));
        }

        let reply = handle_command(&state, &method, &params).await;
        let text = match reply {
            Ok(result) => json!({ "id": id, "result": result }).to_string(),
            Err(message) => {
                json!({ "id": id, "error": { "code": -32000, "message": message } }).to_string()
            }
        };
        if transport.send(text).await.is_err() {
            break;
        }
    }
}

async fn handle_command(
    state: &MockState,
    method: &str,
    params: &Value,
) -> std::result::Result<Value, String> {
    match method {
        "Debugger.enable" | "Runtime.enable" | "Debugger.resume" | "Debugger.pause"
        | "Debugger.stepOver" | "Debugger.stepInto" | "Debugger.stepOut"
        | "Debugger.setPauseOnExceptions" | "Debugger.setAsyncCallStackDepth"
        | "Debugger.setVariableValue" | "Debugger.restartFrame" | "TimeTravel.stepBack"
        | "TimeTravel.reverse" => Ok(json!({})),

        "Console.enable" => {
            if state.config.fail_console_enable {
                Err("'Console.enable' wasn't found".to_string())
            } else {
                Ok(json!({}))
            }
        }

        "Debugger.setBlackboxPatterns" | "Debugger.setBlackboxedRanges" => {
            if state.config.reject_blackbox {
                Err("not implemented".to_string())
            } else {
                Ok(json!({}))
            }
        }

        "Debugger.setBreakpointByUrl" => {
            let url_regex = params
                .get("urlRegex")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let line = params.get("lineNumber").and_then(|v| v.as_u64()).unwrap_or(0);
            let column = params.get("columnNumber").and_then(|v| v.as_u64());

            if state.config.breakpoint_already_exists {
                let breakpoints = state.breakpoints.lock().await;
                let duplicate = breakpoints.values().any(|bp| {
                    bp.get("urlRegex").and_then(|v| v.as_str()) == Some(url_regex.as_str())
                        && bp.get("lineNumber").and_then(|v| v.as_u64()) == Some(line)
                });
                if duplicate {
                    return Err("Breakpoint at specified location already exists.".to_string());
                }
            }

            let breakpoint_id = format!("bp{}", state.next_breakpoint.fetch_add(1, Ordering::Relaxed));
            let compiled = regex::Regex::new(&url_regex).ok();
            let script_id = state
                .config
                .script_for_url
                .iter()
                .find(|(url, _)| {
                    compiled
                        .as_ref()
                        .map(|re| re.is_match(url))
                        .unwrap_or(false)
                })
                .map(|(_, id)| id.clone());

            let locations = match script_id {
                Some(script_id) => json!([{
                    "scriptId": script_id,
                    "lineNumber": line,
                    "columnNumber": column.unwrap_or(0),
                }]),
                None => json!([]),
            };

            let mut breakpoints = state.breakpoints.lock().await;
            breakpoints.insert(breakpoint_id.clone(), params.clone());
            Ok(json!({ "breakpointId": breakpoint_id, "locations": locations }))
        }

        "Debugger.setBreakpoint" => {
            let breakpoint_id = format!("bp{}", state.next_breakpoint.fetch_add(1, Ordering::Relaxed));
            let location = params.get("location").cloned().unwrap_or(json!({}));
            let mut breakpoints = state.breakpoints.lock().await;
            breakpoints.insert(breakpoint_id.clone(), params.clone());
            Ok(json!({ "breakpointId": breakpoint_id, "actualLocation": location }))
        }

        "Debugger.removeBreakpoint" => {
            let breakpoint_id = params
                .get("breakpointId")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let mut breakpoints = state.breakpoints.lock().await;
            if breakpoints.remove(breakpoint_id).is_none() {
                return Err(format!("unknown breakpoint {breakpoint_id}"));
            }
            Ok(json!({}))
        }

        "Debugger.getPossibleBreakpoints" => {
            Ok(json!({ "locations": state.config.possible_breakpoints }))
        }

        "Debugger.getScriptSource" => {
            let script_id = params
                .get("scriptId")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            match state.config.script_sources.get(script_id) {
                Some(source) => Ok(json!({ "scriptSource": source })),
                None => Err(format!("No script for id: {script_id}")),
            }
        }

        "Debugger.evaluateOnCallFrame" | "Runtime.evaluate" => {
            let expression = params
                .get("expression")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let result = state
                .config
                .evaluate_results
                .get(expression)
                .cloned()
                .unwrap_or(json!({ "type": "undefined" }));
            // A configured result may carry exceptionDetails alongside.
            if result.get("result").is_some() {
                Ok(result)
            } else {
                Ok(json!({ "result": result }))
            }
        }

        "Runtime.callFunctionOn" => {
            let mut queued = state.call_function_results.lock().await;
            if queued.is_empty() {
                Ok(json!({ "result": { "type": "undefined" } }))
            } else {
                let result = queued.remove(0);
                if result.get("result").is_some() {
                    Ok(result)
                } else {
                    Ok(json!({ "result": result }))
                }
            }
        }

        "Runtime.getProperties" => {
            let object_id = params
                .get("objectId")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(state
                .config
                .properties
                .get(object_id)
                .cloned()
                .unwrap_or_else(|| json!({ "result": [] })))
        }

        _ => Err(format!("'{method}' wasn't found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_allocates_breakpoint_ids() {
        let (client, mock) = MockRuntime::spawn(MockRuntimeConfig {
            script_for_url: vec![("file:///app.js".to_string(), "10".to_string())],
            ..Default::default()
        });

        client.debugger_enable().await.unwrap();
        let response = client
            .set_breakpoint_by_url("file:///app\\.js", 3, None, None)
            .await
            .unwrap();
        assert_eq!(response.breakpoint_id, "bp1");
        assert_eq!(response.locations.len(), 1);
        assert_eq!(response.locations[0].script_id, "10");

        assert_eq!(mock.breakpoints().await.len(), 1);
        client.remove_breakpoint("bp1").await.unwrap();
        assert!(mock.breakpoints().await.is_empty());

        let calls = mock.calls().await;
        assert_eq!(calls[0].0, "Debugger.enable");
    }

    #[tokio::test]
    async fn duplicate_breakpoints_error_when_configured() {
        let (client, _mock) = MockRuntime::spawn(MockRuntimeConfig {
            breakpoint_already_exists: true,
            ..Default::default()
        });

        client
            .set_breakpoint_by_url("lib\\.js", 7, None, None)
            .await
            .unwrap();
        let err = client
            .set_breakpoint_by_url("lib\\.js", 7, None, None)
            .await
            .expect_err("expected the duplicate error");
        assert_eq!(
            err.protocol_message(),
            Some("Breakpoint at specified location already exists.")
        );
    }

    #[tokio::test]
    async fn emitted_events_reach_the_client() {
        let (client, mock) = MockRuntime::spawn(MockRuntimeConfig::default());
        let mut events = client.subscribe_events();

        mock.emit_script_parsed("42", "file:///app.js", None).await;

        match events.recv().await.unwrap() {
            crate::types::RdpEvent::ScriptParsed(params) => {
                assert_eq!(params.script_id, "42");
                assert_eq!(params.url, "file:///app.js");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
