use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::transport::RdpTransport;
use crate::types::{
    BreakLocation, BreakpointResolvedParams, CallArgument, ConsoleApiCalledParams, ConsoleMessage,
    EvaluateResponse, ExceptionThrownParams, GetPossibleBreakpointsResponse, GetPropertiesResponse,
    Location, PausedParams, RdpError, RdpEvent, Result, ScriptParsedParams, ScriptPosition,
    SetBreakpointByUrlResponse, SetBreakpointResponse,
};

#[derive(Debug, Clone)]
pub struct RdpClientConfig {
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for RdpClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            event_channel_size: 256,
        }
    }
}

struct Inner {
    transport: Arc<dyn RdpTransport>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<RdpEvent>,
    shutdown: CancellationToken,
    config: RdpClientConfig,
}

/// Typed RPC client for the runtime's remote debugging protocol.
///
/// Commands are correlated by message id against a pending map; domain
/// notifications fan out over a broadcast channel. The shutdown token is
/// cancelled when the connection closes, explicitly or because the peer went
/// away.
#[derive(Clone)]
pub struct RdpClient {
    inner: Arc<Inner>,
}

impl RdpClient {
    pub fn connect(transport: Arc<dyn RdpTransport>) -> Self {
        Self::connect_with_config(transport, RdpClientConfig::default())
    }

    pub fn connect_with_config(transport: Arc<dyn RdpTransport>, config: RdpClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_size);
        let inner = Arc::new(Inner {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });
        tokio::spawn(read_loop(inner.clone()));
        Self { inner }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.transport.close();
    }

    /// Cancelled when the connection is torn down, explicitly or by the peer.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RdpEvent> {
        self.inner.events.subscribe()
    }

    /// Send a raw command and wait for its reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let text = json!({ "id": id, "method": method, "params": params }).to_string();
        if let Err(err) = self.inner.transport.send(text).await {
            self.remove_pending(id).await;
            return Err(RdpError::Transport(err));
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                Err(RdpError::Cancelled)
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => Err(RdpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        Err(RdpError::Timeout)
                    }
                }
            }
        }
    }

    async fn call_unit(&self, method: &str, params: Value) -> Result<()> {
        let _ = self.call(method, params).await?;
        Ok(())
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    // Debugger domain.

    pub async fn debugger_enable(&self) -> Result<()> {
        self.call_unit("Debugger.enable", json!({})).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.call_unit("Debugger.resume", json!({})).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.call_unit("Debugger.pause", json!({})).await
    }

    pub async fn step_over(&self) -> Result<()> {
        self.call_unit("Debugger.stepOver", json!({})).await
    }

    pub async fn step_into(&self) -> Result<()> {
        self.call_unit("Debugger.stepInto", json!({})).await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.call_unit("Debugger.stepOut", json!({})).await
    }

    pub async fn set_breakpoint(
        &self,
        script_id: &str,
        line_number: u32,
        column_number: Option<u32>,
        condition: Option<&str>,
    ) -> Result<SetBreakpointResponse> {
        let mut params = json!({
            "location": {
                "scriptId": script_id,
                "lineNumber": line_number,
            }
        });
        if let Some(col) = column_number {
            params["location"]["columnNumber"] = json!(col);
        }
        if let Some(cond) = condition {
            params["condition"] = json!(cond);
        }
        let value = self.call("Debugger.setBreakpoint", params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_breakpoint_by_url(
        &self,
        url_regex: &str,
        line_number: u32,
        column_number: Option<u32>,
        condition: Option<&str>,
    ) -> Result<SetBreakpointByUrlResponse> {
        let mut params = json!({
            "urlRegex": url_regex,
            "lineNumber": line_number,
        });
        if let Some(col) = column_number {
            params["columnNumber"] = json!(col);
        }
        if let Some(cond) = condition {
            params["condition"] = json!(cond);
        }
        let value = self.call("Debugger.setBreakpointByUrl", params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<()> {
        self.call_unit(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
        .await
    }

    /// `state` is one of `all`, `uncaught`, `none`.
    pub async fn set_pause_on_exceptions(&self, state: &str) -> Result<()> {
        self.call_unit("Debugger.setPauseOnExceptions", json!({ "state": state }))
            .await
    }

    pub async fn set_blackbox_patterns(&self, patterns: &[String]) -> Result<()> {
        self.call_unit(
            "Debugger.setBlackboxPatterns",
            json!({ "patterns": patterns }),
        )
        .await
    }

    pub async fn set_blackboxed_ranges(
        &self,
        script_id: &str,
        positions: &[ScriptPosition],
    ) -> Result<()> {
        self.call_unit(
            "Debugger.setBlackboxedRanges",
            json!({ "scriptId": script_id, "positions": positions }),
        )
        .await
    }

    pub async fn set_async_call_stack_depth(&self, max_depth: u32) -> Result<()> {
        self.call_unit(
            "Debugger.setAsyncCallStackDepth",
            json!({ "maxDepth": max_depth }),
        )
        .await
    }

    pub async fn get_possible_breakpoints(
        &self,
        start: &Location,
        end: Option<&Location>,
    ) -> Result<Vec<BreakLocation>> {
        let mut params = json!({ "start": start });
        if let Some(end) = end {
            params["end"] = serde_json::to_value(end)?;
        }
        let value = self.call("Debugger.getPossibleBreakpoints", params).await?;
        let response: GetPossibleBreakpointsResponse = serde_json::from_value(value)?;
        Ok(response.locations)
    }

    pub async fn get_script_source(&self, script_id: &str) -> Result<String> {
        let value = self
            .call("Debugger.getScriptSource", json!({ "scriptId": script_id }))
            .await?;
        Ok(value
            .get("scriptSource")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn evaluate_on_call_frame(
        &self,
        call_frame_id: &str,
        expression: &str,
        silent: bool,
        return_by_value: bool,
        generate_preview: bool,
    ) -> Result<EvaluateResponse> {
        let value = self
            .call(
                "Debugger.evaluateOnCallFrame",
                json!({
                    "callFrameId": call_frame_id,
                    "expression": expression,
                    "silent": silent,
                    "returnByValue": return_by_value,
                    "generatePreview": generate_preview,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_variable_value(
        &self,
        scope_number: u32,
        variable_name: &str,
        new_value: CallArgument,
        call_frame_id: &str,
    ) -> Result<()> {
        self.call_unit(
            "Debugger.setVariableValue",
            json!({
                "scopeNumber": scope_number,
                "variableName": variable_name,
                "newValue": new_value,
                "callFrameId": call_frame_id,
            }),
        )
        .await
    }

    pub async fn restart_frame(&self, call_frame_id: &str) -> Result<()> {
        self.call_unit(
            "Debugger.restartFrame",
            json!({ "callFrameId": call_frame_id }),
        )
        .await
    }

    // Runtime domain.

    pub async fn runtime_enable(&self) -> Result<()> {
        self.call_unit("Runtime.enable", json!({})).await
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        silent: bool,
        return_by_value: bool,
        generate_preview: bool,
    ) -> Result<EvaluateResponse> {
        let value = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "silent": silent,
                    "returnByValue": return_by_value,
                    "generatePreview": generate_preview,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_function_on(
        &self,
        object_id: &str,
        function_declaration: &str,
        arguments: &[CallArgument],
        silent: bool,
        return_by_value: bool,
    ) -> Result<EvaluateResponse> {
        let value = self
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function_declaration,
                    "arguments": arguments,
                    "silent": silent,
                    "returnByValue": return_by_value,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_properties(
        &self,
        object_id: &str,
        own_properties: bool,
        accessor_properties_only: bool,
        generate_preview: bool,
    ) -> Result<GetPropertiesResponse> {
        let value = self
            .call(
                "Runtime.getProperties",
                json!({
                    "objectId": object_id,
                    "ownProperties": own_properties,
                    "accessorPropertiesOnly": accessor_properties_only,
                    "generatePreview": generate_preview,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // Console domain (legacy).

    pub async fn console_enable(&self) -> Result<()> {
        self.call_unit("Console.enable", json!({})).await
    }

    // Optional time-travel domain.

    pub async fn step_back(&self) -> Result<()> {
        self.call_unit("TimeTravel.stepBack", json!({})).await
    }

    pub async fn reverse_continue(&self) -> Result<()> {
        self.call_unit("TimeTravel.reverse", json!({})).await
    }
}

async fn read_loop(inner: Arc<Inner>) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = inner.transport.recv() => res,
        };

        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) | Err(_) => break,
        };

        let message: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(target: "kite.rdp", error = %err, "dropping unparseable frame");
                continue;
            }
        };

        if let Some(id) = message.get("id").and_then(|v| v.as_u64()) {
            let reply = if let Some(error) = message.get("error") {
                Err(RdpError::Protocol {
                    code: error.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };

            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&id)
            };
            if let Some(tx) = tx {
                let _ = tx.send(reply);
            }
        } else if let Some(method) = message.get("method").and_then(|v| v.as_str()) {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            if let Some(event) = parse_event(method, params) {
                let _ = inner.events.send(event);
            }
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(RdpError::ConnectionClosed));
    }
}

fn parse_event(method: &str, params: Value) -> Option<RdpEvent> {
    fn typed<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Option<T> {
        match serde_json::from_value(params) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::debug!(target: "kite.rdp", method, error = %err, "dropping malformed event");
                None
            }
        }
    }

    let event = match method {
        "Debugger.paused" => RdpEvent::Paused(typed::<PausedParams>(method, params)?),
        "Debugger.resumed" => RdpEvent::Resumed,
        "Debugger.scriptParsed" => {
            RdpEvent::ScriptParsed(typed::<ScriptParsedParams>(method, params)?)
        }
        "Debugger.breakpointResolved" => {
            RdpEvent::BreakpointResolved(typed::<BreakpointResolvedParams>(method, params)?)
        }
        "Runtime.consoleAPICalled" => {
            RdpEvent::ConsoleApiCalled(typed::<ConsoleApiCalledParams>(method, params)?)
        }
        "Runtime.exceptionThrown" => {
            RdpEvent::ExceptionThrown(typed::<ExceptionThrownParams>(method, params)?)
        }
        "Runtime.executionContextsCleared" => RdpEvent::ExecutionContextsCleared,
        "Console.messageAdded" => {
            let message = params.get("message").cloned().unwrap_or(params);
            RdpEvent::ConsoleMessageAdded(typed::<ConsoleMessage>(method, message)?)
        }
        _ => return None,
    };
    Some(event)
}
