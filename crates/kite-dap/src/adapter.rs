//! The debug adapter core: session lifecycle, the request surface, and the
//! event pump translating runtime notifications into DAP events.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use kite_rdp::{
    CallFrame, ConsoleApiCalledParams, ConsoleMessage, ExceptionThrownParams, Location,
    PausedParams, RdpClient, RdpEvent, RemoteObject, ScriptParsedParams, ScriptPosition,
};

use crate::breakpoints::{
    is_already_exists_error, url_to_regex, BreakpointIdRegistry, BreakpointState, HitCondition,
    HitConditionBreakpoint, PendingBreakpoint,
};
use crate::config::{AttachConfig, InitializeArguments};
use crate::dap::{
    Breakpoint, Capabilities, CompletionItem, DapScope, EventSink, ExceptionBreakpointsFilter,
    EvaluateResponseBody, SetBreakpointsArguments, StackFrame, Thread, Variable,
};
use crate::error::{AdapterError, AdapterResult};
use crate::eval::{
    completion_target, completions_expression, filter_completion_names, is_unavailable_eval_error,
    map_formatted_exception, truncate_script_source, EVAL_NOT_AVAILABLE_MSG,
};
use crate::handles::HandleTable;
use crate::pause::{
    classify_pause, exception_text, PauseDisposition, PauseState, StopReason,
    POST_STEP_QUIESCENCE, STEP_RESPONSE_CEILING,
};
use crate::scripts::{is_synthetic_url, ScriptRegistry, SourceHandles};
use crate::skip::SkipEngine;
use crate::stack::{build_scopes, build_stack_trace, StackContext};
use crate::transform::Transformers;
use crate::variables::{
    expand_container, remote_object_to_result, set_container_value, LoggedObjects,
    VariableContainer,
};

const THREAD_ID: i64 = 1;
const DEFAULT_THREAD_NAME: &str = "Thread 1";
const SET_BREAKPOINTS_TIMEOUT: Duration = Duration::from_secs(5);
const ASYNC_STACK_DEPTH: u32 = 4;

struct AdapterState {
    client: Option<RdpClient>,
    config: AttachConfig,
    scripts: ScriptRegistry,
    skip: SkipEngine,
    breakpoints: BreakpointState,
    breakpoint_ids: BreakpointIdRegistry,
    frame_handles: HandleTable<CallFrame>,
    variable_handles: HandleTable<VariableContainer>,
    source_handles: SourceHandles,
    pause: PauseState,
    exception: Option<RemoteObject>,
    smart_step_count: u64,
    initialized_sent: bool,
    blackbox_warned: bool,
    thread_name: String,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            client: None,
            config: AttachConfig::default(),
            scripts: ScriptRegistry::default(),
            skip: SkipEngine::default(),
            breakpoints: BreakpointState::default(),
            breakpoint_ids: BreakpointIdRegistry::default(),
            frame_handles: HandleTable::default(),
            variable_handles: HandleTable::default(),
            source_handles: SourceHandles::default(),
            pause: PauseState::default(),
            exception: None,
            smart_step_count: 0,
            initialized_sent: false,
            blackbox_warned: false,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct DebugAdapter {
    state: Arc<Mutex<AdapterState>>,
    sink: Arc<dyn EventSink>,
    transformers: Transformers,
    shutdown: CancellationToken,
    terminated_sent: Arc<AtomicBool>,
}

enum StepKind {
    Over,
    Into,
    Out,
    Back,
}

impl DebugAdapter {
    pub fn new(sink: Arc<dyn EventSink>, transformers: Transformers) -> Self {
        Self {
            state: Arc::new(Mutex::new(AdapterState::default())),
            sink,
            transformers,
            shutdown: CancellationToken::new(),
            terminated_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // Lifecycle.

    pub async fn initialize(&self, args: InitializeArguments) -> AdapterResult<Capabilities> {
        if let Some(format) = args.path_format.as_deref() {
            if format != "path" {
                return Err(AdapterError::InvalidRequest(format!(
                    "unsupported pathFormat {format:?}"
                )));
            }
        }
        self.transformers
            .line_col
            .set_client_lines_start_at1(args.lines_start_at1.unwrap_or(true));
        self.transformers
            .line_col
            .set_client_columns_start_at1(args.columns_start_at1.unwrap_or(true));

        Ok(Capabilities {
            supports_configuration_done_request: true,
            supports_set_variable: true,
            supports_conditional_breakpoints: true,
            supports_hit_conditional_breakpoints: true,
            supports_completions_request: true,
            supports_restart_frame: true,
            supports_exception_info_request: true,
            exception_breakpoint_filters: vec![
                ExceptionBreakpointsFilter {
                    filter: "all".to_string(),
                    label: "All Exceptions".to_string(),
                    default: false,
                },
                ExceptionBreakpointsFilter {
                    filter: "uncaught".to_string(),
                    label: "Uncaught Exceptions".to_string(),
                    default: true,
                },
            ],
        })
    }

    /// Wire up an already-opened runtime connection: subscribe to its
    /// domains, install the skip set and async-stack depth, and start the
    /// event pump. `Initialized` is not emitted here; it waits for the first
    /// parsed script (column-breakpoint probing and initial source maps).
    pub async fn attach(&self, client: RdpClient, config: AttachConfig) -> AdapterResult<()> {
        let events = client.subscribe_events();
        let client_shutdown = client.shutdown_token();

        {
            let mut state = self.state.lock().await;
            if state.client.is_some() {
                return Err(AdapterError::InvalidRequest(
                    "already attached to a runtime".to_string(),
                ));
            }
            state.skip = SkipEngine::new(&config.skip_files, &config.skip_file_reg_exps);
            state.client = Some(client.clone());
            state.config = config.clone();
        }

        tokio::spawn(self.clone().event_pump(events, client_shutdown));

        // Console.enable fails on newer runtimes that dropped the domain;
        // that is fine, Runtime.consoleAPICalled covers it.
        if let Err(err) = client.console_enable().await {
            tracing::debug!(target: "kite.dap", error = %err, "Console.enable failed; continuing");
        }
        client.debugger_enable().await?;
        client.runtime_enable().await?;

        let depth = if config.show_async_stacks {
            ASYNC_STACK_DEPTH
        } else {
            0
        };
        client.set_async_call_stack_depth(depth).await?;

        let patterns = {
            let state = self.state.lock().await;
            state.skip.pattern_strings()
        };
        if !patterns.is_empty() {
            self.submit_blackbox_patterns(&client, &patterns).await;
        }

        Ok(())
    }

    pub async fn disconnect(&self, restart: bool) {
        let client = {
            let mut state = self.state.lock().await;
            state.client.take()
        };
        if let Some(client) = client {
            client.shutdown();
        }
        self.send_terminated_once(restart);
        self.shutdown.cancel();
    }

    fn send_terminated_once(&self, restart: bool) {
        if self
            .terminated_sent
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let body = restart.then(|| json!({ "restart": true }));
            self.sink.send_event("terminated", body);
        }
    }

    // Event pump.

    async fn event_pump(
        self,
        mut events: broadcast::Receiver<RdpEvent>,
        client_shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = client_shutdown.cancelled() => {
                    self.send_terminated_once(false);
                    return;
                }
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Closed) => {
                        self.send_terminated_once(false);
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(target: "kite.dap", missed, "event stream lagged");
                        continue;
                    }
                },
            };

            match event {
                RdpEvent::Paused(params) => self.on_paused(params).await,
                RdpEvent::Resumed => self.on_resumed().await,
                RdpEvent::ScriptParsed(params) => self.on_script_parsed(params).await,
                RdpEvent::BreakpointResolved(params) => {
                    self.on_breakpoint_resolved(params).await;
                }
                RdpEvent::ConsoleApiCalled(params) => self.on_console_api(params).await,
                RdpEvent::ExceptionThrown(params) => self.on_exception_thrown(params).await,
                RdpEvent::ExecutionContextsCleared => self.on_contexts_cleared().await,
                RdpEvent::ConsoleMessageAdded(message) => self.on_console_message(message).await,
            }
        }
    }

    async fn on_script_parsed(&self, params: ScriptParsedParams) {
        let (client, probe, drains, ranges, first_script) = {
            let mut state = self.state.lock().await;
            let script = state.scripts.add(&params);

            self.transformers.path.script_parsed(&script.url);
            let authored = self
                .transformers
                .source_map
                .script_parsed(&script.url, script.source_map_url.as_deref());

            let probe = if !state.scripts.column_bp_probed {
                state.scripts.column_bp_probed = true;
                Some(script.script_id.clone())
            } else {
                None
            };

            let ranges = if !authored.is_empty() {
                let details = self
                    .transformers
                    .source_map
                    .all_source_path_details(&script.url);
                let parent_skipped = state.skip.is_skipped(&script.url);
                Some((
                    script.script_id.clone(),
                    state.skip.blackboxed_ranges(parent_skipped, &details),
                ))
            } else {
                None
            };

            let mut drains: Vec<String> = authored
                .iter()
                .filter(|path| state.breakpoints.pending.contains_key(*path))
                .cloned()
                .collect();
            if state.breakpoints.pending.contains_key(&script.url) {
                drains.push(script.url.clone());
            }

            let first_script = !state.initialized_sent;
            (state.client.clone(), probe, drains, ranges, first_script)
        };

        let Some(client) = client else { return };

        if let Some(script_id) = probe {
            self.probe_column_breakpoints(&client, &script_id).await;
        }

        if let Some((script_id, positions)) = ranges {
            self.submit_blackboxed_ranges(&client, &script_id, &positions)
                .await;
        }

        for url in drains {
            self.drain_pending_breakpoints(&url).await;
        }

        if first_script {
            let emit = {
                let mut state = self.state.lock().await;
                if state.initialized_sent {
                    false
                } else {
                    state.initialized_sent = true;
                    true
                }
            };
            if emit {
                self.sink.send_event("initialized", None);
            }
        }
    }

    /// One-shot probe: ask for break locations over a trivial range to learn
    /// whether the runtime supports column breakpoints.
    async fn probe_column_breakpoints(&self, client: &RdpClient, script_id: &str) {
        let start = Location {
            script_id: script_id.to_string(),
            line_number: 0,
            column_number: Some(0),
        };
        let end = Location {
            script_id: script_id.to_string(),
            line_number: 1,
            column_number: Some(0),
        };
        let supported = client
            .get_possible_breakpoints(&start, Some(&end))
            .await
            .is_ok();
        self.transformers
            .line_col
            .set_column_breakpoints_enabled(supported);
    }

    async fn submit_blackbox_patterns(&self, client: &RdpClient, patterns: &[String]) {
        if let Err(err) = client.set_blackbox_patterns(patterns).await {
            self.warn_blackbox_unsupported(&err.to_string()).await;
        }
    }

    /// Clear-then-set: an empty positions array first, then the real list.
    /// Some runtimes ignore an in-place update without the reset.
    async fn submit_blackboxed_ranges(
        &self,
        client: &RdpClient,
        script_id: &str,
        positions: &[ScriptPosition],
    ) {
        if let Err(err) = client.set_blackboxed_ranges(script_id, &[]).await {
            self.warn_blackbox_unsupported(&err.to_string()).await;
            return;
        }
        if let Err(err) = client.set_blackboxed_ranges(script_id, positions).await {
            self.warn_blackbox_unsupported(&err.to_string()).await;
        }
    }

    async fn warn_blackbox_unsupported(&self, error: &str) {
        let mut state = self.state.lock().await;
        if !state.blackbox_warned {
            state.blackbox_warned = true;
            tracing::warn!(
                target: "kite.dap",
                error,
                "this runtime does not support blackboxing; skipFiles will only deemphasize frames"
            );
        }
    }

    async fn on_paused(&self, params: PausedParams) {
        enum Action {
            SilentResume(RdpClient),
            SmartStep(RdpClient),
            Stop {
                body: Value,
                gate: Option<watch::Receiver<bool>>,
            },
            None,
        }

        let action = {
            let mut state = self.state.lock().await;

            // New pause epoch: stale frame/variable handles must not resolve.
            state.frame_handles.reset();
            state.variable_handles.reset();
            state.exception = None;

            let expecting = state.pause.expecting_stop_reason.take();
            state.pause.current = Some(params.clone());

            let (disposition, exception) =
                classify_pause(&params, expecting, &mut state.breakpoints.hit_conditions);

            match disposition {
                PauseDisposition::SilentResume => {
                    state.pause.current = None;
                    match state.client.clone() {
                        Some(client) => Action::SilentResume(client),
                        None => Action::None,
                    }
                }
                PauseDisposition::Stop(reason) => {
                    state.exception = exception;

                    let smart_step = reason == StopReason::Step
                        && state.config.source_maps
                        && state.config.smart_step;
                    match smart_step
                        .then(|| self.smart_step_target(&mut state, &params))
                        .flatten()
                    {
                        Some(client) => Action::SmartStep(client),
                        None => {
                            let (body, gate) = self.finish_stop(&mut state, reason);
                            Action::Stop { body, gate }
                        }
                    }
                }
            }
        };

        match action {
            Action::SilentResume(client) => {
                if let Err(err) = client.resume().await {
                    tracing::warn!(target: "kite.dap", error = %err, "resume after silent breakpoint hit failed");
                }
            }
            Action::SmartStep(client) => {
                if let Err(err) = client.step_into().await {
                    tracing::error!(target: "kite.dap", error = %err, "smart-step stepInto failed");
                }
            }
            Action::Stop { body, gate } => {
                // The stopped event must not outrun the response to the step
                // that induced it; wait for that response, bounded.
                if let Some(mut gate) = gate {
                    if !*gate.borrow() {
                        let _ = tokio::time::timeout(STEP_RESPONSE_CEILING, gate.changed()).await;
                    }
                }
                self.sink.send_event("stopped", Some(body));
            }
            Action::None => {}
        }
    }

    /// When the step landed in a frame with no authored mapping, keep
    /// stepping in instead of stopping. Returns the client to step with.
    fn smart_step_target(
        &self,
        state: &mut AdapterState,
        params: &PausedParams,
    ) -> Option<RdpClient> {
        let top = params.call_frames.first()?;
        let url = if top.url.is_empty() {
            crate::scripts::synthetic_url(&top.location.script_id)
        } else {
            top.url.clone()
        };
        let mapped = self.transformers.source_map.map_to_authored(
            &url,
            top.location.line_number,
            top.location.column_number.unwrap_or(0),
        );

        if mapped.is_some() {
            if state.smart_step_count > 0 {
                tracing::info!(
                    target: "kite.dap",
                    "SmartStep: Skipped {} steps",
                    state.smart_step_count
                );
                state.smart_step_count = 0;
            }
            return None;
        }

        state.smart_step_count += 1;
        state.pause.current = None;
        state.pause.expecting_stop_reason = Some(StopReason::Step);
        state.pause.expecting_resumed_event = true;
        state.pause.step_in_progress = true;
        state.client.clone()
    }

    fn finish_stop(
        &self,
        state: &mut AdapterState,
        reason: StopReason,
    ) -> (Value, Option<watch::Receiver<bool>>) {
        let mut body = json!({
            "reason": reason.as_str(),
            "threadId": THREAD_ID,
        });
        if let Some(text) = exception_text(state.exception.as_ref()) {
            body["text"] = json!(text);
        }
        state.pause.last_stopped_body = Some(body.clone());
        let gate = state.pause.current_step.clone();
        (body, gate)
    }

    async fn on_resumed(&self) {
        let emit_continued = {
            let mut state = self.state.lock().await;
            state.pause.current = None;
            if state.pause.expecting_resumed_event {
                state.pause.expecting_resumed_event = false;
                if state.pause.step_in_progress {
                    // A known race: evaluations issued immediately after a
                    // step can observe the pre-step frame. Hold them briefly.
                    state.pause.quiescence_until =
                        Some(Instant::now() + POST_STEP_QUIESCENCE);
                }
                false
            } else {
                true
            }
        };

        if emit_continued {
            self.sink.send_event(
                "continued",
                Some(json!({ "threadId": THREAD_ID, "allThreadsContinued": true })),
            );
        }
    }

    async fn on_contexts_cleared(&self) {
        let mut state = self.state.lock().await;
        state.scripts.clear();
        state.breakpoints.on_contexts_cleared();
        state.pause.current = None;
        self.transformers.clear();
    }

    async fn on_breakpoint_resolved(&self, params: kite_rdp::BreakpointResolvedParams) {
        let body = {
            let mut state = self.state.lock().await;
            let url = state
                .scripts
                .by_id(&params.location.script_id)
                .map(|script| script.url.clone())
                .unwrap_or_else(|| crate::scripts::synthetic_url(&params.location.script_id));
            state.breakpoints.commit(&url, params.breakpoint_id.clone());
            let dap_id = state.breakpoint_ids.dap_id_for(&params.breakpoint_id);

            let (line, column) = self.to_client_location(
                &url,
                params.location.line_number,
                params.location.column_number.unwrap_or(0),
            );
            json!({
                "reason": "new",
                "breakpoint": {
                    "id": dap_id,
                    "verified": true,
                    "line": line,
                    "column": column,
                }
            })
        };
        self.sink.send_event("breakpoint", Some(body));
    }

    async fn on_console_api(&self, params: ConsoleApiCalledParams) {
        let category = if params.call_type == "error" {
            "stderr"
        } else {
            "stdout"
        };

        let mut parts = Vec::with_capacity(params.args.len());
        for arg in &params.args {
            parts.push(console_arg_preview(arg));
        }
        let output = format!("{}\n", parts.join(" "));

        let variables_reference = if params.args.iter().any(|a| a.object_id.is_some()) {
            let mut state = self.state.lock().await;
            Some(
                state
                    .variable_handles
                    .alloc(VariableContainer::LoggedObjects(LoggedObjects {
                        args: params.args.clone(),
                    })),
            )
        } else {
            None
        };

        let mut body = json!({ "category": category, "output": output });
        if let Some(reference) = variables_reference {
            body["variablesReference"] = json!(reference);
        }
        self.sink.send_event("output", Some(body));
    }

    /// Legacy runtimes report console output through the `Console` domain;
    /// remap onto the modern handler.
    async fn on_console_message(&self, message: ConsoleMessage) {
        let call_type = match message.level.as_str() {
            "error" => "error",
            "warning" => "warning",
            other => {
                let _ = other;
                "log"
            }
        };
        let args = message.parameters.unwrap_or_else(|| {
            vec![RemoteObject {
                object_type: "string".to_string(),
                value: Some(json!(message.text)),
                ..Default::default()
            }]
        });
        self.on_console_api(ConsoleApiCalledParams {
            call_type: call_type.to_string(),
            args,
            stack_trace: None,
        })
        .await;
    }

    async fn on_exception_thrown(&self, params: ExceptionThrownParams) {
        let description = params.exception_details.display_text();
        let mapped = map_formatted_exception(&self.transformers, &description);
        self.sink.send_event(
            "output",
            Some(json!({ "category": "stderr", "output": format!("{mapped}\n") })),
        );
    }

    // Navigation.

    pub async fn continue_(&self) -> AdapterResult<()> {
        let client = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            state.pause.expecting_stop_reason = None;
            state.pause.expecting_resumed_event = true;
            state.pause.step_in_progress = false;
            client
        };
        client.resume().await?;
        Ok(())
    }

    pub async fn pause(&self) -> AdapterResult<()> {
        let client = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            state.pause.expecting_stop_reason = Some(StopReason::Pause);
            client
        };
        client.pause().await?;
        Ok(())
    }

    pub async fn step_over(&self) -> AdapterResult<()> {
        self.step(StepKind::Over, StopReason::Step).await
    }

    pub async fn step_into(&self) -> AdapterResult<()> {
        self.step(StepKind::Into, StopReason::Step).await
    }

    pub async fn step_out(&self) -> AdapterResult<()> {
        self.step(StepKind::Out, StopReason::Step).await
    }

    pub async fn step_back(&self) -> AdapterResult<()> {
        self.step(StepKind::Back, StopReason::Step).await
    }

    pub async fn reverse_continue(&self) -> AdapterResult<()> {
        let client = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            state.pause.expecting_stop_reason = None;
            state.pause.expecting_resumed_event = true;
            state.pause.step_in_progress = false;
            client
        };
        client.reverse_continue().await?;
        Ok(())
    }

    pub async fn restart_frame(&self, frame_id: i64) -> AdapterResult<()> {
        let (client, call_frame_id) = {
            let state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            let frame = state
                .frame_handles
                .get(frame_id)
                .ok_or(AdapterError::InvalidStackFrame(frame_id))?;
            if frame.call_frame_id.is_empty() {
                return Err(AdapterError::InvalidRequest(
                    "frame has no call frame id".to_string(),
                ));
            }
            (client, frame.call_frame_id.clone())
        };
        client.restart_frame(&call_frame_id).await?;
        self.step(StepKind::Into, StopReason::FrameEntry).await
    }

    async fn step(&self, kind: StepKind, reason: StopReason) -> AdapterResult<()> {
        let (client, gate_tx) = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            state.pause.expecting_stop_reason = Some(reason);
            state.pause.expecting_resumed_event = true;
            state.pause.step_in_progress = true;
            let (tx, rx) = watch::channel(false);
            state.pause.current_step = Some(rx);
            (client, tx)
        };

        let result = match kind {
            StepKind::Over => client.step_over().await,
            StepKind::Into => client.step_into().await,
            StepKind::Out => client.step_out().await,
            StepKind::Back => client.step_back().await,
        };
        // The response goes out as soon as this method returns; release any
        // stopped event waiting on it.
        let _ = gate_tx.send(true);
        result.map_err(Into::into)
    }

    // Breakpoints.

    pub async fn set_breakpoints(
        &self,
        args: SetBreakpointsArguments,
        request_seq: i64,
        ids: Option<Vec<i64>>,
    ) -> AdapterResult<Vec<Breakpoint>> {
        let (client, target_url) = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            let target_url = self.resolve_target_script_url(&mut state, &args);

            let Some(target_url) = target_url else {
                // Nothing to bind against yet; answer unverified and park the
                // request until a matching script shows up.
                let assigned: Vec<i64> = match &ids {
                    Some(ids) => ids.clone(),
                    None => args
                        .breakpoints
                        .iter()
                        .map(|_| state.breakpoint_ids.alloc())
                        .collect(),
                };
                if let Some(path) = args.source.path.as_deref() {
                    // Keyed by the target-side path, which is what script
                    // loads and source maps will later report.
                    let key = self.transformers.path.client_to_target(path);
                    state.breakpoints.pending.insert(
                        key,
                        PendingBreakpoint {
                            args: args.clone(),
                            ids: assigned.clone(),
                            request_seq,
                        },
                    );
                }
                return Ok(assigned
                    .into_iter()
                    .map(|id| Breakpoint {
                        id,
                        verified: false,
                        ..Default::default()
                    })
                    .collect());
            };

            (client, target_url)
        };

        let queue = {
            let state = self.state.lock().await;
            state.breakpoints.queue.clone()
        };
        let _serialized = queue.lock().await;

        let work = self.set_breakpoints_on_target(&client, &args, &target_url, ids.as_deref());
        tokio::pin!(work);
        match tokio::time::timeout(SET_BREAKPOINTS_TIMEOUT, &mut work).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    target: "kite.dap",
                    url = %target_url,
                    "setBreakpoints timed out after {:?}; still waiting for the runtime",
                    SET_BREAKPOINTS_TIMEOUT
                );
                work.await
            }
        }
    }

    fn resolve_target_script_url(
        &self,
        state: &mut AdapterState,
        args: &SetBreakpointsArguments,
    ) -> Option<String> {
        if let Some(reference) = args.source.source_reference.filter(|&r| r > 0) {
            let from_handle = state
                .source_handles
                .get(reference)
                .and_then(|container| container.script_id.clone())
                .and_then(|script_id| state.scripts.by_id(&script_id))
                .map(|script| script.url.clone());
            return from_handle.or_else(|| args.source.path.clone());
        }

        let path = args.source.path.as_deref()?;
        let target = self.transformers.path.client_to_target(path);
        if let Some(generated) = self
            .transformers
            .source_map
            .generated_path_from_authored(&target)
        {
            return Some(generated);
        }
        if !state.config.source_maps {
            return Some(target);
        }
        // With source maps on, an unknown path may still be authored; only
        // bind now if the runtime already reported this exact script.
        state.scripts.by_url(&target).map(|script| script.url.clone())
    }

    /// Serialized per-target work: clear whatever was committed for this URL
    /// (one at a time), then add the new set.
    async fn set_breakpoints_on_target(
        &self,
        client: &RdpClient,
        args: &SetBreakpointsArguments,
        target_url: &str,
        ids: Option<&[i64]>,
    ) -> AdapterResult<Vec<Breakpoint>> {
        let committed = {
            let mut state = self.state.lock().await;
            state.breakpoints.take_committed(target_url)
        };
        for runtime_id in committed {
            // Concurrent removes trip a runtime bug; strictly one at a time.
            if let Err(err) = client.remove_breakpoint(&runtime_id).await {
                tracing::debug!(target: "kite.dap", breakpoint = %runtime_id, error = %err, "removeBreakpoint failed");
            }
            let mut state = self.state.lock().await;
            state.breakpoints.hit_conditions.remove(&runtime_id);
            state.breakpoint_ids.unbind_runtime(&runtime_id);
        }

        let script = {
            let state = self.state.lock().await;
            state.scripts.by_url(target_url)
        };

        let mut results = Vec::with_capacity(args.breakpoints.len());
        for (index, requested) in args.breakpoints.iter().enumerate() {
            let hit_condition = match requested.hit_condition.as_deref() {
                Some(raw) => match HitCondition::parse(raw) {
                    Some(condition) => Some(condition),
                    None => {
                        let id = self.dap_breakpoint_id(None, ids, index).await;
                        results.push(Breakpoint {
                            id,
                            verified: false,
                            message: Some(format!("Invalid hit condition: {raw}")),
                            ..Default::default()
                        });
                        continue;
                    }
                },
                None => None,
            };

            let mut line = self.transformers.line_col.line_to_target(requested.line);
            let mut column = requested
                .column
                .map(|c| self.transformers.line_col.column_to_target(c));
            if let Some(path) = args.source.path.as_deref() {
                let target_path = self.transformers.path.client_to_target(path);
                if let Some((_, mapped_line, mapped_column)) = self
                    .transformers
                    .source_map
                    .authored_position_to_generated(&target_path, line, column.unwrap_or(0))
                {
                    line = mapped_line;
                    column = Some(mapped_column);
                }
            }

            if self.transformers.line_col.column_breakpoints_enabled() {
                if let Some(script) = &script {
                    if let Some(best) = self
                        .nearest_break_location(client, &script.script_id, line, column)
                        .await
                    {
                        column = Some(best);
                    }
                }
            }

            let added = self
                .add_one_breakpoint(client, target_url, script.as_deref(), line, column, requested)
                .await;

            match added {
                Ok((runtime_id, actual)) => {
                    let id = self
                        .dap_breakpoint_id(runtime_id.as_deref(), ids, index)
                        .await;
                    if let Some(runtime_id) = runtime_id {
                        let mut state = self.state.lock().await;
                        state.breakpoints.commit(target_url, runtime_id.clone());
                        if let Some(condition) = hit_condition {
                            state.breakpoints.hit_conditions.insert(
                                runtime_id,
                                HitConditionBreakpoint {
                                    num_hits: 0,
                                    condition,
                                },
                            );
                        }
                    }
                    match actual {
                        Some(location) => {
                            let (line, column) = self.to_client_location(
                                target_url,
                                location.line_number,
                                location.column_number.unwrap_or(0),
                            );
                            results.push(Breakpoint {
                                id,
                                verified: true,
                                line: Some(line),
                                column: Some(column),
                                ..Default::default()
                            });
                        }
                        None => results.push(Breakpoint {
                            id,
                            verified: false,
                            ..Default::default()
                        }),
                    }
                }
                Err(message) => {
                    let id = self.dap_breakpoint_id(None, ids, index).await;
                    results.push(Breakpoint {
                        id,
                        verified: false,
                        message: Some(message),
                        ..Default::default()
                    });
                }
            }
        }

        Ok(results)
    }

    /// Install one breakpoint. Synthetic eval scripts bind by script id; real
    /// URLs bind by regex so they survive reloads. The runtime's duplicate
    /// error is treated as success at the requested location, with no new
    /// runtime id.
    async fn add_one_breakpoint(
        &self,
        client: &RdpClient,
        target_url: &str,
        script: Option<&crate::scripts::Script>,
        line: u32,
        column: Option<u32>,
        requested: &crate::dap::SourceBreakpoint,
    ) -> Result<(Option<String>, Option<Location>), String> {
        let condition = requested.condition.as_deref();

        let result = if is_synthetic_url(target_url) {
            let Some(script) = script else {
                return Err(format!("no script loaded for {target_url}"));
            };
            client
                .set_breakpoint(&script.script_id, line, column, condition)
                .await
                .map(|response| (Some(response.breakpoint_id), Some(response.actual_location)))
        } else {
            client
                .set_breakpoint_by_url(&url_to_regex(target_url), line, column, condition)
                .await
                .map(|response| {
                    (
                        Some(response.breakpoint_id),
                        response.locations.into_iter().next(),
                    )
                })
        };

        match result {
            Ok(ok) => Ok(ok),
            Err(err) => {
                if err
                    .protocol_message()
                    .map(is_already_exists_error)
                    .unwrap_or(false)
                {
                    return Ok((
                        None,
                        Some(Location {
                            script_id: script
                                .map(|s| s.script_id.clone())
                                .unwrap_or_default(),
                            line_number: line,
                            column_number: column,
                        }),
                    ));
                }
                Err(err.to_string())
            }
        }
    }

    async fn dap_breakpoint_id(
        &self,
        runtime_id: Option<&str>,
        ids: Option<&[i64]>,
        index: usize,
    ) -> i64 {
        let mut state = self.state.lock().await;
        if let Some(runtime_id) = runtime_id {
            if let Some(existing) = state.breakpoint_ids.existing_dap_id(runtime_id) {
                return existing;
            }
            if let Some(&assigned) = ids.and_then(|ids| ids.get(index)) {
                state.breakpoint_ids.bind(assigned, runtime_id);
                return assigned;
            }
            return state.breakpoint_ids.dap_id_for(runtime_id);
        }
        if let Some(&assigned) = ids.and_then(|ids| ids.get(index)) {
            return assigned;
        }
        state.breakpoint_ids.alloc()
    }

    async fn nearest_break_location(
        &self,
        client: &RdpClient,
        script_id: &str,
        line: u32,
        requested_column: Option<u32>,
    ) -> Option<u32> {
        let start = Location {
            script_id: script_id.to_string(),
            line_number: line,
            column_number: Some(0),
        };
        let end = Location {
            script_id: script_id.to_string(),
            line_number: line + 1,
            column_number: Some(0),
        };
        let locations = client.get_possible_breakpoints(&start, Some(&end)).await.ok()?;
        let candidates = locations
            .into_iter()
            .filter(|l| l.line_number == line)
            .filter_map(|l| l.column_number);
        crate::breakpoints::nearest_column(requested_column.unwrap_or(0), candidates)
    }

    async fn drain_pending_breakpoints(&self, url: &str) {
        let pending = {
            let mut state = self.state.lock().await;
            state.breakpoints.pending.remove(url)
        };
        let Some(pending) = pending else { return };

        match self
            .set_breakpoints(pending.args.clone(), pending.request_seq, Some(pending.ids))
            .await
        {
            Ok(breakpoints) => {
                for breakpoint in breakpoints {
                    let body = json!({
                        "reason": "new",
                        "breakpoint": serde_json::to_value(&breakpoint).unwrap_or_default(),
                    });
                    self.sink.send_event("breakpoint", Some(body));
                }
            }
            Err(err) => {
                tracing::warn!(target: "kite.dap", url, error = %err, "draining pending breakpoints failed");
            }
        }
    }

    /// URLs of every script the runtime has reported, in URL order.
    pub async fn known_script_urls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .scripts
            .all()
            .iter()
            .map(|script| script.url.clone())
            .collect()
    }

    // Threads / stack / scopes / variables.

    pub async fn threads(&self) -> Vec<Thread> {
        let state = self.state.lock().await;
        vec![Thread {
            id: THREAD_ID,
            name: state.thread_name.clone(),
        }]
    }

    pub async fn stack_trace(
        &self,
        start_frame: Option<usize>,
        levels: Option<usize>,
    ) -> AdapterResult<(Vec<StackFrame>, usize)> {
        let mut state = self.state.lock().await;
        let params = state.pause.current.clone().ok_or(AdapterError::NoCallStack)?;

        let state = &mut *state;
        let cx = StackContext {
            transformers: &self.transformers,
            skip: &state.skip,
            smart_step: state.config.smart_step,
            source_maps: state.config.source_maps,
        };
        Ok(build_stack_trace(
            &cx,
            &mut state.frame_handles,
            &mut state.source_handles,
            &params,
            start_frame,
            levels,
        ))
    }

    pub async fn scopes(&self, frame_id: i64) -> AdapterResult<Vec<DapScope>> {
        let mut state = self.state.lock().await;
        if state.pause.current.is_none() {
            return Err(AdapterError::NoCallStack);
        }
        let frame = state
            .frame_handles
            .get(frame_id)
            .ok_or(AdapterError::InvalidStackFrame(frame_id))?
            .clone();

        let state = &mut *state;
        let cx = StackContext {
            transformers: &self.transformers,
            skip: &state.skip,
            smart_step: state.config.smart_step,
            source_maps: state.config.source_maps,
        };
        Ok(build_scopes(
            &cx,
            &mut state.variable_handles,
            &frame,
            state.exception.as_ref(),
        ))
    }

    pub async fn variables(
        &self,
        variables_reference: i64,
        filter: Option<&str>,
        start: Option<usize>,
        count: Option<usize>,
    ) -> Vec<Variable> {
        let mut state = self.state.lock().await;
        let Some(client) = state.client.clone() else {
            return Vec::new();
        };
        let Some(container) = state.variable_handles.get(variables_reference).cloned() else {
            return Vec::new();
        };

        let state = &mut *state;
        match expand_container(
            &client,
            &mut state.variable_handles,
            container,
            filter,
            start,
            count,
        )
        .await
        {
            Ok(variables) => variables,
            Err(err) => {
                tracing::warn!(target: "kite.dap", reference = variables_reference, error = %err, "variable expansion failed");
                Vec::new()
            }
        }
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> AdapterResult<Variable> {
        let mut state = self.state.lock().await;
        let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
        let container = state
            .variable_handles
            .get(variables_reference)
            .cloned()
            .ok_or(AdapterError::UnknownVariablesReference(variables_reference))?;

        let state = &mut *state;
        set_container_value(&client, &mut state.variable_handles, container, name, value).await
    }

    // Sources.

    pub async fn source(
        &self,
        source_reference: Option<i64>,
        path: Option<&str>,
    ) -> AdapterResult<String> {
        let (client, script_id, contents) = {
            let state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;

            if let Some(reference) = source_reference.filter(|&r| r > 0) {
                let container = state
                    .source_handles
                    .get(reference)
                    .ok_or(AdapterError::UnknownSourceReference(reference))?;
                (client, container.script_id.clone(), container.contents.clone())
            } else if let Some(path) = path {
                let encoded = encode_path_as_url(path);
                let script = state
                    .scripts
                    .by_url(&encoded)
                    .or_else(|| state.scripts.by_url(path))
                    .ok_or_else(|| {
                        AdapterError::InvalidRequest(format!("no script with path {path}"))
                    })?;
                (client, Some(script.script_id.clone()), None)
            } else {
                return Err(AdapterError::InvalidRequest(
                    "source request carries neither a sourceReference nor a path".to_string(),
                ));
            }
        };

        if let Some(contents) = contents {
            return Ok(contents);
        }
        let script_id = script_id.ok_or_else(|| {
            AdapterError::InvalidRequest("source handle has no script".to_string())
        })?;
        Ok(client.get_script_source(&script_id).await?)
    }

    pub async fn configuration_done(&self) -> AdapterResult<()> {
        Ok(())
    }

    pub async fn set_exception_breakpoints(&self, filters: &[String]) -> AdapterResult<()> {
        let client = {
            let state = self.state.lock().await;
            state.client.clone().ok_or(AdapterError::NotConnected)?
        };
        let state = if filters.iter().any(|f| f == "all") {
            "all"
        } else if filters.iter().any(|f| f == "uncaught") {
            "uncaught"
        } else {
            "none"
        };
        client.set_pause_on_exceptions(state).await?;
        Ok(())
    }

    // Evaluation.

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: Option<&str>,
    ) -> AdapterResult<EvaluateResponseBody> {
        if let Some(rest) = expression.strip_prefix(".scripts") {
            return self.scripts_command(rest).await;
        }

        // Wait out the post-step settling window first.
        let quiescence = {
            let state = self.state.lock().await;
            state.pause.remaining_quiescence()
        };
        if let Some(wait) = quiescence {
            tokio::time::sleep(wait).await;
        }

        let mut state = self.state.lock().await;
        let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
        let frame = frame_id.and_then(|id| state.frame_handles.get(id).cloned());

        let response = match frame {
            Some(frame) => {
                client
                    .evaluate_on_call_frame(&frame.call_frame_id, expression, true, false, true)
                    .await?
            }
            None => client.evaluate(expression, true, false, true).await?,
        };

        if let Some(details) = response.exception_details {
            let text = details.display_text();
            let message = if context != Some("repl") && is_unavailable_eval_error(&text) {
                EVAL_NOT_AVAILABLE_MSG.to_string()
            } else {
                text.lines().next().unwrap_or(&text).to_string()
            };
            return Err(AdapterError::Evaluate(message));
        }

        let state = &mut *state;
        let (result, variables_reference, indexed, named) =
            remote_object_to_result(&client, &mut state.variable_handles, &response.result).await;
        Ok(EvaluateResponseBody {
            result,
            variables_reference,
            indexed_variables: indexed,
            named_variables: named,
        })
    }

    /// `.scripts` lists everything the runtime has parsed; `.scripts <url>`
    /// dumps one script's source (truncated).
    async fn scripts_command(&self, rest: &str) -> AdapterResult<EvaluateResponseBody> {
        let arg = rest.trim().to_string();
        let (client, scripts) = {
            let state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
            (client, state.scripts.all())
        };

        let output = if arg.is_empty() {
            let mut lines = Vec::with_capacity(scripts.len());
            for script in &scripts {
                let client_path = self
                    .transformers
                    .path
                    .target_to_client(&script.url)
                    .unwrap_or_else(|| script.url.clone());
                lines.push(format!("› {} ({client_path})", script.url));
                for detail in self
                    .transformers
                    .source_map
                    .all_source_path_details(&script.url)
                {
                    lines.push(format!("    - {}", detail.path));
                }
            }
            format!("{}\n", lines.join("\n"))
        } else {
            let script = scripts
                .iter()
                .find(|s| s.url == arg || s.url.ends_with(&arg));
            match script {
                Some(script) => {
                    let source = client.get_script_source(&script.script_id).await?;
                    format!("{}\n", truncate_script_source(&source))
                }
                None => format!("No runtime script with url {arg}\n"),
            }
        };

        self.sink
            .send_event("output", Some(json!({ "category": "stdout", "output": output })));
        Ok(EvaluateResponseBody::default())
    }

    pub async fn completions(
        &self,
        text: &str,
        column: usize,
        frame_id: Option<i64>,
    ) -> AdapterResult<Vec<CompletionItem>> {
        let state = self.state.lock().await;
        let client = state.client.clone().ok_or(AdapterError::NotConnected)?;
        let frame = frame_id.and_then(|id| state.frame_handles.get(id).cloned());
        drop(state);

        let names: Vec<String> = match completion_target(text, column) {
            Some(target) => {
                let expression = completions_expression(&target);
                let response = match &frame {
                    Some(frame) => {
                        client
                            .evaluate_on_call_frame(
                                &frame.call_frame_id,
                                &expression,
                                true,
                                true,
                                false,
                            )
                            .await?
                    }
                    None => client.evaluate(&expression, true, true, false).await?,
                };
                if response.exception_details.is_some() {
                    Vec::new()
                } else {
                    response
                        .result
                        .value
                        .as_ref()
                        .and_then(|v| v.as_array())
                        .map(|levels| {
                            levels
                                .iter()
                                .filter_map(|level| level.as_array())
                                .flatten()
                                .filter_map(|name| name.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default()
                }
            }
            None => {
                // No member access to complete: union the names of every
                // scope of the active frame.
                let Some(frame) = frame else {
                    return Ok(Vec::new());
                };
                let mut names = Vec::new();
                for scope in &frame.scope_chain {
                    let Some(object_id) = &scope.object.object_id else {
                        continue;
                    };
                    if let Ok(response) =
                        client.get_properties(object_id, true, false, false).await
                    {
                        names.extend(response.result.into_iter().map(|p| p.name));
                    }
                }
                names
            }
        };

        Ok(filter_completion_names(names)
            .into_iter()
            .map(|label| CompletionItem {
                label,
                item_type: "property".to_string(),
            })
            .collect())
    }

    pub async fn exception_info(&self, thread_id: i64) -> AdapterResult<Value> {
        if thread_id != THREAD_ID {
            return Err(AdapterError::InvalidRequest(format!(
                "unknown threadId {thread_id}"
            )));
        }
        let exception = {
            let state = self.state.lock().await;
            state
                .exception
                .clone()
                .ok_or_else(|| AdapterError::InvalidRequest("no current exception".to_string()))?
        };

        let stack = exception
            .description
            .as_deref()
            .map(|description| map_formatted_exception(&self.transformers, description));

        Ok(json!({
            "exceptionId": exception.class_name.clone().unwrap_or_else(|| "Error".to_string()),
            "breakMode": "unhandled",
            "details": {
                "message": exception_text(Some(&exception)),
                "stackTrace": stack,
            }
        }))
    }

    // Skip toggling.

    pub async fn toggle_skip_file_status(
        &self,
        path: Option<String>,
        source_reference: Option<i64>,
    ) -> AdapterResult<()> {
        let (client, script, positions, patterns, refire) = {
            let mut state = self.state.lock().await;
            let client = state.client.clone().ok_or(AdapterError::NotConnected)?;

            let path = match (path, source_reference) {
                (Some(path), _) => self.transformers.path.client_to_target(&path),
                (None, Some(reference)) => state
                    .source_handles
                    .get(reference)
                    .and_then(|container| container.script_id.clone())
                    .and_then(|script_id| state.scripts.by_id(&script_id))
                    .map(|script| script.url.clone())
                    .ok_or(AdapterError::UnknownSourceReference(reference))?,
                (None, None) => {
                    return Err(AdapterError::InvalidRequest(
                        "toggleSkipFileStatus needs a path or a sourceReference".to_string(),
                    ))
                }
            };

            let params = state
                .pause
                .current
                .clone()
                .ok_or(AdapterError::NoCallStack)?;
            if !self.path_in_stack(&params, &path) {
                return Err(AdapterError::InvalidRequest(format!(
                    "can't toggle skipFile status for {path}: it is not in the current stack"
                )));
            }

            let generated = self
                .transformers
                .source_map
                .generated_path_from_authored(&path)
                .unwrap_or_else(|| path.clone());
            let has_map = !self
                .transformers
                .source_map
                .all_source_path_details(&generated)
                .is_empty();
            if generated == path && has_map {
                return Err(AdapterError::InvalidRequest(format!(
                    "can't toggle skipFile status for {path}: it maps to authored sources"
                )));
            }

            state.skip.toggle(&path);

            let details = self
                .transformers
                .source_map
                .all_source_path_details(&generated);
            let parent_skipped = state.skip.is_skipped(&generated);
            let positions = state.skip.blackboxed_ranges(parent_skipped, &details);
            let script = state.scripts.by_url(&generated);
            let patterns = state.skip.pattern_strings();
            let refire = state.pause.last_stopped_body.clone();

            (client, script, positions, patterns, refire)
        };

        self.submit_blackbox_patterns(&client, &patterns).await;
        if let Some(script) = script {
            self.submit_blackboxed_ranges(&client, &script.script_id, &positions)
                .await;
        }

        // Re-announce the pause so the client re-renders the stack with the
        // updated deemphasize hints.
        if let Some(body) = refire {
            self.sink.send_event("stopped", Some(body));
        }
        Ok(())
    }

    fn path_in_stack(&self, params: &PausedParams, path: &str) -> bool {
        params.call_frames.iter().any(|frame| {
            let url = if frame.url.is_empty() {
                crate::scripts::synthetic_url(&frame.location.script_id)
            } else {
                frame.url.clone()
            };
            if url == path {
                return true;
            }
            self.transformers
                .source_map
                .map_to_authored(
                    &url,
                    frame.location.line_number,
                    frame.location.column_number.unwrap_or(0),
                )
                .map(|mapped| mapped.source == path)
                .unwrap_or(false)
        })
    }

    fn to_client_location(&self, url: &str, line: u32, column: u32) -> (u32, u32) {
        let mapped = self.transformers.source_map.map_to_authored(url, line, column);
        let (line, column) = match mapped {
            Some(m) => (m.line, m.column),
            None => (line, column),
        };
        (
            self.transformers.line_col.line_to_client(line),
            self.transformers.line_col.column_to_client(column),
        )
    }
}

fn console_arg_preview(arg: &RemoteObject) -> String {
    match arg.object_type.as_str() {
        // Console text renders strings bare, not quoted.
        "string" => arg
            .value
            .as_ref()
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| arg.description.clone())
            .unwrap_or_default(),
        "function" => crate::variables::function_display(
            arg.description.as_deref().unwrap_or("function"),
        ),
        "object" if arg.subtype.as_deref() != Some("null") => {
            crate::variables::object_preview_string(arg)
        }
        _ => crate::variables::primitive_remote_object_value(arg),
    }
}

/// URL-encode the characters the script registry's URLs have encoded, so
/// path-keyed source lookups hit the same keys.
fn encode_path_as_url(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            c => out.push(c),
        }
    }
    out
}
