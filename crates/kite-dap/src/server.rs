//! The stdio DAP server loop: framing, request dispatch, and response/event
//! sequencing. Requests are handled one at a time; everything interesting
//! happens inside [`DebugAdapter`].

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use kite_rdp::{RdpClient, RdpError};

use crate::adapter::DebugAdapter;
use crate::config::AttachConfig;
use crate::dap::{self, codec, make_event, make_response, EventSink, Request};
use crate::error::AdapterResult;
use crate::transform::Transformers;

/// Opens the runtime connection for an `attach` request. The WebSocket
/// transport (and the `/json/list` discovery handshake) live outside this
/// crate; embedders supply a connector over their transport of choice.
#[async_trait]
pub trait RdpConnector: Send + Sync {
    async fn connect(&self, config: &AttachConfig) -> Result<RdpClient, RdpError>;
}

/// Connector used when no transport has been linked in.
pub struct UnsupportedConnector;

#[async_trait]
impl RdpConnector for UnsupportedConnector {
    async fn connect(&self, _config: &AttachConfig) -> Result<RdpClient, RdpError> {
        Err(RdpError::Protocol {
            code: 0,
            message: "no runtime transport is configured in this build".to_string(),
        })
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
}

impl EventSink for ChannelSink {
    fn send_event(&self, event: &str, body: Option<Value>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let event = make_event(seq, event, body);
        let _ = self
            .tx
            .send(serde_json::to_value(event).unwrap_or_else(|_| json!({})));
    }
}

pub async fn run_stdio(connector: Arc<dyn RdpConnector>) -> anyhow::Result<()> {
    run(
        tokio::io::stdin(),
        tokio::io::stdout(),
        connector,
        Transformers::default(),
    )
    .await
}

pub async fn run<R, W>(
    reader: R,
    writer: W,
    connector: Arc<dyn RdpConnector>,
    transformers: Transformers,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let seq = Arc::new(AtomicI64::new(1));

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            let bytes = match serde_json::to_vec(&message) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let mut framed = Vec::with_capacity(bytes.len() + 32);
            if codec::write_raw_message(&mut framed, &bytes).is_err() {
                break;
            }
            if writer.write_all(&framed).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let sink = Arc::new(ChannelSink {
        tx: out_tx.clone(),
        seq: seq.clone(),
    });
    let adapter = DebugAdapter::new(sink, transformers);

    let mut reader = BufReader::new(reader);
    loop {
        let Some(body) = codec::read_raw_message(&mut reader).await? else {
            break;
        };
        let request: Request = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(target: "kite.dap", error = %err, "dropping unparseable DAP message");
                continue;
            }
        };
        if request.message_type != "request" {
            continue;
        }

        let is_disconnect = matches!(request.command.as_str(), "disconnect" | "terminate");
        dispatch(&adapter, connector.as_ref(), &request, &out_tx, &seq).await;
        if is_disconnect {
            break;
        }
    }

    adapter.disconnect(false).await;
    // The writer drains once every sender is gone: the local handle, the
    // adapter's sink, and the event pump's clone (released by disconnect).
    drop(adapter);
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(
    adapter: &DebugAdapter,
    connector: &dyn RdpConnector,
    request: &Request,
    out_tx: &mpsc::UnboundedSender<Value>,
    seq: &Arc<AtomicI64>,
) {
    let result = handle_request(adapter, connector, request).await;
    let (success, body, message) = match result {
        Ok(body) => (true, body, None),
        Err(err) => (false, None, Some(err.to_string())),
    };

    let response_seq = seq.fetch_add(1, Ordering::Relaxed);
    let response = make_response(response_seq, request, success, body, message);
    let _ = out_tx.send(serde_json::to_value(response).unwrap_or_else(|_| json!({})));
}

async fn handle_request(
    adapter: &DebugAdapter,
    connector: &dyn RdpConnector,
    request: &Request,
) -> AdapterResult<Option<Value>> {
    fn args<T: serde::de::DeserializeOwned + Default>(request: &Request) -> T {
        serde_json::from_value(request.arguments.clone()).unwrap_or_default()
    }

    match request.command.as_str() {
        "initialize" => {
            let capabilities = adapter.initialize(args(request)).await?;
            Ok(Some(serde_json::to_value(capabilities).unwrap_or_default()))
        }
        "attach" => {
            let config: AttachConfig = args(request);
            let client = connector.connect(&config).await?;
            adapter.attach(client, config).await?;
            Ok(None)
        }
        "launch" => Err(crate::error::AdapterError::InvalidRequest(
            "launch is not supported; attach to a running runtime".to_string(),
        )),
        "configurationDone" => {
            adapter.configuration_done().await?;
            Ok(None)
        }
        "setBreakpoints" => {
            let arguments: dap::SetBreakpointsArguments = args(request);
            let breakpoints = adapter
                .set_breakpoints(arguments, request.seq, None)
                .await?;
            Ok(Some(json!({ "breakpoints": breakpoints })))
        }
        "setExceptionBreakpoints" => {
            let arguments: dap::SetExceptionBreakpointsArguments = args(request);
            adapter.set_exception_breakpoints(&arguments.filters).await?;
            Ok(None)
        }
        "threads" => Ok(Some(json!({ "threads": adapter.threads().await }))),
        "stackTrace" => {
            let arguments: dap::StackTraceArguments = args(request);
            let (frames, total) = adapter
                .stack_trace(arguments.start_frame, arguments.levels)
                .await?;
            Ok(Some(json!({ "stackFrames": frames, "totalFrames": total })))
        }
        "scopes" => {
            let arguments: dap::ScopesArguments =
                serde_json::from_value(request.arguments.clone()).map_err(|err| {
                    crate::error::AdapterError::InvalidRequest(err.to_string())
                })?;
            let scopes = adapter.scopes(arguments.frame_id).await?;
            Ok(Some(json!({ "scopes": scopes })))
        }
        "variables" => {
            let arguments: dap::VariablesArguments = args(request);
            let variables = adapter
                .variables(
                    arguments.variables_reference,
                    arguments.filter.as_deref(),
                    arguments.start,
                    arguments.count,
                )
                .await;
            Ok(Some(json!({ "variables": variables })))
        }
        "setVariable" => {
            let arguments: dap::SetVariableArguments =
                serde_json::from_value(request.arguments.clone()).map_err(|err| {
                    crate::error::AdapterError::InvalidRequest(err.to_string())
                })?;
            let variable = adapter
                .set_variable(
                    arguments.variables_reference,
                    &arguments.name,
                    &arguments.value,
                )
                .await?;
            Ok(Some(json!({
                "value": variable.value,
                "variablesReference": variable.variables_reference,
            })))
        }
        "source" => {
            let arguments: dap::SourceArguments = args(request);
            let reference = arguments
                .source_reference
                .or_else(|| arguments.source.as_ref().and_then(|s| s.source_reference));
            let path = arguments.source.as_ref().and_then(|s| s.path.clone());
            let content = adapter.source(reference, path.as_deref()).await?;
            Ok(Some(json!({ "content": content })))
        }
        "continue" => {
            adapter.continue_().await?;
            Ok(Some(json!({ "allThreadsContinued": true })))
        }
        "next" => {
            adapter.step_over().await?;
            Ok(None)
        }
        "stepIn" => {
            adapter.step_into().await?;
            Ok(None)
        }
        "stepOut" => {
            adapter.step_out().await?;
            Ok(None)
        }
        "stepBack" => {
            adapter.step_back().await?;
            Ok(None)
        }
        "reverseContinue" => {
            adapter.reverse_continue().await?;
            Ok(None)
        }
        "pause" => {
            adapter.pause().await?;
            Ok(None)
        }
        "restartFrame" => {
            let arguments: dap::RestartFrameArguments =
                serde_json::from_value(request.arguments.clone()).map_err(|err| {
                    crate::error::AdapterError::InvalidRequest(err.to_string())
                })?;
            adapter.restart_frame(arguments.frame_id).await?;
            Ok(None)
        }
        "evaluate" => {
            let arguments: dap::EvaluateArguments = args(request);
            let body = adapter
                .evaluate(
                    &arguments.expression,
                    arguments.frame_id,
                    arguments.context.as_deref(),
                )
                .await?;
            Ok(Some(serde_json::to_value(body).unwrap_or_default()))
        }
        "completions" => {
            let arguments: dap::CompletionsArguments = args(request);
            let targets = adapter
                .completions(&arguments.text, arguments.column, arguments.frame_id)
                .await?;
            Ok(Some(json!({ "targets": targets })))
        }
        "exceptionInfo" => {
            let arguments: dap::ExceptionInfoArguments =
                serde_json::from_value(request.arguments.clone()).map_err(|err| {
                    crate::error::AdapterError::InvalidRequest(err.to_string())
                })?;
            Ok(Some(adapter.exception_info(arguments.thread_id).await?))
        }
        "toggleSkipFileStatus" => {
            let arguments: dap::ToggleSkipFileStatusArguments = args(request);
            adapter
                .toggle_skip_file_status(arguments.path, arguments.source_reference)
                .await?;
            Ok(None)
        }
        "disconnect" | "terminate" => {
            let arguments: dap::DisconnectArguments = args(request);
            adapter.disconnect(arguments.restart).await;
            Ok(None)
        }
        other => Err(crate::error::AdapterError::InvalidRequest(format!(
            "unrecognized request: {other}"
        ))),
    }
}
