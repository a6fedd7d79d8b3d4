//! Typed client for the Chrome-style remote debugging protocol.
//!
//! This crate provides:
//! - Serde models of the `Debugger`/`Runtime`/`Console` domain surface the
//!   debug adapter consumes.
//! - [`RdpClient`], an async RPC client with typed method wrappers and a
//!   broadcast event stream, generic over a text-frame transport.
//! - An in-process [`mock::MockRuntime`] for tests.
//!
//! The production WebSocket transport plugs in behind [`transport::RdpTransport`];
//! this crate deliberately does not open sockets itself.

pub mod client;
pub mod mock;
pub mod transport;
pub mod types;

pub use client::{RdpClient, RdpClientConfig};
pub use types::{
    BreakLocation, BreakpointResolvedParams, CallArgument, CallFrame, ConsoleApiCalledParams,
    ConsoleMessage, EvaluateResponse, ExceptionDetails, ExceptionThrownParams,
    GetPropertiesResponse, InternalPropertyDescriptor, Location, ObjectPreview, PausedParams,
    PropertyDescriptor, PropertyPreview, RdpError, RdpEvent, RemoteObject, Result,
    RuntimeCallFrame, Scope, ScriptParsedParams, ScriptPosition, SetBreakpointByUrlResponse,
    SetBreakpointResponse, StackTrace,
};
