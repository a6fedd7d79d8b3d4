//! Pause state: the current notification, expected stop reasons for
//! in-flight navigation, and the pause-cause classification.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use kite_rdp::{PausedParams, RemoteObject};

use crate::breakpoints::HitConditionBreakpoint;

/// How long a stopped event waits for its step response to go out first.
pub const STEP_RESPONSE_CEILING: Duration = Duration::from_millis(300);
/// Post-step settling window evaluations wait on.
pub const POST_STEP_QUIESCENCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exception,
    PromiseRejection,
    Breakpoint,
    Step,
    Pause,
    DebuggerStatement,
    FrameEntry,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Exception => "exception",
            StopReason::PromiseRejection => "promise_rejection",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
            StopReason::DebuggerStatement => "debugger_statement",
            StopReason::FrameEntry => "frame_entry",
        }
    }
}

#[derive(Default)]
pub struct PauseState {
    /// Non-empty iff the runtime is paused from our perspective.
    pub current: Option<PausedParams>,
    pub expecting_stop_reason: Option<StopReason>,
    pub expecting_resumed_event: bool,
    /// The last navigation was a step (drives the post-step quiescence).
    pub step_in_progress: bool,
    /// Completed when the response to the inducing step request has been
    /// delivered; the stopped event waits on it (bounded).
    pub current_step: Option<watch::Receiver<bool>>,
    /// Evaluations wait until this instant after a step-induced resume.
    pub quiescence_until: Option<Instant>,
    /// The last emitted stopped body, re-fired after a skip toggle.
    pub last_stopped_body: Option<serde_json::Value>,
}

impl PauseState {
    pub fn remaining_quiescence(&self) -> Option<Duration> {
        let until = self.quiescence_until?;
        until.checked_duration_since(Instant::now())
    }
}

/// What to do with a paused notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDisposition {
    Stop(StopReason),
    /// A hit-condition miss: resume without surfacing anything.
    SilentResume,
}

/// Classify the cause of a pause and advance hit-condition counters.
///
/// Exceptions and promise rejections win outright. A breakpoint hit counts
/// against any hit conditions; a miss is silent unless the user had just
/// stepped or paused. With nothing else to go on, an expected reason from an
/// in-flight navigation applies, and the fallback is a `debugger` statement.
pub fn classify_pause(
    params: &PausedParams,
    expecting: Option<StopReason>,
    hit_conditions: &mut HashMap<String, HitConditionBreakpoint>,
) -> (PauseDisposition, Option<RemoteObject>) {
    match params.reason.as_str() {
        "exception" => {
            let exception = exception_from_data(params);
            return (PauseDisposition::Stop(StopReason::Exception), exception);
        }
        "promiseRejection" => {
            let exception = exception_from_data(params);
            return (
                PauseDisposition::Stop(StopReason::PromiseRejection),
                exception,
            );
        }
        _ => {}
    }

    let hit = params
        .hit_breakpoints
        .as_deref()
        .unwrap_or_default();
    if !hit.is_empty() {
        let mut conditions_missed = false;
        for breakpoint_id in hit {
            if let Some(hc) = hit_conditions.get_mut(breakpoint_id) {
                hc.num_hits += 1;
                if expecting.is_none() && !hc.condition.should_pause(hc.num_hits) {
                    conditions_missed = true;
                }
            }
        }
        if conditions_missed {
            return (PauseDisposition::SilentResume, None);
        }
        return (PauseDisposition::Stop(StopReason::Breakpoint), None);
    }

    if let Some(reason) = expecting {
        return (PauseDisposition::Stop(reason), None);
    }

    (PauseDisposition::Stop(StopReason::DebuggerStatement), None)
}

fn exception_from_data(params: &PausedParams) -> Option<RemoteObject> {
    params
        .data
        .clone()
        .and_then(|data| serde_json::from_value(data).ok())
}

/// First line of the exception description, used as the stopped event text.
pub fn exception_text(exception: Option<&RemoteObject>) -> Option<String> {
    let description = exception?.description.as_deref()?;
    Some(description.lines().next().unwrap_or(description).to_string())
}
