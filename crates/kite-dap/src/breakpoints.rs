//! Breakpoint bookkeeping: pending vs committed tables, hit-condition
//! predicates, and the URL-regex translation used for re-bindable
//! breakpoints.
//!
//! The set/clear orchestration against the runtime lives on the adapter; the
//! structures here hold the state it serializes over.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::dap::SetBreakpointsArguments;

/// A setBreakpoints request that could not bind yet (no script, no generated
/// path). Keyed by source URL; drained when a matching script is observed.
#[derive(Debug, Clone)]
pub struct PendingBreakpoint {
    pub args: SetBreakpointsArguments,
    pub ids: Vec<i64>,
    pub request_seq: i64,
}

/// `shouldPause` predicate compiled from a hit-condition string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOp {
    Gt,
    Ge,
    Eq,
    Lt,
    Le,
    Mod,
}

#[derive(Debug, Clone, Copy)]
pub struct HitCondition {
    op: HitOp,
    operand: u64,
}

impl HitCondition {
    /// Parse `^(>|>=|=|<|<=|%)?\s*([0-9]+)$`. The default operator is `>=`;
    /// `=` compares for equality.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (op, rest) = if let Some(rest) = raw.strip_prefix(">=") {
            (HitOp::Ge, rest)
        } else if let Some(rest) = raw.strip_prefix("<=") {
            (HitOp::Le, rest)
        } else if let Some(rest) = raw.strip_prefix('>') {
            (HitOp::Gt, rest)
        } else if let Some(rest) = raw.strip_prefix('<') {
            (HitOp::Lt, rest)
        } else if let Some(rest) = raw.strip_prefix('=') {
            (HitOp::Eq, rest)
        } else if let Some(rest) = raw.strip_prefix('%') {
            (HitOp::Mod, rest)
        } else {
            (HitOp::Ge, raw)
        };

        let rest = rest.trim_start();
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let operand: u64 = rest.parse().ok()?;

        Some(Self { op, operand })
    }

    pub fn should_pause(&self, num_hits: u64) -> bool {
        match self.op {
            HitOp::Gt => num_hits > self.operand,
            HitOp::Ge => num_hits >= self.operand,
            HitOp::Eq => num_hits == self.operand,
            HitOp::Lt => num_hits < self.operand,
            HitOp::Le => num_hits <= self.operand,
            HitOp::Mod => self.operand != 0 && num_hits % self.operand == 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HitConditionBreakpoint {
    pub num_hits: u64,
    pub condition: HitCondition,
}

/// DAP breakpoint id ↔ runtime breakpoint id, with reverse lookup.
///
/// Ids survive re-binding: a pending breakpoint keeps the id it was first
/// answered with, bound to the runtime id once the script loads.
#[derive(Default)]
pub struct BreakpointIdRegistry {
    next: i64,
    by_runtime: HashMap<String, i64>,
    by_dap: HashMap<i64, String>,
}

impl BreakpointIdRegistry {
    /// A fresh id with no runtime binding yet.
    pub fn alloc(&mut self) -> i64 {
        self.next += 1;
        self.next
    }

    /// The stable id for a runtime breakpoint, allocating on first sight.
    pub fn dap_id_for(&mut self, runtime_id: &str) -> i64 {
        if let Some(&id) = self.by_runtime.get(runtime_id) {
            return id;
        }
        let id = self.alloc();
        self.bind(id, runtime_id);
        id
    }

    pub fn existing_dap_id(&self, runtime_id: &str) -> Option<i64> {
        self.by_runtime.get(runtime_id).copied()
    }

    pub fn bind(&mut self, dap_id: i64, runtime_id: &str) {
        self.by_runtime.insert(runtime_id.to_string(), dap_id);
        self.by_dap.insert(dap_id, runtime_id.to_string());
    }

    pub fn runtime_id(&self, dap_id: i64) -> Option<&str> {
        self.by_dap.get(&dap_id).map(String::as_str)
    }

    pub fn unbind_runtime(&mut self, runtime_id: &str) {
        if let Some(dap_id) = self.by_runtime.remove(runtime_id) {
            self.by_dap.remove(&dap_id);
        }
    }
}

#[derive(Default)]
pub struct BreakpointState {
    /// Source URL -> breakpoints waiting for their script to load.
    pub pending: HashMap<String, PendingBreakpoint>,
    /// Script URL -> runtime breakpoint ids committed for it.
    pub committed: HashMap<String, Vec<String>>,
    /// Runtime breakpoint id -> hit-condition counter.
    pub hit_conditions: HashMap<String, HitConditionBreakpoint>,
    /// Serializes set-breakpoints work: "clear then add" for request N
    /// completes before request N+1 begins.
    pub queue: Arc<Mutex<()>>,
}

impl BreakpointState {
    pub fn take_committed(&mut self, url: &str) -> Vec<String> {
        self.committed.remove(url).unwrap_or_default()
    }

    pub fn commit(&mut self, url: &str, breakpoint_id: String) {
        self.committed
            .entry(url.to_string())
            .or_default()
            .push(breakpoint_id);
    }

    pub fn on_contexts_cleared(&mut self) {
        self.committed.clear();
        self.hit_conditions.clear();
        self.queue = Arc::new(Mutex::new(()));
    }
}

/// Translate a script URL or path into the case-insensitive regex the
/// runtime matches re-bindable breakpoints with. Every ASCII letter becomes
/// a two-member character class, and both slash directions are accepted, so
/// `C:\app\x.js` binds however the runtime spells the path.
pub fn url_to_regex(url: &str) -> String {
    let mut out = String::with_capacity(url.len() * 4);
    for c in url.chars() {
        match c {
            '/' | '\\' => out.push_str("[\\/\\\\]"),
            c if c.is_ascii_alphabetic() => {
                out.push('[');
                out.push(c.to_ascii_lowercase());
                out.push(c.to_ascii_uppercase());
                out.push(']');
            }
            c => {
                if "^$.|?*+()[]{}".contains(c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
    }
    out
}

/// Pick the closest valid break location on a line: a same-line column at or
/// after the requested one is preferred, otherwise the nearest column on the
/// line.
pub fn nearest_column(
    requested: u32,
    candidates: impl IntoIterator<Item = u32>,
) -> Option<u32> {
    let mut best_after: Option<u32> = None;
    let mut best_any: Option<u32> = None;

    for col in candidates {
        if col >= requested && best_after.map(|b| col < b).unwrap_or(true) {
            best_after = Some(col);
        }
        let dist = col.abs_diff(requested);
        if best_any.map(|b| dist < b.abs_diff(requested)).unwrap_or(true) {
            best_any = Some(col);
        }
    }

    best_after.or(best_any)
}

/// Whether a runtime set-breakpoint failure is the benign duplicate error.
pub fn is_already_exists_error(message: &str) -> bool {
    message.contains("Breakpoint at specified location already exists.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn default_operator_is_at_least() {
        let cond = HitCondition::parse("5").unwrap();
        assert!(!cond.should_pause(4));
        assert!(cond.should_pause(5));
        assert!(cond.should_pause(6));
    }

    #[test]
    fn greater_than() {
        let cond = HitCondition::parse("> 2").unwrap();
        assert!(!cond.should_pause(1));
        assert!(!cond.should_pause(2));
        assert!(cond.should_pause(3));
        assert!(cond.should_pause(4));
    }

    #[test]
    fn modulo_pauses_every_nth_hit() {
        let cond = HitCondition::parse("% 3").unwrap();
        let pauses: Vec<u64> = (1..=9).filter(|&n| cond.should_pause(n)).collect();
        assert_eq!(pauses, vec![3, 6, 9]);
    }

    #[test]
    fn equals_is_equality_not_a_noop() {
        let cond = HitCondition::parse("=2").unwrap();
        assert!(!cond.should_pause(1));
        assert!(cond.should_pause(2));
        assert!(!cond.should_pause(3));
    }

    #[test]
    fn rejects_garbage() {
        assert!(HitCondition::parse("").is_none());
        assert!(HitCondition::parse("abc").is_none());
        assert!(HitCondition::parse("% x").is_none());
        assert!(HitCondition::parse("5 apples").is_none());
        assert!(HitCondition::parse(">=").is_none());
    }

    #[test]
    fn url_regex_matches_case_insensitively_and_both_slashes() {
        let source = url_to_regex("C:/app/Main.js");
        let regex = Regex::new(&source).unwrap();
        assert!(regex.is_match("c:/app/main.js"));
        assert!(regex.is_match("C:\\APP\\MAIN.JS"));
        assert!(!regex.is_match("c:/app/other.js"));
    }

    #[test]
    fn url_regex_escapes_metacharacters() {
        let source = url_to_regex("file:///a+b (1).js");
        let regex = Regex::new(&source).unwrap();
        assert!(regex.is_match("file:///a+b (1).js"));
        assert!(!regex.is_match("file:///aab (1).js"));
    }

    #[test]
    fn nearest_column_prefers_at_or_after_requested() {
        assert_eq!(nearest_column(10, [4, 12, 30]), Some(12));
        assert_eq!(nearest_column(10, [2, 8]), Some(8));
        assert_eq!(nearest_column(10, []), None);
    }

    #[test]
    fn breakpoint_ids_are_stable_per_runtime_id() {
        let mut ids = BreakpointIdRegistry::default();
        let a = ids.dap_id_for("rt-1");
        let b = ids.dap_id_for("rt-2");
        assert_ne!(a, b);
        assert_eq!(ids.dap_id_for("rt-1"), a);
        assert_eq!(ids.runtime_id(a), Some("rt-1"));
        assert_eq!(ids.existing_dap_id("rt-2"), Some(b));
    }

    #[test]
    fn pending_ids_can_be_bound_later() {
        let mut ids = BreakpointIdRegistry::default();
        let pending = ids.alloc();
        assert_eq!(ids.runtime_id(pending), None);
        ids.bind(pending, "rt-9");
        assert_eq!(ids.dap_id_for("rt-9"), pending);

        ids.unbind_runtime("rt-9");
        assert_eq!(ids.existing_dap_id("rt-9"), None);
        assert_ne!(ids.dap_id_for("rt-9"), pending);
    }

    #[test]
    fn contexts_cleared_resets_runtime_state() {
        let mut state = BreakpointState::default();
        state.commit("file:///a.js", "bp1".to_string());
        state.hit_conditions.insert(
            "bp1".to_string(),
            HitConditionBreakpoint {
                num_hits: 2,
                condition: HitCondition::parse("%2").unwrap(),
            },
        );
        state.on_contexts_cleared();
        assert!(state.committed.is_empty());
        assert!(state.hit_conditions.is_empty());
    }
}
