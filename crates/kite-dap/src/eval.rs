//! Evaluation-path helpers: completion-target parsing, the prototype-chain
//! walk used for member completions, exception stack-trace remapping, and
//! `.scripts` output shaping.

use regex::Regex;
use std::sync::OnceLock;

use crate::transform::Transformers;

/// Expressions longer than this are truncated in `.scripts <url>` output.
pub const SCRIPT_DUMP_MAX_CHARS: usize = 100_000;
pub const SCRIPT_DUMP_TRUNCATION_MARKER: &str = "[⋯]";

/// The REPL-visible message for evaluation errors outside the console.
pub const EVAL_NOT_AVAILABLE_MSG: &str = "not available";

/// Walk the prototype chain of `expr` and collect own property names per
/// level. Evaluated with `returnByValue`.
pub fn completions_expression(expr: &str) -> String {
    format!(
        "(function(x) {{ var a = []; for (var o = x; o; o = o.__proto__) {{ a.push(Object.getOwnPropertyNames(o)); }} return a; }})({expr})"
    )
}

/// The expression to complete members of: the text up to the caret, cut at
/// its last `.`. `None` means there is no member access to complete.
pub fn completion_target(text: &str, column: usize) -> Option<String> {
    let end = column.saturating_sub(1).min(text.len());
    let prefix = &text[..end];
    let dot = prefix.rfind('.')?;
    let target = prefix[..dot].trim();
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

/// Dedupe completion names, dropping numeric (index) names.
pub fn filter_completion_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| !name.is_empty() && !name.bytes().all(|b| b.is_ascii_digit()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

pub fn truncate_script_source(source: &str) -> String {
    if source.chars().count() <= SCRIPT_DUMP_MAX_CHARS {
        return source.to_string();
    }
    let truncated: String = source.chars().take(SCRIPT_DUMP_MAX_CHARS).collect();
    format!("{truncated}{SCRIPT_DUMP_TRUNCATION_MARKER}")
}

fn stack_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(\s+at .*?\s*\(?)([^ ]+):(\d+):(\d+)(\)?)$").expect("stack line regex")
    })
}

/// Translate the `file:line:column` portions of a formatted exception stack
/// through the path and source-map transformers. Lines that don't look like
/// stack frames are returned verbatim.
pub fn map_formatted_exception(transformers: &Transformers, text: &str) -> String {
    let regex = stack_line_regex();
    let mut out = Vec::new();

    for line in text.lines() {
        let Some(captures) = regex.captures(line) else {
            out.push(line.to_string());
            continue;
        };

        let prefix = &captures[1];
        let file = &captures[2];
        let suffix = &captures[5];
        let line_number: u32 = match captures[3].parse() {
            Ok(v) => v,
            Err(_) => {
                out.push(line.to_string());
                continue;
            }
        };
        let column: u32 = captures[4].parse().unwrap_or(0);

        // Formatted stacks are 1-based; the transformers speak 0-based.
        let mapped = transformers.source_map.map_to_authored(
            file,
            line_number.saturating_sub(1),
            column,
        );
        let (file, line_number, column) = match mapped {
            Some(m) => (m.source, m.line + 1, m.column),
            None => (file.to_string(), line_number, column),
        };
        let file = transformers
            .path
            .target_to_client(&file)
            .unwrap_or(file);

        out.push(format!("{prefix}{file}:{line_number}:{column}{suffix}"));
    }

    out.join("\n")
}

/// Whether a runtime evaluation error should be replaced with the generic
/// "not available" message outside the REPL context.
pub fn is_unavailable_eval_error(message: &str) -> bool {
    message.starts_with("ReferenceError:") || message.starts_with("TypeError:")
}
