//! Skip-file (blackbox) engine: a compiled pattern set plus per-path
//! overrides, and the per-script blackboxed-range computation submitted to
//! the runtime.

use std::collections::HashMap;

use regex::Regex;

use kite_rdp::ScriptPosition;

use crate::transform::SourcePathDetails;

#[derive(Default)]
pub struct SkipEngine {
    patterns: Vec<Regex>,
    statuses: HashMap<String, bool>,
}

impl SkipEngine {
    /// Compile the configured skip set. Glob entries starting with `!` are
    /// not supported and are skipped with a warning; `skip_file_reg_exps`
    /// entries are appended verbatim.
    pub fn new(skip_files: &[String], skip_file_reg_exps: &[String]) -> Self {
        let mut patterns = Vec::new();

        for glob in skip_files {
            if let Some(rest) = glob.strip_prefix('!') {
                tracing::warn!(
                    target: "kite.dap",
                    pattern = rest,
                    "ignoring skipFiles entry: negation ('!') is not supported"
                );
                continue;
            }
            match Regex::new(&glob_to_regex(glob)) {
                Ok(regex) => patterns.push(regex),
                Err(err) => {
                    tracing::warn!(target: "kite.dap", pattern = %glob, error = %err, "ignoring unparseable skipFiles entry");
                }
            }
        }

        for raw in skip_file_reg_exps {
            match Regex::new(raw) {
                Ok(regex) => patterns.push(regex),
                Err(err) => {
                    tracing::warn!(target: "kite.dap", pattern = %raw, error = %err, "ignoring unparseable skipFileRegExps entry");
                }
            }
        }

        Self {
            patterns,
            statuses: HashMap::new(),
        }
    }

    /// Classification for a path: an explicit status wins, then the pattern
    /// set, then undefined.
    pub fn should_skip(&self, path: &str) -> Option<bool> {
        if let Some(&status) = self.statuses.get(path) {
            return Some(status);
        }
        if self.patterns.iter().any(|p| p.is_match(path)) {
            return Some(true);
        }
        None
    }

    pub fn is_skipped(&self, path: &str) -> bool {
        self.should_skip(path).unwrap_or(false)
    }

    /// Flip the classification of `path`, recording it as an explicit status
    /// and editing the pattern list so future scripts inherit the decision.
    /// Returns the new classification.
    pub fn toggle(&mut self, path: &str) -> bool {
        let newly_skipped = !self.is_skipped(path);
        self.statuses.insert(path.to_string(), newly_skipped);

        if newly_skipped {
            if let Ok(regex) = Regex::new(&format!("^{}$", regex::escape(path))) {
                self.patterns.push(regex);
            }
        } else {
            self.patterns.retain(|p| !p.is_match(path));
        }

        newly_skipped
    }

    /// Pattern list to install runtime-wide via `setBlackboxPatterns`.
    pub fn pattern_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// Blackboxed ranges of a source-mapped script.
    ///
    /// Walks the authored sources in generated order, emitting a boundary at
    /// each transition between skipped and non-skipped classification. If the
    /// generated script itself is skipped, the ranges start at `{0, 0}`.
    pub fn blackboxed_ranges(
        &self,
        parent_is_skipped: bool,
        sources: &[SourcePathDetails],
    ) -> Vec<ScriptPosition> {
        let mut positions = Vec::new();
        if parent_is_skipped {
            positions.push(ScriptPosition {
                line_number: 0,
                column_number: 0,
            });
        }

        let mut in_lib = parent_is_skipped;
        for source in sources {
            let skipped = self.is_skipped(&source.path);
            if skipped != in_lib {
                positions.push(ScriptPosition {
                    line_number: source.start_line,
                    column_number: source.start_column,
                });
                in_lib = skipped;
            }
        }

        positions
    }
}

/// Translate one skipFiles glob into a regex source string. `**` crosses
/// path separators, `*` does not, `?` matches a single character. Matching
/// is case-insensitive to mirror URL matching in the runtime.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 8);
    out.push_str("(?i)^");

    let bytes = glob.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                    out.push_str(".*");
                    i += 2;
                    // Collapse `**/` so `**/foo.js` also matches a bare `foo.js`.
                    if i < bytes.len() && (bytes[i] == b'/' || bytes[i] == b'\\') {
                        i += 1;
                    }
                    continue;
                }
                out.push_str("[^/\\\\]*");
            }
            b'?' => out.push('.'),
            b'/' | b'\\' => out.push_str("[/\\\\]"),
            c => {
                let c = c as char;
                if regex_special(c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
        i += 1;
    }

    out.push('$');
    out
}

fn regex_special(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(globs: &[&str]) -> SkipEngine {
        let globs: Vec<String> = globs.iter().map(|s| s.to_string()).collect();
        SkipEngine::new(&globs, &[])
    }

    fn details(path: &str, line: u32) -> SourcePathDetails {
        SourcePathDetails {
            path: path.to_string(),
            start_line: line,
            start_column: 0,
            inlined_content: None,
        }
    }

    #[test]
    fn statuses_override_patterns() {
        let mut engine = engine(&["**/node_modules/**"]);
        let path = "/app/node_modules/lib/index.js";
        assert_eq!(engine.should_skip(path), Some(true));

        engine.toggle(path);
        assert_eq!(engine.should_skip(path), Some(false));
        assert_eq!(engine.should_skip("/app/src/main.js"), None);
    }

    #[test]
    fn toggle_is_involutive() {
        let mut engine = engine(&[]);
        let path = "/app/lib.js";
        let before = engine.should_skip(path).unwrap_or(false);
        engine.toggle(path);
        engine.toggle(path);
        assert_eq!(engine.should_skip(path).unwrap_or(false), before);
    }

    #[test]
    fn toggle_edits_the_pattern_list() {
        let mut engine = engine(&[]);
        engine.toggle("/app/lib.js");
        assert!(engine
            .pattern_strings()
            .iter()
            .any(|p| p.contains("lib\\.js")));

        engine.toggle("/app/lib.js");
        assert!(!engine
            .pattern_strings()
            .iter()
            .any(|p| p.contains("lib\\.js")));
    }

    #[test]
    fn negated_globs_are_ignored() {
        let engine = engine(&["!keep.js", "**/skip.js"]);
        assert_eq!(engine.should_skip("keep.js"), None);
        assert_eq!(engine.should_skip("/x/skip.js"), Some(true));
    }

    #[test]
    fn glob_translation() {
        let re = Regex::new(&glob_to_regex("**/node_modules/**")).unwrap();
        assert!(re.is_match("/proj/node_modules/dep/i.js"));
        assert!(re.is_match("node_modules/dep/i.js"));
        assert!(!re.is_match("/proj/src/i.js"));

        let re = Regex::new(&glob_to_regex("*.min.js")).unwrap();
        assert!(re.is_match("app.min.js"));
        assert!(!re.is_match("sub/app.min.js"));

        let re = Regex::new(&glob_to_regex("lib-?.js")).unwrap();
        assert!(re.is_match("lib-a.js"));
        assert!(!re.is_match("lib-ab.js"));
    }

    #[test]
    fn ranges_alternate_on_classification_boundaries() {
        let mut engine = engine(&[]);
        engine.toggle("/lib/vendor.ts");

        let sources = vec![
            details("/src/a.ts", 0),
            details("/lib/vendor.ts", 100),
            details("/src/b.ts", 200),
        ];

        let ranges = engine.blackboxed_ranges(false, &sources);
        assert_eq!(
            ranges,
            vec![
                ScriptPosition { line_number: 100, column_number: 0 },
                ScriptPosition { line_number: 200, column_number: 0 },
            ]
        );
    }

    #[test]
    fn skipped_parent_prepends_origin() {
        let engine = engine(&["**/bundle.js"]);
        let sources = vec![details("/src/a.ts", 10)];
        let ranges = engine.blackboxed_ranges(true, &sources);
        assert_eq!(
            ranges,
            vec![
                ScriptPosition { line_number: 0, column_number: 0 },
                ScriptPosition { line_number: 10, column_number: 0 },
            ]
        );
    }
}
