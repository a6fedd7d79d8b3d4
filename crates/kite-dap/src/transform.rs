//! Seams toward the path, source-map, and line/column transformers.
//!
//! The transformers themselves live outside this crate; the adapter only
//! depends on these capability traits, injected at construction. The default
//! implementations are identities (no workspace mapping, no source maps,
//! 1-based client positions), which is also what most tests install.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An authored-source position produced by mapping a generated location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPosition {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// One authored source of a generated script, in generated-position order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePathDetails {
    pub path: String,
    pub start_line: u32,
    pub start_column: u32,
    /// Whether the authored source's content is inlined in the source map.
    pub inlined_content: Option<String>,
}

pub trait PathTransformer: Send + Sync {
    /// Client (IDE) path to the path the runtime knows the file by.
    fn client_to_target(&self, path: &str) -> String;
    /// Runtime path back to a client path, when one exists.
    fn target_to_client(&self, path: &str) -> Option<String>;
    /// Notification that the runtime reported a script at this URL.
    fn script_parsed(&self, _url: &str) {}
    fn clear(&self) {}
}

pub trait SourceMapTransformer: Send + Sync {
    /// Notification that a script was parsed. Returns the authored source
    /// paths contributed by its source map, if any.
    fn script_parsed(&self, url: &str, source_map_url: Option<&str>) -> Vec<String>;
    /// Generated position (0-based) to an authored position.
    fn map_to_authored(&self, path: &str, line: u32, column: u32) -> Option<MappedPosition>;
    /// Authored path to the generated script path it is bundled into.
    fn generated_path_from_authored(&self, path: &str) -> Option<String>;
    /// Authored position (0-based) to the generated position it maps to.
    fn authored_position_to_generated(
        &self,
        path: &str,
        line: u32,
        column: u32,
    ) -> Option<(String, u32, u32)>;
    /// Authored sources of a generated script, in generated-position order.
    fn all_source_path_details(&self, generated_path: &str) -> Vec<SourcePathDetails>;
    fn clear(&self) {}
}

pub trait LineColTransformer: Send + Sync {
    fn set_client_lines_start_at1(&self, value: bool);
    fn set_client_columns_start_at1(&self, value: bool);
    /// Whether the runtime supports column breakpoints (discovered by the
    /// one-shot probe on the first parsed script).
    fn set_column_breakpoints_enabled(&self, value: bool);
    fn column_breakpoints_enabled(&self) -> bool;

    /// 0-based runtime line to the client's numbering.
    fn line_to_client(&self, line: u32) -> u32;
    /// Client line to the runtime's 0-based numbering.
    fn line_to_target(&self, line: u32) -> u32;
    fn column_to_client(&self, column: u32) -> u32;
    fn column_to_target(&self, column: u32) -> u32;
}

/// Identity path transformer: the runtime and the client share a filesystem
/// view.
#[derive(Debug, Default)]
pub struct IdentityPathTransformer;

impl PathTransformer for IdentityPathTransformer {
    fn client_to_target(&self, path: &str) -> String {
        path.to_string()
    }

    fn target_to_client(&self, path: &str) -> Option<String> {
        Some(path.to_string())
    }
}

/// Source-map transformer for a session without source maps.
#[derive(Debug, Default)]
pub struct NoSourceMaps;

impl SourceMapTransformer for NoSourceMaps {
    fn script_parsed(&self, _url: &str, _source_map_url: Option<&str>) -> Vec<String> {
        Vec::new()
    }

    fn map_to_authored(&self, _path: &str, _line: u32, _column: u32) -> Option<MappedPosition> {
        None
    }

    fn generated_path_from_authored(&self, _path: &str) -> Option<String> {
        None
    }

    fn authored_position_to_generated(
        &self,
        _path: &str,
        _line: u32,
        _column: u32,
    ) -> Option<(String, u32, u32)> {
        None
    }

    fn all_source_path_details(&self, _generated_path: &str) -> Vec<SourcePathDetails> {
        Vec::new()
    }
}

/// Default line/column transformer: runtime positions are 0-based, client
/// numbering configured by `initialize`.
#[derive(Debug)]
pub struct BaseLineColTransformer {
    client_lines_start_at1: AtomicBool,
    client_columns_start_at1: AtomicBool,
    column_breakpoints: AtomicBool,
}

impl Default for BaseLineColTransformer {
    fn default() -> Self {
        Self {
            client_lines_start_at1: AtomicBool::new(true),
            client_columns_start_at1: AtomicBool::new(true),
            column_breakpoints: AtomicBool::new(false),
        }
    }
}

impl LineColTransformer for BaseLineColTransformer {
    fn set_client_lines_start_at1(&self, value: bool) {
        self.client_lines_start_at1.store(value, Ordering::Relaxed);
    }

    fn set_client_columns_start_at1(&self, value: bool) {
        self.client_columns_start_at1.store(value, Ordering::Relaxed);
    }

    fn set_column_breakpoints_enabled(&self, value: bool) {
        self.column_breakpoints.store(value, Ordering::Relaxed);
    }

    fn column_breakpoints_enabled(&self) -> bool {
        self.column_breakpoints.load(Ordering::Relaxed)
    }

    fn line_to_client(&self, line: u32) -> u32 {
        if self.client_lines_start_at1.load(Ordering::Relaxed) {
            line + 1
        } else {
            line
        }
    }

    fn line_to_target(&self, line: u32) -> u32 {
        if self.client_lines_start_at1.load(Ordering::Relaxed) {
            line.saturating_sub(1)
        } else {
            line
        }
    }

    fn column_to_client(&self, column: u32) -> u32 {
        if self.client_columns_start_at1.load(Ordering::Relaxed) {
            column + 1
        } else {
            column
        }
    }

    fn column_to_target(&self, column: u32) -> u32 {
        if self.client_columns_start_at1.load(Ordering::Relaxed) {
            column.saturating_sub(1)
        } else {
            column
        }
    }
}

/// The transformer bundle handed to the adapter at construction.
#[derive(Clone)]
pub struct Transformers {
    pub path: Arc<dyn PathTransformer>,
    pub source_map: Arc<dyn SourceMapTransformer>,
    pub line_col: Arc<dyn LineColTransformer>,
}

impl Default for Transformers {
    fn default() -> Self {
        Self {
            path: Arc::new(IdentityPathTransformer),
            source_map: Arc::new(NoSourceMaps),
            line_col: Arc::new(BaseLineColTransformer::default()),
        }
    }
}

impl Transformers {
    pub fn clear(&self) {
        self.path.clear();
        self.source_map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_defaults_to_one_based_client() {
        let t = BaseLineColTransformer::default();
        assert_eq!(t.line_to_client(0), 1);
        assert_eq!(t.line_to_target(1), 0);
        assert_eq!(t.column_to_client(4), 5);

        t.set_client_lines_start_at1(false);
        assert_eq!(t.line_to_client(0), 0);
        assert_eq!(t.line_to_target(0), 0);
    }
}
