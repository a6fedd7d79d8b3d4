use serde::Deserialize;

/// DAP `initialize` arguments, reduced to the fields the adapter validates
/// or records.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializeArguments {
    #[serde(rename = "adapterID")]
    pub adapter_id: Option<String>,
    pub path_format: Option<String>,
    pub lines_start_at1: Option<bool>,
    pub columns_start_at1: Option<bool>,
}

/// Attach configuration. Field names follow the launch-configuration schema,
/// so unknown keys from the client are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachConfig {
    pub port: u16,
    pub address: Option<String>,
    pub url: Option<String>,
    pub timeout: Option<u64>,
    pub websocket_url: Option<String>,
    pub source_maps: bool,
    pub smart_step: bool,
    pub show_async_stacks: bool,
    /// Glob patterns; `!`-negation is not supported and is skipped with a
    /// warning.
    pub skip_files: Vec<String>,
    /// Raw regex strings appended verbatim to the skip pattern set.
    pub skip_file_reg_exps: Vec<String>,
    pub trace: Option<serde_json::Value>,
    // Deprecated aliases for `trace`, still accepted.
    pub verbose_diagnostic_logging: Option<bool>,
    pub diagnostic_logging: Option<bool>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            port: 9229,
            address: None,
            url: None,
            timeout: None,
            websocket_url: None,
            source_maps: true,
            smart_step: false,
            show_async_stacks: false,
            skip_files: Vec::new(),
            skip_file_reg_exps: Vec::new(),
            trace: None,
            verbose_diagnostic_logging: None,
            diagnostic_logging: None,
        }
    }
}

impl AttachConfig {
    /// Whether verbose diagnostic logging was requested, under any of the
    /// config spellings.
    pub fn verbose_logging(&self) -> bool {
        let trace = match &self.trace {
            Some(serde_json::Value::String(s)) => s == "verbose" || s == "true",
            Some(serde_json::Value::Bool(b)) => *b,
            _ => false,
        };
        trace
            || self.verbose_diagnostic_logging.unwrap_or(false)
            || self.diagnostic_logging.unwrap_or(false)
    }
}
