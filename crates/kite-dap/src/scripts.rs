//! Registry of scripts the runtime has parsed, indexed by runtime id and by
//! URL. Anonymous eval scripts get a synthesized `VM<id>` URL.

use std::collections::HashMap;
use std::sync::Arc;

use kite_rdp::ScriptParsedParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub script_id: String,
    pub url: String,
    pub source_map_url: Option<String>,
}

#[derive(Default)]
pub struct ScriptRegistry {
    by_id: HashMap<String, Arc<Script>>,
    by_url: HashMap<String, Arc<Script>>,
    /// The one-shot column-breakpoint probe has run for this session.
    pub column_bp_probed: bool,
}

impl ScriptRegistry {
    pub fn add(&mut self, params: &ScriptParsedParams) -> Arc<Script> {
        let url = if params.url.is_empty() {
            synthetic_url(&params.script_id)
        } else {
            fix_drive_letter(&params.url)
        };
        let script = Arc::new(Script {
            script_id: params.script_id.clone(),
            url,
            source_map_url: params
                .source_map_url
                .clone()
                .filter(|u| !u.is_empty()),
        });
        self.by_id.insert(script.script_id.clone(), script.clone());
        self.by_url.insert(script.url.clone(), script.clone());
        script
    }

    pub fn by_id(&self, script_id: &str) -> Option<Arc<Script>> {
        self.by_id.get(script_id).cloned()
    }

    pub fn by_url(&self, url: &str) -> Option<Arc<Script>> {
        self.by_url.get(url).cloned()
    }

    /// All scripts, sorted by URL.
    pub fn all(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<_> = self.by_id.values().cloned().collect();
        scripts.sort_by(|a, b| a.url.cmp(&b.url));
        scripts
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_url.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// One logical source served through a DAP `sourceReference`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceContainer {
    pub script_id: Option<String>,
    /// Set only for sources whose content is inlined in a source map.
    pub contents: Option<String>,
    pub mapped_path: Option<String>,
}

/// Source handle table. Lookups keyed by script id return the same handle
/// every time.
#[derive(Default)]
pub struct SourceHandles {
    table: crate::handles::HandleTable<SourceContainer>,
    by_script: HashMap<String, i64>,
}

impl SourceHandles {
    pub fn reference_for_script(&mut self, script_id: &str) -> i64 {
        if let Some(&id) = self.by_script.get(script_id) {
            return id;
        }
        let id = self.table.alloc(SourceContainer {
            script_id: Some(script_id.to_string()),
            ..Default::default()
        });
        self.by_script.insert(script_id.to_string(), id);
        id
    }

    pub fn alloc(&mut self, container: SourceContainer) -> i64 {
        let script_id = container.script_id.clone();
        let id = self.table.alloc(container);
        if let Some(script_id) = script_id {
            self.by_script.entry(script_id).or_insert(id);
        }
        id
    }

    pub fn get(&self, reference: i64) -> Option<&SourceContainer> {
        self.table.get(reference)
    }
}

pub fn synthetic_url(script_id: &str) -> String {
    format!("VM{script_id}")
}

pub fn is_synthetic_url(url: &str) -> bool {
    url.starts_with("VM")
}

/// Canonicalize the drive letter of Windows-style URLs and paths to
/// uppercase, so URL-keyed lookups don't split on casing.
pub fn fix_drive_letter(url: &str) -> String {
    let bytes = url.as_bytes();

    if let Some(rest) = url.strip_prefix("file:///") {
        let rest_bytes = rest.as_bytes();
        if rest_bytes.len() >= 2
            && rest_bytes[0].is_ascii_lowercase()
            && rest_bytes[1] == b':'
        {
            return format!(
                "file:///{}{}",
                (rest_bytes[0] as char).to_ascii_uppercase(),
                &rest[1..]
            );
        }
        return url.to_string();
    }

    if bytes.len() >= 2 && bytes[0].is_ascii_lowercase() && bytes[1] == b':' {
        return format!("{}{}", (bytes[0] as char).to_ascii_uppercase(), &url[1..]);
    }

    url.to_string()
}
