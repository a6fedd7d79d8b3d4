//! Shared fixture: an adapter wired to the in-process mock runtime, with a
//! capturing event sink and a configurable fake source-map transformer.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use kite_dap::dap::EventSink;
use kite_dap::transform::{
    MappedPosition, SourceMapTransformer, SourcePathDetails, Transformers,
};
use kite_dap::{AttachConfig, DebugAdapter};
use kite_rdp::mock::{MockRuntime, MockRuntimeConfig};

#[derive(Default)]
pub struct TestSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl EventSink for TestSink {
    fn send_event(&self, event: &str, body: Option<Value>) {
        let mut events = self.events.lock().unwrap();
        events.push((event.to_string(), body.unwrap_or(Value::Null)));
    }
}

impl TestSink {
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events_named(name).len()
    }

    /// Wait until at least `count` events with this name were emitted and
    /// return the latest one.
    pub async fn wait_for_event_count(&self, name: &str, count: usize) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.events_named(name);
            if events.len() >= count {
                return events[count - 1].clone();
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} {name:?} event(s); saw {events:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_event(&self, name: &str) -> Value {
        self.wait_for_event_count(name, 1).await
    }
}

/// A scripted source-map transformer: each generated URL maps to an ordered
/// list of authored sources, by start line.
#[derive(Default)]
pub struct FakeSourceMap {
    generated: HashMap<String, Vec<SourcePathDetails>>,
}

impl FakeSourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, generated_url: &str, sources: &[(&str, u32)]) -> Self {
        self.generated.insert(
            generated_url.to_string(),
            sources
                .iter()
                .map(|(path, start_line)| SourcePathDetails {
                    path: path.to_string(),
                    start_line: *start_line,
                    start_column: 0,
                    inlined_content: None,
                })
                .collect(),
        );
        self
    }
}

impl SourceMapTransformer for FakeSourceMap {
    fn script_parsed(&self, url: &str, _source_map_url: Option<&str>) -> Vec<String> {
        self.generated
            .get(url)
            .map(|sources| sources.iter().map(|s| s.path.clone()).collect())
            .unwrap_or_default()
    }

    fn map_to_authored(&self, path: &str, line: u32, column: u32) -> Option<MappedPosition> {
        let sources = self.generated.get(path)?;
        let source = sources
            .iter()
            .rev()
            .find(|source| source.start_line <= line)?;
        Some(MappedPosition {
            source: source.path.clone(),
            line: line - source.start_line,
            column,
        })
    }

    fn generated_path_from_authored(&self, path: &str) -> Option<String> {
        self.generated.iter().find_map(|(generated, sources)| {
            sources
                .iter()
                .any(|source| source.path == path)
                .then(|| generated.clone())
        })
    }

    fn authored_position_to_generated(
        &self,
        path: &str,
        line: u32,
        column: u32,
    ) -> Option<(String, u32, u32)> {
        self.generated.iter().find_map(|(generated, sources)| {
            sources
                .iter()
                .find(|source| source.path == path)
                .map(|source| (generated.clone(), source.start_line + line, column))
        })
    }

    fn all_source_path_details(&self, generated_path: &str) -> Vec<SourcePathDetails> {
        self.generated
            .get(generated_path)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct Fixture {
    pub adapter: DebugAdapter,
    pub mock: MockRuntime,
    pub sink: Arc<TestSink>,
}

pub async fn attach(mock_config: MockRuntimeConfig, attach_config: AttachConfig) -> Fixture {
    attach_with_transformers(mock_config, attach_config, Transformers::default()).await
}

pub async fn attach_with_transformers(
    mock_config: MockRuntimeConfig,
    attach_config: AttachConfig,
    transformers: Transformers,
) -> Fixture {
    let (client, mock) = MockRuntime::spawn(mock_config);
    let sink = Arc::new(TestSink::default());
    let adapter = DebugAdapter::new(sink.clone(), transformers);
    adapter
        .attach(client, attach_config)
        .await
        .expect("attach against the mock runtime");
    Fixture {
        adapter,
        mock,
        sink,
    }
}

/// Emit a scriptParsed and wait until the adapter has registered it.
pub async fn parse_script(fixture: &Fixture, script_id: &str, url: &str) {
    fixture.mock.emit_script_parsed(script_id, url, None).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if fixture
            .adapter
            .known_script_urls()
            .await
            .iter()
            .any(|known| known == url)
        {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for script {url} to register");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn call_frame(id: &str, name: &str, url: &str, script_id: &str, line: u32) -> Value {
    json!({
        "callFrameId": id,
        "functionName": name,
        "location": { "scriptId": script_id, "lineNumber": line, "columnNumber": 0 },
        "url": url,
        "scopeChain": [],
    })
}

pub fn paused_params(frames: Vec<Value>) -> Value {
    json!({
        "callFrames": frames,
        "reason": "other",
    })
}
