//! Stack-trace and scope assembly: synchronous frames, async parents with
//! label separators, source-path post-processing, and skip/smart-step
//! deemphasis hints.

use kite_rdp::{CallFrame, PausedParams, RemoteObject, StackTrace as RdpStackTrace};

use crate::dap::{DapScope, Source, StackFrame};
use crate::handles::HandleTable;
use crate::scripts::{is_synthetic_url, SourceHandles};
use crate::skip::SkipEngine;
use crate::transform::Transformers;
use crate::variables::{ExceptionContainer, ScopeContainer, VariableContainer};

pub struct StackContext<'a> {
    pub transformers: &'a Transformers,
    pub skip: &'a SkipEngine,
    pub smart_step: bool,
    pub source_maps: bool,
}

pub const SKIP_FILES_ORIGIN: &str = "(skipped by 'skipFiles')";
pub const SMART_STEP_ORIGIN: &str = "(skipped by 'smartStep')";

/// Assemble the full DAP stack for a paused notification and slice it.
/// Returns the window and the total frame count before slicing.
pub fn build_stack_trace(
    cx: &StackContext<'_>,
    frame_handles: &mut HandleTable<CallFrame>,
    source_handles: &mut SourceHandles,
    params: &PausedParams,
    start_frame: Option<usize>,
    levels: Option<usize>,
) -> (Vec<StackFrame>, usize) {
    let mut all = Vec::new();

    if params.call_frames.is_empty() {
        // A runtime bug can produce a pause with no usable frames; hand the
        // client a recognizable stub instead of failing the request.
        all.push(StackFrame {
            id: 0,
            name: "VM_Unknown".to_string(),
            line: cx.transformers.line_col.line_to_client(0),
            column: cx.transformers.line_col.column_to_client(0),
            ..Default::default()
        });
    }

    for frame in &params.call_frames {
        let id = frame_handles.alloc(frame.clone());
        let url = if frame.url.is_empty() {
            crate::scripts::synthetic_url(&frame.location.script_id)
        } else {
            frame.url.clone()
        };
        all.push(map_frame(
            cx,
            source_handles,
            id,
            &frame.function_name,
            &url,
            &frame.location.script_id,
            frame.location.line_number,
            frame.location.column_number.unwrap_or(0),
        ));
    }

    let mut async_parent = params.async_stack_trace.as_ref();
    while let Some(stack) = async_parent {
        all.push(label_frame(cx, stack));
        for frame in &stack.call_frames {
            let url = if frame.url.is_empty() {
                crate::scripts::synthetic_url(&frame.script_id)
            } else {
                frame.url.clone()
            };
            all.push(map_frame(
                cx,
                source_handles,
                0,
                &frame.function_name,
                &url,
                &frame.script_id,
                frame.line_number,
                frame.column_number,
            ));
        }
        async_parent = stack.parent.as_deref();
    }

    let total = all.len();
    let start = start_frame.unwrap_or(0).min(total);
    let end = levels
        .filter(|&l| l > 0)
        .map(|l| (start + l).min(total))
        .unwrap_or(total);
    (all.drain(start..end).collect(), total)
}

fn label_frame(cx: &StackContext<'_>, stack: &RdpStackTrace) -> StackFrame {
    let description = stack.description.as_deref().unwrap_or("async");
    StackFrame {
        id: 0,
        name: format!("[ {description} ]"),
        presentation_hint: Some("label".to_string()),
        line: cx.transformers.line_col.line_to_client(0),
        column: cx.transformers.line_col.column_to_client(0),
        ..Default::default()
    }
}

#[allow(clippy::too_many_arguments)]
fn map_frame(
    cx: &StackContext<'_>,
    source_handles: &mut SourceHandles,
    id: i64,
    function_name: &str,
    url: &str,
    script_id: &str,
    line: u32,
    column: u32,
) -> StackFrame {
    let mapped = if cx.source_maps {
        cx.transformers.source_map.map_to_authored(url, line, column)
    } else {
        None
    };
    let is_source_mapped = mapped.is_some();

    let (path, line, column) = match mapped {
        Some(m) => (m.source, m.line, m.column),
        None => (url.to_string(), line, column),
    };

    let name = if function_name.is_empty() {
        if is_synthetic_url(url) {
            "(eval code)".to_string()
        } else {
            "(anonymous function)".to_string()
        }
    } else {
        function_name.to_string()
    };

    let mut source = if is_synthetic_url(&path) {
        // Eval scripts have no client file; serve them by reference.
        Source {
            name: Some(path.clone()),
            source_reference: Some(source_handles.reference_for_script(script_id)),
            ..Default::default()
        }
    } else {
        let client_path = cx.transformers.path.target_to_client(&path);
        Source {
            name: Some(basename(client_path.as_deref().unwrap_or(&path))),
            path: client_path.or_else(|| Some(path.clone())),
            ..Default::default()
        }
    };

    if cx.skip.is_skipped(&path) {
        source.presentation_hint = Some("deemphasize".to_string());
        source.origin = Some(SKIP_FILES_ORIGIN.to_string());
    } else if cx.smart_step && cx.source_maps && !is_source_mapped {
        source.presentation_hint = Some("deemphasize".to_string());
        source.origin = Some(SMART_STEP_ORIGIN.to_string());
    }

    StackFrame {
        id,
        name,
        source: Some(source),
        line: cx.transformers.line_col.line_to_client(line),
        column: cx.transformers.line_col.column_to_client(column),
        presentation_hint: None,
    }
}

/// Scope list for a paused frame. Scope 0 carries the synthetic `this` and
/// return-value children; a current exception prepends an Exception
/// pseudo-scope.
pub fn build_scopes(
    cx: &StackContext<'_>,
    variable_handles: &mut HandleTable<VariableContainer>,
    frame: &CallFrame,
    exception: Option<&RemoteObject>,
) -> Vec<DapScope> {
    let mut scopes = Vec::with_capacity(frame.scope_chain.len() + 1);

    if let Some(exception) = exception {
        let reference = variable_handles.alloc(VariableContainer::Exception(ExceptionContainer {
            exception: exception.clone(),
        }));
        scopes.push(DapScope {
            name: "Exception".to_string(),
            variables_reference: reference,
            expensive: false,
            ..Default::default()
        });
    }

    for (index, scope) in frame.scope_chain.iter().enumerate() {
        let this_obj = if index == 0 {
            frame
                .this
                .clone()
                .filter(|this| this.object_type != "undefined")
        } else {
            None
        };
        let return_value = if index == 0 {
            frame.return_value.clone()
        } else {
            None
        };

        let reference = variable_handles.alloc(VariableContainer::Scope(ScopeContainer {
            call_frame_id: frame.call_frame_id.clone(),
            scope_index: index as u32,
            object_id: scope.object.object_id.clone(),
            this_obj,
            return_value,
        }));

        let mut dap_scope = DapScope {
            name: capitalize(&scope.scope_type),
            variables_reference: reference,
            expensive: scope.scope_type == "global",
            ..Default::default()
        };
        if let Some(start) = &scope.start_location {
            dap_scope.line = Some(cx.transformers.line_col.line_to_client(start.line_number));
            dap_scope.column = Some(
                cx.transformers
                    .line_col
                    .column_to_client(start.column_number.unwrap_or(0)),
            );
        }
        if let Some(end) = &scope.end_location {
            dap_scope.end_line = Some(cx.transformers.line_col.line_to_client(end.line_number));
            dap_scope.end_column = Some(
                cx.transformers
                    .line_col
                    .column_to_client(end.column_number.unwrap_or(0)),
            );
        }

        scopes.push(dap_scope);
    }

    scopes
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn basename(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_rdp::{Location, Scope as RdpScope};

    fn call_frame(name: &str, url: &str, script_id: &str, line: u32) -> CallFrame {
        CallFrame {
            call_frame_id: format!("frame-{script_id}-{line}"),
            function_name: name.to_string(),
            location: Location {
                script_id: script_id.to_string(),
                line_number: line,
                column_number: Some(0),
            },
            url: url.to_string(),
            scope_chain: Vec::new(),
            this: None,
            return_value: None,
        }
    }

    fn paused(frames: Vec<CallFrame>) -> PausedParams {
        PausedParams {
            call_frames: frames,
            reason: "other".to_string(),
            data: None,
            hit_breakpoints: None,
            async_stack_trace: None,
        }
    }

    fn context<'a>(transformers: &'a Transformers, skip: &'a SkipEngine) -> StackContext<'a> {
        StackContext {
            transformers,
            skip,
            smart_step: false,
            source_maps: true,
        }
    }

    #[test]
    fn slicing_preserves_total_count() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut frames = HandleTable::default();
        let mut sources = SourceHandles::default();

        let params = paused(
            (0..6)
                .map(|i| call_frame("f", "file:///app.js", "1", i))
                .collect(),
        );

        let (window, total) =
            build_stack_trace(&cx, &mut frames, &mut sources, &params, Some(2), Some(3));
        assert_eq!(total, 6);
        assert_eq!(window.len(), 3);
        // 0-based runtime line 2 becomes client line 3 under the default
        // 1-based numbering.
        assert_eq!(window[0].line, 3);
    }

    #[test]
    fn anonymous_frames_are_named_by_script_kind() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut frames = HandleTable::default();
        let mut sources = SourceHandles::default();

        let params = paused(vec![
            call_frame("", "file:///app.js", "1", 0),
            call_frame("", "", "9", 0),
        ]);

        let (window, _) = build_stack_trace(&cx, &mut frames, &mut sources, &params, None, None);
        assert_eq!(window[0].name, "(anonymous function)");
        assert_eq!(window[1].name, "(eval code)");
        assert_eq!(window[1].source.as_ref().unwrap().name.as_deref(), Some("VM9"));
        assert!(window[1].source.as_ref().unwrap().source_reference.is_some());
        assert!(window[1].source.as_ref().unwrap().path.is_none());
    }

    #[test]
    fn async_parents_get_label_frames() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut frames = HandleTable::default();
        let mut sources = SourceHandles::default();

        let mut params = paused(vec![call_frame("f", "file:///app.js", "1", 0)]);
        params.async_stack_trace = Some(RdpStackTrace {
            description: Some("setTimeout".to_string()),
            call_frames: vec![kite_rdp::RuntimeCallFrame {
                function_name: "later".to_string(),
                script_id: "1".to_string(),
                url: "file:///app.js".to_string(),
                line_number: 10,
                column_number: 2,
            }],
            parent: None,
        });

        let (window, total) = build_stack_trace(&cx, &mut frames, &mut sources, &params, None, None);
        assert_eq!(total, 3);
        assert_eq!(window[1].name, "[ setTimeout ]");
        assert_eq!(window[1].presentation_hint.as_deref(), Some("label"));
        assert_eq!(window[2].name, "later");
        assert_eq!(window[2].id, 0, "async frames are not restartable");
    }

    #[test]
    fn skipped_frames_are_deemphasized() {
        let transformers = Transformers::default();
        let mut skip = SkipEngine::default();
        skip.toggle("file:///lib.js");
        let cx = context(&transformers, &skip);
        let mut frames = HandleTable::default();
        let mut sources = SourceHandles::default();

        let params = paused(vec![
            call_frame("user", "file:///app.js", "1", 0),
            call_frame("vendor", "file:///lib.js", "2", 0),
        ]);

        let (window, _) = build_stack_trace(&cx, &mut frames, &mut sources, &params, None, None);
        assert!(window[0].source.as_ref().unwrap().presentation_hint.is_none());
        let lib_source = window[1].source.as_ref().unwrap();
        assert_eq!(lib_source.presentation_hint.as_deref(), Some("deemphasize"));
        assert_eq!(
            lib_source.origin.as_deref(),
            Some("(skipped by 'skipFiles')")
        );
    }

    #[test]
    fn empty_call_stack_yields_the_stub_frame() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut frames = HandleTable::default();
        let mut sources = SourceHandles::default();

        let (window, total) =
            build_stack_trace(&cx, &mut frames, &mut sources, &paused(Vec::new()), None, None);
        assert_eq!(total, 1);
        assert_eq!(window[0].name, "VM_Unknown");
    }

    #[test]
    fn scope_zero_injects_this_and_return_value() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut variables = HandleTable::default();

        let mut frame = call_frame("f", "file:///app.js", "1", 0);
        frame.this = Some(RemoteObject {
            object_type: "object".to_string(),
            object_id: Some("this-1".to_string()),
            ..Default::default()
        });
        frame.scope_chain = vec![
            RdpScope {
                scope_type: "local".to_string(),
                object: RemoteObject {
                    object_type: "object".to_string(),
                    object_id: Some("scope-0".to_string()),
                    ..Default::default()
                },
                name: None,
                start_location: None,
                end_location: None,
            },
            RdpScope {
                scope_type: "global".to_string(),
                object: RemoteObject {
                    object_type: "object".to_string(),
                    object_id: Some("scope-1".to_string()),
                    ..Default::default()
                },
                name: None,
                start_location: None,
                end_location: None,
            },
        ];

        let scopes = build_scopes(&cx, &mut variables, &frame, None);
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].name, "Local");
        assert!(!scopes[0].expensive);
        assert_eq!(scopes[1].name, "Global");
        assert!(scopes[1].expensive);

        match variables.get(scopes[0].variables_reference).unwrap() {
            VariableContainer::Scope(scope) => {
                assert_eq!(scope.scope_index, 0);
                assert!(scope.this_obj.is_some());
            }
            other => panic!("unexpected container: {other:?}"),
        }
    }

    #[test]
    fn exception_scope_is_prepended() {
        let transformers = Transformers::default();
        let skip = SkipEngine::default();
        let cx = context(&transformers, &skip);
        let mut variables = HandleTable::default();

        let mut frame = call_frame("f", "file:///app.js", "1", 0);
        frame.scope_chain = vec![RdpScope {
            scope_type: "local".to_string(),
            object: RemoteObject::default(),
            name: None,
            start_location: None,
            end_location: None,
        }];
        let exception = RemoteObject {
            object_type: "object".to_string(),
            class_name: Some("Error".to_string()),
            ..Default::default()
        };

        let scopes = build_scopes(&cx, &mut variables, &frame, Some(&exception));
        assert_eq!(scopes[0].name, "Exception");
        assert_eq!(scopes[1].name, "Local");
    }
}
