//! Converts runtime remote objects into DAP variables, with lazy expansion
//! through variable containers.
//!
//! A container owns whatever is needed to list its children on demand: a
//! remote object id, a scope slot, the current exception, or a captured
//! console argument list. Expansion allocates child handles carrying the
//! composed evaluate name.

use std::collections::HashMap;

use kite_rdp::{
    CallArgument, PropertyDescriptor, RdpClient, RdpError, RemoteObject,
};
use serde_json::json;

use crate::dap::Variable;
use crate::error::{AdapterError, AdapterResult};
use crate::handles::HandleTable;

const GETTER_FN: &str = "function(n) { return this[n]; }";
const INDEXED_SLICE_FN: &str =
    "function(s, c) { var result = []; for (var i = s; i < s + c; i++) result[i] = this[i]; return result; }";
const NAMED_SLICE_FN: &str =
    "function(s, c) { var result = []; var names = Object.getOwnPropertyNames(this); for (var i = s; i < s + c; i++) result[i] = names[i]; return result; }";

#[derive(Debug, Clone)]
pub enum VariableContainer {
    Property(PropertyContainer),
    Scope(ScopeContainer),
    Exception(ExceptionContainer),
    LoggedObjects(LoggedObjects),
}

#[derive(Debug, Clone)]
pub struct PropertyContainer {
    pub object_id: String,
    pub evaluate_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeContainer {
    pub call_frame_id: String,
    pub scope_index: u32,
    pub object_id: Option<String>,
    pub this_obj: Option<RemoteObject>,
    pub return_value: Option<RemoteObject>,
}

#[derive(Debug, Clone)]
pub struct ExceptionContainer {
    pub exception: RemoteObject,
}

#[derive(Debug, Clone)]
pub struct LoggedObjects {
    pub args: Vec<RemoteObject>,
}

pub async fn expand_container(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    container: VariableContainer,
    filter: Option<&str>,
    start: Option<usize>,
    count: Option<usize>,
) -> AdapterResult<Vec<Variable>> {
    match container {
        VariableContainer::Property(prop) => {
            expand_object(
                client,
                handles,
                &prop.object_id,
                prop.evaluate_name.as_deref(),
                filter,
                start,
                count,
            )
            .await
        }
        VariableContainer::Scope(scope) => {
            // Scope variables seed the evaluate-name chain with their own
            // names, so `obj.field` composes from an expanded local.
            let mut variables = match &scope.object_id {
                Some(object_id) => {
                    expand_object(client, handles, object_id, Some(""), filter, start, count)
                        .await?
                }
                None => Vec::new(),
            };
            if scope.scope_index == 0 {
                if let Some(return_value) = &scope.return_value {
                    let var =
                        remote_object_to_variable(client, handles, "Return value", None, return_value)
                            .await;
                    variables.insert(0, var);
                }
                if let Some(this_obj) = &scope.this_obj {
                    let var =
                        remote_object_to_variable(client, handles, "this", None, this_obj).await;
                    variables.insert(0, var);
                }
            }
            Ok(variables)
        }
        VariableContainer::Exception(exception) => match &exception.exception.object_id {
            Some(object_id) => {
                expand_object(client, handles, object_id, None, filter, start, count).await
            }
            None => Ok(Vec::new()),
        },
        VariableContainer::LoggedObjects(logged) => {
            let mut variables = Vec::with_capacity(logged.args.len());
            for (index, arg) in logged.args.iter().enumerate() {
                let var =
                    remote_object_to_variable(client, handles, &index.to_string(), None, arg).await;
                variables.push(var);
            }
            Ok(variables)
        }
    }
}

pub async fn set_container_value(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    container: VariableContainer,
    name: &str,
    value: &str,
) -> AdapterResult<Variable> {
    match container {
        VariableContainer::Scope(scope) => {
            let response = client
                .evaluate_on_call_frame(&scope.call_frame_id, value, false, false, false)
                .await?;
            if let Some(details) = response.exception_details {
                return Err(AdapterError::Evaluate(details.display_text()));
            }
            client
                .set_variable_value(
                    scope.scope_index,
                    name,
                    CallArgument::from_remote_object(&response.result),
                    &scope.call_frame_id,
                )
                .await?;
            Ok(remote_object_to_variable(client, handles, name, None, &response.result).await)
        }
        VariableContainer::Property(prop) => {
            let assignment = format!(
                "function() {{ return this[{}] = {value}; }}",
                json!(name)
            );
            let response = client
                .call_function_on(&prop.object_id, &assignment, &[], false, false)
                .await?;
            if let Some(details) = response.exception_details {
                return Err(AdapterError::Evaluate(details.display_text()));
            }
            Ok(remote_object_to_variable(
                client,
                handles,
                name,
                prop.evaluate_name.as_deref(),
                &response.result,
            )
            .await)
        }
        VariableContainer::Exception(_) | VariableContainer::LoggedObjects(_) => Err(
            AdapterError::InvalidRequest("this variable cannot be modified".to_string()),
        ),
    }
}

async fn expand_object(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    object_id: &str,
    evaluate_name: Option<&str>,
    filter: Option<&str>,
    start: Option<usize>,
    count: Option<usize>,
) -> AdapterResult<Vec<Variable>> {
    if let (Some(start), Some(count)) = (start, count) {
        return expand_sliced(client, handles, object_id, evaluate_name, filter, start, count)
            .await;
    }

    // Accessors first, then own properties; merging by name lets the own
    // fetch win for duplicates.
    let accessors = match client.get_properties(object_id, false, true, false).await {
        Ok(response) => response,
        Err(err) if is_benign_context_error(&err) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let own = match client.get_properties(object_id, true, false, true).await {
        Ok(response) => response,
        Err(err) if is_benign_context_error(&err) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut merged: HashMap<String, PropertyDescriptor> = HashMap::new();
    for prop in accessors.result.into_iter().chain(own.result.into_iter()) {
        merged.insert(prop.name.clone(), prop);
    }

    let mut properties: Vec<PropertyDescriptor> = merged
        .into_values()
        .filter(|prop| match filter {
            Some("indexed") => is_numeric_name(&prop.name),
            Some("named") => !is_numeric_name(&prop.name),
            _ => true,
        })
        .collect();

    // Numeric names ascending by value, then the rest lexicographically.
    properties.sort_by(|a, b| {
        match (numeric_name(&a.name), numeric_name(&b.name)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        }
    });

    let mut variables = Vec::with_capacity(properties.len());
    for prop in properties {
        let variable = property_to_variable(client, handles, object_id, evaluate_name, prop).await;
        variables.push(variable);
    }

    for internal in own.internal_properties.unwrap_or_default() {
        let value = internal.value.unwrap_or_default();
        let variable =
            remote_object_to_variable(client, handles, &internal.name, evaluate_name, &value).await;
        variables.push(variable);
    }

    Ok(variables)
}

async fn expand_sliced(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    object_id: &str,
    evaluate_name: Option<&str>,
    filter: Option<&str>,
    start: usize,
    count: usize,
) -> AdapterResult<Vec<Variable>> {
    let function = if filter == Some("named") {
        NAMED_SLICE_FN
    } else {
        INDEXED_SLICE_FN
    };
    let args = [
        CallArgument {
            value: Some(json!(start)),
            ..Default::default()
        },
        CallArgument {
            value: Some(json!(count)),
            ..Default::default()
        },
    ];
    let response = client
        .call_function_on(object_id, function, &args, true, false)
        .await?;
    if let Some(details) = response.exception_details {
        return Err(AdapterError::Evaluate(details.display_text()));
    }

    let Some(slice_id) = response.result.object_id else {
        return Ok(Vec::new());
    };
    // The helper returns a plain object holding the window; list its indexed
    // children.
    Box::pin(expand_object(
        client,
        handles,
        &slice_id,
        evaluate_name,
        Some("indexed"),
        None,
        None,
    ))
    .await
}

async fn property_to_variable(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    owner_object_id: &str,
    parent_evaluate_name: Option<&str>,
    prop: PropertyDescriptor,
) -> Variable {
    if prop.value.is_none() && prop.get.is_some() {
        // Invoke the getter; a throwing getter is non-fatal and surfaces as
        // the exception text.
        let args = [CallArgument {
            value: Some(json!(prop.name)),
            ..Default::default()
        }];
        match client
            .call_function_on(owner_object_id, GETTER_FN, &args, true, false)
            .await
        {
            Ok(response) => {
                if let Some(details) = response.exception_details {
                    return Variable {
                        name: prop.name,
                        value: details.display_text(),
                        variables_reference: 0,
                        ..Default::default()
                    };
                }
                return remote_object_to_variable(
                    client,
                    handles,
                    &prop.name,
                    parent_evaluate_name,
                    &response.result,
                )
                .await;
            }
            Err(err) => {
                return Variable {
                    name: prop.name,
                    value: err.to_string(),
                    variables_reference: 0,
                    ..Default::default()
                };
            }
        }
    }

    let value = prop.value.unwrap_or_default();
    remote_object_to_variable(client, handles, &prop.name, parent_evaluate_name, &value).await
}

/// Convert a remote object to a DAP variable, allocating a child container
/// for expandable objects.
pub async fn remote_object_to_variable(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    name: &str,
    parent_evaluate_name: Option<&str>,
    obj: &RemoteObject,
) -> Variable {
    let evaluate_name = child_evaluate_name(parent_evaluate_name, name);

    if obj.object_type == "object"
        && !matches!(obj.subtype.as_deref(), Some("null") | Some("internal#location"))
        && obj.object_id.is_some()
    {
        let object_id = obj.object_id.clone().unwrap_or_default();
        let (indexed, named) = object_counts(client, obj).await;
        let reference = handles.alloc(VariableContainer::Property(PropertyContainer {
            object_id,
            evaluate_name: evaluate_name.clone(),
        }));
        return Variable {
            name: name.to_string(),
            value: object_preview_string(obj),
            type_name: obj.class_name.clone(),
            variables_reference: reference,
            evaluate_name,
            indexed_variables: indexed,
            named_variables: named,
        };
    }

    if obj.object_type == "function" {
        let description = obj.description.as_deref().unwrap_or("function");
        let reference = match &obj.object_id {
            Some(object_id) => handles.alloc(VariableContainer::Property(PropertyContainer {
                object_id: object_id.clone(),
                evaluate_name: evaluate_name.clone(),
            })),
            None => 0,
        };
        return Variable {
            name: name.to_string(),
            value: function_display(description),
            type_name: Some("function".to_string()),
            variables_reference: reference,
            evaluate_name,
            ..Default::default()
        };
    }

    Variable {
        name: name.to_string(),
        value: primitive_remote_object_value(obj),
        type_name: Some(obj.object_type.clone()),
        variables_reference: 0,
        evaluate_name,
        ..Default::default()
    }
}

/// Evaluate result to the DAP `{result, variablesReference, counts}` shape.
pub async fn remote_object_to_result(
    client: &RdpClient,
    handles: &mut HandleTable<VariableContainer>,
    obj: &RemoteObject,
) -> (String, i64, Option<i64>, Option<i64>) {
    let variable = remote_object_to_variable(client, handles, "", None, obj).await;
    (
        variable.value,
        variable.variables_reference,
        variable.indexed_variables,
        variable.named_variables,
    )
}

async fn object_counts(client: &RdpClient, obj: &RemoteObject) -> (Option<i64>, Option<i64>) {
    match obj.subtype.as_deref() {
        Some("array") | Some("typedarray") => {
            let preview_props = obj.preview.as_ref().map(|p| p.properties.as_slice());
            let named = preview_props
                .map(|props| props.iter().filter(|p| !is_numeric_name(&p.name)).count() as i64)
                .unwrap_or(0)
                // `__proto__` and `length` are not in the preview.
                + 2;

            let from_description = obj
                .description
                .as_deref()
                .and_then(length_from_description);
            let from_preview = preview_props.and_then(|props| {
                if obj.preview.as_ref().map(|p| p.overflow).unwrap_or(true) {
                    None
                } else {
                    props
                        .iter()
                        .filter_map(|p| numeric_name(&p.name))
                        .max()
                        .map(|max| max as i64 + 1)
                }
            });

            let indexed = match from_description.or(from_preview) {
                Some(len) => Some(len),
                None => eval_array_length(client, obj).await,
            };
            (indexed, Some(named))
        }
        Some("map") | Some("set") => {
            let props = obj
                .preview
                .as_ref()
                .map(|p| p.properties.len() as i64)
                .unwrap_or(0);
            // `[[Entries]]` occupies one extra named slot.
            (None, Some(props + 1))
        }
        _ => (None, None),
    }
}

async fn eval_array_length(client: &RdpClient, obj: &RemoteObject) -> Option<i64> {
    let object_id = obj.object_id.as_deref()?;
    let response = client
        .call_function_on(object_id, "function() { return this.length; }", &[], true, true)
        .await
        .ok()?;
    response.result.value.as_ref()?.as_i64()
}

fn length_from_description(description: &str) -> Option<i64> {
    // "Array(3)", "Int32Array(1024)", ...
    let open = description.find('(')?;
    let close = description[open..].find(')')? + open;
    let prefix = &description[..open];
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    description[open + 1..close].parse().ok()
}

pub fn object_preview_string(obj: &RemoteObject) -> String {
    let base = obj
        .description
        .clone()
        .or_else(|| obj.class_name.clone())
        .unwrap_or_else(|| "Object".to_string());

    let Some(preview) = &obj.preview else {
        return base;
    };
    if preview.properties.is_empty() {
        return base;
    }

    let mut parts: Vec<String> = Vec::with_capacity(preview.properties.len());
    for prop in &preview.properties {
        let value = prop.value.as_deref().unwrap_or("…");
        if matches!(obj.subtype.as_deref(), Some("array") | Some("typedarray"))
            && is_numeric_name(&prop.name)
        {
            parts.push(value.to_string());
        } else {
            parts.push(format!("{}: {}", prop.name, value));
        }
    }
    let mut inner = parts.join(", ");
    if preview.overflow {
        inner.push_str(", …");
    }

    if matches!(obj.subtype.as_deref(), Some("array") | Some("typedarray")) {
        format!("{base} [{inner}]")
    } else {
        format!("{base} {{{inner}}}")
    }
}

pub fn function_display(description: &str) -> String {
    if let Some(idx) = description.find('{') {
        format!("{}{{ … }}", &description[..idx])
    } else if let Some(idx) = description.find("=>") {
        format!("{} …", &description[..idx + 2])
    } else {
        description.to_string()
    }
}

pub fn primitive_remote_object_value(obj: &RemoteObject) -> String {
    match obj.object_type.as_str() {
        "string" => {
            let text = obj
                .value
                .as_ref()
                .and_then(|v| v.as_str().map(str::to_string))
                .or_else(|| obj.description.clone())
                .unwrap_or_default();
            format!("\"{text}\"")
        }
        "undefined" => "undefined".to_string(),
        "object" if obj.subtype.as_deref() == Some("null") => "null".to_string(),
        _ => obj
            .description
            .clone()
            .or_else(|| obj.unserializable_value.clone())
            .or_else(|| obj.value.as_ref().map(value_to_display))
            .unwrap_or_default(),
    }
}

fn value_to_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn child_evaluate_name(parent: Option<&str>, name: &str) -> Option<String> {
    let parent = parent?;
    if parent.is_empty() {
        return Some(name.to_string());
    }
    if is_numeric_name(name) {
        Some(format!("{parent}[{name}]"))
    } else {
        Some(format!("{parent}.{name}"))
    }
}

pub fn is_numeric_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn numeric_name(name: &str) -> Option<u64> {
    if is_numeric_name(name) {
        name.parse().ok()
    } else {
        None
    }
}

fn is_benign_context_error(err: &RdpError) -> bool {
    err.protocol_message()
        .map(|m| m.contains("Cannot find context with specified id"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_rdp::{ObjectPreview, PropertyPreview};

    fn preview(overflow: bool, props: &[(&str, &str)]) -> ObjectPreview {
        ObjectPreview {
            object_type: "object".to_string(),
            overflow,
            properties: props
                .iter()
                .map(|(name, value)| PropertyPreview {
                    name: name.to_string(),
                    object_type: "number".to_string(),
                    value: Some(value.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn numeric_names_sort_before_and_by_value() {
        let mut names = vec!["b", "10", "a", "2"];
        names.sort_by(|a, b| match (numeric_name(a), numeric_name(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        });
        assert_eq!(names, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn function_display_truncates_bodies() {
        assert_eq!(
            function_display("function add(a, b) { return a + b; }"),
            "function add(a, b) { … }"
        );
        assert_eq!(function_display("(a, b) => a + b"), "(a, b) => …");
        assert_eq!(function_display("class Foo"), "class Foo");
    }

    #[test]
    fn primitive_values() {
        let string = RemoteObject {
            object_type: "string".to_string(),
            value: Some(json!("hi")),
            ..Default::default()
        };
        assert_eq!(primitive_remote_object_value(&string), "\"hi\"");

        let null = RemoteObject {
            object_type: "object".to_string(),
            subtype: Some("null".to_string()),
            ..Default::default()
        };
        assert_eq!(primitive_remote_object_value(&null), "null");

        let number = RemoteObject {
            object_type: "number".to_string(),
            value: Some(json!(3)),
            description: Some("3".to_string()),
            ..Default::default()
        };
        assert_eq!(primitive_remote_object_value(&number), "3");

        let undefined = RemoteObject {
            object_type: "undefined".to_string(),
            ..Default::default()
        };
        assert_eq!(primitive_remote_object_value(&undefined), "undefined");
    }

    #[test]
    fn evaluate_name_composition() {
        assert_eq!(child_evaluate_name(None, "x"), None);
        assert_eq!(child_evaluate_name(Some("obj"), "x"), Some("obj.x".to_string()));
        assert_eq!(
            child_evaluate_name(Some("arr"), "3"),
            Some("arr[3]".to_string())
        );
    }

    #[test]
    fn array_length_from_description() {
        assert_eq!(length_from_description("Array(3)"), Some(3));
        assert_eq!(length_from_description("Int32Array(1024)"), Some(1024));
        assert_eq!(length_from_description("Object"), None);
        assert_eq!(length_from_description("foo(bar)"), None);
    }

    #[test]
    fn object_preview_strings() {
        let obj = RemoteObject {
            object_type: "object".to_string(),
            description: Some("Object".to_string()),
            preview: Some(preview(false, &[("a", "1"), ("b", "2")])),
            ..Default::default()
        };
        assert_eq!(object_preview_string(&obj), "Object {a: 1, b: 2}");

        let arr = RemoteObject {
            object_type: "object".to_string(),
            subtype: Some("array".to_string()),
            description: Some("Array(2)".to_string()),
            preview: Some(preview(true, &[("0", "1"), ("1", "2")])),
            ..Default::default()
        };
        assert_eq!(object_preview_string(&arr), "Array(2) [1, 2, …]");
    }
}
