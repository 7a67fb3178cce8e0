use std::collections::BTreeMap;

use serde_json::{json, Map, Number, Value as JsonValue};

use crate::format::*;
use crate::runtime::{CallStack, Choice, Flow, Thread};

use super::INK_VERSION_CURRENT;

/// Serialises a content graph back to compiled story JSON.
pub fn write_story(graph: &ContentGraph) -> JsonValue {
    let mut document = Map::new();
    document.insert("inkVersion".to_string(), json!(INK_VERSION_CURRENT));
    document.insert(
        "root".to_string(),
        write_container(graph, graph.root(), false),
    );

    let lists = graph.lists().lists();
    if !lists.is_empty() {
        let defs: Map<String, JsonValue> = lists
            .iter()
            .map(|list| {
                let items: Map<String, JsonValue> = list
                    .raw_items()
                    .iter()
                    .map(|(name, value)| (name.clone(), json!(value)))
                    .collect();
                (list.name().to_string(), JsonValue::Object(items))
            })
            .collect();
        document.insert("listDefs".to_string(), JsonValue::Object(defs));
    }

    JsonValue::Object(document)
}

fn write_container(graph: &ContentGraph, id: ContainerId, without_name: bool) -> JsonValue {
    let container = graph.container(id);
    let mut items: Vec<JsonValue> = container
        .content()
        .iter()
        .enumerate()
        .map(|(index, node)| write_node(graph, ContentRef::Leaf { container: id, index }, node))
        .collect();

    let mut terminator = Map::new();
    for (name, child) in container.named_content() {
        if graph.container(*child).index_in_parent().is_none() {
            terminator.insert(name.clone(), write_container(graph, *child, true));
        }
    }
    let flags = container.count_flags();
    if flags > 0 {
        terminator.insert("#f".to_string(), json!(flags));
    }
    if !without_name {
        if let Some(name) = container.name() {
            terminator.insert("#n".to_string(), json!(name));
        }
    }

    if terminator.is_empty() {
        items.push(JsonValue::Null);
    } else {
        items.push(JsonValue::Object(terminator));
    }
    JsonValue::Array(items)
}

/// Serialises one node. Paths are written relative to `from` when that is shorter.
pub fn write_node(graph: &ContentGraph, from: ContentRef, node: &Node) -> JsonValue {
    match node {
        Node::Container(id) => write_container(graph, *id, false),
        Node::Value(value) => write_value(value),
        Node::Control(command) => json!(command.name()),
        Node::Glue => json!("<>"),
        Node::Tag(text) => json!({ "#": text }),
        Node::Void => json!("void"),
        Node::NativeCall(function) => match function.name() {
            "^" => json!("L^"),
            name => json!(name),
        },
        Node::Divert(divert) => {
            let key = if divert.is_external {
                "x()"
            } else if divert.pushes_to_stack {
                match divert.stack_push_type {
                    PushPopType::Tunnel => "->t->",
                    _ => "f()",
                }
            } else {
                "->"
            };

            let target = match (&divert.variable_divert_name, &divert.target_path) {
                (Some(name), _) => name.clone(),
                (None, Some(_)) if divert.is_external => divert.external_name(),
                (None, Some(path)) => graph.compact_path_string(from, path),
                (None, None) => String::new(),
            };

            let mut obj = Map::new();
            obj.insert(key.to_string(), json!(target));
            if divert.has_variable_target() {
                obj.insert("var".to_string(), json!(true));
            }
            if divert.is_conditional {
                obj.insert("c".to_string(), json!(true));
            }
            if divert.external_args > 0 {
                obj.insert("exArgs".to_string(), json!(divert.external_args));
            }
            JsonValue::Object(obj)
        }
        Node::ChoicePoint(choice) => json!({
            "*": graph.compact_path_string(from, &choice.path_on_choice),
            "flg": choice.flags(),
        }),
        Node::VariableReference(reference) => match (&reference.path_for_count, &reference.name) {
            (Some(_), _) => {
                let path = match reference.container_for_count {
                    Some(target) => graph.container(target).path().clone(),
                    None => reference.path_for_count.clone().unwrap_or_default(),
                };
                json!({ "CNT?": graph.compact_path_string(from, &path) })
            }
            (None, name) => json!({ "VAR?": name.clone().unwrap_or_default() }),
        },
        Node::VariableAssignment(assignment) => {
            let key = if assignment.is_global { "VAR=" } else { "temp=" };
            let mut obj = Map::new();
            obj.insert(key.to_string(), json!(assignment.variable_name));
            if !assignment.is_new_declaration {
                obj.insert("re".to_string(), json!(true));
            }
            JsonValue::Object(obj)
        }
    }
}

pub fn write_object(object: &Object) -> JsonValue {
    match object {
        Object::Value(value) => write_value(value),
        Object::Control(command) => json!(command.name()),
        Object::Glue => json!("<>"),
        Object::Tag(text) => json!({ "#": text }),
        Object::Void => json!("void"),
    }
}

pub fn write_value(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => write_float(*f),
        Value::String(s) if s == "\n" => json!("\n"),
        Value::String(s) => json!(format!("^{}", s)),
        Value::List(list) => write_ink_list(list),
        Value::DivertTarget(path) => json!({ "^->": path.to_string() }),
        Value::VariablePointer {
            name,
            context_index,
        } => json!({ "^var": name, "ci": context_index }),
    }
}

fn write_float(f: f32) -> JsonValue {
    if f.is_nan() {
        return json!(0.0);
    }
    if f.is_infinite() {
        return json!(if f > 0.0 { 3.4e38 } else { -3.4e38 });
    }
    // shortest f32 representation, so 2.5f32 is written as 2.5 rather than its f64 expansion
    let f = f.to_string().parse::<f64>().unwrap_or(f as f64);
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn write_ink_list(list: &InkList) -> JsonValue {
    let items: Map<String, JsonValue> = list
        .items()
        .map(|(item, value)| {
            let origin = item.origin_name.as_deref().unwrap_or("?");
            (format!("{}.{}", origin, item.item_name), json!(value))
        })
        .collect();

    let mut obj = Map::new();
    obj.insert("list".to_string(), JsonValue::Object(items));
    if list.is_empty() {
        if let Some(origins) = list.initial_origin_names() {
            if !origins.is_empty() {
                obj.insert("origins".to_string(), json!(origins));
            }
        }
    }
    JsonValue::Object(obj)
}

pub fn write_object_array(objects: &[Object]) -> JsonValue {
    JsonValue::Array(objects.iter().map(write_object).collect())
}

pub fn write_value_dictionary(values: &BTreeMap<String, Value>) -> JsonValue {
    JsonValue::Object(
        values
            .iter()
            .map(|(name, value)| (name.clone(), write_value(value)))
            .collect(),
    )
}

pub fn write_int_dictionary(values: &BTreeMap<String, i32>) -> JsonValue {
    JsonValue::Object(
        values
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect(),
    )
}

pub fn write_choice(choice: &Choice) -> JsonValue {
    let mut obj = Map::new();
    obj.insert("text".to_string(), json!(choice.text));
    obj.insert("index".to_string(), json!(choice.index));
    obj.insert("originalChoicePath".to_string(), json!(choice.source_path));
    obj.insert(
        "originalThreadIndex".to_string(),
        json!(choice.original_thread_index),
    );
    obj.insert(
        "targetPath".to_string(),
        json!(choice.path_string_on_choice()),
    );
    if !choice.tags.is_empty() {
        obj.insert("tags".to_string(), json!(choice.tags));
    }
    JsonValue::Object(obj)
}

pub fn write_thread(graph: &ContentGraph, thread: &Thread) -> JsonValue {
    let callstack: Vec<JsonValue> = thread
        .callstack
        .iter()
        .map(|element| {
            let mut obj = Map::new();
            if let Some(container) = element.current_pointer.container {
                obj.insert(
                    "cPath".to_string(),
                    json!(graph.container(container).path_string()),
                );
                obj.insert("idx".to_string(), json!(element.current_pointer.index));
            }
            obj.insert("exp".to_string(), json!(element.in_expression_evaluation));
            obj.insert("type".to_string(), json!(element.push_type.as_int()));
            if !element.temporary_variables.is_empty() {
                obj.insert(
                    "temp".to_string(),
                    write_value_dictionary(&element.temporary_variables),
                );
            }
            JsonValue::Object(obj)
        })
        .collect();

    let mut obj = Map::new();
    obj.insert("callstack".to_string(), JsonValue::Array(callstack));
    obj.insert("threadIndex".to_string(), json!(thread.thread_index));
    if let Some(previous) = graph.resolve(thread.previous_pointer) {
        obj.insert(
            "previousContentObject".to_string(),
            json!(graph.path_of(previous).to_string()),
        );
    }
    JsonValue::Object(obj)
}

pub fn write_call_stack(graph: &ContentGraph, call_stack: &CallStack) -> JsonValue {
    json!({
        "threads": call_stack
            .threads()
            .iter()
            .map(|thread| write_thread(graph, thread))
            .collect::<Vec<_>>(),
        "threadCounter": call_stack.thread_counter(),
    })
}

/// Threads of choices generated on threads that have since ended are saved alongside the flow,
/// keyed by thread index.
pub fn write_flow(graph: &ContentGraph, flow: &Flow) -> JsonValue {
    let mut choice_threads = Map::new();
    for choice in &flow.current_choices {
        let Some(thread) = &choice.thread_at_generation else {
            continue;
        };
        if flow.call_stack.thread_with_index(thread.thread_index).is_none() {
            choice_threads.insert(thread.thread_index.to_string(), write_thread(graph, thread));
        }
    }

    let mut obj = Map::new();
    obj.insert(
        "callstack".to_string(),
        write_call_stack(graph, &flow.call_stack),
    );
    obj.insert(
        "outputStream".to_string(),
        write_object_array(&flow.output_stream),
    );
    if !choice_threads.is_empty() {
        obj.insert("choiceThreads".to_string(), JsonValue::Object(choice_threads));
    }
    obj.insert(
        "currentChoices".to_string(),
        JsonValue::Array(flow.current_choices.iter().map(write_choice).collect()),
    );
    JsonValue::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::read_story;

    const STORY: &str = r##"{"inkVersion":21,"root":[["^Hello","\n",["ev",{"^->":"0.knot"},1.5,{"VAR?":"x"},"L^","/ev",{"->":".^.^.^.knot"},{"*":".^.c-0","flg":20},{"c-0":[{"CNT?":".^"},null]}],{"#n":"g-0"}],"done",{"knot":["^K",{"#f":1}]}],"listDefs":{"Colours":{"red":1,"green":2}}}"##;

    #[test]
    fn story_json_is_stable() {
        let graph = read_story(STORY).unwrap();
        let written = write_story(&graph).to_string();
        let reread = read_story(&written).unwrap();
        assert_eq!(write_story(&reread).to_string(), written);
        assert!(written.contains(r##""#n":"g-0""##));
        assert!(written.contains(r##""L^""##));
        assert!(written.contains("1.5"));
        assert!(written.contains(r##""listDefs":{"Colours":{"red":1,"green":2}}"##));
    }

    #[test]
    fn floats_use_shortest_form() {
        assert_eq!(write_value(&Value::Float(2.5)).to_string(), "2.5");
        assert_eq!(write_value(&Value::Float(0.1)).to_string(), "0.1");
        assert_eq!(write_value(&Value::Float(2.0)).to_string(), "2.0");
    }

    #[test]
    fn empty_lists_keep_origins() {
        let mut list = InkList::new();
        list.set_initial_origin_names(Some(vec!["Colours".to_string()]));
        assert_eq!(
            write_value(&Value::List(list)).to_string(),
            r##"{"list":{},"origins":["Colours"]}"##
        );
    }
}
