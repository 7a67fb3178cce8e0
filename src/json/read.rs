use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use crate::error::{Result, RuntimeError};
use crate::format::*;
use crate::parser::{parse_list_item, parse_path};
use crate::runtime::{CallStack, Choice, Element, Flow, Thread, DEFAULT_FLOW_NAME};

use super::{INK_VERSION_CURRENT, INK_VERSION_MINIMUM_COMPATIBLE};

/// Parses compiled story JSON into a content graph.
pub fn read_story(text: &str) -> Result<ContentGraph> {
    let document: JsonValue = serde_json::from_str(text)?;
    let document = document
        .as_object()
        .ok_or_else(|| RuntimeError::bytecode("story document is not an object"))?;

    let version = document
        .get("inkVersion")
        .and_then(JsonValue::as_i64)
        .ok_or(RuntimeError::MissingVersion)?;
    if version > INK_VERSION_CURRENT {
        return Err(RuntimeError::VersionTooNew {
            found: version,
            current: INK_VERSION_CURRENT,
        });
    }
    if version < INK_VERSION_MINIMUM_COMPATIBLE {
        return Err(RuntimeError::VersionTooOld {
            found: version,
            minimum: INK_VERSION_MINIMUM_COMPATIBLE,
        });
    }
    if version != INK_VERSION_CURRENT {
        log::warn!(
            "Version of ink used to build story ({}) doesn't match current version of engine ({}). Non-critical, but recommend synchronising.",
            version,
            INK_VERSION_CURRENT
        );
    }

    let root = document.get("root").ok_or(RuntimeError::MissingRoot)?;

    let lists = match document.get("listDefs") {
        Some(defs) => read_list_definitions(defs)?,
        None => ListDefinitions::default(),
    };

    let mut graph = ContentGraph::new(lists);
    match read_node(&mut graph, root)? {
        Node::Container(id) if id == ContainerId::ROOT => {}
        _ => return Err(RuntimeError::MissingRoot),
    }
    graph.finish()?;

    log::debug!(
        "loaded story with {} containers",
        graph.containers().count()
    );
    Ok(graph)
}

pub fn read_list_definitions(token: &JsonValue) -> Result<ListDefinitions> {
    let defs = token
        .as_object()
        .ok_or_else(|| RuntimeError::bytecode("listDefs is not an object"))?;

    let mut lists = Vec::with_capacity(defs.len());
    for (name, items) in defs {
        let items = items
            .as_object()
            .ok_or_else(|| RuntimeError::bytecode(format!("list '{}' is not an object", name)))?;
        let items = items
            .iter()
            .map(|(item, value)| Ok((item.clone(), read_i32(value)?)))
            .collect::<Result<Vec<_>>>()?;
        lists.push(ListDefinition::new(name.clone(), items));
    }
    Ok(ListDefinitions::new(lists))
}

fn read_container(graph: &mut ContentGraph, items: &[JsonValue]) -> Result<ContainerId> {
    let (terminator, content) = items
        .split_last()
        .ok_or_else(|| RuntimeError::bytecode("container array is empty"))?;

    let terminator = match terminator {
        JsonValue::Null => None,
        JsonValue::Object(obj) => Some(obj),
        other => {
            return Err(RuntimeError::bytecode(format!(
                "container must end with an object or null, found {}",
                other
            )))
        }
    };

    let mut name = None;
    let mut flags = 0;
    if let Some(terminator) = terminator {
        if let Some(f) = terminator.get("#f") {
            flags = f
                .as_i64()
                .ok_or_else(|| RuntimeError::bytecode("container flags must be an integer"))?;
        }
        if let Some(n) = terminator.get("#n") {
            name = Some(
                n.as_str()
                    .ok_or_else(|| RuntimeError::bytecode("container name must be a string"))?
                    .to_string(),
            );
        }
    }

    let id = graph.add_container(name, flags);
    for token in content {
        let node = read_node(graph, token)?;
        graph.push_content(id, node)?;
    }

    if let Some(terminator) = terminator {
        for (key, value) in terminator {
            if key == "#f" || key == "#n" {
                continue;
            }
            let items = value.as_array().ok_or_else(|| {
                RuntimeError::bytecode(format!("named content '{}' is not a container", key))
            })?;
            let child = read_container(graph, items)?;
            graph.add_named_content(id, key.clone(), child)?;
        }
    }

    Ok(id)
}

/// Reads one bytecode token, allocating containers in `graph` as they are found.
pub fn read_node(graph: &mut ContentGraph, token: &JsonValue) -> Result<Node> {
    if let Some(object) = try_read_object(token)? {
        return Ok(match object {
            Object::Value(v) => Node::Value(v),
            Object::Control(c) => Node::Control(c),
            Object::Glue => Node::Glue,
            Object::Tag(t) => Node::Tag(t),
            Object::Void => Node::Void,
        });
    }

    match token {
        JsonValue::String(s) => {
            let name = if s == "L^" { "^" } else { s.as_str() };
            NativeFunction::from_name(name)
                .map(Node::NativeCall)
                .ok_or_else(|| RuntimeError::bytecode(format!("unknown token '{}'", s)))
        }
        JsonValue::Array(items) => Ok(Node::Container(read_container(graph, items)?)),
        JsonValue::Object(obj) => read_object_node(obj),
        other => Err(RuntimeError::bytecode(format!("unexpected token {}", other))),
    }
}

fn read_object_node(obj: &Map<String, JsonValue>) -> Result<Node> {
    let divert = [
        ("->", false, PushPopType::Function, false),
        ("f()", true, PushPopType::Function, false),
        ("->t->", true, PushPopType::Tunnel, false),
        ("x()", false, PushPopType::Function, true),
    ]
    .into_iter()
    .find_map(|(key, pushes, push_type, external)| {
        obj.get(key).map(|target| (target, pushes, push_type, external))
    });

    if let Some((target, pushes_to_stack, stack_push_type, is_external)) = divert {
        let target = read_str(target)?;
        let mut divert = if obj.contains_key("var") {
            let mut divert = Divert::new(None);
            divert.variable_divert_name = Some(target.to_string());
            divert
        } else {
            Divert::new(Some(parse_path(target)?))
        };
        divert.pushes_to_stack = pushes_to_stack;
        divert.stack_push_type = stack_push_type;
        divert.is_external = is_external;
        divert.is_conditional = obj.get("c").is_some_and(truthy);
        if is_external {
            if let Some(args) = obj.get("exArgs") {
                divert.external_args = usize::try_from(read_i32(args)?)
                    .map_err(|_| RuntimeError::bytecode("negative external argument count"))?;
            }
        }
        return Ok(Node::Divert(divert));
    }

    if let Some(path) = obj.get("*") {
        let flags = match obj.get("flg") {
            Some(flg) => flg
                .as_i64()
                .ok_or_else(|| RuntimeError::bytecode("choice flags must be an integer"))?,
            None => 0,
        };
        return Ok(Node::ChoicePoint(ChoicePoint::from_flags(
            parse_path(read_str(path)?)?,
            flags,
        )));
    }

    if let Some(name) = obj.get("VAR?") {
        return Ok(Node::VariableReference(VariableReference {
            name: Some(read_str(name)?.to_string()),
            path_for_count: None,
            container_for_count: None,
        }));
    }

    if let Some(path) = obj.get("CNT?") {
        return Ok(Node::VariableReference(VariableReference {
            name: None,
            path_for_count: Some(parse_path(read_str(path)?)?),
            container_for_count: None,
        }));
    }

    let assignment = match (obj.get("VAR="), obj.get("temp=")) {
        (Some(name), _) => Some((name, true)),
        (None, Some(name)) => Some((name, false)),
        _ => None,
    };
    if let Some((name, is_global)) = assignment {
        return Ok(Node::VariableAssignment(VariableAssignment {
            variable_name: read_str(name)?.to_string(),
            is_new_declaration: !obj.get("re").is_some_and(truthy),
            is_global,
        }));
    }

    Err(RuntimeError::bytecode(format!(
        "unrecognised object {}",
        JsonValue::Object(obj.clone())
    )))
}

/// Reads a token that can live on the evaluation stack or in the output stream.
pub fn read_object(token: &JsonValue) -> Result<Object> {
    try_read_object(token)?
        .ok_or_else(|| RuntimeError::bytecode(format!("unexpected token {}", token)))
}

fn try_read_object(token: &JsonValue) -> Result<Option<Object>> {
    let object = match token {
        JsonValue::Bool(b) => Object::Value(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                let i = i32::try_from(i)
                    .map_err(|_| RuntimeError::bytecode(format!("integer {} out of range", i)))?;
                Object::Value(Value::Int(i))
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| RuntimeError::bytecode(format!("bad number {}", n)))?;
                Object::Value(Value::Float(f as f32))
            }
        }
        JsonValue::String(s) => {
            if let Some(text) = s.strip_prefix('^') {
                Object::string(text)
            } else if s == "\n" {
                Object::string("\n")
            } else if s == "<>" {
                Object::Glue
            } else if s == "void" {
                Object::Void
            } else if let Some(command) = ControlCommand::from_name(s) {
                Object::Control(command)
            } else {
                return Ok(None);
            }
        }
        JsonValue::Object(obj) => {
            if let Some(target) = obj.get("^->") {
                Object::Value(Value::DivertTarget(parse_path(read_str(target)?)?))
            } else if let Some(name) = obj.get("^var") {
                let context_index = match obj.get("ci") {
                    Some(ci) => read_i32(ci)?,
                    None => -1,
                };
                Object::Value(Value::VariablePointer {
                    name: read_str(name)?.to_string(),
                    context_index,
                })
            } else if let Some(text) = obj.get("#") {
                Object::Tag(read_str(text)?.to_string())
            } else if let Some(list) = obj.get("list") {
                Object::Value(Value::List(read_ink_list(list, obj.get("origins"))?))
            } else {
                return Ok(None);
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(object))
}

fn read_ink_list(items: &JsonValue, origins: Option<&JsonValue>) -> Result<InkList> {
    let items = items
        .as_object()
        .ok_or_else(|| RuntimeError::bytecode("list content must be an object"))?;

    let mut list = InkList::new();
    for (key, value) in items {
        list.insert(parse_list_item(key)?, read_i32(value)?);
    }

    if let Some(origins) = origins {
        let names = origins
            .as_array()
            .ok_or_else(|| RuntimeError::bytecode("list origins must be an array"))?
            .iter()
            .map(|name| read_str(name).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        list.set_initial_origin_names(Some(names));
    }
    Ok(list)
}

pub fn read_object_array(token: &JsonValue) -> Result<Vec<Object>> {
    token
        .as_array()
        .ok_or(RuntimeError::InvalidSaveFormat)?
        .iter()
        .map(read_object)
        .collect()
}

pub fn read_value(token: &JsonValue) -> Result<Value> {
    read_object(token)?
        .into_value()
        .ok_or_else(|| RuntimeError::bytecode(format!("expected a value, found {}", token)))
}

pub fn read_value_dictionary(token: &JsonValue) -> Result<BTreeMap<String, Value>> {
    token
        .as_object()
        .ok_or(RuntimeError::InvalidSaveFormat)?
        .iter()
        .map(|(name, value)| Ok((name.clone(), read_value(value)?)))
        .collect()
}

pub fn read_int_dictionary(token: &JsonValue) -> Result<BTreeMap<String, i32>> {
    token
        .as_object()
        .ok_or(RuntimeError::InvalidSaveFormat)?
        .iter()
        .map(|(name, value)| Ok((name.clone(), read_i32(value)?)))
        .collect()
}

/// Reads a saved choice. Its generating thread is attached by the flow loader.
pub fn read_choice(token: &JsonValue) -> Result<Choice> {
    let obj = token.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
    let field = |key: &str| obj.get(key).ok_or(RuntimeError::InvalidSaveFormat);

    let tags = match obj.get("tags") {
        Some(tags) => tags
            .as_array()
            .ok_or(RuntimeError::InvalidSaveFormat)?
            .iter()
            .map(|tag| read_str(tag).map(str::to_string))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(Choice {
        text: read_str(field("text")?)?.to_string(),
        index: usize::try_from(read_i32(field("index")?)?)
            .map_err(|_| RuntimeError::InvalidSaveFormat)?,
        source_path: read_str(field("originalChoicePath")?)?.to_string(),
        target_path: parse_path(read_str(field("targetPath")?)?)?,
        tags,
        is_invisible_default: false,
        original_thread_index: read_i32(field("originalThreadIndex")?)?,
        thread_at_generation: None,
    })
}

/// Reads a saved thread, resolving its pointers against `graph`. Locations that only resolve
/// approximately are kept and reported through `warnings`.
pub fn read_thread(
    token: &JsonValue,
    graph: &ContentGraph,
    warnings: &mut Vec<String>,
) -> Result<Thread> {
    let obj = token.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;

    let mut thread = Thread::new();
    thread.thread_index = read_i32(obj.get("threadIndex").ok_or(RuntimeError::InvalidSaveFormat)?)?;

    let elements = obj
        .get("callstack")
        .and_then(JsonValue::as_array)
        .ok_or(RuntimeError::InvalidSaveFormat)?;

    for element in elements {
        let element = element.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
        let push_type = element
            .get("type")
            .and_then(JsonValue::as_i64)
            .and_then(PushPopType::from_int)
            .ok_or(RuntimeError::InvalidSaveFormat)?;

        let mut pointer = Pointer::NULL;
        if let Some(container_path) = element.get("cPath") {
            let container_path = read_str(container_path)?;
            let result = graph.content_at_path(ContainerId::ROOT, &parse_path(container_path)?, 0, None);
            pointer.container = result.container();
            pointer.index = match element.get("idx") {
                Some(idx) => read_i32(idx)?,
                None => 0,
            };

            match (result.content, pointer.container) {
                (None, _) => {
                    return Err(RuntimeError::story(format!(
                        "When loading state, internal story location couldn't be found: {}. Has the story changed since this save data was created?",
                        container_path
                    )))
                }
                (Some(_), Some(container)) if result.approximate => warnings.push(format!(
                    "When loading state, exact internal story location couldn't be found: '{}', so it was approximated to '{}' to recover. Has the story changed since this save data was created?",
                    container_path,
                    graph.container(container).path()
                )),
                (Some(_), None) if result.approximate => warnings.push(format!(
                    "When loading state, exact internal story location couldn't be found: '{}' and it may not be recoverable. Has the story changed since this save data was created?",
                    container_path
                )),
                _ => {}
            }
        }

        let in_expression_evaluation = element.get("exp").is_some_and(truthy);
        let mut el = Element::new(push_type, pointer, in_expression_evaluation);
        if let Some(temps) = element.get("temp") {
            el.temporary_variables = read_value_dictionary(temps)?;
        }
        thread.callstack.push(el);
    }

    if let Some(previous) = obj.get("previousContentObject") {
        let path = parse_path(read_str(previous)?)?;
        thread.previous_pointer = graph.pointer_at_path(&path)?.pointer;
    }

    Ok(thread)
}

pub fn read_call_stack(
    token: &JsonValue,
    graph: &ContentGraph,
    warnings: &mut Vec<String>,
) -> Result<CallStack> {
    let obj = token.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
    let threads = obj
        .get("threads")
        .and_then(JsonValue::as_array)
        .ok_or(RuntimeError::InvalidSaveFormat)?
        .iter()
        .map(|thread| read_thread(thread, graph, warnings))
        .collect::<Result<Vec<_>>>()?;
    let thread_counter = read_i32(obj.get("threadCounter").ok_or(RuntimeError::InvalidSaveFormat)?)?;

    CallStack::from_parts(graph.root(), threads, thread_counter)
}

pub fn read_flow(
    name: &str,
    token: &JsonValue,
    graph: &ContentGraph,
    warnings: &mut Vec<String>,
) -> Result<Flow> {
    let obj = token.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
    let field = |key: &str| obj.get(key).ok_or(RuntimeError::InvalidSaveFormat);

    let mut flow = Flow {
        name: name.to_string(),
        call_stack: read_call_stack(field("callstack")?, graph, warnings)?,
        output_stream: read_object_array(field("outputStream")?)?,
        current_choices: read_choices(field("currentChoices")?)?,
    };
    attach_choice_threads(&mut flow, obj.get("choiceThreads"), graph, warnings)?;
    Ok(flow)
}

/// Reads the single-flow save layout written before multiple flows existed.
pub fn read_legacy_flow(
    obj: &Map<String, JsonValue>,
    graph: &ContentGraph,
    warnings: &mut Vec<String>,
) -> Result<Flow> {
    let field = |key: &str| obj.get(key).ok_or(RuntimeError::InvalidSaveFormat);

    let mut flow = Flow {
        name: DEFAULT_FLOW_NAME.to_string(),
        call_stack: read_call_stack(field("callstackThreads")?, graph, warnings)?,
        output_stream: read_object_array(field("outputStream")?)?,
        current_choices: read_choices(field("currentChoices")?)?,
    };
    attach_choice_threads(&mut flow, obj.get("choiceThreads"), graph, warnings)?;
    Ok(flow)
}

fn read_choices(token: &JsonValue) -> Result<Vec<Choice>> {
    token
        .as_array()
        .ok_or(RuntimeError::InvalidSaveFormat)?
        .iter()
        .map(read_choice)
        .collect()
}

/// A choice resumes on the thread it was generated on: a live thread of the call stack when it
/// still exists, otherwise the copy saved under `choiceThreads`.
fn attach_choice_threads(
    flow: &mut Flow,
    saved: Option<&JsonValue>,
    graph: &ContentGraph,
    warnings: &mut Vec<String>,
) -> Result<()> {
    for choice in &mut flow.current_choices {
        let index = choice.original_thread_index;
        let thread = match flow.call_stack.thread_with_index(index) {
            Some(thread) => thread.clone(),
            None => {
                let token = saved
                    .and_then(|threads| threads.get(index.to_string()))
                    .ok_or(RuntimeError::InvalidSaveFormat)?;
                read_thread(token, graph, warnings)?
            }
        };
        choice.thread_at_generation = Some(thread);
    }
    Ok(())
}

fn read_str(token: &JsonValue) -> Result<&str> {
    token
        .as_str()
        .ok_or_else(|| RuntimeError::bytecode(format!("expected a string, found {}", token)))
}

fn read_i32(token: &JsonValue) -> Result<i32> {
    token
        .as_i64()
        .and_then(|i| i32::try_from(i).ok())
        .ok_or_else(|| RuntimeError::bytecode(format!("expected an integer, found {}", token)))
}

fn truthy(token: &JsonValue) -> bool {
    match token {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_version() {
        let err = read_story(r##"{"root": [null]}"##).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingVersion));
    }

    #[test]
    fn rejects_newer_and_older_versions() {
        let err = read_story(r##"{"inkVersion": 22, "root": [null]}"##).unwrap_err();
        assert!(matches!(err, RuntimeError::VersionTooNew { found: 22, .. }));
        let err = read_story(r##"{"inkVersion": 17, "root": [null]}"##).unwrap_err();
        assert!(matches!(err, RuntimeError::VersionTooOld { found: 17, .. }));
    }

    #[test]
    fn rejects_missing_root() {
        let err = read_story(r##"{"inkVersion": 21}"##).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingRoot));
    }

    #[test]
    fn reads_nodes() {
        let graph = read_story(
            r##"{"inkVersion": 21, "root": [
                "^Hello", "\n", "<>", "ev", 1, 2.5, "+", "L^", "/ev",
                {"->": "knot"}, {"f()": "fn"}, {"->t->": "tun"}, {"x()": "ext", "exArgs": 2},
                {"->": "target", "var": true, "c": true},
                {"*": ".^.c-0", "flg": 20},
                {"VAR?": "x"}, {"CNT?": ".^"}, {"VAR=": "x", "re": true}, {"temp=": "y"},
                {"#": "legacy"}, {"^->": "knot"}, {"^var": "x", "ci": 0},
                {"list": {"Colours.red": 1}, "origins": ["Colours"]},
                "void", "done",
                {"knot": ["end", {"#f": 3}], "fn": ["~ret", null], "tun": ["->->", null], "c-0": [null]}
            ]}"##,
        )
        .unwrap();

        let root = graph.container(graph.root());
        let content = root.content();
        assert_eq!(content[0], Node::Value(Value::from("Hello")));
        assert_eq!(content[1], Node::Value(Value::from("\n")));
        assert_eq!(content[2], Node::Glue);
        assert_eq!(content[3], Node::Control(ControlCommand::EvalStart));
        assert_eq!(content[4], Node::Value(Value::Int(1)));
        assert_eq!(content[5], Node::Value(Value::Float(2.5)));
        assert!(matches!(content[6], Node::NativeCall(_)));
        assert_eq!(content[7], Node::NativeCall(NativeFunction::from_name("^").unwrap()));

        let Node::Divert(d) = &content[9] else { panic!() };
        assert!(!d.pushes_to_stack);
        assert!(!d.target_pointer.is_null());
        let Node::Divert(d) = &content[10] else { panic!() };
        assert_eq!(d.stack_push_type, PushPopType::Function);
        let Node::Divert(d) = &content[11] else { panic!() };
        assert_eq!(d.stack_push_type, PushPopType::Tunnel);
        let Node::Divert(d) = &content[12] else { panic!() };
        assert!(d.is_external);
        assert_eq!(d.external_args, 2);
        assert_eq!(d.external_name(), "ext");
        let Node::Divert(d) = &content[13] else { panic!() };
        assert_eq!(d.variable_divert_name.as_deref(), Some("target"));
        assert!(d.is_conditional);

        let Node::ChoicePoint(c) = &content[14] else { panic!() };
        assert!(c.once_only);
        assert!(c.has_choice_only_content);
        assert!(c.choice_target.is_some());

        let Node::VariableAssignment(a) = &content[17] else { panic!() };
        assert!(a.is_global && !a.is_new_declaration);
        let Node::VariableAssignment(a) = &content[18] else { panic!() };
        assert!(!a.is_global && a.is_new_declaration);

        assert_eq!(content[19], Node::Tag("legacy".to_string()));
        let Node::Value(Value::List(list)) = &content[22] else { panic!() };
        assert_eq!(list.len(), 1);
        assert_eq!(content[23], Node::Void);

        let knot = graph.knot_container_with_name("knot").unwrap();
        assert!(graph.container(knot).visits_should_be_counted());
        assert!(graph.container(knot).turn_index_should_be_counted());
    }

    #[test]
    fn rejects_unknown_tokens() {
        let err = read_story(r##"{"inkVersion": 21, "root": ["bogus", null]}"##).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidBytecode(_)));
    }
}
