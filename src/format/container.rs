use std::collections::BTreeMap;
use std::fmt::{self, Write};

use crate::error::{Result, RuntimeError};

use super::{Component, ListDefinitions, Node, Path};

/// Handle of a container inside a [`ContentGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(usize);

impl ContainerId {
    pub const ROOT: ContainerId = ContainerId(0);
}

#[derive(Debug, Clone)]
pub struct Container {
    name: Option<String>,
    content: Vec<Node>,
    named_content: BTreeMap<String, ContainerId>,
    visits_should_be_counted: bool,
    turn_index_should_be_counted: bool,
    counting_at_start_only: bool,
    parent: Option<ContainerId>,
    /// Position in the parent's `content`, `None` for named-only children.
    index_in_parent: Option<usize>,
    path: Path,
    path_string: String,
}

impl Container {
    fn new(name: Option<String>, count_flags: i64) -> Self {
        Self {
            name,
            content: Vec::new(),
            named_content: BTreeMap::new(),
            visits_should_be_counted: count_flags & 1 != 0,
            turn_index_should_be_counted: count_flags & 2 != 0,
            counting_at_start_only: count_flags & 4 != 0,
            parent: None,
            index_in_parent: None,
            path: Path::default(),
            path_string: String::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_valid_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn content(&self) -> &[Node] {
        &self.content
    }

    pub fn named_content(&self) -> &BTreeMap<String, ContainerId> {
        &self.named_content
    }

    pub fn visits_should_be_counted(&self) -> bool {
        self.visits_should_be_counted
    }

    pub fn turn_index_should_be_counted(&self) -> bool {
        self.turn_index_should_be_counted
    }

    pub fn counting_at_start_only(&self) -> bool {
        self.counting_at_start_only
    }

    pub fn count_flags(&self) -> i64 {
        let mut flags = 0;
        if self.visits_should_be_counted {
            flags |= 1;
        }
        if self.turn_index_should_be_counted {
            flags |= 2;
        }
        if self.counting_at_start_only {
            flags |= 4;
        }
        // start-only on its own means nothing
        if flags == 4 {
            flags = 0;
        }
        flags
    }

    pub fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    pub fn index_in_parent(&self) -> Option<usize> {
        self.index_in_parent
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_string(&self) -> &str {
        &self.path_string
    }
}

/// What a path or pointer resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentRef {
    Container(ContainerId),
    Leaf { container: ContainerId, index: usize },
}

impl ContentRef {
    pub fn as_container(self) -> Option<ContainerId> {
        match self {
            ContentRef::Container(id) => Some(id),
            ContentRef::Leaf { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub content: Option<ContentRef>,
    pub approximate: bool,
}

impl SearchResult {
    pub fn container(&self) -> Option<ContainerId> {
        self.content.and_then(ContentRef::as_container)
    }

    /// The content, but only when it was found exactly.
    pub fn correct_content(&self) -> Option<ContentRef> {
        if self.approximate {
            None
        } else {
            self.content
        }
    }
}

/// Cursor into the content graph: a container and an index into its content. Index -1 points at
/// the container itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub container: Option<ContainerId>,
    pub index: i32,
}

impl Default for Pointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl Pointer {
    pub const NULL: Pointer = Pointer {
        container: None,
        index: -1,
    };

    pub fn new(container: ContainerId, index: i32) -> Self {
        Self {
            container: Some(container),
            index,
        }
    }

    pub fn start_of(container: ContainerId) -> Self {
        Self::new(container, 0)
    }

    pub fn is_null(&self) -> bool {
        self.container.is_none()
    }
}

/// Result of looking a path up for the engine: the pointer and, when the match was only
/// approximate, the path that was actually found.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerLookup {
    pub pointer: Pointer,
    pub approximated_to: Option<Path>,
}

/// The immutable story content: an arena of containers rooted at [`ContainerId::ROOT`].
#[derive(Debug, Clone, Default)]
pub struct ContentGraph {
    containers: Vec<Container>,
    lists: ListDefinitions,
}

impl ContentGraph {
    pub(crate) fn new(lists: ListDefinitions) -> Self {
        Self {
            containers: Vec::new(),
            lists,
        }
    }

    pub(crate) fn add_container(&mut self, name: Option<String>, count_flags: i64) -> ContainerId {
        self.containers.push(Container::new(name, count_flags));
        ContainerId(self.containers.len() - 1)
    }

    pub(crate) fn push_content(&mut self, parent: ContainerId, node: Node) -> Result<()> {
        let index = self.containers[parent.0].content.len();
        if let Node::Container(child) = &node {
            self.attach(parent, *child, Some(index))?;
        }
        self.containers[parent.0].content.push(node);
        Ok(())
    }

    pub(crate) fn add_named_content(
        &mut self,
        parent: ContainerId,
        name: String,
        child: ContainerId,
    ) -> Result<()> {
        self.attach(parent, child, None)?;
        let child_container = &mut self.containers[child.0];
        child_container.name = Some(name.clone());
        self.containers[parent.0].named_content.insert(name, child);
        Ok(())
    }

    fn attach(&mut self, parent: ContainerId, child: ContainerId, index: Option<usize>) -> Result<()> {
        let container = &mut self.containers[child.0];
        if container.parent.is_some() || child == ContainerId::ROOT {
            return Err(RuntimeError::assertion(format!(
                "container {:?} already has a parent",
                child
            )));
        }
        container.parent = Some(parent);
        container.index_in_parent = index;
        Ok(())
    }

    /// Registers named content children, computes every container's path and resolves the
    /// targets of diverts, choices and read counts.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(RuntimeError::MissingRoot);
        }

        for i in 0..self.containers.len() {
            let id = ContainerId(i);
            let (parent, name, index) = {
                let c = &self.containers[i];
                (c.parent, c.name.clone(), c.index_in_parent)
            };
            if let (Some(parent), Some(name), Some(_)) = (parent, &name, index) {
                if !name.is_empty() {
                    self.containers[parent.0].named_content.insert(name.clone(), id);
                }
            }
        }

        // children are always allocated after their parents
        for i in 1..self.containers.len() {
            let c = &self.containers[i];
            let Some(parent) = c.parent else {
                return Err(RuntimeError::assertion(format!(
                    "container {} is not attached to the graph",
                    i
                )));
            };
            let component = match (&c.name, c.index_in_parent) {
                (Some(name), _) if !name.is_empty() => Component::Name(name.clone()),
                (_, Some(index)) => Component::Index(index),
                _ => {
                    return Err(RuntimeError::assertion(format!(
                        "container {} has neither a name nor an index",
                        i
                    )))
                }
            };
            let path = self.containers[parent.0].path.with_component(component);
            self.containers[i].path_string = path.to_string();
            self.containers[i].path = path;
        }

        let mut updates = Vec::new();
        for (i, container) in self.containers.iter().enumerate() {
            for (index, node) in container.content.iter().enumerate() {
                let from = ContentRef::Leaf {
                    container: ContainerId(i),
                    index,
                };
                match node {
                    Node::Divert(divert) if !divert.is_external && !divert.has_variable_target() => {
                        if let Some(target) = &divert.target_path {
                            updates.push((from, Resolution::Divert(self.divert_pointer(from, target))));
                        }
                    }
                    Node::ChoicePoint(choice) => {
                        let target = self.resolve_path(from, &choice.path_on_choice).container();
                        updates.push((from, Resolution::Choice(target)));
                    }
                    Node::VariableReference(reference) => {
                        if let Some(path) = &reference.path_for_count {
                            let target = self.resolve_path(from, path).container();
                            updates.push((from, Resolution::Count(target)));
                        }
                    }
                    _ => {}
                }
            }
        }

        for (from, resolution) in updates {
            let ContentRef::Leaf { container, index } = from else {
                continue;
            };
            let target_path = match resolution {
                Resolution::Choice(Some(target)) => Some(self.containers[target.0].path.clone()),
                _ => None,
            };
            match (&mut self.containers[container.0].content[index], resolution) {
                (Node::Divert(divert), Resolution::Divert(pointer)) => divert.target_pointer = pointer,
                (Node::ChoicePoint(choice), Resolution::Choice(target)) => {
                    choice.choice_target = target;
                    if let Some(path) = target_path {
                        choice.path_on_choice = path;
                    }
                }
                (Node::VariableReference(reference), Resolution::Count(target)) => {
                    reference.container_for_count = target
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn divert_pointer(&self, from: ContentRef, target: &Path) -> Pointer {
        let Some(found) = self.resolve_path(from, target).content else {
            return Pointer::NULL;
        };

        match target.last_component() {
            Some(Component::Index(index)) => match self.parent_of(found) {
                Some(parent) => Pointer::new(parent, *index as i32),
                None => Pointer::NULL,
            },
            _ => match found.as_container() {
                Some(container) => Pointer::start_of(container),
                None => Pointer::NULL,
            },
        }
    }

    pub fn root(&self) -> ContainerId {
        ContainerId::ROOT
    }

    pub fn container(&self, id: ContainerId) -> &Container {
        &self.containers[id.0]
    }

    pub fn containers(&self) -> impl Iterator<Item = (ContainerId, &Container)> {
        self.containers
            .iter()
            .enumerate()
            .map(|(i, c)| (ContainerId(i), c))
    }

    pub fn lists(&self) -> &ListDefinitions {
        &self.lists
    }

    pub fn node(&self, content: ContentRef) -> Option<&Node> {
        match content {
            ContentRef::Leaf { container, index } => self.containers[container.0].content.get(index),
            ContentRef::Container(_) => None,
        }
    }

    pub fn child_ref(&self, container: ContainerId, index: usize) -> Option<ContentRef> {
        match self.containers[container.0].content.get(index)? {
            Node::Container(child) => Some(ContentRef::Container(*child)),
            _ => Some(ContentRef::Leaf { container, index }),
        }
    }

    pub fn resolve(&self, pointer: Pointer) -> Option<ContentRef> {
        let container = pointer.container?;
        if pointer.index < 0 {
            return Some(ContentRef::Container(container));
        }
        self.child_ref(container, pointer.index as usize)
    }

    pub fn parent_of(&self, content: ContentRef) -> Option<ContainerId> {
        match content {
            ContentRef::Container(id) => self.containers[id.0].parent,
            ContentRef::Leaf { container, .. } => Some(container),
        }
    }

    pub fn path_of(&self, content: ContentRef) -> Path {
        match content {
            ContentRef::Container(id) => self.containers[id.0].path.clone(),
            ContentRef::Leaf { container, index } => self.containers[container.0]
                .path
                .with_component(Component::Index(index)),
        }
    }

    /// Path of the node a pointer addresses. A pointer at a container itself has the container's path.
    pub fn pointer_path(&self, pointer: Pointer) -> Option<Path> {
        let container = pointer.container?;
        if pointer.index >= 0 {
            Some(
                self.containers[container.0]
                    .path
                    .with_component(Component::Index(pointer.index as usize)),
            )
        } else {
            Some(self.containers[container.0].path.clone())
        }
    }

    fn content_with_component(&self, container: ContainerId, component: &Component) -> Option<ContentRef> {
        match component {
            Component::Index(index) => self.child_ref(container, *index),
            Component::Parent => self.containers[container.0].parent.map(ContentRef::Container),
            Component::Name(name) => self.containers[container.0]
                .named_content
                .get(name)
                .map(|id| ContentRef::Container(*id)),
        }
    }

    /// Walks `path[start..start + len]` down from `from`. Stops at the deepest node reached when a
    /// component can't be resolved, marking the result approximate.
    pub fn content_at_path(
        &self,
        from: ContainerId,
        path: &Path,
        start: usize,
        len: Option<usize>,
    ) -> SearchResult {
        let end = len.map_or(path.len(), |len| start + len);
        let mut approximate = false;
        let mut current = ContentRef::Container(from);
        let mut current_container = Some(from);

        for i in start..end {
            let Some(container) = current_container else {
                approximate = true;
                break;
            };
            let Some(component) = path.component(i) else {
                approximate = true;
                break;
            };
            let Some(found) = self.content_with_component(container, component) else {
                approximate = true;
                break;
            };

            let next_container = found.as_container();
            if i + 1 < end && next_container.is_none() {
                approximate = true;
                break;
            }

            current = found;
            current_container = next_container;
        }

        SearchResult {
            content: Some(current),
            approximate,
        }
    }

    /// Resolves `path` as seen from `from`: relative paths start at the nearest container.
    pub fn resolve_path(&self, from: ContentRef, path: &Path) -> SearchResult {
        if path.is_relative() {
            let (nearest, path) = match from {
                ContentRef::Container(id) => (id, path.clone()),
                ContentRef::Leaf { container, .. } => (container, path.tail()),
            };
            self.content_at_path(nearest, &path, 0, None)
        } else {
            self.content_at_path(ContainerId::ROOT, path, 0, None)
        }
    }

    /// Converts an absolute path into a pointer the way diverts and saved pointers are resolved.
    pub fn pointer_at_path(&self, path: &Path) -> Result<PointerLookup> {
        if path.is_empty() {
            return Ok(PointerLookup {
                pointer: Pointer::NULL,
                approximated_to: None,
            });
        }

        let (result, pointer, length_used) = match path.last_component() {
            Some(Component::Index(index)) => {
                let length = path.len() - 1;
                let result = self.content_at_path(ContainerId::ROOT, path, 0, Some(length));
                let pointer = Pointer {
                    container: result.container(),
                    index: *index as i32,
                };
                (result, pointer, length)
            }
            _ => {
                let result = self.content_at_path(ContainerId::ROOT, path, 0, None);
                let pointer = Pointer {
                    container: result.container(),
                    index: -1,
                };
                (result, pointer, path.len())
            }
        };

        let found_root = result.content == Some(ContentRef::Container(ContainerId::ROOT));
        if result.content.is_none() || (found_root && length_used > 0) || pointer.is_null() {
            return Err(RuntimeError::story(format!(
                "Failed to find content at path '{}', and no approximation of it was possible.",
                path
            )));
        }

        let approximated_to = if result.approximate {
            result.content.map(|c| self.path_of(c))
        } else {
            None
        };

        Ok(PointerLookup {
            pointer,
            approximated_to,
        })
    }

    pub fn knot_container_with_name(&self, name: &str) -> Option<ContainerId> {
        self.containers[0].named_content.get(name).copied()
    }

    /// Shortest form of `path` for serialising a reference held by the node at `from`.
    pub fn compact_path_string(&self, from: ContentRef, path: &Path) -> String {
        path.compact_string_from(&self.path_of(from))
    }

    /// Indented dump of the graph, marking the node `pointer` currently addresses.
    pub fn build_string_of_hierarchy(&self, pointer: Pointer) -> String {
        let mut out = String::new();
        let current = self.resolve(pointer);
        // writing to a String can't fail
        let _ = self.write_hierarchy(&mut out, ContainerId::ROOT, 0, current);
        out
    }

    fn write_hierarchy(
        &self,
        out: &mut String,
        id: ContainerId,
        indent: usize,
        current: Option<ContentRef>,
    ) -> fmt::Result {
        let pad = "    ".repeat(indent);
        let container = &self.containers[id.0];
        write!(out, "{}[", pad)?;
        if let Some(name) = container.name() {
            write!(out, " ({})", name)?;
        }
        if current == Some(ContentRef::Container(id)) {
            out.push_str("  <---");
        }
        out.push('\n');

        for (index, node) in container.content.iter().enumerate() {
            match node {
                Node::Container(child) => self.write_hierarchy(out, *child, indent + 1, current)?,
                node => {
                    write!(out, "{}    {}", pad, describe(node))?;
                    if current == Some(ContentRef::Leaf { container: id, index }) {
                        out.push_str("  <---");
                    }
                    out.push('\n');
                }
            }
        }

        let named_only: Vec<_> = container
            .named_content
            .iter()
            .filter(|(_, child)| self.containers[child.0].index_in_parent.is_none())
            .collect();
        if !named_only.is_empty() {
            writeln!(out, "{}    -- named: --", pad)?;
            for (_, child) in named_only {
                self.write_hierarchy(out, *child, indent + 1, current)?;
            }
        }

        writeln!(out, "{}]", pad)
    }
}

#[derive(Clone, Copy)]
enum Resolution {
    Divert(Pointer),
    Choice(Option<ContainerId>),
    Count(Option<ContainerId>),
}

fn describe(node: &Node) -> String {
    match node {
        Node::Value(super::Value::String(s)) => format!("{:?}", s),
        Node::Value(v) => v.to_string(),
        Node::Control(c) => c.to_string(),
        Node::Divert(d) => d.to_string(),
        Node::ChoicePoint(c) => format!("Choice: -> {}", c.path_on_choice),
        Node::VariableAssignment(a) => format!("VarAssign to {}", a.variable_name),
        Node::VariableReference(r) => match (&r.name, &r.path_for_count) {
            (_, Some(path)) => format!("read_count({})", path),
            (Some(name), _) => format!("var({})", name),
            _ => "var(?)".to_string(),
        },
        Node::NativeCall(f) => format!("Native '{}'", f),
        Node::Glue => "Glue".to_string(),
        Node::Tag(t) => format!("# {}", t),
        Node::Void => "Void".to_string(),
        Node::Container(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ControlCommand, Divert, Value};

    /// root: [ "a", [ "b", "c" ], done ] with a named-only "knot": [ "k" ]
    fn sample() -> ContentGraph {
        let mut g = ContentGraph::new(ListDefinitions::default());
        let root = g.add_container(None, 0);
        g.push_content(root, Node::Value(Value::String("a".into()))).unwrap();
        let inner = g.add_container(None, 1);
        g.push_content(inner, Node::Value(Value::String("b".into()))).unwrap();
        g.push_content(inner, Node::Value(Value::String("c".into()))).unwrap();
        g.push_content(root, Node::Container(inner)).unwrap();
        g.push_content(root, Node::Control(ControlCommand::Done)).unwrap();
        let knot = g.add_container(None, 0);
        g.push_content(knot, Node::Value(Value::String("k".into()))).unwrap();
        g.push_content(knot, Node::Divert(Divert::new(Some(".^.^.1.1".parse().unwrap()))))
            .unwrap();
        g.add_named_content(root, "knot".to_string(), knot).unwrap();
        g.finish().unwrap();
        g
    }

    #[test]
    fn paths_round_trip_through_content_at_path() {
        let g = sample();
        for (id, container) in g.containers() {
            for index in 0..container.content().len() {
                let content = g.child_ref(id, index).unwrap();
                let path = g.path_of(content);
                let found = g.content_at_path(ContainerId::ROOT, &path, 0, None);
                assert!(!found.approximate);
                assert_eq!(found.content, Some(content));
            }
        }
        assert_eq!(g.container(ContainerId(2)).path_string(), "knot");
    }

    #[test]
    fn unresolvable_paths_are_approximate() {
        let g = sample();
        let found = g.content_at_path(ContainerId::ROOT, &"1.missing".parse().unwrap(), 0, None);
        assert!(found.approximate);
        assert_eq!(found.content, Some(ContentRef::Container(ContainerId(1))));

        // pointer lookup warns through the approximated path
        let lookup = g.pointer_at_path(&"1.missing".parse().unwrap()).unwrap();
        assert_eq!(lookup.pointer, Pointer::new(ContainerId(1), -1));
        assert_eq!(lookup.approximated_to.map(|p| p.to_string()), Some("1".into()));

        assert!(g.pointer_at_path(&"nowhere".parse().unwrap()).is_err());
    }

    #[test]
    fn relative_divert_targets_are_resolved() {
        let g = sample();
        let Node::Divert(divert) = &g.container(ContainerId(2)).content()[1] else {
            panic!("expected divert");
        };
        assert_eq!(divert.target_pointer, Pointer::new(ContainerId(1), 1));
        assert_eq!(
            g.compact_path_string(
                ContentRef::Leaf {
                    container: ContainerId(2),
                    index: 1
                },
                &"1.1".parse().unwrap()
            ),
            "1.1"
        );
    }

    #[test]
    fn reattaching_is_rejected() {
        let mut g = ContentGraph::new(ListDefinitions::default());
        let root = g.add_container(None, 0);
        let child = g.add_container(None, 0);
        g.push_content(root, Node::Container(child)).unwrap();
        assert!(matches!(
            g.push_content(root, Node::Container(child)),
            Err(RuntimeError::Assertion(_))
        ));
    }
}
