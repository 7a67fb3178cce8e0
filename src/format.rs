//! The content graph a story is compiled into, and the values that flow through it.

mod container;
mod list;
mod native;
mod path;
mod value;

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use self::container::*;
pub use self::list::*;
pub use self::native::NativeFunction;
pub use self::path::{Component, Path};
pub use self::value::{Value, ValueType};

pub(crate) use self::value::{is_inline_whitespace, is_newline, is_non_whitespace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    EvalStart,
    EvalOutput,
    EvalEnd,
    Duplicate,
    PopEvaluatedValue,
    PopFunction,
    PopTunnel,
    BeginString,
    EndString,
    NoOp,
    ChoiceCount,
    Turns,
    TurnsSince,
    ReadCount,
    Random,
    SeedRandom,
    VisitIndex,
    SequenceShuffleIndex,
    StartThread,
    Done,
    End,
    ListFromInt,
    ListRange,
    ListRandom,
    BeginTag,
    EndTag,
}

const COMMAND_NAMES: &[(ControlCommand, &str)] = &[
    (ControlCommand::EvalStart, "ev"),
    (ControlCommand::EvalOutput, "out"),
    (ControlCommand::EvalEnd, "/ev"),
    (ControlCommand::Duplicate, "du"),
    (ControlCommand::PopEvaluatedValue, "pop"),
    (ControlCommand::PopFunction, "~ret"),
    (ControlCommand::PopTunnel, "->->"),
    (ControlCommand::BeginString, "str"),
    (ControlCommand::EndString, "/str"),
    (ControlCommand::NoOp, "nop"),
    (ControlCommand::ChoiceCount, "choiceCnt"),
    (ControlCommand::Turns, "turn"),
    (ControlCommand::TurnsSince, "turns"),
    (ControlCommand::ReadCount, "readc"),
    (ControlCommand::Random, "rnd"),
    (ControlCommand::SeedRandom, "srnd"),
    (ControlCommand::VisitIndex, "visit"),
    (ControlCommand::SequenceShuffleIndex, "seq"),
    (ControlCommand::StartThread, "thread"),
    (ControlCommand::Done, "done"),
    (ControlCommand::End, "end"),
    (ControlCommand::ListFromInt, "listInt"),
    (ControlCommand::ListRange, "range"),
    (ControlCommand::ListRandom, "lrnd"),
    (ControlCommand::BeginTag, "#"),
    (ControlCommand::EndTag, "/#"),
];

impl ControlCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        COMMAND_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
    }

    pub fn name(self) -> &'static str {
        COMMAND_NAMES
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, n)| *n)
            .unwrap_or_default()
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kind of activation pushed onto a call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum PushPopType {
    Tunnel,
    Function,
    FunctionEvaluationFromGame,
}

impl PushPopType {
    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(PushPopType::Tunnel),
            1 => Some(PushPopType::Function),
            2 => Some(PushPopType::FunctionEvaluationFromGame),
            _ => None,
        }
    }

    pub fn as_int(self) -> i64 {
        match self {
            PushPopType::Tunnel => 0,
            PushPopType::Function => 1,
            PushPopType::FunctionEvaluationFromGame => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Divert {
    pub target_path: Option<Path>,
    pub variable_divert_name: Option<String>,
    pub pushes_to_stack: bool,
    pub stack_push_type: PushPopType,
    pub is_external: bool,
    pub external_args: usize,
    pub is_conditional: bool,
    /// Resolved once the graph is built. Null for variable and external diverts.
    pub target_pointer: Pointer,
}

impl Divert {
    pub fn new(target_path: Option<Path>) -> Self {
        Self {
            target_path,
            variable_divert_name: None,
            pushes_to_stack: false,
            stack_push_type: PushPopType::Tunnel,
            is_external: false,
            external_args: 0,
            is_conditional: false,
            target_pointer: Pointer::NULL,
        }
    }

    pub fn has_variable_target(&self) -> bool {
        self.variable_divert_name.is_some()
    }

    /// Name of the bound function an external divert calls.
    pub fn external_name(&self) -> String {
        self.target_path
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for Divert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.variable_divert_name {
            return write!(f, "Divert(variable: {})", name);
        }
        let Some(target) = &self.target_path else {
            return f.write_str("Divert(null)");
        };
        f.write_str("Divert")?;
        if self.is_conditional {
            f.write_str("?")?;
        }
        if self.pushes_to_stack {
            match self.stack_push_type {
                PushPopType::Function => f.write_str(" function")?,
                _ => f.write_str(" tunnel")?,
            }
        }
        write!(f, " -> {}", target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoicePoint {
    pub path_on_choice: Path,
    pub has_condition: bool,
    pub has_start_content: bool,
    pub has_choice_only_content: bool,
    pub is_invisible_default: bool,
    pub once_only: bool,
    pub choice_target: Option<ContainerId>,
}

impl ChoicePoint {
    pub fn from_flags(path_on_choice: Path, flags: i64) -> Self {
        Self {
            path_on_choice,
            has_condition: flags & 1 != 0,
            has_start_content: flags & 2 != 0,
            has_choice_only_content: flags & 4 != 0,
            is_invisible_default: flags & 8 != 0,
            once_only: flags & 16 != 0,
            choice_target: None,
        }
    }

    pub fn flags(&self) -> i64 {
        let mut flags = 0;
        if self.has_condition {
            flags |= 1;
        }
        if self.has_start_content {
            flags |= 2;
        }
        if self.has_choice_only_content {
            flags |= 4;
        }
        if self.is_invisible_default {
            flags |= 8;
        }
        if self.once_only {
            flags |= 16;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableAssignment {
    pub variable_name: String,
    pub is_new_declaration: bool,
    pub is_global: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableReference {
    pub name: Option<String>,
    /// Set for read counts (`CNT?`), which read a container's visit count instead of a variable.
    pub path_for_count: Option<Path>,
    pub container_for_count: Option<ContainerId>,
}

/// A node of the content graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Container(ContainerId),
    Value(Value),
    Control(ControlCommand),
    Divert(Divert),
    ChoicePoint(ChoicePoint),
    VariableAssignment(VariableAssignment),
    VariableReference(VariableReference),
    NativeCall(NativeFunction),
    Glue,
    /// Legacy single-token tag.
    Tag(String),
    Void,
}

impl Node {
    /// The runtime object this node becomes when it is plain content.
    pub fn to_object(&self) -> Option<Object> {
        match self {
            Node::Value(v) => Some(Object::Value(v.clone())),
            Node::Glue => Some(Object::Glue),
            Node::Tag(t) => Some(Object::Tag(t.clone())),
            Node::Void => Some(Object::Void),
            Node::Control(c) => Some(Object::Control(*c)),
            _ => None,
        }
    }
}

/// Items that live on the evaluation stack and in the output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Value(Value),
    Control(ControlCommand),
    Glue,
    Tag(String),
    Void,
}

impl Object {
    pub fn string(s: impl Into<String>) -> Self {
        Object::Value(Value::String(s.into()))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Object::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Object::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_control(&self, command: ControlCommand) -> bool {
        matches!(self, Object::Control(c) if *c == command)
    }
}

impl From<Value> for Object {
    fn from(v: Value) -> Self {
        Object::Value(v)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Value(v) => write!(f, "{}", v),
            Object::Control(c) => write!(f, "{}", c),
            Object::Glue => f.write_str("Glue"),
            Object::Tag(t) => write!(f, "# {}", t),
            Object::Void => f.write_str("Void"),
        }
    }
}
