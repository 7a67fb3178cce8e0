use crate::format::{ContainerId, Object};

use super::{CallStack, Choice};

pub const DEFAULT_FLOW_NAME: &str = "DEFAULT_FLOW";

/// An independent narrative thread of execution with its own call stack, output and choices.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub name: String,
    pub call_stack: CallStack,
    pub output_stream: Vec<Object>,
    pub current_choices: Vec<Choice>,
}

impl Flow {
    pub fn new(name: impl Into<String>, root: ContainerId) -> Self {
        Self {
            name: name.into(),
            call_stack: CallStack::new(root),
            output_stream: Vec::new(),
            current_choices: Vec::new(),
        }
    }
}
