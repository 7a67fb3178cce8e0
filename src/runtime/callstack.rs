use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::{Result, RuntimeError};
use crate::format::{ContainerId, ContentGraph, Pointer, PushPopType, Value};

/// One activation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub push_type: PushPopType,
    pub current_pointer: Pointer,
    pub in_expression_evaluation: bool,
    pub temporary_variables: BTreeMap<String, Value>,
    pub evaluation_stack_height_when_pushed: usize,
    /// Output stream length when a function was entered, -1 once text has been output since.
    pub function_start_in_output_stream: i32,
}

impl Element {
    pub fn new(push_type: PushPopType, pointer: Pointer, in_expression_evaluation: bool) -> Self {
        Self {
            push_type,
            current_pointer: pointer,
            in_expression_evaluation,
            temporary_variables: BTreeMap::new(),
            evaluation_stack_height_when_pushed: 0,
            function_start_in_output_stream: 0,
        }
    }
}

/// A logical call stack. Choices keep a forked copy of the thread they were generated on.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub callstack: Vec<Element>,
    pub thread_index: i32,
    pub previous_pointer: Pointer,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            callstack: Vec::new(),
            thread_index: 0,
            previous_pointer: Pointer::NULL,
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStack {
    threads: Vec<Thread>,
    thread_counter: i32,
    start_of_root: Pointer,
}

impl CallStack {
    pub fn new(root: ContainerId) -> Self {
        let mut call_stack = Self {
            threads: Vec::new(),
            thread_counter: 0,
            start_of_root: Pointer::start_of(root),
        };
        call_stack.reset();
        call_stack
    }

    pub(crate) fn from_parts(root: ContainerId, threads: Vec<Thread>, thread_counter: i32) -> Result<Self> {
        if threads.iter().any(|t| t.callstack.is_empty()) || threads.is_empty() {
            return Err(RuntimeError::InvalidSaveFormat);
        }
        Ok(Self {
            threads,
            thread_counter,
            start_of_root: Pointer::start_of(root),
        })
    }

    pub fn reset(&mut self) {
        let mut thread = Thread::new();
        thread
            .callstack
            .push(Element::new(PushPopType::Tunnel, self.start_of_root, false));
        self.threads = vec![thread];
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread_counter(&self) -> i32 {
        self.thread_counter
    }

    pub fn elements(&self) -> &[Element] {
        &self.current_thread().callstack
    }

    pub fn depth(&self) -> usize {
        self.elements().len()
    }

    pub fn current_thread(&self) -> &Thread {
        // never empty: reset and from_parts guarantee at least one thread, pop_thread keeps one
        &self.threads[self.threads.len() - 1]
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        let last = self.threads.len() - 1;
        &mut self.threads[last]
    }

    /// Replaces every thread with `thread`. Used when resuming from a choice.
    pub fn set_current_thread(&mut self, thread: Thread) {
        self.threads = vec![thread];
    }

    pub fn current_element(&self) -> &Element {
        let callstack = &self.current_thread().callstack;
        &callstack[callstack.len() - 1]
    }

    pub fn current_element_mut(&mut self) -> &mut Element {
        let callstack = &mut self.current_thread_mut().callstack;
        let last = callstack.len() - 1;
        &mut callstack[last]
    }

    pub fn current_element_index(&self) -> i32 {
        self.elements().len() as i32 - 1
    }

    pub fn can_pop(&self) -> bool {
        self.elements().len() > 1
    }

    pub fn can_pop_type(&self, push_type: Option<PushPopType>) -> bool {
        if !self.can_pop() {
            return false;
        }
        match push_type {
            None => true,
            Some(t) => self.current_element().push_type == t,
        }
    }

    pub fn element_is_evaluate_from_game(&self) -> bool {
        self.current_element().push_type == PushPopType::FunctionEvaluationFromGame
    }

    pub fn can_pop_thread(&self) -> bool {
        self.threads.len() > 1 && !self.element_is_evaluate_from_game()
    }

    pub fn push(
        &mut self,
        push_type: PushPopType,
        external_evaluation_stack_height: usize,
        output_stream_length_with_pushed: usize,
    ) {
        let mut element = Element::new(push_type, self.current_element().current_pointer, false);
        element.evaluation_stack_height_when_pushed = external_evaluation_stack_height;
        element.function_start_in_output_stream = output_stream_length_with_pushed as i32;
        self.current_thread_mut().callstack.push(element);
    }

    pub fn pop(&mut self, push_type: Option<PushPopType>) -> Result<()> {
        if self.can_pop_type(push_type) {
            self.current_thread_mut().callstack.pop();
            Ok(())
        } else {
            Err(RuntimeError::assertion("Mismatched push/pop in Callstack"))
        }
    }

    /// Starts a new thread that continues from the current position.
    pub fn push_thread(&mut self) {
        let thread = self.fork_thread();
        self.threads.push(thread);
    }

    /// Copies the current thread under a fresh index without touching the stack.
    pub fn fork_thread(&mut self) -> Thread {
        let mut thread = self.current_thread().clone();
        self.thread_counter += 1;
        thread.thread_index = self.thread_counter;
        thread
    }

    pub fn pop_thread(&mut self) -> Result<()> {
        if self.can_pop_thread() {
            self.threads.pop();
            Ok(())
        } else {
            Err(RuntimeError::assertion("Can't pop thread"))
        }
    }

    pub fn thread_with_index(&self, index: i32) -> Option<&Thread> {
        self.threads.iter().find(|t| t.thread_index == index)
    }

    /// Context index 0 is global scope, `n` is the `n`th activation. -1 means the current one.
    pub fn temporary_variable(&self, name: &str, context_index: i32) -> Option<&Value> {
        let context_index = if context_index == -1 {
            self.current_element_index() + 1
        } else {
            context_index
        };
        if context_index < 1 {
            return None;
        }
        self.elements()
            .get(context_index as usize - 1)?
            .temporary_variables
            .get(name)
    }

    pub fn set_temporary_variable(
        &mut self,
        name: &str,
        mut value: Value,
        declare_new: bool,
        context_index: i32,
    ) -> Result<()> {
        let context_index = if context_index == -1 {
            self.current_element_index() + 1
        } else {
            context_index
        };
        let element = usize::try_from(context_index - 1)
            .ok()
            .and_then(|i| self.current_thread_mut().callstack.get_mut(i))
            .ok_or_else(|| {
                RuntimeError::assertion(format!("No call stack element for context {}", context_index))
            })?;

        match element.temporary_variables.get(name) {
            Some(old) => value.retain_list_origins(old),
            None if !declare_new => {
                return Err(RuntimeError::assertion(format!(
                    "Could not find temporary variable to set: {}",
                    name
                )))
            }
            None => {}
        }

        element.temporary_variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Context index of the scope `name` lives in: the current activation if it declares it,
    /// otherwise global.
    pub fn context_for_variable_named(&self, name: &str) -> i32 {
        if self
            .current_element()
            .temporary_variables
            .contains_key(name)
        {
            self.current_element_index() + 1
        } else {
            0
        }
    }

    pub fn call_stack_trace(&self, graph: &ContentGraph) -> String {
        let mut out = String::new();
        let count = self.threads.len();
        for (t, thread) in self.threads.iter().enumerate() {
            let current = if t == count - 1 { "(current) " } else { "" };
            let _ = writeln!(out, "=== THREAD {}/{} {}===", t + 1, count, current);
            for element in &thread.callstack {
                match element.push_type {
                    PushPopType::Function => out.push_str("  [FUNCTION] "),
                    _ => out.push_str("  [TUNNEL] "),
                }
                if let Some(container) = element.current_pointer.container {
                    let _ = writeln!(out, "<SOMEWHERE IN {}>", graph.container(container).path());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_does_not_touch_the_stack() {
        let mut cs = CallStack::new(ContainerId::ROOT);
        let forked = cs.fork_thread();
        assert_eq!(forked.thread_index, 1);
        assert_eq!(cs.threads().len(), 1);

        cs.push_thread();
        assert_eq!(cs.threads().len(), 2);
        assert_eq!(cs.current_thread().thread_index, 2);
        assert!(cs.can_pop_thread());
        cs.pop_thread().unwrap();
        assert!(cs.pop_thread().is_err());
    }

    #[test]
    fn push_pop_must_match() {
        let mut cs = CallStack::new(ContainerId::ROOT);
        assert!(!cs.can_pop());
        cs.push(PushPopType::Function, 0, 3);
        assert_eq!(cs.current_element().function_start_in_output_stream, 3);
        assert!(cs.pop(Some(PushPopType::Tunnel)).is_err());
        cs.pop(Some(PushPopType::Function)).unwrap();
        assert_eq!(cs.depth(), 1);
    }

    #[test]
    fn temporaries_are_scoped_per_activation() {
        let mut cs = CallStack::new(ContainerId::ROOT);
        cs.set_temporary_variable("x", Value::Int(1), true, -1).unwrap();
        cs.push(PushPopType::Function, 0, 0);
        assert_eq!(cs.temporary_variable("x", -1), None);
        assert_eq!(cs.temporary_variable("x", 1), Some(&Value::Int(1)));
        assert_eq!(cs.context_for_variable_named("x"), 0);

        assert!(cs.set_temporary_variable("y", Value::Int(2), false, -1).is_err());
        cs.set_temporary_variable("y", Value::Int(2), true, -1).unwrap();
        assert_eq!(cs.context_for_variable_named("y"), 2);
    }
}
