use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, RuntimeError};
use crate::format::*;
use crate::random::Prng;

use super::output::clean_output_whitespace;
use super::{CallStack, Choice, ErrorType, Story};

/// How the text changed since the last newline while looking ahead past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStateChange {
    NoChange,
    ExtendedBeyondNewline,
    NewlineRemoved,
}

pub(crate) fn calculate_newline_output_state_change(
    prev_text: &str,
    curr_text: &str,
    prev_tag_count: usize,
    curr_tag_count: usize,
) -> OutputStateChange {
    let newline_still_exists = curr_text.len() >= prev_text.len()
        && !prev_text.is_empty()
        && curr_text.as_bytes().get(prev_text.len() - 1) == Some(&b'\n');

    if prev_tag_count == curr_tag_count
        && prev_text.len() == curr_text.len()
        && newline_still_exists
    {
        return OutputStateChange::NoChange;
    }

    if !newline_still_exists {
        return OutputStateChange::NewlineRemoved;
    }

    if curr_tag_count > prev_tag_count {
        return OutputStateChange::ExtendedBeyondNewline;
    }

    let extension = curr_text.get(prev_text.len()..).unwrap_or_default();
    if extension.chars().any(|c| c != ' ' && c != '\t') {
        OutputStateChange::ExtendedBeyondNewline
    } else {
        OutputStateChange::NoChange
    }
}

/// Explains why a flow stopped without a choice or a safe exit, from what is left on its stack.
fn end_of_content_message(call_stack: &CallStack) -> &'static str {
    if call_stack.can_pop_type(Some(PushPopType::Tunnel)) {
        "unexpectedly reached end of content. Do you need a '->->' to return from a tunnel?"
    } else if call_stack.can_pop_type(Some(PushPopType::Function)) {
        "unexpectedly reached end of content. Do you need a '~ return'?"
    } else if !call_stack.can_pop() {
        "ran out of content. Do you need a '-> DONE' or '-> END'?"
    } else {
        "unexpectedly reached end of content for unknown reason. Please debug compiler!"
    }
}

fn is_truthy(object: &Object) -> Result<bool> {
    match object {
        Object::Value(value) => value.is_truthy(),
        _ => Ok(false),
    }
}

fn pop_type_description(push_type: PushPopType) -> &'static str {
    match push_type {
        PushPopType::Function => "function return statement (~ return)",
        PushPopType::Tunnel => "tunnel onwards statement (->->)",
        PushPopType::FunctionEvaluationFromGame => "function evaluation from the game",
    }
}

fn as_int(object: Object) -> Option<i32> {
    match object {
        Object::Value(Value::Int(i)) => Some(i),
        _ => None,
    }
}

impl Story {
    pub(crate) fn if_async_we_cant(&self, activity: &str) -> Result<()> {
        if self.async_continue_active {
            return Err(RuntimeError::AsyncContinueActive(activity.to_string()));
        }
        Ok(())
    }

    /// Runs steps until a line of output is complete (or the time budget runs out), then hands
    /// collected errors to the error handler and notifies observers of changed globals.
    pub(crate) fn continue_internal(&mut self, millisecs_limit: u64) -> Result<()> {
        self.recursive_continue_count += 1;
        let changed = self.continue_steps(millisecs_limit);
        self.recursive_continue_count -= 1;
        let changed = changed?;

        if self.state.has_error() || self.state.has_warning() {
            match self.error_handler.load_full() {
                Some(handler) => {
                    for error in self.state.current_errors() {
                        (**handler)(error, ErrorType::Error);
                    }
                    for warning in self.state.current_warnings() {
                        (**handler)(warning, ErrorType::Warning);
                    }
                    self.state.reset_errors();
                }
                None => return Err(RuntimeError::Unhandled(self.unhandled_issues_message())),
            }
        }

        for (name, value) in changed {
            self.notify_variable_observers(&name, &value);
        }
        Ok(())
    }

    fn unhandled_issues_message(&self) -> String {
        let mut counts = Vec::new();
        let errors = self.state.current_errors().len();
        if errors > 0 {
            counts.push(format!("{} error{}", errors, if errors == 1 { "" } else { "s" }));
        }
        let warnings = self.state.current_warnings().len();
        if warnings > 0 {
            counts.push(format!("{} warning{}", warnings, if warnings == 1 { "" } else { "s" }));
        }

        let first = self
            .state
            .current_errors()
            .first()
            .or_else(|| self.state.current_warnings().first())
            .map(String::as_str)
            .unwrap_or_default();

        format!(
            "Ink had {}. It is strongly suggested that you assign an error handler with Story::set_error_handler. The first issue was: {}",
            counts.join(" and "),
            first
        )
    }

    fn continue_steps(&mut self, millisecs_limit: u64) -> Result<BTreeMap<String, Value>> {
        let is_async_time_limited = millisecs_limit > 0;

        if !self.async_continue_active {
            self.async_continue_active = is_async_time_limited;

            if !self.can_continue() {
                return Err(RuntimeError::CannotContinue);
            }

            self.state.did_safe_exit = false;
            self.state.reset_output(None);

            if self.recursive_continue_count == 1 {
                self.state.start_variable_observation();
            }
        } else if !is_async_time_limited {
            self.async_continue_active = false;
        }

        let started = Instant::now();
        let mut output_stream_ends_in_newline = false;
        self.saw_lookahead_unsafe_function_after_newline = false;

        loop {
            match self.continue_single_step() {
                Ok(ends_in_newline) => output_stream_ends_in_newline = ends_in_newline,
                Err(RuntimeError::Story(message)) => {
                    self.add_error(&message, false);
                    break;
                }
                Err(e) => return Err(e),
            }

            if output_stream_ends_in_newline {
                break;
            }

            if self.async_continue_active && started.elapsed().as_millis() > millisecs_limit as u128 {
                break;
            }

            if !self.can_continue() {
                break;
            }
        }

        let mut changed = BTreeMap::new();

        if output_stream_ends_in_newline || !self.can_continue() {
            if self.state_snapshot_at_last_newline.is_some() {
                self.restore_state_snapshot();
            }

            if !self.can_continue() {
                if self.state.call_stack().can_pop_thread() {
                    self.add_error(
                        "Thread available to pop, threads should always be flat by the end of evaluation?",
                        false,
                    );
                }

                if self.state.generated_choices().is_empty() && !self.state.did_safe_exit {
                    let message = end_of_content_message(self.state.call_stack());
                    self.add_error(message, false);
                }
            }

            self.state.did_safe_exit = false;
            self.saw_lookahead_unsafe_function_after_newline = false;

            if self.recursive_continue_count == 1 {
                changed = self.state.complete_variable_observation();
            }

            self.async_continue_active = false;
            if let Some(handler) = self.on_did_continue.as_mut() {
                handler();
            }
        }

        Ok(changed)
    }

    /// One step plus lookahead bookkeeping. Returns true once the output is known to end in a
    /// finished line.
    fn continue_single_step(&mut self) -> Result<bool> {
        self.step()?;

        if !self.can_continue() && !self.state.call_stack().element_is_evaluate_from_game() {
            self.try_follow_default_invisible_choice()?;
        }

        if !self.state.in_string_evaluation() {
            if let Some(snapshot) = &self.state_snapshot_at_last_newline {
                let change = calculate_newline_output_state_change(
                    snapshot.current_text(),
                    self.state.current_text(),
                    snapshot.current_tags().len(),
                    self.state.current_tags().len(),
                );

                if change == OutputStateChange::ExtendedBeyondNewline
                    || self.saw_lookahead_unsafe_function_after_newline
                {
                    self.restore_state_snapshot();
                    return Ok(true);
                } else if change == OutputStateChange::NewlineRemoved {
                    self.discard_snapshot();
                }
            }

            if self.state.output_stream_ends_in_newline() {
                if self.can_continue() {
                    if self.state_snapshot_at_last_newline.is_none() {
                        self.state_snapshot();
                    }
                } else {
                    self.discard_snapshot();
                }
            }
        }

        Ok(false)
    }

    // Snapshots

    fn state_snapshot(&mut self) {
        let patched = self.state.copy_and_start_patching();
        self.state_snapshot_at_last_newline = Some(std::mem::replace(&mut self.state, patched));
    }

    fn restore_state_snapshot(&mut self) {
        let Some(snapshot) = self.state_snapshot_at_last_newline.take() else {
            return;
        };
        log::debug!("rolling back to the state at the last newline");

        self.state = snapshot;
        if !self.async_saving {
            self.state.apply_any_patch();
        }
    }

    fn discard_snapshot(&mut self) {
        if !self.async_saving {
            self.state.apply_any_patch();
        }
        self.state_snapshot_at_last_newline = None;
    }

    // Stepping

    fn step(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);

        let mut pointer = self.state.current_pointer();
        if pointer.is_null() {
            return Ok(());
        }

        // Step directly into the first leaf of nested containers
        while let Some(ContentRef::Container(container)) = graph.resolve(pointer) {
            self.visit_container(container, true)?;
            if graph.container(container).content().is_empty() {
                break;
            }
            pointer = Pointer::start_of(container);
        }
        self.state.set_current_pointer(pointer);

        let current = graph.resolve(pointer);
        let node = current.and_then(|content| graph.node(content));

        let is_logic_or_flow_control = self.perform_logic_and_flow_control(node)?;

        if self.state.current_pointer().is_null() {
            return Ok(());
        }

        let mut should_add_to_stream = !is_logic_or_flow_control;

        if let (Some(Node::ChoicePoint(choice_point)), Some(content)) = (node, current) {
            if let Some(choice) = self.process_choice(choice_point, content)? {
                self.state.generated_choices_mut().push(choice);
            }
            should_add_to_stream = false;
        }

        if should_add_to_stream {
            let object = match node {
                Some(Node::Value(Value::VariablePointer {
                    name,
                    context_index: -1,
                })) => Some(Object::Value(Value::VariablePointer {
                    name: name.clone(),
                    context_index: self.state.call_stack().context_for_variable_named(name),
                })),
                Some(node) => node.to_object(),
                None => None,
            };

            if let Some(object) = object {
                if self.state.in_expression_evaluation() {
                    self.state.push_evaluation_stack(object);
                } else {
                    self.state.push_to_output_stream(object);
                }
            }
        }

        self.next_content()?;

        if let Some(Node::Control(ControlCommand::StartThread)) = node {
            self.state.call_stack_mut().push_thread();
        }

        Ok(())
    }

    fn visit_container(&mut self, container: ContainerId, at_start: bool) -> Result<()> {
        let c = self.graph.container(container);
        if !c.counting_at_start_only() || at_start {
            if c.visits_should_be_counted() {
                self.state.increment_visit_count_for_container(container)?;
            }
            if c.turn_index_should_be_counted() {
                self.state.record_turn_index_visit_to_container(container);
            }
        }
        Ok(())
    }

    /// Counts a visit to every container newly entered by a jump, from the target upwards until an
    /// ancestor that was already being executed is reached.
    fn visit_changed_containers_due_to_divert(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let previous = self.state.previous_pointer();
        let pointer = self.state.current_pointer();

        if pointer.is_null() || pointer.index == -1 {
            return Ok(());
        }

        let mut previous_containers = Vec::new();
        if !previous.is_null() {
            let mut ancestor = graph
                .resolve(previous)
                .and_then(ContentRef::as_container)
                .or(previous.container);
            while let Some(container) = ancestor {
                previous_containers.push(container);
                ancestor = graph.container(container).parent();
            }
        }

        let Some(mut child) = graph.resolve(pointer) else {
            return Ok(());
        };

        let mut ancestor = graph.parent_of(child);
        let mut all_children_entered_at_start = true;
        while let Some(container) = ancestor {
            let c = graph.container(container);
            if previous_containers.contains(&container) && !c.counting_at_start_only() {
                break;
            }

            let entering_at_start = all_children_entered_at_start
                && graph.child_ref(container, 0) == Some(child);
            if !entering_at_start {
                all_children_entered_at_start = false;
            }

            self.visit_container(container, entering_at_start)?;

            child = ContentRef::Container(container);
            ancestor = c.parent();
        }

        Ok(())
    }

    fn next_content(&mut self) -> Result<()> {
        loop {
            let current = self.state.current_pointer();
            self.state.set_previous_pointer(current);

            if !self.state.diverted_pointer.is_null() {
                let target = std::mem::replace(&mut self.state.diverted_pointer, Pointer::NULL);
                self.state.set_current_pointer(target);

                self.visit_changed_containers_due_to_divert()?;

                if !self.state.current_pointer().is_null() {
                    return Ok(());
                }
            }

            if self.increment_content_pointer() {
                return Ok(());
            }

            let did_pop = if self
                .state
                .call_stack()
                .can_pop_type(Some(PushPopType::Function))
            {
                self.state.pop_call_stack(Some(PushPopType::Function))?;
                if self.state.in_expression_evaluation() {
                    self.state.push_evaluation_stack(Object::Void);
                }
                true
            } else if self.state.call_stack().can_pop_thread() {
                self.state.call_stack_mut().pop_thread()?;
                true
            } else {
                self.state.try_exit_function_evaluation_from_game();
                false
            };

            if !did_pop || self.state.current_pointer().is_null() {
                return Ok(());
            }
        }
    }

    /// Moves to the next sibling, climbing out of finished containers. Nulls the pointer when the
    /// end of the root is reached.
    fn increment_content_pointer(&mut self) -> bool {
        let pointer = self.state.current_pointer();
        let Some(mut container) = pointer.container else {
            return false;
        };
        let mut index = pointer.index + 1;
        let mut successful = true;

        while index as usize >= self.graph.container(container).content().len() {
            successful = false;

            let c = self.graph.container(container);
            let (Some(parent), Some(index_in_parent)) = (c.parent(), c.index_in_parent()) else {
                break;
            };

            container = parent;
            index = index_in_parent as i32 + 1;
            successful = true;
        }

        let pointer = if successful {
            Pointer::new(container, index)
        } else {
            Pointer::NULL
        };
        self.state.set_current_pointer(pointer);
        successful
    }

    fn try_follow_default_invisible_choice(&mut self) -> Result<bool> {
        let choices = self.state.current_choices();
        let invisible: Vec<&Choice> = choices.iter().filter(|c| c.is_invisible_default).collect();
        if invisible.is_empty() || choices.len() > invisible.len() {
            return Ok(false);
        }

        let choice = invisible[0].clone();
        let thread = choice
            .thread_at_generation
            .ok_or_else(|| RuntimeError::assertion("Choice has no thread to resume"))?;

        self.state.call_stack_mut().set_current_thread(thread);

        if self.state_snapshot_at_last_newline.is_some() {
            let forked = self.state.call_stack_mut().fork_thread();
            self.state.call_stack_mut().set_current_thread(forked);
        }

        self.choose_path(&choice.target_path, false)?;
        Ok(true)
    }

    pub(crate) fn choose_path(&mut self, path: &Path, incrementing_turn_index: bool) -> Result<()> {
        if let Some(approximation) = self.state.set_chosen_path(path, incrementing_turn_index)? {
            self.warning(format!(
                "Failed to find content at path '{}', so it was approximated to: '{}'.",
                path, approximation
            ));
        }
        self.visit_changed_containers_due_to_divert()
    }

    pub(crate) fn pointer_at_path(&mut self, path: &Path) -> Result<Pointer> {
        let lookup = self.graph.pointer_at_path(path)?;
        if let Some(approximation) = lookup.approximated_to {
            self.warning(format!(
                "Failed to find content at path '{}', so it was approximated to: '{}'.",
                path, approximation
            ));
        }
        Ok(lookup.pointer)
    }

    /// Picks the element to show next from a shuffle sequence. Every full loop through the
    /// elements gets its own permutation, derived from the sequence's path and the story seed.
    fn next_sequence_shuffle_index(&mut self) -> Result<i32> {
        let num_elements = match as_int(self.state.pop_evaluation_stack()?) {
            Some(n) if n > 0 => n,
            _ => {
                return Err(RuntimeError::story(
                    "expected number of elements in sequence for shuffle index",
                ))
            }
        };

        let container = self
            .state
            .current_pointer()
            .container
            .ok_or_else(|| RuntimeError::assertion("shuffle index outside of a container"))?;

        let seq_count = as_int(self.state.pop_evaluation_stack()?)
            .ok_or_else(|| RuntimeError::assertion("expected sequence count for shuffle index"))?;

        let loop_index = seq_count / num_elements;
        let iteration_index = seq_count % num_elements;

        let sequence_hash: i64 = self
            .graph
            .container(container)
            .path_string()
            .encode_utf16()
            .map(i64::from)
            .sum();
        let mut random = Prng::new(sequence_hash + loop_index as i64 + self.state.story_seed as i64);

        let mut unpicked: Vec<i32> = (0..num_elements).collect();
        for i in 0..=iteration_index {
            let chosen = (random.next_int() % unpicked.len() as i64) as usize;
            let chosen_index = unpicked.remove(chosen);
            if i == iteration_index {
                return Ok(chosen_index);
            }
        }

        Err(RuntimeError::assertion("Should never reach here"))
    }

    fn process_choice(&mut self, choice_point: &ChoicePoint, content: ContentRef) -> Result<Option<Choice>> {
        let mut show_choice = true;

        if choice_point.has_condition {
            let condition = self.state.pop_evaluation_stack()?;
            if !is_truthy(&condition)? {
                show_choice = false;
            }
        }

        let mut start_text = String::new();
        let mut choice_only_text = String::new();
        let mut tags = Vec::new();

        if choice_point.has_choice_only_content {
            choice_only_text = self.pop_choice_string_and_tags(&mut tags)?;
        }

        if choice_point.has_start_content {
            start_text = self.pop_choice_string_and_tags(&mut tags)?;
        }

        if choice_point.once_only {
            let target = choice_point.choice_target.ok_or_else(|| {
                RuntimeError::story(format!(
                    "Choice target not found: {}",
                    choice_point.path_on_choice
                ))
            })?;
            if self.state.visit_count_for_container(target)? > 0 {
                show_choice = false;
            }
        }

        if !show_choice {
            return Ok(None);
        }

        tags.reverse();
        let text = format!("{}{}", start_text, choice_only_text);
        let thread = self.state.call_stack_mut().fork_thread();

        Ok(Some(Choice {
            text: text.trim_matches(|c| c == ' ' || c == '\t').to_string(),
            index: self
                .state
                .generated_choices()
                .iter()
                .filter(|c| !c.is_invisible_default)
                .count(),
            source_path: self.graph.path_of(content).to_string(),
            target_path: choice_point.path_on_choice.clone(),
            tags,
            is_invisible_default: choice_point.is_invisible_default,
            original_thread_index: thread.thread_index,
            thread_at_generation: Some(thread),
        }))
    }

    fn pop_choice_string_and_tags(&mut self, tags: &mut Vec<String>) -> Result<String> {
        let text = match self.state.pop_evaluation_stack()? {
            Object::Value(Value::String(s)) => s,
            other => {
                return Err(RuntimeError::assertion(format!(
                    "Expected choice text on the evaluation stack, found {}",
                    other
                )))
            }
        };

        while let Some(Object::Tag(_)) = self.state.peek_evaluation_stack() {
            if let Object::Tag(tag) = self.state.pop_evaluation_stack()? {
                tags.push(tag);
            }
        }

        Ok(text)
    }

    // Flow control

    /// Executes `node` if it is logic rather than content. Returns false for plain content, which
    /// the caller adds to the output or evaluation stack.
    fn perform_logic_and_flow_control(&mut self, node: Option<&Node>) -> Result<bool> {
        let Some(node) = node else {
            return Ok(false);
        };

        match node {
            Node::Divert(divert) => {
                self.perform_divert(divert)?;
                Ok(true)
            }
            Node::Control(command) => {
                self.perform_control_command(*command)?;
                Ok(true)
            }
            Node::VariableAssignment(assignment) => {
                let value = match self.state.pop_evaluation_stack()? {
                    Object::Value(value) => value,
                    Object::Void => {
                        return Err(RuntimeError::story(format!(
                            "Tried to assign a void value to variable '{}'. Did you forget to 'return' a value from a function you called here?",
                            assignment.variable_name
                        )))
                    }
                    other => {
                        return Err(RuntimeError::assertion(format!(
                            "Can't assign {} to variable '{}'",
                            other, assignment.variable_name
                        )))
                    }
                };

                if let Some((name, value)) = self.state.assign_variable(assignment, value)? {
                    self.notify_variable_observers(&name, &value);
                }
                Ok(true)
            }
            Node::VariableReference(reference) => {
                let value = match &reference.path_for_count {
                    Some(path) => {
                        let container = reference.container_for_count.ok_or_else(|| {
                            RuntimeError::story(format!("Read count target not found: {}", path))
                        })?;
                        Value::Int(self.state.visit_count_for_container(container)?)
                    }
                    None => {
                        let name = reference.name.as_deref().unwrap_or_default();
                        match self.state.variable_with_name(name, -1) {
                            Some(value) => value,
                            None => {
                                self.warning(format!(
                                    "Variable not found: '{}'. Using default value of 0 (false). This can happen with temporary variables if the declaration hasn't yet been hit. Globals are always given a default value on load if a value doesn't exist in the save state.",
                                    name
                                ));
                                Value::Int(0)
                            }
                        }
                    }
                };

                self.state.push_evaluation_stack(Object::Value(value));
                Ok(true)
            }
            Node::NativeCall(function) => {
                let params = self
                    .state
                    .pop_evaluation_stack_many(function.arity())?
                    .into_iter()
                    .map(|param| match param {
                        Object::Value(value) => Ok(value),
                        Object::Void => Err(RuntimeError::story(
                            "Attempting to perform operation on a void value. Did you forget to 'return' a value from a function you called here?",
                        )),
                        other => Err(RuntimeError::assertion(format!(
                            "Unexpected {} passed to {}",
                            other, function
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;

                let result = function.call(params, self.graph.lists())?;
                self.state.push_evaluation_stack(Object::Value(result));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn perform_divert(&mut self, divert: &Divert) -> Result<()> {
        if divert.is_conditional {
            let condition = self.state.pop_evaluation_stack()?;
            if !is_truthy(&condition)? {
                return Ok(());
            }
        }

        if let Some(name) = &divert.variable_divert_name {
            let path = match self.state.variable_with_name(name, -1) {
                Some(Value::DivertTarget(path)) => path,
                None => {
                    return Err(RuntimeError::story(format!(
                        "Tried to divert using a target from a variable that could not be found ({})",
                        name
                    )))
                }
                Some(Value::Int(0)) => {
                    return Err(RuntimeError::story(format!(
                        "Tried to divert to a target from a variable, but the variable ({}) didn't contain a divert target, it was empty/null (the value 0).",
                        name
                    )))
                }
                Some(other) => {
                    return Err(RuntimeError::story(format!(
                        "Tried to divert to a target from a variable, but the variable ({}) didn't contain a divert target, it contained '{}'.",
                        name, other
                    )))
                }
            };
            self.state.diverted_pointer = self.pointer_at_path(&path)?;
        } else if divert.is_external {
            return self.call_external_function(&divert.external_name(), divert.external_args);
        } else {
            self.state.diverted_pointer = divert.target_pointer;
        }

        if divert.pushes_to_stack {
            let output_len = self.state.output_stream().len();
            self.state
                .call_stack_mut()
                .push(divert.stack_push_type, 0, output_len);
        }

        if self.state.diverted_pointer.is_null() {
            return Err(RuntimeError::story(format!(
                "Divert resolution failed: {}",
                divert
            )));
        }

        Ok(())
    }

    fn perform_control_command(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::EvalStart => {
                if self.state.in_expression_evaluation() {
                    return Err(RuntimeError::assertion("Already in expression evaluation?"));
                }
                self.state.set_in_expression_evaluation(true);
            }
            ControlCommand::EvalEnd => {
                if !self.state.in_expression_evaluation() {
                    return Err(RuntimeError::assertion("Not in expression evaluation mode"));
                }
                self.state.set_in_expression_evaluation(false);
            }
            ControlCommand::EvalOutput => {
                if !self.state.evaluation_stack().is_empty() {
                    let output = self.state.pop_evaluation_stack()?;
                    if output != Object::Void {
                        self.state.push_to_output_stream(Object::string(output.to_string()));
                    }
                }
            }
            ControlCommand::NoOp => {}
            ControlCommand::Duplicate => {
                let top = self
                    .state
                    .peek_evaluation_stack()
                    .cloned()
                    .ok_or_else(|| RuntimeError::assertion("Evaluation stack is empty"))?;
                self.state.push_evaluation_stack(top);
            }
            ControlCommand::PopEvaluatedValue => {
                self.state.pop_evaluation_stack()?;
            }
            ControlCommand::PopFunction | ControlCommand::PopTunnel => {
                self.perform_pop(command)?;
            }
            ControlCommand::BeginString => {
                self.state.push_to_output_stream(Object::Control(command));
                if !self.state.in_expression_evaluation() {
                    return Err(RuntimeError::assertion(
                        "Expected to be in an expression when evaluating a string",
                    ));
                }
                self.state.set_in_expression_evaluation(false);
            }
            ControlCommand::BeginTag => {
                self.state.push_to_output_stream(Object::Control(command));
            }
            ControlCommand::EndTag => {
                if self.state.in_string_evaluation() {
                    let mut consumed = 0;
                    let mut fragments = Vec::new();
                    for object in self.state.output_stream().iter().rev() {
                        consumed += 1;
                        match object {
                            Object::Control(ControlCommand::BeginTag) => break,
                            Object::Control(_) => {
                                return Err(RuntimeError::story(
                                    "Unexpected ControlCommand while extracting tag from choice",
                                ))
                            }
                            Object::Value(Value::String(s)) => fragments.push(s.clone()),
                            _ => {}
                        }
                    }

                    self.state.pop_from_output_stream(consumed);
                    let text: String = fragments.iter().rev().map(String::as_str).collect();
                    self.state
                        .push_evaluation_stack(Object::Tag(clean_output_whitespace(&text)));
                } else {
                    self.state.push_to_output_stream(Object::Control(command));
                }
            }
            ControlCommand::EndString => {
                let mut consumed = 0;
                let mut fragments = Vec::new();
                let mut retained_tags = Vec::new();
                for object in self.state.output_stream().iter().rev() {
                    consumed += 1;
                    match object {
                        Object::Control(ControlCommand::BeginString) => break,
                        Object::Tag(_) => retained_tags.push(object.clone()),
                        Object::Value(Value::String(s)) => fragments.push(s.clone()),
                        _ => {}
                    }
                }

                self.state.pop_from_output_stream(consumed);
                for tag in retained_tags {
                    self.state.push_to_output_stream(tag);
                }

                let text: String = fragments.iter().rev().map(String::as_str).collect();
                self.state.set_in_expression_evaluation(true);
                self.state.push_evaluation_stack(Object::string(text));
            }
            ControlCommand::ChoiceCount => {
                let count = self.state.generated_choices().len() as i32;
                self.state.push_evaluation_stack(Object::Value(Value::Int(count)));
            }
            ControlCommand::Turns => {
                let turns = self.state.current_turn_index() + 1;
                self.state.push_evaluation_stack(Object::Value(Value::Int(turns)));
            }
            ControlCommand::TurnsSince | ControlCommand::ReadCount => {
                let target = self.state.pop_evaluation_stack()?;
                let path = match target {
                    Object::Value(Value::DivertTarget(path)) => path,
                    other => {
                        let extra_note = if matches!(other, Object::Value(Value::Int(_))) {
                            ". Did you accidentally pass a read count ('knot_name') instead of a target ('-> knot_name')?"
                        } else {
                            ""
                        };
                        return Err(RuntimeError::story(format!(
                            "TURNS_SINCE / READ_COUNT expected a divert target (knot, stitch, label name), but saw {}{}",
                            other, extra_note
                        )));
                    }
                };

                let container = self
                    .graph
                    .content_at_path(self.graph.root(), &path, 0, None)
                    .correct_content()
                    .and_then(ContentRef::as_container);

                let count = match container {
                    Some(container) if command == ControlCommand::TurnsSince => {
                        self.state.turns_since_for_container(container)?
                    }
                    Some(container) => self.state.visit_count_for_container(container)?,
                    None => {
                        self.warning(format!(
                            "Failed to find container for {} lookup at {}",
                            command, path
                        ));
                        if command == ControlCommand::TurnsSince {
                            -1
                        } else {
                            0
                        }
                    }
                };
                self.state.push_evaluation_stack(Object::Value(Value::Int(count)));
            }
            ControlCommand::Random => {
                let max = as_int(self.state.pop_evaluation_stack()?);
                let min = as_int(self.state.pop_evaluation_stack()?);

                let min = min.ok_or_else(|| {
                    RuntimeError::story("Invalid value for minimum parameter of RANDOM(min, max)")
                })?;
                let max = max.ok_or_else(|| {
                    RuntimeError::story("Invalid value for maximum parameter of RANDOM(min, max)")
                })?;

                let range = max as i64 - min as i64 + 1;
                if range > i32::MAX as i64 {
                    return Err(RuntimeError::story(
                        "RANDOM was called with a range that exceeds the size that ink numbers can use.",
                    ));
                }
                if range <= 0 {
                    return Err(RuntimeError::story(format!(
                        "RANDOM was called with minimum as {} and maximum as {}. The maximum must be larger",
                        min, max
                    )));
                }

                let next = self.next_random();
                let chosen = next % range + min as i64;
                self.state
                    .push_evaluation_stack(Object::Value(Value::Int(chosen as i32)));
                self.state.previous_random = next as i32;
            }
            ControlCommand::SeedRandom => {
                let seed = as_int(self.state.pop_evaluation_stack()?)
                    .ok_or_else(|| RuntimeError::story("Invalid value passed to SEED_RANDOM"))?;
                self.state.set_story_seed(seed);
                self.state.push_evaluation_stack(Object::Void);
            }
            ControlCommand::VisitIndex => {
                let container = self
                    .state
                    .current_pointer()
                    .container
                    .ok_or_else(|| RuntimeError::assertion("visit index outside of a container"))?;
                let count = self.state.visit_count_for_container(container)? - 1;
                self.state.push_evaluation_stack(Object::Value(Value::Int(count)));
            }
            ControlCommand::SequenceShuffleIndex => {
                let index = self.next_sequence_shuffle_index()?;
                self.state.push_evaluation_stack(Object::Value(Value::Int(index)));
            }
            // Handled by the step once the pointer has moved past it
            ControlCommand::StartThread => {}
            ControlCommand::Done => {
                if self.state.call_stack().can_pop_thread() {
                    self.state.call_stack_mut().pop_thread()?;
                } else {
                    self.state.did_safe_exit = true;
                    self.state.set_current_pointer(Pointer::NULL);
                }
            }
            ControlCommand::End => self.state.force_end(),
            ControlCommand::ListFromInt => {
                let value = self.state.pop_evaluation_stack()?;
                let list_name = match self.state.pop_evaluation_stack()? {
                    Object::Value(Value::String(name)) => name,
                    other => {
                        return Err(RuntimeError::assertion(format!(
                            "Expected a list name for LIST_FROM_INT, found {}",
                            other
                        )))
                    }
                };
                let value = as_int(value).ok_or_else(|| {
                    RuntimeError::story(
                        "Passed non-integer when creating a list element from a numerical value.",
                    )
                })?;

                let definition = self.graph.lists().get(&list_name).ok_or_else(|| {
                    RuntimeError::story(format!("Failed to find LIST called {}", list_name))
                })?;
                let list = match definition.item_with_value(value) {
                    Some(item) => InkList::from_item(item, value),
                    None => InkList::new(),
                };
                self.state.push_evaluation_stack(Object::Value(Value::List(list)));
            }
            ControlCommand::ListRange => {
                let max = self.state.pop_evaluation_stack()?;
                let min = self.state.pop_evaluation_stack()?;
                let target = self.state.pop_evaluation_stack()?;

                let (Object::Value(Value::List(list)), Object::Value(min), Object::Value(max)) =
                    (target, min, max)
                else {
                    return Err(RuntimeError::story(
                        "Expected list, minimum and maximum for LIST_RANGE",
                    ));
                };

                let min = match &min {
                    Value::Int(i) => *i,
                    Value::List(bound) => bound.min_item().map_or(0, |(_, v)| v),
                    _ => 0,
                };
                let max = match &max {
                    Value::Int(i) => *i,
                    Value::List(bound) => bound.max_item().map_or(i32::MAX, |(_, v)| v),
                    _ => i32::MAX,
                };

                self.state
                    .push_evaluation_stack(Object::Value(Value::List(list.with_sub_range(min, max))));
            }
            ControlCommand::ListRandom => {
                let list = match self.state.pop_evaluation_stack()? {
                    Object::Value(Value::List(list)) => list,
                    _ => return Err(RuntimeError::story("Expected list for LIST_RANDOM")),
                };

                let result = if list.is_empty() {
                    InkList::new()
                } else {
                    let next = self.next_random();
                    let index = (next % list.len() as i64) as usize;
                    let (item, value) = list
                        .items()
                        .nth(index)
                        .map(|(item, value)| (item.clone(), value))
                        .ok_or_else(|| RuntimeError::assertion("LIST_RANDOM index out of range"))?;

                    let mut result = match &item.origin_name {
                        Some(origin) => InkList::with_origin(origin.clone()),
                        None => InkList::new(),
                    };
                    result.insert(item, value);
                    self.state.previous_random = next as i32;
                    result
                };

                self.state.push_evaluation_stack(Object::Value(Value::List(result)));
            }
        }

        Ok(())
    }

    /// One draw from a generator seeded with `story_seed + previous_random`.
    fn next_random(&self) -> i64 {
        Prng::new(self.state.story_seed as i64 + self.state.previous_random as i64).next_int()
    }

    fn perform_pop(&mut self, command: ControlCommand) -> Result<()> {
        let pop_type = if command == ControlCommand::PopFunction {
            PushPopType::Function
        } else {
            PushPopType::Tunnel
        };

        let mut override_tunnel_return_target = None;
        if pop_type == PushPopType::Tunnel {
            match self.state.pop_evaluation_stack()? {
                Object::Value(Value::DivertTarget(path)) => override_tunnel_return_target = Some(path),
                Object::Void => {}
                _ => {
                    return Err(RuntimeError::assertion(
                        "Expected void if ->-> doesn't override target",
                    ))
                }
            }
        }

        if self.state.try_exit_function_evaluation_from_game() {
            return Ok(());
        }

        let call_stack = self.state.call_stack();
        let current_type = call_stack.current_element().push_type;
        if current_type != pop_type || !call_stack.can_pop() {
            let expected = if call_stack.can_pop() {
                pop_type_description(current_type)
            } else {
                "end of flow (-> END or choice)"
            };
            return Err(RuntimeError::story(format!(
                "Found {}, when expected {}",
                pop_type_description(pop_type),
                expected
            )));
        }

        self.state.pop_call_stack(None)?;

        if let Some(path) = override_tunnel_return_target {
            self.state.diverted_pointer = self.pointer_at_path(&path)?;
        }
        Ok(())
    }

    // External functions

    fn call_external_function(&mut self, name: &str, number_of_arguments: usize) -> Result<()> {
        match self.externals.get(name).map(|binding| binding.lookahead_safe) {
            Some(false) if self.state.in_string_evaluation() => {
                return Err(RuntimeError::story(format!(
                    "External function {} could not be called because 1) it wasn't marked as lookaheadSafe when BindExternalFunction was called and 2) the story is in the middle of string generation, either because choice text is being generated, or because you have ink like \"hello {{func()}}\". You can work around this by generating the result of your function into a temporary variable before the string or choice gets generated: ~ temp x = {}()",
                    name, name
                )));
            }
            Some(false) if self.state_snapshot_at_last_newline.is_some() => {
                self.saw_lookahead_unsafe_function_after_newline = true;
                return Ok(());
            }
            Some(_) => {}
            None => {
                if !self.allow_external_function_fallbacks {
                    return Err(RuntimeError::assertion(format!(
                        "Trying to call EXTERNAL function '{}' which has not been bound (and ink fallbacks disabled).",
                        name
                    )));
                }

                let fallback = self.graph.knot_container_with_name(name).ok_or_else(|| {
                    RuntimeError::assertion(format!(
                        "Trying to call EXTERNAL function '{}' which has not been bound, and fallback ink function could not be found.",
                        name
                    ))
                })?;

                log::debug!("calling ink fallback for unbound external function '{}'", name);
                let output_len = self.state.output_stream().len();
                self.state
                    .call_stack_mut()
                    .push(PushPopType::Function, 0, output_len);
                self.state.diverted_pointer = Pointer::start_of(fallback);
                return Ok(());
            }
        }

        let mut args = Vec::with_capacity(number_of_arguments);
        for _ in 0..number_of_arguments {
            match self.state.pop_evaluation_stack()? {
                Object::Value(value) => args.push(value),
                other => {
                    return Err(RuntimeError::assertion(format!(
                        "Tried to pass {} to external function '{}'",
                        other, name
                    )))
                }
            }
        }
        args.reverse();

        let binding = self
            .externals
            .get_mut(name)
            .ok_or_else(|| RuntimeError::assertion(format!("External function '{}' vanished", name)))?;
        let result = binding.function.call(&args)?;

        self.state.push_evaluation_stack(match result {
            Some(value) => Object::Value(value),
            None => Object::Void,
        });
        Ok(())
    }

    /// Checks every external call in the story has a binding, or an ink fallback when those are
    /// allowed.
    pub(crate) fn validate_external_bindings(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let root = graph.container(graph.root());

        let mut missing = BTreeSet::new();
        for (_, container) in graph.containers() {
            for node in container.content() {
                let Node::Divert(divert) = node else {
                    continue;
                };
                if !divert.is_external {
                    continue;
                }

                let name = divert.external_name();
                if self.externals.contains_key(&name) {
                    continue;
                }
                if !self.allow_external_function_fallbacks
                    || !root.named_content().contains_key(&name)
                {
                    missing.insert(name);
                }
            }
        }

        self.has_validated_externals = true;

        if missing.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = missing.into_iter().collect();
        Err(RuntimeError::story(format!(
            "Error: Missing function binding for external{}: '{}' {}",
            if names.len() > 1 { "s" } else { "" },
            names.join("', '"),
            if self.allow_external_function_fallbacks {
                ", and no fallback ink function found."
            } else {
                " (ink fallbacks disabled)"
            }
        )))
    }

    // Errors

    /// Records an error or warning, prefixed with the current position. Errors end the flow.
    pub(crate) fn add_error(&mut self, message: &str, is_warning: bool) {
        let error_type = if is_warning { "WARNING" } else { "ERROR" };
        let pointer = self.state.current_pointer();

        let message = match pointer.container {
            Some(container) => format!(
                "RUNTIME {}: (Ink Pointer -> {} -- index {}): {}",
                error_type,
                self.graph.container(container).path(),
                pointer.index,
                message
            ),
            None => format!("RUNTIME {}: {}", error_type, message),
        };

        self.state.add_error(message, is_warning);

        if !is_warning {
            self.state.force_end();
        }
    }

    pub(crate) fn warning(&mut self, message: String) {
        self.add_error(&message, true);
    }

    pub(crate) fn notify_variable_observers(&mut self, name: &str, value: &Value) {
        if let Some(observers) = self.variable_observers.get_mut(name) {
            for (_, observer) in observers.iter_mut() {
                observer(name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_text_is_no_change() {
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a\n", 0, 0),
            OutputStateChange::NoChange
        );
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a\n \t", 0, 0),
            OutputStateChange::NoChange
        );
    }

    #[test]
    fn removed_newline_is_detected() {
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a b", 0, 0),
            OutputStateChange::NewlineRemoved
        );
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a", 0, 0),
            OutputStateChange::NewlineRemoved
        );
    }

    #[test]
    fn text_or_tags_after_newline_extend_it() {
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a\nb", 0, 0),
            OutputStateChange::ExtendedBeyondNewline
        );
        assert_eq!(
            calculate_newline_output_state_change("a\n", "a\n", 0, 1),
            OutputStateChange::ExtendedBeyondNewline
        );
    }

    #[test]
    fn end_of_content_names_the_open_frame() {
        let mut cs = CallStack::new(ContainerId::ROOT);
        assert!(end_of_content_message(&cs).starts_with("ran out of content"));

        cs.push(PushPopType::Function, 0, 0);
        assert!(end_of_content_message(&cs).ends_with("Do you need a '~ return'?"));

        cs.push(PushPopType::Tunnel, 0, 0);
        assert!(end_of_content_message(&cs).contains("'->->' to return from a tunnel"));

        cs.pop(Some(PushPopType::Tunnel)).unwrap();
        cs.pop(Some(PushPopType::Function)).unwrap();
        cs.push_thread();
        assert!(end_of_content_message(&cs).starts_with("ran out of content"));
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&Object::Value(Value::Int(2))).unwrap());
        assert!(!is_truthy(&Object::Value(Value::Int(0))).unwrap());
        assert!(!is_truthy(&Object::Void).unwrap());
        assert_eq!(as_int(Object::Value(Value::Int(3))), Some(3));
        assert_eq!(as_int(Object::Void), None);
    }
}
