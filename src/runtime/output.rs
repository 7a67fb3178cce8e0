use crate::error::{Result, RuntimeError};
use crate::format::*;

use super::StoryState;

impl StoryState {
    /// Text produced since the last `Continue`, with tag content left out and runs of inline
    /// whitespace collapsed.
    pub fn current_text(&self) -> &str {
        self.text_cache_get_or_init(|output| {
            let mut text = String::new();
            let mut in_tag = false;
            for object in output {
                match object {
                    Object::Value(Value::String(s)) if !in_tag => text.push_str(s),
                    Object::Control(ControlCommand::BeginTag) => in_tag = true,
                    Object::Control(ControlCommand::EndTag) => in_tag = false,
                    _ => {}
                }
            }
            clean_output_whitespace(&text)
        })
    }

    pub fn current_tags(&self) -> &[String] {
        self.tags_cache_get_or_init(|output| {
            let mut tags = Vec::new();
            let mut in_tag = false;
            let mut tag = String::new();

            for object in output {
                match object {
                    Object::Control(ControlCommand::BeginTag) => {
                        if in_tag && !tag.is_empty() {
                            tags.push(clean_output_whitespace(&tag));
                            tag.clear();
                        }
                        in_tag = true;
                    }
                    Object::Control(ControlCommand::EndTag) => {
                        if !tag.is_empty() {
                            tags.push(clean_output_whitespace(&tag));
                            tag.clear();
                        }
                        in_tag = false;
                    }
                    Object::Value(Value::String(s)) if in_tag => tag.push_str(s),
                    Object::Tag(text) if !in_tag && !text.is_empty() => tags.push(text.clone()),
                    _ => {}
                }
            }

            if !tag.is_empty() {
                tags.push(clean_output_whitespace(&tag));
            }
            tags
        })
    }

    pub(crate) fn reset_output(&mut self, objects: Option<Vec<Object>>) {
        let output = self.output_stream_mut();
        output.clear();
        if let Some(objects) = objects {
            output.extend(objects);
        }
    }

    pub(crate) fn push_to_output_stream(&mut self, object: Object) {
        if let Object::Value(Value::String(text)) = &object {
            if let Some(parts) = try_splitting_head_tail_whitespace(text) {
                for part in parts {
                    self.push_to_output_stream_individual(Object::string(part));
                }
                self.output_stream_dirty();
                return;
            }
        }

        self.push_to_output_stream_individual(object);
        self.output_stream_dirty();
    }

    pub(crate) fn pop_from_output_stream(&mut self, count: usize) {
        let output = self.output_stream_mut();
        let keep = output.len().saturating_sub(count);
        output.truncate(keep);
    }

    fn push_to_output_stream_individual(&mut self, object: Object) {
        let mut include = true;

        match &object {
            Object::Glue => self.trim_newlines_from_output_stream(),
            Object::Value(Value::String(text)) => {
                let mut function_trim_index = -1;
                let element = self.call_stack().current_element();
                if element.push_type == PushPopType::Function {
                    function_trim_index = element.function_start_in_output_stream;
                }

                let mut glue_trim_index = -1;
                for (i, o) in self.output_stream().iter().enumerate().rev() {
                    match o {
                        Object::Glue => {
                            glue_trim_index = i as i32;
                            break;
                        }
                        Object::Control(ControlCommand::BeginString) => {
                            if i as i32 >= function_trim_index {
                                function_trim_index = -1;
                            }
                            break;
                        }
                        _ => {}
                    }
                }

                let trim_index = match (glue_trim_index, function_trim_index) {
                    (-1, function) => function,
                    (glue, -1) => glue,
                    (glue, function) => glue.min(function),
                };

                if trim_index != -1 {
                    if is_newline(text) {
                        include = false;
                    } else if is_non_whitespace(text) {
                        if glue_trim_index > -1 {
                            self.remove_existing_glue();
                        }
                        if function_trim_index > -1 {
                            let callstack = &mut self.call_stack_mut().current_thread_mut().callstack;
                            for element in callstack.iter_mut().rev() {
                                if element.push_type != PushPopType::Function {
                                    break;
                                }
                                element.function_start_in_output_stream = -1;
                            }
                        }
                    }
                } else if is_newline(text)
                    && (self.output_stream_ends_in_newline() || !self.output_stream_contains_content())
                {
                    include = false;
                }
            }
            _ => {}
        }

        if include {
            self.output_stream_mut().push(object);
        }
    }

    /// Drops trailing newlines (and the whitespace after them) back to the last real content.
    fn trim_newlines_from_output_stream(&mut self) {
        let mut remove_from = None;
        for (i, object) in self.output_stream().iter().enumerate().rev() {
            match object {
                Object::Value(Value::String(text)) if is_non_whitespace(text) => break,
                Object::Value(Value::String(text)) if is_newline(text) => remove_from = Some(i),
                _ => {}
            }
        }

        let output = self.output_stream_mut();
        if let Some(from) = remove_from {
            let mut i = from;
            while i < output.len() {
                if matches!(output[i], Object::Value(Value::String(_))) {
                    output.remove(i);
                } else {
                    i += 1;
                }
            }
        }
    }

    fn remove_existing_glue(&mut self) {
        let output = self.output_stream_mut();
        for i in (0..output.len()).rev() {
            match output[i] {
                Object::Glue => {
                    output.remove(i);
                }
                Object::Control(_) => break,
                _ => continue,
            }
        }
    }

    pub(crate) fn output_stream_ends_in_newline(&self) -> bool {
        for object in self.output_stream().iter().rev() {
            match object {
                Object::Control(_) => break,
                Object::Value(Value::String(text)) if is_newline(text) => return true,
                Object::Value(Value::String(text)) if is_non_whitespace(text) => break,
                _ => {}
            }
        }
        false
    }

    pub(crate) fn output_stream_contains_content(&self) -> bool {
        self.output_stream()
            .iter()
            .any(|object| matches!(object, Object::Value(Value::String(_))))
    }

    pub(crate) fn in_string_evaluation(&self) -> bool {
        self.output_stream()
            .iter()
            .rev()
            .any(|object| object.is_control(ControlCommand::BeginString))
    }

    fn trim_whitespace_from_function_end(&mut self) {
        let start = self
            .call_stack()
            .current_element()
            .function_start_in_output_stream
            .max(0) as usize;

        let output = self.output_stream_mut();
        let mut i = output.len();
        while i > start {
            i -= 1;
            match &output[i] {
                Object::Control(_) => break,
                Object::Value(Value::String(text)) => {
                    if is_newline(text) || is_inline_whitespace(text) {
                        output.remove(i);
                    } else {
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    /// Pops an activation. Leaving a function trims the whitespace it left at the end of the output.
    pub(crate) fn pop_call_stack(&mut self, pop_type: Option<PushPopType>) -> Result<()> {
        if self.call_stack().current_element().push_type == PushPopType::Function {
            self.trim_whitespace_from_function_end();
        }
        self.call_stack_mut().pop(pop_type)
    }

    // Evaluation stack

    pub(crate) fn push_evaluation_stack(&mut self, object: Object) {
        self.evaluation_stack.push(object);
    }

    pub(crate) fn pop_evaluation_stack(&mut self) -> Result<Object> {
        self.evaluation_stack
            .pop()
            .ok_or_else(|| RuntimeError::assertion("Evaluation stack is empty"))
    }

    pub(crate) fn pop_evaluation_stack_many(&mut self, count: usize) -> Result<Vec<Object>> {
        if count > self.evaluation_stack.len() {
            return Err(RuntimeError::assertion("trying to pop too many objects"));
        }
        let at = self.evaluation_stack.len() - count;
        Ok(self.evaluation_stack.split_off(at))
    }

    pub(crate) fn peek_evaluation_stack(&self) -> Option<&Object> {
        self.evaluation_stack.last()
    }

    pub fn evaluation_stack(&self) -> &[Object] {
        &self.evaluation_stack
    }
}

/// Collapses runs of spaces and tabs to one space and drops them at line starts and ends.
pub(crate) fn clean_output_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut whitespace_start: Option<usize> = None;
    let mut start_of_line = 0;

    for (i, c) in text.chars().enumerate() {
        let is_inline_whitespace = c == ' ' || c == '\t';

        if is_inline_whitespace && whitespace_start.is_none() {
            whitespace_start = Some(i);
        }

        if !is_inline_whitespace {
            if let Some(start) = whitespace_start {
                if c != '\n' && start > 0 && start != start_of_line {
                    out.push(' ');
                }
            }
            whitespace_start = None;
        }

        if c == '\n' {
            start_of_line = i + 1;
        }

        if !is_inline_whitespace {
            out.push(c);
        }
    }

    out
}

/// Splits leading and trailing newline runs off a text fragment so glue and function trimming can
/// act on them separately. `None` when there is nothing to split.
pub(crate) fn try_splitting_head_tail_whitespace(text: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();

    let mut head_first_newline = None;
    let mut head_last_newline = None;
    for (i, c) in chars.iter().enumerate() {
        match c {
            '\n' => {
                head_first_newline.get_or_insert(i);
                head_last_newline = Some(i);
            }
            ' ' | '\t' => continue,
            _ => break,
        }
    }

    let mut tail_last_newline = None;
    let mut tail_first_newline = None;
    for (i, c) in chars.iter().enumerate().rev() {
        match c {
            '\n' => {
                tail_last_newline.get_or_insert(i);
                tail_first_newline = Some(i);
            }
            ' ' | '\t' => continue,
            _ => break,
        }
    }

    if head_first_newline.is_none() && tail_last_newline.is_none() {
        return None;
    }

    let slice = |from: usize, to: usize| chars[from..to].iter().collect::<String>();
    let mut parts = Vec::new();
    let mut inner_start = 0;
    let mut inner_end = chars.len();

    if let (Some(first), Some(last)) = (head_first_newline, head_last_newline) {
        if first > 0 {
            parts.push(slice(0, first));
        }
        parts.push("\n".to_string());
        inner_start = last + 1;
    }

    if let Some(first) = tail_first_newline {
        inner_end = first;
    }

    if inner_end > inner_start {
        parts.push(slice(inner_start, inner_end));
    }

    if let (Some(first), Some(last)) = (tail_first_newline, tail_last_newline) {
        let after_head = head_last_newline.map_or(true, |head| first > head);
        if after_head {
            parts.push("\n".to_string());
            if last < chars.len() - 1 {
                parts.push(slice(last + 1, chars.len()));
            }
        }
    }

    Some(parts)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::json::read_story;

    fn state() -> StoryState {
        let graph = read_story(r##"{"inkVersion":21,"root":["done",null]}"##).unwrap();
        StoryState::new(Arc::new(graph))
    }

    fn push_all(state: &mut StoryState, objects: Vec<Object>) {
        for object in objects {
            state.push_to_output_stream(object);
        }
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(clean_output_whitespace("a   b\t c"), "a b c");
        assert_eq!(clean_output_whitespace("  a  \n  b  "), "a\nb");
    }

    #[test]
    fn splits_boundary_newlines() {
        assert_eq!(try_splitting_head_tail_whitespace("hello"), None);
        assert_eq!(
            try_splitting_head_tail_whitespace(" \nhello\n "),
            Some(vec![
                " ".to_string(),
                "\n".to_string(),
                "hello".to_string(),
                "\n".to_string(),
                " ".to_string()
            ])
        );
        assert_eq!(
            try_splitting_head_tail_whitespace("\n"),
            Some(vec!["\n".to_string()])
        );
    }

    #[test]
    fn glue_joins_lines() {
        let mut state = state();
        push_all(
            &mut state,
            vec![
                Object::string("Hello "),
                Object::string("world"),
                Object::string("\n"),
                Object::Glue,
                Object::string("!"),
            ],
        );
        assert_eq!(state.current_text(), "Hello world!");
    }

    #[test]
    fn leading_and_repeated_newlines_are_dropped() {
        let mut state = state();
        push_all(
            &mut state,
            vec![
                Object::string("\n"),
                Object::string("a"),
                Object::string("\n"),
                Object::string("\n"),
            ],
        );
        assert_eq!(state.current_text(), "a\n");
        assert!(state.output_stream_ends_in_newline());
    }

    #[test]
    fn tags_are_collected_apart_from_text() {
        let mut state = state();
        push_all(
            &mut state,
            vec![
                Object::string("Line"),
                Object::Control(ControlCommand::BeginTag),
                Object::string(" first  tag "),
                Object::Control(ControlCommand::EndTag),
                Object::Tag("legacy".to_string()),
            ],
        );
        assert_eq!(state.current_text(), "Line");
        assert_eq!(state.current_tags(), ["first tag".to_string(), "legacy".to_string()]);
    }

    #[test]
    fn function_output_is_trimmed() {
        let mut state = state();
        state.push_to_output_stream(Object::string("x"));
        state.call_stack_mut().push(PushPopType::Function, 0, 1);
        push_all(&mut state, vec![Object::string("\n"), Object::string("y"), Object::string(" ")]);
        state.pop_call_stack(Some(PushPopType::Function)).unwrap();
        assert_eq!(state.current_text(), "xy");
    }

    #[test]
    fn function_trim_looks_past_commands() {
        let mut state = state();
        state.push_to_output_stream(Object::string("x"));
        state.call_stack_mut().push(PushPopType::Function, 0, 1);
        push_all(
            &mut state,
            vec![
                Object::string("y"),
                Object::string(" "),
                Object::Control(ControlCommand::NoOp),
                Object::string("\n"),
            ],
        );
        state.pop_call_stack(Some(PushPopType::Function)).unwrap();
        assert_eq!(state.current_text(), "xy");
        assert!(!state.output_stream().iter().any(|o| matches!(o, Object::Value(Value::String(s)) if s == " ")));
    }

    #[test]
    fn evaluation_stack_underflow_is_an_assertion() {
        let mut state = state();
        assert!(matches!(
            state.pop_evaluation_stack(),
            Err(RuntimeError::Assertion(_))
        ));
        state.push_evaluation_stack(Object::Value(Value::Int(1)));
        state.push_evaluation_stack(Object::Value(Value::Int(2)));
        assert_eq!(state.pop_evaluation_stack_many(2).unwrap().len(), 2);
    }
}
