mod callback;
mod callstack;
mod choice;
mod executor;
mod flow;
mod output;
mod patch;
mod state;
mod variables;

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde_json::Value as JsonValue;

pub use self::callback::*;
pub use self::callstack::{CallStack, Element, Thread};
pub use self::choice::Choice;
pub use self::flow::{Flow, DEFAULT_FLOW_NAME};
pub use self::patch::StatePatch;
pub use self::state::StoryState;
pub use self::variables::VariablesState;

use crate::error::{Result, RuntimeError};
use crate::format::*;
use crate::json::{read_story, write_story};
use crate::parser::parse_path;

/// What `Story::evaluate_function` hands back: the returned value, if any, and the text the
/// function printed while it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub value: Option<Value>,
    pub text: String,
}

/// A loaded story and the state of one playthrough of it.
pub struct Story {
    graph: Arc<ContentGraph>,
    state: StoryState,
    state_snapshot_at_last_newline: Option<StoryState>,

    externals: BTreeMap<String, ExternalBinding>,
    variable_observers: BTreeMap<String, Vec<(ObserverId, VariableObserver)>>,
    next_observer_id: u64,
    error_handler: Arc<ArcSwapOption<ErrorHandler>>,
    on_did_continue: Option<OnDidContinueHandler>,
    on_make_choice: Option<OnMakeChoiceHandler>,

    has_validated_externals: bool,
    async_continue_active: bool,
    async_saving: bool,
    recursive_continue_count: u32,
    saw_lookahead_unsafe_function_after_newline: bool,
    allow_external_function_fallbacks: bool,
}

impl Story {
    /// Loads compiled story JSON and runs its global declarations.
    pub fn new(json: &str) -> Result<Self> {
        Self::from_graph(read_story(json)?)
    }

    pub fn from_graph(graph: ContentGraph) -> Result<Self> {
        let graph = Arc::new(graph);
        let mut story = Self {
            state: StoryState::new(Arc::clone(&graph)),
            graph,
            state_snapshot_at_last_newline: None,
            externals: BTreeMap::new(),
            variable_observers: BTreeMap::new(),
            next_observer_id: 0,
            error_handler: Arc::new(ArcSwapOption::new(None)),
            on_did_continue: None,
            on_make_choice: None,
            has_validated_externals: false,
            async_continue_active: false,
            async_saving: false,
            recursive_continue_count: 0,
            saw_lookahead_unsafe_function_after_newline: false,
            allow_external_function_fallbacks: false,
        };
        story.reset_globals()?;
        Ok(story)
    }

    pub fn graph(&self) -> &ContentGraph {
        &self.graph
    }

    pub fn state(&self) -> &StoryState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StoryState {
        &mut self.state
    }

    /// The story re-emitted as bytecode.
    pub fn to_json(&self) -> JsonValue {
        write_story(&self.graph)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    // Resetting

    /// Starts a fresh playthrough. Bindings, observers and handlers are kept.
    pub fn reset_state(&mut self) -> Result<()> {
        self.if_async_we_cant("ResetState")?;

        self.state = StoryState::new(Arc::clone(&self.graph));
        self.state_snapshot_at_last_newline = None;
        self.reset_globals()
    }

    pub fn reset_errors(&mut self) {
        self.state.reset_errors();
    }

    pub fn reset_callstack(&mut self) -> Result<()> {
        self.if_async_we_cant("ResetCallstack")?;
        self.state.force_end();
        Ok(())
    }

    fn reset_globals(&mut self) -> Result<()> {
        let root = self.graph.container(self.graph.root());
        if root.named_content().contains_key("global decl") {
            let original_pointer = self.state.current_pointer();

            let global_decl = Path::new(vec![Component::Name("global decl".to_string())], false);
            self.choose_path(&global_decl, false)?;
            self.continue_internal(0)?;

            self.state.set_current_pointer(original_pointer);
        }

        self.state.snapshot_default_globals();
        Ok(())
    }

    // Continuing

    pub fn can_continue(&self) -> bool {
        self.state.can_continue()
    }

    /// Runs until the next line of text is complete and returns it.
    pub fn continue_story(&mut self) -> Result<String> {
        self.continue_async(0)?;
        Ok(self.current_text()?.to_string())
    }

    /// Like `continue_story`, but stops after roughly `millisecs_limit` ms. Check
    /// `async_continue_complete` and call again until it is. A limit of zero means no limit.
    pub fn continue_async(&mut self, millisecs_limit: u64) -> Result<()> {
        if !self.has_validated_externals {
            self.validate_external_bindings()?;
        }
        self.continue_internal(millisecs_limit)
    }

    pub fn async_continue_complete(&self) -> bool {
        !self.async_continue_active
    }

    /// Continues until the story needs a choice or ends, returning all the text produced.
    pub fn continue_maximally(&mut self) -> Result<String> {
        self.if_async_we_cant("ContinueMaximally")?;

        let mut text = String::new();
        while self.can_continue() {
            text.push_str(&self.continue_story()?);
        }
        Ok(text)
    }

    pub fn current_text(&self) -> Result<&str> {
        self.if_async_we_cant("call currentText since it's a work in progress")?;
        Ok(self.state.current_text())
    }

    pub fn current_tags(&self) -> Result<&[String]> {
        self.if_async_we_cant("call currentTags since it's a work in progress")?;
        Ok(self.state.current_tags())
    }

    /// Choices the player can pick from, invisible defaults left out.
    pub fn current_choices(&self) -> Vec<&Choice> {
        self.state
            .current_choices()
            .iter()
            .filter(|choice| !choice.is_invisible_default)
            .collect()
    }

    pub fn current_errors(&self) -> &[String] {
        self.state.current_errors()
    }

    pub fn current_warnings(&self) -> &[String] {
        self.state.current_warnings()
    }

    pub fn has_error(&self) -> bool {
        self.state.has_error()
    }

    pub fn has_warning(&self) -> bool {
        self.state.has_warning()
    }

    // Choosing

    pub fn choose_choice_index(&mut self, index: usize) -> Result<()> {
        let choice = self
            .current_choices()
            .get(index)
            .map(|choice| (*choice).clone())
            .ok_or_else(|| RuntimeError::assertion("choice out of range"))?;

        if let Some(handler) = self.on_make_choice.as_mut() {
            handler(&choice);
        }

        let thread = choice
            .thread_at_generation
            .ok_or_else(|| RuntimeError::assertion("Choice has no thread to resume"))?;
        self.state.call_stack_mut().set_current_thread(thread);

        self.choose_path(&choice.target_path, true)
    }

    /// Jumps to a knot or stitch by path, e.g. `"knot.stitch"`. Arguments are passed to it as
    /// if it were called as a function.
    pub fn choose_path_string(
        &mut self,
        path: &str,
        reset_callstack: bool,
        args: &[Value],
    ) -> Result<()> {
        self.if_async_we_cant("call ChoosePathString right now")?;

        if reset_callstack {
            self.reset_callstack()?;
        } else {
            let element = self.state.call_stack().current_element();
            if element.push_type == PushPopType::Function {
                let detail = element
                    .current_pointer
                    .container
                    .map(|c| format!("({}) ", self.graph.container(c).path()))
                    .unwrap_or_default();
                return Err(RuntimeError::InvalidOperation(format!(
                    "Story was running a function {}when you called ChoosePathString({}) - this is almost certainly not not what you want! Full stack trace: \n{}",
                    detail,
                    path,
                    self.state.call_stack_trace()
                )));
            }
        }

        self.state.pass_arguments_to_evaluation_stack(args)?;
        self.choose_path(&parse_path(path)?, true)
    }

    // Functions

    pub fn has_function(&self, name: &str) -> bool {
        self.graph.knot_container_with_name(name).is_some()
    }

    /// Runs an ink function to completion outside of the main flow.
    pub fn evaluate_function(&mut self, name: &str, args: &[Value]) -> Result<FunctionResult> {
        self.if_async_we_cant("evaluate a function")?;

        if name.trim().is_empty() {
            return Err(RuntimeError::InvalidOperation(
                "Function is empty or white space.".to_string(),
            ));
        }

        let function = self.graph.knot_container_with_name(name).ok_or_else(|| {
            RuntimeError::InvalidOperation(format!("Function doesn't exist: '{}'", name))
        })?;

        let output = self.state.output_stream().to_vec();
        self.state.reset_output(None);

        self.state.start_function_evaluation_from_game(function, args)?;

        let mut text = String::new();
        while self.can_continue() {
            text.push_str(&self.continue_story()?);
        }

        self.state.reset_output(Some(output));

        let value = self.state.complete_function_evaluation_from_game()?;
        Ok(FunctionResult { value, text })
    }

    /// Binds a host function to an `EXTERNAL` declaration. Functions that are not
    /// `lookahead_safe` are never called while the engine is looking ahead past a newline.
    pub fn bind_external_function(
        &mut self,
        name: &str,
        function: impl ExternalFunction + 'static,
        lookahead_safe: bool,
    ) -> Result<()> {
        self.if_async_we_cant("bind an external function")?;

        if self.externals.contains_key(name) {
            return Err(RuntimeError::InvalidOperation(format!(
                "Function '{}' has already been bound.",
                name
            )));
        }

        self.externals.insert(
            name.to_string(),
            ExternalBinding {
                function: Box::new(function),
                lookahead_safe,
            },
        );
        Ok(())
    }

    pub fn unbind_external_function(&mut self, name: &str) -> Result<()> {
        self.if_async_we_cant("unbind an external a function")?;

        if self.externals.remove(name).is_none() {
            return Err(RuntimeError::InvalidOperation(format!(
                "Function '{}' has not been bound.",
                name
            )));
        }
        Ok(())
    }

    pub fn set_allow_external_function_fallbacks(&mut self, allow: bool) {
        self.allow_external_function_fallbacks = allow;
    }

    // Variables

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.state.global_variable(name)
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let declared = self
            .state
            .variables_state()
            .default_globals()
            .is_some_and(|defaults| defaults.contains_key(name));
        if !declared {
            return Err(RuntimeError::story(format!(
                "Cannot assign to a variable ({}) that hasn't been declared in the story",
                name
            )));
        }

        if let Some((name, value)) = self.state.set_global(name, value.into()) {
            self.notify_variable_observers(&name, &value);
        }
        Ok(())
    }

    /// Calls `observer` whenever the global `name` changes. During `continue_story` changes are
    /// batched and reported once the line is complete.
    pub fn observe_variable(
        &mut self,
        name: &str,
        observer: impl FnMut(&str, &Value) + Send + 'static,
    ) -> Result<ObserverId> {
        self.if_async_we_cant("observe a new variable")?;

        if !self.state.global_variable_exists(name) {
            return Err(RuntimeError::InvalidOperation(format!(
                "Cannot observe variable '{}' because it wasn't declared in the ink story.",
                name
            )));
        }

        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.variable_observers
            .entry(name.to_string())
            .or_default()
            .push((id, Box::new(observer)));
        Ok(id)
    }

    pub fn remove_variable_observer(&mut self, id: ObserverId) -> Result<()> {
        self.if_async_we_cant("remove a variable observer")?;

        for observers in self.variable_observers.values_mut() {
            observers.retain(|(observer_id, _)| *observer_id != id);
        }
        self.variable_observers.retain(|_, observers| !observers.is_empty());
        Ok(())
    }

    /// Removes every observer of `name`.
    pub fn remove_variable_observers(&mut self, name: &str) -> Result<()> {
        self.if_async_we_cant("remove a variable observer")?;
        self.variable_observers.remove(name);
        Ok(())
    }

    // Handlers

    /// Receives every error and warning raised while continuing. Without one, `continue_story`
    /// fails with `RuntimeError::Unhandled` instead.
    pub fn set_error_handler(&self, handler: impl Fn(&str, ErrorType) + Send + Sync + 'static) {
        let handler: ErrorHandler = Box::new(handler);
        self.error_handler.store(Some(Arc::new(handler)));
    }

    pub fn clear_error_handler(&self) {
        self.error_handler.store(None);
    }

    pub fn set_on_did_continue(&mut self, handler: impl FnMut() + Send + 'static) {
        self.on_did_continue = Some(Box::new(handler));
    }

    pub fn set_on_make_choice(&mut self, handler: impl FnMut(&Choice) + Send + 'static) {
        self.on_make_choice = Some(Box::new(handler));
    }

    // Tags and introspection

    /// Tags at the very top of the story.
    pub fn global_tags(&self) -> Result<Vec<String>> {
        self.tags_at_start_of_flow_container("")
    }

    /// Tags at the start of a knot or stitch.
    pub fn tags_for_content_at_path(&self, path: &str) -> Result<Vec<String>> {
        self.tags_at_start_of_flow_container(path)
    }

    fn tags_at_start_of_flow_container(&self, path: &str) -> Result<Vec<String>> {
        let path = parse_path(path)?;

        let mut container = self
            .content_at_path(&path)
            .container()
            .ok_or_else(|| RuntimeError::InvalidOperation(format!("No container at path '{}'", path)))?;

        while let Some(Node::Container(first)) = self.graph.container(container).content().first() {
            container = *first;
        }

        let mut in_tag = false;
        let mut tags = Vec::new();
        for node in self.graph.container(container).content() {
            match node {
                Node::Control(ControlCommand::BeginTag) => in_tag = true,
                Node::Control(ControlCommand::EndTag) => in_tag = false,
                Node::Value(Value::String(text)) if in_tag => tags.push(text.clone()),
                _ if in_tag => {
                    return Err(RuntimeError::story(
                        "Tag contained non-text content. Only plain text is allowed when using globalTags or TagsAtContentPath. If you want to evaluate dynamic content, you need to use story.Continue().",
                    ))
                }
                _ => break,
            }
        }

        Ok(tags)
    }

    pub fn content_at_path(&self, path: &Path) -> SearchResult {
        self.graph.content_at_path(self.graph.root(), path, 0, None)
    }

    pub fn build_string_of_hierarchy(&self) -> String {
        self.graph.build_string_of_hierarchy(self.state.current_pointer())
    }

    // Flows

    pub fn switch_flow(&mut self, name: &str) -> Result<()> {
        self.if_async_we_cant("switch flow")?;
        if self.async_saving {
            return Err(RuntimeError::InvalidOperation(format!(
                "Story is already in background saving mode, can't switch flow to {}",
                name
            )));
        }

        self.state.switch_flow_internal(name);
        Ok(())
    }

    pub fn switch_to_default_flow(&mut self) {
        self.state.switch_to_default_flow_internal();
    }

    pub fn remove_flow(&mut self, name: &str) -> Result<()> {
        self.state.remove_flow_internal(name)
    }

    pub fn current_flow_name(&self) -> &str {
        self.state.current_flow_name()
    }

    pub fn current_flow_is_default_flow(&self) -> bool {
        self.state.current_flow_is_default_flow()
    }

    pub fn alive_flow_names(&self) -> Vec<String> {
        self.state.alive_flow_names()
    }

    // Save state

    pub fn save(&self) -> String {
        self.state.to_json_string()
    }

    pub fn restore(&mut self, json: &str) -> Result<()> {
        self.state.load_json(json)?;
        self.state_snapshot_at_last_newline = None;
        Ok(())
    }

    /// Detaches the current state so it can be serialised on another thread while the story keeps
    /// running. Call `background_save_complete` afterwards.
    pub fn copy_state_for_background_thread_save(&mut self) -> Result<StoryState> {
        self.if_async_we_cant("start saving on a background thread")?;

        if self.async_saving {
            return Err(RuntimeError::InvalidOperation(
                "Story is already in background saving mode, can't call CopyStateForBackgroundThreadSave again!"
                    .to_string(),
            ));
        }

        let patched = self.state.copy_and_start_patching();
        let to_save = std::mem::replace(&mut self.state, patched);
        self.async_saving = true;
        log::debug!("started background save");
        Ok(to_save)
    }

    pub fn background_save_complete(&mut self) {
        if self.state_snapshot_at_last_newline.is_none() {
            self.state.apply_any_patch();
        }
        self.async_saving = false;
        log::debug!("background save complete");
    }
}
