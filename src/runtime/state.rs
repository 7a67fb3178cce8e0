use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value as JsonValue};

use crate::error::{Result, RuntimeError};
use crate::format::*;
use crate::json::*;
use crate::parser::parse_path;
use crate::random::Prng;

use super::{CallStack, Choice, Flow, StatePatch, VariablesState, DEFAULT_FLOW_NAME};

/// Everything that changes while a story runs. The content graph itself is shared and immutable.
///
/// A state can be cloned cheaply enough to be snapshotted before lookahead and is `Send`, so a
/// detached copy can be serialised on another thread.
#[derive(Debug, Clone)]
pub struct StoryState {
    pub(crate) graph: Arc<ContentGraph>,
    current_flow: Flow,
    /// Flows other than the current one. `None` until a flow switch happens.
    named_flows: Option<BTreeMap<String, Flow>>,
    pub(crate) evaluation_stack: Vec<Object>,
    pub(crate) diverted_pointer: Pointer,
    current_turn_index: i32,
    pub(crate) story_seed: i32,
    pub(crate) previous_random: i32,
    pub(crate) did_safe_exit: bool,
    pub(crate) variables: VariablesState,
    visit_counts: Arc<BTreeMap<String, i32>>,
    turn_indices: Arc<BTreeMap<String, i32>>,
    pub(crate) patch: Option<StatePatch>,
    current_errors: Vec<String>,
    current_warnings: Vec<String>,
    text_cache: OnceLock<String>,
    tags_cache: OnceLock<Vec<String>>,
}

impl StoryState {
    pub fn new(graph: Arc<ContentGraph>) -> Self {
        let time_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let story_seed = (Prng::new(time_seed).next_int() % 100) as i32;

        let root = graph.root();
        let mut state = Self {
            graph,
            current_flow: Flow::new(DEFAULT_FLOW_NAME, root),
            named_flows: None,
            evaluation_stack: Vec::new(),
            diverted_pointer: Pointer::NULL,
            current_turn_index: -1,
            story_seed,
            previous_random: 0,
            did_safe_exit: false,
            variables: VariablesState::new(),
            visit_counts: Arc::new(BTreeMap::new()),
            turn_indices: Arc::new(BTreeMap::new()),
            patch: None,
            current_errors: Vec::new(),
            current_warnings: Vec::new(),
            text_cache: OnceLock::new(),
            tags_cache: OnceLock::new(),
        };
        state.go_to_start();
        state
    }

    pub fn graph(&self) -> &ContentGraph {
        &self.graph
    }

    pub fn go_to_start(&mut self) {
        let root = self.graph.root();
        self.call_stack_mut().current_element_mut().current_pointer = Pointer::start_of(root);
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.current_flow.call_stack
    }

    pub(crate) fn call_stack_mut(&mut self) -> &mut CallStack {
        &mut self.current_flow.call_stack
    }

    pub fn callstack_depth(&self) -> usize {
        self.call_stack().depth()
    }

    pub fn output_stream(&self) -> &[Object] {
        &self.current_flow.output_stream
    }

    pub(crate) fn output_stream_mut(&mut self) -> &mut Vec<Object> {
        self.output_stream_dirty();
        &mut self.current_flow.output_stream
    }

    pub(crate) fn output_stream_dirty(&mut self) {
        self.text_cache = OnceLock::new();
        self.tags_cache = OnceLock::new();
    }

    pub(crate) fn text_cache_get_or_init(&self, f: impl FnOnce(&[Object]) -> String) -> &str {
        self.text_cache
            .get_or_init(|| f(&self.current_flow.output_stream))
    }

    pub(crate) fn tags_cache_get_or_init(
        &self,
        f: impl FnOnce(&[Object]) -> Vec<String>,
    ) -> &[String] {
        self.tags_cache
            .get_or_init(|| f(&self.current_flow.output_stream))
    }

    /// Choices ready for the player. Empty while there is still content to continue through.
    pub fn current_choices(&self) -> &[Choice] {
        if self.can_continue() {
            return &[];
        }
        &self.current_flow.current_choices
    }

    pub fn generated_choices(&self) -> &[Choice] {
        &self.current_flow.current_choices
    }

    pub(crate) fn generated_choices_mut(&mut self) -> &mut Vec<Choice> {
        &mut self.current_flow.current_choices
    }

    pub fn current_errors(&self) -> &[String] {
        &self.current_errors
    }

    pub fn current_warnings(&self) -> &[String] {
        &self.current_warnings
    }

    pub fn has_error(&self) -> bool {
        !self.current_errors.is_empty()
    }

    pub fn has_warning(&self) -> bool {
        !self.current_warnings.is_empty()
    }

    pub(crate) fn add_error(&mut self, message: String, is_warning: bool) {
        if is_warning {
            log::warn!("{}", message);
            self.current_warnings.push(message);
        } else {
            log::error!("{}", message);
            self.current_errors.push(message);
        }
    }

    pub fn reset_errors(&mut self) {
        self.current_errors.clear();
        self.current_warnings.clear();
    }

    pub fn current_pointer(&self) -> Pointer {
        self.call_stack().current_element().current_pointer
    }

    pub(crate) fn set_current_pointer(&mut self, pointer: Pointer) {
        self.call_stack_mut().current_element_mut().current_pointer = pointer;
    }

    pub fn previous_pointer(&self) -> Pointer {
        self.call_stack().current_thread().previous_pointer
    }

    pub(crate) fn set_previous_pointer(&mut self, pointer: Pointer) {
        self.call_stack_mut().current_thread_mut().previous_pointer = pointer;
    }

    pub fn current_path_string(&self) -> Option<String> {
        self.graph
            .pointer_path(self.current_pointer())
            .map(|path| path.to_string())
    }

    pub fn previous_path_string(&self) -> Option<String> {
        self.graph
            .pointer_path(self.previous_pointer())
            .map(|path| path.to_string())
    }

    pub fn can_continue(&self) -> bool {
        !self.current_pointer().is_null() && !self.has_error()
    }

    pub fn in_expression_evaluation(&self) -> bool {
        self.call_stack().current_element().in_expression_evaluation
    }

    pub(crate) fn set_in_expression_evaluation(&mut self, value: bool) {
        self.call_stack_mut().current_element_mut().in_expression_evaluation = value;
    }

    pub fn current_turn_index(&self) -> i32 {
        self.current_turn_index
    }

    pub fn story_seed(&self) -> i32 {
        self.story_seed
    }

    pub fn previous_random(&self) -> i32 {
        self.previous_random
    }

    /// Reseeds the generator, e.g. to make a playthrough reproducible.
    pub fn set_story_seed(&mut self, seed: i32) {
        self.story_seed = seed;
        self.previous_random = 0;
    }

    pub fn call_stack_trace(&self) -> String {
        self.call_stack().call_stack_trace(&self.graph)
    }

    // Flows

    pub fn current_flow_name(&self) -> &str {
        &self.current_flow.name
    }

    pub fn current_flow_is_default_flow(&self) -> bool {
        self.current_flow.name == DEFAULT_FLOW_NAME
    }

    /// Names of every flow that has been started, apart from the default one.
    pub fn alive_flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .named_flows
            .iter()
            .flat_map(|flows| flows.keys().cloned())
            .collect();
        if self.named_flows.is_some() {
            names.push(self.current_flow.name.clone());
        }
        names.retain(|name| name != DEFAULT_FLOW_NAME);
        names.sort();
        names
    }

    pub(crate) fn switch_flow_internal(&mut self, name: &str) {
        let root = self.graph.root();
        let flows = self.named_flows.get_or_insert_with(BTreeMap::new);
        if name == self.current_flow.name {
            return;
        }

        let next = flows
            .remove(name)
            .unwrap_or_else(|| Flow::new(name, root));
        let previous = std::mem::replace(&mut self.current_flow, next);
        flows.insert(previous.name.clone(), previous);

        log::debug!("switched to flow '{}'", name);
        self.output_stream_dirty();
    }

    pub(crate) fn switch_to_default_flow_internal(&mut self) {
        if self.named_flows.is_none() {
            return;
        }
        self.switch_flow_internal(DEFAULT_FLOW_NAME);
    }

    pub(crate) fn remove_flow_internal(&mut self, name: &str) -> Result<()> {
        if name == DEFAULT_FLOW_NAME {
            return Err(RuntimeError::InvalidOperation(
                "Cannot destroy default flow".to_string(),
            ));
        }

        if self.current_flow.name == name {
            self.switch_to_default_flow_internal();
        }

        if let Some(flows) = self.named_flows.as_mut() {
            flows.remove(name);
        }
        Ok(())
    }

    // Visit counts and turn indices

    fn counted_container(&self, id: ContainerId) -> &Container {
        self.graph.container(id)
    }

    pub fn visit_count_at_path_string(&self, path: &str) -> Result<i32> {
        let key = match self.patch {
            Some(_) => {
                let search = self
                    .graph
                    .content_at_path(self.graph.root(), &parse_path(path)?, 0, None);
                let container = search.container().ok_or_else(|| {
                    RuntimeError::InvalidOperation(format!("Content at path not found: {}", path))
                })?;
                self.graph.container(container).path_string().to_string()
            }
            None => path.to_string(),
        };

        if let Some(count) = self.patch.as_ref().and_then(|p| p.visit_count(&key)) {
            return Ok(count);
        }
        Ok(self.visit_counts.get(&key).copied().unwrap_or(0))
    }

    pub(crate) fn visit_count_for_container(&self, id: ContainerId) -> Result<i32> {
        let container = self.counted_container(id);
        if !container.visits_should_be_counted() {
            return Err(RuntimeError::story(format!(
                "Read count for target ({} - on {}) unknown. The story may need to be compiled with countAllVisits flag (-c).",
                container.name().unwrap_or_default(),
                container.path()
            )));
        }

        let key = container.path_string();
        if let Some(count) = self.patch.as_ref().and_then(|p| p.visit_count(key)) {
            return Ok(count);
        }
        Ok(self.visit_counts.get(key).copied().unwrap_or(0))
    }

    pub(crate) fn increment_visit_count_for_container(&mut self, id: ContainerId) -> Result<()> {
        let key = self.counted_container(id).path_string().to_string();
        if self.patch.is_some() {
            let count = self.visit_count_for_container(id)? + 1;
            if let Some(patch) = self.patch.as_mut() {
                patch.set_visit_count(&key, count);
            }
            return Ok(());
        }

        *Arc::make_mut(&mut self.visit_counts).entry(key).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn record_turn_index_visit_to_container(&mut self, id: ContainerId) {
        let key = self.counted_container(id).path_string().to_string();
        let turn = self.current_turn_index;
        match self.patch.as_mut() {
            Some(patch) => patch.set_turn_index(&key, turn),
            None => {
                Arc::make_mut(&mut self.turn_indices).insert(key, turn);
            }
        }
    }

    pub(crate) fn turns_since_for_container(&self, id: ContainerId) -> Result<i32> {
        let container = self.counted_container(id);
        if !container.turn_index_should_be_counted() {
            return Err(RuntimeError::story(format!(
                "TURNS_SINCE() for target ({} - on {}) unknown. The story may need to be compiled with countAllVisits flag (-c).",
                container.name().unwrap_or_default(),
                container.path()
            )));
        }

        let key = container.path_string();
        if let Some(index) = self.patch.as_ref().and_then(|p| p.turn_index(key)) {
            return Ok(self.current_turn_index - index);
        }
        Ok(match self.turn_indices.get(key) {
            Some(index) => self.current_turn_index - index,
            None => -1,
        })
    }

    // Snapshots

    /// A copy that shares this state's tables and redirects every write to them into a patch.
    pub(crate) fn copy_and_start_patching(&self) -> StoryState {
        let mut copy = self.clone();
        copy.patch = Some(self.patch.clone().unwrap_or_default());
        copy
    }

    pub(crate) fn apply_any_patch(&mut self) {
        let Some(patch) = self.patch.take() else {
            return;
        };

        self.variables.apply_patch(&patch);

        if !patch.visit_counts.is_empty() {
            let counts = Arc::make_mut(&mut self.visit_counts);
            for (key, count) in patch.visit_counts {
                counts.insert(key, count);
            }
        }
        if !patch.turn_indices.is_empty() {
            let indices = Arc::make_mut(&mut self.turn_indices);
            for (key, index) in patch.turn_indices {
                indices.insert(key, index);
            }
        }
    }

    // Flow control helpers

    /// Abandons the current flow: the call stack is reset and no choices remain.
    pub fn force_end(&mut self) {
        self.call_stack_mut().reset();
        self.current_flow.current_choices.clear();
        self.set_current_pointer(Pointer::NULL);
        self.set_previous_pointer(Pointer::NULL);
        self.did_safe_exit = true;
    }

    /// Jumps to `path`. Returns the path actually reached when it could only be approximated.
    pub(crate) fn set_chosen_path(
        &mut self,
        path: &Path,
        incrementing_turn_index: bool,
    ) -> Result<Option<Path>> {
        self.current_flow.current_choices.clear();

        let lookup = self.graph.pointer_at_path(path)?;
        let mut pointer = lookup.pointer;
        if !pointer.is_null() && pointer.index == -1 {
            pointer.index = 0;
        }
        self.set_current_pointer(pointer);

        if incrementing_turn_index {
            self.current_turn_index += 1;
        }
        Ok(lookup.approximated_to)
    }

    pub(crate) fn start_function_evaluation_from_game(
        &mut self,
        function: ContainerId,
        args: &[Value],
    ) -> Result<()> {
        let height = self.evaluation_stack.len();
        let output_len = self.output_stream().len();
        self.call_stack_mut()
            .push(PushPopType::FunctionEvaluationFromGame, height, output_len);
        self.set_current_pointer(Pointer::start_of(function));
        self.pass_arguments_to_evaluation_stack(args)
    }

    pub(crate) fn pass_arguments_to_evaluation_stack(&mut self, args: &[Value]) -> Result<()> {
        for arg in args {
            match arg {
                Value::Int(_) | Value::Float(_) | Value::String(_) | Value::Bool(_) | Value::List(_) => {
                    self.push_evaluation_stack(Object::Value(arg.clone()));
                }
                other => {
                    return Err(RuntimeError::InvalidOperation(format!(
                        "ink arguments when calling evaluate_function / choose_path_string must be number, string, bool or list. Argument was {:?}",
                        other.value_type()
                    )))
                }
            }
        }
        Ok(())
    }

    pub(crate) fn try_exit_function_evaluation_from_game(&mut self) -> bool {
        if self.call_stack().element_is_evaluate_from_game() {
            self.set_current_pointer(Pointer::NULL);
            self.did_safe_exit = true;
            return true;
        }
        false
    }

    pub(crate) fn complete_function_evaluation_from_game(&mut self) -> Result<Option<Value>> {
        if !self.call_stack().element_is_evaluate_from_game() {
            return Err(RuntimeError::InvalidOperation(format!(
                "Expected external function evaluation to be complete. Stack trace: {}",
                self.call_stack_trace()
            )));
        }

        let original_height = self
            .call_stack()
            .current_element()
            .evaluation_stack_height_when_pushed;
        let mut returned = None;
        while self.evaluation_stack.len() > original_height {
            let popped = self.pop_evaluation_stack()?;
            if returned.is_none() {
                returned = Some(popped);
            }
        }

        self.pop_call_stack(Some(PushPopType::FunctionEvaluationFromGame))?;

        match returned {
            None | Some(Object::Void) => Ok(None),
            Some(Object::Value(value)) => Ok(Some(value)),
            Some(other) => Err(RuntimeError::assertion(format!(
                "Function returned a non-value: {}",
                other
            ))),
        }
    }

    // Save state

    pub fn to_json(&self) -> JsonValue {
        let mut flows = Map::new();
        match &self.named_flows {
            Some(named) => {
                let mut all: BTreeMap<&str, &Flow> =
                    named.iter().map(|(name, flow)| (name.as_str(), flow)).collect();
                all.insert(&self.current_flow.name, &self.current_flow);
                for (name, flow) in all {
                    flows.insert(name.to_string(), write_flow(&self.graph, flow));
                }
            }
            None => {
                flows.insert(
                    self.current_flow.name.clone(),
                    write_flow(&self.graph, &self.current_flow),
                );
            }
        }

        // a pending patch is folded in so the document reflects what the player has seen
        let mut state = self.clone();
        state.apply_any_patch();

        let mut obj = Map::new();
        obj.insert("flows".to_string(), JsonValue::Object(flows));
        obj.insert("currentFlowName".to_string(), json!(self.current_flow.name));
        obj.insert("variablesState".to_string(), state.variables.to_json());
        obj.insert(
            "evalStack".to_string(),
            write_object_array(&self.evaluation_stack),
        );
        if let Some(path) = self.graph.pointer_path(self.diverted_pointer) {
            obj.insert("currentDivertTarget".to_string(), json!(path.to_string()));
        }
        obj.insert(
            "visitCounts".to_string(),
            write_int_dictionary(&state.visit_counts),
        );
        obj.insert(
            "turnIndices".to_string(),
            write_int_dictionary(&state.turn_indices),
        );
        obj.insert("turnIdx".to_string(), json!(self.current_turn_index));
        obj.insert("storySeed".to_string(), json!(self.story_seed));
        obj.insert("previousRandom".to_string(), json!(self.previous_random));
        obj.insert("inkSaveVersion".to_string(), json!(INK_SAVE_STATE_VERSION));
        obj.insert("inkFormatVersion".to_string(), json!(INK_VERSION_CURRENT));
        JsonValue::Object(obj)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    pub fn load_json(&mut self, text: &str) -> Result<()> {
        let value: JsonValue = serde_json::from_str(text)?;
        self.load_json_value(&value)
    }

    pub fn load_json_value(&mut self, value: &JsonValue) -> Result<()> {
        let obj = value.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
        let field = |key: &str| obj.get(key).ok_or(RuntimeError::InvalidSaveFormat);

        let version = field("inkSaveVersion")?
            .as_i64()
            .ok_or(RuntimeError::InvalidSaveFormat)?;
        if version < MIN_COMPATIBLE_LOAD_VERSION {
            return Err(RuntimeError::IncompatibleSaveVersion {
                found: version,
                minimum: MIN_COMPATIBLE_LOAD_VERSION,
            });
        }

        let mut warnings = Vec::new();
        match obj.get("flows") {
            Some(flows) => {
                let flows = flows.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;
                let mut loaded = BTreeMap::new();
                for (name, flow) in flows {
                    loaded.insert(name.clone(), read_flow(name, flow, &self.graph, &mut warnings)?);
                }

                if loaded.len() == 1 {
                    let (_, flow) = loaded
                        .pop_first()
                        .ok_or(RuntimeError::InvalidSaveFormat)?;
                    self.current_flow = flow;
                    self.named_flows = None;
                } else {
                    let current_name = field("currentFlowName")?
                        .as_str()
                        .ok_or(RuntimeError::InvalidSaveFormat)?;
                    self.current_flow = loaded
                        .remove(current_name)
                        .ok_or(RuntimeError::InvalidSaveFormat)?;
                    self.named_flows = Some(loaded);
                }
            }
            None => {
                self.current_flow = read_legacy_flow(obj, &self.graph, &mut warnings)?;
                self.named_flows = None;
            }
        }
        self.output_stream_dirty();

        self.variables.load_json(field("variablesState")?)?;
        self.evaluation_stack = read_object_array(field("evalStack")?)?;

        self.diverted_pointer = match obj.get("currentDivertTarget") {
            Some(JsonValue::String(path)) => self.graph.pointer_at_path(&parse_path(path)?)?.pointer,
            Some(_) => return Err(RuntimeError::InvalidSaveFormat),
            None => Pointer::NULL,
        };

        self.visit_counts = Arc::new(read_int_dictionary(field("visitCounts")?)?);
        self.turn_indices = Arc::new(read_int_dictionary(field("turnIndices")?)?);

        let int_field = |key: &str| -> Result<i32> {
            field(key)?
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .ok_or(RuntimeError::InvalidSaveFormat)
        };
        self.current_turn_index = int_field("turnIdx")?;
        self.story_seed = int_field("storySeed")?;
        self.previous_random = int_field("previousRandom")?;
        self.patch = None;

        for warning in warnings {
            self.add_error(warning, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::read_story;

    const STORY: &str = r##"{"inkVersion":21,"root":[["^a","\n","done",{"#f":5}],"done",{"knot":["^k","\n","done",{"#f":3}]}]}"##;

    fn state() -> StoryState {
        StoryState::new(Arc::new(read_story(STORY).unwrap()))
    }

    fn knot(state: &StoryState) -> ContainerId {
        state.graph().knot_container_with_name("knot").unwrap()
    }

    #[test]
    fn starts_at_the_root() {
        let state = state();
        assert_eq!(state.current_pointer(), Pointer::start_of(ContainerId::ROOT));
        assert_eq!(state.current_turn_index(), -1);
        assert!((0..100).contains(&state.story_seed()));
        assert!(state.can_continue());
    }

    #[test]
    fn patched_counts_only_reach_the_base_when_applied() {
        let mut base = state();
        let knot = knot(&base);
        base.increment_visit_count_for_container(knot).unwrap();

        let mut copy = base.copy_and_start_patching();
        copy.increment_visit_count_for_container(knot).unwrap();
        assert_eq!(copy.visit_count_for_container(knot).unwrap(), 2);
        assert_eq!(base.visit_count_for_container(knot).unwrap(), 1);

        copy.apply_any_patch();
        assert!(copy.patch.is_none());
        assert_eq!(copy.visit_count_at_path_string("knot").unwrap(), 2);
        assert_eq!(base.visit_count_at_path_string("knot").unwrap(), 1);
    }

    #[test]
    fn uncounted_containers_are_story_errors() {
        let state = state();
        let root = state.graph().root();
        assert!(matches!(
            state.visit_count_for_container(root),
            Err(RuntimeError::Story(_))
        ));
    }

    #[test]
    fn flows_switch_and_are_removed() {
        let mut state = state();
        assert!(state.alive_flow_names().is_empty());

        state.switch_flow_internal("side");
        assert_eq!(state.current_flow_name(), "side");
        assert_eq!(state.alive_flow_names(), vec!["side".to_string()]);

        state.remove_flow_internal("side").unwrap();
        assert!(state.current_flow_is_default_flow());
        assert!(state.alive_flow_names().is_empty());
        assert!(state.remove_flow_internal(DEFAULT_FLOW_NAME).is_err());
    }

    #[test]
    fn save_round_trip() {
        let mut state = state();
        let knot = knot(&state);
        state.set_story_seed(7);
        state.increment_visit_count_for_container(knot).unwrap();
        state.switch_flow_internal("side");

        let saved = state.to_json();
        assert_eq!(saved["inkSaveVersion"], json!(10));
        assert_eq!(saved["currentFlowName"], json!("side"));
        assert_eq!(saved["visitCounts"], json!({ "knot": 1 }));

        let mut loaded = StoryState::new(Arc::clone(&state.graph));
        loaded.load_json(&saved.to_string()).unwrap();
        assert_eq!(loaded.current_flow_name(), "side");
        assert_eq!(loaded.story_seed(), 7);
        assert_eq!(loaded.visit_count_for_container(knot).unwrap(), 1);
        assert_eq!(loaded.to_json(), saved);
    }

    #[test]
    fn old_saves_are_rejected() {
        let mut state = state();
        assert!(matches!(
            state.load_json(r##"{"inkSaveVersion":7}"##),
            Err(RuntimeError::IncompatibleSaveVersion { found: 7, .. })
        ));
        assert!(matches!(
            state.load_json("{}"),
            Err(RuntimeError::InvalidSaveFormat)
        ));
    }
}
