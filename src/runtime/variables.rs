use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::error::{Result, RuntimeError};
use crate::format::{Value, VariableAssignment};
use crate::json::{read_value, write_value};

use super::{StatePatch, StoryState};

/// Global variables plus the bookkeeping for batched change notification.
///
/// The global table is shared between a state and the copies taken of it; it is only cloned when
/// written without a patch in place.
#[derive(Debug, Clone, Default)]
pub struct VariablesState {
    globals: Arc<BTreeMap<String, Value>>,
    default_globals: Option<Arc<BTreeMap<String, Value>>>,
    batch_observing: bool,
    changed_for_batch: Option<BTreeSet<String>>,
}

impl VariablesState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Globals as stored in the base table, ignoring any pending patch.
    pub fn globals(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.globals.iter()
    }

    pub fn default_globals(&self) -> Option<&BTreeMap<String, Value>> {
        self.default_globals.as_deref()
    }

    pub(crate) fn snapshot_default_globals(&mut self) {
        self.default_globals = Some(Arc::clone(&self.globals));
    }

    pub(crate) fn apply_patch(&mut self, patch: &StatePatch) {
        if !patch.globals.is_empty() {
            let globals = Arc::make_mut(&mut self.globals);
            for (name, value) in &patch.globals {
                globals.insert(name.clone(), value.clone());
            }
        }

        if let Some(changed) = self.changed_for_batch.as_mut() {
            changed.extend(patch.changed_variables.iter().cloned());
        }
    }

    /// Globals that differ from their declared defaults.
    pub fn to_json(&self) -> JsonValue {
        let mut obj = Map::new();
        for (name, value) in self.globals.iter() {
            let is_default = self
                .default_globals
                .as_ref()
                .and_then(|defaults| defaults.get(name))
                .is_some_and(|default| default == value);
            if !is_default {
                obj.insert(name.clone(), write_value(value));
            }
        }
        JsonValue::Object(obj)
    }

    /// Only declared globals are restored; any missing from the save fall back to their defaults.
    pub fn load_json(&mut self, token: &JsonValue) -> Result<()> {
        let saved = token.as_object().ok_or(RuntimeError::InvalidSaveFormat)?;

        let mut globals = BTreeMap::new();
        if let Some(defaults) = &self.default_globals {
            for (name, default) in defaults.iter() {
                let value = match saved.get(name) {
                    Some(token) => read_value(token)?,
                    None => default.clone(),
                };
                globals.insert(name.clone(), value);
            }
        }

        self.globals = Arc::new(globals);
        Ok(())
    }
}

impl StoryState {
    pub fn variables_state(&self) -> &VariablesState {
        &self.variables
    }

    /// Current value of a global, pending patch included.
    pub fn global_variable(&self, name: &str) -> Option<&Value> {
        self.patch
            .as_ref()
            .and_then(|patch| patch.global(name))
            .or_else(|| self.variables.globals.get(name))
            .or_else(|| {
                self.variables
                    .default_globals
                    .as_ref()
                    .and_then(|defaults| defaults.get(name))
            })
    }

    pub fn global_variable_exists(&self, name: &str) -> bool {
        self.variables.globals.contains_key(name)
            || self
                .variables
                .default_globals
                .as_ref()
                .is_some_and(|defaults| defaults.contains_key(name))
            || self
                .patch
                .as_ref()
                .is_some_and(|patch| patch.global(name).is_some())
    }

    /// Looks a variable up without following variable pointers. Context 0 is global scope and -1
    /// the current activation; globals and list items are consulted for both.
    pub(crate) fn raw_variable_with_name(&self, name: &str, context_index: i32) -> Option<Value> {
        if context_index == 0 || context_index == -1 {
            if let Some(value) = self.global_variable(name) {
                return Some(value.clone());
            }
            if let Some(value) = self.graph.lists().find_single_item_list_with_name(name) {
                return Some(value);
            }
        }

        self.call_stack()
            .temporary_variable(name, context_index)
            .cloned()
    }

    pub(crate) fn variable_with_name(&self, name: &str, context_index: i32) -> Option<Value> {
        match self.raw_variable_with_name(name, context_index)? {
            Value::VariablePointer {
                name,
                context_index,
            } => self.variable_with_name(&name, context_index),
            value => Some(value),
        }
    }

    /// Pins a pointer to the scope its variable lives in, collapsing pointer-to-pointer chains.
    pub(crate) fn resolve_variable_pointer(&self, name: &str, context_index: i32) -> Value {
        let context_index = if context_index != -1 {
            context_index
        } else if self.global_variable_exists(name) {
            0
        } else {
            self.call_stack().current_element_index() + 1
        };

        match self.raw_variable_with_name(name, context_index) {
            Some(pointer @ Value::VariablePointer { .. }) => pointer,
            _ => Value::VariablePointer {
                name: name.to_string(),
                context_index,
            },
        }
    }

    /// Returns the change to report to observers right away, if any.
    pub(crate) fn assign_variable(
        &mut self,
        assignment: &VariableAssignment,
        mut value: Value,
    ) -> Result<Option<(String, Value)>> {
        let mut name = assignment.variable_name.clone();
        let mut context_index = -1;
        let mut set_global;

        if assignment.is_new_declaration {
            set_global = assignment.is_global;
            if let Value::VariablePointer {
                name: target,
                context_index,
            } = &value
            {
                value = self.resolve_variable_pointer(target, *context_index);
            }
        } else {
            set_global = self.global_variable_exists(&name);
            while let Some(Value::VariablePointer {
                name: target,
                context_index: target_context,
            }) = self.raw_variable_with_name(&name, context_index)
            {
                name = target;
                context_index = target_context;
                set_global = context_index == 0;
            }
        }

        if set_global {
            Ok(self.set_global(&name, value))
        } else {
            self.call_stack_mut().set_temporary_variable(
                &name,
                value,
                assignment.is_new_declaration,
                context_index,
            )?;
            Ok(None)
        }
    }

    /// Writes a global, into the patch when one is active. Changes to an existing variable are
    /// either queued for the batch or returned for immediate notification.
    pub(crate) fn set_global(&mut self, name: &str, mut value: Value) -> Option<(String, Value)> {
        let old = self
            .patch
            .as_ref()
            .and_then(|patch| patch.global(name))
            .or_else(|| self.variables.globals.get(name))
            .cloned();

        if let Some(old) = &old {
            value.retain_list_origins(old);
        }

        match self.patch.as_mut() {
            Some(patch) => patch.set_global(name, value.clone()),
            None => {
                Arc::make_mut(&mut self.variables.globals).insert(name.to_string(), value.clone());
            }
        }

        old.as_ref()?;

        if self.variables.batch_observing {
            match (self.patch.as_mut(), self.variables.changed_for_batch.as_mut()) {
                (Some(patch), _) => patch.add_changed_variable(name),
                (None, Some(changed)) => {
                    changed.insert(name.to_string());
                }
                (None, None) => {}
            }
            None
        } else {
            Some((name.to_string(), value))
        }
    }

    pub(crate) fn start_variable_observation(&mut self) {
        self.variables.batch_observing = true;
        self.variables.changed_for_batch = Some(BTreeSet::new());
    }

    /// Ends batching and returns every global changed during it with its current value.
    pub(crate) fn complete_variable_observation(&mut self) -> BTreeMap<String, Value> {
        self.variables.batch_observing = false;

        let mut changed = BTreeMap::new();
        if let Some(names) = self.variables.changed_for_batch.take() {
            for name in names {
                if let Some(value) = self.variables.globals.get(&name) {
                    changed.insert(name, value.clone());
                }
            }
        }

        if let Some(patch) = &self.patch {
            for name in patch.changed_variables() {
                if let Some(value) = patch.global(name) {
                    changed.insert(name.clone(), value.clone());
                }
            }
        }

        changed
    }

    pub(crate) fn snapshot_default_globals(&mut self) {
        self.variables.snapshot_default_globals();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::read_story;

    fn state() -> StoryState {
        let graph = read_story(r##"{"inkVersion":21,"root":[["done",null],"done",null]}"##).unwrap();
        StoryState::new(Arc::new(graph))
    }

    fn declare(state: &mut StoryState, name: &str, value: Value) {
        let assignment = VariableAssignment {
            variable_name: name.to_string(),
            is_new_declaration: true,
            is_global: true,
        };
        state.assign_variable(&assignment, value).unwrap();
    }

    #[test]
    fn declarations_do_not_notify() {
        let mut state = state();
        assert_eq!(state.set_global("x", Value::Int(1)), None);
        assert_eq!(
            state.set_global("x", Value::Int(2)),
            Some(("x".to_string(), Value::Int(2)))
        );
    }

    #[test]
    fn batch_collects_changes() {
        let mut state = state();
        declare(&mut state, "x", Value::Int(1));
        state.snapshot_default_globals();

        state.start_variable_observation();
        assert_eq!(state.set_global("x", Value::Int(5)), None);
        let changed = state.complete_variable_observation();
        assert_eq!(changed.get("x"), Some(&Value::Int(5)));
    }

    #[test]
    fn patched_writes_leave_base_untouched() {
        let mut state = state();
        declare(&mut state, "x", Value::Int(1));
        state.patch = Some(StatePatch::new());
        state.set_global("x", Value::Int(9));

        assert_eq!(state.global_variable("x"), Some(&Value::Int(9)));
        assert_eq!(state.variables_state().globals.get("x"), Some(&Value::Int(1)));

        state.apply_any_patch();
        assert_eq!(state.variables_state().globals.get("x"), Some(&Value::Int(9)));
    }

    #[test]
    fn pointers_are_followed_on_assignment() {
        let mut state = state();
        declare(&mut state, "x", Value::Int(1));
        state
            .call_stack_mut()
            .set_temporary_variable(
                "r",
                Value::VariablePointer {
                    name: "x".to_string(),
                    context_index: 0,
                },
                true,
                -1,
            )
            .unwrap();

        let assignment = VariableAssignment {
            variable_name: "r".to_string(),
            is_new_declaration: false,
            is_global: false,
        };
        state.assign_variable(&assignment, Value::Int(7)).unwrap();
        assert_eq!(state.variable_with_name("x", -1), Some(Value::Int(7)));
        assert_eq!(state.variable_with_name("r", -1), Some(Value::Int(7)));
    }

    #[test]
    fn save_skips_defaults() {
        let mut state = state();
        declare(&mut state, "a", Value::Int(1));
        declare(&mut state, "b", Value::Int(2));
        state.snapshot_default_globals();
        state.set_global("b", Value::Int(3));

        let saved = state.variables_state().to_json();
        assert_eq!(saved, serde_json::json!({ "b": 3 }));

        let mut loaded = state.variables_state().clone();
        loaded.load_json(&serde_json::json!({ "b": 4, "stale": 1 })).unwrap();
        assert_eq!(loaded.globals.get("a"), Some(&Value::Int(1)));
        assert_eq!(loaded.globals.get("b"), Some(&Value::Int(4)));
        assert!(!loaded.globals.contains_key("stale"));
    }
}
