use std::collections::{BTreeMap, BTreeSet};

use crate::format::Value;

/// Overlay of global, visit count and turn index writes made while a newline snapshot is
/// outstanding. Reads consult the patch first; the base tables are only touched once the patch is
/// applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub(crate) globals: BTreeMap<String, Value>,
    pub(crate) changed_variables: BTreeSet<String>,
    pub(crate) visit_counts: BTreeMap<String, i32>,
    pub(crate) turn_indices: BTreeMap<String, i32>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn add_changed_variable(&mut self, name: &str) {
        self.changed_variables.insert(name.to_string());
    }

    pub fn visit_count(&self, container_path: &str) -> Option<i32> {
        self.visit_counts.get(container_path).copied()
    }

    pub fn set_visit_count(&mut self, container_path: &str, count: i32) {
        self.visit_counts.insert(container_path.to_string(), count);
    }

    pub fn turn_index(&self, container_path: &str) -> Option<i32> {
        self.turn_indices.get(container_path).copied()
    }

    pub fn set_turn_index(&mut self, container_path: &str, index: i32) {
        self.turn_indices.insert(container_path.to_string(), index);
    }

    pub fn changed_variables(&self) -> &BTreeSet<String> {
        &self.changed_variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_overlay_values() {
        let mut patch = StatePatch::new();
        assert_eq!(patch.global("x"), None);
        patch.set_global("x", Value::Int(3));
        patch.add_changed_variable("x");
        patch.set_visit_count("knot", 2);
        patch.set_turn_index("knot", 5);

        assert_eq!(patch.global("x"), Some(&Value::Int(3)));
        assert!(patch.changed_variables().contains("x"));
        assert_eq!(patch.visit_count("knot"), Some(2));
        assert_eq!(patch.turn_index("knot"), Some(5));
        assert_eq!(patch.visit_count("other"), None);
    }
}
