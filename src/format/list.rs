use std::collections::HashMap;
use std::fmt;

use super::Value;

/// An item of a list definition, addressed as `origin.item`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListItem {
    pub origin_name: Option<String>,
    pub item_name: String,
}

impl ListItem {
    pub fn new(origin_name: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            origin_name: Some(origin_name.into()),
            item_name: item_name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!(
            "{}.{}",
            self.origin_name.as_deref().unwrap_or("?"),
            self.item_name
        )
    }
}

/// A set of list items with their values, kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InkList {
    items: Vec<(ListItem, i32)>,
    /// Origins remembered for an empty list, so it still knows which definitions it belongs to.
    initial_origin_names: Option<Vec<String>>,
}

impl InkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_item(item: ListItem, value: i32) -> Self {
        let mut list = Self::new();
        list.insert(item, value);
        list
    }

    pub fn with_origin(origin_name: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            initial_origin_names: Some(vec![origin_name.into()]),
        }
    }

    pub fn insert(&mut self, item: ListItem, value: i32) {
        match self.items.iter_mut().find(|(existing, _)| *existing == item) {
            Some(entry) => entry.1 = value,
            None => self.items.push((item, value)),
        }
    }

    pub fn remove(&mut self, item: &ListItem) {
        self.items.retain(|(existing, _)| existing != item);
    }

    pub fn contains_item(&self, item: &ListItem) -> bool {
        self.items.iter().any(|(existing, _)| existing == item)
    }

    pub fn contains_item_named(&self, item_name: &str) -> bool {
        self.items.iter().any(|(item, _)| item.item_name == item_name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = (&ListItem, i32)> {
        self.items.iter().map(|(item, value)| (item, *value))
    }

    pub fn origin_names(&self) -> Vec<String> {
        if self.items.is_empty() {
            return self.initial_origin_names.clone().unwrap_or_default();
        }

        let mut names: Vec<String> = Vec::new();
        for (item, _) in &self.items {
            if let Some(origin) = &item.origin_name {
                if !names.contains(origin) {
                    names.push(origin.clone());
                }
            }
        }
        names
    }

    pub fn initial_origin_names(&self) -> Option<&[String]> {
        self.initial_origin_names.as_deref()
    }

    pub fn set_initial_origin_names(&mut self, names: Option<Vec<String>>) {
        self.initial_origin_names = names;
    }

    pub fn origins<'a>(&self, definitions: &'a ListDefinitions) -> Vec<&'a ListDefinition> {
        self.origin_names()
            .iter()
            .filter_map(|name| definitions.get(name))
            .collect()
    }

    /// Items sorted by value, ties broken by origin name.
    pub fn ordered_items(&self) -> Vec<(&ListItem, i32)> {
        let mut ordered: Vec<(&ListItem, i32)> = self.items().collect();
        ordered.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| a.0.origin_name.cmp(&b.0.origin_name))
        });
        ordered
    }

    pub fn max_item(&self) -> Option<(&ListItem, i32)> {
        let mut max: Option<(&ListItem, i32)> = None;
        for (item, value) in self.items() {
            if max.map_or(true, |(_, v)| value > v) {
                max = Some((item, value));
            }
        }
        max
    }

    pub fn min_item(&self) -> Option<(&ListItem, i32)> {
        let mut min: Option<(&ListItem, i32)> = None;
        for (item, value) in self.items() {
            if min.map_or(true, |(_, v)| value < v) {
                min = Some((item, value));
            }
        }
        min
    }

    pub fn max_as_list(&self) -> InkList {
        match self.max_item() {
            Some((item, value)) => InkList::from_item(item.clone(), value),
            None => InkList::new(),
        }
    }

    pub fn min_as_list(&self) -> InkList {
        match self.min_item() {
            Some((item, value)) => InkList::from_item(item.clone(), value),
            None => InkList::new(),
        }
    }

    pub fn union(&self, other: &InkList) -> InkList {
        let mut result = self.clone();
        result.initial_origin_names = Some(self.origin_names());
        for (item, value) in other.items() {
            result.insert(item.clone(), value);
        }
        result
    }

    pub fn intersect(&self, other: &InkList) -> InkList {
        let mut result = InkList::new();
        for (item, value) in self.items() {
            if other.contains_item(item) {
                result.insert(item.clone(), value);
            }
        }
        result
    }

    pub fn without(&self, other: &InkList) -> InkList {
        let mut result = self.clone();
        result.initial_origin_names = Some(self.origin_names());
        for (item, _) in other.items() {
            result.remove(item);
        }
        result
    }

    /// True when every item of `other` is in `self`. Empty lists contain nothing and are in nothing.
    pub fn contains(&self, other: &InkList) -> bool {
        if other.is_empty() || self.is_empty() {
            return false;
        }
        other.items().all(|(item, _)| self.contains_item(item))
    }

    pub fn greater_than(&self, other: &InkList) -> bool {
        match (self.min_item(), other.max_item()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some((_, min)), Some((_, max))) => min > max,
        }
    }

    pub fn greater_than_or_equals(&self, other: &InkList) -> bool {
        if self.is_empty() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        self.min_value() >= other.min_value() && self.max_value() >= other.max_value()
    }

    pub fn less_than(&self, other: &InkList) -> bool {
        match (self.max_item(), other.min_item()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((_, max)), Some((_, min))) => max < min,
        }
    }

    pub fn less_than_or_equals(&self, other: &InkList) -> bool {
        if other.is_empty() {
            return false;
        }
        if self.is_empty() {
            return true;
        }
        self.max_value() <= other.max_value() && self.min_value() <= other.min_value()
    }

    fn min_value(&self) -> i32 {
        self.min_item().map_or(0, |(_, v)| v)
    }

    fn max_value(&self) -> i32 {
        self.max_item().map_or(0, |(_, v)| v)
    }

    /// Every item of this list's origins that is not in the list.
    pub fn inverse(&self, definitions: &ListDefinitions) -> InkList {
        let mut result = InkList::new();
        for origin in self.origins(definitions) {
            for (item, value) in origin.items() {
                if !self.contains_item(&item) {
                    result.insert(item, value);
                }
            }
        }
        result
    }

    pub fn all(&self, definitions: &ListDefinitions) -> InkList {
        let mut result = InkList::new();
        for origin in self.origins(definitions) {
            for (item, value) in origin.items() {
                result.insert(item, value);
            }
        }
        result
    }

    pub fn with_sub_range(&self, min: i32, max: i32) -> InkList {
        let mut result = InkList::new();
        if self.is_empty() {
            return result;
        }

        result.initial_origin_names = Some(self.origin_names());
        for (item, value) in self.ordered_items() {
            if value >= min && value <= max {
                result.insert(item.clone(), value);
            }
        }
        result
    }
}

impl PartialEq for InkList {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.items().all(|(item, _)| other.contains_item(item))
    }
}

impl fmt::Display for InkList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (item, _)) in self.ordered_items().into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&item.item_name)?;
        }
        Ok(())
    }
}

/// A `LIST` declared in the story.
#[derive(Debug, Clone, PartialEq)]
pub struct ListDefinition {
    name: String,
    items: Vec<(String, i32)>,
}

impl ListDefinition {
    pub fn new(name: impl Into<String>, items: Vec<(String, i32)>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> impl Iterator<Item = (ListItem, i32)> + '_ {
        self.items
            .iter()
            .map(|(item, value)| (ListItem::new(self.name.clone(), item.clone()), *value))
    }

    pub fn raw_items(&self) -> &[(String, i32)] {
        &self.items
    }

    pub fn item_with_value(&self, value: i32) -> Option<ListItem> {
        self.items
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(item, _)| ListItem::new(self.name.clone(), item.clone()))
    }

    pub fn value_for_item(&self, item_name: &str) -> Option<i32> {
        self.items
            .iter()
            .find(|(name, _)| name == item_name)
            .map(|(_, v)| *v)
    }
}

/// All list definitions of a story, with a lookup of single-item lists by item name.
#[derive(Debug, Clone, Default)]
pub struct ListDefinitions {
    lists: Vec<ListDefinition>,
    single_item_lists: HashMap<String, InkList>,
}

impl ListDefinitions {
    pub fn new(lists: Vec<ListDefinition>) -> Self {
        let mut single_item_lists = HashMap::new();
        for list in &lists {
            for (item, value) in list.items() {
                let single = InkList::from_item(item.clone(), value);
                single_item_lists.insert(item.item_name.clone(), single.clone());
                single_item_lists.insert(item.full_name(), single);
            }
        }

        Self {
            lists,
            single_item_lists,
        }
    }

    pub fn lists(&self) -> &[ListDefinition] {
        &self.lists
    }

    pub fn get(&self, name: &str) -> Option<&ListDefinition> {
        self.lists.iter().find(|list| list.name == name)
    }

    /// `red` or `Colours.red` as a one-item list value.
    pub fn find_single_item_list_with_name(&self, name: &str) -> Option<Value> {
        if name.trim().is_empty() {
            return None;
        }
        self.single_item_lists.get(name).cloned().map(Value::List)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colours() -> ListDefinitions {
        ListDefinitions::new(vec![ListDefinition::new(
            "Colours",
            vec![
                ("red".to_string(), 1),
                ("green".to_string(), 2),
                ("blue".to_string(), 3),
            ],
        )])
    }

    fn list(names: &[&str]) -> InkList {
        let defs = colours();
        let def = defs.get("Colours").unwrap();
        let mut list = InkList::new();
        for name in names {
            let value = def.value_for_item(name).unwrap();
            list.insert(ListItem::new("Colours", *name), value);
        }
        list
    }

    #[test]
    fn set_operations() {
        let rg = list(&["red", "green"]);
        let gb = list(&["green", "blue"]);
        assert_eq!(rg.union(&gb), list(&["red", "green", "blue"]));
        assert_eq!(rg.intersect(&gb), list(&["green"]));
        assert_eq!(rg.without(&gb), list(&["red"]));
        assert!(rg.contains(&list(&["red"])));
        assert!(!rg.contains(&InkList::new()));
    }

    #[test]
    fn comparisons() {
        let red = list(&["red"]);
        let blue = list(&["blue"]);
        assert!(blue.greater_than(&red));
        assert!(red.less_than(&blue));
        assert!(list(&["red", "blue"]).greater_than_or_equals(&red));
        assert!(!InkList::new().greater_than(&red));
        assert!(InkList::new().less_than(&red));
    }

    #[test]
    fn inverse_and_all_use_origins() {
        let defs = colours();
        assert_eq!(list(&["red"]).inverse(&defs), list(&["green", "blue"]));
        assert_eq!(list(&["red"]).all(&defs), list(&["red", "green", "blue"]));

        // an emptied list still remembers its origin
        let empty = list(&["red"]).without(&list(&["red"]));
        assert!(empty.is_empty());
        assert_eq!(empty.all(&defs).len(), 3);
    }

    #[test]
    fn display_is_ordered_by_value() {
        let mut l = InkList::new();
        l.insert(ListItem::new("Colours", "blue"), 3);
        l.insert(ListItem::new("Colours", "red"), 1);
        assert_eq!(l.to_string(), "red, blue");
    }

    #[test]
    fn single_item_lookup() {
        let defs = colours();
        assert_eq!(
            defs.find_single_item_list_with_name("green"),
            Some(Value::List(list(&["green"])))
        );
        assert!(defs.find_single_item_list_with_name("Colours.green").is_some());
        assert!(defs.find_single_item_list_with_name("purple").is_none());
    }
}
