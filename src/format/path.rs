use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum Component {
    Index(usize),
    Name(String),
    /// `^`
    Parent,
}

impl Component {
    pub fn is_index(&self) -> bool {
        matches!(self, Component::Index(_))
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, Component::Parent)
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            Component::Index(i) => Some(*i),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Component::Name(name) => Some(name),
            Component::Parent => Some("^"),
            Component::Index(_) => None,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Index(i) => write!(f, "{}", i),
            Component::Name(name) => f.write_str(name),
            Component::Parent => f.write_str("^"),
        }
    }
}

/// Structural address of a node in the content graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Path {
    components: Vec<Component>,
    is_relative: bool,
}

impl Path {
    pub fn new(components: Vec<Component>, is_relative: bool) -> Self {
        Self {
            components,
            is_relative,
        }
    }

    /// The empty relative path, `.`
    pub fn self_path() -> Self {
        Self::new(Vec::new(), true)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    pub fn is_relative(&self) -> bool {
        self.is_relative
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn head(&self) -> Option<&Component> {
        self.components.first()
    }

    pub fn last_component(&self) -> Option<&Component> {
        self.components.last()
    }

    /// Everything but the head. A path of one component has the self path as its tail.
    pub fn tail(&self) -> Path {
        if self.components.len() >= 2 {
            Path::new(self.components[1..].to_vec(), false)
        } else {
            Path::self_path()
        }
    }

    pub fn contains_named_component(&self) -> bool {
        self.components.iter().any(|c| !c.is_index())
    }

    pub fn with_component(&self, component: Component) -> Path {
        let mut components = self.components.clone();
        components.push(component);
        Path::new(components, false)
    }

    /// Appends `other`, letting its leading `^` components climb out of `self`.
    pub fn with_path(&self, other: &Path) -> Path {
        let upward_moves = other
            .components
            .iter()
            .take_while(|c| c.is_parent())
            .count();
        let keep = self.components.len().saturating_sub(upward_moves);

        let mut components = self.components[..keep].to_vec();
        components.extend(other.components[upward_moves..].iter().cloned());
        Path::new(components, false)
    }

    /// Rewrites this absolute path relative to `base`, the path of the node that owns the reference.
    pub fn relative_to(&self, base: &Path) -> Path {
        let shared = base
            .components
            .iter()
            .zip(self.components.iter())
            .take_while(|(a, b)| a == b)
            .count();

        if shared == 0 {
            return self.clone();
        }

        let upward_moves = base.components.len() - shared;
        let mut components = vec![Component::Parent; upward_moves];
        components.extend(self.components[shared..].iter().cloned());
        Path::new(components, true)
    }

    /// Shortest string form of `self` as seen from the node at `base`.
    pub fn compact_string_from(&self, base: &Path) -> String {
        let (relative, global) = if self.is_relative {
            (self.to_string(), base.with_path(self).to_string())
        } else {
            (self.relative_to(base).to_string(), self.to_string())
        };

        if relative.len() < global.len() {
            relative
        } else {
            global
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_relative {
            f.write_str(".")?;
        }
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_path(s)
    }
}
