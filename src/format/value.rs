use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

use super::{InkList, Path};

/// Kinds of [`Value`], ordered by coercion rank: binary operators coerce both operands to the
/// higher-ranked kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ValueType {
    Bool,
    Int,
    Float,
    List,
    String,
    DivertTarget,
    VariablePointer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    String(String),
    List(InkList),
    DivertTarget(Path),
    VariablePointer { name: String, context_index: i32 },
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::DivertTarget(_) => ValueType::DivertTarget,
            Value::VariablePointer { .. } => ValueType::VariablePointer,
        }
    }

    pub fn is_truthy(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(s) => Ok(!s.is_empty()),
            Value::List(l) => Ok(!l.is_empty()),
            Value::DivertTarget(path) => Err(RuntimeError::story(format!(
                "Shouldn't use a divert target (to {}) as a conditional value. Did you intend a function call 'likeThis()' or a read count check 'likeThis'? (no arrows)",
                path
            ))),
            Value::VariablePointer { .. } => Err(RuntimeError::assertion(
                "Shouldn't be checking the truthiness of a variable pointer",
            )),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&InkList> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_divert_target(&self) -> Option<&Path> {
        match self {
            Value::DivertTarget(p) => Some(p),
            _ => None,
        }
    }

    pub fn cast(&self, to: ValueType) -> Result<Value> {
        if self.value_type() == to {
            return Ok(self.clone());
        }

        let cast = match (self, to) {
            (Value::Bool(b), ValueType::Int) => Some(Value::Int(*b as i32)),
            (Value::Bool(b), ValueType::Float) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
            (Value::Bool(b), ValueType::String) => {
                Some(Value::String(if *b { "true" } else { "false" }.to_string()))
            }

            (Value::Int(i), ValueType::Bool) => Some(Value::Bool(*i != 0)),
            (Value::Int(i), ValueType::Float) => Some(Value::Float(*i as f32)),
            (Value::Int(i), ValueType::String) => Some(Value::String(i.to_string())),

            (Value::Float(f), ValueType::Bool) => Some(Value::Bool(*f != 0.0)),
            (Value::Float(f), ValueType::Int) => Some(Value::Int(*f as i32)),
            (Value::Float(f), ValueType::String) => Some(Value::String(f.to_string())),

            (Value::String(s), ValueType::Int) => s.trim().parse::<i32>().ok().map(Value::Int),
            (Value::String(s), ValueType::Float) => {
                s.trim().parse::<f32>().ok().map(Value::Float)
            }

            (Value::List(l), ValueType::Int) => {
                Some(Value::Int(l.max_item().map_or(0, |(_, v)| v)))
            }
            (Value::List(l), ValueType::Float) => {
                Some(Value::Float(l.max_item().map_or(0.0, |(_, v)| v as f32)))
            }
            (Value::List(l), ValueType::String) => Some(Value::String(
                l.max_item()
                    .map(|(item, _)| item.full_name())
                    .unwrap_or_default(),
            )),
            _ => None,
        };

        cast.ok_or_else(|| {
            RuntimeError::story(format!(
                "Can't cast {} from {:?} to {:?}",
                self,
                self.value_type(),
                to
            ))
        })
    }
}

impl Value {
    /// An empty list assigned over a list keeps the old list's origins, so that later
    /// `LIST_ALL` or increments still know which definitions it belongs to.
    pub(crate) fn retain_list_origins(&mut self, old: &Value) {
        if let (Value::List(old), Value::List(new)) = (old, self) {
            if new.is_empty() {
                new.set_initial_origin_names(Some(old.origin_names()));
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::List(l) => write!(f, "{}", l),
            Value::DivertTarget(p) => write!(f, "DivertTargetValue({})", p),
            Value::VariablePointer { name, .. } => write!(f, "VariablePointerValue({})", name),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<InkList> for Value {
    fn from(v: InkList) -> Self {
        Value::List(v)
    }
}

pub(crate) fn is_newline(s: &str) -> bool {
    s == "\n"
}

/// Spaces and tabs only. The empty string counts.
pub(crate) fn is_inline_whitespace(s: &str) -> bool {
    s.chars().all(|c| c == ' ' || c == '\t')
}

pub(crate) fn is_non_whitespace(s: &str) -> bool {
    !is_newline(s) && !is_inline_whitespace(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts() {
        assert_eq!(Value::Bool(true).cast(ValueType::Int).unwrap(), Value::Int(1));
        assert_eq!(Value::Float(2.7).cast(ValueType::Int).unwrap(), Value::Int(2));
        assert_eq!(
            Value::Int(5).cast(ValueType::String).unwrap(),
            Value::String("5".into())
        );
        assert_eq!(
            Value::String("12".into()).cast(ValueType::Int).unwrap(),
            Value::Int(12)
        );
        assert!(Value::String("x".into()).cast(ValueType::Int).is_err());
        assert!(Value::DivertTarget(Path::default())
            .cast(ValueType::Int)
            .is_err());
    }

    #[test]
    fn divert_target_truthiness_is_an_error() {
        let target = Value::DivertTarget("knot".parse().unwrap());
        assert!(matches!(target.is_truthy(), Err(RuntimeError::Story(_))));
        assert!(!Value::String(String::new()).is_truthy().unwrap());
    }

    #[test]
    fn whitespace_classes() {
        assert!(is_inline_whitespace(" \t "));
        assert!(is_inline_whitespace(""));
        assert!(!is_non_whitespace("\n"));
        assert!(is_non_whitespace(" a "));
    }
}
