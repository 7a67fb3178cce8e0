#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::format::Value;

use super::Choice;

/// Severity passed to the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ErrorType {
    Warning,
    Error,
}

pub type ErrorHandler = Box<dyn Fn(&str, ErrorType) + Send + Sync>;

pub type VariableObserver = Box<dyn FnMut(&str, &Value) + Send>;

pub type OnDidContinueHandler = Box<dyn FnMut() + Send>;

pub type OnMakeChoiceHandler = Box<dyn FnMut(&Choice) + Send>;

/// A host function the story can call through an `EXTERNAL` declaration.
///
/// Returning `Ok(None)` pushes void, which is what a function with no return value produces.
pub trait ExternalFunction: Send {
    fn call(&mut self, args: &[Value]) -> anyhow::Result<Option<Value>>;
}

impl<F> ExternalFunction for F
where
    F: FnMut(&[Value]) -> anyhow::Result<Option<Value>> + Send,
{
    fn call(&mut self, args: &[Value]) -> anyhow::Result<Option<Value>> {
        self(args)
    }
}

pub(crate) struct ExternalBinding {
    pub function: Box<dyn ExternalFunction>,
    pub lookahead_safe: bool,
}

/// Handle returned by `Story::observe_variable`, used to remove the observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);
