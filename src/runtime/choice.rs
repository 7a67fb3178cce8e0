#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::format::Path;

use super::Thread;

/// An option presented to the player.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Choice {
    pub text: String,
    /// Position among the currently visible choices.
    pub index: usize,
    /// Path of the choice point that generated this choice.
    pub source_path: String,
    pub target_path: Path,
    pub tags: Vec<String>,
    pub is_invisible_default: bool,
    pub original_thread_index: i32,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub(crate) thread_at_generation: Option<Thread>,
}

impl Choice {
    pub fn path_string_on_choice(&self) -> String {
        self.target_path.to_string()
    }
}
