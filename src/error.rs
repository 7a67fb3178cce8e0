use thiserror::Error;

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A narrative-logic failure raised while stepping. `Continue` records it and ends the flow.
    #[error("{0}")]
    Story(String),
    /// Internal invariant broken, usually by malformed bytecode.
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("ink version number not found. Are you sure it's a valid .ink.json file?")]
    MissingVersion,
    #[error("Version of ink used to build story ({found}) was newer than the current version of the engine ({current})")]
    VersionTooNew { found: i64, current: i64 },
    #[error("Version of ink used to build story ({found}) is too old to be loaded by this version of the engine (minimum {minimum})")]
    VersionTooOld { found: i64, minimum: i64 },
    #[error("Root node for ink not found. Are you sure it's a valid .ink.json file?")]
    MissingRoot,
    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(String),
    #[error("ink save format incorrect, can't load.")]
    InvalidSaveFormat,
    #[error("Ink save format isn't compatible with the current version (saw '{found}', but minimum is {minimum}), so can't load.")]
    IncompatibleSaveVersion { found: i64, minimum: i64 },

    #[error("Can't continue - should check can_continue before calling continue_story")]
    CannotContinue,
    #[error("Can't {0}. Story is in the middle of a continue_async(). Make more continue_async() calls or a single continue_story() call beforehand.")]
    AsyncContinueActive(String),
    #[error("{0}")]
    InvalidOperation(String),
    /// Errors and warnings collected during a `Continue` while no error handler was registered.
    #[error("{0}")]
    Unhandled(String),

    #[error("Path parse error: {0}")]
    PathParse(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl RuntimeError {
    pub(crate) fn story(message: impl Into<String>) -> Self {
        RuntimeError::Story(message.into())
    }

    pub(crate) fn assertion(message: impl Into<String>) -> Self {
        RuntimeError::Assertion(message.into())
    }

    pub(crate) fn bytecode(message: impl Into<String>) -> Self {
        RuntimeError::InvalidBytecode(message.into())
    }
}
