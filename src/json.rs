//! Conversion between the compiled JSON bytecode / save documents and the in-memory model.

mod read;
mod write;

pub use self::read::*;
pub use self::write::*;

/// Bytecode format version this engine writes.
pub const INK_VERSION_CURRENT: i64 = 21;
/// Oldest bytecode format version that can still be loaded.
pub const INK_VERSION_MINIMUM_COMPATIBLE: i64 = 18;

/// Save document version this engine writes.
pub const INK_SAVE_STATE_VERSION: i64 = 10;
/// Oldest save document version that can still be loaded.
pub const MIN_COMPATIBLE_LOAD_VERSION: i64 = 8;
