pub mod error;
pub mod format;
pub mod json;
pub mod parser;
pub mod random;
pub mod result;
pub mod runtime;
