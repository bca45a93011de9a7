//! minicil - a small managed-code execution engine
//!
//! Loads a program image (types, fields, methods with CIL-style IL bodies),
//! decodes and interprets the IL on a stack machine, and manages objects on
//! a generational heap.

pub mod config;
pub mod error;
pub mod il;
pub mod metadata;
pub mod program;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{Fault, VmError};
pub use metadata::{MetadataProvider, ProgramImage, Token};
pub use program::LoadedProgram;
pub use vm::{Value, Vm};
