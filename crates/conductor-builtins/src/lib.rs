//! Built-in tools for the Conductor engine.
//!
//! # Main entry points
//!
//! - [`register_builtins()`] — Register the standard set of built-in tools.

/// Echo tool.
pub mod echo;
/// File read tool.
pub mod file_read;
/// File write tool.
pub mod file_write;

pub use echo::EchoTool;
pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;

use conductor_tools::ToolRegistry;
use std::sync::Arc;

/// Register `echo`, `file_read` and `file_write` into `registry`.
pub fn register_builtins(registry: &mut ToolRegistry) {
    registry.register(Arc::new(EchoTool::new()));
    registry.register(Arc::new(FileReadTool::new()));
    registry.register(Arc::new(FileWriteTool::new()));
}
