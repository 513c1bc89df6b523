//! Tool abstraction and registry.
//!
//! Tools are registered once at startup and invoked by name from pipelines and
//! chains through the [`conductor_core::ToolExecutor`] interface.

/// Name-keyed tool registry.
pub mod registry;
/// The `Tool` trait and its descriptor.
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolDescriptor};
