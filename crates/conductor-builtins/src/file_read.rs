use async_trait::async_trait;
use conductor_core::{ConductorResult, Params, ToolResult};
use conductor_tools::{Tool, ToolDescriptor};
use std::path::Path;
use tracing::info;

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// Reads a UTF-8 text file.
pub struct FileReadTool {
    descriptor: ToolDescriptor,
}

impl FileReadTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "file_read".to_string(),
                description: "Read the contents of a text file.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to the file to read"
                        },
                        "offset": {
                            "type": "integer",
                            "description": "Byte offset to start reading from (default: 0)"
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Maximum bytes to read (default: entire file)"
                        }
                    },
                    "required": ["path"]
                }),
            },
        }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, params: Params) -> ConductorResult<ToolResult> {
        let path_str = params
            .get("path")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        if path_str.is_empty() {
            return Ok(ToolResult::failure("Empty path"));
        }

        let path = Path::new(path_str);
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                return Ok(ToolResult::failure(format!(
                    "Cannot read metadata for '{path_str}': {e}"
                )));
            }
        };

        if !metadata.is_file() {
            return Ok(ToolResult::failure(format!("'{path_str}' is not a file")));
        }

        if metadata.len() > MAX_FILE_SIZE {
            return Ok(ToolResult::failure(format!(
                "File too large: {} bytes (max: {MAX_FILE_SIZE} bytes)",
                metadata.len()
            )));
        }

        info!(path = %path.display(), size = metadata.len(), "Reading file");

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolResult::failure(format!(
                    "Failed to read '{path_str}': {e}"
                )));
            }
        };

        let offset = params
            .get("offset")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map_or(content.len(), |l| l as usize);

        let slice = content
            .get(offset.min(content.len())..content.len().min(offset.saturating_add(limit)))
            .unwrap_or("");

        Ok(ToolResult::success(serde_json::json!({
            "path": path_str,
            "size": metadata.len(),
            "content": slice,
        })))
    }
}
