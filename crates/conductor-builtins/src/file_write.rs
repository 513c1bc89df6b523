use async_trait::async_trait;
use conductor_core::{ConductorResult, Params, ToolResult};
use conductor_tools::{Tool, ToolDescriptor};
use std::path::Path;
use tracing::info;

const MAX_WRITE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Writes text content to a file.
///
/// Non-string `content` values are written as their JSON text, so a chain can
/// feed a structured step result straight into a file.
pub struct FileWriteTool {
    descriptor: ToolDescriptor,
}

impl FileWriteTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "file_write".to_string(),
                description: "Write content to a file.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to the file to write"
                        },
                        "content": {
                            "description": "Content to write; non-strings are written as JSON"
                        },
                        "append": {
                            "type": "boolean",
                            "description": "Append to file instead of overwriting (default: false)"
                        },
                        "create_dirs": {
                            "type": "boolean",
                            "description": "Create parent directories if they don't exist (default: false)"
                        }
                    },
                    "required": ["path", "content"]
                }),
            },
        }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileWriteTool {
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

        let content = match params.get("content") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let append = params
            .get("append")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let create_dirs = params
            .get("create_dirs")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if content.len() > MAX_WRITE_SIZE {
            return Ok(ToolResult::failure(format!(
                "Content too large: {} bytes (max: {MAX_WRITE_SIZE} bytes)",
                content.len()
            )));
        }

        let path = Path::new(path_str);

        if create_dirs {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolResult::failure(format!(
                        "Failed to create directories for '{path_str}': {e}"
                    )));
                }
            }
        }

        let written = if append {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
            {
                Ok(mut file) => file.write_all(content.as_bytes()).await,
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(path, content.as_bytes()).await
        };

        if let Err(e) = written {
            return Ok(ToolResult::failure(format!(
                "Failed to write '{path_str}': {e}"
            )));
        }

        info!(path = %path.display(), bytes = content.len(), append, "Wrote file");

        Ok(ToolResult::success(serde_json::json!({
            "path": path_str,
            "bytes_written": content.len(),
            "append": append,
        })))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_write_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested/out.txt");
        let tool = FileWriteTool::new();

        let result = tool
            .execute(params(serde_json::json!({
                "path": file.to_string_lossy(),
                "content": "hello",
                "create_dirs": true
            })))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);

        tool.execute(params(serde_json::json!({
            "path": file.to_string_lossy(),
            "content": " world",
            "append": true
        })))
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_structured_content_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");

        FileWriteTool::new()
            .execute(params(serde_json::json!({
                "path": file.to_string_lossy(),
                "content": {"a": 1}
            })))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing/out.txt");
        let result = FileWriteTool::new()
            .execute(params(serde_json::json!({
                "path": file.to_string_lossy(),
                "content": "x"
            })))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error_message().contains("Failed to write"));
    }
}
