use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// Tool response envelope. The JSON payload for each tool is double-encoded
/// in `content`; clients parse it out of the text block.
#[derive(Debug, Serialize)]
pub struct ShellToolResponse {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ShellMetadata,
}

#[derive(Debug, Serialize)]
pub struct ShellMetadata {
    pub tool_name: String,
    pub session: String,
    pub duration_seconds: f64,
}

impl ShellToolResponse {
    pub fn success(content: String, metadata: ShellMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    pub fn error(message: String, metadata: ShellMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    /// Convert to MCP CallToolResult.
    /// Always returns success at the MCP transport level so a failed command
    /// doesn't cascade into sibling tool-call aborts on the client side.
    /// Error info lives in the JSON payload (`"status": "error"`).
    pub fn into_call_tool_result(self) -> CallToolResult {
        // Clamp non-finite f64 values before serialization to avoid a
        // serde_json panic.
        let safe = ShellToolResponse {
            status: self.status,
            content: self.content,
            content_type: self.content_type,
            metadata: ShellMetadata {
                tool_name: self.metadata.tool_name,
                session: self.metadata.session,
                duration_seconds: clamp_finite(self.metadata.duration_seconds),
            },
        };
        match serde_json::to_string(&safe) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::success(vec![Content::text(format!(
                r#"{{"status":"error","content":"serialization failed: {e}","content_type":"text","metadata":{{}}}}"#
            ))]),
        }
    }
}

/// Clamp non-finite f64 to 0.0 for safe JSON serialization.
fn clamp_finite(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}
