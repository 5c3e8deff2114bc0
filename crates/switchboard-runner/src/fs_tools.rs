//! Sandboxed file built-ins.
//!
//! Five operations (`read_text`, `write_text`, `list_dir`, `move`,
//! `delete`) confined to the configured sandbox root. Paths are relative,
//! normalized component-wise, and may never escape the root; reads are
//! byte-capped. Failures come back as tool-level errors in the result, so
//! the model can recover like with any other tool.

use std::path::{Component, Path, PathBuf};

use serde_json::{json, Value};
use switchboard_protocol::{CallToolResult, ToolContent};

use crate::catalog::{ToolDescriptor, FS_SERVER};

/// Cap for `write_text` payloads.
const MAX_WRITE_BYTES: u64 = 1024 * 1024;

/// The sandbox.
#[derive(Debug, Clone)]
pub struct FsTools {
    root: PathBuf,
    max_read_bytes: u64,
}

impl FsTools {
    /// Sandbox rooted at `root`, reads capped at `max_read_bytes`.
    pub fn new(root: impl Into<PathBuf>, max_read_bytes: u64) -> Self {
        Self { root: root.into(), max_read_bytes: max_read_bytes.max(1) }
    }

    /// The five operation names.
    pub fn operations() -> &'static [&'static str] {
        &["read_text", "write_text", "list_dir", "move", "delete"]
    }

    /// Catalog descriptors for the built-ins.
    pub fn descriptors() -> Vec<ToolDescriptor> {
        let path_schema = |extra: &[(&str, Value)]| {
            let mut properties = serde_json::Map::new();
            properties.insert(
                "path".to_owned(),
                json!({"type": "string", "description": "path relative to the sandbox root"}),
            );
            for (key, schema) in extra {
                properties.insert((*key).to_owned(), schema.clone());
            }
            json!({"type": "object", "properties": properties, "required": ["path"]})
        };

        let entries: [(&str, &str, Value); 5] = [
            ("read_text", "Read a UTF-8 text file", path_schema(&[])),
            (
                "write_text",
                "Write a UTF-8 text file, creating parent directories",
                path_schema(&[("content", json!({"type": "string"}))]),
            ),
            ("list_dir", "List a directory", path_schema(&[])),
            (
                "move",
                "Rename a file or directory",
                json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    },
                    "required": ["from", "to"]
                }),
            ),
            ("delete", "Delete a file or empty directory", path_schema(&[])),
        ];

        entries
            .into_iter()
            .map(|(op, description, schema)| ToolDescriptor {
                canonical_name: format!("fs__{op}"),
                server: FS_SERVER.to_owned(),
                local_name: op.to_owned(),
                description: Some(description.to_owned()),
                arg_schema: schema,
                category: Some("files".to_owned()),
                core: true,
            })
            .collect()
    }

    /// Execute one operation. Failures are tool-level: they land in the
    /// result with `is_error` set, never abort the loop.
    pub async fn execute(&self, op: &str, args: &Value) -> CallToolResult {
        let outcome = match op {
            "read_text" => self.read_text(args).await,
            "write_text" => self.write_text(args).await,
            "list_dir" => self.list_dir(args).await,
            "move" => self.rename(args).await,
            "delete" => self.delete(args).await,
            other => Err(format!("unknown file operation '{other}'")),
        };
        match outcome {
            Ok(text) => CallToolResult { content: vec![ToolContent::text(text)], is_error: false },
            Err(message) => {
                CallToolResult { content: vec![ToolContent::text(message)], is_error: true }
            }
        }
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            return Err(format!("absolute paths are not allowed: '{raw}'"));
        }
        let mut depth: i32 = 0;
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    depth += 1;
                    normalized.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("path escapes the sandbox: '{raw}'"));
                    }
                    normalized.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("absolute paths are not allowed: '{raw}'"));
                }
            }
        }
        Ok(self.root.join(normalized))
    }

    fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
        args.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("missing string argument '{key}'"))
    }

    async fn read_text(&self, args: &Value) -> Result<String, String> {
        let path = self.resolve(Self::arg_str(args, "path")?)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
        if !metadata.is_file() {
            return Err(format!("'{}' is not a file", path.display()));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
        let total = bytes.len() as u64;
        let capped = total > self.max_read_bytes;
        let slice = if capped { &bytes[..self.max_read_bytes as usize] } else { &bytes[..] };
        let mut text = String::from_utf8_lossy(slice).into_owned();
        if capped {
            text.push_str(&format!("\n…[truncated {total} bytes to {}]", self.max_read_bytes));
        }
        Ok(text)
    }

    async fn write_text(&self, args: &Value) -> Result<String, String> {
        let path = self.resolve(Self::arg_str(args, "path")?)?;
        let content = Self::arg_str(args, "content")?;
        if content.len() as u64 > MAX_WRITE_BYTES {
            return Err(format!(
                "content is {} bytes, over the {MAX_WRITE_BYTES} byte limit",
                content.len()
            ));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create '{}': {e}", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| format!("cannot write '{}': {e}", path.display()))?;
        Ok(format!("wrote {} bytes", content.len()))
    }

    async fn list_dir(&self, args: &Value) -> Result<String, String> {
        let path = self.resolve(Self::arg_str(args, "path")?)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("cannot list '{}': {e}", path.display()))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| format!("cannot list '{}': {e}", path.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            Ok("(empty)".to_owned())
        } else {
            Ok(entries.join("\n"))
        }
    }

    async fn rename(&self, args: &Value) -> Result<String, String> {
        let from = self.resolve(Self::arg_str(args, "from")?)?;
        let to = self.resolve(Self::arg_str(args, "to")?)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create '{}': {e}", parent.display()))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| format!("cannot move '{}': {e}", from.display()))?;
        Ok("moved".to_owned())
    }

    async fn delete(&self, args: &Value) -> Result<String, String> {
        let path = self.resolve(Self::arg_str(args, "path")?)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| format!("cannot delete '{}': {e}", path.display()))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir(&path)
                .await
                .map_err(|e| format!("cannot delete '{}': {e}", path.display()))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| format!("cannot delete '{}': {e}", path.display()))?;
        }
        Ok("deleted".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sandbox(max_read: u64) -> (tempfile::TempDir, FsTools) {
        let dir = tempfile::tempdir().unwrap();
        let tools = FsTools::new(dir.path(), max_read);
        (dir, tools)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, tools) = sandbox(1024);
        let write = tools
            .execute("write_text", &json!({"path": "notes/today.txt", "content": "hello"}))
            .await;
        assert!(!write.is_error);

        let read = tools.execute("read_text", &json!({"path": "notes/today.txt"})).await;
        assert!(!read.is_error);
        assert_eq!(read.joined_text(), "hello");
    }

    #[tokio::test]
    async fn traversal_cannot_escape_the_root() {
        let (_dir, tools) = sandbox(1024);
        for path in ["../outside.txt", "a/../../outside.txt", "/etc/passwd"] {
            let result = tools.execute("read_text", &json!({"path": path})).await;
            assert!(result.is_error, "path '{path}' must be rejected");
        }
        // Redundant but contained traversal is fine.
        let write = tools
            .execute("write_text", &json!({"path": "a/b/../c.txt", "content": "x"}))
            .await;
        assert!(!write.is_error);
    }

    #[tokio::test]
    async fn oversized_reads_are_truncated_with_a_marker() {
        let (_dir, tools) = sandbox(10);
        tools
            .execute("write_text", &json!({"path": "big.txt", "content": "0123456789ABCDEF"}))
            .await;
        let read = tools.execute("read_text", &json!({"path": "big.txt"})).await;
        assert!(!read.is_error);
        let text = read.joined_text();
        assert!(text.starts_with("0123456789"));
        assert!(text.contains("truncated"));
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let (_dir, tools) = sandbox(1024);
        tools.execute("write_text", &json!({"path": "d/file.txt", "content": "x"})).await;
        tools.execute("write_text", &json!({"path": "top.txt", "content": "x"})).await;

        let listing = tools.execute("list_dir", &json!({"path": ""})).await;
        assert_eq!(listing.joined_text(), "d/\ntop.txt");
    }

    #[tokio::test]
    async fn move_and_delete() {
        let (_dir, tools) = sandbox(1024);
        tools.execute("write_text", &json!({"path": "a.txt", "content": "x"})).await;

        let moved = tools.execute("move", &json!({"from": "a.txt", "to": "b/c.txt"})).await;
        assert!(!moved.is_error);

        let gone = tools.execute("read_text", &json!({"path": "a.txt"})).await;
        assert!(gone.is_error);

        let deleted = tools.execute("delete", &json!({"path": "b/c.txt"})).await;
        assert!(!deleted.is_error);
        // Non-empty directories are refused.
        tools.execute("write_text", &json!({"path": "b/d.txt", "content": "x"})).await;
        let refused = tools.execute("delete", &json!({"path": "b"})).await;
        assert!(refused.is_error);
    }

    #[tokio::test]
    async fn unknown_operation_is_a_tool_error() {
        let (_dir, tools) = sandbox(1024);
        let result = tools.execute("chmod", &json!({"path": "x"})).await;
        assert!(result.is_error);
    }

    #[test]
    fn descriptors_cover_all_operations() {
        let descriptors = FsTools::descriptors();
        let names: Vec<_> = descriptors.iter().map(|d| d.canonical_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["fs__read_text", "fs__write_text", "fs__list_dir", "fs__move", "fs__delete"]
        );
        assert!(descriptors.iter().all(|d| d.core));
    }
}
