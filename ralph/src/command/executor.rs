//! C2: the shell/filesystem seam `GitService` and the planning-folder logic
//! run through, so tests can substitute a fake instead of shelling out.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
    #[error("io error on {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Normalises `\r\n` to `\n` in captured stdout. Implementations must do
/// this themselves — downstream git parsers (`getChangedFiles`, `getDiff`)
/// assume bare `\n` and a pseudo-terminal-backed executor would otherwise
/// desync them (L2).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, CommandError>;

    async fn file_exists(&self, path: &Path) -> bool;

    async fn directory_exists(&self, path: &Path) -> bool;

    async fn read_file(&self, path: &Path) -> Result<String, CommandError>;

    async fn write_file(&self, path: &Path, content: &str) -> Result<(), CommandError>;

    async fn list_directory(&self, path: &Path) -> Result<Vec<String>, CommandError>;

    async fn remove_file(&self, path: &Path) -> Result<(), CommandError>;
}

pub fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_crlf_only() {
        assert_eq!(normalize_line_endings("a\r\nb\nc\r\n"), "a\nb\nc\n");
    }
}
