//! The one concrete [`CommandExecutor`]: local `tokio::process::Command`
//! plus `tokio::fs`. This is the executor the crate ships so `GitService`
//! is exercisable end-to-end; swapping it for a sandboxed/remote one only
//! requires a new impl of the trait.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::executor::{normalize_line_endings, CommandError, CommandExecutor, CommandOutput};

#[derive(Debug, Clone, Default)]
pub struct LocalCommandExecutor;

impl LocalCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for LocalCommandExecutor {
    async fn exec(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, CommandError> {
        debug!(program, ?args, cwd = %cwd.display(), "exec: called");
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|source| CommandError::Spawn { program: program.to_string(), source })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: normalize_line_endings(&String::from_utf8_lossy(&output.stdout)),
            stderr: normalize_line_endings(&String::from_utf8_lossy(&output.stderr)),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|meta| meta.is_file()).unwrap_or(false)
    }

    async fn directory_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|meta| meta.is_dir()).unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> Result<String, CommandError> {
        tokio::fs::read_to_string(path)
            .await
            .map(|s| normalize_line_endings(&s))
            .map_err(|source| CommandError::Io { path: path.display().to_string(), source })
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<(), CommandError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CommandError::Io { path: parent.display().to_string(), source })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|source| CommandError::Io { path: path.display().to_string(), source })
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<String>, CommandError> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|source| CommandError::Io { path: path.display().to_string(), source })?;
        let mut names = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|source| CommandError::Io { path: path.display().to_string(), source })?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn remove_file(&self, path: &Path) -> Result<(), CommandError> {
        tokio::fs::remove_file(path).await.map_err(|source| CommandError::Io { path: path.display().to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_echo_reports_success_and_stdout() {
        let executor = LocalCommandExecutor::new();
        let output = executor.exec("echo", &["hello"], Path::new(".")).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalCommandExecutor::new();
        let file = dir.path().join("nested").join("note.txt");
        executor.write_file(&file, "hello world").await.unwrap();
        assert!(executor.file_exists(&file).await);
        let content = executor.read_file(&file).await.unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn list_directory_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalCommandExecutor::new();
        executor.write_file(&dir.path().join("b.txt"), "").await.unwrap();
        executor.write_file(&dir.path().join("a.txt"), "").await.unwrap();
        let names = executor.list_directory(dir.path()).await.unwrap();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn remove_file_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalCommandExecutor::new();
        let file = dir.path().join("gone.txt");
        executor.write_file(&file, "bye").await.unwrap();
        executor.remove_file(&file).await.unwrap();
        assert!(!executor.file_exists(&file).await);
    }
}
