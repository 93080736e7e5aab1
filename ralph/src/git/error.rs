//! C3's error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("no staged changes to commit")]
    NoChangesToCommit,

    #[error("on branch {current_branch}, expected {expected_branch}, and the working tree is dirty")]
    BranchMismatch { current_branch: String, expected_branch: String },

    #[error("git {args} failed (exit {exit_code}): {stderr}")]
    ShellFailure { args: String, exit_code: i32, stderr: String },

    #[error("{directory} is not a git repository")]
    NotAGitRepo { directory: String },

    #[error("worktree not found at {path}")]
    WorktreeNotFound { path: String },

    #[error("command executor error: {0}")]
    Command(#[from] crate::command::CommandError),
}

impl GitError {
    pub fn shell_failure(args: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        GitError::ShellFailure { args: args.into(), exit_code, stderr: stderr.into() }
    }
}
