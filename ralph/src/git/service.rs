//! C3: every git operation the engine needs, expressed as plain
//! `directory`-scoped functions over [`CommandExecutor`]. The service holds
//! no directory state of its own — a single instance is shared across every
//! live loop, each of which passes its own worktree path in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::CommandExecutor;

use super::error::GitError;

const WORKTREES_EXCLUDE_ENTRY: &str = ".ralph-worktrees";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub sha: String,
    pub message: String,
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
    pub additions: u32,
    pub deletions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub already_up_to_date: bool,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicted_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

pub struct GitService {
    executor: Arc<dyn CommandExecutor>,
}

impl GitService {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<(bool, String, String), GitError> {
        let output = self.executor.exec("git", args, dir).await?;
        Ok((output.success, output.stdout, output.stderr))
    }

    async fn run_ok(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.executor.exec("git", args, dir).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(GitError::shell_failure(args.join(" "), output.exit_code, output.stderr))
        }
    }

    pub async fn is_git_repo(&self, dir: &Path) -> bool {
        debug!(dir = %dir.display(), "is_git_repo: called");
        matches!(self.run(dir, &["rev-parse", "--git-dir"]).await, Ok((true, _, _)))
    }

    pub async fn get_current_branch(&self, dir: &Path) -> Result<String, GitError> {
        debug!(dir = %dir.display(), "get_current_branch: called");
        let (success, stdout, _) = self.run(dir, &["branch", "--show-current"]).await?;
        let name = stdout.trim().to_string();
        if success && !name.is_empty() {
            return Ok(name);
        }
        // Empty repo or detached HEAD: fall back to the symbolic ref so an
        // unborn branch still reports a notional name (B4).
        let (_, symref, _) = self.run(dir, &["symbolic-ref", "--short", "HEAD"]).await?;
        let name = symref.trim();
        if name.is_empty() {
            Ok("main".to_string())
        } else {
            Ok(name.to_string())
        }
    }

    pub async fn get_local_branches(&self, dir: &Path) -> Result<Vec<BranchInfo>, GitError> {
        debug!(dir = %dir.display(), "get_local_branches: called");
        let (success, stdout, _) = self.run(dir, &["branch", "--list"]).await?;
        if !success || stdout.trim().is_empty() {
            let current = self.get_current_branch(dir).await?;
            return Ok(vec![BranchInfo { name: current, current: true }]);
        }
        let mut branches: Vec<BranchInfo> = stdout
            .lines()
            .filter_map(|line| {
                let current = line.starts_with('*');
                let name = line.trim_start_matches('*').trim();
                if name.is_empty() {
                    None
                } else {
                    Some(BranchInfo { name: name.to_string(), current })
                }
            })
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    pub async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool, GitError> {
        let (_, stdout, _) = self.run(dir, &["status", "--porcelain"]).await?;
        Ok(!stdout.trim().is_empty())
    }

    pub async fn get_changed_files(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let (_, stdout, _) = self.run(dir, &["status", "--porcelain"]).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                // porcelain codes occupy the first two columns; a rename
                // reports "R  old -> new" and we want the destination path.
                let rest = line.get(3..).unwrap_or(line).trim();
                match rest.split_once(" -> ") {
                    Some((_, dest)) => dest.to_string(),
                    None => rest.to_string(),
                }
            })
            .collect())
    }

    pub async fn create_branch(&self, dir: &Path, name: &str) -> Result<(), GitError> {
        self.run_ok(dir, &["branch", name]).await.map(|_| ())
    }

    pub async fn checkout_branch(&self, dir: &Path, name: &str) -> Result<(), GitError> {
        self.run_ok(dir, &["checkout", name]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, dir: &Path, name: &str) -> Result<(), GitError> {
        self.run_ok(dir, &["branch", "-D", name]).await.map(|_| ())
    }

    pub async fn branch_exists(&self, dir: &Path, name: &str) -> Result<bool, GitError> {
        let (success, _, _) =
            self.run(dir, &["show-ref", "--verify", "--quiet", &format!("refs/heads/{name}")]).await?;
        Ok(success)
    }

    pub async fn stage_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(dir, &["add", "-A"]).await.map(|_| ())
    }

    async fn ensure_branch(&self, dir: &Path, expected_branch: &str) -> Result<(), GitError> {
        let current = self.get_current_branch(dir).await?;
        if current == expected_branch {
            return Ok(());
        }
        if self.has_uncommitted_changes(dir).await? {
            return Err(GitError::BranchMismatch {
                current_branch: current,
                expected_branch: expected_branch.to_string(),
            });
        }
        self.checkout_branch(dir, expected_branch).await
    }

    pub async fn commit(
        &self,
        dir: &Path,
        message: &str,
        expected_branch: Option<&str>,
    ) -> Result<CommitOutcome, GitError> {
        debug!(dir = %dir.display(), "commit: called");
        if let Some(expected) = expected_branch {
            self.ensure_branch(dir, expected).await?;
        }
        let (_, staged, _) = self.run(dir, &["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Err(GitError::NoChangesToCommit);
        }
        self.run_ok(dir, &["commit", "-m", message]).await?;
        let sha = self.run_ok(dir, &["rev-parse", "HEAD"]).await?.trim().to_string();
        let files_changed = staged.lines().map(str::to_string).collect();
        info!(%sha, dir = %dir.display(), "commit: created");
        Ok(CommitOutcome { sha, message: message.to_string(), files_changed })
    }

    pub async fn reset_hard(&self, dir: &Path, expected_branch: Option<&str>) -> Result<(), GitError> {
        if let Some(expected) = expected_branch {
            let current = self.get_current_branch(dir).await?;
            if current != expected {
                self.run_ok(dir, &["checkout", "-f", expected]).await?;
            }
        }
        self.run_ok(dir, &["reset", "--hard"]).await?;
        self.run_ok(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    pub async fn stash(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(dir, &["stash"]).await.map(|_| ())
    }

    pub async fn stash_pop(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(dir, &["stash", "pop"]).await.map(|_| ())
    }

    /// fetch + `merge --ff-only`, never plain `git pull` — a failure this
    /// way leaves the working tree exactly as it was.
    pub async fn pull(&self, dir: &Path, branch: Option<&str>, remote: &str) -> Result<bool, GitError> {
        debug!(dir = %dir.display(), remote, "pull: called");
        let (fetch_ok, _, fetch_err) = self.run(dir, &["fetch", remote]).await?;
        if !fetch_ok {
            warn!(dir = %dir.display(), stderr = %fetch_err, "pull: fetch failed, no remote or network");
            return Ok(false);
        }
        let branch_name = match branch {
            Some(b) => b.to_string(),
            None => self.get_current_branch(dir).await?,
        };
        let remote_ref = format!("{remote}/{branch_name}");
        let (has_upstream, _, _) = self.run(dir, &["rev-parse", "--verify", &remote_ref]).await?;
        if !has_upstream {
            return Ok(false);
        }
        let (merge_ok, _, merge_err) = self.run(dir, &["merge", "--ff-only", &remote_ref]).await?;
        if !merge_ok {
            warn!(dir = %dir.display(), stderr = %merge_err, "pull: not fast-forwardable");
        }
        Ok(merge_ok)
    }

    pub async fn push_branch(&self, dir: &Path, branch: &str, remote: &str) -> Result<String, GitError> {
        self.run_ok(dir, &["push", "-u", remote, branch]).await?;
        Ok(format!("{remote}/{branch}"))
    }

    /// Updates `<remote>/<branch>` refs without touching the working tree or
    /// the current branch, unlike [`Self::pull`] which also fast-forwards.
    pub async fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError> {
        self.run_ok(dir, &["fetch", remote]).await.map(|_| ())
    }

    pub async fn get_diff(&self, dir: &Path, base: &str) -> Result<Vec<DiffEntry>, GitError> {
        let (_, numstat, _) = self.run(dir, &["diff", "--numstat", base]).await?;
        let (_, name_status, _) = self.run(dir, &["diff", "--name-status", base]).await?;

        let mut statuses = std::collections::HashMap::new();
        for line in name_status.lines() {
            let mut parts = line.split_whitespace();
            if let Some(code) = parts.next() {
                let status = match code.chars().next() {
                    Some('A') => DiffStatus::Added,
                    Some('D') => DiffStatus::Deleted,
                    Some('R') => DiffStatus::Renamed,
                    _ => DiffStatus::Modified,
                };
                if let Some(path) = parts.last() {
                    statuses.insert(path.to_string(), status);
                }
            }
        }

        let mut entries = Vec::new();
        for line in numstat.lines() {
            let mut parts = line.split_whitespace();
            let additions = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let deletions = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if let Some(path) = parts.next() {
                let status = statuses.get(path).copied().unwrap_or(DiffStatus::Modified);
                entries.push(DiffEntry { path: path.to_string(), status, additions, deletions, patch: None });
            }
        }
        Ok(entries)
    }

    pub async fn get_diff_with_content(&self, dir: &Path, base: &str) -> Result<Vec<DiffEntry>, GitError> {
        let mut entries = self.get_diff(dir, base).await?;
        let (_, full_patch, _) = self.run(dir, &["diff", base]).await?;
        for entry in entries.iter_mut() {
            entry.patch = extract_file_patch(&full_patch, &entry.path);
        }
        Ok(entries)
    }

    pub async fn get_diff_summary(&self, dir: &Path, base: &str) -> Result<(u32, u32, u32), GitError> {
        let entries = self.get_diff(dir, base).await?;
        let files = entries.len() as u32;
        let additions = entries.iter().map(|e| e.additions).sum();
        let deletions = entries.iter().map(|e| e.deletions).sum();
        Ok((files, additions, deletions))
    }

    pub async fn get_file_diff_content(&self, dir: &Path, base: &str, path: &str) -> Result<String, GitError> {
        self.run_ok(dir, &["diff", base, "--", path]).await
    }

    pub async fn get_default_branch(&self, dir: &Path) -> Result<String, GitError> {
        let (ok, stdout, _) = self.run(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await?;
        if ok {
            if let Some(name) = stdout.trim().rsplit('/').next() {
                return Ok(name.to_string());
            }
        }
        if self.branch_exists(dir, "main").await? {
            return Ok("main".to_string());
        }
        if self.branch_exists(dir, "master").await? {
            return Ok("master".to_string());
        }
        self.get_current_branch(dir).await
    }

    pub async fn is_ancestor(&self, dir: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let (success, _, _) = self.run(dir, &["merge-base", "--is-ancestor", ancestor, descendant]).await?;
        Ok(success)
    }

    pub async fn merge_with_conflict_detection(
        &self,
        dir: &Path,
        source: &str,
        commit_message: Option<&str>,
    ) -> Result<MergeOutcome, GitError> {
        debug!(dir = %dir.display(), source, "merge_with_conflict_detection: called");
        let mut args = vec!["merge", "--no-ff", source];
        if let Some(message) = commit_message {
            args.push("-m");
            args.push(message);
        }
        let (success, stdout, stderr) = self.run(dir, &args).await?;
        if success {
            let already_up_to_date = stdout.contains("Already up to date");
            let sha = self.run_ok(dir, &["rev-parse", "HEAD"]).await.ok().map(|s| s.trim().to_string());
            return Ok(MergeOutcome {
                success: true,
                already_up_to_date,
                has_conflicts: false,
                conflicted_files: None,
                merge_commit_sha: sha,
            });
        }
        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") {
            let conflicted = self.get_conflicted_files(dir).await?;
            return Ok(MergeOutcome {
                success: false,
                already_up_to_date: false,
                has_conflicts: true,
                conflicted_files: Some(conflicted),
                merge_commit_sha: None,
            });
        }
        Err(GitError::shell_failure(format!("merge {source}"), -1, stderr))
    }

    pub async fn abort_merge(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(dir, &["merge", "--abort"]).await.map(|_| ())
    }

    pub async fn get_conflicted_files(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let (_, stdout, _) = self.run(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(stdout.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    // --- Worktree lifecycle ---

    pub async fn create_worktree(
        &self,
        dir: &Path,
        path: &Path,
        new_branch: &str,
        base: Option<&str>,
    ) -> Result<(), GitError> {
        debug!(dir = %dir.display(), path = %path.display(), new_branch, "create_worktree: called");
        let base_ref = base.unwrap_or("HEAD");
        self.run_ok(dir, &["worktree", "add", &path.to_string_lossy(), "-b", new_branch, base_ref]).await?;
        self.ensure_worktree_excluded(dir).await?;
        Ok(())
    }

    pub async fn add_worktree_for_existing_branch(&self, dir: &Path, path: &Path, branch: &str) -> Result<(), GitError> {
        self.run_ok(dir, &["worktree", "add", &path.to_string_lossy(), branch]).await?;
        self.ensure_worktree_excluded(dir).await?;
        Ok(())
    }

    pub async fn worktree_exists(&self, dir: &Path, path: &Path) -> bool {
        self.list_worktrees(dir).await.map(|list| list.iter().any(|w| w.path == path)).unwrap_or(false)
    }

    pub async fn list_worktrees(&self, dir: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let (_, stdout, _) = self.run(dir, &["worktree", "list", "--porcelain"]).await?;
        let mut entries = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;
        for line in stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(p) = current_path.take() {
                    entries.push(WorktreeEntry { path: p, branch: current_branch.take() });
                }
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                current_branch = branch_ref.rsplit('/').next().map(str::to_string);
            }
        }
        if let Some(p) = current_path.take() {
            entries.push(WorktreeEntry { path: p, branch: current_branch.take() });
        }
        Ok(entries)
    }

    pub async fn remove_worktree(&self, dir: &Path, path: &Path, force: bool) -> Result<(), GitError> {
        debug!(dir = %dir.display(), path = %path.display(), force, "remove_worktree: called");
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        let (success, _, stderr) = self.run(dir, &args).await?;
        if !success && !stderr.contains("is not a working tree") {
            return Err(GitError::shell_failure("worktree remove", -1, stderr));
        }
        Ok(())
    }

    pub async fn prune_worktrees(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(dir, &["worktree", "prune"]).await.map(|_| ())
    }

    /// Idempotent: only appends `.ralph-worktrees` to `<dir>/.git/info/exclude`
    /// if it isn't already there. `dir` is always the main repo, never a
    /// worktree — callers resolving a worktree's `.git` file (which is a
    /// plain text pointer, not a directory) must follow its `gitdir:` line
    /// back to this path themselves.
    pub async fn ensure_worktree_excluded(&self, dir: &Path) -> Result<(), GitError> {
        let exclude_path = dir.join(".git").join("info").join("exclude");
        let existing = self.executor.read_file(&exclude_path).await.unwrap_or_default();
        if existing.lines().any(|l| l.trim() == WORKTREES_EXCLUDE_ENTRY) {
            return Ok(());
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(WORKTREES_EXCLUDE_ENTRY);
        updated.push('\n');
        self.executor.write_file(&exclude_path, &updated).await?;
        Ok(())
    }

    /// Best-effort removal of a stale `index.lock` before a retried git
    /// invocation. Never fails the caller — a missing lock file is exactly
    /// what success looks like too.
    pub async fn cleanup_stale_lock_files(&self, dir: &Path, retries: u32, backoff_ms: u64) {
        let lock_path = dir.join(".git").join("index.lock");
        for attempt in 0..retries {
            if !self.executor.file_exists(&lock_path).await {
                return;
            }
            warn!(path = %lock_path.display(), attempt, "cleanup_stale_lock_files: removing stale lock");
            let _ = tokio::fs::remove_file(&lock_path).await;
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
        }
    }
}

fn extract_file_patch(full_patch: &str, path: &str) -> Option<String> {
    let marker = format!("diff --git a/{path} b/{path}");
    let start = full_patch.find(&marker)?;
    let rest = &full_patch[start..];
    let end = rest[marker.len()..].find("\ndiff --git ").map(|i| i + marker.len()).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LocalCommandExecutor;
    use std::process::Command as StdCommand;

    fn setup_git_repo(dir: &Path) {
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.email", "test@example.com"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "--allow-empty", "-m", "initial"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    fn service() -> GitService {
        GitService::new(Arc::new(LocalCommandExecutor::new()))
    }

    #[tokio::test]
    async fn is_git_repo_true_after_init() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        assert!(service().is_git_repo(dir.path()).await);
    }

    #[tokio::test]
    async fn commit_fails_with_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        let err = service().commit(dir.path(), "empty", None).await.unwrap_err();
        assert!(matches!(err, GitError::NoChangesToCommit));
    }

    #[tokio::test]
    async fn stage_and_commit_returns_sha_and_files() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        tokio::fs::write(dir.path().join("a.txt"), "hi").await.unwrap();
        let svc = service();
        svc.stage_all(dir.path()).await.unwrap();
        let outcome = svc.commit(dir.path(), "add a.txt", None).await.unwrap();
        assert_eq!(outcome.files_changed, vec!["a.txt".to_string()]);
        assert_eq!(outcome.sha.len(), 40);
    }

    #[tokio::test]
    async fn create_and_remove_worktree_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        let svc = service();
        let worktree_path = dir.path().join(".ralph-worktrees").join("loop-1");
        svc.create_worktree(dir.path(), &worktree_path, "ralph/loop-1", None).await.unwrap();
        assert!(svc.worktree_exists(dir.path(), &worktree_path).await);
        svc.remove_worktree(dir.path(), &worktree_path, true).await.unwrap();
        svc.prune_worktrees(dir.path()).await.unwrap();
        assert!(!svc.worktree_exists(dir.path(), &worktree_path).await);
    }

    #[tokio::test]
    async fn ensure_worktree_excluded_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        let svc = service();
        svc.ensure_worktree_excluded(dir.path()).await.unwrap();
        svc.ensure_worktree_excluded(dir.path()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join(".git/info/exclude")).await.unwrap();
        assert_eq!(content.matches(WORKTREES_EXCLUDE_ENTRY).count(), 1);
    }

    #[tokio::test]
    async fn empty_repo_reports_one_notional_branch() {
        let dir = tempfile::tempdir().unwrap();
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir.path()).output().unwrap();
        let branches = service().get_local_branches(dir.path()).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].current);
    }

    #[tokio::test]
    async fn get_changed_files_handles_renames() {
        let dir = tempfile::tempdir().unwrap();
        setup_git_repo(dir.path());
        tokio::fs::write(dir.path().join("old.txt"), "content").await.unwrap();
        let svc = service();
        svc.stage_all(dir.path()).await.unwrap();
        svc.commit(dir.path(), "add old.txt", None).await.unwrap();
        tokio::fs::rename(dir.path().join("old.txt"), dir.path().join("new.txt")).await.unwrap();
        svc.stage_all(dir.path()).await.unwrap();
        let changed = svc.get_changed_files(dir.path()).await.unwrap();
        assert_eq!(changed, vec!["new.txt".to_string()]);
    }
}
