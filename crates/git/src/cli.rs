//! Why everything here goes through the Git CLI
//!
//! - Safer working-tree semantics: the `git` CLI refuses to clobber
//!   uncommitted tracked changes and untracked files during checkout/merge
//!   unless explicitly forced; a library binding would need to re-implement
//!   those protections.
//! - Sparse-checkout correctness: the CLI natively respects sparse-checkout
//!   in worktrees it creates.
//! - Fidelity with developer expectations: a worktree created here behaves
//!   exactly like one created by hand.
//!
//! Commands are built as argument vectors and never routed through a shell,
//! so no interpolation or quoting hazards exist. Failures are normalized to
//! a single error kind carrying the command line, stderr and stdout.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git {command} failed: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
        stdout: String,
    },
    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),
    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

/// One parsed entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub is_main: bool,
    pub is_locked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn git<I, S>(&self, cwd: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let program = which::which("git").map_err(|_| GitCliError::NotAvailable)?;

        tracing::trace!("running {} in {}", render_command(&args), cwd.display());
        let output = Command::new(program).current_dir(cwd).args(&args).output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            Err(GitCliError::CommandFailed {
                command: render_command(&args),
                stderr,
                stdout,
            })
        }
    }

    /// Like [`Self::git`] but surfaces the exit code instead of failing on
    /// it. Used for probes (`merge-base --is-ancestor`, `merge-tree`) whose
    /// exit status is data, not failure.
    fn git_with_status<I, S>(
        &self,
        cwd: &Path,
        args: I,
    ) -> Result<(i32, String, String), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let program = which::which("git").map_err(|_| GitCliError::NotAvailable)?;
        let output = Command::new(program).current_dir(cwd).args(&args).output()?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    pub fn is_valid_repo(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        matches!(
            self.git_with_status(path, ["rev-parse", "--is-inside-work-tree"]),
            Ok((0, ref out, _)) if out.trim() == "true"
        )
    }

    // ---- worktrees ----

    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        create_branch: bool,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "add".into()];
        if force {
            args.push("--force".into());
        }
        if create_branch {
            args.push("-b".into());
            args.push(OsString::from(branch));
        }
        args.push(worktree_path.as_os_str().into());
        args.push(OsString::from(branch));
        self.git(repo_path, args)?;

        // Reapply sparse-checkout in the new worktree so materialization
        // matches the parent configuration. Non-fatal if not configured.
        let _ = self.git(worktree_path, ["sparse-checkout", "reapply"]);
        Ok(())
    }

    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self, repo_path: &Path) -> Result<Vec<WorktreeInfo>, GitCliError> {
        let out = self.git(repo_path, ["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out))
    }

    pub fn configure_sparse_checkout(
        &self,
        worktree_path: &Path,
        patterns: &[String],
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> =
            vec!["sparse-checkout".into(), "set".into(), "--no-cone".into()];
        for pattern in patterns {
            args.push(OsString::from(pattern));
        }
        self.git(worktree_path, args)?;
        Ok(())
    }

    // ---- branches ----

    pub fn is_branch_name_valid(&self, name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('-')
            && !name.ends_with('/')
            && !name.contains("..")
            && !name.chars().any(|c| c.is_whitespace() || "~^:?*[\\".contains(c))
    }

    pub fn create_branch(
        &self,
        repo_path: &Path,
        name: &str,
        start_point: Option<&str>,
    ) -> Result<(), GitCliError> {
        if !self.is_branch_name_valid(name) {
            return Err(GitCliError::InvalidBranchName(name.to_string()));
        }
        let mut args: Vec<OsString> = vec!["branch".into(), OsString::from(name)];
        if let Some(start) = start_point {
            args.push(OsString::from(start));
        }
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn delete_branch(
        &self,
        repo_path: &Path,
        name: &str,
        force: bool,
    ) -> Result<(), GitCliError> {
        let flag = if force { "-D" } else { "-d" };
        self.git(repo_path, ["branch", flag, name])?;
        Ok(())
    }

    pub fn list_branches(&self, repo_path: &Path) -> Result<Vec<String>, GitCliError> {
        let out = self.git(
            repo_path,
            ["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    pub fn branch_exists(&self, repo_path: &Path, name: &str) -> Result<bool, GitCliError> {
        let (code, _, _) = self.git_with_status(
            repo_path,
            ["show-ref", "--verify", "--quiet", &format!("refs/heads/{name}")],
        )?;
        Ok(code == 0)
    }

    pub fn current_branch(&self, repo_path: &Path) -> Result<String, GitCliError> {
        let out = self.git(repo_path, ["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn current_commit(&self, repo_path: &Path) -> Result<String, GitCliError> {
        let out = self.git(repo_path, ["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn rev_parse(&self, repo_path: &Path, rev: &str) -> Result<String, GitCliError> {
        let out = self.git(repo_path, ["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    pub fn branch_commit(&self, repo_path: &Path, branch: &str) -> Result<String, GitCliError> {
        self.rev_parse(repo_path, branch)
    }

    // ---- history / merge ----

    pub fn is_ancestor(
        &self,
        repo_path: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, GitCliError> {
        let (code, _, stderr) = self.git_with_status(
            repo_path,
            ["merge-base", "--is-ancestor", ancestor, descendant],
        )?;
        match code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(GitCliError::CommandFailed {
                command: format!("merge-base --is-ancestor {ancestor} {descendant}"),
                stderr,
                stdout: String::new(),
            }),
        }
    }

    /// Fast-forward `branch` to `commit` without a checkout. The branch must
    /// not be checked out in any worktree and `commit` must descend from it.
    pub fn advance_branch(
        &self,
        repo_path: &Path,
        branch: &str,
        commit: &str,
    ) -> Result<(), GitCliError> {
        let current = self.branch_commit(repo_path, branch)?;
        if !self.is_ancestor(repo_path, &current, commit)? {
            return Err(GitCliError::CommandFailed {
                command: format!("update-ref refs/heads/{branch} {commit}"),
                stderr: format!("{commit} is not a descendant of {branch}"),
                stdout: String::new(),
            });
        }
        self.git(
            repo_path,
            ["update-ref", &format!("refs/heads/{branch}"), commit, &current],
        )?;
        Ok(())
    }

    /// Squash-merge `commit` into the branch checked out at `worktree_path`.
    pub fn merge_squash(&self, worktree_path: &Path, commit: &str) -> Result<(), GitCliError> {
        self.git(worktree_path, ["merge", "--squash", commit])?;
        Ok(())
    }

    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String, GitCliError> {
        self.git(worktree_path, ["add", "-A"])?;
        self.git(worktree_path, ["commit", "--no-verify", "-m", message])?;
        self.current_commit(worktree_path)
    }

    /// Probe a three-way merge of `source` into `target` without touching any
    /// working tree. Returns the paths that would conflict; empty means the
    /// merge is clean.
    pub fn merge_tree_conflicts(
        &self,
        repo_path: &Path,
        target: &str,
        source: &str,
    ) -> Result<Vec<String>, GitCliError> {
        let (code, stdout, stderr) = self.git_with_status(
            repo_path,
            ["merge-tree", "--write-tree", "--name-only", "--no-messages", target, source],
        )?;
        match code {
            0 => Ok(Vec::new()),
            1 => Ok(stdout
                .lines()
                .skip(1) // first line is the written tree oid
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()),
            _ => Err(GitCliError::CommandFailed {
                command: format!("merge-tree --write-tree {target} {source}"),
                stderr,
                stdout,
            }),
        }
    }

    /// Read a file's content at a given commit, `None` if it does not exist
    /// there.
    pub fn show_file(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
    ) -> Result<Option<String>, GitCliError> {
        let (code, stdout, _) =
            self.git_with_status(repo_path, ["show", &format!("{commit}:{path}")])?;
        if code == 0 { Ok(Some(stdout)) } else { Ok(None) }
    }

    pub fn diff_stats(
        &self,
        repo_path: &Path,
        from: &str,
        to: &str,
    ) -> Result<DiffStats, GitCliError> {
        let out = self.git(repo_path, ["diff", "--numstat", &format!("{from}..{to}")])?;
        let mut stats = DiffStats::default();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            let additions = parts.next().and_then(|p| p.parse::<usize>().ok());
            let deletions = parts.next().and_then(|p| p.parse::<usize>().ok());
            if parts.next().is_some() {
                stats.files_changed += 1;
                // binary files report "-" and parse as None
                stats.additions += additions.unwrap_or(0);
                stats.deletions += deletions.unwrap_or(0);
            }
        }
        Ok(stats)
    }

    pub fn changed_files(
        &self,
        repo_path: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, GitCliError> {
        let out = self.git(repo_path, ["diff", "--name-only", &format!("{from}..{to}")])?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    // ---- repo setup (used by tests and bootstrap) ----

    pub fn init_repo(&self, path: &Path, initial_branch: &str) -> Result<(), GitCliError> {
        std::fs::create_dir_all(path)?;
        self.git(path, ["init", "-b", initial_branch])?;
        self.git(path, ["config", "user.email", "dev@localhost"])?;
        self.git(path, ["config", "user.name", "dev"])?;
        Ok(())
    }
}

fn render_command(args: &[OsString]) -> String {
    let mut rendered = String::from("git");
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                is_main: entries.is_empty(),
                is_locked: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch =
                    Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
            } else if line == "locked" || line.starts_with("locked ") {
                entry.is_locked = true;
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain_output() {
        let out = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/.wt/one\nHEAD def456\nbranch refs/heads/stream/ISSUE-001\nlocked\n\n";
        let entries = parse_worktree_porcelain(out);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_main);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert!(!entries[1].is_main);
        assert!(entries[1].is_locked);
        assert_eq!(entries[1].branch.as_deref(), Some("stream/ISSUE-001"));
    }

    #[test]
    fn branch_name_validation() {
        let cli = GitCli::new();
        assert!(cli.is_branch_name_valid("stream/ISSUE-001"));
        assert!(!cli.is_branch_name_valid("-bad"));
        assert!(!cli.is_branch_name_valid("a..b"));
        assert!(!cli.is_branch_name_valid("has space"));
        assert!(!cli.is_branch_name_valid(""));
    }
}
