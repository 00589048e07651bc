//! Git inspection for checkpoint metadata and file selection
//!
//! Read-only: ghostfix never stages, commits or checks out on its own.

use anyhow::{Context, Result};
use ghostfix_core::protocol::{GitInspector, GitState};
use git2::{Repository, StatusOptions};
use std::path::{Path, PathBuf};

/// Status of the working directory
#[derive(Debug, Clone, Default)]
pub struct GitStatus {
    pub branch: String,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

impl GitStatus {
    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty() || !self.modified.is_empty() || !self.untracked.is_empty()
    }
}

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

/// Get the current git status
pub fn current_status(repo_path: &Path) -> Result<GitStatus> {
    let repo = open_repo_discover(repo_path)?;

    let branch = match repo.head() {
        Ok(head) => head.shorthand().unwrap_or("detached").to_string(),
        // Fresh repository without commits: HEAD points at an unborn branch.
        Err(_) => "unborn".to_string(),
    };

    let mut status = GitStatus {
        branch,
        ..Default::default()
    };

    let mut opts = StatusOptions::new();
    opts.include_untracked(true);
    opts.recurse_untracked_dirs(true);
    opts.include_ignored(false);
    opts.include_unmodified(false);
    opts.exclude_submodules(true);

    let statuses = repo.statuses(Some(&mut opts))?;

    for entry in statuses.iter() {
        let path = entry.path().unwrap_or("").to_string();
        let s = entry.status();

        if s.is_index_new() || s.is_index_modified() || s.is_index_deleted() {
            status.staged.push(path.clone());
        }
        if s.is_wt_modified() || s.is_wt_deleted() {
            status.modified.push(path.clone());
        }
        if s.is_wt_new() {
            status.untracked.push(path);
        }
    }

    Ok(status)
}

/// Full hash of the commit HEAD points at, if any.
pub fn head_commit(repo_path: &Path) -> Option<String> {
    let repo = open_repo_discover(repo_path).ok()?;
    let head = repo.head().ok()?;
    head.peel_to_commit().ok().map(|c| c.id().to_string())
}

/// Default `GitInspector` backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Inspector;

impl GitInspector for Git2Inspector {
    fn git_state(&self, root: &Path) -> GitState {
        match current_status(root) {
            Ok(status) => GitState {
                is_repo: true,
                dirty: status.is_dirty(),
                branch: Some(status.branch),
                commit: head_commit(root),
            },
            Err(_) => GitState::default(),
        }
    }

    fn modified_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let status = current_status(root)?;
        let mut files: Vec<PathBuf> = Vec::new();
        for path in status
            .staged
            .into_iter()
            .chain(status.modified)
            .chain(status.untracked)
        {
            let path = PathBuf::from(path);
            if !files.contains(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::TempDir;

    fn stage(repo: &Repository, rel_path: &str) {
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
    }

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&repo_path).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        fs::write(repo_path.join("README.md"), "# Test").unwrap();
        stage(&repo, "README.md");
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        (temp_dir, repo_path)
    }

    #[test]
    fn test_git_state_clean_repo() {
        let (_temp_dir, repo_path) = create_temp_repo();
        let state = Git2Inspector.git_state(&repo_path);
        assert!(state.is_repo);
        assert!(!state.dirty);
        assert!(state.branch.is_some());
        assert_eq!(state.commit.as_deref().map(str::len), Some(40));
    }

    #[test]
    fn test_modified_files_lists_changes_once() {
        let (_temp_dir, repo_path) = create_temp_repo();
        fs::write(repo_path.join("README.md"), "# Changed").unwrap();
        fs::write(repo_path.join("new.ts"), "export {}").unwrap();
        stage(&Repository::open(&repo_path).unwrap(), "new.ts");
        fs::write(repo_path.join("new.ts"), "export const a = 1").unwrap();

        let files = Git2Inspector.modified_files(&repo_path).unwrap();
        assert!(files.contains(&PathBuf::from("README.md")));
        assert_eq!(
            files.iter().filter(|f| *f == &PathBuf::from("new.ts")).count(),
            1
        );

        let state = Git2Inspector.git_state(&repo_path);
        assert!(state.dirty);
    }

    #[test]
    fn test_git_state_outside_repo() {
        let dir = TempDir::new().unwrap();
        let state = Git2Inspector.git_state(dir.path());
        // Temp dirs can live inside a repo on some CI hosts; only assert the
        // negative case when discovery really fails.
        if Repository::discover(dir.path()).is_err() {
            assert_eq!(state, GitState::default());
        }
    }
}
