use std::path::{Path, PathBuf};
use std::time::Duration;

/// Temporary workbench root for tests.
/// Provides convenience helpers for the `.workbench` layout and git repos.
pub struct TempWorkbench {
  pub root: tempfile::TempDir,
}

impl Default for TempWorkbench {
  fn default() -> Self {
    Self::new()
  }
}

impl TempWorkbench {
  pub fn new() -> Self {
    let root = tempfile::tempdir().expect("tempdir");
    Self { root }
  }

  pub fn path(&self) -> PathBuf {
    self.root.path().to_path_buf()
  }

  /// Create `.workbench` directory inside the temp root.
  pub fn mkdir_workbench(&self) -> PathBuf {
    let p = self.path().join(".workbench");
    std::fs::create_dir_all(&p).expect("mkdir .workbench");
    p
  }

  /// Write `.workbench/<name>` and return its path.
  pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
    let p = self.mkdir_workbench().join(name);
    std::fs::write(&p, contents).expect("write workbench file");
    p
  }

  /// Create a repo with one commit under `<root>/<name>` to serve as a remote.
  pub fn init_remote(&self, name: &str) -> (PathBuf, git2::Repository) {
    let p = self.path().join(name);
    std::fs::create_dir_all(&p).expect("mkdir remote");
    let repo = init_repo_with_initial_commit(&p);
    (p, repo)
  }
}

/// Initialize a git repository at `path` and configure user.
pub fn init_repo_only<P: AsRef<Path>>(path: P) -> git2::Repository {
  let repo = git2::Repository::init(path.as_ref()).expect("init git");
  let mut cfg = repo.config().unwrap();
  cfg.set_str("user.name", "Test").unwrap();
  cfg.set_str("user.email", "test@example.com").unwrap();
  repo
}

/// Initialize a repo with an initial commit on `main` and set HEAD.
pub fn init_repo_with_initial_commit<P: AsRef<Path>>(path: P) -> git2::Repository {
  let repo = init_repo_only(&path);
  std::fs::write(path.as_ref().join("README.md"), "hello").unwrap();
  let oid = commit_file(&repo, "README.md", "init", &[]);
  let _ = repo.branch("main", &repo.find_commit(oid).unwrap(), true);
  repo.set_head("refs/heads/main").unwrap();
  repo
}

/// Commit the current contents of `file` on top of HEAD.
pub fn commit_on_head(repo: &git2::Repository, file: &str, contents: &str, message: &str) -> git2::Oid {
  let workdir = repo.workdir().expect("non-bare repo");
  std::fs::write(workdir.join(file), contents).unwrap();
  let parent = repo.head().unwrap().peel_to_commit().unwrap();
  commit_file(repo, file, message, &[&parent])
}

fn commit_file(repo: &git2::Repository, file: &str, message: &str, parents: &[&git2::Commit<'_>]) -> git2::Oid {
  let mut idx = repo.index().unwrap();
  idx.add_path(Path::new(file)).unwrap();
  idx.write().unwrap();
  let tree_id = idx.write_tree().unwrap();
  let tree = repo.find_tree(tree_id).unwrap();
  let sig = repo.signature().unwrap();
  repo
    .commit(Some("HEAD"), &sig, &sig, message, &tree, parents)
    .unwrap()
}

/// Poll a condition repeatedly until it returns true or times out.
/// Returns true if condition met, false on timeout.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  use tokio::time::{Instant, sleep};
  let start = Instant::now();
  loop {
    if check().await {
      return true;
    }
    if start.elapsed() >= timeout {
      return false;
    }
    sleep(interval).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn git_init_with_commit_creates_main() {
    let td = tempfile::tempdir().unwrap();
    let repo = init_repo_with_initial_commit(td.path());
    let head = repo.head().unwrap();
    assert_eq!(head.name(), Some("refs/heads/main"));
  }

  #[test]
  fn commit_on_head_advances_main() {
    let tw = TempWorkbench::new();
    let (_, repo) = tw.init_remote("remote");
    let before = repo.head().unwrap().target().unwrap();
    let after = commit_on_head(&repo, "CHANGELOG.md", "v2", "second");
    assert_ne!(before, after);
    assert_eq!(repo.head().unwrap().target(), Some(after));
    assert_eq!(repo.head().unwrap().name(), Some("refs/heads/main"));
  }
}
