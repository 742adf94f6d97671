//! Integration tests for the clone workspace, against real git.
//!
//! Everything here runs without a Mercurial destination or the cinnabar
//! helper: the empty-repository sentinel and the workspace lifecycle
//! behave identically for plain git remotes.

use hgsync::git::ClonedRepo;
use hgsync::sync::RepoSynchronizer;
use tempfile::tempdir;

fn path_str(path: &std::path::Path) -> &str {
    path.to_str().expect("utf8 path")
}

#[test]
fn open_clone_initializes_workspace_lazily() {
    let td = tempdir().expect("tempdir");
    let clone_path = td.path().join("clones").join("myrepo");

    let syncer = RepoSynchronizer::new(clone_path.clone(), "https://gitforge.example/myrepo");
    assert!(!clone_path.exists());

    let repo = syncer.open_clone().expect("open clone");
    assert!(clone_path.join(".git").exists());
    assert_eq!(repo.path(), clone_path);
    assert_eq!(syncer.source_url(), "https://gitforge.example/myrepo");
}

#[test]
fn open_clone_reuses_existing_workspace() {
    let td = tempdir().expect("tempdir");
    let clone_path = td.path().join("myrepo");

    let syncer = RepoSynchronizer::new(clone_path.clone(), "https://gitforge.example/myrepo");
    syncer.open_clone().expect("first open");

    // Leave a trace in the workspace, then reopen: the clone must be
    // reused, not recreated.
    std::fs::write(clone_path.join("marker.txt"), "x").expect("write");
    syncer.open_clone().expect("second open");
    assert!(clone_path.join("marker.txt").exists());
}

#[test]
fn fetching_from_an_empty_destination_is_not_an_error() {
    let td = tempdir().expect("tempdir");

    // An empty repository responds to fetch with the exact sentinel the
    // synchronizer swallows during metadata bootstrap.
    let empty_remote = ClonedRepo::open_or_init(&td.path().join("empty-remote")).expect("remote");

    let syncer = RepoSynchronizer::new(td.path().join("clone"), "https://gitforge.example/myrepo");
    let clone = syncer.open_clone().expect("open clone");

    syncer
        .fetch_all_from_remote(&clone, path_str(empty_remote.path()))
        .expect("empty destination tolerated");
}

#[test]
fn fetching_from_a_missing_destination_fails() {
    let td = tempdir().expect("tempdir");

    let syncer = RepoSynchronizer::new(td.path().join("clone"), "https://gitforge.example/myrepo");
    let clone = syncer.open_clone().expect("open clone");

    let missing = td.path().join("no-such-remote");
    let err = syncer
        .fetch_all_from_remote(&clone, path_str(&missing))
        .unwrap_err();
    assert!(err.to_string().contains("failed"));
}

#[test]
fn fetching_from_a_populated_destination_grafts_history() {
    let td = tempdir().expect("tempdir");

    let remote = ClonedRepo::open_or_init(&td.path().join("remote")).expect("remote");
    remote
        .git_ok(&["config", "user.email", "test@example.com"])
        .expect("config");
    remote
        .git_ok(&["config", "user.name", "Test User"])
        .expect("config");
    std::fs::write(remote.path().join("foo.txt"), "FOO").expect("write");
    remote.git_ok(&["add", "foo.txt"]).expect("add");
    remote.git_ok(&["commit", "-m", "add foo.txt"]).expect("commit");
    let head = remote
        .git_ok(&["rev-parse", "HEAD"])
        .expect("rev-parse")
        .stdout_trimmed()
        .to_string();

    let syncer = RepoSynchronizer::new(td.path().join("clone"), "https://gitforge.example/myrepo");
    let clone = syncer.open_clone().expect("open clone");

    syncer
        .fetch_all_from_remote(&clone, path_str(remote.path()))
        .expect("fetch");

    let have = clone.git_ok(&["cat-file", "-t", &head]).expect("cat-file");
    assert_eq!(have.stdout_trimmed(), "commit");
}
