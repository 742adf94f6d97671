//! The local clone workspace.
//!
//! [`ClonedRepo`] owns one on-disk git workspace augmented with the
//! `cinnabar` helper subcommand. All invocations are blocking subprocess
//! calls returning captured output; interpretation of helper stderr (the
//! empty-destination sentinel, "already exists") is left to the caller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hgsync_process::{CommandResult, run_command_in_dir, run_command_in_dir_with_env};
use tracing::debug;

/// Cinnabar features the sync pipeline relies on. Applied to the clone
/// configuration on every open; the operation is idempotent.
const CINNABAR_EXPERIMENTS: &str = "branch,tag,git_commit,merge";

/// A git workspace with cinnabar state, exclusively owned by one
/// synchronizer.
#[derive(Debug, Clone)]
pub struct ClonedRepo {
    path: PathBuf,
}

impl ClonedRepo {
    /// Open the workspace at `path`, initializing an empty repository on
    /// first use, and (re)apply the cinnabar configuration.
    pub fn open_or_init(path: &Path) -> Result<Self> {
        if !path.join(".git").exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("failed to create clone directory {}", path.display()))?;
            run_command_in_dir("git", &["init"], path)?.ok()?;
            debug!(path = %path.display(), "initialized clone workspace");
        }

        let repo = Self {
            path: path.to_path_buf(),
        };
        repo.git_ok(&["config", "cinnabar.experiments", CINNABAR_EXPERIMENTS])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run git with `args`, returning the raw result without checking the
    /// exit status.
    pub fn git(&self, args: &[&str]) -> Result<CommandResult> {
        debug!(?args, "git");
        run_command_in_dir("git", args, &self.path)
    }

    /// Run git with `args` and fail on non-zero exit.
    pub fn git_ok(&self, args: &[&str]) -> Result<CommandResult> {
        let result = self.git(args)?;
        result.ok()?;
        Ok(result)
    }

    /// Run `git cinnabar` with `args`, without checking the exit status.
    pub fn cinnabar(&self, args: &[&str]) -> Result<CommandResult> {
        let mut full = vec!["cinnabar"];
        full.extend_from_slice(args);
        self.git(&full)
    }

    /// Whether a fully-qualified ref exists in the workspace.
    pub fn has_ref(&self, name: &str) -> Result<bool> {
        let result = self.git(&["show-ref", "--verify", "--quiet", name])?;
        Ok(result.success)
    }

    /// Whether a local branch exists.
    pub fn has_local_branch(&self, branch: &str) -> Result<bool> {
        self.has_ref(&format!("refs/heads/{branch}"))
    }

    /// Create a local branch pointing at `commit`.
    pub fn create_branch(&self, branch: &str, commit: &str) -> Result<()> {
        self.git_ok(&["branch", branch, commit])?;
        Ok(())
    }

    /// Fetch explicit refs (commit ids or ref names) from a remote.
    pub fn fetch(&self, remote: &str, refs: &[&str]) -> Result<()> {
        let mut args = vec!["fetch", remote];
        args.extend_from_slice(refs);
        self.git_ok(&args)?;
        Ok(())
    }

    /// Fetch everything from a remote with cinnabar grafting enabled,
    /// returning the raw result so the caller can inspect stderr.
    pub fn fetch_with_graft(&self, remote: &str) -> Result<CommandResult> {
        self.git(&["-c", "cinnabar.graft=true", "fetch", remote])
    }

    /// Force-fetch a remote ref into a local branch, creating the branch
    /// when missing.
    pub fn fetch_into_branch(&self, remote: &str, remote_ref: &str, branch: &str) -> Result<()> {
        let refspec = format!("{remote_ref}:refs/heads/{branch}");
        self.git_ok(&["fetch", "-f", remote, &refspec])?;
        Ok(())
    }

    /// Whether `name` resolves to a ref on the remote.
    pub fn remote_ref_exists(&self, remote: &str, name: &str) -> Result<bool> {
        let result = self.git_ok(&["ls-remote", remote, name])?;
        Ok(!result.stdout.trim().is_empty())
    }

    /// Push one refspec to a remote, force-creating when requested.
    pub fn push(&self, remote: &str, refspec: &str, force: bool) -> Result<()> {
        let mut args = vec!["push"];
        if force {
            args.push("-f");
        }
        args.push(remote);
        args.push(refspec);
        self.git_ok(&args)?;
        Ok(())
    }

    /// Dry-run push with `cinnabar.data=force`: computes and persists the
    /// mercurial metadata for every new commit along the pushed refs
    /// without publishing anything.
    pub fn dry_run_push_with_metadata(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut args = vec!["-c", "cinnabar.data=force", "push", "--dry-run", remote];
        args.extend(refspecs.iter().map(String::as_str));
        self.git_ok(&args)?;
        Ok(())
    }

    /// Tags known to cinnabar, one per line of `cinnabar tag --list`.
    pub fn cinnabar_tag_list(&self) -> Result<Vec<String>> {
        let result = self.cinnabar(&["tag", "--list"])?;
        result.ok()?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// The mercurial changeset id recorded for a git commit. Cinnabar
    /// reports all-zeroes when it has no metadata for the commit.
    pub fn git2hg(&self, commit: &str) -> Result<String> {
        let result = self.cinnabar(&["git2hg", commit])?;
        result.ok()?;
        Ok(result.stdout_trimmed().to_string())
    }

    /// Create a tag commit on `onto_branch` via the cinnabar helper,
    /// attributing it through `env`. Returns the raw result so the caller
    /// can distinguish the "already exists" failure.
    pub fn cinnabar_tag(
        &self,
        message: &str,
        onto_branch: &str,
        tag: &str,
        commit: &str,
        env: &[(&str, &str)],
    ) -> Result<CommandResult> {
        let onto = format!("refs/heads/{onto_branch}");
        let args = [
            "cinnabar", "tag", "--message", message, "--onto", &onto, tag, commit,
        ];
        debug!(?args, "git");
        run_command_in_dir_with_env("git", &args, &self.path, env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn configure_identity(repo: &ClonedRepo) {
        repo.git_ok(&["config", "user.email", "test@example.com"])
            .expect("config email");
        repo.git_ok(&["config", "user.name", "Test User"])
            .expect("config name");
    }

    fn commit_file(repo: &ClonedRepo, name: &str, content: &str, message: &str) -> String {
        std::fs::write(repo.path().join(name), content).expect("write file");
        repo.git_ok(&["add", name]).expect("git add");
        repo.git_ok(&["commit", "-m", message]).expect("git commit");
        repo.git_ok(&["rev-parse", "HEAD"])
            .expect("rev-parse")
            .stdout_trimmed()
            .to_string()
    }

    #[test]
    fn open_or_init_creates_repository_and_configures_cinnabar() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("clone");

        let repo = ClonedRepo::open_or_init(&path).expect("init");
        assert!(path.join(".git").exists());

        let configured = repo
            .git_ok(&["config", "cinnabar.experiments"])
            .expect("config read");
        assert_eq!(configured.stdout_trimmed(), CINNABAR_EXPERIMENTS);
    }

    #[test]
    fn open_or_init_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("clone");

        ClonedRepo::open_or_init(&path).expect("first open");
        let repo = ClonedRepo::open_or_init(&path).expect("second open");

        // Reopening must not re-init or duplicate configuration.
        let configured = repo
            .git_ok(&["config", "--get-all", "cinnabar.experiments"])
            .expect("config read");
        assert_eq!(configured.stdout.lines().count(), 1);
    }

    #[test]
    fn has_ref_and_branches() {
        let td = tempdir().expect("tempdir");
        let repo = ClonedRepo::open_or_init(&td.path().join("clone")).expect("init");
        configure_identity(&repo);
        let commit = commit_file(&repo, "foo.txt", "FOO", "add foo.txt");

        assert!(!repo.has_local_branch("tags-esr128").expect("has branch"));
        repo.create_branch("tags-esr128", &commit).expect("branch");
        assert!(repo.has_local_branch("tags-esr128").expect("has branch"));
        assert!(repo.has_ref("refs/heads/tags-esr128").expect("has ref"));
        assert!(!repo.has_ref("refs/cinnabar/metadata").expect("has ref"));
    }

    #[test]
    fn fetch_explicit_commit_from_source() {
        let td = tempdir().expect("tempdir");

        let source = ClonedRepo::open_or_init(&td.path().join("source")).expect("source");
        configure_identity(&source);
        let commit = commit_file(&source, "foo.txt", "FOO", "add foo.txt");
        // The forge equivalent of serving arbitrary commit ids.
        source
            .git_ok(&["config", "uploadpack.allowAnySHA1InWant", "true"])
            .expect("config");

        let clone = ClonedRepo::open_or_init(&td.path().join("clone")).expect("clone");
        let source_url = source.path().to_str().expect("utf8 path");
        clone.fetch(source_url, &[commit.as_str()]).expect("fetch");

        let have = clone
            .git_ok(&["cat-file", "-t", &commit])
            .expect("cat-file");
        assert_eq!(have.stdout_trimmed(), "commit");
    }

    #[test]
    fn fetch_failure_is_an_error() {
        let td = tempdir().expect("tempdir");
        let clone = ClonedRepo::open_or_init(&td.path().join("clone")).expect("clone");

        let missing = td.path().join("no-such-remote");
        assert!(
            clone
                .fetch(missing.to_str().expect("utf8"), &["deadbeef"])
                .is_err()
        );
    }

    #[test]
    fn remote_ref_exists_probes_by_name() {
        let td = tempdir().expect("tempdir");

        let source = ClonedRepo::open_or_init(&td.path().join("source")).expect("source");
        configure_identity(&source);
        commit_file(&source, "foo.txt", "FOO", "add foo.txt");
        let head_branch = source
            .git_ok(&["symbolic-ref", "--short", "HEAD"])
            .expect("symbolic-ref")
            .stdout_trimmed()
            .to_string();

        let clone = ClonedRepo::open_or_init(&td.path().join("clone")).expect("clone");
        let source_url = source.path().to_str().expect("utf8 path");

        assert!(
            clone
                .remote_ref_exists(source_url, &format!("refs/heads/{head_branch}"))
                .expect("probe")
        );
        assert!(
            !clone
                .remote_ref_exists(source_url, "refs/heads/branches/default/tip")
                .expect("probe")
        );
    }

    #[test]
    fn push_publishes_refspec_to_bare_remote() {
        let td = tempdir().expect("tempdir");

        let remote_path = td.path().join("remote.git");
        std::fs::create_dir_all(&remote_path).expect("mkdir");
        run_command_in_dir("git", &["init", "--bare"], &remote_path)
            .expect("run")
            .ok()
            .expect("bare init");

        let clone = ClonedRepo::open_or_init(&td.path().join("clone")).expect("clone");
        configure_identity(&clone);
        let commit = commit_file(&clone, "foo.txt", "FOO", "add foo.txt");

        let remote_url = remote_path.to_str().expect("utf8 path");
        let refspec = format!("{commit}:refs/heads/branches/default/tip");
        clone.push(remote_url, &refspec, true).expect("push");

        assert!(
            clone
                .remote_ref_exists(remote_url, "refs/heads/branches/default/tip")
                .expect("probe")
        );
    }

    #[test]
    fn fetch_into_branch_force_updates_local_branch() {
        let td = tempdir().expect("tempdir");

        let source = ClonedRepo::open_or_init(&td.path().join("source")).expect("source");
        configure_identity(&source);
        commit_file(&source, "foo.txt", "FOO", "add foo.txt");
        let head_branch = source
            .git_ok(&["symbolic-ref", "--short", "HEAD"])
            .expect("symbolic-ref")
            .stdout_trimmed()
            .to_string();
        let remote_ref = format!("refs/heads/{head_branch}");

        let clone = ClonedRepo::open_or_init(&td.path().join("clone")).expect("clone");
        let source_url = source.path().to_str().expect("utf8 path");

        clone
            .fetch_into_branch(source_url, &remote_ref, "tags-esr128")
            .expect("fetch into branch");
        assert!(clone.has_local_branch("tags-esr128").expect("has branch"));

        // A second fetch after the remote moved must update the branch.
        let second = commit_file(&source, "bar.txt", "BAR", "add bar.txt");
        clone
            .fetch_into_branch(source_url, &remote_ref, "tags-esr128")
            .expect("refetch");
        let tip = clone
            .git_ok(&["rev-parse", "refs/heads/tags-esr128"])
            .expect("rev-parse");
        assert_eq!(tip.stdout_trimmed(), second);
    }
}
