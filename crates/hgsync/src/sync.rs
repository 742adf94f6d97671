//! Per-repository synchronizer.
//!
//! One instance per tracked source repository, exclusively owning the
//! local clone workspace. [`RepoSynchronizer::sync`] drives a batch of
//! operations for a single destination through the fixed order: cinnabar
//! metadata bootstrap, source-commit fetch, metadata-forcing dry-run push,
//! tag branch preparation, tag creation, and one-by-one ref pushes. Every
//! step is idempotent so a requeued message converges on re-delivery.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use hgsync_retry::retry;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::ClonedRepo;
use crate::mapping::{SyncBranchOperation, SyncOperation, SyncTagOperation};

/// Environment variable carrying the requesting user through to commit
/// hooks on the destination.
pub const REQUEST_USER_ENV_VAR: &str = "AUTOLAND_REQUEST_USER";

/// Stderr prefix emitted when fetching from a Mercurial repository that
/// has no commits yet. Not an error: there is simply nothing to graft.
const EMPTY_REPO_SENTINEL: &str = "fatal: couldn't find remote ref HEAD";

/// Stderr fragment emitted by `cinnabar tag` when the tag is already
/// recorded.
const TAG_EXISTS_SENTINEL: &str = "already exists";

/// Synchronization failures, carrying the offending operation where one
/// exists.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to set up local clone for {destination_url}")]
    CloneSetup {
        destination_url: String,
        #[source]
        source: anyhow::Error,
    },
    /// The tag's target commit has no mercurial metadata even after the
    /// metadata-forcing dry-run push. A configuration or ordering bug, not
    /// a transient fault.
    #[error("no mercurial metadata found for commit {commit} (tag {tag})")]
    MercurialMetadataNotFound { commit: String, tag: String },
    #[error("sync operation failed: {operation:?}")]
    Operation {
        operation: SyncOperation,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Destination branch ref layout used by the cinnabar transport.
pub fn cinnabar_branch_ref(branch: &str) -> String {
    format!("refs/heads/branches/{branch}/tip")
}

/// Tag commit message, deterministic so re-deliveries and reviewers can
/// line commits up with events.
fn tag_message(hg_sha: &str, tag: &str, suffix: &str) -> String {
    format!("No bug - Tagging {hg_sha} with {tag} {suffix}")
}

/// The author name is guessed from the email-shaped request user.
fn author_name(request_user: &str) -> &str {
    match request_user.split_once('@') {
        Some((name, _domain)) => name,
        None => request_user,
    }
}

/// Cinnabar prints an all-zero changeset id when it has no metadata for a
/// commit.
fn is_valid_hg_sha(hg_sha: &str) -> bool {
    hg_sha.chars().any(|c| c != '0')
}

/// Drives one local clone against one source repository.
pub struct RepoSynchronizer {
    clone_directory: PathBuf,
    source_url: String,
}

impl RepoSynchronizer {
    pub fn new(clone_directory: PathBuf, source_url: impl Into<String>) -> Self {
        Self {
            clone_directory,
            source_url: source_url.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn clone_directory(&self) -> &Path {
        &self.clone_directory
    }

    /// Open (initializing if needed) the clone workspace.
    pub fn open_clone(&self) -> anyhow::Result<ClonedRepo> {
        ClonedRepo::open_or_init(&self.clone_directory)
    }

    /// Replay `operations` onto `destination_url`, attributing new commits
    /// to `request_user`.
    pub fn sync(
        &self,
        destination_url: &str,
        operations: &[SyncOperation],
        request_user: &str,
    ) -> Result<(), SyncError> {
        info!(
            destination_url,
            operations = operations.len(),
            "syncing operations to destination"
        );

        let repo = self
            .open_clone()
            .map_err(|source| SyncError::CloneSetup {
                destination_url: destination_url.to_string(),
                source,
            })?;

        let destination_remote = format!("hg::{destination_url}");

        self.ensure_cinnabar_metadata(&repo, &destination_remote)?;

        // Fetch the exact commits the operations reference from the source.
        let commits_to_fetch: Vec<&str> =
            operations.iter().map(SyncOperation::source_commit).collect();
        retry("fetching source commits", || {
            repo.fetch(&self.source_url, &commits_to_fetch)
        })?;

        let branch_ops: Vec<&SyncBranchOperation> = operations
            .iter()
            .filter_map(|op| match op {
                SyncOperation::Branch(op) => Some(op),
                SyncOperation::Tag(_) => None,
            })
            .collect();
        let tag_ops: Vec<&SyncTagOperation> = operations
            .iter()
            .filter_map(|op| match op {
                SyncOperation::Tag(op) => Some(op),
                SyncOperation::Branch(_) => None,
            })
            .collect();

        // (source ref, destination ref) pairs, pushed in order.
        let mut refs_to_push: Vec<(String, String)> = branch_ops
            .iter()
            .map(|op| {
                (
                    op.source_commit.clone(),
                    cinnabar_branch_ref(&op.destination_branch),
                )
            })
            .collect();

        // Tagging requires mercurial metadata on every commit reachable
        // from the pushed branches; the dry-run push with
        // cinnabar.data=force computes it without publishing anything.
        if !branch_ops.is_empty() {
            let refspecs: Vec<String> = refs_to_push
                .iter()
                .map(|(src, dst)| format!("{src}:{dst}"))
                .collect();
            retry("adding mercurial metadata to git commits", || {
                repo.dry_run_push_with_metadata(&destination_remote, &refspecs)
            })?;
        }

        if !tag_ops.is_empty() {
            let tag_branches_to_push = self.create_tags(
                &repo,
                &destination_remote,
                &tag_ops,
                request_user,
            )?;
            for branch in tag_branches_to_push {
                refs_to_push.push((branch.clone(), cinnabar_branch_ref(&branch)));
            }
        }

        if refs_to_push.is_empty() {
            warn!("no references to push resulted from processing this message");
            return Ok(());
        }

        debug!(?refs_to_push, "references to push");

        // One push per ref: a failure on a later ref must not take back an
        // already-published earlier one, and retries stay independent.
        for (src, dst) in &refs_to_push {
            let refspec = format!("{src}:{dst}");
            let force_create = !repo.remote_ref_exists(&destination_remote, dst)?;
            retry(&format!("pushing ref to destination {refspec}"), || {
                repo.push(&destination_remote, &refspec, force_create)
            })?;
        }

        Ok(())
    }

    /// Bring the destination's history (and the cinnabar hg2git/git2hg
    /// mappings) into the workspace. Needed only before the first push;
    /// later pushes update the metadata locally.
    fn ensure_cinnabar_metadata(
        &self,
        repo: &ClonedRepo,
        destination_remote: &str,
    ) -> Result<(), SyncError> {
        if repo.has_ref("refs/cinnabar/metadata")? {
            debug!("cinnabar metadata already present, not fetching");
            return Ok(());
        }

        retry("fetching commits from destination", || {
            self.fetch_all_from_remote(repo, destination_remote)
        })?;
        Ok(())
    }

    /// Graft-fetch everything from `remote`, treating an empty destination
    /// as success.
    pub fn fetch_all_from_remote(&self, repo: &ClonedRepo, remote: &str) -> anyhow::Result<()> {
        let result = repo.fetch_with_graft(remote)?;
        if result.success {
            return Ok(());
        }
        if result.stderr.trim_start().starts_with(EMPTY_REPO_SENTINEL) {
            debug!(remote, "destination repository is empty, nothing to fetch");
            return Ok(());
        }
        Err(anyhow!(
            "fetch from {remote} failed with exit code {:?}: {}",
            result.exit_code,
            result.stderr
        ))
    }

    /// Prepare the tags branches and create the requested tag commits.
    /// Returns the distinct tags branches that received work, in first-use
    /// order.
    fn create_tags(
        &self,
        repo: &ClonedRepo,
        destination_remote: &str,
        tag_ops: &[&SyncTagOperation],
        request_user: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.prepare_tag_branches(repo, destination_remote, tag_ops)?;

        let existing_tags = repo.cinnabar_tag_list()?;

        let author = author_name(request_user);
        let env = [
            (REQUEST_USER_ENV_VAR, request_user),
            ("GIT_AUTHOR_EMAIL", request_user),
            ("GIT_AUTHOR_NAME", author),
        ];
        debug!(request_user, "attributing tag commits");

        let mut tag_branches_to_push: Vec<String> = Vec::new();
        for op in tag_ops {
            if existing_tags.iter().any(|tag| tag == &op.tag) {
                warn!(tag = %op.tag, "tag already exists in cinnabar, skipping");
                continue;
            }

            let hg_sha = repo
                .git2hg(&op.source_commit)
                .map_err(|source| SyncError::Operation {
                    operation: SyncOperation::Tag((*op).clone()),
                    source,
                })?;
            if !is_valid_hg_sha(&hg_sha) {
                return Err(SyncError::MercurialMetadataNotFound {
                    commit: op.source_commit.clone(),
                    tag: op.tag.clone(),
                });
            }

            let message = tag_message(&hg_sha, &op.tag, &op.tag_message_suffix);
            let result = repo
                .cinnabar_tag(
                    &message,
                    &op.tags_destination_branch,
                    &op.tag,
                    &op.source_commit,
                    &env,
                )
                .map_err(|source| SyncError::Operation {
                    operation: SyncOperation::Tag((*op).clone()),
                    source,
                })?;

            if !result.success {
                // The listing above can race with a concurrent delivery
                // that created the same tag; duplication is not a failure.
                if result.stderr.contains(TAG_EXISTS_SENTINEL) {
                    warn!(tag = %op.tag, "tag was created concurrently, skipping");
                } else {
                    return Err(SyncError::Operation {
                        operation: SyncOperation::Tag((*op).clone()),
                        source: anyhow!(
                            "cinnabar tag failed with exit code {:?}: {}",
                            result.exit_code,
                            result.stderr
                        ),
                    });
                }
            }

            if !tag_branches_to_push.contains(&op.tags_destination_branch) {
                tag_branches_to_push.push(op.tags_destination_branch.clone());
            }
        }

        Ok(tag_branches_to_push)
    }

    /// Make every referenced tags branch exist locally: from the
    /// destination when it already has one, otherwise freshly created at
    /// the first tagged commit (reachable since the source fetch).
    fn prepare_tag_branches(
        &self,
        repo: &ClonedRepo,
        destination_remote: &str,
        tag_ops: &[&SyncTagOperation],
    ) -> Result<(), SyncError> {
        let mut prepared: Vec<&str> = Vec::new();
        for op in tag_ops {
            let branch = op.tags_destination_branch.as_str();
            if prepared.contains(&branch) {
                continue;
            }
            prepared.push(branch);

            self.prepare_tag_branch(repo, destination_remote, op)
                .map_err(|source| SyncError::Operation {
                    operation: SyncOperation::Tag((*op).clone()),
                    source,
                })?;
        }
        Ok(())
    }

    fn prepare_tag_branch(
        &self,
        repo: &ClonedRepo,
        destination_remote: &str,
        op: &SyncTagOperation,
    ) -> anyhow::Result<()> {
        let branch = &op.tags_destination_branch;
        let remote_ref = cinnabar_branch_ref(branch);

        if repo.remote_ref_exists(destination_remote, &remote_ref)? {
            debug!(branch, "updating tags branch from destination");
            repo.fetch_into_branch(destination_remote, &remote_ref, branch)?;
        } else if !repo.has_local_branch(branch)? {
            debug!(branch, commit = %op.source_commit, "creating tags branch");
            repo.create_branch(branch, &op.source_commit)?;
        }
        Ok(())
    }
}
