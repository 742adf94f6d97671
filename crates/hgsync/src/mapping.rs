//! Mapping engine: expand one push event into destination-scoped sync
//! operations.
//!
//! Branch and tag mappings come from the configuration file. Each mapping
//! carries an anchored pattern matched against branch/tag names; the
//! destination URL (and, for branches, the destination branch) are
//! substitution templates expanded with `$n` capture-group back-references
//! from the match.

use hgsync_config::{BranchMapping, Config, TagMapping};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde::Serialize;

use crate::events::Push;

/// Update one destination branch head to a source commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncBranchOperation {
    pub source_commit: String,
    pub destination_branch: String,
}

/// Record one tag on a dedicated tags branch of the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTagOperation {
    pub source_commit: String,
    pub tag: String,
    pub tags_destination_branch: String,
    pub tag_message_suffix: String,
}

/// One unit of work for the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOperation {
    Branch(SyncBranchOperation),
    Tag(SyncTagOperation),
}

impl SyncOperation {
    pub fn source_commit(&self) -> &str {
        match self {
            SyncOperation::Branch(op) => &op.source_commit,
            SyncOperation::Tag(op) => &op.source_commit,
        }
    }
}

/// A concrete destination URL paired with the operation to run there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingMatch {
    pub destination_url: String,
    pub operation: SyncOperation,
}

/// A mapping with its pattern compiled, ready to match events.
#[derive(Debug, Clone)]
pub enum Matcher {
    Branch(BranchMatcher),
    Tag(TagMatcher),
}

impl Matcher {
    /// All matches this mapping produces for `event`, in branch/tag order.
    pub fn matches(&self, event: &Push) -> Vec<MappingMatch> {
        match self {
            Matcher::Branch(matcher) => matcher.matches(event),
            Matcher::Tag(matcher) => matcher.matches(event),
        }
    }

    pub fn source_url(&self) -> &str {
        match self {
            Matcher::Branch(matcher) => &matcher.mapping.source_url,
            Matcher::Tag(matcher) => &matcher.mapping.source_url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BranchMatcher {
    mapping: BranchMapping,
    pattern: Regex,
}

impl BranchMatcher {
    pub fn new(mapping: BranchMapping) -> Result<Self, regex::Error> {
        let pattern = compile_anchored(&mapping.branch_pattern)?;
        Ok(Self { mapping, pattern })
    }

    fn matches(&self, event: &Push) -> Vec<MappingMatch> {
        if event.repo_url != self.mapping.source_url {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for (branch_name, commit) in &event.branches {
            let Some(caps) = self.pattern.captures(branch_name) else {
                continue;
            };
            matches.push(MappingMatch {
                destination_url: expand(&caps, &self.mapping.destination_url),
                operation: SyncOperation::Branch(SyncBranchOperation {
                    source_commit: commit.clone(),
                    destination_branch: expand(&caps, &self.mapping.destination_branch),
                }),
            });
        }
        matches
    }
}

#[derive(Debug, Clone)]
pub struct TagMatcher {
    mapping: TagMapping,
    pattern: Regex,
}

impl TagMatcher {
    pub fn new(mapping: TagMapping) -> Result<Self, regex::Error> {
        let pattern = compile_anchored(&mapping.tag_pattern)?;
        Ok(Self { mapping, pattern })
    }

    fn matches(&self, event: &Push) -> Vec<MappingMatch> {
        if event.repo_url != self.mapping.source_url {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for (tag, commit) in &event.tags {
            let Some(caps) = self.pattern.captures(tag) else {
                continue;
            };
            matches.push(MappingMatch {
                // The tags branch and message suffix are copied verbatim,
                // only the destination URL goes through substitution.
                destination_url: expand(&caps, &self.mapping.destination_url),
                operation: SyncOperation::Tag(SyncTagOperation {
                    source_commit: commit.clone(),
                    tag: tag.clone(),
                    tags_destination_branch: self.mapping.tags_destination_branch.clone(),
                    tag_message_suffix: self.mapping.tag_message_suffix.clone(),
                }),
            });
        }
        matches
    }
}

/// Compile all configured mappings, branch mappings first, preserving the
/// configuration-file order.
pub fn matchers_from_config(config: &Config) -> Result<Vec<Matcher>, regex::Error> {
    let mut matchers = Vec::new();
    for mapping in &config.branch_mappings {
        matchers.push(Matcher::Branch(BranchMatcher::new(mapping.clone())?));
    }
    for mapping in &config.tag_mappings {
        matchers.push(Matcher::Tag(TagMatcher::new(mapping.clone())?));
    }
    Ok(matchers)
}

/// Group the operations of every matching mapping by destination URL,
/// preserving the relative order in which mappings matched.
pub fn operations_by_destination(
    matchers: &[Matcher],
    event: &Push,
) -> IndexMap<String, Vec<SyncOperation>> {
    let mut grouped: IndexMap<String, Vec<SyncOperation>> = IndexMap::new();
    for matcher in matchers {
        for m in matcher.matches(event) {
            grouped.entry(m.destination_url).or_default().push(m.operation);
        }
    }
    grouped
}

/// Patterns match whole names, never substrings.
fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn expand(caps: &Captures<'_>, template: &str) -> String {
    let mut out = String::new();
    caps.expand(template, &mut out);
    out
}
