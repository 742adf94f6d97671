//! Inbound event model.
//!
//! Push is the only event type the service accepts today; the closed
//! [`Event`] enum keeps the decode path extensible without opening the door
//! to unknown payloads (those are rejected at decode time).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A push observed on the source forge: updated branch heads and tags,
/// plus attribution scalars carried through for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub repo_url: String,
    /// Branch name to commit id.
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    /// Tag name to commit id.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub time: i64,
    #[serde(alias = "pushid")]
    pub push_id: u64,
    pub user: String,
    pub push_json_url: String,
}

impl Push {
    /// A push must carry at least one branch or tag update; decoding
    /// rejects events for which this is false.
    pub fn has_work(&self) -> bool {
        !self.branches.is_empty() || !self.tags.is_empty()
    }
}

/// The closed set of events the pipeline handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Push(Push),
}

impl Event {
    /// Source repository URL the event refers to.
    pub fn repo_url(&self) -> &str {
        match self {
            Event::Push(push) => &push.repo_url,
        }
    }
}
