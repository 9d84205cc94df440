//! Pure reconcile decision logic.
//!
//! [`compute_decision`] looks only at two snapshots and an ahead/behind count.
//! Fetching, gating and applying actions live in [`crate::reconcile`].

use serde::{Deserialize, Serialize};

use crate::core::types::{AheadBehind, GitState, Side, Target};

/// Knobs for choices the decision algorithm cannot derive from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilePolicy {
    /// Side that wins when neither side is ahead of the other.
    pub tie_break: Side,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            tie_break: Side::Client,
        }
    }
}

/// Outcome of comparing (and possibly reconciling) two repositories.
///
/// `NeedsAction` is the only non-terminal variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileDecision {
    Aligned {
        target: Target,
    },
    NeedsAction {
        authority_side: Side,
        target: Target,
    },
    Reconciled {
        authority_side: Side,
        target: Target,
        actions_applied: Vec<String>,
    },
    BlockedDirtyWorktree {
        dirty_sides: Vec<Side>,
        actions_applied: Vec<String>,
    },
    BlockedMissingCommitObject {
        side: Side,
        commit: String,
        actions_applied: Vec<String>,
    },
    BlockedDivergedHistory {
        client_ahead: u32,
        server_ahead: u32,
        actions_applied: Vec<String>,
    },
    BlockedDetachedHead {
        side: Side,
        actions_applied: Vec<String>,
    },
    BlockedNoOrigin {
        side: Side,
        commit: String,
        actions_applied: Vec<String>,
    },
    Error {
        message: String,
        actions_applied: Vec<String>,
    },
}

/// Flat status tag of a [`ReconcileDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileStatus {
    Aligned,
    NeedsAction,
    Reconciled,
    BlockedDirtyWorktree,
    BlockedMissingCommitObject,
    BlockedDivergedHistory,
    BlockedDetachedHead,
    BlockedNoOrigin,
    Error,
}

impl ReconcileStatus {
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ReconcileStatus::BlockedDirtyWorktree
                | ReconcileStatus::BlockedMissingCommitObject
                | ReconcileStatus::BlockedDivergedHistory
                | ReconcileStatus::BlockedDetachedHead
                | ReconcileStatus::BlockedNoOrigin
        )
    }

    /// True when both sides agree and change transfer may proceed.
    pub fn is_in_sync(self) -> bool {
        matches!(self, ReconcileStatus::Aligned | ReconcileStatus::Reconciled)
    }
}

impl ReconcileDecision {
    pub fn error(message: impl Into<String>, actions_applied: Vec<String>) -> Self {
        ReconcileDecision::Error {
            message: message.into(),
            actions_applied,
        }
    }

    pub fn status(&self) -> ReconcileStatus {
        match self {
            ReconcileDecision::Aligned { .. } => ReconcileStatus::Aligned,
            ReconcileDecision::NeedsAction { .. } => ReconcileStatus::NeedsAction,
            ReconcileDecision::Reconciled { .. } => ReconcileStatus::Reconciled,
            ReconcileDecision::BlockedDirtyWorktree { .. } => ReconcileStatus::BlockedDirtyWorktree,
            ReconcileDecision::BlockedMissingCommitObject { .. } => {
                ReconcileStatus::BlockedMissingCommitObject
            }
            ReconcileDecision::BlockedDivergedHistory { .. } => {
                ReconcileStatus::BlockedDivergedHistory
            }
            ReconcileDecision::BlockedDetachedHead { .. } => ReconcileStatus::BlockedDetachedHead,
            ReconcileDecision::BlockedNoOrigin { .. } => ReconcileStatus::BlockedNoOrigin,
            ReconcileDecision::Error { .. } => ReconcileStatus::Error,
        }
    }

    /// Authoritative side, if one was chosen.
    pub fn authority_side(&self) -> Option<Side> {
        match self {
            ReconcileDecision::NeedsAction { authority_side, .. }
            | ReconcileDecision::Reconciled { authority_side, .. } => Some(*authority_side),
            ReconcileDecision::Aligned { .. }
            | ReconcileDecision::BlockedDirtyWorktree { .. }
            | ReconcileDecision::BlockedMissingCommitObject { .. }
            | ReconcileDecision::BlockedDivergedHistory { .. }
            | ReconcileDecision::BlockedDetachedHead { .. }
            | ReconcileDecision::BlockedNoOrigin { .. }
            | ReconcileDecision::Error { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            ReconcileDecision::Aligned { target }
            | ReconcileDecision::NeedsAction { target, .. }
            | ReconcileDecision::Reconciled { target, .. } => Some(target),
            ReconcileDecision::BlockedDirtyWorktree { .. }
            | ReconcileDecision::BlockedMissingCommitObject { .. }
            | ReconcileDecision::BlockedDivergedHistory { .. }
            | ReconcileDecision::BlockedDetachedHead { .. }
            | ReconcileDecision::BlockedNoOrigin { .. }
            | ReconcileDecision::Error { .. } => None,
        }
    }

    pub fn actions_applied(&self) -> &[String] {
        match self {
            ReconcileDecision::Aligned { .. } | ReconcileDecision::NeedsAction { .. } => &[],
            ReconcileDecision::Reconciled {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDirtyWorktree {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedMissingCommitObject {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDivergedHistory {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDetachedHead {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedNoOrigin {
                actions_applied, ..
            }
            | ReconcileDecision::Error {
                actions_applied, ..
            } => actions_applied,
        }
    }

    /// Prefix actions that ran before this decision was computed (fetches).
    pub fn with_prior_actions(mut self, prior: &[String]) -> Self {
        if prior.is_empty() {
            return self;
        }
        match &mut self {
            ReconcileDecision::Aligned { .. } | ReconcileDecision::NeedsAction { .. } => {}
            ReconcileDecision::Reconciled {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDirtyWorktree {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedMissingCommitObject {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDivergedHistory {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedDetachedHead {
                actions_applied, ..
            }
            | ReconcileDecision::BlockedNoOrigin {
                actions_applied, ..
            }
            | ReconcileDecision::Error {
                actions_applied, ..
            } => {
                let mut merged = prior.to_vec();
                merged.append(actions_applied);
                *actions_applied = merged;
            }
        }
        self
    }

    /// Human-readable cause, suitable for printing as-is.
    pub fn message(&self) -> String {
        match self {
            ReconcileDecision::Aligned { target } => format!(
                "already aligned on '{}' at {}",
                target.branch,
                short(&target.commit)
            ),
            ReconcileDecision::NeedsAction {
                authority_side,
                target,
            } => format!(
                "{authority_side} is authoritative; {} must move to '{}' at {}",
                authority_side.other(),
                target.branch,
                short(&target.commit)
            ),
            ReconcileDecision::Reconciled {
                authority_side,
                target,
                ..
            } => format!(
                "{} moved to '{}' at {}",
                authority_side.other(),
                target.branch,
                short(&target.commit)
            ),
            ReconcileDecision::BlockedDirtyWorktree { dirty_sides, .. } => {
                let sides: Vec<&str> = dirty_sides.iter().map(|s| s.as_str()).collect();
                format!(
                    "uncommitted changes to tracked files on {}; commit or stash them before syncing",
                    sides.join(" and ")
                )
            }
            ReconcileDecision::BlockedMissingCommitObject { side, commit, .. } => format!(
                "{side} cannot resolve commit {} even after fetching origin; push it to origin first",
                short(commit)
            ),
            ReconcileDecision::BlockedDivergedHistory {
                client_ahead,
                server_ahead,
                ..
            } => format!(
                "histories diverged (client ahead by {client_ahead}, server ahead by {server_ahead}); merge manually"
            ),
            ReconcileDecision::BlockedDetachedHead { side, .. } => format!(
                "{side} is authoritative but has a detached HEAD; check out a branch first"
            ),
            ReconcileDecision::BlockedNoOrigin { side, commit, .. } => format!(
                "{side} is missing commit {} and has no origin remote to fetch it from",
                short(commit)
            ),
            ReconcileDecision::Error { message, .. } => message.clone(),
        }
    }

    pub fn report(&self) -> ReconcileReport {
        let target = self.target();
        ReconcileReport {
            status: self.status(),
            authority_side: self
                .authority_side()
                .map(Side::as_str)
                .unwrap_or("none")
                .to_string(),
            target_branch: target.map(|t| t.branch.clone()).unwrap_or_default(),
            target_commit: target.map(|t| t.commit.clone()).unwrap_or_default(),
            actions_applied: self.actions_applied().to_vec(),
            message: self.message(),
        }
    }
}

/// Flat, serializable view of a decision for printing and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub authority_side: String,
    pub target_branch: String,
    pub target_commit: String,
    pub actions_applied: Vec<String>,
    pub message: String,
}

/// Decide what (if anything) must change so both sides agree.
///
/// `ahead_behind` counts `client...server`; it is ignored when heads match.
pub fn compute_decision(
    client: &GitState,
    server: &GitState,
    ahead_behind: AheadBehind,
    policy: &ReconcilePolicy,
) -> ReconcileDecision {
    if client.same_position(server) {
        return ReconcileDecision::Aligned {
            target: target_of(client),
        };
    }

    let authority = if client.head == server.head {
        policy.tie_break
    } else {
        match (ahead_behind.left_ahead > 0, ahead_behind.right_ahead > 0) {
            (true, true) => {
                return ReconcileDecision::BlockedDivergedHistory {
                    client_ahead: ahead_behind.left_ahead,
                    server_ahead: ahead_behind.right_ahead,
                    actions_applied: Vec::new(),
                };
            }
            (true, false) => Side::Client,
            (false, true) => Side::Server,
            (false, false) => policy.tie_break,
        }
    };

    let authoritative = match authority {
        Side::Client => client,
        Side::Server => server,
    };
    if authoritative.is_detached {
        return ReconcileDecision::BlockedDetachedHead {
            side: authority,
            actions_applied: Vec::new(),
        };
    }

    ReconcileDecision::NeedsAction {
        authority_side: authority,
        target: target_of(authoritative),
    }
}

fn target_of(state: &GitState) -> Target {
    Target {
        branch: state.current_branch.clone(),
        commit: state.head.clone(),
    }
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}
