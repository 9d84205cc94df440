//! Reconciliation of client and server git state.
//!
//! [`plan`] snapshots both sides, applies the gating rules (dirty trees,
//! missing commits) and asks [`compute_decision`] what to do. [`apply_actions`]
//! carries out a `NeedsAction` plan on the non-authoritative side and verifies
//! the result. [`reconcile`] does both.
//!
//! The engine never trusts cached state: every call re-reads both sides, so
//! re-running after an `ERROR` is safe.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{ReconcileDecision, ReconcilePolicy, compute_decision};
use crate::core::types::{
    ActionOutcome, AheadBehind, CommandResult, GitAction, GitState, Side, Target,
};
use crate::io::git::Git;

/// One side of a reconciliation: a local repository or a remote peer.
pub trait GitEndpoint {
    fn snapshot(&self) -> Result<GitState>;
    fn execute(&self, action: &GitAction) -> Result<ActionOutcome>;
}

impl GitEndpoint for Git {
    fn snapshot(&self) -> Result<GitState> {
        Git::snapshot(self)
    }

    fn execute(&self, action: &GitAction) -> Result<ActionOutcome> {
        Git::execute(self, action)
    }
}

/// Decision plus any actions (fetches) already run while computing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub decision: ReconcileDecision,
    pub prior_actions: Vec<String>,
}

struct Sides<'a> {
    client: &'a dyn GitEndpoint,
    server: &'a dyn GitEndpoint,
}

impl<'a> Sides<'a> {
    fn get(&self, side: Side) -> &'a dyn GitEndpoint {
        match side {
            Side::Client => self.client,
            Side::Server => self.server,
        }
    }
}

/// Compare both sides and run the whole reconcile cycle.
pub fn reconcile(
    client: &dyn GitEndpoint,
    server: &dyn GitEndpoint,
    policy: &ReconcilePolicy,
) -> ReconcileDecision {
    let plan = plan(client, server, policy);
    apply_actions(plan, client, server)
}

/// Snapshot, gate and decide. Only fetches may run here.
#[instrument(skip_all)]
pub fn plan(
    client: &dyn GitEndpoint,
    server: &dyn GitEndpoint,
    policy: &ReconcilePolicy,
) -> Plan {
    let sides = Sides { client, server };
    let mut log = Vec::new();
    let decision = match plan_inner(&sides, policy, &mut log) {
        Ok(decision) => decision,
        Err(err) => ReconcileDecision::error(format!("{err:#}"), Vec::new()),
    };
    debug!(status = ?decision.status(), prior = log.len(), "plan computed");
    Plan {
        decision,
        prior_actions: log,
    }
}

fn plan_inner(
    sides: &Sides<'_>,
    policy: &ReconcilePolicy,
    log: &mut Vec<String>,
) -> Result<ReconcileDecision> {
    let client = read_state(sides, Side::Client)?;
    let server = read_state(sides, Side::Server)?;

    if client.same_position(&server) {
        return Ok(compute_decision(
            &client,
            &server,
            AheadBehind::default(),
            policy,
        ));
    }

    let dirty_sides: Vec<Side> = [(Side::Client, &client), (Side::Server, &server)]
        .into_iter()
        .filter(|(_, state)| state.dirty_tracked)
        .map(|(side, _)| side)
        .collect();
    if !dirty_sides.is_empty() {
        warn!(?dirty_sides, "refusing to reconcile dirty worktree");
        return Ok(ReconcileDecision::BlockedDirtyWorktree {
            dirty_sides,
            actions_applied: Vec::new(),
        });
    }

    for (side, state, wanted) in [
        (Side::Client, &client, &server.head),
        (Side::Server, &server, &client.head),
    ] {
        if let Some(blocked) = ensure_commit(sides.get(side), side, state, wanted, log)? {
            return Ok(blocked);
        }
    }

    let counts = if client.head == server.head {
        AheadBehind::default()
    } else {
        let query = GitAction::AheadBehind {
            left: client.head.clone(),
            right: server.head.clone(),
        };
        match sides.client.execute(&query)? {
            ActionOutcome::AheadBehind(counts) => counts,
            other => return Err(anyhow!("client: unexpected ahead_behind outcome {other:?}")),
        }
    };
    debug!(
        client_ahead = counts.left_ahead,
        server_ahead = counts.right_ahead,
        "ahead/behind"
    );

    Ok(compute_decision(&client, &server, counts, policy))
}

/// Make sure `side` can resolve `commit`, fetching from origin once if needed.
///
/// Returns a blocked decision when the commit stays out of reach.
fn ensure_commit(
    endpoint: &dyn GitEndpoint,
    side: Side,
    state: &GitState,
    commit: &str,
    log: &mut Vec<String>,
) -> Result<Option<ReconcileDecision>> {
    if has_commit(endpoint, side, commit)? {
        return Ok(None);
    }
    if !state.has_origin {
        return Ok(Some(ReconcileDecision::BlockedNoOrigin {
            side,
            commit: commit.to_string(),
            actions_applied: Vec::new(),
        }));
    }

    info!(%side, commit, "commit missing, fetching origin");
    let fetch = run_step(endpoint, side, &GitAction::FetchOrigin, log)?;
    if !fetch.success {
        return Err(anyhow!(
            "{side}: fetch_origin failed: {}",
            fetch.stderr.trim()
        ));
    }
    if has_commit(endpoint, side, commit)? {
        return Ok(None);
    }
    Ok(Some(ReconcileDecision::BlockedMissingCommitObject {
        side,
        commit: commit.to_string(),
        actions_applied: Vec::new(),
    }))
}

/// Carry out a `NeedsAction` plan; any other plan is returned as-is.
#[instrument(skip_all)]
pub fn apply_actions(
    plan: Plan,
    client: &dyn GitEndpoint,
    server: &dyn GitEndpoint,
) -> ReconcileDecision {
    let Plan {
        decision,
        prior_actions,
    } = plan;
    let (authority_side, target) = match decision {
        ReconcileDecision::NeedsAction {
            authority_side,
            target,
        } => (authority_side, target),
        ReconcileDecision::Aligned { .. }
        | ReconcileDecision::Reconciled { .. }
        | ReconcileDecision::BlockedDirtyWorktree { .. }
        | ReconcileDecision::BlockedMissingCommitObject { .. }
        | ReconcileDecision::BlockedDivergedHistory { .. }
        | ReconcileDecision::BlockedDetachedHead { .. }
        | ReconcileDecision::BlockedNoOrigin { .. }
        | ReconcileDecision::Error { .. } => return decision.with_prior_actions(&prior_actions),
    };

    let sides = Sides { client, server };
    let mut log = prior_actions;
    let side = authority_side.other();
    info!(%authority_side, branch = %target.branch, commit = %target.commit, "applying reconcile actions");

    if let Err(err) = move_to_target(&sides, side, &target, &mut log) {
        return ReconcileDecision::error(format!("{err:#}"), log);
    }

    let finals = read_state(&sides, Side::Client)
        .and_then(|client| read_state(&sides, Side::Server).map(|server| (client, server)));
    let (client_final, server_final) = match finals {
        Ok(states) => states,
        Err(err) => return ReconcileDecision::error(format!("{err:#}"), log),
    };

    let on_target = |state: &GitState| {
        state.head == target.commit && state.current_branch == target.branch
    };
    if !on_target(&client_final) || !on_target(&server_final) {
        warn!(
            client_head = %client_final.head,
            server_head = %server_final.head,
            "post-reconcile validation failed"
        );
        return ReconcileDecision::error(
            format!(
                "post-reconcile validation failed: client at '{}' {}, server at '{}' {}, expected '{}' {}",
                client_final.current_branch,
                client_final.head,
                server_final.current_branch,
                server_final.head,
                target.branch,
                target.commit
            ),
            log,
        );
    }

    info!(branch = %target.branch, commit = %target.commit, "reconciled");
    ReconcileDecision::Reconciled {
        authority_side,
        target,
        actions_applied: log,
    }
}

/// Checkout (or create) the target branch on `side`, then fast-forward if needed.
fn move_to_target(
    sides: &Sides<'_>,
    side: Side,
    target: &Target,
    log: &mut Vec<String>,
) -> Result<()> {
    let endpoint = sides.get(side);
    let state = read_state(sides, side)?;
    let checkout = if state.branches.contains(&target.branch) {
        GitAction::CheckoutBranch {
            branch: target.branch.clone(),
        }
    } else {
        GitAction::CheckoutBranchAtCommit {
            branch: target.branch.clone(),
            commit: target.commit.clone(),
        }
    };
    run_required(endpoint, side, &checkout, log)?;

    let state = read_state(sides, side)?;
    if state.head != target.commit {
        let ff = GitAction::FfOnlyToCommit {
            commit: target.commit.clone(),
        };
        run_required(endpoint, side, &ff, log)?;
    }
    Ok(())
}

fn read_state(sides: &Sides<'_>, side: Side) -> Result<GitState> {
    sides
        .get(side)
        .snapshot()
        .map_err(|err| anyhow!("{side}: read git state: {err:#}"))
}

fn has_commit(endpoint: &dyn GitEndpoint, side: Side, commit: &str) -> Result<bool> {
    let query = GitAction::HasCommit {
        commit: commit.to_string(),
    };
    match endpoint.execute(&query)? {
        ActionOutcome::HasCommit { present } => Ok(present),
        other => Err(anyhow!("{side}: unexpected has_commit outcome {other:?}")),
    }
}

/// Log and run a mutating action. The log entry is written before running.
fn run_step(
    endpoint: &dyn GitEndpoint,
    side: Side,
    action: &GitAction,
    log: &mut Vec<String>,
) -> Result<CommandResult> {
    log.push(format!("{side}:{}", action.name()));
    match endpoint
        .execute(action)
        .map_err(|err| anyhow!("{side}: {}: {err:#}", action.name()))?
    {
        ActionOutcome::Command(result) => Ok(result),
        other => Err(anyhow!(
            "{side}: unexpected {} outcome {other:?}",
            action.name()
        )),
    }
}

fn run_required(
    endpoint: &dyn GitEndpoint,
    side: Side,
    action: &GitAction,
    log: &mut Vec<String>,
) -> Result<()> {
    let result = run_step(endpoint, side, action, log)?;
    if !result.success {
        return Err(anyhow!(
            "{side}: {} failed (exit {:?}): {}",
            action.name(),
            result.returncode,
            result.stderr.trim()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::ReconcileStatus;
    use crate::test_support::git_state;
    use std::cell::RefCell;

    /// Endpoint with a fixed snapshot that records every action it is asked to run.
    struct FakeEndpoint {
        state: Option<GitState>,
        has_commits: bool,
        ahead: AheadBehind,
        calls: RefCell<Vec<&'static str>>,
    }

    impl FakeEndpoint {
        fn new(state: GitState) -> Self {
            Self {
                state: Some(state),
                has_commits: true,
                ahead: AheadBehind::default(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl GitEndpoint for FakeEndpoint {
        fn snapshot(&self) -> Result<GitState> {
            self.state.clone().ok_or_else(|| anyhow!("HEAD unreadable"))
        }

        fn execute(&self, action: &GitAction) -> Result<ActionOutcome> {
            self.calls.borrow_mut().push(action.name());
            Ok(match action {
                GitAction::HasCommit { .. } => ActionOutcome::HasCommit {
                    present: self.has_commits,
                },
                GitAction::AheadBehind { .. } => ActionOutcome::AheadBehind(self.ahead),
                _ => ActionOutcome::Command(CommandResult {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                    returncode: Some(0),
                }),
            })
        }
    }

    #[test]
    fn dirty_tree_blocks_before_any_action() {
        let mut client_state = git_state("aaaa1111", "main");
        client_state.dirty_tracked = true;
        let client = FakeEndpoint::new(client_state);
        let server = FakeEndpoint::new(git_state("bbbb2222", "main"));

        let decision = reconcile(&client, &server, &ReconcilePolicy::default());
        assert_eq!(
            decision,
            ReconcileDecision::BlockedDirtyWorktree {
                dirty_sides: vec![Side::Client],
                actions_applied: Vec::new(),
            }
        );
        assert!(client.calls.borrow().is_empty());
        assert!(server.calls.borrow().is_empty());
    }

    #[test]
    fn unreadable_state_is_an_error() {
        let client = FakeEndpoint::new(git_state("aaaa1111", "main"));
        let mut server = FakeEndpoint::new(git_state("aaaa1111", "main"));
        server.state = None;

        let decision = reconcile(&client, &server, &ReconcilePolicy::default());
        assert_eq!(decision.status(), ReconcileStatus::Error);
        assert!(decision.message().contains("server: read git state"));
    }

    #[test]
    fn missing_commit_without_origin_is_blocked() {
        let client = FakeEndpoint::new(git_state("aaaa1111", "main"));
        let mut server_state = git_state("bbbb2222", "main");
        server_state.has_origin = false;
        let mut server = FakeEndpoint::new(server_state);
        server.has_commits = false;

        let decision = reconcile(&client, &server, &ReconcilePolicy::default());
        assert_eq!(decision.status(), ReconcileStatus::BlockedNoOrigin);
        assert_eq!(*server.calls.borrow(), vec!["has_commit"]);
    }

    #[test]
    fn missing_commit_after_fetch_keeps_fetch_in_log() {
        let client = FakeEndpoint::new(git_state("aaaa1111", "main"));
        let mut server = FakeEndpoint::new(git_state("bbbb2222", "main"));
        server.has_commits = false;

        let decision = reconcile(&client, &server, &ReconcilePolicy::default());
        assert_eq!(
            decision,
            ReconcileDecision::BlockedMissingCommitObject {
                side: Side::Server,
                commit: "aaaa1111".to_string(),
                actions_applied: vec!["server:fetch_origin".to_string()],
            }
        );
    }

    #[test]
    fn non_needs_action_plans_pass_through_apply() {
        let client = FakeEndpoint::new(git_state("aaaa1111", "main"));
        let server = FakeEndpoint::new(git_state("aaaa1111", "main"));
        let plan = Plan {
            decision: ReconcileDecision::Aligned {
                target: Target {
                    branch: "main".to_string(),
                    commit: "aaaa1111".to_string(),
                },
            },
            prior_actions: Vec::new(),
        };

        let decision = apply_actions(plan, &client, &server);
        assert_eq!(decision.status(), ReconcileStatus::Aligned);
        assert!(client.calls.borrow().is_empty());
    }

    #[test]
    fn unchanged_state_after_actions_fails_validation() {
        // The fake accepts every action but never moves, so verification must catch it.
        let mut client = FakeEndpoint::new(git_state("aaaa1111", "main"));
        client.ahead = AheadBehind {
            left_ahead: 1,
            right_ahead: 0,
        };
        let server = FakeEndpoint::new(git_state("bbbb2222", "main"));

        let decision = reconcile(&client, &server, &ReconcilePolicy::default());
        assert_eq!(decision.status(), ReconcileStatus::Error);
        assert!(decision.message().contains("post-reconcile validation failed"));
        assert_eq!(
            decision.actions_applied(),
            ["server:checkout_branch", "server:ff_only_to_commit"]
        );
    }
}
