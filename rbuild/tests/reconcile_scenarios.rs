//! Reconcile scenarios against real repositories.
//!
//! Every test starts from a bare `origin` with two working clones: `client`
//! and `mirror` (the build server's checkout). Both sides are driven through
//! local `Git` endpoints, so these tests exercise the real git commands
//! without the HTTP layer.

use rbuild::core::decision::{ReconcileDecision, ReconcilePolicy, ReconcileStatus};
use rbuild::core::types::Side;
use rbuild::reconcile::reconcile;
use rbuild::test_support::TestRepo;

struct Sides {
    _origin: TestRepo,
    client: TestRepo,
    mirror: TestRepo,
}

fn sides() -> Sides {
    let seed = TestRepo::new().expect("seed");
    let origin = seed.bare_clone().expect("origin");
    Sides {
        client: origin.clone_repo().expect("client"),
        mirror: origin.clone_repo().expect("mirror"),
        _origin: origin,
    }
}

fn run(s: &Sides, policy: ReconcilePolicy) -> ReconcileDecision {
    reconcile(&s.client.git(), &s.mirror.git(), &policy)
}

fn branch(repo: &TestRepo) -> String {
    repo.run(&["rev-parse", "--abbrev-ref", "HEAD"])
        .expect("branch")
        .trim()
        .to_string()
}

#[test]
fn fresh_clones_are_aligned() {
    let s = sides();
    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(decision.status(), ReconcileStatus::Aligned);
    assert_eq!(decision.target().map(|t| t.branch.as_str()), Some("main"));
    assert!(decision.actions_applied().is_empty());
}

#[test]
fn client_commit_is_fetched_and_fast_forwarded_on_mirror() {
    let s = sides();
    s.client.write("App/main.swift", "print(1)\n").expect("write");
    let head = s.client.commit_all("feat: main").expect("commit");
    s.client.push().expect("push");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(decision.status(), ReconcileStatus::Reconciled);
    assert_eq!(decision.authority_side(), Some(Side::Client));
    assert_eq!(
        decision.actions_applied(),
        [
            "server:fetch_origin",
            "server:checkout_branch",
            "server:ff_only_to_commit"
        ]
    );
    assert_eq!(s.mirror.head().expect("head"), head);

    // A second pass finds nothing to do.
    assert_eq!(
        run(&s, ReconcilePolicy::default()).status(),
        ReconcileStatus::Aligned
    );
}

#[test]
fn mirror_commit_is_pulled_into_client() {
    let s = sides();
    s.mirror.write("Generated.swift", "let v = 2\n").expect("write");
    let head = s.mirror.commit_all("build: regenerate").expect("commit");
    s.mirror.push().expect("push");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(decision.status(), ReconcileStatus::Reconciled);
    assert_eq!(decision.authority_side(), Some(Side::Server));
    assert_eq!(
        decision.actions_applied(),
        [
            "client:fetch_origin",
            "client:checkout_branch",
            "client:ff_only_to_commit"
        ]
    );
    assert_eq!(s.client.head().expect("head"), head);
}

#[test]
fn unpushed_commit_blocks_as_missing_object() {
    let s = sides();
    s.client.write("local.txt", "only here\n").expect("write");
    let head = s.client.commit_all("wip").expect("commit");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(
        decision,
        ReconcileDecision::BlockedMissingCommitObject {
            side: Side::Server,
            commit: head,
            actions_applied: vec!["server:fetch_origin".to_string()],
        }
    );
}

#[test]
fn diverged_history_is_blocked_with_counts() {
    let s = sides();
    s.client.write("a.txt", "client\n").expect("write");
    s.client.commit_all("client work").expect("commit");
    s.client.push().expect("push");

    s.mirror.write("b.txt", "server\n").expect("write");
    s.mirror.commit_all("server work").expect("commit");
    s.mirror
        .run(&["push", "-q", "origin", "HEAD:refs/heads/server-side"])
        .expect("push");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(
        decision,
        ReconcileDecision::BlockedDivergedHistory {
            client_ahead: 1,
            server_ahead: 1,
            actions_applied: vec![
                "client:fetch_origin".to_string(),
                "server:fetch_origin".to_string()
            ],
        }
    );
}

#[test]
fn dirty_tracked_file_blocks_before_any_action() {
    let s = sides();
    s.mirror.write("b.txt", "server\n").expect("write");
    s.mirror.commit_all("server work").expect("commit");
    s.client.write("README.md", "edited\n").expect("write");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(
        decision,
        ReconcileDecision::BlockedDirtyWorktree {
            dirty_sides: vec![Side::Client],
            actions_applied: Vec::new(),
        }
    );
}

#[test]
fn dirty_tree_at_same_position_is_still_aligned() {
    let s = sides();
    s.client.write("README.md", "edited\n").expect("write");
    assert_eq!(
        run(&s, ReconcilePolicy::default()).status(),
        ReconcileStatus::Aligned
    );
}

#[test]
fn missing_origin_blocks_instead_of_fetching() {
    let client = TestRepo::new().expect("client");
    let mirror = client.clone_repo().expect("mirror");
    mirror.write("b.txt", "server\n").expect("write");
    let head = mirror.commit_all("server work").expect("commit");

    let decision = reconcile(&client.git(), &mirror.git(), &ReconcilePolicy::default());
    assert_eq!(
        decision,
        ReconcileDecision::BlockedNoOrigin {
            side: Side::Client,
            commit: head,
            actions_applied: Vec::new(),
        }
    );
}

#[test]
fn detached_authority_is_blocked() {
    let s = sides();
    s.mirror.write("b.txt", "server\n").expect("write");
    s.mirror.commit_all("server work").expect("commit");
    s.mirror.push().expect("push");
    s.mirror.run(&["checkout", "-q", "--detach", "HEAD"]).expect("detach");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(
        decision,
        ReconcileDecision::BlockedDetachedHead {
            side: Side::Server,
            actions_applied: vec!["client:fetch_origin".to_string()],
        }
    );
}

#[test]
fn new_client_branch_is_created_on_mirror() {
    let s = sides();
    s.client.run(&["checkout", "-q", "-b", "feature"]).expect("branch");
    s.client.write("feature.txt", "new\n").expect("write");
    let head = s.client.commit_all("feat: feature").expect("commit");
    s.client.push().expect("push");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(decision.status(), ReconcileStatus::Reconciled);
    assert_eq!(
        decision.actions_applied(),
        ["server:fetch_origin", "server:checkout_branch_at_commit"]
    );
    assert_eq!(branch(&s.mirror), "feature");
    assert_eq!(s.mirror.head().expect("head"), head);
}

#[test]
fn branch_mismatch_at_same_commit_follows_tie_break() {
    let s = sides();
    s.client.run(&["checkout", "-q", "-b", "topic"]).expect("branch");

    let decision = run(&s, ReconcilePolicy::default());
    assert_eq!(decision.status(), ReconcileStatus::Reconciled);
    assert_eq!(
        decision.actions_applied(),
        ["server:checkout_branch_at_commit"]
    );
    assert_eq!(branch(&s.mirror), "topic");
}

#[test]
fn server_tie_break_moves_client_instead() {
    let s = sides();
    s.client.run(&["checkout", "-q", "-b", "topic"]).expect("branch");

    let decision = run(
        &s,
        ReconcilePolicy {
            tie_break: Side::Server,
        },
    );
    assert_eq!(decision.status(), ReconcileStatus::Reconciled);
    assert_eq!(decision.authority_side(), Some(Side::Server));
    assert_eq!(decision.actions_applied(), ["client:checkout_branch"]);
    assert_eq!(branch(&s.client), "main");
}
