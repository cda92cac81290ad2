//! End-to-end coordinator scenarios against a real git repository, an
//! in-memory store and scripted workers

mod common;

use assert_matches::assert_matches;
use common::{work_item, Behavior, Harness};

use conductor::workers::marker::{write_marker, WorkerOutcome};
use conductor::AppError;
use conductor_core::agent_instance::AgentState;
use conductor_core::clock::Clock;
use conductor_core::work_item::{BlockedReason, Role, WorkItem, WorkItemId, WorkItemStatus};

fn id(raw: &str) -> WorkItemId {
    WorkItemId::new(raw)
}

#[tokio::test]
async fn test_independent_items_run_in_parallel_and_conflicting_one_waits() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["x.py"])).await;
    h.add(work_item("B", Role::Tester, &["tests/b.py"])).await;
    h.add(work_item("C", Role::Reviewer, &["x.py"])).await;
    h.launcher.script("A", vec![Behavior::edit("x.py", "print('a')\n")]);
    h.launcher
        .script("B", vec![Behavior::edit("tests/b.py", "def test_b(): pass\n")]);
    h.launcher.script("C", vec![Behavior::edit("x.py", "print('c')\n")]);

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.started_ids(), vec![id("A"), id("B")]);
    assert_eq!(first.schedule.deferred.len(), 1);
    let deferred = &first.schedule.deferred[0];
    assert_eq!(deferred.work_item_id, id("C"));
    assert_eq!(deferred.conflicts_with, vec![id("A")]);
    assert_eq!(deferred.paths, vec!["x.py".to_string()]);
    assert_eq!(h.item("A").await.status, WorkItemStatus::Running);
    assert_eq!(h.item("C").await.status, WorkItemStatus::Pending);

    let second = h.coordinator().tick().await.unwrap();
    assert_eq!(second.poll.integrated.len(), 2);
    assert_eq!(second.schedule.started_ids(), vec![id("C")]);
    assert_eq!(h.main_file("x.py").as_deref(), Some("print('a')\n"));
    assert_eq!(
        h.main_file("tests/b.py").as_deref(),
        Some("def test_b(): pass\n")
    );

    let third = h.coordinator().tick().await.unwrap();
    assert_eq!(third.poll.integrated, vec![id("C")]);
    assert!(third.is_idle());
    assert_eq!(h.main_file("x.py").as_deref(), Some("print('c')\n"));

    for raw in ["A", "B", "C"] {
        assert_eq!(h.item(raw).await.status, WorkItemStatus::Succeeded);
        assert!(!h.workspace_path(raw, 1).exists());
    }
    assert_eq!(h.events_of_kind("work_item_integrated").await.len(), 3);
    assert_eq!(h.events_of_kind("batch_scheduled").await.len(), 2);

    // Nobody holds the reviewer role, so review requests go to the fallback
    let coder_inbox = h.mailbox.inbox(Role::Coder, 10).await.unwrap();
    assert_eq!(
        coder_inbox
            .iter()
            .filter(|m| m.intent.as_deref() == Some("review"))
            .count(),
        3
    );
    assert!(coder_inbox.iter().all(|m| m.routed_via_fallback));
}

#[tokio::test]
async fn test_hung_worker_is_killed_retried_once_then_blocked() {
    let h = Harness::new().await;
    h.add(work_item("D", Role::Tester, &["tests/d.py"])).await;
    h.launcher.script("D", vec![Behavior::Hang]);

    let started = h.coordinator().tick().await.unwrap();
    assert_eq!(started.schedule.started_ids(), vec![id("D")]);
    let first_pid = h.launcher.pid_of("D").unwrap();

    // Within the tester timeout the worker is left alone
    h.advance(30);
    let waiting = h.coordinator().tick().await.unwrap();
    assert_eq!(waiting.poll.running, 1);
    assert!(waiting.poll.hung.is_empty());

    h.advance(31);
    let hung = h.coordinator().tick().await.unwrap();
    assert_eq!(hung.poll.hung, vec![id("D")]);
    assert_eq!(hung.poll.retrying, vec![id("D")]);
    assert!(hung.schedule.started.is_empty());
    assert_eq!(hung.awaiting_retry, 1);
    assert!(h.launcher.terminated().contains(&first_pid));
    let failed = h.item("D").await;
    assert_eq!(failed.status, WorkItemStatus::Failed);
    assert!(failed.next_attempt_at.is_some());
    assert!(!h.workspace_path("D", 1).exists());

    h.advance(6);
    let retried = h.coordinator().tick().await.unwrap();
    assert_eq!(retried.schedule.started.len(), 1);
    assert_eq!(retried.schedule.started[0].attempt, 2);

    h.advance(61);
    let blocked = h.coordinator().tick().await.unwrap();
    assert_eq!(blocked.poll.blocked, vec![id("D")]);
    let item = h.item("D").await;
    assert_eq!(item.status, WorkItemStatus::Blocked);
    assert_eq!(item.attempts, 2);
    assert_eq!(item.blocked_reason, Some(BlockedReason::Hung { attempts: 2 }));
    assert!(h
        .workspace_path("D", 2)
        .join(".conductor")
        .join("QUARANTINE")
        .exists());

    let instances = h
        .storage
        .agent_instances()
        .list_for_work_item(&id("D"))
        .await
        .unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.state == AgentState::Killed));
    assert_eq!(h.launcher.terminated().len(), 2);

    assert_eq!(h.events_of_kind("instance_hung").await.len(), 2);
    let failures = h.events_of_kind("instance_failed").await;
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|event| event.payload["category"] == "agent_hung"));
    assert_eq!(h.events_of_kind("work_item_blocked").await.len(), 1);

    // Planner is not running, so triage lands with the integrator
    let triage = h.mailbox.inbox(Role::Integrator, 10).await.unwrap();
    assert_eq!(triage.len(), 1);
    assert_eq!(triage[0].intent.as_deref(), Some("triage"));
    assert_eq!(triage[0].work_item_id, Some(id("D")));
    assert!(triage[0].routed_via_fallback);

    // Blocked items are never picked up again
    h.advance(600);
    let idle = h.coordinator().tick().await.unwrap();
    assert!(idle.is_idle());
}

#[tokio::test]
async fn test_undeclared_overlap_blocks_the_second_merge() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["x.py"])).await;
    // Declares an unrelated file but edits x.py anyway
    h.add(work_item("B", Role::Tester, &["b.txt"])).await;
    h.launcher.script("A", vec![Behavior::edit("x.py", "print('a')\n")]);
    h.launcher.script("B", vec![Behavior::edit("x.py", "print('b')\n")]);

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.started.len(), 2);

    let second = h.coordinator().tick().await.unwrap();
    assert_eq!(second.poll.integrated.len(), 1);
    assert_eq!(second.poll.blocked.len(), 1);

    let winner = second.poll.integrated[0].clone();
    let loser = second.poll.blocked[0].clone();
    assert_ne!(winner, loser);

    let blocked = h.item(loser.as_str()).await;
    assert_eq!(blocked.status, WorkItemStatus::Blocked);
    assert_eq!(
        blocked.blocked_reason,
        Some(BlockedReason::MergeConflict {
            paths: vec!["x.py".to_string()]
        })
    );
    let expected = if winner == id("A") { "print('a')\n" } else { "print('b')\n" };
    assert_eq!(h.main_file("x.py").as_deref(), Some(expected));

    let quarantined = h.workspace_path(loser.as_str(), 1);
    assert!(quarantined.join(".conductor").join("QUARANTINE").exists());
    assert_eq!(h.events_of_kind("merge_conflict").await.len(), 1);
    assert_eq!(h.events_of_kind("work_item_blocked").await.len(), 1);

    let triage = h.mailbox.inbox(Role::Integrator, 10).await.unwrap();
    assert_eq!(triage.len(), 1);
    assert_eq!(triage[0].work_item_id, Some(loser));
}

#[tokio::test]
async fn test_dependent_item_waits_for_its_dependency() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["src/a.rs"])).await;
    let dependent = WorkItem::builder()
        .id("B")
        .role(Role::Tester)
        .footprint(["tests/a_test.rs"])
        .depends_on("A")
        .build()
        .unwrap();
    h.add(dependent).await;

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.started_ids(), vec![id("A")]);
    assert_eq!(first.schedule.waiting_on_dependencies, vec![id("B")]);

    let second = h.coordinator().tick().await.unwrap();
    assert_eq!(second.poll.integrated, vec![id("A")]);
    assert_eq!(second.schedule.started_ids(), vec![id("B")]);
}

#[tokio::test]
async fn test_worker_past_timeout_with_result_is_integrated_not_hung() {
    let h = Harness::new().await;
    h.add(work_item("D", Role::Tester, &["tests/d.py"])).await;
    h.launcher.script("D", vec![Behavior::Hang]);

    h.coordinator().tick().await.unwrap();
    let pid = h.launcher.pid_of("D").unwrap();

    // The worker reports success but never exits
    let workspace = h.workspace_path("D", 1);
    std::fs::create_dir_all(workspace.join("tests")).unwrap();
    std::fs::write(workspace.join("tests/d.py"), "def test_d(): pass\n").unwrap();
    write_marker(
        &workspace.join(".conductor").join("result.json"),
        &WorkerOutcome::Success,
    )
    .unwrap();

    h.advance(61);
    let report = h.coordinator().tick().await.unwrap();
    assert!(report.poll.hung.is_empty());
    assert_eq!(report.poll.integrated, vec![id("D")]);
    assert!(h.launcher.terminated().contains(&pid));
    assert_eq!(h.item("D").await.status, WorkItemStatus::Succeeded);
    assert_eq!(
        h.main_file("tests/d.py").as_deref(),
        Some("def test_d(): pass\n")
    );
    assert!(h.events_of_kind("instance_hung").await.is_empty());
}

#[tokio::test]
async fn test_worker_past_timeout_with_failure_result_is_retried_as_crash() {
    let h = Harness::new().await;
    h.add(work_item("D", Role::Tester, &["tests/d.py"])).await;
    h.launcher.script("D", vec![Behavior::Hang]);

    h.coordinator().tick().await.unwrap();
    write_marker(
        &h.workspace_path("D", 1).join(".conductor").join("result.json"),
        &WorkerOutcome::failure("tests red"),
    )
    .unwrap();

    h.advance(61);
    let report = h.coordinator().tick().await.unwrap();
    assert!(report.poll.hung.is_empty());
    assert_eq!(report.poll.retrying, vec![id("D")]);
    let item = h.item("D").await;
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(item.attempts, 1);
}

#[tokio::test]
async fn test_status_changes_are_stamped_by_the_coordinator_clock() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["a.txt"])).await;
    h.launcher.script("A", vec![Behavior::Hang]);

    h.advance(3600);
    h.coordinator().tick().await.unwrap();
    let item = h.item("A").await;
    assert_eq!(item.status, WorkItemStatus::Running);
    assert!((item.updated_at - h.clock.now()).num_milliseconds().abs() < 1);
}

#[tokio::test]
async fn test_items_sharing_a_role_run_one_at_a_time() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["a.txt"])).await;
    h.add(work_item("E", Role::Coder, &["e.txt"])).await;
    h.launcher.script("A", vec![Behavior::Hang]);

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.started_ids(), vec![id("A")]);
    assert_eq!(first.schedule.claim_denied, vec![id("E")]);
    assert_eq!(h.item("E").await.status, WorkItemStatus::Pending);
    assert_eq!(h.item("E").await.attempts, 0);

    let pid = h.launcher.pid_of("A").unwrap();
    h.launcher.finish(pid, Behavior::edit("a.txt", "a\n"));

    let second = h.coordinator().tick().await.unwrap();
    assert_eq!(second.poll.integrated, vec![id("A")]);
    assert_eq!(second.schedule.started_ids(), vec![id("E")]);
}

#[tokio::test]
async fn test_batch_size_caps_concurrency() {
    let mut settings = common::test_settings();
    settings.max_batch_size = 2;
    let h = Harness::with_settings(settings).await;
    h.add(work_item("A", Role::Coder, &["a.txt"])).await;
    h.add(work_item("B", Role::Tester, &["b.txt"])).await;
    h.add(work_item("C", Role::Reviewer, &["c.txt"])).await;
    for raw in ["A", "B", "C"] {
        h.launcher.script(raw, vec![Behavior::Hang]);
    }

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.started_ids(), vec![id("A"), id("B")]);
    assert_eq!(first.schedule.deferred.len(), 1);
    assert_eq!(first.schedule.deferred[0].work_item_id, id("C"));
    assert!(first.schedule.deferred[0].conflicts_with.is_empty());

    // Running items keep occupying the batch
    let second = h.coordinator().tick().await.unwrap();
    assert!(second.schedule.started.is_empty());
    assert_eq!(second.active_instances, 2);

    let pid = h.launcher.pid_of("A").unwrap();
    h.launcher.finish(pid, Behavior::Succeed(Vec::new()));
    let third = h.coordinator().tick().await.unwrap();
    assert_eq!(third.schedule.started_ids(), vec![id("C")]);
}

#[tokio::test]
async fn test_spawn_failures_exhaust_retries() {
    let h = Harness::new().await;
    h.add(work_item("S", Role::Documenter, &["docs/s.md"])).await;
    h.launcher.script("S", vec![Behavior::SpawnError]);

    let first = h.coordinator().tick().await.unwrap();
    assert!(first.schedule.started.is_empty());
    assert_eq!(first.schedule.failed_to_start.len(), 1);
    assert_eq!(first.schedule.failed_to_start[0].work_item_id, id("S"));
    assert_eq!(h.item("S").await.status, WorkItemStatus::Failed);
    assert!(!h.workspace_path("S", 1).exists());
    assert!(h.registry.current_lease(Role::Documenter).await.unwrap().is_none());

    // Still inside the backoff
    h.advance(2);
    let early = h.coordinator().tick().await.unwrap();
    assert!(early.schedule.failed_to_start.is_empty());

    h.advance(4);
    h.coordinator().tick().await.unwrap();
    let item = h.item("S").await;
    assert_eq!(item.status, WorkItemStatus::Blocked);
    assert_matches!(item.blocked_reason, Some(BlockedReason::SpawnFailed { attempts: 2, .. }));
    assert_eq!(h.launcher.launches_of("S").len(), 2);
}

#[tokio::test]
async fn test_failure_marker_retries_then_succeeds() {
    let h = Harness::new().await;
    h.add(work_item("F", Role::Coder, &["f.txt"])).await;
    h.launcher.script(
        "F",
        vec![
            Behavior::Fail("tests failed".into()),
            Behavior::edit("f.txt", "fixed\n"),
        ],
    );

    h.coordinator().tick().await.unwrap();
    let failed = h.coordinator().tick().await.unwrap();
    assert_eq!(failed.poll.retrying, vec![id("F")]);
    let events = h.events_of_kind("instance_failed").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["reason"], "tests failed");
    assert_eq!(events[0].payload["category"], "agent_crashed");
    assert_eq!(events[0].payload["will_retry"], true);

    h.advance(5);
    let retried = h.coordinator().tick().await.unwrap();
    assert_eq!(retried.schedule.started[0].attempt, 2);
    let done = h.coordinator().tick().await.unwrap();
    assert_eq!(done.poll.integrated, vec![id("F")]);
    assert_eq!(h.main_file("f.txt").as_deref(), Some("fixed\n"));
}

#[tokio::test]
async fn test_exit_without_marker_counts_as_failure() {
    let h = Harness::new().await;
    h.add(work_item("M", Role::Coder, &["m.txt"])).await;
    h.launcher.script("M", vec![Behavior::ExitWithoutMarker]);

    h.coordinator().tick().await.unwrap();
    h.coordinator().tick().await.unwrap();

    let instances = h
        .storage
        .agent_instances()
        .list_for_work_item(&id("M"))
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state, AgentState::Failed);
    assert_eq!(h.item("M").await.status, WorkItemStatus::Failed);
}

#[tokio::test]
async fn test_lost_lease_stops_the_worker() {
    let h = Harness::new().await;
    h.add(work_item("L", Role::Planner, &["plan.md"])).await;
    h.launcher.script("L", vec![Behavior::Hang]);

    h.coordinator().tick().await.unwrap();
    let pid = h.launcher.pid_of("L").unwrap();
    assert!(h.registry.force_release(Role::Planner).await.unwrap());

    h.advance(10);
    let report = h.coordinator().tick().await.unwrap();
    assert_eq!(report.poll.retrying, vec![id("L")]);
    assert!(h.launcher.terminated().contains(&pid));
}

#[tokio::test]
async fn test_running_worker_keeps_its_lease_fresh() {
    let h = Harness::new().await;
    h.add(work_item("K", Role::Integrator, &["k.txt"])).await;
    h.launcher.script("K", vec![Behavior::Hang]);
    h.coordinator().tick().await.unwrap();

    // Well past the staleness timeout in heartbeat-sized steps
    for _ in 0..6 {
        h.advance(10);
        h.coordinator().tick().await.unwrap();
    }
    assert!(!h.registry.is_stale(Role::Integrator).await.unwrap());
    assert!(h.registry.has_live_holder(Role::Integrator).await.unwrap());
}

#[tokio::test]
async fn test_dead_holder_is_reclaimed_after_staleness() {
    let h = Harness::new().await;
    h.registry.claim(Role::Reviewer, 99_999).await.unwrap();
    h.add(work_item("R", Role::Reviewer, &["r.txt"])).await;

    let denied = h.coordinator().tick().await.unwrap();
    assert_eq!(denied.schedule.claim_denied, vec![id("R")]);

    h.advance(31);
    let reclaimed = h.coordinator().tick().await.unwrap();
    assert_eq!(reclaimed.schedule.started_ids(), vec![id("R")]);
    let events = h.events_of_kind("role_reclaimed").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["previous_pid"], 99_999);
}

#[tokio::test]
async fn test_unreadable_spec_document_blocks_the_item() {
    let h = Harness::new().await;
    let item = WorkItem::builder()
        .id("U")
        .role(Role::Coder)
        .spec_path("docs/missing.md")
        .build()
        .unwrap();
    h.add(item).await;
    h.add(work_item("V", Role::Tester, &["v.txt"])).await;

    let report = h.coordinator().tick().await.unwrap();
    assert_eq!(report.schedule.blocked, vec![id("U")]);
    assert_eq!(report.schedule.started_ids(), vec![id("V")]);
    assert_matches!(
        h.item("U").await.blocked_reason,
        Some(BlockedReason::Unanalyzable { .. })
    );
}

#[tokio::test]
async fn test_spec_document_paths_join_the_footprint() {
    let h = Harness::new().await;
    std::fs::create_dir_all(h.repo_dir.path().join("docs")).unwrap();
    std::fs::write(
        h.repo_dir.path().join("docs/p.md"),
        "# Task\nTouch `x.py` only.\n",
    )
    .unwrap();
    h.add(work_item("O", Role::Coder, &["x.py"])).await;
    let documented = WorkItem::builder()
        .id("P")
        .role(Role::Tester)
        .spec_path("docs/p.md")
        .build()
        .unwrap();
    h.add(documented).await;

    let report = h.coordinator().tick().await.unwrap();
    assert_eq!(report.schedule.started_ids(), vec![id("O")]);
    assert_eq!(report.schedule.deferred[0].work_item_id, id("P"));
    assert_eq!(report.schedule.deferred[0].paths, vec!["x.py".to_string()]);
}

#[tokio::test]
async fn test_restarted_coordinator_adopts_live_workers() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["x.py"])).await;
    h.launcher.script("A", vec![Behavior::Hang]);
    h.coordinator().tick().await.unwrap();

    let restarted = h.new_coordinator();
    let recovery = restarted.recover().await.unwrap();
    assert_eq!(recovery.adopted, 1);
    assert!(recovery.orphaned.is_empty());
    assert_eq!(h.item("A").await.status, WorkItemStatus::Running);

    let pid = h.launcher.pid_of("A").unwrap();
    h.launcher.finish(pid, Behavior::edit("x.py", "print('adopted')\n"));
    let report = restarted.tick().await.unwrap();
    assert_eq!(report.poll.integrated, vec![id("A")]);
    assert_eq!(h.main_file("x.py").as_deref(), Some("print('adopted')\n"));
}

#[tokio::test]
async fn test_recovery_fails_items_without_a_worker() {
    let h = Harness::new().await;
    h.add(work_item("O", Role::Coder, &["o.txt"])).await;
    assert!(h
        .storage
        .work_items()
        .begin_attempt(&id("O"), WorkItemStatus::Pending, h.clock.now())
        .await
        .unwrap());

    let recovery = h.coordinator().recover().await.unwrap();
    assert_eq!(recovery.orphaned, vec![id("O")]);
    let item = h.item("O").await;
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(item.attempts, 1);

    h.advance(5);
    let report = h.coordinator().tick().await.unwrap();
    assert_eq!(report.schedule.started[0].attempt, 2);
}

#[tokio::test]
async fn test_run_until_idle_drains_the_backlog() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["a.txt"])).await;
    h.add(work_item("B", Role::Tester, &["b.txt"])).await;

    let outcome = h
        .coordinator()
        .run(std::future::pending::<()>(), true)
        .await
        .unwrap();
    assert!(!outcome.interrupted);
    assert_eq!(outcome.passes, 2);
    assert_eq!(h.item("A").await.status, WorkItemStatus::Succeeded);
    assert_eq!(h.item("B").await.status, WorkItemStatus::Succeeded);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_and_leaves_workers_running() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["a.txt"])).await;
    h.launcher.script("A", vec![Behavior::Hang]);

    let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));
    let outcome = h.coordinator().run(shutdown, false).await.unwrap();
    assert!(outcome.interrupted);
    assert!(outcome.passes >= 1);
    assert!(h.launcher.terminated().is_empty());
    assert_eq!(h.item("A").await.status, WorkItemStatus::Running);
}

#[tokio::test]
async fn test_resolve_blocked_item_releases_dependents() {
    let h = Harness::new().await;
    let item = WorkItem::builder()
        .id("U")
        .role(Role::Coder)
        .spec_path("docs/missing.md")
        .build()
        .unwrap();
    h.add(item).await;
    let dependent = WorkItem::builder()
        .id("W")
        .role(Role::Tester)
        .footprint(["w.txt"])
        .depends_on("U")
        .build()
        .unwrap();
    h.add(dependent).await;

    let first = h.coordinator().tick().await.unwrap();
    assert_eq!(first.schedule.blocked, vec![id("U")]);
    assert_eq!(first.schedule.waiting_on_dependencies, vec![id("W")]);

    let resolved = h.coordinator().resolve_blocked(&id("U"), false).await.unwrap();
    assert_eq!(resolved.status, WorkItemStatus::Succeeded);

    let second = h.coordinator().tick().await.unwrap();
    assert_eq!(second.schedule.started_ids(), vec![id("W")]);
}

#[tokio::test]
async fn test_abandon_archives_and_rejects_unblocked_items() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["x.py"])).await;
    h.add(work_item("B", Role::Tester, &["b.txt"])).await;
    h.launcher.script("A", vec![Behavior::edit("x.py", "print('a')\n")]);
    h.launcher.script("B", vec![Behavior::edit("x.py", "print('b')\n")]);
    h.coordinator().tick().await.unwrap();
    let report = h.coordinator().tick().await.unwrap();
    let loser = report.poll.blocked[0].clone();
    let winner = report.poll.integrated[0].clone();

    let err = h
        .coordinator()
        .resolve_blocked(&winner, true)
        .await
        .unwrap_err();
    assert_matches!(err, AppError::BadRequest(_));

    let abandoned = h.coordinator().resolve_blocked(&loser, true).await.unwrap();
    assert!(abandoned.archived);
    assert!(!h.workspace_path(loser.as_str(), 1).exists());
}

#[tokio::test]
async fn test_backlog_analysis_reports_pairs() {
    let h = Harness::new().await;
    h.add(work_item("A", Role::Coder, &["x.py"])).await;
    h.add(work_item("B", Role::Tester, &["y.py"])).await;
    h.add(work_item("C", Role::Reviewer, &["x.py", "z.py"])).await;

    let report = h.coordinator().analyze_backlog(&[]).await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert!(report.conflicts_between(&id("A"), &id("C")).is_some());
    assert!(report.conflicts_between(&id("A"), &id("B")).is_none());

    let subset = h
        .coordinator()
        .analyze_backlog(&[id("A"), id("B")])
        .await
        .unwrap();
    assert!(subset.conflicts.is_empty());
}
