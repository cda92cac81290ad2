//! Full application wiring with real worker processes

#![cfg(unix)]

use git2::{IndexAddOption, Repository, Signature};
use std::path::Path;
use tempfile::TempDir;

use conductor::app::App;
use conductor::cli;
use conductor::config::Config;
use conductor_core::work_item::{BlockedReason, WorkItemId, WorkItemStatus};

/// Writes `<id>.txt` and a success marker; item `F` always fails
const WORKER_SCRIPT: &str = r#"
if [ "$2" = "F" ]; then
  printf '{"status":"failure","reason":"boom"}' > "$CONDUCTOR_MARKER"
  exit 1
fi
printf '%s\n' "$2" > "$1/$2.txt"
printf '{"status":"success"}' > "$CONDUCTOR_MARKER"
"#;

fn init_repo(path: &Path) {
    let repo = Repository::init(path).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    std::fs::write(path.join("README.md"), "# app fixture\n").unwrap();
    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    index.add_all(["*"], IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();
}

fn config(root: &Path, repo: &Path) -> Config {
    let mut config = Config::default();
    config.database.url = format!("sqlite:{}", root.join("conductor.db").display());
    config.workspace.repo_path = repo.to_path_buf();
    config.workspace.workspaces_dir = Some(root.join("workspaces"));
    config.worker.command = "sh".to_string();
    config.worker.args = vec![
        "-c".to_string(),
        WORKER_SCRIPT.to_string(),
        "worker".to_string(),
    ];
    config.coordination.poll_interval_ms = 20;
    config.coordination.retry.max_attempts = 2;
    config.coordination.retry.initial_delay_seconds = 0;
    config.logging.file_enabled = false;
    config
}

#[tokio::test]
async fn test_imported_backlog_runs_to_completion() {
    let root = TempDir::new().unwrap();
    let repo_dir = TempDir::new().unwrap();
    init_repo(repo_dir.path());

    let manifest = root.path().join("backlog.json");
    std::fs::write(
        &manifest,
        r#"{"work_items": [
            {"id": "A", "role": "coder", "footprint": ["A.txt"]},
            {"id": "B", "role": "tester", "footprint": ["B.txt"], "dependencies": ["A"]},
            {"id": "F", "role": "reviewer", "footprint": ["F.txt"]}
        ]}"#,
    )
    .unwrap();

    let app = App::build(config(root.path(), repo_dir.path()))
        .await
        .unwrap();
    let summary = cli::import(&app, &manifest).await.unwrap();
    assert_eq!(summary.imported.len(), 3);

    // Importing again leaves the stored items alone
    let again = cli::import(&app, &manifest).await.unwrap();
    assert!(again.imported.is_empty());
    assert_eq!(again.skipped.len(), 3);

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        app.coordinator.run(std::future::pending::<()>(), true),
    )
    .await
    .expect("backlog did not drain")
    .unwrap();
    assert!(!outcome.interrupted);

    let items = app.storage.work_items();
    for id in ["A", "B"] {
        let item = items.get(&WorkItemId::new(id)).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Succeeded, "{}", id);
        assert_eq!(
            std::fs::read_to_string(repo_dir.path().join(format!("{}.txt", id))).unwrap(),
            format!("{}\n", id)
        );
    }

    let failed = items.get(&WorkItemId::new("F")).await.unwrap();
    assert_eq!(failed.status, WorkItemStatus::Blocked);
    assert_eq!(
        failed.blocked_reason,
        Some(BlockedReason::Crashed {
            reason: "boom".to_string(),
            attempts: 2
        })
    );
    assert_eq!(app.storage.agent_instances().count_active().await.unwrap(), 0);

    app.storage.close().await;
}

#[tokio::test]
async fn test_import_rejects_unknown_dependencies() {
    let root = TempDir::new().unwrap();
    let repo_dir = TempDir::new().unwrap();
    init_repo(repo_dir.path());
    let manifest = root.path().join("backlog.json");
    std::fs::write(
        &manifest,
        r#"[{"id": "B", "role": "tester", "dependencies": ["missing"]}]"#,
    )
    .unwrap();

    let app = App::build(config(root.path(), repo_dir.path()))
        .await
        .unwrap();
    let err = cli::import(&app, &manifest).await.unwrap_err();
    assert!(err.to_string().contains("missing"));
    assert_eq!(app.storage.work_items().count().await.unwrap(), 0);
    app.storage.close().await;
}
