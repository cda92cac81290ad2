//! Command line interface
//!
//! Every command loads the layered configuration, applies the global flag
//! overrides, installs logging and talks to the store. Command output goes
//! to stdout (JSON with `--json`); logs go to stderr and the log file.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::config::Config;
use crate::coordinator::{BacklogAnalysis, PassReport};
use crate::error::{EXIT_OK, EXIT_PARTIAL};
use crate::{logging, AppError, Result};
use conductor_core::message::{Message, MessagePriority};
use conductor_core::work_item::{Role, WorkItem, WorkItemId, WorkItemStatus};

#[derive(Parser, Debug)]
#[command(name = "conductor", version)]
#[command(about = "Coordinates parallel worker agents on one shared source tree")]
pub struct Cli {
    /// Configuration file layered over config/default and config/local
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL or file path
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Log level
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Print command output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator until no work is left, or until Ctrl-C with --watch
    Run {
        #[arg(long)]
        watch: bool,
    },
    /// Run a single coordination pass
    Pass,
    /// Import work items from a JSON manifest
    Import { file: PathBuf },
    /// Work item, role and queue overview
    Status,
    /// Worker instances
    Instances {
        /// Include finished instances
        #[arg(long)]
        all: bool,
    },
    /// Drop a role registration whoever holds it
    ReleaseRole { role: Role },
    /// Footprint conflicts between work items, all unfinished ones by default
    Conflicts { ids: Vec<String> },
    /// Resolve a blocked work item after manual intervention
    Resolve {
        id: String,
        /// Archive the item instead of marking it succeeded
        #[arg(long)]
        abandon: bool,
    },
    /// Send a message to a role, directly or by intent
    Send {
        #[arg(long)]
        from: Role,
        #[arg(long, conflicts_with = "intent", required_unless_present = "intent")]
        to: Option<Role>,
        #[arg(long)]
        intent: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: MessagePriority,
        #[arg(long, requires = "intent")]
        work_item: Option<String>,
        payload: String,
    },
    /// Unacknowledged messages for a role
    Inbox {
        role: Role,
        /// Message history including acknowledged ones
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Acknowledge a message
    Ack { id: Uuid },
    /// Show where an intent would be routed
    Route { intent: String },
    /// Queue position and estimated wait of a message
    Queue { id: Uuid },
    /// Recent coordinator events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        work_item: Option<String>,
    },
}

/// One manifest entry
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub footprint: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub spec_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<ManifestEntry>),
    Wrapped { work_items: Vec<ManifestEntry> },
}

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub imported: Vec<WorkItemId>,
    pub skipped: Vec<WorkItemId>,
}

/// Parse a manifest file into validated work items
pub fn read_manifest(path: &Path) -> Result<Vec<WorkItem>> {
    let raw = std::fs::read_to_string(path)?;
    let entries = match serde_json::from_str::<Manifest>(&raw)? {
        Manifest::List(entries) => entries,
        Manifest::Wrapped { work_items } => work_items,
    };

    let mut items = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for entry in entries {
        let mut builder = WorkItem::builder()
            .id(entry.id)
            .role(entry.role)
            .footprint(entry.footprint)
            .priority(entry.priority);
        if let Some(title) = entry.title {
            builder = builder.title(title);
        }
        if let Some(spec_path) = entry.spec_path {
            builder = builder.spec_path(spec_path);
        }
        for dependency in &entry.dependencies {
            builder = builder.depends_on(WorkItemId::parse(dependency)?.as_str());
        }
        let item = builder.build()?;
        if !seen.insert(item.id.clone()) {
            return Err(AppError::BadRequest(format!(
                "work item {} appears twice in {}",
                item.id,
                path.display()
            )));
        }
        items.push(item);
    }
    Ok(items)
}

/// Run the parsed command and return the process exit code
pub async fn execute(cli: Cli) -> Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database.url = database_url(database);
    }
    let _guard = logging::init(&config.logging, cli.log_level.as_deref())?;

    let app = App::build(config).await?;
    let code = dispatch(&app, cli.command, cli.json).await;
    app.storage.close().await;
    code
}

async fn dispatch(app: &App, command: Command, json: bool) -> Result<i32> {
    match command {
        Command::Run { watch } => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            let outcome = app.coordinator.run(shutdown, !watch).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "{} pass(es); adopted {}, orphaned {}{}",
                    outcome.passes,
                    outcome.recovery.adopted,
                    outcome.recovery.orphaned.len(),
                    if outcome.interrupted { ", interrupted" } else { "" }
                );
            }
            backlog_exit_code(app, !json).await
        }
        Command::Pass => {
            let report = app.coordinator.tick().await?;
            if json {
                print_json(&report)?;
            } else {
                print_pass(&report);
            }
            backlog_exit_code(app, false).await
        }
        Command::Import { file } => {
            let summary = import(app, &file).await?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "imported {}, skipped {} already present",
                    summary.imported.len(),
                    summary.skipped.len()
                );
                for id in &summary.skipped {
                    println!("  skipped {}", id);
                }
            }
            Ok(EXIT_OK)
        }
        Command::Status => {
            let items = app.storage.work_items().list(false).await?;
            let roles = app.registry.list().await?;
            let stats = app.storage.stats().await?;
            if json {
                print_json(&serde_json::json!({
                    "work_items": items,
                    "roles": roles,
                    "stats": stats,
                }))?;
            } else {
                for item in &items {
                    println!("{}", describe_item(item));
                }
                for role in &roles {
                    println!(
                        "role {:<10} {:<11} pid {}{}",
                        role.registration.role,
                        role.state,
                        role.registration.holder_pid,
                        if role.holder_alive { "" } else { " (gone)" }
                    );
                }
                println!(
                    "{} unprocessed message(s), {} active instance(s)",
                    stats.unprocessed_messages, stats.active_instances
                );
            }
            Ok(exit_for(&items))
        }
        Command::Instances { all } => {
            let repository = app.storage.agent_instances();
            let instances = if all {
                repository.list(true).await?
            } else {
                repository.list_active().await?
            };
            if json {
                print_json(&instances)?;
            } else {
                for instance in &instances {
                    println!(
                        "{} {:<10} {:<12} attempt {} pid {} {}{}",
                        instance.id,
                        instance.role,
                        instance.work_item_id,
                        instance.attempt,
                        instance.pid.map_or("-".to_string(), |pid| pid.to_string()),
                        instance.state,
                        instance
                            .exit_reason
                            .as_deref()
                            .map(|reason| format!(" ({})", reason))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(EXIT_OK)
        }
        Command::ReleaseRole { role } => {
            let removed = app.registry.force_release(role).await?;
            if json {
                print_json(&serde_json::json!({ "role": role, "released": removed }))?;
            } else if removed {
                println!("released {}", role);
            } else {
                println!("{} was not registered", role);
            }
            Ok(EXIT_OK)
        }
        Command::Conflicts { ids } => {
            let ids = ids
                .iter()
                .map(|id| WorkItemId::parse(id))
                .collect::<conductor_core::Result<Vec<_>>>()?;
            let report = app.coordinator.analyze_backlog(&ids).await?;
            let analysis = BacklogAnalysis::from(&report);
            if json {
                print_json(&analysis)?;
            } else {
                print_conflicts(&analysis);
            }
            Ok(EXIT_OK)
        }
        Command::Resolve { id, abandon } => {
            let id = WorkItemId::parse(&id)?;
            let item = app.coordinator.resolve_blocked(&id, abandon).await?;
            if json {
                print_json(&item)?;
            } else {
                println!("{}", describe_item(&item));
            }
            Ok(EXIT_OK)
        }
        Command::Send {
            from,
            to,
            intent,
            priority,
            work_item,
            payload,
        } => {
            let message_id = match (to, intent) {
                (Some(to), _) => app.mailbox.send(from, to, &payload, priority).await?,
                (None, Some(intent)) => {
                    let work_item = work_item.as_deref().map(WorkItemId::parse).transpose()?;
                    let routed = app
                        .mailbox
                        .send_routed(from, &intent, &payload, priority, work_item.as_ref())
                        .await?;
                    if routed.routed_via_fallback {
                        info!(to = %routed.to_role, "Message routed to fallback role");
                    }
                    routed.message_id
                }
                (None, None) => {
                    return Err(AppError::BadRequest(
                        "either --to or --intent is required".to_string(),
                    ))
                }
            };
            print_queue_status(app, message_id, json).await?;
            Ok(EXIT_OK)
        }
        Command::Inbox { role, all, limit } => {
            let messages = if all {
                app.mailbox.inbox(role, limit).await?
            } else {
                app.mailbox.poll(role).await?
            };
            if json {
                print_json(&messages)?;
            } else {
                for message in &messages {
                    println!("{}", describe_message(message));
                }
            }
            Ok(EXIT_OK)
        }
        Command::Ack { id } => {
            let message = app.mailbox.ack(id).await?;
            if json {
                print_json(&message)?;
            } else {
                println!("{}", describe_message(&message));
            }
            Ok(EXIT_OK)
        }
        Command::Route { intent } => {
            let decision = app.mailbox.route(&intent)?;
            if json {
                print_json(&decision)?;
            } else {
                println!(
                    "{} -> {} (fallback {}, confidence {:.2})",
                    decision.intent,
                    decision.primary,
                    decision
                        .fallback
                        .map_or("none".to_string(), |role| role.to_string()),
                    decision.confidence
                );
            }
            Ok(EXIT_OK)
        }
        Command::Queue { id } => {
            print_queue_status(app, id, json).await?;
            Ok(EXIT_OK)
        }
        Command::Events { limit, work_item } => {
            let repository = app.storage.events();
            let events = match work_item {
                Some(id) => repository.for_work_item(WorkItemId::parse(&id)?.as_str()).await?,
                None => repository.recent(limit).await?,
            };
            if json {
                print_json(&events)?;
            } else {
                for event in &events {
                    println!(
                        "{} {:<22} {:<12} {}",
                        event.created_at.format("%Y-%m-%d %H:%M:%S"),
                        event.kind,
                        event.work_item_id.as_deref().unwrap_or("-"),
                        event.payload
                    );
                }
            }
            Ok(EXIT_OK)
        }
    }
}

/// Create every manifest item not already in the store
pub async fn import(app: &App, file: &Path) -> Result<ImportSummary> {
    let items = read_manifest(file)?;
    let repository = app.storage.work_items();

    let mut known: HashSet<WorkItemId> = items.iter().map(|item| item.id.clone()).collect();
    known.extend(repository.list(true).await?.into_iter().map(|item| item.id));
    for item in &items {
        if let Some(missing) = item.dependencies.iter().find(|dep| !known.contains(*dep)) {
            return Err(AppError::BadRequest(format!(
                "work item {} depends on unknown item {}",
                item.id, missing
            )));
        }
    }

    let mut summary = ImportSummary::default();
    for item in items {
        match repository.create(&item).await {
            Ok(()) => summary.imported.push(item.id),
            Err(conductor_storage::Error::Conflict(_)) => summary.skipped.push(item.id),
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        imported = summary.imported.len(),
        skipped = summary.skipped.len(),
        file = %file.display(),
        "Manifest imported"
    );
    Ok(summary)
}

fn database_url(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite:{}", raw)
    }
}

fn exit_for(items: &[WorkItem]) -> i32 {
    if items
        .iter()
        .any(|item| !item.archived && item.status == WorkItemStatus::Blocked)
    {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

async fn backlog_exit_code(app: &App, report_blocked: bool) -> Result<i32> {
    let items = app.storage.work_items().list(false).await?;
    if report_blocked {
        for item in items
            .iter()
            .filter(|item| item.status == WorkItemStatus::Blocked)
        {
            println!("{}", describe_item(item));
        }
    }
    Ok(exit_for(&items))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_queue_status(app: &App, message_id: Uuid, json: bool) -> Result<()> {
    let status = app.mailbox.queue_status(message_id).await?;
    if json {
        return print_json(&serde_json::json!({
            "message_id": message_id,
            "queue": status,
        }));
    }
    match status {
        Some(status) => println!(
            "{} queued for {} at position {}, eta {}",
            message_id,
            status.to_role,
            status.position,
            status
                .eta()
                .map_or("unknown".to_string(), |eta| format!("{}s", eta.num_seconds()))
        ),
        None => println!("{} already processed", message_id),
    }
    Ok(())
}

fn describe_item(item: &WorkItem) -> String {
    let mut line = format!(
        "{:<16} {:<10} {:<9} attempts {}",
        item.id, item.required_role, item.status, item.attempts
    );
    if let Some(reason) = &item.blocked_reason {
        line.push_str(&format!(" - {}", reason));
    }
    if let Some(at) = item.next_attempt_at {
        if item.status == WorkItemStatus::Failed {
            line.push_str(&format!(" - retry after {}", at.format("%H:%M:%S")));
        }
    }
    line
}

fn describe_message(message: &Message) -> String {
    format!(
        "{} [{}] {} -> {} {}{}: {}",
        message.id,
        message.priority,
        message.from_role,
        message.to_role,
        message.status,
        message
            .intent
            .as_deref()
            .map(|intent| format!(" ({})", intent))
            .unwrap_or_default(),
        message.payload
    )
}

fn print_pass(report: &PassReport) {
    for started in &report.schedule.started {
        println!(
            "started  {} as {} (attempt {}, pid {}, branch {})",
            started.work_item_id, started.role, started.attempt, started.pid, started.branch
        );
    }
    for deferred in &report.schedule.deferred {
        if deferred.conflicts_with.is_empty() {
            println!("deferred {} (batch full)", deferred.work_item_id);
        } else {
            println!(
                "deferred {} (conflicts with {} on {})",
                deferred.work_item_id,
                join(&deferred.conflicts_with),
                deferred.paths.join(", ")
            );
        }
    }
    for id in &report.schedule.claim_denied {
        println!("waiting  {} (role busy)", id);
    }
    for id in &report.schedule.waiting_on_dependencies {
        println!("waiting  {} (dependencies)", id);
    }
    for failure in &report.schedule.failed_to_start {
        println!("failed   {}: {}", failure.work_item_id, failure.reason);
    }
    for id in &report.poll.integrated {
        println!("merged   {}", id);
    }
    for id in &report.poll.retrying {
        println!("retrying {}", id);
    }
    for id in report.poll.blocked.iter().chain(report.schedule.blocked.iter()) {
        println!("blocked  {}", id);
    }
    println!(
        "{} running, {} awaiting retry",
        report.active_instances, report.awaiting_retry
    );
}

fn print_conflicts(analysis: &BacklogAnalysis) {
    for edge in &analysis.conflicts {
        if edge.paths.is_empty() {
            println!("{} x {}: footprint undeclared", edge.first, edge.second);
        } else {
            println!("{} x {}: {}", edge.first, edge.second, edge.paths.join(", "));
        }
    }
    for (id, message) in &analysis.unanalyzable {
        println!("{}: unanalyzable ({})", id, message);
    }
    println!(
        "{} conflict(s), {} independent pair(s)",
        analysis.conflicts.len(),
        analysis.independent_pairs.len()
    );
}

fn join(ids: &[WorkItemId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "conductor",
            "--json",
            "--database",
            "/tmp/c.db",
            "send",
            "--from",
            "coder",
            "--intent",
            "review",
            "--priority",
            "high",
            "ready",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.database.as_deref(), Some("/tmp/c.db"));
        match cli.command {
            Command::Send {
                from,
                to,
                intent,
                priority,
                payload,
                ..
            } => {
                assert_eq!(from, Role::Coder);
                assert_eq!(to, None);
                assert_eq!(intent.as_deref(), Some("review"));
                assert_eq!(priority, MessagePriority::High);
                assert_eq!(payload, "ready");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_a_target() {
        assert!(Cli::try_parse_from(["conductor", "send", "--from", "coder", "hi"]).is_err());
        assert!(Cli::try_parse_from([
            "conductor", "send", "--from", "coder", "--to", "tester", "--intent", "test", "hi"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["conductor", "release-role", "wizard"]).is_err());
    }

    #[test]
    fn test_read_manifest_formats() {
        let list = manifest(
            r#"[{"id": "A", "role": "coder", "footprint": ["x.py"], "priority": 2},
                {"id": "B", "role": "tester", "dependencies": ["A"]}]"#,
        );
        let items = read_manifest(list.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].priority, 2);
        assert!(items[1].dependencies.contains(&WorkItemId::new("A")));

        let wrapped = manifest(r#"{"work_items": [{"id": "C", "role": "reviewer", "title": "Review"}]}"#);
        let items = read_manifest(wrapped.path()).unwrap();
        assert_eq!(items[0].title, "Review");
        assert_eq!(items[0].required_role, Role::Reviewer);
    }

    #[test]
    fn test_read_manifest_rejects_duplicates_and_bad_ids() {
        let duplicate = manifest(r#"[{"id": "A", "role": "coder"}, {"id": "A", "role": "coder"}]"#);
        assert!(matches!(
            read_manifest(duplicate.path()),
            Err(AppError::BadRequest(_))
        ));

        let bad = manifest(r#"[{"id": "has space", "role": "coder"}]"#);
        assert!(read_manifest(bad.path()).is_err());
    }

    #[test]
    fn test_database_url_override() {
        assert_eq!(database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(database_url("/tmp/c.db"), "sqlite:/tmp/c.db");
    }
}
