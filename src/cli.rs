use std::collections::HashMap;

use anyhow::Result;
use clap::Subcommand;
use serde_json::json;

use crate::commands::{self, App};
use crate::config::Config;
use crate::state::model::{Branch, BranchStatus};
use crate::zfs::FilesystemDriver;

#[derive(Subcommand)]
pub enum Commands {
    #[command(subcommand, about = "Manage projects (a database and its branches)")]
    Project(ProjectCommands),
    #[command(subcommand, about = "Manage database branches")]
    Branch(BranchCommands),
    #[command(subcommand, about = "Manage durable snapshots")]
    Snapshot(SnapshotCommands),
    #[command(subcommand, about = "Inspect and prune WAL archives")]
    Wal(WalCommands),
    #[command(about = "Show pool, project and branch status")]
    Status,
    #[command(about = "Run diagnostics and check system health")]
    Doctor,
    #[command(about = "One-time host setup (ZFS delegation, WAL root)")]
    Setup {
        #[arg(long, help = "ZFS pool to delegate (defaults to the single pool)")]
        pool: Option<String>,
    },
    #[command(about = "Find and remove resources not tracked in state")]
    Cleanup {
        #[arg(long, help = "List orphans without removing anything")]
        dry_run: bool,
        #[arg(long, help = "Skip the confirmation prompt")]
        force: bool,
    },
    #[command(subcommand, about = "Manage the state file")]
    State(StateCommands),
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    #[command(about = "Create a project with a primary 'main' branch")]
    Create {
        #[arg(help = "Project name")]
        name: String,
        #[arg(long, help = "ZFS pool to use (defaults to the single pool)")]
        pool: Option<String>,
        #[arg(long, help = "PostgreSQL major version (resolves to postgres:<v>-alpine)")]
        pg_version: Option<String>,
        #[arg(long, help = "Exact container image (mutually exclusive with --pg-version)")]
        image: Option<String>,
    },
    #[command(about = "List all projects")]
    List,
    #[command(about = "Show one project")]
    Get {
        #[arg(help = "Project name")]
        name: String,
    },
    #[command(about = "Delete a project and all of its branches")]
    Delete {
        #[arg(help = "Project name")]
        name: String,
        #[arg(long, help = "Delete even if non-primary branches exist")]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum BranchCommands {
    #[command(about = "Create a branch from a parent's snapshot")]
    Create {
        #[arg(help = "Branch to create, as <project>/<branch>")]
        name: String,
        #[arg(long, help = "Parent branch (defaults to <project>/main)")]
        parent: Option<String>,
        #[arg(long, help = "Recover to a point in time ('2025-10-07T14:30:00Z' or '30 minutes ago')")]
        pitr: Option<String>,
    },
    #[command(about = "List branches, optionally for one project")]
    List {
        #[arg(help = "Project name")]
        project: Option<String>,
    },
    #[command(about = "Show one branch")]
    Get {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
    },
    #[command(about = "Delete a branch (and, with --force, its dependents)")]
    Delete {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
        #[arg(long, help = "Also delete dependent branches")]
        force: bool,
    },
    #[command(about = "Reset a branch to its parent's current state")]
    Reset {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
        #[arg(long, help = "Also delete dependent branches")]
        force: bool,
    },
    #[command(about = "Start a stopped branch")]
    Start {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
    },
    #[command(about = "Stop a running branch")]
    Stop {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
    },
    #[command(about = "Restart a branch")]
    Restart {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
    },
    #[command(about = "Show connection credentials for a branch")]
    Password {
        #[arg(help = "Branch, as <project>/<branch>")]
        name: String,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    #[command(about = "Take an application-consistent snapshot of a branch")]
    Create {
        #[arg(help = "Branch, as <project>/<branch>")]
        branch: String,
        #[arg(long, help = "Human label appended to the snapshot name")]
        label: Option<String>,
    },
    #[command(about = "List snapshots, optionally for one branch")]
    List {
        #[arg(help = "Branch, as <project>/<branch>")]
        branch: Option<String>,
    },
    #[command(about = "Delete one snapshot by id")]
    Delete {
        #[arg(help = "Snapshot id")]
        id: String,
    },
    #[command(about = "Delete old snapshots")]
    Cleanup {
        #[arg(help = "Branch, as <project>/<branch>")]
        branch: Option<String>,
        #[arg(long, help = "Retention window in days (default 30)")]
        days: Option<i64>,
        #[arg(long, help = "List what would be deleted without deleting")]
        dry_run: bool,
        #[arg(long, help = "Ignore the retention window and delete everything")]
        all: bool,
    },
}

#[derive(Subcommand)]
pub enum WalCommands {
    #[command(about = "Show WAL archive statistics")]
    Info {
        #[arg(help = "Branch, as <project>/<branch>")]
        branch: Option<String>,
    },
    #[command(about = "Delete old WAL segments from a branch's archive")]
    Cleanup {
        #[arg(help = "Branch, as <project>/<branch>")]
        branch: String,
        #[arg(long, help = "Retention window in days (default 7)")]
        days: Option<i64>,
        #[arg(long, help = "List what would be deleted without deleting")]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    #[command(about = "Restore the state file from its backup")]
    Restore,
}

pub async fn handle_command(cmd: Commands, json_output: bool) -> Result<()> {
    let config = Config::load()?;
    let app = App::new(config)?;

    match cmd {
        Commands::Project(cmd) => handle_project(&app, cmd, json_output).await,
        Commands::Branch(cmd) => handle_branch(&app, cmd, json_output).await,
        Commands::Snapshot(cmd) => handle_snapshot(&app, cmd, json_output).await,
        Commands::Wal(cmd) => handle_wal(&app, cmd, json_output).await,
        Commands::Status => handle_status(&app, json_output).await,
        Commands::Doctor => handle_doctor(&app, json_output).await,
        Commands::Setup { pool } => handle_setup(&app, pool).await,
        Commands::Cleanup { dry_run, force } => handle_cleanup(&app, dry_run, force, json_output).await,
        Commands::State(StateCommands::Restore) => {
            commands::system::restore_state(&app).await?;
            println!("Restored state from backup");
            Ok(())
        }
    }
}

async fn handle_project(app: &App, cmd: ProjectCommands, json_output: bool) -> Result<()> {
    match cmd {
        ProjectCommands::Create {
            name,
            pool,
            pg_version,
            image,
        } => {
            let summary = commands::project::create(
                app,
                &name,
                commands::project::CreateProjectOptions {
                    pool,
                    pg_version,
                    image,
                },
            )
            .await?;
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "project": summary.name,
                        "image": summary.image,
                        "port": summary.port,
                        "username": summary.username,
                        "password": summary.password,
                        "database": summary.database,
                    }))?
                );
            } else {
                println!("Created project '{}'", summary.name);
                println!("  Image:      {}", summary.image);
                println!("  Connection: postgresql://{}:{}@127.0.0.1:{}/{}",
                    summary.username, summary.password, summary.port, summary.database);
            }
            Ok(())
        }
        ProjectCommands::List => {
            let store = app.open_store().await?;
            if !store.is_initialized() {
                println!("No projects yet. Create one with 'pgfork project create <name>'.");
                return Ok(());
            }
            let projects = store.projects()?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(projects)?);
                return Ok(());
            }
            println!("{:<20} {:<24} {:>9} {:>10}", "PROJECT", "IMAGE", "BRANCHES", "CREATED");
            for p in projects {
                println!(
                    "{:<20} {:<24} {:>9} {:>10}",
                    p.name,
                    p.docker_image,
                    p.branches.len(),
                    p.created_at.format("%Y-%m-%d")
                );
            }
            Ok(())
        }
        ProjectCommands::Get { name } => {
            let store = app.open_store().await?;
            let project = store.project(&name)?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(project)?);
                return Ok(());
            }
            println!("Project '{}'", project.name);
            println!("  Image:    {}", project.docker_image);
            println!("  Created:  {}", project.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  Certs:    {}", project.ssl_cert_dir);
            println!("  Branches:");
            print_branch_tree(&project.branches, "    ");
            Ok(())
        }
        ProjectCommands::Delete { name, force } => {
            let deleted = commands::project::delete(app, &name, force).await?;
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({"deleted": name, "branches": deleted}))?
                );
            } else {
                println!("Deleted project '{name}' ({} branches)", deleted.len());
            }
            Ok(())
        }
    }
}

async fn handle_branch(app: &App, cmd: BranchCommands, json_output: bool) -> Result<()> {
    match cmd {
        BranchCommands::Create { name, parent, pitr } => {
            let summary = commands::branch::create(
                app,
                &name,
                commands::branch::CreateBranchOptions { parent, pitr },
            )
            .await?;
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "branch": summary.name,
                        "port": summary.port,
                        "parent": summary.parent,
                        "sizeBytes": summary.size_bytes,
                    }))?
                );
            } else {
                println!("Created branch '{}'", summary.name);
                if let Some(parent) = &summary.parent {
                    println!("  Parent: {parent}");
                }
                println!("  Port:   {}", summary.port);
                println!("  Size:   {}", format_bytes(summary.size_bytes));
            }
            Ok(())
        }
        BranchCommands::List { project } => {
            let store = app.open_store().await?;
            if !store.is_initialized() {
                println!("No branches yet.");
                return Ok(());
            }
            let branches: Vec<Branch> = match &project {
                Some(name) => store.project(name)?.branches.clone(),
                None => store.all_branches()?.into_iter().cloned().collect(),
            };
            if json_output {
                println!("{}", serde_json::to_string_pretty(&branches)?);
                return Ok(());
            }
            print_branch_tree(&branches, "");
            Ok(())
        }
        BranchCommands::Get { name } => {
            let (_, branch) = commands::branch::get(app, &name).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&branch)?);
                return Ok(());
            }
            println!("Branch '{}'", branch.name);
            println!("  Status:  {}", branch.status.as_str());
            println!("  Port:    {}", branch.port);
            println!("  Dataset: {}", branch.zfs_dataset);
            println!("  Size:    {}", format_bytes(branch.size_bytes));
            if let Some(snapshot) = &branch.snapshot_name {
                println!("  Origin:  {snapshot}");
            }
            Ok(())
        }
        BranchCommands::Delete { name, force } => {
            let deleted = commands::branch::delete(app, &name, force).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&json!({"deleted": deleted}))?);
            } else {
                for branch in deleted {
                    println!("Deleted branch '{branch}'");
                }
            }
            Ok(())
        }
        BranchCommands::Reset { name, force } => {
            let summary = commands::branch::reset(app, &name, force).await?;
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "reset": summary.name,
                        "port": summary.port,
                        "parent": summary.parent,
                    }))?
                );
            } else {
                println!(
                    "Reset '{}' to '{}' (port {} unchanged)",
                    summary.name,
                    summary.parent.as_deref().unwrap_or("-"),
                    summary.port
                );
            }
            Ok(())
        }
        BranchCommands::Start { name } => {
            commands::branch::start(app, &name).await?;
            println!("Started branch '{name}'");
            Ok(())
        }
        BranchCommands::Stop { name } => {
            commands::branch::stop(app, &name).await?;
            println!("Stopped branch '{name}'");
            Ok(())
        }
        BranchCommands::Restart { name } => {
            commands::branch::restart(app, &name).await?;
            println!("Restarted branch '{name}'");
            Ok(())
        }
        BranchCommands::Password { name } => {
            let info = commands::branch::connection_info(app, &name).await?;
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "host": info.host,
                        "port": info.port,
                        "username": info.username,
                        "password": info.password,
                        "database": info.database,
                        "uri": info.uri(),
                    }))?
                );
            } else {
                println!("{}", info.uri());
            }
            Ok(())
        }
    }
}

async fn handle_snapshot(app: &App, cmd: SnapshotCommands, json_output: bool) -> Result<()> {
    match cmd {
        SnapshotCommands::Create { branch, label } => {
            let record = commands::snapshot::create(app, &branch, label).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Created snapshot {} of '{}'", record.id, record.branch_name);
                println!("  {}", record.zfs_snapshot);
            }
            Ok(())
        }
        SnapshotCommands::List { branch } => {
            let records = commands::snapshot::list(app, branch.as_deref()).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("No snapshots.");
                return Ok(());
            }
            println!(
                "{:<36} {:<20} {:<20} {:>10} {:<12}",
                "ID", "BRANCH", "CREATED", "SIZE", "LABEL"
            );
            for r in records {
                println!(
                    "{:<36} {:<20} {:<20} {:>10} {:<12}",
                    r.id,
                    r.branch_name,
                    r.created_at.format("%Y-%m-%d %H:%M:%S"),
                    format_bytes(r.size_bytes),
                    r.label.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        SnapshotCommands::Delete { id } => {
            let record = commands::snapshot::delete(app, &id).await?;
            println!("Deleted snapshot {} ({})", record.id, record.zfs_snapshot);
            Ok(())
        }
        SnapshotCommands::Cleanup {
            branch,
            days,
            dry_run,
            all,
        } => {
            let outcome =
                commands::snapshot::cleanup(app, branch.as_deref(), days, dry_run, all).await?;
            if outcome.dry_run {
                println!("Would delete {} snapshots:", outcome.removed.len());
            } else {
                println!("Deleted {} snapshots:", outcome.removed.len());
            }
            for record in &outcome.removed {
                println!("  {} ({})", record.id, record.zfs_snapshot);
            }
            Ok(())
        }
    }
}

async fn handle_wal(app: &App, cmd: WalCommands, json_output: bool) -> Result<()> {
    match cmd {
        WalCommands::Info { branch } => {
            let rows = commands::wal::info(app, branch.as_deref()).await?;
            if json_output {
                let entries: Vec<_> = rows
                    .iter()
                    .map(|r| {
                        json!({
                            "branch": r.branch,
                            "files": r.info.file_count,
                            "totalBytes": r.info.total_bytes,
                            "oldest": r.info.oldest_name,
                            "newest": r.info.newest_name,
                            "gaps": r.gaps,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            for r in rows {
                println!("{} ({} segments, {})", r.branch, r.info.file_count, format_bytes(r.info.total_bytes));
                if let (Some(oldest), Some(newest)) = (&r.info.oldest_name, &r.info.newest_name) {
                    println!("  Range: {oldest} .. {newest}");
                }
                if !r.gaps.is_empty() {
                    println!("  WARNING: {} missing segments: {}", r.gaps.len(), r.gaps.join(", "));
                }
            }
            Ok(())
        }
        WalCommands::Cleanup {
            branch,
            days,
            dry_run,
        } => {
            let outcome = commands::wal::cleanup(app, &branch, days, dry_run).await?;
            if outcome.dry_run {
                println!(
                    "Would delete {} WAL segments from '{}'",
                    outcome.segments.len(),
                    outcome.branch
                );
                for segment in &outcome.segments {
                    println!("  {segment}");
                }
            } else {
                println!("Deleted {} WAL segments from '{}'", outcome.deleted, outcome.branch);
            }
            Ok(())
        }
    }
}

async fn handle_status(app: &App, json_output: bool) -> Result<()> {
    let report = commands::system::status(app).await?;
    if json_output {
        let branches: Vec<_> = report
            .branches
            .iter()
            .map(|b| {
                json!({
                    "name": b.name,
                    "recorded": b.recorded.as_str(),
                    "container": b.container,
                    "port": b.port,
                    "sizeBytes": b.size_bytes,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "pool": report.pool.as_ref().map(|p| json!({
                    "name": p.name,
                    "health": p.health,
                    "sizeBytes": p.size_bytes,
                    "freeBytes": p.free_bytes,
                })),
                "branches": branches,
                "snapshots": report.snapshot_count,
            }))?
        );
        return Ok(());
    }

    match &report.pool {
        Some(pool) => println!(
            "Pool {}: {} ({} free of {})",
            pool.name,
            pool.health,
            format_bytes(pool.free_bytes),
            format_bytes(pool.size_bytes)
        ),
        None => {
            println!("Not initialized. Create a project to get started.");
            return Ok(());
        }
    }
    println!("{} snapshots tracked", report.snapshot_count);
    println!();
    println!("{:<24} {:<9} {:<10} {:>6} {:>10}", "BRANCH", "STATE", "CONTAINER", "PORT", "SIZE");
    for b in report.branches {
        println!(
            "{:<24} {:<9} {:<10} {:>6} {:>10}",
            b.name,
            b.recorded.as_str(),
            b.container,
            b.port,
            format_bytes(b.size_bytes)
        );
    }
    Ok(())
}

async fn handle_doctor(app: &App, json_output: bool) -> Result<()> {
    let checks = commands::system::doctor(app).await?;
    if json_output {
        let entries: Vec<_> = checks
            .iter()
            .map(|c| json!({"name": c.name, "ok": c.ok, "detail": c.detail}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for check in &checks {
        let mark = if check.ok { "ok" } else { "FAIL" };
        println!("[{mark:>4}] {:<10} {}", check.name, check.detail);
    }
    if checks.iter().any(|c| !c.ok) {
        anyhow::bail!("one or more checks failed");
    }
    Ok(())
}

async fn handle_setup(app: &App, pool: Option<String>) -> Result<()> {
    let pool = match pool {
        Some(pool) => pool,
        None => {
            let pools = app.fs.list_pools().await?;
            match pools.as_slice() {
                [only] => only.clone(),
                [] => {
                    return Err(crate::error::user_error_hint(
                        "no ZFS pool found",
                        "create one first (e.g. 'sudo zpool create tank /dev/sdX')",
                    ))
                }
                many => {
                    return Err(crate::error::user_error_hint(
                        "multiple ZFS pools found",
                        format!("pass --pool with one of: {}", many.join(", ")),
                    ))
                }
            }
        }
    };
    crate::setup::run(&app.config, &pool, &app.config.dataset_base).await
}

async fn handle_cleanup(app: &App, dry_run: bool, force: bool, json_output: bool) -> Result<()> {
    let report = commands::system::detect_orphans(app).await?;

    if json_output && dry_run {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "datasets": report.datasets.iter().map(|d| &d.name).collect::<Vec<_>>(),
                "containers": report.containers,
                "totalOrphans": report.total_orphans(),
                "totalWastedBytes": report.total_wasted_bytes,
            }))?
        );
        return Ok(());
    }

    if report.is_empty() {
        println!("No orphaned resources found.");
        return Ok(());
    }

    println!(
        "Found {} orphaned resources ({} wasted):",
        report.total_orphans(),
        format_bytes(report.total_wasted_bytes)
    );
    for dataset in &report.datasets {
        println!("  dataset   {} ({})", dataset.name, format_bytes(dataset.used_bytes));
    }
    for container in &report.containers {
        println!("  container {container}");
    }

    if dry_run {
        return Ok(());
    }

    if !force {
        let confirmed = inquire::Confirm::new("Remove all of the above?")
            .with_default(false)
            .prompt()
            .unwrap_or(false);
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let summary = commands::system::execute_cleanup(app, &report).await?;
    println!(
        "Removed {} containers and {} datasets, reclaimed {}",
        summary.removed_containers.len(),
        summary.destroyed_datasets.len(),
        format_bytes(summary.reclaimed_bytes)
    );
    for failure in &summary.failures {
        eprintln!("  failed: {failure}");
    }
    Ok(())
}

/// Render branches as a forest, children indented under their parents.
fn print_branch_tree(branches: &[Branch], indent: &str) {
    let by_id: HashMap<_, _> = branches.iter().map(|b| (b.id, b)).collect();
    let mut children: HashMap<uuid::Uuid, Vec<&Branch>> = HashMap::new();
    let mut roots: Vec<&Branch> = Vec::new();

    for b in branches {
        match b.parent_branch_id.and_then(|id| by_id.get(&id)) {
            Some(parent) => children.entry(parent.id).or_default().push(b),
            None => roots.push(b),
        }
    }

    fn print_node(
        branch: &Branch,
        prefix: &str,
        connector: &str,
        children: &HashMap<uuid::Uuid, Vec<&Branch>>,
    ) {
        let marker = if branch.status == BranchStatus::Running {
            "running"
        } else {
            "stopped"
        };
        println!("{connector}{} [{marker}] :{}", branch.name, branch.port);

        if let Some(kids) = children.get(&branch.id) {
            let count = kids.len();
            for (i, child) in kids.iter().enumerate() {
                let is_last = i == count - 1;
                let child_connector = if is_last {
                    format!("{prefix}└─ ")
                } else {
                    format!("{prefix}├─ ")
                };
                let child_prefix = if is_last {
                    format!("{prefix}   ")
                } else {
                    format!("{prefix}│  ")
                };
                print_node(child, &child_prefix, &child_connector, children);
            }
        }
    }

    for root in &roots {
        print_node(root, indent, indent, &children);
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
