use clap::{CommandFactory, Parser};

use pgfork::cli::{self, Commands};
use pgfork::error::UserError;

#[derive(Parser)]
#[command(name = "pgfork")]
#[command(about = "Git-like branching for PostgreSQL on ZFS copy-on-write datasets")]
#[command(version)]
#[command(disable_help_subcommand = true)]
#[command(help_template = "\
{name} {version}
{about}

{usage-heading} {usage}

Projects & Branches:
  project             Create, list, inspect and delete projects
  branch              Create, reset, delete and control branches

Snapshots & Recovery:
  snapshot            Take and prune application-consistent snapshots
  wal                 Inspect and prune WAL archives

System:
  status              Show pool, project and branch status
  doctor              Run diagnostics and check system health
  setup               One-time host setup (ZFS delegation, WAL root)
  cleanup             Remove resources not tracked in state
  state               Manage the state file

Options:
{options}")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(cmd) => cli::handle_command(cmd, cli.json).await,
        None => {
            let mut cmd = Cli::command();
            cmd.print_help().map_err(Into::into)
        }
    };

    if let Err(err) = result {
        match err.downcast_ref::<UserError>() {
            Some(user) => {
                eprintln!("error: {}", user.message);
                if let Some(hint) = &user.hint {
                    eprintln!("hint:  {hint}");
                }
                std::process::exit(1);
            }
            None => {
                eprintln!("error: {err:#}");
                std::process::exit(2);
            }
        }
    }
}
