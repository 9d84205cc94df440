//! `rbuild`: sync a project with its build-server mirror and build remotely.
//!
//! Results are printed to stdout as JSON; build output is streamed to stdout
//! as it arrives. Exit codes are listed in [`rbuild::exit_codes`].

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use rbuild::core::decision::ReconcileDecision;
use rbuild::exit_codes;
use rbuild::io::client::RemoteClient;
use rbuild::io::config::{CLIENT_CONFIG_FILE, ClientConfig, load_client_config};
use rbuild::io::git::Git;
use rbuild::io::runtime::RuntimePaths;
use rbuild::sync::{BuildOutcome, SyncOptions, build, pull, sync};

#[derive(Parser)]
#[command(
    name = "rbuild",
    version,
    about = "Keep a remote build mirror in sync with this repository and build there"
)]
struct Cli {
    /// Build server base URL (overrides `server_url` in the config file).
    #[arg(long, global = true)]
    server: Option<String>,

    /// Config file (default: `<project>/rbuild.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project directory (default: current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the client and server git state.
    State,
    /// Restore the server mirror and reconcile both sides.
    Sync {
        /// Keep uncommitted changes on the server instead of backing them up and discarding them.
        #[arg(long)]
        keep_server_changes: bool,
    },
    /// Sync, send local changes, and run a build on the server.
    Build {
        #[arg(long)]
        keep_server_changes: bool,
    },
    /// Apply the server's uncommitted changes to the local tree.
    Pull,
    /// Print the status of a build job.
    Status { job_id: String },
    /// Print build output of a job from a byte offset.
    Progress {
        job_id: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn main() {
    rbuild::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let start_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let root = Git::new(&start_dir)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", start_dir.display()))?;
    let config = load_config(&root, &cli)?;
    debug!(root = %root.display(), server = %config.server_url, "resolved project");

    let local = Git::new(&root);
    let runtime = RuntimePaths::new(&root, &config.runtime_dir);
    let remote = RemoteClient::new(&config.server_url, config.request_timeout())?;

    match cli.command {
        Command::State => {
            let client = local.snapshot().context("client: read git state")?;
            let server = remote.git_state().context("server: read git state")?;
            print_json(&serde_json::json!({ "client": client, "server": server }))?;
            Ok(exit_codes::OK)
        }
        Command::Sync {
            keep_server_changes,
        } => {
            let options = SyncOptions {
                keep_server_changes,
            };
            let outcome = sync(&local, &remote, &config.reconcile, &options)?;
            print_json(&outcome.decision.report())?;
            Ok(decision_exit_code(&outcome.decision))
        }
        Command::Build {
            keep_server_changes,
        } => {
            let options = SyncOptions {
                keep_server_changes,
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let outcome = build(
                &local,
                &runtime,
                &remote,
                &config.reconcile,
                &options,
                &mut out,
            )?;
            drop(out);
            match outcome {
                BuildOutcome::NotSynced(synced) => {
                    print_json(&synced.decision.report())?;
                    Ok(decision_exit_code(&synced.decision))
                }
                BuildOutcome::Finished { job, .. } => {
                    print_json(&job)?;
                    Ok(if job.succeeded() {
                        exit_codes::OK
                    } else {
                        exit_codes::BUILD_FAILED
                    })
                }
            }
        }
        Command::Pull => {
            let report = pull(&local, &runtime, &remote);
            print_json(&report)?;
            Ok(if report.success() {
                exit_codes::OK
            } else {
                exit_codes::ERROR
            })
        }
        Command::Status { job_id } => {
            print_json(&remote.job_status(&job_id)?)?;
            Ok(exit_codes::OK)
        }
        Command::Progress { job_id, offset } => {
            print_json(&remote.job_progress(&job_id, offset)?)?;
            Ok(exit_codes::OK)
        }
    }
}

fn load_config(root: &Path, cli: &Cli) -> Result<ClientConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(CLIENT_CONFIG_FILE));
    let mut config = load_client_config(&path)?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
        config.validate().context("invalid --server")?;
    }
    Ok(config)
}

fn decision_exit_code(decision: &ReconcileDecision) -> i32 {
    let status = decision.status();
    if status.is_in_sync() {
        exit_codes::OK
    } else if status.is_blocked() {
        exit_codes::BLOCKED
    } else {
        exit_codes::ERROR
    }
}

/// Serialize `value` as pretty JSON on stdout with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    io::stdout()
        .lock()
        .write_all(payload.as_bytes())
        .context("write stdout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbuild::core::types::{Side, Target};

    #[test]
    fn parse_sync_with_global_flags() {
        let cli = Cli::parse_from([
            "rbuild",
            "sync",
            "--keep-server-changes",
            "--server",
            "http://mac.local:8751",
        ]);
        assert!(matches!(
            cli.command,
            Command::Sync {
                keep_server_changes: true
            }
        ));
        assert_eq!(cli.server.as_deref(), Some("http://mac.local:8751"));
    }

    #[test]
    fn parse_progress_offset() {
        let cli = Cli::parse_from(["rbuild", "progress", "abc", "--offset", "42"]);
        match cli.command {
            Command::Progress { job_id, offset } => {
                assert_eq!(job_id, "abc");
                assert_eq!(offset, 42);
            }
            _ => panic!("expected progress"),
        }
    }

    #[test]
    fn exit_code_follows_decision_class() {
        let target = Target {
            branch: "main".to_string(),
            commit: "abcd".to_string(),
        };
        assert_eq!(
            decision_exit_code(&ReconcileDecision::Aligned { target }),
            exit_codes::OK
        );
        assert_eq!(
            decision_exit_code(&ReconcileDecision::BlockedDetachedHead {
                side: Side::Server,
                actions_applied: Vec::new(),
            }),
            exit_codes::BLOCKED
        );
        assert_eq!(
            decision_exit_code(&ReconcileDecision::error("boom", Vec::new())),
            exit_codes::ERROR
        );
    }
}
