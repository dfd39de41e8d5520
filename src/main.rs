// src/main.rs
//
// =============================================================================
// KILN: COMMAND LINE ENTRY POINT
// =============================================================================
//
// Operational inspection commands over a configured installation. The
// interactive shell and the HTTP front-ends live elsewhere; this binary
// only wires the core up far enough to look at it:
//   check     boot the server (discover methods, scan workdirs), report
//   methods   list loaded methods with their source hashes
//   workdir   list the jobs of one workdir
//   urd       list the provenance log's lists, or one list's timestamps

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kiln::methods::MethodRegistry;
use kiln::server::Server;
use kiln::urd::UrdLog;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "kiln", version, about = "Reproducible batch compute")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, default_value = "kiln.conf")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load config and methods, scan all workdirs, print a summary.
    Check,

    /// List loaded methods with their source hashes.
    Methods,

    /// List the jobs of one workdir.
    Workdir {
        /// Workdir name (default: target workdir).
        name: Option<String>,
    },

    /// Inspect the urd provenance log.
    Urd {
        /// Database directory of the urd log.
        #[arg(long, default_value = "urd.db")]
        dir: String,

        /// user/list to show timestamps for; lists everything if unset.
        list: Option<String>,
    },
}

// ============================================================================
// 2. COMMANDS
// ============================================================================

fn boot(config_path: &str) -> Result<Server> {
    let config = kiln::load_config(config_path)
        .with_context(|| format!("loading {}", config_path))?;
    Server::new(config, MethodRegistry::new()).context("booting server")
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            let server = boot(&cli.config)?;
            let config = server.config();
            println!("slices: {}", config.slices);
            println!("target workdir: {}", config.target_workdir);
            for wd in server.list_workdirs() {
                let jobs = server.workdir(&wd.name)?;
                let current = jobs.iter().filter(|j| j.current).count();
                println!(
                    "workdir {} at {} ({} jobs, {} current)",
                    wd.name,
                    wd.path.display(),
                    jobs.len(),
                    current,
                );
            }
            println!("{} methods loaded", server.methods().len());
            Ok(())
        }
        Commands::Methods => {
            let server = boot(&cli.config)?;
            for name in server.methods() {
                let info = server.method_info(&name)?;
                println!("{}  {}  ({})", info.hash, name, info.package);
            }
            Ok(())
        }
        Commands::Workdir { name } => {
            let server = boot(&cli.config)?;
            let name = name.unwrap_or_else(|| server.config().target_workdir.clone());
            for job in server.workdir(&name)? {
                let marker = if job.current { ' ' } else { '!' };
                println!(
                    "{} {}  {}  {:.3}s",
                    marker, job.id, job.method, job.total_time,
                );
            }
            Ok(())
        }
        Commands::Urd { dir, list } => {
            let urd = UrdLog::open(&dir).with_context(|| format!("opening {}", dir))?;
            match list {
                Some(key) => {
                    for ts in urd.since(&key, "0")? {
                        println!("{}", ts);
                    }
                }
                None => {
                    for key in urd.list() {
                        println!("{}", key);
                    }
                }
            }
            Ok(())
        }
    }
}
