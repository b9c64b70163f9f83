//! devsandbox CLI
//!
//! One subcommand per lifecycle or dispatch operation. Exits 0 on success and
//! 1 on error; `compile` and `debug` exit with the command's own status.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use devsandbox::{DispatchOutcome, SandboxConfig, SandboxManager};

/// Manage a disposable development sandbox next to this project
#[derive(Debug, Parser)]
#[command(name = "devsandbox", author, version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "sandbox.toml")]
    config: PathBuf,

    /// Kill compile/debug commands after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the backend if needed and provision the sandbox account
    Create,

    /// Copy a project file into the sandbox
    Copy {
        /// Path relative to the project root, or absolute under it
        path: PathBuf,
    },

    /// Copy a sandbox file back over its project counterpart
    Pull { path: PathBuf },

    /// Run the compile command for a file inside the sandbox
    Compile { path: PathBuf },

    /// Run the debug command for a file inside the sandbox
    Debug { path: PathBuf },

    /// Stop (if running) and resume the sandbox
    Restart,

    /// Suspend the sandbox, keeping its data
    Stop,

    /// Show the current sandbox state
    Status,

    /// Back up changed sandbox files, then remove the sandbox
    Destroy,

    /// List teardown backups
    Backups,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> devsandbox::Result<i32> {
    let config = SandboxConfig::load_or_default(&args.config)?;
    let manager = SandboxManager::from_config(config)
        .with_dispatch_timeout(args.timeout.map(Duration::from_secs));

    tracing::debug!(
        backend = %manager.backend_name(),
        root = %manager.identity().root_path.display(),
        "using sandbox"
    );

    match args.command {
        Command::Create => {
            let report = manager.create().await?;
            println!(
                "Sandbox {} ({}installed, account {})",
                report.state,
                if report.installed { "newly " } else { "already " },
                if report.account_created { "created" } else { "existing" }
            );
        }
        Command::Copy { path } => {
            let mapping = manager.push(&path).await?;
            println!(
                "Copied {} -> {}",
                mapping.host_path.display(),
                mapping.sandbox_path.display()
            );
        }
        Command::Pull { path } => {
            let mapping = manager.pull(&path).await?;
            println!(
                "Pulled {} -> {}",
                mapping.sandbox_path.display(),
                mapping.host_path.display()
            );
        }
        Command::Compile { path } => return Ok(relay(manager.compile(&path).await?)),
        Command::Debug { path } => return Ok(relay(manager.debug(&path).await?)),
        Command::Restart => {
            println!("Sandbox {}", manager.restart().await?);
        }
        Command::Stop => {
            println!("Sandbox {}", manager.stop().await?);
        }
        Command::Status => {
            println!("{}", manager.status().await?);
        }
        Command::Destroy => {
            let report = manager.destroy().await?;
            for record in &report.backups {
                println!("Backed up {} -> {}", record.original_name, record.backup_path.display());
            }
            println!(
                "Sandbox {} ({} files checked, {} skipped, {} backed up)",
                report.state,
                report.scanned,
                report.skipped,
                report.backups.len()
            );
        }
        Command::Backups => {
            let backups = manager.backups()?;
            if backups.is_empty() {
                println!("No backups in {}", manager.config().backup_dir().display());
            }
            for record in backups {
                println!(
                    "{}  {}  {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.original_name,
                    record.backup_path.display()
                );
            }
        }
    }

    Ok(0)
}

/// Prints the command's streams and returns its exit code.
fn relay(outcome: DispatchOutcome) -> i32 {
    tracing::debug!(command = %outcome.command, exit_code = outcome.exit_code, "command finished");
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);
    outcome.exit_code
}
