//! Workspace Sandbox - Entry Point
//!
//! Command-line front end for checking a deployment configuration and running a
//! single command through the configured backend.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use workspace_sandbox::config::ManagerConfig;
use workspace_sandbox::manager::SandboxManager;
use workspace_sandbox::pool::TenantId;
use workspace_sandbox::sandbox::CommandDescriptor;
use workspace_sandbox::system;

/// Workspace Sandbox - run tenant commands on the configured isolation backend.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Skip system requirements checks
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file and the host tools it needs
    Check {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run one command for a tenant and print its output
    Run {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Tenant identifier
        #[arg(long)]
        tenant: String,

        /// Tenant filesystem root (bind-mounted at /workspace)
        #[arg(long)]
        root: PathBuf,

        /// Working directory inside /workspace
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        argv: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ManagerConfig> {
    match path {
        Some(path) => Ok(ManagerConfig::from_yaml_file(path)?),
        None => Ok(ManagerConfig::default()),
    }
}

fn check_requirements(config: &ManagerConfig, skip: bool) -> Result<()> {
    if skip {
        warn!("Skipping system requirements checks (--skip-checks)");
        return Ok(());
    }

    info!("Checking system requirements...");
    match system::check_all(config.backend, config.use_sudo) {
        Ok(reqs) => {
            info!(
                "System requirements satisfied: kernel {}, cgroups v2: {}, tools: {}",
                reqs.kernel_release,
                reqs.cgroups_v2,
                reqs.tools.len()
            );
            Ok(())
        }
        Err(e) => {
            error!("System requirements check failed");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the command's output
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Workspace Sandbox v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Check { config } => {
            let config = load_config(config.as_ref())?;
            let manager = SandboxManager::new(config)?;
            check_requirements(manager.config(), args.skip_checks)?;
            println!(
                "backend: {} (terminals: {})",
                manager.kind(),
                if manager.supports_terminal() { "yes" } else { "no" }
            );
            Ok(())
        }
        Command::Run {
            config,
            tenant,
            root,
            cwd,
            timeout,
            argv,
        } => {
            let config = load_config(config.as_ref())?;
            let manager = SandboxManager::new(config)?;
            check_requirements(manager.config(), args.skip_checks)?;

            let Some((program, rest)) = argv.split_first() else {
                return Err(miette::miette!("no command given"));
            };
            let mut desc = CommandDescriptor::new(TenantId::new(tenant), root, program.as_str())
                .with_args(rest.iter().cloned());
            if let Some(cwd) = cwd {
                desc = desc.with_working_dir(cwd);
            }
            if let Some(secs) = timeout {
                desc = desc.with_timeout(Duration::from_secs(secs));
            }

            let output = manager.execute(&mut desc).await?.wait().await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);

            if let Err(e) = manager.shutdown().await {
                warn!(error = %e, "Failed to stop idle instances");
            }
            std::io::Write::flush(&mut std::io::stdout()).into_diagnostic()?;
            std::process::exit(output.exit_code);
        }
    }
}
