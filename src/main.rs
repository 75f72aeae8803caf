use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rillsync::config::Config;
use rillsync::daemon::Daemon;
use rillsync::logging::init_logging;
use rillsync::sync::faillog::read_pending;
use rillsync::sync::metadata::MetadataManager;

#[derive(Parser)]
#[command(name = "rillsync")]
#[command(about = "Watch a directory and keep remote targets in sync", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon until interrupted
    Run {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate the configuration and print the resolved settings
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Push the whole tree to every one-way target once
    FullSync {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List transfers waiting for a retry
    Faillog {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Lift the suspension of a conflicted path
    Resume {
        #[arg(short, long)]
        config: PathBuf,

        /// Path relative to the watched root
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = Config::load(&config)?;
            init_logging(&config.logging)?;
            let daemon = Daemon::new(config)?;
            let stats = daemon.run().await?;
            println!(
                "Stopped: {} events received, {} transfers succeeded, {} failed, {} given up",
                stats.queue.received, stats.dispatch.succeeded, stats.dispatch.failed, stats.dispatch.given_up
            );
        }
        Commands::Check { config } => {
            let config = Config::load(&config)?;
            print_config(&config);
        }
        Commands::FullSync { config } => {
            let config = Config::load(&config)?;
            init_logging(&config.logging)?;
            let grace = config.shutdown_grace;
            let daemon = Daemon::new(config)?;
            let failed = daemon.full_sync().await;
            daemon.dispatcher().shutdown(grace).await;
            if failed > 0 {
                anyhow::bail!("full sync failed for {} target(s)", failed);
            }
            println!("Full sync complete");
        }
        Commands::Faillog { config } => {
            let config = Config::load(&config)?;
            let entries = read_pending(&config.retry.fail_log)
                .with_context(|| format!("Failed to read {}", config.retry.fail_log.display()))?;
            if entries.is_empty() {
                println!("No pending retries");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}\tattempts={}\tfirst={}\t{}",
                    entry.target,
                    entry.action,
                    entry.relative_path,
                    entry.attempt_count,
                    entry.first_failed_at.to_rfc3339(),
                    entry.last_error
                );
            }
        }
        Commands::Resume { config, path } => {
            let config = Config::load(&config)?;
            let metadata = MetadataManager::open(
                &config.bidirectional.metadata_dir,
                &config.watch.root,
                config.bidirectional.node_id.as_deref(),
                config.bidirectional.signature,
            )?;
            let resumed = metadata.resume(&path)?;
            if resumed == 0 {
                println!("{} is not suspended", path);
            } else {
                println!("Resumed {} on {} target(s)", path, resumed);
            }
        }
    }

    Ok(())
}

fn print_config(config: &Config) {
    println!("Watched root:   {}", config.watch.root.display());
    println!("Window:         {}s", config.watch.window.as_secs());
    println!("Max backlog:    {}", config.watch.max_backlog);
    println!("Fail log:       {}", config.retry.fail_log.display());
    println!("Metadata dir:   {}", config.bidirectional.metadata_dir.display());
    println!("Backup dir:     {}", config.bidirectional.backup_dir.display());
    println!("Targets:");
    for target in &config.targets {
        let mode = if target.bidirectional {
            format!("bidirectional, {}", target.strategy.description())
        } else {
            "one-way".to_string()
        };
        println!(
            "  {:<12} {} ({} threads, {})",
            target.id,
            target.display_name(),
            target.threads,
            mode
        );
    }
}
