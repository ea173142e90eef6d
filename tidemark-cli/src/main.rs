use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use tidemark_store::{FileStore, SqliteRemote};
use tidemark_sync::{PullOptions, SyncEngine, SyncEvent};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Offline-first sync between a local cache and a remote store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Storage directory for the local cache and remote database
        #[arg(short, long)]
        storage: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Push local records to the remote store
    Push,

    /// Pull remote records into the local cache
    Pull {
        /// Clear cached keys before writing the pulled records
        #[arg(long, conflicts_with = "since")]
        cleanup: bool,

        /// Only fetch records modified since the last pull
        #[arg(long)]
        since: bool,
    },

    /// Show the synchronization status
    Status,

    /// Show counters and storage usage
    Stats,

    /// Export the event log
    Logs {
        /// Write the export to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run emergency recovery and leave degraded mode
    Recover,

    /// Run autosave in the foreground until interrupted
    Run,
}

fn build_engine(config: &Config) -> Result<SyncEngine> {
    std::fs::create_dir_all(&config.storage_path).with_context(|| {
        format!(
            "Failed to create storage directory: {}",
            config.storage_path.display()
        )
    })?;

    let local = FileStore::open(config.local_cache_path(), config.local_quota_bytes)
        .context("Failed to open local cache")?;
    let remote =
        SqliteRemote::open(config.remote_db_path()).context("Failed to open remote database")?;

    let engine = SyncEngine::builder(config.engine.clone(), Arc::new(local), Arc::new(remote))
        .build()
        .context("Failed to build sync engine")?;
    Ok(engine)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    if let Commands::Init { storage, force } = &cli.command {
        if Config::exists()? && !force {
            anyhow::bail!(
                "Configuration already exists at {} (use --force to overwrite)",
                config::get_config_path()?.display()
            );
        }

        let storage_path = match storage {
            Some(path) => path.clone(),
            None => config::default_storage_path()?,
        };
        let config = Config::with_storage(storage_path);
        config.save()?;

        println!("Configuration written to {}", config::get_config_path()?.display());
        println!("Storage directory: {}", config.storage_path.display());
        return Ok(());
    }

    let config = Config::load().context("Run `tidemark init` first")?;
    let engine = build_engine(&config)?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Push => {
            let pushed = Arc::new(Mutex::new(None));
            let captured = pushed.clone();
            let subscription = engine.orchestrator().subscribe(move |event| {
                if let SyncEvent::SaveSuccess { result, .. } = event {
                    *captured.lock().unwrap_or_else(|p| p.into_inner()) = Some(result.count);
                }
            });

            let saved = engine.status().save_now().await;
            subscription.unsubscribe();

            let count = *pushed.lock().unwrap_or_else(|p| p.into_inner());
            if saved {
                println!("Pushed {} records", count.unwrap_or(0));
            } else {
                let status = engine.status().snapshot();
                println!(
                    "Push failed: {}",
                    status.error.as_deref().unwrap_or("nothing to push")
                );
                // One-shot commands exit before the background recovery ladder runs
                println!("Retry with `tidemark run`, or `tidemark recover` to run recovery now");
            }
        }
        Commands::Pull { cleanup, since } => {
            let result = if since {
                let reconciler = engine.reconciler();
                reconciler.pull_since(reconciler.watermark()).await
            } else if cleanup {
                engine.reconciler().pull(PullOptions::with_cleanup()).await
            } else {
                engine.status().sync_now().await;
                let status = engine.status().snapshot();
                match status.error {
                    Some(error) => println!("Pull failed: {}", error),
                    None => println!("Pulled {} records", status.data_count),
                }
                return Ok(());
            };

            if result.success {
                println!(
                    "Pulled {} records{}",
                    result.count,
                    if result.lightweight {
                        " (reduced to fit local storage)"
                    } else {
                        ""
                    }
                );
            } else {
                println!(
                    "Pull failed: {}",
                    result
                        .error_message()
                        .unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Commands::Status => {
            print_json(&engine.status().refresh())?;
        }
        Commands::Stats => {
            print_json(&engine.status().stats())?;
        }
        Commands::Logs { output } => {
            let export = engine.status().export_logs()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, export).with_context(|| {
                        format!("Failed to write log export: {}", path.display())
                    })?;
                    println!("Event log exported to {}", path.display());
                }
                None => println!("{}", export),
            }
        }
        Commands::Recover => {
            if let Some(result) = engine.status().force_recovery().await {
                print_json(&result)?;
            }
        }
        Commands::Run => {
            engine.start(Some(Duration::from_secs(config.status_poll_secs)));
            info!("Autosave running; press Ctrl-C to stop");

            let mut updates = engine.status().watch();
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = updates.borrow_and_update().clone();
                        info!(
                            "records={} unsynced={} saving={} syncing={} degraded={} error={:?}",
                            status.data_count,
                            status.has_unsynced_data,
                            status.saving,
                            status.syncing,
                            status.degraded_mode,
                            status.error
                        );
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            let decision = engine.shutdown().await;
            println!("Stopped ({:?})", decision);
        }
    }

    Ok(())
}
