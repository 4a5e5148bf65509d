use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_core::actions::builtin::BUILTIN_ACTIONS;
use relay_core::app::{InputMessage, RunExit, RuntimeStatus};
use relay_core::channel::{DurableChannel, Topic};
use relay_core::impls::{EchoModel, JsonFileSnapshotStore};
use relay_core::ports::{Clock, SystemClock, UlidGenerator};
use relay_core::{RelayConfig, RuntimeBuilder};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Task orchestration runtime")]
struct Cli {
    /// Path to the TOML config file. A missing file means all defaults.
    #[arg(long, global = true, default_value = "relay.toml", env = "RELAY_CONFIG")]
    config: PathBuf,

    /// Overrides `runtime.data_dir` from the config file.
    #[arg(long, global = true, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller loop with the offline echo model until Ctrl-C.
    Run,
    /// Append a message to the user-input channel.
    Submit {
        text: String,
        #[arg(long)]
        source: Option<String>,
    },
    /// Print task counts from the last saved snapshot.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print packets of a channel after a cursor.
    Tail {
        /// user-input, worker-result, teller-digest or thinker-decision
        topic: String,
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match &cli.command {
        Command::Run => run(&cli).await,
        Command::Submit { text, source } => submit(&cli, text, source.clone()).await,
        Command::Status { json } => status(&cli, *json).await,
        Command::Tail { topic, from, limit } => tail(&cli, topic, *from, *limit).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(&cli.config)?;
    if let Some(dir) = &cli.data_dir {
        config.runtime.data_dir = dir.clone();
    }
    Ok(config)
}

fn channel() -> DurableChannel {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    DurableChannel::new(Arc::new(UlidGenerator::new(Arc::clone(&clock))), clock)
}

async fn run(cli: &Cli) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received; shutting down");
        }
        signal.cancel();
    });

    loop {
        let config = load_config(cli)?;
        let runtime = RuntimeBuilder::new(config)
            .model(Arc::new(EchoModel))
            .with_builtin_actions()?
            .expect_actions(&BUILTIN_ACTIONS)
            .build()?;
        runtime.start().await;

        match runtime.run(shutdown.clone()).await {
            RunExit::Shutdown => return Ok(()),
            RunExit::RestartRequested { reason } => {
                tracing::info!(reason = ?reason, "restarting runtime");
            }
        }
    }
}

async fn submit(cli: &Cli, text: &str, source: Option<String>) -> Result<()> {
    if text.trim().is_empty() {
        bail!("message text must not be empty");
    }
    let config = load_config(cli)?;
    let layout = relay_core::channel::ChannelLayout::new(&config.runtime.data_dir);
    let packet = channel()
        .append(
            &layout.log_path(Topic::UserInput),
            InputMessage {
                text: text.to_string(),
                source,
            },
        )
        .await
        .context("append to user-input")?;
    println!("{}", packet.id);
    Ok(())
}

async fn status(cli: &Cli, json: bool) -> Result<()> {
    let config = load_config(cli)?;
    let store = JsonFileSnapshotStore::in_data_dir(&config.runtime.data_dir);
    let Some(status) = RuntimeStatus::load(&store).await? else {
        println!("no snapshot at {}", store.path().display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    let c = &status.counts;
    println!("snapshot saved at {}", status.saved_at.to_rfc3339());
    println!(
        "tasks: pending={} running={} succeeded={} failed={} canceled={}",
        c.pending, c.running, c.succeeded, c.failed, c.canceled
    );
    println!(
        "cron jobs: enabled={} disabled={}",
        c.cron_jobs_enabled, c.cron_jobs_disabled
    );
    println!(
        "cursors: user-input={} worker-result={}",
        status.queues.inputs_cursor, status.queues.results_cursor
    );
    for task in &status.active {
        let title = if task.title.is_empty() { "untitled" } else { &task.title };
        let scheduled = if task.scheduled { " (scheduled)" } else { "" };
        println!("  {} [{}] {title}{scheduled}", task.id, task.status);
    }
    Ok(())
}

async fn tail(cli: &Cli, topic: &str, from: u64, limit: Option<usize>) -> Result<()> {
    let Some(topic) = Topic::parse(topic) else {
        bail!(
            "unknown topic `{topic}`; expected one of: {}",
            Topic::ALL.map(Topic::as_str).join(", ")
        );
    };
    let config = load_config(cli)?;
    let layout = relay_core::channel::ChannelLayout::new(&config.runtime.data_dir);
    let packets = channel()
        .consume::<serde_json::Value>(&layout.log_path(topic), from, limit)
        .await?;
    for packet in packets {
        println!(
            "{}\t{}",
            packet.cursor,
            serde_json::to_string(&packet.packet)?
        );
    }
    Ok(())
}
