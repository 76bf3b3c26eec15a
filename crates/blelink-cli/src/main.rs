//! `blelink`: keep a notification session open with one BLE peripheral.
//!
//! The first `blelink connect` asks which peripheral to use and remembers
//! it. Later runs reconnect to it without asking, falling back to the
//! selection prompt only when the remembered peripheral is unreachable.
//!
//! # Environment Variables
//!
//! - `BLELINK_CONFIG`: Path to the configuration file
//! - `BLELINK_STATE`: Path to the file holding the remembered peripheral
//! - `NO_COLOR`: Disable colored output when set
//! - `RUST_LOG`: Log filter when neither `--verbose` nor `--quiet` is given

mod config;
mod select;
mod store;
mod style;

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use blelink_core::btle::BtleTransport;
use blelink_core::{
    ConnectResult, ConnectionStateMachine, DurableStore, EventDispatcher, EventReceiver,
    FailureReason, ReconnectionPolicy, SessionEvent, SessionState, Supervisor,
};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::select::PromptChooser;
use crate::store::TomlStore;

#[derive(Parser)]
#[command(name = "blelink")]
#[command(author, version, about = "Persistent notification sessions with a BLE peripheral", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    no_color: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true, env = "BLELINK_CONFIG")]
    config: Option<PathBuf>,

    /// State file holding the remembered peripheral
    #[arg(long, global = true, env = "BLELINK_STATE")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, asking for a peripheral if the remembered one is unreachable
    Connect {
        /// Disconnect once connected instead of printing notifications
        #[arg(long)]
        no_stream: bool,
    },

    /// Reconnect to the remembered peripheral and keep the session alive
    Watch,

    /// Show configuration and the remembered peripheral
    Status,

    /// Forget the remembered peripheral
    Forget,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Everything one process needs to drive a session.
struct Session {
    events: Arc<EventDispatcher>,
    machine: Arc<ConnectionStateMachine>,
    policy: Arc<ReconnectionPolicy>,
}

impl Session {
    async fn open(config: &Config, store: Arc<TomlStore>) -> Result<Self> {
        let transport = Arc::new(
            BtleTransport::new(config.link.clone(), Arc::new(PromptChooser))
                .await
                .context("Failed to open Bluetooth adapter")?,
        );
        let events = Arc::new(EventDispatcher::default());
        let machine = Arc::new(ConnectionStateMachine::new(
            transport.clone(),
            events.clone(),
            config.link.clone(),
            events.payload_callback(),
        ));
        let policy = Arc::new(ReconnectionPolicy::new(
            machine.clone(),
            transport,
            store,
            events.clone(),
        ));
        Ok(Self {
            events,
            machine,
            policy,
        })
    }
}

/// Print session events until `cancel` fires, then flush what is queued.
///
/// Payloads go to stdout, everything else to stderr.
fn spawn_printer(
    mut events: EventReceiver,
    no_color: bool,
    quiet: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let print = move |event: SessionEvent| match event {
        SessionEvent::Payload { .. } => println!("{}", style::format_event(&event, true)),
        _ if quiet => {}
        _ => eprintln!("{}", style::format_event(&event, no_color)),
    };

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => print(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, dropped events");
                }
                Err(RecvError::Closed) => return,
            }
        }
        while let Ok(event) = events.try_recv() {
            print(event);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle completions command early (before tracing init)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "blelink", &mut io::stdout());
        return Ok(());
    }

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::path);
    let config = Config::load_from(&config_path);
    let no_color = cli.no_color || config.no_color;
    let store = Arc::new(TomlStore::open(
        cli.state.clone().unwrap_or_else(TomlStore::default_path),
    ));

    match cli.command {
        Commands::Connect { no_stream } => {
            cmd_connect(&config, store, no_stream, no_color, cli.quiet).await
        }
        Commands::Watch => cmd_watch(&config, store, no_color, cli.quiet).await,
        Commands::Status => cmd_status(&config, &config_path, &store),
        Commands::Forget => cmd_forget(&config, &store, no_color),
        Commands::Init { force } => cmd_init(&config_path, force, no_color),
        Commands::Completions { .. } => Ok(()),
    }
}

async fn cmd_connect(
    config: &Config,
    store: Arc<TomlStore>,
    no_stream: bool,
    no_color: bool,
    quiet: bool,
) -> Result<()> {
    let session = Session::open(config, store).await?;
    let cancel = CancellationToken::new();
    let printer = spawn_printer(session.events.subscribe(), no_color, quiet, cancel.clone());

    let report = session.policy.run_user_action().await;
    if !report.is_connected() {
        cancel.cancel();
        let _ = printer.await;
        return match report.result {
            Some(ConnectResult::Failed(FailureReason::UserCancelledSelection)) => Ok(()),
            Some(ConnectResult::Failed(reason)) => bail!("Connection failed: {}", reason),
            _ => bail!("Not connected ({})", report.state),
        };
    }

    if !no_stream {
        let mut losses = session.machine.link_losses();
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C")?,
            _ = losses.changed() => {
                let hint = "Link lost; run `blelink watch` to keep the session alive";
                eprintln!("{}", style::format_warning(hint, no_color));
            }
        }
    }

    session.machine.disconnect().await;
    cancel.cancel();
    let _ = printer.await;
    Ok(())
}

async fn cmd_watch(
    config: &Config,
    store: Arc<TomlStore>,
    no_color: bool,
    quiet: bool,
) -> Result<()> {
    let session = Session::open(config, store).await?;
    let cancel = CancellationToken::new();
    let printer = spawn_printer(session.events.subscribe(), no_color, quiet, cancel.clone());

    if config.behavior.auto_connect {
        session.policy.connect_on_startup().await;
    }

    if session.machine.state() == SessionState::WaitingForUserGesture && confirm_reconnect().await {
        session.policy.connect().await;
    }

    if session.machine.state() != SessionState::Connected {
        cancel.cancel();
        let _ = printer.await;
        eprintln!(
            "{}",
            style::format_warning("No session to watch; run `blelink connect` first", no_color)
        );
        return Ok(());
    }

    let stop = cancel.child_token();
    let supervisor = config.behavior.auto_reconnect.then(|| {
        Supervisor::new(session.policy.clone(), config.reconnect.clone())
            .with_cancellation(stop.clone())
            .spawn()
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    stop.cancel();
    if let Some(task) = supervisor {
        let _ = task.await;
    }
    session.machine.disconnect().await;
    cancel.cancel();
    let _ = printer.await;
    Ok(())
}

/// Ask whether to reconnect now. Answering is the user action the
/// platform asked for.
async fn confirm_reconnect() -> bool {
    if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
        return false;
    }
    tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt("Reconnecting needs your confirmation. Reconnect now?")
            .default(true)
            .interact_opt()
            .ok()
            .flatten()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

fn cmd_status(config: &Config, config_path: &std::path::Path, store: &TomlStore) -> Result<()> {
    let remembered = store
        .get(&config.link.store_key)
        .context("Failed to read state file")?
        .filter(|id| !id.trim().is_empty());
    let link = &config.link;

    println!(
        "Config:          {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (defaults)" }
    );
    println!("State file:      {}", store.path().display());
    println!(
        "Remembered:      {}",
        remembered.as_deref().unwrap_or("(none)")
    );
    println!("Service:         {}", link.service);
    println!("Characteristic:  {}", link.characteristic);
    println!(
        "Name filter:     {}",
        if link.name_prefix.is_empty() {
            "(any)"
        } else {
            link.name_prefix.as_str()
        }
    );
    println!("Auto-connect:    {}", config.behavior.auto_connect);
    println!("Auto-reconnect:  {}", config.behavior.auto_reconnect);
    Ok(())
}

fn cmd_forget(config: &Config, store: &TomlStore, no_color: bool) -> Result<()> {
    store
        .remove(&config.link.store_key)
        .context("Failed to update state file")?;
    println!(
        "{}",
        style::format_success("Remembered peripheral forgotten", no_color)
    );
    Ok(())
}

fn cmd_init(path: &std::path::Path, force: bool, no_color: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save_to(path)?;
    println!(
        "{}",
        style::format_success(&format!("Wrote {}", path.display()), no_color)
    );
    Ok(())
}
