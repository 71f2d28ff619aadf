//! `neogrip-cli` – NeoGrip Command Line Interface
//!
//! The `neogrip` binary wires the crates together in one of three
//! deployments:
//!
//! * `neogrip run` – Cortex session and hand on the same machine.
//! * `neogrip relay-client` – signal host: Cortex session, commands forwarded
//!   over TCP to the actuator host.
//! * `neogrip relay-server` – actuator host: accepts the relay link and drives
//!   the hand.
//!
//! `neogrip init` writes a default `~/.neogrip/config.toml` to edit.
//!
//! Ctrl-C trips the killswitch: every actuator is stopped at once, the relay
//! (if any) carries one killswitch record, and the session is torn down. A
//! second Ctrl-C exits immediately.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use neogrip_hal::make_driver;
use neogrip_kernel::{HandController, KillSwitch};
use neogrip_middleware::{RelayClient, RelayServer};
use neogrip_runtime::{SessionClient, StopReason, WsTransport, init_tracing, run_forwarder, run_local};
use neogrip_types::NeoError;

use config::{Backend, Config};

#[derive(Parser)]
#[command(name = "neogrip")]
#[command(version)]
#[command(about = "Drive a robotic hand from Emotiv mental commands", long_about = None)]
struct Cli {
    /// Configuration file [default: ~/.neogrip/config.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Use the simulated servo driver instead of the PCA9685
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream mental commands to a hand attached to this machine
    Run,

    /// Stream mental commands to a remote actuator host
    RelayClient {
        /// Actuator host [default: relay.host]
        #[arg(long)]
        host: Option<String>,

        /// Relay port [default: relay.port]
        #[arg(long)]
        port: Option<u16>,
    },

    /// Accept a relay link and drive the hand attached to this machine
    RelayServer {
        /// Interface to listen on [default: relay.bind]
        #[arg(long)]
        bind: Option<String>,

        /// Relay port [default: relay.port]
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("neogrip");

    print_banner();

    let path = cli.config.clone().unwrap_or_else(config::config_path);
    if let Command::Init { force } = cli.command {
        return init_config(&path, force);
    }

    let mut cfg = match config::load_or_default(&path) {
        Ok((cfg, true)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok((cfg, false)) => {
            println!(
                "  No config at {}; using defaults. Run `{}` to create one.",
                path.display().to_string().dimmed(),
                "neogrip init".bold()
            );
            cfg
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if cli.sim {
        cfg.hardware.backend = Backend::Sim;
    }
    apply_relay_flags(&mut cfg, &cli.command);

    // ── Ctrl-C → killswitch ───────────────────────────────────────────────
    let killswitch = KillSwitch::new();
    let ks = killswitch.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if ks.trip() {
            println!();
            println!("{}", "⚠  Ctrl-C received – killswitch tripped, stopping the hand …".yellow().bold());
        } else {
            eprintln!("{}", "⚠  Second Ctrl-C – exiting immediately.".red().bold());
            std::process::exit(130);
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the killswitch can only trip from the relay");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async {
        match cli.command {
            Command::Run => local_mode(&cfg, &killswitch).await,
            Command::RelayClient { .. } => forwarder_mode(&cfg, &killswitch).await,
            Command::RelayServer { .. } => actuator_mode(&cfg, &killswitch).await,
            Command::Init { .. } => Ok(()),
        }
    });

    match outcome {
        Ok(()) => {
            println!("  {} Stopped cleanly.", "✓".green().bold());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

async fn local_mode(cfg: &Config, killswitch: &KillSwitch) -> Result<(), NeoError> {
    let mut hand = build_hand(cfg, killswitch)?;
    let mut session = match connect_session(cfg, killswitch).await {
        Ok(Some(session)) => session,
        Ok(None) => return release(hand),
        Err(e) => {
            release(hand)?;
            return Err(e);
        }
    };
    println!("  {} Streaming to the local hand. Ctrl-C to stop.", "▶".cyan().bold());
    let reason = run_local(&mut session, &mut hand, killswitch).await?;
    report(reason);
    Ok(())
}

async fn forwarder_mode(cfg: &Config, killswitch: &KillSwitch) -> Result<(), NeoError> {
    let addr = cfg.relay_addr();
    let relay = RelayClient::connect(addr.as_str(), killswitch.clone()).await?;
    println!("  {} Relay connected to {}", "✓".green().bold(), addr.bold());

    let Some(mut session) = connect_session(cfg, killswitch).await? else {
        return relay.finish().await;
    };
    println!("  {} Forwarding to the actuator host. Ctrl-C to stop.", "▶".cyan().bold());
    let reason = run_forwarder(&mut session, relay, killswitch).await?;
    report(reason);
    Ok(())
}

async fn actuator_mode(cfg: &Config, killswitch: &KillSwitch) -> Result<(), NeoError> {
    let mut hand = build_hand(cfg, killswitch)?;
    let server = match RelayServer::bind(cfg.bind_addr(), killswitch.clone()).await {
        Ok(server) => server,
        Err(e) => {
            release(hand)?;
            return Err(e);
        }
    };
    if let Ok(addr) = server.local_addr() {
        println!("  {} Waiting for the signal host on {}", "▶".cyan().bold(), addr.to_string().bold());
    }
    let served = server.run(&mut hand).await;
    release(hand)?;
    served?;
    report(StopReason::Killswitch);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_hand(cfg: &Config, killswitch: &KillSwitch) -> Result<HandController, NeoError> {
    let hand_cfg = cfg.hand_config()?;
    let frequency_hz = cfg.hardware.frequency_hz;
    let driver = make_driver(&cfg.driver_kind(), frequency_hz)?;
    let hand = HandController::new(hand_cfg, cfg.motors(), driver, frequency_hz, killswitch.clone())?;
    info!(
        actuators = ?hand.actuators().collect::<Vec<_>>(),
        backend = ?cfg.hardware.backend,
        "hand ready"
    );
    Ok(hand)
}

/// `None` when the killswitch trips while connecting.
async fn connect_session(
    cfg: &Config,
    killswitch: &KillSwitch,
) -> Result<Option<SessionClient<WsTransport>>, NeoError> {
    println!("  Connecting to Cortex at {} …", cfg.cortex.url.dimmed());
    tokio::select! {
        biased;
        _ = killswitch.tripped() => Ok(None),
        res = SessionClient::connect(&cfg.cortex.url, cfg.cortex.insecure_tls, cfg.session_config()) => res.map(Some),
    }
}

fn release(hand: HandController) -> Result<(), NeoError> {
    hand.release()
}

fn apply_relay_flags(cfg: &mut Config, command: &Command) {
    match command {
        Command::RelayClient { host, port } => {
            if let Some(host) = host {
                cfg.relay.host = host.clone();
            }
            if let Some(port) = port {
                cfg.relay.port = *port;
            }
        }
        Command::RelayServer { bind, port } => {
            if let Some(bind) = bind {
                cfg.relay.bind = bind.clone();
            }
            if let Some(port) = port {
                cfg.relay.port = *port;
            }
        }
        Command::Run | Command::Init { .. } => {}
    }
}

fn report(reason: StopReason) {
    match reason {
        StopReason::Killswitch => println!("  {} Killswitch: all actuators stopped.", "■".red().bold()),
        StopReason::StreamEnded => println!("  {} Cortex stream ended.", "■".yellow().bold()),
    }
}

fn init_config(path: &Path, force: bool) -> ExitCode {
    if path.exists() && !force {
        println!(
            "  {} already exists; pass {} to overwrite.",
            path.display().to_string().bold(),
            "--force".bold()
        );
        return ExitCode::FAILURE;
    }
    match config::save_to(&Config::default(), path) {
        Ok(()) => {
            println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
            println!("  Fill in [cortex] client_id and client_secret before the first run.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   _  __          _____      _     "#.bold().cyan());
    println!("{}", r#"  / |/ /__ ___  / ___/_____(_)__  "#.bold().cyan());
    println!("{}", r#" /    / -_) _ \/ (_ / __/ / / _ \ "#.bold().cyan());
    println!("{}", r#"/_/|_/\__/\___/\___/_/ /_/_/ .__/ "#.bold().cyan());
    println!("{}", r#"                          /_/     "#.bold().cyan());
    println!("  {} v{}\n", "NeoGrip".bold(), env!("CARGO_PKG_VERSION"));
}
