//! SecMan CLI binary.
//!
//! # Commands
//!
//! - `serve` - Run a daemon answering echo commands
//! - `send` - Send one command over a stream or as a datagram
//! - `reconcile` - Print the decided policy for two configurations
//! - `config` - Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secman::{
    config::{Permission, PolicyRequest, SecurityConfig},
    crypto::ChaChaCipher,
    protocol::{reconcile, CommandInitiator, CommandRequest, PROTOCOL_VERSION},
    server::{CommandTable, Daemon, EchoHandler},
    session::SessionService,
    transport::WireMessage,
    ErrorStack, VERSION,
};

#[derive(Parser)]
#[command(name = "secman")]
#[command(version = VERSION)]
#[command(about = "SecMan - security negotiation and session cache", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/secman/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a daemon answering echo commands
    Serve {
        /// Commands to serve, as NUMBER:PERMISSION
        #[arg(long = "command", default_values = ["421:READ", "422:WRITE"])]
        commands: Vec<String>,
    },

    /// Send one command and print the reply
    Send {
        /// Peer command address
        peer: String,

        /// Command number
        command: u32,

        /// Payload to send after the command starts
        #[arg(short, long, default_value = "")]
        payload: String,

        /// Send as a datagram over a cached (or bootstrapped) session
        #[arg(long)]
        udp: bool,

        /// Permission level whose policy we declare
        #[arg(long, default_value = "CLIENT")]
        permission: String,

        /// Require authentication
        #[arg(long)]
        force_auth: bool,
    },

    /// Print the decided policy for an initiator and an acceptor config
    Reconcile {
        /// Initiator's configuration file
        initiator: PathBuf,

        /// Acceptor's configuration file
        acceptor: PathBuf,

        /// Permission level
        #[arg(long, default_value = "READ")]
        permission: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);
    let config = SecurityConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Serve { commands } => cmd_serve(config, &commands),
        Commands::Send {
            peer,
            command,
            payload,
            udp,
            permission,
            force_auth,
        } => cmd_send(config, peer, command, &payload, udp, &permission, force_auth),
        Commands::Reconcile {
            initiator,
            acceptor,
            permission,
        } => cmd_reconcile(&initiator, &acceptor, &permission),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_command_arg(arg: &str) -> anyhow::Result<(u32, Permission)> {
    let (number, permission) = arg
        .split_once(':')
        .with_context(|| format!("expected NUMBER:PERMISSION, got {arg:?}"))?;
    Ok((number.trim().parse()?, permission.parse()?))
}

fn cmd_serve(config: SecurityConfig, args: &[String]) -> anyhow::Result<()> {
    let mut commands = CommandTable::new();
    for arg in args {
        let (command, permission) = parse_command_arg(arg)?;
        commands.register(command, format!("ECHO_{command}"), permission, Arc::new(EchoHandler));
    }

    tracing::info!("Starting SecMan daemon ({})", PROTOCOL_VERSION);
    tracing::info!("Commands: {}", args.join(", "));

    let daemon = Daemon::new(Arc::new(config), commands);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        daemon.bind().await?.serve().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_send(
    config: SecurityConfig,
    peer: String,
    command: u32,
    payload: &str,
    udp: bool,
    permission: &str,
    force_auth: bool,
) -> anyhow::Result<()> {
    let mut request = CommandRequest::new(peer.clone(), command).with_permission(permission.parse()?);
    if force_auth {
        request = request.forcing_authentication();
    }
    let initiator = CommandInitiator::new(Arc::new(config), Arc::new(SessionService::new()));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut errors = ErrorStack::new();
        if udp {
            let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
            let request = request.with_return_address(socket.local_addr()?.to_string());
            let mut datagram = match initiator.start_datagram(&request, &mut errors).await {
                Ok(datagram) => datagram,
                Err(e) => anyhow::bail!("{e} [{errors}]"),
            };
            datagram.push_data(payload.as_bytes());
            let session = datagram.session_id().map(String::from);
            let bytes = datagram.finish()?.to_bytes()?;
            socket.send_to(&bytes, peer.as_str()).await?;
            println!(
                "sent {} byte datagram (session {})",
                bytes.len(),
                session.as_deref().unwrap_or("none")
            );
            return Ok(());
        }

        let (mut channel, outcome) = match initiator.connect(&request, &mut errors).await {
            Ok(connected) => connected,
            Err(e) => anyhow::bail!("{e} [{errors}]"),
        };
        tracing::info!(
            session_id = outcome.session_id.as_deref().unwrap_or("-"),
            resumed = outcome.resumed,
            "command started"
        );
        channel.send(&WireMessage::data(payload.as_bytes())).await?;
        let reply = channel.recv().await?.into_data()?;
        println!("{}", String::from_utf8_lossy(&reply));
        channel.close().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_reconcile(initiator: &Path, acceptor: &Path, permission: &str) -> anyhow::Result<()> {
    let permission: Permission = permission.parse()?;
    let cipher = ChaChaCipher::new();
    let declared = |path: &Path| -> anyhow::Result<_> {
        let config = SecurityConfig::from_file(path)?;
        Ok(config.declared_policy(permission, PolicyRequest::default(), &cipher)?)
    };
    let theirs = declared(initiator)?;
    let ours = declared(acceptor)?;

    println!("initiator: {}", theirs.to_record());
    println!("acceptor:  {}", ours.to_record());
    match reconcile(&theirs, &ours) {
        Ok(decided) => println!("decided:   {}", decided.to_record()),
        Err(e) => println!("conflict:  {e}"),
    }
    Ok(())
}
