// imbus Linux daemon: hotkey screening service, liveness probe, key test client.

mod config;
mod service;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imbus_core::handshake::{self, HandshakeOptions, DEFAULT_CONNECT_ATTEMPTS};
use imbus_core::server::{self, SharedHandler};
use imbus_core::{cmd, ClientRole, EventMultiplexer, KeyEvent, SocketAddress, SocketStream, Transaction};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::service::{command, reply_status, HotkeyService};

#[derive(Parser)]
#[command(name = "imbus", version, about = "Input-method bus daemon")]
struct Cli {
    /// Config file (default: first of $XDG_CONFIG_HOME, ~/.config, /etc)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Socket address, e.g. local:/run/user/1000/imbus/socket or inet:127.0.0.1:7077
    #[arg(long, global = true)]
    address: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the hotkey service (default)
    Run,
    /// Check that a server answers handshakes
    Probe,
    /// Push key strings through a fresh input context and print what matched
    SendKey {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(a) = cli.address {
        cfg.address = a;
    }
    init_logging(&cfg.log_level);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cfg, cli.config.as_deref()),
        Command::Probe => probe(&cfg),
        Command::SendKey { keys } => send_keys(&cfg, &keys),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cfg: &Config, explicit: Option<&Path>) -> Result<()> {
    let address = cfg.socket_address()?;
    let mut mux = EventMultiplexer::new().context("creating event loop")?;
    mux.stop_on_signals(&[libc::SIGINT, libc::SIGTERM])
        .context("installing signal handlers")?;

    let reload_path = config::resolve_path(explicit);
    let reload = move || -> Result<service::Bindings> {
        let fresh = match &reload_path {
            Some(p) => config::load(Some(p.as_path()))?,
            None => Config::default(),
        };
        Ok(fresh.bindings())
    };
    let service = HotkeyService::new(cfg.bindings()).with_reloader(Box::new(reload));
    let handler: SharedHandler = Rc::new(RefCell::new(service));

    let (_, bound) = server::listen(
        &mut mux,
        &address,
        cfg.accepted_roles.clone(),
        cfg.handshake_options(),
        handler,
    )
    .with_context(|| format!("listening on {address}"))?;
    info!(address = %bound, version = env!("CARGO_PKG_VERSION"), "imbus running");
    mux.run();
    Ok(())
}

fn probe(cfg: &Config) -> Result<()> {
    let address = cfg.socket_address()?;
    handshake::probe(&address, &cfg.handshake_options())
        .with_context(|| format!("no server at {address}"))?;
    println!("{address}: alive");
    Ok(())
}

struct KeyClient {
    stream: SocketStream,
    session: handshake::Session,
    opts: HandshakeOptions,
}

impl KeyClient {
    fn connect(address: &SocketAddress, opts: HandshakeOptions) -> Result<Self> {
        let (stream, session) =
            handshake::connect_with_retry(address, ClientRole::FrontEnd, &opts, DEFAULT_CONNECT_ATTEMPTS)
                .with_context(|| format!("connecting to {address}"))?;
        Ok(Self {
            stream,
            session,
            opts,
        })
    }

    fn call(&mut self, build: impl FnOnce(&mut Transaction)) -> Result<Transaction> {
        let mut req = self.session.request();
        build(&mut req);
        Ok(server::call(&mut self.stream, &req, &self.opts)?)
    }

    fn close(mut self) -> Result<()> {
        let mut req = self.session.request();
        req.put_command(cmd::CLOSE_CONNECTION);
        req.write_to(&mut self.stream, self.opts.signature)?;
        Ok(())
    }
}

fn send_keys(cfg: &Config, keys: &[String]) -> Result<()> {
    let events = keys
        .iter()
        .map(|k| k.parse::<KeyEvent>().with_context(|| format!("bad key {k:?}")))
        .collect::<Result<Vec<_>>>()?;
    let mut client = KeyClient::connect(&cfg.socket_address()?, cfg.handshake_options())?;

    let mut reply = client.call(|t| t.put_command(command::REGISTER_INPUT_CONTEXT))?;
    if !reply_status(&mut reply)? {
        bail!("input context refused");
    }
    let ic = reply.get_uint32()?;

    for ev in &events {
        let mut reply = client.call(|t| {
            t.put_command(command::PROCESS_KEY_EVENT);
            t.put_uint32(ic);
            t.put_key_event(ev);
        })?;
        let action = if reply_status(&mut reply)? {
            reply.get_string()?
        } else {
            "-".to_string()
        };
        println!("{ev}\t{action}");
    }

    let mut reply = client.call(|t| {
        t.put_command(command::DEREGISTER_INPUT_CONTEXT);
        t.put_uint32(ic);
    })?;
    if !reply_status(&mut reply)? {
        bail!("input context {ic} already gone");
    }
    client.close()
}
