//! BubbleBot daemon: arm motion, fan and smoke behind the HTTP command server.

use anyhow::{Context, Result};
use bubblebot::command_server::CommandServer;
use bubblebot::config_loader::{config_path, load_host_settings};
use bubblebot::machine::build_machine;
use clap::Parser;
use gethostname::gethostname;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to bubblebot.yaml (defaults to BUBBLEBOT_CONFIG, then the crate directory)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Host block to load instead of this machine's hostname
    #[arg(long)]
    host: Option<String>,
    /// Override SERVER_PORT
    #[arg(long)]
    port: Option<u16>,
    /// Use simulated step outputs and log-only actuators
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let hostname = args
        .host
        .clone()
        .unwrap_or_else(|| gethostname().to_string_lossy().to_string());
    let path = config_path(args.config.as_deref());
    let settings = load_host_settings(&path, &hostname)?;

    let arm = build_machine(&settings, &path, args.simulate)?;
    let port = args.port.unwrap_or(settings.server_port);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("Could not bind command server to port {}", port))?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })
        .context("Could not install ctrl-c handler")?;
    }

    log::info!(target: "bubblebot", "BubbleBot ready on port {} as '{}'", port, hostname);
    let server = Arc::new(CommandServer::new(Arc::clone(&arm)));
    let served = server.serve(listener, running);

    log::info!(target: "bubblebot", "Shutting down");
    arm.shutdown();
    served
}
