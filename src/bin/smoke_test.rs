//! Hold a DMX level on the smoke machine for a while, then switch it off.
//!
//! Reads the DMX port and channel from bubblebot.yaml unless given on the
//! command line.

use anyhow::{anyhow, Result};
use bubblebot::actuators::{LoggingSmoke, SmokeController, SmokeDriver};
use bubblebot::config_loader::{config_path, load_host_settings, SmokeSettings};
use bubblebot::dmx::DmxSmoke;
use clap::Parser;
use gethostname::gethostname;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DMX level 0-255
    #[arg(long, default_value_t = 120)]
    level: u8,
    /// Seconds to hold the level
    #[arg(long, default_value_t = 10.0)]
    seconds: f64,
    /// Serial device of the DMX interface
    #[arg(long)]
    port: Option<String>,
    /// DMX channel (1-based)
    #[arg(long)]
    channel: Option<u16>,
    #[arg(long)]
    baud: Option<u32>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log frames instead of opening the port
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Config is optional when everything is given on the command line
    let hostname = gethostname().to_string_lossy().to_string();
    let from_config = load_host_settings(&config_path(args.config.as_deref()), &hostname)
        .map(|s| s.smoke)
        .unwrap_or_else(|e| {
            log::warn!(target: "smoke_test", "{:#}; using command line values only", e);
            SmokeSettings::default()
        });

    if !args.seconds.is_finite() || args.seconds < 0.0 {
        return Err(anyhow!("--seconds must be a non-negative number"));
    }
    let channel = args.channel.unwrap_or(from_config.dmx_channel);
    let baud = args.baud.unwrap_or(from_config.baud);
    let driver: Box<dyn SmokeDriver> = if args.dry_run {
        Box::new(LoggingSmoke::new())
    } else {
        let port = args
            .port
            .or(from_config.dmx_port)
            .ok_or_else(|| anyhow!("No DMX port: pass --port or set SMOKE.DMX_PORT"))?;
        Box::new(DmxSmoke::open(&port, baud, channel)?)
    };

    let hold = Duration::from_secs_f64(args.seconds);
    println!("Holding DMX channel {} at {} for {:.1}s", channel, args.level, hold.as_secs_f64());

    let smoke = SmokeController::new(driver);
    smoke.pulse(args.level, hold)?;
    if !smoke.wait(hold + Duration::from_secs(5)) {
        smoke.stop();
    }
    println!("Done. Smoke channel back at 0.");
    Ok(())
}
