//! backend-datalink — telemetry-and-control gateway CLI entry point.
//!
//! See the `backend_datalink` library for the core functionality.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use backend_datalink::config::GatewayConfig;
use backend_datalink::gateway::Gateway;
use clap::Parser;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook
/// compatibility).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// `backend-datalink -pkg_config <path>` (spec §6 CLI surface).
#[derive(Parser)]
#[command(name = "backend-datalink", version, about = "Telemetry-and-control gateway")]
struct Cli {
    /// Path to the gateway's JSON configuration document.
    #[arg(long = "pkg_config")]
    pkg_config: std::path::PathBuf,
}

/// The CLI surface is specified with single-dash long options
/// (`-pkg_config <path>`, a launcher convention predating GNU-style
/// double-dash long options); `clap` only recognizes `--pkg_config`
/// natively, so a lone leading `-` in front of a multi-character flag
/// (other than `-h`, already a valid short option) is widened to `--`
/// before parsing.
fn normalize_single_dash_long_opts(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| {
        if arg.starts_with('-') && !arg.starts_with("--") && arg.len() > 2 {
            format!("-{arg}")
        } else {
            arg
        }
    })
    .collect()
}

fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse_from(normalize_single_dash_long_opts(std::env::args()));
    let config = GatewayConfig::load(&cli.pkg_config)
        .with_context(|| format!("failed to load config from {}", cli.pkg_config.display()))?;

    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the Tokio runtime")?;
    let handle = rt.handle().clone();

    let gateway = Arc::new(Gateway::build(config, handle)?);
    gateway.register_demo_methods();
    gateway.start()?;
    log::info!("backend-datalink: gateway started");

    rt.block_on(async {
        loop {
            if SHUTDOWN_FLAG.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    });

    log::info!("backend-datalink: shutdown signal received, draining");
    gateway.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("backend-datalink: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn widens_a_single_dash_long_option_to_double_dash() {
        let out = normalize_single_dash_long_opts(
            args(&["backend-datalink", "-pkg_config", "cfg.json"]).into_iter(),
        );
        assert_eq!(out, args(&["backend-datalink", "--pkg_config", "cfg.json"]));
    }

    #[test]
    fn leaves_short_help_flag_alone() {
        let out =
            normalize_single_dash_long_opts(args(&["backend-datalink", "-h"]).into_iter());
        assert_eq!(out, args(&["backend-datalink", "-h"]));
    }

    #[test]
    fn leaves_already_double_dash_flags_alone() {
        let out = normalize_single_dash_long_opts(args(&["backend-datalink", "--help"]).into_iter());
        assert_eq!(out, args(&["backend-datalink", "--help"]));
    }

    #[test]
    fn parses_the_pkg_config_flag_via_the_normalized_form() {
        let cli = Cli::parse_from(normalize_single_dash_long_opts(
            args(&["backend-datalink", "-pkg_config", "cfg.json"]).into_iter(),
        ));
        assert_eq!(cli.pkg_config, std::path::PathBuf::from("cfg.json"));
    }
}
