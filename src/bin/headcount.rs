//! headcount - Tour the camera presets once and count people at each.
//!
//! Loads the configuration, runs one tour, logs a per-preset summary and
//! exports annotated images plus count tables. Ctrl-C stops further visits;
//! frames already captured still finish detection.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use ptz_headcount::{export_run, BackendRegistry, CancelToken, HeadcountConfig, HeadcountRun};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Visit PTZ camera presets and count people at each"
)]
struct Args {
    /// Path to a JSON or TOML configuration file.
    #[arg(long, env = "HEADCOUNT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for exported runs (overrides the configuration).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate_only: bool,

    /// Skip writing images and tables.
    #[arg(long)]
    no_export: bool,

    /// List compiled-in detector backends and exit.
    #[arg(long)]
    list_backends: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = BackendRegistry::with_defaults();
    if args.list_backends {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config =
        HeadcountConfig::load_from(args.config.as_deref()).context("configuration rejected")?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    log::info!(
        "{} presets, camera {}:{}, detector '{}', {} workers",
        config.presets.len(),
        config.control.host,
        config.control.port,
        config.detector.backend,
        config.workers
    );
    if args.validate_only {
        log::info!("configuration is valid");
        return Ok(());
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received; finishing in-flight presets");
        handler_token.cancel();
    })
    .context("error setting Ctrl-C handler")?;

    let output_dir = config.output_dir.clone();
    let run = HeadcountRun::from_registry(config, &registry, cancel)?;
    let result = run.execute()?;

    for preset in &result.results {
        match preset.error.as_ref() {
            None => log::info!(
                "preset {:>3} {:<24} count {}",
                preset.preset.number,
                preset.preset.name,
                preset.count
            ),
            Some(err) => log::warn!(
                "preset {:>3} {:<24} {}",
                preset.preset.number,
                preset.preset.name,
                err
            ),
        }
    }
    log::info!(
        "total count {} ({} presets failed)",
        result.total_count(),
        result.failures().len()
    );

    if !args.no_export {
        let summary = export_run(&result, &output_dir)?;
        log::info!("results written to {}", summary.run_dir.display());
    }
    Ok(())
}
