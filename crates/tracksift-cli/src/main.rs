// SPDX-License-Identifier: GPL-3.0-or-later
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracksift_application::{IdentificationService, RunReport};
use tracksift_config::{load as load_config, TelemetryConfig};
use tracksift_domain::ProviderId;

/// Identify the tracks played in a long-form mix.
#[derive(Parser, Debug)]
#[command(name = "tracksift")]
#[command(version)]
struct Args {
    /// Audio file to identify
    input: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "TRACKSIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Providers to consult, in order, e.g. `acoustid,acrcloud`
    #[arg(short, long, value_delimiter = ',')]
    providers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.telemetry);

    let service = IdentificationService::from_config(&config)
        .await
        .context("failed to set up identification")?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let providers = provider_override(&args.providers);
    let report = service
        .identify_file(&args.input, providers.as_deref(), &cancel)
        .await
        .with_context(|| format!("failed to identify {}", args.input.display()))?;

    write_report(&report, args.output.as_deref())?;
    Ok(())
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    // stdout carries the report, logs go to stderr.
    if telemetry.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}

fn provider_override(names: &[String]) -> Option<Vec<ProviderId>> {
    let ids: Vec<ProviderId> = names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(ProviderId::from)
        .collect();
    (!ids.is_empty()).then_some(ids)
}

fn write_report(report: &RunReport, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(target: "cli", path = %path.display(), tracks = report.tracklist.len(), "report written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}").context("failed to write report")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {},
                    _ = terminate.recv() => {},
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(target: "cli", error = %err, "could not install signal handlers, run is not interruptible");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target: "cli", error = %err, "could not install ctrl-c handler, run is not interruptible");
            std::future::pending::<()>().await;
        }
    }

    info!(target: "cli", "shutdown signal received, cancelling run");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_is_required() {
        assert!(Args::try_parse_from(["tracksift"]).is_err());
    }

    #[test]
    fn providers_are_comma_separated() {
        let args = Args::try_parse_from([
            "tracksift",
            "set.mp3",
            "--providers",
            "acrcloud,acoustid",
            "-o",
            "report.json",
        ])
        .unwrap();

        assert_eq!(args.input, PathBuf::from("set.mp3"));
        assert_eq!(args.output, Some(PathBuf::from("report.json")));
        assert_eq!(
            provider_override(&args.providers),
            Some(vec![ProviderId::from("acrcloud"), ProviderId::from("acoustid")])
        );
    }

    #[test]
    fn no_providers_means_configured_order() {
        let args = Args::try_parse_from(["tracksift", "set.mp3"]).unwrap();
        assert_eq!(provider_override(&args.providers), None);
        assert_eq!(provider_override(&[" ".to_string()]), None);
    }

    #[cfg(unix)]
    #[test]
    fn unix_signal_kinds_available() {
        use tokio::signal::unix::SignalKind;
        let _ = SignalKind::interrupt();
        let _ = SignalKind::terminate();
    }
}
