use std::path::PathBuf;
use std::sync::Arc;

use qrscan_common::config::{Config, OutputConfig};
use qrscan_common::frame::Resolution;
use qrscan_common::symbol::DecodedSymbol;
use qrscan_scanner::session::FailureReason;
use qrscan_scanner::{
    FrameSource, MjpegSource, QrDecoder, ReplaySource, ScanError, ScanSession, ScanSettings,
    SessionEvent, SourceError,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("scan session failed: {0}")]
    Failed(FailureReason),
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("unknown source mode '{0}'")]
    UnknownMode(String),
    #[error("unknown output format '{0}'")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl TryFrom<&OutputConfig> for OutputFormat {
    type Error = CliError;

    // `Config::validate` already limits the format to these two.
    fn try_from(config: &OutputConfig) -> Result<Self, Self::Error> {
        match config.format.as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        mode = config.source.mode,
        fps = config.source.fps,
        cooldown_ms = config.scan.cooldown_ms,
        "starting qrscan"
    );

    if let Err(e) = run(&config).await {
        error!(error = %e, "qrscan exited with error");
        std::process::exit(1);
    }
}

async fn run(config: &Config) -> Result<(), CliError> {
    let settings = ScanSettings::from_config(config);
    let format = OutputFormat::try_from(&config.output)?;

    match config.source.mode.as_str() {
        "replay" => {
            let mut source = ReplaySource::from_images(&config.source.images)?
                .looping(config.source.loop_frames);
            if let (Some(width), Some(height)) = (config.source.width, config.source.height) {
                source.set_resolution(Some(Resolution { width, height }));
            }
            scan(source, settings, format).await
        }
        "mjpeg" => scan(MjpegSource::from_config(&config.source), settings, format).await,
        other => Err(CliError::UnknownMode(other.to_string())),
    }
}

async fn scan<S: FrameSource>(
    source: S,
    settings: ScanSettings,
    format: OutputFormat,
) -> Result<(), CliError> {
    let session = ScanSession::new(source, Arc::new(QrDecoder::new()), settings);
    let mut events = session.subscribe();
    session.start().await?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Symbol(symbol)) => {
                    if let Err(e) = print_symbol(&symbol, format) {
                        break Err(e);
                    }
                }
                Ok(SessionEvent::Failed(reason)) => break Err(CliError::Failed(reason)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind, symbols dropped");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    if let Some(stats) = session.stats().await {
        info!(
            submitted = stats.submitted,
            dropped = stats.dropped,
            decoded = stats.decoded,
            failed = stats.failed,
            "scan totals"
        );
    }
    session.stop().await;
    outcome
}

fn print_symbol(symbol: &DecodedSymbol, format: OutputFormat) -> Result<(), CliError> {
    match format {
        OutputFormat::Text => println!(
            "{}\t{}\t{}",
            symbol.detected_at().to_rfc3339(),
            symbol.format,
            symbol.text
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string(symbol)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(format: &str) -> OutputConfig {
        OutputConfig {
            format: format.to_string(),
        }
    }

    #[test]
    fn output_format_matches_config() {
        assert_eq!(
            OutputFormat::try_from(&output("text")).unwrap(),
            OutputFormat::Text
        );
        assert_eq!(
            OutputFormat::try_from(&output("json")).unwrap(),
            OutputFormat::Json
        );
    }

    #[test]
    fn unknown_output_format_is_an_error() {
        assert!(matches!(
            OutputFormat::try_from(&output("yaml")),
            Err(CliError::UnknownFormat(f)) if f == "yaml"
        ));
    }
}
