//! Process-wide tracing setup.
//!
//! Events from relay lanes and transcoder invocations run inside spans
//! (`relay_lane{directory}`, `transcode{kind}`, `stream_controller`); both
//! output formats include the span context so lines can be told apart per
//! quality directory. Forwarded ffmpeg stderr uses the `ffmpeg` target and
//! has its own level.

use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Target used for lines forwarded from the transcoder's stderr
pub const FFMPEG_TARGET: &str = "ffmpeg";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_override = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config, env_override.as_deref())?;
    let writer = config.file_path.as_deref().map(open_log_file).transpose()?;

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true);

        match writer {
            Some(file) => registry.with(json_layer.with_writer(file)).try_init()?,
            None => registry.with(json_layer).try_init()?,
        }
    } else {
        let compact_layer = fmt::layer().compact().with_target(true).with_line_number(false);

        match writer {
            Some(file) => registry
                .with(compact_layer.with_ansi(false).with_writer(file))
                .try_init()?,
            None => registry.with(compact_layer).try_init()?,
        }
    }

    Ok(())
}

/// Filter from config, unless `RUST_LOG` (passed as `env_override`) is set.
///
/// The ffmpeg directive is appended to the configured level, so
/// `level = "debug"` does not also flood the log with encoder chatter.
/// Configured levels are checked even when the override wins.
fn build_filter(config: &LoggingConfig, env_override: Option<&str>) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(&config.level)?;
    let ffmpeg_level = match config.ffmpeg_level.to_lowercase().as_str() {
        "off" => "off".to_string(),
        other => parse_log_level(other)?.to_string().to_lowercase(),
    };

    if let Some(directives) = env_override.filter(|d| !d.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }

    let directives = format!(
        "{},{FFMPEG_TARGET}={ffmpeg_level}",
        level.to_string().to_lowercase()
    );
    Ok(EnvFilter::try_new(directives)?)
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str, ffmpeg_level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            ffmpeg_level: ffmpeg_level.to_string(),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_filter_adds_ffmpeg_directive() {
        let filter = build_filter(&config("DEBUG", "warning"), None).unwrap();
        let rendered = filter.to_string().to_lowercase();
        assert!(rendered.contains("ffmpeg=warn"));
        assert!(rendered.contains("debug"));

        let silenced = build_filter(&config("info", "off"), None).unwrap();
        assert!(silenced.to_string().to_lowercase().contains("ffmpeg=off"));
    }

    #[test]
    fn test_env_override_wins() {
        let filter = build_filter(&config("info", "warn"), Some("livecast_stream=trace")).unwrap();
        let rendered = filter.to_string().to_lowercase();
        assert!(rendered.contains("livecast_stream=trace"));
        assert!(!rendered.contains("ffmpeg"));

        // Blank RUST_LOG falls back to the configured levels
        let filter = build_filter(&config("info", "warn"), Some("  ")).unwrap();
        assert!(filter.to_string().to_lowercase().contains("ffmpeg=warn"));
    }

    #[test]
    fn test_bad_levels_rejected() {
        assert!(build_filter(&config("loud", "warn"), None).is_err());
        assert!(build_filter(&config("info", "chatty"), None).is_err());
        assert!(init_logging(&config("loud", "warn")).is_err());
    }
}
