//! Initialises the global `tracing` subscriber used for console log output.
//!
//! The filter directives are read from the `CONSOLE_LOG` environment variable and fall back to
//! the `INFO` level.
use clap::{Args, ValueEnum};
use snafu::{ResultExt, Snafu};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

/// The environment variable which can be used to set the filter directives of the console log.
pub const CONSOLE_LOG_ENV_VAR: &str = "CONSOLE_LOG";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Telemetry Options")]
pub struct TelemetryOptions {
    /// Disable console log output.
    #[arg(long, env)]
    pub console_log_disabled: bool,

    /// The format of the console log output.
    #[arg(long, env, value_enum, default_value_t = Format::Plain)]
    pub console_log_format: Format,
}

/// Console log event output formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    /// Use the plain unstructured log output.
    #[default]
    Plain,

    /// One JSON object per log event, useful for log aggregation.
    Json,
}

/// Builds the console layer and installs it as the global default subscriber.
///
/// This must be called at most once per process.
pub fn init(options: &TelemetryOptions) -> Result<(), Error> {
    let console_layer = (!options.console_log_disabled).then(|| {
        let env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(CONSOLE_LOG_ENV_VAR)
            .from_env_lossy();

        match options.console_log_format {
            Format::Plain => tracing_subscriber::fmt::layer()
                .with_filter(env_filter)
                .boxed(),
            Format::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_filter(env_filter)
                .boxed(),
        }
    });

    let subscriber = Registry::default().with(console_layer);
    tracing::subscriber::set_global_default(subscriber).context(SetGlobalDefaultSubscriberSnafu)?;

    tracing::debug!(
        console_log_format = %options.console_log_format,
        "initialized console log subscriber"
    );

    Ok(())
}
