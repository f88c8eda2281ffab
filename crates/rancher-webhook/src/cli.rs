//! This module contains the command line interface of the webhook using the `clap` crate.
//!
//! Every argument can also be provided as an environment variable, which is the usual way to
//! configure the webhook when running on Kubernetes.
use std::{net::IpAddr, time::Duration};

use clap::{Args, Parser};

use crate::{
    constants::{DEFAULT_LISTEN_ADDRESS, MINIMUM_SETTLE_DELAY},
    options::WebhookOptions,
    telemetry::TelemetryOptions,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "rancher-webhook",
    author,
    version,
    about = "Admission webhook for Rancher managed resources"
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArguments,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// The IP address the HTTPS listener binds to.
    #[arg(long, env, default_value_t = DEFAULT_LISTEN_ADDRESS)]
    pub bind_address: IpAddr,

    /// The port the HTTPS listener binds to.
    #[arg(long, env, default_value_t = crate::constants::DEFAULT_HTTPS_PORT)]
    pub https_port: u16,

    /// Enables the handlers and webhook rules only required with multi-cluster management.
    #[arg(long, env)]
    pub multi_cluster_management: bool,

    /// How long to wait after a new CA bundle has been observed before the webhook
    /// configurations are applied. Must be at least 5 seconds.
    #[arg(long, env, default_value = "15s", value_parser = parse_settle_delay)]
    pub settle_delay: Duration,

    /// Admission decisions taking longer than this are logged.
    #[arg(long, env, default_value = "2s", value_parser = parse_duration)]
    pub slow_admission_threshold: Duration,

    /// The deadline of an admission call when the API server doesn't send one.
    #[arg(long, env, default_value = "10s", value_parser = parse_duration)]
    pub default_admission_timeout: Duration,

    /// The lifetime in days of the self-signed serving certificate.
    ///
    /// This is the lifetime the certificate issuer is expected to use, a warning is logged if
    /// the loaded serving certificate is valid for a shorter period.
    #[arg(
        long,
        env = "CATTLE_NEW_SIGNED_CERT_EXPIRATION_DAYS",
        default_value_t = crate::constants::DEFAULT_CERTIFICATE_EXPIRATION_DAYS
    )]
    pub certificate_expiration_days: u32,

    /// Don't maintain the ValidatingWebhookConfiguration and MutatingWebhookConfiguration.
    ///
    /// WARNING: If you disable the maintenance you are responsible for keeping the CA bundle
    /// of the webhook configurations up to date.
    #[arg(long, env)]
    pub disable_webhook_configuration_maintenance: bool,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub environment: EnvironmentOptions,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Environment Options")]
pub struct EnvironmentOptions {
    /// The namespace the webhook is running in, usually `cattle-system`.
    ///
    /// Note that when running the webhook on Kubernetes we recommend to use the
    /// [downward API](https://kubernetes.io/docs/concepts/workloads/pods/downward-api/)
    /// to let Kubernetes project the namespace as the `NAMESPACE` env variable.
    #[arg(long, env, default_value = crate::constants::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// The name of the service the webhook is reachable at.
    #[arg(long, env, default_value = crate::constants::DEFAULT_SERVICE_NAME)]
    pub service_name: String,
}

impl From<RunArguments> for WebhookOptions {
    fn from(run: RunArguments) -> Self {
        Self::builder()
            .bind_address(run.bind_address, run.https_port)
            .namespace(run.environment.namespace)
            .service_name(run.environment.service_name)
            .multi_cluster_management(run.multi_cluster_management)
            .settle_delay(run.settle_delay)
            .slow_admission_threshold(run.slow_admission_threshold)
            .admission_timeout(run.default_admission_timeout)
            .certificate_expiration_days(run.certificate_expiration_days)
            .disable_webhook_configuration_maintenance(
                run.disable_webhook_configuration_maintenance,
            )
            .build()
    }
}

fn parse_duration(input: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(input)
}

fn parse_settle_delay(input: &str) -> Result<Duration, String> {
    let delay = parse_duration(input).map_err(|err| err.to_string())?;

    if delay < MINIMUM_SETTLE_DELAY {
        return Err(format!(
            "settle delay must be at least {}",
            humantime::format_duration(MINIMUM_SETTLE_DELAY)
        ));
    }

    Ok(delay)
}
