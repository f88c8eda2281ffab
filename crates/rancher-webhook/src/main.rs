use std::sync::Arc;

use clap::Parser;
use rancher_webhook::{WebhookOptions, cli::Cli, telemetry};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize console logging"))]
    InitTelemetry { source: telemetry::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to run webhook"))]
    RunWebhook { source: rancher_webhook::WebhookError },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    telemetry::init(&cli.telemetry).context(InitTelemetrySnafu)?;

    let options = Arc::new(WebhookOptions::from(cli.run));
    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;

    rancher_webhook::run(options, client)
        .await
        .context(RunWebhookSnafu)
}
