//! An admission webhook for Rancher managed resources.
//!
//! The webhook serves validating and mutating admission reviews over HTTPS. Every request is
//! routed to the handler registered for the requested resource and operation, see
//! [`admission::registry::HandlerRegistry`]. Alongside the server, the webhook keeps its own
//! `ValidatingWebhookConfiguration` and `MutatingWebhookConfiguration` in sync with the CA
//! bundle published in the `cattle-webhook-ca` secret.
//!
//! Most users only need [`run`], which wires all parts together:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rancher_webhook::WebhookOptions;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = kube::Client::try_default().await.unwrap();
//! let options = Arc::new(WebhookOptions::default());
//!
//! rancher_webhook::run(options, client).await.unwrap();
//! # }
//! ```
use std::sync::Arc;

use axum::{Router, routing::get};
use futures_util::{FutureExt as _, pin_mut, select};
use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    access::SubjectAccessReviewClient,
    admission::{Dispatcher, registry::HandlerRegistry},
    reconciler::{KubeWebhookConfigurationApi, WebhookConfigurationReconciler},
    secrets::SecretRouter,
    tls::{CertificateResolver, TlsServer},
};

pub mod access;
pub mod admission;
pub mod cli;
pub mod codec;
pub mod constants;
pub mod options;
pub mod reconciler;
pub mod resources;
pub mod secrets;
pub mod telemetry;
pub mod tls;
pub mod webhook_config;

// Selected re-exports
pub use crate::options::WebhookOptions;

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to create {signal} signal handler"))]
    CreateSignalHandler {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// The HTTPS server answering admission reviews.
///
/// This server abstracts away lower-level details like TLS termination and request tracing.
/// The admission routes are provided as an Axum [`Router`], see [`admission::router`].
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Creates a new webhook server listening on the socket address of the `options`.
    ///
    /// To start the server, use the [`WebhookServer::run()`] function. This will run the server
    /// using the Tokio runtime until it is terminated.
    pub fn new(
        router: Router,
        options: &WebhookOptions,
        cert_resolver: Arc<CertificateResolver>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        tracing::trace!("create new webhook server");

        // Use a service builder to provide multiple layers at once. Recommended
        // by the Axum project.
        //
        // See https://docs.rs/axum/latest/axum/middleware/index.html#applying-multiple-middleware
        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());

        let router = router
            .layer(service_builder)
            // The health route is below the TraceLayer so as not to be instrumented
            .route("/health", get(|| async { "ok" }));

        tracing::debug!("create TLS server");
        let tls_server = TlsServer::new(options.socket_addr, router, cert_resolver, provider)
            .context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Runs the webhook server and sets up signal handlers for shutting down.
    ///
    /// This does not implement graceful shutdown of the underlying server.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .context(CreateSignalHandlerSnafu { signal: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(CreateSignalHandlerSnafu { signal: "SIGTERM" })?;

        tracing::debug!("created unix signal handlers");

        let future_server = self.tls_server.run().fuse();
        let future_sigint = sigint.recv().fuse();
        let future_sigterm = sigterm.recv().fuse();

        // select requires Future + Unpin
        pin_mut!(future_server, future_sigint, future_sigterm);

        select! {
            result = future_server => result.context(RunTlsServerSnafu)?,
            _ = future_sigint => tracing::info!("received SIGINT, shutting down"),
            _ = future_sigterm => tracing::info!("received SIGTERM, shutting down"),
        };

        Ok(())
    }
}

/// Runs the whole webhook: the HTTPS server, the secret watch and the webhook configuration
/// reconciler. Returns once the server stopped, usually because of a shutdown signal.
pub async fn run(options: Arc<WebhookOptions>, client: Client) -> Result<()> {
    let provider = Arc::new(tls::crypto_provider());
    let cert_resolver = Arc::new(CertificateResolver::new(
        provider.clone(),
        options.certificate_expiration_days,
    ));

    let access = Arc::new(SubjectAccessReviewClient::new(client.clone()));
    let registry = Arc::new(HandlerRegistry::new(&options, access));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), &options));

    let server = WebhookServer::new(
        admission::router(dispatcher),
        &options,
        cert_resolver.clone(),
        provider,
    )?;

    let (events_tx, events_rx) = watch::channel(None);
    let reconciler = WebhookConfigurationReconciler::new(
        Arc::new(KubeWebhookConfigurationApi::new(client.clone())),
        registry,
        options.clone(),
        events_rx,
    );
    let secret_router = SecretRouter::new(cert_resolver, events_tx, options.namespace.clone());

    tracing::info!(
        multi_cluster_management = options.multi_cluster_management,
        k8s.namespace = %options.namespace,
        "starting webhook"
    );

    // The watch never ends on its own, so the server decides when the process stops.
    let background = futures_util::future::join(
        reconciler.run(),
        secret_router.watch(client),
    );

    tokio::select! {
        result = server.run() => result,
        _ = background => Ok(()),
    }
}
