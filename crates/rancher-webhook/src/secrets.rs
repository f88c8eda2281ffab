//! Watches the secrets in the webhook namespace and routes their changes.
//!
//! Changes of the serving certificate secret are loaded into the [`CertificateResolver`].
//! Changes of the CA secret replace the latest event seen by the webhook configuration
//! reconciler, everything else is ignored. Routing never waits on the reconciler.
use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use tokio::sync::watch;

use crate::{
    constants::{CA_SECRET_NAME, SERVING_SECRET_NAME},
    reconciler::SecretEvent,
    tls::CertificateResolver,
};

#[derive(Debug)]
pub struct SecretRouter {
    cert_resolver: Arc<CertificateResolver>,
    events_tx: watch::Sender<Option<SecretEvent>>,
    namespace: String,
}

impl SecretRouter {
    pub fn new(
        cert_resolver: Arc<CertificateResolver>,
        events_tx: watch::Sender<Option<SecretEvent>>,
        namespace: String,
    ) -> Self {
        Self {
            cert_resolver,
            events_tx,
            namespace,
        }
    }

    /// Watches the secrets in the webhook namespace until the process shuts down. Watch errors
    /// are retried with a backoff.
    pub async fn watch(self, client: Client) {
        let api: Api<Secret> = Api::namespaced(client, &self.namespace);
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        tracing::info!(k8s.namespace = %self.namespace, "watching secrets");

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.route(event),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to watch secrets"
                    );
                }
            }
        }
    }

    /// Routes a single watch event.
    pub fn route(&self, event: watcher::Event<Secret>) {
        match event {
            watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
                if secret.name_any() == SERVING_SECRET_NAME {
                    if let Err(err) = self.cert_resolver.load_from_secret(&secret) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "failed to load serving certificate, keeping the current one"
                        );
                    }
                    return;
                }

                if self.is_ca_secret(&secret) {
                    self.forward(SecretEvent::Applied(secret));
                }
            }
            watcher::Event::Delete(secret) => {
                if secret.name_any() == SERVING_SECRET_NAME {
                    tracing::warn!("serving certificate secret was deleted, keeping the current one");
                    return;
                }

                if self.is_ca_secret(&secret) {
                    self.forward(SecretEvent::Deleted(secret));
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    fn is_ca_secret(&self, secret: &Secret) -> bool {
        secret.metadata.name.as_deref() == Some(CA_SECRET_NAME)
            && secret.metadata.namespace.as_deref() == Some(self.namespace.as_str())
    }

    fn forward(&self, event: SecretEvent) {
        // Replaces an event the reconciler hasn't picked up yet.
        self.events_tx.send_replace(Some(event));
        if self.events_tx.is_closed() {
            tracing::trace!("webhook configuration reconciler is not running, dropping event");
        }
    }
}
