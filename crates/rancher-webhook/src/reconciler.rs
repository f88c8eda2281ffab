//! Keeps the webhook configurations registered with the API server in sync with the CA secret.
//!
//! The reconciler follows the latest [`SecretEvent`] of the CA secret through a `watch` channel,
//! so the secret watch never waits on a slow apply. A new CA bundle is only applied after the
//! settle delay passed without a newer bundle arriving, giving the informer caches time to
//! prime before the API server starts sending admission requests. A failed apply or removal is
//! redelivered after another settle delay.
use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{
    admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
    core::v1::Secret,
};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

use crate::{
    admission::registry::HandlerRegistry,
    constants::{CA_SECRET_NAME, FIELD_MANAGER, TLS_CERT_KEY, WEBHOOK_CONFIGURATION_NAME},
    options::WebhookOptions,
    webhook_config::{ConfigurationOwner, WebhookConfigurations},
};

#[derive(Debug, Snafu)]
pub enum ReconcileError {
    #[snafu(display("failed to apply ValidatingWebhookConfiguration {name:?}"))]
    ApplyValidatingWebhookConfiguration { source: kube::Error, name: String },

    #[snafu(display("failed to apply MutatingWebhookConfiguration {name:?}"))]
    ApplyMutatingWebhookConfiguration { source: kube::Error, name: String },

    #[snafu(display("failed to delete ValidatingWebhookConfiguration {name:?}"))]
    DeleteValidatingWebhookConfiguration { source: kube::Error, name: String },

    #[snafu(display("failed to delete MutatingWebhookConfiguration {name:?}"))]
    DeleteMutatingWebhookConfiguration { source: kube::Error, name: String },
}

/// A change of a secret in the webhook namespace.
#[derive(Clone, Debug)]
pub enum SecretEvent {
    Applied(Secret),
    Deleted(Secret),
}

/// Where the reconciler is in registering the webhook configurations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    /// No CA bundle was observed yet, or the CA secret was deleted.
    Unregistered,

    /// A CA bundle was observed and is applied once `deadline` passed.
    Settling {
        ca_bundle: Vec<u8>,
        owner: ConfigurationOwner,
        deadline: Instant,
    },

    /// The configurations trusting `ca_bundle` were applied.
    Registered { ca_bundle: Vec<u8> },

    /// The CA secret was deleted but removing the configurations failed. Retried once
    /// `deadline` passed.
    Removing { deadline: Instant },
}

impl RegistrationState {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Settling { deadline, .. } | Self::Removing { deadline } => Some(*deadline),
            Self::Unregistered | Self::Registered { .. } => None,
        }
    }
}

/// Writes webhook configurations to the API server.
//
// We still need to use the async-trait crate, as dynamic dispatch in combination with async
// functions is not supported.
#[async_trait]
pub trait WebhookConfigurationApi: Debug + Send + Sync {
    /// Applies both configurations, overwriting fields owned by other managers.
    async fn apply(&self, configurations: &WebhookConfigurations) -> Result<(), ReconcileError>;

    /// Deletes both configurations named `name`, missing ones are skipped.
    async fn delete(&self, name: &str) -> Result<(), ReconcileError>;
}

/// Applies webhook configurations using server-side apply.
#[derive(Clone)]
pub struct KubeWebhookConfigurationApi {
    client: Client,
}

impl Debug for KubeWebhookConfigurationApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWebhookConfigurationApi")
            .finish_non_exhaustive()
    }
}

impl KubeWebhookConfigurationApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookConfigurationApi for KubeWebhookConfigurationApi {
    async fn apply(&self, configurations: &WebhookConfigurations) -> Result<(), ReconcileError> {
        let patch_params = PatchParams::apply(FIELD_MANAGER).force();

        let vwc_api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        let vwc_name = configurations.validating.name_any();
        vwc_api
            .patch(
                &vwc_name,
                &patch_params,
                &Patch::Apply(&configurations.validating),
            )
            .await
            .with_context(|_| ApplyValidatingWebhookConfigurationSnafu { name: vwc_name.clone() })?;

        let mwc_api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let mwc_name = configurations.mutating.name_any();
        mwc_api
            .patch(
                &mwc_name,
                &patch_params,
                &Patch::Apply(&configurations.mutating),
            )
            .await
            .with_context(|_| ApplyMutatingWebhookConfigurationSnafu { name: mwc_name.clone() })?;

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ReconcileError> {
        let vwc_api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        let existing = vwc_api
            .get_opt(name)
            .await
            .context(DeleteValidatingWebhookConfigurationSnafu { name })?;
        if existing.is_some() {
            vwc_api
                .delete(name, &DeleteParams::default())
                .await
                .context(DeleteValidatingWebhookConfigurationSnafu { name })?;
        }

        let mwc_api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let existing = mwc_api
            .get_opt(name)
            .await
            .context(DeleteMutatingWebhookConfigurationSnafu { name })?;
        if existing.is_some() {
            mwc_api
                .delete(name, &DeleteParams::default())
                .await
                .context(DeleteMutatingWebhookConfigurationSnafu { name })?;
        }

        Ok(())
    }
}

/// Maintains the `ValidatingWebhookConfiguration` and `MutatingWebhookConfiguration`.
pub struct WebhookConfigurationReconciler {
    api: Arc<dyn WebhookConfigurationApi>,
    registry: Arc<HandlerRegistry>,
    options: Arc<WebhookOptions>,

    events: watch::Receiver<Option<SecretEvent>>,
    state: RegistrationState,
}

impl WebhookConfigurationReconciler {
    pub fn new(
        api: Arc<dyn WebhookConfigurationApi>,
        registry: Arc<HandlerRegistry>,
        options: Arc<WebhookOptions>,
        events: watch::Receiver<Option<SecretEvent>>,
    ) -> Self {
        Self {
            api,
            registry,
            options,
            events,
            state: RegistrationState::Unregistered,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    /// Runs the reconciler until the sending half of the event channel is dropped. Events
    /// published while an apply is in flight are coalesced, only the latest one is handled.
    ///
    /// If the maintenance is disabled, this immediately returns without doing any work.
    pub async fn run(mut self) {
        if self.options.disable_webhook_configuration_maintenance {
            tracing::info!("webhook configuration maintenance is disabled");
            return;
        }

        loop {
            let deadline = self.state.deadline();

            tokio::select! {
                changed = self.events.changed() => {
                    if changed.is_err() {
                        break;
                    }

                    let event = self.events.borrow_and_update().clone();
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.settle().await;
                }
            }
        }

        tracing::debug!("secret event channel closed, stopping reconciler");
    }

    /// Updates the state according to a single secret event. Events for other secrets or
    /// without certificate data are ignored.
    pub async fn handle_event(&mut self, event: SecretEvent) {
        match event {
            SecretEvent::Applied(secret) => {
                let Some(owner) = self.ca_secret_owner(&secret) else {
                    return;
                };

                let Some(ca_bundle) = ca_bundle(&secret) else {
                    tracing::debug!(
                        k8s.secret.name = %owner.name,
                        "CA secret carries no certificate yet"
                    );
                    return;
                };

                if matches!(&self.state, RegistrationState::Registered { ca_bundle: registered } if *registered == ca_bundle)
                {
                    tracing::debug!("CA bundle is already registered");
                    return;
                }

                tracing::info!(
                    delay = ?self.options.settle_delay,
                    "observed CA bundle, applying webhook configurations after settle delay"
                );
                self.state = RegistrationState::Settling {
                    ca_bundle,
                    owner,
                    deadline: Instant::now() + self.options.settle_delay,
                };
            }
            SecretEvent::Deleted(secret) => {
                if self.ca_secret_owner(&secret).is_none() {
                    return;
                }

                tracing::info!("CA secret was deleted, removing webhook configurations");
                self.remove().await;
            }
        }
    }

    /// Acts on the pending deadline: applies the settled CA bundle or retries a failed removal.
    /// On failure the same work is scheduled again after the settle delay.
    pub async fn settle(&mut self) {
        let (ca_bundle, owner) =
            match std::mem::replace(&mut self.state, RegistrationState::Unregistered) {
                RegistrationState::Settling {
                    ca_bundle, owner, ..
                } => (ca_bundle, owner),
                RegistrationState::Removing { .. } => {
                    self.remove().await;
                    return;
                }
                state => {
                    self.state = state;
                    return;
                }
            };

        match self.reconcile(&ca_bundle, &owner).await {
            Ok(()) => {
                tracing::info!("applied webhook configurations");
                self.state = RegistrationState::Registered { ca_bundle };
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    retry_in = ?self.options.settle_delay,
                    "failed to apply webhook configurations"
                );
                self.state = RegistrationState::Settling {
                    ca_bundle,
                    owner,
                    deadline: Instant::now() + self.options.settle_delay,
                };
            }
        }
    }

    async fn remove(&mut self) {
        match self.api.delete(WEBHOOK_CONFIGURATION_NAME).await {
            Ok(()) => {
                tracing::info!("removed webhook configurations");
                self.state = RegistrationState::Unregistered;
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    retry_in = ?self.options.settle_delay,
                    "failed to remove webhook configurations"
                );
                self.state = RegistrationState::Removing {
                    deadline: Instant::now() + self.options.settle_delay,
                };
            }
        }
    }

    /// Applies the desired configurations trusting `ca_bundle`.
    pub async fn reconcile(
        &self,
        ca_bundle: &[u8],
        owner: &ConfigurationOwner,
    ) -> Result<(), ReconcileError> {
        let configurations =
            WebhookConfigurations::desired(&self.registry, &self.options, ca_bundle, owner);
        self.api.apply(&configurations).await
    }

    fn ca_secret_owner(&self, secret: &Secret) -> Option<ConfigurationOwner> {
        let name = secret.metadata.name.as_deref()?;
        let namespace = secret.metadata.namespace.as_deref()?;

        (name == CA_SECRET_NAME && namespace == self.options.namespace).then(|| {
            ConfigurationOwner {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }
        })
    }
}

/// The PEM encoded CA certificate of the secret, if it isn't empty.
fn ca_bundle(secret: &Secret) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()?
        .get(TLS_CERT_KEY)
        .map(|certificate| certificate.0.clone())
        .filter(|certificate| !certificate.is_empty())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use k8s_openapi::{ByteString, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    use super::*;
    use crate::access::tests::FakeAccessDecision;

    #[derive(Debug, Default)]
    struct FakeApi {
        applied: Mutex<Vec<(Instant, WebhookConfigurations)>>,
        deleted: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
        delete_failures_left: AtomicUsize,
    }

    impl FakeApi {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn failing_deletes(times: usize) -> Self {
            Self {
                delete_failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn applied(&self) -> Vec<(Instant, WebhookConfigurations)> {
            self.applied.lock().expect("lock is not poisoned").clone()
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().expect("lock is not poisoned").clone()
        }
    }

    #[async_trait]
    impl WebhookConfigurationApi for FakeApi {
        async fn apply(&self, configurations: &WebhookConfigurations) -> Result<(), ReconcileError> {
            if take_failure(&self.failures_left) {
                return Err(ReconcileError::ApplyValidatingWebhookConfiguration {
                    source: unavailable(),
                    name: configurations.validating.name_any(),
                });
            }

            self.applied
                .lock()
                .expect("lock is not poisoned")
                .push((Instant::now(), configurations.clone()));
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<(), ReconcileError> {
            if take_failure(&self.delete_failures_left) {
                return Err(ReconcileError::DeleteValidatingWebhookConfiguration {
                    source: unavailable(),
                    name: name.to_owned(),
                });
            }

            self.deleted
                .lock()
                .expect("lock is not poisoned")
                .push(name.to_owned());
            Ok(())
        }
    }

    fn take_failure(failures_left: &AtomicUsize) -> bool {
        failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn unavailable() -> kube::Error {
        kube::Error::SerdeError(serde_json::from_str::<u8>("unavailable").expect_err("not a number"))
    }

    fn secret(name: &str, namespace: &str, certificate: Option<&[u8]>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            data: certificate.map(|certificate| {
                BTreeMap::from([(TLS_CERT_KEY.to_owned(), ByteString(certificate.to_vec()))])
            }),
            ..Default::default()
        }
    }

    fn ca_secret(certificate: &[u8]) -> Secret {
        secret(CA_SECRET_NAME, "cattle-system", Some(certificate))
    }

    fn reconciler(
        api: Arc<FakeApi>,
    ) -> (
        WebhookConfigurationReconciler,
        watch::Sender<Option<SecretEvent>>,
    ) {
        let options = Arc::new(WebhookOptions::default());
        let registry = Arc::new(HandlerRegistry::new(
            &options,
            Arc::new(FakeAccessDecision::allowing()),
        ));
        let (events_tx, events_rx) = watch::channel(None);

        (
            WebhookConfigurationReconciler::new(api, registry, options, events_rx),
            events_tx,
        )
    }

    fn validating_ca_bundle(configurations: &WebhookConfigurations) -> Vec<u8> {
        configurations
            .validating
            .webhooks
            .as_ref()
            .and_then(|webhooks| webhooks.first())
            .and_then(|webhook| webhook.client_config.ca_bundle.clone())
            .map(|ca_bundle| ca_bundle.0)
            .expect("CA bundle is set")
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_secrets_are_ignored() {
        let api = Arc::new(FakeApi::default());
        let (mut reconciler, _events_tx) = reconciler(api.clone());

        for secret in [
            secret("other", "cattle-system", Some(b"ca")),
            secret(CA_SECRET_NAME, "default", Some(b"ca")),
            secret(CA_SECRET_NAME, "cattle-system", None),
            secret(CA_SECRET_NAME, "cattle-system", Some(b"")),
        ] {
            reconciler.handle_event(SecretEvent::Applied(secret)).await;
            assert_eq!(reconciler.state(), &RegistrationState::Unregistered);
        }

        reconciler
            .handle_event(SecretEvent::Deleted(secret("other", "cattle-system", None)))
            .await;
        assert!(api.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn settles_before_registering() {
        let api = Arc::new(FakeApi::default());
        let (mut reconciler, _events_tx) = reconciler(api.clone());
        let observed = Instant::now();

        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-1")))
            .await;
        assert!(matches!(
            reconciler.state(),
            RegistrationState::Settling { deadline, .. }
                if *deadline == observed + Duration::from_secs(15)
        ));
        assert!(api.applied().is_empty());

        reconciler.settle().await;
        assert_eq!(reconciler.state(), &RegistrationState::Registered {
            ca_bundle: b"ca-1".to_vec()
        });

        let applied = api.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(validating_ca_bundle(&applied[0].1), b"ca-1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_apply_is_redelivered() {
        let api = Arc::new(FakeApi::failing(1));
        let (mut reconciler, _events_tx) = reconciler(api.clone());

        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-1")))
            .await;
        reconciler.settle().await;

        assert!(matches!(
            reconciler.state(),
            RegistrationState::Settling { .. }
        ));
        assert!(api.applied().is_empty());

        reconciler.settle().await;
        assert!(matches!(
            reconciler.state(),
            RegistrationState::Registered { .. }
        ));
        assert_eq!(api.applied().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_ca_secret_unregisters() {
        let api = Arc::new(FakeApi::default());
        let (mut reconciler, _events_tx) = reconciler(api.clone());

        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-1")))
            .await;
        reconciler.settle().await;
        reconciler
            .handle_event(SecretEvent::Deleted(ca_secret(b"ca-1")))
            .await;

        assert_eq!(reconciler.state(), &RegistrationState::Unregistered);
        assert_eq!(api.deleted(), [WEBHOOK_CONFIGURATION_NAME]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_removal_is_redelivered() {
        let api = Arc::new(FakeApi::failing_deletes(1));
        let (mut reconciler, _events_tx) = reconciler(api.clone());
        let deleted_at = Instant::now();

        reconciler
            .handle_event(SecretEvent::Deleted(ca_secret(b"ca-1")))
            .await;
        assert_eq!(reconciler.state(), &RegistrationState::Removing {
            deadline: deleted_at + Duration::from_secs(15)
        });
        assert!(api.deleted().is_empty());

        reconciler.settle().await;
        assert_eq!(reconciler.state(), &RegistrationState::Unregistered);
        assert_eq!(api.deleted(), [WEBHOOK_CONFIGURATION_NAME]);
    }

    #[tokio::test(start_paused = true)]
    async fn running_reconciler_retries_removal() {
        let api = Arc::new(FakeApi::failing_deletes(2));
        let (reconciler, events_tx) = reconciler(api.clone());
        let handle = tokio::spawn(reconciler.run());

        events_tx.send_replace(Some(SecretEvent::Deleted(ca_secret(b"ca-1"))));
        tokio::time::sleep(Duration::from_secs(40)).await;
        drop(events_tx);
        handle.await.expect("reconciler doesn't panic");

        assert_eq!(api.deleted(), [WEBHOOK_CONFIGURATION_NAME]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_bundle_restarts_settle_delay() {
        let api = Arc::new(FakeApi::default());
        let (reconciler, events_tx) = reconciler(api.clone());
        let started = Instant::now();
        let handle = tokio::spawn(reconciler.run());

        events_tx.send_replace(Some(SecretEvent::Applied(ca_secret(b"ca-1"))));
        tokio::time::sleep(Duration::from_secs(10)).await;
        events_tx.send_replace(Some(SecretEvent::Applied(ca_secret(b"ca-2"))));

        // Closing the channel stops the reconciler, so give it time to settle first.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(events_tx);
        handle.await.expect("reconciler doesn't panic");

        let applied = api.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(validating_ca_bundle(&applied[0].1), b"ca-2");
        assert!(applied[0].0 >= started + Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn registered_bundle_is_not_applied_again() {
        let api = Arc::new(FakeApi::default());
        let (mut reconciler, _events_tx) = reconciler(api.clone());

        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-1")))
            .await;
        reconciler.settle().await;
        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-1")))
            .await;
        assert!(matches!(
            reconciler.state(),
            RegistrationState::Registered { .. }
        ));

        reconciler
            .handle_event(SecretEvent::Applied(ca_secret(b"ca-2")))
            .await;
        assert!(matches!(
            reconciler.state(),
            RegistrationState::Settling { .. }
        ));
        assert_eq!(api.applied().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_maintenance_returns_immediately() {
        let options = Arc::new(
            WebhookOptions::builder()
                .disable_webhook_configuration_maintenance(true)
                .build(),
        );
        let registry = Arc::new(HandlerRegistry::new(
            &options,
            Arc::new(FakeAccessDecision::allowing()),
        ));
        let (_events_tx, events_rx) = watch::channel(None);

        WebhookConfigurationReconciler::new(
            Arc::new(FakeApi::default()),
            registry,
            options,
            events_rx,
        )
        .run()
        .await;
    }
}
