//! Builds the desired `ValidatingWebhookConfiguration` and `MutatingWebhookConfiguration`.
//!
//! The configurations are derived from the [`HandlerDescriptor`]s of the registry, with one
//! webhook entry per handler. Building them is a pure function of its inputs, applying the
//! same CA bundle twice results in equal objects.
use std::{collections::BTreeMap, marker::PhantomData};

use k8s_openapi::{
    ByteString, Resource,
    api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
        ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::core::admission::Operation;

use crate::{
    admission::registry::{AdmissionKind, HandlerDescriptor, HandlerRegistry},
    constants::{
        MUTATION_PATH, OWNER_NAME_ANNOTATION, OWNER_NAMESPACE_ANNOTATION, SERVICE_CLIENT_PORT,
        VALIDATION_PATH, WEBHOOK_CONFIGURATION_NAME,
    },
    options::WebhookOptions,
};

/// The admission review versions the dispatcher understands.
pub const ADMISSION_REVIEW_VERSIONS: [&str; 2] = ["v1", "v1beta1"];

/// The API server never waits longer than this for a webhook.
const MAX_TIMEOUT_SECONDS: u64 = 30;

/// The object the webhook configurations belong to, the CA secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationOwner {
    pub name: String,
    pub namespace: String,
}

/// Both desired webhook configurations.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookConfigurations {
    pub validating: ValidatingWebhookConfiguration,
    pub mutating: MutatingWebhookConfiguration,
}

impl WebhookConfigurations {
    /// Computes the desired configurations for all handlers in `registry`, trusting `ca_bundle`
    /// (PEM encoded) to verify the serving certificate.
    pub fn desired(
        registry: &HandlerRegistry,
        options: &WebhookOptions,
        ca_bundle: &[u8],
        owner: &ConfigurationOwner,
    ) -> Self {
        let ca_bundle = ByteString(ca_bundle.to_vec());
        let timeout_seconds = timeout_seconds(options);

        let mut validating = WebhookConfigurationBuilder::validating(WEBHOOK_CONFIGURATION_NAME, owner);
        for handler in registry.handlers(AdmissionKind::Validating) {
            let descriptor = handler.descriptor();
            validating.add_webhook(ValidatingWebhook {
                name: webhook_name(descriptor),
                client_config: client_config(options, ca_bundle.clone(), VALIDATION_PATH),
                rules: Some(vec![rule(descriptor)]),
                failure_policy: Some(descriptor.failure_policy.to_string()),
                side_effects: descriptor.side_effects.to_string(),
                admission_review_versions: review_versions(),
                timeout_seconds: Some(timeout_seconds),
                ..Default::default()
            });
        }

        let mut mutating = WebhookConfigurationBuilder::mutating(WEBHOOK_CONFIGURATION_NAME, owner);
        for handler in registry.handlers(AdmissionKind::Mutating) {
            let descriptor = handler.descriptor();
            mutating.add_webhook(MutatingWebhook {
                name: webhook_name(descriptor),
                client_config: client_config(options, ca_bundle.clone(), MUTATION_PATH),
                rules: Some(vec![rule(descriptor)]),
                failure_policy: Some(descriptor.failure_policy.to_string()),
                side_effects: descriptor.side_effects.to_string(),
                admission_review_versions: review_versions(),
                timeout_seconds: Some(timeout_seconds),
                ..Default::default()
            });
        }

        Self {
            validating: validating.build(),
            mutating: mutating.build(),
        }
    }
}

pub trait WebhookConfigurationExt<H> {
    fn webhooks_mut(&mut self) -> &mut Vec<H>;
}

impl WebhookConfigurationExt<ValidatingWebhook> for ValidatingWebhookConfiguration {
    fn webhooks_mut(&mut self) -> &mut Vec<ValidatingWebhook> {
        self.webhooks.get_or_insert_with(Vec::new)
    }
}

impl WebhookConfigurationExt<MutatingWebhook> for MutatingWebhookConfiguration {
    fn webhooks_mut(&mut self) -> &mut Vec<MutatingWebhook> {
        self.webhooks.get_or_insert_with(Vec::new)
    }
}

/// Collects webhook entries into a [validating][k8s-val] or [mutating][k8s-mut] webhook
/// configuration.
///
/// [k8s-val]: https://kubernetes.io/docs/reference/access-authn-authz/admission-controllers/#validatingadmissionwebhook
/// [k8s-mut]: https://kubernetes.io/docs/reference/access-authn-authz/admission-controllers/#mutatingadmissionwebhook
#[derive(Debug)]
pub struct WebhookConfigurationBuilder<H, C>
where
    C: Resource + WebhookConfigurationExt<H>,
{
    hooks: PhantomData<H>,
    config: C,
}

impl WebhookConfigurationBuilder<ValidatingWebhook, ValidatingWebhookConfiguration> {
    pub fn validating(name: impl Into<String>, owner: &ConfigurationOwner) -> Self {
        Self {
            hooks: PhantomData,
            config: ValidatingWebhookConfiguration {
                metadata: metadata(name, owner),
                ..Default::default()
            },
        }
    }
}

impl WebhookConfigurationBuilder<MutatingWebhook, MutatingWebhookConfiguration> {
    pub fn mutating(name: impl Into<String>, owner: &ConfigurationOwner) -> Self {
        Self {
            hooks: PhantomData,
            config: MutatingWebhookConfiguration {
                metadata: metadata(name, owner),
                ..Default::default()
            },
        }
    }
}

impl<H, C> WebhookConfigurationBuilder<H, C>
where
    C: Resource + WebhookConfigurationExt<H>,
{
    pub fn add_webhook(&mut self, webhook: H) -> &mut Self {
        self.config.webhooks_mut().push(webhook);
        self
    }

    pub fn build(self) -> C {
        self.config
    }
}

fn metadata(name: impl Into<String>, owner: &ConfigurationOwner) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        annotations: Some(BTreeMap::from([
            (OWNER_NAME_ANNOTATION.to_owned(), owner.name.clone()),
            (OWNER_NAMESPACE_ANNOTATION.to_owned(), owner.namespace.clone()),
        ])),
        ..Default::default()
    }
}

/// Points the API server at the webhook service. `ByteString` takes care of encoding the CA
/// bundle as base64.
fn client_config(
    options: &WebhookOptions,
    ca_bundle: ByteString,
    http_path: &str,
) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: options.service_name.clone(),
            namespace: options.namespace.clone(),
            path: Some(http_path.to_owned()),
            port: Some(SERVICE_CLIENT_PORT.into()),
        }),
        ca_bundle: Some(ca_bundle),
        url: None,
    }
}

fn rule(descriptor: &HandlerDescriptor) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![descriptor.selector.group.to_owned()]),
        api_versions: Some(vec![descriptor.selector.version.to_owned()]),
        resources: Some(vec![descriptor.selector.resource.to_owned()]),
        operations: Some(
            descriptor
                .operations
                .iter()
                .map(|operation| operation_name(operation).to_owned())
                .collect(),
        ),
        scope: Some(descriptor.scope.to_string()),
    }
}

/// Webhook names must be unique within a configuration. Handlers selecting every resource of a
/// group are named after the group.
fn webhook_name(descriptor: &HandlerDescriptor) -> String {
    let selector = &descriptor.selector;
    if selector.is_wildcard() {
        format!("{WEBHOOK_CONFIGURATION_NAME}.{}", selector.group)
    } else {
        format!("{WEBHOOK_CONFIGURATION_NAME}.{}", selector.resource)
    }
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

fn review_versions() -> Vec<String> {
    ADMISSION_REVIEW_VERSIONS.map(str::to_owned).to_vec()
}

fn timeout_seconds(options: &WebhookOptions) -> i32 {
    let seconds = options.admission_timeout.as_secs().clamp(1, MAX_TIMEOUT_SECONDS);
    i32::try_from(seconds).unwrap_or(10)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;
    use crate::access::tests::FakeAccessDecision;

    const CA_BUNDLE: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn owner() -> ConfigurationOwner {
        ConfigurationOwner {
            name: "cattle-webhook-ca".to_owned(),
            namespace: "cattle-system".to_owned(),
        }
    }

    fn desired(multi_cluster_management: bool, ca_bundle: &[u8]) -> WebhookConfigurations {
        let options = WebhookOptions::builder()
            .multi_cluster_management(multi_cluster_management)
            .build();
        let registry = HandlerRegistry::new(&options, Arc::new(FakeAccessDecision::allowing()));

        WebhookConfigurations::desired(&registry, &options, ca_bundle, &owner())
    }

    #[test]
    fn desired_state_is_deterministic() {
        assert_eq!(desired(false, CA_BUNDLE), desired(false, CA_BUNDLE));
        assert_ne!(desired(false, CA_BUNDLE), desired(false, b"other"));
    }

    #[test]
    fn one_webhook_per_handler() {
        let configurations = desired(false, CA_BUNDLE);
        let validating = configurations.validating.webhooks.expect("validating webhooks");
        let mutating = configurations.mutating.webhooks.expect("mutating webhooks");

        let names: Vec<_> = validating.iter().map(|webhook| webhook.name.as_str()).collect();
        assert_eq!(names, [
            "rancher.cattle.io.rke-machine-config.cattle.io",
            "rancher.cattle.io.namespaces",
        ]);

        let names: Vec<_> = mutating.iter().map(|webhook| webhook.name.as_str()).collect();
        assert_eq!(names, [
            "rancher.cattle.io.rke-machine-config.cattle.io",
            "rancher.cattle.io.tokens",
        ]);
    }

    #[test]
    fn multi_cluster_management_adds_rules() {
        let configurations = desired(true, CA_BUNDLE);
        let validating = configurations.validating.webhooks.expect("validating webhooks");

        assert_eq!(validating.len(), 3);
        let names: HashSet<_> = validating.iter().map(|webhook| &webhook.name).collect();
        assert_eq!(names.len(), validating.len(), "webhook names must be unique");
        assert!(
            validating
                .iter()
                .any(|webhook| webhook.name
                    == "rancher.cattle.io.podsecuritypolicytemplateprojectbindings")
        );
    }

    #[test]
    fn webhook_entries_point_at_the_service() {
        let configurations = desired(false, CA_BUNDLE);

        assert_eq!(
            configurations.validating.metadata.name.as_deref(),
            Some("rancher.cattle.io")
        );
        let annotations = configurations
            .mutating
            .metadata
            .annotations
            .expect("owner annotations");
        assert_eq!(annotations[OWNER_NAME_ANNOTATION], "cattle-webhook-ca");

        let namespaces = configurations
            .validating
            .webhooks
            .expect("validating webhooks")
            .into_iter()
            .find(|webhook| webhook.name == "rancher.cattle.io.namespaces")
            .expect("namespace webhook");

        let service = namespaces.client_config.service.expect("service reference");
        assert_eq!(service.name, "rancher-webhook");
        assert_eq!(service.namespace, "cattle-system");
        assert_eq!(service.path.as_deref(), Some(VALIDATION_PATH));
        assert_eq!(service.port, Some(443));
        assert_eq!(
            namespaces.client_config.ca_bundle,
            Some(ByteString(CA_BUNDLE.to_vec()))
        );
        assert_eq!(namespaces.admission_review_versions, ["v1", "v1beta1"]);
        assert_eq!(namespaces.failure_policy.as_deref(), Some("Ignore"));
        assert_eq!(namespaces.side_effects, "None");
        assert_eq!(namespaces.timeout_seconds, Some(10));

        let rule = &namespaces.rules.expect("rules")[0];
        assert_eq!(rule.api_groups, Some(vec![String::new()]));
        assert_eq!(rule.operations, Some(vec!["UPDATE".to_owned()]));
        assert_eq!(rule.scope.as_deref(), Some("Cluster"));
    }

    #[test]
    fn mutating_entries_have_no_side_effects_on_dry_run() {
        let configurations = desired(false, CA_BUNDLE);

        for webhook in configurations.mutating.webhooks.expect("mutating webhooks") {
            assert_eq!(webhook.side_effects, "NoneOnDryRun");
            assert_eq!(
                webhook.client_config.service.and_then(|service| service.path),
                Some(MUTATION_PATH.to_owned())
            );
        }
    }
}
