//! The handler registry: which handler is responsible for which resource and operation.
//!
//! Every handler carries a [`HandlerDescriptor`]. The registry uses the descriptors to route
//! admission requests and the webhook configuration builder uses the very same descriptors to
//! derive the webhook rules, so both can never disagree.
use std::sync::Arc;

use kube::core::{GroupVersionResource, admission::Operation};

use crate::{
    access::AccessDecision,
    options::WebhookOptions,
    resources::{Handler, machine_config, namespace, template_binding, token},
};

/// Resource name which matches every resource of a group and version.
pub const WILDCARD_RESOURCE: &str = "*";

/// Selects the resources a handler is responsible for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceSelector {
    pub group: &'static str,
    pub version: &'static str,
    pub resource: &'static str,
}

impl ResourceSelector {
    pub const fn new(group: &'static str, version: &'static str, resource: &'static str) -> Self {
        Self {
            group,
            version,
            resource,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource == WILDCARD_RESOURCE
    }

    fn matches_exactly(&self, resource: &GroupVersionResource) -> bool {
        self.group == resource.group
            && self.version == resource.version
            && self.resource == resource.resource
    }

    fn matches_by_wildcard(&self, resource: &GroupVersionResource) -> bool {
        self.is_wildcard() && self.group == resource.group && self.version == resource.version
    }
}

/// What the API server does when the webhook can't be reached or errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FailurePolicy {
    Fail,
    Ignore,
}

/// Declares whether a handler has side effects outside of the admission response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SideEffects {
    None,
    NoneOnDryRun,
}

/// Which objects the rules of a handler apply to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Scope {
    Cluster,
    Namespaced,
    #[strum(serialize = "*")]
    All,
}

/// How a handler treats dry-run requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DryRunPolicy {
    /// The request is evaluated like any other request.
    Evaluate,

    /// The request is allowed without invoking the handler.
    Allow,
}

/// The two kinds of admission a handler can take part in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AdmissionKind {
    Validating,
    Mutating,
}

/// Static description of a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerDescriptor {
    /// A short name used in logs.
    pub name: &'static str,
    pub selector: ResourceSelector,
    pub operations: &'static [Operation],
    pub failure_policy: FailurePolicy,
    pub side_effects: SideEffects,
    pub scope: Scope,
    pub dry_run: DryRunPolicy,
}

impl HandlerDescriptor {
    pub fn handles(&self, operation: &Operation) -> bool {
        self.operations.contains(operation)
    }
}

/// The handlers known to the process, built once at startup.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    validating: Vec<Handler>,
    mutating: Vec<Handler>,
}

impl HandlerRegistry {
    /// Builds the registry for the given options. The handlers only needed with multi-cluster
    /// management are only registered if it is enabled.
    pub fn new(options: &WebhookOptions, access: Arc<dyn AccessDecision>) -> Self {
        let mut validating = vec![
            Handler::MachineConfigValidator(machine_config::Validator),
            Handler::NamespaceValidator(namespace::Validator::new(access.clone())),
        ];

        if options.multi_cluster_management {
            validating.push(Handler::TemplateBindingValidator(
                template_binding::Validator::new(access),
            ));
        }

        let mutating = vec![
            Handler::MachineConfigMutator(machine_config::Mutator),
            Handler::TokenMutator(token::Mutator),
        ];

        Self::from_handlers(validating, mutating)
    }

    pub fn from_handlers(validating: Vec<Handler>, mutating: Vec<Handler>) -> Self {
        Self {
            validating,
            mutating,
        }
    }

    pub fn handlers(&self, kind: AdmissionKind) -> &[Handler] {
        match kind {
            AdmissionKind::Validating => &self.validating,
            AdmissionKind::Mutating => &self.mutating,
        }
    }

    /// Looks up the handler for `resource` and `operation`.
    ///
    /// Handlers selecting the exact resource win over handlers selecting every resource of the
    /// group and version. Within each class the first registered handler wins.
    pub fn resolve(
        &self,
        kind: AdmissionKind,
        resource: &GroupVersionResource,
        operation: &Operation,
    ) -> Option<&Handler> {
        let handlers = self.handlers(kind);
        let candidates = || {
            handlers
                .iter()
                .filter(|handler| handler.descriptor().handles(operation))
        };

        candidates()
            .find(|handler| handler.descriptor().selector.matches_exactly(resource))
            .or_else(|| {
                candidates()
                    .find(|handler| handler.descriptor().selector.matches_by_wildcard(resource))
            })
    }
}
