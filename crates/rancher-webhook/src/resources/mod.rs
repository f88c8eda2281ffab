//! The admission handlers, one module per guarded resource.
//!
//! The set of handlers is closed: every handler is a variant of [`Handler`], which exposes the
//! static [`HandlerDescriptor`] and the single [`Handler::admit`] entry point used by the
//! dispatcher.
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse},
};
use snafu::Snafu;

use crate::{access::AccessDecisionError, admission::registry::HandlerDescriptor, codec::CodecError};

pub mod creator_id;
pub mod machine_config;
pub mod namespace;
pub mod template_binding;
pub mod token;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdmitError {
    #[snafu(display("failed to decode the admitted object"), context(false))]
    Codec { source: CodecError },

    #[snafu(display("failed to ask for an access decision"), context(false))]
    AccessDecision { source: AccessDecisionError },

    #[snafu(display("field {field:?} of the admitted object is malformed: {reason}"))]
    MalformedField { field: &'static str, reason: String },
}

/// Every admission handler known to the webhook.
#[derive(Debug)]
pub enum Handler {
    MachineConfigValidator(machine_config::Validator),
    NamespaceValidator(namespace::Validator),
    TemplateBindingValidator(template_binding::Validator),
    MachineConfigMutator(machine_config::Mutator),
    TokenMutator(token::Mutator),
}

impl Handler {
    pub fn descriptor(&self) -> &'static HandlerDescriptor {
        match self {
            Self::MachineConfigValidator(_) => &machine_config::VALIDATOR_DESCRIPTOR,
            Self::NamespaceValidator(_) => &namespace::DESCRIPTOR,
            Self::TemplateBindingValidator(_) => &template_binding::DESCRIPTOR,
            Self::MachineConfigMutator(_) => &machine_config::MUTATOR_DESCRIPTOR,
            Self::TokenMutator(_) => &token::DESCRIPTOR,
        }
    }

    /// Decides on the admission `request`.
    ///
    /// Denials are returned as `Ok`, errors are reserved for requests the handler could not
    /// decide on.
    pub async fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        match self {
            Self::MachineConfigValidator(validator) => validator.admit(request),
            Self::NamespaceValidator(validator) => validator.admit(request).await,
            Self::TemplateBindingValidator(validator) => validator.admit(request).await,
            Self::MachineConfigMutator(mutator) => mutator.admit(request),
            Self::TokenMutator(mutator) => mutator.admit(request),
        }
    }
}
