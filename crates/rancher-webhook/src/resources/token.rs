//! Defaults the group principals of new authentication tokens.
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use serde_json::Value;

use super::AdmitError;
use crate::{
    admission::{
        registry::{
            DryRunPolicy, FailurePolicy, HandlerDescriptor, ResourceSelector, Scope, SideEffects,
        },
        response,
    },
    codec,
};

const GROUP_PRINCIPALS_FIELD: &str = "groupPrincipals";

pub static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "tokens",
    selector: ResourceSelector::new("management.cattle.io", "v3", "tokens"),
    operations: &[Operation::Create],
    failure_policy: FailurePolicy::Fail,
    side_effects: SideEffects::NoneOnDryRun,
    scope: Scope::Cluster,
    dry_run: DryRunPolicy::Allow,
};

#[derive(Debug, Default)]
pub struct Mutator;

impl Mutator {
    pub fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        let token = codec::decode_object::<DynamicObject>(request)?;

        let has_principals = token
            .data
            .get(GROUP_PRINCIPALS_FIELD)
            .is_some_and(|principals| !principals.is_null());
        if has_principals {
            return Ok(response::allowed(request));
        }

        let mut mutated = token.clone();
        if let Some(fields) = mutated.data.as_object_mut() {
            fields.insert(GROUP_PRINCIPALS_FIELD.to_owned(), Value::Array(Vec::new()));
        }

        Ok(codec::patch_response(
            response::allowed(request),
            &token,
            &mutated,
        )?)
    }
}
