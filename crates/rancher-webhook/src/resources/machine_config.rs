//! Handlers for the node driver machine configs in the `rke-machine-config.cattle.io` group.
//!
//! The mutator records the creating user in the creator ID annotation, the validator makes sure
//! the annotation is neither forged on create nor changed afterwards.
use kube::{
    ResourceExt,
    core::{
        DynamicObject,
        admission::{AdmissionRequest, AdmissionResponse, Operation},
    },
};

use super::{AdmitError, creator_id};
use crate::{
    admission::{
        registry::{
            DryRunPolicy, FailurePolicy, HandlerDescriptor, ResourceSelector, Scope, SideEffects,
        },
        response,
    },
    codec,
    constants::CREATOR_ID_ANNOTATION,
};

const SELECTOR: ResourceSelector = ResourceSelector::new("rke-machine-config.cattle.io", "v1", "*");

pub static VALIDATOR_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "machine-configs",
    selector: SELECTOR,
    operations: &[Operation::Create, Operation::Update],
    failure_policy: FailurePolicy::Fail,
    side_effects: SideEffects::None,
    scope: Scope::Namespaced,
    dry_run: DryRunPolicy::Evaluate,
};

pub static MUTATOR_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "machine-configs",
    selector: SELECTOR,
    operations: &[Operation::Create],
    failure_policy: FailurePolicy::Fail,
    side_effects: SideEffects::NoneOnDryRun,
    scope: Scope::Namespaced,
    dry_run: DryRunPolicy::Allow,
};

/// Validates the creator ID annotation of machine configs.
#[derive(Debug, Default)]
pub struct Validator;

impl Validator {
    pub fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        let (old, new) = codec::decode_old_and_new::<DynamicObject>(request)?;
        let username = request.user_info.username.as_deref().unwrap_or_default();

        let denial = creator_id::check(
            &request.operation,
            username,
            old.as_ref().map(ResourceExt::annotations),
            new.as_ref().map(ResourceExt::annotations),
        );

        Ok(response::from_decision(request, denial))
    }
}

/// Sets the creator ID annotation of new machine configs to the requesting user.
#[derive(Debug, Default)]
pub struct Mutator;

impl Mutator {
    pub fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        let config = codec::decode_object::<DynamicObject>(request)?;
        let username = request.user_info.username.clone().unwrap_or_default();

        let mut mutated = config.clone();
        mutated
            .annotations_mut()
            .insert(CREATOR_ID_ANNOTATION.to_owned(), username);

        Ok(codec::patch_response(
            response::allowed(request),
            &config,
            &mutated,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::admission::tests::request;

    fn config(creator: Option<&str>) -> Value {
        let mut config = json!({
            "apiVersion": "rke-machine-config.cattle.io/v1",
            "kind": "Amazonec2Config",
            "metadata": {"name": "nc-pool1", "namespace": "fleet-default"},
            "region": "eu-central-1",
        });
        if let Some(creator) = creator {
            config["metadata"]["annotations"] = json!({ CREATOR_ID_ANNOTATION: creator });
        }
        config
    }

    fn resource() -> Value {
        json!({"group": "rke-machine-config.cattle.io", "version": "v1", "resource": "amazonec2configs"})
    }

    #[test]
    fn create_by_creator_is_allowed() {
        let request = request(resource(), "CREATE", None, Some(config(Some("alice"))));
        let response = Validator.admit(&request).expect("validator decides");

        assert!(response.allowed);
    }

    #[test]
    fn create_with_forged_creator_is_invalid() {
        let request = request(resource(), "CREATE", None, Some(config(Some("bob"))));
        let response = Validator.admit(&request).expect("validator decides");

        assert!(!response.allowed);
        assert_eq!(response.result.code, 422);
        assert_eq!(response.result.reason, "Invalid");
        assert_eq!(response.result.message, creator_id::MISMATCHED_CREATOR_MESSAGE);
    }

    #[test]
    fn removing_creator_on_update_is_allowed() {
        let request = request(
            resource(),
            "UPDATE",
            Some(config(Some("alice"))),
            Some(config(None)),
        );
        let response = Validator.admit(&request).expect("validator decides");

        assert!(response.allowed);
    }

    #[test]
    fn changing_creator_on_update_is_invalid() {
        let request = request(
            resource(),
            "UPDATE",
            Some(config(Some("alice"))),
            Some(config(Some("bob"))),
        );
        let response = Validator.admit(&request).expect("validator decides");

        assert!(!response.allowed);
        assert_eq!(response.result.message, creator_id::CHANGED_CREATOR_MESSAGE);
    }

    #[test]
    fn mutator_patches_creator() {
        let request = request(resource(), "CREATE", None, Some(config(None)));
        let response = Mutator.admit(&request).expect("mutator decides");

        assert!(response.allowed);
        let patch: Value =
            serde_json::from_slice(&response.patch.expect("patch is set")).expect("patch is JSON");
        let mut object = config(None);
        json_patch::patch(
            &mut object,
            &serde_json::from_value::<json_patch::Patch>(patch).expect("patch is a JSON patch"),
        )
        .expect("patch applies");

        assert_eq!(object, config(Some("alice")));
    }

    #[test]
    fn mutator_keeps_matching_creator() {
        let request = request(resource(), "CREATE", None, Some(config(Some("alice"))));
        let response = Mutator.admit(&request).expect("mutator decides");

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
