//! Guards the pod security admission labels of namespaces.
//!
//! Changing one of the `pod-security.kubernetes.io` enforce, audit or warn labels requires the
//! `updatepsa` permission on projects, asked for in the namespace being changed.
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Namespace;
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, Operation},
};

use super::AdmitError;
use crate::{
    access::{AccessDecision, AccessQuery},
    admission::{
        registry::{
            DryRunPolicy, FailurePolicy, HandlerDescriptor, ResourceSelector, Scope, SideEffects,
        },
        response::{self, Denial},
    },
    codec,
};

/// Labels which configure pod security admission of a namespace.
pub const POD_SECURITY_LABELS: [&str; 3] = [
    "pod-security.kubernetes.io/enforce",
    "pod-security.kubernetes.io/audit",
    "pod-security.kubernetes.io/warn",
];

const UPDATE_PSA_VERB: &str = "updatepsa";
const PROJECTS: (&str, &str, &str) = ("management.cattle.io", "v3", "projects");

pub static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "namespaces",
    selector: ResourceSelector::new("", "v1", "namespaces"),
    operations: &[Operation::Update],
    failure_policy: FailurePolicy::Ignore,
    side_effects: SideEffects::None,
    scope: Scope::Cluster,
    dry_run: DryRunPolicy::Evaluate,
};

#[derive(Debug)]
pub struct Validator {
    access: Arc<dyn AccessDecision>,
}

impl Validator {
    pub fn new(access: Arc<dyn AccessDecision>) -> Self {
        Self { access }
    }

    pub async fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmitError> {
        let (old, new) = codec::decode_old_and_new::<Namespace>(request)?;

        let old_labels = old.as_ref().and_then(|namespace| namespace.metadata.labels.as_ref());
        let new_labels = new.as_ref().and_then(|namespace| namespace.metadata.labels.as_ref());

        if !pod_security_labels_changed(old_labels, new_labels) {
            return Ok(response::allowed(request));
        }

        let namespace_name = new
            .as_ref()
            .or(old.as_ref())
            .and_then(|namespace| namespace.metadata.name.clone())
            .unwrap_or_else(|| request.name.clone());

        let query = AccessQuery::new(UPDATE_PSA_VERB, PROJECTS, &request.user_info)
            .with_namespace(namespace_name);
        let outcome = self.access.review(query).await?;

        if outcome.allowed {
            return Ok(response::allowed(request));
        }

        let message = if outcome.reason.is_empty() {
            "user is not allowed to change the pod security admission labels".to_owned()
        } else {
            outcome.reason
        };

        Ok(response::denied(request, Denial::unauthorized(403, message)))
    }
}

/// Returns whether any of the [`POD_SECURITY_LABELS`] was added, removed or changed.
fn pod_security_labels_changed(
    old: Option<&BTreeMap<String, String>>,
    new: Option<&BTreeMap<String, String>>,
) -> bool {
    POD_SECURITY_LABELS.iter().any(|label| {
        let old = old.and_then(|labels| labels.get(*label));
        let new = new.and_then(|labels| labels.get(*label));
        old != new
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::{access::tests::FakeAccessDecision, admission::tests::request};

    fn namespace(labels: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "team-a", "labels": labels},
        })
    }

    fn update(old_labels: Value, new_labels: Value) -> AdmissionRequest<DynamicObject> {
        request(
            json!({"group": "", "version": "v1", "resource": "namespaces"}),
            "UPDATE",
            Some(namespace(old_labels)),
            Some(namespace(new_labels)),
        )
    }

    #[tokio::test]
    async fn unrelated_label_change_skips_access_decision() {
        let access = Arc::new(FakeAccessDecision::failing());
        let validator = Validator::new(access.clone());

        let response = validator
            .admit(&update(json!({"team": "a"}), json!({"team": "b"})))
            .await
            .expect("validator decides");

        assert!(response.allowed);
        assert!(access.recorded().is_empty());
    }

    #[tokio::test]
    async fn denied_psa_change_is_unauthorized() {
        let access = Arc::new(FakeAccessDecision::denying("missing updatepsa"));
        let validator = Validator::new(access.clone());

        let response = validator
            .admit(&update(
                json!({}),
                json!({"pod-security.kubernetes.io/enforce": "privileged"}),
            ))
            .await
            .expect("validator decides");

        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);
        assert_eq!(response.result.reason, "Unauthorized");
        assert_eq!(response.result.message, "missing updatepsa");

        let queries = access.recorded();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].verb, "updatepsa");
        assert_eq!(queries[0].resource, "projects");
        assert_eq!(queries[0].namespace.as_deref(), Some("team-a"));
        assert_eq!(queries[0].user, "alice");
    }

    #[tokio::test]
    async fn denial_without_reason_still_has_a_message() {
        let validator = Validator::new(Arc::new(FakeAccessDecision::denying("")));

        let response = validator
            .admit(&update(
                json!({"pod-security.kubernetes.io/warn": "baseline"}),
                json!({}),
            ))
            .await
            .expect("validator decides");

        assert!(!response.allowed);
        assert!(!response.result.message.is_empty());
    }

    #[tokio::test]
    async fn allowed_psa_change() {
        let validator = Validator::new(Arc::new(FakeAccessDecision::allowing()));

        let response = validator
            .admit(&update(
                json!({"pod-security.kubernetes.io/audit": "baseline"}),
                json!({"pod-security.kubernetes.io/audit": "restricted"}),
            ))
            .await
            .expect("validator decides");

        assert!(response.allowed);
    }

    #[tokio::test]
    async fn failed_access_decision_is_an_error() {
        let validator = Validator::new(Arc::new(FakeAccessDecision::failing()));

        let err = validator
            .admit(&update(
                json!({}),
                json!({"pod-security.kubernetes.io/enforce": "privileged"}),
            ))
            .await
            .expect_err("access decision fails");

        assert!(matches!(err, AdmitError::AccessDecision { .. }));
    }
}
