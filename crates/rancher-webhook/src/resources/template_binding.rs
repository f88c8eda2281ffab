//! Guards bindings of pod security policy templates to projects, only served with multi-cluster
//! management.
use std::sync::Arc;

use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use snafu::OptionExt;

use super::{AdmitError, MalformedFieldSnafu};
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

const TARGET_PROJECT_FIELD: &str = "targetProjectName";
const BINDINGS: (&str, &str, &str) = (
    "management.cattle.io",
    "v3",
    "podsecuritypolicytemplateprojectbindings",
);

pub static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "podsecuritypolicytemplateprojectbindings",
    selector: ResourceSelector::new(BINDINGS.0, BINDINGS.1, BINDINGS.2),
    operations: &[Operation::Create, Operation::Update],
    failure_policy: FailurePolicy::Ignore,
    side_effects: SideEffects::None,
    scope: Scope::Namespaced,
    dry_run: DryRunPolicy::Evaluate,
};

/// Requires the permission to update bindings in the namespace of the target project.
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
        let binding = codec::decode_object::<DynamicObject>(request)?;
        let target = binding
            .data
            .get(TARGET_PROJECT_FIELD)
            .and_then(|target| target.as_str())
            .context(MalformedFieldSnafu {
                field: TARGET_PROJECT_FIELD,
                reason: "must be a string",
            })?;
        let project_namespace = project_namespace(target).context(MalformedFieldSnafu {
            field: TARGET_PROJECT_FIELD,
            reason: format!("{target:?} is not of the form <cluster>:<project>"),
        })?;

        let query = AccessQuery::new("update", BINDINGS, &request.user_info)
            .with_namespace(project_namespace);
        let outcome = self.access.review(query).await?;

        if outcome.allowed {
            return Ok(response::allowed(request));
        }

        let message = if outcome.reason.is_empty() {
            format!("user is not allowed to bind templates to project {target:?}")
        } else {
            outcome.reason
        };

        Ok(response::denied(request, Denial::unauthorized(401, message)))
    }
}

/// Extracts the project part of a `<cluster>:<project>` reference, which is also the name of
/// the namespace backing the project in the management cluster.
fn project_namespace(target: &str) -> Option<&str> {
    match target.split_once(':') {
        Some((cluster, project)) if !cluster.is_empty() && !project.is_empty() => Some(project),
        _ => None,
    }
}
