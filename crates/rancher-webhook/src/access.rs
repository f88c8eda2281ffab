//! The access decision capability: asks a central authority whether a subject is allowed to
//! perform a verb on a resource.
//!
//! In a cluster this is answered by creating a `SubjectAccessReview`, see
//! [`SubjectAccessReviewClient`]. Handlers only depend on the [`AccessDecision`] trait, which
//! keeps them testable without an API server.
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    authentication::v1::UserInfo,
    authorization::v1::{
        ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
        SubjectAccessReviewStatus,
    },
};
use kube::{Api, Client, api::PostParams};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum AccessDecisionError {
    #[snafu(display("failed to create SubjectAccessReview for verb {verb:?} on {resource:?}"))]
    CreateSubjectAccessReview {
        source: kube::Error,
        verb: String,
        resource: String,
    },

    #[snafu(display("SubjectAccessReview for verb {verb:?} on {resource:?} returned no status"))]
    MissingStatus { verb: String, resource: String },
}

/// A single "may this user do that" question.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessQuery {
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub user: String,
    pub groups: Vec<String>,
    pub uid: Option<String>,
}

impl AccessQuery {
    /// Creates a query for `verb` on the resource `group/version/resource`, asked on behalf of
    /// the requesting user in `user_info`.
    pub fn new(
        verb: impl Into<String>,
        (group, version, resource): (&str, &str, &str),
        user_info: &UserInfo,
    ) -> Self {
        Self {
            verb: verb.into(),
            group: group.to_owned(),
            version: version.to_owned(),
            resource: resource.to_owned(),
            namespace: None,
            user: user_info.username.clone().unwrap_or_default(),
            groups: user_info.groups.clone().unwrap_or_default(),
            uid: user_info.uid.clone(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn resource_display(&self) -> String {
        match self.group.as_str() {
            "" => format!("{}/{}", self.version, self.resource),
            group => format!("{group}/{}/{}", self.version, self.resource),
        }
    }
}

impl From<&AccessQuery> for SubjectAccessReview {
    fn from(query: &AccessQuery) -> Self {
        Self {
            spec: SubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(query.verb.clone()),
                    group: Some(query.group.clone()),
                    version: Some(query.version.clone()),
                    resource: Some(query.resource.clone()),
                    namespace: query.namespace.clone(),
                    ..Default::default()
                }),
                user: Some(query.user.clone()),
                groups: Some(query.groups.clone()),
                uid: query.uid.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// The answer of the authority.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessOutcome {
    pub allowed: bool,
    pub reason: String,
}

impl From<SubjectAccessReviewStatus> for AccessOutcome {
    fn from(status: SubjectAccessReviewStatus) -> Self {
        Self {
            allowed: status.allowed,
            reason: status.reason.unwrap_or_default(),
        }
    }
}

/// Answers [`AccessQuery`]s. Implementations must not retry internally, a failed query is
/// returned as an error.
//
// We still need to use the async-trait crate, as dynamic dispatch in combination with async
// functions is not supported.
#[async_trait]
pub trait AccessDecision: Debug + Send + Sync {
    async fn review(&self, query: AccessQuery) -> Result<AccessOutcome, AccessDecisionError>;
}

/// Answers [`AccessQuery`]s by creating `SubjectAccessReview`s.
#[derive(Clone)]
pub struct SubjectAccessReviewClient {
    client: Client,
}

impl Debug for SubjectAccessReviewClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectAccessReviewClient").finish_non_exhaustive()
    }
}

impl SubjectAccessReviewClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessDecision for SubjectAccessReviewClient {
    #[tracing::instrument(skip(self), fields(user.name = %query.user))]
    async fn review(&self, query: AccessQuery) -> Result<AccessOutcome, AccessDecisionError> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview::from(&query);

        let created = api
            .create(&PostParams::default(), &review)
            .await
            .with_context(|_| CreateSubjectAccessReviewSnafu {
                verb: query.verb.clone(),
                resource: query.resource_display(),
            })?;

        let status = created.status.ok_or_else(|| AccessDecisionError::MissingStatus {
            verb: query.verb.clone(),
            resource: query.resource_display(),
        })?;

        tracing::debug!(allowed = status.allowed, "received access decision");
        Ok(status.into())
    }
}
