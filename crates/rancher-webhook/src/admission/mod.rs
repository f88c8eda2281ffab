//! The admission dispatcher and the HTTP routes it is served on.
//!
//! Every admission review received on the validation or mutation path is decoded, routed to
//! the handler registered for the requested resource and operation, and the handler's decision
//! is verified and sent back as an admission review of the same API version.
use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use kube::core::{
    DynamicObject,
    admission::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
        Operation,
    },
};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use crate::{
    constants::{MUTATION_PATH, VALIDATION_PATH},
    options::WebhookOptions,
    resources::AdmitError,
};

pub mod registry;
pub mod response;
pub mod trace;

use registry::{AdmissionKind, DryRunPolicy, HandlerRegistry};
use response::InvariantViolation;
use trace::SlowTrace;

#[derive(Debug, Snafu)]
pub enum DispatchError {
    #[snafu(display("failed to decode admission review"))]
    DecodeReview { source: serde_json::Error },

    #[snafu(display("failed to convert admission review into a request"))]
    ConvertReview { source: ConvertAdmissionReviewError },

    #[snafu(display("no {kind} handler registered for {resource} and operation {operation:?}"))]
    NoHandler {
        kind: AdmissionKind,
        resource: String,
        operation: Operation,
    },

    #[snafu(display("{kind} handler {handler:?} failed to decide"))]
    Handler {
        source: AdmitError,
        kind: AdmissionKind,
        handler: &'static str,
    },

    #[snafu(display("{kind} handler {handler:?} did not decide within {timeout:?}"))]
    Timeout {
        source: tokio::time::error::Elapsed,
        kind: AdmissionKind,
        handler: &'static str,
        timeout: Duration,
    },

    #[snafu(display("{kind} handler {handler:?} returned an invalid response"))]
    InvalidResponse {
        source: InvariantViolation,
        kind: AdmissionKind,
        handler: &'static str,
    },
}

impl DispatchError {
    /// Malformed reviews are the caller's fault, everything else is ours.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DecodeReview { .. } | Self::ConvertReview { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::NoHandler { .. }
            | Self::Handler { .. }
            | Self::Timeout { .. }
            | Self::InvalidResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        tracing::error!(
            error = &self as &dyn std::error::Error,
            http.response.status_code = status_code.as_u16(),
            "failed to dispatch admission review"
        );

        (status_code, self.to_string()).into_response()
    }
}

/// Routes admission requests to the registered handlers.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    slow_admission_threshold: Duration,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, options: &WebhookOptions) -> Self {
        Self {
            registry,
            slow_admission_threshold: options.slow_admission_threshold,
            default_timeout: options.admission_timeout,
        }
    }

    /// Decodes the admission review in `body`, decides on it and returns the review to respond
    /// with. Without a `timeout` the configured default deadline is used.
    pub async fn dispatch(
        &self,
        kind: AdmissionKind,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<AdmissionReview<DynamicObject>, DispatchError> {
        let review: AdmissionReview<DynamicObject> =
            serde_json::from_slice(body).context(DecodeReviewSnafu)?;
        let request: AdmissionRequest<DynamicObject> =
            review.try_into().context(ConvertReviewSnafu)?;

        let response = self
            .admit(kind, &request, timeout.unwrap_or(self.default_timeout))
            .await?;

        Ok(response.into_review())
    }

    #[instrument(
        name = "admit",
        skip_all,
        fields(
            admission.kind = %kind,
            admission.uid = %request.uid,
            k8s.resource = %request.resource.resource,
            k8s.operation = ?request.operation,
            user.name = request.user_info.username.as_deref().unwrap_or_default(),
        )
    )]
    pub async fn admit(
        &self,
        kind: AdmissionKind,
        request: &AdmissionRequest<DynamicObject>,
        timeout: Duration,
    ) -> Result<AdmissionResponse, DispatchError> {
        let handler = self
            .registry
            .resolve(kind, &request.resource, &request.operation)
            .with_context(|| NoHandlerSnafu {
                kind,
                resource: format!(
                    "{}/{}/{}",
                    request.resource.group, request.resource.version, request.resource.resource
                ),
                operation: request.operation.clone(),
            })?;
        let descriptor = handler.descriptor();

        if request.dry_run && descriptor.dry_run == DryRunPolicy::Allow {
            tracing::debug!(handler = descriptor.name, "allowing dry-run request");
            return Ok(response::allowed(request));
        }

        let user = request.user_info.username.clone().unwrap_or_default();
        let _trace = SlowTrace::start(descriptor.name, user, self.slow_admission_threshold);

        let response = tokio::time::timeout(timeout, handler.admit(request))
            .await
            .context(TimeoutSnafu {
                kind,
                handler: descriptor.name,
                timeout,
            })?
            .context(HandlerSnafu {
                kind,
                handler: descriptor.name,
            })?;

        response::check_invariants(kind, request, &response).context(InvalidResponseSnafu {
            kind,
            handler: descriptor.name,
        })?;

        tracing::debug!(
            handler = descriptor.name,
            allowed = response.allowed,
            patched = response.patch.is_some(),
            "admission decided"
        );

        Ok(response)
    }
}

/// Query parameters the API server appends to the webhook URL.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    /// The deadline of the call, for example `10s`.
    pub timeout: Option<String>,
}

impl AdmissionParams {
    fn timeout(&self) -> Option<Duration> {
        let timeout = self.timeout.as_deref()?;

        humantime::parse_duration(timeout)
            .inspect_err(|err| {
                tracing::debug!(%err, timeout, "ignoring unparsable admission timeout");
            })
            .ok()
    }
}

/// Creates the router serving the validation and mutation paths.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route(VALIDATION_PATH, post(validate))
        .route(MUTATION_PATH, post(mutate))
        .with_state(dispatcher)
}

async fn validate(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<AdmissionParams>,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, DispatchError> {
    dispatcher
        .dispatch(AdmissionKind::Validating, &body, params.timeout())
        .await
        .map(Json)
}

async fn mutate(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<AdmissionParams>,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, DispatchError> {
    dispatcher
        .dispatch(AdmissionKind::Mutating, &body, params.timeout())
        .await
        .map(Json)
}
