//! Helpers to build admission responses and to verify them before they are sent.
use kube::core::{
    DynamicObject, Status,
    admission::{AdmissionRequest, AdmissionResponse},
};
use snafu::{Snafu, ensure};

use super::registry::AdmissionKind;

/// Machine readable reason of a denial, returned to the API server as part of the status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DenialReason {
    /// The object violates an invariant, e.g. an immutable annotation was changed.
    Invalid,

    /// The requesting user lacks a permission.
    Unauthorized,
}

/// A negative admission decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denial {
    pub code: u16,
    pub reason: DenialReason,
    pub message: String,
}

impl Denial {
    /// The request is semantically invalid, answered with 422.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: 422,
            reason: DenialReason::Invalid,
            message: message.into(),
        }
    }

    /// The user lacks a permission, answered with the given `code` (401 or 403).
    pub fn unauthorized(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: DenialReason::Unauthorized,
            message: message.into(),
        }
    }
}

/// Allows the request without modifications.
pub fn allowed(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    AdmissionResponse::from(request)
}

/// Denies the request with the status described by `denial`.
pub fn denied(request: &AdmissionRequest<DynamicObject>, denial: Denial) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(denial.message.clone());

    let mut status = Status::failure(&denial.message, &denial.reason.to_string());
    status.code = denial.code;
    response.result = status;

    response
}

/// Responds to the request with `denial` if there is one, otherwise allows it.
pub fn from_decision(
    request: &AdmissionRequest<DynamicObject>,
    denial: Option<Denial>,
) -> AdmissionResponse {
    match denial {
        Some(denial) => denied(request, denial),
        None => allowed(request),
    }
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum InvariantViolation {
    #[snafu(display("denials must carry a message"))]
    DenialWithoutMessage,

    #[snafu(display("denials must not carry a patch"))]
    DenialWithPatch,

    #[snafu(display("validating handlers must not return a patch"))]
    ValidationWithPatch,

    #[snafu(display("the response uid {response:?} does not match the request uid {request:?}"))]
    UidMismatch { request: String, response: String },
}

/// Verifies the invariants every admission response has to uphold.
pub fn check_invariants(
    kind: AdmissionKind,
    request: &AdmissionRequest<DynamicObject>,
    response: &AdmissionResponse,
) -> Result<(), InvariantViolation> {
    ensure!(
        response.uid == request.uid,
        UidMismatchSnafu {
            request: request.uid.clone(),
            response: response.uid.clone(),
        }
    );

    if !response.allowed {
        ensure!(!response.result.message.is_empty(), DenialWithoutMessageSnafu);
        ensure!(response.patch.is_none(), DenialWithPatchSnafu);
    }

    if kind == AdmissionKind::Validating {
        ensure!(response.patch.is_none(), ValidationWithPatchSnafu);
    }

    Ok(())
}
