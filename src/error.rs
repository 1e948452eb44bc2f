//! Error taxonomy shared by every gate component.

use crate::authorize::DenialReason;
use crate::sandbox::Violation;

/// Every failure the gate can surface to the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("authorization denied for {class}: {reason}")]
    AuthorizationDenied { class: String, reason: DenialReason },

    #[error("predicate unresolvable: {0}")]
    PredicateUnresolvable(String),

    #[error("no method {method} on {class} or its ancestors")]
    DispatchTargetMissing { class: String, method: String },

    #[error("{class}.{method} failed: {source:#}")]
    InvocationFailed {
        class: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0}")]
    SandboxViolation(Violation),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bad arguments for {class}.{method}: {detail}")]
    BadArguments {
        class: String,
        method: String,
        detail: String,
    },

    #[error("access denied to {class}.{method}")]
    AccessDenied { class: String, method: String },

    #[error("reflection failure: {0}")]
    Reflection(String),

    #[error("malformed blob: {0}")]
    BlobMalformed(String),

    #[error("isolation unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("isolated evaluation failed: {0}")]
    IsolatedFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Unwraps a callee failure into the error the callee raised. Other
    /// failures are returned as-is.
    pub fn into_callee_error(self) -> anyhow::Error {
        match self {
            GateError::InvocationFailed { source, .. } => source,
            other => anyhow::Error::new(other),
        }
    }

    pub fn is_sandbox_violation(&self) -> bool {
        matches!(self, GateError::SandboxViolation(_))
    }

    pub fn client_status(&self) -> ClientStatus {
        match self {
            GateError::AuthorizationDenied { .. }
            | GateError::AccessDenied { .. }
            | GateError::SandboxViolation(_) => ClientStatus::Forbidden,
            GateError::PredicateUnresolvable(_) => ClientStatus::UnknownPredicate,
            GateError::DispatchTargetMissing { .. } => ClientStatus::NotFound,
            GateError::InvalidArgument(_)
            | GateError::BadArguments { .. }
            | GateError::BlobMalformed(_) => ClientStatus::BadRequest,
            GateError::InvocationFailed { .. } => ClientStatus::CalleeFailed,
            GateError::Reflection(_)
            | GateError::IsolationUnavailable(_)
            | GateError::IsolatedFailure(_)
            | GateError::Io(_) => ClientStatus::Internal,
        }
    }

    /// Message for the remote client. Callee failures report the callee's
    /// own message rather than the dispatcher wrapper.
    pub fn client_message(&self) -> String {
        match self {
            GateError::InvocationFailed { source, .. } => format!("{source:#}"),
            other => other.to_string(),
        }
    }
}

/// Client-visible outcome class for a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    Forbidden,
    /// Client and server disagree on a predicate type.
    UnknownPredicate,
    NotFound,
    BadRequest,
    CalleeFailed,
    Internal,
}

impl ClientStatus {
    pub fn http_code(self) -> u16 {
        match self {
            ClientStatus::Forbidden => 403,
            ClientStatus::UnknownPredicate => 422,
            ClientStatus::NotFound => 404,
            ClientStatus::BadRequest => 400,
            ClientStatus::CalleeFailed => 500,
            ClientStatus::Internal => 500,
        }
    }
}
