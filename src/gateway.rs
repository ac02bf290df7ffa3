use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// External channel operation failures.
///
/// Transient failures (timeouts, transport) are retried on the next sweep;
/// terminal failures are not worth re-attempting for the same record.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("channel operation timed out")]
    Timeout,

    #[error("channel transport error: {0}")]
    Transport(String),

    #[error("channel permission denied")]
    Denied,

    #[error("channel resource not found")]
    NotFound,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// Handle returned by a successful admission, e.g. an invite reference on
/// the external channel.
#[derive(Clone, Debug, Serialize)]
pub struct InviteHandle {
    pub subject_id: String,
    pub reference: String,
}

/// The external resource the engine grants and revokes access on.
///
/// Implementations must bound every call with a timeout (a timed-out call
/// maps to [`GatewayError::Timeout`]) and must be safe to retry: granting an
/// already-granted subject or revoking an already-revoked one is not an
/// error.
pub trait ChannelGateway: Send + Sync {
    fn grant(&self, subject_id: &str) -> Result<(), GatewayError>;
    fn revoke(&self, subject_id: &str) -> Result<(), GatewayError>;
    fn admit(&self, subject_id: &str) -> Result<InviteHandle, GatewayError>;
}

/// Gateway that logs every call and succeeds, for the development sweeper
/// and dry runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunGateway;

impl ChannelGateway for DryRunGateway {
    fn grant(&self, subject_id: &str) -> Result<(), GatewayError> {
        info!(subject_id, "dry-run grant");
        Ok(())
    }

    fn revoke(&self, subject_id: &str) -> Result<(), GatewayError> {
        info!(subject_id, "dry-run revoke");
        Ok(())
    }

    fn admit(&self, subject_id: &str) -> Result<InviteHandle, GatewayError> {
        info!(subject_id, "dry-run admit");
        Ok(InviteHandle {
            subject_id: subject_id.to_string(),
            reference: "dry-run".to_string(),
        })
    }
}
