use std::time::Duration;

pub mod config_map;
pub mod gateway;
pub mod readiness_gate;
mod status;

const RECONCILE_LONG_WAIT: Duration = Duration::from_secs(3600);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    InvalidPayload(String),
    ImagePullSecretFailed(String),
    ServiceReconcileFailed(String),
    MonitoringReconcileFailed(String),
    RbacFailed(String),
    WorkloadReconcileFailed(String),
    StatusPatchFailed(String),
    RoutesNotPushed(String),
    RestartFailed(Vec<String>),
    StateUnavailable,
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ControllerError {
    /// Stable identifier used as the status reason.
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::InvalidPayload(_) => "InvalidPayload",
            ControllerError::ImagePullSecretFailed(_) => "ImagePullSecretFailed",
            ControllerError::ServiceReconcileFailed(_) => "ServiceReconcileFailed",
            ControllerError::MonitoringReconcileFailed(_) => "MonitoringReconcileFailed",
            ControllerError::RbacFailed(_) => "RbacFailed",
            ControllerError::WorkloadReconcileFailed(_) => "WorkloadReconcileFailed",
            ControllerError::StatusPatchFailed(_) => "StatusPatchFailed",
            ControllerError::RoutesNotPushed(_) => "RoutesNotPushed",
            ControllerError::RestartFailed(_) => "RestartFailed",
            ControllerError::StateUnavailable => "StateUnavailable",
        }
    }
}

impl From<crate::common::StorageError> for ControllerError {
    fn from(_: crate::common::StorageError) -> Self {
        ControllerError::StateUnavailable
    }
}
