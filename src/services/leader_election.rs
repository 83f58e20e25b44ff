//! Lease based leader election.
//!
//! Writes go through `replace` carrying the observed resourceVersion, so two
//! candidates racing for the same lease can never both win: the loser gets a
//! conflict and keeps waiting.

use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{DateTime, Utc},
};
use kube::{
    Api, Client,
    api::PostParams,
};
use kube_core::ObjectMeta;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::common::{ApiError, ApiErrorKind};

const LEASE_DURATION_SECONDS: i32 = 30;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    Retry,
    Lost,
}

/// Judges one renew round of the current holder. Errors are retried while the last
/// successful renewal still covers `now`.
pub fn renew_outcome(result: &Result<bool, ApiError>, last_renewed: DateTime<Utc>, now: DateTime<Utc>) -> RenewOutcome {
    match result {
        Ok(true) => RenewOutcome::Renewed,
        Ok(false) => RenewOutcome::Lost,
        Err(_) if now < last_renewed + k8s_openapi::chrono::Duration::seconds(i64::from(LEASE_DURATION_SECONDS)) => RenewOutcome::Retry,
        Err(_) => RenewOutcome::Lost,
    }
}

/// Decides what a candidate does given the current lease.
pub fn next_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let holder = spec.and_then(|s| s.holder_identity.as_deref()).filter(|h| !h.is_empty());
    let expired = match (holder, renew_time, duration) {
        (Some(_), Some(MicroTime(renewed)), Some(duration)) => now > *renewed + k8s_openapi::chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver { transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1 }
    } else {
        LeaseAction::Wait
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), lease_name: lease_name.to_owned(), identity: identity.to_owned() }
    }

    fn lease(&self, now: DateTime<Utc>, resource_version: Option<String>, transitions: i32, acquired: Option<MicroTime>) -> Lease {
        Lease {
            metadata: ObjectMeta { name: Some(self.lease_name.clone()), resource_version, ..Default::default() },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(acquired.unwrap_or(MicroTime(now))),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// One compare-and-swap round. `Ok(true)` when this candidate holds the lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool, ApiError> {
        let now = Utc::now();
        let existing = match self.api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                let e = ApiError::from(e);
                if e.is_not_found() {
                    None
                } else {
                    return Err(e);
                }
            },
        };

        let params = PostParams::default();
        let result = match next_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => self.api.create(&params, &self.lease(now, None, 0, None)).await,
            LeaseAction::Renew => {
                let existing = existing.as_ref();
                let version = existing.and_then(|l| l.metadata.resource_version.clone());
                let spec = existing.and_then(|l| l.spec.as_ref());
                let lease = self.lease(now, version, spec.and_then(|s| s.lease_transitions).unwrap_or(0), spec.and_then(|s| s.acquire_time.clone()));
                self.api.replace(&self.lease_name, &params, &lease).await
            },
            LeaseAction::TakeOver { transitions } => {
                let version = existing.as_ref().and_then(|l| l.metadata.resource_version.clone());
                self.api.replace(&self.lease_name, &params, &self.lease(now, version, transitions, None)).await
            },
        };

        match result.map_err(ApiError::from) {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ApiErrorKind::Conflict => {
                debug!("Lease {} changed under {}", self.lease_name, self.identity);
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// Waits until the lease is acquired, then keeps renewing it in the background.
    /// The returned receiver fires once the lease is lost.
    pub async fn acquire(self) -> oneshot::Receiver<()> {
        info!("Waiting for leadership {} {}", self.lease_name, self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => debug!("Lease {} held by another candidate", self.lease_name),
                Err(e) => warn!("Unable to acquire lease {} {e}", self.lease_name),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        info!("Leadership acquired {} {}", self.lease_name, self.identity);

        let (lost_sender, lost_receiver) = oneshot::channel();
        tokio::spawn(async move {
            let mut last_renewed = Utc::now();
            let mut wait = RENEW_INTERVAL;
            loop {
                tokio::time::sleep(wait).await;
                let result = self.try_acquire_or_renew().await;
                match renew_outcome(&result, last_renewed, Utc::now()) {
                    RenewOutcome::Renewed => {
                        last_renewed = Utc::now();
                        wait = RENEW_INTERVAL;
                    },
                    RenewOutcome::Retry => {
                        if let Err(e) = result {
                            warn!("Unable to renew lease {} {e}", self.lease_name);
                        }
                        wait = RETRY_INTERVAL;
                    },
                    RenewOutcome::Lost => {
                        warn!("Leadership lost {} {}", self.lease_name, self.identity);
                        let _ = lost_sender.send(());
                        return;
                    },
                }
            }
        });
        lost_receiver
    }
}
