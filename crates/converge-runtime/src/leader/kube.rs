//! Lease store backed by `coordination.k8s.io/v1` Lease objects.

use std::time::Duration;

use ::kube::api::{Api, PostParams};
use ::kube::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease as LeaseObject, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};

use super::lease::{Lease, LeaseError, LeaseStore, StoredLease};

const STATUS_CONFLICT: u16 = 409;

/// Reads and writes Lease objects in one namespace. Updates are `replace`
/// calls carrying the expected `resourceVersion`, so the API server rejects
/// them with 409 if anyone wrote in between.
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<LeaseObject>,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn is_conflict(error: &::kube::Error) -> bool {
    matches!(error, ::kube::Error::Api(response) if response.code == STATUS_CONFLICT)
}

fn to_object(name: &str, lease: &Lease, resource_version: Option<&str>) -> LeaseObject {
    LeaseObject {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: resource_version.map(str::to_string),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: lease.holder.clone(),
            lease_duration_seconds: Some(
                i32::try_from(lease.duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(lease.acquired_at)),
            renew_time: Some(MicroTime(lease.renewed_at)),
            lease_transitions: Some(i32::try_from(lease.transitions).unwrap_or(i32::MAX)),
            ..Default::default()
        }),
    }
}

/// Missing timestamps read as the epoch, so an incomplete record counts as expired.
fn from_object(object: LeaseObject) -> Result<StoredLease, LeaseError> {
    let version = object
        .metadata
        .resource_version
        .ok_or_else(|| LeaseError::Store("lease has no resourceVersion".to_string()))?;
    let spec = object.spec.unwrap_or_default();
    let epoch = DateTime::<Utc>::UNIX_EPOCH;

    Ok(StoredLease {
        lease: Lease {
            holder: spec.holder_identity.filter(|holder| !holder.is_empty()),
            acquired_at: spec.acquire_time.map(|t| t.0).unwrap_or(epoch),
            renewed_at: spec.renew_time.map(|t| t.0).unwrap_or(epoch),
            duration: Duration::from_secs(
                spec.lease_duration_seconds
                    .and_then(|secs| u64::try_from(secs).ok())
                    .unwrap_or(0),
            ),
            transitions: spec
                .lease_transitions
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
        },
        version,
    })
}

fn map_write(result: Result<LeaseObject, ::kube::Error>) -> Result<StoredLease, LeaseError> {
    match result {
        Ok(object) => from_object(object),
        Err(e) if is_conflict(&e) => Err(LeaseError::Conflict),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<StoredLease>, LeaseError> {
        self.api.get_opt(name).await?.map(from_object).transpose()
    }

    async fn create(&self, name: &str, lease: &Lease) -> Result<StoredLease, LeaseError> {
        let object = to_object(name, lease, None);
        map_write(self.api.create(&PostParams::default(), &object).await)
    }

    async fn update(
        &self,
        name: &str,
        lease: &Lease,
        expected_version: &str,
    ) -> Result<StoredLease, LeaseError> {
        let object = to_object(name, lease, Some(expected_version));
        map_write(self.api.replace(name, &PostParams::default(), &object).await)
    }
}
