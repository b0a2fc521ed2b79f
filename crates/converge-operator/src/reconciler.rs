//! NewResource reconciler
//!
//! Records the processed generation in `status.observedGeneration`. The
//! status write carries the object's `resourceVersion`, so a write based on
//! a stale read fails with a conflict and is retried against fresh state.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use converge_runtime::{Action, ReconcileError, ReconcileResult, Reconciler, ResourceKey};

use crate::resource::NewResource;

const STATUS_NOT_FOUND: u16 = 404;
const STATUS_CONFLICT: u16 = 409;

/// Writes NewResource status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Set `status.observedGeneration`, conditional on `resource_version`.
    async fn write_observed_generation(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        generation: i64,
    ) -> Result<(), kube::Error>;
}

/// [`StatusWriter`] using the status subresource.
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_observed_generation(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        generation: i64,
    ) -> Result<(), kube::Error> {
        let api: Api<NewResource> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "observedGeneration": generation },
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Map an API error to its retry class.
pub fn classify(error: kube::Error) -> ReconcileError {
    match &error {
        kube::Error::Api(response) if response.code == STATUS_CONFLICT => {
            ReconcileError::Conflict(response.message.clone())
        }
        kube::Error::Api(response) if response.code == STATUS_NOT_FOUND => {
            ReconcileError::NotFound(response.message.clone())
        }
        _ => ReconcileError::transient(error),
    }
}

pub struct NewResourceReconciler<W> {
    status: W,
}

impl<W: StatusWriter> NewResourceReconciler<W> {
    pub fn new(status: W) -> Self {
        Self { status }
    }
}

#[async_trait]
impl<W: StatusWriter + 'static> Reconciler<NewResource> for NewResourceReconciler<W> {
    async fn reconcile(
        &self,
        key: &ResourceKey,
        object: Option<Arc<NewResource>>,
    ) -> ReconcileResult {
        let Some(resource) = object else {
            debug!("NewResource deleted, nothing to clean up");
            return Ok(Action::Done);
        };
        let Some(namespace) = key.namespace() else {
            return Err(ReconcileError::permanent("NewResource without a namespace"));
        };
        if resource.is_observed() {
            debug!("Generation already observed");
            return Ok(Action::Done);
        }
        let Some(generation) = resource.metadata.generation else {
            return Ok(Action::Done);
        };

        self.status
            .write_observed_generation(
                namespace,
                key.name(),
                resource.metadata.resource_version.clone(),
                generation,
            )
            .await
            .map_err(classify)?;

        info!(generation, "Observed new generation");
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{NewResourceSpec, NewResourceStatus};
    use kube::core::ErrorResponse;
    use mockall::predicate::eq;

    fn resource(generation: i64, observed: Option<i64>) -> Arc<NewResource> {
        let mut resource = NewResource::new("sample", NewResourceSpec::default());
        resource.metadata.namespace = Some("default".to_string());
        resource.metadata.generation = Some(generation);
        resource.metadata.resource_version = Some("100".to_string());
        resource.status = observed.map(|g| NewResourceStatus {
            observed_generation: Some(g),
        });
        Arc::new(resource)
    }

    fn key() -> ResourceKey {
        ResourceKey::namespaced("default", "sample")
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[tokio::test]
    async fn test_writes_new_generation() {
        let mut status = MockStatusWriter::new();
        status
            .expect_write_observed_generation()
            .with(
                eq("default"),
                eq("sample"),
                eq(Some("100".to_string())),
                eq(3),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let reconciler = NewResourceReconciler::new(status);
        let result = reconciler.reconcile(&key(), Some(resource(3, Some(2)))).await;
        assert_eq!(result.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn test_skips_observed_generation() {
        let mut status = MockStatusWriter::new();
        status.expect_write_observed_generation().never();

        let reconciler = NewResourceReconciler::new(status);
        let result = reconciler.reconcile(&key(), Some(resource(3, Some(3)))).await;
        assert_eq!(result.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn test_deleted_object_is_done() {
        let mut status = MockStatusWriter::new();
        status.expect_write_observed_generation().never();

        let reconciler = NewResourceReconciler::new(status);
        assert_eq!(reconciler.reconcile(&key(), None).await.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn test_api_errors_are_classified() {
        for (code, expected) in [(409, "conflict"), (404, "not_found"), (500, "transient")] {
            let mut status = MockStatusWriter::new();
            status
                .expect_write_observed_generation()
                .returning(move |_, _, _, _| Err(api_error(code)));

            let reconciler = NewResourceReconciler::new(status);
            let err = reconciler
                .reconcile(&key(), Some(resource(2, None)))
                .await
                .unwrap_err();
            let kind = match err {
                ReconcileError::Conflict(_) => "conflict",
                ReconcileError::NotFound(_) => "not_found",
                ReconcileError::Transient(_) => "transient",
                ReconcileError::Permanent(_) => "permanent",
            };
            assert_eq!(kind, expected, "status {code}");
        }
    }

    #[tokio::test]
    async fn test_cluster_scoped_key_is_permanent() {
        let status = MockStatusWriter::new();
        let reconciler = NewResourceReconciler::new(status);
        let err = reconciler
            .reconcile(&ResourceKey::cluster("sample"), Some(resource(2, None)))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Permanent(_)));
    }
}
