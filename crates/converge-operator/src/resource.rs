//! NewResource CRD

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NewResource spec. Free-form: any fields are accepted and preserved.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "new.mastering-k8s.io",
    version = "v1alpha1",
    kind = "NewResource",
    plural = "newresources",
    namespaced = true,
    status = "NewResourceStatus",
    printcolumn = r#"{"name":"Observed", "type":"integer", "jsonPath":".status.observedGeneration"}"#
)]
pub struct NewResourceSpec {
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl JsonSchema for NewResourceSpec {
    fn schema_name() -> String {
        "NewResourceSpec".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        };
        schema.extensions.insert(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        );
        Schema::Object(schema)
    }
}

/// NewResource status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewResourceStatus {
    /// Last `metadata.generation` the controller has processed
    pub observed_generation: Option<i64>,
}

impl NewResource {
    /// Whether the current generation has already been processed.
    pub fn is_observed(&self) -> bool {
        match (self.metadata.generation, self.status.as_ref()) {
            (Some(generation), Some(status)) => status.observed_generation == Some(generation),
            (None, _) => true,
            _ => false,
        }
    }
}
