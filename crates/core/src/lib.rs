//! Defrev core types: ComponentDefinition, DefinitionRevision and the seams the controller consumes.

#![forbid(unsafe_code)]

pub mod client;
pub mod definition;
pub mod ports;
pub mod revision;
pub mod workload;

pub use client::{from_dynamic, to_dynamic, ClientError, LabelSelector, Object, ObjectKey, ResourceClient};
pub use definition::{
    ComponentDefinition, ComponentDefinitionSpec, ComponentDefinitionStatus, Condition, Revision, Schematic,
    WorkloadGvk, WorkloadTypeDescriptor, LABEL_COMPONENT_DEFINITION_NAME,
};
pub use ports::{DiscoveryRefresher, EventRecorder, ResourceMapping, RevisionGenerator, SchemaStore, WorkloadMaterializer};
pub use revision::{DefinitionRevision, DefinitionRevisionSpec};
pub use workload::{
    ArtifactError, Capability, DefinitionReference, HelmSchematic, KubeParameter, KubeSchematic, TerraformSchematic,
    WorkloadArtifact, WorkloadDefinition, WorkloadDefinitionSpec, WorkloadType,
};

pub mod prelude {
    pub use super::{
        ClientError, ComponentDefinition, DefinitionRevision, LabelSelector, Object, ObjectKey, ResourceClient,
        WorkloadArtifact, WorkloadType,
    };
}

// ---- well-known kinds outside the OAM group ----

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ApiResource;

impl Object for ConfigMap {
    fn api_resource() -> ApiResource { ApiResource::erase::<ConfigMap>(&()) }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

impl Object for CustomResourceDefinition {
    fn api_resource() -> ApiResource { ApiResource::erase::<CustomResourceDefinition>(&()) }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}
