//! Workload schematics, the artifact discriminator and the converted WorkloadDefinition.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ApiResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::client::Object;
use crate::definition::{oam_resource, ComponentDefinition, ComponentDefinitionSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmSchematic {
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub release: Json,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub repository: Json,
}

/// Raw-manifest schematic: a template object plus parameters patched into it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeSchematic {
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub template: Json,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<KubeParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeParameter {
    pub name: String,
    /// One of `string`, `number`, `boolean`.
    #[serde(rename = "type", default = "default_parameter_type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_parameter_type() -> String { "string".to_string() }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformSchematic {
    #[serde(default)]
    pub configuration: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

/// Discriminator selecting which artifact a materialization produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadType {
    /// Component carries its own workload (CUE or no schematic); no artifact.
    Component,
    /// Points at an existing WorkloadDefinition through `spec.workload.type`.
    Reference,
    Helm,
    Kube,
    Terraform,
}

impl WorkloadType {
    /// Resolve the discriminator from a spec.
    ///
    /// A schematic variant wins over `workload.type`; among schematic variants
    /// Terraform beats Kube beats Helm. Without one, a non-empty `workload.type`
    /// means Reference, otherwise Component.
    pub fn of(spec: &ComponentDefinitionSpec) -> Self {
        let schematic = spec.schematic.as_ref();
        if schematic.map_or(false, |s| s.terraform.is_some()) {
            WorkloadType::Terraform
        } else if schematic.map_or(false, |s| s.kube.is_some()) {
            WorkloadType::Kube
        } else if schematic.map_or(false, |s| s.helm.is_some()) {
            WorkloadType::Helm
        } else if !spec.workload.type_.is_empty() {
            WorkloadType::Reference
        } else {
            WorkloadType::Component
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Component => "ComponentDef",
            WorkloadType::Reference => "ReferWorkload",
            WorkloadType::Helm => "HelmDef",
            WorkloadType::Kube => "KubeDef",
            WorkloadType::Terraform => "TerraformDef",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArtifactError {
    #[error("workload type {ty} requires spec.{field}, which is not set")]
    Missing { ty: WorkloadType, field: &'static str },
}

/// The concrete workload descriptor derived from a definition; one variant per pass.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadArtifact {
    Reference { workload_definition: String },
    Helm(HelmSchematic),
    Kube(KubeSchematic),
    Terraform(TerraformSchematic),
}

impl WorkloadArtifact {
    pub fn select(ty: WorkloadType, def: &ComponentDefinition) -> Result<Option<Self>, ArtifactError> {
        let schematic = def.spec.schematic.as_ref();
        let artifact = match ty {
            WorkloadType::Component => return Ok(None),
            WorkloadType::Reference => {
                if def.spec.workload.type_.is_empty() {
                    return Err(ArtifactError::Missing { ty, field: "workload.type" });
                }
                WorkloadArtifact::Reference { workload_definition: def.spec.workload.type_.clone() }
            }
            WorkloadType::Helm => WorkloadArtifact::Helm(
                schematic.and_then(|s| s.helm.clone()).ok_or(ArtifactError::Missing { ty, field: "schematic.helm" })?,
            ),
            WorkloadType::Kube => WorkloadArtifact::Kube(
                schematic.and_then(|s| s.kube.clone()).ok_or(ArtifactError::Missing { ty, field: "schematic.kube" })?,
            ),
            WorkloadType::Terraform => WorkloadArtifact::Terraform(
                schematic.and_then(|s| s.terraform.clone()).ok_or(ArtifactError::Missing { ty, field: "schematic.terraform" })?,
            ),
        };
        Ok(Some(artifact))
    }
}

/// A definition together with its resolved workload type and artifact, as handed
/// to the schema store.
#[derive(Debug, Clone)]
pub struct Capability {
    pub definition: ComponentDefinition,
    pub workload_type: WorkloadType,
    pub artifact: Option<WorkloadArtifact>,
}

impl Capability {
    pub fn name(&self) -> &str { self.definition.name() }
}

/// Converted workload descriptor generated for components declaring their own workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadDefinitionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDefinitionSpec {
    #[serde(default)]
    pub definition_ref: DefinitionReference,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

/// `<plural>.<group>` plus version of the referenced resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl Object for WorkloadDefinition {
    fn api_resource() -> ApiResource { oam_resource("WorkloadDefinition", "workloaddefinitions") }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Schematic;

    fn spec(ty: &str, schematic: Option<Schematic>) -> ComponentDefinitionSpec {
        let mut s = ComponentDefinitionSpec::default();
        s.workload.type_ = ty.to_string();
        s.schematic = schematic;
        s
    }

    #[test]
    fn schematic_wins_over_workload_type() {
        let helm = Schematic { helm: Some(HelmSchematic::default()), ..Default::default() };
        assert_eq!(WorkloadType::of(&spec("deployments.apps", Some(helm))), WorkloadType::Helm);
        assert_eq!(WorkloadType::of(&spec("deployments.apps", None)), WorkloadType::Reference);
        assert_eq!(WorkloadType::of(&spec("", None)), WorkloadType::Component);
        let cue = Schematic { cue: Some(serde_json::json!({"template": ""})), ..Default::default() };
        assert_eq!(WorkloadType::of(&spec("deployments.apps", Some(cue.clone()))), WorkloadType::Reference);
        assert_eq!(WorkloadType::of(&spec("", Some(cue))), WorkloadType::Component);
    }

    #[test]
    fn terraform_beats_kube_beats_helm() {
        let all = Schematic {
            helm: Some(HelmSchematic::default()),
            kube: Some(KubeSchematic::default()),
            terraform: Some(TerraformSchematic::default()),
            cue: None,
        };
        assert_eq!(WorkloadType::of(&spec("", Some(all.clone()))), WorkloadType::Terraform);
        let no_tf = Schematic { terraform: None, ..all };
        assert_eq!(WorkloadType::of(&spec("", Some(no_tf))), WorkloadType::Kube);
    }

    #[test]
    fn select_populates_exactly_the_matching_variant() {
        let kube = KubeSchematic { template: serde_json::json!({"kind": "Deployment"}), parameters: vec![] };
        let def = ComponentDefinition::new(
            "ns",
            "raw",
            spec("", Some(Schematic { kube: Some(kube.clone()), ..Default::default() })),
        );
        let ty = WorkloadType::of(&def.spec);
        assert_eq!(WorkloadArtifact::select(ty, &def).unwrap(), Some(WorkloadArtifact::Kube(kube)));
        assert_eq!(WorkloadArtifact::select(WorkloadType::Component, &def).unwrap(), None);
    }

    #[test]
    fn select_rejects_discriminator_without_payload() {
        let def = ComponentDefinition::new("ns", "x", spec("", None));
        let err = WorkloadArtifact::select(WorkloadType::Helm, &def).unwrap_err();
        assert_eq!(err, ArtifactError::Missing { ty: WorkloadType::Helm, field: "schematic.helm" });
        assert!(WorkloadArtifact::select(WorkloadType::Reference, &def).is_err());
    }

    #[test]
    fn kube_parameter_type_defaults_to_string() {
        let p: KubeParameter = serde_json::from_value(serde_json::json!({"name": "image"})).unwrap();
        assert_eq!(p.type_, "string");
    }
}
