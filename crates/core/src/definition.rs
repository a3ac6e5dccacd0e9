//! ComponentDefinition: the user-authored object driving the controller.

use std::collections::BTreeMap;

use chrono::SubsecRound;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::client::{LabelSelector, Object};
use crate::workload::{HelmSchematic, KubeSchematic, TerraformSchematic};

pub const GROUP: &str = "core.oam.dev";
pub const VERSION: &str = "v1beta1";

/// Back-reference label carried by every DefinitionRevision.
pub const LABEL_COMPONENT_DEFINITION_NAME: &str = "componentdefinition.oam.dev/name";

pub const CONDITION_SYNCED: &str = "Synced";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";

pub(crate) fn oam_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, kind), plural)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ComponentDefinitionSpec,
    #[serde(default)]
    pub status: ComponentDefinitionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    #[serde(default)]
    pub workload: WorkloadTypeDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
    /// Remaining spec fields (childResourceKinds, podSpecPath, extension, ...),
    /// opaque here but part of the revision hash.
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTypeDescriptor {
    /// Name of an existing WorkloadDefinition; empty when the component declares
    /// its own workload through `definition`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkloadGvk>,
}

/// apiVersion/kind of the custom type a component produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGvk {
    pub api_version: String,
    pub kind: String,
}

impl WorkloadGvk {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Split apiVersion into (group, version); core types have an empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl std::fmt::Display for WorkloadGvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schematic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSchematic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube: Option<KubeSchematic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform: Option<TerraformSchematic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Pointer to a DefinitionRevision published in status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub name: String,
    pub revision: i64,
    pub revision_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Current time at the second precision `Time` serializes with.
fn now() -> Time { Time(chrono::Utc::now().trunc_subsecs(0)) }

impl Condition {
    /// `Synced=False` carrying the failure text.
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self {
            type_: CONDITION_SYNCED.into(),
            status: "False".into(),
            reason: REASON_RECONCILE_ERROR.into(),
            message: message.into(),
            last_transition_time: Some(now()),
        }
    }

    pub fn reconcile_success() -> Self {
        Self {
            type_: CONDITION_SYNCED.into(),
            status: "True".into(),
            reason: REASON_RECONCILE_SUCCESS.into(),
            message: String::new(),
            last_transition_time: Some(now()),
        }
    }

    /// Same condition ignoring the transition time.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_ && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

impl ComponentDefinitionStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replace the condition of the same type; an equal condition keeps its
    /// original transition time.
    pub fn set_condition(&mut self, cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) if existing.same_as(&cond) => {}
            Some(existing) => *existing = cond,
            None => self.conditions.push(cond),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.condition(CONDITION_SYNCED).map(|c| c.status == "True").unwrap_or(false)
    }
}

impl ComponentDefinition {
    pub fn new(namespace: &str, name: &str, spec: ComponentDefinitionSpec) -> Self {
        Self {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() },
            spec,
            status: ComponentDefinitionStatus::default(),
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or_default() }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn labels(&self) -> BTreeMap<String, String> { self.metadata.labels.clone().unwrap_or_default() }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.metadata.annotations.clone().unwrap_or_default() }

    /// Controller owner reference pointing at this definition (cascade delete).
    pub fn controller_owner_ref(&self) -> OwnerReference {
        let ar = Self::api_resource();
        OwnerReference {
            api_version: ar.api_version,
            kind: ar.kind,
            name: self.name().to_string(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn object_ref(&self) -> ObjectReference {
        let ar = Self::api_resource();
        ObjectReference {
            api_version: Some(ar.api_version),
            kind: Some(ar.kind),
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            uid: self.metadata.uid.clone(),
            resource_version: self.metadata.resource_version.clone(),
            ..Default::default()
        }
    }

    /// Selector matching every DefinitionRevision of this definition.
    pub fn revision_selector(&self) -> LabelSelector {
        LabelSelector::new().with(LABEL_COMPONENT_DEFINITION_NAME, self.name())
    }
}

impl Object for ComponentDefinition {
    fn api_resource() -> ApiResource { oam_resource("ComponentDefinition", "componentdefinitions") }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}
