//! DefinitionRevision: immutable numbered snapshot of a definition's spec.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ApiResource;
use serde::{Deserialize, Serialize};

use crate::client::Object;
use crate::definition::{oam_resource, ComponentDefinition, Revision};

pub const DEFINITION_TYPE_COMPONENT: &str = "Component";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionRevision {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DefinitionRevisionSpec,
}

/// Spec-bearing fields. Never rewritten once the revision exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRevisionSpec {
    pub revision: i64,
    pub revision_hash: String,
    #[serde(default)]
    pub definition_type: String,
    #[serde(default)]
    pub component_definition: ComponentDefinition,
}

impl DefinitionRevision {
    /// `<definition>-v<revision>`
    pub fn revision_name(definition: &str, revision: i64) -> String {
        format!("{}-v{}", definition, revision)
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }

    pub fn revision(&self) -> i64 { self.spec.revision }

    /// Status pointer for this revision.
    pub fn to_revision_ref(&self) -> Revision {
        Revision {
            name: self.name().to_string(),
            revision: self.spec.revision,
            revision_hash: self.spec.revision_hash.clone(),
        }
    }

    /// Whether `status.latestRevision` of `def` already points at this revision.
    pub fn is_published_on(&self, def: &ComponentDefinition) -> bool {
        def.status.latest_revision.as_ref() == Some(&self.to_revision_ref())
    }
}

impl Object for DefinitionRevision {
    fn api_resource() -> ApiResource { oam_resource("DefinitionRevision", "definitionrevisions") }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_names_are_versioned() {
        assert_eq!(DefinitionRevision::revision_name("webservice", 3), "webservice-v3");
    }

    #[test]
    fn published_requires_matching_name_number_and_hash() {
        let mut rev = DefinitionRevision::default();
        rev.metadata.name = Some("d1-v1".into());
        rev.spec.revision = 1;
        rev.spec.revision_hash = "h1".into();
        let mut def = ComponentDefinition::new("ns", "d1", Default::default());
        assert!(!rev.is_published_on(&def));
        def.status.latest_revision = Some(rev.to_revision_ref());
        assert!(rev.is_published_on(&def));
        def.status.latest_revision.as_mut().unwrap().revision_hash = "h2".into();
        assert!(!rev.is_published_on(&def));
    }
}
