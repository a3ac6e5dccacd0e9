//! OpenAPI v3 schema derivation for capability parameters.

use defrev_core::KubeParameter;
use serde_json::{json, Map, Value as Json};

/// Schema used when parameters cannot be derived: any object is accepted.
pub fn permissive() -> Json {
    json!({ "type": "object", "x-kubernetes-preserve-unknown-fields": true })
}

/// Object schema from the parameters of a raw-manifest (Kube) schematic.
pub fn from_kube_parameters(params: &[KubeParameter]) -> Json {
    let mut properties = Map::new();
    let mut required: Vec<Json> = Vec::new();
    for p in params {
        let ty = match p.type_.as_str() {
            t @ ("string" | "number" | "boolean") => t,
            _ => "string",
        };
        let mut prop = Map::new();
        prop.insert("type".into(), Json::String(ty.to_string()));
        if let Some(desc) = p.description.as_deref().filter(|d| !d.is_empty()) {
            prop.insert("description".into(), Json::String(desc.to_string()));
        }
        properties.insert(p.name.clone(), Json::Object(prop));
        if p.required.unwrap_or(false) {
            required.push(Json::String(p.name.clone()));
        }
    }
    let mut schema = Map::new();
    schema.insert("type".into(), Json::String("object".into()));
    schema.insert("properties".into(), Json::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Json::Array(required));
    }
    Json::Object(schema)
}

/// Pick the CRD version to read the schema from: the requested version when it is
/// served, else the storage version, else the first served one.
fn pick_version<'a>(versions: &'a [Json], requested: &str) -> Option<&'a Json> {
    let is = |ver: &Json, field: &str| ver.get(field).and_then(|b| b.as_bool()).unwrap_or(false);
    let name_of = |ver: &Json| ver.get("name").and_then(|s| s.as_str()).unwrap_or("").to_string();
    versions
        .iter()
        .find(|ver| !requested.is_empty() && name_of(ver) == requested && is(ver, "served"))
        .or_else(|| versions.iter().find(|ver| is(ver, "storage")))
        .or_else(|| versions.iter().find(|ver| is(ver, "served")))
}

/// `openAPIV3Schema.properties.spec` of a CRD (as JSON) for the chosen version,
/// falling back to the legacy top-level `spec.validation` location.
pub fn crd_spec_schema(crd: &Json, requested_version: &str) -> Option<Json> {
    let versions = crd
        .get("spec")
        .and_then(|s| s.get("versions"))
        .and_then(|vv| vv.as_array())
        .cloned()
        .unwrap_or_default();
    let openapi = pick_version(&versions, requested_version)
        .and_then(|ver| ver.get("schema"))
        .and_then(|s| s.get("openAPIV3Schema"))
        .or_else(|| crd.get("spec").and_then(|s| s.get("validation")).and_then(|s| s.get("openAPIV3Schema")))?;
    openapi.get("properties").and_then(|p| p.get("spec")).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_parameters_become_properties() {
        let params = vec![
            KubeParameter {
                name: "image".into(),
                type_: "string".into(),
                field_paths: vec!["spec.template.spec.containers[0].image".into()],
                required: Some(true),
                description: Some("container image".into()),
            },
            KubeParameter { name: "replicas".into(), type_: "number".into(), ..Default::default() },
            KubeParameter { name: "weird".into(), type_: "duration".into(), ..Default::default() },
        ];
        let schema = from_kube_parameters(&params);
        assert_eq!(schema["properties"]["image"]["description"], "container image");
        assert_eq!(schema["properties"]["replicas"]["type"], "number");
        assert_eq!(schema["properties"]["weird"]["type"], "string");
        assert_eq!(schema["required"], json!(["image"]));
    }

    #[test]
    fn no_required_key_when_nothing_required() {
        let schema = from_kube_parameters(&[KubeParameter { name: "a".into(), type_: "boolean".into(), ..Default::default() }]);
        assert!(schema.get("required").is_none());
    }

    fn crd() -> Json {
        json!({
            "spec": {
                "versions": [
                    { "name": "v1alpha1", "served": true, "storage": false,
                      "schema": { "openAPIV3Schema": { "properties": { "spec": { "description": "old" } } } } },
                    { "name": "v1", "served": true, "storage": true,
                      "schema": { "openAPIV3Schema": { "properties": { "spec": { "description": "new" } } } } }
                ]
            }
        })
    }

    #[test]
    fn crd_schema_prefers_requested_then_storage() {
        assert_eq!(crd_spec_schema(&crd(), "v1alpha1").unwrap()["description"], "old");
        assert_eq!(crd_spec_schema(&crd(), "").unwrap()["description"], "new");
        assert_eq!(crd_spec_schema(&crd(), "v2").unwrap()["description"], "new");
    }

    #[test]
    fn crd_schema_reads_legacy_validation() {
        let legacy = json!({ "spec": { "validation": { "openAPIV3Schema": { "properties": { "spec": { "type": "object" } } } } } });
        assert_eq!(crd_spec_schema(&legacy, "v1beta1").unwrap()["type"], "object");
        assert!(crd_spec_schema(&json!({ "spec": {} }), "v1").is_none());
    }
}
