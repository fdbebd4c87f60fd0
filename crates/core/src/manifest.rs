//! Multi-document YAML manifests.
//!
//! A manifest stream holds `VirtualServiceMerge` documents (specifications)
//! and `VirtualService` documents (targets). Empty documents are skipped.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::result::Result;
use crate::types::{Specification, TargetResource};

/// Kind of a specification document.
pub const MERGE_KIND: &str = "VirtualServiceMerge";

/// Kind of a target document.
pub const TARGET_KIND: &str = "VirtualService";

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Merge(Specification),
    Target(TargetResource),
}

#[derive(Debug, Deserialize)]
struct TypeMeta {
    #[serde(default)]
    kind: String,
}

/// Parse every document in `input`.
///
/// Objects without a namespace are placed in `default_namespace`.
///
/// # Errors
///
/// Returns [`Error::YamlParseFailed`] for malformed documents and
/// [`Error::UnsupportedKind`] for kinds other than the two above.
pub fn parse_manifests(input: &str, default_namespace: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        manifests.push(parse_document(value, default_namespace)?);
    }
    Ok(manifests)
}

fn parse_document(value: serde_yaml::Value, default_namespace: &str) -> Result<Manifest> {
    let type_meta: TypeMeta = serde_yaml::from_value(value.clone())
        .map_err(|e| Error::yaml_parse_failed(e.to_string()))?;

    match type_meta.kind.as_str() {
        MERGE_KIND => {
            let mut spec: Specification = serde_yaml::from_value(value)
                .map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
            if spec.metadata.namespace.is_empty() {
                spec.metadata.namespace = default_namespace.to_string();
            }
            Ok(Manifest::Merge(spec))
        }
        TARGET_KIND => {
            let mut target: TargetResource = serde_yaml::from_value(value)
                .map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
            if target.metadata.namespace.is_empty() {
                target.metadata.namespace = default_namespace.to_string();
            }
            Ok(Manifest::Target(target))
        }
        other => Err(Error::unsupported_kind(other)),
    }
}

/// Read and parse a manifest file.
///
/// # Errors
///
/// Returns [`Error::ManifestReadFailed`] when the file cannot be read, or
/// any error from [`parse_manifests`].
pub fn load_manifest_file(path: &Path, default_namespace: &str) -> Result<Vec<Manifest>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::manifest_read_failed(path, e.to_string()))?;
    parse_manifests(&content, default_namespace)
}
