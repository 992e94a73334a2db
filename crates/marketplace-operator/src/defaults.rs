//! Built-in OperatorSources
//!
//! Manifests shipped with the operator are applied at startup. Edits made
//! to a default source in the cluster are reverted on the next start.

use crate::crd::OperatorSource;
use crate::error::{OperatorError, Result};
use crate::resources::{FIELD_MANAGER, MANAGED_BY_LABEL};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};
use validator::Validate;

/// Read every `*.yaml` / `*.yml` file in `dir`, in file-name order.
///
/// Files may hold several documents separated by `---`.
pub fn load_defaults(dir: &Path) -> Result<Vec<OperatorSource>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    let mut sources = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            let source: OperatorSource = serde_yaml::from_value(value)?;
            source.spec.validate().map_err(|e| {
                OperatorError::InvalidConfig(format!(
                    "default source '{}' in {}: {}",
                    source.name_any(),
                    path.display(),
                    e
                ))
            })?;
            debug!(name = %source.name_any(), file = %path.display(), "Loaded default OperatorSource");
            sources.push(source);
        }
    }
    Ok(sources)
}

/// Strip server-owned fields and pin the source to `namespace`
pub fn prepare_default(source: &OperatorSource, namespace: &str) -> OperatorSource {
    let mut prepared = OperatorSource::new(&source.name_any(), source.spec.clone());
    prepared.metadata.namespace = Some(namespace.to_string());

    let mut labels = source.labels().clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    prepared.metadata.labels = Some(labels);

    let annotations = source.annotations();
    if !annotations.is_empty() {
        prepared.metadata.annotations = Some(annotations.clone());
    }
    prepared
}

/// Server-side apply the default sources into `namespace`
pub async fn ensure_defaults(
    client: Client,
    namespace: &str,
    sources: &[OperatorSource],
) -> Result<usize> {
    let api: Api<OperatorSource> = Api::namespaced(client, namespace);
    let patch_params = PatchParams::apply(FIELD_MANAGER).force();

    for source in sources {
        let prepared = prepare_default(source, namespace);
        let name = prepared.name_any();
        api.patch(&name, &patch_params, &Patch::Apply(&prepared))
            .await?;
        info!(name = %name, namespace = %namespace, "Ensured default OperatorSource");
    }
    Ok(sources.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const COMMUNITY: &str = r#"
apiVersion: marketplace.operators.coreos.com/v1
kind: OperatorSource
metadata:
  name: community-operators
  namespace: somewhere-else
  labels:
    opsrc-provider: community
spec:
  type: appregistry
  endpoint: https://quay.io/cnr
  registryNamespace: community-operators
  displayName: Community Operators
  publisher: Red Hat
"#;

    const CERTIFIED: &str = r#"
apiVersion: marketplace.operators.coreos.com/v1
kind: OperatorSource
metadata:
  name: certified-operators
spec:
  endpoint: https://quay.io/cnr
  registryNamespace: certified-operators
---
apiVersion: marketplace.operators.coreos.com/v1
kind: OperatorSource
metadata:
  name: redhat-operators
spec:
  endpoint: https://quay.io/cnr
  registryNamespace: redhat-operators
"#;

    #[test]
    fn test_load_defaults_reads_yaml_files_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b-community.yaml"), COMMUNITY).unwrap();
        fs::write(dir.path().join("a-certified.yml"), CERTIFIED).unwrap();
        fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let sources = load_defaults(dir.path()).unwrap();
        let names: Vec<String> = sources.iter().map(|s| s.name_any()).collect();

        assert_eq!(
            names,
            vec!["certified-operators", "redhat-operators", "community-operators"]
        );
        assert_eq!(sources[0].spec.source_type, "appregistry");
    }

    #[test]
    fn test_load_defaults_rejects_invalid_source() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("bad.yaml"),
            COMMUNITY.replace("https://quay.io/cnr", "quay.io"),
        )
        .unwrap();

        let err = load_defaults(dir.path()).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
        assert!(err.to_string().contains("community-operators"));
    }

    #[test]
    fn test_load_defaults_missing_dir() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            load_defaults(&missing),
            Err(OperatorError::Io(_))
        ));
    }

    #[test]
    fn test_load_defaults_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(load_defaults(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_prepare_default_pins_namespace_and_labels() {
        let source: OperatorSource = serde_yaml::from_str(COMMUNITY).unwrap();
        let prepared = prepare_default(&source, "openshift-marketplace");

        assert_eq!(
            prepared.metadata.namespace.as_deref(),
            Some("openshift-marketplace")
        );
        let labels = prepared.labels();
        assert_eq!(labels["opsrc-provider"], "community");
        assert_eq!(labels[MANAGED_BY_LABEL], FIELD_MANAGER);
        assert!(prepared.status.is_none());
    }
}
