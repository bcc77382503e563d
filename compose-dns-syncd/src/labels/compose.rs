use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use shared::types::LabelSnapshot;
use crate::error::SourceError;
use super::extract::{extract_snapshot, ExtractOptions, ServiceLabels};
use super::LabelSource;

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: Option<BTreeMap<String, Option<ComposeService>>>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeService {
    #[serde(default)]
    labels: Option<RawLabels>,
    #[serde(default)]
    deploy: Option<DeploySection>,
}

#[derive(Debug, Deserialize)]
struct DeploySection {
    #[serde(default)]
    labels: Option<RawLabels>,
}

/// Compose accepts labels either as a mapping or as a list of `key=value` strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawLabels {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

/// Collapse either label shape into one key/value mapping.
pub fn normalize_labels(raw: &RawLabels) -> BTreeMap<String, String> {
    match raw {
        RawLabels::Map(map) => map
            .iter()
            .map(|(key, value)| (key.trim().to_string(), value_to_string(value)))
            .collect(),
        RawLabels::List(items) => items
            .iter()
            .filter_map(|item| {
                let item = item.trim();
                if item.is_empty() {
                    return None;
                }
                let (key, value) = item.split_once('=').unwrap_or((item, ""));
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect(),
    }
}

fn value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Sequence(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Parse compose YAML into normalized per-service labels.
/// `deploy.labels` are merged over the service's own labels.
pub fn parse_compose(contents: &str) -> Result<ServiceLabels, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(ServiceLabels::new());
    }

    let compose: ComposeFile = serde_yaml::from_str(contents)?;
    let services = compose
        .services
        .unwrap_or_default()
        .into_iter()
        .map(|(name, service)| {
            let service = service.unwrap_or_default();
            let mut labels = service
                .labels
                .as_ref()
                .map(normalize_labels)
                .unwrap_or_default();
            if let Some(deploy_labels) = service.deploy.as_ref().and_then(|d| d.labels.as_ref()) {
                labels.extend(normalize_labels(deploy_labels));
            }
            (name, labels)
        })
        .collect();

    Ok(services)
}

/// Label source backed by a docker-compose file on disk.
pub struct ComposeSource {
    path: PathBuf,
    options: ExtractOptions,
}

impl ComposeSource {
    pub fn new(path: impl Into<PathBuf>, options: ExtractOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LabelSource for ComposeSource {
    fn snapshot(&self) -> Result<LabelSnapshot, SourceError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Read {
            path: self.path.clone(),
            source,
        })?;

        let services = parse_compose(&contents).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })?;

        Ok(extract_snapshot(&services, &self.options))
    }
}
