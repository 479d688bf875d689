use std::collections::BTreeMap;

use flotilla_domain::FleetSpec;
use serde::{Deserialize, Serialize};

/// Raw YAML representation of a fleet manifest file.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawManifest {
    pub api_version: Option<String>,
    pub kind: String,
    pub metadata: RawMetadata,
    pub spec: FleetSpec,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawMetadata {
    pub name: String,
    pub labels: Option<BTreeMap<String, String>>,
}
