use std::collections::HashMap;
use std::path::Path;

use flotilla_domain::{validate_fleet_spec, Fleet};
use tracing::debug;

use crate::error::ManifestError;
use crate::raw::RawManifest;

const FLEET_KIND: &str = "Fleet";

/// Walk `dir` and load every fleet manifest found.
///
/// Every `*.yaml`/`*.yml` file under the directory (recursively) must hold
/// exactly one Fleet manifest; any parse or validation failure fails the
/// whole load so a half-readable checkout never produces a partial fleet
/// set.
pub fn load_fleets(dir: &Path) -> Result<Vec<Fleet>, ManifestError> {
    let mut fleets: Vec<Fleet> = Vec::new();
    let mut sources: HashMap<String, String> = HashMap::new();

    collect_fleets(dir, &mut fleets, &mut sources)?;
    fleets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(fleets)
}

fn collect_fleets(
    dir: &Path,
    out: &mut Vec<Fleet>,
    sources: &mut HashMap<String, String>,
) -> Result<(), ManifestError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ManifestError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            collect_fleets(&path, out, sources)?;
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {}
            _ => continue,
        }

        debug!("Loading fleet manifest from {}", path.display());
        let fleet = load_fleet_file(&path)?;

        let display = path.display().to_string();
        if let Some(other_path) = sources.insert(fleet.metadata.name.clone(), display.clone()) {
            return Err(ManifestError::Duplicate {
                name: fleet.metadata.name,
                path: display,
                other_path,
            });
        }
        out.push(fleet);
    }

    Ok(())
}

fn load_fleet_file(path: &Path) -> Result<Fleet, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawManifest = serde_yaml::from_str(&content).map_err(|e| ManifestError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    convert_fleet(raw, path)
}

fn convert_fleet(raw: RawManifest, path: &Path) -> Result<Fleet, ManifestError> {
    let invalid = |message: String| ManifestError::Invalid {
        path: path.display().to_string(),
        message,
    };

    if raw.kind != FLEET_KIND {
        return Err(invalid(format!("expected kind '{}', got '{}'", FLEET_KIND, raw.kind)));
    }
    if raw.metadata.name.is_empty() {
        return Err(invalid("fleet without a name".to_string()));
    }
    if !raw
        .metadata
        .name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(format!(
            "fleet name '{}' must be lowercase alphanumeric with dashes",
            raw.metadata.name
        )));
    }

    validate_fleet_spec(&raw.spec).map_err(|e| invalid(e.describe()))?;

    let mut fleet = Fleet::new(raw.metadata.name, raw.spec);
    fleet.metadata.labels = raw.metadata.labels;
    Ok(fleet)
}
