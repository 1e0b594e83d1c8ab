use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::app::{DEM_ID, HILLSHADE_ID, HYDROLOGY_ID};
use crate::bounds::WatershedTarget;
use crate::domain::{ASSESSMENT_WATERSHEDS, SourceId, WatershedKey};
use crate::elevation::DEFAULT_ELEVATION_URL;
use crate::error::BratError;
use crate::hydrology::HydrologySources;
use crate::manifest::Meta;
use crate::ogcapi::DEFAULT_FEATURES_URL;
use crate::vectors::default_vector_layers;
use crate::wfs::DEFAULT_WFS_URL;

pub const DEFAULT_CONFIG_FILE: &str = "bcbrat.json";
pub const DEFAULT_OUTPUT_DIR: &str = "bcbrat-project";
pub const DEFAULT_RESOLUTION: f64 = 25.0;

/// Vector layers become datasets named after themselves, so these are taken.
const RESERVED_DATASET_IDS: [&str; 3] = [DEM_ID, HILLSHADE_ID, HYDROLOGY_ID];

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub watershed: WatershedEntry,
    #[serde(default)]
    pub project: ProjectEntry,
    #[serde(default)]
    pub realization: RealizationEntry,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetaEntry>,
    #[serde(default)]
    pub vector_layers: Option<Vec<String>>,
    #[serde(default)]
    pub hydrology: HydrologyEntry,
    #[serde(default)]
    pub raster: RasterEntry,
    #[serde(default)]
    pub services: ServicesEntry,
}

/// Either `key` (a watershed key such as `2904` or `group:BULK`) or
/// `filter` (an attribute expression against `source`).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WatershedEntry {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProjectEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub citation: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RealizationEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub product_version: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MetaEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HydrologyEntry {
    #[serde(default)]
    pub abort_on_partial_failure: Option<bool>,
    #[serde(default)]
    pub streams: Option<String>,
    #[serde(default)]
    pub rivers: Option<String>,
    #[serde(default)]
    pub lakes: Option<String>,
    #[serde(default)]
    pub reservoirs: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RasterEntry {
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub resolution: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ServicesEntry {
    #[serde(default)]
    pub wfs_url: Option<String>,
    #[serde(default)]
    pub features_url: Option<String>,
    #[serde(default)]
    pub elevation_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub watershed: Option<WatershedKey>,
    pub output_dir: Option<Utf8PathBuf>,
    pub abort_on_partial_failure: bool,
    pub no_compress: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectSettings {
    pub name: String,
    pub project_type: String,
    pub description: Option<String>,
    pub citation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RealizationSettings {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub product_version: String,
}

#[derive(Debug, Clone)]
pub struct HydrologySettings {
    pub abort_on_partial_failure: bool,
    pub sources: HydrologySources,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterSettings {
    pub compress: bool,
    pub resolution: f64,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub wfs_url: String,
    pub features_url: String,
    pub elevation_url: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    /// File the settings were read from; `None` when built from defaults.
    pub config_path: Option<PathBuf>,
    pub watershed: WatershedTarget,
    pub project: ProjectSettings,
    pub realization: RealizationSettings,
    pub output_dir: Utf8PathBuf,
    pub metadata: Vec<Meta>,
    pub vector_layers: Vec<SourceId>,
    pub hydrology: HydrologySettings,
    pub raster: RasterSettings,
    pub services: ServiceSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `path`, or `bcbrat.json` in the working directory. Without a file,
    /// a watershed given on the command line is enough to run on defaults.
    pub fn resolve(
        path: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<ResolvedConfig, BratError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            if overrides.watershed.is_none() {
                return Err(BratError::MissingConfig);
            }
            return Self::resolve_config(Config::default(), overrides, None);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BratError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BratError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, overrides, Some(config_path))
    }

    pub fn resolve_config(
        mut config: Config,
        overrides: &ConfigOverrides,
        config_path: Option<PathBuf>,
    ) -> Result<ResolvedConfig, BratError> {
        if let Some(key) = &overrides.watershed {
            config.watershed = WatershedEntry {
                key: Some(key.to_string()),
                source: None,
                filter: None,
            };
        }

        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(invalid(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let (watershed, watershed_label) = resolve_watershed(&config.watershed)?;
        let project = ProjectSettings {
            name: required_name(
                "project.name",
                config.project.name,
                || format!("BRAT inputs for watershed {watershed_label}"),
            )?,
            project_type: required_name("project.project_type", config.project.project_type, || {
                "BRAT".to_string()
            })?,
            description: non_blank(config.project.description),
            citation: non_blank(config.project.citation),
        };

        let realization_id = config
            .realization
            .id
            .unwrap_or_else(|| "brat_inputs".to_string());
        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$")
            .map_err(|err| invalid(err.to_string()))?;
        if !identifier.is_match(&realization_id) {
            return Err(invalid(format!(
                "realization.id {realization_id:?} must start with a letter and contain only letters, digits, '_', '.', '-'"
            )));
        }
        let realization = RealizationSettings {
            id: realization_id,
            name: required_name("realization.name", config.realization.name, || {
                "BRAT Inputs".to_string()
            })?,
            description: non_blank(config.realization.description),
            product_version: required_name(
                "realization.product_version",
                config.realization.product_version,
                || env!("CARGO_PKG_VERSION").to_string(),
            )?,
        };

        let output_dir = match (&overrides.output_dir, config.output_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) if !dir.trim().is_empty() => Utf8PathBuf::from(dir),
            (None, Some(_)) => return Err(invalid("output_dir must not be empty")),
            (None, None) => Utf8PathBuf::from(DEFAULT_OUTPUT_DIR),
        };

        let metadata = resolve_metadata(config.metadata, &identifier)?;

        let vector_layers = match config.vector_layers {
            Some(ids) => ids
                .iter()
                .map(|id| parse_source("vector_layers", id))
                .collect::<Result<Vec<_>, _>>()?,
            None => default_vector_layers(),
        };
        let mut seen = HashSet::new();
        for source in &vector_layers {
            let name = source.layer_name();
            if RESERVED_DATASET_IDS
                .iter()
                .any(|id| id.eq_ignore_ascii_case(&name))
            {
                return Err(invalid(format!(
                    "vector_layers: {source} maps to {name:?}, which is reserved for a project dataset"
                )));
            }
            if !seen.insert(name) {
                return Err(invalid(format!(
                    "vector_layers: {source} maps to a layer name already in use"
                )));
            }
        }

        let defaults = HydrologySources::default();
        let hydrology = HydrologySettings {
            abort_on_partial_failure: overrides.abort_on_partial_failure
                || config.hydrology.abort_on_partial_failure.unwrap_or(false),
            sources: HydrologySources {
                streams: source_or("hydrology.streams", config.hydrology.streams, defaults.streams)?,
                rivers: source_or("hydrology.rivers", config.hydrology.rivers, defaults.rivers)?,
                lakes: source_or("hydrology.lakes", config.hydrology.lakes, defaults.lakes)?,
                reservoirs: source_or(
                    "hydrology.reservoirs",
                    config.hydrology.reservoirs,
                    defaults.reservoirs,
                )?,
            },
        };

        let resolution = config.raster.resolution.unwrap_or(DEFAULT_RESOLUTION);
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(invalid(format!(
                "raster.resolution must be positive, got {resolution}"
            )));
        }
        let raster = RasterSettings {
            compress: !overrides.no_compress && config.raster.compress.unwrap_or(true),
            resolution,
        };

        let services = ServiceSettings {
            wfs_url: service_url("services.wfs_url", config.services.wfs_url, DEFAULT_WFS_URL)?,
            features_url: service_url(
                "services.features_url",
                config.services.features_url,
                DEFAULT_FEATURES_URL,
            )?,
            elevation_url: service_url(
                "services.elevation_url",
                config.services.elevation_url,
                DEFAULT_ELEVATION_URL,
            )?,
        };

        Ok(ResolvedConfig {
            schema_version,
            config_path,
            watershed,
            project,
            realization,
            output_dir,
            metadata,
            vector_layers,
            hydrology,
            raster,
            services,
        })
    }
}

fn invalid(message: impl Into<String>) -> BratError {
    BratError::ConfigValidation(message.into())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn required_name(
    field: &str,
    value: Option<String>,
    default: impl FnOnce() -> String,
) -> Result<String, BratError> {
    match value {
        Some(value) if value.trim().is_empty() => Err(invalid(format!("{field} must not be empty"))),
        Some(value) => Ok(value.trim().to_string()),
        None => Ok(default()),
    }
}

fn parse_source(field: &str, value: &str) -> Result<SourceId, BratError> {
    value
        .parse()
        .map_err(|_| invalid(format!("{field}: {value:?} is not a SCHEMA.TABLE identifier")))
}

fn source_or(field: &str, value: Option<String>, default: SourceId) -> Result<SourceId, BratError> {
    match value {
        Some(value) => parse_source(field, &value),
        None => Ok(default),
    }
}

fn service_url(field: &str, value: Option<String>, default: &str) -> Result<String, BratError> {
    let url = value.unwrap_or_else(|| default.to_string());
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(invalid(format!("{field} must be an http(s) URL, got {url:?}")));
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn resolve_watershed(entry: &WatershedEntry) -> Result<(WatershedTarget, String), BratError> {
    let filter = non_blank(entry.filter.clone());
    match (&entry.key, filter) {
        (Some(_), Some(_)) => Err(invalid(
            "set either watershed.key or watershed.filter, not both",
        )),
        (Some(key), None) => {
            let key: WatershedKey = key
                .parse()
                .map_err(|err: BratError| invalid(format!("watershed.key: {err}")))?;
            let source = match &entry.source {
                Some(source) => parse_source("watershed.source", source)?,
                None => key.source(),
            };
            Ok((
                WatershedTarget {
                    source,
                    filter: key.filter(),
                },
                key.to_string(),
            ))
        }
        (None, Some(filter)) => {
            let source = match &entry.source {
                Some(source) => parse_source("watershed.source", source)?,
                None => parse_source("watershed.source", ASSESSMENT_WATERSHEDS)?,
            };
            Ok((
                WatershedTarget {
                    source,
                    filter: filter.clone(),
                },
                filter,
            ))
        }
        (None, None) => Err(invalid(
            "a watershed is required: set watershed.key, watershed.filter, or pass --watershed",
        )),
    }
}

fn resolve_metadata(entries: Vec<MetaEntry>, identifier: &Regex) -> Result<Vec<Meta>, BratError> {
    let mut seen = HashSet::new();
    let mut metadata = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.name.trim().to_string();
        if !identifier.is_match(&name) {
            return Err(invalid(format!("metadata name {:?} is not a valid key", entry.name)));
        }
        if !seen.insert(name.clone()) {
            return Err(invalid(format!("metadata name {name:?} is repeated")));
        }
        metadata.push(Meta::new(name, entry.value));
    }
    Ok(metadata)
}
