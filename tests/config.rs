use std::fs;

use assert_matches::assert_matches;
use bcbrat::config::{Config, ConfigLoader, ConfigOverrides};
use bcbrat::domain::{SourceId, WatershedKey};
use bcbrat::error::BratError;
use bcbrat::vectors::default_vector_layers;

#[test]
fn resolve_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bcbrat.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "watershed": {"key": "group:kisp"},
            "project": {"name": "Kispiox BRAT"},
            "output_dir": "out/kispiox",
            "vector_layers": ["WHSE_BASEMAPPING.GBA_RAILWAY_TRACKS_SP"],
            "hydrology": {"abort_on_partial_failure": true},
            "raster": {"resolution": 10}
        }"#,
    )
    .unwrap();

    let resolved =
        ConfigLoader::resolve(path.to_str(), &ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(
        resolved.watershed.source.as_str(),
        "WHSE_BASEMAPPING.FWA_WATERSHED_GROUPS_POLY"
    );
    assert_eq!(resolved.watershed.filter, "WATERSHED_GROUP_CODE='KISP'");
    assert_eq!(resolved.project.name, "Kispiox BRAT");
    assert_eq!(resolved.project.project_type, "BRAT");
    assert_eq!(resolved.output_dir.as_str(), "out/kispiox");
    assert_eq!(resolved.vector_layers.len(), 1);
    assert!(resolved.hydrology.abort_on_partial_failure);
    assert!(resolved.raster.compress);
    assert_eq!(resolved.raster.resolution, 10.0);
}

#[test]
fn command_line_overrides_file() {
    let config: Config = serde_json::from_str(
        r#"{"watershed": {"key": "2904"}, "output_dir": "from-file", "raster": {"compress": true}}"#,
    )
    .unwrap();
    let overrides = ConfigOverrides {
        watershed: Some(WatershedKey::FeatureId(17)),
        output_dir: Some("from-cli".into()),
        abort_on_partial_failure: true,
        no_compress: true,
    };

    let resolved = ConfigLoader::resolve_config(config, &overrides, None).unwrap();
    assert_eq!(resolved.watershed.filter, "WATERSHED_FEATURE_ID=17");
    assert_eq!(resolved.output_dir.as_str(), "from-cli");
    assert!(resolved.hydrology.abort_on_partial_failure);
    assert!(!resolved.raster.compress);
}

#[test]
fn defaults_without_optional_sections() {
    let config: Config = serde_json::from_str(r#"{"watershed": {"key": "2904"}}"#).unwrap();
    let resolved = ConfigLoader::resolve_config(config, &ConfigOverrides::default(), None).unwrap();
    assert_eq!(resolved.vector_layers, default_vector_layers());
    assert_eq!(resolved.realization.id, "brat_inputs");
    assert_eq!(resolved.output_dir.as_str(), "bcbrat-project");
    assert!(!resolved.hydrology.abort_on_partial_failure);
    assert_eq!(
        resolved.hydrology.sources.streams,
        "WHSE_BASEMAPPING.FWA_STREAM_NETWORKS_SP".parse::<SourceId>().unwrap()
    );
}

#[test]
fn missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str(), &ConfigOverrides::default()),
        Err(BratError::ConfigRead(_))
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bcbrat.json");
    fs::write(&path, "{ watershed: ").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str(), &ConfigOverrides::default()),
        Err(BratError::ConfigParse(_))
    );
}

#[test]
fn invalid_settings_are_rejected() {
    let cases = [
        r#"{"watershed": {"key": "2904", "filter": "GNIS_NAME='X'"}}"#,
        r#"{"watershed": {"key": "2904"}, "raster": {"resolution": 0}}"#,
        r#"{"watershed": {"key": "2904"}, "realization": {"id": "9 lives"}}"#,
        r#"{"watershed": {"key": "2904"}, "vector_layers": ["roads"]}"#,
        r#"{"watershed": {"key": "2904"}, "services": {"wfs_url": "ftp://example"}}"#,
        r#"{"watershed": {"key": "2904"}, "schema_version": 2}"#,
        r#"{"watershed": {"key": "2904"}, "vector_layers": ["WHSE_X.HYDROLOGY"]}"#,
        r#"{"watershed": {"key": "2904"}, "vector_layers": ["WHSE_X.DEM"]}"#,
        r#"{"watershed": {"key": "2904"}, "metadata": [{"name": "A", "value": "1"}, {"name": "A", "value": "2"}]}"#,
    ];
    for case in cases {
        let config: Config = serde_json::from_str(case).unwrap();
        assert_matches!(
            ConfigLoader::resolve_config(config, &ConfigOverrides::default(), None),
            Err(BratError::ConfigValidation(_)),
            "{case}"
        );
    }
}
