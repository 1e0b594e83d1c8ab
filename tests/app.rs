use std::collections::HashMap;
use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use geojson::{Feature, Geometry, JsonObject, Value};
use serde_json::json;

use bcbrat::app::{App, DEM_ID, HILLSHADE_ID, HYDROLOGY_ID, RunOptions};
use bcbrat::config::{Config, ConfigLoader, ConfigOverrides, ResolvedConfig};
use bcbrat::domain::{Crs, Extent};
use bcbrat::elevation::ElevationSource;
use bcbrat::error::BratError;
use bcbrat::features::{FeatureLayer, FeatureQuery, FeatureSource};
use bcbrat::gpkg::GeoPackage;
use bcbrat::hydrology::{LAKES, RESERVOIRS, RIVERS, STREAMS};
use bcbrat::manifest::Provenance;
use bcbrat::output::JsonOutput;
use bcbrat::raster::{RasterTool, ToolInfo};

const WATERSHEDS: &str = "WHSE_BASEMAPPING.FWA_ASSESSMENT_WATERSHEDS_POLY";
const RAIL: &str = "WHSE_BASEMAPPING.GBA_RAILWAY_TRACKS_SP";
const ROADS: &str = "WHSE_BASEMAPPING.DRA_DGTL_ROAD_ATLAS_MPAR_SP";

#[derive(Clone)]
enum Reply {
    Features(Vec<Feature>),
    Fail,
}

/// Serves canned replies by source id; anything unlisted is empty.
#[derive(Default)]
struct MockSource {
    replies: HashMap<String, Reply>,
}

impl MockSource {
    fn with(mut self, source: &str, reply: Reply) -> Self {
        self.replies.insert(source.to_string(), reply);
        self
    }
}

impl FeatureSource for MockSource {
    fn fetch(&self, query: &FeatureQuery) -> Result<FeatureLayer, BratError> {
        let source = query.source.as_str();
        let layer = FeatureLayer::new(source, query.source.layer_name(), query.crs);
        match self.replies.get(source) {
            Some(Reply::Features(features)) => Ok(layer.with_features(features.clone())),
            Some(Reply::Fail) => Err(BratError::SourceStatus {
                layer: source.to_string(),
                status: 503,
                message: "unavailable".to_string(),
            }),
            None => Ok(layer),
        }
    }
}

struct MockElevation;

impl ElevationSource for MockElevation {
    fn fetch_dem(&self, extent: &Extent, _: f64, destination: &Path) -> Result<(), BratError> {
        assert_eq!(extent.crs, Crs::BcAlbers);
        fs::write(destination, b"dem").map_err(|err| BratError::Filesystem(err.to_string()))
    }
}

#[derive(Default)]
struct MockRaster {
    fail_hillshade: bool,
}

impl RasterTool for MockRaster {
    fn compress(&self, src: &Path, dst: &Path) -> Result<(), BratError> {
        fs::copy(src, dst)
            .map(|_| ())
            .map_err(|err| BratError::Filesystem(err.to_string()))
    }

    fn hillshade(&self, _src: &Path, dst: &Path, _compress: bool) -> Result<(), BratError> {
        if self.fail_hillshade {
            return Err(BratError::RasterTool("gdaldem exited with status 1".to_string()));
        }
        fs::write(dst, b"hillshade").map_err(|err| BratError::Filesystem(err.to_string()))
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            gdal_translate: None,
            gdaldem: None,
        }
    }
}

fn properties(value: serde_json::Value) -> Option<JsonObject> {
    value.as_object().cloned()
}

fn boundary() -> Vec<Feature> {
    let ring = vec![
        vec![1_100_000.0, 1_000_000.0],
        vec![1_120_000.0, 1_000_000.0],
        vec![1_120_000.0, 1_015_000.0],
        vec![1_100_000.0, 1_015_000.0],
        vec![1_100_000.0, 1_000_000.0],
    ];
    vec![Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Polygon(vec![ring]))),
        id: None,
        properties: properties(json!({"WATERSHED_FEATURE_ID": 2904})),
        foreign_members: None,
    }]
}

fn streams(count: usize) -> Vec<Feature> {
    (0..count)
        .map(|index| Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::LineString(vec![
                vec![-125.0, 54.0, 700.0],
                vec![-125.01, 54.01 + index as f64 * 0.001, 690.0],
            ]))),
            id: None,
            properties: properties(json!({"linear_feature_id": index, "upstream_area_ha": 150.0})),
            foreign_members: None,
        })
        .collect()
}

fn polygons(count: usize, attributes: serde_json::Value) -> Vec<Feature> {
    (0..count)
        .map(|index| {
            let x = -125.0 + index as f64 * 0.01;
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Polygon(vec![vec![
                    vec![x, 54.0],
                    vec![x + 0.005, 54.0],
                    vec![x + 0.005, 54.005],
                    vec![x, 54.0],
                ]]))),
                id: None,
                properties: properties(attributes.clone()),
                foreign_members: None,
            }
        })
        .collect()
}

fn config(output: &Path, overrides: ConfigOverrides) -> ResolvedConfig {
    let mut config: Config = serde_json::from_value(json!({
        "watershed": {"key": "2904"},
        "project": {"name": "Kispiox", "citation": "BC Freshwater Atlas"},
        "metadata": [{"name": "Region", "value": "Skeena"}],
        "vector_layers": [RAIL, ROADS]
    }))
    .unwrap();
    config.output_dir = Some(output.display().to_string());
    ConfigLoader::resolve_config(config, &overrides, None).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        provenance: Some(Provenance {
            model_version: "0.1.0".to_string(),
            created: Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap(),
            created_by: Some("tester".to_string()),
            config_path: None,
        }),
    }
}

fn features_with_boundary() -> MockSource {
    MockSource::default().with(WATERSHEDS, Reply::Features(boundary()))
}

#[test]
fn streams_only_watershed_has_two_hydrology_layers() {
    let dir = tempfile::tempdir().unwrap();
    let hydrology = MockSource::default().with(STREAMS, Reply::Features(streams(4)));
    let app = App::new(
        features_with_boundary(),
        hydrology,
        MockElevation,
        MockRaster::default(),
    );
    let config = config(dir.path(), ConfigOverrides::default());

    let report = app.run(&config, &options(), &JsonOutput).unwrap();

    let gpkg = GeoPackage::open(&dir.path().join("inputs/hydrology.gpkg")).unwrap();
    assert_eq!(gpkg.list_layers().unwrap(), ["watershed", "flow_lines"]);
    assert_eq!(gpkg.count_features("flow_lines").unwrap(), 4);
    assert!(gpkg.column_names("flow_lines").unwrap().contains(&"totdasqkm".to_string()));
    assert_eq!(gpkg.layer_srs("watershed").unwrap(), Some(3005));
    assert_eq!(gpkg.layer_srs("flow_lines").unwrap(), Some(4326));

    let hydrology = report
        .datasets
        .iter()
        .find(|dataset| dataset.id() == HYDROLOGY_ID)
        .unwrap();
    let names: Vec<&str> = hydrology.layers().iter().map(|layer| layer.name.as_str()).collect();
    assert_eq!(names, ["watershed", "flow_lines"]);

    let xml = fs::read_to_string(dir.path().join("project.rs.xml")).unwrap();
    assert!(xml.contains(r#"<Vector lyrName="flow_lines">"#));
    assert!(!xml.contains("waterbodies"));
    assert!(xml.contains("<Path>project_bounds.geojson</Path>"));
    assert!(dir.path().join("project_bounds.geojson").is_file());
}

#[test]
fn lakes_and_reservoirs_merge_into_waterbodies() {
    let dir = tempfile::tempdir().unwrap();
    let hydrology = MockSource::default()
        .with(LAKES, Reply::Features(polygons(3, json!({"gnis_name_1": "Kitwanga Lake"}))))
        .with(RESERVOIRS, Reply::Features(polygons(2, json!({"waterbody_type": "X"}))));
    let app = App::new(
        features_with_boundary(),
        hydrology,
        MockElevation,
        MockRaster::default(),
    );
    let config = config(dir.path(), ConfigOverrides::default());

    app.run(&config, &options(), &JsonOutput).unwrap();

    let gpkg = GeoPackage::open(&dir.path().join("inputs/hydrology.gpkg")).unwrap();
    assert_eq!(gpkg.list_layers().unwrap(), ["watershed", "waterbodies"]);
    assert_eq!(gpkg.count_features("waterbodies").unwrap(), 5);
    let columns = gpkg.column_names("waterbodies").unwrap();
    assert!(columns.contains(&"gnis_name_1".to_string()));
    assert!(columns.contains(&"waterbody_type".to_string()));
}

#[test]
fn hydrology_queries_use_geographic_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let hydrology = MockSource::default();
    let app = App::new(
        features_with_boundary(),
        hydrology,
        MockElevation,
        MockRaster::default(),
    );
    let config = config(dir.path(), ConfigOverrides::default());

    let report = app.run(&config, &options(), &JsonOutput).unwrap();

    assert_eq!(report.native_extent.crs, Crs::BcAlbers);
    assert_eq!(report.query_extent.crs, Crs::Wgs84);
    assert!(report.query_extent.min_x < -120.0 && report.query_extent.max_x > -135.0);
}

#[test]
fn failed_hillshade_keeps_dem_entry_and_writes_no_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        features_with_boundary(),
        MockSource::default(),
        MockElevation,
        MockRaster {
            fail_hillshade: true,
        },
    );
    let config = config(dir.path(), ConfigOverrides::default());

    let failure = app.run(&config, &options(), &JsonOutput).unwrap_err();

    assert_matches!(failure.error, BratError::RasterTool(_));
    let manifest = failure.manifest.unwrap();
    assert!(manifest.dataset(DEM_ID).is_some());
    assert!(manifest.dataset(HILLSHADE_ID).is_none());
    assert!(!dir.path().join("project.rs.xml").exists());
    assert!(!dir.path().join("inputs/hillshade.tif").exists());
    assert!(dir.path().join("inputs/dem.tif").is_file());
}

#[test]
fn missing_boundary_is_fatal_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        MockSource::default(),
        MockSource::default(),
        MockElevation,
        MockRaster::default(),
    );
    let config = config(dir.path(), ConfigOverrides::default());

    let failure = app.run(&config, &options(), &JsonOutput).unwrap_err();

    assert_matches!(failure.error, BratError::SourceUnavailable { .. });
    assert!(failure.manifest.is_none());
    assert!(!dir.path().join("inputs").exists());
}

#[test]
fn failed_hydrology_source_is_skipped_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let hydrology = MockSource::default()
        .with(STREAMS, Reply::Features(streams(2)))
        .with(RIVERS, Reply::Fail);
    let app = App::new(
        features_with_boundary(),
        hydrology,
        MockElevation,
        MockRaster::default(),
    );
    let config = config(dir.path(), ConfigOverrides::default());

    let report = app.run(&config, &options(), &JsonOutput).unwrap();

    assert_eq!(report.failed_layers.len(), 1);
    assert_eq!(report.failed_layers[0].source, RIVERS);
    let gpkg = GeoPackage::open(&dir.path().join("inputs/hydrology.gpkg")).unwrap();
    assert_eq!(gpkg.list_layers().unwrap(), ["watershed", "flow_lines"]);
}

#[test]
fn failed_hydrology_source_aborts_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let hydrology = MockSource::default()
        .with(STREAMS, Reply::Features(streams(2)))
        .with(RIVERS, Reply::Fail);
    let app = App::new(
        features_with_boundary(),
        hydrology,
        MockElevation,
        MockRaster::default(),
    );
    let overrides = ConfigOverrides {
        abort_on_partial_failure: true,
        ..ConfigOverrides::default()
    };
    let config = config(dir.path(), overrides);

    let failure = app.run(&config, &options(), &JsonOutput).unwrap_err();

    assert_matches!(
        failure.error,
        BratError::PartialHydrologyFailure { ref layer, .. } if layer == RIVERS
    );
    let manifest = failure.manifest.unwrap();
    assert!(manifest.dataset(HYDROLOGY_ID).is_none());
    assert!(!dir.path().join("inputs/hydrology.gpkg").exists());
    assert!(!dir.path().join("project.rs.xml").exists());
}

#[test]
fn vector_layers_skip_empty_and_failed_sources() {
    let dir = tempfile::tempdir().unwrap();
    let features = features_with_boundary().with(RAIL, Reply::Features(streams(1)));
    let app = App::new(features, MockSource::default(), MockElevation, MockRaster::default());
    let settings = config(dir.path(), ConfigOverrides::default());

    let report = app.run(&settings, &options(), &JsonOutput).unwrap();

    assert!(dir.path().join("inputs/gba_railway_tracks_sp.gpkg").is_file());
    assert!(!dir.path().join("inputs/dra_dgtl_road_atlas_mpar_sp.gpkg").exists());
    assert_eq!(
        report.empty_layers,
        [
            "fwa_stream_networks_sp",
            "fwa_rivers_poly",
            "fwa_lakes_poly",
            "fwa_manmade_waterbodies_poly",
            "dra_dgtl_road_atlas_mpar_sp"
        ]
    );
    let ids: Vec<&str> = report.datasets.iter().map(|dataset| dataset.id()).collect();
    assert_eq!(ids, [DEM_ID, HILLSHADE_ID, HYDROLOGY_ID, "GBA_RAILWAY_TRACKS_SP"]);

    let dir = tempfile::tempdir().unwrap();
    let features = features_with_boundary()
        .with(RAIL, Reply::Fail)
        .with(ROADS, Reply::Features(streams(2)));
    let app = App::new(features, MockSource::default(), MockElevation, MockRaster::default());
    let settings = config(dir.path(), ConfigOverrides::default());

    let report = app.run(&settings, &options(), &JsonOutput).unwrap();

    assert_eq!(report.failed_layers[0].source, RAIL);
    assert!(dir.path().join("inputs/dra_dgtl_road_atlas_mpar_sp.gpkg").is_file());
}

#[test]
fn manifest_is_reproducible_for_fixed_provenance() {
    let run = |dir: &Path| {
        let app = App::new(
            features_with_boundary(),
            MockSource::default().with(STREAMS, Reply::Features(streams(1))),
            MockElevation,
            MockRaster::default(),
        );
        let config = config(dir, ConfigOverrides::default());
        app.run(&config, &options(), &JsonOutput).unwrap();
        fs::read(dir.join("project.rs.xml")).unwrap()
    };
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    assert_eq!(run(first.path()), run(second.path()));
}

#[test]
fn rerun_into_same_directory_leaves_no_stale_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), ConfigOverrides::default());

    let first = App::new(
        features_with_boundary().with(RAIL, Reply::Features(streams(2))),
        MockSource::default()
            .with(STREAMS, Reply::Features(streams(3)))
            .with(LAKES, Reply::Features(polygons(3, json!({"gnis_name_1": "Kitwanga Lake"})))),
        MockElevation,
        MockRaster::default(),
    );
    first.run(&config, &options(), &JsonOutput).unwrap();
    let rail = dir.path().join("inputs/gba_railway_tracks_sp.gpkg");
    assert!(rail.is_file());

    let second = App::new(
        features_with_boundary(),
        MockSource::default().with(STREAMS, Reply::Features(streams(1))),
        MockElevation,
        MockRaster::default(),
    );
    let report = second.run(&config, &options(), &JsonOutput).unwrap();

    let gpkg = GeoPackage::open(&dir.path().join("inputs/hydrology.gpkg")).unwrap();
    assert_eq!(gpkg.list_layers().unwrap(), ["watershed", "flow_lines"]);
    assert_eq!(gpkg.count_features("flow_lines").unwrap(), 1);
    assert!(!rail.exists());
    assert!(report.empty_layers.contains(&"gba_railway_tracks_sp".to_string()));
    let xml = fs::read_to_string(dir.path().join("project.rs.xml")).unwrap();
    assert!(!xml.contains("waterbodies"));
    assert!(!xml.contains("GBA_RAILWAY_TRACKS_SP"));
}

#[test]
fn failed_rerun_removes_earlier_manifest_and_container() {
    let dir = tempfile::tempdir().unwrap();
    let skipping = config(dir.path(), ConfigOverrides::default());
    App::new(
        features_with_boundary(),
        MockSource::default().with(STREAMS, Reply::Features(streams(2))),
        MockElevation,
        MockRaster::default(),
    )
    .run(&skipping, &options(), &JsonOutput)
    .unwrap();
    assert!(dir.path().join("project.rs.xml").is_file());

    let overrides = ConfigOverrides {
        abort_on_partial_failure: true,
        ..ConfigOverrides::default()
    };
    let aborting = config(dir.path(), overrides);
    let failure = App::new(
        features_with_boundary(),
        MockSource::default()
            .with(STREAMS, Reply::Features(streams(2)))
            .with(RIVERS, Reply::Fail),
        MockElevation,
        MockRaster::default(),
    )
    .run(&aborting, &options(), &JsonOutput)
    .unwrap_err();

    assert_matches!(failure.error, BratError::PartialHydrologyFailure { .. });
    assert!(!dir.path().join("inputs/hydrology.gpkg").exists());
    assert!(!dir.path().join("project.rs.xml").exists());
}
