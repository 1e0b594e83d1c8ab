use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::bounds::{BoundsResolver, WatershedBounds};
use crate::config::ResolvedConfig;
use crate::crs::AlbersEqualArea;
use crate::domain::Extent;
use crate::elevation::ElevationSource;
use crate::error::BratError;
use crate::features::{FeatureSource, LayerFailure, WrittenLayer};
use crate::hydrology::HydrologyAssembler;
use crate::layout::OutputLayout;
use crate::manifest::{
    Dataset, Layer, Manifest, Meta, ProjectBounds, Provenance, Realization, write_bounds_document,
    write_manifest,
};
use crate::raster::{RasterDeriver, RasterTool};
use crate::vectors::VectorLayerFetcher;

pub const DEM_ID: &str = "DEM";
pub const HILLSHADE_ID: &str = "HILLSHADE";
pub const HYDROLOGY_ID: &str = "HYDROLOGY";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fixed provenance for reproducible manifests; captured from the
    /// environment when unset.
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress into the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project_dir: String,
    pub manifest_path: String,
    pub native_extent: Extent,
    pub query_extent: Extent,
    pub centroid: (f64, f64),
    pub datasets: Vec<Dataset>,
    pub empty_layers: Vec<String>,
    pub failed_layers: Vec<LayerFailure>,
    pub elapsed_ms: u64,
}

/// A fatal error, with the manifest as it stood when the run stopped. The
/// manifest is never written to disk in this case.
#[derive(Debug)]
pub struct RunFailure {
    pub error: BratError,
    pub manifest: Option<Manifest>,
}

impl RunFailure {
    fn before_manifest(error: BratError) -> Self {
        Self {
            error,
            manifest: None,
        }
    }

    fn with_manifest(error: BratError, manifest: &Manifest) -> Self {
        Self {
            error,
            manifest: Some(manifest.clone()),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<RunFailure> for BratError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}

/// What a run would do, without touching the network or the disk.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub watershed_source: String,
    pub watershed_filter: String,
    pub project_dir: String,
    pub outputs: Vec<String>,
    pub hydrology_sources: Vec<String>,
    pub vector_layers: Vec<String>,
    pub abort_on_partial_failure: bool,
    pub compress: bool,
    pub resolution: f64,
}

impl RunPlan {
    pub fn new(config: &ResolvedConfig) -> Self {
        let layout = OutputLayout::new(config.output_dir.clone());
        let mut outputs = vec![
            layout.dem_path().to_string(),
            layout.hillshade_path().to_string(),
            layout.hydrology_path().to_string(),
        ];
        outputs.extend(
            config
                .vector_layers
                .iter()
                .map(|source| layout.vector_path(&source.layer_name()).to_string()),
        );
        outputs.push(layout.bounds_path().to_string());
        outputs.push(layout.manifest_path().to_string());
        let sources = &config.hydrology.sources;
        Self {
            watershed_source: config.watershed.source.to_string(),
            watershed_filter: config.watershed.filter.clone(),
            project_dir: layout.root().to_string(),
            outputs,
            hydrology_sources: [
                &sources.streams,
                &sources.rivers,
                &sources.lakes,
                &sources.reservoirs,
            ]
            .iter()
            .map(|source| source.to_string())
            .collect(),
            vector_layers: config
                .vector_layers
                .iter()
                .map(|source| source.to_string())
                .collect(),
            abort_on_partial_failure: config.hydrology.abort_on_partial_failure,
            compress: config.raster.compress,
            resolution: config.raster.resolution,
        }
    }
}

pub struct App<F: FeatureSource, H: FeatureSource, E: ElevationSource, R: RasterTool> {
    features: F,
    hydrology: H,
    elevation: E,
    raster: R,
    transform: AlbersEqualArea,
}

impl<F: FeatureSource, H: FeatureSource, E: ElevationSource, R: RasterTool> App<F, H, E, R> {
    pub fn new(features: F, hydrology: H, elevation: E, raster: R) -> Self {
        Self {
            features,
            hydrology,
            elevation,
            raster,
            transform: AlbersEqualArea::bc_albers(),
        }
    }

    /// Bounds, rasters, hydrology, vector layers, then the manifest. Each
    /// dataset enters the manifest only after its file has been written.
    pub fn run(
        &self,
        config: &ResolvedConfig,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, RunFailure> {
        let start = Instant::now();
        let phase = |message: String| {
            sink.event(ProgressEvent {
                message,
                elapsed: Some(start.elapsed()),
            })
        };
        let layout = OutputLayout::new(config.output_dir.clone());
        let provenance = options
            .provenance
            .clone()
            .unwrap_or_else(|| Provenance::capture(config.config_path.as_deref()));

        phase(format!(
            "phase=Bounds; {} where {}",
            config.watershed.source, config.watershed.filter
        ));
        let bounds = BoundsResolver::new(&self.features, &self.transform)
            .resolve(&config.watershed)
            .map_err(RunFailure::before_manifest)?;
        layout
            .ensure_inputs_dir()
            .map_err(RunFailure::before_manifest)?;
        layout
            .clear_previous_run()
            .map_err(RunFailure::before_manifest)?;
        write_bounds_document(&bounds.query, layout.bounds_path().as_std_path())
            .map_err(RunFailure::before_manifest)?;

        let mut manifest = new_manifest(config, &provenance, &bounds, &layout);

        phase("phase=Raster; fetching elevation".to_string());
        let deriver = RasterDeriver::new(
            &self.elevation,
            &self.raster,
            config.raster.compress,
            config.raster.resolution,
        );
        let dem = layout.dem_path();
        deriver
            .fetch_dem(&bounds.native, dem.as_std_path())
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;
        manifest
            .push_dataset(Dataset::Raster {
                id: DEM_ID.to_string(),
                name: "Digital Elevation Model".to_string(),
                path: layout.relative(&dem),
            })
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;

        phase("phase=Raster; deriving hillshade".to_string());
        let hillshade = layout.hillshade_path();
        deriver
            .derive_hillshade(dem.as_std_path(), hillshade.as_std_path())
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;
        manifest
            .push_dataset(Dataset::Raster {
                id: HILLSHADE_ID.to_string(),
                name: "Hillshade".to_string(),
                path: layout.relative(&hillshade),
            })
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;

        phase("phase=Hydrology; fetching streams, rivers, lakes, reservoirs".to_string());
        let hydrology_path = layout.hydrology_path();
        let hydrology = HydrologyAssembler::new(&self.hydrology, &config.hydrology.sources)
            .abort_on_partial_failure(config.hydrology.abort_on_partial_failure)
            .assemble(&bounds.boundary, &bounds.query, hydrology_path.as_std_path())
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;
        manifest
            .push_dataset(Dataset::Geopackage {
                id: HYDROLOGY_ID.to_string(),
                name: "Hydrology".to_string(),
                path: layout.relative(&hydrology_path),
                layers: hydrology.layers.iter().map(Layer::written).collect(),
            })
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;

        phase(format!(
            "phase=Vectors; fetching {} layers",
            config.vector_layers.len()
        ));
        let vectors = VectorLayerFetcher::new(&self.features)
            .fetch_all(&config.vector_layers, &bounds.native, &layout)
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;
        for layer in &vectors.layers {
            manifest
                .push_dataset(vector_dataset(layer, &layout))
                .map_err(|error| RunFailure::with_manifest(error, &manifest))?;
        }

        phase("phase=Manifest; writing project".to_string());
        let manifest_path = layout.manifest_path();
        write_manifest(&manifest, manifest_path.as_std_path())
            .map_err(|error| RunFailure::with_manifest(error, &manifest))?;

        let mut empty_layers = hydrology.empty;
        empty_layers.extend(vectors.empty);
        let mut failed_layers = hydrology.failures;
        failed_layers.extend(vectors.failures);
        let datasets = manifest.datasets().cloned().collect();
        Ok(RunReport {
            project_dir: layout.root().to_string(),
            manifest_path: manifest_path.to_string(),
            native_extent: bounds.native,
            query_extent: bounds.query,
            centroid: bounds.centroid,
            datasets,
            empty_layers,
            failed_layers,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn new_manifest(
    config: &ResolvedConfig,
    provenance: &Provenance,
    bounds: &WatershedBounds,
    layout: &OutputLayout,
) -> Manifest {
    let mut metadata: Vec<Meta> = provenance.metadata();
    metadata.extend(config.metadata.iter().cloned());
    Manifest {
        name: config.project.name.clone(),
        project_type: config.project.project_type.clone(),
        description: config.project.description.clone(),
        citation: config.project.citation.clone(),
        metadata,
        bounds: Some(ProjectBounds {
            centroid: bounds.centroid,
            bbox: bounds.query,
            path: layout.relative(&layout.bounds_path()),
        }),
        realizations: vec![Realization {
            id: config.realization.id.clone(),
            name: config.realization.name.clone(),
            description: config.realization.description.clone(),
            date_created: provenance.timestamp(),
            product_version: config.realization.product_version.clone(),
            metadata: vec![
                Meta::new("WatershedSource", config.watershed.source.to_string()),
                Meta::new("WatershedFilter", config.watershed.filter.clone()),
            ],
            datasets: Vec::new(),
        }],
    }
}

fn vector_dataset(layer: &WrittenLayer, layout: &OutputLayout) -> Dataset {
    let path = camino::Utf8PathBuf::from_path_buf(layer.path.clone())
        .map(|path| layout.relative(&path))
        .unwrap_or_else(|path| path.display().to_string());
    Dataset::Geopackage {
        id: layer.name.to_uppercase(),
        name: layer.source.clone(),
        path,
        layers: vec![Layer::written(layer)],
    }
}
