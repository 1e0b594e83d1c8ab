use crate::domain::{Extent, SourceId};
use crate::error::BratError;
use crate::features::{FeatureQuery, FeatureSource, LayerFailure, WrittenLayer};
use crate::fs_util::{remove_if_exists, replace_atomic};
use crate::gpkg::GeoPackage;
use crate::layout::OutputLayout;

/// Vegetation, roads, biogeoclimatic zones and rail.
pub const DEFAULT_VECTOR_LAYERS: [&str; 4] = [
    "WHSE_FOREST_VEGETATION.VEG_COMP_LYR_R1_POLY",
    "WHSE_BASEMAPPING.DRA_DGTL_ROAD_ATLAS_MPAR_SP",
    "WHSE_FOREST_VEGETATION.BEC_BIOGEOCLIMATIC_POLY",
    "WHSE_BASEMAPPING.GBA_RAILWAY_TRACKS_SP",
];

pub fn default_vector_layers() -> Vec<SourceId> {
    DEFAULT_VECTOR_LAYERS
        .into_iter()
        .map(SourceId::from_static)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct VectorOutcome {
    pub layers: Vec<WrittenLayer>,
    pub empty: Vec<String>,
    pub failures: Vec<LayerFailure>,
}

pub struct VectorLayerFetcher<'a, F: FeatureSource + ?Sized> {
    source: &'a F,
}

impl<'a, F: FeatureSource + ?Sized> VectorLayerFetcher<'a, F> {
    pub fn new(source: &'a F) -> Self {
        Self { source }
    }

    /// Fetch each source clipped to `native_extent` into its own container
    /// under `layout`. A failed source is logged and skipped; the others
    /// still run. Container errors are not per-source and abort.
    ///
    /// A source that comes back empty or fails leaves no container behind,
    /// even if an earlier run wrote one.
    pub fn fetch_all(
        &self,
        sources: &[SourceId],
        native_extent: &Extent,
        layout: &OutputLayout,
    ) -> Result<VectorOutcome, BratError> {
        let mut outcome = VectorOutcome::default();
        for source in sources {
            let name = source.layer_name();
            let path = layout.vector_path(&name).into_std_path_buf();
            let query = FeatureQuery::new(source.clone(), native_extent.crs).with_bbox(*native_extent);
            let layer = match self.source.fetch(&query) {
                Ok(layer) => layer.renamed(name.as_str()),
                Err(err) if err.is_layer_failure() => {
                    tracing::warn!(source = %source, error = %err, "vector layer skipped");
                    remove_if_exists(&path)?;
                    outcome.failures.push(LayerFailure {
                        source: source.to_string(),
                        message: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };
            let Some(layer) = layer.non_empty() else {
                tracing::info!(source = %source, "no features within bounds");
                remove_if_exists(&path)?;
                outcome.empty.push(name);
                continue;
            };
            let mut features = 0;
            replace_atomic(&path, |staged| {
                features = GeoPackage::open(staged)?.write_layer(&layer)?;
                Ok(())
            })?;
            tracing::info!(layer = %name, features, "vector layer written");
            outcome.layers.push(WrittenLayer {
                name,
                source: source.to_string(),
                features,
                path,
            });
        }
        Ok(outcome)
    }
}
