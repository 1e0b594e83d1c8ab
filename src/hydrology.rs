use std::path::Path;
use std::thread;

use serde_json::{Map, Value as JsonValue};

use crate::bounds::WATERSHED_LAYER;
use crate::domain::{Crs, Extent, SourceId};
use crate::error::BratError;
use crate::features::{
    FeatureLayer, FeatureQuery, FeatureSource, LayerFailure, WrittenLayer, force_2d_feature,
};
use crate::fs_util::{remove_if_exists, replace_atomic};
use crate::gpkg::GeoPackage;

pub const FLOW_LINES: &str = "flow_lines";
pub const FLOW_AREAS: &str = "flow_areas";
pub const WATERBODIES: &str = "waterbodies";

pub const STREAMS: &str = "WHSE_BASEMAPPING.FWA_STREAM_NETWORKS_SP";
pub const RIVERS: &str = "WHSE_BASEMAPPING.FWA_RIVERS_POLY";
pub const LAKES: &str = "WHSE_BASEMAPPING.FWA_LAKES_POLY";
pub const RESERVOIRS: &str = "WHSE_BASEMAPPING.FWA_MANMADE_WATERBODIES_POLY";

const UPSTREAM_AREA: &str = "upstream_area_ha";
pub const DRAINAGE_AREA: &str = "totdasqkm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrologySources {
    pub streams: SourceId,
    pub rivers: SourceId,
    pub lakes: SourceId,
    pub reservoirs: SourceId,
}

impl Default for HydrologySources {
    fn default() -> Self {
        Self {
            streams: SourceId::from_static(STREAMS),
            rivers: SourceId::from_static(RIVERS),
            lakes: SourceId::from_static(LAKES),
            reservoirs: SourceId::from_static(RESERVOIRS),
        }
    }
}

/// Layers written into the hydrology container, in write order, plus the
/// sources that came back empty and those skipped because their fetch failed.
#[derive(Debug, Clone, Default)]
pub struct HydrologyOutcome {
    pub layers: Vec<WrittenLayer>,
    pub empty: Vec<String>,
    pub failures: Vec<LayerFailure>,
}

pub struct HydrologyAssembler<'a, H: FeatureSource + ?Sized> {
    source: &'a H,
    sources: &'a HydrologySources,
    abort_on_partial_failure: bool,
}

impl<'a, H: FeatureSource + ?Sized> HydrologyAssembler<'a, H> {
    pub fn new(source: &'a H, sources: &'a HydrologySources) -> Self {
        Self {
            source,
            sources,
            abort_on_partial_failure: false,
        }
    }

    pub fn abort_on_partial_failure(mut self, abort: bool) -> Self {
        self.abort_on_partial_failure = abort;
        self
    }

    /// Fetch the four hydrology sources within `query_extent`, then write the
    /// boundary and every non-empty derived layer into `container`.
    ///
    /// The container is rebuilt on every call. When a fetch fails under the
    /// abort policy nothing is written and any earlier container is removed.
    pub fn assemble(
        &self,
        boundary: &FeatureLayer,
        query_extent: &Extent,
        container: &Path,
    ) -> Result<HydrologyOutcome, BratError> {
        let mut outcome = HydrologyOutcome::default();
        let [streams, rivers, lakes, reservoirs] = thread::scope(|scope| {
            [
                &self.sources.streams,
                &self.sources.rivers,
                &self.sources.lakes,
                &self.sources.reservoirs,
            ]
            .map(|source| scope.spawn(move || self.fetch(source, query_extent)))
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
        });

        let settled = self.settle_all([streams, rivers, lakes, reservoirs], &mut outcome);
        let [streams, rivers, lakes, reservoirs] = match settled {
            Ok(layers) => layers,
            Err(err) => {
                remove_if_exists(container)?;
                return Err(err);
            }
        };

        let flow_lines = streams.map(|layer| normalize_streams(layer).renamed(FLOW_LINES));
        let flow_areas = rivers.map(|layer| layer.renamed(FLOW_AREAS));
        let waterbodies = merge_waterbodies(lakes, reservoirs);
        let boundary = boundary.clone().renamed(WATERSHED_LAYER);
        let layers: Vec<FeatureLayer> = [Some(boundary), flow_lines, flow_areas, waterbodies]
            .into_iter()
            .flatten()
            .collect();

        // Built from scratch, so layers from an earlier run never linger.
        replace_atomic(container, |staged| {
            let mut gpkg = GeoPackage::open(staged)?;
            for layer in &layers {
                let features = gpkg.write_layer(layer)?;
                tracing::info!(layer = %layer.name, features, "hydrology layer written");
                outcome.layers.push(WrittenLayer {
                    name: layer.name.clone(),
                    source: layer.source.clone(),
                    features,
                    path: container.to_path_buf(),
                });
            }
            Ok(())
        })?;
        Ok(outcome)
    }

    fn fetch(
        &self,
        source: &SourceId,
        query_extent: &Extent,
    ) -> Result<Option<FeatureLayer>, BratError> {
        let query = FeatureQuery::new(source.clone(), Crs::Wgs84).with_bbox(*query_extent);
        let layer = self.source.fetch(&query)?;
        tracing::debug!(source = %source, features = layer.len(), "hydrology fetch");
        Ok(layer.non_empty())
    }

    fn settle_all(
        &self,
        fetched: [Result<Option<FeatureLayer>, BratError>; 4],
        outcome: &mut HydrologyOutcome,
    ) -> Result<[Option<FeatureLayer>; 4], BratError> {
        let [streams, rivers, lakes, reservoirs] = fetched;
        Ok([
            self.settle(streams, &self.sources.streams, outcome)?,
            self.settle(rivers, &self.sources.rivers, outcome)?,
            self.settle(lakes, &self.sources.lakes, outcome)?,
            self.settle(reservoirs, &self.sources.reservoirs, outcome)?,
        ])
    }

    fn settle(
        &self,
        fetched: Result<Option<FeatureLayer>, BratError>,
        source: &SourceId,
        outcome: &mut HydrologyOutcome,
    ) -> Result<Option<FeatureLayer>, BratError> {
        match fetched {
            Ok(None) => {
                outcome.empty.push(source.layer_name());
                Ok(None)
            }
            Ok(layer) => Ok(layer),
            Err(err) if self.abort_on_partial_failure => Err(BratError::PartialHydrologyFailure {
                layer: source.to_string(),
                message: err.to_string(),
            }),
            Err(err) => {
                tracing::warn!(source = %source, error = %err, "hydrology source skipped");
                outcome.failures.push(LayerFailure {
                    source: source.to_string(),
                    message: err.to_string(),
                });
                Ok(None)
            }
        }
    }
}

/// Flatten every stream to 2D and attach the drainage area in km².
pub fn normalize_streams(mut layer: FeatureLayer) -> FeatureLayer {
    for feature in &mut layer.features {
        force_2d_feature(feature);
        let properties = feature.properties.get_or_insert_with(Map::new);
        let area = drainage_area_km2(properties);
        properties.insert(DRAINAGE_AREA.to_string(), area);
    }
    layer
}

/// `upstream_area_ha * 0.01`, or null when the source value is missing or
/// not numeric.
pub fn drainage_area_km2(properties: &Map<String, JsonValue>) -> JsonValue {
    properties
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(UPSTREAM_AREA))
        .and_then(|(_, value)| value.as_f64())
        .map_or(JsonValue::Null, |hectares| JsonValue::from(hectares * 0.01))
}

/// Lakes and reservoirs combined into one `waterbodies` layer. Either side
/// alone passes through with its records untouched; both present concatenate
/// lakes then reservoirs; neither present yields no layer.
pub fn merge_waterbodies(
    lakes: Option<FeatureLayer>,
    reservoirs: Option<FeatureLayer>,
) -> Option<FeatureLayer> {
    let lakes = lakes.and_then(FeatureLayer::non_empty);
    let reservoirs = reservoirs.and_then(FeatureLayer::non_empty);
    match (lakes, reservoirs) {
        (None, None) => None,
        (Some(lakes), None) => Some(lakes.renamed(WATERBODIES)),
        (None, Some(reservoirs)) => Some(reservoirs.renamed(WATERBODIES)),
        (Some(mut lakes), Some(reservoirs)) => {
            lakes.source = format!("{}+{}", lakes.source, reservoirs.source);
            lakes.features.extend(reservoirs.features);
            Some(lakes.renamed(WATERBODIES))
        }
    }
}

#[cfg(test)]
mod tests {
    use geojson::{Feature, Geometry, Value};
    use serde_json::json;

    use super::*;

    fn stream(area: Option<f64>) -> Feature {
        let mut properties = Map::new();
        if let Some(area) = area {
            properties.insert(UPSTREAM_AREA.to_string(), json!(area));
        }
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::LineString(vec![
                vec![-120.0, 50.0, 410.0],
                vec![-120.1, 50.1, 402.0],
            ]))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }
    }

    fn layer(name: &str, count: usize) -> FeatureLayer {
        FeatureLayer::new(name, name, Crs::Wgs84).with_features(vec![stream(Some(1.0)); count])
    }

    #[test]
    fn drainage_area_converts_hectares() {
        let normalized = normalize_streams(
            FeatureLayer::new(STREAMS, "s", Crs::Wgs84).with_features(vec![stream(Some(1250.0))]),
        );
        let properties = normalized.features[0].properties.as_ref().unwrap();
        assert_eq!(properties[DRAINAGE_AREA], json!(1250.0 * 0.01));
    }

    #[test]
    fn missing_upstream_area_is_null() {
        let normalized = normalize_streams(
            FeatureLayer::new(STREAMS, "s", Crs::Wgs84).with_features(vec![stream(None)]),
        );
        let properties = normalized.features[0].properties.as_ref().unwrap();
        assert_eq!(properties[DRAINAGE_AREA], JsonValue::Null);
    }

    #[test]
    fn streams_are_flattened() {
        let normalized = normalize_streams(
            FeatureLayer::new(STREAMS, "s", Crs::Wgs84).with_features(vec![stream(Some(2.0))]),
        );
        let geometry = normalized.features[0].geometry.as_ref().unwrap();
        assert!(!crate::features::has_z(geometry));
    }

    #[test]
    fn merge_neither() {
        assert!(merge_waterbodies(None, Some(layer("r", 0))).is_none());
    }

    #[test]
    fn merge_one_side_passes_through() {
        let lakes = merge_waterbodies(Some(layer("l", 3)), None).unwrap();
        assert_eq!((lakes.name.as_str(), lakes.source.as_str(), lakes.len()), (WATERBODIES, "l", 3));
        let reservoirs = merge_waterbodies(Some(layer("l", 0)), Some(layer("r", 2))).unwrap();
        assert_eq!(reservoirs.source, "r");
        assert_eq!(reservoirs.len(), 2);
    }

    #[test]
    fn merge_both_concatenates_lakes_first() {
        let mut lakes = layer("l", 1);
        lakes.features[0].id = Some(geojson::feature::Id::String("lake".to_string()));
        let merged = merge_waterbodies(Some(lakes), Some(layer("r", 2))).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(
            merged.features[0].id,
            Some(geojson::feature::Id::String("lake".to_string()))
        );
    }
}
