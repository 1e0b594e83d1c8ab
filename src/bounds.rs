use geo::{BoundingRect, Centroid, GeometryCollection};

use crate::crs::{CrsTransform, query_extent, query_point};
use crate::domain::{Extent, SourceId};
use crate::error::BratError;
use crate::features::{FeatureLayer, FeatureQuery, FeatureSource};

pub const WATERSHED_LAYER: &str = "watershed";

/// Catalogue source and attribute filter selecting one watershed boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatershedTarget {
    pub source: SourceId,
    pub filter: String,
}

#[derive(Debug, Clone)]
pub struct WatershedBounds {
    pub boundary: FeatureLayer,
    pub native: Extent,
    pub query: Extent,
    /// Boundary centroid as `(lon, lat)`.
    pub centroid: (f64, f64),
}

pub struct BoundsResolver<'a, F: FeatureSource + ?Sized> {
    source: &'a F,
    transform: &'a dyn CrsTransform,
}

impl<'a, F: FeatureSource + ?Sized> BoundsResolver<'a, F> {
    pub fn new(source: &'a F, transform: &'a dyn CrsTransform) -> Self {
        Self { source, transform }
    }

    pub fn resolve(&self, target: &WatershedTarget) -> Result<WatershedBounds, BratError> {
        let native_crs = self.transform.native();
        let query = FeatureQuery::new(target.source.clone(), native_crs).with_filter(&target.filter);
        let layer = self
            .source
            .fetch(&query)
            .map_err(|err| BratError::SourceUnavailable {
                layer: target.source.to_string(),
                message: err.to_string(),
            })?;
        if layer.is_empty() {
            return Err(BratError::SourceUnavailable {
                layer: target.source.to_string(),
                message: format!("no watershed matches {}", target.filter),
            });
        }
        tracing::info!(
            source = %target.source,
            filter = %target.filter,
            features = layer.len(),
            "watershed boundary fetched"
        );

        let boundary = FeatureLayer {
            crs: native_crs,
            ..layer
        }
        .renamed(WATERSHED_LAYER);
        let shapes = boundary_geometries(&boundary)?;
        let rect = shapes.bounding_rect().ok_or_else(|| BratError::SourceUnavailable {
            layer: target.source.to_string(),
            message: "watershed boundary has no coordinates".to_string(),
        })?;
        let native = Extent::new(
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y,
            native_crs,
        );
        let query = query_extent(&native, self.transform)?;
        let centroid = shapes
            .centroid()
            .ok_or_else(|| BratError::Projection("watershed centroid is undefined".to_string()))?;
        let centroid = query_point(centroid.x(), centroid.y(), self.transform)?;
        tracing::debug!(native = %native.bbox_param(), query = %query.bbox_param(), "bounds");

        Ok(WatershedBounds {
            boundary,
            native,
            query,
            centroid,
        })
    }
}

fn boundary_geometries(boundary: &FeatureLayer) -> Result<GeometryCollection<f64>, BratError> {
    let mut shapes = Vec::new();
    for feature in &boundary.features {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let shape = geo::Geometry::<f64>::try_from(geometry.clone()).map_err(|err| {
            BratError::SourceUnavailable {
                layer: boundary.source.clone(),
                message: format!("malformed boundary geometry: {err}"),
            }
        })?;
        shapes.push(shape);
    }
    Ok(GeometryCollection(shapes))
}
