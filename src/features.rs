use std::path::PathBuf;

use geojson::{Feature, GeoJson, Geometry, Value};
use serde::Serialize;

use crate::domain::{Crs, Extent, SourceId};
use crate::error::BratError;

#[derive(Debug, Clone)]
pub struct FeatureQuery {
    pub source: SourceId,
    pub crs: Crs,
    pub bbox: Option<Extent>,
    pub filter: Option<String>,
}

impl FeatureQuery {
    pub fn new(source: SourceId, crs: Crs) -> Self {
        Self {
            source,
            crs,
            bbox: None,
            filter: None,
        }
    }

    pub fn with_bbox(mut self, bbox: Extent) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

pub trait FeatureSource: Send + Sync {
    fn fetch(&self, query: &FeatureQuery) -> Result<FeatureLayer, BratError>;
}

/// Ordered records sharing a schema, tagged with where they came from and the
/// layer name they are written under.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayer {
    pub source: String,
    pub name: String,
    pub crs: Crs,
    pub features: Vec<Feature>,
}

impl FeatureLayer {
    pub fn new(source: impl Into<String>, name: impl Into<String>, crs: Crs) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            crs,
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<Feature>) -> Self {
        self.features = features;
        self
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// `None` for a layer with no records, so absence can be matched on.
    pub fn non_empty(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }

    pub fn extent(&self) -> Option<Extent> {
        let mut points = Vec::new();
        for feature in &self.features {
            if let Some(geometry) = &feature.geometry {
                collect_points(&geometry.value, &mut points);
            }
        }
        Extent::from_points(points, self.crs)
    }

    /// Attribute keys in order of first appearance across all records.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for feature in &self.features {
            if let Some(properties) = &feature.properties {
                for key in properties.keys() {
                    if !names.iter().any(|name| name == key) {
                        names.push(key.clone());
                    }
                }
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenLayer {
    pub name: String,
    pub source: String,
    pub features: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerFailure {
    pub source: String,
    pub message: String,
}

/// Parse a GeoJSON document into its features. A bare feature is accepted as
/// a collection of one.
pub fn parse_features(layer: &str, text: &str) -> Result<Vec<Feature>, BratError> {
    let geojson = text
        .parse::<GeoJson>()
        .map_err(|err| BratError::SourceUnavailable {
            layer: layer.to_string(),
            message: format!("malformed GeoJSON response: {err}"),
        })?;
    match geojson {
        GeoJson::FeatureCollection(collection) => Ok(collection.features),
        GeoJson::Feature(feature) => Ok(vec![feature]),
        GeoJson::Geometry(_) => Err(BratError::SourceUnavailable {
            layer: layer.to_string(),
            message: "expected a feature collection, got a bare geometry".to_string(),
        }),
    }
}

/// Drop every ordinate past the second; elevation and measure values are
/// discarded. Applying this twice is the same as applying it once.
pub fn force_2d(geometry: &Geometry) -> Geometry {
    let mut flattened = Geometry::new(flatten_value(&geometry.value));
    flattened.bbox = geometry.bbox.as_ref().map(|bbox| flatten_bbox(bbox));
    flattened.foreign_members = geometry.foreign_members.clone();
    flattened
}

pub fn force_2d_feature(feature: &mut Feature) {
    if let Some(geometry) = feature.geometry.take() {
        feature.geometry = Some(force_2d(&geometry));
    }
}

pub fn has_z(geometry: &Geometry) -> bool {
    let mut found = false;
    visit_positions(&geometry.value, &mut |position: &Vec<f64>| {
        found |= position.len() > 2;
    });
    found
}

fn flatten_value(value: &Value) -> Value {
    let flat = |position: &Vec<f64>| position.iter().take(2).copied().collect::<Vec<f64>>();
    match value {
        Value::Point(position) => Value::Point(flat(position)),
        Value::MultiPoint(points) => Value::MultiPoint(points.iter().map(flat).collect()),
        Value::LineString(line) => Value::LineString(line.iter().map(flat).collect()),
        Value::MultiLineString(lines) => Value::MultiLineString(
            lines
                .iter()
                .map(|line| line.iter().map(flat).collect())
                .collect(),
        ),
        Value::Polygon(rings) => Value::Polygon(
            rings
                .iter()
                .map(|ring| ring.iter().map(flat).collect())
                .collect(),
        ),
        Value::MultiPolygon(polygons) => Value::MultiPolygon(
            polygons
                .iter()
                .map(|rings| {
                    rings
                        .iter()
                        .map(|ring| ring.iter().map(flat).collect())
                        .collect()
                })
                .collect(),
        ),
        Value::GeometryCollection(geometries) => {
            Value::GeometryCollection(geometries.iter().map(force_2d).collect())
        }
    }
}

fn flatten_bbox(bbox: &[f64]) -> Vec<f64> {
    // [minx, miny, minz, maxx, maxy, maxz] -> [minx, miny, maxx, maxy]
    if bbox.len() == 6 {
        vec![bbox[0], bbox[1], bbox[3], bbox[4]]
    } else {
        bbox.to_vec()
    }
}

fn visit_positions(value: &Value, visit: &mut dyn FnMut(&Vec<f64>)) {
    match value {
        Value::Point(position) => visit(position),
        Value::MultiPoint(positions) | Value::LineString(positions) => {
            positions.iter().for_each(|position| visit(position))
        }
        Value::MultiLineString(lines) | Value::Polygon(lines) => lines
            .iter()
            .flatten()
            .for_each(|position| visit(position)),
        Value::MultiPolygon(polygons) => polygons
            .iter()
            .flatten()
            .flatten()
            .for_each(|position| visit(position)),
        Value::GeometryCollection(geometries) => {
            for geometry in geometries {
                visit_positions(&geometry.value, visit);
            }
        }
    }
}

pub(crate) fn collect_points(value: &Value, points: &mut Vec<(f64, f64)>) {
    visit_positions(value, &mut |position: &Vec<f64>| {
        if position.len() >= 2 {
            points.push((position[0], position[1]));
        }
    });
}
