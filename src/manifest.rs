//! Project manifest: a Riverscapes-style XML document describing every
//! dataset a run persisted.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, Value};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;

use crate::domain::{Crs, Extent};
use crate::error::BratError;
use crate::features::WrittenLayer;
use crate::fs_util::write_bytes_atomic;

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const PROJECT_XSD: &str =
    "https://xml.riverscapes.net/Projects/XSD/V2/RiverscapesProject.xsd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub name: String,
    pub value: String,
}

impl Meta {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Root of the manifest tree (the `<Project>` element).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub name: String,
    pub project_type: String,
    pub description: Option<String>,
    pub citation: Option<String>,
    pub metadata: Vec<Meta>,
    pub bounds: Option<ProjectBounds>,
    pub realizations: Vec<Realization>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectBounds {
    /// `(lon, lat)`
    pub centroid: (f64, f64),
    pub bbox: Extent,
    /// Bounds geometry document, relative to the project directory.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Realization {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub date_created: String,
    pub product_version: String,
    pub metadata: Vec<Meta>,
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dataset {
    Raster {
        id: String,
        name: String,
        path: String,
    },
    Geopackage {
        id: String,
        name: String,
        path: String,
        layers: Vec<Layer>,
    },
}

impl Dataset {
    pub fn id(&self) -> &str {
        match self {
            Dataset::Raster { id, .. } | Dataset::Geopackage { id, .. } => id,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        match self {
            Dataset::Raster { .. } => &[],
            Dataset::Geopackage { layers, .. } => layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    /// Table name inside the container (`lyrName`).
    pub name: String,
    pub label: String,
    pub metadata: Vec<Meta>,
}

impl Layer {
    pub fn written(layer: &WrittenLayer) -> Self {
        Self {
            name: layer.name.clone(),
            label: layer_label(&layer.name),
            metadata: vec![
                Meta::new("SourceId", layer.source.clone()),
                Meta::new("FeatureCount", layer.features.to_string()),
            ],
        }
    }
}

fn layer_label(name: &str) -> String {
    match name {
        "watershed" => "Watershed Boundary".to_string(),
        "flow_lines" => "Flow Lines".to_string(),
        "flow_areas" => "Flow Areas".to_string(),
        "waterbodies" => "Waterbodies".to_string(),
        other => other.to_string(),
    }
}

impl Manifest {
    /// Register a dataset under the current (last) realization.
    pub fn push_dataset(&mut self, dataset: Dataset) -> Result<(), BratError> {
        let realization = self.realizations.last_mut().ok_or_else(|| {
            BratError::ManifestSerialization("manifest has no realization".to_string())
        })?;
        realization.datasets.push(dataset);
        Ok(())
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.realizations
            .iter()
            .flat_map(|realization| realization.datasets.iter())
    }

    pub fn dataset(&self, id: &str) -> Option<&Dataset> {
        self.datasets().find(|dataset| dataset.id() == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub model_version: String,
    pub created: DateTime<Utc>,
    pub created_by: Option<String>,
    pub config_path: Option<String>,
}

impl Provenance {
    pub fn capture(config_path: Option<&Path>) -> Self {
        Self {
            model_version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            created_by: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok()
                .filter(|user| !user.is_empty()),
            config_path: config_path.map(|path| path.display().to_string()),
        }
    }

    pub fn timestamp(&self) -> String {
        self.created.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Automatic project metadata, ahead of any configured entries.
    pub fn metadata(&self) -> Vec<Meta> {
        let mut metadata = vec![
            Meta::new("ModelVersion", self.model_version.clone()),
            Meta::new("DateCreated", self.timestamp()),
        ];
        if let Some(user) = &self.created_by {
            metadata.push(Meta::new("CreatedBy", user.clone()));
        }
        if let Some(path) = &self.config_path {
            metadata.push(Meta::new("ConfigPath", path.clone()));
        }
        metadata
    }
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn emit(&mut self, event: Event<'_>) -> Result<(), BratError> {
        self.writer
            .write_event(event)
            .map_err(|err| BratError::ManifestSerialization(err.to_string()))
    }

    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), BratError> {
        let mut start = BytesStart::new(name);
        for attribute in attributes {
            start.push_attribute(*attribute);
        }
        self.emit(Event::Start(start))
    }

    fn end(&mut self, name: &str) -> Result<(), BratError> {
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn text(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<(), BratError> {
        self.start(name, attributes)?;
        if !text.is_empty() {
            self.emit(Event::Text(BytesText::new(text)))?;
        }
        self.end(name)
    }

    fn optional_text(&mut self, name: &str, text: Option<&str>) -> Result<(), BratError> {
        match text {
            Some(text) => self.text(name, &[], text),
            None => Ok(()),
        }
    }

    fn metadata(&mut self, metadata: &[Meta]) -> Result<(), BratError> {
        if metadata.is_empty() {
            return Ok(());
        }
        self.start("MetaData", &[])?;
        for meta in metadata {
            self.text("Meta", &[("name", meta.name.as_str())], &meta.value)?;
        }
        self.end("MetaData")
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.writer.into_inner();
        bytes.push(b'\n');
        bytes
    }
}

fn coordinate(value: f64) -> String {
    value.to_string()
}

/// Render the manifest as XML. Pure: the same manifest always yields the same
/// bytes.
pub fn serialize(manifest: &Manifest) -> Result<Vec<u8>, BratError> {
    let mut out = XmlOut::new();
    out.emit(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    out.start(
        "Project",
        &[
            ("xmlns:xsi", XSI_NAMESPACE),
            ("xsi:noNamespaceSchemaLocation", PROJECT_XSD),
        ],
    )?;
    out.text("Name", &[], &manifest.name)?;
    out.text("ProjectType", &[], &manifest.project_type)?;
    out.optional_text("Description", manifest.description.as_deref())?;
    out.optional_text("Citation", manifest.citation.as_deref())?;
    out.metadata(&manifest.metadata)?;
    if let Some(bounds) = &manifest.bounds {
        write_bounds(&mut out, bounds)?;
    }
    out.start("Realizations", &[])?;
    for realization in &manifest.realizations {
        write_realization(&mut out, realization)?;
    }
    out.end("Realizations")?;
    out.end("Project")?;
    Ok(out.into_bytes())
}

fn write_bounds(out: &mut XmlOut, bounds: &ProjectBounds) -> Result<(), BratError> {
    let (lon, lat) = bounds.centroid;
    out.start("ProjectBounds", &[])?;
    out.start("Centroid", &[])?;
    out.text("Lat", &[], &coordinate(lat))?;
    out.text("Lng", &[], &coordinate(lon))?;
    out.end("Centroid")?;
    out.start("BoundingBox", &[])?;
    out.text("MinLng", &[], &coordinate(bounds.bbox.min_x))?;
    out.text("MinLat", &[], &coordinate(bounds.bbox.min_y))?;
    out.text("MaxLng", &[], &coordinate(bounds.bbox.max_x))?;
    out.text("MaxLat", &[], &coordinate(bounds.bbox.max_y))?;
    out.end("BoundingBox")?;
    out.text("Path", &[], &bounds.path)?;
    out.end("ProjectBounds")
}

fn write_realization(out: &mut XmlOut, realization: &Realization) -> Result<(), BratError> {
    out.start(
        "Realization",
        &[
            ("id", realization.id.as_str()),
            ("dateCreated", realization.date_created.as_str()),
            ("productVersion", realization.product_version.as_str()),
        ],
    )?;
    out.text("Name", &[], &realization.name)?;
    out.optional_text("Description", realization.description.as_deref())?;
    out.metadata(&realization.metadata)?;
    out.start("Inputs", &[])?;
    for dataset in &realization.datasets {
        match dataset {
            Dataset::Raster { id, name, path } => {
                out.start("Raster", &[("id", id.as_str())])?;
                out.text("Name", &[], name)?;
                out.text("Path", &[], path)?;
                out.end("Raster")?;
            }
            Dataset::Geopackage {
                id,
                name,
                path,
                layers,
            } => {
                out.start("Geopackage", &[("id", id.as_str())])?;
                out.text("Name", &[], name)?;
                out.text("Path", &[], path)?;
                out.start("Layers", &[])?;
                for layer in layers {
                    out.start("Vector", &[("lyrName", layer.name.as_str())])?;
                    out.text("Name", &[], &layer.label)?;
                    out.metadata(&layer.metadata)?;
                    out.end("Vector")?;
                }
                out.end("Layers")?;
                out.end("Geopackage")?;
            }
        }
    }
    out.end("Inputs")?;
    out.end("Realization")
}

pub fn write_manifest(manifest: &Manifest, path: &Path) -> Result<(), BratError> {
    let bytes = serialize(manifest)?;
    write_bytes_atomic(path, &bytes)
        .map_err(|err| BratError::ManifestSerialization(err.to_string()))?;
    tracing::info!(path = %path.display(), "manifest written");
    Ok(())
}

/// The query extent as a one-polygon GeoJSON feature collection.
pub fn bounds_document(extent: &Extent) -> Result<GeoJson, BratError> {
    if extent.crs != Crs::Wgs84 {
        return Err(BratError::Projection(format!(
            "bounds document must be in {}, got {}",
            Crs::Wgs84,
            extent.crs
        )));
    }
    let ring = extent
        .corners()
        .iter()
        .chain(extent.corners().first())
        .map(|&(x, y)| vec![x, y])
        .collect();
    let feature = Feature {
        bbox: Some(extent.as_array().to_vec()),
        geometry: Some(Geometry::new(Value::Polygon(vec![ring]))),
        id: None,
        properties: None,
        foreign_members: None,
    };
    Ok(GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features: vec![feature],
        foreign_members: None,
    }))
}

pub fn write_bounds_document(extent: &Extent, path: &Path) -> Result<(), BratError> {
    let document = bounds_document(extent)?;
    write_bytes_atomic(path, document.to_string().as_bytes())
}
