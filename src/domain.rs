use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BratError;

pub const ASSESSMENT_WATERSHEDS: &str = "WHSE_BASEMAPPING.FWA_ASSESSMENT_WATERSHEDS_POLY";
pub const WATERSHED_GROUPS: &str = "WHSE_BASEMAPPING.FWA_WATERSHED_GROUPS_POLY";

/// Catalogue identifier of a feature source, `SCHEMA.TABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// For compile-time catalogue constants, which are known to be well formed.
    pub(crate) fn from_static(id: &'static str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Output layer name: the portion after the first namespace separator,
    /// lower-cased.
    pub fn layer_name(&self) -> String {
        match self.0.split_once('.') {
            Some((_, table)) => table.to_lowercase(),
            None => self.0.to_lowercase(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceId {
    type Err = BratError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let valid = normalized
            .split_once('.')
            .map(|(schema, table)| {
                !schema.is_empty()
                    && !table.is_empty()
                    && normalized
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
            })
            .unwrap_or(false);
        if !valid {
            return Err(BratError::InvalidSourceId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for SourceId {
    type Error = BratError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatershedKey {
    /// Assessment watershed, by `WATERSHED_FEATURE_ID`.
    FeatureId(u64),
    /// Watershed Group, by its four letter code.
    Group(String),
}

impl WatershedKey {
    pub fn source(&self) -> SourceId {
        let table = match self {
            WatershedKey::FeatureId(_) => ASSESSMENT_WATERSHEDS,
            WatershedKey::Group(_) => WATERSHED_GROUPS,
        };
        SourceId(table.to_string())
    }

    pub fn filter(&self) -> String {
        match self {
            WatershedKey::FeatureId(id) => format!("WATERSHED_FEATURE_ID={id}"),
            WatershedKey::Group(code) => format!("WATERSHED_GROUP_CODE='{code}'"),
        }
    }
}

impl fmt::Display for WatershedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatershedKey::FeatureId(id) => write!(f, "{id}"),
            WatershedKey::Group(code) => write!(f, "group:{code}"),
        }
    }
}

impl FromStr for WatershedKey {
    type Err = BratError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some(code) = trimmed.strip_prefix("group:") {
            let code = code.trim().to_uppercase();
            if code.len() != 4 || !code.chars().all(|ch| ch.is_ascii_alphabetic()) {
                return Err(BratError::InvalidWatershedKey(value.to_string()));
            }
            return Ok(WatershedKey::Group(code));
        }
        trimmed
            .parse::<u64>()
            .map(WatershedKey::FeatureId)
            .map_err(|_| BratError::InvalidWatershedKey(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// NAD83 / BC Albers, the projected frame of the provincial catalogue.
    BcAlbers,
    /// WGS 84 longitude/latitude, used by bounding-box query interfaces.
    Wgs84,
}

impl Crs {
    pub fn epsg(self) -> u32 {
        match self {
            Crs::BcAlbers => 3005,
            Crs::Wgs84 => 4326,
        }
    }

    pub fn code(self) -> String {
        format!("EPSG:{}", self.epsg())
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub crs: Crs,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs,
        }
    }

    /// Smallest extent containing every point; `None` for no points.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>, crs: Crs) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let mut extent = Self::new(x, y, x, y, crs);
        for (x, y) in iter {
            extent.min_x = extent.min_x.min(x);
            extent.min_y = extent.min_y.min(y);
            extent.max_x = extent.max_x.max(x);
            extent.max_y = extent.max_y.max(y);
        }
        Some(extent)
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.min_x, self.max_y),
            (self.max_x, self.max_y),
            (self.max_x, self.min_y),
        ]
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// Comma-joined `min_x,min_y,max_x,max_y`, as used in request URLs.
    pub fn bbox_param(&self) -> String {
        self.as_array()
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn rounded(&self, decimals: i32) -> Self {
        let factor = 10f64.powi(decimals);
        let round = |value: f64| (value * factor).round() / factor;
        Self::new(
            round(self.min_x),
            round(self.min_y),
            round(self.max_x),
            round(self.max_y),
            self.crs,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.as_array().iter().all(|value| value.is_finite())
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
    }
}
