use std::time::Duration;

use reqwest::blocking::Client;

use crate::domain::Extent;
use crate::error::BratError;
use crate::features::{FeatureLayer, FeatureQuery, FeatureSource, parse_features};
use crate::http;

pub const DEFAULT_WFS_URL: &str = "https://openmaps.gov.bc.ca/geo/pub/wfs";
const PAGE_SIZE: usize = 10_000;
/// Present on every table of the provincial catalogue.
pub const DEFAULT_SORT_KEY: &str = "OBJECTID";

#[derive(Clone)]
pub struct WfsClient {
    client: Client,
    base_url: String,
    geometry_column: String,
    sort_key: String,
}

impl WfsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BratError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(120))?,
            base_url: base_url.into(),
            geometry_column: "GEOMETRY".to_string(),
            sort_key: DEFAULT_SORT_KEY.to_string(),
        })
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = column.into();
        self
    }

    /// Pages are sorted on `column`. It must be unique per record, or
    /// `startIndex` paging can repeat or skip features.
    pub fn with_sort_key(mut self, column: impl Into<String>) -> Self {
        self.sort_key = column.into();
        self
    }

    pub fn query_params(&self, query: &FeatureQuery) -> Vec<(String, String)> {
        let mut params = vec![
            ("service".to_string(), "WFS".to_string()),
            ("version".to_string(), "2.0.0".to_string()),
            ("request".to_string(), "GetFeature".to_string()),
            ("typeName".to_string(), query.source.as_str().to_string()),
            ("outputFormat".to_string(), "json".to_string()),
            ("SRSNAME".to_string(), query.crs.code()),
            ("sortBy".to_string(), self.sort_key.clone()),
        ];
        match (&query.filter, &query.bbox) {
            (Some(filter), Some(bbox)) => params.push((
                "CQL_FILTER".to_string(),
                format!("({filter}) AND {}", self.cql_bbox(bbox)),
            )),
            (Some(filter), None) => params.push(("CQL_FILTER".to_string(), filter.clone())),
            (None, Some(bbox)) => params.push((
                "bbox".to_string(),
                format!("{},{}", bbox.bbox_param(), bbox.crs.code()),
            )),
            (None, None) => {}
        }
        params
    }

    fn cql_bbox(&self, bbox: &Extent) -> String {
        format!(
            "BBOX({},{},'{}')",
            self.geometry_column,
            bbox.bbox_param(),
            bbox.crs.code()
        )
    }

    fn fetch_page(
        &self,
        query: &FeatureQuery,
        params: &[(String, String)],
        start_index: usize,
    ) -> Result<Vec<geojson::Feature>, BratError> {
        let layer = query.source.as_str();
        let paging = [
            ("count".to_string(), PAGE_SIZE.to_string()),
            ("startIndex".to_string(), start_index.to_string()),
        ];
        let response = http::send_with_retries(|| {
            self.client
                .get(&self.base_url)
                .query(params)
                .query(&paging)
        })
        .map_err(|err| BratError::SourceUnavailable {
            layer: layer.to_string(),
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "WFS request failed".to_string());
            return Err(BratError::SourceStatus {
                layer: layer.to_string(),
                status,
                message,
            });
        }
        let text = response
            .text()
            .map_err(|err| BratError::SourceUnavailable {
                layer: layer.to_string(),
                message: err.to_string(),
            })?;
        parse_features(layer, &text)
    }
}

impl FeatureSource for WfsClient {
    fn fetch(&self, query: &FeatureQuery) -> Result<FeatureLayer, BratError> {
        let params = self.query_params(query);
        let mut features = Vec::new();
        loop {
            let page = self.fetch_page(query, &params, features.len())?;
            let page_len = page.len();
            features.extend(page);
            tracing::debug!(source = %query.source, total = features.len(), "wfs page");
            if page_len < PAGE_SIZE {
                break;
            }
        }
        Ok(
            FeatureLayer::new(query.source.as_str(), query.source.layer_name(), query.crs)
                .with_features(features),
        )
    }
}
