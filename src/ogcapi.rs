use std::time::Duration;

use reqwest::blocking::Client;

use crate::domain::Crs;
use crate::error::BratError;
use crate::features::{FeatureLayer, FeatureQuery, FeatureSource, parse_features};
use crate::http;

pub const DEFAULT_FEATURES_URL: &str = "https://features.hillcrestgeo.ca/fwa";
const PAGE_LIMIT: usize = 10_000;

/// Client for an OGC API - Features server. Bounding boxes are always
/// longitude/latitude, so queries must be expressed in the geographic frame.
#[derive(Clone)]
pub struct OgcFeaturesClient {
    client: Client,
    base_url: String,
}

impl OgcFeaturesClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BratError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(120))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn items_url(&self, query: &FeatureQuery) -> String {
        format!(
            "{}/collections/{}/items.json",
            self.base_url,
            query.source.as_str().to_lowercase()
        )
    }

    pub fn query_params(&self, query: &FeatureQuery) -> Result<Vec<(String, String)>, BratError> {
        let layer = query.source.as_str().to_string();
        if query.crs != Crs::Wgs84 {
            return Err(BratError::SourceUnavailable {
                layer,
                message: format!("features API only serves {}", Crs::Wgs84),
            });
        }
        let mut params = vec![("limit".to_string(), PAGE_LIMIT.to_string())];
        if let Some(bbox) = &query.bbox {
            if bbox.crs != Crs::Wgs84 {
                return Err(BratError::SourceUnavailable {
                    layer,
                    message: format!("bbox must be in {}, got {}", Crs::Wgs84, bbox.crs),
                });
            }
            params.push(("bbox".to_string(), bbox.bbox_param()));
        }
        if let Some(filter) = &query.filter {
            params.push(("filter".to_string(), filter.clone()));
        }
        Ok(params)
    }
}

impl FeatureSource for OgcFeaturesClient {
    fn fetch(&self, query: &FeatureQuery) -> Result<FeatureLayer, BratError> {
        let layer = query.source.as_str();
        let url = self.items_url(query);
        let params = self.query_params(query)?;
        let mut features = Vec::new();
        loop {
            let offset = [("offset".to_string(), features.len().to_string())];
            let response =
                http::send_with_retries(|| self.client.get(&url).query(&params).query(&offset))
                    .map_err(|err| BratError::SourceUnavailable {
                        layer: layer.to_string(),
                        message: err.to_string(),
                    })?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "features request failed".to_string());
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
            let page = parse_features(layer, &text)?;
            let page_len = page.len();
            features.extend(page);
            if page_len < PAGE_LIMIT {
                break;
            }
        }
        Ok(
            FeatureLayer::new(layer, query.source.layer_name(), Crs::Wgs84)
                .with_features(features),
        )
    }
}
