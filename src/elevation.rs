use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;

use crate::domain::{Crs, Extent};
use crate::error::BratError;
use crate::fs_util::write_bytes_atomic;
use crate::http;

pub const DEFAULT_ELEVATION_URL: &str = "https://openmaps.gov.bc.ca/om/wcs";
pub const DEM_COVERAGE: &str = "pub:bc_elevation_25m_bcalb";

/// Source of an elevation grid. The raster is written to `destination`; no
/// other file is created.
pub trait ElevationSource: Send + Sync {
    fn fetch_dem(
        &self,
        extent: &Extent,
        resolution: f64,
        destination: &Path,
    ) -> Result<(), BratError>;
}

#[derive(Clone)]
pub struct WcsElevationClient {
    client: Client,
    base_url: String,
    coverage: String,
}

impl WcsElevationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BratError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(300))?,
            base_url: base_url.into(),
            coverage: DEM_COVERAGE.to_string(),
        })
    }

    pub fn query_params(
        &self,
        extent: &Extent,
        resolution: f64,
    ) -> Result<Vec<(String, String)>, BratError> {
        if extent.crs != Crs::BcAlbers {
            return Err(BratError::ElevationHttp(format!(
                "coverage bounds must be in {}, got {}",
                Crs::BcAlbers,
                extent.crs
            )));
        }
        if resolution.is_nan() || resolution <= 0.0 {
            return Err(BratError::ElevationHttp(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        let aligned = align_to_grid(extent, resolution);
        Ok(vec![
            ("service".to_string(), "WCS".to_string()),
            ("version".to_string(), "1.0.0".to_string()),
            ("request".to_string(), "GetCoverage".to_string()),
            ("coverage".to_string(), self.coverage.clone()),
            ("Format".to_string(), "GeoTIFF".to_string()),
            ("bbox".to_string(), aligned.bbox_param()),
            ("CRS".to_string(), extent.crs.code()),
            ("RESPONSE_CRS".to_string(), extent.crs.code()),
            ("resx".to_string(), resolution.to_string()),
            ("resy".to_string(), resolution.to_string()),
        ])
    }
}

impl ElevationSource for WcsElevationClient {
    fn fetch_dem(
        &self,
        extent: &Extent,
        resolution: f64,
        destination: &Path,
    ) -> Result<(), BratError> {
        let params = self.query_params(extent, resolution)?;
        let response = http::send_with_retries(|| self.client.get(&self.base_url).query(&params))
            .map_err(|err| BratError::ElevationHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "coverage request failed".to_string());
            return Err(BratError::ElevationStatus {
                status: status.as_u16(),
                message,
            });
        }
        // Service exceptions come back as 200 with an XML body.
        let is_xml = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("xml"));
        let body = response
            .bytes()
            .map_err(|err| BratError::ElevationHttp(err.to_string()))?;
        if is_xml {
            return Err(BratError::ElevationStatus {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        write_bytes_atomic(destination, &body)?;
        tracing::info!(path = %destination.display(), bytes = body.len(), "DEM written");
        Ok(())
    }
}

/// Snap `extent` outward onto the cell edges of the provincial grid, whose
/// cell edges sit half a cell off the origin.
pub fn align_to_grid(extent: &Extent, resolution: f64) -> Extent {
    let half = resolution / 2.0;
    let down = |value: f64| ((value - half) / resolution).floor() * resolution + half;
    let up = |value: f64| ((value - half) / resolution).ceil() * resolution + half;
    Extent::new(
        down(extent.min_x),
        down(extent.min_y),
        up(extent.max_x),
        up(extent.max_y),
        extent.crs,
    )
}
