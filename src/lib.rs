//! Watershed-scoped input assembly for BRAT projects in British Columbia:
//! boundary and bounds, DEM and hillshade, hydrology and land-cover layers,
//! and a project manifest describing what was written.

pub mod app;
pub mod bounds;
pub mod config;
pub mod crs;
pub mod domain;
pub mod elevation;
pub mod error;
pub mod features;
pub mod fs_util;
pub mod gpkg;
pub mod http;
pub mod hydrology;
pub mod layout;
pub mod manifest;
pub mod ogcapi;
pub mod output;
pub mod raster;
pub mod vectors;
pub mod wfs;
