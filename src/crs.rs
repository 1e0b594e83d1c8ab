use crate::domain::{Crs, Extent};
use crate::error::BratError;

/// Decimal places kept on query-frame coordinates (about 1 m at BC latitudes).
pub const QUERY_DECIMALS: i32 = 5;

/// Bridge between the native projected frame and geographic coordinates.
pub trait CrsTransform: Send + Sync {
    fn native(&self) -> Crs;
    /// Projected `(x, y)` to `(lon, lat)` in degrees.
    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), BratError>;
    /// `(lon, lat)` in degrees to projected `(x, y)`.
    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), BratError>;
}

/// Derive the query-frame extent from a native-frame extent: every corner is
/// transformed, the axis-aligned box is re-derived and rounded.
pub fn query_extent(native: &Extent, transform: &dyn CrsTransform) -> Result<Extent, BratError> {
    if native.crs != transform.native() {
        return Err(BratError::Projection(format!(
            "extent is in {} but transform expects {}",
            native.crs,
            transform.native()
        )));
    }
    let corners = native
        .corners()
        .iter()
        .map(|(x, y)| transform.inverse(*x, *y))
        .collect::<Result<Vec<_>, BratError>>()?;
    let extent = Extent::from_points(corners, Crs::Wgs84)
        .ok_or_else(|| BratError::Projection("empty extent".to_string()))?;
    Ok(extent.rounded(QUERY_DECIMALS))
}

/// Project a single native point into the query frame, rounded like extents.
pub fn query_point(x: f64, y: f64, transform: &dyn CrsTransform) -> Result<(f64, f64), BratError> {
    let (lon, lat) = transform.inverse(x, y)?;
    let factor = 10f64.powi(QUERY_DECIMALS);
    Ok((
        (lon * factor).round() / factor,
        (lat * factor).round() / factor,
    ))
}

#[derive(Debug, Clone)]
pub struct AlbersEqualArea {
    crs: Crs,
    a: f64,
    e: f64,
    e2: f64,
    n: f64,
    c: f64,
    rho0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
}

impl AlbersEqualArea {
    /// EPSG:3005, NAD83 / BC Albers on the GRS80 ellipsoid.
    pub fn bc_albers() -> Self {
        Self::new(
            Crs::BcAlbers,
            6_378_137.0,
            1.0 / 298.257_222_101,
            50.0,
            58.5,
            45.0,
            -126.0,
            1_000_000.0,
            0.0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crs: Crs,
        semi_major: f64,
        flattening: f64,
        lat1: f64,
        lat2: f64,
        lat0: f64,
        lon0: f64,
        false_easting: f64,
        false_northing: f64,
    ) -> Self {
        let e2 = 2.0 * flattening - flattening * flattening;
        let e = e2.sqrt();
        let (phi1, phi2, phi0) = (lat1.to_radians(), lat2.to_radians(), lat0.to_radians());
        let m1 = m(phi1, e2);
        let m2 = m(phi2, e2);
        let q0 = q(phi0.sin(), e, e2);
        let q1 = q(phi1.sin(), e, e2);
        let q2 = q(phi2.sin(), e, e2);
        let n = (m1 * m1 - m2 * m2) / (q2 - q1);
        let c = m1 * m1 + n * q1;
        let rho0 = semi_major * (c - n * q0).sqrt() / n;
        Self {
            crs,
            a: semi_major,
            e,
            e2,
            n,
            c,
            rho0,
            lon0: lon0.to_radians(),
            false_easting,
            false_northing,
        }
    }
}

impl CrsTransform for AlbersEqualArea {
    fn native(&self) -> Crs {
        self.crs
    }

    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), BratError> {
        if !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0 {
            return Err(BratError::Projection(format!(
                "invalid geographic coordinate ({lon}, {lat})"
            )));
        }
        let phi = lat.to_radians();
        let rho = self.a * (self.c - self.n * q(phi.sin(), self.e, self.e2)).sqrt() / self.n;
        let theta = self.n * (lon.to_radians() - self.lon0);
        Ok((
            self.false_easting + rho * theta.sin(),
            self.false_northing + self.rho0 - rho * theta.cos(),
        ))
    }

    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), BratError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(BratError::Projection(format!(
                "invalid projected coordinate ({x}, {y})"
            )));
        }
        let dx = x - self.false_easting;
        let dy = self.rho0 - (y - self.false_northing);
        let rho = dx.hypot(dy);
        let theta = dx.atan2(dy);
        let q_target = (self.c - rho * rho * self.n * self.n / (self.a * self.a)) / self.n;
        let q_pole = q(1.0, self.e, self.e2);
        if q_target.abs() > q_pole {
            return Err(BratError::Projection(format!(
                "coordinate ({x}, {y}) is outside the projection domain"
            )));
        }

        let mut phi = (q_target / 2.0).clamp(-1.0, 1.0).asin();
        let mut converged = false;
        for _ in 0..25 {
            let sin_phi = phi.sin();
            let cos_phi = phi.cos();
            let esin = self.e * sin_phi;
            let one_minus = 1.0 - esin * esin;
            let delta = one_minus * one_minus / (2.0 * cos_phi)
                * (q_target / (1.0 - self.e2) - sin_phi / one_minus
                    + ((1.0 - esin) / (1.0 + esin)).ln() / (2.0 * self.e));
            phi += delta;
            if delta.abs() < 1e-12 {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(BratError::Projection(format!(
                "latitude did not converge for ({x}, {y})"
            )));
        }

        let lon = self.lon0 + theta / self.n;
        Ok((lon.to_degrees(), phi.to_degrees()))
    }
}

fn m(phi: f64, e2: f64) -> f64 {
    let sin_phi = phi.sin();
    phi.cos() / (1.0 - e2 * sin_phi * sin_phi).sqrt()
}

fn q(sin_phi: f64, e: f64, e2: f64) -> f64 {
    let esin = e * sin_phi;
    (1.0 - e2) * (sin_phi / (1.0 - esin * esin) - ((1.0 - esin) / (1.0 + esin)).ln() / (2.0 * e))
}
