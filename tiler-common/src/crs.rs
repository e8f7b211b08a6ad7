//! Coordinate reference system handling.
//!
//! Full cross-CRS reprojection is an external collaborator (see the
//! surrounding design notes): this module exposes the seam a real
//! PROJ-backed implementation would plug into, plus the one piece of CRS
//! logic that the Reader actually needs on its own - deriving a local
//! east-north-up rotation when the output CRS is geocentric, so the node
//! grid's z-aspect heuristic still sees a locally vertical axis.

use nalgebra::{Matrix3, Point3};

/// Reprojects a point from the input CRS to the output CRS.
///
/// The identity implementation below is the only one shipped in this crate;
/// a real implementation (e.g. backed by PROJ) is substituted by the caller
/// as a trait object, so the pipeline never depends on a specific
/// reprojection library.
pub trait CrsTransform: Send + Sync {
    fn transform(&self, p: Point3<f64>) -> Point3<f64>;
}

/// Used whenever no `--srs_out` is configured, or the input and output CRS
/// are identical.
pub struct IdentityTransform;

impl CrsTransform for IdentityTransform {
    fn transform(&self, p: Point3<f64>) -> Point3<f64> {
        p
    }
}

/// EPSG:4978 (WGS84 geocentric / ECEF) is the spec's normative example of a
/// geocentric output frame; any other EPSG code is treated as a flat/projected
/// frame for the purposes of the rotation heuristic below.
pub const EPSG_GEOCENTRIC: u32 = 4978;

pub fn is_geocentric(epsg: u32) -> bool {
    epsg == EPSG_GEOCENTRIC
}

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Converts an ECEF position to geodetic latitude/longitude (radians), via
/// Bowring's closed-form approximation - exact enough for choosing a rotation
/// basis, not a surveying-grade geodesy routine.
fn ecef_to_geodetic(p: Point3<f64>) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let b = WGS84_A * (1.0 - WGS84_F);

    let lon = p.y.atan2(p.x);
    let r = (p.x * p.x + p.y * p.y).sqrt();
    if r < 1e-9 {
        // On the polar axis: longitude is undefined, pick 0 and latitude +-90deg.
        return (p.z.signum() * std::f64::consts::FRAC_PI_2, 0.0);
    }
    let theta = (p.z * WGS84_A).atan2(r * b);
    let lat = (p.z + ep2 * b * theta.sin().powi(3)).atan2(r - e2 * WGS84_A * theta.cos().powi(3));
    (lat, lon)
}

/// The rotation applied by the Reader so that, after translation/scale, the
/// node grid's local z axis points "up" at `origin`: identity for any
/// non-geocentric output CRS, or the east-north-up basis at `origin`
/// (expressed in ECEF) when `geocentric` is set.
///
/// Rows are the east, north and up unit vectors, so `R * v` maps an ECEF
/// vector into the local ENU frame - this is the inverse of the tile
/// transform's rotation component, matching the Reader's "apply the inverse
/// of that rotation" contract.
pub fn enu_rotation(origin: Point3<f64>, geocentric: bool) -> Matrix3<f64> {
    if !geocentric {
        return Matrix3::identity();
    }
    let (lat, lon) = ecef_to_geodetic(origin);
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();

    let east = [-sin_lon, cos_lon, 0.0];
    let north = [-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat];
    let up = [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat];

    Matrix3::new(
        east[0], east[1], east[2], north[0], north[1], north[2], up[0], up[1], up[2],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_for_non_geocentric() {
        let r = enu_rotation(Point3::new(1.0, 2.0, 3.0), false);
        assert_eq!(r, Matrix3::identity());
    }

    #[test]
    fn enu_up_vector_points_outward_at_equator_prime_meridian() {
        let origin = Point3::new(WGS84_A, 0.0, 0.0);
        let r = enu_rotation(origin, true);
        let up = r.row(2);
        assert!((up[0] - 1.0).abs() < 1e-6);
        assert!(up[1].abs() < 1e-6);
        assert!(up[2].abs() < 1e-6);
    }

    #[test]
    fn is_geocentric_matches_epsg_4978_only() {
        assert!(is_geocentric(4978));
        assert!(!is_geocentric(3857));
    }
}
