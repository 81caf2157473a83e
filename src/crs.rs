//! Coordinate Reference System utilities.
//!
//! Study-area grids are defined in a projected CRS (typically a UTM zone, x/y in meters).
//! H3 indexing needs geographic coordinates, so cell centres and chunk corners are
//! reprojected to WGS84 before indexing.
//!
//! ## Coordinate order convention:
//!
//! Points are `(x, y)` tuples. For WGS84 that is `(lon, lat)` in degrees.

/// Common CRS codes used throughout the pipeline.
pub mod codes {
    /// WGS84 geographic coordinate system (lon/lat in degrees).
    pub const WGS84: &str = "EPSG:4326";
}

use anyhow::{Context, Result};
use proj::Proj;

/// Transform a batch of points between CRS in place.
///
/// A `Proj` is built once per call; it is not shareable across threads, so callers
/// transform a whole chunk at a time and then fan out the CPU-bound work.
pub fn transform_points(points: &mut [(f64, f64)], from_crs: &str, to_crs: &str) -> Result<()> {
    if from_crs == to_crs {
        return Ok(());
    }

    let proj = Proj::new_known_crs(from_crs, to_crs, None)
        .with_context(|| format!("Failed to create projection from {} to {}", from_crs, to_crs))?;
    let n_points = points.len();
    proj.convert_array(points)
        .with_context(|| format!("Failed to transform {} points from {} to {}", n_points, from_crs, to_crs))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform_leaves_points() {
        let mut points = vec![(-74.0, 40.7), (-73.9, 40.8)];
        transform_points(&mut points, codes::WGS84, codes::WGS84).unwrap();
        assert_eq!(points, vec![(-74.0, 40.7), (-73.9, 40.8)]);
    }

    #[test]
    fn test_utm_to_wgs84() {
        // UTM 18N, roughly lower Manhattan
        let mut points = vec![(583_960.0, 4_507_523.0)];
        transform_points(&mut points, "EPSG:32618", codes::WGS84).unwrap();
        let (lon, lat) = points[0];
        assert!((lon - -74.0).abs() < 0.01, "lon {}", lon);
        assert!((lat - 40.71).abs() < 0.01, "lat {}", lat);
    }

    #[test]
    fn test_unknown_crs_is_error() {
        let mut points = vec![(0.0, 0.0)];
        assert!(transform_points(&mut points, "EPSG:999999", codes::WGS84).is_err());
    }
}
