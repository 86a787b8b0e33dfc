//! Great-circle distance math used by validation and persistence decisions.
//!
//! Pure functions, no state. Distances are Haversine on a mean Earth
//! radius; for the meter-scale thresholds this system works with, the
//! error versus an ellipsoidal model is irrelevant.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Returns true if a coordinate pair is unusable as a real position:
/// either component is NaN, or both are exactly zero (the common
/// GPS-unavailable sentinel emitted by mobile devices).
pub fn is_degenerate(lat: f64, lon: f64) -> bool {
    lat.is_nan() || lon.is_nan() || (lat == 0.0 && lon == 0.0)
}

/// Haversine distance in meters between two WGS-84 coordinates.
///
/// Degenerate input on either side returns `f64::INFINITY` so that
/// downstream distance-threshold logic always treats "no usable prior
/// point" as "definitely far enough to persist".
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if is_degenerate(lat1, lon1) || is_degenerate(lat2, lon2) {
        return f64::INFINITY;
    }

    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        let d = distance_meters(4.7110, -74.0721, 4.7110, -74.0721);
        assert!(d.abs() < 1e-6, "expected ~0, got {d}");
    }

    #[test]
    fn known_short_distance() {
        // 0.0005 degrees of latitude is ~55.6 m anywhere on Earth.
        let d = distance_meters(4.7110, -74.0721, 4.7115, -74.0721);
        assert!((d - 55.6).abs() < 1.0, "expected ~55.6 m, got {d}");
    }

    #[test]
    fn known_long_distance() {
        // Bogotá to Medellín is roughly 240 km as the crow flies.
        let d = distance_meters(4.7110, -74.0721, 6.2442, -75.5812);
        assert!((230_000.0..250_000.0).contains(&d), "got {d}");
    }

    #[test]
    fn symmetric() {
        let ab = distance_meters(4.7110, -74.0721, 6.2442, -75.5812);
        let ba = distance_meters(6.2442, -75.5812, 4.7110, -74.0721);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn degenerate_zero_zero_is_infinite() {
        assert_eq!(distance_meters(0.0, 0.0, 4.7, -74.0), f64::INFINITY);
        assert_eq!(distance_meters(4.7, -74.0, 0.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn degenerate_nan_is_infinite() {
        assert_eq!(distance_meters(f64::NAN, -74.0, 4.7, -74.0), f64::INFINITY);
        assert_eq!(distance_meters(4.7, -74.0, 4.7, f64::NAN), f64::INFINITY);
    }

    #[test]
    fn zero_latitude_alone_is_not_degenerate() {
        // A point on the equator with a real longitude is a valid position.
        assert!(!is_degenerate(0.0, -74.0721));
        let d = distance_meters(0.0, -74.0721, 0.0005, -74.0721);
        assert!(d.is_finite());
    }
}
