use geo::{HaversineBearing, HaversineDestination, HaversineDistance, Point};

use crate::types::Position;

fn to_point(p: Position) -> Point<f64> {
    // geo points are (x = lon, y = lat)
    Point::new(p.longitude, p.latitude)
}

/// Great-circle distance in meters (haversine)
pub fn distance_meters(a: Position, b: Position) -> f64 {
    if a == b {
        return 0.0;
    }
    to_point(a).haversine_distance(&to_point(b))
}

/// Initial bearing from `a` to `b` in degrees, normalized to [0, 360).
///
/// Identical points have no direction; 0 is returned and callers are expected
/// to gate on distance first.
pub fn initial_bearing_degrees(a: Position, b: Position) -> f64 {
    if a == b {
        return 0.0;
    }
    normalize_degrees(to_point(a).haversine_bearing(to_point(b)))
}

/// Point reached by travelling `meters` from `origin` along `bearing_deg`
pub fn destination(origin: Position, bearing_deg: f64, meters: f64) -> Position {
    let p = to_point(origin).haversine_destination(bearing_deg, meters);
    Position::new(p.y(), p.x())
}

pub fn normalize_degrees(deg: f64) -> f64 {
    let d = deg % 360.0;
    if d < 0.0 {
        d + 360.0
    } else {
        d
    }
}
