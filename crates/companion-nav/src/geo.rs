use companion_proto::Position;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres (haversine).
pub fn haversine_m(a: Position, b: Position) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

pub fn haversine_km(a: Position, b: Position) -> f64 {
    haversine_m(a, b) / 1000.0
}

/// Point `frac` of the way from `a` to `b` (linear in lat/lon, fine over short legs).
pub fn lerp(a: Position, b: Position, frac: f64) -> Position {
    let f = frac.clamp(0.0, 1.0);
    Position::new(a.lat + (b.lat - a.lat) * f, a.lon + (b.lon - a.lon) * f)
}
