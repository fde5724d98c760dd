use geo::Point;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Flat tangent-plane projection around a reference point. Offsets are in
/// meters north and east; the radii of curvature are evaluated once at the
/// origin, so one frame is shared by every detection taken near that origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    origin: Point<f64>,
    meridian_radius: f64,
    parallel_radius: f64,
}

impl LocalFrame {
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let lat = origin_lat.to_radians();
        let w = 1.0 - e2 * lat.sin().powi(2);

        let meridian_radius = WGS84_A * (1.0 - e2) / w.powf(1.5);
        let normal_radius = WGS84_A / w.sqrt();

        LocalFrame {
            origin: Point::new(origin_lon, origin_lat),
            meridian_radius,
            parallel_radius: normal_radius * lat.cos(),
        }
    }

    pub fn origin(&self) -> Point<f64> {
        self.origin
    }

    /// Converts a metric offset into a geographic point (x = lon, y = lat).
    pub fn to_global(&self, north: f64, east: f64) -> Point<f64> {
        let lat = self.origin.y() + (north / self.meridian_radius).to_degrees();
        let lon = if self.parallel_radius.abs() > f64::EPSILON {
            self.origin.x() + (east / self.parallel_radius).to_degrees()
        } else {
            self.origin.x()
        };

        Point::new(lon, lat)
    }

    /// Converts a geographic point back into (north, east) meters.
    pub fn to_local(&self, point: Point<f64>) -> (f64, f64) {
        let north = (point.y() - self.origin.y()).to_radians() * self.meridian_radius;
        let east = (point.x() - self.origin.x()).to_radians() * self.parallel_radius;
        (north, east)
    }
}

#[cfg(test)]
mod tests {
    use geo::algorithm::haversine_distance::HaversineDistance;

    use super::*;

    #[test]
    fn zero_offset_is_origin() {
        let frame = LocalFrame::new(48.137154, 11.576124);
        let point = frame.to_global(0.0, 0.0);

        assert_eq!(point.y(), 48.137154);
        assert_eq!(point.x(), 11.576124);
    }

    #[test]
    fn offsets_have_metric_length() {
        let frame = LocalFrame::new(48.0, 11.0);

        let north = frame.to_global(100.0, 0.0);
        let east = frame.to_global(0.0, 100.0);

        assert!(north.y() > 48.0 && north.x() == 11.0);
        assert!(east.x() > 11.0 && east.y() == 48.0);

        let d = frame.origin().haversine_distance(&north);
        assert!((d - 100.0).abs() < 0.5, "north distance {}", d);
        let d = frame.origin().haversine_distance(&east);
        assert!((d - 100.0).abs() < 0.5, "east distance {}", d);
    }

    #[test]
    fn local_round_trip() {
        let frame = LocalFrame::new(-33.8, 151.2);
        let (n, e) = frame.to_local(frame.to_global(-12.5, 40.25));

        assert!((n + 12.5).abs() < 1e-6);
        assert!((e - 40.25).abs() < 1e-6);
    }
}
