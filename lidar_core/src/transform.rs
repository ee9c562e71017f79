//! Polar→world coordinate transform and height-band filter (spec §4.3).
//!
//! Bit-deterministic: 0° azimuth aligned to +Y/North, +X East, +Z up.

use crate::types::{Pose, WorldPoint};

/// Transforms a single polar measurement into the sensor's local ENU
/// frame, then applies the sensor pose.
///
/// `x = r*cos(el)*sin(az)`, `y = r*cos(el)*cos(az)`, `z = r*sin(el)`.
pub fn polar_to_world(
    azimuth_deg: f64,
    elevation_deg: f64,
    range_m: f64,
    pose: &Pose,
) -> (f64, f64, f64) {
    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();

    let x_sensor = range_m * el.cos() * az.sin();
    let y_sensor = range_m * el.cos() * az.cos();
    let z_sensor = range_m * el.sin();

    let yaw = pose.yaw_rad;
    let (sy, cy) = yaw.sin_cos();
    let x = cy * x_sensor - sy * y_sensor + pose.translation[0];
    let y = sy * x_sensor + cy * y_sensor + pose.translation[1];
    let z = z_sensor + pose.translation[2];

    (x, y, z)
}

/// Inverse of [`polar_to_world`], used only for the round-trip property
/// test (spec §8); not part of the pipeline's forward path.
pub fn world_to_polar(x: f64, y: f64, z: f64, pose: &Pose) -> (f64, f64, f64) {
    let dx = x - pose.translation[0];
    let dy = y - pose.translation[1];
    let dz = z - pose.translation[2];

    let yaw = -pose.yaw_rad;
    let (sy, cy) = yaw.sin_cos();
    let x_sensor = cy * dx - sy * dy;
    let y_sensor = sy * dx + cy * dy;

    let range_m = (x_sensor * x_sensor + y_sensor * y_sensor + dz * dz).sqrt();
    let elevation_deg = if range_m > 0.0 {
        (dz / range_m).asin().to_degrees()
    } else {
        0.0
    };
    let mut azimuth_deg = x_sensor.atan2(y_sensor).to_degrees();
    if azimuth_deg < 0.0 {
        azimuth_deg += 360.0;
    }

    (azimuth_deg, elevation_deg, range_m)
}

/// Counters maintained by [`filter_height_band`] (spec §4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeightFilterCounters {
    pub processed: u64,
    pub kept: u64,
    pub below: u64,
    pub above: u64,
}

/// Retains points with `floor_m <= z <= ceiling_m`, compacting the vector
/// in place and preserving order. Returns the running counters.
pub fn filter_height_band(
    points: &mut Vec<WorldPoint>,
    floor_m: f64,
    ceiling_m: f64,
    counters: &mut HeightFilterCounters,
) {
    let mut write = 0;
    for read in 0..points.len() {
        counters.processed += 1;
        let z = points[read].z;
        if z < floor_m {
            counters.below += 1;
            continue;
        }
        if z > ceiling_m {
            counters.above += 1;
            continue;
        }
        counters.kept += 1;
        points.swap(write, read);
        write += 1;
    }
    points.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_identity_pose() {
        let pose = Pose::default();
        let (az, el, r) = (37.5, 4.2, 12.3);
        let (x, y, z) = polar_to_world(az, el, r, &pose);
        let (az2, el2, r2) = world_to_polar(x, y, z, &pose);

        assert!((az - az2).abs() < 1e-9);
        assert!((el - el2).abs() < 1e-9);
        assert!((r - r2).abs() < 1e-9);
    }

    #[test]
    fn test_north_alignment() {
        let pose = Pose::default();
        let (x, y, _z) = polar_to_world(0.0, 0.0, 10.0, &pose);
        assert!(x.abs() < 1e-9);
        assert!((y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_east_alignment() {
        let pose = Pose::default();
        let (x, y, _z) = polar_to_world(90.0, 0.0, 10.0, &pose);
        assert!((x - 10.0).abs() < 1e-9);
        assert!(y.abs() < 1e-9);
    }

    fn sample_point(z: f64) -> WorldPoint {
        WorldPoint {
            x: 0.0,
            y: 0.0,
            z,
            intensity: 0,
            timestamp_ns: 0,
            sensor_id: 0,
        }
    }

    #[test]
    fn test_height_filter_compacts_in_place() {
        let mut pts = vec![
            sample_point(-5.0),
            sample_point(0.0),
            sample_point(1.0),
            sample_point(5.0),
        ];
        let mut counters = HeightFilterCounters::default();
        filter_height_band(&mut pts, -2.8, 1.5, &mut counters);

        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].z, 0.0);
        assert_eq!(pts[1].z, 1.0);
        assert_eq!(counters.processed, 4);
        assert_eq!(counters.kept, 2);
        assert_eq!(counters.below, 1);
        assert_eq!(counters.above, 1);
    }

    #[test]
    fn test_height_filter_inclusive_bounds() {
        let mut pts = vec![sample_point(-2.8), sample_point(1.5)];
        let mut counters = HeightFilterCounters::default();
        filter_height_band(&mut pts, -2.8, 1.5, &mut counters);
        assert_eq!(pts.len(), 2);
        assert_eq!(counters.kept, 2);
    }
}
