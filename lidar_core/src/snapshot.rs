//! Persisted background-grid snapshots and ASC point export (spec §6).
//!
//! The binary snapshot format is a small self-describing header followed
//! by a `flate2`-compressed stream of `(average_range_m, times_seen_count)`
//! tuples in `(ring, azimuth_bin)` order, plus a JSON sidecar carrying the
//! per-ring elevation table. ASC export is the simpler whitespace-separated
//! `x y z intensity` text format used for one-off dumps of a frame's world
//! points, also written in deterministic order.

use crate::background::BackgroundGrid;
use crate::error::SnapshotError;
use crate::types::WorldPoint;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const SNAPSHOT_MAGIC: &[u8; 4] = b"LBG1";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotSidecar {
    rings: usize,
    azimuth_bins: usize,
    ring_elevations_deg: Vec<Option<f64>>,
}

/// Serialises a background grid's learned baseline to a compressed byte
/// stream, returning the bytes alongside the JSON sidecar that must be
/// stored with them.
pub fn export_snapshot(grid: &BackgroundGrid) -> Result<(Vec<u8>, String), SnapshotError> {
    let (rings, azimuth_bins) = grid.dimensions();
    let mut raw = Vec::with_capacity(rings * azimuth_bins * 12 + 4);
    raw.extend_from_slice(SNAPSHOT_MAGIC);

    for (_, cell) in grid.cells_in_order() {
        let avg = cell.average_range_m.unwrap_or(f64::NAN);
        raw.extend_from_slice(&avg.to_le_bytes());
        raw.extend_from_slice(&cell.times_seen_count.to_le_bytes());
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| SnapshotError::Io(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SnapshotError::Io(e.to_string()))?;

    let sidecar = SnapshotSidecar {
        rings,
        azimuth_bins,
        ring_elevations_deg: (0..rings).map(|r| grid.ring_elevation_deg(r)).collect(),
    };
    let sidecar_json =
        serde_json::to_string(&sidecar).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

    Ok((compressed, sidecar_json))
}

/// Loads a previously-exported snapshot into a freshly constructed grid
/// with matching dimensions. Returns an error if the compressed stream is
/// malformed or the sidecar's dimensions don't match `grid`.
pub fn load_snapshot(
    grid: &mut BackgroundGrid,
    compressed: &[u8],
    sidecar_json: &str,
) -> Result<(), SnapshotError> {
    let sidecar: SnapshotSidecar =
        serde_json::from_str(sidecar_json).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let (rings, azimuth_bins) = grid.dimensions();
    if sidecar.rings != rings || sidecar.azimuth_bins != azimuth_bins {
        return Err(SnapshotError::Serialization(format!(
            "snapshot dims {}x{} do not match grid dims {}x{}",
            sidecar.rings, sidecar.azimuth_bins, rings, azimuth_bins
        )));
    }

    let mut decoder = GzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| SnapshotError::Io(e.to_string()))?;

    if raw.len() < 4 || &raw[0..4] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::Serialization(
            "missing or mismatched snapshot magic".to_string(),
        ));
    }

    let record_size = 12; // 8 bytes f64 + 4 bytes u32
    let body = &raw[4..];
    if body.len() % record_size != 0 {
        return Err(SnapshotError::Serialization(
            "truncated snapshot record".to_string(),
        ));
    }

    for (ring, elevation) in sidecar.ring_elevations_deg.iter().enumerate() {
        if let Some(el) = elevation {
            grid.set_ring_elevation(ring, *el);
        }
    }

    for (i, chunk) in body.chunks(record_size).enumerate() {
        let ring = i / azimuth_bins;
        let azimuth_bin = i % azimuth_bins;
        let avg = f64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let times_seen = u32::from_le_bytes(chunk[8..12].try_into().unwrap());
        if !avg.is_nan() {
            grid.restore_cell(ring, azimuth_bin, avg, times_seen);
        }
    }

    Ok(())
}

/// Writes a slice of world points as whitespace-separated `x y z
/// intensity` rows, one per line. Points are written in the order given;
/// callers that want deterministic `(ring, azimuth_bin)` ordering should
/// sort before calling.
pub fn write_asc<W: Write>(writer: &mut W, points: &[WorldPoint]) -> Result<(), SnapshotError> {
    for p in points {
        writeln!(writer, "{} {} {} {}", p.x, p.y, p.z, p.intensity)
            .map_err(|e| SnapshotError::Io(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn test_snapshot_round_trip() {
        let config = PipelineConfig::default();
        let mut grid = BackgroundGrid::new(2, 4, &config).unwrap();
        grid.restore_cell(0, 0, 12.5, 50);
        grid.restore_cell(1, 2, 7.25, 10);
        grid.set_ring_elevation(0, -5.0);
        grid.set_ring_elevation(1, 3.0);

        let (bytes, sidecar) = export_snapshot(&grid).unwrap();

        let mut loaded = BackgroundGrid::new(2, 4, &config).unwrap();
        load_snapshot(&mut loaded, &bytes, &sidecar).unwrap();

        assert_eq!(loaded.cell(0, 0).unwrap().average_range_m, Some(12.5));
        assert_eq!(loaded.cell(0, 0).unwrap().times_seen_count, 50);
        assert_eq!(loaded.cell(1, 2).unwrap().average_range_m, Some(7.25));
        assert_eq!(loaded.ring_elevation_deg(0), Some(-5.0));
        assert_eq!(loaded.ring_elevation_deg(1), Some(3.0));
    }

    #[test]
    fn test_load_rejects_dimension_mismatch() {
        let config = PipelineConfig::default();
        let grid = BackgroundGrid::new(2, 4, &config).unwrap();
        let (bytes, sidecar) = export_snapshot(&grid).unwrap();

        let mut wrong_dims = BackgroundGrid::new(3, 4, &config).unwrap();
        assert!(load_snapshot(&mut wrong_dims, &bytes, &sidecar).is_err());
    }

    #[test]
    fn test_write_asc_format() {
        let points = vec![WorldPoint {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            intensity: 42,
            timestamp_ns: 0,
            sensor_id: 0,
        }];
        let mut out = Vec::new();
        write_asc(&mut out, &points).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "1 2 3 42\n");
    }
}
