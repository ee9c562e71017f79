//! DBSCAN clustering of foreground world points into [`WorldCluster`]s
//! (spec §4.4).
//!
//! Neighbour queries are backed by a uniform grid sized to `eps`, the same
//! pattern the teacher uses for its spatial shard lookup: cell coordinates
//! are `floor(coord / eps)` and a query only ever visits the 27 cells
//! (3x3x3) surrounding a point's own cell, which is sufficient since no
//! point outside those cells can be within `eps`.

use crate::error::ClusterError;
use crate::types::{BoundingBox, WorldCluster, WorldPoint};
use std::collections::HashMap;

type CellKey = (i64, i64, i64);

struct GridIndex {
    eps: f64,
    cells: HashMap<CellKey, Vec<usize>>,
}

impl GridIndex {
    fn build(points: &[WorldPoint], eps: f64) -> Self {
        let mut cells: HashMap<CellKey, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(p, eps)).or_default().push(i);
        }
        Self { eps, cells }
    }

    fn key(p: &WorldPoint, eps: f64) -> CellKey {
        (
            (p.x / eps).floor() as i64,
            (p.y / eps).floor() as i64,
            (p.z / eps).floor() as i64,
        )
    }

    fn neighbors_within_eps(&self, points: &[WorldPoint], idx: usize) -> Vec<usize> {
        let origin = points[idx];
        let (cx, cy, cz) = Self::key(&origin, self.eps);
        let eps_sq = self.eps * self.eps;
        let mut result = Vec::new();

        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(bucket) = self.cells.get(&(cx + dx, cy + dy, cz + dz)) {
                        for &j in bucket {
                            if j == idx {
                                continue;
                            }
                            let p = points[j];
                            let ddx = p.x - origin.x;
                            let ddy = p.y - origin.y;
                            let ddz = p.z - origin.z;
                            if ddx * ddx + ddy * ddy + ddz * ddz <= eps_sq {
                                result.push(j);
                            }
                        }
                    }
                }
            }
        }
        result
    }
}

/// Runs DBSCAN over `points` and returns the resulting clusters, sorted
/// deterministically by `(centroid.x, centroid.y)`. Noise points (not part
/// of any cluster of at least `min_pts`) are dropped.
pub fn cluster_points(
    points: &[WorldPoint],
    eps: f64,
    min_pts: usize,
) -> Result<Vec<WorldCluster>, ClusterError> {
    if eps <= 0.0 {
        return Err(ClusterError::InvalidEps(eps));
    }
    if min_pts == 0 {
        return Err(ClusterError::InvalidMinPts(min_pts));
    }
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let index = GridIndex::build(points, eps);

    const UNVISITED: i32 = -1;
    const NOISE: i32 = -2;
    let mut labels = vec![UNVISITED; points.len()];
    let mut next_cluster = 0i32;

    for seed in 0..points.len() {
        if labels[seed] != UNVISITED {
            continue;
        }

        let seed_neighbors = index.neighbors_within_eps(points, seed);
        if seed_neighbors.len() + 1 < min_pts {
            labels[seed] = NOISE;
            continue;
        }

        let cluster_id = next_cluster;
        next_cluster += 1;
        labels[seed] = cluster_id;

        // Breadth-first expansion via an explicit queue, not recursion,
        // so a dense cluster can't blow the stack.
        let mut queue: std::collections::VecDeque<usize> = seed_neighbors.into_iter().collect();
        while let Some(current) = queue.pop_front() {
            if labels[current] == NOISE {
                labels[current] = cluster_id;
            }
            if labels[current] != UNVISITED {
                continue;
            }
            labels[current] = cluster_id;

            let current_neighbors = index.neighbors_within_eps(points, current);
            if current_neighbors.len() + 1 >= min_pts {
                for n in current_neighbors {
                    if labels[n] == UNVISITED || labels[n] == NOISE {
                        queue.push_back(n);
                    }
                }
            }
        }
    }

    let mut by_cluster: HashMap<i32, Vec<usize>> = HashMap::new();
    for (i, &label) in labels.iter().enumerate() {
        if label >= 0 {
            by_cluster.entry(label).or_default().push(i);
        }
    }

    let mut clusters: Vec<WorldCluster> = by_cluster
        .into_values()
        .map(|member_idxs| build_cluster(points, &member_idxs))
        .collect();

    clusters.sort_by(|a, b| {
        a.centroid[0]
            .partial_cmp(&b.centroid[0])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.centroid[1]
                    .partial_cmp(&b.centroid[1])
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    Ok(clusters)
}

fn build_cluster(points: &[WorldPoint], member_idxs: &[usize]) -> WorldCluster {
    let n = member_idxs.len();
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_z = 0.0;
    let mut sum_intensity = 0.0;
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;
    let mut min_z = f64::MAX;
    let mut max_z = f64::MIN;
    let mut heights: Vec<f64> = Vec::with_capacity(n);
    let mut latest_ts = 0u64;
    let mut sensor_id = 0u32;

    for &idx in member_idxs {
        let p = points[idx];
        sum_x += p.x;
        sum_y += p.y;
        sum_z += p.z;
        sum_intensity += p.intensity as f64;
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
        min_z = min_z.min(p.z);
        max_z = max_z.max(p.z);
        heights.push(p.z);
        if p.timestamp_ns >= latest_ts {
            latest_ts = p.timestamp_ns;
            sensor_id = p.sensor_id;
        }
    }

    heights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p95_idx = ((heights.len() as f64) * 0.95) as usize;
    let height_p95 = heights[p95_idx.min(heights.len() - 1)];

    WorldCluster {
        centroid: [sum_x / n as f64, sum_y / n as f64, sum_z / n as f64],
        bbox: BoundingBox {
            length: max_y - min_y,
            width: max_x - min_x,
            height: max_z - min_z,
        },
        point_count: n,
        height_p95,
        mean_intensity: sum_intensity / n as f64,
        timestamp_ns: latest_ts,
        sensor_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, y: f64, z: f64) -> WorldPoint {
        WorldPoint {
            x,
            y,
            z,
            intensity: 50,
            timestamp_ns: 1_000,
            sensor_id: 1,
        }
    }

    #[test]
    fn test_rejects_invalid_eps() {
        let points = vec![pt(0.0, 0.0, 0.0)];
        assert!(matches!(
            cluster_points(&points, 0.0, 1),
            Err(ClusterError::InvalidEps(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_min_pts() {
        let points = vec![pt(0.0, 0.0, 0.0)];
        assert!(matches!(
            cluster_points(&points, 0.5, 0),
            Err(ClusterError::InvalidMinPts(_))
        ));
    }

    #[test]
    fn test_empty_input_yields_no_clusters() {
        let clusters = cluster_points(&[], 0.5, 3).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_scenario_s2_two_clusters_are_separated_deterministically() {
        let mut points = Vec::new();
        // Dense cluster near the origin.
        for i in 0..10 {
            let offset = (i as f64) * 0.05;
            points.push(pt(offset, offset, 0.0));
        }
        // Dense cluster far away.
        for i in 0..10 {
            let offset = (i as f64) * 0.05;
            points.push(pt(20.0 + offset, 20.0 + offset, 0.0));
        }

        let clusters = cluster_points(&points, 0.5, 5).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters[0].centroid[0] < clusters[1].centroid[0]);
        for c in &clusters {
            assert_eq!(c.point_count, 10);
        }
    }

    #[test]
    fn test_sparse_points_are_noise_and_dropped() {
        let points = vec![pt(0.0, 0.0, 0.0), pt(50.0, 50.0, 0.0), pt(-50.0, -50.0, 0.0)];
        let clusters = cluster_points(&points, 0.5, 3).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_cluster_is_well_formed() {
        let mut points = Vec::new();
        for i in 0..6 {
            let offset = (i as f64) * 0.1;
            points.push(pt(offset, 0.0, 0.0));
        }
        let clusters = cluster_points(&points, 0.5, 3).unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].is_well_formed(&points));
    }

    #[test]
    fn test_is_well_formed_rejects_centroid_outside_extent() {
        let mut points = Vec::new();
        for i in 0..6 {
            let offset = (i as f64) * 0.1;
            points.push(pt(offset, 0.0, 0.0));
        }
        let mut clusters = cluster_points(&points, 0.5, 3).unwrap();
        assert_eq!(clusters.len(), 1);
        // Corrupt the centroid so it falls outside the point extent; a
        // real containment check must catch this.
        clusters[0].centroid[0] = 1000.0;
        assert!(!clusters[0].is_well_formed(&points));
    }
}
