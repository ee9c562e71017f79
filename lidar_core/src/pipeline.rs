//! Concurrency glue wiring the ingest, per-frame pipeline, stats, and
//! forwarder tasks together (spec §5).
//!
//! Each task only ever talks to [`RuntimeContext`] and a handful of
//! channels/locks; none of them call `tokio` directly, so the scheduling
//! behaviour here can be driven by a non-`tokio` `RuntimeContext` in tests.

use crate::background::BackgroundGrid;
use crate::cluster::cluster_points;
use crate::config::PipelineConfig;
use crate::frame_builder::{FeedResult, FrameBuilder};
use crate::transform::{filter_height_band, polar_to_world, HeightFilterCounters};
use crate::tracker::TrackManager;
use crate::types::{LidarFrame, PolarPoint, Pose, TrackedObject, WorldPoint};
use async_trait::async_trait;
use lidar_env::RuntimeContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Supplies the raw per-point stream the ingest task drains. Implemented
/// by whatever decodes vendor UDP packets; out of scope here (spec §1).
#[async_trait]
pub trait PacketSource: Send + 'static {
    /// Returns the next point, or `None` when the source is exhausted.
    async fn next_point(&mut self) -> Option<PolarPoint>;
}

/// Receives completed track snapshots downstream of the pipeline. Kept
/// generic so the forwarder task can feed a gRPC stream, a file, or a
/// test double without the pipeline knowing the difference.
#[async_trait]
pub trait Forwarder: Send + 'static {
    async fn forward(&mut self, tracks: Vec<TrackedObject>);
}

/// Snapshot of running pipeline counters, exposed to the stats task and to
/// external monitoring hooks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_processed: AtomicU64,
    pub points_ingested: AtomicU64,
    pub foreground_points: AtomicU64,
    pub clusters_found: AtomicU64,
    pub tracks_confirmed: AtomicU64,
    pub forwarder_drops: AtomicU64,
    pub unknown_ring_drops: AtomicU64,
    pub ingest_deadline_misses: AtomicU64,
}

const INGEST_READ_DEADLINE: Duration = Duration::from_secs(1);
const FORWARDER_CHANNEL_CAPACITY: usize = 1000;

/// Shared, externally-observable pipeline state: the background model
/// (spec §4.2) and the running counters. The tracker is not shared; it is
/// owned exclusively by the pipeline task (spec §4.5: "owned exclusively
/// by the tracker").
pub struct PipelineShared {
    pub grid: Mutex<BackgroundGrid>,
    pub stats: PipelineStats,
    pub latest_tracks: RwLock<Vec<TrackedObject>>,
}

impl PipelineShared {
    pub fn new(grid: BackgroundGrid) -> Self {
        Self {
            grid: Mutex::new(grid),
            stats: PipelineStats::default(),
            latest_tracks: RwLock::new(Vec::new()),
        }
    }
}

/// Spawns the ingest, pipeline, stats, and (optionally) forwarder tasks
/// and returns a handle whose cancellation token, when triggered, stops
/// all four cooperatively.
pub fn spawn_pipeline<R, S, F>(
    ctx: Arc<R>,
    sensor_id: u32,
    pose: Pose,
    config: PipelineConfig,
    max_rings: u16,
    source: S,
    forwarder: Option<F>,
) -> Arc<PipelineShared>
where
    R: RuntimeContext,
    S: PacketSource,
    F: Forwarder,
{
    let grid = BackgroundGrid::new(max_rings as usize, 1800, &config)
        .expect("grid dimensions validated by caller");
    let shared = Arc::new(PipelineShared::new(grid));

    let (point_tx, point_rx) = mpsc::channel::<PolarPoint>(4096);
    let (forward_tx, forward_rx) = mpsc::channel::<Vec<TrackedObject>>(FORWARDER_CHANNEL_CAPACITY);

    {
        let ctx_ingest = ctx.clone();
        let shared_ingest = shared.clone();
        ctx.spawn("ingest", run_ingest(ctx_ingest, source, point_tx, shared_ingest));
    }

    {
        let ctx_pipeline = ctx.clone();
        let shared_pipeline = shared.clone();
        ctx.spawn(
            "pipeline",
            run_pipeline(
                ctx_pipeline,
                sensor_id,
                pose,
                config,
                max_rings,
                point_rx,
                forward_tx,
                shared_pipeline,
            ),
        );
    }

    {
        let ctx_stats = ctx.clone();
        let shared_stats = shared.clone();
        ctx.spawn("stats", run_stats(ctx_stats, shared_stats));
    }

    if let Some(forwarder) = forwarder {
        let ctx_forward = ctx.clone();
        let shared_forward = shared.clone();
        ctx.spawn(
            "forwarder",
            run_forwarder(ctx_forward, forwarder, forward_rx, shared_forward),
        );
    }

    shared
}

async fn run_ingest<R: RuntimeContext, S: PacketSource>(
    ctx: Arc<R>,
    mut source: S,
    tx: mpsc::Sender<PolarPoint>,
    shared: Arc<PipelineShared>,
) {
    let cancel = ctx.cancellation_token();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            point = source.next_point() => point,
        };

        let Some(point) = next else {
            debug!("ingest source exhausted");
            break;
        };

        shared.stats.points_ingested.fetch_add(1, Ordering::Relaxed);

        if tokio::time::timeout(INGEST_READ_DEADLINE, tx.send(point))
            .await
            .is_err()
        {
            shared
                .stats
                .ingest_deadline_misses
                .fetch_add(1, Ordering::Relaxed);
            warn!("ingest channel send exceeded deadline, pipeline task may be stalled");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline<R: RuntimeContext>(
    ctx: Arc<R>,
    sensor_id: u32,
    pose: Pose,
    config: PipelineConfig,
    max_rings: u16,
    mut rx: mpsc::Receiver<PolarPoint>,
    forward_tx: mpsc::Sender<Vec<TrackedObject>>,
    shared: Arc<PipelineShared>,
) {
    let cancel = ctx.cancellation_token();
    let mut builder = FrameBuilder::new(sensor_id, config);
    let mut tracker = TrackManager::new(config);
    let mut mask = Vec::new();
    let mut height_counters = HeightFilterCounters::default();
    let mut last_frame_end_ns: Option<u64> = None;

    loop {
        let point = tokio::select! {
            _ = cancel.cancelled() => break,
            point = rx.recv() => point,
        };

        let Some(point) = point else {
            break;
        };

        let result = builder.feed(point, max_rings);
        shared
            .stats
            .unknown_ring_drops
            .store(builder.unknown_ring_drops(), Ordering::Relaxed);

        let frames = match result {
            FeedResult::Buffered => continue,
            FeedResult::Completed(frames) => frames,
        };

        for frame in frames {
            let now_ns = frame.end_ts_ns;
            let dt_s = last_frame_end_ns
                .map(|prev| (now_ns.saturating_sub(prev)) as f64 / 1e9)
                .unwrap_or(0.0);
            last_frame_end_ns = Some(now_ns);

            let tracks = process_frame(
                &frame,
                &pose,
                &config,
                &shared,
                &mut mask,
                &mut height_counters,
                &mut tracker,
                dt_s,
            )
            .await;

            shared
                .stats
                .frames_processed
                .fetch_add(1, Ordering::Relaxed);

            {
                let mut latest = shared.latest_tracks.write().await;
                *latest = tracks.clone();
            }

            if forward_tx.try_send(tracks).is_err() {
                shared
                    .stats
                    .forwarder_drops
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_frame(
    frame: &LidarFrame,
    pose: &Pose,
    config: &PipelineConfig,
    shared: &Arc<PipelineShared>,
    mask: &mut Vec<bool>,
    height_counters: &mut HeightFilterCounters,
    tracker: &mut TrackManager,
    dt_s: f64,
) -> Vec<TrackedObject> {
    let now_ns = frame.end_ts_ns;

    {
        let mut grid = shared.grid.lock().await;
        if grid.extract_foreground(&frame.points, config, now_ns, mask).is_err() {
            warn!("background grid rejected frame, skipping");
            return tracker.tracks().to_vec();
        }
    }

    let mut world_points: Vec<WorldPoint> = frame
        .points
        .iter()
        .zip(mask.iter())
        .filter(|(_, &is_foreground)| is_foreground)
        .map(|(p, _)| {
            let (x, y, z) = polar_to_world(p.azimuth_deg, p.elevation_deg, p.range_m, pose);
            WorldPoint {
                x,
                y,
                z,
                intensity: p.intensity,
                timestamp_ns: p.timestamp_ns,
                sensor_id: frame.sensor_id,
            }
        })
        .collect();

    shared
        .stats
        .foreground_points
        .fetch_add(world_points.len() as u64, Ordering::Relaxed);

    filter_height_band(
        &mut world_points,
        config.height_floor_m,
        config.height_ceiling_m,
        height_counters,
    );

    let clusters = match cluster_points(&world_points, config.foreground_dbscan_eps, config.foreground_min_cluster_points)
    {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(error = %e, "clustering failed, treating frame as empty");
            Vec::new()
        }
    };

    shared
        .stats
        .clusters_found
        .fetch_add(clusters.len() as u64, Ordering::Relaxed);

    tracker.step(&clusters, now_ns, dt_s);

    let confirmed = tracker
        .tracks()
        .iter()
        .filter(|t| t.state == crate::types::TrackState::Confirmed)
        .count();
    shared
        .stats
        .tracks_confirmed
        .store(confirmed as u64, Ordering::Relaxed);

    tracker.tracks().to_vec()
}

async fn run_stats<R: RuntimeContext>(ctx: Arc<R>, shared: Arc<PipelineShared>) {
    let cancel = ctx.cancellation_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.sleep(Duration::from_secs(5)) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        info!(
            frames = shared.stats.frames_processed.load(Ordering::Relaxed),
            points = shared.stats.points_ingested.load(Ordering::Relaxed),
            foreground = shared.stats.foreground_points.load(Ordering::Relaxed),
            clusters = shared.stats.clusters_found.load(Ordering::Relaxed),
            confirmed_tracks = shared.stats.tracks_confirmed.load(Ordering::Relaxed),
            forwarder_drops = shared.stats.forwarder_drops.load(Ordering::Relaxed),
            "pipeline stats"
        );
    }
}

async fn run_forwarder<R: RuntimeContext, F: Forwarder>(
    ctx: Arc<R>,
    mut forwarder: F,
    mut rx: mpsc::Receiver<Vec<TrackedObject>>,
    shared: Arc<PipelineShared>,
) {
    let cancel = ctx.cancellation_token();
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv() => batch,
        };
        let Some(batch) = batch else {
            break;
        };
        forwarder.forward(batch).await;
    }
    let _ = shared; // retained for future forwarder-side stats hooks
}

#[cfg(test)]
mod tests {
    use super::*;
    use lidar_env::TokioRuntimeContext;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct VecSource {
        points: AsyncMutex<std::vec::IntoIter<PolarPoint>>,
    }

    #[async_trait]
    impl PacketSource for VecSource {
        async fn next_point(&mut self) -> Option<PolarPoint> {
            self.points.lock().await.next()
        }
    }

    struct RecordingForwarder {
        batches: Arc<StdMutex<Vec<Vec<TrackedObject>>>>,
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&mut self, tracks: Vec<TrackedObject>) {
            self.batches.lock().unwrap().push(tracks);
        }
    }

    fn point(ring: u16, azimuth_deg: f64, range_m: f64, ts: u64) -> PolarPoint {
        PolarPoint {
            ring,
            azimuth_deg,
            elevation_deg: 0.0,
            range_m,
            intensity: 10,
            timestamp_ns: ts,
            packet_seq: None,
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_exhaustion_without_panicking() {
        let mut points = Vec::new();
        for i in 0..60_000u64 {
            let az = (i as f64 / 60_000.0) * 358.0;
            points.push(point(0, az, 10.0, i));
        }

        let config = PipelineConfig::default();
        let source = VecSource {
            points: AsyncMutex::new(points.into_iter()),
        };
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let forwarder = RecordingForwarder {
            batches: batches.clone(),
        };

        let ctx = TokioRuntimeContext::shared();
        let shared = spawn_pipeline(ctx.clone(), 1, Pose::default(), config, 4, source, Some(forwarder));

        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.cancellation_token().cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = &shared.stats;
        assert!(stats.points_ingested.load(Ordering::Relaxed) > 0);
    }
}
