//! Worker service: a tiered block store plus its session and space upkeep

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use stratus_common::{
    Error, Result, SessionId, StoreConfig, WorkerInfoField, WorkerReportOptions,
};
use stratus_storage::{SessionTracker, SpaceReserver, TieredBlockStore};
use tracing::{debug, error, info, warn};

/// Point-in-time status of the worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: u64,
    pub address: String,
    pub uptime_secs: u64,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub block_count: usize,
    pub active_sessions: usize,
    pub active_locks: usize,
}

pub struct WorkerService {
    worker_id: u64,
    address: String,
    store: Arc<TieredBlockStore>,
    sessions: SessionTracker,
    reserver: Option<SpaceReserver>,
    start_time: Instant,
    start_time_ms: u64,
}

impl WorkerService {
    /// Open the store and set up session tracking
    pub fn new(worker_id: u64, address: String, config: StoreConfig) -> Result<Self> {
        let session_timeout = config.session.timeout();
        let reserver_enabled = config.reserver.enabled;

        let store = Arc::new(TieredBlockStore::open(config)?);
        let reserver = reserver_enabled.then(|| SpaceReserver::new(Arc::clone(&store)));

        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        info!(
            "Worker {} at {} opened store with {} tiers",
            worker_id,
            address,
            store.tiers().len()
        );

        Ok(Self {
            worker_id,
            address,
            store,
            sessions: SessionTracker::new(session_timeout),
            reserver,
            start_time: Instant::now(),
            start_time_ms,
        })
    }

    pub const fn store(&self) -> &Arc<TieredBlockStore> {
        &self.store
    }

    pub const fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    // Sessions

    /// Record that a client session is alive
    pub fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        if session_id.is_internal() {
            return Err(Error::invalid_argument(format!(
                "session {session_id} is reserved for the store"
            )));
        }
        self.sessions.heartbeat(session_id);
        Ok(())
    }

    /// Close a client session, dropping its locks and temporary blocks
    pub fn close_session(&self, session_id: SessionId) -> Result<()> {
        if session_id.is_internal() {
            return Err(Error::invalid_argument(format!(
                "session {session_id} is reserved for the store"
            )));
        }
        self.sessions.remove(session_id);
        self.store.cleanup_session(session_id)
    }

    /// Clean up every session whose heartbeat has lapsed
    ///
    /// A session whose cleanup fails stays tracked and is retried on the
    /// next sweep.
    pub fn sweep_sessions(&self) -> usize {
        let mut cleaned = 0;
        for session_id in self.sessions.expired_sessions() {
            match self.store.cleanup_session(session_id) {
                Ok(()) => {
                    self.sessions.remove(session_id);
                    info!("Session {} expired", session_id);
                    cleaned += 1;
                }
                Err(e) => error!("Failed to clean up expired session {}: {}", session_id, e),
            }
        }
        cleaned
    }

    /// Run one space reserver pass, returning the blocks freed
    pub fn reserve_space(&self) -> usize {
        self.reserver.as_ref().map_or(0, SpaceReserver::reserve_space)
    }

    pub fn status(&self) -> WorkerStatus {
        let meta = self.store.block_store_meta();
        WorkerStatus {
            worker_id: self.worker_id,
            address: self.address.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            capacity_bytes: meta.capacity_bytes(),
            used_bytes: meta.used_bytes(),
            block_count: meta.block_count(),
            active_sessions: self.sessions().len(),
            active_locks: self.store.lock_manager().lock_count(),
        }
    }

    // Reports

    /// Describe this worker with the requested fields
    ///
    /// Returns `None` when the worker range excludes this worker. A running
    /// worker always reports itself live.
    pub fn report(&self, options: &WorkerReportOptions) -> Result<Option<Map<String, Value>>> {
        options.validate()?;
        if !options.includes_worker(&self.address, true) {
            return Ok(None);
        }

        let mut report = self.store.block_store_meta().select(&options.field_range);
        for field in &options.field_range {
            let value = match field {
                WorkerInfoField::Address => json!(self.address),
                WorkerInfoField::Id => json!(self.worker_id),
                WorkerInfoField::LastContactSec => json!(0),
                WorkerInfoField::StartTimeMs => json!(self.start_time_ms),
                WorkerInfoField::State => json!("LIVE"),
                _ => continue,
            };
            report.insert(field.wire_name().to_string(), value);
        }
        Ok(Some(report))
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> std::result::Result<String, fmt::Error> {
        let mut output = String::with_capacity(8 * 1024);
        let id = self.worker_id;
        let meta = self.store.block_store_meta();

        writeln!(output, "# HELP stratus_worker_info Worker information")?;
        writeln!(output, "# TYPE stratus_worker_info gauge")?;
        writeln!(
            output,
            "stratus_worker_info{{worker_id=\"{}\",address=\"{}\"}} 1",
            id, self.address
        )?;

        writeln!(output, "# HELP stratus_worker_uptime_seconds Worker uptime in seconds")?;
        writeln!(output, "# TYPE stratus_worker_uptime_seconds counter")?;
        writeln!(
            output,
            "stratus_worker_uptime_seconds{{worker_id=\"{}\"}} {}",
            id,
            self.start_time.elapsed().as_secs()
        )?;

        writeln!(output, "# HELP stratus_worker_capacity_bytes Total store capacity")?;
        writeln!(output, "# TYPE stratus_worker_capacity_bytes gauge")?;
        writeln!(
            output,
            "stratus_worker_capacity_bytes{{worker_id=\"{}\"}} {}",
            id,
            meta.capacity_bytes()
        )?;
        writeln!(output, "# HELP stratus_worker_used_bytes Used space in the store")?;
        writeln!(output, "# TYPE stratus_worker_used_bytes gauge")?;
        writeln!(
            output,
            "stratus_worker_used_bytes{{worker_id=\"{}\"}} {}",
            id,
            meta.used_bytes()
        )?;
        writeln!(output, "# HELP stratus_worker_blocks_total Committed blocks")?;
        writeln!(output, "# TYPE stratus_worker_blocks_total gauge")?;
        writeln!(
            output,
            "stratus_worker_blocks_total{{worker_id=\"{}\"}} {}",
            id,
            meta.block_count()
        )?;

        // Per-tier and per-dir usage
        writeln!(output, "# HELP stratus_tier_capacity_bytes Tier capacity")?;
        writeln!(output, "# TYPE stratus_tier_capacity_bytes gauge")?;
        writeln!(output, "# HELP stratus_tier_used_bytes Tier used space")?;
        writeln!(output, "# TYPE stratus_tier_used_bytes gauge")?;
        for tier in meta.tiers() {
            writeln!(
                output,
                "stratus_tier_capacity_bytes{{worker_id=\"{}\",tier=\"{}\"}} {}",
                id, tier.alias, tier.capacity_bytes
            )?;
            writeln!(
                output,
                "stratus_tier_used_bytes{{worker_id=\"{}\",tier=\"{}\"}} {}",
                id, tier.alias, tier.used_bytes
            )?;
        }

        writeln!(output, "# HELP stratus_dir_capacity_bytes Dir capacity")?;
        writeln!(output, "# TYPE stratus_dir_capacity_bytes gauge")?;
        writeln!(output, "# HELP stratus_dir_used_bytes Dir used space")?;
        writeln!(output, "# TYPE stratus_dir_used_bytes gauge")?;
        writeln!(output, "# HELP stratus_dir_blocks_total Committed blocks in dir")?;
        writeln!(output, "# TYPE stratus_dir_blocks_total gauge")?;
        for tier in meta.tiers() {
            for dir in &tier.dirs {
                let labels = format!(
                    "worker_id=\"{}\",tier=\"{}\",dir=\"{}\"",
                    id, tier.alias, dir.path
                );
                writeln!(output, "stratus_dir_capacity_bytes{{{labels}}} {}", dir.capacity_bytes)?;
                writeln!(output, "stratus_dir_used_bytes{{{labels}}} {}", dir.used_bytes)?;
                writeln!(output, "stratus_dir_blocks_total{{{labels}}} {}", dir.block_count)?;
            }
        }

        writeln!(output, "# HELP stratus_worker_sessions_active Tracked client sessions")?;
        writeln!(output, "# TYPE stratus_worker_sessions_active gauge")?;
        writeln!(
            output,
            "stratus_worker_sessions_active{{worker_id=\"{}\"}} {}",
            id,
            self.sessions.len()
        )?;
        writeln!(output, "# HELP stratus_worker_locks_active Held block locks")?;
        writeln!(output, "# TYPE stratus_worker_locks_active gauge")?;
        writeln!(
            output,
            "stratus_worker_locks_active{{worker_id=\"{}\"}} {}",
            id,
            self.store.lock_manager().lock_count()
        )?;

        // Store operation counters
        let stats = self.store.stats().snapshot();
        let counters = [
            ("blocks_created", "Temporary blocks created", stats.blocks_created),
            ("blocks_committed", "Blocks committed", stats.blocks_committed),
            ("blocks_aborted", "Temporary blocks aborted", stats.blocks_aborted),
            ("blocks_removed", "Blocks removed on request", stats.blocks_removed),
            ("blocks_moved", "Blocks moved on request", stats.blocks_moved),
            ("blocks_evicted", "Blocks evicted to make room", stats.blocks_evicted),
            ("blocks_demoted", "Blocks demoted to a lower tier", stats.blocks_demoted),
            ("bytes_evicted", "Bytes freed by eviction", stats.bytes_evicted),
            ("allocation_failures", "Allocations that found no space", stats.allocation_failures),
            ("lock_timeouts", "Lock waits that timed out", stats.lock_timeouts),
        ];
        for (name, help, value) in counters {
            writeln!(output, "# HELP stratus_store_{name}_total {help}")?;
            writeln!(output, "# TYPE stratus_store_{name}_total counter")?;
            writeln!(
                output,
                "stratus_store_{name}_total{{worker_id=\"{id}\"}} {value}"
            )?;
        }

        Ok(output)
    }
}

/// Periodically clean up sessions whose heartbeats have lapsed
pub async fn run_session_sweeper(service: Arc<WorkerService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let svc = Arc::clone(&service);
        match tokio::task::spawn_blocking(move || svc.sweep_sessions()).await {
            Ok(0) => {}
            Ok(cleaned) => debug!("Session sweep cleaned up {} sessions", cleaned),
            Err(e) => error!("Session sweep task failed: {}", e),
        }
    }
}

/// Periodically keep each tier's reserved bytes free
pub async fn run_space_reserver(service: Arc<WorkerService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let svc = Arc::clone(&service);
        match tokio::task::spawn_blocking(move || svc.reserve_space()).await {
            Ok(0) => {}
            Ok(freed) => debug!("Space reserver freed {} blocks", freed),
            Err(e) => warn!("Space reserver task failed: {}", e),
        }
    }
}
