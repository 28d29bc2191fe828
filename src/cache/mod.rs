mod backend;
mod dump;
mod key;

pub use backend::CacheStats;
pub use key::MsgKey;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use self::backend::{CacheTable, InflightTable, TableHit};
use self::dump::DumpEntry;
use crate::chain::{Next, Stage};
use crate::config::CacheConfig;
use crate::context::QueryContext;
use crate::error::Result;
use crate::message::Message;

const DEFAULT_SIZE: usize = 1024;
const DEFAULT_RESP_TTL: u32 = 300;
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_CHANGES_TO_DUMP: u64 = 1024;

/// Response cache stage.
///
/// Serves fresh entries directly, serves entries inside the lazy window
/// as stale answers while a deduplicated background refresh re-runs the
/// rest of the chain, and stores responses produced downstream. The
/// table is periodically snapshotted to disk when configured; load and
/// dump failures are logged, never fatal.
pub struct CacheStage {
    lazy_window: Duration,
    dump_file: Option<PathBuf>,
    table: Arc<CacheTable>,
    inflight: Arc<InflightTable>,
    stats: Arc<CacheStats>,
    changes: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    dump_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheStage {
    /// Build a cache stage. Must be called inside a tokio runtime when
    /// `dump_file` is configured (the dump loop is spawned here).
    pub fn new(cfg: CacheConfig) -> Self {
        let size = if cfg.size == 0 { DEFAULT_SIZE } else { cfg.size };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stage = CacheStage {
            lazy_window: Duration::from_secs(cfg.lazy_cache_ttl),
            dump_file: cfg.dump_file.clone(),
            table: Arc::new(CacheTable::new(size)),
            inflight: Arc::new(InflightTable::new()),
            stats: Arc::new(CacheStats::default()),
            changes: Arc::new(AtomicU64::new(0)),
            shutdown,
            dump_task: Mutex::new(None),
        };

        if let Some(path) = stage.dump_file.clone() {
            stage.load_snapshot(&path);
            let handle = spawn_dump_loop(
                Arc::clone(&stage.table),
                Arc::clone(&stage.changes),
                path,
                Duration::from_secs(cfg.dump_interval.max(1)),
                shutdown_rx,
            );
            *stage.dump_task.lock() = Some(handle);
        }
        stage
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Graceful shutdown: stop the dump loop and write a final snapshot.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.dump_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(path) = self.dump_file.clone() {
            dump_to_file(&self.table, path).await;
        }
    }

    fn load_snapshot(&self, path: &Path) {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache snapshot to load");
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open cache snapshot");
                return;
            }
        };
        match dump::read_snapshot(&mut io::BufReader::new(file)) {
            Ok(entries) => {
                let loaded = entries.len();
                for entry in entries {
                    self.table.insert(entry.key, entry.resp, entry.remaining);
                }
                info!(loaded, path = %path.display(), "cache snapshot loaded");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load cache snapshot"),
        }
    }

    fn store(&self, key: MsgKey, resp: Message) {
        let ttl = response_ttl(&resp);
        self.table.insert(key, resp, ttl);
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a background refresh for a stale key unless one is already
    /// in flight. The refresh runs the rest of the chain on a forked
    /// context with its own deadline, detached from the request that
    /// triggered it.
    fn spawn_refresh(&self, key: MsgKey, ctx: &QueryContext, next: Next) {
        let Some(guard) = self.inflight.try_begin(key) else {
            return;
        };
        let mut fork = ctx.fork();
        let deadline = Instant::now() + REFRESH_TIMEOUT;
        fork.set_deadline(deadline);
        let table = Arc::clone(&self.table);
        let changes = Arc::clone(&self.changes);
        tokio::spawn(async move {
            let _inflight = guard;
            debug!("starting lazy cache refresh");
            match timeout_at(deadline, next.run(&mut fork)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "lazy cache refresh failed"),
                Err(_) => warn!("lazy cache refresh timed out"),
            }
            if let Some(resp) = fork.take_response() {
                let ttl = response_ttl(&resp);
                table.insert(key, resp, ttl);
                changes.fetch_add(1, Ordering::Relaxed);
                debug!("lazy cache refresh stored a fresh answer");
            }
        });
    }
}

#[async_trait]
impl Stage for CacheStage {
    async fn execute(&self, ctx: &mut QueryContext, next: Next) -> Result<()> {
        self.stats.record_query();
        let Some(key) = MsgKey::from_query(ctx.query()) else {
            // Not deterministically keyable; bypass silently.
            return next.run(ctx).await;
        };

        match self.table.get(&key, self.lazy_window) {
            TableHit::Fresh(mut resp) => {
                self.stats.record_hit();
                resp.header.id = ctx.query().header.id;
                ctx.set_cached_response(resp);
                return Ok(());
            }
            TableHit::Stale(mut resp) => {
                self.stats.record_lazy_hit();
                self.stats.record_hit();
                self.spawn_refresh(key, ctx, next.clone());
                resp.header.id = ctx.query().header.id;
                ctx.set_cached_response(resp);
                return Ok(());
            }
            TableHit::Miss => {}
        }

        let result = next.run(ctx).await;

        if let Some(resp) = ctx.response() {
            if !ctx.served_from_cache() {
                self.store(key, resp.clone());
            }
        }
        result
    }
}

/// Cache lifetime of a response: minimum TTL over answers and
/// authorities, a default when neither section carries records.
fn response_ttl(resp: &Message) -> Duration {
    let min = resp
        .answers
        .iter()
        .chain(resp.authorities.iter())
        .map(|r| r.ttl)
        .min();
    Duration::from_secs(min.unwrap_or(DEFAULT_RESP_TTL).max(1) as u64)
}

fn spawn_dump_loop(
    table: Arc<CacheTable>,
    changes: Arc<AtomicU64>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if changes.load(Ordering::Relaxed) < MIN_CHANGES_TO_DUMP {
                        continue;
                    }
                    changes.store(0, Ordering::Relaxed);
                    dump_to_file(&table, path.clone()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn dump_to_file(table: &CacheTable, path: PathBuf) {
    let entries: Vec<DumpEntry> = table
        .snapshot()
        .into_iter()
        .map(|(key, resp, remaining)| DumpEntry {
            key,
            remaining,
            resp,
        })
        .collect();
    let count = entries.len();
    let display = path.display().to_string();
    let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
        let file = std::fs::File::create(&path)?;
        let mut writer = io::BufWriter::new(file);
        dump::write_snapshot(&mut writer, &entries)
    })
    .await;
    match result {
        Ok(Ok(())) => debug!(entries = count, path = %display, "cache snapshot written"),
        Ok(Err(e)) => warn!(path = %display, error = %e, "failed to write cache snapshot"),
        Err(e) => warn!(error = %e, "cache snapshot task failed"),
    }
}
