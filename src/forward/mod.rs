mod upstream;

pub use upstream::Upstream;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::timeout_at;
use tracing::{debug, warn};

use crate::chain::{Next, Stage};
use crate::config::{DEFAULT_FORWARD_CONCURRENT, ForwardConfig, UpstreamConfig};
use crate::context::{QueryContext, bounded_deadline};
use crate::error::{ResolveError, Result};
use crate::message::Message;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

static QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Fans a query out to the configured upstreams under a per-request
/// concurrency cap. First upstream to return a usable (non-empty-answer)
/// response wins; the rest are signalled to stop. Per-upstream failures
/// are absorbed and only total exhaustion surfaces.
pub struct ForwardStage {
    upstreams: Vec<UpstreamConfig>,
    concurrent: usize,
    handles: DashMap<String, Arc<Upstream>>,
}

impl ForwardStage {
    pub fn new(cfg: ForwardConfig) -> std::result::Result<Self, crate::error::ConfigError> {
        cfg.validate()?;
        let concurrent = if cfg.concurrent == 0 {
            DEFAULT_FORWARD_CONCURRENT
        } else {
            cfg.concurrent
        };
        Ok(ForwardStage {
            upstreams: cfg.resolved_upstreams(),
            concurrent,
            handles: DashMap::new(),
        })
    }

    /// Number of live upstream handles created so far.
    pub fn cached_handles(&self) -> usize {
        self.handles.len()
    }

    /// One handle per distinct address. Creation happens inside the
    /// table's entry lock, so concurrent requests for the same address
    /// observe a single shared handle.
    fn upstream_handle(&self, cfg: &UpstreamConfig) -> Result<Arc<Upstream>> {
        if let Some(handle) = self.handles.get(&cfg.addr) {
            return Ok(Arc::clone(&handle));
        }
        match self.handles.entry(cfg.addr.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let handle = Arc::new(Upstream::new(cfg)?);
                vacant.insert(Arc::clone(&handle));
                debug!(addr = %cfg.addr, "created upstream handle");
                Ok(handle)
            }
        }
    }

    async fn dispatch_all(&self, ctx: &mut QueryContext) -> Result<()> {
        let total = self.upstreams.len();
        let (res_tx, mut res_rx) = mpsc::channel::<Result<Message>>(total.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(self.concurrent));
        let outer = ctx.deadline();
        let sub_deadline = bounded_deadline(outer, DEFAULT_QUERY_TIMEOUT);
        let query = ctx.query().clone();

        for cfg in &self.upstreams {
            // Slot acquisition happens-before dispatch, and waiting for a
            // slot still honors the outer deadline.
            let acquired = match outer {
                Some(deadline) => timeout_at(deadline, Arc::clone(&semaphore).acquire_owned())
                    .await
                    .map_err(|_| ResolveError::DeadlineExceeded)?,
                None => Arc::clone(&semaphore).acquire_owned().await,
            };
            let permit = acquired.expect("semaphore is never closed");

            let upstream = match self.upstream_handle(cfg) {
                Ok(upstream) => upstream,
                Err(e) => {
                    let _ = res_tx.try_send(Err(e));
                    continue;
                }
            };
            let tx = res_tx.clone();
            let mut cancel = cancel_rx.clone();
            let mut q = query.clone();
            tokio::spawn(async move {
                let _permit = permit;
                q.header.id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
                let result = tokio::select! {
                    _ = cancel.changed() => {
                        debug!(upstream = %upstream.addr(), "dispatch abandoned, winner already chosen");
                        return;
                    }
                    exchanged = timeout_at(sub_deadline, upstream.exchange(&q)) => match exchanged {
                        Ok(result) => result,
                        Err(_) => Err(ResolveError::DeadlineExceeded),
                    },
                };
                let _ = tx.send(result).await;
            });
        }
        drop(res_tx);

        let original_id = ctx.query().header.id;
        let mut last_err: Option<ResolveError> = None;
        loop {
            let received = match outer {
                Some(deadline) => timeout_at(deadline, res_rx.recv())
                    .await
                    .map_err(|_| ResolveError::DeadlineExceeded)?,
                None => res_rx.recv().await,
            };
            match received {
                Some(Ok(mut resp)) if resp.has_answers() => {
                    // Winner; let the in-flight losers exit promptly.
                    let _ = cancel_tx.send(true);
                    resp.header.id = original_id;
                    ctx.set_response(resp);
                    return Ok(());
                }
                Some(Ok(_)) => {
                    last_err = Some(ResolveError::Protocol(
                        "empty answer from upstream".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream dispatch failed");
                    last_err = Some(e);
                }
                None => break,
            }
        }
        Err(ResolveError::AllUpstreamsFailed {
            attempted: total,
            last: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no upstream produced a result".to_string()),
        })
    }
}

#[async_trait]
impl Stage for ForwardStage {
    async fn execute(&self, ctx: &mut QueryContext, _next: Next) -> Result<()> {
        self.dispatch_all(ctx).await
    }
}
