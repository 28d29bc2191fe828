use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout_at};
use tracing::{debug, warn};

use crate::chain::{Chain, Next, Stage};
use crate::config::FallbackConfig;
use crate::context::{QueryContext, bounded_deadline};
use crate::error::{ResolveError, Result};
use crate::message::Message;

const DEFAULT_PARALLEL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_THRESHOLD: Duration = Duration::from_millis(500);

/// Terminal state of the primary branch, published to the secondary's
/// gate. `Pending` is the watch channel's initial `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrimaryOutcome {
    Done,
    Failed,
}

/// Races a primary chain against a secondary chain and surfaces exactly
/// one result per request.
///
/// The secondary launches when the primary fails or the threshold
/// elapses with the primary still pending; with `always_standby` it
/// launches immediately but its result is held back until the primary
/// is known not to win. Primary is preferred when both are ready.
pub struct FallbackStage {
    primary: Chain,
    secondary: Chain,
    threshold: Duration,
    always_standby: bool,
}

impl FallbackStage {
    pub fn new(primary: Chain, secondary: Chain, cfg: &FallbackConfig) -> Self {
        let threshold = if cfg.threshold_ms == 0 {
            DEFAULT_THRESHOLD
        } else {
            Duration::from_millis(cfg.threshold_ms)
        };
        FallbackStage {
            primary,
            secondary,
            threshold,
            always_standby: cfg.always_standby,
        }
    }

    async fn race(&self, ctx: &mut QueryContext) -> Result<()> {
        // Results are Option<Message>: None marks a branch that finished
        // without a usable response.
        let (res_tx, mut res_rx) = mpsc::channel::<Option<Message>>(2);
        let (outcome_tx, outcome_rx) = watch::channel::<Option<PrimaryOutcome>>(None);

        self.spawn_primary(ctx, res_tx.clone(), outcome_tx);
        self.spawn_secondary(ctx, res_tx, outcome_rx);

        let outer = ctx.deadline();
        let mut finished = 0;
        while finished < 2 {
            let received = match outer {
                Some(deadline) => timeout_at(deadline, res_rx.recv())
                    .await
                    .map_err(|_| ResolveError::DeadlineExceeded)?,
                None => res_rx.recv().await,
            };
            match received {
                Some(Some(resp)) => {
                    ctx.set_response(resp);
                    return Ok(());
                }
                Some(None) => finished += 1,
                None => break, // both branches gone without a result
            }
        }
        Err(ResolveError::FallbackExhausted)
    }

    fn spawn_primary(
        &self,
        ctx: &QueryContext,
        res_tx: mpsc::Sender<Option<Message>>,
        outcome_tx: watch::Sender<Option<PrimaryOutcome>>,
    ) {
        let chain = self.primary.clone();
        let mut branch = ctx.fork();
        let deadline = bounded_deadline(ctx.deadline(), DEFAULT_PARALLEL_TIMEOUT);
        branch.set_deadline(deadline);
        tokio::spawn(async move {
            let resp = match timeout_at(deadline, chain.run(&mut branch)).await {
                Ok(Ok(())) => branch.take_response(),
                Ok(Err(e)) => {
                    warn!(error = %e, "fallback primary error");
                    None
                }
                Err(_) => {
                    warn!("fallback primary timed out");
                    None
                }
            };
            let outcome = if resp.is_some() {
                PrimaryOutcome::Done
            } else {
                PrimaryOutcome::Failed
            };
            let _ = outcome_tx.send(Some(outcome));
            let _ = res_tx.send(resp).await;
        });
    }

    fn spawn_secondary(
        &self,
        ctx: &QueryContext,
        res_tx: mpsc::Sender<Option<Message>>,
        mut outcome_rx: watch::Receiver<Option<PrimaryOutcome>>,
    ) {
        let chain = self.secondary.clone();
        let mut branch = ctx.fork();
        let deadline = bounded_deadline(ctx.deadline(), DEFAULT_PARALLEL_TIMEOUT);
        branch.set_deadline(deadline);
        let threshold = self.threshold;
        let always_standby = self.always_standby;
        let outer = ctx.deadline();
        tokio::spawn(async move {
            if !always_standby {
                tokio::select! {
                    outcome = primary_outcome(&mut outcome_rx) => {
                        if outcome == Some(PrimaryOutcome::Done) {
                            debug!("fallback secondary skipped, primary answered");
                            return;
                        }
                        // Primary failed; take over.
                    }
                    _ = sleep(threshold) => {
                        debug!("fallback threshold elapsed, launching secondary");
                    }
                }
            }

            let resp = match timeout_at(deadline, chain.run(&mut branch)).await {
                Ok(Ok(())) => branch.take_response(),
                Ok(Err(e)) => {
                    warn!(error = %e, "fallback secondary error");
                    None
                }
                Err(_) => {
                    warn!("fallback secondary timed out");
                    None
                }
            };

            // Standby holds a usable result until the primary is known to
            // have failed, the threshold elapses, or the outer deadline
            // fires; a primary win discards it.
            if always_standby && resp.is_some() {
                let held = tokio::select! {
                    outcome = primary_outcome(&mut outcome_rx) => outcome,
                    _ = sleep(threshold) => None,
                    _ = sleep_until_outer(outer) => None,
                };
                if held == Some(PrimaryOutcome::Done) {
                    return;
                }
            }
            let _ = res_tx.send(resp).await;
        });
    }
}

#[async_trait]
impl Stage for FallbackStage {
    async fn execute(&self, ctx: &mut QueryContext, _next: Next) -> Result<()> {
        self.race(ctx).await
    }
}

/// Resolve once the primary branch reaches a terminal state.
async fn primary_outcome(
    rx: &mut watch::Receiver<Option<PrimaryOutcome>>,
) -> Option<PrimaryOutcome> {
    loop {
        if let Some(outcome) = *rx.borrow() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

async fn sleep_until_outer(outer: Option<tokio::time::Instant>) {
    match outer {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
