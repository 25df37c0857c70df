//! Background fan-out of server-list updates.
//!
//! A single updater task pulls work units from the core's scan, runs the
//! corresponding `UpdateServerList` RPCs concurrently (never more than one
//! per target; the core enforces that through the speculative version), and
//! commits or rolls back each target's two-phase version on completion. A
//! commit is only ever driven by an explicit ack: a spurious rollback costs
//! a duplicate send, a spurious commit could silently starve a member of an
//! update.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::coord::roster::RosterInner;
use crate::ids::{ServerId, ServerStatus};
use crate::utils::RosterError;

use futures::stream::{FuturesUnordered, StreamExt};

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Delay before re-issuing work to a target whose RPC just failed.
const RETRY_DELAY: Duration = Duration::from_millis(10);

type RpcCompletion =
    Pin<Box<dyn Future<Output = (ServerId, Result<bool, RosterError>)> + Send>>;

/// The updater task body. Runs until `rx_stop` flips, then drains in-flight
/// RPCs, consuming every outstanding result as a rollback.
pub(crate) async fn update_loop(
    inner: Arc<RosterInner>,
    mut rx_stop: watch::Receiver<bool>,
) {
    pf_debug!("u"; "updater task spawned");

    let mut in_flight: FuturesUnordered<RpcCompletion> =
        FuturesUnordered::new();
    let mut fail_since: HashMap<ServerId, Instant> = HashMap::new();
    let dead_timeout =
        Duration::from_millis(inner.ctx.config.dead_server_timeout_ms);

    loop {
        if *rx_stop.borrow() {
            break;
        }

        // hand out every currently assignable work unit
        let invalidations = {
            let mut core = inner.core.lock().await;
            while let Some(unit) = core.get_work() {
                pf_trace!(
                    "u";
                    "unit -> {} {} tail {}",
                    unit.target,
                    if unit.send_full { "full" } else { "incr" },
                    unit.tail_version
                );
                let sessions = inner.ctx.sessions.clone();
                in_flight.push(Box::pin(async move {
                    let target = unit.target;
                    let result = async {
                        let session =
                            sessions.open(target, &unit.locator).await?;
                        // payload assembly reads the shared pairs captured
                        // at selection time; no lock involved
                        let payload = unit.payload();
                        session.update_server_list(payload).await
                    }
                    .await;
                    (target, result)
                }));
            }
            inner.min_watch.send_replace(core.min_confirmed_version());
            core.take_confirm_invalidations()
        };
        if let Err(e) = flush_invalidations(&inner, invalidations).await {
            pf_error!("u"; "journal invalidate failed, stopping: {}", e);
            break;
        }

        tokio::select! {
            Some((target, result)) = in_flight.next(),
                    if !in_flight.is_empty() => {
                if let Err(e) = handle_completion(
                    &inner,
                    &mut fail_since,
                    dead_timeout,
                    target,
                    result,
                )
                .await
                {
                    pf_error!("u"; "journal invalidate failed, stopping: {}", e);
                    break;
                }
            },

            _ = inner.has_work.notified() => {},

            _ = rx_stop.changed() => {},
        }
    }

    // halted: let outstanding RPCs finish or time out, consuming every
    // result as a rollback
    while let Some((target, _)) = in_flight.next().await {
        let mut core = inner.core.lock().await;
        core.work_failed(target);
    }
    pf_debug!("u"; "updater task exited");
}

/// Applies one RPC completion to the core's two-phase bookkeeping.
async fn handle_completion(
    inner: &Arc<RosterInner>,
    fail_since: &mut HashMap<ServerId, Instant>,
    dead_timeout: Duration,
    target: ServerId,
    result: Result<bool, RosterError>,
) -> Result<(), RosterError> {
    match result {
        Ok(true) => {
            fail_since.remove(&target);
            let invalidations = {
                let mut core = inner.core.lock().await;
                core.work_success(target);
                inner.min_watch.send_replace(core.min_confirmed_version());
                core.take_confirm_invalidations()
            };
            flush_invalidations(inner, invalidations).await?;
        }

        Ok(false) => {
            pf_warn!("u"; "update -> {} rejected, rolling back", target);
            let mut core = inner.core.lock().await;
            core.work_failed(target);
        }

        Err(e) => {
            pf_warn!("u"; "update -> {} failed: {}", target, e);
            let still_up = {
                let mut core = inner.core.lock().await;
                core.work_failed(target);
                core.entry(target)
                    .map(|e| e.status == ServerStatus::Up)
                    .unwrap_or(false)
            };
            if still_up {
                let first =
                    fail_since.entry(target).or_insert_with(Instant::now);
                if first.elapsed() >= dead_timeout {
                    pf_warn!(
                        "u";
                        "server {} unresponsive beyond {}ms grace period",
                        target,
                        dead_timeout.as_millis()
                    );
                    inner.ctx.recovery.server_suspected(target);
                    fail_since.remove(&target);
                }
            } else {
                fail_since.remove(&target);
            }
            // pace retries to the failed target
            time::sleep(RETRY_DELAY).await;
        }
    }
    Ok(())
}

async fn flush_invalidations(
    inner: &Arc<RosterInner>,
    invalidations: Vec<crate::journal::EntryId>,
) -> Result<(), RosterError> {
    if invalidations.is_empty() {
        return Ok(());
    }
    inner.ctx.log.invalidate(&invalidations).await
}

// Tests exercising the updater end-to-end live in `coord::roster`.
