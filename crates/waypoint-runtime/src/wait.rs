//! Durable Wait Runtime: suspend a run on an external signal or timer and
//! resume it exactly once.
//!
//! State lives in a `WaitStore`; delivery to in-process waiters goes through
//! oneshot channels. Resumptions nobody in this process is waiting for (a run
//! paused at a HITL node, or one suspended by an earlier process) are
//! returned from `tick` for the caller to resume through the executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, RuntimeEvent};
use waypoint_core::traits::WaitStore;
use waypoint_core::types::RunId;
use waypoint_core::wait::{ResumeReason, Resumption, SignalOutcome, WaitKey, WaitRequest};

struct Waiter {
    run_id: RunId,
    tx: oneshot::Sender<ResumeReason>,
}

pub struct DurableWaitRuntime {
    store: Arc<dyn WaitStore>,
    events: Option<Arc<EventBus>>,
    /// In-process waiters by request id.
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl DurableWaitRuntime {
    pub fn new(store: Arc<dyn WaitStore>) -> Self {
        Self {
            store,
            events: None,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<dyn WaitStore> {
        &self.store
    }

    fn waiters(&self) -> Result<MutexGuard<'_, HashMap<String, Waiter>>> {
        self.waiters
            .lock()
            .map_err(|e| WaypointError::Wait(format!("waiter table poisoned: {}", e)))
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Persist a wait without suspending the caller. Used when the whole run
    /// suspends (HITL pause) and will be resumed from `tick`'s output.
    pub fn register(&self, key: &WaitKey, deadline: Option<DateTime<Utc>>) -> Result<WaitRequest> {
        let request = self.store.insert_wait(key, deadline)?;
        self.announce(&request);
        Ok(request)
    }

    fn announce(&self, request: &WaitRequest) {
        debug!(run_id = %request.wait_key.run_id, key = %request.wait_key.key, request_id = %request.id, "Wait registered");
        self.publish(RuntimeEvent::WaitRegistered {
            run_id: request.wait_key.run_id.clone(),
            request_id: request.id.clone(),
            key: request.wait_key.key.clone(),
        });
    }

    /// Persist a wait and suspend until `tick` delivers it.
    pub async fn wait(
        &self,
        key: &WaitKey,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<ResumeReason> {
        let (tx, rx) = oneshot::channel();
        let request = {
            // Hold the waiter table across the insert so a concurrent tick
            // cannot drain the request before its waiter is registered.
            let mut waiters = self.waiters()?;
            let request = self.store.insert_wait(key, deadline)?;
            waiters.insert(
                request.id.clone(),
                Waiter {
                    run_id: key.run_id.clone(),
                    tx,
                },
            );
            request
        };
        self.announce(&request);

        rx.await.map_err(|_| {
            WaypointError::Wait(format!("wait {} abandoned before delivery", request.id))
        })
    }

    /// Like `wait`, mapping a timeout to `WaypointError::Timeout`.
    pub async fn wait_for_signal(
        &self,
        key: &WaitKey,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<serde_json::Value> {
        match self.wait(key, deadline).await? {
            ResumeReason::Signalled(payload) => Ok(payload),
            ResumeReason::TimedOut => Err(WaypointError::Timeout {
                wait_key: key.to_string(),
            }),
        }
    }

    /// Record a signal. Schedules the oldest outstanding request for the key;
    /// with no outstanding request (including after it already resumed) the
    /// signal is recorded and has no effect.
    pub fn signal(&self, key: &WaitKey, payload: serde_json::Value) -> Result<SignalOutcome> {
        let outcome = self.store.signal(key, payload)?;
        match &outcome {
            SignalOutcome::Scheduled { request_id } => {
                debug!(wait_key = %key, request_id = %request_id, "Signal scheduled resumption");
            }
            SignalOutcome::NoWaiter => {
                debug!(wait_key = %key, "Signal had no outstanding waiter");
            }
        }
        Ok(outcome)
    }

    /// Expire due deadlines, then deliver every ready request exactly once.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Resumption>> {
        let expired = self.store.expire_due(now)?;
        if expired > 0 {
            debug!(expired, "Wait deadlines elapsed");
        }

        let drained = self.store.drain_ready()?;
        if drained.is_empty() {
            return Ok(vec![]);
        }

        let mut waiters = self.waiters()?;
        let mut resumptions = Vec::with_capacity(drained.len());
        for request in drained {
            let reason = match &request.signal {
                Some(envelope) => ResumeReason::Signalled(envelope.payload.clone()),
                None => ResumeReason::TimedOut,
            };
            let delivered = waiters
                .remove(&request.id)
                .map(|w| w.tx.send(reason.clone()).is_ok())
                .unwrap_or(false);

            self.publish(RuntimeEvent::WaitResumed {
                run_id: request.wait_key.run_id.clone(),
                request_id: request.id.clone(),
                key: request.wait_key.key.clone(),
                timed_out: matches!(reason, ResumeReason::TimedOut),
            });
            resumptions.push(Resumption {
                request,
                reason,
                delivered,
            });
        }
        Ok(resumptions)
    }

    /// Consume every outstanding wait of a run that has finished.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<usize> {
        let cancelled = self.store.cancel_run(run_id)?;
        self.waiters()?.retain(|_, w| &w.run_id != run_id);
        Ok(cancelled)
    }

    pub fn pending_for_run(&self, run_id: &RunId) -> Result<Vec<WaitRequest>> {
        self.store.pending_for_run(run_id)
    }

    /// Whether a task in this process is suspended on one of the run's waits.
    pub fn has_waiter(&self, run_id: &RunId) -> Result<bool> {
        Ok(self.waiters()?.values().any(|w| &w.run_id == run_id))
    }

    /// Drive `tick` every `interval` until cancelled, forwarding undelivered
    /// resumptions to `undelivered`.
    pub async fn run_ticker(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        undelivered: Option<mpsc::UnboundedSender<Resumption>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Wait ticker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Wait ticker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()) {
                        Ok(resumptions) => {
                            for r in resumptions.into_iter().filter(|r| !r.delivered) {
                                match &undelivered {
                                    Some(tx) => {
                                        if tx.send(r).is_err() {
                                            warn!("Resumption receiver dropped");
                                        }
                                    }
                                    None => {
                                        warn!(run_id = %r.run_id(), "Undelivered resumption dropped");
                                    }
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "Wait tick failed"),
                    }
                }
            }
        }
    }
}
