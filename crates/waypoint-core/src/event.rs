use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::Result;
use crate::types::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunPaused,
    RunResumed,
    NodeStart,
    NodeComplete,
    NodeError,
    EdgeTraversed,
    DecisionRecorded,
    ProblemReported,
    PersistenceFailed,
    WaitRegistered,
    WaitResumed,
    GraphEvolutionApplied,
    GraphEvolutionRejected,
}

/// Lifecycle event published by the execution core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    RunStarted {
        run_id: RunId,
        goal_id: String,
        graph_id: String,
    },
    RunCompleted {
        run_id: RunId,
        steps: usize,
        latency_ms: u64,
    },
    RunFailed {
        run_id: RunId,
        node_id: Option<String>,
        error: String,
    },
    RunPaused {
        run_id: RunId,
        paused_at: String,
    },
    RunResumed {
        run_id: RunId,
        node_id: String,
    },
    NodeStart {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        visit: u32,
    },
    NodeComplete {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        latency_ms: u64,
        tokens_used: u64,
    },
    NodeError {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    EdgeTraversed {
        run_id: RunId,
        edge_id: String,
        source: String,
        target: String,
    },
    DecisionRecorded {
        run_id: RunId,
        decision_id: String,
        node_id: String,
        chosen: String,
    },
    ProblemReported {
        run_id: RunId,
        problem_id: String,
        description: String,
    },
    PersistenceFailed {
        run_id: RunId,
        error: String,
    },
    WaitRegistered {
        run_id: RunId,
        request_id: String,
        key: String,
    },
    WaitResumed {
        run_id: RunId,
        request_id: String,
        key: String,
        timed_out: bool,
    },
    GraphEvolutionApplied {
        correlation_id: String,
        snapshot_id: String,
        graph_id: String,
        version: u32,
    },
    GraphEvolutionRejected {
        correlation_id: String,
        snapshot_id: String,
        graph_id: String,
        violations: Vec<String>,
    },
}

impl RuntimeEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted { .. } => EventType::RunStarted,
            Self::RunCompleted { .. } => EventType::RunCompleted,
            Self::RunFailed { .. } => EventType::RunFailed,
            Self::RunPaused { .. } => EventType::RunPaused,
            Self::RunResumed { .. } => EventType::RunResumed,
            Self::NodeStart { .. } => EventType::NodeStart,
            Self::NodeComplete { .. } => EventType::NodeComplete,
            Self::NodeError { .. } => EventType::NodeError,
            Self::EdgeTraversed { .. } => EventType::EdgeTraversed,
            Self::DecisionRecorded { .. } => EventType::DecisionRecorded,
            Self::ProblemReported { .. } => EventType::ProblemReported,
            Self::PersistenceFailed { .. } => EventType::PersistenceFailed,
            Self::WaitRegistered { .. } => EventType::WaitRegistered,
            Self::WaitResumed { .. } => EventType::WaitResumed,
            Self::GraphEvolutionApplied { .. } => EventType::GraphEvolutionApplied,
            Self::GraphEvolutionRejected { .. } => EventType::GraphEvolutionRejected,
        }
    }

    /// The run this event belongs to; evolution events belong to none.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunPaused { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::NodeStart { run_id, .. }
            | Self::NodeComplete { run_id, .. }
            | Self::NodeError { run_id, .. }
            | Self::EdgeTraversed { run_id, .. }
            | Self::DecisionRecorded { run_id, .. }
            | Self::ProblemReported { run_id, .. }
            | Self::PersistenceFailed { run_id, .. }
            | Self::WaitRegistered { run_id, .. }
            | Self::WaitResumed { run_id, .. } => Some(run_id),
            Self::GraphEvolutionApplied { .. } | Self::GraphEvolutionRejected { .. } => None,
        }
    }
}

/// Receives events for one subscription.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: RuntimeEvent) -> BoxFuture<'_, Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(RuntimeEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: RuntimeEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(self(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives every event type.
    types: Option<HashSet<EventType>>,
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

fn accepts(types: &Option<HashSet<EventType>>, ty: EventType) -> bool {
    types.as_ref().map_or(true, |t| t.contains(&ty))
}

fn type_filter(types: &[EventType]) -> Option<HashSet<EventType>> {
    if types.is_empty() {
        None
    } else {
        Some(types.iter().copied().collect())
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: SubscriptionId,
    types: Option<HashSet<EventType>>,
    handler: Arc<dyn EventHandler>,
}

type Handlers = Arc<Mutex<Vec<HandlerEntry>>>;

/// Typed publish/subscribe bus.
///
/// `publish` never blocks. Handlers are invoked one after another, in
/// subscription order, by a single dispatch task, so every handler sees
/// events in publish order. Raw channel subscriptions get their own FIFO
/// queue. Handler errors and panics are logged and never reach the publisher.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    handlers: Handlers,
    /// Queue of the dispatch task; spawned by the first `subscribe`.
    dispatch: Mutex<Option<mpsc::UnboundedSender<RuntimeEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            handlers: Arc::new(Mutex::new(Vec::new())),
            dispatch: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for `types` (empty = all types).
    ///
    /// The first call spawns the dispatch task, so it must be made within a
    /// tokio runtime.
    pub fn subscribe<H: EventHandler>(&self, types: &[EventType], handler: H) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.handlers).push(HandlerEntry {
            id,
            types: type_filter(types),
            handler: Arc::new(handler),
        });

        let mut dispatch = lock(&self.dispatch);
        if dispatch.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(dispatch_loop(self.handlers.clone(), rx));
            *dispatch = Some(tx);
        }
        id
    }

    /// Register a raw queue instead of a handler.
    pub fn subscribe_channel(
        &self,
        types: &[EventType],
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(Subscriber {
            id,
            types: type_filter(types),
            tx,
        });
        (id, rx)
    }

    /// Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() != before {
            return true;
        }
        drop(subs);

        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Enqueue the event for every matching subscriber.
    pub fn publish(&self, event: RuntimeEvent) {
        let ty = event.event_type();
        let wanted = lock(&self.handlers).iter().any(|h| accepts(&h.types, ty));
        if wanted {
            if let Some(tx) = lock(&self.dispatch).as_ref() {
                tx.send(event.clone()).ok();
            }
        }

        let mut subs = lock(&self.subscribers);
        // Receivers that were dropped are pruned on the way through
        subs.retain(|s| !accepts(&s.types, ty) || s.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len() + lock(&self.handlers).len()
    }
}

async fn dispatch_loop(handlers: Handlers, mut rx: mpsc::UnboundedReceiver<RuntimeEvent>) {
    while let Some(event) = rx.recv().await {
        let ty = event.event_type();
        let matching: Vec<HandlerEntry> = lock(&handlers)
            .iter()
            .filter(|h| accepts(&h.types, ty))
            .cloned()
            .collect();
        for entry in matching {
            let delivery = entry.handler.handle(event.clone());
            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = entry.id.0, event_type = ?ty, error = %e, "Event handler failed");
                }
                Err(_) => {
                    error!(subscription = entry.id.0, event_type = ?ty, "Event handler panicked");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
