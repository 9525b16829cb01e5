//! Diagnostic update event bus
//!
//! Publishers enqueue [`UpdateEvent`]s on a bounded channel and a single
//! consumer task applies them in FIFO order: it first updates the bucket map
//! that backs [`DiagnosticEventBus::get_current`], then hands the event to each
//! matching subscriber one at a time. A slow subscriber therefore delays later
//! events but never reorders them, and a full queue makes publishers wait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::analyzer::AnalyzerId;
use crate::diagnostic::DiagnosticRecord;
use crate::error::{EngineError, EngineResult};
use crate::ids::{DocumentId, ProjectId, VersionStamp, WorkspaceId};
use crate::mode::{DiagnosticChannel, DiagnosticMode, ModeSelector};
use crate::result::AnalysisKind;

/// Identity of a diagnostic bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BucketId {
    /// Output of one analyzer for one kind of pass
    Live {
        project: ProjectId,
        document: Option<DocumentId>,
        analyzer: AnalyzerId,
        kind: AnalysisKind,
    },
    /// Diagnostics only an explicit build produces
    Build {
        project: ProjectId,
        document: Option<DocumentId>,
    },
}

impl BucketId {
    pub fn project(&self) -> ProjectId {
        match self {
            BucketId::Live { project, .. } | BucketId::Build { project, .. } => *project,
        }
    }

    pub fn document(&self) -> Option<DocumentId> {
        match self {
            BucketId::Live { document, .. } | BucketId::Build { document, .. } => *document,
        }
    }

    pub fn channel(&self) -> DiagnosticChannel {
        match self.document() {
            Some(_) => DiagnosticChannel::Document,
            None => DiagnosticChannel::Workspace,
        }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = |f: &mut fmt::Formatter<'_>, project: &ProjectId, document: &Option<DocumentId>| match document {
            Some(document) => write!(f, "{project}/{document}"),
            None => write!(f, "{project}"),
        };
        match self {
            BucketId::Live {
                project,
                document,
                analyzer,
                kind,
            } => {
                write!(f, "live:{analyzer}:{kind}@")?;
                scope(f, project, document)
            }
            BucketId::Build { project, document } => {
                write!(f, "build@")?;
                scope(f, project, document)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// The bucket's diagnostics were created or replaced
    Created,
    /// The bucket no longer exists
    Removed,
}

/// A change to one bucket
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    workspace: WorkspaceId,
    id: BucketId,
    kind: UpdateKind,
    diagnostics: Arc<Vec<DiagnosticRecord>>,
    solution_version: Option<VersionStamp>,
    published_at: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn created(
        workspace: WorkspaceId,
        id: BucketId,
        diagnostics: Vec<DiagnosticRecord>,
        solution_version: Option<VersionStamp>,
    ) -> Self {
        Self {
            workspace,
            id,
            kind: UpdateKind::Created,
            diagnostics: Arc::new(diagnostics),
            solution_version,
            published_at: Utc::now(),
        }
    }

    /// Removal event; never carries diagnostics
    pub fn removed(workspace: WorkspaceId, id: BucketId) -> Self {
        Self {
            workspace,
            id,
            kind: UpdateKind::Removed,
            diagnostics: Arc::new(Vec::new()),
            solution_version: None,
            published_at: Utc::now(),
        }
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    pub fn id(&self) -> &BucketId {
        &self.id
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn diagnostics(&self) -> &[DiagnosticRecord] {
        &self.diagnostics
    }

    pub fn solution_version(&self) -> Option<VersionStamp> {
        self.solution_version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn project(&self) -> ProjectId {
        self.id.project()
    }

    pub fn document(&self) -> Option<DocumentId> {
        self.id.document()
    }
}

/// Receives update events on the bus consumer task
#[async_trait]
pub trait DiagnosticsUpdatedHandler: Send + Sync {
    async fn on_diagnostics_updated(&self, event: Arc<UpdateEvent>);
}

/// Handle returned by [`DiagnosticEventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    mode: DiagnosticMode,
    handler: Arc<dyn DiagnosticsUpdatedHandler>,
}

/// Forwards events into an mpsc channel
struct ChannelHandler {
    sender: mpsc::Sender<Arc<UpdateEvent>>,
}

#[async_trait]
impl DiagnosticsUpdatedHandler for ChannelHandler {
    async fn on_diagnostics_updated(&self, event: Arc<UpdateEvent>) {
        // A dropped receiver just stops receiving
        let _ = self.sender.send(event).await;
    }
}

enum BusMessage {
    Publish(UpdateEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct BusState {
    buckets: Mutex<HashMap<(WorkspaceId, BucketId), Arc<UpdateEvent>>>,
    subscribers: RwLock<Vec<Subscriber>>,
    modes: ModeSelector,
    delivered: AtomicU64,
}

impl BusState {
    fn apply(&self, event: &Arc<UpdateEvent>) {
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = (event.workspace, event.id.clone());
        match event.kind {
            UpdateKind::Created => {
                buckets.insert(key, event.clone());
            }
            UpdateKind::Removed => {
                buckets.remove(&key);
            }
        }
    }

    fn handlers_for(&self, mode: DiagnosticMode) -> Vec<Arc<dyn DiagnosticsUpdatedHandler>> {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .iter()
            .filter(|subscriber| subscriber.mode == mode)
            .map(|subscriber| subscriber.handler.clone())
            .collect()
    }

    async fn deliver(&self, event: UpdateEvent) {
        let event = Arc::new(event);
        self.apply(&event);

        let mode = self.modes.mode(event.id.channel());
        for handler in self.handlers_for(mode) {
            let delivery = AssertUnwindSafe(handler.on_diagnostics_updated(event.clone()));
            if delivery.catch_unwind().await.is_err() {
                error!("Diagnostics subscriber panicked while handling {}", event.id);
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ordered, bounded, single-consumer event bus
pub struct DiagnosticEventBus {
    sender: mpsc::Sender<BusMessage>,
    state: Arc<BusState>,
    closed: AtomicBool,
    next_subscription: AtomicU64,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl DiagnosticEventBus {
    /// Create the bus and spawn its consumer. Must be called within a Tokio runtime.
    pub fn new(capacity: usize, modes: ModeSelector) -> Self {
        let (sender, mut receiver) = mpsc::channel::<BusMessage>(capacity.max(1));
        let state = Arc::new(BusState {
            buckets: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            modes,
            delivered: AtomicU64::new(0),
        });

        let consumer_state = state.clone();
        let consumer = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    BusMessage::Publish(event) => consumer_state.deliver(event).await,
                    BusMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    BusMessage::Shutdown => break,
                }
            }
            debug!("Diagnostic event bus consumer stopped");
        });

        Self {
            sender,
            state,
            closed: AtomicBool::new(false),
            next_subscription: AtomicU64::new(1),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Enqueue an event, waiting while the queue is full
    pub async fn publish(&self, event: UpdateEvent) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EventBusClosed);
        }
        self.sender
            .send(BusMessage::Publish(event))
            .await
            .map_err(|_| EngineError::EventBusClosed)
    }

    /// Enqueue from synchronous code outside the runtime, blocking while full.
    ///
    /// Panics if called from within an async context, like
    /// [`mpsc::Sender::blocking_send`].
    pub fn publish_blocking(&self, event: UpdateEvent) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EventBusClosed);
        }
        self.sender
            .blocking_send(BusMessage::Publish(event))
            .map_err(|_| EngineError::EventBusClosed)
    }

    /// Resolves once every event enqueued before the call was delivered
    pub async fn flush(&self) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(BusMessage::Flush(ack))
            .await
            .map_err(|_| EngineError::EventBusClosed)?;
        done.await.map_err(|_| EngineError::EventBusClosed)
    }

    pub fn subscribe(
        &self,
        mode: DiagnosticMode,
        handler: Arc<dyn DiagnosticsUpdatedHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = match self.state.subscribers.write() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(Subscriber { id, mode, handler });
        debug!("Added {} subscriber {:?}", mode, id);
        id
    }

    /// Subscribe through a channel; events are pushed in delivery order
    pub fn subscribe_channel(
        &self,
        mode: DiagnosticMode,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Arc<UpdateEvent>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.subscribe(mode, Arc::new(ChannelHandler { sender }));
        (id, receiver)
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = match self.state.subscribers.write() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    /// Current buckets matching the filters.
    ///
    /// With `id` set at most one bucket is returned.
    pub fn get_current(
        &self,
        workspace: WorkspaceId,
        project: Option<ProjectId>,
        document: Option<DocumentId>,
        id: Option<&BucketId>,
    ) -> Vec<Arc<UpdateEvent>> {
        let buckets = match self.state.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matching: Vec<Arc<UpdateEvent>> = buckets
            .iter()
            .filter(|((bucket_workspace, bucket), _)| {
                *bucket_workspace == workspace
                    && project.is_none_or(|project| bucket.project() == project)
                    && document.is_none_or(|document| bucket.document() == Some(document))
                    && id.is_none_or(|id| bucket == id)
            })
            .map(|(_, event)| event.clone())
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    /// Flattened diagnostics of [`Self::get_current`]
    pub fn get_current_diagnostics(
        &self,
        workspace: WorkspaceId,
        project: Option<ProjectId>,
        document: Option<DocumentId>,
    ) -> Vec<DiagnosticRecord> {
        self.get_current(workspace, project, document, None)
            .iter()
            .flat_map(|event| event.diagnostics().iter().cloned())
            .collect()
    }

    /// Number of events delivered so far
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver everything already queued, then stop the consumer
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(BusMessage::Shutdown).await;
        let consumer = match self.consumer.lock() {
            Ok(mut consumer) => consumer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                error!("Diagnostic event bus consumer failed: {}", e);
            }
        }
    }
}

impl Drop for DiagnosticEventBus {
    fn drop(&mut self) {
        if let Ok(mut consumer) = self.consumer.lock() {
            if let Some(consumer) = consumer.take() {
                consumer.abort();
            }
        }
    }
}
