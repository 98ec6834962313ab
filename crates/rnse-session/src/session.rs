//! A participant's session: one engine, one local scene, one transport.

use crate::authority::AuthorityTransport;
use crate::error::{Result, SessionError};
use parking_lot::{Mutex, RwLock};
use rnse_core::{Attributes, NodeHandle, NodeId, NodeKind, ParticipantId, ReplicatedNode};
use rnse_sync::{
    AuthorityEvent, LocalAdapter, LocalContent, MemoryScene, Notification, NotificationLog,
    NotificationSink, OpBuffer, SyncConfig, SyncEngine, TickReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Events emitted by a session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Connected { participant: ParticipantId },
    /// A tick that did something.
    Ticked(TickReport),
    NotificationAttached { node: NodeHandle, notification: Notification },
    NotificationDetached { node: NodeHandle, notification: Notification },
    Disconnected { participant: ParticipantId },
}

/// Drives a [`SyncEngine`] against an authority.
///
/// Lock order is engine, then scene, then notifications. No lock is held
/// across an await.
pub struct Session<T: AuthorityTransport, A: LocalAdapter + Send + Sync + 'static = MemoryScene> {
    participant: ParticipantId,
    transport: Arc<T>,
    engine: Arc<RwLock<SyncEngine>>,
    scene: Arc<RwLock<A>>,
    notifications: Arc<RwLock<NotificationLog>>,
    inbox: Mutex<mpsc::UnboundedReceiver<AuthorityEvent>>,
    event_tx: broadcast::Sender<SessionEvent>,
    tick_interval: Duration,
}

impl<T: AuthorityTransport, A: LocalAdapter + Send + Sync + 'static> Session<T, A> {
    /// Join the authority and start with its snapshot queued.
    pub async fn connect(config: SyncConfig, scene: A, transport: Arc<T>) -> Result<Self> {
        let participant = config.participant.clone();
        let inbox = transport.join(&participant).await?;
        let (event_tx, _) = broadcast::channel(256);
        let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));

        let session = Self {
            participant: participant.clone(),
            transport,
            engine: Arc::new(RwLock::new(SyncEngine::new(config))),
            scene: Arc::new(RwLock::new(scene)),
            notifications: Arc::new(RwLock::new(NotificationLog::new())),
            inbox: Mutex::new(inbox),
            event_tx,
            tick_interval,
        };
        let _ = session.event_tx.send(SessionEvent::Connected { participant });
        Ok(session)
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn engine(&self) -> &Arc<RwLock<SyncEngine>> {
        &self.engine
    }

    pub fn scene(&self) -> &Arc<RwLock<A>> {
        &self.scene
    }

    pub fn notifications(&self) -> &Arc<RwLock<NotificationLog>> {
        &self.notifications
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Run a local edit against the engine and the scene together.
    pub fn edit<R>(&self, f: impl FnOnce(&mut SyncEngine, &mut A) -> R) -> R {
        let mut engine = self.engine.write();
        let mut scene = self.scene.write();
        f(&mut engine, &mut scene)
    }

    pub fn read<R>(&self, f: impl FnOnce(&SyncEngine, &A) -> R) -> R {
        let engine = self.engine.read();
        let scene = self.scene.read();
        f(&engine, &scene)
    }

    /// Move everything the authority sent so far into the engine.
    fn drain_inbox(&self, engine: &mut SyncEngine) -> Result<usize> {
        let mut inbox = self.inbox.lock();
        let mut count = 0;
        loop {
            match inbox.try_recv() {
                Ok(event) => {
                    engine.handle_event(event);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(count),
                Err(mpsc::error::TryRecvError::Disconnected) if count == 0 => {
                    return Err(SessionError::Closed)
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(count),
            }
        }
    }

    /// Whether the engine has nothing left to do and nothing is queued.
    pub fn is_idle(&self) -> Result<bool> {
        let mut engine = self.engine.write();
        self.drain_inbox(&mut engine)?;
        Ok(!engine.has_pending_work())
    }

    /// Run one tick and forward its output to the authority.
    pub async fn tick(&self) -> Result<TickReport> {
        let (report, ops, changes) = {
            let mut engine = self.engine.write();
            self.drain_inbox(&mut engine)?;
            let mut scene = self.scene.write();
            let mut notifications = self.notifications.write();

            let mut adapter = Outbound {
                inner: &mut *scene,
                sent: Vec::new(),
            };
            let mut sink = BroadcastSink {
                log: &mut *notifications,
                events: &self.event_tx,
            };
            let mut ops = OpBuffer::new();
            let report = engine.tick(&mut adapter, &mut ops, &mut sink);

            let changes: Vec<(NodeId, Attributes)> = adapter
                .sent
                .into_iter()
                .filter_map(|(h, attrs)| engine.get(h).and_then(|n| n.id).map(|id| (id, attrs)))
                .collect();
            (report, ops.take(), changes)
        };

        if !ops.is_empty() {
            self.transport.submit(&self.participant, ops).await?;
        }
        for (id, attributes) in changes {
            match self
                .transport
                .update_attributes(&self.participant, id, attributes)
                .await
            {
                Ok(()) => {}
                Err(SessionError::UnknownNode(id)) => {
                    tracing::debug!(participant = %self.participant, node = %id, "attribute change for deleted node dropped");
                }
                Err(err) => return Err(err),
            }
        }

        if report.events_applied + report.local_moves + report.authority_ops > 0 {
            let _ = self.event_tx.send(SessionEvent::Ticked(report.clone()));
        }
        Ok(report)
    }

    /// Tick on the configured interval, `ticks` times.
    pub async fn run(&self, ticks: usize) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        for _ in 0..ticks {
            interval.tick().await;
            self.tick().await?;
        }
        Ok(())
    }

    /// Tick until idle. Returns the number of ticks run.
    pub async fn tick_until_idle(&self, max_ticks: usize) -> Result<usize> {
        for ticks in 0..max_ticks {
            if self.is_idle()? {
                return Ok(ticks);
            }
            self.tick().await?;
        }
        Ok(max_ticks)
    }

    /// Leave the authority and tear the engine down, removing transient
    /// local objects. Returns how many were removed.
    pub async fn disconnect(self) -> Result<usize> {
        self.transport.leave(&self.participant).await?;
        let removed = {
            let mut guard = self.engine.write();
            let config = guard.config().clone();
            let engine = std::mem::replace(&mut *guard, SyncEngine::new(config));
            let mut scene = self.scene.write();
            engine.shutdown(&mut *scene)
        };
        let _ = self.event_tx.send(SessionEvent::Disconnected {
            participant: self.participant.clone(),
        });
        Ok(removed)
    }
}

impl<T: AuthorityTransport, A: LocalAdapter + Send + Sync + 'static> std::fmt::Debug for Session<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("participant", &self.participant)
            .field("engine", &*self.engine.read())
            .finish()
    }
}

/// Tick every session in turn until all of them are idle at once.
/// Returns the number of rounds run.
pub async fn settle<T, A>(sessions: &[&Session<T, A>], max_rounds: usize) -> Result<usize>
where
    T: AuthorityTransport,
    A: LocalAdapter + Send + Sync + 'static,
{
    for round in 0..max_rounds {
        let mut idle = true;
        for session in sessions {
            if !session.is_idle()? {
                idle = false;
                session.tick().await?;
            }
        }
        if idle {
            return Ok(round);
        }
        tokio::task::yield_now().await;
    }
    Ok(max_rounds)
}

/// Passes everything through to the real adapter except attribute changes,
/// which the session forwards to the transport itself.
struct Outbound<'a, A: LocalAdapter> {
    inner: &'a mut A,
    sent: Vec<(NodeHandle, Attributes)>,
}

impl<A: LocalAdapter> LocalAdapter for Outbound<'_, A> {
    fn local_child_order(&self, parent: NodeHandle) -> Vec<NodeHandle> {
        self.inner.local_child_order(parent)
    }

    fn move_local_child(&mut self, child: NodeHandle, index: usize) {
        self.inner.move_local_child(child, index)
    }

    fn set_local_parent(&mut self, child: NodeHandle, parent: Option<NodeHandle>) {
        self.inner.set_local_parent(child, parent)
    }

    fn apply_attributes(&mut self, node: NodeHandle, attributes: &Attributes) {
        self.inner.apply_attributes(node, attributes)
    }

    fn send_attribute_changes(&mut self, node: NodeHandle, attributes: &Attributes) {
        self.sent.push((node, attributes.clone()));
    }

    fn is_selected(&self, node: NodeHandle) -> bool {
        self.inner.is_selected(node)
    }

    fn local_content(&self, kind: &NodeKind, attributes: &Attributes) -> Option<LocalContent> {
        self.inner.local_content(kind, attributes)
    }

    fn instantiate(&mut self, node: &ReplicatedNode) -> bool {
        self.inner.instantiate(node)
    }

    fn destroy(&mut self, node: NodeHandle) {
        self.inner.destroy(node)
    }
}

struct BroadcastSink<'a> {
    log: &'a mut NotificationLog,
    events: &'a broadcast::Sender<SessionEvent>,
}

impl NotificationSink for BroadcastSink<'_> {
    fn on_notification_attached(&mut self, node: NodeHandle, notification: &Notification) {
        self.log.on_notification_attached(node, notification);
        let _ = self.events.send(SessionEvent::NotificationAttached {
            node,
            notification: notification.clone(),
        });
    }

    fn on_notification_detached(&mut self, node: NodeHandle, notification: &Notification) {
        self.log.on_notification_detached(node, notification);
        let _ = self.events.send(SessionEvent::NotificationDetached {
            node,
            notification: notification.clone(),
        });
    }
}
