//! Authoritative side of the synchronization protocol.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::link::Link;
use crate::message::Message;
use crate::sync::{
    INVALID_OBJECT_ID, ObjectId, Replicated, SyncClass, SyncConnection, SyncOp, encode_members,
};
use crate::transport::ReliableTransport;

/// Default emission period for `Stream`-class members.
pub const DEFAULT_STREAM_SYNCHRONIZATION_PERIOD: Duration = Duration::from_millis(1000);

/// Pending delta for one object, collapsed across notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Create,
    Update,
    Destroy,
}

struct ServerObject {
    id: ObjectId,
    object: Weak<Mutex<dyn Replicated>>,
    has_stream: bool,
    last_stream_emit: Instant,
}

pub(crate) struct ServerState {
    objects: Vec<ServerObject>,
    links: Vec<Box<dyn SyncConnection>>,
    /// FIFO of first-time insertion, so delta emission order is
    /// deterministic.
    pending: Vec<(ObjectId, PendingOp)>,
    next_id: ObjectId,
    stream_period: Duration,
}

impl ServerState {
    fn pending_index(&self, id: ObjectId) -> Option<usize> {
        self.pending
            .iter()
            .position(|(pending_id, _)| *pending_id == id)
    }

    pub(crate) fn note_modified(&mut self, id: ObjectId) {
        if self.pending_index(id).is_none() {
            self.pending.push((id, PendingOp::Update));
        }
        // A pending Create already carries every member; a pending Update
        // stays an Update; a pending Destroy cannot be revived.
    }

    pub(crate) fn note_removed(&mut self, id: ObjectId) {
        self.objects.retain(|entry| entry.id != id);
        match self.pending_index(id) {
            Some(index) => match self.pending[index].1 {
                PendingOp::Update => self.pending[index].1 = PendingOp::Destroy,
                PendingOp::Create => {
                    // Never announced: the replicas must not hear about it.
                    self.pending.remove(index);
                }
                PendingOp::Destroy => {}
            },
            None => self.pending.push((id, PendingOp::Destroy)),
        }
    }

    fn serialize(&self, id: ObjectId, op: PendingOp) -> Option<Message> {
        let mut message = Message::new();
        match op {
            PendingOp::Create => {
                let entry = self.objects.iter().find(|entry| entry.id == id)?;
                let object = entry.object.upgrade()?;
                let mut object = object.lock().unwrap();
                message.push(&(SyncOp::Create as u8));
                message.push(&object.object_type_id());
                message.push(&id);
                encode_members(&mut *object, SyncOp::Create, &mut message);
            }
            PendingOp::Update => {
                let entry = self.objects.iter().find(|entry| entry.id == id)?;
                let object = entry.object.upgrade()?;
                let mut object = object.lock().unwrap();
                message.push(&(SyncOp::Update as u8));
                message.push(&id);
                encode_members(&mut *object, SyncOp::Update, &mut message);
            }
            PendingOp::Destroy => {
                message.push(&(SyncOp::Destroy as u8));
                message.push(&id);
            }
        }
        Some(message)
    }
}

/// The authoritative synchronizer.
///
/// Owns the registry of live objects (created through
/// [`create`](SynchronizerServer::create)), collapses change notifications
/// into at most one pending delta per object, and broadcasts the deltas to
/// every attached client link on each [`update`](SynchronizerServer::update)
/// tick. Attaching a client first sends it a catch-up snapshot: one create
/// message per live object, in creation order.
pub struct SynchronizerServer {
    state: Arc<Mutex<ServerState>>,
}

impl SynchronizerServer {
    /// Create a synchronizer with the default stream period.
    pub fn new() -> Self {
        SynchronizerServer {
            state: Arc::new(Mutex::new(ServerState {
                objects: Vec::new(),
                links: Vec::new(),
                pending: Vec::new(),
                next_id: INVALID_OBJECT_ID + 1,
                stream_period: DEFAULT_STREAM_SYNCHRONIZATION_PERIOD,
            })),
        }
    }

    /// Set the emission period for `Stream`-class members.
    pub fn set_stream_synchronization_period(&self, period: Duration) {
        self.state.lock().unwrap().stream_period = period;
    }

    /// Register `object` for synchronization.
    ///
    /// Assigns the object id and queues a create delta. The returned handle
    /// owns the object; dropping it queues the destroy delta.
    pub fn create<T: Replicated>(&self, object: T) -> SyncedHandle<T> {
        let mut object = object;
        let mut has_stream = false;
        for member in object.members() {
            // Fresh members all read as modified; consume the flags so the
            // first modify() reports actual mutations.
            member.take_modified();
            has_stream |= member.class() == SyncClass::Stream;
        }

        let shared = Arc::new(Mutex::new(object));
        let erased: Arc<Mutex<dyn Replicated>> = shared.clone();

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.objects.push(ServerObject {
            id,
            object: Arc::downgrade(&erased),
            has_stream,
            last_stream_emit: Instant::now(),
        });
        state.pending.push((id, PendingOp::Create));
        tracing::debug!(object_id = id, "object registered");

        SyncedHandle {
            id,
            object: shared,
            server: Arc::downgrade(&self.state),
        }
    }

    /// Attach a client link and send it the catch-up snapshot.
    ///
    /// Returns false when the link is already attached.
    pub fn add_client<T: ReliableTransport>(&self, link: &Link<T>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state
            .links
            .iter()
            .any(|attached| attached.token() == SyncConnection::token(link))
        {
            return false;
        }

        for index in 0..state.objects.len() {
            let id = state.objects[index].id;
            if let Some(message) = state.serialize(id, PendingOp::Create) {
                link.send_sync(&message);
            }
        }

        tracing::debug!(objects = state.objects.len(), "client link attached");
        state.links.push(Box::new(link.clone()));
        true
    }

    /// Detach a client link. No protocol message is sent.
    pub fn remove_client<T: ReliableTransport>(&self, link: &Link<T>) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.links.len();
        state
            .links
            .retain(|attached| attached.token() != SyncConnection::token(link));
        state.links.len() != before
    }

    /// Broadcast pending deltas to every attached client.
    ///
    /// Also records updates for objects whose stream period elapsed and
    /// drops links whose transport is no longer attached.
    pub fn update(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // Stream-period ticks.
        let period = state.stream_period;
        let due: Vec<ObjectId> = state
            .objects
            .iter()
            .filter(|entry| {
                entry.has_stream && now.duration_since(entry.last_stream_emit) >= period
            })
            .map(|entry| entry.id)
            .collect();
        for id in due {
            state.note_modified(id);
        }

        let dropped = {
            let before = state.links.len();
            state.links.retain(|link| link.is_attached());
            before - state.links.len()
        };
        if dropped > 0 {
            tracing::debug!(dropped, "detached dead client links");
        }

        let pending = std::mem::take(&mut state.pending);
        for (id, op) in pending {
            let Some(message) = state.serialize(id, op) else {
                continue;
            };
            if matches!(op, PendingOp::Create | PendingOp::Update) {
                if let Some(entry) = state.objects.iter_mut().find(|entry| entry.id == id) {
                    entry.last_stream_emit = now;
                }
            }
            for link in &state.links {
                link.send_sync(&message);
            }
        }
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Number of attached client links.
    pub fn client_count(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }
}

impl Default for SynchronizerServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle to a server-side synchronized object.
///
/// The synchronizer keeps only a non-owning reference; dropping the handle
/// removes the object and queues the destroy delta for the replicas.
pub struct SyncedHandle<T: Replicated> {
    id: ObjectId,
    object: Arc<Mutex<T>>,
    server: Weak<Mutex<ServerState>>,
}

impl<T: Replicated> SyncedHandle<T> {
    /// The server-assigned object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Read the object.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.object.lock().unwrap())
    }

    /// Mutate the object.
    ///
    /// After the closure runs, mutated members are scanned: touching any
    /// `Dynamic` or `Stream` member schedules an update delta; a mutation
    /// limited to `Static` members schedules nothing.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (result, changed) = {
            let mut object = self.object.lock().unwrap();
            let result = f(&mut object);
            let mut changed = false;
            for member in object.members() {
                if member.take_modified() && member.class() != SyncClass::Static {
                    changed = true;
                }
            }
            (result, changed)
        };

        if changed {
            if let Some(server) = self.server.upgrade() {
                server.lock().unwrap().note_modified(self.id);
            }
        }
        result
    }
}

impl<T: Replicated> Drop for SyncedHandle<T> {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.lock().unwrap().note_removed(self.id);
            tracing::debug!(object_id = self.id, "object removed");
        }
    }
}
