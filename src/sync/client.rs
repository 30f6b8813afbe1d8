//! Replica side of the synchronization protocol.

use std::collections::HashMap;

use crate::link::Link;
use crate::message::Message;
use crate::sync::{
    INVALID_OBJECT_ID, ObjectId, ObjectTypeId, Replicated, SyncConnection, SyncOp, decode_members,
};
use crate::transport::ReliableTransport;

type Factory = Box<dyn FnMut() -> Box<dyn Replicated> + Send>;
type Destructor = Box<dyn FnMut(Box<dyn Replicated>) + Send>;

/// A replica applying deltas received from a [`SynchronizerServer`]
/// (usually exactly one, over one server link).
///
/// The application registers, per type id, a factory producing a fresh
/// object and a destructor disposing of one. Each
/// [`update`](SynchronizerClient::update) drains the synchronization stream
/// and applies every decoded delta; malformed or unknown deltas are logged
/// and skipped without disturbing the rest of the replica.
///
/// [`SynchronizerServer`]: crate::sync::SynchronizerServer
pub struct SynchronizerClient {
    links: Vec<Box<dyn SyncConnection>>,
    /// Insertion-ordered, mirroring the server's creation order.
    objects: Vec<(ObjectId, Box<dyn Replicated>)>,
    factories: HashMap<ObjectTypeId, Factory>,
    destructors: HashMap<ObjectTypeId, Destructor>,
}

impl SynchronizerClient {
    /// Create an empty replica.
    pub fn new() -> Self {
        SynchronizerClient {
            links: Vec::new(),
            objects: Vec::new(),
            factories: HashMap::new(),
            destructors: HashMap::new(),
        }
    }

    /// Register the lifetime managers for `type_id`.
    ///
    /// `factory` produces a fresh object when a create delta for the type
    /// arrives; `destructor` disposes of the object when its destroy delta
    /// arrives.
    pub fn set_lifetime_managers(
        &mut self,
        type_id: ObjectTypeId,
        factory: impl FnMut() -> Box<dyn Replicated> + Send + 'static,
        destructor: impl FnMut(Box<dyn Replicated>) + Send + 'static,
    ) {
        self.factories.insert(type_id, Box::new(factory));
        self.destructors.insert(type_id, Box::new(destructor));
    }

    /// Attach a server link. Returns false when already attached.
    pub fn add_server<T: ReliableTransport>(&mut self, link: &Link<T>) -> bool {
        if self
            .links
            .iter()
            .any(|attached| attached.token() == SyncConnection::token(link))
        {
            return false;
        }
        self.links.push(Box::new(link.clone()));
        true
    }

    /// Detach a server link.
    pub fn remove_server<T: ReliableTransport>(&mut self, link: &Link<T>) -> bool {
        let before = self.links.len();
        self.links
            .retain(|attached| attached.token() != SyncConnection::token(link));
        self.links.len() != before
    }

    /// Drain the synchronization stream and apply every pending delta.
    ///
    /// Links whose transport dropped or half-closed are detached first;
    /// the replica then holds the state of the last fully-applied delta
    /// until the application reconnects and a fresh snapshot arrives.
    pub fn update(&mut self) {
        self.links.retain(|link| link.is_attached());

        let links = std::mem::take(&mut self.links);
        for link in &links {
            let mut message = Message::new();
            while link.receive_sync(&mut message) > 0 {
                self.apply(&mut message);
            }
        }
        self.links = links;
    }

    /// Number of live replica objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// The replica objects in server creation order.
    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &dyn Replicated)> {
        self.objects.iter().map(|(id, object)| (*id, &**object))
    }

    /// Look up a replica object by id.
    pub fn get(&self, id: ObjectId) -> Option<&dyn Replicated> {
        self.objects
            .iter()
            .find(|(object_id, _)| *object_id == id)
            .map(|(_, object)| &**object)
    }

    fn apply(&mut self, message: &mut Message) {
        let Some(op) = message.pop::<u8>().and_then(SyncOp::from_u8) else {
            tracing::warn!("unknown synchronization operation, skipping");
            return;
        };

        match op {
            SyncOp::Create => {
                let (Some(type_id), Some(id)) =
                    (message.pop::<ObjectTypeId>(), message.pop::<ObjectId>())
                else {
                    tracing::warn!("truncated create delta, skipping");
                    return;
                };
                if id == INVALID_OBJECT_ID {
                    tracing::warn!("create delta without object id, skipping");
                    return;
                }
                let Some(factory) = self.factories.get_mut(&type_id) else {
                    tracing::warn!(type_id, "no factory registered, skipping create");
                    return;
                };
                let mut object = factory();
                if !decode_members(object.as_mut(), SyncOp::Create, message) {
                    tracing::warn!(object_id = id, "malformed create delta, skipping");
                    return;
                }
                if let Some(position) = self.objects.iter().position(|(existing, _)| *existing == id)
                {
                    tracing::warn!(object_id = id, "duplicate create, replacing object");
                    self.objects.remove(position);
                }
                tracing::debug!(object_id = id, type_id, "replica object created");
                self.objects.push((id, object));
            }
            SyncOp::Update => {
                let Some(id) = message.pop::<ObjectId>() else {
                    tracing::warn!("truncated update delta, skipping");
                    return;
                };
                let Some((_, object)) = self
                    .objects
                    .iter_mut()
                    .find(|(object_id, _)| *object_id == id)
                else {
                    tracing::warn!(object_id = id, "update for unknown object, skipping");
                    return;
                };
                if !decode_members(object.as_mut(), SyncOp::Update, message) {
                    tracing::warn!(object_id = id, "malformed update delta, skipping");
                }
            }
            SyncOp::Destroy => {
                let Some(id) = message.pop::<ObjectId>() else {
                    tracing::warn!("truncated destroy delta, skipping");
                    return;
                };
                let Some(position) = self.objects.iter().position(|(object_id, _)| *object_id == id)
                else {
                    tracing::warn!(object_id = id, "destroy for unknown object, skipping");
                    return;
                };
                let (_, object) = self.objects.remove(position);
                let type_id = object.object_type_id();
                match self.destructors.get_mut(&type_id) {
                    Some(destructor) => destructor(object),
                    None => {
                        tracing::warn!(type_id, "no destructor registered, dropping object");
                    }
                }
                tracing::debug!(object_id = id, "replica object destroyed");
            }
        }
    }
}

impl Default for SynchronizerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{MARKER_TYPE, Marker};
    use crate::sync::{SYNC_STREAM_ID, SynchronizerServer};
    use crate::transport::MockTransport;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn replica() -> (SynchronizerClient, Arc<AtomicUsize>) {
        let mut client = SynchronizerClient::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        client.set_lifetime_managers(
            MARKER_TYPE,
            || Box::new(Marker::new(0, 0)),
            move |_object| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        (client, destroyed)
    }

    #[test]
    fn test_replication_create_update_destroy() {
        let (server_end, client_end) = MockTransport::pair();
        let server_link = Link::new(server_end);
        let client_link = Link::new(client_end);

        let server = SynchronizerServer::new();
        server.add_client(&server_link);
        let (mut client, destroyed) = replica();
        client.add_server(&client_link);

        let handle = server.create(Marker::new(-80, 60));
        server.update();
        client.update();

        assert_eq!(client.object_count(), 1);
        let marker = client.get(handle.id()).unwrap().downcast_ref::<Marker>().unwrap();
        assert_eq!(*marker.x.get(), -80);
        assert_eq!(*marker.y.get(), 60);

        handle.modify(|m| {
            m.x.set(40);
            m.label.set("moved".into());
        });
        server.update();
        client.update();

        let marker = client.get(handle.id()).unwrap().downcast_ref::<Marker>().unwrap();
        assert_eq!(*marker.x.get(), 40);
        assert_eq!(marker.label.get(), "moved");

        let id = handle.id();
        drop(handle);
        server.update();
        client.update();

        assert_eq!(client.object_count(), 0);
        assert!(client.get(id).is_none());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_catch_up_snapshot_applies_in_order() {
        let (server_end, client_end) = MockTransport::pair();
        let server_link = Link::new(server_end);
        let client_link = Link::new(client_end);

        let server = SynchronizerServer::new();
        let coordinates = [(-80, 60), (40, -10), (0, 7), (12, 34), (-5, -6)];
        let handles: Vec<_> = coordinates
            .iter()
            .map(|&(x, y)| server.create(Marker::new(x, y)))
            .collect();
        server.update();

        // Client attaches after all five objects exist.
        server.add_client(&server_link);
        let (mut client, _destroyed) = replica();
        client.add_server(&client_link);
        client.update();

        assert_eq!(client.object_count(), 5);
        for ((id, object), (&(x, y), handle)) in client
            .objects()
            .zip(coordinates.iter().zip(handles.iter()))
        {
            assert_eq!(id, handle.id());
            let marker = object.downcast_ref::<Marker>().unwrap();
            assert_eq!(*marker.x.get(), x);
            assert_eq!(*marker.y.get(), y);
        }
    }

    #[test]
    fn test_unknown_type_and_object_are_skipped() {
        let (server_end, client_end) = MockTransport::pair();
        let raw = Link::new(server_end);
        let client_link = Link::new(client_end);

        let (mut client, _) = replica();
        client.add_server(&client_link);

        // Create for an unregistered type.
        let mut message = Message::new();
        message.push(&(SyncOp::Create as u8));
        message.push(&0xBEEFu32);
        message.push(&9u32);
        raw.send_message_on(SYNC_STREAM_ID, &message);

        // Update for an id that does not exist.
        let mut message = Message::new();
        message.push(&(SyncOp::Update as u8));
        message.push(&77u32);
        raw.send_message_on(SYNC_STREAM_ID, &message);

        // Garbage operation byte.
        let mut message = Message::new();
        message.push(&42u8);
        raw.send_message_on(SYNC_STREAM_ID, &message);

        client.update();
        assert_eq!(client.object_count(), 0);
    }
}
