//! Object synchronization.
//!
//! Replicates a set of typed objects from an authoritative
//! [`SynchronizerServer`] to any number of [`SynchronizerClient`]s over
//! [`Link`] stream 200.
//!
//! An application object participates by implementing [`Replicated`]: it
//! names its wire type id and exposes its synchronized members in a fixed
//! declaration order that every replica of that type shares. Members are
//! [`Synced<T>`] wrappers carrying a [`SyncClass`]:
//!
//! - `Static` members travel once, in the create message;
//! - `Dynamic` members travel whenever the object is mutated;
//! - `Stream` members travel periodically regardless of mutation and
//!   piggyback on every dynamic update.
//!
//! The server queues creates, updates and destroys, collapses them per
//! object, and broadcasts the deltas on [`update`](SynchronizerServer::update)
//! ticks; clients apply them with factories and destructors registered per
//! type id. A client attaching late receives a catch-up snapshot of every
//! live object.
//!
//! # Example
//!
//! ```rust,no_run
//! use multilink::sync::{Replicated, Synced, SyncClass, SynchronizerServer};
//! use multilink::sync::{SmallVec, smallvec};
//!
//! struct Marker {
//!     x: Synced<i32>,
//!     y: Synced<i32>,
//! }
//!
//! impl Replicated for Marker {
//!     fn object_type_id(&self) -> u32 {
//!         0x1337
//!     }
//!
//!     fn members(&mut self) -> SmallVec<[&mut dyn multilink::sync::SyncedMember; 8]> {
//!         smallvec![
//!             &mut self.x as &mut dyn multilink::sync::SyncedMember,
//!             &mut self.y as &mut dyn multilink::sync::SyncedMember,
//!         ]
//!     }
//! }
//!
//! let server = SynchronizerServer::new();
//! let marker = server.create(Marker {
//!     x: Synced::new(SyncClass::Dynamic, -80),
//!     y: Synced::new(SyncClass::Dynamic, 60),
//! });
//! marker.modify(|m| m.x.set(40));
//! server.update();
//! ```

mod client;
mod server;

pub use client::*;
pub use server::*;

// Implementors of [`Replicated`] name these in their member lists.
pub use smallvec::{SmallVec, smallvec};

use std::any::Any;

use crate::link::{Link, StreamId};
use crate::message::{Message, Wire};
use crate::transport::ReliableTransport;

/// Server-assigned object identifier, unique per synchronizer.
pub type ObjectId = u32;

/// Application-assigned object type identifier.
pub type ObjectTypeId = u32;

/// The link stream carrying synchronization traffic.
pub const SYNC_STREAM_ID: StreamId = 200;

/// Never assigned to a live object.
pub(crate) const INVALID_OBJECT_ID: ObjectId = 0;

/// When a member's value travels to the replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncClass {
    /// Transmitted once, at create.
    Static = 0,
    /// Transmitted whenever the value is mutated.
    Dynamic = 1,
    /// Transmitted periodically and with every dynamic update.
    Stream = 2,
}

impl SyncClass {
    fn from_u8(value: u8) -> Option<SyncClass> {
        match value {
            0 => Some(SyncClass::Static),
            1 => Some(SyncClass::Dynamic),
            2 => Some(SyncClass::Stream),
            _ => None,
        }
    }
}

/// Wire operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SyncOp {
    Create = 100,
    Update = 101,
    Destroy = 102,
}

impl SyncOp {
    pub(crate) fn from_u8(value: u8) -> Option<SyncOp> {
        match value {
            100 => Some(SyncOp::Create),
            101 => Some(SyncOp::Update),
            102 => Some(SyncOp::Destroy),
            _ => None,
        }
    }
}

/// A synchronized member value.
///
/// Reading goes through [`get`](Synced::get) (or `Deref`); writing goes
/// through [`set`](Synced::set), which records the mutation so the owning
/// object's next [`modify`](SyncedHandle::modify) scan schedules a delta.
#[derive(Debug, Clone)]
pub struct Synced<T: Wire> {
    value: T,
    class: SyncClass,
    modified: bool,
}

impl<T: Wire> Synced<T> {
    /// Wrap `value` with the given synchronization class.
    pub fn new(class: SyncClass, value: T) -> Self {
        Synced {
            value,
            class,
            modified: true,
        }
    }

    /// The current value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value and mark it mutated.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.modified = true;
    }

    /// The synchronization class.
    pub fn class(&self) -> SyncClass {
        self.class
    }
}

impl<T: Wire> std::ops::Deref for Synced<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Type-erased access to one synchronized member.
///
/// Implemented by [`Synced<T>`] for every [`Wire`] value type; objects
/// expose their members through this trait in declaration order.
pub trait SyncedMember: Send {
    /// The member's synchronization class.
    fn class(&self) -> SyncClass;

    /// Whether the value was mutated since the last call; clears the flag.
    fn take_modified(&mut self) -> bool;

    /// Append the value at the back of `message`.
    fn encode(&self, message: &mut Message);

    /// Extract the value from the front of `message`.
    fn decode(&mut self, message: &mut Message) -> bool;
}

impl<T: Wire + Send> SyncedMember for Synced<T> {
    fn class(&self) -> SyncClass {
        self.class
    }

    fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    fn encode(&self, message: &mut Message) {
        message.push(&self.value);
    }

    fn decode(&mut self, message: &mut Message) -> bool {
        match message.pop::<T>() {
            Some(value) => {
                self.value = value;
                true
            }
            None => false,
        }
    }
}

/// An object replicated between a server and its clients.
///
/// The member ordering returned by [`members`](Replicated::members) is part
/// of the wire contract: it must be identical for every replica sharing the
/// same [`type_id`](Replicated::type_id).
pub trait Replicated: Any + Send {
    /// The application-defined type id, shared by server and clients.
    fn object_type_id(&self) -> ObjectTypeId;

    /// The synchronized members, in fixed declaration order.
    fn members(&mut self) -> SmallVec<[&mut dyn SyncedMember; 8]>;
}

impl dyn Replicated {
    /// Downcast to a concrete object type.
    pub fn downcast_ref<T: Replicated>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }

    /// Downcast to a concrete object type, mutably.
    pub fn downcast_mut<T: Replicated>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut()
    }
}

/// Whether a member of `class` travels in a message of operation `op`.
fn member_included(class: SyncClass, op: SyncOp) -> bool {
    match op {
        SyncOp::Create => true,
        SyncOp::Update => class != SyncClass::Static,
        SyncOp::Destroy => false,
    }
}

/// Append the member block for `op`: each included member prefixed by its
/// class tag.
pub(crate) fn encode_members(object: &mut dyn Replicated, op: SyncOp, message: &mut Message) {
    for member in object.members() {
        if member_included(member.class(), op) {
            message.push(&(member.class() as u8));
            member.encode(message);
        }
    }
}

/// Decode a member block produced by [`encode_members`]. Returns false on
/// any tag or value mismatch; the caller discards the message.
pub(crate) fn decode_members(
    object: &mut dyn Replicated,
    op: SyncOp,
    message: &mut Message,
) -> bool {
    for member in object.members() {
        if !member_included(member.class(), op) {
            continue;
        }
        let Some(tag) = message.pop::<u8>() else {
            tracing::warn!("truncated member block");
            return false;
        };
        if SyncClass::from_u8(tag) != Some(member.class()) {
            tracing::warn!(tag, "member class tag mismatch");
            return false;
        }
        if !member.decode(message) {
            tracing::warn!("malformed member value");
            return false;
        }
    }
    true
}

/// The subset of the link surface the synchronizer uses, object-safe so
/// links over different transports can attach to one synchronizer.
pub(crate) trait SyncConnection: Send {
    fn send_sync(&self, message: &Message) -> bool;
    fn receive_sync(&self, message: &mut Message) -> usize;
    /// Connected with neither half shut down.
    fn is_attached(&self) -> bool;
    fn token(&self) -> usize;
}

impl<T: ReliableTransport> SyncConnection for Link<T> {
    fn send_sync(&self, message: &Message) -> bool {
        self.send_message_on(SYNC_STREAM_ID, message)
    }

    fn receive_sync(&self, message: &mut Message) -> usize {
        self.receive_message_on(SYNC_STREAM_ID, message)
    }

    fn is_attached(&self) -> bool {
        self.is_connected() && !self.local_has_shutdown() && !self.remote_has_shutdown()
    }

    fn token(&self) -> usize {
        Link::token(self)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use smallvec::smallvec;

    /// Reference object used across the synchronizer tests.
    pub(crate) struct Marker {
        pub x: Synced<i32>,
        pub y: Synced<i32>,
        pub label: Synced<String>,
        pub kind: Synced<u8>,
    }

    pub(crate) const MARKER_TYPE: ObjectTypeId = 0x1337;

    impl Marker {
        pub fn new(x: i32, y: i32) -> Self {
            Marker {
                x: Synced::new(SyncClass::Dynamic, x),
                y: Synced::new(SyncClass::Dynamic, y),
                label: Synced::new(SyncClass::Stream, String::new()),
                kind: Synced::new(SyncClass::Static, 7),
            }
        }
    }

    impl Replicated for Marker {
        fn object_type_id(&self) -> ObjectTypeId {
            MARKER_TYPE
        }

        fn members(&mut self) -> SmallVec<[&mut dyn SyncedMember; 8]> {
            smallvec![
                &mut self.x as &mut dyn SyncedMember,
                &mut self.y as &mut dyn SyncedMember,
                &mut self.label as &mut dyn SyncedMember,
                &mut self.kind as &mut dyn SyncedMember,
            ]
        }
    }
}
