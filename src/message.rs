//! Deque-backed binary messages.
//!
//! [`Message`] is an ordered byte sequence with O(1) amortized insertion and
//! extraction at both ends. Typed values go through the [`Wire`] trait:
//! fixed-width integers and floats are encoded little-endian, strings and
//! vectors carry a `u32` little-endian element-count prefix, and containers
//! nest by recursive application of the same rule.
//!
//! Framed transports ship a message as `u32 LE length | payload`; the
//! framing itself lives in the transports, a `Message` only holds the
//! payload bytes.

use std::collections::VecDeque;

/// An ordered, mutable byte sequence with efficient front and back access.
///
/// Values pushed at one end are extracted in last-in-first-out order at the
/// same end, and first-in-first-out order at the opposite end. Protocol code
/// in this crate builds messages by pushing fields to the back and the peer
/// pops them off the front.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    data: VecDeque<u8>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Message::default()
    }

    /// Number of bytes in the message.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the message contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove all contents.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append raw bytes at the back.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    /// Insert raw bytes at the front, preserving their order.
    pub fn prepend(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.data.push_front(b);
        }
    }

    /// Copy of the first `n` bytes, or `None` if fewer are present.
    pub fn front(&self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.iter().take(n).copied().collect())
    }

    /// Copy of the last `n` bytes, or `None` if fewer are present.
    pub fn back(&self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.iter().skip(self.data.len() - n).copied().collect())
    }

    /// Remove and return the first `n` bytes, or `None` (leaving the message
    /// untouched) if fewer are present.
    pub fn pop_front(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.drain(..n).collect())
    }

    /// Remove and return the last `n` bytes, or `None` (leaving the message
    /// untouched) if fewer are present.
    pub fn pop_back(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        let at = self.data.len() - n;
        Some(self.data.drain(at..).collect())
    }

    /// Encode a value at the back of the message.
    pub fn push<T: Wire>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Decode a value from the front of the message.
    ///
    /// Returns `None` if the message does not hold a complete value. For
    /// flat values the message is left untouched on failure; a nested
    /// container that fails partway may leave the message partially
    /// consumed, so callers treating `None` as a protocol violation should
    /// discard the remainder.
    pub fn pop<T: Wire>(&mut self) -> Option<T> {
        T::decode(self)
    }

    /// The message contents as a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        let mut message = Message::new();
        message.append(bytes);
        message
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message {
            data: VecDeque::from(bytes),
        }
    }
}

/// Wire codec for values carried in a [`Message`].
///
/// Multi-byte values are little-endian regardless of host order, so peers on
/// different architectures interoperate.
pub trait Wire: Sized {
    /// Append this value's encoding at the back of `message`.
    fn encode(&self, message: &mut Message);

    /// Extract a value from the front of `message`.
    fn decode(message: &mut Message) -> Option<Self>;
}

macro_rules! impl_wire_numeric {
    ($($t:ty),*) => {
        $(
            impl Wire for $t {
                fn encode(&self, message: &mut Message) {
                    message.append(&self.to_le_bytes());
                }

                fn decode(message: &mut Message) -> Option<Self> {
                    const N: usize = size_of::<$t>();
                    let bytes = message.pop_front(N)?;
                    let mut raw = [0u8; N];
                    raw.copy_from_slice(&bytes);
                    Some(<$t>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_wire_numeric!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Wire for bool {
    fn encode(&self, message: &mut Message) {
        message.push(&u8::from(*self));
    }

    fn decode(message: &mut Message) -> Option<Self> {
        message.pop::<u8>().map(|b| b != 0)
    }
}

impl Wire for String {
    fn encode(&self, message: &mut Message) {
        message.push(&(self.len() as u32));
        message.append(self.as_bytes());
    }

    fn decode(message: &mut Message) -> Option<Self> {
        let prefix = message.front(4)?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if message.len() < 4 + len {
            return None;
        }
        message.pop_front(4);
        let bytes = message.pop_front(len)?;
        String::from_utf8(bytes).ok()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, message: &mut Message) {
        message.push(&(self.len() as u32));
        for item in self {
            item.encode(message);
        }
    }

    fn decode(message: &mut Message) -> Option<Self> {
        let count = message.pop::<u32>()? as usize;
        let mut items = Vec::with_capacity(count.min(message.len()));
        for _ in 0..count {
            items.push(T::decode(message)?);
        }
        Some(items)
    }
}
