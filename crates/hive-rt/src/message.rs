//! Messages, message ids, and mailbox elements.
//!
//! A [`Message`] is an immutable, heap-allocated tuple of type-erased
//! values. Cloning a message clones an `Arc`, so fan-out sends share one
//! allocation. Each element carries the wire type id assigned by the
//! type registry, which is what behavior matching and BASP dispatch key
//! on.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::actor::cell::ActorAddr;
use crate::error::Error;
use crate::types::{TypeId, TypeRegistry};

// ---------------------------------------------------------------------------
// MsgValue
// ---------------------------------------------------------------------------

/// Object-safe facade over a message element value.
///
/// Implemented for every `T: Any + Send + Sync + Clone + PartialEq +
/// Debug` via the blanket impl below; user code never implements this
/// by hand.
pub trait MsgValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn MsgValue) -> bool;
    fn clone_boxed(&self) -> Box<dyn MsgValue>;
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T> MsgValue for T
where
    T: Any + Send + Sync + Clone + PartialEq + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn MsgValue) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| self == o)
    }

    fn clone_boxed(&self) -> Box<dyn MsgValue> {
        Box::new(self.clone())
    }

    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One element of a message tuple: wire type id plus erased value.
pub struct Element {
    tid: TypeId,
    value: Box<dyn MsgValue>,
}

impl Element {
    pub fn new(tid: TypeId, value: Box<dyn MsgValue>) -> Element {
        Element { tid, value }
    }

    pub fn type_id(&self) -> TypeId {
        self.tid
    }

    pub fn value(&self) -> &dyn MsgValue {
        &*self.value
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:", self.tid)?;
        self.value.fmt_value(f)
    }
}

/// An immutable, reference-counted tuple of typed values.
#[derive(Clone)]
pub struct Message {
    data: Arc<Vec<Element>>,
}

impl Message {
    /// The empty message.
    pub fn empty() -> Message {
        Message { data: Arc::new(Vec::new()) }
    }

    /// Start building a message against `registry` (element type ids are
    /// resolved from the Rust type).
    pub fn builder(registry: &TypeRegistry) -> MessageBuilder<'_> {
        MessageBuilder { registry, elements: Vec::new() }
    }

    pub(crate) fn from_elements(elements: Vec<Element>) -> Message {
        Message { data: Arc::new(elements) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire type id of the element at `index`.
    pub fn type_at(&self, index: usize) -> Option<TypeId> {
        self.data.get(index).map(|e| e.tid)
    }

    /// The ordered type-id sequence of all elements.
    pub fn type_ids(&self) -> Vec<TypeId> {
        self.data.iter().map(|e| e.tid).collect()
    }

    /// Typed accessor; `None` when the index is out of range or the
    /// stored value is not a `T`.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.data.get(index)?.value.as_any().downcast_ref::<T>()
    }

    pub(crate) fn elements(&self) -> &[Element] {
        &self.data
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Message) -> bool {
        self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.tid == b.tid && a.value.eq_dyn(&*b.value))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.data.iter()).finish()
    }
}

/// Builder for [`Message`]; see [`Message::builder`].
pub struct MessageBuilder<'a> {
    registry: &'a TypeRegistry,
    elements: Vec<Element>,
}

impl<'a> MessageBuilder<'a> {
    /// Append a value whose type is registered.
    ///
    /// Fails with [`Error::UnknownType`] when `T` was never registered.
    pub fn append<T>(mut self, value: T) -> Result<MessageBuilder<'a>, Error>
    where
        T: Any + Send + Sync + Clone + PartialEq + fmt::Debug,
    {
        let tid = self.registry.id_of::<T>().ok_or(Error::UnknownType(0))?;
        self.elements.push(Element::new(tid, Box::new(value)));
        Ok(self)
    }

    /// Append an already-erased element (decoding path).
    pub fn append_erased(mut self, tid: TypeId, value: Box<dyn MsgValue>) -> MessageBuilder<'a> {
        self.elements.push(Element::new(tid, value));
        self
    }

    pub fn finish(self) -> Message {
        Message::from_elements(self.elements)
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

const REQUEST_FLAG: u64 = 1 << 63;
const ANSWERED_FLAG: u64 = 1 << 62;
const SEQUENCE_MASK: u64 = (1 << 62) - 1;

/// 64-bit request/response correlation id.
///
/// Layout: bit 63 = request flag, bit 62 = answered flag, bits 61..0 =
/// sequence number. Plain asynchronous messages use the all-zero id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u64);

impl MessageId {
    /// Id of every plain asynchronous message.
    pub const ASYNC: MessageId = MessageId(0);

    /// Build a fresh request id from a sequence number.
    pub fn request(sequence: u64) -> MessageId {
        MessageId((sequence & SEQUENCE_MASK) | REQUEST_FLAG)
    }

    /// The id a response to this request carries (answered flag set).
    pub fn response_id(self) -> MessageId {
        MessageId(self.0 | ANSWERED_FLAG)
    }

    pub fn is_async(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        self.0 & REQUEST_FLAG != 0 && self.0 & ANSWERED_FLAG == 0
    }

    pub fn is_response(self) -> bool {
        self.0 & REQUEST_FLAG != 0 && self.0 & ANSWERED_FLAG != 0
    }

    pub fn sequence(self) -> u64 {
        self.0 & SEQUENCE_MASK
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> MessageId {
        MessageId(raw)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            write!(f, "mid(async)")
        } else {
            write!(
                f,
                "mid({}{})",
                self.sequence(),
                if self.is_response() { ", answered" } else { "" }
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Delivery lane inside a mailbox. The high lane is reserved for
/// unrefuseable control traffic (kill); everything ordering-sensitive
/// stays on the normal lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// A mailbox element: message plus delivery metadata.
#[derive(Debug)]
pub struct Envelope {
    pub sender: ActorAddr,
    pub mid: MessageId,
    pub priority: Priority,
    /// Set by a nested receive to skip this element without dequeuing
    /// it; cleared when control returns to a top-level handler.
    pub marked: bool,
    pub msg: Message,
}

impl Envelope {
    pub fn new(sender: ActorAddr, mid: MessageId, msg: Message) -> Envelope {
        Envelope { sender, mid, priority: Priority::Normal, marked: false, msg }
    }

    pub fn with_priority(mut self, priority: Priority) -> Envelope {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
