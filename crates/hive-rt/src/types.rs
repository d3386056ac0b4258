//! Type registry: stable wire ids and codecs for message-carried types.
//!
//! Every type that can travel inside a [`Message`](crate::message::Message)
//! gets a process-wide 16-bit id plus an encode/decode pair. Ids 1..=40
//! are reserved for built-ins; user registrations start at
//! [`FIRST_USER_TYPE_ID`]. The registry is assembled through a builder
//! and sealed into an immutable value, so lookups after startup are
//! lock-free.
//!
//! Built-in coverage: the integer and floating-point primitives, bool,
//! unit, strings, byte buffers, actor addresses, nested messages,
//! runtime errors, the DOWN/EXIT/timeout system messages, and the
//! open/put/get marker atoms.

use std::any::Any;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::actor::cell::{ActorAddr, ExitReason};
use crate::codec::{ByteSink, ByteSource};
use crate::error::Error;
use crate::message::{Message, MsgValue};

/// Stable 16-bit wire id of a registered type. Id 0 is reserved.
pub type TypeId = u16;

/// First id available to user registrations.
pub const FIRST_USER_TYPE_ID: TypeId = 64;

// -- built-in ids -----------------------------------------------------------

pub const TYPE_I8: TypeId = 1;
pub const TYPE_I16: TypeId = 2;
pub const TYPE_I32: TypeId = 3;
pub const TYPE_I64: TypeId = 4;
pub const TYPE_U8: TypeId = 5;
pub const TYPE_U16: TypeId = 6;
pub const TYPE_U32: TypeId = 7;
pub const TYPE_U64: TypeId = 8;
pub const TYPE_F32: TypeId = 9;
pub const TYPE_F64: TypeId = 10;
pub const TYPE_BOOL: TypeId = 11;
pub const TYPE_UNIT: TypeId = 12;
pub const TYPE_STRING: TypeId = 13;
pub const TYPE_BYTES: TypeId = 14;
pub const TYPE_ACTOR_ADDR: TypeId = 15;
pub const TYPE_MESSAGE: TypeId = 16;
pub const TYPE_ERROR: TypeId = 17;
pub const TYPE_DOWN: TypeId = 18;
pub const TYPE_EXIT: TypeId = 19;
pub const TYPE_TIMEOUT: TypeId = 20;
pub const TYPE_ATOM_OPEN: TypeId = 21;
pub const TYPE_ATOM_PUT: TypeId = 22;
pub const TYPE_ATOM_GET: TypeId = 23;

// ---------------------------------------------------------------------------
// System message types
// ---------------------------------------------------------------------------

/// Delivered to a monitor exactly once when the monitored actor
/// terminates.
#[derive(Debug, Clone, PartialEq)]
pub struct DownMsg {
    pub source: ActorAddr,
    /// The slot handed out by the matching `monitor` call.
    pub slot: u64,
    pub reason: ExitReason,
}

/// Delivered to linked peers when an actor terminates.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Delivered through the mailbox when a behavior timeout fires. Stale
/// ids (a message matched in the meantime) are ignored by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutMsg {
    pub id: u64,
}

/// Marker atoms carried as zero-payload message elements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenAtom;
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PutAtom;
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GetAtom;

// ---------------------------------------------------------------------------
// Codec function types
// ---------------------------------------------------------------------------

/// Encodes one erased value. Receives the registry so container types
/// (nested messages) can recurse.
pub type EncodeFn = fn(&TypeRegistry, &dyn MsgValue, &mut ByteSink) -> Result<(), Error>;

/// Decodes one erased value.
pub type DecodeFn = fn(&TypeRegistry, &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error>;

#[derive(Debug)]
struct Entry {
    name: String,
    rust: std::any::TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

// ---------------------------------------------------------------------------
// TypeRegistryBuilder
// ---------------------------------------------------------------------------

/// Mutable registration phase; [`TypeRegistryBuilder::seal`] produces
/// the read-only registry.
#[derive(Debug)]
pub struct TypeRegistryBuilder {
    slots: Vec<Option<Entry>>,
    by_rust: FxHashMap<std::any::TypeId, TypeId>,
}

impl TypeRegistryBuilder {
    fn new() -> TypeRegistryBuilder {
        let mut b = TypeRegistryBuilder {
            slots: Vec::new(),
            by_rust: FxHashMap::default(),
        };
        b.register_builtins();
        b
    }

    /// Register `T` under `id`.
    ///
    /// Idempotent for the same `(id, T)` pair; registering a *different*
    /// type under an occupied id (or the same type under a second id)
    /// fails with [`Error::DuplicateTypeId`].
    pub fn register<T: Any>(
        &mut self,
        id: TypeId,
        name: &str,
        encode: EncodeFn,
        decode: DecodeFn,
    ) -> Result<&mut Self, Error> {
        if id == 0 {
            return Err(Error::UnknownType(0));
        }
        let rust = std::any::TypeId::of::<T>();
        if let Some(existing) = self.slot(id) {
            if existing.rust == rust {
                return Ok(self);
            }
            return Err(Error::DuplicateTypeId(id));
        }
        if let Some(&other) = self.by_rust.get(&rust) {
            if other != id {
                return Err(Error::DuplicateTypeId(other));
            }
        }
        let idx = id as usize;
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(Entry {
            name: name.to_string(),
            rust,
            encode,
            decode,
        });
        self.by_rust.insert(rust, id);
        Ok(self)
    }

    /// Freeze the registry. After sealing, all lookups are read-only.
    pub fn seal(self) -> TypeRegistry {
        TypeRegistry {
            slots: self.slots,
            by_rust: self.by_rust,
        }
    }

    fn slot(&self, id: TypeId) -> Option<&Entry> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    fn register_builtins(&mut self) {
        // Built-in registration cannot collide; unwrap is fine here.
        self.register::<i8>(TYPE_I8, "i8", enc_i8, dec_i8).unwrap();
        self.register::<i16>(TYPE_I16, "i16", enc_i16, dec_i16).unwrap();
        self.register::<i32>(TYPE_I32, "i32", enc_i32, dec_i32).unwrap();
        self.register::<i64>(TYPE_I64, "i64", enc_i64, dec_i64).unwrap();
        self.register::<u8>(TYPE_U8, "u8", enc_u8, dec_u8).unwrap();
        self.register::<u16>(TYPE_U16, "u16", enc_u16, dec_u16).unwrap();
        self.register::<u32>(TYPE_U32, "u32", enc_u32, dec_u32).unwrap();
        self.register::<u64>(TYPE_U64, "u64", enc_u64, dec_u64).unwrap();
        self.register::<f32>(TYPE_F32, "f32", enc_f32, dec_f32).unwrap();
        self.register::<f64>(TYPE_F64, "f64", enc_f64, dec_f64).unwrap();
        self.register::<bool>(TYPE_BOOL, "bool", enc_bool, dec_bool).unwrap();
        self.register::<()>(TYPE_UNIT, "unit", enc_unit, dec_unit).unwrap();
        self.register::<String>(TYPE_STRING, "string", enc_string, dec_string).unwrap();
        self.register::<Vec<u8>>(TYPE_BYTES, "bytes", enc_bytes, dec_bytes).unwrap();
        self.register::<ActorAddr>(TYPE_ACTOR_ADDR, "actor_addr", enc_addr, dec_addr).unwrap();
        self.register::<Message>(TYPE_MESSAGE, "message", enc_message, dec_message).unwrap();
        self.register::<Error>(TYPE_ERROR, "error", enc_error, dec_error).unwrap();
        self.register::<DownMsg>(TYPE_DOWN, "down_msg", enc_down, dec_down).unwrap();
        self.register::<ExitMsg>(TYPE_EXIT, "exit_msg", enc_exit, dec_exit).unwrap();
        self.register::<TimeoutMsg>(TYPE_TIMEOUT, "timeout_msg", enc_timeout, dec_timeout).unwrap();
        self.register::<OpenAtom>(TYPE_ATOM_OPEN, "open_atom", enc_open, dec_open).unwrap();
        self.register::<PutAtom>(TYPE_ATOM_PUT, "put_atom", enc_put, dec_put).unwrap();
        self.register::<GetAtom>(TYPE_ATOM_GET, "get_atom", enc_get, dec_get).unwrap();
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Immutable, sealed type registry.
pub struct TypeRegistry {
    slots: Vec<Option<Entry>>,
    by_rust: FxHashMap<std::any::TypeId, TypeId>,
}

impl TypeRegistry {
    /// Start a registry with all built-ins pre-registered.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    /// Diagnostic name of `id`, if registered.
    pub fn name_of(&self, id: TypeId) -> Option<&str> {
        self.entry(id).map(|e| e.name.as_str())
    }

    /// Wire id assigned to the Rust type `T`.
    pub fn id_of<T: Any>(&self) -> Option<TypeId> {
        self.by_rust.get(&std::any::TypeId::of::<T>()).copied()
    }

    pub fn is_registered(&self, id: TypeId) -> bool {
        self.entry(id).is_some()
    }

    /// All ids at or above [`FIRST_USER_TYPE_ID`], ascending. Advertised
    /// in the BASP handshake payload.
    pub fn user_type_ids(&self) -> Vec<TypeId> {
        (FIRST_USER_TYPE_ID..self.slots.len() as TypeId)
            .filter(|id| self.is_registered(*id))
            .collect()
    }

    /// Encode `value` (which must be of the type registered under `id`).
    pub fn encode(
        &self,
        id: TypeId,
        value: &dyn MsgValue,
        sink: &mut ByteSink,
    ) -> Result<(), Error> {
        let entry = self.entry(id).ok_or(Error::UnknownType(id))?;
        (entry.encode)(self, value, sink)
    }

    /// Decode one value of the type registered under `id`.
    pub fn decode(
        &self,
        id: TypeId,
        source: &mut ByteSource<'_>,
    ) -> Result<Box<dyn MsgValue>, Error> {
        let entry = self.entry(id).ok_or(Error::UnknownType(id))?;
        (entry.decode)(self, source)
    }

    /// Serialize a whole message: `[u16 count]` then `[u16 tid][value]`
    /// per element.
    pub fn write_message(&self, msg: &Message, sink: &mut ByteSink) -> Result<(), Error> {
        sink.put_u16(msg.len() as u16);
        for elem in msg.elements() {
            sink.put_u16(elem.type_id());
            self.encode(elem.type_id(), elem.value(), sink)?;
        }
        Ok(())
    }

    /// Inverse of [`TypeRegistry::write_message`].
    pub fn read_message(&self, source: &mut ByteSource<'_>) -> Result<Message, Error> {
        let count = source.get_u16()?;
        let mut builder = Message::builder(self);
        for _ in 0..count {
            let tid = source.get_u16()?;
            let value = self.decode(tid, source)?;
            builder = builder.append_erased(tid, value);
        }
        Ok(builder.finish())
    }

    fn entry(&self, id: TypeId) -> Option<&Entry> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("TypeRegistry").field("types", &count).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in codecs
// ---------------------------------------------------------------------------

fn downcast<T: Any>(value: &dyn MsgValue) -> Result<&T, Error> {
    value.as_any().downcast_ref::<T>().ok_or(Error::TypeMismatch)
}

macro_rules! int_codec {
    ($enc:ident, $dec:ident, $ty:ty, $wide:ty, $put:ident, $get:ident) => {
        fn $enc(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
            sink.$put(*downcast::<$ty>(v)? as $wide);
            Ok(())
        }
        fn $dec(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
            Ok(Box::new(src.$get()? as $ty))
        }
    };
}

int_codec!(enc_i8, dec_i8, i8, u8, put_u8, get_u8);
int_codec!(enc_i16, dec_i16, i16, u16, put_u16, get_u16);
int_codec!(enc_i32, dec_i32, i32, u32, put_u32, get_u32);
int_codec!(enc_i64, dec_i64, i64, i64, put_i64, get_i64);
int_codec!(enc_u8, dec_u8, u8, u8, put_u8, get_u8);
int_codec!(enc_u16, dec_u16, u16, u16, put_u16, get_u16);
int_codec!(enc_u32, dec_u32, u32, u32, put_u32, get_u32);
int_codec!(enc_u64, dec_u64, u64, u64, put_u64, get_u64);

fn enc_f32(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_f32(*downcast::<f32>(v)?);
    Ok(())
}

fn dec_f32(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(src.get_f32()?))
}

fn enc_f64(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_f64(*downcast::<f64>(v)?);
    Ok(())
}

fn dec_f64(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(src.get_f64()?))
}

fn enc_bool(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_u8(*downcast::<bool>(v)? as u8);
    Ok(())
}

fn dec_bool(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    match src.get_u8()? {
        0 => Ok(Box::new(false)),
        1 => Ok(Box::new(true)),
        _ => Err(Error::TypeMismatch),
    }
}

fn enc_unit(_: &TypeRegistry, v: &dyn MsgValue, _: &mut ByteSink) -> Result<(), Error> {
    downcast::<()>(v)?;
    Ok(())
}

fn dec_unit(_: &TypeRegistry, _: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(()))
}

fn enc_string(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_str(downcast::<String>(v)?);
    Ok(())
}

fn dec_string(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(src.get_str()?))
}

fn enc_bytes(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_blob(downcast::<Vec<u8>>(v)?);
    Ok(())
}

fn dec_bytes(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(src.get_blob()?))
}

fn enc_addr(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    let addr = downcast::<ActorAddr>(v)?;
    addr.node().write_to(sink);
    sink.put_u64(addr.id());
    Ok(())
}

fn dec_addr(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    let node = crate::node::NodeId::read_from(src)?;
    let id = src.get_u64()?;
    Ok(Box::new(ActorAddr::from_ids(node, id)))
}

fn enc_message(reg: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    reg.write_message(downcast::<Message>(v)?, sink)
}

fn dec_message(reg: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(reg.read_message(src)?))
}

fn enc_error(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_u8(downcast::<Error>(v)?.code() as u8);
    Ok(())
}

fn dec_error(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    let code = src.get_u8()?;
    Ok(Box::new(Error::from_code(code).ok_or(Error::TypeMismatch)?))
}

fn enc_down(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    let down = downcast::<DownMsg>(v)?;
    down.source.node().write_to(sink);
    sink.put_u64(down.source.id());
    sink.put_u64(down.slot);
    down.reason.write_to(sink);
    Ok(())
}

fn dec_down(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    let node = crate::node::NodeId::read_from(src)?;
    let id = src.get_u64()?;
    let slot = src.get_u64()?;
    let reason = ExitReason::read_from(src)?;
    Ok(Box::new(DownMsg {
        source: ActorAddr::from_ids(node, id),
        slot,
        reason,
    }))
}

fn enc_exit(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    let exit = downcast::<ExitMsg>(v)?;
    exit.source.node().write_to(sink);
    sink.put_u64(exit.source.id());
    exit.reason.write_to(sink);
    Ok(())
}

fn dec_exit(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    let node = crate::node::NodeId::read_from(src)?;
    let id = src.get_u64()?;
    let reason = ExitReason::read_from(src)?;
    Ok(Box::new(ExitMsg {
        source: ActorAddr::from_ids(node, id),
        reason,
    }))
}

fn enc_timeout(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
    sink.put_u64(downcast::<TimeoutMsg>(v)?.id);
    Ok(())
}

fn dec_timeout(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
    Ok(Box::new(TimeoutMsg { id: src.get_u64()? }))
}

macro_rules! atom_codec {
    ($enc:ident, $dec:ident, $ty:ty) => {
        fn $enc(_: &TypeRegistry, v: &dyn MsgValue, _: &mut ByteSink) -> Result<(), Error> {
            downcast::<$ty>(v)?;
            Ok(())
        }
        fn $dec(_: &TypeRegistry, _: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
            Ok(Box::new(<$ty>::default()))
        }
    };
}

atom_codec!(enc_open, dec_open, OpenAtom);
atom_codec!(enc_put, dec_put, PutAtom);
atom_codec!(enc_get, dec_get, GetAtom);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed() -> TypeRegistry {
        TypeRegistry::builder().seal()
    }

    #[test]
    fn test_builtins_registered() {
        let reg = sealed();
        assert_eq!(reg.name_of(TYPE_I64), Some("i64"));
        assert_eq!(reg.name_of(TYPE_STRING), Some("string"));
        assert_eq!(reg.name_of(TYPE_DOWN), Some("down_msg"));
        assert_eq!(reg.name_of(0), None);
        assert_eq!(reg.name_of(FIRST_USER_TYPE_ID), None);
        assert_eq!(reg.id_of::<i64>(), Some(TYPE_I64));
        assert_eq!(reg.id_of::<String>(), Some(TYPE_STRING));
    }

    #[test]
    fn test_register_idempotent_for_same_type() {
        let mut b = TypeRegistry::builder();
        b.register::<i64>(TYPE_I64, "i64", enc_i64, dec_i64).unwrap();
        let reg = b.seal();
        assert_eq!(reg.id_of::<i64>(), Some(TYPE_I64));
    }

    #[test]
    fn test_register_collision_fails() {
        #[derive(Clone, PartialEq, Debug)]
        struct Custom(u8);
        let mut b = TypeRegistry::builder();
        let err = b
            .register::<Custom>(TYPE_I64, "custom", enc_u8, dec_u8)
            .unwrap_err();
        assert_eq!(err, Error::DuplicateTypeId(TYPE_I64));
    }

    #[test]
    fn test_unknown_type_fails_encode_decode() {
        let reg = sealed();
        let mut sink = ByteSink::new();
        assert_eq!(
            reg.encode(999, &42i64, &mut sink),
            Err(Error::UnknownType(999))
        );
        let mut src = ByteSource::new(&[]);
        assert!(matches!(reg.decode(999, &mut src), Err(Error::UnknownType(999))));
    }

    #[test]
    fn test_scalar_roundtrip() {
        let reg = sealed();
        let mut sink = ByteSink::new();
        reg.encode(TYPE_I64, &-7i64, &mut sink).unwrap();
        reg.encode(TYPE_BOOL, &true, &mut sink).unwrap();
        reg.encode(TYPE_STRING, &String::from("x"), &mut sink).unwrap();

        let mut src = ByteSource::new(sink.as_slice());
        let v = reg.decode(TYPE_I64, &mut src).unwrap();
        assert_eq!(v.as_any().downcast_ref::<i64>(), Some(&-7));
        let v = reg.decode(TYPE_BOOL, &mut src).unwrap();
        assert_eq!(v.as_any().downcast_ref::<bool>(), Some(&true));
        let v = reg.decode(TYPE_STRING, &mut src).unwrap();
        assert_eq!(v.as_any().downcast_ref::<String>().map(String::as_str), Some("x"));
    }

    #[test]
    fn test_message_roundtrip() {
        let reg = sealed();
        let msg = Message::builder(&reg)
            .append(5i64)
            .unwrap()
            .append(String::from("ping"))
            .unwrap()
            .append(OpenAtom)
            .unwrap()
            .finish();
        let mut sink = ByteSink::new();
        reg.write_message(&msg, &mut sink).unwrap();
        let mut src = ByteSource::new(sink.as_slice());
        let back = reg.read_message(&mut src).unwrap();
        assert_eq!(back, msg);
        assert!(src.is_empty());
    }

    #[test]
    fn test_nested_message_roundtrip() {
        let reg = sealed();
        let inner = Message::builder(&reg).append(1i64).unwrap().finish();
        let outer = Message::builder(&reg).append(inner.clone()).unwrap().finish();
        let mut sink = ByteSink::new();
        reg.write_message(&outer, &mut sink).unwrap();
        let mut src = ByteSource::new(sink.as_slice());
        let back = reg.read_message(&mut src).unwrap();
        assert_eq!(back, outer);
        assert_eq!(back.get::<Message>(0), Some(&inner));
    }

    #[test]
    fn test_down_msg_roundtrip() {
        let reg = sealed();
        let down = DownMsg {
            source: ActorAddr::from_ids(crate::node::NodeId::generate(), 9),
            slot: 3,
            reason: ExitReason::User(42),
        };
        let msg = Message::builder(&reg).append(down.clone()).unwrap().finish();
        let mut sink = ByteSink::new();
        reg.write_message(&msg, &mut sink).unwrap();
        let mut src = ByteSource::new(sink.as_slice());
        let back = reg.read_message(&mut src).unwrap();
        assert_eq!(back.get::<DownMsg>(0), Some(&down));
    }

    #[test]
    fn test_user_type_ids() {
        #[derive(Clone, PartialEq, Debug)]
        struct Ping(pub u64);
        fn enc(_: &TypeRegistry, v: &dyn MsgValue, sink: &mut ByteSink) -> Result<(), Error> {
            sink.put_u64(downcast::<Ping>(v)?.0);
            Ok(())
        }
        fn dec(_: &TypeRegistry, src: &mut ByteSource<'_>) -> Result<Box<dyn MsgValue>, Error> {
            Ok(Box::new(Ping(src.get_u64()?)))
        }

        let mut b = TypeRegistry::builder();
        b.register::<Ping>(FIRST_USER_TYPE_ID, "ping", enc, dec).unwrap();
        let reg = b.seal();
        assert_eq!(reg.user_type_ids(), vec![FIRST_USER_TYPE_ID]);
        assert!(reg.user_type_ids().iter().all(|id| *id >= FIRST_USER_TYPE_ID));
    }
}
