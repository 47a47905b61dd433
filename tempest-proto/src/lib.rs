//! Wire primitives for the Tempest message protocol.
//!
//! This crate carries everything both ends of a Tempest link must agree
//! on below the framing layer: the little-endian buffer codec, the
//! [`Serializable`]/[`Deserializable`] trait pair with its context
//! threading, and the per-message [`TypeMap`] that turns dynamic value
//! type names into u16 indices on the wire.
//!
//! Serialization is context-driven: a [`SerializationContext`] owns the
//! message's type map and a handle to the [`TypeRegistry`] so that
//! polymorphic values can be written as `(type id, payload)` pairs.
//! There are no process-wide registries; every context is constructed
//! explicitly, so independent stacks can coexist in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod buffer;
pub mod constants;
pub mod typemap;

pub use buffer::{BufferReader, BufferWriter, Decimal};
pub use tempest_proto_derive::Tempest;
pub use typemap::TypeMap;

extern crate self as tempest_proto;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },
    #[error("invalid UTF-8 in string field")]
    InvalidString,
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),
    #[error("null string where a value is required")]
    UnexpectedNull,
    #[error("type map exceeds the per-message limit")]
    TypeMapOverflow,
    #[error("type id {0} breaks the contiguous id sequence")]
    NonContiguousTypeId(u16),
    #[error("type id {0} not present in the message's type table")]
    UnknownTypeId(u16),
    #[error("type {0:?} is not registered")]
    UnknownType(String),
    #[error("invalid discriminant {value} for {type_name}")]
    InvalidDiscriminant { type_name: &'static str, value: u8 },
    #[error("deserialize error: {0}")]
    Deserialize(String),
}

/// A value that can be written to a Tempest payload.
pub trait Serializable {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()>;
}

/// A value that can be read back from a Tempest payload.
pub trait Deserializable: Sized {
    fn deserialize(ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self>;
}

/// A value that can travel polymorphically, identified on the wire by
/// its type name through the message's type table.
pub trait TypedValue: Serializable + Send {
    /// Stable wire name for this type. Both peers must register the
    /// same name for interop.
    fn wire_name(&self) -> &str;

    /// Concrete-type access for receivers; implement as `self`.
    fn as_any(&self) -> &dyn std::any::Any;
}

type TypedReader =
    dyn Fn(&mut DeserializationContext, &mut BufferReader<'_>) -> Result<Box<dyn TypedValue>>
        + Send
        + Sync;

/// Explicit registry of constructible wire types. Passed by handle
/// through the deserialization context; never global.
#[derive(Default)]
pub struct TypeRegistry {
    readers: HashMap<String, Box<TypedReader>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a concrete type under `name`.
    pub fn register<T>(&mut self, name: &str)
    where
        T: TypedValue + Deserializable + 'static,
    {
        self.readers.insert(
            name.to_owned(),
            Box::new(|ctx, r| Ok(Box::new(T::deserialize(ctx, r)?) as Box<dyn TypedValue>)),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.readers.contains_key(name)
    }

    fn read(
        &self,
        name: &str,
        ctx: &mut DeserializationContext,
        r: &mut BufferReader<'_>,
    ) -> Result<Box<dyn TypedValue>> {
        let reader = self
            .readers
            .get(name)
            .ok_or_else(|| Error::UnknownType(name.to_owned()))?;
        reader(ctx, r)
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.readers.len())
            .finish()
    }
}

/// Write-side context: the per-message type map.
#[derive(Debug, Default)]
pub struct SerializationContext {
    pub types: TypeMap,
}

impl SerializationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a polymorphic value as its interned type id followed by
    /// the payload.
    pub fn write_typed(&mut self, w: &mut BufferWriter, value: &dyn TypedValue) -> Result<()> {
        let id = self.types.intern(value.wire_name())?;
        w.write_u16(id);
        value.serialize(self, w)
    }
}

/// Read-side context: the type map absorbed from the message header and
/// the registry that can construct the named types.
#[derive(Debug)]
pub struct DeserializationContext {
    pub types: TypeMap,
    pub registry: Arc<TypeRegistry>,
}

impl DeserializationContext {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        DeserializationContext {
            types: TypeMap::new(),
            registry,
        }
    }

    /// Reads a `(type id, payload)` pair written by
    /// [`SerializationContext::write_typed`].
    pub fn read_typed(&mut self, r: &mut BufferReader<'_>) -> Result<Box<dyn TypedValue>> {
        let id = r.read_u16()?;
        let name = self
            .types
            .get(id)
            .ok_or(Error::UnknownTypeId(id))?
            .to_owned();
        let registry = self.registry.clone();
        registry.read(&name, self, r)
    }
}

macro_rules! impl_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Serializable for $ty {
            fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
                w.$write(*self);
                Ok(())
            }
        }
        impl Deserializable for $ty {
            fn deserialize(
                _ctx: &mut DeserializationContext,
                r: &mut BufferReader<'_>,
            ) -> Result<Self> {
                r.$read()
            }
        }
    };
}

impl_primitive!(bool, write_bool, read_bool);
impl_primitive!(u8, write_u8, read_u8);
impl_primitive!(i8, write_i8, read_i8);
impl_primitive!(u16, write_u16, read_u16);
impl_primitive!(i16, write_i16, read_i16);
impl_primitive!(u32, write_u32, read_u32);
impl_primitive!(i32, write_i32, read_i32);
impl_primitive!(u64, write_u64, read_u64);
impl_primitive!(i64, write_i64, read_i64);
impl_primitive!(f32, write_f32, read_f32);
impl_primitive!(f64, write_f64, read_f64);
impl_primitive!(Decimal, write_decimal, read_decimal);

impl Serializable for String {
    fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        w.write_string(Some(self));
        Ok(())
    }
}

impl Deserializable for String {
    fn deserialize(_ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        // The empty string and null share an encoding; decode both as "".
        Ok(r.read_string()?.unwrap_or_default())
    }
}

impl Serializable for str {
    fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        w.write_string(Some(self));
        Ok(())
    }
}

impl<T: Serializable> Serializable for Option<T> {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        match self {
            Some(v) => {
                w.write_bool(true);
                v.serialize(ctx, w)
            }
            None => {
                w.write_bool(false);
                Ok(())
            }
        }
    }
}

impl<T: Deserializable> Deserializable for Option<T> {
    fn deserialize(ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        if r.read_bool()? {
            Ok(Some(T::deserialize(ctx, r)?))
        } else {
            Ok(None)
        }
    }
}

/// Sequences carry an i32 count prefix. For `Vec<u8>` this coincides
/// with the raw byte-block encoding of
/// [`BufferWriter::write_bytes`], so the two paths interoperate.
impl<T: Serializable> Serializable for [T] {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        w.write_i32(self.len() as i32);
        for item in self {
            item.serialize(ctx, w)?;
        }
        Ok(())
    }
}

impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        self.as_slice().serialize(ctx, w)
    }
}

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        let len = r.read_i32()?;
        if len < 0 {
            return Err(Error::InvalidLength(len));
        }
        let mut out = Vec::with_capacity((len as usize).min(r.remaining().max(1)));
        for _ in 0..len {
            out.push(T::deserialize(ctx, r)?);
        }
        Ok(out)
    }
}

impl<const N: usize> Serializable for [u8; N] {
    fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        w.write_raw(self);
        Ok(())
    }
}

impl<const N: usize> Deserializable for [u8; N] {
    fn deserialize(_ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        let mut out = [0u8; N];
        out.copy_from_slice(r.read_raw(N)?);
        Ok(out)
    }
}

impl Serializable for Duration {
    fn serialize(&self, _ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        w.write_i64(self.as_millis() as i64);
        Ok(())
    }
}

impl Deserializable for Duration {
    fn deserialize(_ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        let ms = r.read_i64()?;
        Ok(Duration::from_millis(ms.max(0) as u64))
    }
}

impl<T: Serializable + ?Sized> Serializable for &T {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        (*self).serialize(ctx, w)
    }
}

impl<T: Serializable + ?Sized> Serializable for Box<T> {
    fn serialize(&self, ctx: &mut SerializationContext, w: &mut BufferWriter) -> Result<()> {
        (**self).serialize(ctx, w)
    }
}

impl<T: Deserializable> Deserializable for Box<T> {
    fn deserialize(ctx: &mut DeserializationContext, r: &mut BufferReader<'_>) -> Result<Self> {
        Ok(Box::new(T::deserialize(ctx, r)?))
    }
}

/// Serializes a value with a throwaway context. Only valid for values
/// that never intern dynamic types.
pub fn serialize<T: Serializable>(value: &T) -> Result<Vec<u8>> {
    let mut ctx = SerializationContext::new();
    let mut w = BufferWriter::new();
    value.serialize(&mut ctx, &mut w)?;
    Ok(w.into_vec())
}

/// Deserializes a value with an empty registry. Only valid for values
/// that never resolve dynamic types.
pub fn deserialize<T: Deserializable>(bytes: &[u8]) -> Result<T> {
    let mut ctx = DeserializationContext::new(Arc::new(TypeRegistry::new()));
    let mut r = BufferReader::new(bytes);
    T::deserialize(&mut ctx, &mut r)
}
