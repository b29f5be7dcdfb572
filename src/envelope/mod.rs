//! Envelope codec for transmitted values.
//!
//! Every value sent through a controller is flattened into an [`Envelope`]:
//! an insertion-ordered list of tagged key/value entries that any container
//! transport can carry. Lists nest recursively through positional key
//! suffixes, remote-callable references travel as opaque transport handles,
//! and application-defined types go through the [`adapter`] registry.

use bytes::Bytes;

use crate::error::{EventError, Result};
use crate::transport::TransportHandle;

pub mod adapter;
mod data;

pub use adapter::{AdapterCodec, AdapterRegistry, PassthroughCodec};
pub use data::EventData;


// ============================================================================
// Wire contract
// ============================================================================

/// Field key carrying the tag name of the encoded value.
pub const REMOTE_DATA_TYPE: &str = "RemoteDataType";
/// Field key carrying the payload itself.
pub const REMOTE_DATA: &str = "RemoteData";
/// Field key carrying auxiliary data: adapter type-ids and remote-ref
/// interface identifiers.
pub const REMOTE_DATA_EXTRA: &str = "RemoteDataExtra";
/// Field key carrying the element count of an encoded list.
pub const LIST_SIZE: &str = "ListSize";

/// Classification of a transmittable value.
///
/// The taxonomy is closed: every value a controller accepts maps to exactly
/// one tag through its [`EventValue`] variant. `Unknown` never appears on
/// the encode side; it is produced while decoding an unrecognized tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Bool,
    Char,
    String,
    Blob,
    Adapted,
    RemoteRef,
    List,
    Unknown,
}

impl TypeTag {
    /// The tag name written into the `RemoteDataType` field.
    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Byte => "Byte",
            TypeTag::Short => "Short",
            TypeTag::Int => "Int",
            TypeTag::Long => "Long",
            TypeTag::Float => "Float",
            TypeTag::Double => "Double",
            TypeTag::Bool => "Bool",
            TypeTag::Char => "Char",
            TypeTag::String => "String",
            TypeTag::Blob => "Blob",
            TypeTag::Adapted => "Adapted",
            TypeTag::RemoteRef => "RemoteRef",
            TypeTag::List => "List",
            TypeTag::Unknown => "Unknown",
        }
    }

    /// Parse a tag name read from the wire. Unrecognized names classify as
    /// `Unknown`, which the decoder reports as a decode error.
    pub fn from_name(name: &str) -> TypeTag {
        match name {
            "Byte" => TypeTag::Byte,
            "Short" => TypeTag::Short,
            "Int" => TypeTag::Int,
            "Long" => TypeTag::Long,
            "Float" => TypeTag::Float,
            "Double" => TypeTag::Double,
            "Bool" => TypeTag::Bool,
            "Char" => TypeTag::Char,
            "String" => TypeTag::String,
            "Blob" => TypeTag::Blob,
            "Adapted" => TypeTag::Adapted,
            "RemoteRef" => TypeTag::RemoteRef,
            "List" => TypeTag::List,
            _ => TypeTag::Unknown,
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Values
// ============================================================================

/// Reference to a remote-callable object embedded in an event stream.
///
/// Carries the interface identifier the receiver uses to pick a proxy type,
/// plus the opaque transport handle the proxy binds to.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRef {
    /// Stable interface identifier, written to `RemoteDataExtra`.
    pub interface: String,
    /// Opaque handle to the remote object.
    pub handle: TransportHandle,
}

/// Payload of an application-defined type going through an adapter codec.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedValue {
    /// Stable type identifier, written to `RemoteDataExtra`. Encoding
    /// requires a codec registered under this id.
    pub type_id: String,
    /// In-memory payload bytes handed to the codec.
    pub payload: Bytes,
}

/// Closed union of every value a channel can carry.
///
/// Classification is a pure match on the variant; there is no runtime type
/// probing. Lists may hold heterogeneous elements.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Blob(Bytes),
    Adapted(AdaptedValue),
    RemoteRef(RemoteRef),
    List(Vec<EventValue>),
}

impl EventValue {
    /// The tag this value encodes under.
    pub fn tag(&self) -> TypeTag {
        match self {
            EventValue::Byte(_) => TypeTag::Byte,
            EventValue::Short(_) => TypeTag::Short,
            EventValue::Int(_) => TypeTag::Int,
            EventValue::Long(_) => TypeTag::Long,
            EventValue::Float(_) => TypeTag::Float,
            EventValue::Double(_) => TypeTag::Double,
            EventValue::Bool(_) => TypeTag::Bool,
            EventValue::Char(_) => TypeTag::Char,
            EventValue::Str(_) => TypeTag::String,
            EventValue::Blob(_) => TypeTag::Blob,
            EventValue::Adapted(_) => TypeTag::Adapted,
            EventValue::RemoteRef(_) => TypeTag::RemoteRef,
            EventValue::List(_) => TypeTag::List,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Primitive payload a container transport must be able to carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Str(String),
    Bytes(Bytes),
    Handle(TransportHandle),
}

/// Flat tagged key/value encoding of one transmitted value.
///
/// Keys keep insertion order; `put` on an existing key replaces the entry
/// in place. Lookups are linear, which is fine at envelope sizes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    entries: Vec<(String, Field)>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn put(&mut self, key: impl Into<String>, field: Field) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = field;
        } else {
            self.entries.push((key, field));
        }
    }

    /// Look up a field by key.
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, f)| f)
    }

    /// Iterate over keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn required(&self, key: &str) -> Result<&Field> {
        self.get(key)
            .ok_or_else(|| EventError::Decode(format!("Missing field '{}'", key)))
    }

    fn str_field(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(Field::Str(s)) => Ok(s),
            Some(other) => Err(decode_mismatch(key, "String", other)),
            None => Err(EventError::Decode(format!("Missing field '{}'", key))),
        }
    }

    fn int_field(&self, key: &str) -> Result<i32> {
        match self.get(key) {
            Some(Field::Int(v)) => Ok(*v),
            Some(other) => Err(decode_mismatch(key, "Int", other)),
            None => Err(EventError::Decode(format!("Missing field '{}'", key))),
        }
    }
}

fn decode_mismatch(key: &str, expected: &str, got: &Field) -> EventError {
    EventError::Decode(format!(
        "Field '{}' holds {:?}, expected {}",
        key, got, expected
    ))
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Encode a value into a fresh envelope.
///
/// Adapted values must have a codec registered under their type-id; an
/// unregistered id is reported as `UnsupportedType` before anything is
/// written (strict mode).
pub fn encode(value: &EventValue, adapters: &AdapterRegistry) -> Result<Envelope> {
    let mut envelope = Envelope::new();
    encode_at(value, &mut envelope, "", adapters)?;
    Ok(envelope)
}

fn encode_at(
    value: &EventValue,
    envelope: &mut Envelope,
    suffix: &str,
    adapters: &AdapterRegistry,
) -> Result<()> {
    let tag = value.tag();
    let data_key = format!("{}{}", REMOTE_DATA, suffix);

    // Validate before writing anything so a rejected value leaves the
    // envelope untouched.
    let data_field = match value {
        EventValue::Byte(v) => Field::Byte(*v),
        EventValue::Short(v) => Field::Short(*v),
        EventValue::Int(v) => Field::Int(*v),
        EventValue::Long(v) => Field::Long(*v),
        EventValue::Float(v) => Field::Float(*v),
        EventValue::Double(v) => Field::Double(*v),
        // Booleans travel as integer 0/1.
        EventValue::Bool(v) => Field::Int(i32::from(*v)),
        EventValue::Char(v) => Field::Char(*v),
        EventValue::Str(v) => Field::Str(v.clone()),
        EventValue::Blob(v) => Field::Bytes(v.clone()),
        EventValue::Adapted(adapted) => {
            let codec = adapters.get(&adapted.type_id).ok_or_else(|| {
                EventError::UnsupportedType(adapted.type_id.clone())
            })?;
            let wire = codec.encode(&adapted.payload)?;
            envelope.put(
                format!("{}{}", REMOTE_DATA_EXTRA, suffix),
                Field::Str(adapted.type_id.clone()),
            );
            Field::Bytes(wire)
        }
        EventValue::RemoteRef(remote) => {
            envelope.put(
                format!("{}{}", REMOTE_DATA_EXTRA, suffix),
                Field::Str(remote.interface.clone()),
            );
            Field::Handle(remote.handle.clone())
        }
        EventValue::List(items) => {
            envelope.put(
                format!("{}{}", REMOTE_DATA_TYPE, suffix),
                Field::Str(tag.name().to_string()),
            );
            envelope.put(
                format!("{}{}", LIST_SIZE, suffix),
                Field::Int(items.len() as i32),
            );
            for (index, item) in items.iter().enumerate() {
                let child = format!("{}{}", suffix, index);
                encode_at(item, envelope, &child, adapters)?;
            }
            return Ok(());
        }
    };

    envelope.put(
        format!("{}{}", REMOTE_DATA_TYPE, suffix),
        Field::Str(tag.name().to_string()),
    );
    envelope.put(data_key, data_field);
    Ok(())
}

/// Decode an envelope back into a value.
///
/// An unrecognized tag or a field/tag mismatch is a decode error; callers
/// on the consumer path log and drop it without touching cached state.
pub fn decode(envelope: &Envelope, adapters: &AdapterRegistry) -> Result<EventValue> {
    decode_at(envelope, "", adapters)
}

fn decode_at(envelope: &Envelope, suffix: &str, adapters: &AdapterRegistry) -> Result<EventValue> {
    let type_key = format!("{}{}", REMOTE_DATA_TYPE, suffix);
    let data_key = format!("{}{}", REMOTE_DATA, suffix);
    let extra_key = format!("{}{}", REMOTE_DATA_EXTRA, suffix);

    let tag_name = envelope.str_field(&type_key)?;
    let tag = TypeTag::from_name(tag_name);

    match tag {
        TypeTag::Byte => match envelope.required(&data_key)? {
            Field::Byte(v) => Ok(EventValue::Byte(*v)),
            other => Err(decode_mismatch(&data_key, "Byte", other)),
        },
        TypeTag::Short => match envelope.required(&data_key)? {
            Field::Short(v) => Ok(EventValue::Short(*v)),
            other => Err(decode_mismatch(&data_key, "Short", other)),
        },
        TypeTag::Int => match envelope.required(&data_key)? {
            Field::Int(v) => Ok(EventValue::Int(*v)),
            other => Err(decode_mismatch(&data_key, "Int", other)),
        },
        TypeTag::Long => match envelope.required(&data_key)? {
            Field::Long(v) => Ok(EventValue::Long(*v)),
            other => Err(decode_mismatch(&data_key, "Long", other)),
        },
        TypeTag::Float => match envelope.required(&data_key)? {
            Field::Float(v) => Ok(EventValue::Float(*v)),
            other => Err(decode_mismatch(&data_key, "Float", other)),
        },
        TypeTag::Double => match envelope.required(&data_key)? {
            Field::Double(v) => Ok(EventValue::Double(*v)),
            other => Err(decode_mismatch(&data_key, "Double", other)),
        },
        TypeTag::Bool => match envelope.required(&data_key)? {
            Field::Int(v) => Ok(EventValue::Bool(*v != 0)),
            other => Err(decode_mismatch(&data_key, "Bool as Int", other)),
        },
        TypeTag::Char => match envelope.required(&data_key)? {
            Field::Char(v) => Ok(EventValue::Char(*v)),
            other => Err(decode_mismatch(&data_key, "Char", other)),
        },
        TypeTag::String => match envelope.required(&data_key)? {
            Field::Str(v) => Ok(EventValue::Str(v.clone())),
            other => Err(decode_mismatch(&data_key, "String", other)),
        },
        TypeTag::Blob => match envelope.required(&data_key)? {
            Field::Bytes(v) => Ok(EventValue::Blob(v.clone())),
            other => Err(decode_mismatch(&data_key, "Bytes", other)),
        },
        TypeTag::Adapted => {
            let type_id = envelope.str_field(&extra_key)?.to_string();
            let codec = adapters.get(&type_id).ok_or_else(|| {
                EventError::Decode(format!("No codec for adapted type '{}'", type_id))
            })?;
            match envelope.required(&data_key)? {
                Field::Bytes(wire) => {
                    let payload = codec.decode(wire)?;
                    Ok(EventValue::Adapted(AdaptedValue { type_id, payload }))
                }
                other => Err(decode_mismatch(&data_key, "Bytes", other)),
            }
        }
        TypeTag::RemoteRef => {
            let interface = envelope.str_field(&extra_key)?.to_string();
            match envelope.required(&data_key)? {
                Field::Handle(handle) => Ok(EventValue::RemoteRef(RemoteRef {
                    interface,
                    handle: handle.clone(),
                })),
                other => Err(decode_mismatch(&data_key, "Handle", other)),
            }
        }
        TypeTag::List => {
            let size_key = format!("{}{}", LIST_SIZE, suffix);
            let count = envelope.int_field(&size_key)?;
            if count < 0 {
                return Err(EventError::Decode(format!(
                    "Negative list size {} in '{}'",
                    count, size_key
                )));
            }
            let mut items = Vec::with_capacity(count as usize);
            for index in 0..count {
                let child = format!("{}{}", suffix, index);
                items.push(decode_at(envelope, &child, adapters)?);
            }
            Ok(EventValue::List(items))
        }
        TypeTag::Unknown => Err(EventError::Decode(format!(
            "Unrecognized tag '{}' in field '{}'",
            tag_name, type_key
        ))),
    }
}
