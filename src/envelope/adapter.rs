//! Adapter codec registry for application-defined types.
//!
//! Types outside the scalar/list taxonomy travel as `Adapted` values: a
//! stable type-id plus a byte payload. A codec registered under that id
//! converts between the in-memory payload and its wire form. Sending a
//! value whose id has no codec is rejected at the controller boundary.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;

/// Encode/decode pair for one adapted type.
pub trait AdapterCodec: Send + Sync {
    /// Stable identifier written to the wire alongside the payload.
    fn type_id(&self) -> &str;

    /// Convert the in-memory payload into its wire form.
    fn encode(&self, payload: &Bytes) -> Result<Bytes>;

    /// Convert wire bytes back into the in-memory payload.
    fn decode(&self, wire: &Bytes) -> Result<Bytes>;
}

/// Codec that ships the payload bytes unchanged.
///
/// Useful when the application already serializes its type before handing
/// it to the channel and only needs the type-id routing.
pub struct PassthroughCodec {
    type_id: String,
}

impl PassthroughCodec {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
        }
    }
}

impl AdapterCodec for PassthroughCodec {
    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn encode(&self, payload: &Bytes) -> Result<Bytes> {
        Ok(payload.clone())
    }

    fn decode(&self, wire: &Bytes) -> Result<Bytes> {
        Ok(wire.clone())
    }
}

/// Process-wide table of adapter codecs, keyed by type-id.
///
/// Registration typically happens once at startup; lookups run on every
/// encode/decode of an adapted value.
#[derive(Default)]
pub struct AdapterRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn AdapterCodec>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec. A codec already registered under the same id is
    /// replaced.
    pub fn register(&self, codec: Arc<dyn AdapterCodec>) {
        let type_id = codec.type_id().to_string();
        debug!(type_id = %type_id, "Registered adapter codec");
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_id, codec);
    }

    /// Look up the codec for a type-id.
    pub fn get(&self, type_id: &str) -> Option<Arc<dyn AdapterCodec>> {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_id)
            .cloned()
    }

    /// Whether a codec is registered for the given type-id.
    pub fn contains(&self, type_id: &str) -> bool {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_id)
    }
}
