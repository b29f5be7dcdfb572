//! Typed view over [`EventValue`].
//!
//! Controllers and proxies are generic over `T: EventData`; the trait maps
//! the application type to and from the closed value union, so every type a
//! channel carries is classifiable at compile time.

use bytes::Bytes;

use crate::error::{EventError, Result};

use super::{AdaptedValue, EventValue, RemoteRef};

/// A value that can travel through an event channel.
pub trait EventData: Clone + PartialEq + Send + Sync + 'static {
    /// Convert into the transmittable union.
    fn into_value(self) -> EventValue;

    /// Reconstruct from a decoded union value.
    fn from_value(value: EventValue) -> Result<Self>;
}

fn unexpected<T>(expected: &str, value: &EventValue) -> Result<T> {
    Err(EventError::Decode(format!(
        "Expected {} value, got {}",
        expected,
        value.tag()
    )))
}

macro_rules! scalar_event_data {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl EventData for $ty {
            fn into_value(self) -> EventValue {
                EventValue::$variant(self)
            }

            fn from_value(value: EventValue) -> Result<Self> {
                match value {
                    EventValue::$variant(v) => Ok(v),
                    other => unexpected($name, &other),
                }
            }
        }
    };
}

scalar_event_data!(i8, Byte, "Byte");
scalar_event_data!(i16, Short, "Short");
scalar_event_data!(i32, Int, "Int");
scalar_event_data!(i64, Long, "Long");
scalar_event_data!(f32, Float, "Float");
scalar_event_data!(f64, Double, "Double");
scalar_event_data!(bool, Bool, "Bool");
scalar_event_data!(char, Char, "Char");
scalar_event_data!(String, Str, "String");
scalar_event_data!(Bytes, Blob, "Blob");
scalar_event_data!(AdaptedValue, Adapted, "Adapted");
scalar_event_data!(RemoteRef, RemoteRef, "RemoteRef");

impl<T: EventData> EventData for Vec<T> {
    fn into_value(self) -> EventValue {
        EventValue::List(self.into_iter().map(EventData::into_value).collect())
    }

    fn from_value(value: EventValue) -> Result<Self> {
        match value {
            EventValue::List(items) => items.into_iter().map(T::from_value).collect(),
            other => unexpected("List", &other),
        }
    }
}

/// Identity impl for heterogeneous streams built from the union directly.
impl EventData for EventValue {
    fn into_value(self) -> EventValue {
        self
    }

    fn from_value(value: EventValue) -> Result<Self> {
        Ok(value)
    }
}
