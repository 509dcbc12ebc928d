pub mod bincode;
pub mod keycode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Trait for database keys.
///
/// Keys are stored in their encoded form and compared as byte strings, so an
/// implementation must preserve the logical ordering of the type under
/// lexicographic byte comparison. The provided implementations use the
/// keycode module for order-preserving serialization.
pub trait Key: Clone + Send + 'static {
    /// Encode the key to bytes while preserving sort order.
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key type.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Trait for database values.
///
/// Values don't need to preserve ordering, so they use bincode. Any
/// `Serialize + DeserializeOwned` type is a value.
pub trait Value: Clone + Send + 'static {
    /// Encode the value to bytes.
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original value type.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl<T> Value for T
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
