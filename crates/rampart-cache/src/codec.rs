//! Value encoding for the shared tier.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, Result};

/// Wire format for values stored in L2. The encoded length doubles as the
/// admission cost in L1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    MessagePack,
    Json,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Codec::Json => serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }
}
