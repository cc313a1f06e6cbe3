//! Work-item payload encoding.
//!
//! Every work item travels as a JSON object whose `type` field names its
//! concrete type; the remaining fields belong to that type:
//!
//! ```text
//! { "type": "SubscriptionTriggerWorkItem", "subscriptionId": "...", ... }
//! ```
//!
//! The engine only ever interprets the discriminator. Typed decoding is done
//! by the registry on behalf of the handler that owns the type.

use std::borrow::Cow;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::WorkItemType;

/// A unit of asynchronous work that can be queued and dispatched.
pub trait WorkItem: Serialize + DeserializeOwned + Send + 'static {
    /// Discriminator written into the `type` field of the payload.
    const WORK_ITEM_TYPE: &'static str;

    /// Returns the discriminator as a [`WorkItemType`].
    fn work_item_type() -> WorkItemType {
        WorkItemType::from(Self::WORK_ITEM_TYPE)
    }
}

/// Errors that can occur while encoding or decoding work-item payloads.
#[derive(Debug, Error)]
pub enum WorkItemError {
    /// The payload is not a JSON object with a string `type` field.
    #[error("malformed work item payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The payload names a different type than the one being decoded.
    #[error("work item type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The type-specific fields could not be (de)serialized.
    #[error("work item JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for payload operations.
pub type Result<T> = std::result::Result<T, WorkItemError>;

#[derive(Deserialize)]
struct Header<'a> {
    #[serde(rename = "type", borrow)]
    work_item_type: Cow<'a, str>,
}

#[derive(Serialize)]
struct EncodedRef<'a, T> {
    #[serde(rename = "type")]
    work_item_type: &'a str,
    #[serde(flatten)]
    item: &'a T,
}

#[derive(Deserialize)]
struct Decoded<T> {
    /// Already checked by the header peek; consumed so it does not reach `T`.
    #[serde(rename = "type")]
    _work_item_type: IgnoredAny,
    #[serde(flatten)]
    item: T,
}

/// Reads the discriminator from a raw payload.
///
/// Only the `type` field is materialized; all other fields are skipped.
pub fn peek_work_item_type(payload: &str) -> Result<WorkItemType> {
    let header: Header<'_> = serde_json::from_str(payload).map_err(WorkItemError::Malformed)?;
    Ok(WorkItemType::new(header.work_item_type.into_owned()))
}

/// Serializes a work item with its discriminator.
pub fn encode_work_item<T: WorkItem>(item: &T) -> Result<String> {
    let encoded = EncodedRef {
        work_item_type: T::WORK_ITEM_TYPE,
        item,
    };
    Ok(serde_json::to_string(&encoded)?)
}

/// Deserializes a work item, checking that the payload carries `T`'s discriminator.
///
/// The discriminator is checked before the typed fields are read, so a
/// payload for another type is a [`WorkItemError::TypeMismatch`] even when
/// its fields do not fit `T`.
pub fn decode_work_item<T: WorkItem>(payload: &str) -> Result<T> {
    let found = peek_work_item_type(payload)?;
    if found.as_str() != T::WORK_ITEM_TYPE {
        return Err(WorkItemError::TypeMismatch {
            expected: T::WORK_ITEM_TYPE.to_string(),
            found: found.as_str().to_string(),
        });
    }
    let decoded: Decoded<T> = serde_json::from_str(payload)?;
    Ok(decoded.item)
}
