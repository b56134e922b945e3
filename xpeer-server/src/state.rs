//! Shared JSON state of virtual peers.
//!
//! Every vpeer carries one JSON document as raw text. `put` replaces the
//! text wholesale without validating it; `patch` deep-merges a JSON object
//! into the current document:
//!
//! - both sides objects → merge key-wise, recursing per key
//! - anything else (scalars, arrays, mixed) → the patch side wins
//! - keys absent from the patch are preserved
//!
//! A side that does not parse as a JSON object is treated as `{}`, so a
//! patch against garbage state behaves like a patch against a fresh vpeer.
//!
//! Each vpeer's document sits behind its own mutex (see [`crate::peer`]),
//! held across merge + serialize, so intermediate states are never
//! observable and traffic on other vpeers is unaffected.

use serde_json::{Map, Value};

use crate::protocol::ProtocolError;
use crate::registry::PeerRegistry;

/// Recursive deep-merge of two JSON values.
///
/// Only the object/object case merges; every other pairing resolves to
/// `after`, including arrays, which are replaced as whole nodes.
pub fn deep_merge(before: Value, after: Value) -> Value {
    match (before, after) {
        (Value::Object(mut merged), Value::Object(after)) => {
            for (key, val) in after {
                let entry = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, val),
                    None => val,
                };
                merged.insert(key, entry);
            }
            Value::Object(merged)
        }
        (_, after) => after,
    }
}

/// Merge the `patch` document into `before` and re-serialize.
///
/// Unparseable sides degrade to the empty object; a serialization failure
/// reports [`ProtocolError::InvalidStateFormat`] and the caller keeps the
/// old state.
pub fn merge_documents(before: &str, patch: &str) -> Result<String, ProtocolError> {
    let merged = deep_merge(
        Value::Object(parse_object(before)),
        Value::Object(parse_object(patch)),
    );
    serde_json::to_string(&merged).map_err(|_| ProtocolError::InvalidStateFormat)
}

fn parse_object(text: &str) -> Map<String, Value> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl PeerRegistry {
    /// Replace a vpeer's state with the raw payload (no JSON validation).
    pub async fn put_state(&self, vpeer_id: &str, payload: &str) -> Result<(), ProtocolError> {
        let handle = self.state_handle(vpeer_id).await?;
        let mut state = handle.lock().await;
        *state = payload.to_string();
        Ok(())
    }

    /// Deep-merge the payload into a vpeer's state.
    pub async fn patch_state(&self, vpeer_id: &str, payload: &str) -> Result<(), ProtocolError> {
        let handle = self.state_handle(vpeer_id).await?;
        let mut state = handle.lock().await;
        let merged = merge_documents(&state, payload)?;
        *state = merged;
        Ok(())
    }

    /// Current state text of a vpeer.
    pub async fn state_of(&self, vpeer_id: &str) -> Result<String, ProtocolError> {
        let handle = self.state_handle(vpeer_id).await?;
        let state = handle.lock().await;
        Ok(state.clone())
    }
}
