use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;

/// Content hash of a serializable value, used to detect whether reconciliation work is needed.
///
/// The value is first converted into a `serde_json::Value`, whose objects keep their keys
/// sorted, so structurally equal inputs hash identically regardless of map ordering.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    Ok(STANDARD.encode(Sha256::digest(&canonical)))
}
