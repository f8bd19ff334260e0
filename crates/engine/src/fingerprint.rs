//! Anomaly fingerprints
//!
//! A fingerprint covers only the stable attributes of a finding:
//! `{type, entity_type, entity_id, anomaly_scope}`. Amounts change on every
//! re-check and are deliberately left out.

use ledgerwatch_core::{AnomalyScope, EntityType};
use serde_json::json;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) of the canonical JSON of the stable attributes
///
/// `serde_json` objects keep keys sorted, which makes the encoding canonical.
pub fn fingerprint(
    invariant: &str,
    entity_type: EntityType,
    entity_id: i64,
    scope: AnomalyScope,
) -> String {
    let canonical = json!({
        "type": invariant,
        "entity_type": entity_type.as_ref(),
        "entity_id": entity_id,
        "anomaly_scope": scope.as_ref(),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
