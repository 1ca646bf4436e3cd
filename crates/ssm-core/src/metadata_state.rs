//! Metadata State Store: the snapshot type and its pure parse/quarantine
//! decision (spec Section 3 / Section 6). Atomic file I/O and the
//! corrupt-backup dance live in the daemon crate; this module only decides
//! *whether* a blob of bytes is usable and what the empty state looks like.

use std::collections::BTreeMap;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// `metadata_state.json`'s shape.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetadataStateSnapshot {
    pub schema_version: u32,
    pub sticky_flaresolverr_until_unix_seconds: Option<i64>,
    pub title_cooldowns_unix_seconds: BTreeMap<String, i64>,
}

impl Default for MetadataStateSnapshot {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            sticky_flaresolverr_until_unix_seconds: None,
            title_cooldowns_unix_seconds: BTreeMap::new(),
        }
    }
}

/// Why a snapshot load was rejected and quarantine must happen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuarantineReason {
    #[error("metadata state file is not valid JSON: {0}")]
    Malformed(String),
    #[error("metadata state schema version {found} is not the supported version {CURRENT_SCHEMA_VERSION}")]
    UnsupportedSchemaVersion { found: u32 },
}

/// Parse raw file bytes into a snapshot, or report why quarantine is
/// required. Pure: never touches the filesystem.
pub fn parse_snapshot(bytes: &[u8]) -> Result<MetadataStateSnapshot, QuarantineReason> {
    let snapshot: MetadataStateSnapshot = serde_json::from_slice(bytes)
        .map_err(|e| QuarantineReason::Malformed(e.to_string()))?;
    if snapshot.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(QuarantineReason::UnsupportedSchemaVersion {
            found: snapshot.schema_version,
        });
    }
    Ok(snapshot)
}

/// Serialize a snapshot for atomic persistence (pretty, stable key order
/// via `BTreeMap`, trailing newline for friendliness under `cat`).
pub fn serialize_snapshot(snapshot: &MetadataStateSnapshot) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(snapshot)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_default_has_current_schema_version() {
        let snapshot = MetadataStateSnapshot::default();
        assert_eq!(snapshot.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(snapshot.title_cooldowns_unix_seconds.is_empty());
        assert!(snapshot.sticky_flaresolverr_until_unix_seconds.is_none());
    }

    #[test]
    fn malformed_json_is_quarantined() {
        let err = parse_snapshot(b"{").unwrap_err();
        assert!(matches!(err, QuarantineReason::Malformed(_)));
    }

    #[test]
    fn wrong_schema_version_is_quarantined() {
        let bytes = br#"{"schema_version":2,"sticky_flaresolverr_until_unix_seconds":null,"title_cooldowns_unix_seconds":{}}"#;
        let err = parse_snapshot(bytes).unwrap_err();
        assert_eq!(err, QuarantineReason::UnsupportedSchemaVersion { found: 2 });
    }

    #[test]
    fn valid_snapshot_round_trips() {
        let mut snapshot = MetadataStateSnapshot::default();
        snapshot.sticky_flaresolverr_until_unix_seconds = Some(1_700_000_000);
        snapshot
            .title_cooldowns_unix_seconds
            .insert("mangatitle1".to_string(), 1_700_000_100);

        let bytes = serialize_snapshot(&snapshot).unwrap();
        let parsed = parse_snapshot(&bytes).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
