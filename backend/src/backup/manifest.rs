//! Manifest JSON shape (§6) and the validation rules applied on import.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{BackupItem, BackupKind, CategoryRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub hash: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: i64,
    #[serde(rename = "archivePath")]
    pub archive_path: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "infohashV1")]
    pub info_hash_v1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "infohashV2")]
    pub info_hash_v2: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "torrentBlob")]
    pub torrent_blob: Option<String>,
}

impl From<&BackupItem> for ManifestItem {
    fn from(item: &BackupItem) -> Self {
        Self {
            hash: item.torrent_hash.clone(),
            name: item.name.clone(),
            category: item.category.clone(),
            size_bytes: item.size_bytes,
            archive_path: item.archive_rel_path.clone().unwrap_or_default(),
            info_hash_v1: item.info_hash_v1.clone(),
            info_hash_v2: item.info_hash_v2.clone(),
            tags: item
                .tags
                .as_deref()
                .map(|s| s.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            torrent_blob: item.torrent_blob_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "instanceId")]
    pub instance_id: i64,
    pub kind: BackupKind,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    #[serde(rename = "torrentCount")]
    pub torrent_count: i32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub categories: BTreeMap<String, CategoryRef>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    pub items: Vec<ManifestItem>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Into::into)
    }

    /// `qui-backup_<slug>_<kind>_<UTC-ISO-basic>_manifest.json`
    pub fn file_name(&self, instance_slug: &str) -> String {
        format!(
            "qui-backup_{}_{}_{}_manifest.json",
            instance_slug,
            self.kind.as_str(),
            self.generated_at.format("%Y%m%dT%H%M%SZ"),
        )
    }
}

/// A path is unsafe if absolute, or its cleaned (`.`/`..`-collapsed) form
/// begins with `..`.
pub fn is_unsafe_blob_path(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return true;
    }
    let mut cleaned: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if cleaned.pop().is_none() {
                    return true;
                }
            }
            other => cleaned.push(other),
        }
    }
    false
}

/// hash+name required; archive path (when present) must be safe.
pub fn validate_item(item: &ManifestItem) -> Result<()> {
    if item.hash.trim().is_empty() {
        return Err(anyhow!("manifest item missing hash"));
    }
    if item.name.trim().is_empty() {
        return Err(anyhow!("manifest item {} missing name", item.hash));
    }
    if !item.archive_path.is_empty() && is_unsafe_blob_path(&item.archive_path) {
        return Err(anyhow!("manifest item {} has unsafe archive path {}", item.hash, item.archive_path));
    }
    Ok(())
}

/// Blobs copied into the cache on import must look like bencode: first byte
/// `'d'`, and at least 50 bytes (a floor well below any real `.torrent`).
pub fn looks_like_torrent_blob(bytes: &[u8]) -> bool {
    bytes.len() >= 50 && bytes[0] == b'd'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_paths_are_rejected() {
        assert!(is_unsafe_blob_path("/etc/passwd"));
        assert!(is_unsafe_blob_path("../../escape.torrent"));
        assert!(is_unsafe_blob_path("a/../../b"));
        assert!(!is_unsafe_blob_path("movies/foo.torrent"));
        assert!(!is_unsafe_blob_path("a/../b"));
    }

    #[test]
    fn validate_item_requires_hash_and_name() {
        let mut item = ManifestItem {
            hash: String::new(),
            name: "x".into(),
            category: None,
            size_bytes: 0,
            archive_path: "x.torrent".into(),
            info_hash_v1: None,
            info_hash_v2: None,
            tags: vec![],
            torrent_blob: None,
        };
        assert!(validate_item(&item).is_err());
        item.hash = "abc".into();
        assert!(validate_item(&item).is_ok());
    }

    #[test]
    fn blob_header_check_requires_d_prefix_and_min_size() {
        assert!(!looks_like_torrent_blob(b"d1:a"));
        assert!(looks_like_torrent_blob(&[b"d".as_slice(), &[0u8; 60]].concat()));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest {
            instance_id: 1,
            kind: BackupKind::Daily,
            generated_at: Utc::now(),
            torrent_count: 1,
            categories: BTreeMap::new(),
            tags: vec![],
            items: vec![ManifestItem {
                hash: "abc".into(),
                name: "foo".into(),
                category: None,
                size_bytes: 10,
                archive_path: "foo.torrent".into(),
                info_hash_v1: None,
                info_hash_v2: None,
                tags: vec![],
                torrent_blob: None,
            }],
        };
        let json = manifest.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.items.len(), 1);
        assert_eq!(back.kind, manifest.kind);
    }
}
