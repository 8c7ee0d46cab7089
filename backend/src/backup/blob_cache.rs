//! Content-addressed storage for exported `.torrent` blobs under
//! `backups/torrents/<hh>/<hh>/<hh>/<sha256>.torrent`, plus the path
//! sanitation rules §6 defines for archive paths.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tokio::fs;

const MAX_SEGMENT_BYTES: usize = 100;

/// Replace filesystem-hostile characters, drop control chars, trim
/// surrounding space/dots, and UTF-8-truncate to 100 bytes. Empty segments
/// collapse to `"uncategorized"`.
pub fn sanitize_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_control() {
            continue;
        }
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            other => out.push(other),
        }
    }
    let trimmed = out.trim_matches(|c: char| c.is_whitespace() || c == '.');
    let truncated = utf8_truncate(trimmed, MAX_SEGMENT_BYTES);
    if truncated.is_empty() {
        "uncategorized".to_string()
    } else {
        truncated
    }
}

fn utf8_truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Builds `<sanitized-category>/<sanitized-name>` (or just the name if
/// categories are excluded), injecting a `_1`, `_2`, ... suffix before the
/// extension when `exists` reports a collision.
pub fn archive_path(
    category: Option<&str>,
    name: &str,
    include_categories: bool,
    mut exists: impl FnMut(&str) -> bool,
) -> String {
    let sanitized_name = sanitize_segment(name);
    let dir = if include_categories {
        category.map(sanitize_segment)
    } else {
        None
    };

    let (stem, ext) = split_extension(&sanitized_name);
    let mut candidate = sanitized_name.clone();
    let mut suffix = 0u32;
    loop {
        let full = match &dir {
            Some(d) => format!("{d}/{candidate}"),
            None => candidate.clone(),
        };
        if !exists(&full) {
            return full;
        }
        suffix += 1;
        candidate = match &ext {
            Some(e) => format!("{stem}_{suffix}.{e}"),
            None => format!("{stem}_{suffix}"),
        };
    }
}

fn split_extension(name: &str) -> (String, Option<String>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Content-addressed cache rooted at `<dataDir>/backups/torrents`.
#[derive(Clone)]
pub struct BlobCache {
    root: PathBuf,
}

impl BlobCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `backups/torrents/<hh>/<hh>/<hh>/<sha256>.torrent`, relative to the
    /// data dir's `backups/` parent.
    pub fn rel_path_for_hash(hash_hex: &str) -> Result<String> {
        if hash_hex.len() < 6 {
            return Err(anyhow!("hash too short for content-addressed path: {hash_hex}"));
        }
        let a = &hash_hex[0..2];
        let b = &hash_hex[2..4];
        let c = &hash_hex[4..6];
        Ok(format!("torrents/{a}/{b}/{c}/{hash_hex}.torrent"))
    }

    fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn exists(&self, rel: &str) -> bool {
        fs::metadata(self.abs_path(rel)).await.is_ok()
    }

    pub async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        fs::read(self.abs_path(rel)).await.context("reading cached blob")
    }

    /// Writes via temp-then-rename; tolerates `AlreadyExists` since a
    /// concurrent writer may have already populated this content address.
    pub async fn write(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.abs_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.context("creating blob cache directory")?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp, bytes).await.context("writing temp blob")?;
        match fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp).await;
                Ok(())
            }
            Err(e) => Err(e).context("renaming temp blob into place"),
        }
    }

    pub async fn store_and_hash(&self, bytes: &[u8]) -> Result<(String, String)> {
        let hash = sha256_hex(bytes);
        let rel = Self::rel_path_for_hash(&hash)?;
        if !self.exists(&rel).await {
            self.write(&rel, bytes).await?;
        }
        Ok((hash, rel))
    }

    pub async fn remove(&self, rel: &str) -> Result<()> {
        match fs::remove_file(self.abs_path(rel)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing blob"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_hostile_chars_and_trims() {
        assert_eq!(sanitize_segment("a/b:c*d?.. "), "a_b_c_d");
    }

    #[test]
    fn sanitize_empty_collapses_to_uncategorized() {
        assert_eq!(sanitize_segment("   ..  "), "uncategorized");
    }

    #[test]
    fn sanitize_truncates_to_100_bytes() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_segment(&long).len(), 100);
    }

    #[test]
    fn archive_path_injects_numeric_suffix_on_collision() {
        let mut taken = vec!["movies/foo.torrent".to_string(), "movies/foo_1.torrent".to_string()];
        let path = archive_path(Some("movies"), "foo.torrent", true, |p| taken.contains(&p.to_string()));
        assert_eq!(path, "movies/foo_2.torrent");
        taken.push(path);
    }

    #[test]
    fn archive_path_omits_category_dir_when_excluded() {
        let path = archive_path(Some("movies"), "foo.torrent", false, |_| false);
        assert_eq!(path, "foo.torrent");
    }

    #[test]
    fn rel_path_for_hash_shards_by_first_three_byte_pairs() {
        let rel = BlobCache::rel_path_for_hash("abcdef0123456789").unwrap();
        assert_eq!(rel, "torrents/ab/cd/ef/abcdef0123456789.torrent");
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("blobcache-test-{}", std::process::id()));
        let cache = BlobCache::new(dir.clone());
        let (hash, rel) = cache.store_and_hash(b"d4:infod4:name4:teste1:x0ee").await.unwrap();
        assert!(!hash.is_empty());
        let read_back = cache.read(&rel).await.unwrap();
        assert_eq!(read_back, b"d4:infod4:name4:teste1:x0ee");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
