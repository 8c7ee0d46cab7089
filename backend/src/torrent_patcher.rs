//! C6: repair tracker metadata qBittorrent's WebAPI export strips on the
//! known-buggy `{2.9.1, 2.9.2, 2.9.3}` versions.
//!
//! Built on `serde_bencode::value::Value` rather than a typed struct (the
//! way this crate's torrent-metadata reader decodes `.torrent` files
//! elsewhere) because a typed struct can't tell us whether `announce-list`
//! was present-but-wrong versus absent, and re-encoding a `BTreeMap`-backed
//! `Value::Dict` reproduces bencode's required lexicographic key order, so
//! untouched input round-trips byte-for-byte.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde_bencode::value::Value;

const BUGGY_WEBAPI_VERSIONS: &[&str] = &["2.9.1", "2.9.2", "2.9.3"];

pub fn needs_patch(webapi_version: &str) -> bool {
    BUGGY_WEBAPI_VERSIONS.contains(&webapi_version)
}

/// Dedup trackers from three sources, in priority order: in-memory
/// trackers, then the WebAPI `torrents/trackers` call, then the primary
/// `tracker` field as last resort.
pub fn collect_trackers(
    in_memory_trackers: &[String],
    webapi_trackers: &[String],
    primary_tracker: Option<&str>,
) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut ordered = Vec::new();

    let mut push = |t: &str| {
        let t = t.trim();
        if !t.is_empty() && seen.insert(t.to_string()) {
            ordered.push(t.to_string());
        }
    };

    if !in_memory_trackers.is_empty() {
        for t in in_memory_trackers {
            push(t);
        }
    } else {
        for t in webapi_trackers {
            push(t);
        }
    }

    if ordered.is_empty() {
        if let Some(t) = primary_tracker {
            push(t);
        }
    }

    ordered
}

/// Returns `(bytes, mutated)`. `bytes` is byte-identical to `input` when
/// `mutated` is false.
pub fn patch(input: &[u8], trackers: &[String]) -> Result<(Vec<u8>, bool)> {
    let value: Value = serde_bencode::from_bytes(input).context("decoding torrent as bencode")?;
    let Value::Dict(mut dict) = value else {
        return Err(anyhow!("torrent payload is not a bencoded dict"));
    };

    if trackers.is_empty() {
        return Ok((input.to_vec(), false));
    }

    let mut mutated = false;

    let current_announce = dict
        .get(b"announce".as_slice())
        .and_then(value_as_string);

    let announce_matches = current_announce
        .as_deref()
        .is_some_and(|a| trackers.iter().any(|t| t == a));

    if !announce_matches {
        dict.insert(b"announce".to_vec(), Value::Bytes(trackers[0].clone().into_bytes()));
        mutated = true;
    }

    let expected_tiers: Vec<Vec<String>> = trackers.iter().map(|t| vec![t.clone()]).collect();
    let current_tiers = dict.get(b"announce-list".as_slice()).and_then(value_as_tiers);

    if current_tiers.as_ref() != Some(&expected_tiers) {
        let announce_list = Value::List(
            expected_tiers
                .iter()
                .map(|tier| {
                    Value::List(tier.iter().map(|t| Value::Bytes(t.clone().into_bytes())).collect())
                })
                .collect(),
        );
        dict.insert(b"announce-list".to_vec(), announce_list);
        mutated = true;
    }

    if !mutated {
        return Ok((input.to_vec(), false));
    }

    let bytes = serde_bencode::to_bytes(&Value::Dict(dict)).context("re-encoding patched torrent")?;
    Ok((bytes, true))
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

fn value_as_tiers(v: &Value) -> Option<Vec<Vec<String>>> {
    let Value::List(tiers) = v else {
        return None;
    };
    let mut out = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let Value::List(urls) = tier else {
            return None;
        };
        let mut tier_out = Vec::with_capacity(urls.len());
        for url in urls {
            tier_out.push(value_as_string(url)?);
        }
        out.push(tier_out);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_torrent(announce: &str, announce_list: Option<&[&[&str]]>) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        dict.insert(b"announce".to_vec(), Value::Bytes(announce.as_bytes().to_vec()));
        if let Some(tiers) = announce_list {
            let list = Value::List(
                tiers
                    .iter()
                    .map(|tier| {
                        Value::List(tier.iter().map(|u| Value::Bytes(u.as_bytes().to_vec())).collect())
                    })
                    .collect(),
            );
            dict.insert(b"announce-list".to_vec(), list);
        }
        let mut info: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(b"test".to_vec()));
        info.insert(b"length".to_vec(), Value::Int(100));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        dict.insert(b"info".to_vec(), Value::Dict(info));
        serde_bencode::to_bytes(&Value::Dict(dict)).unwrap()
    }

    #[test]
    fn needs_patch_matches_known_buggy_versions() {
        assert!(needs_patch("2.9.2"));
        assert!(!needs_patch("2.9.4"));
    }

    #[test]
    fn collect_trackers_prefers_in_memory_then_webapi_then_primary() {
        let trackers = collect_trackers(
            &["udp://a".to_string()],
            &["udp://b".to_string()],
            Some("udp://c"),
        );
        assert_eq!(trackers, vec!["udp://a".to_string()]);

        let trackers = collect_trackers(&[], &["udp://b".to_string()], Some("udp://c"));
        assert_eq!(trackers, vec!["udp://b".to_string()]);

        let trackers = collect_trackers(&[], &[], Some("udp://c"));
        assert_eq!(trackers, vec!["udp://c".to_string()]);
    }

    #[test]
    fn collect_trackers_dedupes_preserving_first_occurrence() {
        let trackers = collect_trackers(
            &["udp://a".to_string(), "udp://a".to_string(), "udp://b".to_string()],
            &[],
            None,
        );
        assert_eq!(trackers, vec!["udp://a".to_string(), "udp://b".to_string()]);
    }

    #[test]
    fn unchanged_input_is_byte_identical_and_unmutated() {
        let input = sample_torrent("udp://a", Some(&[&["udp://a"]]));
        let (bytes, mutated) = patch(&input, &["udp://a".to_string()]).unwrap();
        assert!(!mutated);
        assert_eq!(bytes, input);
    }

    #[test]
    fn missing_announce_is_set_from_first_tracker() {
        let input = sample_torrent("", None);
        let (bytes, mutated) = patch(&input, &["udp://tracker1".to_string()]).unwrap();
        assert!(mutated);
        let decoded: Value = serde_bencode::from_bytes(&bytes).unwrap();
        let Value::Dict(d) = decoded else { panic!("not a dict") };
        assert_eq!(
            value_as_string(d.get(b"announce".as_slice()).unwrap()).unwrap(),
            "udp://tracker1"
        );
    }

    #[test]
    fn mismatched_announce_list_is_replaced() {
        let input = sample_torrent("udp://a", Some(&[&["udp://a"], &["udp://old"]]));
        let (bytes, mutated) = patch(&input, &["udp://a".to_string(), "udp://b".to_string()]).unwrap();
        assert!(mutated);
        let decoded: Value = serde_bencode::from_bytes(&bytes).unwrap();
        let Value::Dict(d) = decoded else { panic!("not a dict") };
        let tiers = value_as_tiers(d.get(b"announce-list".as_slice()).unwrap()).unwrap();
        assert_eq!(tiers, vec![vec!["udp://a".to_string()], vec!["udp://b".to_string()]]);
    }
}
