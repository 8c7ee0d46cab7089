//! C8: deterministic snapshot-vs-live diffing into a `RestorePlan` (§4.8).

use std::collections::{BTreeSet, HashSet};

use crate::db::models::{
    BackupItem, CategoryChange, CategoryPlan, DiffChange, LiveState, RestoreMode, RestorePlan,
    SnapshotState, TagChange, TagPlan, Torrent, TorrentAdd, TorrentPlan, TorrentUpdate,
};

#[derive(Debug, Clone, Default)]
pub struct RestorePlanOptions {
    /// Lowercased torrent hashes to drop from the plan after diffing.
    pub exclude_hashes: HashSet<String>,
}

pub fn build_restore_plan(
    run_id: i64,
    snapshot: &SnapshotState,
    live: &LiveState,
    mode: RestoreMode,
) -> RestorePlan {
    RestorePlan {
        mode,
        run_id,
        instance_id: snapshot.instance_id,
        categories: diff_categories(snapshot, live, mode),
        tags: diff_tags(snapshot, live, mode),
        torrents: diff_torrents(run_id, snapshot, live, mode),
    }
}

/// Drops any torrent add/update/delete entry whose hash (lowercased) is in
/// `options.exclude_hashes`. Categories and tags are not hash-keyed and are
/// left untouched.
pub fn apply_restore_plan_options(mut plan: RestorePlan, options: &RestorePlanOptions) -> RestorePlan {
    if options.exclude_hashes.is_empty() {
        return plan;
    }
    let normalized: HashSet<String> = options.exclude_hashes.iter().map(|h| h.to_lowercase()).collect();
    let excluded = |h: &str| normalized.contains(&h.to_lowercase());
    plan.torrents.add.retain(|a| !excluded(&a.hash));
    plan.torrents.update.retain(|u| !excluded(&u.hash));
    plan.torrents.delete.retain(|h| !excluded(h));
    plan
}

fn norm(s: &str) -> String {
    s.trim().to_string()
}

fn diff_categories(snapshot: &SnapshotState, live: &LiveState, mode: RestoreMode) -> CategoryPlan {
    let mut plan = CategoryPlan::default();

    for (name, snap_cat) in &snapshot.categories {
        match live.categories.get(name) {
            None => plan.create.push(CategoryChange {
                name: name.clone(),
                old_save_path: None,
                new_save_path: snap_cat.save_path.clone(),
            }),
            Some(live_cat) if mode.allows_update() => {
                if norm(&live_cat.save_path) != norm(&snap_cat.save_path) {
                    plan.update.push(CategoryChange {
                        name: name.clone(),
                        old_save_path: Some(live_cat.save_path.clone()),
                        new_save_path: snap_cat.save_path.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }

    if mode.allows_delete() {
        for name in live.categories.keys() {
            if !snapshot.categories.contains_key(name) {
                plan.delete.push(name.clone());
            }
        }
    }

    plan
}

fn diff_tags(snapshot: &SnapshotState, live: &LiveState, mode: RestoreMode) -> TagPlan {
    let mut plan = TagPlan::default();

    for tag in &snapshot.tags {
        if !live.tags.contains(tag) {
            plan.create.push(TagChange { name: tag.clone() });
        }
    }

    if mode.allows_delete() {
        for tag in &live.tags {
            if !snapshot.tags.contains(tag) {
                plan.delete.push(TagChange { name: tag.clone() });
            }
        }
    }

    plan
}

fn diff_torrents(run_id: i64, snapshot: &SnapshotState, live: &LiveState, mode: RestoreMode) -> TorrentPlan {
    let mut plan = TorrentPlan::default();

    for (hash, snap_torrent) in &snapshot.torrents {
        match live.torrents.get(hash) {
            None => plan.add.push(TorrentAdd {
                hash: hash.clone(),
                item: torrent_to_backup_item(run_id, hash, snap_torrent),
            }),
            Some(live_torrent) if mode.allows_update() => {
                let changes = diff_torrent_fields(snap_torrent, live_torrent);
                if !changes.is_empty() {
                    plan.update.push(TorrentUpdate {
                        hash: hash.clone(),
                        changes,
                        target_category: snap_torrent.category.clone(),
                        target_tags: snap_torrent.tags.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }

    if mode.allows_delete() {
        for hash in live.torrents.keys() {
            if !snapshot.torrents.contains_key(hash) {
                plan.delete.push(hash.clone());
            }
        }
    }

    plan
}

fn diff_torrent_fields(snapshot: &Torrent, live: &Torrent) -> Vec<DiffChange> {
    let mut changes = Vec::new();

    let snap_category = snapshot.category.as_deref().map(norm).unwrap_or_default();
    let live_category = live.category.as_deref().map(norm).unwrap_or_default();
    if snap_category != live_category {
        changes.push(DiffChange {
            field: "category".to_string(),
            supported: true,
            message: None,
        });
    }

    let snap_tags: BTreeSet<String> = snapshot.tags.iter().map(|t| norm(t)).collect();
    let live_tags: BTreeSet<String> = live.tags.iter().map(|t| norm(t)).collect();
    if snap_tags != live_tags {
        changes.push(DiffChange {
            field: "tags".to_string(),
            supported: true,
            message: None,
        });
    }

    if snapshot.info_hash_v1 != live.info_hash_v1 {
        changes.push(DiffChange {
            field: "infohash_v1".to_string(),
            supported: false,
            message: Some("infohash_v1 cannot be changed after a torrent is added".to_string()),
        });
    }

    if snapshot.info_hash_v2 != live.info_hash_v2 {
        changes.push(DiffChange {
            field: "infohash_v2".to_string(),
            supported: false,
            message: Some("infohash_v2 cannot be changed after a torrent is added".to_string()),
        });
    }

    if snapshot.size_bytes != live.size_bytes {
        changes.push(DiffChange {
            field: "sizeBytes".to_string(),
            supported: false,
            message: Some("local data size differs; re-verify or re-download".to_string()),
        });
    }

    changes
}

fn torrent_to_backup_item(run_id: i64, normalized_hash: &str, torrent: &Torrent) -> BackupItem {
    BackupItem {
        run_id,
        torrent_hash: normalized_hash.to_string(),
        name: torrent.name.clone(),
        category: torrent.category.clone(),
        size_bytes: torrent.size_bytes,
        archive_rel_path: torrent.archive_rel_path.clone(),
        info_hash_v1: torrent.info_hash_v1.clone(),
        info_hash_v2: torrent.info_hash_v2.clone(),
        tags: if torrent.tags.is_empty() { None } else { Some(torrent.tags.join(",")) },
        torrent_blob_path: torrent.torrent_blob_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::CategoryRef;

    fn torrent(hash: &str, category: Option<&str>, tags: &[&str], size: i64) -> Torrent {
        Torrent {
            hash: hash.to_string(),
            name: format!("name-{hash}"),
            category: category.map(str::to_string),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            size_bytes: size,
            info_hash_v1: None,
            info_hash_v2: None,
            archive_rel_path: None,
            torrent_blob_path: None,
        }
    }

    #[test]
    fn incremental_mode_only_proposes_additions() {
        let mut snapshot = SnapshotState::new(1);
        snapshot.insert_category("movies", "/data/movies");
        snapshot.insert_tag("seeded");
        snapshot.insert_torrent(torrent("AAA", Some("movies"), &["seeded"], 100));

        let mut live = SnapshotState::new(1);
        live.insert_torrent(torrent("AAA", Some("tv"), &[], 999));
        live.insert_torrent(torrent("BBB", None, &[], 1));

        let plan = build_restore_plan(1, &snapshot, &live, RestoreMode::Incremental);
        assert_eq!(plan.categories.create.len(), 1);
        assert!(plan.categories.update.is_empty());
        assert!(plan.categories.delete.is_empty());
        assert_eq!(plan.tags.create.len(), 1);
        assert!(plan.tags.delete.is_empty());
        assert!(plan.torrents.add.is_empty(), "AAA already exists live");
        assert!(plan.torrents.update.is_empty(), "incremental never updates");
        assert!(plan.torrents.delete.is_empty(), "incremental never deletes");
    }

    #[test]
    fn overwrite_mode_proposes_updates_but_never_deletes() {
        let mut snapshot = SnapshotState::new(1);
        snapshot.insert_torrent(torrent("aaa", Some("movies"), &["x"], 100));

        let mut live = SnapshotState::new(1);
        live.insert_torrent(torrent("aaa", Some("tv"), &["y"], 999));
        live.insert_torrent(torrent("bbb", None, &[], 1));

        let plan = build_restore_plan(1, &snapshot, &live, RestoreMode::Overwrite);
        assert_eq!(plan.torrents.update.len(), 1);
        let update = &plan.torrents.update[0];
        let fields: Vec<&str> = update.changes.iter().map(|c| c.field.as_str()).collect();
        assert!(fields.contains(&"category"));
        assert!(fields.contains(&"tags"));
        assert!(fields.contains(&"sizeBytes"));
        assert!(plan.torrents.delete.is_empty());
    }

    #[test]
    fn complete_mode_proposes_deletions_for_live_only_hashes() {
        let mut snapshot = SnapshotState::new(1);
        snapshot.insert_torrent(torrent("aaa", None, &[], 1));

        let mut live = SnapshotState::new(1);
        live.insert_torrent(torrent("aaa", None, &[], 1));
        live.insert_torrent(torrent("bbb", None, &[], 1));

        let plan = build_restore_plan(1, &snapshot, &live, RestoreMode::Complete);
        assert_eq!(plan.torrents.delete, vec!["bbb".to_string()]);
        assert!(plan.torrents.update.is_empty(), "identical torrents produce no update");
    }

    #[test]
    fn exclude_hashes_filters_all_torrent_plan_sections() {
        let mut snapshot = SnapshotState::new(1);
        snapshot.insert_torrent(torrent("aaa", None, &[], 1));
        snapshot.insert_torrent(torrent("ccc", None, &[], 1));

        let live = SnapshotState::new(1);

        let plan = build_restore_plan(1, &snapshot, &live, RestoreMode::Incremental);
        assert_eq!(plan.torrents.add.len(), 2);

        let options = RestorePlanOptions {
            exclude_hashes: HashSet::from(["AAA".to_string()]),
        };
        let filtered = apply_restore_plan_options(plan, &options);
        assert_eq!(filtered.torrents.add.len(), 1);
        assert_eq!(filtered.torrents.add[0].hash, "ccc");
    }

    #[test]
    fn category_save_path_update_is_trim_normalized() {
        let mut snapshot = SnapshotState::new(1);
        snapshot.categories.insert("movies".into(), CategoryRef { save_path: " /data/movies ".into() });
        let mut live = SnapshotState::new(1);
        live.categories.insert("movies".into(), CategoryRef { save_path: "/data/movies".into() });

        let plan = build_restore_plan(1, &snapshot, &live, RestoreMode::Overwrite);
        assert!(plan.categories.update.is_empty(), "trimmed paths are equal");
    }
}
