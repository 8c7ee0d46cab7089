//! Shared data-model types (§3). These are plain value types; persistence
//! mapping to/from SQLite rows lives in the sibling repository modules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub has_local_filesystem_access: bool,
    pub use_hardlinks: bool,
    pub hardlink_base_dir: Option<String>,
    pub hardlink_dir_preset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl BackupKind {
    pub const SCHEDULED: [BackupKind; 4] = [
        BackupKind::Hourly,
        BackupKind::Daily,
        BackupKind::Weekly,
        BackupKind::Monthly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Hourly => "hourly",
            BackupKind::Daily => "daily",
            BackupKind::Weekly => "weekly",
            BackupKind::Monthly => "monthly",
            BackupKind::Manual => "manual",
        }
    }
}

impl std::str::FromStr for BackupKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(BackupKind::Hourly),
            "daily" => Ok(BackupKind::Daily),
            "weekly" => Ok(BackupKind::Weekly),
            "monthly" => Ok(BackupKind::Monthly),
            "manual" => Ok(BackupKind::Manual),
            other => Err(anyhow::anyhow!("unknown backup kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "success" => Ok(BackupStatus::Success),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(anyhow::anyhow!("unknown backup status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub instance_id: i64,
    pub enabled: bool,
    pub hourly_enabled: bool,
    pub daily_enabled: bool,
    pub weekly_enabled: bool,
    pub monthly_enabled: bool,
    pub keep_hourly: i32,
    pub keep_daily: i32,
    pub keep_weekly: i32,
    pub keep_monthly: i32,
    pub include_categories: bool,
    pub include_tags: bool,
}

impl BackupSettings {
    /// If a kind is enabled, its keep count is clamped to >= 1.
    pub fn normalize(mut self) -> Self {
        if self.hourly_enabled {
            self.keep_hourly = self.keep_hourly.max(1);
        }
        if self.daily_enabled {
            self.keep_daily = self.keep_daily.max(1);
        }
        if self.weekly_enabled {
            self.keep_weekly = self.keep_weekly.max(1);
        }
        if self.monthly_enabled {
            self.keep_monthly = self.keep_monthly.max(1);
        }
        self
    }

    pub fn keep_for(&self, kind: BackupKind) -> i32 {
        match kind {
            BackupKind::Hourly => self.keep_hourly,
            BackupKind::Daily => self.keep_daily,
            BackupKind::Weekly => self.keep_weekly,
            BackupKind::Monthly => self.keep_monthly,
            BackupKind::Manual => 0,
        }
    }

    pub fn enabled_kinds(&self) -> Vec<BackupKind> {
        let mut kinds = vec![];
        if self.hourly_enabled {
            kinds.push(BackupKind::Hourly);
        }
        if self.daily_enabled {
            kinds.push(BackupKind::Daily);
        }
        if self.weekly_enabled {
            kinds.push(BackupKind::Weekly);
        }
        if self.monthly_enabled {
            kinds.push(BackupKind::Monthly);
        }
        kinds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: i64,
    pub instance_id: i64,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub manifest_path: Option<String>,
    pub total_bytes: i64,
    pub torrent_count: i32,
    pub category_counts: BTreeMap<String, i32>,
    pub categories: BTreeMap<String, CategoryRef>,
    pub tags: Vec<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRef {
    #[serde(rename = "savePath")]
    pub save_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupItem {
    pub run_id: i64,
    pub torrent_hash: String,
    pub name: String,
    pub category: Option<String>,
    pub size_bytes: i64,
    pub archive_rel_path: Option<String>,
    pub info_hash_v1: Option<String>,
    pub info_hash_v2: Option<String>,
    pub tags: Option<String>,
    pub torrent_blob_path: Option<String>,
}

/// A torrent as observed live or captured in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    pub hash: String,
    pub name: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub size_bytes: i64,
    pub info_hash_v1: Option<String>,
    pub info_hash_v2: Option<String>,
    pub archive_rel_path: Option<String>,
    pub torrent_blob_path: Option<String>,
}

/// Parallel structure used only for planning (§3). Hash keys are always
/// normalized (trimmed, lower-cased) on entry; empty keys are dropped.
#[derive(Debug, Clone, Default)]
pub struct SnapshotState {
    pub instance_id: i64,
    pub categories: BTreeMap<String, CategoryRef>,
    pub tags: std::collections::BTreeSet<String>,
    pub torrents: BTreeMap<String, Torrent>,
}

impl SnapshotState {
    pub fn new(instance_id: i64) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    pub fn insert_torrent(&mut self, torrent: Torrent) {
        let key = torrent.hash.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        self.torrents.insert(key, torrent);
    }

    pub fn insert_category(&mut self, name: impl Into<String>, save_path: impl Into<String>) {
        let name = name.into();
        if name.trim().is_empty() {
            return;
        }
        self.categories.insert(name, CategoryRef {
            save_path: save_path.into(),
        });
    }

    pub fn insert_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.trim().is_empty() {
            self.tags.insert(tag);
        }
    }
}

pub type LiveState = SnapshotState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    Incremental,
    Overwrite,
    Complete,
}

impl RestoreMode {
    /// Trim+lowercase; empty string defaults to incremental; unknown is an error.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match input.trim().to_lowercase().as_str() {
            "" | "incremental" => Ok(RestoreMode::Incremental),
            "overwrite" => Ok(RestoreMode::Overwrite),
            "complete" => Ok(RestoreMode::Complete),
            other => Err(anyhow::anyhow!("invalid restore mode: {other}")),
        }
    }

    pub fn allows_update(self) -> bool {
        matches!(self, RestoreMode::Overwrite | RestoreMode::Complete)
    }

    pub fn allows_delete(self) -> bool {
        matches!(self, RestoreMode::Complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryChange {
    pub name: String,
    pub old_save_path: Option<String>,
    pub new_save_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagChange {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffChange {
    pub field: String,
    pub supported: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentAdd {
    pub hash: String,
    pub item: BackupItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentUpdate {
    pub hash: String,
    pub changes: Vec<DiffChange>,
    /// Snapshot's target category/tags, carried alongside `changes` so the
    /// executor can apply a `supported` change without re-deriving it from
    /// the snapshot. Only meaningful when the corresponding field appears
    /// in `changes` with `supported: true`.
    pub target_category: Option<String>,
    pub target_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub create: Vec<CategoryChange>,
    pub update: Vec<CategoryChange>,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagPlan {
    pub create: Vec<TagChange>,
    pub delete: Vec<TagChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentPlan {
    pub add: Vec<TorrentAdd>,
    pub update: Vec<TorrentUpdate>,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePlan {
    pub mode: RestoreMode,
    pub run_id: i64,
    pub instance_id: i64,
    pub categories: CategoryPlan,
    pub tags: TagPlan,
    pub torrents: TorrentPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerBackend {
    Jackett,
    Prowlarr,
    Native,
}

impl IndexerBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexerBackend::Jackett => "jackett",
            IndexerBackend::Prowlarr => "prowlarr",
            IndexerBackend::Native => "native",
        }
    }
}

impl std::str::FromStr for IndexerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jackett" => Ok(IndexerBackend::Jackett),
            "prowlarr" => Ok(IndexerBackend::Prowlarr),
            "native" => Ok(IndexerBackend::Native),
            other => Err(anyhow::anyhow!("unknown indexer backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorznabCategoryEntry {
    pub category_id: i32,
    pub name: String,
    pub parent: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorznabIndexer {
    pub id: i64,
    pub name: String,
    pub backend: IndexerBackend,
    pub base_url: String,
    pub api_key_encrypted: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub capabilities: Vec<String>,
    pub categories: Vec<TorznabCategoryEntry>,
}

impl TorznabIndexer {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap))
    }
}

/// Parameter map carried through negotiation (§4.3) and the wire builder
/// (§6). `BTreeMap` keeps canonicalization (sorted keys) free.
pub type ParamMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Search,
    TvSearch,
    Movie,
}

impl SearchMode {
    /// The `<mode>` fragment used in capability names like `movie-search-year`.
    pub fn capability_prefix(self) -> &'static str {
        match self {
            SearchMode::Search => "search",
            SearchMode::TvSearch => "tv",
            SearchMode::Movie => "movie",
        }
    }

    pub fn wire_value(self) -> &'static str {
        match self {
            SearchMode::Search => "search",
            SearchMode::TvSearch => "tvsearch",
            SearchMode::Movie => "movie",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Movie,
    TvShow,
    TvDaily,
    Music,
    Audiobook,
    Book,
    Comic,
    Magazine,
    Education,
    App,
    Game,
    Xxx,
    #[default]
    Unknown,
}

/// A search request as understood by C2/C5 (§6's Torznab wire fields, plus
/// the classifier inputs). `offset` is accepted but never transmitted
/// (§9 open question, resolved: kept as a reserved field).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorznabSearchRequest {
    pub mode: SearchMode,
    pub query: Option<String>,
    pub categories: Vec<i32>,
    pub season: Option<i32>,
    pub episode: Option<String>,
    pub imdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvmaze_id: Option<String>,
    pub trakt_id: Option<String>,
    pub douban_id: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Search
    }
}

/// Carried alongside a search task so negotiation rule 3 (§4.3) can restore
/// the human-readable query after ID-parameter pruning drops everything.
#[derive(Debug, Clone, Default)]
pub struct SearchMeta {
    pub original_query: Option<String>,
    pub content_type: ContentType,
    pub job_id: u64,
}

/// A converted search result (Torznab `<item>` → this). Trimmed to the
/// fields the scheduler, cache and callers actually need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub title: String,
    pub guid: String,
    pub link: Option<String>,
    pub magnet_uri: Option<String>,
    pub info_hash: Option<String>,
    pub publish_date: DateTime<Utc>,
    pub categories: Vec<i32>,
    pub size: Option<i64>,
    pub seeders: Option<i32>,
    pub peers: Option<i32>,
    pub indexer_id: Option<i64>,
    pub indexer_name: Option<String>,
}

/// In-memory ring buffer entry (§3). Persisted nowhere; lives only for the
/// lifetime of the process in a fixed-capacity `VecDeque`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcomeStatus {
    Success,
    Error,
    Skipped,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub id: u64,
    pub job_id: u64,
    pub task_id: u64,
    pub indexer_id: i64,
    pub indexer_name: String,
    pub query: Option<String>,
    pub release_name: Option<String>,
    pub categories: Vec<i32>,
    pub content_type: ContentType,
    pub status: SearchOutcomeStatus,
    pub result_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerOutcome {
    pub job_id: u64,
    pub indexer_id: i64,
    pub outcome: SearchOutcomeStatus,
    pub added_count: usize,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
