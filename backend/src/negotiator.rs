//! C3: per-indexer capability negotiation, plus the small internal
//! Torznab/Newznab RSS reader that turns indexer XML into `ReleaseInfo`
//! values for the scheduler's `ExecFn` to return (§4.3).
//!
//! Negotiation itself is a pure function of `(backend, capabilities, mode,
//! params, meta.original_query)` — no I/O, no locking. The XML reader lives
//! here because both are backend-quirk-handling code, not because parsing
//! is part of the four negotiation rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::db::models::{IndexerBackend, ParamMap, ReleaseInfo, SearchMeta, SearchMode, TorznabIndexer};

const ID_PARAMS: &[&str] = &[
    "imdbid", "tmdbid", "tvdbid", "tvmazeid", "traktid", "doubanid", "genre",
];

/// Rewrite `params` into the map the indexer will actually accept (§4.3).
/// Order matters: the Prowlarr year workaround runs before ID pruning so
/// that a query rewritten with `year` still benefits from the fallback in
/// step 3 if pruning empties `q` again.
pub fn negotiate(
    indexer: &TorznabIndexer,
    mode: SearchMode,
    mut params: ParamMap,
    meta: &SearchMeta,
) -> ParamMap {
    apply_prowlarr_year_workaround(indexer, mode, &mut params);
    let any_id_dropped = prune_unsupported_ids(indexer, mode, &mut params);
    restore_query_if_all_ids_dropped(&mut params, any_id_dropped, meta);
    params
}

fn apply_prowlarr_year_workaround(indexer: &TorznabIndexer, mode: SearchMode, params: &mut ParamMap) {
    if indexer.backend != IndexerBackend::Prowlarr {
        return;
    }
    let Some(year) = params.remove("year") else {
        return;
    };
    let year_cap = format!("{}-search-year", mode.capability_prefix());
    if indexer.has_capability(&year_cap) {
        // Advertised directly; leave the parameter untouched.
        params.insert("year".to_string(), year);
        return;
    }
    match params.get_mut("q") {
        Some(q) if !q.trim().is_empty() => {
            q.push(' ');
            q.push_str(&year);
        }
        _ => {
            params.insert("q".to_string(), year);
        }
    }
}

/// Returns true if at least one ID parameter was present before pruning and
/// all of them ended up removed.
fn prune_unsupported_ids(indexer: &TorznabIndexer, mode: SearchMode, params: &mut ParamMap) -> bool {
    let applicable = applicable_id_params(mode);
    let mut had_ids = false;
    let mut any_survived = false;

    for &id_param in ID_PARAMS {
        if !params.contains_key(id_param) {
            continue;
        }
        had_ids = true;

        if !applicable.contains(&id_param) {
            params.remove(id_param);
            continue;
        }

        let cap = format!("{}-search-{}", mode.capability_prefix(), id_param);
        if indexer.has_capability(&cap) {
            any_survived = true;
        } else {
            params.remove(id_param);
        }
    }

    had_ids && !any_survived
}

/// IDs that make sense for a given search mode (§4.3 rule 4: e.g. `tvdbid`
/// under a `movie` search is never applicable, regardless of capability).
fn applicable_id_params(mode: SearchMode) -> &'static [&'static str] {
    match mode {
        SearchMode::Movie => &["imdbid", "tmdbid", "traktid", "doubanid", "genre"],
        SearchMode::TvSearch => &["imdbid", "tmdbid", "tvdbid", "tvmazeid", "traktid", "doubanid", "genre"],
        SearchMode::Search => &[],
    }
}

fn restore_query_if_all_ids_dropped(params: &mut ParamMap, all_ids_dropped: bool, meta: &SearchMeta) {
    if !all_ids_dropped {
        return;
    }
    let q_is_empty = params.get("q").map(|q| q.trim().is_empty()).unwrap_or(true);
    if !q_is_empty {
        return;
    }
    if let Some(original) = &meta.original_query {
        if !original.trim().is_empty() {
            params.insert("q".to_string(), original.clone());
        }
    }
}

/// Build the GET query params for the wire request (§6). `offset` is
/// deliberately never emitted even though the request struct carries it.
pub fn build_wire_params(req: &crate::db::models::TorznabSearchRequest) -> ParamMap {
    let mut params = BTreeMap::new();
    params.insert("t".to_string(), req.mode.wire_value().to_string());

    if let Some(q) = &req.query {
        if !q.is_empty() {
            params.insert("q".to_string(), q.clone());
        }
    }
    if !req.categories.is_empty() {
        let cats = req
            .categories
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        params.insert("cat".to_string(), cats);
    }
    if let Some(imdb) = &req.imdb_id {
        params.insert("imdbid".to_string(), imdb.trim_start_matches("tt").to_string());
    }
    if let Some(v) = &req.tvdb_id {
        params.insert("tvdbid".to_string(), v.clone());
    }
    if let Some(v) = &req.tmdb_id {
        params.insert("tmdbid".to_string(), v.clone());
    }
    if let Some(v) = &req.tvmaze_id {
        params.insert("tvmazeid".to_string(), v.clone());
    }
    if let Some(v) = &req.trakt_id {
        params.insert("traktid".to_string(), v.clone());
    }
    if let Some(v) = &req.douban_id {
        params.insert("doubanid".to_string(), v.clone());
    }
    if let Some(v) = &req.genre {
        params.insert("genre".to_string(), v.clone());
    }
    if let Some(season) = req.season {
        params.insert("season".to_string(), season.to_string());
    }
    if let Some(ep) = &req.episode {
        params.insert("ep".to_string(), ep.clone());
    }
    if let Some(year) = req.year {
        params.insert("year".to_string(), year.to_string());
    }
    if let Some(limit) = req.limit {
        params.insert("limit".to_string(), limit.to_string());
    }
    // req.offset intentionally not transmitted.
    params
}

/// Streaming Torznab/Newznab RSS reader: `<item>` elements plus their
/// `<enclosure>` and `torznab:attr`/`newznab:attr` children. Pure
/// `&str -> Vec<ReleaseInfo>`, no I/O, no DOM tree.
pub fn parse_search_response(xml: &str, indexer_id: i64, indexer_name: &str) -> anyhow::Result<Vec<ReleaseInfo>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut releases = Vec::new();
    let mut buf = Vec::new();

    let mut in_item = false;
    let mut current_tag: Option<String> = None;
    let mut title = String::new();
    let mut guid = String::new();
    let mut link: Option<String> = None;
    let mut pub_date: Option<String> = None;
    let mut attrs: BTreeMap<String, String> = BTreeMap::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" {
                    in_item = true;
                    title.clear();
                    guid.clear();
                    link = None;
                    pub_date = None;
                    attrs.clear();
                } else if in_item {
                    current_tag = Some(name);
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if !in_item {
                    continue;
                }
                if name == "enclosure" {
                    for a in e.attributes().flatten() {
                        if a.key.as_ref() == b"url" {
                            link = Some(String::from_utf8_lossy(&a.value).to_string());
                        }
                    }
                } else if name == "torznab:attr" || name == "newznab:attr" {
                    let mut attr_name = None;
                    let mut attr_value = None;
                    for a in e.attributes().flatten() {
                        match a.key.as_ref() {
                            b"name" => attr_name = Some(String::from_utf8_lossy(&a.value).to_string()),
                            b"value" => attr_value = Some(String::from_utf8_lossy(&a.value).to_string()),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(value)) = (attr_name, attr_value) {
                        attrs.insert(name, value);
                    }
                }
            }
            Event::Text(e) => {
                if !in_item {
                    continue;
                }
                let text = e.unescape()?.into_owned();
                match current_tag.as_deref() {
                    Some("title") => title = text,
                    Some("guid") => guid = text,
                    Some("link") => link.get_or_insert(text),
                    Some("pubDate") => pub_date = Some(text),
                    _ => {}
                };
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" {
                    in_item = false;
                    releases.push(release_from_fields(
                        &title, &guid, link.take(), pub_date.take(), &attrs, indexer_id, indexer_name,
                    ));
                } else if current_tag.as_deref() == Some(name.as_str()) {
                    current_tag = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(releases)
}

fn release_from_fields(
    title: &str,
    guid: &str,
    link: Option<String>,
    pub_date: Option<String>,
    attrs: &BTreeMap<String, String>,
    indexer_id: i64,
    indexer_name: &str,
) -> ReleaseInfo {
    let publish_date = pub_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let categories = attrs
        .get("category")
        .map(|c| c.split(',').filter_map(|s| s.trim().parse::<i32>().ok()).collect())
        .unwrap_or_default();

    ReleaseInfo {
        title: title.to_string(),
        guid: guid.to_string(),
        link: link.clone(),
        magnet_uri: attrs.get("magneturl").cloned(),
        info_hash: attrs.get("infohash").cloned(),
        publish_date,
        categories,
        size: attrs
            .get("size")
            .and_then(|s| s.parse().ok())
            .or_else(|| attrs.get("length").and_then(|s| s.parse().ok())),
        seeders: attrs.get("seeders").and_then(|s| s.parse().ok()),
        peers: attrs.get("peers").and_then(|s| s.parse().ok()),
        indexer_id: Some(indexer_id),
        indexer_name: Some(indexer_name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{TorznabCategoryEntry};

    fn indexer(backend: IndexerBackend, caps: &[&str]) -> TorznabIndexer {
        TorznabIndexer {
            id: 1,
            name: "test".to_string(),
            backend,
            base_url: "https://example.test".to_string(),
            api_key_encrypted: None,
            enabled: true,
            priority: 0,
            timeout_seconds: 30,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            categories: Vec::<TorznabCategoryEntry>::new(),
        }
    }

    #[test]
    fn prowlarr_year_workaround_appends_year_and_drops_param() {
        let idx = indexer(IndexerBackend::Prowlarr, &["movie-search"]);
        let mut params = BTreeMap::new();
        params.insert("t".to_string(), "movie".to_string());
        params.insert("q".to_string(), "The Matrix".to_string());
        params.insert("year".to_string(), "1999".to_string());
        params.insert("cat".to_string(), "2000".to_string());

        let meta = SearchMeta::default();
        let out = negotiate(&idx, SearchMode::Movie, params, &meta);

        assert_eq!(out.get("q").unwrap(), "The Matrix 1999");
        assert!(!out.contains_key("year"));
        assert_eq!(out.get("cat").unwrap(), "2000");
    }

    #[test]
    fn prowlarr_year_left_alone_when_capability_advertised() {
        let idx = indexer(IndexerBackend::Prowlarr, &["movie-search", "movie-search-year"]);
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), "Dune".to_string());
        params.insert("year".to_string(), "2021".to_string());

        let out = negotiate(&idx, SearchMode::Movie, params, &SearchMeta::default());
        assert_eq!(out.get("year").unwrap(), "2021");
        assert_eq!(out.get("q").unwrap(), "Dune");
    }

    #[test]
    fn unsupported_id_params_are_dropped() {
        let idx = indexer(IndexerBackend::Jackett, &["movie-search"]);
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), "Dune".to_string());
        params.insert("imdbid".to_string(), "tt1160419".to_string());

        let out = negotiate(&idx, SearchMode::Movie, params, &SearchMeta::default());
        assert!(!out.contains_key("imdbid"));
    }

    #[test]
    fn all_ids_dropped_restores_original_query() {
        let idx = indexer(IndexerBackend::Jackett, &["movie-search"]);
        let mut params = BTreeMap::new();
        params.insert("imdbid".to_string(), "tt1160419".to_string());

        let meta = SearchMeta {
            original_query: Some("Dune 2021".to_string()),
            ..Default::default()
        };
        let out = negotiate(&idx, SearchMode::Movie, params, &meta);
        assert_eq!(out.get("q").unwrap(), "Dune 2021");
    }

    #[test]
    fn tvdbid_under_movie_search_is_unconditionally_dropped() {
        let idx = indexer(IndexerBackend::Jackett, &["movie-search", "movie-search-tvdbid"]);
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), "Dune".to_string());
        params.insert("tvdbid".to_string(), "12345".to_string());

        let out = negotiate(&idx, SearchMode::Movie, params, &SearchMeta::default());
        assert!(!out.contains_key("tvdbid"));
    }

    #[test]
    fn parses_torznab_items_with_attrs() {
        let xml = r#"<?xml version="1.0"?>
<rss><channel>
<item>
  <title>Dune 2021 2160p</title>
  <guid>https://example.test/123</guid>
  <enclosure url="https://example.test/dl/123.torrent" length="1000" />
  <torznab:attr name="seeders" value="42" />
  <torznab:attr name="peers" value="50" />
  <torznab:attr name="category" value="2040,2045" />
</item>
</channel></rss>"#;
        let releases = parse_search_response(xml, 7, "MyIndexer").unwrap();
        assert_eq!(releases.len(), 1);
        let r = &releases[0];
        assert_eq!(r.title, "Dune 2021 2160p");
        assert_eq!(r.seeders, Some(42));
        assert_eq!(r.peers, Some(50));
        assert_eq!(r.categories, vec![2040, 2045]);
        assert_eq!(r.indexer_id, Some(7));
    }
}
