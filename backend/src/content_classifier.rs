//! C5: derive a `ContentType` from a search request, and map content types
//! to their default Torznab category set. Short-circuit rule cascade, no
//! third-party NLP — `str::contains` over fixed keyword sets, the way the
//! category tables in `indexer::categories` are hand-maintained.

use crate::db::models::{ContentType, TorznabSearchRequest};
use crate::indexer::categories::cats;

const AUDIOBOOK_TOKENS: &[&str] = &["unabridged", "m4b", "audiobook"];
const COMIC_TOKENS: &[&str] = &["cbr", "cbz"];
const EDUCATION_TOKENS: &[&str] = &["udemy", "lynda", "tutorial", "pluralsight", "masterclass"];
const XXX_TOKENS: &[&str] = &["xxx", "jav", "brazzers"];
const GAME_APP_TOKENS: &[&str] = &["keygen", "crack", "repack", "codex", "plaza", "skidrow", "fitgirl"];
const MUSIC_TOKENS: &[&str] = &["flac", "mp3", "320kbps", "v0", "discography"];
const MAGAZINE_TOKENS: &[&str] = &["magazine", "digital edition"];
const BOOK_TOKENS: &[&str] = &["epub", "mobi", "azw3", "retail"];

/// Rules 1-4 of §4.5, evaluated in order; the first match wins.
pub fn classify(req: &TorznabSearchRequest) -> ContentType {
    if req.season.is_some() || req.episode.is_some() || req.tvdb_id.as_deref().is_some_and(|s| !s.is_empty()) {
        return ContentType::TvShow;
    }

    if req.imdb_id.as_deref().is_some_and(|s| !s.is_empty()) {
        return ContentType::Movie;
    }

    if let Some(query) = req.query.as_deref() {
        if let Some(classified) = classify_release_name(query) {
            return classified;
        }
    }

    ContentType::Unknown
}

/// Heuristic release-name parser: lowercase once, test ordered keyword
/// sets. Returns `None` when nothing matches strongly enough to commit.
fn classify_release_name(query: &str) -> Option<ContentType> {
    let lower = query.to_lowercase();

    if contains_any(&lower, AUDIOBOOK_TOKENS) {
        return Some(ContentType::Audiobook);
    }
    if contains_any(&lower, COMIC_TOKENS) {
        return Some(ContentType::Comic);
    }
    if contains_any(&lower, EDUCATION_TOKENS) {
        return Some(ContentType::Education);
    }
    if contains_any(&lower, XXX_TOKENS) {
        return Some(ContentType::Xxx);
    }
    if contains_any(&lower, MUSIC_TOKENS) {
        return Some(ContentType::Music);
    }
    if contains_any(&lower, MAGAZINE_TOKENS) {
        return Some(ContentType::Magazine);
    }
    if contains_any(&lower, BOOK_TOKENS) {
        return Some(ContentType::Book);
    }
    if contains_any(&lower, GAME_APP_TOKENS) {
        // Release-group conventions overlap between apps and games; without
        // a platform hint this core can't distinguish further, so it falls
        // to the broader `app` bucket and lets callers narrow by category.
        return Some(ContentType::App);
    }

    None
}

fn contains_any(haystack: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|t| haystack.contains(t))
}

/// Fixed content-type -> default category table (§4.5); `unknown` maps to
/// the broad Movies+TV set so a classifier miss still searches something
/// sensible.
pub fn default_categories(content_type: ContentType) -> Vec<i32> {
    match content_type {
        ContentType::Movie => vec![cats::MOVIES],
        ContentType::TvShow | ContentType::TvDaily => vec![cats::TV],
        ContentType::Music => vec![cats::AUDIO],
        ContentType::Audiobook => vec![cats::AUDIO_AUDIOBOOK],
        ContentType::Book => vec![cats::BOOKS_EBOOK],
        ContentType::Comic => vec![cats::BOOKS_COMICS],
        ContentType::Magazine => vec![cats::BOOKS_MAGS],
        ContentType::Education => vec![cats::OTHER],
        ContentType::App => vec![cats::PC],
        ContentType::Game => vec![cats::CONSOLE, cats::PC_GAMES],
        ContentType::Xxx => vec![cats::XXX],
        ContentType::Unknown => vec![cats::MOVIES, cats::TV],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> TorznabSearchRequest {
        TorznabSearchRequest::default()
    }

    #[test]
    fn season_present_classifies_as_tvshow() {
        let mut req = base_request();
        req.season = Some(3);
        assert_eq!(classify(&req), ContentType::TvShow);
    }

    #[test]
    fn tvdb_id_classifies_as_tvshow_even_without_season() {
        let mut req = base_request();
        req.tvdb_id = Some("12345".to_string());
        assert_eq!(classify(&req), ContentType::TvShow);
    }

    #[test]
    fn imdb_id_wins_over_query_heuristics_per_rule_order() {
        let mut req = base_request();
        req.imdb_id = Some("tt1160419".to_string());
        req.query = Some("Some.Album.2021.FLAC".to_string());
        assert_eq!(classify(&req), ContentType::Movie);
    }

    #[test]
    fn flac_query_classifies_as_music() {
        let mut req = base_request();
        req.query = Some("Artist - Album (2021) [FLAC]".to_string());
        assert_eq!(classify(&req), ContentType::Music);
    }

    #[test]
    fn cbz_query_classifies_as_comic() {
        let mut req = base_request();
        req.query = Some("Some Comic 001 (2020).cbz".to_string());
        assert_eq!(classify(&req), ContentType::Comic);
    }

    #[test]
    fn no_signal_classifies_as_unknown() {
        let mut req = base_request();
        req.query = Some("Some Generic Title".to_string());
        assert_eq!(classify(&req), ContentType::Unknown);
    }

    #[test]
    fn unknown_maps_to_movies_and_tv() {
        let cats = default_categories(ContentType::Unknown);
        assert!(cats.contains(&crate::indexer::categories::cats::MOVIES));
        assert!(cats.contains(&crate::indexer::categories::cats::TV));
    }
}
