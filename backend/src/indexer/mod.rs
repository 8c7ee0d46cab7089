//! Torznab category tables shared by the content classifier (C5) and the
//! capability negotiator (C3). Indexer-specific scraping (Cardigann
//! definitions, RSS/Atom polling, native per-site adapters) is out of scope
//! for this core — it consumes a parser, it does not own one per indexer.

pub mod categories;
