//! Torznab category constants
//!
//! Standard Torznab categories follow the Newznab numbering scheme.
//! Main categories are in thousands (1000, 2000, etc.) and subcategories
//! add tens (2010, 2020, etc.). Only the constants the content classifier
//! actually maps content types onto are kept here.
pub mod cats {
    // Main categories
    pub const CONSOLE: i32 = 1000;
    pub const MOVIES: i32 = 2000;
    pub const AUDIO: i32 = 3000;
    pub const PC: i32 = 4000;
    pub const TV: i32 = 5000;
    pub const XXX: i32 = 6000;
    pub const OTHER: i32 = 8000;

    // Subcategories
    pub const AUDIO_AUDIOBOOK: i32 = 3030;
    pub const BOOKS_MAGS: i32 = 7010;
    pub const BOOKS_EBOOK: i32 = 7020;
    pub const BOOKS_COMICS: i32 = 7030;
    pub const PC_GAMES: i32 = 4050;
}
