//! Text normalization for streamed fragments
//!
//! Streaming endpoints interleave typographic Unicode (curly quotes, long
//! dashes, exotic spaces) that downstream comparison logic does not want.
//! Fragments are NFC-composed and then mapped through a fixed table of ASCII
//! stand-ins before being appended to the transcript buffer.

use unicode_normalization::UnicodeNormalization;

/// Typographic characters and their ASCII stand-ins
const REPLACEMENTS: [(char, &str); 26] = [
    // Quotation marks
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    // Dashes
    ('\u{2012}', "-"),
    ('\u{2013}', "-"),
    ('\u{2014}', "-"),
    ('\u{2015}', "-"),
    // Spaces
    ('\u{00A0}', " "),
    ('\u{2000}', " "),
    ('\u{2001}', " "),
    ('\u{2002}', " "),
    ('\u{2003}', " "),
    ('\u{2004}', " "),
    ('\u{2005}', " "),
    ('\u{2006}', " "),
    ('\u{2007}', " "),
    ('\u{2008}', " "),
    ('\u{2009}', " "),
    ('\u{200A}', " "),
    ('\u{202F}', " "),
    ('\u{205F}', " "),
    ('\u{3000}', " "),
    // Ellipsis
    ('\u{2026}', "..."),
    // Primes
    ('\u{2032}', "'"),
    ('\u{2033}', "\""),
];

/// Bullet characters collapsed to an asterisk
const BULLETS: [char; 4] = ['\u{2022}', '\u{2023}', '\u{25E6}', '\u{2043}'];

/// Normalizes streamed text fragments to plain ASCII punctuation
#[derive(Debug, Clone, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// NFC-compose the fragment and replace typographic characters
    pub fn normalize(&self, fragment: &str) -> String {
        let composed: String = fragment.nfc().collect();
        let mut output = String::with_capacity(composed.len());
        for ch in composed.chars() {
            if let Some((_, replacement)) =
                REPLACEMENTS.iter().find(|(from, _)| *from == ch)
            {
                output.push_str(replacement);
            } else if BULLETS.contains(&ch) {
                output.push('*');
            } else {
                output.push(ch);
            }
        }
        output
    }
}
