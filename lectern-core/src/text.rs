//! Text normalisation shared by every rule table.
//!
//! Rule patterns are written against one canonical form: NFKD-decomposed,
//! combining marks and invisible formatting characters removed, common
//! Cyrillic/Greek lookalikes folded to ASCII, typographic quotes and dashes
//! straightened, whitespace collapsed, lower-cased. A second "squeezed" form
//! keeps only ASCII letters and digits, which defeats separator obfuscation
//! such as `s.o.l.u.t.i.o.n`; matches in it only count when they begin and end
//! on word boundaries of the normalised text.

use unicode_normalization::UnicodeNormalization;

/// Normalise text into the canonical form matched by rule tables.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .filter(|c| !is_zero_width_char(*c))
        .map(|c| homoglyph_to_ascii(c).unwrap_or(c))
        .collect();

    let mut result = String::with_capacity(folded.len());
    let mut prev_space = false;
    for c in folded.chars() {
        if c.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
        } else {
            result.extend(c.to_lowercase());
            prev_space = false;
        }
    }
    result.trim().to_string()
}

/// Keep only ASCII letters and digits of already-normalised text.
pub fn squeeze(normalized: &str) -> String {
    normalized
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Byte offsets in the squeezed form where each normalised word starts and ends.
///
/// A word is a maximal run of ASCII letters and digits, so the offsets line up
/// with [`squeeze`] output.
pub fn squeezed_word_bounds(normalized: &str) -> (Vec<usize>, Vec<usize>) {
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let mut len = 0;
    let mut in_word = false;
    for c in normalized.chars() {
        if c.is_ascii_alphanumeric() {
            if !in_word {
                starts.push(len);
                in_word = true;
            }
            len += 1;
        } else if in_word {
            ends.push(len);
            in_word = false;
        }
    }
    if in_word {
        ends.push(len);
    }
    (starts, ends)
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Truncate to at most `max_words` words, cutting at a word boundary.
///
/// Returns the text unchanged when it is already short enough. Line breaks
/// inside the kept prefix are preserved.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    if word_count(text) <= max_words {
        return text.to_string();
    }
    if max_words == 0 {
        return String::new();
    }
    let mut seen = 0usize;
    let mut in_word = false;
    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_word {
                in_word = false;
                if seen == max_words {
                    let kept = text[..idx].trim_end();
                    return format!("{kept}…");
                }
            }
        } else if !in_word {
            in_word = true;
            seen += 1;
        }
    }
    text.to_string()
}

/// Map a confusable character to its ASCII equivalent.
///
/// Full-width forms are already decomposed by NFKD; this covers the Cyrillic
/// and Greek letters that NFKD leaves alone, plus typographic punctuation.
fn homoglyph_to_ascii(c: char) -> Option<char> {
    match c {
        // Cyrillic lowercase
        '\u{0430}' => Some('a'),
        '\u{0441}' => Some('c'),
        '\u{0435}' => Some('e'),
        '\u{043E}' => Some('o'),
        '\u{0440}' => Some('p'),
        '\u{0443}' => Some('y'),
        '\u{0445}' => Some('x'),
        '\u{0456}' => Some('i'),
        '\u{0455}' => Some('s'),
        // Cyrillic uppercase
        '\u{0410}' => Some('A'),
        '\u{0412}' => Some('B'),
        '\u{0421}' => Some('C'),
        '\u{0415}' => Some('E'),
        '\u{041D}' => Some('H'),
        '\u{041A}' => Some('K'),
        '\u{041C}' => Some('M'),
        '\u{041E}' => Some('O'),
        '\u{0420}' => Some('P'),
        '\u{0422}' => Some('T'),
        '\u{0425}' => Some('X'),
        // Greek
        '\u{03B1}' => Some('a'),
        '\u{03B5}' => Some('e'),
        '\u{03BF}' => Some('o'),
        '\u{03C1}' => Some('p'),
        '\u{03C5}' => Some('u'),
        '\u{03B9}' => Some('i'),
        '\u{03BA}' => Some('k'),
        '\u{03BD}' => Some('v'),
        '\u{03C4}' => Some('t'),
        '\u{0391}' => Some('A'),
        '\u{0392}' => Some('B'),
        '\u{0395}' => Some('E'),
        '\u{0397}' => Some('H'),
        '\u{0399}' => Some('I'),
        '\u{039A}' => Some('K'),
        '\u{039C}' => Some('M'),
        '\u{039D}' => Some('N'),
        '\u{039F}' => Some('O'),
        '\u{03A1}' => Some('P'),
        '\u{03A4}' => Some('T'),
        '\u{03A5}' => Some('Y'),
        '\u{03A7}' => Some('X'),
        '\u{0396}' => Some('Z'),
        // Typographic quotes and dashes
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{2032}' => Some('\''),
        '\u{201C}' | '\u{201D}' | '\u{201F}' => Some('"'),
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' => Some('-'),
        _ => None,
    }
}

fn is_zero_width_char(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'                      // Soft hyphen
            | '\u{200B}'..='\u{200F}'   // Zero-width space/joiners, LRM/RLM
            | '\u{202A}'..='\u{202E}'   // Bidi embeddings and overrides
            | '\u{2060}'..='\u{2064}'   // Word joiner, invisible operators
            | '\u{2066}'..='\u{2069}'   // Bidi isolates
            | '\u{FEFF}' // BOM
    )
}
