//! Canonicalizer
//!
//! Final text cleanup before scoring. Boilerplate, tracking links and
//! identifiers correlate with the sending platform rather than intent, so
//! they are removed and the classifier only sees content words.
//!
//! Rules run in a fixed order; several assume earlier ones already ran
//! (symbol stripping expects entities decoded, the signature cut expects
//! newlines still present).

use crate::components::{apply_rules, TextRule};
use crate::normalization::{
    decode_html_entities, is_combining_mark, is_format_control, is_space_variant, is_zero_width,
};
use lazy_static::lazy_static;
use regex::Regex;

const MIN_CANONICAL_CHARS: usize = 5;
const MIN_CANONICAL_TOKENS: usize = 2;

/// Single-character tokens that still carry meaning.
const MEANINGFUL_SINGLE_CHARS: [&str; 2] = ["i", "a"];

lazy_static! {
    static ref RESIDUAL_ENTITY: Regex = Regex::new(r"(?i)&[a-z]+;|&#\d+;|&#x[0-9a-f]+;").unwrap();

    static ref CSS_BRACE_BLOCK: Regex = Regex::new(r"\w+\s*\{[^}]+\}").unwrap();
    static ref CSS_IMPORTANT: Regex =
        Regex::new(r"(?i)[a-z-]+\s*:\s*[^;{}\n]+\s*!important\s*;?").unwrap();
    static ref CSS_DECLARATION: Regex = Regex::new(r"(?i)[a-z-]+\s*:\s*[^;{}\n]+;").unwrap();

    static ref STRUCTURAL_SYMBOLS: Regex = Regex::new(r"[{}!;%@#~^*]").unwrap();
    static ref FORUM_PREFIX: Regex = Regex::new(r"(?i)\br/[a-z0-9_]+\b\s*:?\s*").unwrap();

    static ref BOILERPLATE: Vec<Regex> = vec![
        Regex::new(r"(?i)(?:view|read|open)\s+(?:this\s+)?(?:email|message|newsletter)\s+(?:in|on)\s+(?:your\s+)?(?:browser|web)").unwrap(),
        Regex::new(r"(?i)unsubscribe|manage\s+preferences|update\s+email|update\s+settings").unwrap(),
        Regex::new(r"(?i)click\s+here|tap\s+here").unwrap(),
        Regex::new(r"(?i)subscribe\s+to\s+our\s+newsletter|follow\s+us\s+on").unwrap(),
    ];

    static ref QUERY_URL: Regex = Regex::new(r"https?://\S+\?\S+").unwrap();
    static ref TRACKING_URL: Regex =
        Regex::new(r"(?i)https?://\S*(?:track|pixel|beacon|analytics|click)\S*").unwrap();

    static ref EMAIL_ADDRESS: Regex =
        Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap();

    static ref LONG_HEX: Regex = Regex::new(r"(?i)\b[a-f0-9]{32,}\b").unwrap();
    static ref LONG_BASE64: Regex = Regex::new(r"\b[A-Za-z0-9+/]{40,}={0,2}").unwrap();

    static ref SIGNATURE_STARTS: Vec<Regex> = vec![
        Regex::new(r"\n--[ \t]*(?:\n|$)").unwrap(),
        Regex::new(r"\n_{10,}").unwrap(),
        Regex::new(r"\n={10,}").unwrap(),
        Regex::new(r"(?i)\nbest regards").unwrap(),
        Regex::new(r"(?i)\nthanks").unwrap(),
        Regex::new(r"(?i)\nsent from").unwrap(),
    ];
    static ref RULE_LINE: Regex = Regex::new(r"[_=\-|\\/]{3,}").unwrap();
    static ref ELLIPSIS_RUN: Regex = Regex::new(r"\.{3,}").unwrap();
    static ref SENT_FROM_DEVICE: Regex = Regex::new(r"(?i)sent\s+from\s+my\s+\w+").unwrap();
    static ref INLINE_WROTE: Regex = Regex::new(r"(?i)\bon\s+[^\n]+?wrote:").unwrap();

    static ref LONG_NUMBER: Regex = Regex::new(r"\b\d{10,}\b").unwrap();
}

/// Extra combining marks (Hebrew, Arabic, Syriac, Thaana, NKo points and
/// Mongolian/Khmer fillers) removed on top of the normalizer's set.
fn is_extended_combining_mark(ch: char) -> bool {
    matches!(
        ch as u32,
        0x034F
            | 0x0591..=0x05BD
            | 0x05BF
            | 0x05C1
            | 0x05C2
            | 0x05C4
            | 0x05C5
            | 0x05C7
            | 0x0610..=0x061A
            | 0x064B..=0x065F
            | 0x0670
            | 0x06D6..=0x06DC
            | 0x06DF..=0x06E4
            | 0x06E7
            | 0x06E8
            | 0x06EA..=0x06ED
            | 0x0711
            | 0x0730..=0x074A
            | 0x07A6..=0x07B0
            | 0x07EB..=0x07F3
            | 0x17B4
            | 0x17B5
            | 0x180B..=0x180D
    )
}

fn decode_entities(text: &str) -> String {
    let decoded = decode_html_entities(text);
    RESIDUAL_ENTITY.replace_all(&decoded, " ").into_owned()
}

fn clean_invisible(text: &str) -> String {
    text.chars()
        .filter(|&ch| !is_combining_mark(ch) && !is_extended_combining_mark(ch))
        .map(|ch| {
            if is_zero_width(ch) || is_format_control(ch) || is_space_variant(ch) || ch == '\u{00AD}' {
                ' '
            } else {
                ch
            }
        })
        .collect()
}

fn strip_inline_css(text: &str) -> String {
    let text = CSS_BRACE_BLOCK.replace_all(text, " ");
    let text = CSS_IMPORTANT.replace_all(&text, " ");
    CSS_DECLARATION.replace_all(&text, " ").into_owned()
}

fn strip_structural_symbols(text: &str) -> String {
    STRUCTURAL_SYMBOLS.replace_all(text, " ").into_owned()
}

fn strip_forum_prefixes(text: &str) -> String {
    FORUM_PREFIX.replace_all(text, " ").into_owned()
}

fn strip_boilerplate(text: &str) -> String {
    BOILERPLATE.iter().fold(text.to_string(), |current, pattern| {
        pattern.replace_all(&current, " ").into_owned()
    })
}

fn strip_tracking_urls(text: &str) -> String {
    let text = QUERY_URL.replace_all(text, " ");
    TRACKING_URL.replace_all(&text, " ").into_owned()
}

fn redact_email_addresses(text: &str) -> String {
    EMAIL_ADDRESS.replace_all(text, " ").into_owned()
}

fn redact_encoded_tokens(text: &str) -> String {
    let text = LONG_HEX.replace_all(text, " ");
    LONG_BASE64.replace_all(&text, " ").into_owned()
}

/// Cut from the earliest signature marker to the end, then drop rule lines,
/// ellipsis runs and reply framing left inline.
fn strip_signatures(text: &str) -> String {
    let cut = SIGNATURE_STARTS
        .iter()
        .filter_map(|pattern| pattern.find(text).map(|m| m.start()))
        .min()
        .unwrap_or(text.len());

    let text = RULE_LINE.replace_all(&text[..cut], " ");
    let text = ELLIPSIS_RUN.replace_all(&text, " ");
    let text = SENT_FROM_DEVICE.replace_all(&text, " ");
    INLINE_WROTE.replace_all(&text, " ").into_owned()
}

fn redact_long_numbers(text: &str) -> String {
    LONG_NUMBER.replace_all(text, " ").into_owned()
}

/// Lowercase; marks produced by case mapping (e.g. `İ` → `i̇`) are dropped so
/// the text never grows.
fn lowercase(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|&ch| !is_combining_mark(ch))
        .collect()
}

pub const DEFAULT_RULES: [TextRule; 12] = [
    TextRule::new("entities", decode_entities),
    TextRule::new("invisible", clean_invisible),
    TextRule::new("inline_css", strip_inline_css),
    TextRule::new("structural_symbols", strip_structural_symbols),
    TextRule::new("forum_prefixes", strip_forum_prefixes),
    TextRule::new("boilerplate", strip_boilerplate),
    TextRule::new("tracking_urls", strip_tracking_urls),
    TextRule::new("email_addresses", redact_email_addresses),
    TextRule::new("encoded_tokens", redact_encoded_tokens),
    TextRule::new("signatures", strip_signatures),
    TextRule::new("long_numbers", redact_long_numbers),
    TextRule::new("lowercase", lowercase),
];

/// Collapse whitespace, drop one-letter noise tokens and reject text with
/// too little signal.
fn finalize_tokens(text: &str) -> String {
    let tokens: Vec<&str> = text
        .split_whitespace()
        .filter(|token| token.chars().count() > 1 || MEANINGFUL_SINGLE_CHARS.contains(token))
        .collect();
    let joined = tokens.join(" ");

    if joined.chars().count() < MIN_CANONICAL_CHARS || tokens.len() < MIN_CANONICAL_TOKENS {
        return String::new();
    }
    joined
}

pub struct Canonicalizer {
    rules: Vec<TextRule>,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }

    pub fn with_rules(rules: Vec<TextRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TextRule] {
        &self.rules
    }

    /// Deterministic text → text. Returns `""` when the result is degenerate.
    pub fn canonicalize(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }
        finalize_tokens(&apply_rules(&self.rules, text))
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new()
    }
}
