//! Invisible-content normalization.
//!
//! Attackers split classifier tokens with characters that render as nothing
//! (zero-width joiners, bidi controls, combining marks, soft hyphens) or hide
//! text behind HTML entities. Everything here runs before forwarding
//! detection so later regex passes see plain text.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref HTML_ENTITY: Regex =
        Regex::new(r"&(?:#(\d{1,7})|#[xX]([0-9A-Fa-f]{1,6})|([a-zA-Z][a-zA-Z0-9]*));").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscationTechnique {
    HtmlEntities,
    SoftHyphens,
    ZeroWidthCharacters,
    BidirectionalOverride,
    SpaceVariants,
    CombiningCharacters,
}

#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub original: String,
    pub normalized: String,
    pub obfuscation_indicators: Vec<ObfuscationTechnique>,
}

impl NormalizedText {
    pub fn is_obfuscated(&self) -> bool {
        self.obfuscation_indicators
            .iter()
            .any(|t| !matches!(t, ObfuscationTechnique::HtmlEntities))
    }
}

fn named_entity(name: &str) -> Option<&'static str> {
    let decoded = match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => "\u{00A0}",
        "shy" => "\u{00AD}",
        "ensp" => "\u{2002}",
        "emsp" => "\u{2003}",
        "thinsp" => "\u{2009}",
        "hairsp" => "\u{200A}",
        "zwnj" => "\u{200C}",
        "zwj" => "\u{200D}",
        "lrm" => "\u{200E}",
        "rlm" => "\u{200F}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201C}",
        "rdquo" => "\u{201D}",
        "bull" => "\u{2022}",
        "hellip" => "\u{2026}",
        "middot" => "\u{00B7}",
        "laquo" => "\u{00AB}",
        "raquo" => "\u{00BB}",
        "copy" => "\u{00A9}",
        "reg" => "\u{00AE}",
        "trade" => "\u{2122}",
        "euro" => "\u{20AC}",
        "pound" => "\u{00A3}",
        "yen" => "\u{00A5}",
        "cent" => "\u{00A2}",
        _ => return None,
    };
    Some(decoded)
}

fn decode_entities_once(text: &str) -> String {
    HTML_ENTITY
        .replace_all(text, |caps: &Captures| {
            let code = if let Some(decimal) = caps.get(1) {
                decimal.as_str().parse::<u32>().ok()
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16).ok()
            } else {
                None
            };

            if let Some(ch) = code.filter(|c| *c != 0).and_then(char::from_u32) {
                return ch.to_string();
            }
            if let Some(named) = caps.get(3).and_then(|n| named_entity(n.as_str())) {
                return named.to_string();
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Decode HTML entities until the text stops changing, so `&amp;lt;` ends up as `<`.
pub fn decode_html_entities(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let decoded = decode_entities_once(&current);
        if decoded == current {
            return current;
        }
        current = decoded;
    }
}

pub fn is_zero_width(ch: char) -> bool {
    matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}

/// Bidi controls and other invisible formatting code points.
pub fn is_format_control(ch: char) -> bool {
    matches!(
        ch,
        '\u{061C}'
            | '\u{180E}'
            | '\u{200E}'
            | '\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
    )
}

pub fn is_space_variant(ch: char) -> bool {
    matches!(
        ch,
        '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}'
    )
}

pub fn is_combining_mark(ch: char) -> bool {
    matches!(
        ch as u32,
        0x0300..=0x036F
            | 0x0483..=0x0489
            | 0x115F
            | 0x1160
            | 0x1AB0..=0x1AFF
            | 0x1DC0..=0x1DFF
            | 0x20D0..=0x20FF
    )
}

/// Soft hyphens glued between two visible characters become a space so the
/// halves stay separate tokens; any other soft hyphen is dropped.
fn resolve_soft_hyphens(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());

    for (i, &ch) in chars.iter().enumerate() {
        if ch != '\u{00AD}' {
            result.push(ch);
            continue;
        }
        let before = i.checked_sub(1).map(|p| chars[p]);
        let after = chars.get(i + 1).copied();
        let joins_words = matches!(before, Some(b) if !b.is_whitespace())
            && matches!(after, Some(a) if !a.is_whitespace());
        if joins_words {
            result.push(' ');
        }
    }

    result
}

fn collapse_spaces(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut previous_space = false;
    for ch in text.chars() {
        if ch == ' ' {
            if !previous_space {
                result.push(ch);
            }
            previous_space = true;
        } else {
            result.push(ch);
            previous_space = false;
        }
    }
    result
}

fn normalize_pass(text: &str) -> String {
    let decoded = decode_html_entities(text);
    let hyphen_resolved = resolve_soft_hyphens(&decoded);

    let stripped: String = hyphen_resolved
        .chars()
        .filter(|&ch| !is_zero_width(ch) && !is_format_control(ch) && !is_combining_mark(ch))
        .map(|ch| if is_space_variant(ch) { ' ' } else { ch })
        .collect();

    collapse_spaces(&stripped)
}

/// Strip invisible Unicode and decode entities.
///
/// Total, never longer than the input (in chars), and idempotent: passes are
/// repeated until the text is stable because removing a mark can expose a
/// fresh entity.
pub fn normalize_invisible(text: &str) -> String {
    let mut current = normalize_pass(text);
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

pub struct InvisibleNormalizer;

impl InvisibleNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, text: &str) -> NormalizedText {
        NormalizedText {
            original: text.to_string(),
            normalized: normalize_invisible(text),
            obfuscation_indicators: self.detect_techniques(text),
        }
    }

    fn detect_techniques(&self, text: &str) -> Vec<ObfuscationTechnique> {
        let mut techniques = Vec::new();

        if HTML_ENTITY.is_match(text) {
            techniques.push(ObfuscationTechnique::HtmlEntities);
        }
        if text.contains('\u{00AD}') {
            techniques.push(ObfuscationTechnique::SoftHyphens);
        }
        if text.chars().any(is_zero_width) {
            techniques.push(ObfuscationTechnique::ZeroWidthCharacters);
        }
        if text.chars().any(is_format_control) {
            techniques.push(ObfuscationTechnique::BidirectionalOverride);
        }
        if text.chars().any(is_space_variant) {
            techniques.push(ObfuscationTechnique::SpaceVariants);
        }
        if text.chars().any(is_combining_mark) {
            techniques.push(ObfuscationTechnique::CombiningCharacters);
        }

        techniques
    }
}

impl Default for InvisibleNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_decoding() {
        assert_eq!(decode_html_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(decode_html_entities("&#80;&#x61;y"), "Pay");
        assert_eq!(decode_html_entities("&amp;lt;b&amp;gt;"), "<b>");
        assert_eq!(decode_html_entities("&unknown; &#0;"), "&unknown; &#0;");
    }

    #[test]
    fn test_zero_width_and_bidi_removed() {
        assert_eq!(normalize_invisible("pa\u{200B}ss\u{200D}word"), "password");
        assert_eq!(normalize_invisible("ver\u{202E}ify\u{2066}"), "verify");
        assert_eq!(normalize_invisible("\u{FEFF}login"), "login");
    }

    #[test]
    fn test_soft_hyphen_handling() {
        assert_eq!(normalize_invisible("ac\u{00AD}count"), "ac count");
        assert_eq!(normalize_invisible("end\u{00AD} start"), "end start");
        assert_eq!(normalize_invisible("\u{00AD}lead"), "lead");
    }

    #[test]
    fn test_space_variants_collapse() {
        assert_eq!(
            normalize_invisible("urgent\u{00A0}\u{2003}action\u{202F}now"),
            "urgent action now"
        );
        assert_eq!(normalize_invisible("a    b"), "a b");
    }

    #[test]
    fn test_combining_marks_removed() {
        assert_eq!(normalize_invisible("pa\u{0301}y\u{0336}pal"), "paypal");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "Hello &amp;amp; world",
            "ba\u{00AD}nk \u{200B}  acc\u{0300}ount",
            "&am\u{0301}p; split entity",
            "plain text stays plain",
            "",
        ];
        for sample in samples {
            let once = normalize_invisible(sample);
            assert_eq!(normalize_invisible(&once), once, "input: {sample:?}");
        }
    }

    #[test]
    fn test_never_longer_than_input() {
        let samples = ["&#x200B;&nbsp;&nbsp;x", "a\u{00AD}b", "  many   spaces  "];
        for sample in samples {
            assert!(normalize_invisible(sample).chars().count() <= sample.chars().count());
        }
    }

    #[test]
    fn test_detects_techniques() {
        let normalizer = InvisibleNormalizer::new();
        let result = normalizer.normalize("cl\u{200B}ick &amp; ve\u{202E}rify");
        assert!(result.is_obfuscated());
        assert!(result
            .obfuscation_indicators
            .contains(&ObfuscationTechnique::ZeroWidthCharacters));
        assert!(result
            .obfuscation_indicators
            .contains(&ObfuscationTechnique::BidirectionalOverride));

        let clean = normalizer.normalize("nothing to see");
        assert!(clean.obfuscation_indicators.is_empty());
    }
}
