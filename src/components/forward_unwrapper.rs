//! Forwarding Unwrapper
//!
//! Users submit suspicious mail by forwarding it, so the interesting subject,
//! body and sender are the ones embedded in the forward. Detection is a
//! prioritized list of matchers; the first one that recognises the body wins.

use crate::components::{apply_rules, TextRule};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// Banners written by common mail clients, checked in this order.
pub const DEFAULT_FORWARD_MARKERS: [&str; 8] = [
    "---------- Forwarded message ---------",
    "---------- Forwarded message ----------",
    "------- Forwarded message -------",
    "Begin forwarded message:",
    "Forwarded by Gmail",
    "----Original Message----",
    "-----Original Message-----",
    "--- Forwarded message ---",
];

const EMAIL_PATTERN: &str = r"[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}";

lazy_static! {
    static ref FORWARD_PREFIX: Regex = Regex::new(r"(?i)^\s*fwd?\s*:\s*").unwrap();

    static ref HEADER_BLOCK: Regex = Regex::new(
        r"(?im)^[ \t]*from:[ \t]*\S[^\n]*\n(?:[^\n]+\n)*?[ \t]*subject:[ \t]*([^\n]*?)[ \t]*(?:\n|$)"
    )
    .unwrap();
    static ref BANNER_SUBJECT: Regex = Regex::new(r"(?i)\n\s*subject:[ \t]*([^\n]*?)[ \t]*(?:\n|$)").unwrap();

    static ref SENDER_CUES: Vec<Regex> = vec![
        Regex::new(&format!(r"(?i)from[:\s]+<?({EMAIL_PATTERN})>?")).unwrap(),
        Regex::new(&format!(r"(?i)forwarded\s+(?:message\s+)?from[:\s]+<?({EMAIL_PATTERN})>?")).unwrap(),
        Regex::new(&format!(r"(?i)originally\s+sent\s+by[:\s]+<?({EMAIL_PATTERN})>?")).unwrap(),
    ];
    static ref ANY_EMAIL: Regex = Regex::new(&format!(r"(?i)({EMAIL_PATTERN})")).unwrap();

    static ref FORWARDED_HEADER_LINE: Regex = Regex::new(
        r"(?mi)^[ \t]*(?:To|From|Date|Sent|Cc|Bcc|Subject|Reply-To|Delivered-To|Return-Path):[ \t]*.+$"
    )
    .unwrap();
    static ref WROTE_LINE: Regex = Regex::new(r"(?mi)^[ \t]*On[ \t]+.+?wrote:[ \t]*$").unwrap();
    static ref QUOTE_PREFIX_LINE: Regex = Regex::new(r"(?m)^[>|].*$").unwrap();
    static ref MOBILE_FOOTER: Regex =
        Regex::new(r"(?mi)^[ \t]*(?:Sent from my .+|Get Outlook for .+)$").unwrap();
}

/// Header fields consulted for the original sender, after body cues.
const SENDER_HEADERS: [&str; 2] = ["x-original-from", "in-reply-to"];

/// Remove a leading `Fwd:` / `Fw:` (repeated prefixes included).
pub fn strip_forward_prefix(subject: &str) -> String {
    let mut current = subject.trim();
    while let Some(found) = FORWARD_PREFIX.find(current) {
        current = current[found.end()..].trim_start();
    }
    current.to_string()
}

/// Resolve the sender of the embedded message: free-text cues in the body
/// first, then `X-Original-From`, then `In-Reply-To`. First hit wins.
pub fn find_original_sender(body: &str, headers: Option<&HashMap<String, String>>) -> Option<String> {
    for cue in SENDER_CUES.iter() {
        if let Some(caps) = cue.captures(body) {
            return Some(caps[1].to_lowercase());
        }
    }

    let headers = headers?;
    for name in SENDER_HEADERS {
        let value = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str());
        if let Some(caps) = value.and_then(|v| ANY_EMAIL.captures(v)) {
            return Some(caps[1].to_lowercase());
        }
    }

    None
}

fn strip_forwarded_headers(text: &str) -> String {
    FORWARDED_HEADER_LINE.replace_all(text, "").into_owned()
}

fn strip_wrote_lines(text: &str) -> String {
    WROTE_LINE.replace_all(text, "").into_owned()
}

fn strip_quote_lines(text: &str) -> String {
    QUOTE_PREFIX_LINE.replace_all(text, "").into_owned()
}

fn strip_mobile_footers(text: &str) -> String {
    MOBILE_FOOTER.replace_all(text, "").into_owned()
}

fn drop_blank_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

const FORWARDED_BODY_RULES: [TextRule; 5] = [
    TextRule::new("forwarded_headers", strip_forwarded_headers),
    TextRule::new("wrote_lines", strip_wrote_lines),
    TextRule::new("quote_lines", strip_quote_lines),
    TextRule::new("mobile_footers", strip_mobile_footers),
    TextRule::new("blank_lines", drop_blank_lines),
];

/// Tidy the recovered body: residual header lines, reply framing, quote
/// markers and blank lines go. Signatures are left for the canonicalizer.
pub fn clean_forwarded_body(text: &str) -> String {
    apply_rules(&FORWARDED_BODY_RULES, text)
}

#[derive(Debug, Clone, PartialEq)]
struct ForwardMatch {
    subject: Option<String>,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardMatcher {
    /// A `From:` line followed within the same block by a `Subject:` line.
    HeaderBlock,
    /// A client banner; the body starts after the next `Subject:` line.
    Banner(String),
}

impl ForwardMatcher {
    pub fn name(&self) -> String {
        match self {
            ForwardMatcher::HeaderBlock => "header_block".to_string(),
            ForwardMatcher::Banner(marker) => format!("banner({})", marker.trim()),
        }
    }

    fn try_unwrap(&self, text: &str) -> Option<ForwardMatch> {
        match self {
            ForwardMatcher::HeaderBlock => {
                let caps = HEADER_BLOCK.captures(text)?;
                let rest = &text[caps.get(0)?.end()..];
                if rest.trim().is_empty() {
                    return None;
                }
                Some(ForwardMatch {
                    subject: Some(caps[1].trim().to_string()),
                    body: rest.to_string(),
                })
            }
            ForwardMatcher::Banner(marker) => {
                let (_, forwarded) = text.split_once(marker.as_str())?;
                let subject_line = BANNER_SUBJECT.find(forwarded)?;
                Some(ForwardMatch {
                    subject: None,
                    body: forwarded[subject_line.end()..].to_string(),
                })
            }
        }
    }
}

/// Result of unwrapping. Without forwarding evidence `subject`/`body` are
/// the outer values and `matched_rule` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedContent {
    pub subject: String,
    pub body: String,
    pub sender: Option<String>,
    pub matched_rule: Option<String>,
}

impl ForwardedContent {
    pub fn is_forwarded(&self) -> bool {
        self.matched_rule.is_some() || self.sender.is_some()
    }
}

pub struct ForwardUnwrapper {
    matchers: Vec<ForwardMatcher>,
}

impl ForwardUnwrapper {
    pub fn new() -> Self {
        let mut matchers = vec![ForwardMatcher::HeaderBlock];
        matchers.extend(
            DEFAULT_FORWARD_MARKERS
                .iter()
                .map(|marker| ForwardMatcher::Banner(marker.to_string())),
        );
        Self { matchers }
    }

    /// Append banners after the built-in ones.
    pub fn with_additional_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.matchers
            .extend(markers.into_iter().map(|m| ForwardMatcher::Banner(m.into())));
        self
    }

    pub fn matchers(&self) -> &[ForwardMatcher] {
        &self.matchers
    }

    /// Recover the embedded message.
    ///
    /// `source` is the normalized body as decoded (header echoes intact) and
    /// is where forwarding evidence is searched; `body` is the
    /// artifact-stripped body used when nothing matches.
    pub fn unwrap(
        &self,
        subject: &str,
        body: &str,
        source: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> ForwardedContent {
        let mut original_subject = strip_forward_prefix(subject);
        let sender = find_original_sender(source, headers);

        for matcher in &self.matchers {
            let Some(found) = matcher.try_unwrap(source) else {
                continue;
            };
            log::debug!("Forwarded content recognised by {}", matcher.name());

            if let Some(inner_subject) = found.subject {
                let outer_in_body = source
                    .to_lowercase()
                    .contains(&original_subject.to_lowercase());
                if original_subject.is_empty() || outer_in_body {
                    original_subject = inner_subject;
                }
            }

            return ForwardedContent {
                subject: original_subject,
                body: clean_forwarded_body(&found.body),
                sender,
                matched_rule: Some(matcher.name()),
            };
        }

        ForwardedContent {
            subject: original_subject,
            body: clean_forwarded_body(body),
            sender,
            matched_rule: None,
        }
    }
}

impl Default for ForwardUnwrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GMAIL_FORWARD: &str = "---------- Forwarded message ---------\nFrom: a@b.com\nSubject: Invoice\n\nPay now";

    fn unwrap_plain(subject: &str, body: &str) -> ForwardedContent {
        ForwardUnwrapper::new().unwrap(subject, body, body, None)
    }

    #[test]
    fn test_strip_forward_prefix() {
        assert_eq!(strip_forward_prefix("Fwd: Invoice"), "Invoice");
        assert_eq!(strip_forward_prefix("FW: Invoice"), "Invoice");
        assert_eq!(strip_forward_prefix("fwd:Fw: Invoice"), "Invoice");
        assert_eq!(strip_forward_prefix("Fwdx: Invoice"), "Fwdx: Invoice");
        assert_eq!(strip_forward_prefix("Forward planning"), "Forward planning");
    }

    #[test]
    fn test_gmail_forward_scenario() {
        let result = unwrap_plain("Fwd: Invoice", GMAIL_FORWARD);
        assert_eq!(result.sender.as_deref(), Some("a@b.com"));
        assert_eq!(result.subject, "Invoice");
        assert_eq!(result.body, "Pay now");
        assert_eq!(result.matched_rule.as_deref(), Some("header_block"));
    }

    #[test]
    fn test_inner_subject_replaces_empty_outer() {
        let result = unwrap_plain("", GMAIL_FORWARD);
        assert_eq!(result.subject, "Invoice");
    }

    #[test]
    fn test_outer_subject_kept_when_not_in_body() {
        let result = unwrap_plain("Please check this", GMAIL_FORWARD);
        assert_eq!(result.subject, "Please check this");
    }

    #[test]
    fn test_header_block_with_intermediate_lines() {
        let body = "FYI\n\nFrom: Support <support@bank.example>\nDate: Mon, 1 Jan 2024\nTo: me@home.example\nSubject: Account locked\n\nVerify your account within 24 hours.";
        let result = unwrap_plain("Fw: Account locked", body);
        assert_eq!(result.subject, "Account locked");
        assert_eq!(result.body, "Verify your account within 24 hours.");
        // "From: Support <support@..." has a display name, so the free-text cue does not fire.
        assert_eq!(result.sender, None);
    }

    #[test]
    fn test_banner_rule_when_header_block_absent() {
        let body = "see below\n------- Forwarded message -------\nSent: Tuesday\nSubject: Wire transfer\nPlease wire the funds today.\n> old quote";
        let result = unwrap_plain("question", body);
        assert_eq!(
            result.matched_rule.as_deref(),
            Some("banner(------- Forwarded message -------)")
        );
        assert_eq!(result.subject, "question");
        assert_eq!(result.body, "Please wire the funds today.");
    }

    #[test]
    fn test_no_forward_is_noop_unwrap() {
        let body = "Hi Sam,\n\nLunch at noon?\n\n\nCheers";
        let result = unwrap_plain("Lunch", body);
        assert_eq!(result.matched_rule, None);
        assert_eq!(result.sender, None);
        assert_eq!(result.subject, "Lunch");
        assert_eq!(result.body, "Hi Sam,\nLunch at noon?\nCheers");
        assert!(!result.is_forwarded());
    }

    #[test]
    fn test_sender_cue_priority() {
        let body = "originally sent by: first@one.example\nmessage from second@two.example";
        assert_eq!(
            find_original_sender(body, None).as_deref(),
            Some("second@two.example")
        );
        assert_eq!(
            find_original_sender("Originally sent by: Boss@Corp.example", None).as_deref(),
            Some("boss@corp.example")
        );
    }

    #[test]
    fn test_sender_from_headers() {
        let mut headers = HashMap::new();
        headers.insert("in-reply-to".to_string(), "<abc@mail.reply.example>".to_string());
        assert_eq!(
            find_original_sender("no cues here", Some(&headers)).as_deref(),
            Some("abc@mail.reply.example")
        );

        headers.insert(
            "x-original-from".to_string(),
            "CEO <ceo@trusted.example>".to_string(),
        );
        assert_eq!(
            find_original_sender("no cues here", Some(&headers)).as_deref(),
            Some("ceo@trusted.example")
        );

        assert_eq!(
            find_original_sender("reach me from: me@body.example", Some(&headers)).as_deref(),
            Some("me@body.example")
        );
    }

    #[test]
    fn test_additional_markers_are_appended() {
        let unwrapper = ForwardUnwrapper::new().with_additional_markers(["=== Relayed ==="]);
        assert_eq!(
            unwrapper.matchers().last(),
            Some(&ForwardMatcher::Banner("=== Relayed ===".to_string()))
        );
        let body = "=== Relayed ===\nSubject: Gift card\nBuy five gift cards";
        let result = unwrapper.unwrap("x", body, body, None);
        assert_eq!(result.body, "Buy five gift cards");
    }

    #[test]
    fn test_banner_without_subject_falls_through() {
        let body = "Begin forwarded message:\nSubject: Prize waiting\n\nClaim your prize now\n\n\
                    ---------- Forwarded message ---------\njust a note";
        let result = unwrap_plain("Fwd: Prize waiting", body);
        assert_eq!(
            result.matched_rule.as_deref(),
            Some("banner(Begin forwarded message:)")
        );
        assert!(result.body.contains("Claim your prize now"));
        assert_eq!(result.subject, "Prize waiting");
    }
}
