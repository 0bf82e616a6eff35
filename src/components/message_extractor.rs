//! Message Extractor
//!
//! Decodes raw message bytes into a header map and body parts, then picks a
//! plain-text body: the first substantial `text/plain` part, else the first
//! `text/html` part converted to text. Structural leftovers (quoted header
//! echoes, CSS, data URIs, MIME boundaries) are stripped afterwards.

use crate::components::{apply_rules, TextRule};
use crate::error::ParseError;
use crate::normalization::decode_html_entities;
use lazy_static::lazy_static;
use mailparse::{DispositionType, ParsedMail};
use regex::Regex;
use std::collections::HashMap;

/// Plain parts at or below this many characters lose to an HTML alternative.
const MIN_PLAIN_BODY_CHARS: usize = 50;

lazy_static! {
    static ref HEADER_FIELD_LINE: Regex = Regex::new(r"^[!-9;-~]+:").unwrap();

    static ref HTML_SCRIPT: Regex = Regex::new(r"(?is)<script[^>]*>.*?</script\s*>").unwrap();
    static ref HTML_STYLE: Regex = Regex::new(r"(?is)<style[^>]*>.*?</style\s*>").unwrap();
    static ref HTML_HEAD: Regex = Regex::new(r"(?is)<head[^>]*>.*?</head\s*>").unwrap();
    static ref HTML_COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    static ref HTML_LINE_BREAK: Regex = Regex::new(r"(?i)<br\s*/?>").unwrap();
    static ref HTML_BLOCK_END: Regex =
        Regex::new(r"(?i)</(?:div|p|tr|h[1-6]|li|table|blockquote|section|article)\s*>").unwrap();
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();

    static ref CARRIAGE_RETURN: Regex = Regex::new(r"\r\n?").unwrap();
    static ref QUOTED_HEADER: Regex =
        Regex::new(r"(?mi)^[ \t]*(?:To|From|Date|Sent|Cc|Bcc|Subject|Reply-To):[ \t]*.+$").unwrap();
    static ref WROTE_LINE: Regex = Regex::new(r"(?mi)^On[ \t]+.+?wrote:[ \t]*$").unwrap();
    static ref QUOTE_PREFIX_LINE: Regex = Regex::new(r"(?m)^[>|].*$").unwrap();
    static ref STYLE_ATTR: Regex = Regex::new(r#"(?i)style\s*=\s*["'][^"']{0,200}["']"#).unwrap();
    static ref MEDIA_RULE: Regex = Regex::new(r"(?i)@media[^{]*\{[^}]*\}").unwrap();
    static ref AT_RULE: Regex = Regex::new(r"(?i)@[a-z-]+\s+[^{]*\{[^}]*\}").unwrap();
    static ref CLASS_ATTR: Regex = Regex::new(r#"(?i)class\s*=\s*["'][^"']+["']"#).unwrap();
    static ref ID_ATTR: Regex = Regex::new(r#"(?i)\bid\s*=\s*["'][^"']+["']"#).unwrap();
    static ref DATA_IMAGE_URI: Regex = Regex::new(r"data:image/[^;\s]+;base64,\S+").unwrap();
    static ref IMAGE_URL_WITH_QUERY: Regex =
        Regex::new(r"(?i)https?://\S*\.(?:png|jpg|gif|jpeg)\?\S*").unwrap();
    static ref BOUNDARY_MARKER: Regex =
        Regex::new(r"(?i)--\s*\w+\s*(?:boundary|delimiter)\s*--").unwrap();
    static ref BOUNDARY_LINE: Regex =
        Regex::new(r"(?m)^--[-=_]*[A-Za-z0-9][\w'()+,./:=?-]{8,}[ \t]*$").unwrap();
    static ref EXCESS_NEWLINES: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref HORIZONTAL_SPACE: Regex = Regex::new(r"[ \t]+").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

#[derive(Debug, Clone)]
pub struct BodyPart {
    pub content_type: String,
    pub disposition: Disposition,
    pub text: String,
}

/// Drop a leading mbox `From sender date` line; the headers follow it.
fn strip_mbox_envelope(raw: &[u8]) -> &[u8] {
    if !raw.starts_with(b"From ") {
        return raw;
    }
    match raw.iter().position(|b| *b == b'\n') {
        Some(end) => &raw[end + 1..],
        None => &[],
    }
}

/// Decoded message structure. Header keys are lowercase; duplicates keep the last value.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub headers: HashMap<String, String>,
    pub is_multipart: bool,
    pub parts: Vec<BodyPart>,
}

impl ParsedMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let raw = strip_mbox_envelope(raw);
        let first_line = raw
            .split(|b| *b == b'\n')
            .next()
            .map(|line| String::from_utf8_lossy(line).trim_end().to_string())
            .unwrap_or_default();

        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }
        if !HEADER_FIELD_LINE.is_match(&first_line) {
            return Err(ParseError::MissingHeaders(format!(
                "first line is not a header field: {:?}",
                first_line.chars().take(60).collect::<String>()
            )));
        }

        let mail = mailparse::parse_mail(raw)?;

        let mut headers = HashMap::new();
        for header in &mail.headers {
            headers.insert(header.get_key().to_lowercase(), header.get_value());
        }
        if headers.is_empty() {
            return Err(ParseError::MissingHeaders("no header fields decoded".to_string()));
        }

        let is_multipart =
            !mail.subparts.is_empty() || mail.ctype.mimetype.to_lowercase().starts_with("multipart/");

        let mut parts = Vec::new();
        collect_parts(&mail, &mut parts);

        Ok(Self {
            headers,
            is_multipart,
            parts,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn subject(&self) -> String {
        self.header("subject").unwrap_or_default().trim().to_string()
    }
}

fn collect_parts(part: &ParsedMail<'_>, parts: &mut Vec<BodyPart>) {
    if !part.subparts.is_empty() {
        for child in &part.subparts {
            collect_parts(child, parts);
        }
        return;
    }

    let content_type = part.ctype.mimetype.to_lowercase();
    let disposition = match part.get_content_disposition().disposition {
        DispositionType::Attachment => Disposition::Attachment,
        _ => Disposition::Inline,
    };

    let text = if content_type.starts_with("text/") && disposition == Disposition::Inline {
        match part.get_body() {
            Ok(body) => body,
            Err(e) => {
                log::debug!("Falling back to raw bytes for {content_type} part: {e}");
                part.get_body_raw()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default()
            }
        }
    } else {
        String::new()
    };

    parts.push(BodyPart {
        content_type,
        disposition,
        text,
    });
}

/// Subject plus chosen body. `source` is the selected text before artifact
/// stripping, kept so forwarded header blocks can still be found.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBody {
    pub subject: String,
    pub body: String,
    pub source: String,
}

/// Convert HTML to text: drop scripts, styles, head and comments, turn block
/// ends into newlines and every other tag into a space.
pub fn html_to_text(html: &str) -> String {
    let text = HTML_SCRIPT.replace_all(html, " ");
    let text = HTML_STYLE.replace_all(&text, " ");
    let text = HTML_HEAD.replace_all(&text, " ");
    let text = HTML_COMMENT.replace_all(&text, " ");
    let text = HTML_LINE_BREAK.replace_all(&text, "\n");
    let text = HTML_BLOCK_END.replace_all(&text, "\n");
    let text = HTML_TAG.replace_all(&text, " ");
    decode_html_entities(&text)
}

fn normalize_line_endings(text: &str) -> String {
    CARRIAGE_RETURN.replace_all(text, "\n").into_owned()
}

fn strip_quoted_headers(text: &str) -> String {
    QUOTED_HEADER.replace_all(text, "").into_owned()
}

fn strip_wrote_lines(text: &str) -> String {
    WROTE_LINE.replace_all(text, "").into_owned()
}

fn strip_quote_prefixed_lines(text: &str) -> String {
    QUOTE_PREFIX_LINE.replace_all(text, "").into_owned()
}

fn strip_css_leftovers(text: &str) -> String {
    let text = STYLE_ATTR.replace_all(text, " ");
    let text = MEDIA_RULE.replace_all(&text, " ");
    let text = AT_RULE.replace_all(&text, " ");
    let text = CLASS_ATTR.replace_all(&text, " ");
    ID_ATTR.replace_all(&text, " ").into_owned()
}

fn strip_embedded_images(text: &str) -> String {
    let text = DATA_IMAGE_URI.replace_all(text, "");
    IMAGE_URL_WITH_QUERY.replace_all(&text, "").into_owned()
}

fn strip_boundaries(text: &str) -> String {
    let text = BOUNDARY_MARKER.replace_all(text, " ");
    BOUNDARY_LINE.replace_all(&text, "").into_owned()
}

fn collapse_layout(text: &str) -> String {
    let text = EXCESS_NEWLINES.replace_all(text, "\n\n");
    HORIZONTAL_SPACE.replace_all(&text, " ").trim().to_string()
}

const ARTIFACT_RULES: [TextRule; 8] = [
    TextRule::new("line_endings", normalize_line_endings),
    TextRule::new("quoted_headers", strip_quoted_headers),
    TextRule::new("wrote_lines", strip_wrote_lines),
    TextRule::new("quote_prefix", strip_quote_prefixed_lines),
    TextRule::new("css_leftovers", strip_css_leftovers),
    TextRule::new("embedded_images", strip_embedded_images),
    TextRule::new("mime_boundaries", strip_boundaries),
    TextRule::new("layout", collapse_layout),
];

/// Remove structural email artifacts from extracted body text.
pub fn remove_email_artifacts(text: &str) -> String {
    apply_rules(&ARTIFACT_RULES, text)
}

pub struct MessageExtractor;

impl MessageExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Parse `raw` and extract subject and body. Only an unparseable byte
    /// stream fails; a message without a usable body yields an empty body.
    pub fn extract(&self, raw: &[u8]) -> Result<(ParsedMessage, ExtractedBody), ParseError> {
        let parsed = ParsedMessage::parse(raw)?;
        let extracted = self.extract_from(&parsed);
        Ok((parsed, extracted))
    }

    pub fn extract_from(&self, parsed: &ParsedMessage) -> ExtractedBody {
        let source = normalize_line_endings(&self.select_body(parsed));
        let body = remove_email_artifacts(&source);

        if body.is_empty() {
            log::debug!("No body text extracted from message");
        }

        ExtractedBody {
            subject: parsed.subject(),
            body,
            source,
        }
    }

    fn select_body(&self, parsed: &ParsedMessage) -> String {
        let mut short_plain: Option<&str> = None;
        let mut html: Option<&str> = None;

        for part in &parsed.parts {
            if part.disposition == Disposition::Attachment {
                continue;
            }
            match part.content_type.as_str() {
                "text/plain" => {
                    if part.text.trim().chars().count() > MIN_PLAIN_BODY_CHARS {
                        return part.text.clone();
                    }
                    if short_plain.is_none() && !part.text.trim().is_empty() {
                        short_plain = Some(&part.text);
                    }
                }
                "text/html" if html.is_none() => {
                    html = Some(&part.text);
                }
                _ => {}
            }
        }

        if let Some(html) = html {
            let text = html_to_text(html);
            if !text.trim().is_empty() {
                return text;
            }
        }

        short_plain.map(str::to_string).unwrap_or_default()
    }
}

impl Default for MessageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_PLAIN: &str =
        "Your account statement for March is ready. Log in to the portal to review the details.";

    #[test]
    fn test_parses_flat_plain_message() {
        let raw = format!(
            "From: billing@example.com\r\nSubject: Statement\r\nContent-Type: text/plain\r\n\r\n{LONG_PLAIN}\r\n"
        );
        let (parsed, extracted) = MessageExtractor::new().extract(raw.as_bytes()).unwrap();

        assert!(!parsed.is_multipart);
        assert_eq!(parsed.header("FROM"), Some("billing@example.com"));
        assert_eq!(extracted.subject, "Statement");
        assert_eq!(extracted.body, LONG_PLAIN);
    }

    #[test]
    fn test_duplicate_headers_last_wins() {
        let raw = b"Subject: first\r\nSubject: second\r\n\r\nbody";
        let parsed = ParsedMessage::parse(raw).unwrap();
        assert_eq!(parsed.subject(), "second");
    }

    #[test]
    fn test_prefers_long_plain_part() {
        let raw = format!(
            "From: a@example.com\r\n\
             Subject: Hello\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
             \r\n\
             --XYZ\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             {LONG_PLAIN}\r\n\
             --XYZ\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <p>html version</p>\r\n\
             --XYZ--\r\n"
        );
        let (parsed, extracted) = MessageExtractor::new().extract(raw.as_bytes()).unwrap();
        assert!(parsed.is_multipart);
        assert_eq!(parsed.parts.len(), 2);
        assert_eq!(extracted.body, LONG_PLAIN);
    }

    #[test]
    fn test_short_plain_falls_back_to_html() {
        let raw = "From: a@example.com\r\n\
             Subject: Hello\r\n\
             Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
             \r\n\
             --XYZ\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             See HTML.\r\n\
             --XYZ\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <html><head><title>t</title></head><body><style>p {color: red}</style>\
             <p>Verify your &amp; account</p><script>alert(1)</script><!-- hidden --></body></html>\r\n\
             --XYZ--\r\n";
        let (_, extracted) = MessageExtractor::new().extract(raw.as_bytes()).unwrap();
        assert_eq!(extracted.body, "Verify your & account");
    }

    #[test]
    fn test_skips_attachments() {
        let raw = "From: a@example.com\r\n\
             Subject: Invoice\r\n\
             Content-Type: multipart/mixed; boundary=\"B\"\r\n\
             \r\n\
             --B\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
             \r\n\
             This attachment text is long enough to qualify but it must be ignored entirely.\r\n\
             --B\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             Short inline note\r\n\
             --B--\r\n";
        let (parsed, extracted) = MessageExtractor::new().extract(raw.as_bytes()).unwrap();
        assert_eq!(parsed.parts[0].disposition, Disposition::Attachment);
        assert_eq!(extracted.body, "Short inline note");
    }

    #[test]
    fn test_decodes_transfer_encoding() {
        let raw = "From: a@example.com\r\n\
             Subject: =?utf-8?B?VXJnZW50?=\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\
             \r\n\
             Please conf=\r\nirm your password now\r\n";
        let (_, extracted) = MessageExtractor::new().extract(raw.as_bytes()).unwrap();
        assert_eq!(extracted.subject, "Urgent");
        assert_eq!(extracted.body, "Please confirm your password now");
    }

    #[test]
    fn test_empty_body_is_not_an_error() {
        let (_, extracted) = MessageExtractor::new()
            .extract(b"From: a@example.com\r\nSubject: nothing\r\n\r\n")
            .unwrap();
        assert_eq!(extracted.body, "");
    }

    #[test]
    fn test_rejects_non_messages() {
        assert!(matches!(ParsedMessage::parse(b""), Err(ParseError::Empty)));
        assert!(matches!(ParsedMessage::parse(b" \r\n\r\n"), Err(ParseError::Empty)));
        assert!(matches!(
            ParsedMessage::parse(b"this is not an email at all\njust text"),
            Err(ParseError::MissingHeaders(_))
        ));
        assert!(matches!(
            ParsedMessage::parse(b"\r\nbody without headers"),
            Err(ParseError::MissingHeaders(_))
        ));
    }

    #[test]
    fn test_mbox_envelope_line_is_skipped() {
        let raw = b"From alice@example.com Mon Jan  1 00:00:00 2024\n\
            From: a@b.com\n\
            Subject: hi\n\
            \n\
            Please verify your account details today.";
        let parsed = ParsedMessage::parse(raw).unwrap();
        assert_eq!(parsed.header("from"), Some("a@b.com"));
        assert_eq!(parsed.subject(), "hi");

        let (_, extracted) = MessageExtractor::new().extract(raw).unwrap();
        assert!(extracted.body.contains("Please verify your account"));

        assert!(matches!(
            ParsedMessage::parse(b"From alice@example.com Mon Jan  1 00:00:00 2024\n"),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn test_artifact_removal() {
        let text = "Hello team\r\n\
             From: someone@example.com\r\n\
             Subject: old thread\r\n\
             On Mon, Jan 1, 2024 at 9:00 AM Bob wrote:\r\n\
             > quoted reply\r\n\
             | piped quote\r\n\
             <div style=\"color:red\" class=\"x\" id=\"y\">\r\n\
             @media screen { .a { color: red } }\r\n\
             img data:image/png;base64,iVBORw0KGgo= end\r\n\
             --==_mimepart_abc123def456\r\n\r\n\r\n\r\n\
             Real   content\there";
        let cleaned = remove_email_artifacts(text);

        assert!(!cleaned.contains("someone@example.com"));
        assert!(!cleaned.contains("wrote:"));
        assert!(!cleaned.contains("quoted reply"));
        assert!(!cleaned.contains("piped quote"));
        assert!(!cleaned.contains("color:red"));
        assert!(!cleaned.contains("class="));
        assert!(!cleaned.contains("base64"));
        assert!(!cleaned.contains("mimepart"));
        assert!(!cleaned.contains("\n\n\n"));
        assert!(cleaned.starts_with("Hello team"));
        assert!(cleaned.ends_with("Real content here"));
    }

    #[test]
    fn test_html_to_text_separators() {
        let text = html_to_text("<p>First</p><p>Second<br>Third</p><span>a</span><span>b</span>");
        assert!(text.contains("First\n"));
        assert!(text.contains("Second\nThird"));
        assert!(text.contains("a   b") || text.contains("a  b"));
    }
}
