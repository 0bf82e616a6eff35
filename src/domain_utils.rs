use sha2::{Digest, Sha256};

/// Minimal address and domain hierarchy utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the domain part of an email address (text after the last `@`).
    /// Angle brackets and surrounding whitespace are dropped, result is lowercase.
    pub fn extract_domain(email: &str) -> Option<String> {
        let (_, domain) = email.rsplit_once('@')?;
        let clean_domain = domain.trim_matches(|c: char| c == '>' || c == '<' || c.is_whitespace());
        if clean_domain.is_empty() {
            None
        } else {
            Some(clean_domain.to_lowercase())
        }
    }

    /// Parent domain made of the last two labels, only when the domain has more than two.
    ///
    /// `mail.paypal.com` → `paypal.com`; `paypal.com` → `None`.
    pub fn registrable_parent(domain: &str) -> Option<String> {
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() > 2 {
            Some(labels[labels.len() - 2..].join("."))
        } else {
            None
        }
    }

    /// Trim and lowercase an address so equal mailboxes hash identically.
    pub fn normalize_address(address: &str) -> String {
        address
            .trim()
            .trim_matches(|c| c == '<' || c == '>')
            .trim()
            .to_lowercase()
    }
}

/// Lowercase hex SHA-256 digest, used for email and message-id fingerprints.
pub fn sha256_hex(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainUtils::extract_domain("user@Example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("<ceo@trusted.example>"),
            Some("trusted.example".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("invalid"), None);
        assert_eq!(DomainUtils::extract_domain("dangling@"), None);
    }

    #[test]
    fn test_registrable_parent() {
        assert_eq!(
            DomainUtils::registrable_parent("accounts.google.com"),
            Some("google.com".to_string())
        );
        assert_eq!(
            DomainUtils::registrable_parent("a.b.mail.example.org"),
            Some("example.org".to_string())
        );
        assert_eq!(DomainUtils::registrable_parent("google.com"), None);
        assert_eq!(DomainUtils::registrable_parent("localhost"), None);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            DomainUtils::normalize_address("  <Alice@Example.COM> "),
            "alice@example.com"
        );
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex("").len(), 64);
    }
}
