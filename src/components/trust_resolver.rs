//! Trust Resolver Component
//!
//! Picks the effective sender of a message and decides whether scoring can be
//! skipped. When a forward was unwrapped the original sender is the one
//! checked, so a trusted relay never lends its trust to what it forwards.

use crate::components::decision_engine::Reason;
use crate::domain_utils::DomainUtils;
use crate::error::PipelineError;
use crate::store::TrustedDomainLookup;
use std::collections::HashSet;
use std::time::Duration;

/// Root domains trusted for every user unless whitelisting is disabled.
pub const BUILTIN_WHITELIST: [&str; 14] = [
    "google.com",
    "accounts.google.com",
    "gmail.com",
    "redditmail.com",
    "reddit.com",
    "github.com",
    "microsoft.com",
    "amazon.com",
    "paypal.com",
    "apple.com",
    "linkedin.com",
    "twitter.com",
    "facebook.com",
    "instagram.com",
];

/// Process-wide set of always-trusted domains. Built once at startup and
/// shared read-only (wrap in `Arc`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistSet {
    domains: HashSet<String>,
}

impl WhitelistSet {
    pub fn builtin() -> Self {
        Self::from_domains(BUILTIN_WHITELIST)
    }

    /// An empty set: nothing is exempt by whitelist.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('@').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn with_extra<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.domains.extend(Self::from_domains(domains).domains);
        self
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Exact domain or its registrable parent (last two labels).
    pub fn contains_domain(&self, domain: &str) -> bool {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return false;
        }
        if self.domains.contains(&domain) {
            return true;
        }
        DomainUtils::registrable_parent(&domain)
            .map(|parent| self.domains.contains(&parent))
            .unwrap_or(false)
    }

    /// An address without `@` is never whitelisted.
    pub fn contains_address(&self, address: &str) -> bool {
        match DomainUtils::extract_domain(address) {
            Some(domain) => self.contains_domain(&domain),
            None => false,
        }
    }

    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustDecision {
    pub effective_sender: String,
    /// Lowercased domain of the effective sender, empty when it has no `@`.
    pub effective_domain: String,
    pub exemption: Option<Reason>,
}

impl TrustDecision {
    pub fn is_exempt(&self) -> bool {
        self.exemption.is_some()
    }
}

pub struct TrustResolver<'a> {
    whitelist: &'a WhitelistSet,
}

impl<'a> TrustResolver<'a> {
    pub fn new(whitelist: &'a WhitelistSet) -> Self {
        Self { whitelist }
    }

    pub fn effective_sender<'s>(direct_sender: &'s str, original_sender: Option<&'s str>) -> &'s str {
        original_sender
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(direct_sender)
    }

    /// Resolve trust for one message. The user's trusted-domain list is
    /// queried fresh every call; a lookup that overruns `timeout` is an
    /// error, never an exemption.
    pub async fn resolve(
        &self,
        direct_sender: &str,
        original_sender: Option<&str>,
        user_id: i64,
        lookup: &dyn TrustedDomainLookup,
        timeout: Duration,
    ) -> Result<TrustDecision, PipelineError> {
        let effective_sender = DomainUtils::normalize_address(Self::effective_sender(direct_sender, original_sender));
        let effective_domain = DomainUtils::extract_domain(&effective_sender).unwrap_or_default();

        let mut decision = TrustDecision {
            effective_sender,
            effective_domain,
            exemption: None,
        };

        if decision.effective_domain.is_empty() {
            log::debug!("Effective sender '{}' has no domain, not exempt", decision.effective_sender);
            return Ok(decision);
        }

        if self.whitelist.contains_domain(&decision.effective_domain) {
            log::debug!("Domain {} is whitelisted", decision.effective_domain);
            decision.exemption = Some(Reason::WhitelistedDomain);
            return Ok(decision);
        }

        let trusted = tokio::time::timeout(timeout, lookup.is_trusted(user_id, &decision.effective_domain))
            .await
            .map_err(|_| PipelineError::StoreTimeout(timeout))??;

        if trusted {
            log::debug!("Domain {} is trusted by user {}", decision.effective_domain, user_id);
            decision.exemption = Some(Reason::TrustedDomain);
        }

        Ok(decision)
    }
}
