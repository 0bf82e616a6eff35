//! Per-message intake.
//!
//! Gates messages on a registered envelope sender, runs the pipeline and maps
//! the outcome onto the response the transport should give. A scan reply is
//! composed only once the verdict is stored; delivering it is up to the caller.

use crate::components::decision_engine::{Label, Verdict};
use crate::components::pipeline::{EmailPipeline, ProcessedMessage, ProcessingState};
use crate::domain_utils::{sha256_hex, DomainUtils};
use crate::error::PipelineError;
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::store::Store;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fingerprint of an address as stored in the user directory. Empty input
/// hashes to an empty string so it never matches a registered user.
pub fn hash_email(address: &str) -> String {
    let normalized = DomainUtils::normalize_address(address);
    if normalized.is_empty() {
        return String::new();
    }
    sha256_hex(&normalized)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    pub fn accepted() -> Self {
        Self {
            code: 250,
            message: "OK - processed successfully".to_string(),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            code: 550,
            message: format!("Rejected - {}", message),
        }
    }

    pub fn temporary_failure() -> Self {
        Self {
            code: 421,
            message: "Temp fail - try again later".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySettings {
    pub enabled: bool,
    pub from_address: String,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            from_address: "phishing-scanner@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReply {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Plain-text scan report for the user who forwarded the message.
pub fn compose_scan_reply(from: &str, to: &str, scanned_subject: &str, verdict: &Verdict) -> ScanReply {
    let percent = verdict.phishing_probability * 100.0;
    let scanned_subject = match scanned_subject.trim() {
        "" => "(no subject)",
        subject => subject,
    };

    let (verdict_line, action_line, tag) = match verdict.predicted_label {
        Label::Phishing => (
            format!("⚠  PHISHING detected  ({:.0}% confidence)", percent),
            "Do not click any links or open attachments in this email.",
            "⚠ PHISHING",
        ),
        Label::Legitimate => (
            format!("✔  Safe  ({:.0}% confidence)", 100.0 - percent),
            "No threats were detected in this email.",
            "✔ Safe",
        ),
    };

    let rule = "=".repeat(40);
    let body = format!(
        "Phishing Scan Result\n{rule}\n\
         Scanned email : {scanned_subject}\n\
         Verdict       : {verdict_line}\n\
         Risk level    : {risk}\n\
         Checked via   : {reason}\n\
         {rule}\n\
         {action_line}\n\n\
         -- phish-sieve",
        risk = verdict.risk_level,
        reason = verdict.reason,
    );

    ScanReply {
        from: from.to_string(),
        to: to.to_string(),
        subject: format!("[Phishing Scan] {} - {}", tag, scanned_subject),
        body,
    }
}

#[derive(Debug)]
pub struct InboundOutcome {
    pub response: SmtpResponse,
    /// `Rejected` and `Logged` are final; `Received` means the sender should retry.
    pub state: ProcessingState,
    pub processed: Option<ProcessedMessage>,
    pub reply: Option<ScanReply>,
}

impl InboundOutcome {
    fn without_verdict(response: SmtpResponse, state: ProcessingState) -> Self {
        Self {
            response,
            state,
            processed: None,
            reply: None,
        }
    }
}

pub struct InboundHandler<S: Store> {
    pipeline: Arc<EmailPipeline>,
    store: Arc<S>,
    statistics: Arc<StatisticsCollector>,
    reply: ReplySettings,
    store_timeout: Duration,
}

impl<S: Store> InboundHandler<S> {
    pub fn new(
        pipeline: Arc<EmailPipeline>,
        store: Arc<S>,
        statistics: Arc<StatisticsCollector>,
        reply: ReplySettings,
        store_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            store,
            statistics,
            reply,
            store_timeout,
        }
    }

    /// Handle one message from `envelope_sender`. Never panics and never
    /// answers 250 before the verdict is recorded.
    pub async fn handle(&self, envelope_sender: &str, raw: &[u8]) -> InboundOutcome {
        let email_hash = hash_email(envelope_sender);
        let lookup = tokio::time::timeout(self.store_timeout, self.store.find_user(&email_hash)).await;

        let user = match lookup {
            Ok(Ok(Some(user))) => user,
            Ok(Ok(None)) => {
                log::info!("DISCARDED: unregistered sender {}", envelope_sender);
                self.statistics.record_event(StatEvent::Rejected);
                return InboundOutcome::without_verdict(
                    SmtpResponse::rejected("sender not registered"),
                    ProcessingState::Rejected,
                );
            }
            Ok(Err(e)) => {
                log::error!("User lookup failed for {}: {}", envelope_sender, e);
                self.statistics.record_event(StatEvent::Failed);
                return InboundOutcome::without_verdict(SmtpResponse::temporary_failure(), ProcessingState::Received);
            }
            Err(_) => {
                log::error!("User lookup for {} timed out after {:?}", envelope_sender, self.store_timeout);
                self.statistics.record_event(StatEvent::Failed);
                return InboundOutcome::without_verdict(SmtpResponse::temporary_failure(), ProcessingState::Received);
            }
        };

        match self
            .pipeline
            .process(raw, envelope_sender, user.id, self.store.as_ref())
            .await
        {
            Ok(processed) => {
                self.statistics
                    .record_event(StatEvent::Verdict(processed.verdict.clone()));
                let reply = self.reply.enabled.then(|| {
                    compose_scan_reply(
                        &self.reply.from_address,
                        &DomainUtils::normalize_address(envelope_sender),
                        &processed.content.original_subject,
                        &processed.verdict,
                    )
                });
                InboundOutcome {
                    response: SmtpResponse::accepted(),
                    state: processed.state,
                    processed: Some(processed),
                    reply,
                }
            }
            Err(e @ PipelineError::Parse(_)) => {
                log::info!("DISCARDED: failed preprocessing for user_id={}: {}", user.id, e);
                self.statistics.record_event(StatEvent::Rejected);
                InboundOutcome::without_verdict(
                    SmtpResponse::rejected("message could not be parsed"),
                    ProcessingState::Rejected,
                )
            }
            Err(e) => {
                log::error!("Processing failed for user_id={}: {}", user.id, e);
                self.statistics.record_event(StatEvent::Failed);
                InboundOutcome::without_verdict(SmtpResponse::temporary_failure(), ProcessingState::Received)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::components::decision_engine::{Prediction, Reason, RiskLevel};
    use crate::components::trust_resolver::WhitelistSet;
    use crate::error::{ClassifierError, StoreError};
    use crate::store::{
        EventId, EventMetadata, MemoryStore, PredictionRecord, TrustedDomainLookup, User, UserDirectory,
        VerdictStore,
    };
    use async_trait::async_trait;

    struct FixedClassifier(Result<Prediction, String>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        fn version(&self) -> &str {
            "fixed"
        }

        async fn classify(&self, _text: &str) -> Result<Prediction, ClassifierError> {
            self.0.clone().map_err(ClassifierError::Unavailable)
        }
    }

    /// Memory store whose `record` always fails.
    struct BrokenRecorder(MemoryStore);

    #[async_trait]
    impl TrustedDomainLookup for BrokenRecorder {
        async fn is_trusted(&self, user_id: i64, domain: &str) -> Result<bool, StoreError> {
            self.0.is_trusted(user_id, domain).await
        }
    }

    #[async_trait]
    impl VerdictStore for BrokenRecorder {
        async fn record(&self, _verdict: &Verdict, _metadata: &EventMetadata) -> Result<EventId, StoreError> {
            Err(StoreError::Task("disk full".to_string()))
        }
    }

    #[async_trait]
    impl UserDirectory for BrokenRecorder {
        async fn create_user(&self, email_hash: &str) -> Result<User, StoreError> {
            self.0.create_user(email_hash).await
        }
        async fn find_user(&self, email_hash: &str) -> Result<Option<User>, StoreError> {
            self.0.find_user(email_hash).await
        }
        async fn add_trusted_domain(&self, user_id: i64, domain: &str) -> Result<(), StoreError> {
            self.0.add_trusted_domain(user_id, domain).await
        }
        async fn user_predictions(&self, user_id: i64, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
            self.0.user_predictions(user_id, limit).await
        }
    }

    const MESSAGE: &[u8] = b"From: billing@unknown.test\r\n\
Subject: Account suspended\r\n\
Message-ID: <m1@unknown.test>\r\n\
\r\n\
Your account has been suspended, confirm your password to restore access.\r\n";

    fn handler<S: Store>(store: Arc<S>, classifier: FixedClassifier, reply: bool) -> (InboundHandler<S>, Arc<StatisticsCollector>) {
        let pipeline = Arc::new(EmailPipeline::new(Arc::new(WhitelistSet::builtin()), Arc::new(classifier)));
        let statistics = Arc::new(StatisticsCollector::new());
        let reply = ReplySettings {
            enabled: reply,
            from_address: "scanner@phish-sieve.test".to_string(),
        };
        (
            InboundHandler::new(pipeline, store, statistics.clone(), reply, Duration::from_millis(500)),
            statistics,
        )
    }

    #[test]
    fn test_hash_email_normalizes() {
        assert_eq!(hash_email("  Alice@Example.COM "), hash_email("alice@example.com"));
        assert_eq!(hash_email("alice@example.com"), sha256_hex("alice@example.com"));
        assert_eq!(hash_email("   "), "");
    }

    #[test]
    fn test_response_display() {
        assert_eq!(SmtpResponse::accepted().to_string(), "250 OK - processed successfully");
        assert_eq!(
            SmtpResponse::rejected("sender not registered").to_string(),
            "550 Rejected - sender not registered"
        );
        assert_eq!(SmtpResponse::temporary_failure().code, 421);
        assert!(!SmtpResponse::temporary_failure().is_success());
    }

    #[test]
    fn test_compose_scan_reply() {
        let verdict = Verdict::from_prediction(Prediction::new(Label::Phishing, 0.91));
        let reply = compose_scan_reply("scanner@x.test", "user@x.test", "Invoice", &verdict);
        assert_eq!(reply.subject, "[Phishing Scan] ⚠ PHISHING - Invoice");
        assert!(reply.body.contains("Scanned email : Invoice"));
        assert!(reply.body.contains("(91% confidence)"));
        assert!(reply.body.contains("Risk level    : HIGH"));
        assert!(reply.body.contains("Checked via   : model_prediction"));

        let safe = compose_scan_reply("scanner@x.test", "user@x.test", "  ", &Verdict::exempt(Reason::TrustedDomain));
        assert_eq!(safe.subject, "[Phishing Scan] ✔ Safe - (no subject)");
        assert!(safe.body.contains("(100% confidence)"));
    }

    #[tokio::test]
    async fn test_unregistered_sender_is_rejected_before_parsing() {
        let store = Arc::new(MemoryStore::new());
        let (handler, statistics) = handler(store.clone(), FixedClassifier(Ok(Prediction::new(Label::Phishing, 0.9))), true);

        let outcome = handler.handle("stranger@else.test", b"not a message").await;
        assert_eq!(outcome.response.code, 550);
        assert!(outcome.response.message.contains("not registered"));
        assert_eq!(outcome.state, ProcessingState::Rejected);
        assert!(outcome.reply.is_none());
        assert_eq!(store.event_count(), 0);
        assert_eq!(statistics.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_registered_sender_gets_verdict_and_reply() {
        let store = Arc::new(MemoryStore::new());
        store.create_user(&hash_email("user@home.test")).await.unwrap();
        let (handler, statistics) = handler(store.clone(), FixedClassifier(Ok(Prediction::new(Label::Phishing, 0.9))), true);

        let outcome = handler.handle("User@Home.test", MESSAGE).await;
        assert_eq!(outcome.response, SmtpResponse::accepted());
        assert_eq!(outcome.state, ProcessingState::Logged);
        let processed = outcome.processed.unwrap();
        assert_eq!(processed.verdict.risk_level, RiskLevel::High);
        assert_eq!(store.event_count(), 1);

        let reply = outcome.reply.unwrap();
        assert_eq!(reply.to, "user@home.test");
        assert_eq!(reply.from, "scanner@phish-sieve.test");
        assert!(reply.subject.contains("Account suspended"));
        assert_eq!(statistics.snapshot().phishing, 1);
    }

    #[tokio::test]
    async fn test_unparseable_message_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.create_user(&hash_email("user@home.test")).await.unwrap();
        let (handler, _) = handler(store.clone(), FixedClassifier(Ok(Prediction::new(Label::Phishing, 0.9))), false);

        let outcome = handler.handle("user@home.test", b"garbage without headers").await;
        assert_eq!(outcome.response.code, 550);
        assert!(outcome.response.message.contains("could not be parsed"));
        assert_eq!(outcome.state, ProcessingState::Rejected);
        assert!(outcome.state.is_terminal());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_classifier_failure_is_temporary() {
        let store = Arc::new(MemoryStore::new());
        store.create_user(&hash_email("user@home.test")).await.unwrap();
        let (handler, statistics) = handler(store.clone(), FixedClassifier(Err("model offline".to_string())), true);

        let outcome = handler.handle("user@home.test", MESSAGE).await;
        assert_eq!(outcome.response.code, 421);
        assert_eq!(outcome.state, ProcessingState::Received);
        assert!(!outcome.state.is_terminal());
        assert!(outcome.processed.is_none());
        assert!(outcome.reply.is_none());
        assert_eq!(store.event_count(), 0);
        assert_eq!(statistics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_store_failure_sends_no_reply() {
        let inner = MemoryStore::new();
        inner.create_user(&hash_email("user@home.test")).await.unwrap();
        let store = Arc::new(BrokenRecorder(inner));
        let (handler, _) = handler(store, FixedClassifier(Ok(Prediction::new(Label::Phishing, 0.9))), true);

        let outcome = handler.handle("user@home.test", MESSAGE).await;
        assert_eq!(outcome.response.code, 421);
        assert!(outcome.reply.is_none());
    }
}
