//! Message pipeline
//!
//! Drives one message through extraction, invisible-content normalization,
//! forward unwrapping, canonicalization, trust resolution and the decision,
//! then hands the verdict to the store. Each message is independent; the
//! pipeline itself only holds read-only state and can be shared across tasks.

use crate::classifier::Classifier;
use crate::components::canonicalizer::Canonicalizer;
use crate::components::decision_engine::{ContentQuality, Verdict};
use crate::components::forward_unwrapper::ForwardUnwrapper;
use crate::components::message_extractor::MessageExtractor;
use crate::components::trust_resolver::{TrustDecision, TrustResolver, WhitelistSet};
use crate::domain_utils::sha256_hex;
use crate::error::{ClassifierError, ParseError, PipelineError};
use crate::normalization::InvisibleNormalizer;
use crate::store::{EventId, EventMetadata, TrustedDomainLookup, VerdictStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Lifecycle of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Received,
    Extracted,
    Rejected,
    Exempt,
    Scored,
    Logged,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Rejected | ProcessingState::Logged)
    }
}

/// Upper bounds for the two external calls a message may wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimeouts {
    pub classifier: Duration,
    pub store: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            classifier: DEFAULT_CLASSIFIER_TIMEOUT,
            store: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Text ready for scoring.
///
/// `subject`/`body` are canonical. `original_subject`/`original_body` are the
/// unwrapped message before canonicalization, or the outer message when no
/// forward was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedContent {
    pub subject: String,
    pub body: String,
    pub original_subject: String,
    pub original_body: String,
    pub original_sender: Option<String>,
    pub message_id: Option<String>,
    pub forward_rule: Option<String>,
    pub quality: ContentQuality,
}

impl ExtractedContent {
    /// Input handed to the classifier.
    pub fn classifier_text(&self) -> String {
        format!("{} {}", self.subject, self.body)
    }

    pub fn is_forwarded(&self) -> bool {
        self.original_sender.is_some()
    }
}

/// Everything known about a message once its verdict is stored.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedMessage {
    pub event_id: EventId,
    pub content: ExtractedContent,
    pub effective_sender: String,
    pub metadata: EventMetadata,
    pub verdict: Verdict,
    pub state: ProcessingState,
}

pub struct EmailPipeline {
    extractor: MessageExtractor,
    normalizer: InvisibleNormalizer,
    unwrapper: ForwardUnwrapper,
    canonicalizer: Canonicalizer,
    whitelist: Arc<WhitelistSet>,
    classifier: Arc<dyn Classifier>,
    timeouts: PipelineTimeouts,
}

impl EmailPipeline {
    pub fn new(whitelist: Arc<WhitelistSet>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            extractor: MessageExtractor::new(),
            normalizer: InvisibleNormalizer::new(),
            unwrapper: ForwardUnwrapper::new(),
            canonicalizer: Canonicalizer::new(),
            whitelist,
            classifier,
            timeouts: PipelineTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: PipelineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_unwrapper(mut self, unwrapper: ForwardUnwrapper) -> Self {
        self.unwrapper = unwrapper;
        self
    }

    pub fn model_version(&self) -> &str {
        self.classifier.version()
    }

    pub fn whitelist(&self) -> &WhitelistSet {
        &self.whitelist
    }

    /// RECEIVED → EXTRACTED. Fails only when the bytes are not a message.
    pub fn preprocess(&self, raw: &[u8]) -> Result<ExtractedContent, ParseError> {
        let (parsed, extracted) = self.extractor.extract(raw)?;

        let subject = self.normalizer.normalize(&extracted.subject);
        let body = self.normalizer.normalize(&extracted.body);
        let source = self.normalizer.normalize(&extracted.source);
        if body.is_obfuscated() || subject.is_obfuscated() {
            log::info!(
                "Invisible-content obfuscation removed: {:?}",
                body.obfuscation_indicators
                    .iter()
                    .chain(subject.obfuscation_indicators.iter())
                    .collect::<Vec<_>>()
            );
        }

        let forwarded = self.unwrapper.unwrap(
            &subject.normalized,
            &body.normalized,
            &source.normalized,
            Some(&parsed.headers),
        );
        if forwarded.is_forwarded() {
            log::debug!(
                "Forward unwrapped (rule={:?}, sender={:?})",
                forwarded.matched_rule,
                forwarded.sender
            );
        }

        let canonical_subject = self.canonicalizer.canonicalize(&forwarded.subject);
        let canonical_body = self.canonicalizer.canonicalize(&forwarded.body);
        let quality = if canonical_subject.is_empty() && canonical_body.is_empty() {
            ContentQuality::Degenerate
        } else {
            ContentQuality::Confident
        };

        Ok(ExtractedContent {
            subject: canonical_subject,
            body: canonical_body,
            original_subject: forwarded.subject,
            original_body: forwarded.body,
            original_sender: forwarded.sender,
            message_id: parsed
                .header("message-id")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            forward_rule: forwarded.matched_rule,
            quality,
        })
    }

    /// EXTRACTED → EXEMPT or SCORED. The classifier is only consulted when
    /// the sender is not exempt and there is content left to score.
    pub async fn evaluate(
        &self,
        content: &ExtractedContent,
        direct_sender: &str,
        user_id: i64,
        lookup: &dyn TrustedDomainLookup,
    ) -> Result<(TrustDecision, Verdict, ProcessingState), PipelineError> {
        let trust = TrustResolver::new(&self.whitelist)
            .resolve(
                direct_sender,
                content.original_sender.as_deref(),
                user_id,
                lookup,
                self.timeouts.store,
            )
            .await?;

        if let Some(reason) = trust.exemption {
            return Ok((trust, Verdict::exempt(reason), ProcessingState::Exempt));
        }

        if content.quality == ContentQuality::Degenerate {
            log::warn!(
                "degenerate_content user_id={} sender={}: nothing left to score, defaulting to LOW",
                user_id,
                trust.effective_sender
            );
            return Ok((trust, Verdict::degenerate(), ProcessingState::Scored));
        }

        let prediction = tokio::time::timeout(
            self.timeouts.classifier,
            self.classifier.classify(&content.classifier_text()),
        )
        .await
        .map_err(|_| PipelineError::ClassifierTimeout(self.timeouts.classifier))??;

        if !(0.0..=1.0).contains(&prediction.probability) {
            return Err(ClassifierError::InvalidProbability(prediction.probability).into());
        }

        Ok((trust, Verdict::from_prediction(prediction), ProcessingState::Scored))
    }

    /// Run a message end to end and persist its verdict. Returns only after
    /// the store has acknowledged the record.
    pub async fn process<S>(
        &self,
        raw: &[u8],
        direct_sender: &str,
        user_id: i64,
        store: &S,
    ) -> Result<ProcessedMessage, PipelineError>
    where
        S: TrustedDomainLookup + VerdictStore,
    {
        let content = match self.preprocess(raw) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("REJECTED user_id={} sender={}: {}", user_id, direct_sender, e);
                return Err(e.into());
            }
        };

        let (trust, verdict, state) = self.evaluate(&content, direct_sender, user_id, store).await?;
        log::debug!("Message for user {} reached {:?}", user_id, state);

        let metadata = EventMetadata {
            user_id,
            sender_domain: trust.effective_domain.clone(),
            is_forwarded: content.is_forwarded(),
            message_id_hash: content.message_id.as_deref().map(sha256_hex),
            model_version: self.model_version().to_string(),
        };

        let event_id = tokio::time::timeout(self.timeouts.store, store.record(&verdict, &metadata))
            .await
            .map_err(|_| PipelineError::StoreTimeout(self.timeouts.store))??;

        let tag = if verdict.is_exempt() { "TRUSTED" } else { "PROCESSED" };
        log::info!(
            "{} user_id={} sender={} {}",
            tag,
            user_id,
            trust.effective_sender,
            verdict.summary()
        );

        Ok(ProcessedMessage {
            event_id,
            content,
            effective_sender: trust.effective_sender,
            metadata,
            verdict,
            state: ProcessingState::Logged,
        })
    }
}
