pub mod classifier;
pub mod components;
pub mod config;
pub mod domain_utils;
pub mod error;
pub mod inbound;
pub mod normalization;
pub mod statistics;
pub mod store;

pub use classifier::{Classifier, LinearModel};
pub use components::decision_engine::{ContentQuality, Label, Prediction, Reason, RiskLevel, Verdict};
pub use components::pipeline::{EmailPipeline, ExtractedContent, PipelineTimeouts, ProcessedMessage, ProcessingState};
pub use components::trust_resolver::{TrustDecision, TrustResolver, WhitelistSet};
pub use config::Config;
pub use error::{ClassifierError, ParseError, PipelineError, StoreError};
pub use inbound::{compose_scan_reply, hash_email, InboundHandler, InboundOutcome, SmtpResponse};
pub use statistics::{StatEvent, StatisticsCollector};
pub use store::{EventMetadata, MemoryStore, SqliteStore, Store, TrustedDomainLookup, UserDirectory, VerdictStore};
