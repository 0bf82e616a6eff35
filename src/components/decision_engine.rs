//! Decision Engine Component
//!
//! Turns a trust outcome or a classifier prediction into the final verdict
//! and maps the phishing probability onto a risk tier.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HIGH_RISK_THRESHOLD: f64 = 0.85;
pub const MEDIUM_RISK_THRESHOLD: f64 = 0.55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Phishing,
    Legitimate,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Phishing => "phishing",
            Label::Legitimate => "legitimate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "phishing" => Some(Label::Phishing),
            "legitimate" => Some(Label::Legitimate),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Tier boundaries are closed on the lower bound.
    pub fn from_probability(phishing_probability: f64) -> Self {
        if phishing_probability >= HIGH_RISK_THRESHOLD {
            RiskLevel::High
        } else if phishing_probability >= MEDIUM_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    WhitelistedDomain,
    TrustedDomain,
    ModelPrediction,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::WhitelistedDomain => "whitelisted_domain",
            Reason::TrustedDomain => "trusted_domain",
            Reason::ModelPrediction => "model_prediction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "whitelisted_domain" => Some(Reason::WhitelistedDomain),
            "trusted_domain" => Some(Reason::TrustedDomain),
            "model_prediction" => Some(Reason::ModelPrediction),
            _ => None,
        }
    }

    pub fn is_exemption(&self) -> bool {
        !matches!(self, Reason::ModelPrediction)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Whether the verdict rests on real content or on the degenerate-content policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentQuality {
    #[default]
    Confident,
    Degenerate,
}

/// Raw classifier output: the predicted label and the probability of that label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: Label,
    pub probability: f64,
}

impl Prediction {
    pub fn new(label: Label, probability: f64) -> Self {
        Self { label, probability }
    }

    /// Probability of the phishing class, whatever label was predicted.
    pub fn phishing_probability(&self) -> f64 {
        match self.label {
            Label::Phishing => self.probability,
            Label::Legitimate => 1.0 - self.probability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub predicted_label: Label,
    pub phishing_probability: f64,
    pub risk_level: RiskLevel,
    pub reason: Reason,
    #[serde(default)]
    pub quality: ContentQuality,
}

impl Verdict {
    /// Verdict for a sender whose domain is whitelisted or trusted; the
    /// classifier is never consulted.
    pub fn exempt(reason: Reason) -> Self {
        Self {
            predicted_label: Label::Legitimate,
            phishing_probability: 0.0,
            risk_level: RiskLevel::Low,
            reason,
            quality: ContentQuality::Confident,
        }
    }

    pub fn from_prediction(prediction: Prediction) -> Self {
        let phishing_probability = prediction.phishing_probability().clamp(0.0, 1.0);
        Self {
            predicted_label: prediction.label,
            phishing_probability,
            risk_level: RiskLevel::from_probability(phishing_probability),
            reason: Reason::ModelPrediction,
            quality: ContentQuality::Confident,
        }
    }

    /// Low-confidence outcome when canonicalization left nothing to score.
    pub fn degenerate() -> Self {
        Self {
            predicted_label: Label::Legitimate,
            phishing_probability: 0.0,
            risk_level: RiskLevel::Low,
            reason: Reason::ModelPrediction,
            quality: ContentQuality::Degenerate,
        }
    }

    pub fn is_exempt(&self) -> bool {
        self.reason.is_exemption()
    }

    pub fn is_degenerate(&self) -> bool {
        self.quality == ContentQuality::Degenerate
    }

    pub fn is_phishing(&self) -> bool {
        self.predicted_label == Label::Phishing
    }

    /// One-line summary used in log lines and replies.
    pub fn summary(&self) -> String {
        format!(
            "label={} phishing_probability={:.4} risk={} reason={}",
            self.predicted_label, self.phishing_probability, self.risk_level, self.reason
        )
    }
}
