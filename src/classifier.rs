//! Classifier capability and the bundled linear text model.
//!
//! The pipeline only depends on [`Classifier`]; any scorer that maps text to
//! a label plus the probability of that label can be plugged in.

use crate::components::decision_engine::{Label, Prediction};
use crate::error::ClassifierError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

lazy_static! {
    static ref WORD_TOKEN: Regex = Regex::new(r"\b\w\w+\b").unwrap();
}

/// External scoring function. Must be deterministic for identical input and
/// model version, and safe to call from concurrent pipelines.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Version tag persisted with every verdict scored by this classifier.
    fn version(&self) -> &str;

    /// Predicted label and the probability of that label.
    async fn classify(&self, text: &str) -> Result<Prediction, ClassifierError>;
}

#[derive(Debug, Clone, Deserialize)]
struct ModelFile {
    #[serde(default)]
    version: Option<String>,
    intercept: f64,
    /// token → `[idf, weight]`
    vocabulary: HashMap<String, [f64; 2]>,
    #[serde(default = "default_ngram_max")]
    ngram_max: usize,
}

fn default_ngram_max() -> usize {
    1
}

#[derive(Debug, Clone, Copy)]
struct TermWeight {
    idf: f64,
    weight: f64,
}

/// TF-IDF features with L2 normalisation fed to a logistic regression.
#[derive(Debug, Clone)]
pub struct LinearModel {
    version: String,
    intercept: f64,
    ngram_max: usize,
    vocabulary: HashMap<String, TermWeight>,
}

impl LinearModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        let load_error = |reason: String| ClassifierError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        let model = Self::from_json(&content, &stem).map_err(|e| match e {
            ClassifierError::ModelLoad { reason, .. } => load_error(reason),
            other => other,
        })?;
        log::info!(
            "Loaded linear model '{}' with {} terms (ngram_max={})",
            model.version,
            model.vocabulary.len(),
            model.ngram_max
        );
        Ok(model)
    }

    /// Parse a JSON model export. `fallback_version` is used when the
    /// export carries no `version` field.
    pub fn from_json(json: &str, fallback_version: &str) -> Result<Self, ClassifierError> {
        let file: ModelFile = serde_json::from_str(json).map_err(|e| ClassifierError::ModelLoad {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;

        if file.ngram_max == 0 {
            return Err(ClassifierError::ModelLoad {
                path: "<inline>".to_string(),
                reason: "ngram_max must be at least 1".to_string(),
            });
        }

        let vocabulary = file
            .vocabulary
            .into_iter()
            .map(|(term, [idf, weight])| (term.to_lowercase(), TermWeight { idf, weight }))
            .collect();

        Ok(Self {
            version: file
                .version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback_version.to_string()),
            intercept: file.intercept,
            ngram_max: file.ngram_max,
            vocabulary,
        })
    }

    /// Override the version tag persisted with verdicts.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn terms(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = WORD_TOKEN.find_iter(&lowered).map(|m| m.as_str()).collect();

        let mut terms = Vec::new();
        for n in 1..=self.ngram_max {
            for window in words.windows(n) {
                terms.push(window.join(" "));
            }
        }
        terms
    }

    /// Logistic probability of the phishing class. Terms are summed in
    /// sorted order so identical text always yields identical bits.
    pub fn phishing_probability(&self, text: &str) -> f64 {
        let mut counts: BTreeMap<String, f64> = BTreeMap::new();
        for term in self.terms(text) {
            if self.vocabulary.contains_key(&term) {
                *counts.entry(term).or_insert(0.0) += 1.0;
            }
        }

        let features: Vec<(f64, f64)> = counts
            .iter()
            .filter_map(|(term, tf)| {
                self.vocabulary
                    .get(term)
                    .map(|tw| (tf * tw.idf, tw.weight))
            })
            .collect();

        let norm = features.iter().map(|(v, _)| v * v).sum::<f64>().sqrt();
        let mut score = self.intercept;
        if norm > 0.0 {
            score += features.iter().map(|(v, w)| (v / norm) * w).sum::<f64>();
        }

        1.0 / (1.0 + (-score).exp())
    }

    pub fn predict(&self, text: &str) -> Prediction {
        let p = self.phishing_probability(text);
        if p >= 0.5 {
            Prediction::new(Label::Phishing, p)
        } else {
            Prediction::new(Label::Legitimate, 1.0 - p)
        }
    }
}

#[async_trait]
impl Classifier for LinearModel {
    fn version(&self) -> &str {
        &self.version
    }

    async fn classify(&self, text: &str) -> Result<Prediction, ClassifierError> {
        let prediction = self.predict(text);
        if !prediction.probability.is_finite() {
            return Err(ClassifierError::InvalidProbability(prediction.probability));
        }
        log::debug!(
            "Model {} predicted {} ({:.4})",
            self.version,
            prediction.label,
            prediction.probability
        );
        Ok(prediction)
    }
}
