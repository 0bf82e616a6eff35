use crate::components::decision_engine::{Label, Reason, RiskLevel, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalStats {
    pub total_emails: u64,
    pub phishing: u64,
    pub legitimate: u64,
    pub degenerate: u64,
    pub rejected: u64, // unregistered sender or unparseable message
    pub failed: u64,   // classifier/store failures answered with a temporary error
    pub by_reason: BTreeMap<String, u64>,
    pub by_risk: BTreeMap<String, u64>,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GlobalStats {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            total_emails: 0,
            phishing: 0,
            legitimate: 0,
            degenerate: 0,
            rejected: 0,
            failed: 0,
            by_reason: BTreeMap::new(),
            by_risk: BTreeMap::new(),
            start_time: now,
            last_updated: now,
        }
    }

    pub fn count_for_reason(&self, reason: Reason) -> u64 {
        self.by_reason.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn count_for_risk(&self, risk: RiskLevel) -> u64 {
        self.by_risk.get(risk.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    Verdict(Verdict),
    Rejected,
    Failed,
}

/// In-process outcome counters, shared by all concurrent pipelines.
pub struct StatisticsCollector {
    stats: Mutex<GlobalStats>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(GlobalStats::new()),
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        let Ok(mut stats) = self.stats.lock() else {
            log::warn!("Statistics lock poisoned, dropping event");
            return;
        };
        stats.last_updated = Utc::now();
        stats.total_emails += 1;

        match event {
            StatEvent::Verdict(verdict) => {
                match verdict.predicted_label {
                    Label::Phishing => stats.phishing += 1,
                    Label::Legitimate => stats.legitimate += 1,
                }
                if verdict.is_degenerate() {
                    stats.degenerate += 1;
                }
                *stats
                    .by_reason
                    .entry(verdict.reason.as_str().to_string())
                    .or_insert(0) += 1;
                *stats
                    .by_risk
                    .entry(verdict.risk_level.as_str().to_string())
                    .or_insert(0) += 1;
            }
            StatEvent::Rejected => stats.rejected += 1,
            StatEvent::Failed => stats.failed += 1,
        }
    }

    pub fn snapshot(&self) -> GlobalStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn print_summary(&self) {
        let stats = self.snapshot();
        println!("📊 Processing statistics");
        println!("   Emails seen:      {}", stats.total_emails);
        println!("   Phishing:         {}", stats.phishing);
        println!("   Legitimate:       {}", stats.legitimate);
        println!("   Degenerate:       {}", stats.degenerate);
        println!("   Rejected:         {}", stats.rejected);
        println!("   Temporary errors: {}", stats.failed);
        for (reason, count) in &stats.by_reason {
            println!("   via {:<18} {}", reason, count);
        }
        for (risk, count) in &stats.by_risk {
            println!("   risk {:<17} {}", risk, count);
        }
    }

    pub fn log_summary(&self) {
        let stats = self.snapshot();
        log::info!(
            "Statistics: total={} phishing={} legitimate={} degenerate={} rejected={} failed={}",
            stats.total_emails,
            stats.phishing,
            stats.legitimate,
            stats.degenerate,
            stats.rejected,
            stats.failed
        );
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
