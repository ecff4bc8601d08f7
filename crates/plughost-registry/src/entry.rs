//! Registry records and derived classifications.
//!
//! A [`PluginEntry`] wraps a manifest with install provenance and usage
//! statistics.  [`Rarity`] and the overall score are derived on demand from
//! the stored fields and never persisted.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::PluginManifest;

/// Weight kept from the previous value in every moving average.
const EMA_KEEP: f64 = 0.9;

/// Weight given to the newest sample in every moving average.
const EMA_SAMPLE: f64 = 0.1;

/// Prefix that marks a source as a local directory rather than a git URL.
pub const LOCAL_SOURCE_PREFIX: &str = "local:";

// ---------------------------------------------------------------------------
// PluginEntry
// ---------------------------------------------------------------------------

/// One installed plugin, keyed by `manifest.id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub manifest: PluginManifest,
    /// Git URL or `local:<path>`.
    pub source: String,
    /// Install directory.
    pub local_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Number of recorded executions.  Only ever grows.
    pub usage_count: u64,
    /// Inactive entries are kept for inspection but never executed.
    pub is_active: bool,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
}

impl PluginEntry {
    /// Build a fresh entry with zeroed statistics.
    pub fn new(manifest: PluginManifest, source: impl Into<String>, local_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            manifest,
            source: source.into(),
            local_path,
            installed_at: now,
            last_updated: now,
            usage_count: 0,
            is_active: true,
            performance_metrics: PerformanceMetrics::default(),
        }
    }

    /// The registry key.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Whether the entry was installed from a local directory.
    pub fn is_local(&self) -> bool {
        self.source.starts_with(LOCAL_SOURCE_PREFIX)
    }

    /// Derived rarity tier.
    pub fn rarity(&self) -> Rarity {
        Rarity::classify(self.usage_count, self.manifest.capability_count())
    }

    /// Ranking score used for search ordering.
    ///
    /// `capabilities * 10 + min(usage / 10, 50) + success_rate * 40`
    pub fn overall_score(&self) -> f64 {
        let capability_score = self.manifest.capability_count() as f64 * 10.0;
        let usage_score = (self.usage_count as f64 / 10.0).min(50.0);
        let reliability_score = self.performance_metrics.success_rate * 40.0;
        capability_score + usage_score + reliability_score
    }

    /// Record one execution outcome.
    pub(crate) fn record(&mut self, success: bool, duration: Option<Duration>) {
        self.usage_count = self.usage_count.saturating_add(1);
        self.performance_metrics.record(success, duration);
    }

    /// Case-insensitive substring match over name, description and
    /// capabilities.  `needle` must already be lowercase.
    pub(crate) fn matches(&self, needle: &str) -> bool {
        self.manifest.name.to_lowercase().contains(needle)
            || self.manifest.description.to_lowercase().contains(needle)
            || self
                .manifest
                .capabilities
                .iter()
                .any(|c| c.to_lowercase().contains(needle))
    }
}

// ---------------------------------------------------------------------------
// PerformanceMetrics
// ---------------------------------------------------------------------------

/// Rolling execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Exponential moving average of successes, always within `[0, 1]`.
    pub success_rate: f64,
    /// Exponential moving average of call latency in milliseconds.
    #[serde(default)]
    pub avg_duration_ms: f64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_duration_ms: 0.0,
            last_used: None,
        }
    }
}

impl PerformanceMetrics {
    fn record(&mut self, success: bool, duration: Option<Duration>) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * EMA_KEEP + sample * EMA_SAMPLE).clamp(0.0, 1.0);

        if let Some(duration) = duration {
            let ms = duration.as_secs_f64() * 1000.0;
            self.avg_duration_ms = if self.last_used.is_none() {
                ms
            } else {
                self.avg_duration_ms * EMA_KEEP + ms * EMA_SAMPLE
            };
        }

        self.last_used = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Rarity
// ---------------------------------------------------------------------------

/// Collection tier derived from usage and capability count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    /// Every tier, lowest first.
    pub const ALL: [Rarity; 5] = [
        Rarity::Common,
        Rarity::Uncommon,
        Rarity::Rare,
        Rarity::Epic,
        Rarity::Legendary,
    ];

    /// Classify a plugin.  Rules are evaluated in order; first match wins.
    pub fn classify(usage_count: u64, capability_count: usize) -> Self {
        if usage_count > 500 && capability_count > 5 {
            Self::Legendary
        } else if (usage_count > 500 && capability_count > 3)
            || (usage_count > 100 && capability_count > 3)
        {
            Self::Epic
        } else if usage_count > 100 {
            Self::Rare
        } else if usage_count > 10 {
            Self::Uncommon
        } else {
            Self::Common
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Uncommon => "uncommon",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
