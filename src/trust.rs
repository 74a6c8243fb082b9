//! Trust scoring for extraction patterns.
//!
//! Every Tier-2 verification outcome feeds per-(schema, pattern,
//! language) counters; the derived accuracy decides how much of a
//! pattern's future output gets sampled for verification. Counters are
//! atomics so pipeline workers can record outcomes without taking the
//! map lock for every event.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

// ── Levels ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Trusted,
    High,
    Medium,
    Low,
}

impl TrustLevel {
    /// Fraction of Tier-1 output sampled for Tier-2 verification.
    pub fn sample_rate(&self) -> f64 {
        match self {
            TrustLevel::Trusted => 0.05,
            TrustLevel::High => 0.2,
            TrustLevel::Medium => 0.5,
            TrustLevel::Low => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::High => "high",
            TrustLevel::Medium => "medium",
            TrustLevel::Low => "low",
        }
    }

    /// Level for an observed accuracy and sample volume. The single
    /// source of the threshold table; persistence rehydrates through it.
    pub fn from_stats(accuracy: f64, total: u64) -> Self {
        if accuracy >= 0.95 && total >= 100 {
            TrustLevel::Trusted
        } else if accuracy >= 0.90 && total >= 50 {
            TrustLevel::High
        } else if accuracy >= 0.80 && total >= 20 {
            TrustLevel::Medium
        } else {
            TrustLevel::Low
        }
    }
}

/// Outcome of one Tier-2 verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Verified,
    Corrected,
    Rejected,
}

// ── Keys and counters ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustKey {
    pub schema_id: String,
    pub pattern_id: String,
    pub language: String,
}

impl TrustKey {
    pub fn new(schema_id: &str, pattern_id: &str, language: &str) -> Self {
        Self {
            schema_id: schema_id.to_string(),
            pattern_id: pattern_id.to_string(),
            language: language.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    corrected: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn accuracy(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let bad = self.corrected.load(Ordering::Relaxed) + self.rejected.load(Ordering::Relaxed);
        (total.saturating_sub(bad)) as f64 / total as f64
    }
}

/// Point-in-time view of one key's counters, used for persistence and
/// for the `trust` CLI report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    #[serde(flatten)]
    pub key: TrustKey,
    pub total: u64,
    pub corrected: u64,
    pub rejected: u64,
    pub accuracy: f64,
    pub level: TrustLevel,
}

// ── Engine ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TrustEngine {
    inner: RwLock<HashMap<TrustKey, Arc<Counters>>>,
}

impl TrustEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, key: &TrustKey) -> Arc<Counters> {
        if let Some(c) = self.inner.read().expect("trust map poisoned").get(key) {
            return Arc::clone(c);
        }
        let mut map = self.inner.write().expect("trust map poisoned");
        Arc::clone(map.entry(key.clone()).or_default())
    }

    /// Record one verification outcome. Every verified sample counts
    /// toward the total; corrections and rejections also count against
    /// accuracy.
    pub fn record(&self, key: &TrustKey, status: VerifyStatus) {
        let c = self.counters(key);
        c.total.fetch_add(1, Ordering::Relaxed);
        match status {
            VerifyStatus::Verified => {}
            VerifyStatus::Corrected => {
                c.corrected.fetch_add(1, Ordering::Relaxed);
            }
            VerifyStatus::Rejected => {
                c.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn accuracy(&self, key: &TrustKey) -> f64 {
        self.counters(key).accuracy()
    }

    pub fn level(&self, key: &TrustKey) -> TrustLevel {
        let c = self.counters(key);
        TrustLevel::from_stats(c.accuracy(), c.total.load(Ordering::Relaxed))
    }

    /// Sampling rate for the key's current level.
    pub fn sample_rate(&self, key: &TrustKey) -> f64 {
        self.level(key).sample_rate()
    }

    pub fn snapshot(&self) -> Vec<TrustSnapshot> {
        let map = self.inner.read().expect("trust map poisoned");
        let mut rows: Vec<TrustSnapshot> = map
            .iter()
            .map(|(key, c)| {
                let total = c.total.load(Ordering::Relaxed);
                let accuracy = c.accuracy();
                TrustSnapshot {
                    key: key.clone(),
                    total,
                    corrected: c.corrected.load(Ordering::Relaxed),
                    rejected: c.rejected.load(Ordering::Relaxed),
                    accuracy,
                    level: TrustLevel::from_stats(accuracy, total),
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.key.schema_id, &a.key.pattern_id).cmp(&(&b.key.schema_id, &b.key.pattern_id))
        });
        rows
    }

    /// Restore counters from persisted snapshots.
    pub fn load(&self, rows: Vec<TrustSnapshot>) {
        let mut map = self.inner.write().expect("trust map poisoned");
        for row in rows {
            let c = Counters {
                total: AtomicU64::new(row.total),
                corrected: AtomicU64::new(row.corrected),
                rejected: AtomicU64::new(row.rejected),
            };
            map.insert(row.key, Arc::new(c));
        }
    }
}

// ── Sampling ─────────────────────────────────────────────────────────

/// Cheap deterministic sampler (xorshift64). Seeded per run so tests
/// can pin the sequence.
#[derive(Debug)]
pub struct Sampler {
    state: u64,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Returns true with probability `rate`.
    pub fn sample(&mut self, rate: f64) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        (self.next_u64() as f64 / u64::MAX as f64) < rate
    }
}

// ── Schema health ────────────────────────────────────────────────────

/// Thresholds for flagging unhealthy schemas in the trust report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub low_trust: f64,
    pub correction_rate: f64,
    pub rejection_rate: f64,
    pub min_samples: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            low_trust: 0.7,
            correction_rate: 0.1,
            rejection_rate: 0.05,
            min_samples: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHealth {
    pub schema_id: String,
    pub total: u64,
    pub corrected: u64,
    pub rejected: u64,
    pub accuracy: f64,
    /// Issues that crossed a threshold, empty when healthy.
    pub issues: Vec<String>,
}

impl SchemaHealth {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Aggregate pattern snapshots per schema, weighted by sample totals,
/// and flag schemas that crossed a health threshold. Schemas with fewer
/// than `min_samples` verifications are never flagged.
pub fn schema_health(
    snapshots: &[TrustSnapshot],
    thresholds: &HealthThresholds,
) -> Vec<SchemaHealth> {
    let mut agg: HashMap<&str, (u64, u64, u64)> = HashMap::new();
    for snap in snapshots {
        let entry = agg.entry(snap.key.schema_id.as_str()).or_default();
        entry.0 += snap.total;
        entry.1 += snap.corrected;
        entry.2 += snap.rejected;
    }

    let mut out: Vec<SchemaHealth> = agg
        .into_iter()
        .map(|(schema_id, (total, corrected, rejected))| {
            let accuracy = if total == 0 {
                1.0
            } else {
                (total.saturating_sub(corrected + rejected)) as f64 / total as f64
            };
            let mut issues = Vec::new();
            if total >= thresholds.min_samples {
                if accuracy < thresholds.low_trust {
                    issues.push(format!("accuracy {accuracy:.2} below {}", thresholds.low_trust));
                }
                if corrected as f64 / total as f64 > thresholds.correction_rate {
                    issues.push(format!(
                        "correction rate {:.2} above {}",
                        corrected as f64 / total as f64,
                        thresholds.correction_rate
                    ));
                }
                if rejected as f64 / total as f64 > thresholds.rejection_rate {
                    issues.push(format!(
                        "rejection rate {:.2} above {}",
                        rejected as f64 / total as f64,
                        thresholds.rejection_rate
                    ));
                }
            }
            SchemaHealth {
                schema_id: schema_id.to_string(),
                total,
                corrected,
                rejected,
                accuracy,
                issues,
            }
        })
        .collect();
    out.sort_by(|a, b| a.schema_id.cmp(&b.schema_id));
    out
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TrustKey {
        TrustKey::new("base-python", "base-python:function:1", "python")
    }

    #[test]
    fn test_new_key_starts_low_with_full_sampling() {
        let engine = TrustEngine::new();
        assert_eq!(engine.level(&key()), TrustLevel::Low);
        assert_eq!(engine.sample_rate(&key()), 1.0);
        assert_eq!(engine.accuracy(&key()), 1.0);
    }

    #[test]
    fn test_accuracy_counts_corrections_and_rejections() {
        let engine = TrustEngine::new();
        let k = key();
        for _ in 0..90 {
            engine.record(&k, VerifyStatus::Verified);
        }
        for _ in 0..6 {
            engine.record(&k, VerifyStatus::Corrected);
        }
        for _ in 0..4 {
            engine.record(&k, VerifyStatus::Rejected);
        }
        assert!((engine.accuracy(&k) - 0.9).abs() < 1e-9);
        assert_eq!(engine.level(&k), TrustLevel::High);
        assert_eq!(engine.sample_rate(&k), 0.2);
    }

    #[test]
    fn test_level_needs_volume_not_just_accuracy() {
        let engine = TrustEngine::new();
        let k = key();
        for _ in 0..10 {
            engine.record(&k, VerifyStatus::Verified);
        }
        // Perfect accuracy but too few samples.
        assert_eq!(engine.level(&k), TrustLevel::Low);
        for _ in 0..90 {
            engine.record(&k, VerifyStatus::Verified);
        }
        assert_eq!(engine.level(&k), TrustLevel::Trusted);
        assert_eq!(engine.sample_rate(&k), 0.05);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let engine = TrustEngine::new();
        let k = key();
        for _ in 0..25 {
            engine.record(&k, VerifyStatus::Verified);
        }
        engine.record(&k, VerifyStatus::Rejected);

        let rows = engine.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, 26);
        assert_eq!(rows[0].rejected, 1);

        let restored = TrustEngine::new();
        restored.load(rows);
        assert_eq!(restored.accuracy(&k), engine.accuracy(&k));
        assert_eq!(restored.level(&k), engine.level(&k));
    }

    #[test]
    fn test_sampler_rates() {
        let mut s = Sampler::new(42);
        assert!(s.sample(1.0));
        assert!(!s.sample(0.0));

        let mut s = Sampler::new(7);
        let hits = (0..10_000).filter(|_| s.sample(0.2)).count();
        assert!((1_500..2_500).contains(&hits), "got {hits}");
    }

    #[test]
    fn test_schema_health_flags() {
        let snapshots = vec![
            TrustSnapshot {
                key: key(),
                total: 100,
                corrected: 15,
                rejected: 10,
                accuracy: 0.75,
                level: TrustLevel::Low,
            },
            TrustSnapshot {
                key: TrustKey::new("base-rust", "base-rust:function:1", "rust"),
                total: 100,
                corrected: 0,
                rejected: 0,
                accuracy: 1.0,
                level: TrustLevel::Trusted,
            },
        ];
        let report = schema_health(&snapshots, &HealthThresholds::default());
        assert_eq!(report.len(), 2);
        let python = report.iter().find(|h| h.schema_id == "base-python").unwrap();
        assert!(!python.is_healthy());
        assert_eq!(python.issues.len(), 2);
        let rust = report.iter().find(|h| h.schema_id == "base-rust").unwrap();
        assert!(rust.is_healthy());
    }

    #[test]
    fn test_small_schemas_never_flagged() {
        let snapshots = vec![TrustSnapshot {
            key: key(),
            total: 10,
            corrected: 5,
            rejected: 3,
            accuracy: 0.2,
            level: TrustLevel::Low,
        }];
        let report = schema_health(&snapshots, &HealthThresholds::default());
        assert!(report[0].is_healthy());
    }
}
