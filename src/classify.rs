// src/classify.rs
//! # Significance Classifier
//! Pure-ish logic that maps `(baseline, candidate)` → verdict + diff summary,
//! filtering cosmetic noise (timestamps, counters, reflows) from substantive
//! content changes. Only the optional semantic judge does I/O.
//!
//! Staged: fingerprint equality → structural-digest short-circuit → token
//! divergence against two thresholds → ambiguous band adjudication.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::store::Snapshot;

/// Outcome of one fetch cycle. The classifier itself only ever produces
/// `Unchanged` / `Trivial` / `Significant`; `Error` and `Unknown` are cycle
/// states recorded by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Unchanged,
    Trivial,
    Significant,
    Error,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The candidate cleaned down to nothing while the baseline has content.
    /// Comparing would read as a total rewrite; the cycle ends in `Error`
    /// instead so a broken fetch cannot evict a good baseline.
    #[error("candidate content is empty against a non-empty baseline")]
    EmptyCandidate,
}

/// Always shipped with a verdict so the dispatcher never re-derives the diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added_spans: usize,
    pub removed_spans: usize,
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: Verdict,
    /// Token divergence in [0, 1]; 0.0 = identical token sets.
    pub divergence: f64,
    pub diff: DiffSummary,
}

/// Verdict from the optional deeper analysis used in the ambiguous band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeVerdict {
    Trivial,
    Significant,
}

/// External adjudicator consulted only when the cheap distance is between the
/// two thresholds. Absent (or failing, or timing out), policy is conservative
/// toward `Significant`.
#[async_trait::async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn judge(&self, baseline: &str, candidate: &str) -> anyhow::Result<JudgeVerdict>;
}

pub struct SignificanceClassifier {
    trivial_threshold: f64,
    significant_threshold: f64,
    judge_timeout: Duration,
    judge: Option<Arc<dyn SemanticJudge>>,
}

impl SignificanceClassifier {
    pub fn new(trivial_threshold: f64, significant_threshold: f64) -> Self {
        Self {
            trivial_threshold,
            significant_threshold,
            judge_timeout: Duration::from_secs(20),
            judge: None,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn SemanticJudge>, timeout: Duration) -> Self {
        self.judge = Some(judge);
        self.judge_timeout = timeout;
        self
    }

    pub async fn classify(
        &self,
        baseline: &Snapshot,
        candidate: &Snapshot,
    ) -> Result<Classification, ClassifyError> {
        // Stage 1: identical normalized content.
        if baseline.fingerprint == candidate.fingerprint {
            return Ok(Classification {
                verdict: Verdict::Unchanged,
                divergence: 0.0,
                diff: DiffSummary::default(),
            });
        }

        if candidate.digest.tokens == 0 && baseline.digest.tokens > 0 {
            return Err(ClassifyError::EmptyCandidate);
        }

        let diff = diff_summary(&baseline.content, &candidate.content);

        // Stage 2a: digest short-circuit. A page that doubled or halved its
        // token count needs no token-level comparison.
        let (lo, hi) = {
            let a = baseline.digest.tokens.max(1) as f64;
            let b = candidate.digest.tokens.max(1) as f64;
            (a.min(b), a.max(b))
        };
        if lo / hi < 0.5 {
            metrics::counter!("classify_digest_shortcircuit_total").increment(1);
            return Ok(Classification {
                verdict: Verdict::Significant,
                divergence: 1.0 - lo / hi,
                diff,
            });
        }

        // Stage 2b: token divergence (strsim on short texts, Jaccard otherwise).
        let divergence = divergence(&baseline.content, &candidate.content);

        let verdict = if divergence <= self.trivial_threshold {
            Verdict::Trivial
        } else if divergence >= self.significant_threshold {
            Verdict::Significant
        } else {
            // Stage 3: ambiguous band.
            self.adjudicate(baseline, candidate).await
        };

        Ok(Classification {
            verdict,
            divergence,
            diff,
        })
    }

    async fn adjudicate(&self, baseline: &Snapshot, candidate: &Snapshot) -> Verdict {
        let Some(judge) = &self.judge else {
            tracing::debug!("ambiguous band without judge; flagging significant");
            return Verdict::Significant;
        };
        let fut = judge.judge(&baseline.content, &candidate.content);
        match tokio::time::timeout(self.judge_timeout, fut).await {
            Ok(Ok(JudgeVerdict::Trivial)) => Verdict::Trivial,
            Ok(Ok(JudgeVerdict::Significant)) => Verdict::Significant,
            Ok(Err(e)) => {
                tracing::warn!("semantic judge failed, flagging significant: {e:#}");
                Verdict::Significant
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.judge_timeout, "semantic judge timed out, flagging significant");
                Verdict::Significant
            }
        }
    }
}

/// Token-set divergence in [0, 1]: `1 - |A ∩ B| / |A ∪ B|`. Short texts use
/// normalized Levenshtein instead, which is more faithful when there are too
/// few tokens for set overlap to mean much.
pub fn divergence(a: &str, b: &str) -> f64 {
    const SHORT_TEXT_CHARS: usize = 120;
    if a.len() <= SHORT_TEXT_CHARS && b.len() <= SHORT_TEXT_CHARS {
        return 1.0 - strsim::normalized_levenshtein(a, b);
    }

    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    1.0 - inter / union
}

/// Line-level diff: spans added/removed plus an excerpt of the largest change.
pub fn diff_summary(old: &str, new: &str) -> DiffSummary {
    const EXCERPT_MAX_CHARS: usize = 200;

    let old_lines: HashSet<&str> = old.lines().filter(|l| !l.trim().is_empty()).collect();
    let new_lines: HashSet<&str> = new.lines().filter(|l| !l.trim().is_empty()).collect();

    let added: Vec<&str> = new_lines.difference(&old_lines).copied().collect();
    let removed: Vec<&str> = old_lines.difference(&new_lines).copied().collect();

    // Prefer what appeared over what vanished; longest line is "largest".
    let excerpt_src = added
        .iter()
        .max_by_key(|l| l.len())
        .or_else(|| removed.iter().max_by_key(|l| l.len()))
        .copied()
        .unwrap_or_default();
    let excerpt: String = excerpt_src.chars().take(EXCERPT_MAX_CHARS).collect();

    DiffSummary {
        added_spans: added.len(),
        removed_spans: removed.len(),
        excerpt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snap(content: &str) -> Snapshot {
        Snapshot::capture(content.to_string(), Utc::now())
    }

    fn classifier() -> SignificanceClassifier {
        SignificanceClassifier::new(0.25, 0.5)
    }

    #[tokio::test]
    async fn equal_fingerprints_are_unchanged() {
        let c = classifier();
        // Same tokens, different whitespace: fingerprints match.
        let out = c.classify(&snap("a b c"), &snap("a  b\nc")).await.unwrap();
        assert_eq!(out.verdict, Verdict::Unchanged);
        assert_eq!(out.divergence, 0.0);
        assert!(out.diff.excerpt.is_empty());
    }

    #[tokio::test]
    async fn timestamp_only_change_is_trivial() {
        let base = "Release notes for version 2.1 of the widget toolkit\n\
                    All platform builds passed certification this cycle\n\
                    Last updated: 2024-01-01";
        let new = base.replace("2024-01-01", "2024-01-02");
        let out = classifier().classify(&snap(base), &snap(&new)).await.unwrap();
        assert_eq!(out.verdict, Verdict::Trivial);
        assert_eq!(out.diff.added_spans, 1);
        assert_eq!(out.diff.removed_spans, 1);
    }

    #[tokio::test]
    async fn inserted_paragraph_is_significant() {
        let base = "Our pricing page lists the standard tier\nContact sales for volume discounts";
        let new = format!(
            "{base}\nBreaking: the enterprise tier now ships with dedicated support and onsite onboarding for all regional customers worldwide"
        );
        let out = classifier().classify(&snap(base), &snap(&new)).await.unwrap();
        assert_eq!(out.verdict, Verdict::Significant);
        assert!(out.diff.excerpt.contains("enterprise tier"));
    }

    #[tokio::test]
    async fn empty_candidate_against_baseline_is_an_error() {
        let err = classifier()
            .classify(&snap("real content here"), &snap(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::EmptyCandidate));
    }

    /// 20 distinct 7-char tokens (never under the short-text Levenshtein
    /// cutoff), with `replaced` of them swapped for fresh tokens.
    fn banded(replaced: usize) -> (String, String) {
        let base: Vec<String> = (0..20).map(|i| format!("word{i:02}x")).collect();
        let mut new = base.clone();
        for (i, slot) in new.iter_mut().take(replaced).enumerate() {
            *slot = format!("novel{i:02}");
        }
        (base.join(" "), new.join(" "))
    }

    #[tokio::test]
    async fn ambiguous_band_without_judge_flags_significant() {
        // 6 of 20 tokens replaced: divergence 1 - 14/26 ≈ 0.46, strictly
        // between thresholds 0.25 and 0.5.
        let (base, new) = banded(6);
        let c = classifier();
        let out = c.classify(&snap(&base), &snap(&new)).await.unwrap();
        assert!(out.divergence > 0.25 && out.divergence < 0.5, "divergence {}", out.divergence);
        assert_eq!(out.verdict, Verdict::Significant);
    }

    struct FixedJudge(JudgeVerdict);

    #[async_trait::async_trait]
    impl SemanticJudge for FixedJudge {
        async fn judge(&self, _b: &str, _c: &str) -> anyhow::Result<JudgeVerdict> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn judge_verdict_wins_in_ambiguous_band() {
        let (base, new) = banded(6);
        let c = SignificanceClassifier::new(0.25, 0.5)
            .with_judge(Arc::new(FixedJudge(JudgeVerdict::Trivial)), Duration::from_secs(1));
        let out = c.classify(&snap(&base), &snap(&new)).await.unwrap();
        assert_eq!(out.verdict, Verdict::Trivial);
    }

    struct StuckJudge;

    #[async_trait::async_trait]
    impl SemanticJudge for StuckJudge {
        async fn judge(&self, _b: &str, _c: &str) -> anyhow::Result<JudgeVerdict> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(JudgeVerdict::Trivial)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_judge_times_out_to_significant() {
        let (base, new) = banded(6);
        let c = SignificanceClassifier::new(0.25, 0.5)
            .with_judge(Arc::new(StuckJudge), Duration::from_millis(50));
        let out = c.classify(&snap(&base), &snap(&new)).await.unwrap();
        assert_eq!(out.verdict, Verdict::Significant);
    }

    #[tokio::test]
    async fn doubled_page_short_circuits_on_digest() {
        let base: String = (0..40).map(|i| format!("token{i} ")).collect();
        let new = format!("{base}{base}extra");
        let out = classifier().classify(&snap(&base), &snap(&new)).await.unwrap();
        assert_eq!(out.verdict, Verdict::Significant);
    }

    #[test]
    fn divergence_is_zero_for_identical_and_one_for_disjoint() {
        let a = "the quick brown fox jumps over the lazy dog again and again today \
                 while the patient observer keeps careful notes on every motion";
        assert_eq!(divergence(a, a), 0.0);
        let b = "completely different vocabulary with zero shared terms whatsoever \
                 describing an unrelated subject in another register entirely here";
        assert!(divergence(a, b) > 0.95);
    }
}
