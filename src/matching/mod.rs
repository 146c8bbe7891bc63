use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ColumnPair, ReconcileConfig};
use crate::error::{EngineError, EngineResult};
use crate::metrics::memory_stats_mb;
use crate::models::{FieldDifference, Record, UnmatchedRecord};

pub mod compare;
pub mod key;
pub mod rayon_pool;

pub use compare::values_equal;
pub use key::{composite_key, KEY_SEPARATOR};

/// A back-office/partner pair with the same composite key. An empty
/// difference list is a clean match; a non-empty one is a mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub bo: Record,
    pub partner: Record,
    pub differences: Vec<FieldDifference>,
}

impl MatchedPair {
    pub fn is_clean(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Bucketed output of one reconciliation run. Every bucket preserves the
/// insertion order of its input side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub matches: Vec<MatchedPair>,
    pub bo_only: Vec<UnmatchedRecord>,
    pub partner_only: Vec<UnmatchedRecord>,
}

impl ReconcileOutcome {
    pub fn clean_match_count(&self) -> usize {
        self.matches.iter().filter(|m| m.is_clean()).count()
    }

    pub fn mismatch_count(&self) -> usize {
        self.matches.iter().filter(|m| !m.is_clean()).count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    /// Emit a progress update at least every this many partner records.
    pub update_every: usize,
    /// Records handled between cancellation checks.
    pub batch_size: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { update_every: 1000, batch_size: 1000 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    pub percent: f32,
    pub eta_secs: u64,
    pub mem_used_mb: u64,
    pub mem_avail_mb: u64,
    pub stage: &'static str,
}

/// Cooperative cancellation handle, polled at batch boundaries only —
/// never mid-comparison.
#[derive(Clone, Debug, Default)]
pub struct ReconcileControl {
    cancel: Arc<AtomicBool>,
}

impl ReconcileControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

fn progress_update(processed: usize, total: usize, start: &Instant, stage: &'static str) -> ProgressUpdate {
    let frac = if total == 0 { 1.0 } else { (processed as f32 / total as f32).clamp(0.0, 1.0) };
    let eta_secs = if frac > 0.0 && frac < 1.0 {
        (start.elapsed().as_secs_f32() * (1.0 - frac) / frac) as u64
    } else {
        0
    };
    let mem = memory_stats_mb();
    ProgressUpdate {
        processed,
        total,
        percent: frac * 100.0,
        eta_secs,
        mem_used_mb: mem.used_mb,
        mem_avail_mb: mem.avail_mb,
        stage,
    }
}

/// Comparison column pairs for one matched pair: the configured list, or
/// the union of both rows' columns by identical name (BO columns first,
/// then partner-only columns, first-seen order).
fn comparison_pairs(cfg: &ReconcileConfig, bo: &Record, partner: &Record) -> Vec<ColumnPair> {
    if !cfg.compare_pairs.is_empty() {
        return cfg.compare_pairs.clone();
    }
    let mut pairs: Vec<ColumnPair> = bo
        .columns()
        .iter()
        .map(|c| ColumnPair::new(c.clone(), c.clone()))
        .collect();
    for c in partner.columns() {
        if !bo.contains_column(c) {
            pairs.push(ColumnPair::new(c.clone(), c.clone()));
        }
    }
    pairs
}

fn field_differences(cfg: &ReconcileConfig, bo: &Record, partner: &Record) -> Vec<FieldDifference> {
    let mut diffs = Vec::new();
    for pair in comparison_pairs(cfg, bo, partner) {
        let bo_value = bo.get(&pair.bo).unwrap_or("");
        let partner_value = partner.get(&pair.partner).unwrap_or("");
        if !values_equal(bo_value, partner_value, cfg.tolerance) {
            let field_name = if pair.bo == pair.partner {
                pair.bo.clone()
            } else {
                format!("{}/{}", pair.bo, pair.partner)
            };
            diffs.push(FieldDifference {
                field_name,
                bo_value: bo_value.to_string(),
                partner_value: partner_value.to_string(),
            });
        }
    }
    diffs
}

fn bo_additional_columns(cfg: &ReconcileConfig) -> Vec<String> {
    cfg.additional_key_pairs.iter().map(|p| p.bo.clone()).collect()
}

fn partner_additional_columns(cfg: &ReconcileConfig) -> Vec<String> {
    cfg.additional_key_pairs.iter().map(|p| p.partner.clone()).collect()
}

/// Reconcile the two extracts.
///
/// Indexes the BO side by composite key (duplicate keys kept as separate
/// candidates), scans the partner side pairing each row with the first
/// unconsumed candidate, then sweeps never-consumed BO rows into `bo_only`.
/// Rows without a usable key degrade to their side's only-bucket with a
/// diagnostic note; nothing aborts the batch. The only error path is
/// cooperative cancellation, checked between batches.
pub fn reconcile<F>(
    bo: &[Record],
    partner: &[Record],
    cfg: &ReconcileConfig,
    pcfg: ProgressConfig,
    on_progress: F,
    ctrl: Option<&ReconcileControl>,
) -> EngineResult<ReconcileOutcome>
where
    F: Fn(ProgressUpdate),
{
    cfg.validate()?;
    let start = Instant::now();
    let total = partner.len();
    on_progress(progress_update(0, total, &start, "indexing"));

    // Key precomputation is embarrassingly parallel; the scan below is not.
    let pool = rayon_pool::recon_pool();
    let bo_add = bo_additional_columns(cfg);
    let partner_add = partner_additional_columns(cfg);
    let (bo_keys, partner_keys): (Vec<Option<String>>, Vec<Option<String>>) = pool.install(|| {
        let bk = bo
            .par_iter()
            .map(|r| composite_key(r, &cfg.bo_key_column, &bo_add))
            .collect();
        let pk = partner
            .par_iter()
            .map(|r| composite_key(r, &cfg.partner_key_column, &partner_add))
            .collect();
        (bk, pk)
    });

    // key -> BO candidate indices, first-seen order preserved
    let mut index: HashMap<&str, Vec<usize>> = HashMap::with_capacity(bo.len());
    for (i, k) in bo_keys.iter().enumerate() {
        if let Some(k) = k {
            index.entry(k.as_str()).or_default().push(i);
        }
    }
    let mut consumed = vec![false; bo.len()];

    let mut outcome = ReconcileOutcome::default();
    let batch = pcfg.batch_size.max(1);
    let mut last_update = 0usize;
    let mut processed = 0usize;

    for (chunk_start, chunk) in partner.chunks(batch).enumerate().map(|(i, c)| (i * batch, c)) {
        if let Some(c) = ctrl {
            if c.is_cancelled() {
                return Err(EngineError::Cancelled(format!(
                    "reconciliation cancelled after {} of {} partner records",
                    chunk_start, total
                )));
            }
        }
        for (offset, rec) in chunk.iter().enumerate() {
            let pk = &partner_keys[chunk_start + offset];
            match pk {
                None => outcome.partner_only.push(UnmatchedRecord::noted(
                    rec.clone(),
                    format!("missing or blank key column `{}`", cfg.partner_key_column),
                )),
                Some(k) => {
                    let hit = index
                        .get(k.as_str())
                        .and_then(|cands| cands.iter().copied().find(|&i| !consumed[i]));
                    match hit {
                        Some(i) => {
                            consumed[i] = true;
                            let differences = field_differences(cfg, &bo[i], rec);
                            outcome.matches.push(MatchedPair {
                                bo: bo[i].clone(),
                                partner: rec.clone(),
                                differences,
                            });
                        }
                        None => outcome.partner_only.push(UnmatchedRecord::plain(rec.clone())),
                    }
                }
            }
        }
        processed = (chunk_start + chunk.len()).min(total);
        if processed - last_update >= pcfg.update_every || processed == total {
            on_progress(progress_update(processed, total, &start, "matching"));
            last_update = processed;
        }
    }

    // Never-consumed BO rows, swept in input order.
    for (i, rec) in bo.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        match &bo_keys[i] {
            None => outcome.bo_only.push(UnmatchedRecord::noted(
                rec.clone(),
                format!("missing or blank key column `{}`", cfg.bo_key_column),
            )),
            Some(_) => outcome.bo_only.push(UnmatchedRecord::plain(rec.clone())),
        }
    }

    on_progress(progress_update(total, total, &start, "complete"));
    Ok(outcome)
}
