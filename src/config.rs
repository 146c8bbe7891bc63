use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A (back-office column, partner column) pairing used both for additional
/// key components and for value comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPair {
    pub bo: String,
    pub partner: String,
}

impl ColumnPair {
    pub fn new(bo: impl Into<String>, partner: impl Into<String>) -> Self {
        Self {
            bo: bo.into(),
            partner: partner.into(),
        }
    }
}

/// Matching configuration for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Primary key column on the back-office side.
    pub bo_key_column: String,
    /// Primary key column on the partner side.
    pub partner_key_column: String,
    /// Further key components, in order. A record missing one of these
    /// contributes an empty segment; it is not excluded.
    #[serde(default)]
    pub additional_key_pairs: Vec<ColumnPair>,
    /// Columns compared on matched pairs. Empty means "union of both rows'
    /// columns by identical name".
    #[serde(default)]
    pub compare_pairs: Vec<ColumnPair>,
    /// Maximum numeric difference still considered equal.
    #[serde(default)]
    pub tolerance: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            bo_key_column: String::new(),
            partner_key_column: String::new(),
            additional_key_pairs: Vec::new(),
            compare_pairs: Vec::new(),
            tolerance: 0.0,
        }
    }
}

impl ReconcileConfig {
    pub fn new(bo_key_column: impl Into<String>, partner_key_column: impl Into<String>) -> Self {
        Self {
            bo_key_column: bo_key_column.into(),
            partner_key_column: partner_key_column.into(),
            ..Default::default()
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_key_pair(mut self, bo: impl Into<String>, partner: impl Into<String>) -> Self {
        self.additional_key_pairs.push(ColumnPair::new(bo, partner));
        self
    }

    pub fn with_compare_pair(mut self, bo: impl Into<String>, partner: impl Into<String>) -> Self {
        self.compare_pairs.push(ColumnPair::new(bo, partner));
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.bo_key_column.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "missing required field: bo_key_column".into(),
            ));
        }
        if self.partner_key_column.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "missing required field: partner_key_column".into(),
            ));
        }
        for pair in self.additional_key_pairs.iter().chain(&self.compare_pairs) {
            if pair.bo.trim().is_empty() || pair.partner.trim().is_empty() {
                return Err(EngineError::InvalidConfig(
                    "column pair with an empty side".into(),
                ));
            }
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "tolerance out of range: {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}
