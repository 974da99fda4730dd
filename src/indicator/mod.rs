pub mod engine;
pub mod rollup;

pub use engine::{reference_for, score_indicator};

use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregate::{GroupKey, GroupStats};
use crate::config::IndicatorRole;
use crate::stats::Reference;

/// Why a row carries no points. These are data, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressionReason {
    /// Eligible count under the N-count threshold
    BelowNCount { eligible: u64, n_count: u64 },
    /// Prior-year eligible count under the N-count threshold
    PriorBelowNCount { eligible: u64, n_count: u64 },
    /// No prior-year row (or no prior-year table) to compare against
    NoPriorYear,
    /// Trimmed statewide reference for the model was empty
    Degenerate,
    /// Rate below the lowest band threshold but not zero
    BelowLowestBand,
    /// No subgroup cleared both N-count checks
    NoComparableSubgroups,
    /// Sub-dimension roll-up lacked a required or any scored value
    IncompleteRollup,
    /// The indicator's input failed its schema check and was replaced with nulls
    SubstitutedNull,
}

impl SuppressionReason {
    pub fn label(&self) -> &'static str {
        match self {
            SuppressionReason::BelowNCount { .. } => "below_n_count",
            SuppressionReason::PriorBelowNCount { .. } => "prior_below_n_count",
            SuppressionReason::NoPriorYear => "no_prior_year",
            SuppressionReason::Degenerate => "degenerate_reference",
            SuppressionReason::BelowLowestBand => "below_lowest_band",
            SuppressionReason::NoComparableSubgroups => "no_comparable_subgroups",
            SuppressionReason::IncompleteRollup => "incomplete_rollup",
            SuppressionReason::SubstitutedNull => "substituted_null",
        }
    }
}

/// One scored group of an indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredGroup {
    pub key: GroupKey,
    pub stats: GroupStats,
    /// Rate as reported; blanked under N-count when the indicator suppresses rates
    pub rate: Option<f64>,
    pub band: Option<u8>,
    /// Comparison outcome for maintained-or-improved indicators
    pub improved: Option<bool>,
    pub points: Option<f64>,
    pub reason: Option<SuppressionReason>,
    /// Prior-year values keyed by fiscal year; None where no value exists
    pub history: BTreeMap<i32, Option<f64>>,
}

impl ScoredGroup {
    pub fn new(key: GroupKey, stats: GroupStats) -> Self {
        Self {
            key,
            rate: stats.rate,
            stats,
            band: None,
            improved: None,
            points: None,
            reason: None,
            history: BTreeMap::new(),
        }
    }

    pub fn suppress(&mut self, reason: SuppressionReason) {
        self.points = None;
        self.reason = Some(reason);
    }
}

/// Key of a statewide reference: model plus optional sub-dimension value.
pub type ReferenceKey = (String, Option<String>);

/// Everything one indicator produced in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorResult {
    pub name: String,
    pub role: IndicatorRole,
    pub rows: Vec<ScoredGroup>,
    /// Statewide references used by banded indicators
    pub references: BTreeMap<ReferenceKey, Reference>,
}

impl IndicatorResult {
    /// An indicator with no rows: every school is absent, so every composite
    /// treats it as not measured.
    pub fn empty(name: &str, role: IndicatorRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            rows: Vec::new(),
            references: BTreeMap::new(),
        }
    }

    pub fn row(&self, key: &GroupKey) -> Option<&ScoredGroup> {
        self.rows.iter().find(|r| &r.key == key)
    }

    /// All-students, whole-school rows
    pub fn totals(&self) -> impl Iterator<Item = &ScoredGroup> {
        self.rows.iter().filter(|r| r.key.is_total())
    }

    /// Non-null points of the whole-school rows, by key
    pub fn total_points(&self) -> BTreeMap<&GroupKey, f64> {
        self.totals()
            .filter_map(|row| row.points.map(|p| (&row.key, p)))
            .collect()
    }

    pub fn suppressed_count(&self) -> usize {
        self.rows.iter().filter(|r| r.reason.is_some()).count()
    }
}
