use std::collections::BTreeMap;

use super::rollup::{normalized_shares, roll_up};
use super::{IndicatorResult, ReferenceKey, ScoredGroup, SuppressionReason};
use crate::aggregate::{aggregate, round_to, GroupKey, GroupStats};
use crate::config::{
    Config, CountBasis, Direction, FamilyConfig, FenceMode, IndicatorConfig, IndicatorRole, Tier,
};
use crate::error::EngineError;
use crate::history::PriorYear;
use crate::records::StudentRecord;
use crate::stats::{assign_band, compute_reference, Reference, TOP_BAND};

/// Score one indicator for every school, subgroup and sub-dimension.
///
/// `prior` is the prior-year result of the comparison baseline; only
/// comparison indicators read it. Groups whose model gives the indicator no
/// weight are not scored.
pub fn score_indicator(
    indicator: &IndicatorConfig,
    config: &Config,
    records: &[StudentRecord],
    prior: Option<&PriorYear>,
) -> Result<IndicatorResult, EngineError> {
    let groups = aggregate(records, indicator, config)?;
    let n_count = indicator.n_count(config);
    let shares = normalized_shares(indicator.sub_dimension.as_ref());

    let mut rows = Vec::with_capacity(groups.len());
    let mut weights = Vec::with_capacity(groups.len());
    let mut unweighted = 0usize;
    for (key, stats) in groups {
        match row_weight(indicator, config, &key, &shares) {
            Some(weight) => {
                rows.push(ScoredGroup::new(key, stats));
                weights.push(weight);
            }
            None => unweighted += 1,
        }
    }
    if unweighted > 0 {
        tracing::debug!(
            indicator = %indicator.name,
            groups = unweighted,
            "skipped groups in models that do not weight this indicator"
        );
    }

    let mut references = BTreeMap::new();
    match &indicator.family {
        FamilyConfig::DirectWeight { direction, cap } => {
            for (row, weight) in rows.iter_mut().zip(&weights) {
                if check_n_count(row, n_count) {
                    row.points = row
                        .stats
                        .rate
                        .map(|rate| direct_points(rate, *weight, *direction, *cap));
                }
            }
        }
        FamilyConfig::Banded {
            fence,
            reference_decimals,
            band_decimals,
            scale_to_weight,
        } => {
            references = build_references(&rows, n_count, *fence, *reference_decimals);
            for (key, reference) in &references {
                if reference.is_degenerate() {
                    tracing::warn!(
                        indicator = %indicator.name,
                        model = %key.0,
                        sub_dimension = key.1.as_deref().unwrap_or("-"),
                        "statewide reference is degenerate; model left unscored"
                    );
                }
            }
            for (row, weight) in rows.iter_mut().zip(&weights) {
                if !check_n_count(row, n_count) {
                    continue;
                }
                let ref_key = (row.key.model.clone(), row.key.sub_dimension.clone());
                let Some((mean, std)) = references.get(&ref_key).and_then(Reference::mean_std) else {
                    row.suppress(SuppressionReason::Degenerate);
                    continue;
                };
                let Some(rate) = row.stats.rate else {
                    continue;
                };
                match assign_band(rate, mean, std, *band_decimals) {
                    Some(band) => {
                        row.band = Some(band);
                        row.points = Some(if *scale_to_weight {
                            band as f64 / TOP_BAND as f64 * weight
                        } else {
                            band as f64
                        });
                    }
                    None => row.suppress(SuppressionReason::BelowLowestBand),
                }
            }
        }
        FamilyConfig::Comparison {
            direction,
            strict,
            target,
            ..
        } => {
            let rule = ComparisonRule {
                direction: *direction,
                strict: *strict,
                target: *target,
                decimals: config.decimals,
            };
            score_comparison(indicator, &mut rows, &weights, n_count, prior, &rule);
        }
        FamilyConfig::RelativeTiers { tiers, gate } => {
            let averages = statewide_averages(&rows, n_count, *gate);
            for row in rows.iter_mut() {
                let count = gate_count(&row.stats, *gate);
                if !passes_n_count(row, count, n_count) {
                    continue;
                }
                let average_key = (row.key.model.clone(), row.key.sub_dimension.clone());
                match (row.stats.rate, averages.get(&average_key)) {
                    (Some(rate), Some(average)) if *average > 0.0 => {
                        row.points = Some(tier_points(rate / average, tiers));
                    }
                    _ => row.suppress(SuppressionReason::Degenerate),
                }
            }
        }
    }

    if indicator.suppress_rate {
        for row in rows.iter_mut() {
            if matches!(row.reason, Some(SuppressionReason::BelowNCount { .. })) {
                row.rate = None;
            }
        }
    }

    let rows = match indicator.sub_dimension {
        Some(ref sub) => roll_up(rows, sub, &shares, indicator.suppress_rate),
        None => rows,
    };

    let result = IndicatorResult {
        name: indicator.name.clone(),
        role: indicator.role,
        rows,
        references,
    };

    tracing::info!(
        indicator = %indicator.name,
        groups = result.rows.len(),
        suppressed = result.suppressed_count(),
        "scored indicator"
    );

    Ok(result)
}

/// Statewide references for an indicator without scoring it.
pub fn reference_for(
    indicator: &IndicatorConfig,
    config: &Config,
    records: &[StudentRecord],
) -> Result<BTreeMap<ReferenceKey, Reference>, EngineError> {
    let groups = aggregate(records, indicator, config)?;
    let rows: Vec<ScoredGroup> = groups
        .into_iter()
        .map(|(key, stats)| ScoredGroup::new(key, stats))
        .collect();
    let (fence, decimals) = match &indicator.family {
        FamilyConfig::Banded {
            fence,
            reference_decimals,
            ..
        } => (*fence, *reference_decimals),
        _ => (FenceMode::Inclusive, None),
    };
    Ok(build_references(&rows, indicator.n_count(config), fence, decimals))
}

/// Weight a row carries: the model weight times its sub-dimension share.
/// Bonus indicators are scored in every configured model.
fn row_weight(
    indicator: &IndicatorConfig,
    config: &Config,
    key: &GroupKey,
    shares: &BTreeMap<String, f64>,
) -> Option<f64> {
    let model = config.models.get(&key.model)?;
    let weight = match indicator.role {
        IndicatorRole::Component => *model.weights.get(&indicator.name)?,
        IndicatorRole::Bonus => 0.0,
    };
    let share = match key.sub_dimension {
        Some(ref value) => *shares.get(value)?,
        None => 1.0,
    };
    Some(weight * share)
}

/// Suppress the row if it is under the N-count. Returns true when it may be scored.
fn check_n_count(row: &mut ScoredGroup, n_count: u64) -> bool {
    let eligible = row.stats.eligible;
    passes_n_count(row, eligible, n_count)
}

fn passes_n_count(row: &mut ScoredGroup, count: u64, n_count: u64) -> bool {
    if count < n_count {
        tracing::debug!(
            school = %row.key.school_id,
            model = %row.key.model,
            subgroup = row.key.subgroup.as_deref().unwrap_or("All"),
            count,
            n_count,
            "suppressed group below n-count"
        );
        row.suppress(SuppressionReason::BelowNCount {
            eligible: count,
            n_count,
        });
        false
    } else {
        true
    }
}

fn gate_count(stats: &GroupStats, gate: CountBasis) -> u64 {
    match gate {
        CountBasis::Positive => stats.positive,
        CountBasis::Eligible => stats.eligible,
    }
}

/// weight x rate / 100 (or 100 - rate when lower is better), floored at zero.
pub fn direct_points(rate: f64, weight: f64, direction: Direction, cap: bool) -> f64 {
    let value = match direction {
        Direction::HigherIsBetter => rate,
        Direction::LowerIsBetter => 100.0 - rate,
    };
    let points = (weight * value / 100.0).max(0.0);
    if cap {
        points.min(weight)
    } else {
        points
    }
}

/// References per model and sub-dimension, built from all-students rows.
fn build_references(
    rows: &[ScoredGroup],
    n_count: u64,
    fence: FenceMode,
    decimals: Option<u32>,
) -> BTreeMap<ReferenceKey, Reference> {
    let mut samples: BTreeMap<ReferenceKey, Vec<(f64, u64)>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.key.subgroup.is_none()) {
        let entry = samples
            .entry((row.key.model.clone(), row.key.sub_dimension.clone()))
            .or_default();
        if let Some(rate) = row.stats.rate {
            entry.push((rate, row.stats.eligible));
        }
    }
    samples
        .into_iter()
        .map(|(key, samples)| {
            let reference = compute_reference(&samples, n_count, fence, decimals);
            (key, reference)
        })
        .collect()
}

/// Unweighted mean of school rates per model and sub-dimension, over the
/// schools whose gate count reaches the N-count.
fn statewide_averages(rows: &[ScoredGroup], n_count: u64, gate: CountBasis) -> BTreeMap<ReferenceKey, f64> {
    let mut sums: BTreeMap<ReferenceKey, (f64, usize)> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.key.subgroup.is_none()) {
        if gate_count(&row.stats, gate) < n_count {
            continue;
        }
        if let Some(rate) = row.stats.rate {
            let entry = sums
                .entry((row.key.model.clone(), row.key.sub_dimension.clone()))
                .or_insert((0.0, 0));
            entry.0 += rate;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .filter(|(_, (_, n))| *n > 0)
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect()
}

/// Points of the highest tier whose ratio is reached; zero below every tier.
pub fn tier_points(ratio: f64, tiers: &[Tier]) -> f64 {
    let mut ordered: Vec<&Tier> = tiers.iter().collect();
    ordered.sort_by(|a, b| b.ratio.total_cmp(&a.ratio));
    ordered
        .into_iter()
        .find(|t| ratio >= t.ratio)
        .map(|t| t.points)
        .unwrap_or(0.0)
}

/// "Maintained or improved" comparison settings.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonRule {
    pub direction: Direction,
    pub strict: bool,
    pub target: Option<f64>,
    pub decimals: u32,
}

impl ComparisonRule {
    pub fn improved(&self, current: f64, prior: f64) -> bool {
        let current = round_to(current, self.decimals);
        let prior = round_to(prior, self.decimals);
        if let Some(target) = self.target {
            let met = match self.direction {
                Direction::LowerIsBetter => current <= target,
                Direction::HigherIsBetter => current >= target,
            };
            if met {
                return true;
            }
        }
        match (self.direction, self.strict) {
            (Direction::LowerIsBetter, true) => current < prior,
            (Direction::LowerIsBetter, false) => current <= prior,
            (Direction::HigherIsBetter, true) => current > prior,
            (Direction::HigherIsBetter, false) => current >= prior,
        }
    }
}

fn score_comparison(
    indicator: &IndicatorConfig,
    rows: &mut [ScoredGroup],
    weights: &[f64],
    n_count: u64,
    prior: Option<&PriorYear>,
    rule: &ComparisonRule,
) {
    if prior.is_none() {
        tracing::warn!(
            indicator = %indicator.name,
            "no prior-year baseline; comparisons left unscored"
        );
    }

    for row in rows.iter_mut() {
        if !check_n_count(row, n_count) {
            continue;
        }
        let Some(current) = row.stats.rate else {
            continue;
        };
        let prior_row = prior.and_then(|p| p.rows.get(&row.key));
        match prior_row.map(|p| (p.rate, p.eligible)) {
            Some((_, Some(prior_count))) if prior_count < n_count => {
                row.suppress(SuppressionReason::PriorBelowNCount {
                    eligible: prior_count,
                    n_count,
                });
            }
            Some((Some(prior_rate), Some(_))) => {
                row.improved = Some(rule.improved(current, prior_rate));
            }
            _ => row.suppress(SuppressionReason::NoPriorYear),
        }
    }

    let by_subgroup = !indicator.subgroups.is_empty();
    let mut tallies: BTreeMap<GroupKey, (usize, usize)> = BTreeMap::new();
    if by_subgroup {
        for row in rows.iter().filter(|r| r.key.subgroup.is_some()) {
            if let Some(improved) = row.improved {
                let entry = tallies.entry(row.key.total()).or_insert((0, 0));
                entry.1 += 1;
                if improved {
                    entry.0 += 1;
                }
            }
        }
    }

    for (row, weight) in rows.iter_mut().zip(weights) {
        if !row.key.is_total() {
            continue;
        }
        if by_subgroup {
            if matches!(row.reason, Some(SuppressionReason::BelowNCount { .. })) {
                continue;
            }
            match tallies.get(&row.key) {
                Some((improved, eligible)) if *eligible > 0 => {
                    row.points = Some(*improved as f64 / *eligible as f64 * weight);
                    row.reason = None;
                }
                _ => row.suppress(SuppressionReason::NoComparableSubgroups),
            }
        } else if let Some(improved) = row.improved {
            row.points = Some(if improved { *weight } else { 0.0 });
        }
    }
}
