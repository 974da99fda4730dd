use std::collections::BTreeSet;

use super::predicate::OutcomeRange;
use crate::stats::TOP_BAND;
use super::schema::{
    Config, CutBand, FamilyConfig, IndicatorConfig, IndicatorRole, MeasureConfig, ModelConfig,
};

const MAX_DECIMALS: u32 = 6;
const EPSILON: f64 = 1e-9;

/// Validate the configuration at load time.
/// Returns all validation errors at once (not just the first).
pub fn validate_config(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.n_count == 0 {
        errors.push("n_count: must be positive".to_string());
    }
    if config.decimals > MAX_DECIMALS {
        errors.push(format!("decimals: must be at most {}", MAX_DECIMALS));
    }

    if config.indicators.is_empty() {
        errors.push("indicators: at least one indicator is required".to_string());
    }

    let mut seen = BTreeSet::new();
    for (i, indicator) in config.indicators.iter().enumerate() {
        if !seen.insert(indicator.name.as_str()) {
            errors.push(format!(
                "indicators[{}].name: duplicate indicator '{}'",
                i, indicator.name
            ));
        }
        validate_indicator(config, i, indicator, &mut errors);
    }

    if config.models.is_empty() {
        errors.push("models: at least one model is required".to_string());
    }
    for (name, model) in &config.models {
        validate_model(config, name, model, &mut errors);
    }

    if let Some(ref ident) = config.identification {
        if !(ident.percentile > 0.0 && ident.percentile < 100.0) {
            errors.push(format!(
                "identification.percentile: must be between 0 and 100, got {}",
                ident.percentile
            ));
        }
    }

    if let Some(ref history) = config.composite_history {
        if history.years == 0 {
            errors.push("composite_history.years: must be positive".to_string());
        }
    }

    if config.district_gpa.is_empty() {
        errors.push("district_gpa: at least one grade point is required".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_indicator(
    config: &Config,
    i: usize,
    indicator: &IndicatorConfig,
    errors: &mut Vec<String>,
) {
    let path = format!("indicators[{}]", i);

    if indicator.name.trim().is_empty() {
        errors.push(format!("{}.name: must not be empty", path));
    }
    if indicator.source.trim().is_empty() {
        errors.push(format!("{}.source: must not be empty", path));
    }
    if indicator.n_count == Some(0) {
        errors.push(format!("{}.n_count: must be positive", path));
    }
    if matches!(indicator.rate_decimals, Some(d) if d > MAX_DECIMALS) {
        errors.push(format!("{}.rate_decimals: must be at most {}", path, MAX_DECIMALS));
    }

    for (j, expr) in indicator.eligibility.exclude_outcomes.iter().enumerate() {
        if let Err(e) = OutcomeRange::parse(expr) {
            errors.push(format!(
                "{}.eligibility.exclude_outcomes[{}]: invalid '{}' - {}",
                path, j, expr, e
            ));
        }
    }

    for column in &indicator.subgroups {
        if !config.subgroups.contains_key(column) {
            errors.push(format!(
                "{}.subgroups: '{}' has no label table under subgroups",
                path, column
            ));
        }
    }

    match &indicator.measure {
        MeasureConfig::PositiveRate { positive } => {
            if let Err(e) = OutcomeRange::parse(positive) {
                errors.push(format!(
                    "{}.measure.positive_rate.positive: invalid '{}' - {}",
                    path, positive, e
                ));
            }
        }
        MeasureConfig::Median => {}
        MeasureConfig::LevelWeighted {
            levels,
            participation_target,
        } => {
            if levels.is_empty() {
                errors.push(format!("{}.measure.level_weighted.levels: must not be empty", path));
            }
            if levels.iter().any(|l| l.weight < 0.0) {
                errors.push(format!(
                    "{}.measure.level_weighted.levels: weights must be non-negative",
                    path
                ));
            }
            if let Some(target) = participation_target {
                if !(*target > 0.0 && *target <= 1.0) {
                    errors.push(format!(
                        "{}.measure.level_weighted.participation_target: must be in (0, 1], got {}",
                        path, target
                    ));
                }
            }
        }
        MeasureConfig::CategoryWeighted { column, weights } => {
            if column.trim().is_empty() {
                errors.push(format!(
                    "{}.measure.category_weighted.column: must not be empty",
                    path
                ));
            }
            if weights.is_empty() {
                errors.push(format!(
                    "{}.measure.category_weighted.weights: must not be empty",
                    path
                ));
            }
        }
    }

    match &indicator.family {
        FamilyConfig::DirectWeight { .. } => {}
        FamilyConfig::Banded {
            reference_decimals,
            band_decimals,
            ..
        } => {
            for (field, value) in [("reference_decimals", reference_decimals), ("band_decimals", band_decimals)] {
                if matches!(value, Some(d) if *d > MAX_DECIMALS) {
                    errors.push(format!(
                        "{}.family.banded.{}: must be at most {}",
                        path, field, MAX_DECIMALS
                    ));
                }
            }
        }
        FamilyConfig::Comparison { baseline, .. } => {
            if let Some(baseline) = baseline {
                if config.indicator(baseline).is_none() {
                    errors.push(format!(
                        "{}.family.comparison.baseline: unknown indicator '{}'",
                        path, baseline
                    ));
                }
            }
            if indicator.sub_dimension.is_some() {
                errors.push(format!(
                    "{}.sub_dimension: not supported for comparison indicators",
                    path
                ));
            }
        }
        FamilyConfig::RelativeTiers { tiers, .. } => {
            if tiers.is_empty() {
                errors.push(format!("{}.family.relative_tiers.tiers: must not be empty", path));
            }
            for (j, tier) in tiers.iter().enumerate() {
                if tier.ratio <= 0.0 {
                    errors.push(format!(
                        "{}.family.relative_tiers.tiers[{}].ratio: must be positive",
                        path, j
                    ));
                }
                if tier.points < 0.0 {
                    errors.push(format!(
                        "{}.family.relative_tiers.tiers[{}].points: must be non-negative",
                        path, j
                    ));
                }
            }
        }
    }

    if indicator.role == IndicatorRole::Bonus
        && !matches!(indicator.family, FamilyConfig::RelativeTiers { .. })
    {
        errors.push(format!("{}.family: bonus indicators must use relative_tiers", path));
    }

    if let Some(ref sub) = indicator.sub_dimension {
        if sub.shares.is_empty() {
            errors.push(format!("{}.sub_dimension.shares: must not be empty", path));
        }
        for (value, share) in &sub.shares {
            if *share <= 0.0 {
                errors.push(format!(
                    "{}.sub_dimension.shares.{}: must be positive",
                    path, value
                ));
            }
        }
    }

    if let Some(ref history) = indicator.history {
        if history.years == 0 {
            errors.push(format!("{}.history.years: must be positive", path));
        }
    }
}

fn validate_model(config: &Config, name: &str, model: &ModelConfig, errors: &mut Vec<String>) {
    let path = format!("models.{}", name);

    if model.weights.is_empty() {
        errors.push(format!("{}.weights: must not be empty", path));
    }
    for (indicator_name, weight) in &model.weights {
        match config.indicator(indicator_name) {
            None => errors.push(format!(
                "{}.weights.{}: no indicator with this name is configured",
                path, indicator_name
            )),
            Some(indicator) if indicator.role == IndicatorRole::Bonus => errors.push(format!(
                "{}.weights.{}: bonus indicators cannot carry a component weight",
                path, indicator_name
            )),
            Some(indicator)
                if matches!(indicator.family, FamilyConfig::Banded { scale_to_weight: false, .. })
                    && (*weight - TOP_BAND as f64).abs() > EPSILON =>
            {
                errors.push(format!(
                    "{}.weights.{}: banded indicator earns 0-{} points; set scale_to_weight or use weight {}",
                    path, indicator_name, TOP_BAND, TOP_BAND
                ))
            }
            Some(_) => {}
        }
        if *weight <= 0.0 {
            errors.push(format!("{}.weights.{}: must be positive", path, indicator_name));
        }
    }

    if model.max_percentage <= 0.0 {
        errors.push(format!("{}.max_percentage: must be positive", path));
    }

    let total_weight: f64 = model.weights.values().sum();
    if model.min_eligible_weight < 0.0 || model.min_eligible_weight > total_weight + EPSILON {
        errors.push(format!(
            "{}.min_eligible_weight: must be between 0 and the total weight {}",
            path, total_weight
        ));
    }

    for e in check_cut_bands(&model.cut_bands, model.max_percentage, config.decimals) {
        errors.push(format!("{}.{}", path, e));
    }
}

/// Check that cut bands partition [0, max] at the given rounding resolution.
///
/// With two decimals, adjacent bands must be exactly 0.01 apart (e.g. F ends at
/// 46.99 and D starts at 47). Bands may be listed in any order.
pub fn check_cut_bands(bands: &[CutBand], max: f64, decimals: u32) -> Vec<String> {
    let mut errors = Vec::new();
    if bands.is_empty() {
        errors.push("cut_bands: must not be empty".to_string());
        return errors;
    }

    let resolution = 10f64.powi(-(decimals as i32));

    let mut labels = BTreeSet::new();
    for (i, band) in bands.iter().enumerate() {
        if band.label.trim().is_empty() {
            errors.push(format!("cut_bands[{}].label: must not be empty", i));
        } else if !labels.insert(band.label.as_str()) {
            errors.push(format!("cut_bands[{}].label: duplicate label '{}'", i, band.label));
        }
        if band.lower > band.upper {
            errors.push(format!(
                "cut_bands[{}]: lower {} exceeds upper {}",
                i, band.lower, band.upper
            ));
        }
    }

    let mut ordered: Vec<(usize, &CutBand)> = bands.iter().enumerate().collect();
    ordered.sort_by(|a, b| a.1.lower.total_cmp(&b.1.lower));

    let (first_idx, first) = ordered[0];
    if first.lower.abs() > EPSILON {
        errors.push(format!(
            "cut_bands[{}]: lowest band must start at 0, starts at {}",
            first_idx, first.lower
        ));
    }
    let (last_idx, last) = ordered[ordered.len() - 1];
    if (last.upper - max).abs() > EPSILON {
        errors.push(format!(
            "cut_bands[{}]: highest band must end at {}, ends at {}",
            last_idx, max, last.upper
        ));
    }

    for pair in ordered.windows(2) {
        let (prev_idx, prev) = pair[0];
        let (next_idx, next) = pair[1];
        let step = next.lower - prev.upper;
        if step < resolution - EPSILON {
            errors.push(format!(
                "cut_bands[{}]: overlaps cut_bands[{}] ({} <= {})",
                next_idx, prev_idx, next.lower, prev.upper
            ));
        } else if step > resolution + EPSILON {
            errors.push(format!(
                "cut_bands[{}]: gap between {} and {} after cut_bands[{}]",
                next_idx, prev.upper, next.lower, prev_idx
            ));
        }
    }

    errors
}
