use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::{GroupKey, GroupStats};
use crate::composite::{aggregate_composites, district_grades, identify, CompositeScore, DistrictGrade, SchoolProfiles};
use crate::config::{ensure_valid, Config, FamilyConfig, IndicatorConfig, IndicatorRole};
use crate::error::EngineError;
use crate::history::{prior_year, stitch_history};
use crate::indicator::{score_indicator, IndicatorResult, ScoredGroup, SuppressionReason};
use crate::records::RecordTable;
use crate::store::{IndicatorStatus, IndicatorSummary, RunManifest, TableStore};
use crate::table::{composite_table, district_table, indicator_table, Table};

pub use crate::config::SchemaPolicy;

/// Logical table names written besides one table per indicator
pub const COMPOSITE_TABLE: &str = "composite";
pub const DISTRICT_TABLE: &str = "district";

/// Everything a run produced, in long form.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub fiscal_year: i32,
    pub indicators: Vec<IndicatorResult>,
    pub composites: Vec<CompositeScore>,
    pub districts: Vec<DistrictGrade>,
    /// Cutoff used for identification, when identification is configured
    pub identification_threshold: Option<f64>,
    pub summaries: Vec<IndicatorSummary>,
    pub warnings: Vec<String>,
}

impl RunOutput {
    pub fn manifest(&self, started_at: DateTime<Utc>) -> RunManifest {
        RunManifest {
            version: 1,
            fiscal_year: self.fiscal_year,
            started_at,
            finished_at: Utc::now(),
            indicators: self.summaries.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Score every configured indicator in order, then the composites, persisting
/// each result table through `store`.
///
/// Nothing is written until every indicator and the composite have been
/// computed, so an aborted run leaves the fiscal year untouched.
///
/// `sources` maps an indicator's `source` name to its record table. A source
/// that is absent or lacks columns is a schema error, handled per
/// `config.schema_policy`.
pub fn run(
    config: &Config,
    fiscal_year: i32,
    sources: &BTreeMap<String, RecordTable>,
    profiles: &SchoolProfiles,
    store: &mut dyn TableStore,
) -> Result<RunOutput, EngineError> {
    ensure_valid(config)?;
    tracing::info!(fiscal_year, indicators = config.indicators.len(), "starting run");

    let empty = RecordTable::default();
    let mut results = Vec::with_capacity(config.indicators.len());
    let mut summaries = Vec::with_capacity(config.indicators.len());
    let mut warnings = Vec::new();
    let mut tables: Vec<(String, Table)> = Vec::with_capacity(config.indicators.len() + 2);

    for indicator in &config.indicators {
        let source = sources.get(&indicator.source).unwrap_or(&empty);

        let (mut result, status) = match source.check_schema(indicator) {
            Ok(()) => {
                let prior = match indicator.family {
                    FamilyConfig::Comparison { ref baseline, .. } => {
                        let baseline = baseline.as_deref().unwrap_or(&indicator.name);
                        let history = config.indicator(baseline).and_then(|i| i.history.as_ref());
                        let prior = prior_year(&*store, baseline, fiscal_year, history)?;
                        if prior.is_none() {
                            warnings.push(format!(
                                "{}: no {} baseline for {}",
                                indicator.name,
                                baseline,
                                fiscal_year - 1
                            ));
                        }
                        prior
                    }
                    _ => None,
                };
                let result = score_indicator(indicator, config, &source.records, prior.as_ref())?;
                (result, IndicatorStatus::Scored)
            }
            Err(err) => match config.schema_policy {
                SchemaPolicy::Abort => return Err(err),
                SchemaPolicy::SubstituteNull => {
                    tracing::warn!(indicator = %indicator.name, error = %err, "substituting null result");
                    warnings.push(format!("{}: substituted null result: {}", indicator.name, err));
                    (substituted(indicator, config, source), IndicatorStatus::SubstitutedNull)
                }
            },
        };

        for ((model, value), reference) in &result.references {
            if reference.is_degenerate() {
                warnings.push(format!(
                    "{}: degenerate reference for model {}{}",
                    indicator.name,
                    model,
                    value.as_deref().map(|v| format!(" ({})", v)).unwrap_or_default()
                ));
            }
        }

        let history_column = match indicator.history {
            Some(ref history) => {
                let keys: Vec<GroupKey> = result.rows.iter().map(|r| r.key.clone()).collect();
                let mut stitched = stitch_history(&keys, &*store, &indicator.name, fiscal_year, history)?;
                for row in result.rows.iter_mut() {
                    row.history = stitched.take(&row.key);
                }
                warnings.extend(stitched.notes(&indicator.name));
                history.column.as_str()
            }
            None => "history",
        };

        tables.push((
            indicator.name.clone(),
            indicator_table(&result, config.decimals, history_column),
        ));

        summaries.push(IndicatorSummary {
            name: indicator.name.clone(),
            status,
            rows: result.rows.len(),
            suppressed: result.suppressed_count(),
        });
        results.push(result);
    }

    let mut composites = aggregate_composites(config, &results, profiles);
    let identification_threshold = identify(config, &mut composites, profiles);

    let history_column = match config.composite_history {
        Some(ref history) => {
            let keys: Vec<GroupKey> = composites.iter().map(CompositeScore::key).collect();
            let mut stitched = stitch_history(&keys, &*store, COMPOSITE_TABLE, fiscal_year, history)?;
            for score in composites.iter_mut() {
                score.history = stitched.take(&score.key());
            }
            warnings.extend(stitched.notes(COMPOSITE_TABLE));
            history.column.as_str()
        }
        None => "history",
    };
    tables.push((
        COMPOSITE_TABLE.to_string(),
        composite_table(&composites, config.decimals, history_column),
    ));

    let districts = district_grades(config, &composites, profiles);
    tables.push((DISTRICT_TABLE.to_string(), district_table(&districts, config.decimals)));

    for (name, table) in &tables {
        store.write_table(name, fiscal_year, table)?;
    }

    tracing::info!(
        fiscal_year,
        schools = composites.len(),
        districts = districts.len(),
        warnings = warnings.len(),
        "run complete"
    );

    Ok(RunOutput {
        fiscal_year,
        indicators: results,
        composites,
        districts,
        identification_threshold,
        summaries,
        warnings,
    })
}

/// All-null stand-in for an indicator whose input failed its schema check:
/// one suppressed row per school and model seen in the source.
fn substituted(indicator: &IndicatorConfig, config: &Config, source: &RecordTable) -> IndicatorResult {
    let schools: BTreeSet<GroupKey> = source
        .records
        .iter()
        .filter(|r| match config.models.get(&r.model) {
            Some(model) => indicator.role == IndicatorRole::Bonus || model.weights.contains_key(&indicator.name),
            None => false,
        })
        .map(|r| GroupKey::school(&r.school_id, &r.model))
        .collect();

    let mut result = IndicatorResult::empty(&indicator.name, indicator.role);
    result.rows = schools
        .into_iter()
        .map(|key| {
            let mut row = ScoredGroup::new(key, GroupStats::empty());
            row.suppress(SuppressionReason::SubstitutedNull);
            row
        })
        .collect();
    result
}
