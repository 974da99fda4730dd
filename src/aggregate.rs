use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::{
    predicate::parse_ranges, Config, DedupPriority, Dimension, IndicatorConfig, LevelWeight,
    MeasureConfig, OutcomeRange,
};
use crate::error::EngineError;
use crate::records::StudentRecord;

/// Grouping key for one scored row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub school_id: String,
    pub model: String,
    /// Reported subgroup label; None for all students
    pub subgroup: Option<String>,
    /// Subject, grade or other sub-dimension value; None for the school total
    pub sub_dimension: Option<String>,
}

impl GroupKey {
    pub fn school(school_id: &str, model: &str) -> Self {
        Self {
            school_id: school_id.to_string(),
            model: model.to_string(),
            subgroup: None,
            sub_dimension: None,
        }
    }

    pub fn with_subgroup(mut self, subgroup: Option<&str>) -> Self {
        self.subgroup = subgroup.map(str::to_string);
        self
    }

    pub fn with_sub_dimension(mut self, value: Option<&str>) -> Self {
        self.sub_dimension = value.map(str::to_string);
        self
    }

    /// The all-students, whole-school key this row rolls up into
    pub fn total(&self) -> Self {
        Self::school(&self.school_id, &self.model)
    }

    pub fn is_total(&self) -> bool {
        self.subgroup.is_none() && self.sub_dimension.is_none()
    }
}

/// Counts and rate for one group.
///
/// `positive <= eligible` always holds, and `rate` is None exactly when
/// `eligible` is zero. Level-weighted measures count students, not assessments,
/// and `positive` is the number of students with a proficient assessment.
/// Median measures have no positive condition and report zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupStats {
    pub eligible: u64,
    pub positive: u64,
    pub rate: Option<f64>,
}

impl GroupStats {
    pub fn empty() -> Self {
        Self {
            eligible: 0,
            positive: 0,
            rate: None,
        }
    }
}

/// Compiled form of an indicator's grouping and measure settings.
struct GroupSpec<'a> {
    indicator: &'a IndicatorConfig,
    config: &'a Config,
    excluded: Vec<OutcomeRange>,
    positive: Option<OutcomeRange>,
    per_student: usize,
}

impl<'a> GroupSpec<'a> {
    fn compile(indicator: &'a IndicatorConfig, config: &'a Config) -> Result<Self, EngineError> {
        let path = |field: &str, e: anyhow::Error| {
            EngineError::Configuration(vec![format!(
                "indicators.{}.{}: {}",
                indicator.name, field, e
            )])
        };
        let excluded = parse_ranges(&indicator.eligibility.exclude_outcomes)
            .map_err(|e| path("eligibility.exclude_outcomes", e))?;
        let positive = match &indicator.measure {
            MeasureConfig::PositiveRate { positive } => Some(
                OutcomeRange::parse(positive).map_err(|e| path("measure.positive_rate.positive", e))?,
            ),
            _ => None,
        };
        Ok(Self {
            indicator,
            config,
            excluded,
            positive,
            per_student: assessments_per_student(indicator),
        })
    }

    fn is_eligible(&self, record: &StudentRecord) -> bool {
        let eligibility = &self.indicator.eligibility;

        let Some(model) = self.config.models.get(&record.model) else {
            return false;
        };
        if eligibility.require_flag && !record.eligible {
            return false;
        }
        if eligibility.model_grades && !model.grades.is_empty() {
            match record.grade {
                Some(grade) if model.grades.contains(&grade) => {}
                _ => return false,
            }
        }
        if !eligibility.subjects.is_empty() {
            match record.subject.as_deref() {
                Some(subject) if eligibility.subjects.iter().any(|s| s == subject) => {}
                _ => return false,
            }
        }
        if let Some(outcome) = record.outcome {
            if self.excluded.iter().any(|range| range.matches(outcome)) {
                return false;
            }
        }
        if let Some(ref sub) = self.indicator.sub_dimension {
            match record.dimension_value(&sub.dimension) {
                Some(value) if sub.shares.contains_key(&value) => {}
                _ => return false,
            }
        }

        match &self.indicator.measure {
            MeasureConfig::PositiveRate { .. } | MeasureConfig::Median => record.outcome.is_some(),
            MeasureConfig::LevelWeighted {
                participation_target: Some(_),
                ..
            } => true,
            MeasureConfig::LevelWeighted {
                participation_target: None,
                ..
            } => record.tested && record.outcome.is_some(),
            MeasureConfig::CategoryWeighted { column, .. } => record.attribute(column).is_some(),
        }
    }

    fn measure(&self, members: &[&StudentRecord]) -> GroupStats {
        if members.is_empty() {
            return GroupStats::empty();
        }
        let records = members.len() as u64;
        let n = records as f64;

        let (eligible, positive, rate) = match &self.indicator.measure {
            MeasureConfig::PositiveRate { .. } => {
                let positive = members
                    .iter()
                    .filter(|r| {
                        matches!((&self.positive, r.outcome), (Some(range), Some(v)) if range.matches(v))
                    })
                    .count() as u64;
                (records, positive, positive as f64 / n * 100.0)
            }
            MeasureConfig::Median => {
                let mut values: Vec<f64> = members.iter().filter_map(|r| r.outcome).collect();
                values.sort_by(f64::total_cmp);
                (records, 0, median_sorted(&values))
            }
            MeasureConfig::LevelWeighted {
                levels,
                participation_target,
            } => {
                let students: BTreeSet<&str> = members.iter().map(|r| r.student_id.as_str()).collect();
                let assessments: Vec<(&str, f64)> = members
                    .iter()
                    .filter(|r| r.tested)
                    .filter_map(|r| r.outcome.map(|v| (r.student_id.as_str(), level_weight(levels, v))))
                    .collect();
                let proficient: BTreeSet<&str> = assessments
                    .iter()
                    .filter(|(_, w)| *w >= 1.0)
                    .map(|(student, _)| *student)
                    .collect();
                let sum: f64 = assessments.iter().map(|(_, w)| w).sum();
                let tested = assessments.len() as f64;
                let rate = match participation_target {
                    // Σw / tested x (tested / per_student) / (target x enrolled)
                    Some(target) => {
                        sum / (self.per_student as f64 * target * students.len() as f64) * 100.0
                    }
                    None if tested > 0.0 => sum / tested * 100.0,
                    None => 0.0,
                };
                (students.len() as u64, proficient.len() as u64, rate)
            }
            MeasureConfig::CategoryWeighted { column, weights } => {
                let mut positive = 0u64;
                let mut sum = 0.0;
                for record in members {
                    let weight = record
                        .attribute(column)
                        .and_then(|c| weights.get(c))
                        .copied()
                        .unwrap_or(0.0);
                    if weight > 0.0 {
                        positive += 1;
                    }
                    sum += weight;
                }
                (records, positive, sum / n * 100.0)
            }
        };

        let rate = match self.indicator.rate_decimals {
            Some(d) => round_to(rate, d),
            None => rate,
        };

        GroupStats {
            eligible,
            positive,
            rate: Some(rate),
        }
    }

    /// Reported subgroup labels for a record, after label remapping.
    fn subgroup_labels<'r>(&'r self, record: &'r StudentRecord) -> impl Iterator<Item = &'r str> + 'r {
        self.indicator.subgroups.iter().filter_map(move |column| {
            let raw = record.attribute(column)?;
            self.config.subgroups.get(column)?.get(raw).map(|s| s.as_str())
        })
    }
}

fn level_weight(levels: &[LevelWeight], value: f64) -> f64 {
    levels
        .iter()
        .find(|l| (l.level - value).abs() < 1e-9)
        .map(|l| l.weight)
        .unwrap_or(0.0)
}

/// Median of an already sorted slice; 0 for an empty slice.
pub fn median_sorted(values: &[f64]) -> f64 {
    let n = values.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => values[n / 2],
        _ => (values[n / 2 - 1] + values[n / 2]) / 2.0,
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Assessments expected from each student in one group: the number of
/// eligible subjects, unless the indicator already splits by subject.
pub fn assessments_per_student(indicator: &IndicatorConfig) -> usize {
    match indicator.sub_dimension {
        Some(ref sub) if sub.dimension == Dimension::Subject => 1,
        _ => indicator.eligibility.subjects.len().max(1),
    }
}

/// Keep one record per student per school, model and sub-dimension value,
/// and per subject when several subjects are scored together.
pub fn dedup<'a>(
    records: Vec<&'a StudentRecord>,
    priority: DedupPriority,
    indicator: &IndicatorConfig,
) -> Vec<&'a StudentRecord> {
    type DedupKey<'r> = (&'r str, &'r str, &'r str, Option<String>, Option<&'r str>);
    let by_subject = assessments_per_student(indicator) > 1;
    let mut best: HashMap<DedupKey<'a>, usize> = HashMap::new();
    let mut kept: Vec<&'a StudentRecord> = Vec::with_capacity(records.len());

    for record in records {
        let dim = indicator
            .sub_dimension
            .as_ref()
            .and_then(|s| record.dimension_value(&s.dimension));
        let key = (
            record.school_id.as_str(),
            record.model.as_str(),
            record.student_id.as_str(),
            dim,
            if by_subject { record.subject.as_deref() } else { None },
        );
        match best.get(&key) {
            Some(&idx) => {
                if prefer(record, kept[idx], priority) == Ordering::Greater {
                    kept[idx] = record;
                }
            }
            None => {
                best.insert(key, kept.len());
                kept.push(record);
            }
        }
    }

    kept
}

/// Ordering of a challenger against the current holder; Greater replaces it.
fn prefer(challenger: &StudentRecord, holder: &StudentRecord, priority: DedupPriority) -> Ordering {
    let outcome = |r: &StudentRecord| r.outcome.unwrap_or(f64::NEG_INFINITY);
    let grade = |r: &StudentRecord| r.grade.unwrap_or(i32::MIN);
    match priority {
        DedupPriority::HighestOutcome => outcome(challenger)
            .total_cmp(&outcome(holder))
            .then(grade(challenger).cmp(&grade(holder))),
        DedupPriority::LowestOutcome => {
            let low = |r: &StudentRecord| r.outcome.unwrap_or(f64::INFINITY);
            low(holder)
                .total_cmp(&low(challenger))
                .then(grade(challenger).cmp(&grade(holder)))
        }
        DedupPriority::LatestGrade => grade(challenger)
            .cmp(&grade(holder))
            .then(outcome(challenger).total_cmp(&outcome(holder))),
    }
}

/// Group eligible, deduplicated records and compute one `GroupStats` per key.
///
/// Every school-model with at least one eligible record gets an all-students
/// row; subgroup rows exist only for labels found in the subgroup tables.
pub fn aggregate(
    records: &[StudentRecord],
    indicator: &IndicatorConfig,
    config: &Config,
) -> Result<BTreeMap<GroupKey, GroupStats>, EngineError> {
    let spec = GroupSpec::compile(indicator, config)?;

    let eligible: Vec<&StudentRecord> = records.iter().filter(|r| spec.is_eligible(r)).collect();
    let dropped = records.len() - eligible.len();
    let members = dedup(eligible, indicator.dedup, indicator);

    tracing::debug!(
        indicator = %indicator.name,
        total = records.len(),
        ineligible = dropped,
        kept = members.len(),
        "filtered student records"
    );

    let mut groups: BTreeMap<GroupKey, Vec<&StudentRecord>> = BTreeMap::new();
    for record in members {
        let dim = indicator
            .sub_dimension
            .as_ref()
            .and_then(|s| record.dimension_value(&s.dimension));
        let base = GroupKey::school(&record.school_id, &record.model).with_sub_dimension(dim.as_deref());

        groups.entry(base.clone()).or_default().push(record);
        for label in spec.subgroup_labels(record) {
            groups
                .entry(base.clone().with_subgroup(Some(label)))
                .or_default()
                .push(record);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, members)| {
            let stats = spec.measure(&members);
            (key, stats)
        })
        .collect())
}
