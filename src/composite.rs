use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;

use crate::aggregate::{round_to, GroupKey};
use crate::config::{Config, CutBand, IndicatorRole};
use crate::error::EngineError;
use crate::indicator::IndicatorResult;
use crate::stats::percentile_midpoint;

/// Letter or sentinel grade of a composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Grade {
    Letter(String),
    /// Rated, but the model does not publish letters yet
    Preliminary,
    NotRated,
}

impl Grade {
    pub fn label(&self) -> &str {
        match self {
            Grade::Letter(letter) => letter,
            Grade::Preliminary => "P",
            Grade::NotRated => "NR",
        }
    }

    pub fn is_rated(&self) -> bool {
        !matches!(self, Grade::NotRated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotRatedReason {
    /// No weighted component had a score
    NoEligibleWeight,
    /// Some components were scored, but too few to rate the school
    BelowEligibilityThreshold { eligible: f64, threshold: f64 },
    /// External ineligibility signal (first year of operation, too few students)
    Ineligible(String),
}

impl fmt::Display for NotRatedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotRatedReason::NoEligibleWeight => f.write_str("no eligible weight"),
            NotRatedReason::BelowEligibilityThreshold { eligible, threshold } => {
                write!(f, "eligible weight {} below {}", eligible, threshold)
            }
            NotRatedReason::Ineligible(reason) => write!(f, "ineligible: {}", reason),
        }
    }
}

/// Composite result for one school and model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeScore {
    pub school_id: String,
    pub model: String,
    /// Sum of non-null component points
    pub points_earned: f64,
    /// Sum of the weights of components with a non-null score
    pub points_eligible: f64,
    /// earned / eligible x 100, clamped to the model maximum; None with no eligible weight
    pub percentage: Option<f64>,
    pub bonus: f64,
    /// Percentage plus bonus, clamped to the model maximum
    pub total: Option<f64>,
    pub grade: Grade,
    pub not_rated_reason: Option<NotRatedReason>,
    /// CSI identification; None outside the identification population
    pub identified: Option<bool>,
    pub history: BTreeMap<i32, Option<f64>>,
}

impl CompositeScore {
    pub fn key(&self) -> GroupKey {
        GroupKey::school(&self.school_id, &self.model)
    }
}

/// Per-school facts that come from outside the student records.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SchoolProfile {
    pub school_id: String,
    #[serde(default)]
    pub district_id: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub title_i: bool,
    /// Reason text when the school must not be rated
    #[serde(default)]
    pub ineligible: Option<String>,
    /// Externally computed bonus points
    #[serde(default)]
    pub bonus: Option<f64>,
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "y" | "yes")
    ))
}

pub type SchoolProfiles = BTreeMap<String, SchoolProfile>;

/// Read the school profile table (`school_id`, `district_id`, `title_i`,
/// `ineligible`, `bonus`). Only `school_id` is required.
pub fn read_profiles<R: Read>(reader: R) -> Result<SchoolProfiles, EngineError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut profiles = SchoolProfiles::new();
    for row in csv_reader.deserialize::<SchoolProfile>() {
        let mut profile = row?;
        profile.ineligible = profile.ineligible.filter(|r| !r.is_empty());
        profile.district_id = profile.district_id.filter(|d| !d.is_empty());
        profiles.insert(profile.school_id.clone(), profile);
    }
    Ok(profiles)
}

/// Cut band containing `value`. Values between two bands' printed bounds
/// (e.g. 83.995 at two decimals) fall into the band whose lower bound they reached.
pub fn grade_for<'a>(bands: &'a [CutBand], value: f64) -> Option<&'a CutBand> {
    bands
        .iter()
        .filter(|b| b.lower <= value)
        .max_by(|a, b| a.lower.total_cmp(&b.lower))
}

/// Combine indicator results into one composite per school and model.
///
/// A component with a null score counts in neither the numerator nor the
/// denominator. Bonus-role indicators and the profile bonus are added to the
/// percentage before clamping.
pub fn aggregate_composites(
    config: &Config,
    results: &[IndicatorResult],
    profiles: &SchoolProfiles,
) -> Vec<CompositeScore> {
    let mut schools: BTreeSet<GroupKey> = BTreeSet::new();
    for result in results.iter().filter(|r| r.role == IndicatorRole::Component) {
        for row in result.totals() {
            if config.models.contains_key(&row.key.model) {
                schools.insert(row.key.clone());
            }
        }
    }

    let mut by_indicator: BTreeMap<&str, BTreeMap<&GroupKey, f64>> = BTreeMap::new();
    for result in results {
        by_indicator
            .entry(result.name.as_str())
            .or_insert_with(|| result.total_points());
    }
    let points = |name: &str, key: &GroupKey| -> Option<f64> {
        by_indicator.get(name).and_then(|rows| rows.get(key)).copied()
    };

    let mut scores = Vec::with_capacity(schools.len());
    for key in schools {
        let Some(model) = config.models.get(&key.model) else {
            continue;
        };

        let mut earned = 0.0;
        let mut eligible = 0.0;
        for (name, weight) in &model.weights {
            if let Some(p) = points(name, &key) {
                earned += p;
                eligible += weight;
            }
        }

        let mut bonus: f64 = results
            .iter()
            .filter(|r| r.role == IndicatorRole::Bonus)
            .filter_map(|r| points(&r.name, &key))
            .sum();
        let profile = profiles.get(&key.school_id);
        bonus += profile.and_then(|p| p.bonus).unwrap_or(0.0);

        let mut score = CompositeScore {
            school_id: key.school_id.clone(),
            model: key.model.clone(),
            points_earned: earned,
            points_eligible: eligible,
            percentage: None,
            bonus,
            total: None,
            grade: Grade::NotRated,
            not_rated_reason: None,
            identified: None,
            history: BTreeMap::new(),
        };

        if eligible <= 0.0 {
            score.not_rated_reason = Some(NotRatedReason::NoEligibleWeight);
        } else {
            let clamp = |v: f64| v.clamp(0.0, model.max_percentage);
            let percentage = clamp(round_to(earned / eligible * 100.0, config.decimals));
            let total = clamp(round_to(percentage + bonus, config.decimals));
            score.percentage = Some(percentage);
            score.total = Some(total);

            if eligible < model.min_eligible_weight {
                score.not_rated_reason = Some(NotRatedReason::BelowEligibilityThreshold {
                    eligible,
                    threshold: model.min_eligible_weight,
                });
            } else if !model.produce_grades {
                score.grade = Grade::Preliminary;
            } else {
                match grade_for(&model.cut_bands, total) {
                    Some(band) => score.grade = Grade::Letter(band.label.clone()),
                    None => {
                        tracing::warn!(
                            school = %key.school_id,
                            model = %key.model,
                            total,
                            "composite falls outside every cut band"
                        );
                    }
                }
            }
        }

        if let Some(reason) = profile.and_then(|p| p.ineligible.clone()) {
            score.grade = Grade::NotRated;
            score.not_rated_reason = Some(NotRatedReason::Ineligible(reason));
        }

        if let Some(ref reason) = score.not_rated_reason {
            tracing::debug!(school = %score.school_id, model = %score.model, %reason, "school not rated");
        }
        scores.push(score);
    }

    let rated = scores.iter().filter(|s| s.grade.is_rated()).count();
    tracing::info!(schools = scores.len(), rated, "aggregated composites");
    scores
}

/// Flag identification-population schools whose composite falls below the
/// cutoff. Returns the cutoff used, if any.
///
/// The cutoff is the configured fixed threshold, or else the midpoint
/// percentile of the population's non-null totals.
pub fn identify(config: &Config, scores: &mut [CompositeScore], profiles: &SchoolProfiles) -> Option<f64> {
    let identification = config.identification.as_ref()?;
    let in_population = |s: &CompositeScore| profiles.get(&s.school_id).is_some_and(|p| p.title_i);

    let threshold = match identification.threshold {
        Some(fixed) => fixed,
        None => {
            let mut totals: Vec<f64> = scores
                .iter()
                .filter(|s| in_population(s))
                .filter_map(|s| s.total)
                .collect();
            totals.sort_by(f64::total_cmp);
            let Some(cutoff) = percentile_midpoint(&totals, identification.percentile) else {
                tracing::warn!("no scored schools in the identification population");
                return None;
            };
            round_to(cutoff, config.decimals)
        }
    };

    let mut identified = 0usize;
    for score in scores.iter_mut() {
        score.identified = if in_population(score) {
            let below = score.total.is_some_and(|t| t < threshold);
            identified += below as usize;
            Some(below)
        } else {
            None
        };
    }
    tracing::info!(threshold, identified, "identified low-performing schools");
    Some(threshold)
}

/// District grade from the average grade points of its rated schools.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistrictGrade {
    pub district_id: String,
    pub schools_rated: usize,
    pub gpa: Option<f64>,
    pub grade: Grade,
}

/// Roll school letters up to districts: average the grade points of lettered
/// schools, round half up and map back to the letter with that value.
pub fn district_grades(config: &Config, scores: &[CompositeScore], profiles: &SchoolProfiles) -> Vec<DistrictGrade> {
    let mut districts: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for score in scores {
        let Some(district) = profiles
            .get(&score.school_id)
            .and_then(|p| p.district_id.clone())
        else {
            continue;
        };
        let values = districts.entry(district).or_default();
        if let Grade::Letter(ref letter) = score.grade {
            if let Some(value) = config.district_gpa.get(letter) {
                values.push(*value);
            }
        }
    }

    districts
        .into_iter()
        .map(|(district_id, values)| {
            if values.is_empty() {
                return DistrictGrade {
                    district_id,
                    schools_rated: 0,
                    gpa: None,
                    grade: Grade::NotRated,
                };
            }
            let gpa = values.iter().sum::<f64>() / values.len() as f64;
            let rounded = (gpa + 0.5).floor();
            let grade = config
                .district_gpa
                .iter()
                .min_by(|a, b| (a.1 - rounded).abs().total_cmp(&(b.1 - rounded).abs()))
                .map(|(letter, _)| Grade::Letter(letter.clone()))
                .unwrap_or(Grade::NotRated);
            DistrictGrade {
                district_id,
                schools_rated: values.len(),
                gpa: Some(round_to(gpa, config.decimals)),
                grade,
            }
        })
        .collect()
}
