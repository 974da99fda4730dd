use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete engine configuration.
///
/// Everything the engine knows about a rule set (federal or state) lives here:
/// indicator descriptors, per-model weights and cut bands, N-count thresholds and
/// subgroup label tables. It is loaded once and passed by reference to every stage.
///
/// Example YAML:
/// ```yaml
/// n_count: 20
/// subgroups:
///   SPED: { "1": SWD }
/// indicators:
///   - name: chronic_absence
///     source: attendance
///     subgroups: [SPED]
///     measure: { positive_rate: { positive: ">=1" } }
///     family: { direct_weight: { direction: lower_is_better } }
/// models:
///   k-8:
///     weights: { chronic_absence: 10 }
///     cut_bands:
///       - { label: A, lower: 84, upper: 100 }
///       - { label: F, lower: 0, upper: 83.99 }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Log filter used when RUST_LOG is not set (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Default minimum eligible count before a group is scored
    #[serde(default = "default_n_count")]
    pub n_count: u64,

    /// Decimal places kept on rates, points and percentages in output tables
    #[serde(default = "default_decimals")]
    pub decimals: u32,

    /// What to do when an indicator's input lacks required columns
    #[serde(default)]
    pub schema_policy: SchemaPolicy,

    /// Subgroup label tables: input column -> raw value -> reported label.
    /// Values missing from a table are not reported as a subgroup.
    #[serde(default)]
    pub subgroups: BTreeMap<String, BTreeMap<String, String>>,

    /// Indicator descriptors, scored in the listed order
    pub indicators: Vec<IndicatorConfig>,

    /// School models (grade bands) keyed by the value of the record's model column
    pub models: BTreeMap<String, ModelConfig>,

    /// Low-performing school identification over composite percentages
    #[serde(default)]
    pub identification: Option<IdentificationConfig>,

    /// Prior years of composite results to attach to this year's composites
    #[serde(default)]
    pub composite_history: Option<HistoryConfig>,

    /// Grade point values used when rolling school letters up to districts
    #[serde(default = "default_district_gpa")]
    pub district_gpa: BTreeMap<String, f64>,
}

fn default_n_count() -> u64 {
    20
}

fn default_decimals() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_district_gpa() -> BTreeMap<String, f64> {
    [("A", 4.0), ("B", 3.0), ("C", 2.0), ("D", 1.0), ("F", 0.0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// Stop the run at the first indicator with a schema error
    #[default]
    Abort,
    /// Log a warning, emit an empty (all-null) result for the indicator, and continue
    SubstituteNull,
}

/// One indicator descriptor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IndicatorConfig {
    /// Logical name; also the name of the persisted result table
    pub name: String,

    /// Logical name of the student-record table this indicator reads
    pub source: String,

    /// Overrides the global n_count for this indicator
    #[serde(default)]
    pub n_count: Option<u64>,

    /// Also blank the reported rate (not only the points) for groups under n_count
    #[serde(default)]
    pub suppress_rate: bool,

    #[serde(default)]
    pub eligibility: EligibilityConfig,

    /// Subgroup columns to report besides all students
    #[serde(default)]
    pub subgroups: Vec<String>,

    /// Which record wins when a student appears more than once in a group
    #[serde(default)]
    pub dedup: DedupPriority,

    pub measure: MeasureConfig,

    pub family: FamilyConfig,

    /// Score separately per subject, grade or column value, then roll up
    #[serde(default)]
    pub sub_dimension: Option<SubDimensionConfig>,

    #[serde(default)]
    pub role: IndicatorRole,

    /// Round the group rate to this many decimals before scoring
    #[serde(default)]
    pub rate_decimals: Option<u32>,

    /// Prior years of this indicator's results to attach to the output
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

/// Record-level eligibility predicate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EligibilityConfig {
    /// Only records flagged eligible (e.g. full academic year) participate
    #[serde(default = "default_true")]
    pub require_flag: bool,

    /// Restrict to these subjects (empty: all subjects)
    #[serde(default)]
    pub subjects: Vec<String>,

    /// Outcome ranges to drop, e.g. disallowed retake codes ("99", ">=900")
    #[serde(default)]
    pub exclude_outcomes: Vec<String>,

    /// Drop records whose grade is outside the model's grade set
    #[serde(default = "default_true")]
    pub model_grades: bool,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            require_flag: true,
            subjects: Vec::new(),
            exclude_outcomes: Vec::new(),
            model_grades: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPriority {
    /// Keep the record with the highest outcome (ties: highest grade)
    #[default]
    HighestOutcome,
    /// Keep the record with the lowest outcome (ties: highest grade)
    LowestOutcome,
    /// Keep the record with the highest grade (ties: highest outcome)
    LatestGrade,
}

/// How a group's rate (0-100, or larger for weighted measures) is derived.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MeasureConfig {
    /// Percentage of records whose outcome falls in `positive` (a range expression)
    PositiveRate { positive: String },
    /// Median outcome (e.g. student growth percentile)
    Median,
    /// Sum of per-level weights over tested records, as a percentage
    LevelWeighted {
        levels: Vec<LevelWeight>,
        /// Expected participation; scales the rate by tested / (target x enrolled)
        #[serde(default)]
        participation_target: Option<f64>,
    },
    /// Share of records in each category times that category's weight
    CategoryWeighted {
        column: String,
        weights: BTreeMap<String, f64>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LevelWeight {
    pub level: f64,
    pub weight: f64,
}

/// Scoring family: how a rate becomes points.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FamilyConfig {
    /// points = weight x (rate or 100 - rate) / 100
    DirectWeight {
        direction: Direction,
        /// Clamp points to the weight
        #[serde(default)]
        cap: bool,
    },
    /// Rate compared against a trimmed statewide reference, 0-5 points
    Banded {
        #[serde(default)]
        fence: FenceMode,
        /// Round the reference mean/std before comparing
        #[serde(default)]
        reference_decimals: Option<u32>,
        /// Round the rate and thresholds before comparing
        #[serde(default)]
        band_decimals: Option<u32>,
        /// Rescale the 0-5 band to the model weight
        #[serde(default)]
        scale_to_weight: bool,
    },
    /// Current-year rate compared against the prior-year rate of `baseline`
    Comparison {
        /// Indicator whose prior-year table holds the baseline (default: this one)
        #[serde(default)]
        baseline: Option<String>,
        direction: Direction,
        /// Require a strict improvement; otherwise equal counts as maintained
        #[serde(default = "default_true")]
        strict: bool,
        /// A current rate at or beyond this value always counts as maintained
        #[serde(default)]
        target: Option<f64>,
    },
    /// Rate relative to the statewide average school rate, mapped through descending tiers
    RelativeTiers {
        tiers: Vec<Tier>,
        /// Count a school must bring up to the N-count, both to be scored and
        /// to enter the statewide average
        #[serde(default)]
        gate: CountBasis,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CountBasis {
    /// Students meeting the positive condition (e.g. students receiving services)
    #[default]
    Positive,
    Eligible,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FenceMode {
    /// Keep rates in [Q1 - fence, Q3 + fence]
    #[default]
    Inclusive,
    /// Keep rates in (Q1 - fence, Q3 + fence)
    Exclusive,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Tier {
    /// Minimum ratio of school rate to statewide rate
    pub ratio: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubDimensionConfig {
    pub dimension: Dimension,

    /// Relative share of the weight per dimension value (normalized to sum to 1).
    /// Values not listed are dropped.
    pub shares: BTreeMap<String, f64>,

    #[serde(default)]
    pub rollup: Rollup,

    /// The total is null unless every listed value was scored
    #[serde(default)]
    pub require_all: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Subject,
    Grade,
    /// Any extra column of the record table
    Column(String),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rollup {
    /// Sum the scored values; null only when all are null
    #[default]
    Sum,
    /// Take the best scored value, rescaled from its share to the full weight
    Max,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorRole {
    /// Points count toward the composite with the model weight
    #[default]
    Component,
    /// Points are added to the composite percentage as bonus
    Bonus,
}

/// Historical stitching for one result table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// Number of prior fiscal years to attach
    pub years: u32,

    /// Column of the prior-year table to carry forward
    #[serde(default = "default_history_column")]
    pub column: String,

    /// Column renames applied to prior-year tables before merging (old -> new)
    #[serde(default)]
    pub renames: BTreeMap<String, String>,

    /// Subgroup label remaps applied to prior-year tables (old -> new)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_history_column() -> String {
    "points".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Eligible grades (kindergarten is 0). Empty means every grade.
    #[serde(default)]
    pub grades: Vec<i32>,

    /// Indicator name -> component weight
    pub weights: BTreeMap<String, f64>,

    /// Ordered, closed-interval cut bands partitioning [0, max_percentage]
    pub cut_bands: Vec<CutBand>,

    /// Schools with less eligible weight than this are not rated
    #[serde(default)]
    pub min_eligible_weight: f64,

    /// Upper bound of the percentage after bonus
    #[serde(default = "default_max_percentage")]
    pub max_percentage: f64,

    /// When false, rated schools get the preliminary grade "P"
    #[serde(default = "default_true")]
    pub produce_grades: bool,
}

fn default_max_percentage() -> f64 {
    100.0
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CutBand {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IdentificationConfig {
    /// Percentile of the population's composite percentages used as the cutoff
    #[serde(default = "default_percentile")]
    pub percentile: f64,

    /// Fixed cutoff carried from an identification year; skips the percentile
    #[serde(default)]
    pub threshold: Option<f64>,
}

fn default_percentile() -> f64 {
    5.0
}

impl Config {
    pub fn indicator(&self, name: &str) -> Option<&IndicatorConfig> {
        self.indicators.iter().find(|i| i.name == name)
    }
}

impl IndicatorConfig {
    pub fn n_count(&self, config: &Config) -> u64 {
        self.n_count.unwrap_or(config.n_count)
    }
}
