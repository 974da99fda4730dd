use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use crate::config::{Dimension, IndicatorConfig, MeasureConfig, SubDimensionConfig};
use crate::error::EngineError;

pub const STUDENT_ID: &str = "student_id";
pub const SCHOOL_ID: &str = "school_id";
pub const MODEL: &str = "model";
pub const GRADE: &str = "grade";
pub const SUBJECT: &str = "subject";
pub const OUTCOME: &str = "outcome";
pub const ELIGIBLE: &str = "eligible";
pub const TESTED: &str = "tested";

/// One canonical student row, as produced by the extract step.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub student_id: String,
    pub school_id: String,
    pub model: String,
    /// Kindergarten is 0, pre-school -1
    pub grade: Option<i32>,
    pub subject: Option<String>,
    pub outcome: Option<f64>,
    /// Full-academic-year (or equivalent) eligibility flag
    pub eligible: bool,
    pub tested: bool,
    /// Every non-canonical column: subgroup memberships, categories, rate types
    pub attributes: BTreeMap<String, String>,
}

impl StudentRecord {
    pub fn attribute(&self, column: &str) -> Option<&str> {
        self.attributes
            .get(column)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Value of a sub-dimension for this record, if present
    pub fn dimension_value(&self, dimension: &Dimension) -> Option<String> {
        match dimension {
            Dimension::Subject => self.subject.clone(),
            Dimension::Grade => self.grade.map(|g| g.to_string()),
            Dimension::Column(column) => self.attribute(column).map(str::to_string),
        }
    }
}

/// A parsed record table plus the header it was read with, so each indicator
/// can check its own required columns.
#[derive(Debug, Clone, Default)]
pub struct RecordTable {
    pub columns: BTreeSet<String>,
    pub records: Vec<StudentRecord>,
}

impl RecordTable {
    pub fn new(columns: impl IntoIterator<Item = String>, records: Vec<StudentRecord>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
            records,
        }
    }

    /// Check that every column `indicator` needs is present.
    pub fn check_schema(&self, indicator: &IndicatorConfig) -> Result<(), EngineError> {
        let missing: Vec<String> = required_columns(indicator)
            .into_iter()
            .filter(|c| !self.columns.contains(c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Schema {
                indicator: indicator.name.clone(),
                missing,
            })
        }
    }
}

/// Columns an indicator reads from its source table, in a stable order.
pub fn required_columns(indicator: &IndicatorConfig) -> Vec<String> {
    let mut columns: Vec<String> = [STUDENT_ID, SCHOOL_ID, MODEL]
        .iter()
        .map(|c| c.to_string())
        .collect();

    let mut push = |c: &str| {
        if !columns.iter().any(|existing| existing == c) {
            columns.push(c.to_string());
        }
    };

    if indicator.eligibility.require_flag {
        push(ELIGIBLE);
    }
    if indicator.eligibility.model_grades || indicator.dedup == crate::config::DedupPriority::LatestGrade {
        push(GRADE);
    }
    if !indicator.eligibility.subjects.is_empty() {
        push(SUBJECT);
    }
    if !indicator.eligibility.exclude_outcomes.is_empty() {
        push(OUTCOME);
    }

    match &indicator.measure {
        MeasureConfig::PositiveRate { .. } | MeasureConfig::Median => push(OUTCOME),
        MeasureConfig::LevelWeighted {
            participation_target,
            ..
        } => {
            push(OUTCOME);
            if participation_target.is_some() {
                push(TESTED);
            }
        }
        MeasureConfig::CategoryWeighted { column, .. } => push(column.as_str()),
    }

    if let Some(SubDimensionConfig { dimension, .. }) = &indicator.sub_dimension {
        match dimension {
            Dimension::Subject => push(SUBJECT),
            Dimension::Grade => push(GRADE),
            Dimension::Column(column) => push(column.as_str()),
        }
    }

    for subgroup in &indicator.subgroups {
        push(subgroup.as_str());
    }

    columns
}

/// Read a canonical student-record CSV.
///
/// Missing columns are not an error here; they are reported per indicator by
/// [`RecordTable::check_schema`]. Rows without a student or school id are skipped.
pub fn read_records<R: Read>(reader: R) -> Result<RecordTable, EngineError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns: BTreeSet<String> = csv_reader.headers()?.iter().map(str::to_string).collect();

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in csv_reader.deserialize::<BTreeMap<String, String>>() {
        let mut row = row?;
        let mut take = |column: &str| row.remove(column).filter(|v| !v.is_empty());

        let (Some(student_id), Some(school_id)) = (take(STUDENT_ID), take(SCHOOL_ID)) else {
            skipped += 1;
            continue;
        };
        let model = take(MODEL).unwrap_or_default();
        let grade = take(GRADE).as_deref().and_then(parse_grade);
        let subject = take(SUBJECT);
        let outcome = take(OUTCOME).as_deref().and_then(parse_number);
        let eligible = take(ELIGIBLE).as_deref().map(parse_flag).unwrap_or(false);
        let tested = take(TESTED).as_deref().map(parse_flag).unwrap_or(true);

        records.push(StudentRecord {
            student_id,
            school_id,
            model,
            grade,
            subject,
            outcome,
            eligible,
            tested,
            attributes: row,
        });
    }

    if skipped > 0 {
        tracing::warn!(skipped, "skipped student rows without a student or school id");
    }

    Ok(RecordTable { columns, records })
}

/// Parse a grade label: numbers as-is, "KG"/"K" as 0, "PS" as -1.
pub fn parse_grade(value: &str) -> Option<i32> {
    let value = value.trim();
    match value.to_ascii_uppercase().as_str() {
        "KG" | "K" => Some(0),
        "PS" => Some(-1),
        other => other.parse::<i32>().ok(),
    }
}

/// Parse a number, tolerating a trailing percent sign.
pub fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim().trim_end_matches('%').trim();
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "y" | "yes"
    )
}
