use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use crate::aggregate::{round_to, GroupKey};
use crate::composite::{CompositeScore, DistrictGrade};
use crate::error::EngineError;
use crate::indicator::IndicatorResult;
use crate::records::parse_number;

/// Subgroup label written for all-students rows
pub const ALL_STUDENTS: &str = "All";

/// One cell of a presentation table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn opt_number(value: Option<f64>, decimals: u32) -> Self {
        match value {
            Some(v) => Cell::Number(round_to(v, decimals)),
            None => Cell::Null,
        }
    }

    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(v) => Cell::Text(v.to_string()),
            None => Cell::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Numeric value; text cells are parsed (tables read from CSV hold text).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Null => None,
            Cell::Number(v) => Some(*v),
            Cell::Text(s) => parse_number(s),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Number(v) => Some(v.to_string()),
            Cell::Text(s) => Some(s.clone()),
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Number(v) => write!(f, "{}", v),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// Wide, presentation-shaped table. Only built at the persistence and
/// output boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&Cell> {
        let idx = self.column(name)?;
        self.rows.get(row)?.get(idx)
    }

    /// Rename a column in place. Returns false when `from` does not exist.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Join key of a row. Missing key columns are read as empty.
    pub fn row_key(&self, row: usize) -> Option<GroupKey> {
        let text = |name: &str| self.cell(row, name).and_then(Cell::as_text);
        let school_id = text("school_id")?;
        let model = text("model").unwrap_or_default();
        let subgroup = text("subgroup").filter(|s| s != ALL_STUDENTS);
        let sub_dimension = text("sub_dimension");
        Some(GroupKey {
            school_id,
            model,
            subgroup,
            sub_dimension,
        })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), EngineError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for row in &self.rows {
            csv_writer.write_record(row.iter().map(|c| c.to_string()))?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    /// Read a table back. Every non-empty cell comes back as text.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, EngineError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let columns: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let mut table = Table::new(columns);
        for record in csv_reader.records() {
            let record = record?;
            table.rows.push(
                record
                    .iter()
                    .map(|v| if v.is_empty() { Cell::Null } else { Cell::text(v) })
                    .collect(),
            );
        }
        Ok(table)
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

fn history_columns<'a>(
    histories: impl Iterator<Item = &'a BTreeMap<i32, Option<f64>>>,
) -> Vec<i32> {
    let years: BTreeSet<i32> = histories.flat_map(|h| h.keys().copied()).collect();
    years.into_iter().rev().collect()
}

/// Long-form indicator result as a wide table.
///
/// History columns are named `<column>_<fiscal year>`, newest first.
pub fn indicator_table(result: &IndicatorResult, decimals: u32, history_column: &str) -> Table {
    let years = history_columns(result.rows.iter().map(|r| &r.history));
    let mut columns: Vec<String> = [
        "school_id",
        "model",
        "subgroup",
        "sub_dimension",
        "eligible",
        "positive",
        "rate",
        "band",
        "improved",
        "points",
        "reason",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.extend(years.iter().map(|y| format!("{}_{}", history_column, y)));

    let mut table = Table::new(columns);
    for row in &result.rows {
        let mut cells = vec![
            Cell::text(&row.key.school_id),
            Cell::text(&row.key.model),
            Cell::text(row.key.subgroup.as_deref().unwrap_or(ALL_STUDENTS)),
            Cell::opt_text(row.key.sub_dimension.as_deref()),
            Cell::Number(row.stats.eligible as f64),
            Cell::Number(row.stats.positive as f64),
            Cell::opt_number(row.rate, decimals),
            row.band.map(|b| Cell::Number(b as f64)).unwrap_or(Cell::Null),
            row.improved
                .map(|i| Cell::text(if i { "Yes" } else { "No" }))
                .unwrap_or(Cell::Null),
            Cell::opt_number(row.points, decimals),
            Cell::opt_text(row.reason.as_ref().map(|r| r.label())),
        ];
        cells.extend(
            years
                .iter()
                .map(|y| Cell::opt_number(row.history.get(y).copied().flatten(), decimals)),
        );
        table.push(cells);
    }
    table
}

/// Composite scores as a wide table.
pub fn composite_table(scores: &[CompositeScore], decimals: u32, history_column: &str) -> Table {
    let years = history_columns(scores.iter().map(|s| &s.history));
    let mut columns: Vec<String> = [
        "school_id",
        "model",
        "points_earned",
        "points_eligible",
        "percentage",
        "bonus",
        "total",
        "grade",
        "not_rated_reason",
        "identified",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.extend(years.iter().map(|y| format!("{}_{}", history_column, y)));

    let mut table = Table::new(columns);
    for score in scores {
        let mut cells = vec![
            Cell::text(&score.school_id),
            Cell::text(&score.model),
            Cell::Number(round_to(score.points_earned, decimals)),
            Cell::Number(round_to(score.points_eligible, decimals)),
            Cell::opt_number(score.percentage, decimals),
            Cell::Number(round_to(score.bonus, decimals)),
            Cell::opt_number(score.total, decimals),
            Cell::text(score.grade.label()),
            Cell::opt_text(score.not_rated_reason.as_ref().map(|r| r.to_string()).as_deref()),
            score
                .identified
                .map(|i| Cell::text(if i { "Yes" } else { "No" }))
                .unwrap_or(Cell::Null),
        ];
        cells.extend(
            years
                .iter()
                .map(|y| Cell::opt_number(score.history.get(y).copied().flatten(), decimals)),
        );
        table.push(cells);
    }
    table
}

/// District roll-up as a table.
pub fn district_table(districts: &[DistrictGrade], decimals: u32) -> Table {
    let columns = ["district_id", "schools_rated", "gpa", "grade"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let mut table = Table::new(columns);
    for district in districts {
        table.push(vec![
            Cell::text(&district.district_id),
            Cell::Number(district.schools_rated as f64),
            Cell::opt_number(district.gpa, decimals),
            Cell::text(district.grade.label()),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::GroupStats;
    use crate::config::IndicatorRole;
    use crate::indicator::{ScoredGroup, SuppressionReason};

    fn result() -> IndicatorResult {
        let mut scored = ScoredGroup::new(
            GroupKey::school("100", "k-8"),
            GroupStats {
                eligible: 25,
                positive: 5,
                rate: Some(20.0),
            },
        );
        scored.points = Some(8.0);
        scored.history.insert(2023, Some(7.456));
        scored.history.insert(2022, None);

        let mut small = ScoredGroup::new(
            GroupKey::school("100", "k-8").with_subgroup(Some("SWD")),
            GroupStats {
                eligible: 3,
                positive: 1,
                rate: Some(100.0 / 3.0),
            },
        );
        small.suppress(SuppressionReason::BelowNCount {
            eligible: 3,
            n_count: 20,
        });

        let mut result = IndicatorResult::empty("chronic_absence", IndicatorRole::Component);
        result.rows = vec![scored, small];
        result
    }

    #[test]
    fn test_indicator_projection() {
        let table = indicator_table(&result(), 2, "points");
        assert_eq!(table.columns[11], "points_2023");
        assert_eq!(table.columns[12], "points_2022");
        assert_eq!(table.cell(0, "points"), Some(&Cell::Number(8.0)));
        assert_eq!(table.cell(0, "subgroup"), Some(&Cell::text("All")));
        assert_eq!(table.cell(0, "points_2023"), Some(&Cell::Number(7.46)));
        assert!(table.cell(0, "points_2022").unwrap().is_null());
        assert_eq!(table.cell(1, "rate"), Some(&Cell::Number(33.33)));
        assert!(table.cell(1, "points").unwrap().is_null());
        assert_eq!(table.cell(1, "reason"), Some(&Cell::text("below_n_count")));
    }

    #[test]
    fn test_csv_round_trip_keeps_nulls_and_keys() {
        let table = indicator_table(&result(), 2, "points");
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let back = Table::read_csv(buf.as_slice()).unwrap();

        assert_eq!(back.columns, table.columns);
        assert_eq!(back.rows.len(), 2);
        assert_eq!(back.cell(0, "points").and_then(Cell::as_f64), Some(8.0));
        assert!(back.cell(1, "points").unwrap().is_null());
        assert_eq!(back.row_key(0), Some(GroupKey::school("100", "k-8")));
        assert_eq!(
            back.row_key(1),
            Some(GroupKey::school("100", "k-8").with_subgroup(Some("SWD")))
        );
    }

    #[test]
    fn test_rename_column() {
        let mut table = Table::new(vec!["school_id".to_string(), "ProficiencyPoints".to_string()]);
        assert!(table.rename_column("ProficiencyPoints", "points"));
        assert!(!table.rename_column("missing", "x"));
        assert_eq!(table.column("points"), Some(1));
    }

    #[test]
    fn test_to_json() {
        let table = indicator_table(&result(), 2, "points");
        let json = table.to_json();
        assert_eq!(json[0]["school_id"], "100");
        assert_eq!(json[0]["points"], 8.0);
        assert!(json[1]["points"].is_null());
    }
}
