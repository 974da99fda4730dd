use std::collections::BTreeMap;
use std::fmt;

use crate::aggregate::GroupKey;
use crate::config::HistoryConfig;
use crate::error::EngineError;
use crate::store::TableStore;
use crate::table::Table;

/// A key that appears more than once in a historical table. The affected
/// cells are left null rather than picking one of the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinIntegrityWarning {
    pub table: String,
    pub fiscal_year: i32,
    pub key: GroupKey,
    pub rows: usize,
}

impl fmt::Display for JoinIntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} rows for school {} model {}",
            self.table, self.fiscal_year, self.rows, self.key.school_id, self.key.model
        )?;
        if let Some(ref subgroup) = self.key.subgroup {
            write!(f, " subgroup {}", subgroup)?;
        }
        if let Some(ref value) = self.key.sub_dimension {
            write!(f, " sub-dimension {}", value)?;
        }
        Ok(())
    }
}

/// Whether a prior year could be joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    Available,
    Unavailable(String),
}

impl HistoryStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, HistoryStatus::Available)
    }
}

/// Historical values for a set of current keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stitched {
    /// One entry per current key, with every requested year present
    pub values: BTreeMap<GroupKey, BTreeMap<i32, Option<f64>>>,
    pub statuses: BTreeMap<i32, HistoryStatus>,
    pub warnings: Vec<JoinIntegrityWarning>,
}

impl Stitched {
    /// Take the history of `key`; keys never seen get an empty map.
    pub fn take(&mut self, key: &GroupKey) -> BTreeMap<i32, Option<f64>> {
        self.values.remove(key).unwrap_or_default()
    }

    /// Status and warning lines for the run manifest
    pub fn notes(&self, name: &str) -> Vec<String> {
        let mut notes: Vec<String> = self
            .statuses
            .iter()
            .filter_map(|(year, status)| match status {
                HistoryStatus::Available => None,
                HistoryStatus::Unavailable(reason) => {
                    Some(format!("{} ({}): history unavailable: {}", name, year, reason))
                }
            })
            .collect();
        notes.extend(self.warnings.iter().map(|w| format!("duplicate key in {}", w)));
        notes
    }
}

/// Apply declared renames and label remaps to a prior-year table.
fn normalize(table: &mut Table, config: &HistoryConfig) {
    for (from, to) in &config.renames {
        table.rename_column(from, to);
    }
    if config.labels.is_empty() {
        return;
    }
    if let Some(idx) = table.column("subgroup") {
        for row in table.rows.iter_mut() {
            if let Some(label) = row[idx].as_text() {
                if let Some(new) = config.labels.get(&label) {
                    row[idx] = crate::table::Cell::text(new.as_str());
                }
            }
        }
    }
}

/// Index a table by join key. Keys seen more than once map to `Err(rows)`.
fn index_rows(table: &Table) -> BTreeMap<GroupKey, Result<usize, usize>> {
    let mut index: BTreeMap<GroupKey, Result<usize, usize>> = BTreeMap::new();
    for row in 0..table.rows.len() {
        let Some(key) = table.row_key(row) else {
            continue;
        };
        index
            .entry(key)
            .and_modify(|e| {
                *e = match *e {
                    Ok(_) => Err(2),
                    Err(n) => Err(n + 1),
                }
            })
            .or_insert(Ok(row));
    }
    index
}

/// Left-join the prior `config.years` fiscal years of table `name` onto `keys`.
///
/// Every key gets a value (possibly null) for every year. A missing table or
/// column makes that year unavailable; duplicate keys null just their cells.
pub fn stitch_history(
    keys: &[GroupKey],
    store: &dyn TableStore,
    name: &str,
    fiscal_year: i32,
    config: &HistoryConfig,
) -> Result<Stitched, EngineError> {
    let mut stitched = Stitched {
        values: keys.iter().map(|k| (k.clone(), BTreeMap::new())).collect(),
        ..Stitched::default()
    };

    for year in (1..=config.years as i32).map(|back| fiscal_year - back) {
        let status = match store.read_table(name, year)? {
            None => HistoryStatus::Unavailable("no table".to_string()),
            Some(mut table) => {
                normalize(&mut table, config);
                match table.column(&config.column) {
                    None => HistoryStatus::Unavailable(format!("no column '{}'", config.column)),
                    Some(col) => {
                        let index = index_rows(&table);
                        for (key, years) in stitched.values.iter_mut() {
                            let value = match index.get(key) {
                                Some(Ok(row)) => table.rows[*row][col].as_f64(),
                                Some(Err(rows)) => {
                                    stitched.warnings.push(JoinIntegrityWarning {
                                        table: name.to_string(),
                                        fiscal_year: year,
                                        key: key.clone(),
                                        rows: *rows,
                                    });
                                    None
                                }
                                None => None,
                            };
                            years.insert(year, value);
                        }
                        HistoryStatus::Available
                    }
                }
            }
        };

        if let HistoryStatus::Unavailable(ref reason) = status {
            tracing::warn!(table = name, fiscal_year = year, reason = %reason, "history unavailable");
            for years in stitched.values.values_mut() {
                years.insert(year, None);
            }
        }
        stitched.statuses.insert(year, status);
    }

    for warning in &stitched.warnings {
        tracing::warn!(%warning, "duplicate key in historical table; cell left null");
    }

    Ok(stitched)
}

/// Prior-year counts and rate of one group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorRow {
    pub rate: Option<f64>,
    pub eligible: Option<u64>,
}

/// Prior-year result of a comparison baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorYear {
    pub fiscal_year: i32,
    pub rows: BTreeMap<GroupKey, PriorRow>,
}

/// Load the prior-year result of indicator `name`, if it was persisted.
///
/// Duplicate keys are dropped, so those groups compare as having no prior year.
pub fn prior_year(
    store: &dyn TableStore,
    name: &str,
    fiscal_year: i32,
    config: Option<&HistoryConfig>,
) -> Result<Option<PriorYear>, EngineError> {
    let prior = fiscal_year - 1;
    let Some(mut table) = store.read_table(name, prior)? else {
        tracing::warn!(table = name, fiscal_year = prior, "no prior-year baseline table");
        return Ok(None);
    };
    if let Some(config) = config {
        normalize(&mut table, config);
    }

    let mut rows = BTreeMap::new();
    for (key, entry) in index_rows(&table) {
        match entry {
            Ok(row) => {
                let cell = |column: &str| table.cell(row, column).and_then(|c| c.as_f64());
                rows.insert(
                    key,
                    PriorRow {
                        rate: cell("rate"),
                        eligible: cell("eligible").map(|v| v.max(0.0) as u64),
                    },
                );
            }
            Err(count) => {
                let warning = JoinIntegrityWarning {
                    table: name.to_string(),
                    fiscal_year: prior,
                    key,
                    rows: count,
                };
                tracing::warn!(%warning, "duplicate key in baseline table; group not compared");
            }
        }
    }

    Ok(Some(PriorYear {
        fiscal_year: prior,
        rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTableStore;
    use crate::table::Cell;

    fn prior_table(rows: &[(&str, &str, Option<f64>)]) -> Table {
        let mut table = Table::new(
            ["school_id", "model", "subgroup", "ProficiencyPoints"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        );
        for (school, subgroup, points) in rows {
            table.push(vec![
                Cell::text(*school),
                Cell::text("k-8"),
                Cell::text(*subgroup),
                points.map(Cell::Number).unwrap_or(Cell::Null),
            ]);
        }
        table
    }

    fn config() -> HistoryConfig {
        HistoryConfig {
            years: 2,
            column: "points".to_string(),
            renames: [("ProficiencyPoints".to_string(), "points".to_string())]
                .into_iter()
                .collect(),
            labels: [("SPED".to_string(), "SWD".to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn test_stitch_renames_and_remaps() {
        let mut store = MemoryTableStore::new();
        store
            .write_table(
                "proficiency",
                2023,
                &prior_table(&[("100", "All", Some(21.5)), ("100", "SPED", Some(9.0))]),
            )
            .unwrap();

        let total = GroupKey::school("100", "k-8");
        let swd = total.clone().with_subgroup(Some("SWD"));
        let new_school = GroupKey::school("300", "k-8");
        let keys = vec![total.clone(), swd.clone(), new_school.clone()];

        let mut stitched = stitch_history(&keys, &store, "proficiency", 2024, &config()).unwrap();
        assert!(stitched.statuses[&2023].is_available());
        assert_eq!(
            stitched.statuses[&2022],
            HistoryStatus::Unavailable("no table".to_string())
        );
        assert_eq!(stitched.take(&total), BTreeMap::from([(2022, None), (2023, Some(21.5))]));
        assert_eq!(stitched.take(&swd)[&2023], Some(9.0));
        // current rows are never dropped
        assert_eq!(stitched.take(&new_school)[&2023], None);
        assert_eq!(stitched.notes("proficiency").len(), 1);
    }

    #[test]
    fn test_duplicate_keys_null_the_cell() {
        let mut store = MemoryTableStore::new();
        store
            .write_table(
                "proficiency",
                2023,
                &prior_table(&[("100", "All", Some(21.5)), ("100", "All", Some(30.0)), ("101", "All", Some(4.0))]),
            )
            .unwrap();
        let keys = vec![GroupKey::school("100", "k-8"), GroupKey::school("101", "k-8")];
        let mut stitched = stitch_history(&keys, &store, "proficiency", 2024, &config()).unwrap();

        assert_eq!(stitched.warnings.len(), 1);
        assert_eq!(stitched.warnings[0].rows, 2);
        assert_eq!(stitched.take(&keys[0])[&2023], None);
        assert_eq!(stitched.take(&keys[1])[&2023], Some(4.0));
    }

    #[test]
    fn test_missing_column_is_unavailable() {
        let mut store = MemoryTableStore::new();
        store
            .write_table("proficiency", 2023, &prior_table(&[("100", "All", Some(1.0))]))
            .unwrap();
        let mut config = config();
        config.renames.clear();
        let stitched =
            stitch_history(&[GroupKey::school("100", "k-8")], &store, "proficiency", 2024, &config).unwrap();
        assert!(!stitched.statuses[&2023].is_available());
    }

    #[test]
    fn test_prior_year_rows() {
        let mut store = MemoryTableStore::new();
        let mut table = Table::new(
            ["school_id", "model", "subgroup", "eligible", "rate"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        );
        table.push(vec![
            Cell::text("200"),
            Cell::text("9-12"),
            Cell::text("SWD"),
            Cell::text("12"),
            Cell::text("4.5"),
        ]);
        table.push(vec![
            Cell::text("200"),
            Cell::text("9-12"),
            Cell::text("All"),
            Cell::text("8"),
            Cell::Null,
        ]);
        store.write_table("dropout", 2023, &table).unwrap();

        let prior = prior_year(&store, "dropout", 2024, None).unwrap().unwrap();
        assert_eq!(prior.fiscal_year, 2023);
        let swd = GroupKey::school("200", "9-12").with_subgroup(Some("SWD"));
        assert_eq!(
            prior.rows[&swd],
            PriorRow {
                rate: Some(4.5),
                eligible: Some(12)
            }
        );
        let total = &prior.rows[&GroupKey::school("200", "9-12")];
        assert_eq!(total.rate, None);
        assert!(prior_year(&store, "dropout", 2023, None).unwrap().is_none());
    }
}
