use anyhow::{Context, Result};
use atomic_write_file::AtomicWriteFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::table::Table;

/// Persistence collaborator for result tables.
///
/// Reading a table that was never written is `Ok(None)`, not an error.
pub trait TableStore {
    fn read_table(&self, name: &str, fiscal_year: i32) -> Result<Option<Table>, EngineError>;

    fn write_table(&mut self, name: &str, fiscal_year: i32, table: &Table) -> Result<(), EngineError>;
}

/// Tables as CSV files under `<root>/<fiscal_year>/<name>.csv`.
#[derive(Debug, Clone)]
pub struct CsvTableStore {
    root: PathBuf,
}

impl CsvTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn year_dir(&self, fiscal_year: i32) -> PathBuf {
        self.root.join(fiscal_year.to_string())
    }

    pub fn table_path(&self, name: &str, fiscal_year: i32) -> PathBuf {
        self.year_dir(fiscal_year).join(format!("{}.csv", name))
    }

    pub fn manifest_path(&self, fiscal_year: i32) -> PathBuf {
        self.year_dir(fiscal_year).join("run.json")
    }

    /// Fiscal years that hold a table called `name`, oldest first
    pub fn fiscal_years(&self, name: &str) -> Result<Vec<i32>> {
        let pattern = self.root.join("*").join(format!("{}.csv", name));
        let pattern = pattern
            .to_str()
            .with_context(|| format!("Store path is not valid UTF-8: {}", pattern.display()))?
            .to_string();
        let mut years: Vec<i32> = glob::glob(&pattern)
            .with_context(|| format!("Invalid store pattern {}", pattern))?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                path.parent()?
                    .file_name()?
                    .to_str()?
                    .parse::<i32>()
                    .ok()
            })
            .collect();
        years.sort_unstable();
        Ok(years)
    }

    fn load(&self, name: &str, fiscal_year: i32) -> Result<Option<Table>> {
        let path = self.table_path(name, fiscal_year);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)
            .with_context(|| format!("Failed to open table at {}", path.display()))?;
        let table = Table::read_csv(file)
            .with_context(|| format!("Failed to read table at {}", path.display()))?;
        Ok(Some(table))
    }

    fn save(&self, name: &str, fiscal_year: i32, table: &Table) -> Result<()> {
        let dir = self.year_dir(fiscal_year);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory at {}", dir.display()))?;

        let path = self.table_path(name, fiscal_year);
        let mut file = AtomicWriteFile::open(&path)
            .with_context(|| format!("Failed to open atomic write file at {}", path.display()))?;
        table
            .write_csv(&mut file)
            .with_context(|| format!("Failed to serialize table {}", name))?;
        file.commit()
            .with_context(|| format!("Failed to save table at {}", path.display()))?;
        Ok(())
    }

    /// Manifest of the last completed run for `fiscal_year`, if any
    pub fn previous_manifest(&self, fiscal_year: i32) -> Result<Option<RunManifest>> {
        let path = self.manifest_path(fiscal_year);
        if !path.exists() {
            return Ok(None);
        }
        load_manifest(&path).map(Some)
    }

    pub fn save_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let dir = self.year_dir(manifest.fiscal_year);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory at {}", dir.display()))?;
        save_manifest(&self.manifest_path(manifest.fiscal_year), manifest)
    }
}

fn store_error(name: &str, fiscal_year: i32, err: anyhow::Error) -> EngineError {
    EngineError::Store {
        name: name.to_string(),
        fiscal_year,
        message: format!("{:#}", err),
    }
}

impl TableStore for CsvTableStore {
    fn read_table(&self, name: &str, fiscal_year: i32) -> Result<Option<Table>, EngineError> {
        self.load(name, fiscal_year)
            .map_err(|e| store_error(name, fiscal_year, e))
    }

    fn write_table(&mut self, name: &str, fiscal_year: i32, table: &Table) -> Result<(), EngineError> {
        self.save(name, fiscal_year, table)
            .map_err(|e| store_error(name, fiscal_year, e))
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    tables: BTreeMap<(String, i32), Table>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl TableStore for MemoryTableStore {
    fn read_table(&self, name: &str, fiscal_year: i32) -> Result<Option<Table>, EngineError> {
        Ok(self.tables.get(&(name.to_string(), fiscal_year)).cloned())
    }

    fn write_table(&mut self, name: &str, fiscal_year: i32, table: &Table) -> Result<(), EngineError> {
        self.tables
            .insert((name.to_string(), fiscal_year), table.clone());
        Ok(())
    }
}

/// How one indicator fared in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Scored,
    SubstitutedNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSummary {
    pub name: String,
    pub status: IndicatorStatus,
    pub rows: usize,
    pub suppressed: usize,
}

/// Record of a run, written next to the result tables as `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    pub fiscal_year: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub indicators: Vec<IndicatorSummary>,
    /// Degeneracy, join-integrity and history notes, one line each
    pub warnings: Vec<String>,
}

pub fn load_manifest(path: &Path) -> Result<RunManifest> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open run manifest at {}", path.display()))?;
    let manifest: RunManifest =
        serde_json::from_reader(file).context("Failed to load run manifest")?;
    if manifest.version != 1 {
        anyhow::bail!("Unsupported run manifest version: {}", manifest.version);
    }
    Ok(manifest)
}

pub fn save_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let mut file = AtomicWriteFile::open(path)
        .with_context(|| format!("Failed to open atomic write file at {}", path.display()))?;
    serde_json::to_writer_pretty(&mut file, manifest).context("Failed to serialize run manifest")?;
    file.write_all(b"\n")?;
    file.commit().context("Failed to save run manifest")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use std::env;

    fn table() -> Table {
        let mut table = Table::new(vec!["school_id".to_string(), "points".to_string()]);
        table.push(vec![Cell::text("100"), Cell::Number(8.5)]);
        table.push(vec![Cell::text("101"), Cell::Null]);
        table
    }

    fn temp_store(name: &str) -> CsvTableStore {
        let root = env::temp_dir().join(format!("accountability_engine_test_{}", name));
        let _ = std::fs::remove_dir_all(&root);
        CsvTableStore::new(root)
    }

    #[test]
    fn test_missing_table_is_none() {
        let store = temp_store("missing");
        assert!(store.read_table("composite", 2024).unwrap().is_none());
    }

    #[test]
    fn test_csv_store_roundtrip() {
        let mut store = temp_store("roundtrip");
        store.write_table("dropout", 2023, &table()).unwrap();
        store.write_table("dropout", 2024, &table()).unwrap();

        let back = store.read_table("dropout", 2024).unwrap().unwrap();
        assert_eq!(back.rows.len(), 2);
        assert_eq!(back.cell(0, "points").and_then(Cell::as_f64), Some(8.5));
        assert!(back.cell(1, "points").unwrap().is_null());
        assert_eq!(store.fiscal_years("dropout").unwrap(), vec![2023, 2024]);
        assert!(store.fiscal_years("growth").unwrap().is_empty());

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryTableStore::new();
        assert!(store.is_empty());
        store.write_table("growth", 2024, &table()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read_table("growth", 2024).unwrap(), Some(table()));
        assert_eq!(store.read_table("growth", 2023).unwrap(), None);
    }

    #[test]
    fn test_manifest_roundtrip() {
        let store = temp_store("manifest");
        let now = Utc::now();
        let manifest = RunManifest {
            version: 1,
            fiscal_year: 2024,
            started_at: now,
            finished_at: now,
            indicators: vec![IndicatorSummary {
                name: "el".to_string(),
                status: IndicatorStatus::SubstitutedNull,
                rows: 0,
                suppressed: 0,
            }],
            warnings: vec!["el: missing columns outcome".to_string()],
        };
        assert_eq!(store.previous_manifest(2024).unwrap(), None);
        store.save_manifest(&manifest).unwrap();
        let loaded = store.previous_manifest(2024).unwrap();
        assert_eq!(loaded, Some(manifest));

        std::fs::write(store.manifest_path(2024), r#"{"version": 2}"#).unwrap();
        assert!(store.previous_manifest(2024).is_err());

        let _ = std::fs::remove_dir_all(store.root());
    }
}
