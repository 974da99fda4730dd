use std::collections::BTreeMap;
use std::env;
use std::fs;

use accountability_engine::aggregate::GroupKey;
use accountability_engine::composite::{Grade, NotRatedReason, SchoolProfiles};
use accountability_engine::config::{parse_config, Config, SchemaPolicy};
use accountability_engine::orchestrator::{run, COMPOSITE_TABLE};
use accountability_engine::records::{read_records, RecordTable};
use accountability_engine::store::{CsvTableStore, IndicatorStatus, MemoryTableStore, TableStore};

const CONFIG: &str = r#"
n_count: 20
indicators:
  - name: chronic_absence
    source: attendance
    measure: { positive_rate: { positive: "1" } }
    family: { direct_weight: { direction: lower_is_better } }
  - name: proficiency
    source: assessment
    measure: { positive_rate: { positive: ">=3" } }
    family: { direct_weight: { direction: higher_is_better } }
models:
  k-8:
    weights: { chronic_absence: 10, proficiency: 20 }
    cut_bands:
      - { label: A, lower: 84, upper: 100 }
      - { label: B, lower: 72, upper: 83.99 }
      - { label: C, lower: 60, upper: 71.99 }
      - { label: D, lower: 47, upper: 59.99 }
      - { label: F, lower: 0, upper: 46.99 }
composite_history:
  years: 2
  column: percentage
"#;

fn config() -> Config {
    parse_config(CONFIG).unwrap()
}

/// `total` eligible students at `school`, the first `positive` of them with `hit` as outcome
fn rows(csv: &mut String, school: &str, total: usize, positive: usize, hit: &str, miss: &str) {
    for i in 0..total {
        let outcome = if i < positive { hit } else { miss };
        csv.push_str(&format!("{}-{},{},k-8,4,{},Y\n", school, i, school, outcome));
    }
}

fn attendance() -> RecordTable {
    let mut csv = String::from("student_id,school_id,model,grade,outcome,eligible\n");
    rows(&mut csv, "100", 25, 5, "1", "0");
    rows(&mut csv, "200", 15, 3, "1", "0");
    read_records(csv.as_bytes()).unwrap()
}

fn assessment() -> RecordTable {
    let mut csv = String::from("student_id,school_id,model,grade,outcome,eligible\n");
    rows(&mut csv, "100", 21, 14, "3", "2");
    rows(&mut csv, "200", 20, 10, "4", "1");
    read_records(csv.as_bytes()).unwrap()
}

fn sources() -> BTreeMap<String, RecordTable> {
    [
        ("attendance".to_string(), attendance()),
        ("assessment".to_string(), assessment()),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_run_scores_and_grades_schools() {
    let mut store = MemoryTableStore::new();
    let output = run(&config(), 2024, &sources(), &SchoolProfiles::new(), &mut store).unwrap();

    let absence = output.indicators.iter().find(|r| r.name == "chronic_absence").unwrap();
    let full = absence.row(&GroupKey::school("100", "k-8")).unwrap();
    assert_eq!(full.rate, Some(20.0));
    assert_eq!(full.points, Some(8.0));

    // 15 eligible students is under the n-count: the rate stays, the points do not
    let small = absence.row(&GroupKey::school("200", "k-8")).unwrap();
    assert_eq!(small.rate, Some(20.0));
    assert_eq!(small.points, None);

    assert_eq!(output.composites.len(), 2);
    let first = &output.composites[0];
    assert_eq!(first.school_id, "100");
    assert_eq!(first.points_eligible, 30.0);
    assert_eq!(first.percentage, Some(71.11));
    assert_eq!(first.grade, Grade::Letter("C".to_string()));

    let second = &output.composites[1];
    assert_eq!(second.points_eligible, 20.0);
    assert_eq!(second.percentage, Some(50.0));
    assert_eq!(second.grade, Grade::Letter("D".to_string()));

    let table = store.read_table(COMPOSITE_TABLE, 2024).unwrap().unwrap();
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.cell(0, "grade").and_then(|c| c.as_text()), Some("C".to_string()));
    assert!(store.read_table("proficiency", 2024).unwrap().is_some());
}

#[test]
fn test_composite_history_round_trips_through_csv_store() {
    let root = env::temp_dir().join(format!("accountability-engine-e2e-{}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    let mut store = CsvTableStore::new(&root);

    run(&config(), 2024, &sources(), &SchoolProfiles::new(), &mut store).unwrap();
    let output = run(&config(), 2025, &sources(), &SchoolProfiles::new(), &mut store).unwrap();

    let first = &output.composites[0];
    assert_eq!(first.history.get(&2024), Some(&Some(71.11)));
    assert_eq!(first.history.get(&2023), Some(&None));
    assert_eq!(store.fiscal_years(COMPOSITE_TABLE).unwrap(), vec![2024, 2025]);

    let table = store.read_table(COMPOSITE_TABLE, 2025).unwrap().unwrap();
    assert!(table.column("percentage_2024").is_some());
    assert_eq!(table.cell(0, "percentage_2024").and_then(|c| c.as_f64()), Some(71.11));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn test_schema_error_aborts_by_default() {
    let mut sources = sources();
    let bare = read_records("student_id,school_id,model,grade,eligible\n1,100,k-8,4,Y\n".as_bytes()).unwrap();
    sources.insert("assessment".to_string(), bare);

    let mut store = MemoryTableStore::new();
    let err = run(&config(), 2024, &sources, &SchoolProfiles::new(), &mut store).unwrap_err();
    assert!(err.is_schema());
    assert!(err.to_string().contains("proficiency"));
}

#[test]
fn test_schema_error_substitutes_null_when_configured() {
    let mut config = config();
    config.schema_policy = SchemaPolicy::SubstituteNull;
    let mut sources = sources();
    sources.remove("assessment");

    let mut store = MemoryTableStore::new();
    let output = run(&config, 2024, &sources, &SchoolProfiles::new(), &mut store).unwrap();

    let summary = output.summaries.iter().find(|s| s.name == "proficiency").unwrap();
    assert_eq!(summary.status, IndicatorStatus::SubstitutedNull);

    // only absence is left: school 100 keeps 8 of 10 points, school 200 has no eligible weight
    let first = &output.composites[0];
    assert_eq!(first.percentage, Some(80.0));
    assert_eq!(first.grade, Grade::Letter("B".to_string()));
    let second = &output.composites[1];
    assert_eq!(second.grade, Grade::NotRated);
    assert_eq!(second.not_rated_reason, Some(NotRatedReason::NoEligibleWeight));
}
