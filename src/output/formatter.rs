use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;

use owo_colors::OwoColorize;
use terminal_size::{terminal_size, Width};

use crate::composite::{CompositeScore, Grade};
use crate::indicator::ReferenceKey;
use crate::orchestrator::RunOutput;
use crate::stats::Reference;
use crate::table::Table;

/// Check if stdout is a TTY (for auto-detecting color support)
pub fn should_use_colors() -> bool {
    std::io::stdout().is_terminal()
}

/// Get terminal width, defaulting to None for pipes (unlimited)
fn get_terminal_width() -> Option<usize> {
    terminal_size().map(|(Width(w), _)| w as usize)
}

/// Truncate text to fit available width, accounting for Unicode
fn truncate_text(text: &str, max_width: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_width {
        text.to_string()
    } else if max_width > 3 {
        format!("{}...", chars[..max_width - 3].iter().collect::<String>())
    } else {
        chars[..max_width].iter().collect()
    }
}

/// Format an optional number with two decimals, "-" when null
pub fn format_number(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "-".to_string(),
    }
}

/// Elapsed wall time, e.g. "1s 250ms"
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = Duration::from_millis(elapsed.as_millis() as u64);
    humantime::format_duration(millis).to_string()
}

fn paint_grade(grade: &Grade, padded: &str) -> String {
    match grade {
        Grade::Letter(letter) => match letter.as_str() {
            "A" => padded.green().bold().to_string(),
            "B" => padded.cyan().to_string(),
            "C" => padded.yellow().to_string(),
            _ => padded.red().to_string(),
        },
        Grade::Preliminary => padded.blue().to_string(),
        Grade::NotRated => padded.dimmed().to_string(),
    }
}

/// Format composites as an aligned table:
/// school, model, earned/eligible, percentage, bonus, total, grade, identified, reason.
/// The reason column is truncated to the terminal width.
pub fn format_composite_table(scores: &[CompositeScore], use_colors: bool) -> String {
    if scores.is_empty() {
        return "No schools scored.".to_string();
    }

    let school_width = scores
        .iter()
        .map(|s| s.school_id.chars().count())
        .max()
        .unwrap_or(0)
        .max("school".len());
    let model_width = scores
        .iter()
        .map(|s| s.model.chars().count())
        .max()
        .unwrap_or(0)
        .max("model".len());
    let separator = "  ";

    let header = format!(
        "{:<sw$}{sep}{:<mw$}{sep}{:>15}{sep}{:>7}{sep}{:>6}{sep}{:>7}{sep}{:<5}{sep}{:<3}{sep}reason",
        "school",
        "model",
        "earned/eligible",
        "pct",
        "bonus",
        "total",
        "grade",
        "csi",
        sw = school_width,
        mw = model_width,
        sep = separator,
    );
    let fixed_width = header.chars().count() - "reason".len();
    let reason_width = get_terminal_width().map(|w| w.saturating_sub(fixed_width).max(10));

    let mut lines = Vec::with_capacity(scores.len() + 1);
    lines.push(if use_colors {
        header.bold().to_string()
    } else {
        header
    });

    for score in scores {
        let ratio = format!("{:.2}/{:.2}", score.points_earned, score.points_eligible);
        let grade_padded = format!("{:<5}", score.grade.label());
        let grade = if use_colors {
            paint_grade(&score.grade, &grade_padded)
        } else {
            grade_padded
        };
        let identified = match score.identified {
            Some(true) => "Yes",
            Some(false) => "No",
            None => "-",
        };
        let reason = score
            .not_rated_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        let reason = match reason_width {
            Some(width) => truncate_text(&reason, width),
            None => reason,
        };

        lines.push(format!(
            "{:<sw$}{sep}{:<mw$}{sep}{:>15}{sep}{:>7}{sep}{:>6.2}{sep}{:>7}{sep}{}{sep}{:<3}{sep}{}",
            score.school_id,
            score.model,
            ratio,
            format_number(score.percentage),
            score.bonus,
            format_number(score.total),
            grade,
            identified,
            reason,
            sw = school_width,
            mw = model_width,
            sep = separator,
        ));
    }

    lines.join("\n").trim_end().to_string()
}

/// Format any table as tab-separated values with a header row (no colors)
pub fn format_tsv(table: &Table) -> String {
    let mut lines = Vec::with_capacity(table.rows.len() + 1);
    lines.push(table.columns.join("\t"));
    for row in &table.rows {
        lines.push(
            row.iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("\t"),
        );
    }
    lines.join("\n")
}

/// Format a table as a pretty JSON array of row objects
pub fn format_json(table: &Table) -> String {
    serde_json::to_string_pretty(&table.to_json()).unwrap_or_else(|_| "[]".to_string())
}

/// One line per model (and sub-dimension) describing its reference distribution
pub fn format_references(references: &BTreeMap<ReferenceKey, Reference>, use_colors: bool) -> String {
    if references.is_empty() {
        return "No reference distributions.".to_string();
    }

    references
        .iter()
        .map(|((model, value), reference)| {
            let label = match value {
                Some(v) => format!("{} ({})", model, v),
                None => model.clone(),
            };
            let label = if use_colors {
                label.bold().to_string()
            } else {
                label
            };
            match reference {
                Reference::Comparable {
                    mean,
                    std,
                    sample_size,
                    trimmed,
                } => format!(
                    "{}: mean {:.4}  std {:.4}  n {}  trimmed {}",
                    label, mean, std, sample_size, trimmed
                ),
                Reference::Degenerate { sample_size } => {
                    let note = format!("degenerate (n {})", sample_size);
                    if use_colors {
                        format!("{}: {}", label, note.yellow())
                    } else {
                        format!("{}: {}", label, note)
                    }
                }
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short run summary: one line per indicator, then warnings
pub fn format_run_summary(output: &RunOutput, elapsed: Duration, use_colors: bool) -> String {
    let mut lines: Vec<String> = output
        .summaries
        .iter()
        .map(|s| {
            let status = match s.status {
                crate::store::IndicatorStatus::Scored => "scored",
                crate::store::IndicatorStatus::SubstitutedNull => "substituted null",
            };
            format!(
                "{:<20} {:>6} rows  {:>6} suppressed  {}",
                s.name, s.rows, s.suppressed, status
            )
        })
        .collect();

    let rated = output.composites.iter().filter(|c| c.grade.is_rated()).count();
    lines.push(format!(
        "{} composites ({} rated), {} districts, fiscal year {} in {}",
        output.composites.len(),
        rated,
        output.districts.len(),
        output.fiscal_year,
        format_elapsed(elapsed)
    ));
    if let Some(threshold) = output.identification_threshold {
        lines.push(format!("identification threshold {:.2}", threshold));
    }
    for warning in &output.warnings {
        let line = format!("warning: {}", warning);
        lines.push(if use_colors {
            line.yellow().to_string()
        } else {
            line
        });
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::NotRatedReason;
    use crate::table::Cell;

    fn score(school: &str, total: Option<f64>, grade: Grade) -> CompositeScore {
        CompositeScore {
            school_id: school.to_string(),
            model: "k-8".to_string(),
            points_earned: 60.0,
            points_eligible: 70.0,
            percentage: total,
            bonus: 0.0,
            total,
            grade,
            not_rated_reason: None,
            identified: None,
            history: BTreeMap::new(),
        }
    }

    #[test]
    fn test_format_composite_table_empty() {
        assert_eq!(format_composite_table(&[], false), "No schools scored.");
    }

    #[test]
    fn test_format_composite_table_rows() {
        let mut nr = score("200", None, Grade::NotRated);
        nr.not_rated_reason = Some(NotRatedReason::NoEligibleWeight);
        nr.identified = Some(false);
        let scores = vec![score("100", Some(85.71), Grade::Letter("A".to_string())), nr];

        let result = format_composite_table(&scores, false);
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("school"));
        assert!(lines[1].contains("60.00/70.00"));
        assert!(lines[1].contains("85.71"));
        assert!(lines[1].contains(" A "));
        assert!(lines[2].contains("NR"));
        assert!(lines[2].contains("No"));
        assert!(lines[2].contains("no elig"));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("Short", 20), "Short");
        assert_eq!(truncate_text("ineligible: first year", 10), "ineligi...");
        assert_eq!(truncate_text("Hello world", 3), "Hel");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(Some(85.714)), "85.71");
        assert_eq!(format_number(None), "-");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(1250)), "1s 250ms");
        assert_eq!(format_elapsed(Duration::from_micros(1500)), "1ms");
    }

    fn table() -> Table {
        let mut table = Table::new(vec!["school_id".to_string(), "points".to_string()]);
        table.push(vec![Cell::text("100"), Cell::Number(8.0)]);
        table.push(vec![Cell::text("101"), Cell::Null]);
        table
    }

    #[test]
    fn test_format_tsv() {
        assert_eq!(format_tsv(&table()), "school_id\tpoints\n100\t8\n101\t");
    }

    #[test]
    fn test_format_json() {
        let json: serde_json::Value = serde_json::from_str(&format_json(&table())).unwrap();
        assert_eq!(json[0]["points"], 8.0);
        assert!(json[1]["points"].is_null());
    }

    #[test]
    fn test_format_references() {
        let mut references = BTreeMap::new();
        references.insert(
            ("k-8".to_string(), None),
            Reference::Comparable {
                mean: 11.5,
                std: 1.0488,
                sample_size: 6,
                trimmed: 1,
            },
        );
        references.insert(
            ("9-12".to_string(), Some("Math".to_string())),
            Reference::Degenerate { sample_size: 1 },
        );
        let result = format_references(&references, false);
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines[0], "9-12 (Math): degenerate (n 1)");
        assert_eq!(lines[1], "k-8: mean 11.5000  std 1.0488  n 6  trimmed 1");
        assert_eq!(format_references(&BTreeMap::new(), false), "No reference distributions.");
    }
}
