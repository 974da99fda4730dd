use std::collections::BTreeMap;

use super::{ScoredGroup, SuppressionReason};
use crate::aggregate::{GroupKey, GroupStats};
use crate::config::{Rollup, SubDimensionConfig};

/// Sub-dimension shares scaled to sum to 1. Non-positive shares are dropped.
pub fn normalized_shares(sub: Option<&SubDimensionConfig>) -> BTreeMap<String, f64> {
    let Some(sub) = sub else {
        return BTreeMap::new();
    };
    let total: f64 = sub.shares.values().filter(|s| **s > 0.0).sum();
    if total <= 0.0 {
        return BTreeMap::new();
    }
    sub.shares
        .iter()
        .filter(|(_, s)| **s > 0.0)
        .map(|(k, s)| (k.clone(), s / total))
        .collect()
}

/// Add one total row per school, model and subgroup on top of the
/// per-value rows.
///
/// Counts are summed and the rate is the share-weighted mean of the part
/// rates. Points follow the configured roll-up; a null part is never read
/// as zero.
pub fn roll_up(
    rows: Vec<ScoredGroup>,
    sub: &SubDimensionConfig,
    shares: &BTreeMap<String, f64>,
    suppress_rate: bool,
) -> Vec<ScoredGroup> {
    let mut parents: BTreeMap<GroupKey, Vec<&ScoredGroup>> = BTreeMap::new();
    for row in &rows {
        let parent = row.key.clone().with_sub_dimension(None);
        parents.entry(parent).or_default().push(row);
    }

    let mut totals = Vec::with_capacity(parents.len());
    for (key, parts) in parents {
        let mut total = ScoredGroup::new(key, combine_stats(&parts, shares));
        if suppress_rate && parts.iter().any(|p| p.rate.is_none()) {
            total.rate = None;
        }

        let complete = shares.keys().all(|value| {
            parts
                .iter()
                .any(|p| p.key.sub_dimension.as_deref() == Some(value.as_str()) && p.points.is_some())
        });
        let points = if sub.require_all && !complete {
            None
        } else {
            match sub.rollup {
                Rollup::Sum => sum_points(parts.iter().copied()),
                Rollup::Max => parts
                    .iter()
                    .filter_map(|p| {
                        let share = shares.get(p.key.sub_dimension.as_deref()?)?;
                        Some(p.points? / share)
                    })
                    .reduce(f64::max),
            }
        };

        match points {
            Some(points) => total.points = Some(points),
            None => total.suppress(SuppressionReason::IncompleteRollup),
        }
        totals.push(total);
    }

    let mut rows = rows;
    rows.extend(totals);
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    rows
}

/// Sum of the non-null points; None when every row is null.
pub fn sum_points<'a>(rows: impl IntoIterator<Item = &'a ScoredGroup>) -> Option<f64> {
    rows.into_iter()
        .filter_map(|r| r.points)
        .fold(None, |acc, p| Some(acc.unwrap_or(0.0) + p))
}

fn combine_stats(parts: &[&ScoredGroup], shares: &BTreeMap<String, f64>) -> GroupStats {
    let eligible = parts.iter().map(|p| p.stats.eligible).sum();
    let positive = parts.iter().map(|p| p.stats.positive).sum();

    let (weighted, weight) = parts
        .iter()
        .filter_map(|p| {
            let share = *shares.get(p.key.sub_dimension.as_deref()?)?;
            Some((p.stats.rate? * share, share))
        })
        .fold((0.0, 0.0), |(s, w), (rs, sh)| (s + rs, w + sh));

    GroupStats {
        eligible,
        positive,
        rate: (weight > 0.0).then(|| weighted / weight),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimension;

    fn sub(shares: &[(&str, f64)], rollup: Rollup, require_all: bool) -> SubDimensionConfig {
        SubDimensionConfig {
            dimension: Dimension::Subject,
            shares: shares.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            rollup,
            require_all,
        }
    }

    fn part(value: &str, eligible: u64, rate: f64, points: Option<f64>) -> ScoredGroup {
        let key = GroupKey::school("100", "k-8").with_sub_dimension(Some(value));
        let mut row = ScoredGroup::new(
            key,
            GroupStats {
                eligible,
                positive: 0,
                rate: Some(rate),
            },
        );
        row.points = points;
        row
    }

    fn total(rows: &[ScoredGroup]) -> &ScoredGroup {
        rows.iter()
            .find(|r| r.key == GroupKey::school("100", "k-8"))
            .unwrap()
    }

    #[test]
    fn test_normalized_shares() {
        let config = sub(&[("Math", 1.0), ("ELA", 1.0), ("Sci", 0.0)], Rollup::Sum, false);
        let shares = normalized_shares(Some(&config));
        assert_eq!(shares.len(), 2);
        assert_eq!(shares["Math"], 0.5);
        assert!(normalized_shares(None).is_empty());
    }

    #[test]
    fn test_sum_rollup_skips_null_parts() {
        let config = sub(&[("Math", 1.0), ("ELA", 1.0)], Rollup::Sum, false);
        let shares = normalized_shares(Some(&config));
        let rows = vec![part("Math", 30, 80.0, Some(20.0)), part("ELA", 10, 40.0, None)];
        let rows = roll_up(rows, &config, &shares, false);
        assert_eq!(rows.len(), 3);
        let t = total(&rows);
        assert_eq!(t.points, Some(20.0));
        assert_eq!(t.stats.eligible, 40);
        assert_eq!(t.stats.rate, Some(60.0));
    }

    #[test]
    fn test_require_all_nulls_incomplete_total() {
        let config = sub(&[("4", 5.0), ("5", 4.0)], Rollup::Sum, true);
        let shares = normalized_shares(Some(&config));
        let rows = roll_up(vec![part("4", 30, 90.0, Some(9.0))], &config, &shares, false);
        let t = total(&rows);
        assert_eq!(t.points, None);
        assert_eq!(t.reason, Some(SuppressionReason::IncompleteRollup));
    }

    #[test]
    fn test_all_null_parts_give_null_total() {
        let config = sub(&[("Math", 1.0)], Rollup::Sum, false);
        let shares = normalized_shares(Some(&config));
        let rows = roll_up(vec![part("Math", 3, 50.0, None)], &config, &shares, false);
        assert_eq!(total(&rows).points, None);
    }

    #[test]
    fn test_max_rollup_rescales_share() {
        let config = sub(&[("Math", 1.0), ("ELA", 3.0)], Rollup::Max, false);
        let shares = normalized_shares(Some(&config));
        // Math 2 at a quarter share (8), ELA 7 at three quarters (9.33)
        let rows = vec![part("Math", 30, 80.0, Some(2.0)), part("ELA", 30, 80.0, Some(7.0))];
        let rows = roll_up(rows, &config, &shares, false);
        let points = total(&rows).points.unwrap();
        assert!((points - 28.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sum_points_skips_nulls() {
        let a = part("Math", 30, 80.0, Some(2.0));
        let b = part("ELA", 30, 80.0, None);
        assert_eq!(sum_points([&a, &b]), Some(2.0));
        assert_eq!(sum_points([&b]), None);
    }
}
