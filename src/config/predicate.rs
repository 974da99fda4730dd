use anyhow::{bail, Result};

/// Outcome range expression used by eligibility filters and positive-rate measures.
///
/// Formats: "<N", "<=N", ">N", ">=N", "N-M" (inclusive), or "N" (exact).
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeRange {
    LessThan(f64),
    LessEqual(f64),
    GreaterThan(f64),
    GreaterEqual(f64),
    Equal(f64),
    Between(f64, f64),
}

impl OutcomeRange {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty range expression");
        }
        if let Some(val) = s.strip_prefix(">=") {
            Ok(OutcomeRange::GreaterEqual(val.trim().parse()?))
        } else if let Some(val) = s.strip_prefix("<=") {
            Ok(OutcomeRange::LessEqual(val.trim().parse()?))
        } else if let Some(val) = s.strip_prefix('>') {
            Ok(OutcomeRange::GreaterThan(val.trim().parse()?))
        } else if let Some(val) = s.strip_prefix('<') {
            Ok(OutcomeRange::LessThan(val.trim().parse()?))
        } else if let Some(idx) = s
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(i, _)| i)
        {
            // "N-M"; a leading minus belongs to N
            let low: f64 = s[..idx].trim().parse()?;
            let high: f64 = s[idx + 1..].trim().parse()?;
            if low > high {
                bail!("range lower bound exceeds upper bound: {}", s)
            }
            Ok(OutcomeRange::Between(low, high))
        } else {
            Ok(OutcomeRange::Equal(s.parse()?))
        }
    }

    pub fn matches(&self, value: f64) -> bool {
        match self {
            OutcomeRange::LessThan(n) => value < *n,
            OutcomeRange::LessEqual(n) => value <= *n,
            OutcomeRange::GreaterThan(n) => value > *n,
            OutcomeRange::GreaterEqual(n) => value >= *n,
            OutcomeRange::Equal(n) => value == *n,
            OutcomeRange::Between(low, high) => value >= *low && value <= *high,
        }
    }
}

/// Parse a list of range expressions, failing on the first bad one.
pub fn parse_ranges(exprs: &[String]) -> Result<Vec<OutcomeRange>> {
    exprs.iter().map(|e| OutcomeRange::parse(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_comparisons() {
        assert_eq!(OutcomeRange::parse(">=3").unwrap(), OutcomeRange::GreaterEqual(3.0));
        assert_eq!(OutcomeRange::parse("<= 2.5").unwrap(), OutcomeRange::LessEqual(2.5));
        assert_eq!(OutcomeRange::parse(">0").unwrap(), OutcomeRange::GreaterThan(0.0));
        assert_eq!(OutcomeRange::parse("<1").unwrap(), OutcomeRange::LessThan(1.0));
        assert_eq!(OutcomeRange::parse("1").unwrap(), OutcomeRange::Equal(1.0));
    }

    #[test]
    fn test_parse_between() {
        assert_eq!(OutcomeRange::parse("3-4").unwrap(), OutcomeRange::Between(3.0, 4.0));
        assert_eq!(OutcomeRange::parse("-2-2").unwrap(), OutcomeRange::Between(-2.0, 2.0));
        assert!(OutcomeRange::parse("4-3").is_err());
    }

    #[test]
    fn test_parse_negative_exact() {
        assert_eq!(OutcomeRange::parse("-1").unwrap(), OutcomeRange::Equal(-1.0));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(OutcomeRange::parse("").is_err());
        assert!(OutcomeRange::parse("abc").is_err());
        assert!(OutcomeRange::parse(">=x").is_err());
    }

    #[test]
    fn test_matches() {
        assert!(OutcomeRange::GreaterEqual(3.0).matches(3.0));
        assert!(!OutcomeRange::GreaterThan(3.0).matches(3.0));
        assert!(OutcomeRange::Between(3.0, 4.0).matches(4.0));
        assert!(!OutcomeRange::Between(3.0, 4.0).matches(4.5));
        assert!(OutcomeRange::Equal(1.0).matches(1.0));
        assert!(OutcomeRange::LessThan(1.0).matches(0.0));
    }
}
