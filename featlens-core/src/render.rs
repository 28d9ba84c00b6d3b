//! Natural-language rendering of ranked factors.

use crate::ranking::RankedFactor;
use std::fmt::{self, Write};

pub const NO_FACTORS: &str = "No significant factors identified.";
pub const FALLBACK: &str = "Unable to generate explanation text.";

/// Factors enumerated in the text.
pub const MAX_RENDERED: usize = 5;

/// Magnitude qualifier: > 0.10 significantly, > 0.05 moderately, otherwise
/// slightly.
pub fn strength_label(magnitude: f64) -> &'static str {
    if magnitude > 0.10 {
        "significantly"
    } else if magnitude > 0.05 {
        "moderately"
    } else {
        "slightly"
    }
}

/// Describe the top factors. Never fails: malformed input yields
/// [`FALLBACK`].
pub fn render(factors: &[RankedFactor]) -> String {
    if factors.is_empty() {
        return NO_FACTORS.to_string();
    }
    match try_render(factors) {
        Ok(text) => text,
        Err(_) => {
            tracing::warn!(factors = factors.len(), "Failed to render explanation text");
            FALLBACK.to_string()
        }
    }
}

fn try_render(factors: &[RankedFactor]) -> Result<String, fmt::Error> {
    let mut out = String::from("The prediction is primarily influenced by:\n");
    for (i, factor) in factors.iter().take(MAX_RENDERED).enumerate() {
        if !factor.magnitude.is_finite() {
            return Err(fmt::Error);
        }
        write!(
            out,
            "\n{}. {} {} prediction {} (impact: {:.3})",
            i + 1,
            factor.feature,
            factor.direction.as_str(),
            strength_label(factor.magnitude),
            factor.magnitude
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_input() {
        assert_eq!(render(&[]), NO_FACTORS);
    }

    #[test]
    fn test_template_and_thresholds() {
        let factors = vec![
            RankedFactor::new("rsi_14", 0.25),
            RankedFactor::new("news_sentiment", -0.07),
            RankedFactor::new("volume", 0.05),
        ];
        assert_eq!(
            render(&factors),
            "The prediction is primarily influenced by:\n\
             \n1. rsi_14 increases prediction significantly (impact: 0.250)\
             \n2. news_sentiment decreases prediction moderately (impact: 0.070)\
             \n3. volume increases prediction slightly (impact: 0.050)"
        );
    }

    #[test]
    fn test_only_top_five_rendered() {
        let factors: Vec<RankedFactor> = (0..8)
            .map(|i| RankedFactor::new(format!("f{i}"), 1.0 - i as f64 * 0.1))
            .collect();
        let text = render(&factors);
        assert!(text.contains("5. f4"));
        assert!(!text.contains("f5"));
    }

    #[test]
    fn test_non_finite_falls_back() {
        let factors = vec![RankedFactor::new("bad", f64::NAN)];
        assert_eq!(render(&factors), FALLBACK);
    }
}
