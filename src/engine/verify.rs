//! Property verification modes for the `verify` step.

use regex::Regex;

use crate::types::StepError;

/// How an actual property value is compared to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Case-insensitive exact match (the default).
    Equals,
    /// Case-insensitive substring match.
    Contains,
    NotEquals,
    Regex,
    StartsWith,
}

impl MatchMode {
    /// An unrecognized mode is a distinct error from a failed match.
    pub fn parse(mode: Option<&str>) -> Result<MatchMode, StepError> {
        let Some(mode) = mode else {
            return Ok(MatchMode::Equals);
        };
        match mode.trim().to_ascii_lowercase().as_str() {
            "" | "equals" => Ok(MatchMode::Equals),
            "contains" => Ok(MatchMode::Contains),
            "not_equals" => Ok(MatchMode::NotEquals),
            "regex" => Ok(MatchMode::Regex),
            "starts_with" => Ok(MatchMode::StartsWith),
            other => Err(StepError::UnknownMatchMode {
                mode: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Equals => "equals",
            MatchMode::Contains => "contains",
            MatchMode::NotEquals => "not_equals",
            MatchMode::Regex => "regex",
            MatchMode::StartsWith => "starts_with",
        }
    }
}

/// Evaluate one comparison. Only `Regex` can itself fail (bad pattern).
pub fn matches(mode: MatchMode, actual: &str, expected: &str) -> Result<bool, StepError> {
    let outcome = match mode {
        MatchMode::Equals => actual.eq_ignore_ascii_case(expected),
        MatchMode::NotEquals => !actual.eq_ignore_ascii_case(expected),
        MatchMode::Contains => actual
            .to_ascii_lowercase()
            .contains(&expected.to_ascii_lowercase()),
        MatchMode::StartsWith => actual
            .to_ascii_lowercase()
            .starts_with(&expected.to_ascii_lowercase()),
        MatchMode::Regex => {
            let re = Regex::new(expected)
                .map_err(|e| StepError::Backend(format!("invalid verify regex: {}", e)))?;
            re.is_match(actual)
        }
    };
    Ok(outcome)
}

/// The auto-generated failure message used when the step carries no
/// custom one.
pub fn describe_failure(mode: MatchMode, property: &str, actual: &str, expected: &str) -> String {
    format!(
        "property '{}' = '{}' did not satisfy {} '{}'",
        property,
        actual,
        mode.as_str(),
        expected
    )
}
