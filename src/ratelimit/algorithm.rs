//! Admission algorithm selection.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FloodgateError;

/// The five admission algorithms a request can be checked against.
///
/// Requests select an algorithm with the `algo` query parameter; unknown or
/// absent values fall back to the fixed window counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter that resets at fixed window boundaries.
    #[default]
    FixedWindow,
    /// Per-request timestamps in a sorted set, pruned on every attempt.
    SlidingWindowLog,
    /// Weighted estimate over the current and previous window slice.
    SlidingWindowCounter,
    /// Tokens refilled at a constant rate, one taken per admission.
    TokenBucket,
    /// FIFO queue drained at a constant rate by a background worker.
    LeakyBucket,
}

impl Algorithm {
    /// All algorithms, in the order the monitoring surface reports them.
    pub const ALL: [Algorithm; 5] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindowLog,
        Algorithm::SlidingWindowCounter,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Wire name, used in store keys and the HTTP API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding_window_log" => Ok(Algorithm::SlidingWindowLog),
            "sliding_window_counter" => Ok(Algorithm::SlidingWindowCounter),
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            other => Err(FloodgateError::Config(format!(
                "unknown rate limit algorithm: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_wire_names() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        assert!("gcra".parse::<Algorithm>().is_err());
        assert!("".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_default_is_fixed_window() {
        assert_eq!(Algorithm::default(), Algorithm::FixedWindow);
    }
}
