//! Severity classification shared by every auditor
//!
//! ```text
//! ratio = context > 0 ? difference / context : difference
//! critical  ratio > 0.10  or  difference > critical_abs
//! high      ratio > 0.05  or  difference > high_abs
//! medium    ratio > 0.01  or  difference > medium_abs
//! low       otherwise
//! ```

use ledgerwatch_core::Severity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cut-offs for one auditor scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub critical_abs: Decimal,
    pub high_abs: Decimal,
    pub medium_abs: Decimal,
    pub critical_ratio: Decimal,
    pub high_ratio: Decimal,
    pub medium_ratio: Decimal,
}

impl SeverityThresholds {
    /// Single-wallet checks
    pub fn realtime() -> Self {
        Self::with_absolute(Decimal::new(1_000, 0), Decimal::new(100, 0), Decimal::new(10, 0))
    }

    /// System-wide sums, naturally larger
    pub fn global() -> Self {
        Self::with_absolute(
            Decimal::new(100_000, 0),
            Decimal::new(10_000, 0),
            Decimal::new(1_000, 0),
        )
    }

    fn with_absolute(critical: Decimal, high: Decimal, medium: Decimal) -> Self {
        Self {
            critical_abs: critical,
            high_abs: high,
            medium_abs: medium,
            critical_ratio: Decimal::new(10, 2),
            high_ratio: Decimal::new(5, 2),
            medium_ratio: Decimal::new(1, 2),
        }
    }
}

/// Grade a difference against the magnitude it was measured on
///
/// Both inputs are taken by absolute value. A zero context falls back to
/// using the raw difference as the ratio.
pub fn classify(difference: Decimal, context: Decimal, thresholds: &SeverityThresholds) -> Severity {
    let difference = difference.abs();
    let context = context.abs();
    let ratio = if context > Decimal::ZERO {
        difference / context
    } else {
        difference
    };

    if ratio > thresholds.critical_ratio || difference > thresholds.critical_abs {
        Severity::Critical
    } else if ratio > thresholds.high_ratio || difference > thresholds.high_abs {
        Severity::High
    } else if ratio > thresholds.medium_ratio || difference > thresholds.medium_abs {
        Severity::Medium
    } else {
        Severity::Low
    }
}
