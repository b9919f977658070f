//! Occupant records, categories and fee computation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Vehicle category; selects which hourly rate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Small vehicle.
    #[serde(alias = "小型")]
    Small,
    /// Large vehicle.
    #[serde(alias = "大型")]
    Large,
}

impl Category {
    /// Canonical label, also used in snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "小型" => return Ok(Self::Small),
            "大型" => return Ok(Self::Large),
            _ => {}
        }
        if trimmed.eq_ignore_ascii_case("small") {
            Ok(Self::Small)
        } else if trimmed.eq_ignore_ascii_case("large") {
            Ok(Self::Large)
        } else {
            Err(format!("unknown category `{trimmed}`"))
        }
    }
}

/// Hourly rate per category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    /// Rate for [`Category::Small`].
    pub small: f64,
    /// Rate for [`Category::Large`].
    pub large: f64,
}

impl RateTable {
    /// Build a rate table, rejecting non-finite or non-positive values.
    #[must_use]
    pub fn new(small: f64, large: f64) -> Option<Self> {
        let valid = |r: f64| r.is_finite() && r > 0.0;
        (valid(small) && valid(large)).then_some(Self { small, large })
    }

    /// Rate that applies to `category`.
    #[must_use]
    pub const fn rate_for(&self, category: Category) -> f64 {
        match category {
            Category::Small => self.small,
            Category::Large => self.large,
        }
    }
}

/// One occupant's lifecycle: admission, optional release and the fee.
///
/// `released_at == None` means the occupant is still present. Once released
/// the record is history and never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupantRecord {
    /// Unique identifier (licence plate).
    pub key: String,
    /// Category that selects the rate.
    pub category: Category,
    /// Admission time, unix seconds.
    pub admitted_at: i64,
    /// Release time, unix seconds.
    pub released_at: Option<i64>,
    /// Fee, meaningful only after release.
    pub fee: f64,
}

impl OccupantRecord {
    /// A freshly admitted occupant.
    #[must_use]
    pub const fn admitted(key: String, category: Category, now: i64) -> Self {
        Self {
            key,
            category,
            admitted_at: now,
            released_at: None,
            fee: 0.0,
        }
    }

    /// Still occupying a slot.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.released_at.is_none()
    }

    /// Close the record at `now` and charge `rate` per hour.
    pub(crate) fn finalize(&mut self, now: i64, rate: f64) {
        self.released_at = Some(now);
        self.fee = compute_fee(elapsed_hours(self.admitted_at, now), rate);
    }
}

/// Fractional hours between two unix-second timestamps, never negative.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn elapsed_hours(from: i64, to: i64) -> f64 {
    (to - from).max(0) as f64 / 3600.0
}

/// `round(hours * rate, 2)`.
#[must_use]
pub fn compute_fee(hours: f64, rate: f64) -> f64 {
    (hours * rate * 100.0).round() / 100.0
}
