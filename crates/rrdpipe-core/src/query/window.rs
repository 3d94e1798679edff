//! Export windows.
//!
//! A query names its window either relatively (`unit` + `page`, paging
//! backwards from now) or absolutely (`start`/`end` epoch seconds). Both
//! resolve to a [`TimeWindow`] before the archive tool is invoked.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReportingError, Result};

/// Latest accepted sample timestamp, 9999-12-31T23:59:59Z.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// `count` units before `at`. Months and years follow the calendar.
    fn before(self, at: DateTime<Utc>, count: u32) -> Result<DateTime<Utc>> {
        let shifted = match self {
            TimeUnit::Hour => at.checked_sub_signed(Duration::hours(i64::from(count))),
            TimeUnit::Day => at.checked_sub_signed(Duration::days(i64::from(count))),
            TimeUnit::Week => at.checked_sub_signed(Duration::weeks(i64::from(count))),
            TimeUnit::Month => at.checked_sub_months(Months::new(count)),
            TimeUnit::Year => count
                .checked_mul(12)
                .and_then(|months| at.checked_sub_months(Months::new(months))),
        };
        shifted.ok_or_else(|| ReportingError::Validation(format!("page {} is out of range", count)))
    }
}

fn default_aggregate() -> bool {
    true
}

/// Window portion of a query request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct WindowQuery {
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default = "default_aggregate")]
    pub aggregate: bool,
}

impl Default for WindowQuery {
    fn default() -> Self {
        Self {
            unit: None,
            page: None,
            start: None,
            end: None,
            aggregate: true,
        }
    }
}

impl WindowQuery {
    pub fn relative(unit: TimeUnit, page: u32) -> Self {
        Self {
            unit: Some(unit),
            page: Some(page),
            ..Self::default()
        }
    }

    pub fn absolute(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Resolves against `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TimeWindow> {
        let bounded = self.start.is_some() || self.end.is_some();
        if bounded && (self.unit.is_some() || self.page.is_some()) {
            return Err(ReportingError::Validation(
                "\"start\"/\"end\" cannot be combined with \"unit\"/\"page\"".into(),
            ));
        }

        match (self.start, self.end) {
            (Some(start), end) => {
                let end = end.unwrap_or_else(|| now.timestamp());
                if start >= end {
                    return Err(ReportingError::Validation(format!(
                        "start {} must be before end {}",
                        start, end
                    )));
                }
                Ok(TimeWindow { start, end })
            }
            (None, Some(_)) => Err(ReportingError::Validation(
                "\"end\" requires \"start\"".into(),
            )),
            (None, None) => {
                let unit = self.unit.unwrap_or(TimeUnit::Hour);
                let end = unit.before(now, self.page.unwrap_or(0))?;
                let start = unit.before(end, 1)?;
                Ok(TimeWindow {
                    start: start.timestamp(),
                    end: end.timestamp(),
                })
            }
        }
    }
}

/// Absolute export window in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    /// Window covering freshly arrived samples, lagged by one step: the
    /// archive tool only returns data for fully elapsed steps.
    ///
    /// With no timestamps the window is built around `now`. Fails with
    /// `Validation` when the step is not positive or a timestamp lies
    /// outside `0..=MAX_TIMESTAMP`.
    pub fn lagged(timestamps: &[i64], step: i64, now: i64) -> Result<Self> {
        if step <= 0 {
            return Err(ReportingError::Validation(format!("step {} is not positive", step)));
        }
        let min = timestamps.iter().copied().min().unwrap_or(now);
        let max = timestamps.iter().copied().max().unwrap_or(now);
        let overflow = || {
            ReportingError::Validation(format!("timestamps {}..{} are out of range", min, max))
        };
        if min < 0 || max > MAX_TIMESTAMP {
            return Err(overflow());
        }

        let floor = min.div_euclid(step);
        let ceil = max
            .checked_neg()
            .map(|neg| neg.div_euclid(step))
            .and_then(i64::checked_neg)
            .ok_or_else(overflow)?;
        let mut start = floor
            .checked_sub(1)
            .and_then(|s| s.checked_mul(step))
            .ok_or_else(overflow)?;
        let end = ceil
            .checked_sub(1)
            .and_then(|e| e.checked_mul(step))
            .ok_or_else(overflow)?;
        if start == end {
            start = start.checked_sub(step).ok_or_else(overflow)?;
        }
        Ok(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_default_is_last_hour() {
        let window = WindowQuery::default().resolve(now()).unwrap();
        assert_eq!(window.end, now().timestamp());
        assert_eq!(window.end - window.start, 3600);
    }

    #[test]
    fn test_relative_paging() {
        let window = WindowQuery::relative(TimeUnit::Day, 2)
            .resolve(now())
            .unwrap();
        assert_eq!(window.end, now().timestamp() - 2 * 86400);
        assert_eq!(window.start, now().timestamp() - 3 * 86400);
    }

    #[test]
    fn test_month_uses_calendar() {
        let window = WindowQuery::relative(TimeUnit::Month, 1)
            .resolve(now())
            .unwrap();
        // Feb 29 2024 clamps the 31st.
        let end = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 29, 12, 0, 0).unwrap();
        assert_eq!(window.end, end.timestamp());
        assert_eq!(window.start, start.timestamp());
    }

    #[test]
    fn test_absolute_window() {
        let window = WindowQuery::absolute(990, 1010).resolve(now()).unwrap();
        assert_eq!(window, TimeWindow { start: 990, end: 1010 });
    }

    #[test]
    fn test_start_without_end_ends_now() {
        let query = WindowQuery {
            start: Some(1000),
            ..WindowQuery::default()
        };
        assert_eq!(query.resolve(now()).unwrap().end, now().timestamp());
    }

    #[test]
    fn test_both_forms_rejected() {
        let query = WindowQuery {
            unit: Some(TimeUnit::Hour),
            start: Some(1000),
            ..WindowQuery::default()
        };
        assert_eq!(query.resolve(now()).unwrap_err().kind(), "validation");

        let query = WindowQuery {
            page: Some(1),
            end: Some(1000),
            ..WindowQuery::default()
        };
        assert_eq!(query.resolve(now()).unwrap_err().kind(), "validation");
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = WindowQuery::absolute(2000, 1000)
            .resolve(now())
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_unit_deserializes_uppercase() {
        let query: WindowQuery = serde_json::from_str(r#"{"unit": "WEEK", "page": 1}"#).unwrap();
        assert_eq!(query.unit, Some(TimeUnit::Week));
        assert!(query.aggregate);
    }

    #[test]
    fn test_lagged_window() {
        let window = TimeWindow::lagged(&[1003, 1027], 10, 0).unwrap();
        assert_eq!(window, TimeWindow { start: 990, end: 1020 });
    }

    #[test]
    fn test_lagged_window_on_step_boundary_widens() {
        let window = TimeWindow::lagged(&[1000], 10, 0).unwrap();
        assert_eq!(window, TimeWindow { start: 980, end: 990 });
    }

    #[test]
    fn test_lagged_window_without_timestamps_uses_now() {
        let window = TimeWindow::lagged(&[], 10, 1005).unwrap();
        assert_eq!(window, TimeWindow { start: 990, end: 1000 });
    }

    #[test]
    fn test_lagged_window_rejects_extreme_timestamps() {
        for ts in [i64::MAX, i64::MIN, -1, MAX_TIMESTAMP + 1] {
            let err = TimeWindow::lagged(&[ts], 10, 0).unwrap_err();
            assert_eq!(err.kind(), "validation", "{ts}");
        }
        assert!(TimeWindow::lagged(&[1000], 0, 0).is_err());
        assert!(TimeWindow::lagged(&[MAX_TIMESTAMP], 10, 0).is_ok());
    }
}
