//! Read models over finished rides: paginated trip history and driver
//! earnings per period.

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::ride;
use crate::services::fare::round_half_up;

pub const MAX_HISTORY_PAGE: u64 = 100;
pub const DEFAULT_HISTORY_PAGE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RideHistory {
    pub rides: Vec<ride::Model>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningsPeriod {
    #[default]
    Today,
    Week,
    Month,
    All,
}

impl EarningsPeriod {
    /// Lower bound on `completed_at`. Today starts at UTC midnight; week and
    /// month are rolling windows.
    pub fn start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            EarningsPeriod::Today => Some(now.date_naive().and_time(NaiveTime::MIN).and_utc()),
            EarningsPeriod::Week => Some(now - Duration::days(7)),
            EarningsPeriod::Month => now.checked_sub_months(Months::new(1)),
            EarningsPeriod::All => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsSummary {
    pub period: EarningsPeriod,
    pub total_earnings: f64,
    pub total_rides: u64,
    pub total_distance_km: f64,
    pub average_per_ride: f64,
}

impl EarningsSummary {
    pub fn from_rides(period: EarningsPeriod, rides: &[ride::Model]) -> Self {
        let total_earnings: f64 = rides.iter().filter_map(|r| r.driver_earnings).sum();
        let total_distance_km: f64 = rides.iter().filter_map(|r| r.distance_km).sum();
        let total_rides = rides.len() as u64;
        let average_per_ride = if total_rides == 0 {
            0.0
        } else {
            total_earnings / total_rides as f64
        };
        Self {
            period,
            total_earnings: round_half_up(total_earnings),
            total_rides,
            total_distance_km: round_half_up(total_distance_km),
            average_per_ride: round_half_up(average_per_ride),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_bounds() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 15, 45, 0).unwrap();
        assert_eq!(
            EarningsPeriod::Today.start(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap())
        );
        assert_eq!(
            EarningsPeriod::Week.start(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 24, 15, 45, 0).unwrap())
        );
        // Clamped to the end of a shorter month.
        assert_eq!(
            EarningsPeriod::Month.start(now),
            Some(Utc.with_ymd_and_hms(2026, 2, 28, 15, 45, 0).unwrap())
        );
        assert_eq!(EarningsPeriod::All.start(now), None);
    }

    #[test]
    fn test_empty_summary_has_zero_average() {
        let summary = EarningsSummary::from_rides(EarningsPeriod::All, &[]);
        assert_eq!(summary.total_rides, 0);
        assert_eq!(summary.average_per_ride, 0.0);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["period"], "all");
        assert_eq!(json["totalEarnings"], 0.0);
    }
}
