//! Batched payout records and the weekly settlement period

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Draft,
    PendingApproval,
    Approved,
    Processing,
    Completed,
    Failed,
    Disputed,
}

impl SettlementStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "disputed" => Ok(Self::Disputed),
            _ => Err(format!("Invalid settlement status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disputed => "disputed",
        }
    }
}

/// Kind of batched payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementType {
    AgentCommission,
}

impl SettlementType {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "agent_commission" => Ok(Self::AgentCommission),
            _ => Err(format!("Invalid settlement type: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentCommission => "agent_commission",
        }
    }
}

/// Half-open settlement window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SettlementPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, String> {
        if end <= start {
            return Err(format!("Period end {} must be after start {}", end, start));
        }
        Ok(Self { start, end })
    }

    /// Monday 00:00 UTC to the following Monday 00:00 of the week before `now`
    pub fn previous_week(now: DateTime<Utc>) -> Self {
        let this_monday = start_of_week(now);
        Self {
            start: this_monday - Duration::weeks(1),
            end: this_monday,
        }
    }

    /// The Monday-to-Monday week containing `at`
    pub fn week_containing(at: DateTime<Utc>) -> Self {
        let start = start_of_week(at);
        Self {
            start,
            end: start + Duration::weeks(1),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn start_of_week(at: DateTime<Utc>) -> DateTime<Utc> {
    let days_from_monday = at.weekday().num_days_from_monday() as i64;
    let monday = at.date_naive() - Duration::days(days_from_monday);
    Utc.from_utc_datetime(&monday.and_time(NaiveTime::MIN))
}

/// Idempotency key of a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementKey {
    pub beneficiary_id: Uuid,
    pub settlement_type: SettlementType,
    pub period: SettlementPeriod,
}

/// Itemized deduction taken from a settlement's gross amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDeduction {
    pub code: String,
    pub name: String,
    pub percentage: Decimal,
    pub amount: Decimal,
}

/// One batched payout per (beneficiary, period, type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub beneficiary_id: Uuid,
    pub settlement_type: SettlementType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub total_stake: Decimal,
    pub total_payout: Decimal,
    pub ggr: Decimal,
    pub commission_rate: Decimal,
    pub gross_amount: Decimal,
    pub deductions: Vec<SettlementDeduction>,
    pub net_amount: Decimal,
    pub status: SettlementStatus,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
    pub ledger_entry_ids: Vec<Uuid>,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Settlement {
    pub fn key(&self) -> SettlementKey {
        SettlementKey {
            beneficiary_id: self.beneficiary_id,
            settlement_type: self.settlement_type,
            period: SettlementPeriod {
                start: self.period_start,
                end: self.period_end,
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SettlementStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    #[test]
    fn test_previous_week_is_monday_to_monday() {
        // Wednesday 2026-10-14 15:30 UTC
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 15, 30, 0).unwrap();
        let period = SettlementPeriod::previous_week(now);

        assert_eq!(period.start, Utc.with_ymd_and_hms(2026, 10, 5, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());
        assert_eq!(period.start.weekday(), Weekday::Mon);
        assert!(!period.contains(now));
        assert!(period.contains(Utc.with_ymd_and_hms(2026, 10, 11, 23, 59, 59).unwrap()));
    }

    #[test]
    fn test_previous_week_on_monday_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        let period = SettlementPeriod::previous_week(now);
        assert_eq!(period.end, now);
    }

    #[test]
    fn test_period_rejects_inverted_bounds() {
        let now = Utc::now();
        assert!(SettlementPeriod::new(now, now).is_err());
    }
}
