//! Query windows for Cost Explorer.
//!
//! Billing data for the current day is incomplete, so every window ends
//! `delay_days` before today's UTC midnight. Windows are half-open
//! (`start` inclusive, `end` exclusive), matching the Cost Explorer API.

use chrono::{Datelike, Days, NaiveDate, Utc};

use crate::models::Granularity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

fn shift_back(day: NaiveDate, days: u32) -> NaiveDate {
    day.checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

pub fn daily_period(delay_days: u32) -> Period {
    daily_period_from(today_utc(), delay_days)
}

pub fn monthly_period(delay_days: u32) -> Period {
    monthly_period_from(today_utc(), delay_days)
}

pub fn period_for(granularity: Granularity, delay_days: u32) -> Period {
    match granularity {
        Granularity::Daily => daily_period(delay_days),
        Granularity::Monthly => monthly_period(delay_days),
    }
}

/// One-day window ending `delay_days` before `today`.
pub fn daily_period_from(today: NaiveDate, delay_days: u32) -> Period {
    let end = shift_back(today, delay_days);
    Period {
        start: shift_back(end, 1),
        end,
    }
}

/// Month-to-date window of the month containing `today - delay_days`.
pub fn monthly_period_from(today: NaiveDate, delay_days: u32) -> Period {
    let end = shift_back(today, delay_days);
    Period {
        start: end.with_day(1).unwrap_or(end),
        end,
    }
}
