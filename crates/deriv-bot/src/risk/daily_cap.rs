//! Daily profit-cap accounting.
//!
//! One `DailyStat` row per UTC date. Once accumulated profit reaches the
//! cap the latch sets idempotently and no new trades open until the next
//! UTC day.

use chrono::{DateTime, Utc};
use deriv_common::DailyStat;
use rust_decimal::Decimal;
use tracing::info;

/// In-memory authoritative daily ledger. The persistence sink mirrors it
/// with `$inc` upserts.
#[derive(Debug)]
pub struct DailyLedger {
    cap: Decimal,
    today: DailyStat,
}

impl DailyLedger {
    pub fn new(cap: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            cap,
            today: DailyStat::new(now.date_naive()),
        }
    }

    /// Roll to a new row when the UTC date changed.
    fn roll(&mut self, now: DateTime<Utc>) {
        let date = now.date_naive();
        if date != self.today.date_utc {
            info!(%date, "Daily ledger rolled over");
            self.today = DailyStat::new(date);
        }
    }

    /// Apply one trade exit and re-evaluate the cap latch. Returns the
    /// updated row.
    pub fn record_exit(&mut self, now: DateTime<Utc>, profit: Decimal) -> DailyStat {
        self.roll(now);
        self.today.apply_exit(profit);
        if !self.today.is_cap_reached && self.today.accumulated_profit >= self.cap {
            self.today.is_cap_reached = true;
            info!(
                profit = %self.today.accumulated_profit,
                cap = %self.cap,
                "Daily profit cap reached, trading stops until the next UTC day"
            );
        }
        self.today
    }

    /// True when today's cap latch is set.
    pub fn cap_reached(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        if !self.today.is_cap_reached && self.today.accumulated_profit >= self.cap {
            self.today.is_cap_reached = true;
        }
        self.today.is_cap_reached
    }

    pub fn today(&self) -> DailyStat {
        self.today
    }

    /// Restore a previously persisted row (crash-restart within the same
    /// UTC day).
    pub fn restore(&mut self, stat: DailyStat) {
        if stat.date_utc == self.today.date_utc {
            self.today = stat;
        }
    }
}
