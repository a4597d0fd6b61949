//! Risk guardian: every guard consulted before and during trading.
//!
//! Guards compose with AND: an entry is permitted only when the session
//! gate, the daily cap, the train pause and the drawdown killswitch all
//! permit. Each refusal carries its reason so the engine can log why a
//! signal was dropped.

pub mod daily_cap;
pub mod killswitch;
pub mod session;
pub mod sizing;
pub mod train;

use std::time::Duration;

use chrono::{DateTime, Utc};
use deriv_common::DailyStat;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use daily_cap::DailyLedger;
use killswitch::DrawdownKillSwitch;
use session::SessionGate;
use train::TrainDetector;

pub use sizing::{stake_amount, MIN_STAKE};

/// Why an entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RiskRefusal {
    #[error("Outside the trading session")]
    SessionClosed,

    #[error("Daily profit cap reached")]
    CapReached,

    #[error("Paused after a momentum train")]
    TrainPause,

    #[error("Drawdown killswitch tripped")]
    KillSwitch,
}

/// Tunables for the guardian.
#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub daily_cap: Decimal,
    pub train_delta: Decimal,
    pub train_pause: Duration,
    pub killswitch_threshold: Decimal,
    pub killswitch_duration: Duration,
    pub session_start_utc_hour: u32,
    pub session_end_utc_hour: u32,
    pub risk_fraction: Decimal,
}

/// Composes the session gate, daily cap, train detector and drawdown
/// killswitch. Owned by the engine; mutated only on its event loop.
#[derive(Debug)]
pub struct RiskGuardian {
    session: SessionGate,
    daily: DailyLedger,
    train: TrainDetector,
    killswitch: DrawdownKillSwitch,
    paused_until: Option<Instant>,
    train_pause: Duration,
    risk_fraction: Decimal,
}

impl RiskGuardian {
    pub fn new(settings: &RiskSettings, now_utc: DateTime<Utc>) -> Self {
        Self {
            session: SessionGate::new(
                settings.session_start_utc_hour,
                settings.session_end_utc_hour,
            ),
            daily: DailyLedger::new(settings.daily_cap, now_utc),
            train: TrainDetector::new(settings.train_delta),
            killswitch: DrawdownKillSwitch::new(
                settings.killswitch_threshold,
                settings.killswitch_duration,
            ),
            paused_until: None,
            train_pause: settings.train_pause,
            risk_fraction: settings.risk_fraction,
        }
    }

    /// AND-composition of every guard. `Ok(())` means trading is
    /// permitted right now.
    pub fn permits_entry(
        &mut self,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Result<(), RiskRefusal> {
        if !self.session.permits(now_utc) {
            return Err(RiskRefusal::SessionClosed);
        }
        if self.is_paused(now) {
            return Err(RiskRefusal::TrainPause);
        }
        if self.daily.cap_reached(now_utc) {
            return Err(RiskRefusal::CapReached);
        }
        if self.killswitch.is_tripped(now) {
            return Err(RiskRefusal::KillSwitch);
        }
        Ok(())
    }

    /// Feed the train detector with one tick price. On a trigger the
    /// emergency brake engages: the caller must close every open trade and
    /// the guardian pauses entries for the configured window.
    pub fn observe_tick(&mut self, price: Decimal, now: Instant) -> bool {
        if self.train.observe(price) {
            self.paused_until = Some(now + self.train_pause);
            warn!(
                pause_secs = self.train_pause.as_secs(),
                "Momentum train detected, emergency brake engaged"
            );
            true
        } else {
            false
        }
    }

    /// Feed one balance update into the drawdown killswitch. Returns the
    /// drawdown fraction when this update tripped it.
    pub fn observe_balance(&mut self, balance: Decimal, now: Instant) -> Option<Decimal> {
        self.killswitch.observe_balance(balance, now)
    }

    /// Apply one realized trade exit to the daily ledger.
    pub fn record_trade_exit(&mut self, now_utc: DateTime<Utc>, profit: Decimal) -> DailyStat {
        self.daily.record_exit(now_utc, profit)
    }

    /// Daily-cap check. During a train pause this reports "cap reached"
    /// so every entry path stays closed.
    pub fn cap_reached(&mut self, now_utc: DateTime<Utc>, now: Instant) -> bool {
        if self.is_paused(now) {
            return true;
        }
        self.daily.cap_reached(now_utc)
    }

    /// Stake for a contract given the current balance and stop distance.
    pub fn stake(
        &self,
        balance: Decimal,
        multiplier: Decimal,
        sl_distance_points: Decimal,
    ) -> Decimal {
        stake_amount(balance, self.risk_fraction, multiplier, sl_distance_points)
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if now < until)
    }

    pub fn today(&self) -> DailyStat {
        self.daily.today()
    }

    /// Restore a persisted daily row after a same-day restart.
    pub fn restore_daily(&mut self, stat: DailyStat) {
        self.daily.restore(stat);
    }

    /// Forget tick history across reconnect gaps.
    pub fn reset_train(&mut self) {
        self.train.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn settings() -> RiskSettings {
        RiskSettings {
            daily_cap: dec!(8.00),
            train_delta: dec!(4.0),
            train_pause: Duration::from_secs(15 * 60),
            killswitch_threshold: dec!(0.045),
            killswitch_duration: Duration::from_secs(24 * 3600),
            session_start_utc_hour: 8,
            session_end_utc_hour: 21,
            risk_fraction: dec!(0.015),
        }
    }

    fn trading_hours() -> DateTime<Utc> {
        // Wednesday 10:00 UTC.
        Utc.with_ymd_and_hms(2025, 6, 4, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_all_green_permits() {
        let mut guardian = RiskGuardian::new(&settings(), trading_hours());
        assert_eq!(
            guardian.permits_entry(trading_hours(), Instant::now()),
            Ok(())
        );
    }

    #[test]
    fn test_session_refusal() {
        let mut guardian = RiskGuardian::new(&settings(), trading_hours());
        let night = Utc.with_ymd_and_hms(2025, 6, 4, 23, 0, 0).unwrap();
        assert_eq!(
            guardian.permits_entry(night, Instant::now()),
            Err(RiskRefusal::SessionClosed)
        );
    }

    #[test]
    fn test_cap_refusal_after_exits() {
        let mut guardian = RiskGuardian::new(&settings(), trading_hours());
        guardian.record_trade_exit(trading_hours(), dec!(8.00));
        assert_eq!(
            guardian.permits_entry(trading_hours(), Instant::now()),
            Err(RiskRefusal::CapReached)
        );
    }

    #[test]
    fn test_train_engages_pause_and_masks_cap_check() {
        let mut guardian = RiskGuardian::new(&settings(), trading_hours());
        let now = Instant::now();

        assert!(!guardian.observe_tick(dec!(100), now));
        assert!(!guardian.observe_tick(dec!(104.1), now));
        assert!(guardian.observe_tick(dec!(108.3), now));

        assert!(guardian.is_paused(now));
        assert!(guardian.cap_reached(trading_hours(), now));
        assert_eq!(
            guardian.permits_entry(trading_hours(), now),
            Err(RiskRefusal::TrainPause)
        );
        // The pause expires.
        let later = now + Duration::from_secs(15 * 60);
        assert!(!guardian.cap_reached(trading_hours(), later));
    }

    #[test]
    fn test_killswitch_refusal() {
        let mut guardian = RiskGuardian::new(&settings(), trading_hours());
        let now = Instant::now();
        guardian.observe_balance(dec!(1000), now);
        assert!(guardian.observe_balance(dec!(955), now).is_some());
        assert_eq!(
            guardian.permits_entry(trading_hours(), now),
            Err(RiskRefusal::KillSwitch)
        );
    }

    #[test]
    fn test_stake_uses_risk_fraction() {
        let guardian = RiskGuardian::new(&settings(), trading_hours());
        assert_eq!(guardian.stake(dec!(1000), dec!(1), dec!(5.0)), dec!(3.00));
    }
}
