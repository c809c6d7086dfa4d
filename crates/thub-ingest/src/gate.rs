//! Fetch admission for sources that only make sense while a market is open.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use serde::Serialize;
use thub_core::{civil_time, Channel};
use thub_storage::DayProbe;
use tracing::{debug, warn};

/// A trading session in civil time, inclusive at both ends at minute
/// granularity: 11:30:59 is inside a session ending 11:30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn new(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0)?,
            end: NaiveTime::from_hms_opt(end.0, end.1, 0)?,
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        let Some(minute) = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0) else {
            return false;
        };
        self.start <= minute && minute <= self.end
    }
}

/// Morning 09:30–11:30 and afternoon 13:00–15:00.
pub fn ashare_sessions() -> Vec<SessionWindow> {
    [((9, 30), (11, 30)), ((13, 0), (15, 0))]
        .into_iter()
        .filter_map(|(start, end)| SessionWindow::new(start, end))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    SessionOpen,
    Backfill,
    NonTradingDay,
    MarketClosed,
    DataExists,
    ProbeFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub admit: bool,
    pub reason: GateReason,
    pub evaluated_at: DateTime<FixedOffset>,
    pub trading_day: bool,
    pub session: Option<SessionWindow>,
    /// Same-day data check, when one was made. Probe failures read as `true`.
    pub data_exists: Option<bool>,
}

#[async_trait]
pub trait FetchGate: Send + Sync {
    async fn decide(&self, now: DateTime<Utc>) -> GateDecision;
}

pub struct TradingSessionGate {
    channel: Channel,
    sessions: Vec<SessionWindow>,
    probe: Option<Arc<dyn DayProbe>>,
}

impl TradingSessionGate {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sessions: ashare_sessions(),
            probe: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Vec<SessionWindow>) -> Self {
        self.sessions = sessions;
        self
    }

    /// With a probe, a closed market still admits one fetch on a trading day
    /// that has no data yet.
    pub fn with_probe(mut self, probe: Arc<dyn DayProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn is_trading_day(local: &DateTime<FixedOffset>) -> bool {
        !matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn open_session(&self, local: &DateTime<FixedOffset>) -> Option<SessionWindow> {
        if !Self::is_trading_day(local) {
            return None;
        }
        self.sessions
            .iter()
            .copied()
            .find(|s| s.contains(local.time()))
    }
}

#[async_trait]
impl FetchGate for TradingSessionGate {
    async fn decide(&self, now: DateTime<Utc>) -> GateDecision {
        let local = civil_time(now);
        let trading_day = Self::is_trading_day(&local);
        let mut decision = GateDecision {
            admit: false,
            reason: GateReason::MarketClosed,
            evaluated_at: local,
            trading_day,
            session: self.open_session(&local),
            data_exists: None,
        };

        if decision.session.is_some() {
            decision.admit = true;
            decision.reason = GateReason::SessionOpen;
            return decision;
        }
        if !trading_day {
            decision.reason = GateReason::NonTradingDay;
            return decision;
        }
        let Some(probe) = &self.probe else {
            return decision;
        };

        match probe.has_records_for_day(self.channel, local.date_naive()).await {
            Ok(false) => {
                decision.admit = true;
                decision.reason = GateReason::Backfill;
                decision.data_exists = Some(false);
            }
            Ok(true) => {
                decision.reason = GateReason::DataExists;
                decision.data_exists = Some(true);
            }
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "same-day probe failed; assuming data exists");
                decision.reason = GateReason::ProbeFailed;
                decision.data_exists = Some(true);
            }
        }
        debug!(channel = %self.channel, admit = decision.admit, reason = ?decision.reason, "gate decided");
        decision
    }
}
