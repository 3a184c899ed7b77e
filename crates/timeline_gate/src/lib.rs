use chrono::{NaiveDateTime, NaiveTime};
use core_types::PlanStatus;
use serde::{Deserialize, Serialize};

/// Hard IST cutovers for the session. Each producer asks this gate before
/// revealing its output; nothing else in the runtime compares wall-clock
/// times against the schedule directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Cutovers {
    pub session_open: NaiveTime,
    pub pdc: NaiveTime,
    pub ol: NaiveTime,
    pub ot: NaiveTime,
    pub entry_open: NaiveTime,
    pub eod_flatten: NaiveTime,
}

impl Default for Cutovers {
    fn default() -> Self {
        Self {
            session_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            pdc: NaiveTime::from_hms_opt(9, 25, 0).unwrap(),
            ol: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            // Post-bar-close: the 09:35 bar is sealed at 09:40:00.
            ot: NaiveTime::from_hms_opt(9, 40, 1).unwrap(),
            entry_open: NaiveTime::from_hms_opt(9, 40, 0).unwrap(),
            eod_flatten: NaiveTime::from_hms_opt(15, 5, 0).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealField {
    Quote,
    Ohlc,
    TagPdc,
    TagOl,
    TagOt,
    Plan,
}

#[derive(Debug, Clone)]
pub struct TimelineGate {
    cutovers: Cutovers,
}

impl TimelineGate {
    pub fn new(cutovers: Cutovers) -> Self {
        Self { cutovers }
    }

    pub fn cutovers(&self) -> &Cutovers {
        &self.cutovers
    }

    /// Whether `field` may be produced/revealed at `now`. Plan fields are
    /// additionally gated on the snapshot being locked in a tradable status.
    pub fn reveal(
        &self,
        field: RevealField,
        now: NaiveDateTime,
        plan_status: PlanStatus,
        plan_locked: bool,
    ) -> bool {
        let t = now.time();
        match field {
            RevealField::Quote | RevealField::Ohlc => true,
            RevealField::TagPdc => t >= self.cutovers.pdc,
            RevealField::TagOl => t >= self.cutovers.ol,
            RevealField::TagOt => t >= self.cutovers.ot,
            RevealField::Plan => plan_locked && plan_status.is_tradable(),
        }
    }

    pub fn entries_open(&self, now: NaiveDateTime) -> bool {
        let t = now.time();
        t >= self.cutovers.entry_open && t < self.cutovers.eod_flatten
    }

    pub fn past_eod(&self, now: NaiveDateTime) -> bool {
        now.time() >= self.cutovers.eod_flatten
    }
}
