use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use tokio::time::Instant;

use crate::astro_math::{Degrees, Hours};
use crate::skywatcher::Status;

/// RA axis hardware facts, read once at startup and refreshed by the status
/// poller.
#[derive(Debug, Default, Clone)]
pub struct AxisInfo {
    /// Counts per revolution.
    pub cpr: u32,
    /// Timer input frequency, Hz.
    pub timer_freq: u32,
    pub last_pos: i64,
    pub last_status: Option<Status>,
    pub updated: Option<Instant>,
}

/// Volatile alignment and target model. `ra_ha0_ticks` is the single source
/// of truth for sky alignment; only SYNC and the startup default write it.
#[derive(Debug, Clone)]
pub struct MountState {
    pub ra_hours: Hours,
    pub dec_deg: Degrees,
    pub target_ra_hours: Option<Hours>,
    pub target_dec_deg: Option<Degrees>,
    pub tracking: bool,
    pub ra_cpr: u32,
    /// +1: ticks increase with hour angle; -1 flips.
    pub ra_sign: i64,
    /// Tick value corresponding to hour angle zero.
    pub ra_ha0_ticks: i64,
    pub last_ra_ticks: i64,
    pub last_dec_deg: Degrees,
}

impl MountState {
    pub fn new(ra_sign: i64) -> Self {
        MountState {
            ra_hours: 0.0,
            dec_deg: 0.0,
            target_ra_hours: None,
            target_dec_deg: None,
            tracking: true,
            ra_cpr: 0,
            ra_sign,
            ra_ha0_ticks: 0,
            last_ra_ticks: 0,
            last_dec_deg: 0.0,
        }
    }
}

/// Observing site plus the protocol's notion of local time. When a client
/// has set date/time via `:SC`/`:SL`, "now" is that wall clock reinterpreted
/// through the configured UTC offset; otherwise it is the system clock.
#[derive(Debug, Clone)]
pub struct SiteTime {
    pub lat_deg: Degrees,
    pub lon_deg_east: Degrees,
    pub utc_offset_hours: f64,
    pub local_datetime: Option<NaiveDateTime>,
}

impl SiteTime {
    pub fn new(lat_deg: Degrees, lon_deg_east: Degrees, utc_offset_hours: f64) -> Self {
        SiteTime {
            lat_deg,
            lon_deg_east,
            utc_offset_hours,
            local_datetime: None,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        let secs = (self.utc_offset_hours * 3600.0).round() as i32;
        FixedOffset::east_opt(secs).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        match self.local_datetime {
            None => Utc::now(),
            Some(naive) => self
                .offset()
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }

    pub fn now_local(&self) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&self.offset())
    }
}

/// DEC backend tuning pushed at startup and adjustable at runtime.
#[derive(Debug, Copy, Clone)]
pub struct DecTuning {
    pub accel_deg_s2: f64,
    pub vmax_deg_s: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate, Timelike};

    #[test]
    fn test_now_utc_reattaches_offset() {
        let mut site = SiteTime::new(43.2383, 76.945, 6.0);
        site.local_datetime = NaiveDate::from_ymd_opt(2026, 8, 29)
            .and_then(|d| d.and_hms_opt(18, 0, 0));
        let utc = site.now_utc();
        assert_eq!((utc.hour(), utc.minute()), (12, 0));
        assert_eq!(utc.day(), 29);
    }

    #[test]
    fn test_now_local_round_trips() {
        let mut site = SiteTime::new(0.0, 0.0, -3.5);
        site.local_datetime = NaiveDate::from_ymd_opt(2026, 1, 1)
            .and_then(|d| d.and_hms_opt(1, 30, 0));
        let local = site.now_local();
        assert_eq!((local.hour(), local.minute()), (1, 30));
        assert_eq!((local.month(), local.day()), (1, 1));
    }
}
