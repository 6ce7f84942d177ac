use crate::astro_math::Degrees;
use serde::{Deserialize, Serialize};

/* Config */
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerSettings,
    pub ra: RaSettings,
    pub dec: DecSettings,
    pub site: SiteSettings,
    pub polling: PollSettings,
}

/* TCP server */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:10001".to_string(),
        }
    }
}

/* RA axis: SkyWatcher motor controller over serial */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaSettings {
    pub port: String,
    pub baud: u32,
    pub timeout_millis: u64,
    /// Motor controller channel, "1" or "2".
    pub channel: String,
    /// Tracking/goto direction convention; true drives the axis backward.
    pub ccw: bool,
    /// Tick-to-hour-angle sign correction, +1 or -1.
    pub sign: i64,
}

impl Default for RaSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            timeout_millis: 500,
            channel: "1".to_string(),
            ccw: false,
            sign: 1,
        }
    }
}

/* DEC axis: LX200-speaking controller over serial */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecSettings {
    /// None selects the dummy bench backend.
    pub port: Option<String>,
    pub baud: u32,
    pub timeout_millis: u64,
    /// Acceleration default pushed at startup, deg/s^2.
    pub accel: f64,
    /// Max slew rate default pushed at startup, deg/s.
    pub vmax: f64,
}

impl Default for DecSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            timeout_millis: 500,
            accel: 5.0,
            vmax: 4.0,
        }
    }
}

/* Observing site */
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct SiteSettings {
    pub latitude: Degrees,
    /// East-positive degrees.
    pub longitude: Degrees,
    /// Used to interpret/format the local-time protocol commands.
    pub utc_offset_hours: f64,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            utc_offset_hours: 0.0,
        }
    }
}

/* Background loops */
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    pub poll_interval_millis: u64,
    /// 0 disables the status loop.
    pub status_interval_secs: u64,
    pub init_timeout_secs: u64,
    /// Ceiling on the GOTO slew wait; the slew itself is not aborted.
    pub slew_timeout_secs: u64,
    pub slew_poll_interval_millis: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: 200,
            status_interval_secs: 5,
            init_timeout_secs: 5,
            slew_timeout_secs: 180,
            slew_poll_interval_millis: 300,
        }
    }
}
