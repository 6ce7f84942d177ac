//! Declination axis backends.
//!
//! The DEC axis is driven by an external controller speaking an ASCII LX200
//! subset over serial. The backend is selected at configuration time: a real
//! serial client, or a dummy used for bench runs without hardware.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task;
use tracing::debug;

use crate::astro_math::{clamp_dec, wrap_hours, Degrees, Hours};
use crate::errors::{DeviceError, DeviceResult};
use crate::lx200;
use crate::transport::Transport;

#[async_trait]
pub trait DecBackend: Send + Sync {
    /// Current declination in degrees.
    async fn get_dec(&self) -> DeviceResult<Degrees>;

    /// Current RA if the backend reports one. Best effort; `None` when the
    /// backend does not answer `:GR#`.
    async fn get_ra(&self) -> Option<Hours>;

    /// `true` means the request was accepted, not that the axis moved.
    async fn set_target_ra(&self, ra: Hours) -> DeviceResult<bool>;
    async fn set_target_dec(&self, dec: Degrees) -> DeviceResult<bool>;

    /// Starts a slew to the previously set target.
    async fn goto(&self) -> DeviceResult<()>;

    /// Best effort; failures are swallowed.
    async fn abort(&self);

    async fn move_ns(&self, north: bool, start: bool) -> DeviceResult<()>;
    async fn move_we(&self, east: bool, start: bool) -> DeviceResult<()>;

    /// Non-standard tuning extensions; unsupported commands are logged and
    /// ignored.
    async fn set_accel(&self, accel_deg_s2: f64);
    async fn set_max_rate(&self, rate_deg_s: f64);
}

/// LX200 client over a serial transport.
pub struct SerialDecClient {
    dev: Arc<dyn Transport>,
}

impl SerialDecClient {
    pub fn new(dev: Arc<dyn Transport>) -> Self {
        SerialDecClient { dev }
    }

    /// One `:CMD#` round trip; returns the response body without the
    /// trailing `#`.
    async fn command(&self, cmd: &str) -> DeviceResult<String> {
        let mut wire = String::new();
        if !cmd.starts_with(':') {
            wire.push(':');
        }
        wire.push_str(cmd);
        if !wire.ends_with('#') {
            wire.push('#');
        }
        let payload = wire.into_bytes();
        let dev = Arc::clone(&self.dev);
        let raw = task::spawn_blocking(move || dev.transact(&payload, lx200::TERMINATOR))
            .await
            .map_err(|e| DeviceError::Internal(e.to_string()))??;
        let body = raw.strip_suffix(&[lx200::TERMINATOR]).ok_or_else(|| {
            DeviceError::MalformedResponse(format!(
                "unterminated response {:?}",
                String::from_utf8_lossy(&raw)
            ))
        })?;
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    fn accepted(resp: &str) -> bool {
        matches!(resp, "1" | "0" | "")
    }
}

#[async_trait]
impl DecBackend for SerialDecClient {
    async fn get_dec(&self) -> DeviceResult<Degrees> {
        let resp = self.command(":GD#").await?;
        lx200::parse_dec(&resp)
            .map_err(|e| DeviceError::MalformedResponse(e.to_string()))
    }

    async fn get_ra(&self) -> Option<Hours> {
        let resp = self.command(":GR#").await.ok()?;
        lx200::parse_ra(&resp).ok()
    }

    async fn set_target_ra(&self, ra: Hours) -> DeviceResult<bool> {
        let resp = self.command(&format!(":Sr {}#", lx200::fmt_ra(ra))).await?;
        Ok(Self::accepted(&resp))
    }

    async fn set_target_dec(&self, dec: Degrees) -> DeviceResult<bool> {
        let resp = self.command(&format!(":Sd {}#", lx200::fmt_dec(dec))).await?;
        Ok(Self::accepted(&resp))
    }

    async fn goto(&self) -> DeviceResult<()> {
        // controllers answer "0", "1" or nothing; any terminated frame counts
        self.command(":MS#").await?;
        Ok(())
    }

    async fn abort(&self) {
        if let Err(e) = self.command(":Q#").await {
            debug!(error = %e, "DEC abort failed");
        }
    }

    async fn move_ns(&self, north: bool, start: bool) -> DeviceResult<()> {
        let cmd = match (north, start) {
            (true, true) => ":Mn#",
            (false, true) => ":Ms#",
            (true, false) => ":Qn#",
            (false, false) => ":Qs#",
        };
        self.command(cmd).await?;
        Ok(())
    }

    async fn move_we(&self, east: bool, start: bool) -> DeviceResult<()> {
        let cmd = match (east, start) {
            (true, true) => ":Me#",
            (false, true) => ":Mw#",
            (true, false) => ":Qe#",
            (false, false) => ":Qw#",
        };
        self.command(cmd).await?;
        Ok(())
    }

    async fn set_accel(&self, accel_deg_s2: f64) {
        if let Err(e) = self.command(&format!(":XAC{:+08.3}#", accel_deg_s2)).await {
            debug!(error = %e, "DEC accel extension not supported");
        }
    }

    async fn set_max_rate(&self, rate_deg_s: f64) {
        if let Err(e) = self.command(&format!(":XVM{:07.3}#", rate_deg_s)).await {
            debug!(error = %e, "DEC vmax extension not supported");
        }
    }
}

/// Bench backend for running without DEC hardware. Mirrors set targets: a
/// goto "lands" instantly, so reads report whatever was last targeted.
#[derive(Default)]
pub struct DummyDec {
    inner: Mutex<DummyState>,
}

#[derive(Default)]
struct DummyState {
    dec: Degrees,
    target_ra: Option<Hours>,
    target_dec: Option<Degrees>,
}

#[async_trait]
impl DecBackend for DummyDec {
    async fn get_dec(&self) -> DeviceResult<Degrees> {
        Ok(self.inner.lock().unwrap().dec)
    }

    async fn get_ra(&self) -> Option<Hours> {
        self.inner.lock().unwrap().target_ra
    }

    async fn set_target_ra(&self, ra: Hours) -> DeviceResult<bool> {
        self.inner.lock().unwrap().target_ra = Some(wrap_hours(ra));
        Ok(true)
    }

    async fn set_target_dec(&self, dec: Degrees) -> DeviceResult<bool> {
        let mut state = self.inner.lock().unwrap();
        let dec = clamp_dec(dec);
        state.target_dec = Some(dec);
        // the bench axis is always already where it was told to point
        state.dec = dec;
        Ok(true)
    }

    async fn goto(&self) -> DeviceResult<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(target) = state.target_dec {
            state.dec = target;
        }
        Ok(())
    }

    async fn abort(&self) {}

    async fn move_ns(&self, _north: bool, _start: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn move_we(&self, _east: bool, _start: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn set_accel(&self, _accel_deg_s2: f64) {}

    async fn set_max_rate(&self, _rate_deg_s: f64) {}
}
