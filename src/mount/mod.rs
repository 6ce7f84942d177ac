//! Mount coordinator: owns the sky-coordinate model and orchestrates the two
//! axis backends.
//!
//! The RA axis is a SkyWatcher motor controller addressed in encoder ticks;
//! the DEC axis is an LX200-speaking controller addressed in degrees. The
//! coordinator keeps them consistent through the hour-angle-zero alignment
//! offset: `HA(ticks) = wrap_hours(sign * (ticks - ha0) * 360 / cpr / 15)`.

pub use state::{AxisInfo, DecTuning, MountState, SiteTime};

mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::astro_math::{
    clamp_dec, deg_to_hours, hours_to_deg, lst_hours, wrap_deg, wrap_hours, Degrees, Hours,
    SIDEREAL_DAY_SECONDS,
};
use crate::config::Config;
use crate::dec_backend::DecBackend;
use crate::errors::{DeviceResult, MountError};
use crate::skywatcher::{tick_delta, Axis, Direction, MotionMode, SkyWatcherMc, TICK_MASK};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const SETTLE_DELAY: Duration = Duration::from_millis(100);
const MOVE_SETTLE_DELAY: Duration = Duration::from_millis(50);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const SLEW_DONE_THRESHOLD_DEG: Degrees = 0.05;
const MIN_MOVE_RATE_DEG_S: f64 = 1e-6;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum GotoOutcome {
    Completed,
    /// The slew did not converge within the deadline. Motion is not aborted;
    /// clients discover the real position through subsequent polls.
    TimedOut,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MoveDirection {
    North,
    South,
    East,
    West,
}

pub struct Mount {
    ra: SkyWatcherMc,
    ra_axis: Axis,
    /// Configured drive direction for tracking and goto; East moves invert it.
    ra_direction: Direction,
    dec: Arc<dyn DecBackend>,

    pub(crate) state: RwLock<MountState>,
    pub(crate) axis_info: RwLock<AxisInfo>,
    pub(crate) site: RwLock<SiteTime>,
    tuning: RwLock<DecTuning>,

    /// Serializes every motion-issuing sequence (goto, tracking toggles,
    /// manual moves). The stop-configure-start steps must not interleave.
    motion_lock: Mutex<()>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,

    poll_interval: Duration,
    status_interval: Duration,
    init_timeout: Duration,
    slew_timeout: Duration,
    slew_poll_interval: Duration,
}

impl Mount {
    pub fn new(ra: SkyWatcherMc, ra_axis: Axis, dec: Arc<dyn DecBackend>, config: &Config) -> Self {
        let ra_direction = if config.ra.ccw {
            Direction::Backward
        } else {
            Direction::Forward
        };
        let sign = if config.ra.sign < 0 { -1 } else { 1 };
        Mount {
            ra,
            ra_axis,
            ra_direction,
            dec,
            state: RwLock::new(MountState::new(sign)),
            axis_info: RwLock::new(AxisInfo::default()),
            site: RwLock::new(SiteTime::new(
                config.site.latitude,
                config.site.longitude,
                config.site.utc_offset_hours,
            )),
            tuning: RwLock::new(DecTuning {
                accel_deg_s2: config.dec.accel,
                vmax_deg_s: config.dec.vmax,
            }),
            motion_lock: Mutex::new(()),
            tasks: std::sync::Mutex::new(Vec::new()),
            poll_interval: Duration::from_millis(config.polling.poll_interval_millis.max(1)),
            status_interval: Duration::from_secs(config.polling.status_interval_secs),
            init_timeout: Duration::from_secs(config.polling.init_timeout_secs.max(1)),
            slew_timeout: Duration::from_secs(config.polling.slew_timeout_secs),
            slew_poll_interval: Duration::from_millis(
                config.polling.slew_poll_interval_millis.max(1),
            ),
        }
    }

    /// Startup sequence: initialize the RA controller, read its hardware
    /// facts, push DEC tuning, establish the uncalibrated default alignment
    /// (current pointing taken as RA=0), then launch the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), MountError> {
        info!("initializing backends");
        self.ra
            .do_initialize(self.ra_axis, self.init_timeout, INIT_POLL_INTERVAL)
            .await?;

        let cpr = self.ra.inquire_cpr(self.ra_axis).await?;
        let timer_freq = self.ra.inquire_timer_freq(self.ra_axis).await?;
        info!(cpr, timer_freq, "RA motor controller ready");
        {
            let mut axis = self.axis_info.write().await;
            axis.cpr = cpr;
            axis.timer_freq = timer_freq;
        }

        let tuning = *self.tuning.read().await;
        self.dec.set_accel(tuning.accel_deg_s2).await;
        self.dec.set_max_rate(tuning.vmax_deg_s).await;

        let ticks = self.ra.inquire_position(self.ra_axis).await?;
        let lst = {
            let site = self.site.read().await;
            lst_hours(site.now_utc(), site.lon_deg_east)
        };
        {
            let mut state = self.state.write().await;
            state.ra_cpr = cpr;
            state.last_ra_ticks = ticks;
            // assume current pointing is RA=0, so HA = LST; a :CM sync must
            // follow before coordinates mean anything on the real sky
            state.ra_ha0_ticks = ticks - ha_to_ticks(cpr, state.ra_sign, lst);
        }
        info!("initial alignment set; SYNC required for real-sky pointing");

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mount = Arc::clone(self);
        tasks.push(tokio::spawn(async move { mount.poll_loop().await }));
        if !self.status_interval.is_zero() {
            let mount = Arc::clone(self);
            tasks.push(tokio::spawn(async move { mount.status_loop().await }));
        }
        Ok(())
    }

    pub fn close(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.iter() {
            task.abort();
        }
    }

    /// Position loop: reads raw axis positions from both backends and
    /// recomputes the sky coordinate estimate. Never terminates on transient
    /// errors, only on cancellation.
    async fn poll_loop(&self) {
        info!("poll loop started");
        loop {
            match self.poll_once().await {
                Ok(()) => sleep(self.poll_interval).await,
                Err(e) => {
                    warn!(error = %e, "poll error");
                    sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }

    pub(crate) async fn poll_once(&self) -> DeviceResult<()> {
        let (now, lon) = {
            let site = self.site.read().await;
            (site.now_utc(), site.lon_deg_east)
        };
        let ra_ticks = self.ra.inquire_position(self.ra_axis).await?;
        {
            let mut axis = self.axis_info.write().await;
            axis.last_pos = ra_ticks;
            axis.updated = Some(Instant::now());
        }
        let dec_deg = self.dec.get_dec().await?;

        let mut state = self.state.write().await;
        state.last_ra_ticks = ra_ticks;
        state.last_dec_deg = dec_deg;
        let ha = ticks_to_ha(
            state.ra_cpr,
            state.ra_sign,
            tick_delta(ra_ticks, state.ra_ha0_ticks),
        );
        state.ra_hours = wrap_hours(lst_hours(now, lon) - ha);
        state.dec_deg = dec_deg;
        Ok(())
    }

    /// Status loop: refreshes the RA status bitfield. Best effort.
    async fn status_loop(&self) {
        loop {
            match self.ra.inquire_status(self.ra_axis).await {
                Ok(status) => {
                    let mut axis = self.axis_info.write().await;
                    axis.last_status = Some(status);
                    axis.updated = Some(Instant::now());
                }
                Err(e) => debug!(error = %e, "status poll failed"),
            }
            sleep(self.status_interval).await;
        }
    }

    pub async fn get_ra_dec(&self) -> (Hours, Degrees) {
        let state = self.state.read().await;
        (state.ra_hours, state.dec_deg)
    }

    /// Stores the target and forwards it to the DEC backend so controllers
    /// that track their own target stay in step. Forwarding is best effort.
    pub async fn set_target_ra(&self, ra_hours: Hours) {
        let ra = wrap_hours(ra_hours);
        self.state.write().await.target_ra_hours = Some(ra);
        if let Err(e) = self.dec.set_target_ra(ra).await {
            debug!(error = %e, "DEC target RA not forwarded");
        }
    }

    pub async fn set_target_dec(&self, dec_deg: Degrees) {
        let dec = clamp_dec(dec_deg);
        self.state.write().await.target_dec_deg = Some(dec);
        if let Err(e) = self.dec.set_target_dec(dec).await {
            debug!(error = %e, "DEC target not forwarded");
        }
    }

    async fn targets(&self) -> Result<(Hours, Degrees), MountError> {
        let state = self.state.read().await;
        match (state.target_ra_hours, state.target_dec_deg) {
            (Some(ra), Some(dec)) => Ok((ra, dec)),
            _ => Err(MountError::TargetNotSet),
        }
    }

    /// Redefines the alignment offset so the current physical position reads
    /// as the target coordinates. DEC is trusted to already match; only the
    /// RA tick offset moves.
    pub async fn sync_to_target(&self) -> Result<(), MountError> {
        let (target_ra, target_dec) = self.targets().await?;
        let lst = {
            let site = self.site.read().await;
            lst_hours(site.now_utc(), site.lon_deg_east)
        };
        let ha_target = wrap_hours(lst - target_ra);
        let mut state = self.state.write().await;
        state.ra_ha0_ticks =
            state.last_ra_ticks - ha_to_ticks(state.ra_cpr, state.ra_sign, ha_target);
        info!(
            ha0_ticks = state.ra_ha0_ticks,
            target_ra, target_dec, lst, "SYNC: alignment offset updated"
        );
        Ok(())
    }

    /// Coordinated GOTO: DEC backend slews through its own LX200 goto, the
    /// RA axis through a stop-configure-target-start sequence, then sidereal
    /// tracking is re-enabled.
    pub async fn goto_target(&self) -> Result<GotoOutcome, MountError> {
        let (target_ra, target_dec) = self.targets().await?;
        let _motion = self.motion_lock.lock().await;

        let lst = {
            let site = self.site.read().await;
            lst_hours(site.now_utc(), site.lon_deg_east)
        };
        let ha_target = wrap_hours(lst - target_ra);
        let ra_ticks_target = {
            let state = self.state.read().await;
            state.ra_ha0_ticks + ha_to_ticks(state.ra_cpr, state.ra_sign, ha_target)
        };
        info!(target_ra, target_dec, ha_target, ra_ticks_target, "GOTO");

        // DEC first: best effort, the slew-wait below watches its progress
        if let Err(e) = self.dec.set_target_dec(target_dec).await {
            warn!(error = %e, "DEC set target failed");
        }
        if let Err(e) = self.dec.set_target_ra(target_ra).await {
            debug!(error = %e, "DEC set RA target failed");
        }
        if let Err(e) = self.dec.goto().await {
            warn!(error = %e, "DEC goto failed");
        }

        // RA: the controller requires a stopped axis before :G and :S
        let ra_sequence = async {
            self.ra.instant_stop(self.ra_axis).await?;
            sleep(SETTLE_DELAY).await;
            self.ra
                .set_motion_mode(self.ra_axis, MotionMode::goto(self.ra_direction))
                .await?;
            self.ra.set_goto_target(self.ra_axis, ra_ticks_target).await?;
            self.ra.start_motion(self.ra_axis).await?;
            DeviceResult::Ok(())
        };
        if let Err(e) = ra_sequence.await {
            warn!(error = %e, "RA goto failed");
        }

        let completed = self.wait_slew_finish(ra_ticks_target, target_dec).await;
        self.tracking_sequence(true).await;
        Ok(if completed {
            GotoOutcome::Completed
        } else {
            GotoOutcome::TimedOut
        })
    }

    /// Watches the poller's position estimates until both axes are within
    /// threshold of the target or the deadline passes. A timeout does not
    /// abort the motion.
    async fn wait_slew_finish(&self, ra_ticks_target: i64, dec_target_deg: Degrees) -> bool {
        let deadline = Instant::now() + self.slew_timeout;
        loop {
            let (cpr, ra_ticks, dec_deg) = {
                let state = self.state.read().await;
                (state.ra_cpr, state.last_ra_ticks, state.last_dec_deg)
            };
            let ra_err_deg = if cpr > 0 {
                tick_delta(ra_ticks, ra_ticks_target).abs() as f64 * 360.0 / cpr as f64
            } else {
                f64::INFINITY
            };
            let dec_err_deg = (dec_deg - dec_target_deg).abs();
            if ra_err_deg < SLEW_DONE_THRESHOLD_DEG && dec_err_deg < SLEW_DONE_THRESHOLD_DEG {
                info!(ra_err_deg, dec_err_deg, "slew complete");
                return true;
            }
            if Instant::now() >= deadline {
                warn!("slew timeout after {:?}", self.slew_timeout);
                return false;
            }
            sleep(self.slew_poll_interval).await;
        }
    }

    /// Best-effort stop of both axes. Never fails the protocol transaction;
    /// each side's failure is only logged.
    pub async fn abort(&self) {
        info!("abort requested");
        if let Err(e) = self.ra.instant_stop(self.ra_axis).await {
            warn!(error = %e, "RA abort failed");
        }
        self.dec.abort().await;
    }

    pub async fn enable_tracking(&self, enabled: bool) {
        let _motion = self.motion_lock.lock().await;
        self.tracking_sequence(enabled).await;
    }

    /// Caller must hold the motion lock.
    async fn tracking_sequence(&self, enabled: bool) {
        let (cpr, timer_freq) = {
            let axis = self.axis_info.read().await;
            (axis.cpr, axis.timer_freq)
        };
        if cpr == 0 || timer_freq == 0 {
            warn!("tracking not configured: CPR/timer frequency unknown");
            return;
        }
        let sidereal_deg_s = 360.0 / SIDEREAL_DAY_SECONDS;
        let preset = step_period_preset(cpr, timer_freq, sidereal_deg_s);
        info!(enabled, preset, cpr, timer_freq, "tracking");

        let sequence = async {
            self.ra.instant_stop(self.ra_axis).await?;
            sleep(SETTLE_DELAY).await;
            if enabled {
                self.ra
                    .set_motion_mode(self.ra_axis, MotionMode::tracking(self.ra_direction))
                    .await?;
                self.ra.set_step_period(self.ra_axis, preset).await?;
                self.ra.start_motion(self.ra_axis).await?;
            } else {
                self.ra.stop_motion(self.ra_axis).await?;
            }
            DeviceResult::Ok(())
        };
        match sequence.await {
            Ok(()) => self.state.write().await.tracking = enabled,
            Err(e) => warn!(error = %e, "tracking command failed"),
        }
    }

    /// Manual move. DEC forwards to the backend's directional commands; RA
    /// runs a slew at the requested rate. Returns false when the RA side
    /// rejects or fails the request.
    pub async fn move_axis(&self, direction: MoveDirection, start: bool, rate_deg_s: f64) -> bool {
        match direction {
            MoveDirection::North | MoveDirection::South => {
                let north = direction == MoveDirection::North;
                if let Err(e) = self.dec.move_ns(north, start).await {
                    warn!(error = %e, "DEC move failed");
                }
                true
            }
            MoveDirection::East | MoveDirection::West => {
                self.move_ra(direction == MoveDirection::East, start, rate_deg_s)
                    .await
            }
        }
    }

    async fn move_ra(&self, east: bool, start: bool, rate_deg_s: f64) -> bool {
        let (cpr, timer_freq) = {
            let axis = self.axis_info.read().await;
            (axis.cpr, axis.timer_freq)
        };
        if cpr == 0 || timer_freq == 0 {
            return false;
        }
        let rate_deg_s = rate_deg_s.abs();
        if rate_deg_s < MIN_MOVE_RATE_DEG_S {
            return false;
        }
        let preset = step_period_preset(cpr, timer_freq, rate_deg_s);

        // East/West mapping depends on the mount orientation; East inverts
        // the configured convention
        let direction = if east {
            invert(self.ra_direction)
        } else {
            self.ra_direction
        };

        let _motion = self.motion_lock.lock().await;
        let sequence = async {
            if start {
                self.ra.instant_stop(self.ra_axis).await?;
                sleep(MOVE_SETTLE_DELAY).await;
                self.ra
                    .set_motion_mode(self.ra_axis, MotionMode::tracking(direction))
                    .await?;
                self.ra.set_step_period(self.ra_axis, preset).await?;
                self.ra.start_motion(self.ra_axis).await?;
            } else {
                self.ra.stop_motion(self.ra_axis).await?;
            }
            DeviceResult::Ok(())
        };
        match sequence.await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "RA manual move failed");
                false
            }
        }
    }

    pub async fn site_snapshot(&self) -> SiteTime {
        self.site.read().await.clone()
    }

    pub async fn set_latitude(&self, lat_deg: Degrees) {
        self.site.write().await.lat_deg = clamp_dec(lat_deg);
    }

    pub async fn set_longitude(&self, lon_deg_east: Degrees) {
        self.site.write().await.lon_deg_east = lon_deg_east;
    }

    /// Sets the local date, keeping the previously set time of day.
    pub async fn set_local_date(&self, year: i32, month: u32, day: u32) -> bool {
        let mut site = self.site.write().await;
        let time = site
            .local_datetime
            .map(|dt| dt.time())
            .unwrap_or_else(NaiveTime::default);
        match NaiveDate::from_ymd_opt(year, month, day) {
            Some(date) => {
                site.local_datetime = Some(date.and_time(time));
                true
            }
            None => false,
        }
    }

    /// Sets the local wall-clock time, keeping the previously set date (or
    /// today's local date when none was set).
    pub async fn set_local_time(&self, hour: u32, minute: u32, second: u32) -> bool {
        let mut site = self.site.write().await;
        let date = site
            .local_datetime
            .map(|dt| dt.date())
            .unwrap_or_else(|| site.now_local().date_naive());
        match NaiveTime::from_hms_opt(hour, minute, second) {
            Some(time) => {
                site.local_datetime = Some(date.and_time(time));
                true
            }
            None => false,
        }
    }

    pub async fn set_dec_accel(&self, accel_deg_s2: f64) {
        self.tuning.write().await.accel_deg_s2 = accel_deg_s2;
        self.dec.set_accel(accel_deg_s2).await;
    }

    pub async fn set_dec_max_rate(&self, rate_deg_s: f64) {
        self.tuning.write().await.vmax_deg_s = rate_deg_s;
        self.dec.set_max_rate(rate_deg_s).await;
    }
}

fn invert(direction: Direction) -> Direction {
    match direction {
        Direction::Forward => Direction::Backward,
        Direction::Backward => Direction::Forward,
    }
}

/// Hour angle to tick offset, using the minimal signed representation so
/// masked 24-bit deltas stay unambiguous.
fn ha_to_ticks(cpr: u32, sign: i64, ha: Hours) -> i64 {
    if cpr == 0 {
        return 0;
    }
    let mut deg = wrap_deg(hours_to_deg(ha));
    if deg > 180.0 {
        deg -= 360.0;
    }
    ((deg / 360.0) * cpr as f64).round() as i64 * sign
}

fn ticks_to_ha(cpr: u32, sign: i64, ticks: i64) -> Hours {
    if cpr == 0 {
        return 0.0;
    }
    let deg = ticks as f64 * 360.0 / cpr as f64 * sign as f64;
    wrap_hours(deg_to_hours(deg))
}

/// Timer preset for a requested angular rate, clamped to the 24-bit field.
fn step_period_preset(cpr: u32, timer_freq: u32, rate_deg_s: f64) -> u32 {
    let counts_per_s = rate_deg_s * cpr as f64 / 360.0;
    let preset = (timer_freq as f64 / counts_per_s).round();
    preset.clamp(1.0, TICK_MASK as f64) as u32
}
