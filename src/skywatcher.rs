//! SkyWatcher motor controller protocol.
//!
//! Requests are `:<cmd><axis>[hex]\r`; responses are `=<hex>\r` on success or
//! `!<code>\r` on failure. Numeric fields travel as "revu24": a 24-bit value
//! rendered as six hex characters, little-endian by bytes with each byte's
//! high nibble first (0x123456 is sent as `563412`).

use std::sync::Arc;
use std::time::Duration;

use retry::delay::Exponential;
use retry::OperationResult;
use tokio::task;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::errors::{DeviceError, DeviceResult, McErrorCode};
use crate::transport::Transport;

const TERMINATOR: u8 = b'\r';
const RETRY_MILLIS: u64 = 50;
const NUM_TRIES: usize = 3;

pub const TICK_MASK: i64 = 0xFF_FFFF;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Axis {
    Ra,
    Dec,
}

impl Axis {
    pub fn from_channel(ch: &str) -> Option<Axis> {
        match ch.trim() {
            "1" => Some(Axis::Ra),
            "2" => Some(Axis::Dec),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Axis::Ra => '1',
            Axis::Dec => '2',
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SlewMode {
    Slew,
    Goto,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SpeedMode {
    Low,
    High,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct MotionMode {
    pub slew_mode: SlewMode,
    pub direction: Direction,
    pub speed_mode: SpeedMode,
}

impl MotionMode {
    pub fn tracking(direction: Direction) -> Self {
        MotionMode {
            slew_mode: SlewMode::Slew,
            direction,
            speed_mode: SpeedMode::Low,
        }
    }

    pub fn goto(direction: Direction) -> Self {
        MotionMode {
            slew_mode: SlewMode::Goto,
            direction,
            speed_mode: SpeedMode::Low,
        }
    }

    fn to_wire(self) -> String {
        let mode = match (self.slew_mode, self.speed_mode) {
            (SlewMode::Slew, SpeedMode::Low) => '1',
            (SlewMode::Slew, SpeedMode::High) => '3',
            (SlewMode::Goto, SpeedMode::Low) => '2',
            (SlewMode::Goto, SpeedMode::High) => '0',
        };
        let dir = match self.direction {
            Direction::Backward => '1',
            Direction::Forward => '0',
        };
        format!("{}{}", mode, dir)
    }
}

/// Decoded `:f` status response. Bit layout: nibble 0 carries bit0 =
/// slew mode (set = slew), bit1 = direction (set = backward), bit2 = speed
/// (set = high); nibble 1 bit0 = running; nibble 2 bit0 = initialized.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Status {
    pub raw: u16,
    pub running: bool,
    pub initialized: bool,
    pub slew_mode: SlewMode,
    pub direction: Direction,
    pub speed_mode: SpeedMode,
}

impl Status {
    pub fn from_response(data: &[u8]) -> DeviceResult<Status> {
        let nibble = |i: usize| -> DeviceResult<u16> {
            match data.get(i) {
                Some(&b) => hex_val(b).map(u16::from),
                None => Ok(0),
            }
        };
        let (n0, n1, n2) = (nibble(0)?, nibble(1)?, nibble(2)?);
        Ok(Status {
            raw: (n0 << 8) | (n1 << 4) | n2,
            running: n1 & 0x1 != 0,
            initialized: n2 & 0x1 != 0,
            slew_mode: if n0 & 0x1 != 0 { SlewMode::Slew } else { SlewMode::Goto },
            direction: if n0 & 0x2 != 0 { Direction::Backward } else { Direction::Forward },
            speed_mode: if n0 & 0x4 != 0 { SpeedMode::High } else { SpeedMode::Low },
        })
    }
}

fn hex_val(b: u8) -> DeviceResult<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        _ => Err(DeviceError::MalformedResponse(format!(
            "invalid hex digit {:?}",
            b as char
        ))),
    }
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Encodes the low 24 bits of `value` as six hex characters in wire order.
pub fn encode_revu24(value: i64) -> String {
    let n = (value & TICK_MASK) as u32;
    let chars = [
        HEX[((n & 0x0000F0) >> 4) as usize],
        HEX[(n & 0x00000F) as usize],
        HEX[((n & 0x00F000) >> 12) as usize],
        HEX[((n & 0x000F00) >> 8) as usize],
        HEX[((n & 0xF00000) >> 20) as usize],
        HEX[((n & 0x0F0000) >> 16) as usize],
    ];
    String::from_utf8(chars.to_vec()).unwrap_or_default()
}

/// Decodes six wire-order hex characters into an unsigned 24-bit value.
pub fn decode_revu24(data: &[u8]) -> DeviceResult<u32> {
    if data.len() < 6 {
        return Err(DeviceError::MalformedResponse(format!(
            "revu24 data too short: {:?}",
            String::from_utf8_lossy(data)
        )));
    }
    let mut v = u32::from(hex_val(data[4])?);
    v = (v << 4) | u32::from(hex_val(data[5])?);
    v = (v << 4) | u32::from(hex_val(data[2])?);
    v = (v << 4) | u32::from(hex_val(data[3])?);
    v = (v << 4) | u32::from(hex_val(data[0])?);
    v = (v << 4) | u32::from(hex_val(data[1])?);
    Ok(v)
}

/// Interprets an unsigned 24-bit value as two's-complement signed.
pub fn sign_extend_24(v: u32) -> i64 {
    let v = i64::from(v) & TICK_MASK;
    if v & 0x80_0000 != 0 {
        v - (1 << 24)
    } else {
        v
    }
}

/// Signed 24-bit difference `a - b`, tolerant of wire wraparound.
pub fn tick_delta(a: i64, b: i64) -> i64 {
    sign_extend_24(((a - b) & TICK_MASK) as u32)
}

/// Async wrapper over the blocking motor-controller transport. One instance
/// per physical port; the transport serializes concurrent transactions.
#[derive(Clone)]
pub struct SkyWatcherMc {
    dev: Arc<dyn Transport>,
}

impl SkyWatcherMc {
    pub fn new(dev: Arc<dyn Transport>) -> Self {
        SkyWatcherMc { dev }
    }

    /// One transaction, offloaded to the blocking pool. Idempotent commands
    /// are retried on communication errors.
    async fn transact(
        &self,
        cmd: char,
        axis: Axis,
        arg: Option<String>,
        idempotent: bool,
    ) -> DeviceResult<Vec<u8>> {
        let mut payload = format!(":{}{}", cmd, axis.as_char());
        if let Some(arg) = arg {
            payload.push_str(&arg);
        }
        payload.push('\r');
        let payload = payload.into_bytes();

        let dev = Arc::clone(&self.dev);
        let raw = task::spawn_blocking(move || {
            let tries = if idempotent { NUM_TRIES } else { 1 };
            let result = retry::retry(Exponential::from_millis(RETRY_MILLIS).take(tries - 1), || {
                match dev.transact(&payload, TERMINATOR) {
                    Ok(raw) => OperationResult::Ok(raw),
                    Err(e @ (DeviceError::Timeout { .. } | DeviceError::Io(_))) if idempotent => {
                        warn!(cmd = %String::from_utf8_lossy(&payload).trim(), error = %e, "retrying motor command");
                        OperationResult::Retry(e)
                    }
                    Err(e) => OperationResult::Err(e),
                }
            });
            result.map_err(|e| match e {
                retry::Error::Operation { error, .. } => error,
                retry::Error::Internal(msg) => DeviceError::Internal(msg),
            })
        })
        .await
        .map_err(|e| DeviceError::Internal(e.to_string()))??;

        Self::parse_response(&raw)
    }

    fn parse_response(raw: &[u8]) -> DeviceResult<Vec<u8>> {
        let body = raw.strip_suffix(&[TERMINATOR]).unwrap_or(raw);
        if raw.len() < 2 || body.is_empty() {
            return Err(DeviceError::MalformedResponse(format!(
                "short response {:?}",
                String::from_utf8_lossy(raw)
            )));
        }
        match body[0] {
            b'=' => Ok(body[1..].to_vec()),
            b'!' => {
                let digit = body.get(1).copied().unwrap_or(b'?');
                match hex_val(digit).ok().and_then(|d| McErrorCode::try_from(d).ok()) {
                    Some(code) => Err(DeviceError::Device(code)),
                    None => Err(DeviceError::UnknownDeviceError(digit)),
                }
            }
            _ => Err(DeviceError::MalformedResponse(format!(
                "bad response start {:?}",
                String::from_utf8_lossy(raw)
            ))),
        }
    }

    pub async fn inquire_cpr(&self, axis: Axis) -> DeviceResult<u32> {
        let data = self.transact('a', axis, None, true).await?;
        decode_revu24(&data)
    }

    pub async fn inquire_timer_freq(&self, axis: Axis) -> DeviceResult<u32> {
        let data = self.transact('b', axis, None, true).await?;
        decode_revu24(&data)
    }

    /// Raw axis position as a signed 24-bit tick count.
    pub async fn inquire_position(&self, axis: Axis) -> DeviceResult<i64> {
        let data = self.transact('j', axis, None, true).await?;
        Ok(sign_extend_24(decode_revu24(&data)?))
    }

    pub async fn inquire_status(&self, axis: Axis) -> DeviceResult<Status> {
        let data = self.transact('f', axis, None, true).await?;
        Status::from_response(&data)
    }

    /// Must only be issued while the axis is stopped.
    pub async fn set_motion_mode(&self, axis: Axis, mode: MotionMode) -> DeviceResult<()> {
        self.transact('G', axis, Some(mode.to_wire()), false).await?;
        Ok(())
    }

    pub async fn set_goto_target(&self, axis: Axis, ticks: i64) -> DeviceResult<()> {
        self.transact('S', axis, Some(encode_revu24(ticks)), false).await?;
        Ok(())
    }

    pub async fn set_step_period(&self, axis: Axis, preset: u32) -> DeviceResult<()> {
        self.transact('I', axis, Some(encode_revu24(i64::from(preset))), false).await?;
        Ok(())
    }

    pub async fn start_motion(&self, axis: Axis) -> DeviceResult<()> {
        self.transact('J', axis, None, false).await?;
        Ok(())
    }

    /// Decelerated stop.
    pub async fn stop_motion(&self, axis: Axis) -> DeviceResult<()> {
        self.transact('K', axis, None, true).await?;
        Ok(())
    }

    /// Immediate stop, no deceleration ramp.
    pub async fn instant_stop(&self, axis: Axis) -> DeviceResult<()> {
        self.transact('L', axis, None, true).await?;
        Ok(())
    }

    /// Brings the axis to the initialized state, polling status until the
    /// controller reports it or `timeout` elapses. No-op when already
    /// initialized.
    pub async fn do_initialize(
        &self,
        axis: Axis,
        timeout: Duration,
        poll_interval: Duration,
    ) -> DeviceResult<()> {
        if self.inquire_status(axis).await?.initialized {
            return Ok(());
        }
        self.transact('F', axis, None, false).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.inquire_status(axis).await?.initialized {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::InitTimeout);
            }
            sleep(poll_interval).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::ScriptedTransport;
    use super::*;

    #[test]
    fn test_revu24_doc_example() {
        // the wire example from the SkyWatcher protocol document
        assert_eq!(encode_revu24(0x123456), "563412");
        assert_eq!(decode_revu24(b"563412").unwrap(), 0x123456);
    }

    #[test]
    fn test_revu24_round_trip() {
        for v in [0u32, 1, 0xFF, 0x100, 0xFFFF, 0x10000, 0xABCDEF, 0xFF_FFFF] {
            assert_eq!(decode_revu24(encode_revu24(i64::from(v)).as_bytes()).unwrap(), v);
        }
    }

    #[test]
    fn test_revu24_negative_masks() {
        assert_eq!(encode_revu24(-1), encode_revu24(0xFF_FFFF));
    }

    #[test]
    fn test_revu24_rejects_garbage() {
        assert!(decode_revu24(b"56341").is_err());
        assert!(decode_revu24(b"5634G1").is_err());
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend_24(0), 0);
        assert_eq!(sign_extend_24(0x7F_FFFF), 0x7F_FFFF);
        assert_eq!(sign_extend_24(0x80_0000), -0x80_0000);
        assert_eq!(sign_extend_24(0xFF_FFFF), -1);
    }

    #[test]
    fn test_tick_delta_wraparound() {
        assert_eq!(tick_delta(10, 3), 7);
        assert_eq!(tick_delta(3, 10), -7);
        // wraps across the 24-bit boundary
        assert_eq!(tick_delta(2, 0xFF_FFFE), 4);
        assert_eq!(tick_delta(0xFF_FFFE, 2), -4);
    }

    #[test]
    fn test_status_bits_independently() {
        let base = Status::from_response(b"000").unwrap();
        assert!(!base.running);
        assert!(!base.initialized);
        assert_eq!(base.slew_mode, SlewMode::Goto);
        assert_eq!(base.direction, Direction::Forward);
        assert_eq!(base.speed_mode, SpeedMode::Low);

        assert_eq!(Status::from_response(b"100").unwrap().slew_mode, SlewMode::Slew);
        assert_eq!(Status::from_response(b"200").unwrap().direction, Direction::Backward);
        assert_eq!(Status::from_response(b"400").unwrap().speed_mode, SpeedMode::High);
        assert!(Status::from_response(b"010").unwrap().running);
        assert!(Status::from_response(b"001").unwrap().initialized);

        let all = Status::from_response(b"111").unwrap();
        assert_eq!(all.slew_mode, SlewMode::Slew);
        assert_eq!(all.direction, Direction::Forward);
        assert_eq!(all.speed_mode, SpeedMode::Low);
        assert!(all.running);
        assert!(all.initialized);
    }

    #[test]
    fn test_status_tolerates_short_response() {
        let s = Status::from_response(b"1").unwrap();
        assert_eq!(s.slew_mode, SlewMode::Slew);
        assert!(!s.running);
        assert!(!s.initialized);
    }

    #[test]
    fn test_motion_mode_wire_table() {
        let mode = |slew_mode, speed_mode, direction| MotionMode {
            slew_mode,
            direction,
            speed_mode,
        };
        assert_eq!(mode(SlewMode::Slew, SpeedMode::Low, Direction::Forward).to_wire(), "10");
        assert_eq!(mode(SlewMode::Slew, SpeedMode::High, Direction::Forward).to_wire(), "30");
        assert_eq!(mode(SlewMode::Goto, SpeedMode::Low, Direction::Forward).to_wire(), "20");
        assert_eq!(mode(SlewMode::Goto, SpeedMode::High, Direction::Forward).to_wire(), "00");
        assert_eq!(mode(SlewMode::Slew, SpeedMode::Low, Direction::Backward).to_wire(), "11");
    }

    #[tokio::test]
    async fn test_inquire_cpr_framing() {
        let dev = Arc::new(ScriptedTransport::replies(&["=563412\r"]));
        let mc = SkyWatcherMc::new(dev.clone());
        assert_eq!(mc.inquire_cpr(Axis::Ra).await.unwrap(), 0x123456);
        assert_eq!(dev.sent_commands(), vec![":a1\r"]);
    }

    #[tokio::test]
    async fn test_position_is_signed() {
        let dev = Arc::new(ScriptedTransport::replies(&["=FFFFFF\r"]));
        let mc = SkyWatcherMc::new(dev);
        assert_eq!(mc.inquire_position(Axis::Ra).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_error_frame() {
        let dev = Arc::new(ScriptedTransport::replies(&["!2\r"]));
        let mc = SkyWatcherMc::new(dev);
        match mc.start_motion(Axis::Ra).await {
            Err(DeviceError::Device(McErrorCode::MotorNotStopped)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inquiry_retries_after_timeouts() {
        let dev = Arc::new(ScriptedTransport::new(vec![
            Err(DeviceError::Timeout { partial: vec![] }),
            Err(DeviceError::Timeout { partial: vec![] }),
            Ok(b"=563412\r".to_vec()),
        ]));
        let mc = SkyWatcherMc::new(dev.clone());
        assert_eq!(mc.inquire_cpr(Axis::Ra).await.unwrap(), 0x123456);
        // two timed-out attempts, then the one that answered
        assert_eq!(dev.sent_commands(), vec![":a1\r", ":a1\r", ":a1\r"]);
    }

    #[tokio::test]
    async fn test_inquiry_gives_up_after_three_attempts() {
        let dev = Arc::new(ScriptedTransport::new(vec![
            Err(DeviceError::Timeout { partial: vec![] }),
            Err(DeviceError::Timeout { partial: vec![] }),
            Err(DeviceError::Timeout { partial: vec![] }),
        ]));
        let mc = SkyWatcherMc::new(dev.clone());
        match mc.inquire_position(Axis::Ra).await {
            Err(DeviceError::Timeout { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(dev.sent_commands().len(), 3);
    }

    #[tokio::test]
    async fn test_motion_command_fails_on_first_timeout() {
        // start is not idempotent; a lost response must not trigger a resend
        let dev = Arc::new(ScriptedTransport::new(vec![Err(DeviceError::Timeout {
            partial: vec![],
        })]));
        let mc = SkyWatcherMc::new(dev.clone());
        match mc.start_motion(Axis::Ra).await {
            Err(DeviceError::Timeout { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(dev.sent_commands(), vec![":J1\r"]);
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let dev = Arc::new(ScriptedTransport::replies(&["?\r"]));
        let mc = SkyWatcherMc::new(dev);
        assert!(matches!(
            mc.start_motion(Axis::Ra).await,
            Err(DeviceError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_set_goto_target_wire_image() {
        let dev = Arc::new(ScriptedTransport::replies(&["=\r"]));
        let mc = SkyWatcherMc::new(dev.clone());
        mc.set_goto_target(Axis::Ra, 0x123456).await.unwrap();
        assert_eq!(dev.sent_commands(), vec![":S1563412\r"]);
    }

    #[tokio::test]
    async fn test_do_initialize_noop_when_initialized() {
        let dev = Arc::new(ScriptedTransport::replies(&["=101\r"]));
        let mc = SkyWatcherMc::new(dev.clone());
        mc.do_initialize(Axis::Ra, Duration::from_secs(1), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(dev.sent_commands(), vec![":f1\r"]);
    }

    #[tokio::test]
    async fn test_do_initialize_polls_until_ready() {
        let dev = Arc::new(ScriptedTransport::replies(&[
            "=100\r", // status: not initialized
            "=\r",    // F ack
            "=100\r", // still not initialized
            "=101\r", // initialized
        ]));
        let mc = SkyWatcherMc::new(dev.clone());
        mc.do_initialize(Axis::Ra, Duration::from_secs(1), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(
            dev.sent_commands(),
            vec![":f1\r", ":F1\r", ":f1\r", ":f1\r"]
        );
    }
}
