//! LX200 TCP server: byte framing, command dispatch, response encoding.
//!
//! Each accepted connection gets its own task and its own slew-rate
//! selection; all connections share the mount coordinator, which serializes
//! motion sequences internally.

use std::sync::Arc;

use chrono::{Datelike, Timelike};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::lx200::{self, PREFIX, TERMINATOR};
use crate::mount::{Mount, MoveDirection};

/// Fixed angular rates behind the LX200 rate-select commands.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlewRate {
    Guide,
    Center,
    Find,
    Slew,
}

impl SlewRate {
    pub fn deg_per_sec(self) -> f64 {
        match self {
            SlewRate::Guide => 0.02,
            SlewRate::Center => 0.2,
            SlewRate::Find => 1.0,
            SlewRate::Slew => 4.0,
        }
    }
}

pub async fn serve(listener: TcpListener, mount: Arc<Mount>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        let mount = Arc::clone(&mount);
        tokio::spawn(async move {
            match handle_connection(stream, mount).await {
                Ok(()) => info!(%peer, "client disconnected"),
                Err(e) => debug!(%peer, error = %e, "connection closed"),
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, mount: Arc<Mount>) -> std::io::Result<()> {
    let mut session = Session::new(mount);
    let mut framer = Framer::default();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for &byte in &buf[..n] {
            if let Some(cmd) = framer.push(byte) {
                if let Some(reply) = session.dispatch(&cmd).await {
                    stream.write_all(reply.as_bytes()).await?;
                }
            }
        }
    }
}

/// Longest legal command body is `SC MM/DD/YY`-sized; anything past this is
/// a runaway frame.
const MAX_FRAME_LEN: usize = 32;

/// Accumulates `:CMD[arg]#` frames. Bytes outside a frame are dropped
/// without a response; a `:` mid-frame restarts the frame; an unterminated
/// frame is discarded once it exceeds [`MAX_FRAME_LEN`].
#[derive(Default)]
struct Framer {
    buf: Vec<u8>,
    in_command: bool,
}

impl Framer {
    fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            PREFIX => {
                self.buf.clear();
                self.in_command = true;
                None
            }
            TERMINATOR if self.in_command => {
                self.in_command = false;
                let cmd = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(cmd)
            }
            _ if self.in_command => {
                if self.buf.len() >= MAX_FRAME_LEN {
                    self.buf.clear();
                    self.in_command = false;
                } else {
                    self.buf.push(byte);
                }
                None
            }
            _ => None,
        }
    }
}

struct Session {
    mount: Arc<Mount>,
    slew_rate: SlewRate,
}

impl Session {
    fn new(mount: Arc<Mount>) -> Self {
        Session {
            mount,
            slew_rate: SlewRate::Slew,
        }
    }

    /// One framed command in, one response out. `None` means the command
    /// produces no bytes at all; the unknown-command fallback is a bare `#`.
    async fn dispatch(&mut self, cmd: &str) -> Option<String> {
        debug!(cmd, "dispatch");
        let reply = match cmd {
            "GR" => format!("{}#", lx200::fmt_ra(self.mount.get_ra_dec().await.0)),
            "GD" => format!("{}#", lx200::fmt_dec(self.mount.get_ra_dec().await.1)),
            "GC" => {
                let local = self.mount.site_snapshot().await.now_local();
                format!(
                    "{:02}/{:02}/{:02}#",
                    local.month(),
                    local.day(),
                    local.year().rem_euclid(100)
                )
            }
            "GL" => {
                let local = self.mount.site_snapshot().await.now_local();
                format!(
                    "{:02}:{:02}:{:02}#",
                    local.hour(),
                    local.minute(),
                    local.second()
                )
            }
            "Gt" => format!("{}#", lx200::fmt_lat(self.mount.site_snapshot().await.lat_deg)),
            "Gg" => format!(
                "{}#",
                lx200::fmt_lon(self.mount.site_snapshot().await.lon_deg_east)
            ),
            "MS" => {
                // "0" is the slew-accepted convention; an unset target also
                // answers "0" and is diagnosed through the log
                match self.mount.goto_target().await {
                    Ok(outcome) => debug!(?outcome, "goto finished"),
                    Err(e) => warn!(error = %e, "goto refused; set target RA/DEC first"),
                }
                "0#".to_string()
            }
            "CM" => match self.mount.sync_to_target().await {
                Ok(()) => "1#".to_string(),
                Err(e) => {
                    warn!(error = %e, "sync refused; set target RA/DEC first");
                    "0#".to_string()
                }
            },
            "Q" => {
                self.mount.abort().await;
                "1#".to_string()
            }
            "RG" => self.select_rate(SlewRate::Guide),
            "RC" => self.select_rate(SlewRate::Center),
            "RM" => self.select_rate(SlewRate::Find),
            "RS" => self.select_rate(SlewRate::Slew),
            "Mn" => self.move_cmd(MoveDirection::North, true).await,
            "Ms" => self.move_cmd(MoveDirection::South, true).await,
            "Me" => self.move_cmd(MoveDirection::East, true).await,
            "Mw" => self.move_cmd(MoveDirection::West, true).await,
            "Qn" => self.move_cmd(MoveDirection::North, false).await,
            "Qs" => self.move_cmd(MoveDirection::South, false).await,
            "Qe" => self.move_cmd(MoveDirection::East, false).await,
            "Qw" => self.move_cmd(MoveDirection::West, false).await,
            _ => self.dispatch_with_arg(cmd).await,
        };
        Some(reply)
    }

    async fn dispatch_with_arg(&self, cmd: &str) -> String {
        if let Some(arg) = cmd.strip_prefix("Sr") {
            return accepted(match lx200::parse_ra(arg) {
                Ok(ra) => {
                    self.mount.set_target_ra(ra).await;
                    true
                }
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("Sd") {
            return accepted(match lx200::parse_dec(arg) {
                Ok(dec) => {
                    self.mount.set_target_dec(dec).await;
                    true
                }
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("SC") {
            return accepted(match lx200::parse_date(arg) {
                Ok((y, m, d)) => self.mount.set_local_date(y, m, d).await,
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("SL") {
            return accepted(match lx200::parse_time(arg) {
                Ok((h, m, s)) => self.mount.set_local_time(h, m, s).await,
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("SG") {
            return accepted(match lx200::parse_signed_deg(arg) {
                Ok(lon) => {
                    self.mount.set_longitude(lon).await;
                    true
                }
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("St") {
            return accepted(match lx200::parse_signed_deg(arg) {
                Ok(lat) => {
                    self.mount.set_latitude(lat).await;
                    true
                }
                Err(e) => reject(e),
            });
        }
        if let Some(arg) = cmd.strip_prefix("XAC") {
            return accepted(match arg.trim().parse::<f64>() {
                Ok(accel) => {
                    self.mount.set_dec_accel(accel).await;
                    true
                }
                Err(_) => {
                    warn!(arg, "bad accel argument");
                    false
                }
            });
        }
        if let Some(arg) = cmd.strip_prefix("XVM") {
            return accepted(match arg.trim().parse::<f64>() {
                Ok(rate) => {
                    self.mount.set_dec_max_rate(rate).await;
                    true
                }
                Err(_) => {
                    warn!(arg, "bad max-rate argument");
                    false
                }
            });
        }
        debug!(cmd, "unknown command");
        "#".to_string()
    }

    fn select_rate(&mut self, rate: SlewRate) -> String {
        self.slew_rate = rate;
        "1#".to_string()
    }

    async fn move_cmd(&self, direction: MoveDirection, start: bool) -> String {
        accepted(
            self.mount
                .move_axis(direction, start, self.slew_rate.deg_per_sec())
                .await,
        )
    }
}

fn accepted(ok: bool) -> String {
    if ok { "1#" } else { "0#" }.to_string()
}

fn reject(e: lx200::ParseError) -> bool {
    warn!(error = %e, "bad command argument");
    false
}
