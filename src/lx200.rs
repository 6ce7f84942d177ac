//! LX200 text field formatting and parsing.
//!
//! Field widths are fixed and zero padded: RA `HH:MM:SS`, DEC `sDD*MM:SS`,
//! latitude `sDD*MM`, longitude `sDDD*MM`, date `MM/DD/YY`.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::astro_math::{
    clamp_dec, deg_to_dms, dms_to_deg, hms_to_hours, hours_to_hms, wrap_hours, Degrees, Hours,
};

pub const PREFIX: u8 = b':';
pub const TERMINATOR: u8 = b'#';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    what: &'static str,
    input: String,
}

impl ParseError {
    pub fn new(what: &'static str, input: &str) -> Self {
        ParseError {
            what,
            input: input.to_string(),
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "bad {} {:?}", self.what, self.input)
    }
}

impl Error for ParseError {}

pub fn fmt_ra(hours: Hours) -> String {
    let (h, m, s) = hours_to_hms(hours);
    format!("{:02}:{:02}:{:02}", h, m, s)
}

pub fn fmt_dec(deg: Degrees) -> String {
    let (sign, d, m, s) = deg_to_dms(clamp_dec(deg));
    let pm = if sign >= 0 { '+' } else { '-' };
    format!("{}{:02}*{:02}:{:02}", pm, d, m, s)
}

pub fn fmt_lat(deg: Degrees) -> String {
    let (sign, d, m, _) = deg_to_dms(clamp_dec(deg));
    let pm = if sign >= 0 { '+' } else { '-' };
    format!("{}{:02}*{:02}", pm, d, m)
}

/// East-positive longitude, wrapped to [-180, 180) before formatting.
pub fn fmt_lon(deg_east: Degrees) -> String {
    let wrapped = ((deg_east + 180.).rem_euclid(360.)) - 180.;
    let (sign, d, m, _) = deg_to_dms(wrapped);
    let pm = if sign >= 0 { '+' } else { '-' };
    format!("{}{:03}*{:02}", pm, d, m)
}

/// Parses `HH:MM:SS` into hours in [0, 24).
pub fn parse_ra(s: &str) -> Result<Hours, ParseError> {
    let err = || ParseError::new("RA", s);
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(err());
    }
    let h: u32 = parts[0].parse().map_err(|_| err())?;
    let m: u32 = parts[1].parse().map_err(|_| err())?;
    let sec: u32 = parts[2].parse().map_err(|_| err())?;
    Ok(wrap_hours(hms_to_hours(h, m, sec)))
}

fn split_sign(s: &str) -> (i32, &str) {
    if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else {
        (1, s)
    }
}

/// Parses `sDD*MM:SS` or `sDD*MM` into degrees clamped to [-90, 90].
/// Accepts `°` as an alias for the `*` separator.
pub fn parse_dec(s: &str) -> Result<Degrees, ParseError> {
    let err = || ParseError::new("DEC", s);
    let trimmed = s.trim().replace('°', "*");
    let (sign, rest) = split_sign(&trimmed);
    let (d_str, rest) = rest.split_once('*').ok_or_else(err)?;
    let d: u32 = d_str.parse().map_err(|_| err())?;
    let (m, sec) = match rest.split_once(':') {
        Some((m_str, s_str)) => (
            m_str.parse().map_err(|_| err())?,
            s_str.parse().map_err(|_| err())?,
        ),
        None => (rest.parse().map_err(|_| err())?, 0),
    };
    Ok(clamp_dec(dms_to_deg(sign, d, m, sec)))
}

/// Parses `sDDD*MM` / `sDD*MM` into signed degrees (latitude or longitude).
pub fn parse_signed_deg(s: &str) -> Result<Degrees, ParseError> {
    let err = || ParseError::new("signed degrees", s);
    let trimmed = s.trim().replace('°', "*");
    let (sign, rest) = split_sign(&trimmed);
    let (d_str, m_str) = rest.split_once('*').ok_or_else(err)?;
    let d: u32 = d_str.parse().map_err(|_| err())?;
    let m: u32 = m_str.parse().map_err(|_| err())?;
    Ok(dms_to_deg(sign, d, m, 0))
}

/// Parses `MM/DD/YY`; years below 70 map to 20YY, the rest to 19YY.
pub fn parse_date(s: &str) -> Result<(i32, u32, u32), ParseError> {
    let err = || ParseError::new("date", s);
    let parts: Vec<&str> = s.trim().split('/').collect();
    if parts.len() != 3 {
        return Err(err());
    }
    let m: u32 = parts[0].parse().map_err(|_| err())?;
    let d: u32 = parts[1].parse().map_err(|_| err())?;
    let yy: i32 = parts[2].parse().map_err(|_| err())?;
    let y = if yy < 70 { 2000 + yy } else { 1900 + yy };
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return Err(err());
    }
    Ok((y, m, d))
}

/// Parses `HH:MM:SS` as a local wall-clock time.
pub fn parse_time(s: &str) -> Result<(u32, u32, u32), ParseError> {
    let err = || ParseError::new("time", s);
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(err());
    }
    let h: u32 = parts[0].parse().map_err(|_| err())?;
    let m: u32 = parts[1].parse().map_err(|_| err())?;
    let sec: u32 = parts[2].parse().map_err(|_| err())?;
    if h > 23 || m > 59 || sec > 59 {
        return Err(err());
    }
    Ok((h, m, sec))
}
