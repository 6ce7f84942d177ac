use chrono::{DateTime, Datelike, Timelike, Utc};

pub type Hours = f64;
pub type Degrees = f64;

/// Sidereal day length in SI seconds.
pub const SIDEREAL_DAY_SECONDS: f64 = 86_164.090_5;

pub fn modulo(val: f64, base: f64) -> f64 {
    ((val % base) + base) % base
}

pub fn wrap_hours(hours: Hours) -> Hours {
    modulo(hours, 24.)
}

pub fn wrap_deg(deg: Degrees) -> Degrees {
    modulo(deg, 360.)
}

pub fn clamp_dec(deg: Degrees) -> Degrees {
    deg.clamp(-90., 90.)
}

pub fn deg_to_hours(deg: Degrees) -> Hours {
    deg / 15.
}

pub fn hours_to_deg(hours: Hours) -> Degrees {
    hours * 15.
}

pub fn hms_to_hours(h: u32, m: u32, s: u32) -> Hours {
    h as f64 + m as f64 / 60. + s as f64 / 3600.
}

/// Splits hours-of-day into (h, m, s), rounding seconds and carrying
/// 60s -> 1m -> 1h with wraparound at 24h.
pub fn hours_to_hms(hours: Hours) -> (u32, u32, u32) {
    let hours = wrap_hours(hours);
    let mut h = hours as u32;
    let rem = (hours - h as f64) * 60.;
    let mut m = rem as u32;
    let mut s = ((rem - m as f64) * 60.).round() as u32;
    if s == 60 {
        s = 0;
        m += 1;
    }
    if m == 60 {
        m = 0;
        h = (h + 1) % 24;
    }
    (h, m, s)
}

/// Splits degrees into (sign, d, m, s) with the same carry rules as
/// [`hours_to_hms`]; sign is +1 or -1.
pub fn deg_to_dms(deg: Degrees) -> (i32, u32, u32, u32) {
    let (sign, deg) = if deg < 0. { (-1, -deg) } else { (1, deg) };
    let mut d = deg as u32;
    let rem = (deg - d as f64) * 60.;
    let mut m = rem as u32;
    let mut s = ((rem - m as f64) * 60.).round() as u32;
    if s == 60 {
        s = 0;
        m += 1;
    }
    if m == 60 {
        m = 0;
        d += 1;
    }
    (sign, d, m, s)
}

pub fn dms_to_deg(sign: i32, d: u32, m: u32, s: u32) -> Degrees {
    sign as f64 * (d as f64 + m as f64 / 60. + s as f64 / 3600.)
}

/// Julian Date of a UTC instant (Meeus, Gregorian calendar).
pub fn julian_date(t: DateTime<Utc>) -> f64 {
    let mut y = t.year() as i64;
    let mut m = t.month() as i64;
    let d = t.day() as f64;
    let hour = t.hour() as f64
        + t.minute() as f64 / 60.
        + t.second() as f64 / 3600.
        + t.nanosecond() as f64 / 3.6e12;
    if m <= 2 {
        y -= 1;
        m += 12;
    }
    let a = y.div_euclid(100);
    let b = 2 - a + a.div_euclid(4);
    (365.25 * (y + 4716) as f64).floor() + (30.6001 * (m + 1) as f64).floor() + d + b as f64
        - 1524.5
        + hour / 24.
}

/// Greenwich Mean Sidereal Time in degrees (IAU 1982 polynomial).
pub fn gmst_deg(t: DateTime<Utc>) -> Degrees {
    let jd = julian_date(t);
    let du = jd - 2_451_545.0;
    let t_c = du / 36_525.0;
    wrap_deg(
        280.460_618_37 + 360.985_647_366_29 * du + 0.000_387_933 * t_c * t_c
            - t_c * t_c * t_c / 38_710_000.0,
    )
}

/// Local Sidereal Time in hours for an east-positive longitude.
pub fn lst_hours(t: DateTime<Utc>, lon_deg_east: Degrees) -> Hours {
    wrap_hours((gmst_deg(t) + lon_deg_east) / 15.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wrap_hours() {
        assert_eq!(wrap_hours(0.), 0.);
        assert_eq!(wrap_hours(24.), 0.);
        assert_float_absolute_eq!(wrap_hours(-1.5), 22.5, 1E-12);
        assert_float_absolute_eq!(wrap_hours(49.), 1., 1E-12);
        // idempotent
        for h in [-100.3, -24., -0.1, 0., 11.99, 24., 360.5] {
            let once = wrap_hours(h);
            assert!((0. ..24.).contains(&once));
            assert_eq!(wrap_hours(once), once);
        }
    }

    #[test]
    fn test_wrap_deg() {
        assert_eq!(wrap_deg(360.), 0.);
        assert_float_absolute_eq!(wrap_deg(-365.), 355., 1E-12);
        for d in [-720.5, -1., 0., 359.999, 1000.] {
            let once = wrap_deg(d);
            assert!((0. ..360.).contains(&once));
            assert_eq!(wrap_deg(once), once);
        }
    }

    #[test]
    fn test_hms_round_trip() {
        for (h, m, s) in [(0, 0, 0), (12, 0, 0), (23, 59, 59), (5, 30, 15)] {
            let hours = hms_to_hours(h, m, s);
            assert_eq!(hours_to_hms(hours), (h, m, s));
        }
    }

    #[test]
    fn test_hms_carry() {
        // 59.9999... seconds rounds up and carries through minutes and hours
        assert_eq!(hours_to_hms(23. + 59. / 60. + 59.9999 / 3600.), (0, 0, 0));
        assert_eq!(hours_to_hms(1. + 29. / 60. + 59.9999 / 3600.), (1, 30, 0));
    }

    #[test]
    fn test_dms_round_trip() {
        for (sign, d, m, s) in [(1, 0, 0, 0), (1, 45, 30, 0), (-1, 89, 59, 59), (-1, 2, 3, 4)] {
            let deg = dms_to_deg(sign, d, m, s);
            assert_eq!(deg_to_dms(deg), (sign, d, m, s));
        }
    }

    #[test]
    fn test_dms_carry() {
        assert_eq!(deg_to_dms(44. + 59. / 60. + 59.9999 / 3600.), (1, 45, 0, 0));
        assert_eq!(deg_to_dms(-(0. + 0. / 60. + 59.9999 / 3600.)), (-1, 0, 1, 0));
    }

    #[test]
    fn test_julian_date() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(julian_date(t), 2_451_545.0);
        let t = Utc.with_ymd_and_hms(2021, 1, 30, 21, 20, 0).unwrap();
        assert_float_relative_eq!(julian_date(t), 2_459_245.388_888_889, 1E-9);
        let t = Utc.with_ymd_and_hms(1969, 1, 6, 1, 5, 0).unwrap();
        assert_float_relative_eq!(julian_date(t), 2_440_227.545_138_889, 1E-9);
    }

    #[test]
    fn test_gmst() {
        let t = Utc.with_ymd_and_hms(2021, 1, 30, 21, 20, 0).unwrap();
        assert_float_relative_eq!(gmst_deg(t), 90.328_663_39, 1E-6);
        let t = Utc.with_ymd_and_hms(1969, 1, 6, 1, 5, 0).unwrap();
        assert_float_relative_eq!(gmst_deg(t), 121.691_078_69, 1E-6);
    }

    #[test]
    fn test_lst() {
        let t = Utc.with_ymd_and_hms(2021, 1, 30, 21, 20, 0).unwrap();
        assert_float_relative_eq!(lst_hours(t, 90.), 12.021_910_89, 1E-6);
        let t = Utc.with_ymd_and_hms(1969, 1, 6, 1, 5, 0).unwrap();
        assert_float_relative_eq!(lst_hours(t, -55.5), 4.412_738_58, 1E-6);
    }

    #[test]
    fn test_lst_monotonic_and_periodic() {
        let t0 = Utc.with_ymd_and_hms(2023, 6, 1, 3, 0, 0).unwrap();
        let mut prev = lst_hours(t0, 10.);
        for minutes in 1..30 {
            let t = t0 + chrono::Duration::minutes(minutes);
            let lst = lst_hours(t, 10.);
            assert!(wrap_hours(lst - prev) < 0.1);
            assert!(lst != prev);
            prev = lst;
        }
        assert_float_absolute_eq!(lst_hours(t0, 10.), lst_hours(t0, 370.), 1E-9);
    }
}
