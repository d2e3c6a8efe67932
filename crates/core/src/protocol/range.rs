use std::fmt;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Normal play time range (RFC 2326 §3.6, §12.29).
///
/// Only the `npt` unit is interpreted; `smpte`/`clock` ranges parse to an
/// open range so callers can still read a session without a duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Start in seconds. `None` for `now` or an omitted start.
    pub start: Option<f64>,
    /// End in seconds. `None` for open-ended ranges.
    pub end: Option<f64>,
}

impl Range {
    /// `npt=<start>-`.
    pub fn from_start(seconds: f64) -> Self {
        Range {
            start: Some(seconds),
            end: None,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidRange);

        // `npt=0-10;time=19970123T143720Z`
        let value = value.split(';').next().unwrap_or_default().trim();
        let (unit, spec) = value.split_once('=').ok_or_else(invalid)?;
        if !unit.trim().eq_ignore_ascii_case("npt") {
            return Ok(Range {
                start: None,
                end: None,
            });
        }

        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
        Ok(Range {
            start: parse_npt_time(start).map_err(|_| invalid())?,
            end: parse_npt_time(end).map_err(|_| invalid())?,
        })
    }

    /// `end - start` in microseconds, when both ends are known.
    pub fn duration_us(&self) -> Option<i64> {
        let end = self.end?;
        let start = self.start.unwrap_or(0.0);
        (end >= start).then(|| ((end - start) * 1_000_000.0).round() as i64)
    }
}

/// `now`, seconds (`12.5`) or `hh:mm:ss[.frac]`. Empty means absent.
fn parse_npt_time(value: &str) -> std::result::Result<Option<f64>, ()> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("now") {
        return Ok(None);
    }

    if value.contains(':') {
        let mut seconds = 0.0;
        for part in value.split(':') {
            let part: f64 = part.parse().map_err(|_| ())?;
            seconds = seconds * 60.0 + part;
        }
        return Ok(Some(seconds));
    }

    value.parse().map(Some).map_err(|_| ())
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("npt=")?;
        match self.start {
            Some(start) => write!(f, "{:.3}-", start)?,
            None => f.write_str("now-")?,
        }
        if let Some(end) = self.end {
            write!(f, "{:.3}", end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_open_range() {
        let range = Range::parse("npt=0-").unwrap();
        assert_eq!(range.start, Some(0.0));
        assert_eq!(range.end, None);
        assert_eq!(range.duration_us(), None);
    }

    #[test]
    fn parse_bounded_range() {
        let range = Range::parse("npt=0.000-596.48").unwrap();
        assert_eq!(range.duration_us(), Some(596_480_000));
    }

    #[test]
    fn parse_clock_format() {
        let range = Range::parse("npt=00:00:00-00:01:30.5").unwrap();
        assert_eq!(range.duration_us(), Some(90_500_000));
    }

    #[test]
    fn non_npt_units_are_open() {
        let range = Range::parse("clock=19961108T142300Z-19961108T143520Z").unwrap();
        assert_eq!(range.duration_us(), None);
    }

    #[test]
    fn reject_malformed() {
        assert!(Range::parse("npt").is_err());
        assert!(Range::parse("npt=abc-").is_err());
    }

    #[test]
    fn display_start_only() {
        assert_eq!(Range::from_start(12.0).to_string(), "npt=12.000-");
    }
}
