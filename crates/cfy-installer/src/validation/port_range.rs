use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::{Error, Result};

const SEPARATOR: char = '-';

/// An inclusive `low-high` port range, e.g. `7010-7110`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.low, self.high)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("port range is not configured".into()));
        }
        let (low, high) = s.split_once(SEPARATOR).ok_or_else(|| {
            Error::Config(format!(
                "invalid port range: {s}. The expected format is <lowest port>-<highest port>, e.g. 7010-7110"
            ))
        })?;
        let parse = |bound: &str| {
            bound
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port range: {s}. {bound:?} is not a port number")))
        };
        let (low, high) = (parse(low)?, parse(high)?);
        if low > high {
            return Err(Error::Config(format!(
                "invalid port range: {s}. The lowest port is above the highest"
            )));
        }
        Ok(Self { low, high })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges() {
        let range: PortRange = "7010-7110".parse().unwrap();
        assert_eq!(range, PortRange { low: 7010, high: 7110 });
        assert_eq!(range.ports().count(), 101);
        assert_eq!(" 7010 - 7010 ".parse::<PortRange>().unwrap().ports().count(), 1);
        assert_eq!(range.to_string(), "7010-7110");
    }

    #[test]
    fn rejects_malformed_ranges() {
        for bad in ["", "   ", "7010", "7010:7110", "abc-7110", "7010-", "7010-70000", "7110-7010", "-1-5"] {
            assert!(
                matches!(bad.parse::<PortRange>(), Err(Error::Config(_))),
                "{bad:?} should not parse"
            );
        }
    }
}
