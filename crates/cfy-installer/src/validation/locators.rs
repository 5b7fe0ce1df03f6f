use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Port the lookup service listens on when a locator names none.
pub const DEFAULT_LOOKUP_PORT: u16 = 4174;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupLocator {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for LookupLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `host[:port][,host[:port]...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupLocators(pub Vec<LookupLocator>);

impl FromStr for LookupLocators {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut locators = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::Config(format!("invalid lookup locator {entry}: bad port"))
                    })?;
                    (host, port)
                }
                None => (entry, DEFAULT_LOOKUP_PORT),
            };
            if host.is_empty() {
                return Err(Error::Config(format!("invalid lookup locator {entry}: no host")));
            }
            locators.push(LookupLocator {
                host: host.to_string(),
                port,
            });
        }
        if locators.is_empty() {
            return Err(Error::Config("no lookup locators configured".into()));
        }
        Ok(Self(locators))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_locators() {
        let locators: LookupLocators = "10.0.0.1:4166, 10.0.0.2".parse().unwrap();
        assert_eq!(
            locators.0,
            vec![
                LookupLocator { host: "10.0.0.1".into(), port: 4166 },
                LookupLocator { host: "10.0.0.2".into(), port: DEFAULT_LOOKUP_PORT },
            ]
        );
        assert_eq!(locators.0[1].to_string(), "10.0.0.2:4174");
    }

    #[test]
    fn rejects_bad_locators() {
        for bad in ["", " , ", "10.0.0.1:http", ":4174"] {
            assert!(bad.parse::<LookupLocators>().is_err(), "{bad:?}");
        }
    }
}
