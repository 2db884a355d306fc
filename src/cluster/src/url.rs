//! Broker address lists.
//!
//! Addresses are written `amqp:tcp:host:port,tcp:host:port`. The `amqp:`
//! prefix is optional, the protocol defaults to `tcp` and the port to 5672.

use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;

pub const DEFAULT_PORT: u16 = 5672;
const URL_PREFIX: &str = "amqp:";
const PROTOCOLS: &[&str] = &["tcp", "ssl", "rdma"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    addresses: Vec<Address>,
}

impl Url {
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Parse, naming the setting in the error so operators know what to fix
    pub fn parse_for(s: &str, setting: &str) -> Result<Url, AddressError> {
        s.parse::<Url>().map_err(|e| AddressError {
            input: s.to_string(),
            reason: format!("invalid URL for {}: {}", setting, e.reason),
        })
    }
}

impl FromStr for Url {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: String| AddressError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let body = trimmed.strip_prefix(URL_PREFIX).unwrap_or(trimmed);
        if body.is_empty() {
            return Err(fail("empty address list".to_string()));
        }

        let mut addresses = Vec::new();
        for part in body.split(',') {
            let part = part.trim();
            let fields: Vec<&str> = part.split(':').collect();
            let (protocol, host, port) = match fields.as_slice() {
                [host] => ("tcp", *host, None),
                [first, second] if PROTOCOLS.contains(first) => (*first, *second, None),
                [host, port] => ("tcp", *host, Some(*port)),
                [protocol, host, port] => (*protocol, *host, Some(*port)),
                _ => return Err(fail(format!("malformed address '{}'", part))),
            };

            if !PROTOCOLS.contains(&protocol) {
                return Err(fail(format!("unknown protocol '{}'", protocol)));
            }
            if host.is_empty() {
                return Err(fail(format!("missing host in '{}'", part)));
            }
            let port = match port {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| fail(format!("invalid port '{}'", p)))?,
                None => DEFAULT_PORT,
            };

            addresses.push(Address {
                protocol: protocol.to_string(),
                host: host.to_string(),
                port,
            });
        }

        Ok(Url { addresses })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(URL_PREFIX)?;
        for (i, address) in self.addresses.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", address)?;
        }
        Ok(())
    }
}
