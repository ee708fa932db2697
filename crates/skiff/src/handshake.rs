//! The one-line negotiation record a plugin prints on stdout at startup.
//!
//! Wire format, pipe-delimited, newline-terminated:
//!
//! ```text
//! core_version|user_version|network|address|protocol|server_cert[|multiplex]
//! ```
//!
//! Fields five onward are optional. The record must be the first bytes the
//! plugin ever writes to stdout, and exactly one record is emitted per
//! process lifetime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkiffError};
use crate::transport::{Endpoint, Network};

/// Version of the plugin system itself. Incremented whenever protocol
/// behavior changes; a mismatch invalidates the plugin outright.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Certificate fields at or below this length are treated as legacy padding
/// rather than a real certificate.
const CERT_FIELD_MIN: usize = 50;

/// The RPC transport a plugin serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Multiplexed request/response over one byte stream.
    RequestResponse,
    /// Streaming multi-service transport (gRPC).
    Streaming,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::RequestResponse
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::RequestResponse => write!(f, "request_response"),
            Protocol::Streaming => write!(f, "streaming"),
        }
    }
}

impl FromStr for Protocol {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request_response" => Ok(Protocol::RequestResponse),
            "streaming" => Ok(Protocol::Streaming),
            other => Err(SkiffError::config(format!("unknown protocol {other:?}"))),
        }
    }
}

/// Parsed form of the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub core_version: u32,
    pub user_version: u32,
    pub endpoint: Endpoint,
    pub protocol: Protocol,
    /// Raw-standard base64 DER of the plugin's leaf certificate, when
    /// auto-mTLS is active.
    pub server_cert: Option<String>,
    /// Whether the plugin confirmed gRPC broker multiplexing.
    pub multiplex: bool,
}

impl HandshakeRecord {
    /// Render the record as the single line the plugin writes to stdout,
    /// including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}|{}|{}|{}|{}|{}",
            self.core_version,
            self.user_version,
            self.endpoint.network,
            self.endpoint.address,
            self.protocol,
            self.server_cert.as_deref().unwrap_or(""),
        );
        if self.multiplex {
            line.push_str("|true");
        }
        line.push('\n');
        line
    }

    /// Parse a handshake line read from the plugin's stdout.
    ///
    /// Accepts four to seven fields. Core/user version compatibility is the
    /// caller's concern; this only rejects records that are structurally
    /// broken.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = trimmed.splitn(7, '|').collect();
        if parts.len() < 4 {
            return Err(SkiffError::HandshakeParse {
                line: trimmed.to_string(),
                reason: format!("expected at least 4 fields, got {}", parts.len()),
            });
        }

        let parse_version = |field: &str, what: &str| -> Result<u32> {
            field.parse::<u32>().map_err(|_| SkiffError::HandshakeParse {
                line: trimmed.to_string(),
                reason: format!("invalid {what} {field:?}"),
            })
        };

        let core_version = parse_version(parts[0], "core version")?;
        let user_version = parse_version(parts[1], "user version")?;

        let network = Network::from_str(parts[2]).map_err(|_| SkiffError::HandshakeParse {
            line: trimmed.to_string(),
            reason: format!("unknown network type {:?}", parts[2]),
        })?;
        let address = parts[3].to_string();
        if address.is_empty() {
            return Err(SkiffError::HandshakeParse {
                line: trimmed.to_string(),
                reason: "empty address".to_string(),
            });
        }

        let protocol = match parts.get(4) {
            Some(p) if !p.is_empty() => {
                Protocol::from_str(p).map_err(|_| SkiffError::HandshakeParse {
                    line: trimmed.to_string(),
                    reason: format!("unknown protocol {p:?}"),
                })?
            }
            _ => Protocol::default(),
        };

        // Short sixth fields are legacy padding, not certificates.
        let server_cert = parts
            .get(5)
            .filter(|c| c.len() > CERT_FIELD_MIN)
            .map(|c| c.to_string());

        let multiplex = parts.get(6).map(|m| *m == "true").unwrap_or(false);

        Ok(HandshakeRecord {
            core_version,
            user_version,
            endpoint: Endpoint { network, address },
            protocol,
            server_cert,
            multiplex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let rec = HandshakeRecord::parse("1|3|tcp|127.0.0.1:1234\n").unwrap();
        assert_eq!(rec.core_version, 1);
        assert_eq!(rec.user_version, 3);
        assert_eq!(rec.endpoint.network, Network::Tcp);
        assert_eq!(rec.endpoint.address, "127.0.0.1:1234");
        assert_eq!(rec.protocol, Protocol::RequestResponse);
        assert!(rec.server_cert.is_none());
        assert!(!rec.multiplex);
    }

    #[test]
    fn test_parse_full() {
        let cert = "A".repeat(400);
        let line = format!("1|2|unix|/tmp/plug/sock|streaming|{cert}|true\n");
        let rec = HandshakeRecord::parse(&line).unwrap();
        assert_eq!(rec.endpoint.network, Network::Unix);
        assert_eq!(rec.protocol, Protocol::Streaming);
        assert_eq!(rec.server_cert.as_deref(), Some(cert.as_str()));
        assert!(rec.multiplex);
    }

    #[test]
    fn test_parse_short_cert_field_ignored() {
        let rec = HandshakeRecord::parse("1|1|tcp|127.0.0.1:1|request_response|padding").unwrap();
        assert!(rec.server_cert.is_none());
    }

    #[test]
    fn test_parse_too_few_fields() {
        let err = HandshakeRecord::parse("1|2|tcp").unwrap_err();
        assert!(matches!(err, SkiffError::HandshakeParse { .. }));
    }

    #[test]
    fn test_parse_bad_versions() {
        assert!(HandshakeRecord::parse("x|1|tcp|:1").is_err());
        assert!(HandshakeRecord::parse("1|x|tcp|:1").is_err());
        assert!(HandshakeRecord::parse("1|-4|tcp|:1").is_err());
    }

    #[test]
    fn test_parse_unknown_network() {
        let err = HandshakeRecord::parse("1|1|carrier-pigeon|addr").unwrap_err();
        match err {
            SkiffError::HandshakeParse { reason, .. } => {
                assert!(reason.contains("unknown network"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip() {
        let rec = HandshakeRecord {
            core_version: CORE_PROTOCOL_VERSION,
            user_version: 7,
            endpoint: Endpoint {
                network: Network::Tcp,
                address: "127.0.0.1:9000".into(),
            },
            protocol: Protocol::Streaming,
            server_cert: Some("B".repeat(100)),
            multiplex: false,
        };
        let line = rec.to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(HandshakeRecord::parse(&line).unwrap(), rec);
    }

    #[test]
    fn test_emitted_line_has_six_fields_without_multiplex() {
        let rec = HandshakeRecord {
            core_version: 1,
            user_version: 1,
            endpoint: Endpoint {
                network: Network::Tcp,
                address: "127.0.0.1:1".into(),
            },
            protocol: Protocol::RequestResponse,
            server_cert: None,
            multiplex: false,
        };
        assert_eq!(rec.to_line().trim_end().split('|').count(), 6);
    }
}
