//! Line-oriented wire protocol spoken between the daemon and its clients.
//!
//! Every message is one UTF-8 line of space-separated tokens terminated by
//! `\n`. The first token of a request names the command; the remaining tokens
//! are `key=value` pairs.
//!
//! | Request                                    | Reply                                     |
//! |--------------------------------------------|-------------------------------------------|
//! | `ADMIT kind=<anon\|user>`                   | `OK\|REJECT limit=N inflight=N degraded=D` |
//! | `COMPLETE rtt_ms=N status=N [sample=0\|1]`  | `OK`                                      |
//! | `STATS`                                    | `limit=N inflight=N degraded=D`           |
//! | anything else                              | `ERR unknown`                             |

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ShedderError};
use crate::limiter::{Decision, LimiterStats};

/// Reply sent for any request the daemon cannot interpret.
pub const ERR_UNKNOWN: &str = "ERR unknown\n";
/// Acknowledgement for COMPLETE.
pub const ACK: &str = "OK\n";

/// Who is asking for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Anon,
    User,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Anon => "anon",
            RequestKind::User => "user",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ShedderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anon" => Ok(RequestKind::Anon),
            "user" => Ok(RequestKind::User),
            other => Err(ShedderError::Protocol(format!("unknown kind {:?}", other))),
        }
    }
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Admit {
        kind: RequestKind,
    },
    Complete {
        rtt_ms: f64,
        status: Option<u16>,
        sample: bool,
    },
    Stats,
}

impl Command {
    /// Parse one request line (without its terminator).
    ///
    /// Missing optional fields take their defaults: `kind=anon`, `rtt_ms=0`,
    /// `sample=1`. Fields that are present but malformed make the whole line
    /// invalid.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next().unwrap_or_default();
        let params = Params::new(tokens);

        match command {
            "ADMIT" => {
                let kind = match params.get("kind") {
                    Some(kind) => kind.parse()?,
                    None => RequestKind::Anon,
                };
                Ok(Command::Admit { kind })
            }
            "COMPLETE" => {
                let rtt_ms = params.parse::<f64>("rtt_ms")?.unwrap_or(0.0);
                if !rtt_ms.is_finite() || rtt_ms < 0.0 {
                    return Err(ShedderError::Protocol(format!("invalid rtt_ms {}", rtt_ms)));
                }
                let status = params.parse::<u16>("status")?;
                let sample = params.parse_flag("sample")?.unwrap_or(true);
                Ok(Command::Complete {
                    rtt_ms,
                    status,
                    sample,
                })
            }
            "STATS" => Ok(Command::Stats),
            other => Err(ShedderError::Protocol(format!("unknown command {:?}", other))),
        }
    }

    /// Render the command as a request line, terminator included.
    pub fn encode(&self) -> String {
        match self {
            Command::Admit { kind } => format!("ADMIT kind={}\n", kind),
            Command::Complete {
                rtt_ms,
                status,
                sample,
            } => {
                let mut line = format!("COMPLETE rtt_ms={}", rtt_ms.round() as u64);
                if let Some(status) = status {
                    line.push_str(&format!(" status={}", status));
                }
                if !sample {
                    line.push_str(" sample=0");
                }
                line.push('\n');
                line
            }
            Command::Stats => "STATS\n".to_string(),
        }
    }
}

/// Render the reply to an ADMIT.
pub fn encode_decision(decision: &Decision) -> String {
    let status = if decision.admitted { "OK" } else { "REJECT" };
    format!(
        "{} limit={} inflight={} degraded={}\n",
        status,
        decision.limit,
        decision.inflight,
        u8::from(decision.degraded)
    )
}

/// Render the reply to a STATS.
pub fn encode_stats(stats: &LimiterStats) -> String {
    format!(
        "limit={} inflight={} degraded={}\n",
        stats.limit,
        stats.inflight,
        u8::from(stats.degraded)
    )
}

/// An ADMIT reply as seen by a client. Numeric fields the daemon omitted are
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitReply {
    pub admitted: bool,
    pub limit: Option<u32>,
    pub inflight: Option<u32>,
    pub degraded: bool,
}

/// Parse an ADMIT reply line. Anything other than `OK`/`REJECT` is an error.
pub fn parse_admit_reply(line: &str) -> Result<AdmitReply> {
    let mut tokens = line.split_whitespace();
    let admitted = match tokens.next() {
        Some("OK") => true,
        Some("REJECT") => false,
        other => {
            return Err(ShedderError::Protocol(format!(
                "unexpected admit reply {:?}",
                other.unwrap_or_default()
            )))
        }
    };
    let params = Params::new(tokens);

    Ok(AdmitReply {
        admitted,
        limit: params.parse("limit")?,
        inflight: params.parse("inflight")?,
        degraded: params.parse_flag("degraded")?.unwrap_or(false),
    })
}

/// Parse a STATS reply line. All three fields are required.
pub fn parse_stats_reply(line: &str) -> Result<LimiterStats> {
    let params = Params::new(line.split_whitespace());
    let required = |key: &str| -> Result<u32> {
        params
            .parse(key)?
            .ok_or_else(|| ShedderError::Protocol(format!("stats reply missing {}", key)))
    };

    Ok(LimiterStats {
        limit: required("limit")?,
        inflight: required("inflight")?,
        degraded: params
            .parse_flag("degraded")?
            .ok_or_else(|| ShedderError::Protocol("stats reply missing degraded".into()))?,
    })
}

/// The `key=value` tokens of a line. Tokens without `=` are ignored; the
/// first occurrence of a key wins.
struct Params<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Params<'a> {
    fn new(tokens: impl Iterator<Item = &'a str>) -> Self {
        Self {
            pairs: tokens.filter_map(|token| token.split_once('=')).collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ShedderError::Protocol(format!("invalid {} {:?}", key, raw))),
        }
    }

    fn parse_flag(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("0") => Ok(Some(false)),
            Some("1") => Ok(Some(true)),
            Some(raw) => Err(ShedderError::Protocol(format!("invalid {} {:?}", key, raw))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admit() {
        assert_eq!(
            Command::parse("ADMIT kind=anon").unwrap(),
            Command::Admit {
                kind: RequestKind::Anon
            }
        );
        assert_eq!(
            Command::parse("ADMIT kind=user").unwrap(),
            Command::Admit {
                kind: RequestKind::User
            }
        );
        assert_eq!(
            Command::parse("ADMIT").unwrap(),
            Command::Admit {
                kind: RequestKind::Anon
            }
        );
        assert!(Command::parse("ADMIT kind=robot").is_err());
    }

    #[test]
    fn test_parse_complete() {
        assert_eq!(
            Command::parse("COMPLETE rtt_ms=120 status=200").unwrap(),
            Command::Complete {
                rtt_ms: 120.0,
                status: Some(200),
                sample: true
            }
        );
        assert_eq!(
            Command::parse("COMPLETE status=503 rtt_ms=7.5 sample=0").unwrap(),
            Command::Complete {
                rtt_ms: 7.5,
                status: Some(503),
                sample: false
            }
        );
    }

    #[test]
    fn test_parse_complete_defaults_missing_rtt() {
        assert_eq!(
            Command::parse("COMPLETE").unwrap(),
            Command::Complete {
                rtt_ms: 0.0,
                status: None,
                sample: true
            }
        );
    }

    #[test]
    fn test_parse_complete_rejects_garbage_values() {
        assert!(Command::parse("COMPLETE rtt_ms=fast").is_err());
        assert!(Command::parse("COMPLETE rtt_ms=-4").is_err());
        assert!(Command::parse("COMPLETE rtt_ms=NaN").is_err());
        assert!(Command::parse("COMPLETE rtt_ms=5 sample=yes").is_err());
    }

    #[test]
    fn test_parse_unknown() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("admit kind=anon").is_err());
        assert!(Command::parse("PING").is_err());
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        assert_eq!(Command::parse("  STATS  ").unwrap(), Command::Stats);
        assert_eq!(
            Command::parse("ADMIT   kind=user  stray").unwrap(),
            Command::Admit {
                kind: RequestKind::User
            }
        );
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(
            Command::Admit {
                kind: RequestKind::User
            }
            .encode(),
            "ADMIT kind=user\n"
        );
        assert_eq!(
            Command::Complete {
                rtt_ms: 41.6,
                status: Some(200),
                sample: true
            }
            .encode(),
            "COMPLETE rtt_ms=42 status=200\n"
        );
        assert_eq!(
            Command::Complete {
                rtt_ms: 10.0,
                status: Some(200),
                sample: false
            }
            .encode(),
            "COMPLETE rtt_ms=10 status=200 sample=0\n"
        );
        assert_eq!(Command::Stats.encode(), "STATS\n");
    }

    #[test]
    fn test_encode_replies() {
        let decision = Decision {
            admitted: false,
            limit: 2,
            inflight: 2,
            degraded: true,
        };
        assert_eq!(
            encode_decision(&decision),
            "REJECT limit=2 inflight=2 degraded=1\n"
        );

        let stats = LimiterStats {
            limit: 4,
            inflight: 0,
            degraded: false,
        };
        assert_eq!(encode_stats(&stats), "limit=4 inflight=0 degraded=0\n");
    }

    #[test]
    fn test_parse_admit_reply() {
        let reply = parse_admit_reply("OK limit=4 inflight=1 degraded=0").unwrap();
        assert_eq!(
            reply,
            AdmitReply {
                admitted: true,
                limit: Some(4),
                inflight: Some(1),
                degraded: false
            }
        );

        let reply = parse_admit_reply("REJECT limit=2 inflight=2 degraded=1").unwrap();
        assert!(!reply.admitted);
        assert!(reply.degraded);
    }

    #[test]
    fn test_parse_admit_reply_with_omitted_fields() {
        let reply = parse_admit_reply("OK").unwrap();
        assert_eq!(reply.limit, None);
        assert_eq!(reply.inflight, None);
        assert!(!reply.degraded);
    }

    #[test]
    fn test_parse_admit_reply_rejects_errors() {
        assert!(parse_admit_reply("ERR unknown").is_err());
        assert!(parse_admit_reply("").is_err());
        assert!(parse_admit_reply("OK limit=lots").is_err());
    }

    #[test]
    fn test_parse_stats_reply() {
        let stats = parse_stats_reply("limit=3 inflight=1 degraded=1").unwrap();
        assert_eq!(
            stats,
            LimiterStats {
                limit: 3,
                inflight: 1,
                degraded: true
            }
        );
        assert!(parse_stats_reply("limit=3 inflight=1").is_err());
    }

    #[test]
    fn test_decision_survives_the_wire() {
        let decision = Decision {
            admitted: true,
            limit: 7,
            inflight: 3,
            degraded: true,
        };
        let reply = parse_admit_reply(encode_decision(&decision).trim_end()).unwrap();
        assert_eq!(reply.admitted, decision.admitted);
        assert_eq!(reply.limit, Some(decision.limit));
        assert_eq!(reply.inflight, Some(decision.inflight));
        assert_eq!(reply.degraded, decision.degraded);
    }
}
