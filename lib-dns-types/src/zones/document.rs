//! The native zone document format: a structured TOML file with `zone`,
//! `soa`, `records`, and optional `dnssec` sections.
//!
//! ```toml
//! [zone]
//! name = "example.com"
//! ttl = "1h"
//!
//! [soa]
//! primary_ns = "ns1.example.com."
//! contact = "hostmaster@example.com"
//! serial = "auto"
//! refresh = "2h"
//! retry = "30m"
//! expire = "2w"
//! negative_ttl = "5m"
//!
//! [records."@"]
//! NS = ["ns1.example.com.", "ns2.example.com."]
//!
//! [records.www]
//! A = ["192.0.2.10", "192.0.2.11"]
//!
//! [records.mail]
//! MX = { preference = 10, exchange = "mx1" }
//! ```
//!
//! Interval fields accept either a bare number of seconds or a duration
//! literal (`45s`, `30m`, `2h`, `1d`, `2w`).  `serial = "auto"` derives
//! `YYYYMMDD00` from the load date.  The contact `user@host` becomes the DNS
//! mailbox `user.host.`.  Relative names are completed with the zone name;
//! RFC 1035 master files are handled by the `deserialise` module instead.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::Utc;
use serde::Deserialize;

use crate::protocol::types::*;
use crate::zones::types::*;

#[derive(Debug, Clone, Deserialize)]
struct ZoneDocument {
    zone: ZoneSection,
    soa: SoaSection,
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, toml::Value>>,
    #[serde(default)]
    dnssec: Option<DnssecConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZoneSection {
    name: String,
    #[serde(default)]
    ttl: Option<toml::Value>,
    #[serde(default)]
    class: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SoaSection {
    primary_ns: String,
    contact: String,
    serial: toml::Value,
    refresh: toml::Value,
    retry: toml::Value,
    expire: toml::Value,
    negative_ttl: toml::Value,
}

/// Default TTL when neither the zone section nor the record gives one.
const DEFAULT_TTL: u32 = 3600;

impl Zone {
    /// Parse a zone from the native document format.
    pub fn from_document(data: &str) -> Result<Self, Error> {
        let document: ZoneDocument = toml::from_str(data)?;

        let origin = DomainName::from_dotted_string(&ensure_trailing_dot(&document.zone.name))
            .ok_or_else(|| Error::BadName {
                name: document.zone.name.clone(),
            })?;

        let class = match document.zone.class.as_deref() {
            None | Some("IN") => RecordClass::IN,
            Some(other) => {
                return Err(Error::UnsupportedClass {
                    class: other.to_string(),
                })
            }
        };

        let default_ttl = match &document.zone.ttl {
            Some(value) => duration_value(value)?,
            None => DEFAULT_TTL,
        };

        let soa = SOA {
            mname: parse_name(&origin, &document.soa.primary_ns)?,
            rname: contact_to_mbox(&origin, &document.soa.contact)?,
            serial: serial_value(&document.soa.serial)?,
            refresh: duration_value(&document.soa.refresh)?,
            retry: duration_value(&document.soa.retry)?,
            expire: duration_value(&document.soa.expire)?,
            minimum: duration_value(&document.soa.negative_ttl)?,
        };

        let mut zone = Zone::new(origin.clone(), class, soa);
        zone.set_dnssec(document.dnssec);

        for (owner_str, types) in &document.records {
            let owner = parse_name(&origin, owner_str)?;
            for (rtype_str, value) in types {
                let rtype = RecordType::from_str(rtype_str).map_err(|()| Error::UnsupportedType {
                    rtype: rtype_str.clone(),
                })?;

                for item in flatten(value) {
                    let rtype_with_data = record_data(&origin, rtype, item)?;
                    zone.insert(&owner, rtype_with_data, default_ttl)?;
                }
            }
        }

        zone.validate()?;
        Ok(zone)
    }
}

/// The serial used for `serial = "auto"`: `YYYYMMDD00` from today's date.
pub fn auto_serial() -> u32 {
    let today = Utc::now().format("%Y%m%d").to_string();
    today.parse::<u32>().map_or(0, |n| n.wrapping_mul(100))
}

fn serial_value(value: &toml::Value) -> Result<u32, Error> {
    match value {
        toml::Value::String(s) if s == "auto" => Ok(auto_serial()),
        toml::Value::Integer(n) => {
            u32::try_from(*n).map_err(|_| Error::BadSerial { value: n.to_string() })
        }
        other => Err(Error::BadSerial {
            value: other.to_string(),
        }),
    }
}

fn duration_value(value: &toml::Value) -> Result<u32, Error> {
    match value {
        toml::Value::Integer(n) => u32::try_from(*n).map_err(|_| Error::BadDuration {
            value: n.to_string(),
        }),
        toml::Value::String(s) => parse_duration(s).ok_or_else(|| Error::BadDuration {
            value: s.clone(),
        }),
        other => Err(Error::BadDuration {
            value: other.to_string(),
        }),
    }
}

/// Parse a duration literal: a bare number of seconds, or a number with an
/// `s`, `m`, `h`, `d`, or `w` suffix.
pub fn parse_duration(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }

    let (digits, multiplier) = match s.as_bytes()[s.len() - 1] {
        b's' | b'S' => (&s[..s.len() - 1], 1),
        b'm' | b'M' => (&s[..s.len() - 1], 60),
        b'h' | b'H' => (&s[..s.len() - 1], 60 * 60),
        b'd' | b'D' => (&s[..s.len() - 1], 60 * 60 * 24),
        b'w' | b'W' => (&s[..s.len() - 1], 60 * 60 * 24 * 7),
        _ => (s, 1),
    };

    digits
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
}

/// `user@host` becomes the DNS mailbox `user.host.`; a value without an `@`
/// is taken as a (possibly relative) domain name directly.
fn contact_to_mbox(origin: &DomainName, contact: &str) -> Result<DomainName, Error> {
    let name = match contact.split_once('@') {
        Some((user, host)) => format!("{user}.{}", ensure_trailing_dot(host)),
        None => contact.to_string(),
    };
    parse_name(origin, &name)
}

fn ensure_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

fn parse_name(origin: &DomainName, s: &str) -> Result<DomainName, Error> {
    DomainName::from_relative_dotted_string(origin, s).ok_or_else(|| Error::BadName {
        name: s.to_string(),
    })
}

/// A record value is either a single value or a list of values.
fn flatten(value: &toml::Value) -> Vec<&toml::Value> {
    match value {
        toml::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn record_data(
    origin: &DomainName,
    rtype: RecordType,
    value: &toml::Value,
) -> Result<RecordTypeWithData, Error> {
    let bad = || Error::BadValue {
        rtype,
        value: value.to_string(),
    };

    match rtype {
        RecordType::A => {
            let s = value.as_str().ok_or_else(bad)?;
            let address = Ipv4Addr::from_str(s).map_err(|_| bad())?;
            Ok(RecordTypeWithData::A { address })
        }
        RecordType::AAAA => {
            let s = value.as_str().ok_or_else(bad)?;
            let address = Ipv6Addr::from_str(s).map_err(|_| bad())?;
            Ok(RecordTypeWithData::AAAA { address })
        }
        RecordType::NS => Ok(RecordTypeWithData::NS {
            nsdname: parse_name(origin, value.as_str().ok_or_else(bad)?)?,
        }),
        RecordType::CNAME => Ok(RecordTypeWithData::CNAME {
            cname: parse_name(origin, value.as_str().ok_or_else(bad)?)?,
        }),
        RecordType::PTR => Ok(RecordTypeWithData::PTR {
            ptrdname: parse_name(origin, value.as_str().ok_or_else(bad)?)?,
        }),
        RecordType::TXT => {
            let s = value.as_str().ok_or_else(bad)?;
            Ok(RecordTypeWithData::TXT {
                octets: txt_octets(s),
            })
        }
        RecordType::MX => match value {
            toml::Value::Table(table) => {
                let preference = table
                    .get("preference")
                    .and_then(toml::Value::as_integer)
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(bad)?;
                let exchange = table
                    .get("exchange")
                    .and_then(toml::Value::as_str)
                    .ok_or_else(bad)?;
                Ok(RecordTypeWithData::MX {
                    preference,
                    exchange: parse_name(origin, exchange)?,
                })
            }
            toml::Value::String(s) => {
                let mut words = s.split_whitespace();
                let preference = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(bad)?;
                let exchange = words.next().ok_or_else(bad)?;
                Ok(RecordTypeWithData::MX {
                    preference,
                    exchange: parse_name(origin, exchange)?,
                })
            }
            _ => Err(bad()),
        },
        RecordType::SRV => match value {
            toml::Value::Table(table) => {
                let field = |name: &str| {
                    table
                        .get(name)
                        .and_then(toml::Value::as_integer)
                        .and_then(|n| u16::try_from(n).ok())
                        .ok_or_else(bad)
                };
                let target = table
                    .get("target")
                    .and_then(toml::Value::as_str)
                    .ok_or_else(bad)?;
                Ok(RecordTypeWithData::SRV {
                    priority: field("priority")?,
                    weight: field("weight")?,
                    port: field("port")?,
                    target: parse_name(origin, target)?,
                })
            }
            toml::Value::String(s) => {
                let words = s.split_whitespace().collect::<Vec<_>>();
                if words.len() != 4 {
                    return Err(bad());
                }
                Ok(RecordTypeWithData::SRV {
                    priority: words[0].parse().map_err(|_| bad())?,
                    weight: words[1].parse().map_err(|_| bad())?,
                    port: words[2].parse().map_err(|_| bad())?,
                    target: parse_name(origin, words[3])?,
                })
            }
            _ => Err(bad()),
        },
        RecordType::SOA | RecordType::OPT | RecordType::Unknown(_) => Err(Error::UnsupportedType {
            rtype: rtype.to_string(),
        }),
    }
}

/// TXT RDATA is one or more length-prefixed character strings, each at most
/// 255 octets.
fn txt_octets(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut octets = Vec::with_capacity(bytes.len() + bytes.len() / 255 + 1);
    for chunk in bytes.chunks(255) {
        octets.push(chunk.len() as u8);
        octets.extend_from_slice(chunk);
    }
    if bytes.is_empty() {
        octets.push(0);
    }
    octets
}

/// Errors encountered parsing a zone document.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("'{name}' is not a valid domain name")]
    BadName { name: String },

    #[error("'{value}' is not a valid duration")]
    BadDuration { value: String },

    #[error("'{value}' is not a valid serial")]
    BadSerial { value: String },

    #[error("record type '{rtype}' is not supported in zone documents")]
    UnsupportedType { rtype: String },

    #[error("class '{class}' is not supported")]
    UnsupportedClass { class: String },

    #[error("'{value}' is not valid {rtype} data")]
    BadValue { rtype: RecordType, value: String },

    #[error(transparent)]
    Zone(#[from] ZoneError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    const DOCUMENT: &str = r#"
[zone]
name = "example.com"
ttl = "1h"

[soa]
primary_ns = "ns1.example.com."
contact = "hostmaster@example.com"
serial = 2024010100
refresh = "2h"
retry = "30m"
expire = "2w"
negative_ttl = 300

[records."@"]
NS = ["ns1.example.com.", "ns2.example.com."]

[records.ns1]
A = "192.0.2.53"

[records.ns2]
A = "192.0.2.54"

[records.www]
A = ["192.0.2.10", "192.0.2.11"]

[records.alias]
CNAME = "www"

[records.mail]
MX = { preference = 10, exchange = "mx1" }

[records.mx1]
A = "192.0.2.25"

[records."*.wild"]
TXT = "wildcard"

[dnssec]
enabled = true
algorithm = "ECDSAP256SHA256"
"#;

    #[test]
    fn parses_a_full_document() {
        let zone = Zone::from_document(DOCUMENT).unwrap();

        assert_eq!(&domain("example.com."), zone.origin());
        assert_eq!(2_024_010_100, zone.soa().serial);
        assert_eq!(7200, zone.soa().refresh);
        assert_eq!(1800, zone.soa().retry);
        assert_eq!(1_209_600, zone.soa().expire);
        assert_eq!(300, zone.soa().minimum);
        assert_eq!(domain("hostmaster.example.com."), zone.soa().rname);
        assert!(zone.dnssec().is_some_and(|d| d.enabled));

        assert_eq!(
            Some(ZoneResult::Answer {
                rrs: vec![ResourceRecord {
                    name: domain("www.example.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: "192.0.2.10".parse().unwrap(),
                    },
                    rclass: RecordClass::IN,
                    ttl: 3600,
                }, ResourceRecord {
                    name: domain("www.example.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: "192.0.2.11".parse().unwrap(),
                    },
                    rclass: RecordClass::IN,
                    ttl: 3600,
                }]
            }),
            zone.resolve(
                &domain("www.example.com."),
                QueryType::Record(RecordType::A)
            )
        );

        // relative names were completed with the origin
        assert_eq!(
            Some(ZoneResult::CNAME {
                cname: domain("www.example.com."),
                rr: ResourceRecord {
                    name: domain("alias.example.com."),
                    rtype_with_data: RecordTypeWithData::CNAME {
                        cname: domain("www.example.com."),
                    },
                    rclass: RecordClass::IN,
                    ttl: 3600,
                },
            }),
            zone.resolve(
                &domain("alias.example.com."),
                QueryType::Record(RecordType::A)
            )
        );

        // and the wildcard expands
        assert!(matches!(
            zone.resolve(
                &domain("x.wild.example.com."),
                QueryType::Record(RecordType::TXT)
            ),
            Some(ZoneResult::Answer { .. })
        ));
    }

    #[test]
    fn auto_serial_is_a_date() {
        let document = DOCUMENT.replace("serial = 2024010100", "serial = \"auto\"");
        let zone = Zone::from_document(&document).unwrap();

        assert_eq!(0, zone.soa().serial % 100);
        assert!(zone.soa().serial >= 2_025_01_01_00);
    }

    #[test]
    fn durations() {
        assert_eq!(Some(45), parse_duration("45"));
        assert_eq!(Some(45), parse_duration("45s"));
        assert_eq!(Some(1800), parse_duration("30m"));
        assert_eq!(Some(7200), parse_duration("2h"));
        assert_eq!(Some(86400), parse_duration("1d"));
        assert_eq!(Some(1_209_600), parse_duration("2w"));
        assert_eq!(None, parse_duration(""));
        assert_eq!(None, parse_duration("h"));
        assert_eq!(None, parse_duration("ten"));
    }

    #[test]
    fn missing_glue_is_rejected() {
        let document = DOCUMENT.replace("[records.ns1]\nA = \"192.0.2.53\"\n\n", "");
        assert!(matches!(
            Zone::from_document(&document),
            Err(Error::Zone(ZoneError::MissingGlue { .. }))
        ));
    }

    #[test]
    fn cname_conflicts_are_rejected() {
        let document = format!("{DOCUMENT}\n[records.both]\nCNAME = \"www\"\nA = \"192.0.2.9\"\n");
        assert!(matches!(
            Zone::from_document(&document),
            Err(Error::Zone(ZoneError::CnameConflict { .. }))
        ));
    }
}
