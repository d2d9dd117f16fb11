//! Parsing of RFC 1035 master files.  This is the interchange format: the
//! native configuration format is the structured document in the `document`
//! module, but master files are accepted on input and are always the export
//! format.
//!
//! This implementation does not support `$INCLUDE` entries or non-`IN`
//! record classes.  These raise an error.

use std::iter::Peekable;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::Chars;
use std::str::FromStr;

use crate::protocol::types::*;
use crate::zones::document::parse_duration;
use crate::zones::types::*;

impl Zone {
    /// Parse a string of master-file zone data.
    ///
    /// Entries are of the form:
    ///
    /// ```text
    /// $ORIGIN <domain-name>
    /// $TTL <ttl>
    /// <rr>
    /// ```
    ///
    /// Where `<rr>` has its `<domain-name>`, `<ttl>`, and `<class>` fields
    /// optional (the previous value, the `$TTL` value, and `IN` are used,
    /// respectively), in any of the orders RFC 1035 permits.  `@` stands for
    /// the origin, `;` introduces a comment, `( ... )` groups data across
    /// newlines, and `" ... "` quotes a string.
    pub fn deserialise(data: &str) -> Result<Self, Error> {
        let mut tokeniser = Tokeniser::new(data);

        let mut origin: Option<DomainName> = None;
        let mut default_ttl: Option<u32> = None;
        let mut previous_name: Option<DomainName> = None;
        let mut apex_and_soa: Option<(DomainName, SOA, u32)> = None;
        let mut rrs: Vec<(DomainName, RecordTypeWithData, Option<u32>)> = Vec::new();

        while let Some((leading_ws, tokens)) = tokeniser.next_entry()? {
            match tokens[0].as_str() {
                "$ORIGIN" => {
                    if tokens.len() != 2 {
                        return Err(Error::WrongLen {
                            tokens: tokens.clone(),
                        });
                    }
                    origin = Some(parse_name(origin.as_ref(), &tokens[1])?);
                }
                "$TTL" => {
                    if tokens.len() != 2 {
                        return Err(Error::WrongLen {
                            tokens: tokens.clone(),
                        });
                    }
                    default_ttl =
                        Some(parse_duration(&tokens[1]).ok_or_else(|| Error::BadTtl {
                            token: tokens[1].clone(),
                        })?);
                }
                "$INCLUDE" => {
                    return Err(Error::IncludeNotSupported {
                        path: tokens.get(1).cloned().unwrap_or_default(),
                    });
                }
                _ => {
                    let entry = parse_rr(origin.as_ref(), &previous_name, leading_ws, &tokens)?;
                    previous_name = Some(entry.name.clone());

                    if let RecordTypeWithData::SOA {
                        mname,
                        rname,
                        serial,
                        refresh,
                        retry,
                        expire,
                        minimum,
                    } = entry.rtype_with_data
                    {
                        if apex_and_soa.is_some() {
                            return Err(Error::MultipleSOA);
                        }
                        apex_and_soa = Some((
                            entry.name,
                            SOA {
                                mname,
                                rname,
                                serial,
                                refresh,
                                retry,
                                expire,
                                minimum,
                            },
                            entry.ttl.or(default_ttl).unwrap_or(0),
                        ));
                    } else {
                        rrs.push((entry.name, entry.rtype_with_data, entry.ttl));
                    }
                }
            }
        }

        let Some((apex, soa, _)) = apex_and_soa else {
            return Err(Error::MissingSOA);
        };

        let fallback_ttl = default_ttl.unwrap_or(soa.minimum);
        let mut zone = Zone::new(apex, RecordClass::IN, soa);
        for (name, rtype_with_data, ttl) in rrs {
            zone.insert(&name, rtype_with_data, ttl.unwrap_or(fallback_ttl))?;
        }

        zone.validate()?;
        Ok(zone)
    }
}

struct ParsedRR {
    name: DomainName,
    rtype_with_data: RecordTypeWithData,
    ttl: Option<u32>,
}

fn parse_rr(
    origin: Option<&DomainName>,
    previous_name: &Option<DomainName>,
    leading_ws: bool,
    tokens: &[String],
) -> Result<ParsedRR, Error> {
    let mut index = 0;

    let name = if leading_ws {
        previous_name.clone().ok_or(Error::MissingName)?
    } else {
        let token = &tokens[index];
        index += 1;
        parse_name(origin, token)?
    };

    // the TTL and class may appear in either order, or not at all
    let mut ttl = None;
    let rtype = loop {
        let token = tokens.get(index).ok_or_else(|| Error::WrongLen {
            tokens: tokens.to_vec(),
        })?;
        index += 1;

        if token == "IN" {
            continue;
        } else if token == "CH" || token == "HS" || token == "CS" {
            return Err(Error::UnsupportedClass {
                token: token.clone(),
            });
        } else if let Ok(rtype) = RecordType::from_str(token) {
            break rtype;
        } else if ttl.is_none() {
            if let Some(parsed) = parse_duration(token) {
                ttl = Some(parsed);
                continue;
            }
            return Err(Error::UnknownType {
                token: token.clone(),
            });
        } else {
            return Err(Error::UnknownType {
                token: token.clone(),
            });
        }
    };

    let rdata = &tokens[index..];
    let rtype_with_data = parse_rdata(origin, rtype, rdata)?;

    Ok(ParsedRR {
        name,
        rtype_with_data,
        ttl,
    })
}

fn parse_rdata(
    origin: Option<&DomainName>,
    rtype: RecordType,
    rdata: &[String],
) -> Result<RecordTypeWithData, Error> {
    let bad = || Error::BadRdata {
        rtype,
        tokens: rdata.to_vec(),
    };

    match rtype {
        RecordType::A => {
            let [address] = rdata else { return Err(bad()) };
            Ok(RecordTypeWithData::A {
                address: Ipv4Addr::from_str(address).map_err(|_| bad())?,
            })
        }
        RecordType::AAAA => {
            let [address] = rdata else { return Err(bad()) };
            Ok(RecordTypeWithData::AAAA {
                address: Ipv6Addr::from_str(address).map_err(|_| bad())?,
            })
        }
        RecordType::NS => {
            let [nsdname] = rdata else { return Err(bad()) };
            Ok(RecordTypeWithData::NS {
                nsdname: parse_name(origin, nsdname)?,
            })
        }
        RecordType::CNAME => {
            let [cname] = rdata else { return Err(bad()) };
            Ok(RecordTypeWithData::CNAME {
                cname: parse_name(origin, cname)?,
            })
        }
        RecordType::PTR => {
            let [ptrdname] = rdata else { return Err(bad()) };
            Ok(RecordTypeWithData::PTR {
                ptrdname: parse_name(origin, ptrdname)?,
            })
        }
        RecordType::MX => {
            let [preference, exchange] = rdata else {
                return Err(bad());
            };
            Ok(RecordTypeWithData::MX {
                preference: preference.parse().map_err(|_| bad())?,
                exchange: parse_name(origin, exchange)?,
            })
        }
        RecordType::SOA => {
            let [mname, rname, serial, refresh, retry, expire, minimum] = rdata else {
                return Err(bad());
            };
            Ok(RecordTypeWithData::SOA {
                mname: parse_name(origin, mname)?,
                rname: parse_name(origin, rname)?,
                serial: serial.parse().map_err(|_| bad())?,
                refresh: parse_duration(refresh).ok_or_else(bad)?,
                retry: parse_duration(retry).ok_or_else(bad)?,
                expire: parse_duration(expire).ok_or_else(bad)?,
                minimum: parse_duration(minimum).ok_or_else(bad)?,
            })
        }
        RecordType::TXT => {
            if rdata.is_empty() {
                return Err(bad());
            }
            let mut octets = Vec::new();
            for token in rdata {
                if token.is_empty() {
                    octets.push(0);
                }
                for chunk in token.as_bytes().chunks(255) {
                    octets.push(chunk.len() as u8);
                    octets.extend_from_slice(chunk);
                }
            }
            Ok(RecordTypeWithData::TXT { octets })
        }
        RecordType::SRV => {
            let [priority, weight, port, target] = rdata else {
                return Err(bad());
            };
            Ok(RecordTypeWithData::SRV {
                priority: priority.parse().map_err(|_| bad())?,
                weight: weight.parse().map_err(|_| bad())?,
                port: port.parse().map_err(|_| bad())?,
                target: parse_name(origin, target)?,
            })
        }
        RecordType::OPT | RecordType::Unknown(_) => Err(Error::UnknownType {
            token: rtype.to_string(),
        }),
    }
}

fn parse_name(origin: Option<&DomainName>, token: &str) -> Result<DomainName, Error> {
    let parsed = match origin {
        Some(origin) => DomainName::from_relative_dotted_string(origin, token),
        None => {
            if token.ends_with('.') {
                DomainName::from_dotted_string(token)
            } else {
                // a relative name is meaningless without an origin
                None
            }
        }
    };

    parsed.ok_or_else(|| Error::BadName {
        token: token.to_string(),
    })
}

/// Splits the input into entries: lists of tokens, with comments stripped,
/// quoted strings kept whole, and parenthesised groups continuing across
/// newlines.
struct Tokeniser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Tokeniser<'a> {
    fn new(data: &'a str) -> Self {
        Self {
            chars: data.chars().peekable(),
        }
    }

    /// The next non-empty entry, as `(started with whitespace, tokens)`, or
    /// `None` at the end of the input.
    fn next_entry(&mut self) -> Result<Option<(bool, Vec<String>)>, Error> {
        'entry: loop {
            let mut tokens = Vec::<String>::new();
            let mut current: Option<String> = None;
            let mut parens = 0_usize;
            let mut leading_ws = false;
            let mut at_start = true;

            loop {
                let Some(c) = self.chars.next() else {
                    if parens > 0 {
                        return Err(Error::UnbalancedParens);
                    }
                    flush(&mut tokens, &mut current);
                    return Ok(if tokens.is_empty() {
                        None
                    } else {
                        Some((leading_ws, tokens))
                    });
                };

                match c {
                    ';' => {
                        while self.chars.peek().is_some_and(|n| *n != '\n') {
                            self.chars.next();
                        }
                    }
                    '"' => {
                        flush(&mut tokens, &mut current);
                        tokens.push(self.quoted_string()?);
                        at_start = false;
                    }
                    '(' => {
                        flush(&mut tokens, &mut current);
                        parens += 1;
                        at_start = false;
                    }
                    ')' => {
                        if parens == 0 {
                            return Err(Error::UnbalancedParens);
                        }
                        flush(&mut tokens, &mut current);
                        parens -= 1;
                    }
                    '\n' if parens == 0 => {
                        flush(&mut tokens, &mut current);
                        if tokens.is_empty() {
                            continue 'entry;
                        }
                        return Ok(Some((leading_ws, tokens)));
                    }
                    ' ' | '\t' | '\r' | '\n' => {
                        if at_start {
                            leading_ws = true;
                            at_start = false;
                        }
                        flush(&mut tokens, &mut current);
                    }
                    other => {
                        at_start = false;
                        current.get_or_insert_with(String::new).push(other);
                    }
                }
            }
        }
    }

    fn quoted_string(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(Error::UnbalancedQuotes),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    None => return Err(Error::UnbalancedQuotes),
                    Some(escaped) => out.push(escaped),
                },
                Some(other) => out.push(other),
            }
        }
    }
}

fn flush(tokens: &mut Vec<String>, current: &mut Option<String>) {
    if let Some(token) = current.take() {
        tokens.push(token);
    }
}

/// Errors encountered when parsing a master file.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("'(' and ')' are not balanced")]
    UnbalancedParens,

    #[error("'\"' quotes are not balanced")]
    UnbalancedQuotes,

    #[error("$INCLUDE is not supported (at {path})")]
    IncludeNotSupported { path: String },

    #[error("entry has the wrong number of fields: {tokens:?}")]
    WrongLen { tokens: Vec<String> },

    #[error("the first record must have a domain name")]
    MissingName,

    #[error("'{token}' is not a valid domain name")]
    BadName { token: String },

    #[error("'{token}' is not a valid TTL")]
    BadTtl { token: String },

    #[error("class '{token}' is not supported")]
    UnsupportedClass { token: String },

    #[error("'{token}' is not a supported record type")]
    UnknownType { token: String },

    #[error("invalid {rtype} data: {tokens:?}")]
    BadRdata {
        rtype: RecordType,
        tokens: Vec<String>,
    },

    #[error("a zone needs exactly one SOA record, but found more")]
    MultipleSOA,

    #[error("a zone needs exactly one SOA record, but found none")]
    MissingSOA,

    #[error(transparent)]
    Zone(#[from] ZoneError),
}
