//! EDNS(0) support: the OPT pseudo-record, its options, and the 12-bit
//! extended response codes.  See RFC 6891, and RFC 7873 for the COOKIE
//! option.
//!
//! The OPT record reuses the class field for the requestor's UDP payload
//! size and the TTL field for the extended rcode, version, and flags, so
//! this module interprets those fields rather than adding them to the
//! `ResourceRecord` type.

use crate::protocol::types::*;

/// The COOKIE option code (RFC 7873).
pub const OPTION_CODE_COOKIE: u16 = 10;

/// The advertised UDP payload size when we build our own OPT records.
pub const DEFAULT_UDP_PAYLOAD_SIZE: u16 = 4096;

/// The EDNS version this implementation speaks.
pub const EDNS_VERSION: u8 = 0;

/// The decoded form of an OPT record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Edns {
    pub udp_payload_size: u16,
    /// The upper 8 bits of the 12-bit extended rcode.
    pub extended_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    pub options: Vec<EdnsOption>,
}

impl Default for Edns {
    fn default() -> Self {
        Self {
            udp_payload_size: DEFAULT_UDP_PAYLOAD_SIZE,
            extended_rcode: 0,
            version: EDNS_VERSION,
            dnssec_ok: false,
            options: Vec::new(),
        }
    }
}

impl Edns {
    /// Decode an OPT resource record.  Returns `None` if the record is not
    /// an OPT record or its options do not fit their length prefixes.
    pub fn from_rr(rr: &ResourceRecord) -> Option<Self> {
        let RecordTypeWithData::OPT { octets } = &rr.rtype_with_data else {
            return None;
        };

        let mut options = Vec::new();
        let mut position = 0;
        while position < octets.len() {
            if position + 4 > octets.len() {
                return None;
            }
            let code = u16::from_be_bytes([octets[position], octets[position + 1]]);
            let len = usize::from(u16::from_be_bytes([octets[position + 2], octets[position + 3]]));
            position += 4;
            if position + len > octets.len() {
                return None;
            }
            options.push(EdnsOption::decode(code, &octets[position..position + len]));
            position += len;
        }

        let [extended_rcode, version, flags_hi, _] = rr.ttl.to_be_bytes();
        Some(Self {
            udp_payload_size: u16::from(rr.rclass),
            extended_rcode,
            version,
            dnssec_ok: flags_hi & 0b1000_0000 != 0,
            options,
        })
    }

    pub fn to_rr(&self) -> ResourceRecord {
        let mut octets = Vec::new();
        for option in &self.options {
            option.encode(&mut octets);
        }

        let flags_hi = if self.dnssec_ok { 0b1000_0000 } else { 0 };
        ResourceRecord {
            name: DomainName::root_domain(),
            rtype_with_data: RecordTypeWithData::OPT { octets },
            rclass: RecordClass::from(self.udp_payload_size),
            ttl: u32::from_be_bytes([self.extended_rcode, self.version, flags_hi, 0]),
        }
    }

    pub fn cookie(&self) -> Option<&CookieOption> {
        self.options.iter().find_map(|option| match option {
            EdnsOption::Cookie(cookie) => Some(cookie),
            EdnsOption::Unknown { .. } => None,
        })
    }

    /// Replace any existing cookie option, or add one.
    pub fn set_cookie(&mut self, cookie: CookieOption) {
        self.options
            .retain(|option| !matches!(option, EdnsOption::Cookie(_)));
        self.options.push(EdnsOption::Cookie(cookie));
    }
}

/// A single EDNS option.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EdnsOption {
    Cookie(CookieOption),
    Unknown { code: u16, octets: Vec<u8> },
}

impl EdnsOption {
    fn decode(code: u16, data: &[u8]) -> Self {
        if code == OPTION_CODE_COOKIE {
            if let Some(cookie) = CookieOption::from_octets(data) {
                return EdnsOption::Cookie(cookie);
            }
        }
        EdnsOption::Unknown {
            code,
            octets: data.to_vec(),
        }
    }

    fn encode(&self, octets: &mut Vec<u8>) {
        match self {
            EdnsOption::Cookie(cookie) => {
                let data = cookie.to_octets();
                octets.extend_from_slice(&OPTION_CODE_COOKIE.to_be_bytes());
                octets.extend_from_slice(&u16::try_from(data.len()).unwrap_or(0).to_be_bytes());
                octets.extend_from_slice(&data);
            }
            EdnsOption::Unknown { code, octets: os } => {
                octets.extend_from_slice(&code.to_be_bytes());
                octets.extend_from_slice(&u16::try_from(os.len()).unwrap_or(0).to_be_bytes());
                octets.extend_from_slice(os);
            }
        }
    }
}

/// A COOKIE option: an 8-octet client cookie, optionally followed by an
/// 8-to-32-octet server cookie.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CookieOption {
    pub client: [u8; 8],
    pub server: Option<Vec<u8>>,
}

impl CookieOption {
    /// Decode the option data.  A well-formed cookie is exactly 8 octets
    /// (client only) or 16 to 40 octets (client + server).
    pub fn from_octets(data: &[u8]) -> Option<Self> {
        let client = data.get(..8)?.try_into().ok()?;
        match data.len() {
            8 => Some(Self {
                client,
                server: None,
            }),
            16..=40 => Some(Self {
                client,
                server: Some(data[8..].to_vec()),
            }),
            _ => None,
        }
    }

    pub fn to_octets(&self) -> Vec<u8> {
        let mut octets = Vec::with_capacity(40);
        octets.extend_from_slice(&self.client);
        if let Some(server) = &self.server {
            octets.extend_from_slice(server);
        }
        octets
    }
}

/// The full 12-bit response code, combining the header's low four bits with
/// the OPT record's high eight.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExtendedRcode {
    Plain(Rcode),
    /// The responder does not implement the EDNS version of the request.
    BadVersion,
    /// A server cookie failed validation (RFC 7873).
    BadCookie,
    Other(u16),
}

impl From<u16> for ExtendedRcode {
    fn from(value: u16) -> Self {
        match value {
            v if v < 16 => ExtendedRcode::Plain(Rcode::from(v as u8)),
            16 => ExtendedRcode::BadVersion,
            23 => ExtendedRcode::BadCookie,
            other => ExtendedRcode::Other(other),
        }
    }
}

impl From<ExtendedRcode> for u16 {
    fn from(value: ExtendedRcode) -> Self {
        match value {
            ExtendedRcode::Plain(rcode) => u16::from(u8::from(rcode)),
            ExtendedRcode::BadVersion => 16,
            ExtendedRcode::BadCookie => 23,
            ExtendedRcode::Other(other) => other,
        }
    }
}

impl Message {
    /// The decoded OPT record from the additional section, if there is one.
    pub fn edns(&self) -> Option<Edns> {
        self.additional.iter().find_map(Edns::from_rr)
    }

    /// Replace the message's OPT record (or add one).
    pub fn set_edns(&mut self, edns: &Edns) {
        self.additional
            .retain(|rr| rr.rtype_with_data.rtype() != RecordType::OPT);
        self.additional.push(edns.to_rr());
    }

    pub fn extended_rcode(&self) -> ExtendedRcode {
        let low = u16::from(u8::from(self.header.rcode));
        let high = self
            .edns()
            .map_or(0, |edns| u16::from(edns.extended_rcode));
        ExtendedRcode::from((high << 4) | low)
    }

    /// Set the full response code: the low four bits go in the header, and
    /// the high bits go in the OPT record.  An OPT record is only created if
    /// the high bits are nonzero and one is not already present.
    pub fn set_extended_rcode(&mut self, rcode: ExtendedRcode) {
        let value = u16::from(rcode);
        self.header.rcode = Rcode::from((value & 0b1111) as u8);

        let high = ((value >> 4) & 0xFF) as u8;
        if high != 0 || self.edns().is_some() {
            let mut edns = self.edns().unwrap_or_default();
            edns.extended_rcode = high;
            self.set_edns(&edns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_option_lengths() {
        assert_eq!(None, CookieOption::from_octets(&[0; 7]));
        assert_eq!(None, CookieOption::from_octets(&[0; 12]));
        assert_eq!(None, CookieOption::from_octets(&[0; 41]));

        let client_only = CookieOption::from_octets(&[1; 8]).unwrap();
        assert_eq!([1; 8], client_only.client);
        assert_eq!(None, client_only.server);

        let full = CookieOption::from_octets(&[2; 16]).unwrap();
        assert_eq!([2; 8], full.client);
        assert_eq!(Some(vec![2; 8]), full.server);
    }

    #[test]
    fn edns_roundtrips_through_rr() {
        let mut edns = Edns::default();
        edns.dnssec_ok = true;
        edns.set_cookie(CookieOption {
            client: [7; 8],
            server: Some(vec![9; 8]),
        });
        edns.options.push(EdnsOption::Unknown {
            code: 999,
            octets: vec![1, 2, 3],
        });

        let rr = edns.to_rr();
        assert_eq!(RecordType::OPT, rr.rtype_with_data.rtype());
        assert_eq!(DomainName::root_domain(), rr.name);
        assert_eq!(Some(edns), Edns::from_rr(&rr));
    }

    #[test]
    fn truncated_options_are_rejected() {
        let rr = ResourceRecord {
            name: DomainName::root_domain(),
            rtype_with_data: RecordTypeWithData::OPT {
                octets: vec![0, 10, 0, 8, 1, 2, 3], // length 8, 3 octets follow
            },
            rclass: RecordClass::from(4096),
            ttl: 0,
        };
        assert_eq!(None, Edns::from_rr(&rr));
    }

    #[test]
    fn extended_rcode_splits_across_header_and_opt() {
        let question = Question {
            name: DomainName::root_domain(),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let mut response = Message::from_question(1, question).make_response();

        response.set_extended_rcode(ExtendedRcode::BadCookie);

        assert_eq!(Rcode::from(7), response.header.rcode);
        assert_eq!(1, response.edns().unwrap().extended_rcode);
        assert_eq!(ExtendedRcode::BadCookie, response.extended_rcode());
    }

    #[test]
    fn plain_rcode_does_not_grow_an_opt() {
        let question = Question {
            name: DomainName::root_domain(),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let mut response = Message::from_question(1, question).make_response();

        response.set_extended_rcode(ExtendedRcode::Plain(Rcode::Refused));

        assert_eq!(Rcode::Refused, response.header.rcode);
        assert_eq!(None, response.edns());
    }
}
