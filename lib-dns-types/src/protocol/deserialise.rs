//! Deserialisation of DNS messages from the network.  See the `types` module
//! for details of the format.
//!
//! The input is attacker-controlled, so decoding enforces hard bounds
//! throughout: label and name lengths, per-section record counts, RDATA
//! sizes, and - for compression pointers - a strictly-backwards rule plus a
//! visited-offset set plus a chain depth cap.  The backwards rule alone is
//! not enough: a chain of distinct backward pointers can still burn CPU, so
//! both the set and the depth cap are load-bearing.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// Like `from_octets`, but also reports parser telemetry: how much of the
    /// buffer was consumed and how many compression pointers were chased.
    pub fn from_octets_with_stats(octets: &[u8]) -> Result<(Self, ParseStats), Error> {
        let mut buffer = ConsumableBuffer::new(octets);
        let message = Self::deserialise(&mut buffer)?;
        Ok((message, buffer.stats()))
    }

    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        if buffer.octets.len() > MESSAGE_MAX_LEN {
            let id = WireHeader::peek_id(buffer.octets);
            return Err(Error::MessageTooLong { id });
        }

        let wire_header = WireHeader::deserialise(buffer)?;
        let id = wire_header.header.id;

        for count in [
            wire_header.qdcount,
            wire_header.ancount,
            wire_header.nscount,
            wire_header.arcount,
        ] {
            if usize::from(count) > SECTION_MAX_RRS {
                return Err(Error::SectionOverflow { id });
            }
        }

        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    /// Decode just the fixed 12-octet header.  This looks at nothing past
    /// those 12 octets, so it is constant time regardless of message size -
    /// the dispatcher uses it as a cheap first look at hostile input.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// The message ID, if the buffer is long enough to contain one.
    pub fn peek_id(octets: &[u8]) -> Option<u16> {
        if octets.len() >= 2 {
            Some(u16::from_be_bytes([octets[0], octets[1]]))
        } else {
            None
        }
    }

    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer
            .next_u16()
            .ok_or(Error::ShortMessage { id: None })?;
        let too_short = Error::ShortMessage { id: Some(id) };
        let flags1 = buffer.next_u8().ok_or(too_short)?;
        let flags2 = buffer.next_u8().ok_or(too_short)?;
        let qdcount = buffer.next_u16().ok_or(too_short)?;
        let ancount = buffer.next_u16().ok_or(too_short)?;
        let nscount = buffer.next_u16().ok_or(too_short)?;
        let arcount = buffer.next_u16().ok_or(too_short)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from(flags2 & HEADER_MASK_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or(Error::Truncated { id })?;
        let qclass = buffer
            .next_u16()
            .map(QueryClass::from)
            .ok_or(Error::Truncated { id })?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer
            .next_u16()
            .map(RecordType::from)
            .ok_or(Error::Truncated { id })?;
        let rclass = buffer
            .next_u16()
            .map(RecordClass::from)
            .ok_or(Error::Truncated { id })?;
        let ttl = buffer.next_u32().ok_or(Error::Truncated { id })?;
        let rdlength = buffer.next_u16().ok_or(Error::Truncated { id })?;

        if usize::from(rdlength) > RRSET_MAX_WIRE_LEN {
            return Err(Error::RRsetTooLarge { id });
        }

        let rdata_start = buffer.position;

        let mut raw_rdata = || {
            if let Some(octets) = buffer.take(rdlength as usize) {
                Ok(octets.to_vec())
            } else {
                Err(Error::Truncated { id })
            }
        };

        // records which embed domain names are deserialised field by field,
        // to expand compression pointers; everything else is copied raw.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or(Error::Truncated { id })?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or(Error::Truncated { id })?,
                refresh: buffer.next_u32().ok_or(Error::Truncated { id })?,
                retry: buffer.next_u32().ok_or(Error::Truncated { id })?,
                expire: buffer.next_u32().ok_or(Error::Truncated { id })?,
                minimum: buffer.next_u32().ok_or(Error::Truncated { id })?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or(Error::Truncated { id })?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: raw_rdata()?,
            },
            RecordType::AAAA => {
                let mut segments = [0_u16; 8];
                for segment in &mut segments {
                    *segment = buffer.next_u16().ok_or(Error::Truncated { id })?;
                }
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(segments),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or(Error::Truncated { id })?,
                weight: buffer.next_u16().ok_or(Error::Truncated { id })?,
                port: buffer.next_u16().ok_or(Error::Truncated { id })?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::OPT => RecordTypeWithData::OPT {
                octets: raw_rdata()?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: raw_rdata()?,
            },
        };

        if buffer.position == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::Truncated { id })
        }
    }
}

impl DomainName {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut labels = Vec::<Vec<u8>>::with_capacity(5);

        let mut cursor = buffer.position;
        let mut jumped = false;
        let mut depth = 0;
        let mut visited = HashSet::<usize>::new();

        loop {
            let size = *buffer
                .octets
                .get(cursor)
                .ok_or(Error::Truncated { id })?;

            if size & 0b1100_0000 == 0b1100_0000 {
                let lo = *buffer
                    .octets
                    .get(cursor + 1)
                    .ok_or(Error::Truncated { id })?;
                let target = usize::from(u16::from_be_bytes([size & 0b0011_1111, lo]));

                if !jumped {
                    buffer.position = cursor + 2;
                    jumped = true;
                }

                // a pointer must lead strictly backwards (RFC 1035 section
                // 4.1.4), and must not land on an offset this name has
                // already visited
                if target >= cursor || !visited.insert(target) {
                    return Err(Error::InvalidPointer { id });
                }

                depth += 1;
                if depth > POINTER_CHAIN_MAX_DEPTH {
                    return Err(Error::CompressionBomb { id });
                }

                buffer.pointer_ops += 1;
                cursor = target;
            } else if size & 0b1100_0000 == 0 {
                cursor += 1;
                octets.push(size);

                if size == 0 {
                    labels.push(Vec::new());
                    break;
                }

                let os = buffer
                    .octets
                    .get(cursor..cursor + usize::from(size))
                    .ok_or(Error::Truncated { id })?;

                // label octets are copied into fresh storage so the parsed
                // name outlives the receive buffer; comparisons use the
                // lowercase copy, the wire copy keeps its case
                let mut label = Vec::with_capacity(os.len());
                for o in os {
                    octets.push(*o);
                    label.push(o.to_ascii_lowercase());
                }
                labels.push(label);
                cursor += usize::from(size);

                if octets.len() > DOMAINNAME_MAX_LEN {
                    return Err(Error::NameTooLong { id });
                }
            } else {
                // the 0b01 and 0b10 prefixes are neither a length nor a
                // pointer
                return Err(Error::LabelTooLong { id });
            }
        }

        if !jumped {
            buffer.position = cursor;
        }

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { octets, labels })
        } else {
            Err(Error::NameTooLong { id })
        }
    }
}

/// Errors encountered when parsing a message.  Each carries the ID from the
/// header where one could be read, so that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Error {
    /// The message ends before the header does.  If not even the ID could be
    /// read, no error can be sent back to the client.
    #[error("message too short to contain a header")]
    ShortMessage { id: Option<u16> },

    /// The message is longer than the 65,535 octet protocol ceiling.
    #[error("message longer than the protocol permits")]
    MessageTooLong { id: Option<u16> },

    /// A question or resource record ends with an incomplete field, or a
    /// resource record's RDATA does not match its RDLENGTH.
    #[error("truncated or inconsistent question or resource record")]
    Truncated { id: u16 },

    /// A compression pointer does not lead strictly backwards, or revisits
    /// an offset already seen while decoding this name.
    #[error("invalid compression pointer")]
    InvalidPointer { id: u16 },

    /// A compression pointer chain is deeper than the permitted limit.
    #[error("compression pointer chain too deep")]
    CompressionBomb { id: u16 },

    /// A label length octet has a reserved prefix, so the label can neither
    /// be read directly nor followed as a pointer.
    #[error("invalid label length")]
    LabelTooLong { id: u16 },

    /// A domain is over 255 octets in size.
    #[error("domain name too long")]
    NameTooLong { id: u16 },

    /// A section claims more records than the per-section cap.
    #[error("section has too many records")]
    SectionOverflow { id: u16 },

    /// A record's RDATA is larger than the per-RRset cap.
    #[error("record data too large")]
    RRsetTooLarge { id: u16 },
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::ShortMessage { id } | Error::MessageTooLong { id } => id,
            Error::Truncated { id }
            | Error::InvalidPointer { id }
            | Error::CompressionBomb { id }
            | Error::LabelTooLong { id }
            | Error::NameTooLong { id }
            | Error::SectionOverflow { id }
            | Error::RRsetTooLarge { id } => Some(id),
        }
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
    pointer_ops: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
            pointer_ops: 0,
        }
    }

    pub fn stats(&self) -> ParseStats {
        ParseStats {
            bytes_consumed: self.position,
            pointer_ops: self.pointer_ops,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    fn query_octets(name_wire: &[u8]) -> Vec<u8> {
        let mut octets = vec![
            0x12, 0x34, // ID
            0x01, 0x00, // RD
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        octets.extend_from_slice(name_wire);
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        octets
    }

    #[test]
    fn parses_simple_query() {
        let octets = query_octets(b"\x07example\x03com\x00");
        let (message, stats) = Message::from_octets_with_stats(&octets).unwrap();

        assert_eq!(0x1234, message.header.id);
        assert!(!message.header.is_response);
        assert!(message.header.recursion_desired);
        assert_eq!(1, message.questions.len());
        assert_eq!(domain("example.com."), message.questions[0].name);
        assert_eq!(octets.len(), stats.bytes_consumed);
        assert_eq!(0, stats.pointer_ops);
    }

    #[test]
    fn preserves_question_case_but_compares_insensitively() {
        let octets = query_octets(b"\x07eXaMpLe\x03CoM\x00");
        let message = Message::from_octets(&octets).unwrap();

        let name = &message.questions[0].name;
        assert_eq!(domain("example.com."), *name);
        assert_eq!(b"\x07eXaMpLe\x03CoM\x00".to_vec(), name.octets);
    }

    #[test]
    fn short_message_is_an_error() {
        assert_eq!(
            Err(Error::ShortMessage { id: None }),
            Message::from_octets(&[0x12])
        );
        assert_eq!(
            Err(Error::ShortMessage { id: Some(0x1234) }),
            Message::from_octets(&[0x12, 0x34, 0x00])
        );
    }

    #[test]
    fn rejects_self_referential_pointer() {
        // question name is a single pointer aimed at itself
        let octets = query_octets(b"\xc0\x0c");
        assert_eq!(
            Err(Error::InvalidPointer { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn rejects_forward_pointer() {
        let octets = query_octets(b"\xc0\x20");
        assert_eq!(
            Err(Error::InvalidPointer { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn rejects_pointer_revisit() {
        // "a" followed by a pointer back to the start of the same name: each
        // hop is strictly backwards, but the name never terminates.  The
        // backwards rule alone does not catch this; the visited set does.
        let octets = query_octets(b"\x01a\xc0\x0c");
        assert_eq!(
            Err(Error::InvalidPointer { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn accepts_backward_pointer_chain_within_depth() {
        // header + first question "example.com." + second question that
        // points at the first name
        let mut octets = vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        octets.extend_from_slice(b"\x07example\x03com\x00");
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        octets.extend_from_slice(b"\x03www\xc0\x0c");
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let (message, stats) = Message::from_octets_with_stats(&octets).unwrap();
        assert_eq!(domain("example.com."), message.questions[0].name);
        assert_eq!(domain("www.example.com."), message.questions[1].name);
        assert_eq!(1, stats.pointer_ops);
    }

    #[test]
    fn rejects_deep_pointer_chain() {
        // build a chain of names, each one label then a pointer to the
        // previous, then read a name pointing at the deepest link
        let mut octets = vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut prev: Option<u16> = None;
        let mut last = 0_u16;
        for i in 0..=POINTER_CHAIN_MAX_DEPTH {
            last = u16::try_from(octets.len()).unwrap();
            octets.push(1);
            octets.push(b'a' + u8::try_from(i % 26).unwrap());
            match prev {
                Some(p) => octets.extend_from_slice(&(0xC000 | p).to_be_bytes()),
                None => octets.push(0),
            }
            prev = Some(last);
        }
        let question_start = octets.len();
        octets.extend_from_slice(&(0xC000 | last).to_be_bytes());
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert!(question_start > 12);
        assert_eq!(
            Err(Error::CompressionBomb { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn rejects_oversized_sections() {
        let octets = vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x65, // QDCOUNT = 101
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(
            Err(Error::SectionOverflow { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn rejects_oversized_rdata() {
        let mut octets = vec![
            0x12, 0x34, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        octets.extend_from_slice(b"\x07example\x03com\x00");
        octets.extend_from_slice(&[0x00, 0x10, 0x00, 0x01]); // TXT IN
        octets.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // TTL
        octets.extend_from_slice(&0x8001_u16.to_be_bytes()); // RDLENGTH 32769

        assert_eq!(
            Err(Error::RRsetTooLarge { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn rdlength_must_match_parsed_rdata() {
        let mut octets = vec![
            0x12, 0x34, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        octets.extend_from_slice(b"\x07example\x03com\x00");
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        octets.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // TTL
        octets.extend_from_slice(&[0x00, 0x05]); // RDLENGTH 5, but A is 4
        octets.extend_from_slice(&[192, 0, 2, 1, 0]);

        assert_eq!(
            Err(Error::Truncated { id: 0x1234 }),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn adversarial_bytes_never_panic() {
        use fake::{Fake, Faker};

        for _ in 0..1000 {
            let len = (0..600).fake::<usize>();
            let mut octets = Vec::with_capacity(len);
            for _ in 0..len {
                octets.push(Faker.fake());
            }
            let _ = Message::from_octets(&octets);
        }
    }
}
