//! Serialisation of zones to RFC 1035 master files.  Whatever format a zone
//! was loaded from, this is the format it is exported in.

use std::fmt::Write;

use crate::protocol::types::*;
use crate::zones::types::*;

impl Zone {
    /// Export the zone as a master file.  The output parses back to an
    /// equal zone.
    pub fn serialise(&self) -> String {
        let mut out = String::new();
        _ = writeln!(&mut out, "$ORIGIN {}", self.origin().to_dotted_string());
        _ = writeln!(&mut out);

        let soa = self.soa();
        _ = writeln!(
            &mut out,
            "@ IN SOA {mname} {rname} ( {serial} {refresh} {retry} {expire} {minimum} )",
            mname = soa.mname.to_dotted_string(),
            rname = soa.rname.to_dotted_string(),
            serial = soa.serial,
            refresh = soa.refresh,
            retry = soa.retry,
            expire = soa.expire,
            minimum = soa.minimum,
        );

        for rr in self.all_rrs() {
            if rr.rtype_with_data.rtype() == RecordType::SOA {
                continue;
            }
            let owner = relative_owner(self.origin(), &rr.name);
            if let Some(rdata) = serialise_rdata(&rr.rtype_with_data) {
                _ = writeln!(
                    &mut out,
                    "{owner} {ttl} IN {rtype} {rdata}",
                    ttl = rr.ttl,
                    rtype = rr.rtype_with_data.rtype(),
                );
            }
        }

        out
    }
}

fn relative_owner(origin: &DomainName, name: &DomainName) -> String {
    if name == origin {
        return "@".to_string();
    }

    if name.is_subdomain_of(origin) {
        let relative_labels = &name.labels[..name.labels.len() - origin.labels.len()];
        let mut owner = String::new();
        for (i, label) in relative_labels.iter().enumerate() {
            if i > 0 {
                owner.push('.');
            }
            for octet in label {
                owner.push(*octet as char);
            }
        }
        owner
    } else {
        name.to_dotted_string()
    }
}

fn serialise_rdata(rtype_with_data: &RecordTypeWithData) -> Option<String> {
    match rtype_with_data {
        RecordTypeWithData::A { address } => Some(address.to_string()),
        RecordTypeWithData::AAAA { address } => Some(address.to_string()),
        RecordTypeWithData::NS { nsdname } => Some(nsdname.to_dotted_string()),
        RecordTypeWithData::CNAME { cname } => Some(cname.to_dotted_string()),
        RecordTypeWithData::PTR { ptrdname } => Some(ptrdname.to_dotted_string()),
        RecordTypeWithData::MX {
            preference,
            exchange,
        } => Some(format!("{preference} {}", exchange.to_dotted_string())),
        RecordTypeWithData::SRV {
            priority,
            weight,
            port,
            target,
        } => Some(format!(
            "{priority} {weight} {port} {}",
            target.to_dotted_string()
        )),
        RecordTypeWithData::TXT { octets } => Some(serialise_txt(octets)),
        // SOA is written at the top of the file; the rest have no
        // master-file representation here
        RecordTypeWithData::SOA { .. }
        | RecordTypeWithData::OPT { .. }
        | RecordTypeWithData::Unknown { .. } => None,
    }
}

/// TXT RDATA is length-prefixed character strings; each becomes a quoted
/// string with `"` and `\` escaped.
fn serialise_txt(octets: &[u8]) -> String {
    let mut out = String::new();
    let mut position = 0;
    while position < octets.len() {
        let len = usize::from(octets[position]);
        position += 1;
        let end = (position + len).min(octets.len());

        if !out.is_empty() {
            out.push(' ');
        }
        out.push('"');
        for octet in &octets[position..end] {
            let c = *octet as char;
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        position = end;
    }

    if out.is_empty() {
        out.push_str("\"\"");
    }
    out
}
