//! Query fingerprinting: a stable 64-bit digest of (qname, qtype, qclass)
//! used as the cache key and shard selector.
//!
//! The digest is FNV-1a over the lowercased wire-form name followed by the
//! big-endian type and class.  Collision resistance is not a security
//! property here (the rate limiter does its own keying), but the fingerprint
//! must be identical across processes so that cluster members agree on keys,
//! which rules out the per-process-seeded std hasher.

use dns_types::protocol::types::*;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Digest a question into its cache fingerprint.
pub fn fingerprint(name: &DomainName, qtype: QueryType, qclass: QueryClass) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;

    for label in &name.labels {
        hash = fnv1a_step(hash, label.len() as u8);
        for octet in label {
            hash = fnv1a_step(hash, *octet);
        }
    }
    for octet in u16::from(qtype).to_be_bytes() {
        hash = fnv1a_step(hash, octet);
    }
    for octet in u16::from(qclass).to_be_bytes() {
        hash = fnv1a_step(hash, octet);
    }

    hash
}

pub fn fingerprint_question(question: &Question) -> u64 {
    fingerprint(&question.name, question.qtype, question.qclass)
}

#[inline]
fn fnv1a_step(hash: u64, octet: u8) -> u64 {
    (hash ^ u64::from(octet)).wrapping_mul(FNV_PRIME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;

    const A_IN: (QueryType, QueryClass) = (
        QueryType::Record(RecordType::A),
        QueryClass::Record(RecordClass::IN),
    );

    #[test]
    fn case_variants_digest_identically() {
        let (qtype, qclass) = A_IN;
        let lower = fingerprint(&domain("www.example.com."), qtype, qclass);
        let upper = fingerprint(
            &DomainName::from_dotted_string("WWW.EXAMPLE.COM.").unwrap(),
            qtype,
            qclass,
        );

        assert_eq!(lower, upper);
    }

    #[test]
    fn name_type_and_class_all_contribute() {
        let (qtype, qclass) = A_IN;
        let base = fingerprint(&domain("www.example.com."), qtype, qclass);

        assert_ne!(
            base,
            fingerprint(&domain("www.example.org."), qtype, qclass)
        );
        assert_ne!(
            base,
            fingerprint(
                &domain("www.example.com."),
                QueryType::Record(RecordType::AAAA),
                qclass
            )
        );
        assert_ne!(
            base,
            fingerprint(&domain("www.example.com."), qtype, QueryClass::Wildcard)
        );
    }

    #[test]
    fn label_structure_matters() {
        // "ab.c." and "a.bc." have the same octets modulo length prefixes
        let (qtype, qclass) = A_IN;
        assert_ne!(
            fingerprint(&domain("ab.c."), qtype, qclass),
            fingerprint(&domain("a.bc."), qtype, qclass)
        );
    }

    #[test]
    fn shard_distribution_is_not_degenerate() {
        let (qtype, qclass) = A_IN;
        let shards = 256_u64;
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let name = domain(&format!("host-{i}.example.com."));
            seen.insert(fingerprint(&name, qtype, qclass) & (shards - 1));
        }

        // 1000 draws over 256 shards should touch most of them
        assert!(seen.len() > 200, "only {} shards hit", seen.len());
    }
}
