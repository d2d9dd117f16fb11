use std::collections::HashMap;

use crate::protocol::types::*;

/// A collection of zones, indexed by origin.
#[derive(Debug, Clone, Default)]
pub struct Zones {
    zones: HashMap<DomainName, Zone>,
}

impl Zones {
    pub fn new() -> Self {
        Self {
            zones: HashMap::new(),
        }
    }

    /// Find the zone for a domain: the zone whose origin is the longest
    /// suffix of (or equal to) the name.  Returns `None` if this server is
    /// not authoritative for any suffix of the name.
    pub fn get(&self, name: &DomainName) -> Option<&Zone> {
        for i in 0..name.labels.len() {
            if let Some(candidate) = DomainName::from_labels(name.labels[i..].to_vec()) {
                if let Some(zone) = self.zones.get(&candidate) {
                    return Some(zone);
                }
            }
        }
        None
    }

    pub fn get_exact(&self, origin: &DomainName) -> Option<&Zone> {
        self.zones.get(origin)
    }

    pub fn get_exact_mut(&mut self, origin: &DomainName) -> Option<&mut Zone> {
        self.zones.get_mut(origin)
    }

    /// Create or replace a zone.
    pub fn insert(&mut self, zone: Zone) {
        self.zones.insert(zone.origin().clone(), zone);
    }

    pub fn remove(&mut self, origin: &DomainName) -> Option<Zone> {
        self.zones.remove(origin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// The SOA record data for a zone.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SOA {
    pub mname: DomainName,
    pub rname: DomainName,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl SOA {
    pub fn to_rr(&self, name: &DomainName) -> ResourceRecord {
        ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::SOA {
                mname: self.mname.clone(),
                rname: self.rname.clone(),
                serial: self.serial,
                refresh: self.refresh,
                retry: self.retry,
                expire: self.expire,
                minimum: self.minimum,
            },
            rclass: RecordClass::IN,
            ttl: self.minimum,
        }
    }
}

/// DNSSEC settings carried on a zone.  The signing pipeline lives elsewhere;
/// the zone just transports its configuration.
#[derive(Debug, Clone, Eq, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct DnssecConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// A record stored in a zone: everything from a `ResourceRecord` except the
/// owner name and class, which are implied by its position.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ZoneRecord {
    pub rtype_with_data: RecordTypeWithData,
    pub ttl: u32,
}

/// A zone: an origin, its SOA, and the records at and under the origin.
///
/// Wildcard records are stored under their literal `*.suffix` owner name and
/// expanded at lookup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    origin: DomainName,
    class: RecordClass,
    soa: SOA,
    records: HashMap<DomainName, HashMap<RecordType, Vec<ZoneRecord>>>,
    dnssec: Option<DnssecConfig>,
}

/// The result of looking a name up in a single zone.
///
/// This corresponds to step 3 of the standard nameserver algorithm (see
/// section 4.3.2 of RFC 1034), with the NXDOMAIN / NODATA distinction made
/// explicit: `NameError` means the owner does not exist at all, `NoData`
/// means it exists but has no records of the requested type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ZoneResult {
    Answer { rrs: Vec<ResourceRecord> },
    CNAME { cname: DomainName, rr: ResourceRecord },
    Delegation { ns_rrs: Vec<ResourceRecord> },
    NoData,
    NameError,
}

/// Errors maintaining a zone's structural invariants.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ZoneError {
    #[error("owner {owner} is not within zone {origin}")]
    OutOfZone { origin: DomainName, owner: DomainName },

    #[error("a CNAME cannot coexist with any other record at {owner}")]
    CnameConflict { owner: DomainName },

    #[error("a zone has exactly one SOA, at the origin")]
    StraySoa,

    #[error("zone {origin} has no NS records at the origin")]
    MissingApexNs { origin: DomainName },

    #[error("in-zone nameserver {nsdname} has no glue address records")]
    MissingGlue { nsdname: DomainName },
}

impl Zone {
    pub fn new(origin: DomainName, class: RecordClass, soa: SOA) -> Self {
        Self {
            origin,
            class,
            soa,
            records: HashMap::new(),
            dnssec: None,
        }
    }

    pub fn origin(&self) -> &DomainName {
        &self.origin
    }

    pub fn class(&self) -> RecordClass {
        self.class
    }

    pub fn soa(&self) -> &SOA {
        &self.soa
    }

    pub fn soa_rr(&self) -> ResourceRecord {
        self.soa.to_rr(&self.origin)
    }

    pub fn dnssec(&self) -> Option<&DnssecConfig> {
        self.dnssec.as_ref()
    }

    pub fn set_dnssec(&mut self, config: Option<DnssecConfig>) {
        self.dnssec = config;
    }

    /// Increment the serial and return the new value.  Wraps using sequence
    /// space arithmetic, like every other consumer of serials.
    pub fn increment_serial(&mut self) -> u32 {
        self.soa.serial = self.soa.serial.wrapping_add(1);
        self.soa.serial
    }

    /// Insert a record, maintaining the CNAME-exclusivity and single-SOA
    /// invariants.
    pub fn insert(
        &mut self,
        owner: &DomainName,
        rtype_with_data: RecordTypeWithData,
        ttl: u32,
    ) -> Result<(), ZoneError> {
        if !owner.is_subdomain_of(&self.origin) {
            return Err(ZoneError::OutOfZone {
                origin: self.origin.clone(),
                owner: owner.clone(),
            });
        }

        let rtype = rtype_with_data.rtype();
        if rtype == RecordType::SOA {
            return Err(ZoneError::StraySoa);
        }

        let entry = self.records.entry(owner.clone()).or_default();
        let conflict = if rtype == RecordType::CNAME {
            entry.keys().any(|k| *k != RecordType::CNAME)
        } else {
            entry.contains_key(&RecordType::CNAME)
        };
        if conflict {
            return Err(ZoneError::CnameConflict {
                owner: owner.clone(),
            });
        }

        let rrs = entry.entry(rtype).or_default();
        let record = ZoneRecord {
            rtype_with_data,
            ttl,
        };
        if !rrs.contains(&record) {
            rrs.push(record);
        }
        Ok(())
    }

    /// Check the whole-zone invariants which cannot be enforced record by
    /// record: at least one NS at the origin, and glue for in-zone NS
    /// targets.
    pub fn validate(&self) -> Result<(), ZoneError> {
        let has_apex_ns = self
            .records
            .get(&self.origin)
            .is_some_and(|types| types.contains_key(&RecordType::NS));
        if !has_apex_ns {
            return Err(ZoneError::MissingApexNs {
                origin: self.origin.clone(),
            });
        }

        for types in self.records.values() {
            for rrs in types.values() {
                for record in rrs {
                    if let RecordTypeWithData::NS { nsdname } = &record.rtype_with_data {
                        if nsdname.is_subdomain_of(&self.origin) && !self.has_address(nsdname) {
                            return Err(ZoneError::MissingGlue {
                                nsdname: nsdname.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn has_address(&self, owner: &DomainName) -> bool {
        self.records.get(owner).is_some_and(|types| {
            types.contains_key(&RecordType::A) || types.contains_key(&RecordType::AAAA)
        })
    }

    /// Resolve a query against this zone.  Returns `None` if the name is
    /// not within the zone at all.
    pub fn resolve(&self, name: &DomainName, qtype: QueryType) -> Option<ZoneResult> {
        if !name.is_subdomain_of(&self.origin) {
            return None;
        }

        if qtype.matches_rtype(RecordType::SOA) && name == &self.origin {
            let mut rrs = vec![self.soa_rr()];
            if qtype == QueryType::Wildcard {
                rrs.append(&mut self.rrs_at(name, name, qtype));
            }
            return Some(ZoneResult::Answer { rrs });
        }

        // an NS RRset at a strict ancestor of the name is a delegation cut:
        // everything at or below it is occluded
        for len in self.origin.labels.len() + 1..name.labels.len() {
            let anc_labels = name.labels[name.labels.len() - len..].to_vec();
            if let Some(anc) = DomainName::from_labels(anc_labels) {
                if let Some(rrs) = self
                    .records
                    .get(&anc)
                    .and_then(|types| types.get(&RecordType::NS))
                {
                    return Some(ZoneResult::Delegation {
                        ns_rrs: rrs.iter().map(|record| self.to_rr(&anc, record)).collect(),
                    });
                }
            }
        }

        if let Some(types) = self.records.get(name) {
            if let Some(result) = self.match_types(name, name, types, qtype) {
                return Some(result);
            }
            return Some(ZoneResult::NoData);
        }

        // wildcard expansion: strip the leftmost label repeatedly, looking
        // for a `*` owner at each level, stopping at the origin
        let mut candidate = name.clone();
        while let Some(parent) = candidate.parent() {
            if parent.labels.len() < self.origin.labels.len() {
                break;
            }
            let mut wildcard_labels = vec![b"*".to_vec()];
            wildcard_labels.extend(parent.labels.iter().cloned());
            if let Some(wildcard) = DomainName::from_labels(wildcard_labels) {
                if let Some(types) = self.records.get(&wildcard) {
                    // a wildcard match synthesises records owned by the
                    // queried name itself
                    if let Some(result) = self.match_types(name, &wildcard, types, qtype) {
                        return Some(result);
                    }
                    return Some(ZoneResult::NoData);
                }
            }
            candidate = parent;
        }

        // the name does not exist, but NXDOMAIN is only correct if nothing
        // exists beneath it either
        let has_descendants = self
            .records
            .keys()
            .any(|owner| owner.is_subdomain_of(name) && owner != name);
        if has_descendants {
            Some(ZoneResult::NoData)
        } else {
            Some(ZoneResult::NameError)
        }
    }

    fn match_types(
        &self,
        qname: &DomainName,
        owner: &DomainName,
        types: &HashMap<RecordType, Vec<ZoneRecord>>,
        qtype: QueryType,
    ) -> Option<ZoneResult> {
        // a CNAME answers every query type except those asking for the
        // CNAME itself
        if !qtype.matches_rtype(RecordType::CNAME) {
            if let Some(rrs) = types.get(&RecordType::CNAME) {
                if let Some(record) = rrs.first() {
                    if let RecordTypeWithData::CNAME { cname } = &record.rtype_with_data {
                        return Some(ZoneResult::CNAME {
                            cname: cname.clone(),
                            rr: self.to_rr(qname, record),
                        });
                    }
                }
            }
        }

        // NS records below the origin are a delegation, not an answer
        if owner != &self.origin && !qtype.matches_rtype(RecordType::NS) {
            if let Some(rrs) = types.get(&RecordType::NS) {
                return Some(ZoneResult::Delegation {
                    ns_rrs: rrs.iter().map(|record| self.to_rr(owner, record)).collect(),
                });
            }
        }

        let rrs = self.rrs_matching(qname, types, qtype);
        if rrs.is_empty() {
            None
        } else {
            Some(ZoneResult::Answer { rrs })
        }
    }

    fn rrs_at(&self, qname: &DomainName, owner: &DomainName, qtype: QueryType) -> Vec<ResourceRecord> {
        self.records
            .get(owner)
            .map(|types| self.rrs_matching(qname, types, qtype))
            .unwrap_or_default()
    }

    fn rrs_matching(
        &self,
        qname: &DomainName,
        types: &HashMap<RecordType, Vec<ZoneRecord>>,
        qtype: QueryType,
    ) -> Vec<ResourceRecord> {
        let mut rrs = Vec::new();
        for (rtype, records) in types {
            if rtype.matches(qtype) {
                for record in records {
                    rrs.push(self.to_rr(qname, record));
                }
            }
        }
        rrs
    }

    fn to_rr(&self, owner: &DomainName, record: &ZoneRecord) -> ResourceRecord {
        ResourceRecord {
            name: owner.clone(),
            rtype_with_data: record.rtype_with_data.clone(),
            rclass: self.class,
            ttl: record.ttl,
        }
    }

    /// Address records at a name, read directly rather than through
    /// `resolve`: glue for a delegated child lives below the cut that
    /// `resolve` stops at.
    pub fn glue_rrs(&self, owner: &DomainName) -> Vec<ResourceRecord> {
        let mut rrs = Vec::new();
        if let Some(types) = self.records.get(owner) {
            for rtype in [RecordType::A, RecordType::AAAA] {
                if let Some(records) = types.get(&rtype) {
                    for record in records {
                        rrs.push(self.to_rr(owner, record));
                    }
                }
            }
        }
        rrs
    }

    /// All records in the zone as `ResourceRecord`s, SOA first.  Used by the
    /// master-file exporter and the control plane.
    pub fn all_rrs(&self) -> Vec<ResourceRecord> {
        let mut rrs = vec![self.soa_rr()];
        let mut owners = self.records.keys().collect::<Vec<_>>();
        owners.sort();
        for owner in owners {
            let types = &self.records[owner];
            let mut rtypes = types.keys().copied().collect::<Vec<_>>();
            rtypes.sort_by_key(|rtype| u16::from(*rtype));
            for rtype in rtypes {
                for record in &types[&rtype] {
                    rrs.push(self.to_rr(owner, record));
                }
            }
        }
        rrs
    }

    /// Apply one control-plane update.  Each update succeeds or fails
    /// independently of the others in a batch.
    pub fn apply_update(&mut self, update: &RecordUpdate) -> Result<UpdateOutcome, UpdateError> {
        match update.op {
            UpdateOp::Add => {
                let data = update.data.clone().ok_or(UpdateError::MissingData)?;
                if data.rtype() != update.rtype {
                    return Err(UpdateError::TypeMismatch);
                }
                self.insert(&update.name, data, update.ttl)
                    .map_err(UpdateError::Zone)?;
                Ok(UpdateOutcome::Added)
            }
            UpdateOp::Delete => {
                let Some(types) = self.records.get_mut(&update.name) else {
                    return Err(UpdateError::NoSuchRecord);
                };
                let Some(rrs) = types.get_mut(&update.rtype) else {
                    return Err(UpdateError::NoSuchRecord);
                };

                let before = rrs.len();
                if let Some(data) = &update.data {
                    rrs.retain(|record| &record.rtype_with_data != data);
                } else {
                    rrs.clear();
                }
                let removed = before - rrs.len();

                if rrs.is_empty() {
                    types.remove(&update.rtype);
                }
                if types.is_empty() {
                    self.records.remove(&update.name);
                }

                if removed == 0 {
                    Err(UpdateError::NoSuchRecord)
                } else {
                    Ok(UpdateOutcome::Deleted(removed))
                }
            }
            UpdateOp::Replace => {
                let data = update.data.clone().ok_or(UpdateError::MissingData)?;
                let old_data = update.old_data.clone().ok_or(UpdateError::MissingData)?;
                if data.rtype() != update.rtype {
                    return Err(UpdateError::TypeMismatch);
                }

                let record = self
                    .records
                    .get_mut(&update.name)
                    .and_then(|types| types.get_mut(&update.rtype))
                    .and_then(|rrs| {
                        rrs.iter_mut()
                            .find(|record| record.rtype_with_data == old_data)
                    })
                    .ok_or(UpdateError::NoSuchRecord)?;

                record.rtype_with_data = data;
                record.ttl = update.ttl;
                Ok(UpdateOutcome::Replaced)
            }
        }
    }
}

impl QueryType {
    fn matches_rtype(self, rtype: RecordType) -> bool {
        rtype.matches(self)
    }
}

/// A single record mutation from the control plane.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordUpdate {
    pub op: UpdateOp,
    pub name: DomainName,
    pub rtype: RecordType,
    pub ttl: u32,
    pub data: Option<RecordTypeWithData>,
    pub old_data: Option<RecordTypeWithData>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpdateOp {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpdateOutcome {
    Added,
    Deleted(usize),
    Replaced,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UpdateError {
    #[error("update needs record data")]
    MissingData,

    #[error("record data does not match the update's type")]
    TypeMismatch,

    #[error("no matching record")]
    NoSuchRecord,

    #[error(transparent)]
    Zone(ZoneError),
}


#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;
    use crate::protocol::types::test_util::*;

    pub fn soa(origin: &str) -> SOA {
        SOA {
            mname: domain(&format!("ns1.{origin}")),
            rname: domain(&format!("hostmaster.{origin}")),
            serial: 2024_01_01_00,
            refresh: 1800,
            retry: 300,
            expire: 604_800,
            minimum: 300,
        }
    }

    /// An authoritative zone with an out-of-zone apex NS, so it validates.
    pub fn zone(origin: &str) -> Zone {
        let mut z = Zone::new(domain(origin), RecordClass::IN, soa(origin));
        z.insert(
            &domain(origin),
            RecordTypeWithData::NS {
                nsdname: domain("ns1.example-dns.net."),
            },
            300,
        )
        .unwrap();
        z
    }

    pub fn zone_without_ns(origin: &str) -> Zone {
        Zone::new(domain(origin), RecordClass::IN, soa(origin))
    }
}
