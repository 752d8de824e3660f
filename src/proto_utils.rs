use std::net::IpAddr;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{RData, Record, RecordType};
use rustc_hash::FxHashSet;

use crate::error::ResolveError;

/// TTL used when a response carries neither answers nor authority records.
pub const EMPTY_RESPONSE_TTL: u32 = 60;

/// 取唯一问题；多问题或空问题视为畸形请求。
#[inline]
pub fn single_question(msg: &Message) -> Result<&Query, ResolveError> {
    match msg.queries() {
        [q] => Ok(q),
        qs => Err(ResolveError::MalformedQuery {
            questions: qs.len(),
        }),
    }
}

/// Cache key of a query: lowercased name, class and type.
pub fn cache_key(msg: &Message) -> Result<String, ResolveError> {
    let q = single_question(msg)?;
    Ok(format!(
        "{} {} {}",
        q.name().to_lowercase(),
        q.query_class(),
        q.query_type()
    ))
}

/// Queried host without the trailing dot, for logs.
pub fn host(msg: &Message) -> String {
    msg.queries()
        .first()
        .map(|q| q.name().to_string().trim_end_matches('.').to_string())
        .unwrap_or_default()
}

/// Identity of a record for dedup: type plus formatted rdata, ignoring owner and TTL.
#[inline]
pub fn record_identity(rr: &Record) -> String {
    match rr.data() {
        Some(data) => format!("{}\t{}", rr.record_type(), data),
        None => format!("{}\t", rr.record_type()),
    }
}

/// Keeps the first occurrence of every record identity.
pub fn dedup_records(records: Vec<Record>) -> Vec<Record> {
    if records.len() <= 1 {
        return records;
    }
    let mut seen = FxHashSet::default();
    records
        .into_iter()
        .filter(|rr| seen.insert(record_identity(rr)))
        .collect()
}

#[inline]
pub fn is_ip_record(rr: &Record) -> bool {
    matches!(rr.record_type(), RecordType::A | RecordType::AAAA)
}

pub fn record_ip(rr: &Record) -> Option<IpAddr> {
    match rr.data()? {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// Splits records into (A/AAAA, everything else), preserving order.
pub fn split_ip_records(records: Vec<Record>) -> (Vec<Record>, Vec<Record>) {
    records.into_iter().partition(is_ip_record)
}

/// Applies `f` to the answer section in place.
pub fn map_answers(msg: &mut Message, f: impl FnOnce(Vec<Record>) -> Vec<Record>) {
    let answers = msg.take_answers();
    msg.insert_answers(f(answers));
}

/// Applies `f` to the answer, authority and additional sections in place.
pub fn map_sections(msg: &mut Message, mut f: impl FnMut(Vec<Record>) -> Vec<Record>) {
    let answers = msg.take_answers();
    msg.insert_answers(f(answers));
    let authority = msg.take_name_servers();
    msg.insert_name_servers(f(authority));
    let additionals = msg.take_additionals();
    msg.insert_additionals(f(additionals));
}

/// Rewrites the TTL of every record in the message.
pub fn rewrite_ttl(msg: &mut Message, ttl: u32) {
    map_sections(msg, |mut records| {
        for rr in &mut records {
            rr.set_ttl(ttl);
        }
        records
    });
}

/// TTL that governs how long a response stays fresh in the cache.
pub fn cache_ttl(msg: &Message) -> u32 {
    msg.answers()
        .iter()
        .map(Record::ttl)
        .min()
        .or_else(|| msg.name_servers().iter().map(Record::ttl).min())
        .unwrap_or(EMPTY_RESPONSE_TTL)
}

/// Appends every section of `others` onto `base`.
pub fn merge_responses(base: &mut Message, others: Vec<Message>) {
    for mut other in others {
        let answers = other.take_answers();
        let authority = other.take_name_servers();
        let additionals = other.take_additionals();
        base.add_answers(answers);
        base.add_name_servers(authority);
        base.add_additionals(additionals);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    pub fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg
    }

    pub fn a(name: &str, ip: &str, ttl: u32) -> Record {
        let ip: Ipv4Addr = ip.parse().unwrap();
        Record::from_rdata(Name::from_str(name).unwrap(), ttl, RData::A(A(ip)))
    }

    pub fn aaaa(name: &str, ip: &str, ttl: u32) -> Record {
        let ip: Ipv6Addr = ip.parse().unwrap();
        Record::from_rdata(Name::from_str(name).unwrap(), ttl, RData::AAAA(AAAA(ip)))
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::CNAME(CNAME(Name::from_str(target).unwrap())),
        )
    }

    pub fn response(req: &Message, answers: Vec<Record>) -> Message {
        let mut msg = req.clone();
        msg.set_message_type(MessageType::Response);
        msg.add_answers(answers);
        msg
    }

    pub fn answer_ips(msg: &Message) -> Vec<String> {
        msg.answers()
            .iter()
            .filter_map(super::record_ip)
            .map(|ip| ip.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    #[test]
    fn cache_key_is_case_insensitive_and_type_aware() {
        let lower = query("example.com.", RecordType::A);
        let upper = query("EXAMPLE.com.", RecordType::A);
        let v6 = query("example.com.", RecordType::AAAA);
        assert_eq!(cache_key(&lower).unwrap(), cache_key(&upper).unwrap());
        assert_ne!(cache_key(&lower).unwrap(), cache_key(&v6).unwrap());
    }

    #[test]
    fn cache_key_rejects_zero_or_many_questions() {
        let empty = Message::new();
        assert!(matches!(
            cache_key(&empty),
            Err(ResolveError::MalformedQuery { questions: 0 })
        ));

        let mut two = query("a.example.", RecordType::A);
        two.add_query(Query::query(Name::from_str("b.example.").unwrap(), RecordType::A));
        assert!(matches!(
            cache_key(&two),
            Err(ResolveError::MalformedQuery { questions: 2 })
        ));
    }

    #[test]
    fn dedup_ignores_owner_and_ttl() {
        let records = vec![
            a("example.com.", "1.1.1.1", 60),
            a("example.com.", "1.1.1.1", 300),
            a("example.com.", "2.2.2.2", 60),
        ];
        let out = dedup_records(records);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ttl(), 60);
    }

    #[test]
    fn cache_ttl_prefers_minimum_answer_ttl() {
        let req = query("example.com.", RecordType::A);
        let resp = response(
            &req,
            vec![a("example.com.", "1.1.1.1", 300), a("example.com.", "2.2.2.2", 120)],
        );
        assert_eq!(cache_ttl(&resp), 120);
        assert_eq!(cache_ttl(&response(&req, vec![])), EMPTY_RESPONSE_TTL);
    }

    #[test]
    fn rewrite_ttl_touches_every_section() {
        let req = query("example.com.", RecordType::A);
        let mut resp = response(&req, vec![a("example.com.", "1.1.1.1", 300)]);
        resp.add_name_servers(vec![a("ns.example.com.", "9.9.9.9", 900)]);
        rewrite_ttl(&mut resp, 7);
        assert!(resp.answers().iter().all(|r| r.ttl() == 7));
        assert!(resp.name_servers().iter().all(|r| r.ttl() == 7));
    }

    #[test]
    fn merge_appends_all_sections() {
        let req = query("example.com.", RecordType::A);
        let mut base = response(&req, vec![a("example.com.", "1.1.1.1", 60)]);
        let other = response(&req, vec![a("example.com.", "2.2.2.2", 60)]);
        merge_responses(&mut base, vec![other]);
        assert_eq!(answer_ips(&base), vec!["1.1.1.1", "2.2.2.2"]);
    }
}
