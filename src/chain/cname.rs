use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

use super::{Next, Request, Stage};
use crate::error::ResolveError;
use crate::proto_utils::{is_ip_record, map_answers};

/// Drops CNAME records once the answer already carries addresses.
///
/// Without any A/AAAA record the CNAMEs are passed through untouched; the
/// chain is never chased.
pub struct StripCnameStage;

#[async_trait]
impl Stage for StripCnameStage {
    async fn handle(&self, req: Request, next: Next<'_>) -> Result<Message, ResolveError> {
        let mut resp = next.run(req).await?;
        strip_cname(&mut resp);
        Ok(resp)
    }
}

pub(crate) fn strip_cname(resp: &mut Message) {
    if !resp.answers().iter().any(is_ip_record) {
        return;
    }
    map_answers(resp, |answers| {
        answers
            .into_iter()
            .filter(|rr| rr.record_type() != RecordType::CNAME)
            .collect()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto_utils::testing::*;

    #[test]
    fn cname_dropped_when_address_present() {
        let req = query("www.example.com.", RecordType::A);
        let mut resp = response(
            &req,
            vec![
                cname("www.example.com.", "edge.example.net.", 300),
                a("edge.example.net.", "1.2.3.4", 60),
            ],
        );
        strip_cname(&mut resp);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].record_type(), RecordType::A);
    }

    #[test]
    fn cname_dropped_next_to_aaaa() {
        let req = query("www.example.com.", RecordType::AAAA);
        let mut resp = response(
            &req,
            vec![
                cname("www.example.com.", "edge.example.net.", 300),
                aaaa("edge.example.net.", "2001:db8::1", 60),
            ],
        );
        strip_cname(&mut resp);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].record_type(), RecordType::AAAA);
        assert_eq!(answer_ips(&resp), vec!["2001:db8::1"]);
    }

    #[test]
    fn cname_only_answer_passes_through() {
        let req = query("www.example.com.", RecordType::A);
        let mut resp = response(&req, vec![cname("www.example.com.", "edge.example.net.", 300)]);
        strip_cname(&mut resp);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].record_type(), RecordType::CNAME);
    }
}
