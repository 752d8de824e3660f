use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::proto_utils::host;
use crate::router::GroupRouter;

/// Wire boundary between the listeners and the group pipelines.
#[derive(Clone)]
pub struct Engine {
    router: Arc<GroupRouter>,
}

impl Engine {
    pub fn new(router: Arc<GroupRouter>) -> Self {
        Self { router }
    }

    /// Resolves one DNS packet. `Ok(None)` means nothing should be sent back.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> anyhow::Result<Option<Bytes>> {
        let start = Instant::now();
        let req = match Message::from_vec(packet) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(client_ip = %peer.ip(), error = %err, "dropping undecodable packet");
                return Ok(None);
            }
        };
        if req.message_type() != MessageType::Query || req.queries().len() != 1 {
            debug!(
                client_ip = %peer.ip(),
                questions = req.queries().len(),
                "dropping malformed query"
            );
            return Ok(None);
        }

        let qname = host(&req);
        let qtype = req.queries()[0].query_type();
        let group = self.router.find_group(&req);
        let mut resp = match group.handle(req.clone()).await {
            Ok(resp) => resp,
            Err(ResolveError::MalformedQuery { .. }) => return Ok(None),
            Err(err) => {
                warn!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?qtype,
                    client_ip = %peer.ip(),
                    group = %group.tag(),
                    error = %err,
                    "resolve failed, answering servfail"
                );
                servfail(&req)
            }
        };
        resp.set_id(req.id());
        resp.set_message_type(MessageType::Response);

        info!(
            event = "dns_response",
            qname = %qname,
            qtype = ?qtype,
            rcode = ?resp.response_code(),
            answers = resp.answers().len(),
            latency_ms = start.elapsed().as_millis() as u64,
            client_ip = %peer.ip(),
            group = %group.tag(),
            "dns response"
        );
        Ok(Some(Bytes::from(resp.to_vec()?)))
    }
}

fn servfail(req: &Message) -> Message {
    let mut resp = Message::error_msg(req.id(), req.op_code(), ResponseCode::ServFail);
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_recursion_available(true);
    resp.add_queries(req.queries().to_vec());
    resp
}
