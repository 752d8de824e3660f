use async_trait::async_trait;
use hickory_proto::op::Message;

use super::Outbound;
use crate::config::Socks5Setting;
use crate::error::OutboundError;

/// Placeholder for DNS tunnelled through a SOCKS5 proxy; every call fails.
pub struct Socks5Outbound {
    label: String,
}

impl Socks5Outbound {
    pub fn new(setting: &Socks5Setting) -> Self {
        Self {
            label: format!("socks5://{}", setting.addr),
        }
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    async fn invoke(&self, _req: &Message) -> Result<Message, OutboundError> {
        Err(OutboundError::Unsupported("socks5"))
    }

    fn label(&self) -> &str {
        &self.label
    }
}
