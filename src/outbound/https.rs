use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hickory_proto::op::Message;
use reqwest::header::ACCEPT;

use super::Outbound;
use crate::config::HttpsSetting;
use crate::error::OutboundError;

const DNS_MESSAGE: &str = "application/dns-message";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS-over-HTTPS using the RFC 8484 GET form.
pub struct HttpsOutbound {
    url: String,
    client: reqwest::Client,
}

impl HttpsOutbound {
    pub fn new(setting: &HttpsSetting) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .danger_accept_invalid_certs(setting.insecure_skip_verify)
            .build()
            .context("build doh http client")?;
        Ok(Self {
            url: setting.addr.clone(),
            client,
        })
    }

    fn request_url(&self, packet: &[u8]) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}dns={}", self.url, sep, URL_SAFE_NO_PAD.encode(packet))
    }
}

#[async_trait]
impl Outbound for HttpsOutbound {
    async fn invoke(&self, req: &Message) -> Result<Message, OutboundError> {
        // RFC 8484 §4.1: id 0 keeps GET requests cache friendly
        let mut wire = req.clone();
        wire.set_id(0);
        let packet = wire.to_vec()?;

        let response = self
            .client
            .get(self.request_url(&packet))
            .header(ACCEPT, DNS_MESSAGE)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OutboundError::Status(response.status().as_u16()));
        }
        let body = response.bytes().await?;

        let mut resp = Message::from_vec(&body)?;
        resp.set_id(req.id());
        Ok(resp)
    }

    fn label(&self) -> &str {
        &self.url
    }
}
