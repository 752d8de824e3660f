//! Upstream invokers.
//!
//! Every upstream protocol sits behind [`Outbound::invoke`]; the outbound
//! stage treats them uniformly and applies the per-group timeout around each
//! call. The concrete variant is chosen once, from configuration.

mod dns;
mod https;
mod socks5;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::config::OutboundConfig;
use crate::error::OutboundError;

use dns::DnsOutbound;
use https::HttpsOutbound;
use socks5::Socks5Outbound;

#[async_trait]
pub trait Outbound: Send + Sync {
    /// Sends one query upstream and returns the upstream's answer.
    async fn invoke(&self, req: &Message) -> Result<Message, OutboundError>;

    /// Short label for logs, e.g. `udp://223.5.5.5:53`.
    fn label(&self) -> &str;
}

pub fn build(cfg: &OutboundConfig) -> anyhow::Result<Arc<dyn Outbound>> {
    let outbound: Arc<dyn Outbound> = match cfg {
        OutboundConfig::Dns(setting) => Arc::new(
            DnsOutbound::new(setting).with_context(|| format!("dns outbound {}", setting.addr))?,
        ),
        OutboundConfig::Https(setting) => Arc::new(
            HttpsOutbound::new(setting)
                .with_context(|| format!("https outbound {}", setting.addr))?,
        ),
        OutboundConfig::Socks5(setting) => Arc::new(Socks5Outbound::new(setting)),
    };
    Ok(outbound)
}


/// A loopback UDP DNS server for end-to-end tests.
#[cfg(test)]
pub(crate) mod fake_server {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hickory_proto::op::Message;
    use tokio::net::UdpSocket;

    use crate::proto_utils::testing::{a, response};

    /// Answers every A query with `ips`; returns its address and a hit counter.
    pub async fn spawn(ips: Vec<&'static str>) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(req) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let name = req.queries()[0].name().to_string();
                let answers = ips.iter().map(|ip| a(&name, ip, 300)).collect();
                let out = response(&req, answers).to_vec().unwrap();
                let _ = socket.send_to(&out, peer).await;
            }
        });
        (addr, hits)
    }
}
