use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use hickory_proto::op::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::Outbound;
use crate::config::{DnsNet, DnsSetting};
use crate::error::OutboundError;

/// Largest possible UDP payload, so EDNS answers are never cut short.
const UDP_RECV_BUF: usize = 65_535;
const SOCKET_BUF: usize = 1024 * 1024;

/// Plain DNS over UDP (falling back to TCP on truncation) or TCP.
pub struct DnsOutbound {
    addr: SocketAddr,
    net: DnsNet,
    label: String,
    next_id: AtomicU16,
}

impl DnsOutbound {
    pub fn new(setting: &DnsSetting) -> anyhow::Result<Self> {
        let addr = setting.socket_addr()?;
        let scheme = match setting.net {
            DnsNet::Udp => "udp",
            DnsNet::Tcp => "tcp",
        };
        Ok(Self {
            addr,
            net: setting.net,
            label: format!("{scheme}://{addr}"),
            next_id: AtomicU16::new(std::process::id() as u16),
        })
    }

    /// Encodes `req` under a fresh transaction id; returns (packet, wire id).
    fn encode(&self, req: &Message) -> Result<(Vec<u8>, u16), OutboundError> {
        let wire_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = req.clone();
        msg.set_id(wire_id);
        Ok((msg.to_vec()?, wire_id))
    }

    fn decode(&self, buf: &[u8], wire_id: u16, req: &Message) -> Result<Message, OutboundError> {
        let mut resp = Message::from_vec(buf)?;
        if resp.id() != wire_id {
            return Err(OutboundError::IdMismatch {
                want: wire_id,
                got: resp.id(),
            });
        }
        resp.set_id(req.id());
        Ok(resp)
    }

    async fn exchange_udp(&self, req: &Message) -> Result<Message, OutboundError> {
        let (packet, wire_id) = self.encode(req)?;
        let sock = bind_udp(self.addr)?;
        sock.connect(self.addr).await?;
        sock.send(&packet).await?;

        let mut buf = vec![0u8; UDP_RECV_BUF];
        loop {
            let size = sock.recv(&mut buf).await?;
            // 丢弃 id 不匹配的迟到包 / drop stale datagrams with a foreign id
            if size >= 2 && u16::from_be_bytes([buf[0], buf[1]]) != wire_id {
                debug!(upstream = %self.label, "dropping udp datagram with unexpected id");
                continue;
            }
            return self.decode(&buf[..size], wire_id, req);
        }
    }

    async fn exchange_tcp(&self, req: &Message) -> Result<Message, OutboundError> {
        let (packet, wire_id) = self.encode(req)?;
        let mut stream = TcpStream::connect(self.addr).await?;
        let _ = stream.set_nodelay(true);

        let mut out = Vec::with_capacity(packet.len() + 2);
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(&packet);
        stream.write_all(&out).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;
        self.decode(&buf, wire_id, req)
    }
}

fn bind_udp(remote: SocketAddr) -> Result<UdpSocket, OutboundError> {
    let (domain, local): (Domain, SocketAddr) = if remote.is_ipv4() {
        (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    } else {
        (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUF) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[async_trait]
impl Outbound for DnsOutbound {
    async fn invoke(&self, req: &Message) -> Result<Message, OutboundError> {
        match self.net {
            DnsNet::Tcp => self.exchange_tcp(req).await,
            DnsNet::Udp => {
                let resp = self.exchange_udp(req).await?;
                if resp.truncated() {
                    debug!(event = "udp_forward_fallback_tcp", upstream = %self.label, "truncated, retrying over tcp");
                    return self.exchange_tcp(req).await;
                }
                Ok(resp)
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}
