//! Latency probes: ICMP echo, TCP connect and HTTP GET.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::ProbeSpec;

/// Upper bound for a single measurement.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ECHO_PAYLOAD: &[u8] = b"xdns-speedcheck";

#[async_trait]
pub trait Probe: Send + Sync {
    /// Round-trip time to `ip`; errors mean the target is unreachable by this method.
    async fn measure(&self, ip: IpAddr) -> anyhow::Result<Duration>;

    fn name(&self) -> String;
}

pub fn build(spec: &ProbeSpec) -> anyhow::Result<Arc<dyn Probe>> {
    let probe: Arc<dyn Probe> = match *spec {
        ProbeSpec::Ping => Arc::new(PingProbe::new()),
        ProbeSpec::Tcp { port } => Arc::new(TcpProbe { port }),
        ProbeSpec::Http { port } => Arc::new(HttpProbe::new(port)?),
    };
    Ok(probe)
}

/// ICMP echo over an unprivileged datagram socket (`net.ipv4.ping_group_range`).
pub struct PingProbe {
    seq: AtomicU16,
}

impl PingProbe {
    pub fn new() -> Self {
        Self {
            seq: AtomicU16::new(0),
        }
    }

    fn socket(ip: IpAddr) -> anyhow::Result<UdpSocket> {
        let (domain, protocol) = match ip {
            IpAddr::V4(_) => (socket2::Domain::IPV4, socket2::Protocol::ICMPV4),
            IpAddr::V6(_) => (socket2::Domain::IPV6, socket2::Protocol::ICMPV6),
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(protocol))
            .context("open icmp datagram socket")?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn measure(&self, ip: IpAddr) -> anyhow::Result<Duration> {
        let sock = Self::socket(ip)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let packet = echo_request(ip.is_ipv4(), seq);
        let reply_type = if ip.is_ipv4() {
            ICMP_ECHO_REPLY
        } else {
            ICMPV6_ECHO_REPLY
        };

        let start = Instant::now();
        sock.send_to(&packet, SocketAddr::new(ip, 0)).await?;
        let mut buf = [0u8; 1500];
        timeout(PROBE_TIMEOUT, async {
            loop {
                // 内核会改写 identifier，只比对类型和序号
                let (n, _) = sock.recv_from(&mut buf).await?;
                if n >= 8
                    && buf[0] == reply_type
                    && u16::from_be_bytes([buf[6], buf[7]]) == seq
                {
                    return Ok::<_, anyhow::Error>(start.elapsed());
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("icmp echo to {ip} timed out"))?
    }

    fn name(&self) -> String {
        "ping".to_string()
    }
}

fn echo_request(v4: bool, seq: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    buf.push(if v4 { ICMP_ECHO_REQUEST } else { ICMPV6_ECHO_REQUEST });
    buf.push(0); // code
    buf.extend_from_slice(&[0, 0]); // checksum
    buf.extend_from_slice(&0u16.to_be_bytes()); // identifier, assigned by the kernel
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(ECHO_PAYLOAD);
    // ICMPv6 checksum is filled in by the kernel
    if v4 {
        let cksum = checksum(&buf);
        buf[2..4].copy_from_slice(&cksum.to_be_bytes());
    }
    buf
}

/// Internet checksum (RFC 1071).
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Time to complete a TCP handshake.
pub struct TcpProbe {
    port: u16,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn measure(&self, ip: IpAddr) -> anyhow::Result<Duration> {
        let addr = SocketAddr::new(ip, self.port);
        let start = Instant::now();
        match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e).with_context(|| format!("tcping {addr}")),
            Err(_) => bail!("tcping {addr} timed out"),
        }
    }

    fn name(&self) -> String {
        format!("tcp:{}", self.port)
    }
}

/// Time until response headers arrive for `GET http://ip:port/`.
pub struct HttpProbe {
    port: u16,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(port: u16) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .context("build httping client")?;
        Ok(Self { port, client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn measure(&self, ip: IpAddr) -> anyhow::Result<Duration> {
        let url = format!("http://{}/", SocketAddr::new(ip, self.port));
        let start = Instant::now();
        // 任意状态码都说明链路可达
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("httping {url}"))?;
        Ok(start.elapsed())
    }

    fn name(&self) -> String {
        format!("http:{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_echo_request_verifies_to_zero() {
        let packet = echo_request(true, 7);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 7);
        // 含校验和的报文再次求和应为 0
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn checksum_handles_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00);
    }

    #[tokio::test]
    async fn tcp_probe_measures_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe { port };
        let rtt = probe.measure("127.0.0.1".parse().unwrap()).await.unwrap();
        assert!(rtt < PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TcpProbe { port };
        assert!(probe.measure("127.0.0.1".parse().unwrap()).await.is_err());
    }

    #[test]
    fn build_names_probes_by_method() {
        let tcp = build(&ProbeSpec::Tcp { port: 443 }).unwrap();
        assert_eq!(tcp.name(), "tcp:443");
        assert_eq!(build(&ProbeSpec::Ping).unwrap().name(), "ping");
    }
}
