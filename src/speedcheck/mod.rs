//! Network speed checks used to rank candidate IP answers.
//!
//! For one IP the configured probes run concurrently but staggered, so the
//! cheapest method gets a head start; the first probe to succeed decides the
//! latency and the rest are dropped. Latencies are whole milliseconds and
//! [`UNREACHABLE`] marks an IP no probe could reach.

mod probe;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use hickory_proto::rr::Record;
use tokio::time::sleep;
use tracing::debug;

use crate::config::ProbeSpec;
use crate::proto_utils::{record_ip, split_ip_records};

pub use probe::{PROBE_TIMEOUT, Probe};

/// Latency of an IP that no probe reached.
pub const UNREACHABLE: u64 = u64::MAX;

const PROBE_STAGGER: Duration = Duration::from_millis(200);
const SAMPLE_COOLDOWN: Duration = Duration::from_secs(1);
/// A record is slow when it is both this many ms and this ratio above the fastest.
const SLOW_RISE_MS: u64 = 5;
const SLOW_RISE_RATIO: f64 = 0.2;

pub struct SpeedChecker {
    probes: Vec<Arc<dyn Probe>>,
}

impl SpeedChecker {
    pub fn new(probes: Vec<Arc<dyn Probe>>) -> Self {
        Self { probes }
    }

    pub fn from_specs(specs: &[ProbeSpec]) -> anyhow::Result<Self> {
        let probes = specs
            .iter()
            .map(probe::build)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(probes))
    }

    /// Latency of one IP in ms: first successful probe wins.
    pub async fn latency(&self, ip: IpAddr, samples: u32) -> u64 {
        if self.probes.is_empty() {
            return 0;
        }
        let samples = samples.max(1);
        let mut stagger = PROBE_STAGGER;
        if samples > 1 {
            stagger += SAMPLE_COOLDOWN * samples;
        }

        let mut rounds: FuturesUnordered<_> = self
            .probes
            .iter()
            .enumerate()
            .map(|(i, probe)| {
                let delay = stagger * i as u32;
                async move {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    (probe.name(), sampled(probe.as_ref(), ip, samples).await)
                }
            })
            .collect();

        while let Some((name, res)) = rounds.next().await {
            match res {
                Ok(ms) => {
                    debug!(probe = %name, ip = %ip, latency_ms = ms, samples, "speed check");
                    return ms;
                }
                Err(err) => debug!(probe = %name, ip = %ip, error = %err, "speed check failed"),
            }
        }
        UNREACHABLE
    }

    /// Latencies for every IP, index-aligned with `ips`.
    ///
    /// With `first_only` the round ends at the first IP that is reachable;
    /// every other IP keeps [`UNREACHABLE`].
    pub async fn measure_all(&self, ips: &[IpAddr], samples: u32, first_only: bool) -> Vec<u64> {
        if self.probes.is_empty() {
            return vec![0; ips.len()];
        }
        if !first_only {
            return join_all(ips.iter().map(|ip| self.latency(*ip, samples))).await;
        }

        let mut latencies = vec![UNREACHABLE; ips.len()];
        let mut round: FuturesUnordered<_> = ips
            .iter()
            .enumerate()
            .map(|(idx, ip)| async move { (idx, self.latency(*ip, samples).await) })
            .collect();
        while let Some((idx, ms)) = round.next().await {
            if ms != UNREACHABLE {
                latencies[idx] = ms;
                break;
            }
        }
        latencies
    }

    /// Reorders an answer section by measured latency, dropping slow IPs.
    pub async fn rank(&self, answers: Vec<Record>, samples: u32, first_only: bool) -> Vec<Record> {
        let (ips, others) = split_ip_records(answers);
        if ips.len() <= 1 {
            return ips.into_iter().chain(others).collect();
        }
        let addrs: Vec<IpAddr> = ips.iter().filter_map(record_ip).collect();
        if addrs.len() != ips.len() {
            // rdata 缺失时不做排序
            return ips.into_iter().chain(others).collect();
        }
        let latencies = self.measure_all(&addrs, samples, first_only).await;
        let mut ranked = rank_by_latency(ips, latencies);
        ranked.extend(others);
        ranked
    }
}

/// Runs `samples` measurements with a cooldown between them and averages.
///
/// A failed sample counts as [`PROBE_TIMEOUT`]; the probe only fails when no
/// sample succeeded.
async fn sampled(probe: &dyn Probe, ip: IpAddr, samples: u32) -> anyhow::Result<u64> {
    let mut total = Duration::ZERO;
    let mut succeeded = 0u32;
    let mut last_err = None;
    for i in 0..samples {
        if i > 0 {
            sleep(SAMPLE_COOLDOWN).await;
        }
        match probe.measure(ip).await {
            Ok(rtt) => {
                total += rtt;
                succeeded += 1;
            }
            Err(err) => {
                total += PROBE_TIMEOUT;
                last_err = Some(err);
            }
        }
    }
    if succeeded == 0 {
        return Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no samples taken")));
    }
    Ok(ceil_ms(total / samples))
}

fn ceil_ms(d: Duration) -> u64 {
    (d.as_micros() as u64).div_ceil(1000)
}

/// Stable ascending sort by latency, then drops records that are too slow
/// relative to the fastest. The fastest record is always kept.
pub fn rank_by_latency(records: Vec<Record>, latencies: Vec<u64>) -> Vec<Record> {
    let mut scored: Vec<(u64, Record)> = latencies.into_iter().zip(records).collect();
    scored.sort_by_key(|(ms, _)| *ms);

    let Some(min) = scored.first().map(|(ms, _)| *ms) else {
        return Vec::new();
    };
    scored
        .into_iter()
        .enumerate()
        .filter(|(i, (ms, _))| *i == 0 || !is_slow(*ms, min))
        .map(|(_, (_, rr))| rr)
        .collect()
}

fn is_slow(ms: u64, min: u64) -> bool {
    let rise = ms.saturating_sub(min);
    if rise <= SLOW_RISE_MS {
        return false;
    }
    if min == 0 {
        return true;
    }
    rise as f64 / min as f64 > SLOW_RISE_RATIO
}
