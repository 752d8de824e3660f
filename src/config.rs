use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// 按域名选择分组的规则；目前只校验，不参与匹配。
    #[serde(default)]
    pub routing: Vec<RoutingRule>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    /// 监听地址，如 0.0.0.0:5353。
    pub listen: String,
    #[serde(default)]
    pub net: InboundNet,
}

impl InboundConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid inbound listen address: {}", self.listen))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundNet {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default, alias = "cacheMissResponseMode")]
    pub response_mode: ResponseMode,
    /// 按顺序错峰执行，先成功者生效。
    #[serde(default = "default_speed_checks", alias = "speedChecks")]
    pub speed_checks: Vec<ProbeSpec>,
    /// 应答中最多保留的记录数，缺省不限制。
    #[serde(default, alias = "maxIpsNumber")]
    pub max_answers: Option<usize>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl GroupConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

/// How a cache miss is answered.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseMode {
    /// First upstream to answer, then ping its IPs until one responds.
    #[default]
    FirstPing,
    /// Wait for every upstream and speed check all IPs.
    FastestIp,
    /// First upstream to answer, no speed check.
    FastestResponse,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol", content = "setting", rename_all = "lowercase")]
pub enum OutboundConfig {
    Dns(DnsSetting),
    Https(HttpsSetting),
    #[serde(alias = "sock5")]
    Socks5(Socks5Setting),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSetting {
    /// 8.8.8.8 或 1.1.1.1:53，缺省端口 53。
    pub addr: String,
    #[serde(default)]
    pub net: DnsNet,
}

impl DnsSetting {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.addr.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid dns outbound address: {}", self.addr))?;
        Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DnsNet {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpsSetting {
    /// https://doh.pub/dns-query
    pub addr: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Setting {
    pub addr: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    Ping,
    Tcp { port: u16 },
    Http { port: u16 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size", alias = "cacheSize")]
    pub size: usize,
    /// TTL 到期前主动刷新。
    #[serde(default = "default_true", alias = "prefetchDomain")]
    pub prefetch: bool,
    /// TTL 到期后仍返回旧应答。
    #[serde(default = "default_true", alias = "cacheExpired")]
    pub serve_expired: bool,
    /// 超过该秒数未被访问的条目会被移除，0 表示不限。
    #[serde(default, alias = "cacheExpiredTimeout")]
    pub expired_timeout: u64,
    /// 返回过期应答时使用的 TTL，缺省 prefetch 时 15，否则 5。
    #[serde(default, alias = "cacheExpiredReplyTtl")]
    pub expired_reply_ttl: Option<u32>,
    #[serde(
        default = "default_expired_prefetch_interval",
        alias = "cacheExpiredPrefetchTimeSecond"
    )]
    pub expired_prefetch_interval: u64,
    /// 后台刷新时每个探测重复多次取平均。
    #[serde(default = "default_true")]
    pub multi_prefetch_speed_check: bool,
}

impl CacheConfig {
    pub fn reply_ttl_when_expired(&self) -> u32 {
        self.expired_reply_ttl
            .unwrap_or(if self.prefetch { 15 } else { 5 })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            prefetch: true,
            serve_expired: true,
            expired_timeout: 0,
            expired_reply_ttl: None,
            expired_prefetch_interval: default_expired_prefetch_interval(),
            multi_prefetch_speed_check: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRule {
    /// geosite:cn, *.taobao.com, www.taobao.com
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(alias = "groupTag")]
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 格式日志。
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    validate(&cfg).with_context(|| format!("verify config file: {}", path.display()))?;

    info!(
        target = "config",
        inbounds = cfg.inbounds.len(),
        groups = cfg.groups.len(),
        "config loaded"
    );
    Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
    if cfg.inbounds.is_empty() {
        anyhow::bail!("at least one inbound is required");
    }
    for inbound in &cfg.inbounds {
        inbound.socket_addr()?;
    }

    if cfg.groups.is_empty() {
        anyhow::bail!("at least one group is required");
    }
    let mut tags = HashSet::new();
    for group in &cfg.groups {
        if !tags.insert(group.tag.as_str()) {
            anyhow::bail!("duplicate group tag: {}", group.tag);
        }
        validate_group(group).with_context(|| format!("group {}", group.tag))?;
    }

    if cfg.routing.is_empty() && cfg.groups.len() > 1 {
        anyhow::bail!("routing rules are required when more than one group is configured");
    }
    for (idx, rule) in cfg.routing.iter().enumerate() {
        if rule.domain.is_empty() {
            anyhow::bail!("routing[{idx}]: domain list is empty");
        }
        if !tags.contains(rule.group.as_str()) {
            anyhow::bail!("routing[{idx}]: unknown group {}", rule.group);
        }
    }
    Ok(())
}

fn validate_group(group: &GroupConfig) -> Result<()> {
    if group.outbounds.is_empty() {
        anyhow::bail!("outbounds are empty");
    }
    if group.cache.size == 0 {
        anyhow::bail!("cache size must be greater than 0");
    }
    if group.upstream_timeout_ms == 0 {
        anyhow::bail!("upstream_timeout_ms must be greater than 0");
    }
    for outbound in &group.outbounds {
        match outbound {
            OutboundConfig::Dns(setting) => {
                setting.socket_addr()?;
            }
            OutboundConfig::Https(setting) => {
                if !setting.addr.starts_with("https://") {
                    anyhow::bail!("https outbound must be an https:// url: {}", setting.addr);
                }
            }
            OutboundConfig::Socks5(_) => {}
        }
    }
    for probe in &group.speed_checks {
        if let ProbeSpec::Tcp { port: 0 } | ProbeSpec::Http { port: 0 } = probe {
            anyhow::bail!("speed check port must be greater than 0");
        }
    }
    Ok(())
}

fn default_tag() -> String {
    "default".to_string()
}

fn default_speed_checks() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec::Ping,
        ProbeSpec::Tcp { port: 80 },
        ProbeSpec::Tcp { port: 443 },
    ]
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    10240
}

fn default_expired_prefetch_interval() -> u64 {
    28800
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: serde_json::Value) -> Config {
        serde_json::from_value(raw).expect("parse config")
    }

    fn minimal() -> serde_json::Value {
        json!({
            "inbounds": [ { "listen": "127.0.0.1:8053" } ],
            "groups": [ {
                "outbounds": [ { "protocol": "dns", "setting": { "addr": "8.8.8.8" } } ]
            } ]
        })
    }

    #[test]
    fn group_defaults_are_filled_in() {
        let cfg = parse(minimal());
        validate(&cfg).unwrap();
        assert_eq!(cfg.inbounds[0].net, InboundNet::Udp);

        let group = &cfg.groups[0];
        assert_eq!(group.tag, "default");
        assert_eq!(group.response_mode, ResponseMode::FirstPing);
        assert_eq!(group.speed_checks, default_speed_checks());
        assert_eq!(group.max_answers, None);
        assert_eq!(group.upstream_timeout(), Duration::from_secs(5));

        let cache = &group.cache;
        assert_eq!(cache.size, 10240);
        assert!(cache.prefetch && cache.serve_expired && cache.multi_prefetch_speed_check);
        assert_eq!(cache.expired_timeout, 0);
        assert_eq!(cache.expired_prefetch_interval, 28800);
        assert_eq!(cache.reply_ttl_when_expired(), 15);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn expired_reply_ttl_depends_on_prefetch() {
        let mut raw = minimal();
        raw["groups"][0]["cache"] = json!({ "prefetch": false });
        let cfg = parse(raw);
        assert_eq!(cfg.groups[0].cache.reply_ttl_when_expired(), 5);

        let mut raw = minimal();
        raw["groups"][0]["cache"] = json!({ "expired_reply_ttl": 30 });
        assert_eq!(parse(raw).groups[0].cache.reply_ttl_when_expired(), 30);
    }

    #[test]
    fn dns_outbound_gets_default_port() {
        let setting = DnsSetting {
            addr: "223.5.5.5".to_string(),
            net: DnsNet::Udp,
        };
        assert_eq!(setting.socket_addr().unwrap(), "223.5.5.5:53".parse().unwrap());
        let v6 = DnsSetting {
            addr: "2400:3200::1".to_string(),
            net: DnsNet::Tcp,
        };
        assert_eq!(v6.socket_addr().unwrap().port(), 53);
        let explicit = DnsSetting {
            addr: "1.1.1.1:5353".to_string(),
            net: DnsNet::Udp,
        };
        assert_eq!(explicit.socket_addr().unwrap().port(), 5353);
    }

    #[test]
    fn outbound_protocols_and_probes_parse() {
        let mut raw = minimal();
        raw["groups"][0]["outbounds"] = json!([
            { "protocol": "dns", "setting": { "addr": "1.1.1.1", "net": "tcp" } },
            { "protocol": "https", "setting": { "addr": "https://doh.pub/dns-query" } },
            { "protocol": "sock5", "setting": { "addr": "127.0.0.1:1080" } }
        ]);
        raw["groups"][0]["speed_checks"] = json!([ { "type": "http", "port": 8080 } ]);
        raw["groups"][0]["response_mode"] = json!("fastest-ip");
        let cfg = parse(raw);
        validate(&cfg).unwrap();

        let group = &cfg.groups[0];
        assert!(matches!(
            &group.outbounds[0],
            OutboundConfig::Dns(DnsSetting { net: DnsNet::Tcp, .. })
        ));
        assert!(matches!(&group.outbounds[1], OutboundConfig::Https(_)));
        assert!(matches!(&group.outbounds[2], OutboundConfig::Socks5(_)));
        assert_eq!(group.speed_checks, vec![ProbeSpec::Http { port: 8080 }]);
        assert_eq!(group.response_mode, ResponseMode::FastestIp);
    }

    #[test]
    fn validation_rejects_broken_configs() {
        let mut no_inbound = minimal();
        no_inbound["inbounds"] = json!([]);
        assert!(validate(&parse(no_inbound)).is_err());

        let mut no_outbound = minimal();
        no_outbound["groups"][0]["outbounds"] = json!([]);
        assert!(validate(&parse(no_outbound)).is_err());

        let mut bad_dns = minimal();
        bad_dns["groups"][0]["outbounds"][0]["setting"]["addr"] = json!("dns.google");
        assert!(validate(&parse(bad_dns)).is_err());

        let mut bad_doh = minimal();
        bad_doh["groups"][0]["outbounds"] =
            json!([ { "protocol": "https", "setting": { "addr": "http://doh.pub/dns-query" } } ]);
        assert!(validate(&parse(bad_doh)).is_err());

        let mut zero_cache = minimal();
        zero_cache["groups"][0]["cache"] = json!({ "size": 0 });
        assert!(validate(&parse(zero_cache)).is_err());

        let mut zero_port = minimal();
        zero_port["groups"][0]["speed_checks"] = json!([ { "type": "tcp", "port": 0 } ]);
        assert!(validate(&parse(zero_port)).is_err());
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let cfg: Config = serde_json::from_str(include_str!("../config/xdns.json")).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.inbounds.len(), 2);
        assert_eq!(cfg.groups[0].outbounds.len(), 3);
    }

    #[test]
    fn multiple_groups_need_unique_tags_and_routing() {
        let group = minimal()["groups"][0].clone();
        let mut second = group.clone();
        second["tag"] = json!("cn");

        let mut raw = minimal();
        raw["groups"] = json!([group.clone(), group.clone()]);
        assert!(validate(&parse(raw)).is_err(), "duplicate tags");

        let mut raw = minimal();
        raw["groups"] = json!([group.clone(), second.clone()]);
        assert!(validate(&parse(raw)).is_err(), "missing routing");

        let mut raw = minimal();
        raw["groups"] = json!([group.clone(), second.clone()]);
        raw["routing"] = json!([ { "domain": ["geosite:cn"], "group": "nope" } ]);
        assert!(validate(&parse(raw)).is_err(), "unknown group");

        let mut raw = minimal();
        raw["groups"] = json!([group, second]);
        raw["routing"] = json!([ { "domain": ["geosite:cn"], "groupTag": "cn" } ]);
        validate(&parse(raw)).unwrap();
    }
}
