//! Tunnel configuration options and the client config generator.
//!
//! [`TunnelOptions`] is the structured value a profile plus the detected
//! network produce. Unset optional fields fall back to the tunnel's own
//! defaults through the `effective_*` accessors; the generator omits them.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ping::extract_port;
use crate::probe::Marker;

pub const DEFAULT_SOCKS_LISTEN: &str = "127.0.0.1:1080";
pub const DEFAULT_MODE: &str = "fast3";
pub const DEFAULT_CONN: u32 = 2;
pub const DEFAULT_BLOCK: &str = "aes";
pub const DEFAULT_LOG_LEVEL: &str = "none";

/// Every field needed to render a paqet client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelOptions {
    // Required
    pub server_addr: String,
    pub key: String,
    pub interface_name: String,
    /// `ip:port` the injected packets originate from
    pub local_addr: String,
    pub gateway_mac: String,

    /// Npcap device GUID (Windows only)
    pub capture_device_id: Option<String>,

    // SOCKS5
    pub socks_listen: Option<String>,
    pub socks_user: Option<String>,
    pub socks_pass: Option<String>,

    // KCP
    pub mode: Option<String>,
    pub conn: Option<u32>,
    pub mtu: Option<u32>,
    pub block: Option<String>,
    pub rcv_wnd: Option<u32>,
    pub snd_wnd: Option<u32>,
    pub data_shard: Option<u32>,
    pub parity_shard: Option<u32>,
    pub dscp: Option<u32>,

    // Buffers
    pub smux_buf: Option<u32>,
    pub stream_buf: Option<u32>,
    pub tcp_buf: Option<u32>,
    pub udp_buf: Option<u32>,
    pub sock_buf: Option<u32>,

    // TCP flags
    pub local_flag: Option<Marker>,
    pub remote_flag: Option<Marker>,

    pub forward: Vec<String>,
    pub log_level: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn non_zero(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v != 0)
}

impl TunnelOptions {
    pub fn effective_socks_listen(&self) -> &str {
        non_empty(&self.socks_listen).unwrap_or(DEFAULT_SOCKS_LISTEN)
    }

    pub fn effective_mode(&self) -> &str {
        non_empty(&self.mode).unwrap_or(DEFAULT_MODE)
    }

    pub fn effective_conn(&self) -> u32 {
        non_zero(self.conn).unwrap_or(DEFAULT_CONN)
    }

    pub fn effective_block(&self) -> &str {
        non_empty(&self.block).unwrap_or(DEFAULT_BLOCK)
    }

    pub fn effective_local_flag(&self) -> Marker {
        self.local_flag.unwrap_or_default()
    }

    pub fn effective_remote_flag(&self) -> Marker {
        self.remote_flag.unwrap_or_default()
    }

    pub fn effective_log_level(&self) -> &str {
        non_empty(&self.log_level).unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Copy of these options with both sides switched to `marker` and
    /// verbose tunnel logging.
    pub fn for_probe(&self, marker: Marker) -> Self {
        Self {
            local_flag: Some(marker),
            remote_flag: Some(marker),
            log_level: Some("debug".to_string()),
            ..self.clone()
        }
    }

    /// One-line record of the transport parameters in effect.
    pub fn transport_summary(&self) -> String {
        format!(
            "mode={} conn={} block={} flags={} port={}",
            self.effective_mode(),
            self.effective_conn(),
            self.effective_block(),
            self.effective_local_flag(),
            extract_port(&self.server_addr),
        )
    }
}

/// Turns options into the tunnel's configuration document.
pub trait ConfigGenerator: Send + Sync {
    fn generate(&self, options: &TunnelOptions) -> Result<String, ConfigError>;
}

/// Renders the paqet client YAML format.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlConfigGenerator;

#[derive(Serialize)]
struct ClientDocument<'a> {
    role: &'static str,
    log: LogSection<'a>,
    socks5: Vec<SocksEntry<'a>>,
    network: NetworkSection<'a>,
    server: ServerSection<'a>,
    transport: TransportSection<'a>,
    #[serde(skip_serializing_if = "no_forwards")]
    forward: &'a [String],
}

#[derive(Serialize)]
struct LogSection<'a> {
    level: &'a str,
}

#[derive(Serialize)]
struct SocksEntry<'a> {
    listen: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct NetworkSection<'a> {
    interface: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    guid: Option<&'a str>,
    ipv4: Ipv4Section<'a>,
    tcp: TcpSection,
}

#[derive(Serialize)]
struct Ipv4Section<'a> {
    addr: &'a str,
    router_mac: &'a str,
}

#[derive(Serialize)]
struct TcpSection {
    local_flag: [Marker; 1],
    remote_flag: [Marker; 1],
}

#[derive(Serialize)]
struct ServerSection<'a> {
    addr: &'a str,
}

#[derive(Serialize)]
struct TransportSection<'a> {
    protocol: &'static str,
    conn: u32,
    kcp: KcpSection<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    smuxbuf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    streambuf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tcpbuf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udpbuf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sockbuf: Option<u32>,
}

#[derive(Serialize)]
struct KcpSection<'a> {
    mode: &'a str,
    key: &'a str,
    block: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rcvwnd: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sndwnd: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datashard: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parityshard: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dscp: Option<u32>,
}

fn no_forwards(forward: &&[String]) -> bool {
    forward.is_empty()
}

fn require<'a>(value: &'a str, name: &'static str) -> Result<&'a str, ConfigError> {
    if value.is_empty() {
        Err(ConfigError::MissingField(name))
    } else {
        Ok(value)
    }
}

impl ConfigGenerator for YamlConfigGenerator {
    fn generate(&self, o: &TunnelOptions) -> Result<String, ConfigError> {
        let server_addr = require(&o.server_addr, "server address")?;
        let key = require(&o.key, "key")?;
        let interface = require(&o.interface_name, "interface name")?;
        let local_addr = require(&o.local_addr, "local address")?;
        let gateway_mac = require(&o.gateway_mac, "gateway MAC")?;

        let doc = ClientDocument {
            role: "client",
            log: LogSection {
                level: o.effective_log_level(),
            },
            socks5: vec![SocksEntry {
                listen: o.effective_socks_listen(),
                username: non_empty(&o.socks_user),
                password: non_empty(&o.socks_pass),
            }],
            network: NetworkSection {
                interface,
                guid: non_empty(&o.capture_device_id),
                ipv4: Ipv4Section {
                    addr: local_addr,
                    router_mac: gateway_mac,
                },
                tcp: TcpSection {
                    local_flag: [o.effective_local_flag()],
                    remote_flag: [o.effective_remote_flag()],
                },
            },
            server: ServerSection { addr: server_addr },
            transport: TransportSection {
                protocol: "kcp",
                conn: o.effective_conn(),
                kcp: KcpSection {
                    mode: o.effective_mode(),
                    key,
                    block: o.effective_block(),
                    mtu: non_zero(o.mtu),
                    rcvwnd: non_zero(o.rcv_wnd),
                    sndwnd: non_zero(o.snd_wnd),
                    datashard: non_zero(o.data_shard),
                    parityshard: non_zero(o.parity_shard),
                    dscp: non_zero(o.dscp),
                },
                smuxbuf: non_zero(o.smux_buf),
                streambuf: non_zero(o.stream_buf),
                tcpbuf: non_zero(o.tcp_buf),
                udpbuf: non_zero(o.udp_buf),
                sockbuf: non_zero(o.sock_buf),
            },
            forward: &o.forward,
        };

        Ok(serde_yaml::to_string(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> TunnelOptions {
        TunnelOptions {
            server_addr: "1.2.3.4:9999".into(),
            key: "abcdef1234567890".into(),
            interface_name: "eth0".into(),
            local_addr: "10.0.0.1:12345".into(),
            gateway_mac: "aa:bb:cc:dd:ee:ff".into(),
            ..Default::default()
        }
    }

    fn parse(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn renders_defaults() {
        let doc = parse(&YamlConfigGenerator.generate(&required()).unwrap());

        assert_eq!(doc["role"], "client");
        assert_eq!(doc["log"]["level"], "none");
        assert_eq!(doc["socks5"][0]["listen"], "127.0.0.1:1080");
        assert_eq!(doc["network"]["tcp"]["local_flag"][0], "PA");
        assert_eq!(doc["network"]["tcp"]["remote_flag"][0], "PA");
        assert_eq!(doc["transport"]["protocol"], "kcp");
        assert_eq!(doc["transport"]["conn"], 2);
        assert_eq!(doc["transport"]["kcp"]["mode"], "fast3");
        assert_eq!(doc["transport"]["kcp"]["block"], "aes");
        assert_eq!(doc["server"]["addr"], "1.2.3.4:9999");
    }

    #[test]
    fn omits_unset_optionals() {
        let yaml = YamlConfigGenerator.generate(&required()).unwrap();

        for absent in ["guid", "mtu", "rcvwnd", "dscp", "smuxbuf", "forward", "username"] {
            assert!(!yaml.contains(absent), "{absent} should be omitted");
        }
    }

    #[test]
    fn zero_values_count_as_unset() {
        let opts = TunnelOptions {
            mtu: Some(0),
            conn: Some(0),
            mode: Some(String::new()),
            ..required()
        };
        let doc = parse(&YamlConfigGenerator.generate(&opts).unwrap());

        assert_eq!(doc["transport"]["conn"], 2);
        assert_eq!(doc["transport"]["kcp"]["mode"], "fast3");
        assert!(doc["transport"]["kcp"].get("mtu").is_none());
    }

    #[test]
    fn renders_custom_values() {
        let opts = TunnelOptions {
            capture_device_id: Some("{GUID-1}".into()),
            socks_user: Some("u".into()),
            socks_pass: Some("p".into()),
            mode: Some("fast".into()),
            conn: Some(1),
            mtu: Some(1350),
            local_flag: Some(Marker::Syn),
            remote_flag: Some(Marker::Ack),
            forward: vec!["tcp://127.0.0.1:8080=10.0.0.2:80".into()],
            ..required()
        };
        let doc = parse(&YamlConfigGenerator.generate(&opts).unwrap());

        assert_eq!(doc["network"]["guid"], "{GUID-1}");
        assert_eq!(doc["socks5"][0]["username"], "u");
        assert_eq!(doc["network"]["tcp"]["local_flag"][0], "S");
        assert_eq!(doc["network"]["tcp"]["remote_flag"][0], "A");
        assert_eq!(doc["transport"]["kcp"]["mtu"], 1350);
        assert_eq!(doc["forward"][0], "tcp://127.0.0.1:8080=10.0.0.2:80");
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let cases: [(fn(&mut TunnelOptions), &str); 5] = [
            (|o| o.server_addr.clear(), "server address"),
            (|o| o.key.clear(), "key"),
            (|o| o.interface_name.clear(), "interface name"),
            (|o| o.local_addr.clear(), "local address"),
            (|o| o.gateway_mac.clear(), "gateway MAC"),
        ];

        for (clear, name) in cases {
            let mut opts = required();
            clear(&mut opts);
            match YamlConfigGenerator.generate(&opts) {
                Err(ConfigError::MissingField(field)) => assert_eq!(field, name),
                other => panic!("expected MissingField({name}), got {other:?}"),
            }
        }
    }

    #[test]
    fn probe_copy_overrides_both_markers_and_log_level() {
        let base = TunnelOptions {
            local_flag: Some(Marker::PushAck),
            log_level: Some("info".into()),
            ..required()
        };
        let probe = base.for_probe(Marker::Syn);

        assert_eq!(probe.local_flag, Some(Marker::Syn));
        assert_eq!(probe.remote_flag, Some(Marker::Syn));
        assert_eq!(probe.log_level.as_deref(), Some("debug"));
        assert_eq!(probe.key, base.key);
        assert_eq!(base.local_flag, Some(Marker::PushAck));
    }

    #[test]
    fn transport_summary_uses_effective_values() {
        assert_eq!(
            required().transport_summary(),
            "mode=fast3 conn=2 block=aes flags=PA port=9999"
        );
    }
}
