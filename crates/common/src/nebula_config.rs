//! Nebula node configuration
//!
//! A typed model of the subset of the Nebula YAML config the console
//! generates for provisioned devices, plus a structural checker for YAML
//! produced elsewhere.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level sections every usable node config carries
pub const REQUIRED_SECTIONS: &[&str] = &[
    "pki",
    "static_host_map",
    "lighthouse",
    "listen",
    "punchy",
    "tun",
];

/// A lighthouse as seen by clients: overlay address plus public endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lighthouse {
    pub nebula_ip: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NebulaConfig {
    pub pki: PkiSection,
    pub static_host_map: BTreeMap<String, Vec<String>>,
    pub lighthouse: LighthouseSection,
    pub listen: ListenSection,
    pub punchy: PunchySection,
    pub tun: TunSection,
    pub logging: LoggingSection,
    pub firewall: FirewallSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiSection {
    pub ca: String,
    pub cert: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LighthouseSection {
    pub am_lighthouse: bool,
    pub interval: u32,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchySection {
    pub punch: bool,
    pub respond: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSection {
    pub disabled: bool,
    pub dev: String,
    pub drop_local_broadcast: bool,
    pub drop_multicast: bool,
    pub tx_queue: u32,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSection {
    pub conntrack: Conntrack,
    pub outbound: Vec<FirewallRule>,
    pub inbound: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conntrack {
    pub tcp_timeout: String,
    pub udp_timeout: String,
    pub default_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub port: String,
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl FirewallRule {
    fn allow_any() -> Self {
        Self {
            port: "any".to_string(),
            proto: "any".to_string(),
            host: Some("any".to_string()),
            group: None,
        }
    }
}

impl Default for NebulaConfig {
    fn default() -> Self {
        Self {
            pki: PkiSection {
                ca: "/etc/nebula/ca.crt".to_string(),
                cert: "/etc/nebula/host.crt".to_string(),
                key: "/etc/nebula/host.key".to_string(),
                blocklist: Vec::new(),
            },
            static_host_map: BTreeMap::new(),
            lighthouse: LighthouseSection {
                am_lighthouse: false,
                interval: 60,
                hosts: Vec::new(),
            },
            listen: ListenSection {
                host: "0.0.0.0".to_string(),
                port: 4242,
            },
            punchy: PunchySection {
                punch: true,
                respond: true,
            },
            tun: TunSection {
                disabled: false,
                dev: "nebula1".to_string(),
                drop_local_broadcast: false,
                drop_multicast: false,
                tx_queue: 500,
                mtu: 1300,
            },
            logging: LoggingSection {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            firewall: FirewallSection {
                conntrack: Conntrack {
                    tcp_timeout: "12m".to_string(),
                    udp_timeout: "3m".to_string(),
                    default_timeout: "10m".to_string(),
                },
                outbound: vec![FirewallRule::allow_any()],
                inbound: vec![FirewallRule::allow_any()],
            },
        }
    }
}

impl NebulaConfig {
    /// Config for a non-lighthouse client keeping its PKI files in `pki_dir`.
    ///
    /// `path_sep` is the separator of the target platform.
    pub fn client(pki_dir: &str, path_sep: char, lighthouses: &[Lighthouse]) -> Self {
        let mut config = Self::default();
        config.set_pki_dir(pki_dir, path_sep);
        // Clients pick an ephemeral port; only lighthouses need a fixed one.
        config.listen.port = 0;
        for lh in lighthouses {
            config.add_static_host(&lh.nebula_ip, &lh.endpoints);
        }
        config
    }

    pub fn set_pki_dir(&mut self, dir: &str, path_sep: char) {
        let dir = dir.trim_end_matches(path_sep);
        self.pki.ca = format!("{}{}ca.crt", dir, path_sep);
        self.pki.cert = format!("{}{}host.crt", dir, path_sep);
        self.pki.key = format!("{}{}host.key", dir, path_sep);
    }

    /// Register a lighthouse: static endpoints plus lighthouse host entry.
    /// `nebula_ip` may carry a prefix; only the address is used.
    pub fn add_static_host(&mut self, nebula_ip: &str, endpoints: &[String]) {
        let ip = nebula_ip.split('/').next().unwrap_or(nebula_ip).to_string();
        let entry = self.static_host_map.entry(ip.clone()).or_default();
        for endpoint in endpoints {
            if !entry.contains(endpoint) {
                entry.push(endpoint.clone());
            }
        }
        if !self.lighthouse.am_lighthouse && !self.lighthouse.hosts.contains(&ip) {
            self.lighthouse.hosts.push(ip);
        }
    }

    pub fn set_blocklist(&mut self, fingerprints: Vec<String>) {
        self.pki.blocklist = fingerprints;
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Structural problems with a Nebula YAML document. Empty means usable.
pub fn validate_yaml(yaml: &str) -> Vec<String> {
    let doc: serde_yaml::Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(e) => return vec![format!("Invalid YAML: {}", e)],
    };
    let map = match doc.as_mapping() {
        Some(m) => m,
        None => return vec!["Configuration must be a mapping".to_string()],
    };

    let mut problems = Vec::new();
    for section in REQUIRED_SECTIONS {
        if !map.contains_key(*section) {
            problems.push(format!("Missing required section: {}", section));
        }
    }

    let require = |problems: &mut Vec<String>, section: &str, keys: &[&str]| {
        if let Some(value) = map.get(section) {
            match value.as_mapping() {
                Some(inner) => {
                    for key in keys {
                        if !inner.contains_key(*key) {
                            problems.push(format!("Missing {}.{}", section, key));
                        }
                    }
                }
                None => problems.push(format!("Section {} must be a mapping", section)),
            }
        }
    };
    require(&mut problems, "pki", &["ca", "cert", "key"]);
    require(&mut problems, "lighthouse", &["am_lighthouse"]);
    require(&mut problems, "listen", &["host", "port"]);

    if let Some(port) = map.get("listen").and_then(|l| l.get("port")) {
        if port.as_u64().map_or(true, |p| p > u16::MAX as u64) {
            problems.push("listen.port must be a number between 0 and 65535".to_string());
        }
    }

    problems
}
