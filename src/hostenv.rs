use std::net::IpAddr;
use std::sync::Arc;

/// What the discovery core needs to know about the machine it runs on.
/// Address enumeration itself happens outside; the core only consumes the
/// result.
pub trait HostEnv: Send + Sync {
    /// The bare host label, without the `.local.` suffix.
    fn hostname(&self) -> String;

    fn addresses(&self) -> Vec<IpAddr>;

    fn is_local_address(&self, address: &IpAddr) -> bool {
        self.addresses().contains(address)
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            addresses: Vec::new(),
        }
    }
}

impl Config {
    fn default_hostname() -> String {
        "lancast".to_string()
    }

    pub fn build(self) -> Arc<dyn HostEnv> {
        Arc::new(StaticHostEnv {
            hostname: self.hostname,
            addresses: self.addresses,
        })
    }
}

/// A host environment fixed at configuration time.
#[derive(Debug, Clone)]
pub struct StaticHostEnv {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

impl HostEnv for StaticHostEnv {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.clone()
    }
}
