use std::path::Path;

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: crate::hostenv::Config,
    #[serde(default)]
    pub transport: crate::transport::Config,
}

impl Config {
    pub fn load(path: &Path) -> Self {
        let conf = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(::config::Environment::default().separator("_"))
            .build()
            .expect("unable to read configuration");
        conf.try_deserialize()
            .expect("configuration format invalid")
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    #[test]
    fn should_fall_back_to_defaults() {
        let config = super::Config::default();
        assert_eq!(config.host.hostname, "lancast");
        assert_eq!(config.transport.interface, Ipv4Addr::UNSPECIFIED);
        assert!(config.transport.loopback);
    }
}
