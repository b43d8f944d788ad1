pub mod cmd;
pub mod collections;
pub mod config;
pub mod error;
pub mod hostenv;
pub mod offswitch;
pub mod probe;
pub mod query;
pub mod resolve;
pub mod responder;
pub mod service;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use lancast_proto as proto;

pub fn init_logs() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, registry, EnvFilter};

    let _ = registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=info", env!("CARGO_PKG_NAME")).into()
        }))
        .with(fmt::layer().with_ansi(cfg!(debug_assertions)))
        .try_init();
}
