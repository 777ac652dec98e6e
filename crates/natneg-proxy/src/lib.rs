#![forbid(unsafe_code)]

mod config;
mod game_connection;
mod initial_phase;
mod proxy;
mod public_ip;
mod translator;

pub use config::ProxyConfig;
pub use proxy::{start_proxy, ProxyHandle};
pub use public_ip::spawn_public_ip_refresher;
pub use translator::AddressTranslator;
