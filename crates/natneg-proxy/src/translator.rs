use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Mutex,
};

/// Maps proxy-local endpoints to their public form by substituting the
/// proxy's public IPv4 while preserving the port.
///
/// This is the one value read across session tasks without serialization, so
/// it sits behind its own mutex. Writers are the public-IP refresher (or a
/// static configuration), readers are the game connections rewriting
/// `connect`/`connectPing` payloads.
#[derive(Debug)]
pub struct AddressTranslator {
    public_ip: Mutex<Ipv4Addr>,
}

impl AddressTranslator {
    pub fn new(public_ip: Ipv4Addr) -> Self {
        Self {
            public_ip: Mutex::new(public_ip),
        }
    }

    pub fn public_ip(&self) -> Ipv4Addr {
        *self.public_ip.lock().expect("public ip mutex poisoned")
    }

    pub fn set_public_ip(&self, ip: Ipv4Addr) {
        *self.public_ip.lock().expect("public ip mutex poisoned") = ip;
        tracing::info!("public address updated to {ip}");
    }

    pub fn local_to_public(&self, local: SocketAddr) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.public_ip()), local.port())
    }
}
