use std::{
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use tokio::task::JoinHandle;

use crate::translator::AddressTranslator;

/// Periodically discovers the proxy's public IPv4 and feeds it to the
/// address translator. Holds only a weak reference, so dropping the
/// translator stops the refresher.
pub fn spawn_public_ip_refresher(
    translator: &Arc<AddressTranslator>,
    url: String,
    interval: Duration,
) -> JoinHandle<()> {
    let translator = Arc::downgrade(translator);
    tokio::spawn(refresh_loop(translator, url, interval))
}

async fn refresh_loop(translator: Weak<AddressTranslator>, url: String, interval: Duration) {
    loop {
        let Some(translator) = translator.upgrade() else {
            tracing::debug!("address translator gone, stopping public IP refresh");
            return;
        };

        match fetch_public_ip(&url).await {
            Ok(ip) => translator.set_public_ip(ip),
            Err(err) => tracing::warn!("public IP lookup failed: {err:#}"),
        }
        drop(translator);

        tokio::time::sleep(interval).await;
    }
}

async fn fetch_public_ip(url: &str) -> anyhow::Result<Ipv4Addr> {
    let body = reqwest::get(url)
        .await
        .context("request failed")?
        .error_for_status()
        .context("request rejected")?
        .text()
        .await
        .context("reading response body")?;
    parse_ip_body(&body)
}

fn parse_ip_body(body: &str) -> anyhow::Result<Ipv4Addr> {
    body.trim()
        .parse::<Ipv4Addr>()
        .with_context(|| format!("unexpected response body {body:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_body_trims_whitespace() {
        assert_eq!(
            parse_ip_body("203.0.113.9\n").unwrap(),
            Ipv4Addr::new(203, 0, 113, 9)
        );
        assert!(parse_ip_body("<html>nope</html>").is_err());
    }
}
