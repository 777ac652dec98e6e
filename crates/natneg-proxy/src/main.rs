#![forbid(unsafe_code)]

use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use natneg_proxy::{spawn_public_ip_refresher, start_proxy, AddressTranslator, ProxyConfig};

#[derive(Default)]
struct CliArgs {
    bind: Option<SocketAddr>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--bind" {
            let value = args
                .next()
                .ok_or_else(|| "--bind requires a value like 0.0.0.0:27901".to_string())?;
            out.bind = Some(
                SocketAddr::from_str(&value)
                    .map_err(|_| format!("invalid --bind value {value:?}"))?,
            );
            continue;
        }

        if let Some(value) = arg.strip_prefix("--bind=") {
            out.bind = Some(
                SocketAddr::from_str(value)
                    .map_err(|_| format!("invalid --bind value {value:?}"))?,
            );
            continue;
        }

        if arg == "--help" || arg == "-h" {
            println!(
                "Usage: natneg-proxy [--bind <ip:port>]\n\
                 \n\
                 Options:\n\
                 \t--bind <ip:port>\tOverride the front socket bind address (env: NATNEG_LISTEN_ADDR)"
            );
            std::process::exit(0);
        }

        return Err(format!("unknown argument {arg:?}"));
    }

    Ok(out)
}

fn tokio_worker_threads_from_env() -> Option<usize> {
    let raw = std::env::var("NATNEG_TOKIO_WORKER_THREADS").ok()?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            eprintln!(
                "warning: invalid NATNEG_TOKIO_WORKER_THREADS value: {raw:?} (expected positive integer); using Tokio default"
            );
            None
        }
    }
}

fn build_tokio_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = tokio_worker_threads_from_env() {
        builder.worker_threads(n);
    }
    builder.enable_all().build()
}

fn main() -> std::io::Result<()> {
    build_tokio_runtime()?.block_on(async_main())
}

async fn async_main() -> std::io::Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = ProxyConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let translator = Arc::new(AddressTranslator::new(
        config.public_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
    ));
    let _refresher = match config.public_ip {
        Some(ip) => {
            tracing::info!("using static public address {ip}");
            None
        }
        None => Some(spawn_public_ip_refresher(
            &translator,
            config.public_ip_url.clone(),
            config.public_ip_refresh,
        )),
    };

    let handle = start_proxy(config, translator.clone()).await?;
    tracing::info!("natneg-proxy listening on udp://{}", handle.local_addr());

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
