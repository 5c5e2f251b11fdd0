use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use emby_proxy::config::Config;
use emby_proxy::emby::EmbyServices;
use emby_proxy::web::WebServer;

#[derive(Parser)]
#[command(name = "emby-proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A reverse proxy that sits in front of Emby and redirects playback to a cloud drive")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<IpAddr>,

    /// HTTP listening port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (overrides config file and RUST_LOG)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("emby_proxy={level}")))
}

/// Installs a reloadable `EnvFilter` and, on Unix, re-derives it from the
/// config file every `SIGHUP` without restarting the process.
fn init_logging(level: &str, disable_color: bool, config_path: String) -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let (filter, handle) = reload::Layer::new(build_filter(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
        .init();

    #[cfg(unix)]
    {
        let reload_handle = handle.clone();
        tokio::spawn(async move {
            let Ok(mut sighup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
                warn!("failed to install SIGHUP handler, log level reload disabled");
                return;
            };
            loop {
                sighup.recv().await;
                match Config::load_from_file(&config_path) {
                    Ok(cfg) => {
                        if reload_handle.reload(build_filter(&cfg.log.level)).is_ok() {
                            info!(level = %cfg.log.level, "reloaded log filter from SIGHUP");
                        }
                    }
                    Err(err) => warn!(error = %err, "SIGHUP log reload: failed to reread config"),
                }
            }
        });
    }

    handle
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from_file(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    let _reload_handle = init_logging(&config.log.level, config.log.disable_color, cli.config.clone());

    info!("starting emby-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %cli.config, "configuration loaded");

    if let Some(port) = cli.port {
        config.server.http_port = port;
    }

    if config.ssl.enable {
        warn!("ssl.enable is set but this build only terminates plain HTTP; serving HTTP only");
    }

    let host = cli.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(host, config.server.http_port);

    let services = EmbyServices::new(config)?;
    let web_server = WebServer::new(services, addr);

    info!(host = %web_server.host(), port = web_server.port(), "listening");
    web_server.serve().await?;

    Ok(())
}
