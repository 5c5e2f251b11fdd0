//! Accept loop wiring the PROXY-protocol sniffer (§4.L) into an axum
//! [`Router`], using the same low-level hyper-util pattern axum itself
//! documents for custom transports, since sniffing the preamble requires
//! owning the accept loop rather than handing a bare `TcpListener` to
//! `axum::serve`.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tower::Service;
use tracing::{error, info, warn};

use crate::errors::AppResult;
use crate::listener::{real_ip_headers, sniff, ReplayStream};

/// Binds `addr` and serves `router` forever. When `proxy_protocol` is set,
/// every accepted connection is peeked for a PROXY v1/v2 preamble first and
/// `X-Real-IP`/`X-Forwarded-For` are stamped onto each request from the
/// resolved remote address; otherwise connections are served directly.
pub async fn serve(router: Router, addr: SocketAddr, proxy_protocol: bool) -> AppResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, proxy_protocol, "listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let router = router.clone();

        tokio::spawn(async move {
            let (io, real_addr) = if proxy_protocol {
                let sniffed = sniff(stream, peer_addr).await;
                let real_addr = sniffed.real_remote_addr;
                (ReplayStream::new(sniffed), real_addr)
            } else {
                (ReplayStream::passthrough(stream), peer_addr)
            };

            let headers = real_ip_headers(real_addr);
            let svc = tower::service_fn(move |mut req: Request| {
                let mut router = router.clone();
                let headers = headers.clone();
                async move {
                    for (name, value) in headers.iter() {
                        if let Ok(value) = value.parse() {
                            req.headers_mut().insert(*name, value);
                        }
                    }
                    router.call(req).await
                }
            });

            let io = TokioIo::new(io);
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, TowerToHyperService::new(svc))
                .await
            {
                warn!(error = %err, peer = %peer_addr, "connection closed with error");
            }
        });
    }
}
