//! WebSocket tunnel pass-through (§4.J "Websocket endpoint"), grounded on
//! the original project's `service/emby/socket.go`. No message inspection
//! is performed; this is a pure byte-level tunnel between the client and
//! the upstream Emby websocket endpoint.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{AppError, AppResult};

/// Bidirectionally copies bytes between an upgraded client connection and
/// an upgraded upstream connection until either side closes or errors.
pub async fn tunnel<A, B>(mut client: A, mut upstream: B) -> AppResult<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .map_err(|e| AppError::internal(format!("websocket tunnel closed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn tunnel_relays_bytes_until_both_sides_close() {
        let (mut client_side, client) = duplex(64);
        let (mut upstream_side, upstream) = duplex(64);

        let handle = tokio::spawn(tunnel(client, upstream));

        tokio::io::AsyncWriteExt::write_all(&mut client_side, b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut upstream_side, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client_side);
        drop(upstream_side);
        let _ = handle.await.unwrap();
    }
}
