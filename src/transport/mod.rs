use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const READ_CHUNK: usize = 512;

// How long a follow-up read may wait before the response is considered
// complete. The backend writes each response in one burst; there is no
// length prefix to read against.
#[cfg(not(test))]
const DRAIN_WINDOW: Duration = Duration::from_millis(25);
#[cfg(test)]
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("exchange timed out")]
    TimedOut,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One persistent stream to the backend. At most one exchange is in flight
/// at a time; a second caller blocks on the internal lock until the first
/// completes or times out. Instances are discarded after failure or close,
/// never reconnected.
pub struct Transport {
    stream: Mutex<Option<TcpStream>>,
    healthy: AtomicBool,
}

impl Transport {
    pub async fn connect(address: &str, port: u16) -> Result<Self, ExchangeError> {
        let stream = TcpStream::connect((address, port)).await?;
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            healthy: AtomicBool::new(true),
        })
    }

    /// True while the stream is held and no read/write has failed. A
    /// half-open connection may still report true until an exchange fails.
    pub fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Writes the full packet, then reads until the peer stops sending:
    /// the first burst is awaited within `timeout`, follow-up bytes are
    /// drained only while they keep arriving within a short quiescence
    /// window. The exchange lock is released on every path, including
    /// timeout.
    pub async fn exchange(
        &self,
        packet: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ExchangeError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(ExchangeError::NotConnected)?;

        match tokio::time::timeout(timeout, write_then_drain(stream, packet)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.healthy.store(false, Ordering::Release);
                Err(ExchangeError::Io(err))
            }
            Err(_) => {
                // An abandoned exchange leaves the stream state unknown; any
                // late bytes would bleed into the next exchange, so force a
                // rebuild on next use.
                self.healthy.store(false, Ordering::Release);
                Err(ExchangeError::TimedOut)
            }
        }
    }

    /// Idempotent; safe after a failed exchange.
    pub async fn close(&self) {
        self.healthy.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn write_then_drain(stream: &mut TcpStream, packet: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(packet).await?;

    let mut response = Vec::new();
    let mut buf = [0u8; READ_CHUNK];

    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed connection",
        ));
    }
    response.extend_from_slice(&buf[..n]);

    loop {
        match tokio::time::timeout(DRAIN_WINDOW, stream.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(err)) => return Err(err),
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TEST_TIMEOUT: Duration = Duration::from_millis(200);

    async fn listener() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn exchange_returns_single_burst_response() {
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x01, b'\n']);
            peer.write_all(&[0x40]).await.unwrap();
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        let response = transport
            .exchange(&[0x01, b'\n'], TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response, vec![0x40]);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn exchange_times_out_and_releases_lock() {
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            // Swallow the first request without answering, answer the second.
            let _ = peer.read(&mut buf).await.unwrap();
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(&[0x40]).await.unwrap();
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        let err = transport
            .exchange(&[0x00, b'\n'], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::TimedOut));
        assert!(!transport.is_connected());

        // The lock must have been released; the slot is still usable.
        let response = transport
            .exchange(&[0x00, b'\n'], TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response, vec![0x40]);
    }

    #[tokio::test]
    async fn fragmented_response_past_quiescence_window_is_truncated() {
        // Documents the drain-until-quiescent framing assumption: a peer
        // that pauses longer than the window between bursts loses the tail.
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(&[0x40, b'A']).await.unwrap();
            tokio::time::sleep(DRAIN_WINDOW * 10).await;
            peer.write_all(b"B").await.unwrap();
            // Hold the socket open so the late write is observable.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        let response = transport
            .exchange(&[0x04, b'\n'], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![0x40, b'A']);
    }

    #[tokio::test]
    async fn fragmented_response_within_window_is_joined() {
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(&[0x40]).await.unwrap();
            peer.write_all(b"Scene").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        let response = transport
            .exchange(&[0x04, b'\n'], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&response[..1], &[0x40]);
        assert_eq!(&response[1..], b"Scene");
    }

    #[tokio::test]
    async fn peer_disconnect_marks_transport_unhealthy() {
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            drop(peer);
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        // Give the close a moment to land, then exchange against it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = transport.exchange(&[0x00, b'\n'], TEST_TIMEOUT).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (listener, addr, port) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let transport = Transport::connect(&addr, port).await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
        let err = transport
            .exchange(&[0x00, b'\n'], TEST_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NotConnected));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_error() {
        // Port 1 on localhost is assumed closed.
        let result = Transport::connect("127.0.0.1", 1).await;
        assert!(result.is_err());
    }
}
