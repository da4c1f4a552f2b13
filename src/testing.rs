//! Stub upstream servers for socket-level tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::UdpSocket;

/// A UDP server on an ephemeral loopback port that records every datagram
/// it receives and, if configured, replies to each with a fixed payload
/// after a delay.
pub struct StubUpstream {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Bytes>>>,
}

impl StubUpstream {
    /// A stub that never replies.
    pub async fn silent() -> StubUpstream {
        StubUpstream::start(None).await
    }

    pub async fn replying(delay: Duration, payload: &'static [u8]) -> StubUpstream {
        StubUpstream::start(Some((delay, Bytes::from_static(payload)))).await
    }

    async fn start(reply: Option<(Duration, Bytes)>) -> StubUpstream {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&received);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                recorded.lock().push(Bytes::copy_from_slice(&buf[..len]));

                if let Some((delay, payload)) = reply.clone() {
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = socket.send_to(&payload, peer).await;
                    });
                }
            }
        });

        StubUpstream { addr, received }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }
}
