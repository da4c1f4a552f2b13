use crate::protocol::{Query, MAX_PACKET_SIZE};
use crate::resolver::{Request, Resolver};
use bytes::Bytes;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, trace, warn};

/// A reply waiting to be written to the listening socket.
#[derive(Debug)]
pub struct OutboundDatagram {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

pub struct Server<R> {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher<R>>,
    outbound: mpsc::UnboundedReceiver<OutboundDatagram>,
}

impl<R> Server<R>
where
    R: Resolver + Send + Sync + 'static,
{
    pub fn new(socket: UdpSocket, resolver: R) -> Server<R> {
        let (responses, outbound) = mpsc::unbounded_channel();
        Server {
            socket: Arc::new(socket),
            dispatcher: Arc::new(Dispatcher {
                resolver,
                responses,
            }),
            outbound,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams forever, handling each in its own task.
    ///
    /// All replies go through one sender task, the only writer of the socket.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            socket,
            dispatcher,
            outbound,
        } = self;

        tokio::spawn(send_responses(Arc::clone(&socket), outbound));

        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (size, origin) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(err) => {
                    warn!(?err, "Error receiving datagram");
                    continue;
                }
            };

            // The buffer is reused by the next receive
            let bytes = Bytes::copy_from_slice(&buf[..size]);

            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.handle_request(bytes, origin).await;
            });
        }
    }
}

struct Dispatcher<R> {
    resolver: R,
    responses: mpsc::UnboundedSender<OutboundDatagram>,
}

impl<R> Dispatcher<R>
where
    R: Resolver + Send + Sync,
{
    async fn handle_request(&self, bytes: Bytes, origin: SocketAddr) {
        if let Some(payload) = self.respond(bytes, origin).await {
            let datagram = OutboundDatagram {
                destination: origin,
                payload,
            };
            if self.responses.send(datagram).is_err() {
                warn!(%origin, "Response sender has stopped, dropping reply");
            }
        }
    }

    /// Produces the reply for one datagram, or `None` when it should be
    /// dropped without an answer.
    async fn respond(&self, bytes: Bytes, origin: SocketAddr) -> Option<Bytes> {
        let query = match Query::from_bytes(&bytes) {
            Ok(query) => query,
            Err(err) => {
                debug!(%origin, %err, "Dropping malformed query");
                return None;
            }
        };

        debug!(name = %query.name, id = query.id, %origin, "Query");

        let request = Request { query, raw: bytes };
        let name = request.query.name.clone();

        match self.resolver.query(request).await {
            Ok(response) => match response.to_bytes() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(%name, %err, "Could not encode answer");
                    None
                }
            },
            Err(err) => {
                debug!(%name, %err, "Dropping unanswered query");
                None
            }
        }
    }
}

async fn send_responses(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<OutboundDatagram>,
) {
    while let Some(datagram) = outbound.recv().await {
        trace!(?datagram, "Send response");
        if let Err(err) = socket
            .send_to(&datagram.payload, datagram.destination)
            .await
        {
            warn!(?err, destination = %datagram.destination, "Failed to send response");
        }
    }
}
