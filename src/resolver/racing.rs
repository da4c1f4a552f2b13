use crate::{
    protocol::MAX_PACKET_SIZE,
    resolver::*,
    stats::Stats,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinSet, time};
use tracing::{debug, trace};

/// Result of fanning one query out to every upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaceOutcome {
    Winner { payload: Bytes, upstream: usize },
    Timeout,
}

/// Resolver that sends each query to all upstreams at once and relays
/// whichever reply arrives first.
///
/// Replies are opaque: they are never parsed, only passed back verbatim.
pub struct RacingResolver {
    upstreams: Arc<[SocketAddr]>,
    timeout: Duration,
    stats: Stats,
}

struct Candidate {
    payload: Bytes,
    upstream: usize,
}

impl RacingResolver {
    pub fn new(upstreams: Vec<SocketAddr>, timeout: Duration, stats: Stats) -> RacingResolver {
        RacingResolver {
            upstreams: upstreams.into(),
            timeout,
            stats,
        }
    }

    /// Races `query` across every upstream.
    ///
    /// Each attempt delivers into a single-slot channel without waiting, so
    /// only the first reply is ever taken; later ones find the slot full
    /// and are dropped. Attempts still in flight when the race ends are
    /// aborted along with their sockets.
    pub async fn race(&self, query: Bytes) -> RaceOutcome {
        let (sender, mut receiver) = mpsc::channel::<Candidate>(1);
        let mut attempts = JoinSet::new();

        for (index, &upstream) in self.upstreams.iter().enumerate() {
            let sender = sender.clone();
            let query = query.clone();
            let timeout = self.timeout;

            attempts.spawn(async move {
                match forward(&query, upstream, timeout).await {
                    Ok(payload) => {
                        let candidate = Candidate {
                            payload,
                            upstream: index,
                        };
                        if sender.try_send(candidate).is_err() {
                            trace!(%upstream, "Discarding late reply");
                        }
                    }
                    Err(err) => debug!(%upstream, %err, "Upstream attempt failed"),
                }
            });
        }

        // Only attempts hold senders now, so the channel closes once they all fail
        drop(sender);

        match time::timeout(self.timeout, receiver.recv()).await {
            Ok(Some(Candidate { payload, upstream })) => {
                self.stats.record_hit(upstream);
                RaceOutcome::Winner { payload, upstream }
            }
            Ok(None) | Err(_) => RaceOutcome::Timeout,
        }
    }
}

/// Sends `query` to `upstream` from a fresh ephemeral socket and waits up
/// to `timeout` for one reply.
async fn forward(query: &[u8], upstream: SocketAddr, timeout: Duration) -> io::Result<Bytes> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    // Connected, so replies from any other source address are discarded
    socket.connect(upstream).await?;

    trace!(%upstream, len = query.len(), "Forwarding query");
    socket.send(query).await?;

    let mut buf = [0u8; MAX_PACKET_SIZE];
    let size = time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

    Ok(Bytes::copy_from_slice(&buf[..size]))
}

#[async_trait]
impl Resolver for RacingResolver {
    async fn query(&self, request: Request) -> Result<Response, ResolveError> {
        if self.upstreams.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }

        match self.race(request.raw).await {
            RaceOutcome::Winner { payload, upstream } => {
                let origin = self.upstreams[upstream];
                debug!(name = %request.query.name, %origin, "Relaying upstream reply");
                Ok(Response::Relayed { payload, origin })
            }
            RaceOutcome::Timeout => Err(ResolveError::TimedOut(self.timeout)),
        }
    }
}
