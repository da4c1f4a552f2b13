pub mod overrides;
pub mod racing;

use crate::protocol::{Answer, ProtocolError, Query};
use async_trait::async_trait;
use bytes::Bytes;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;

/// A resolver takes queries and answers them. This can take many forms
/// from relaying requests to remote recursive servers to reading a fixed
/// set of records from configuration. From the caller's perspective what
/// the resolver does is not relevant, only the returned answer matters.
///
/// Resolvers are layered, the outer one short-circuiting when it can:
///
/// ```text
///               Local                        |  Remote
///                                            |
///  +--------+           +-----------+        |  +----------+
///  |        |  queries  | Overrides |  raw   |  |          |+
///  | Caller |---------->|     |     |--------|->| Upstream ||+
///  |        |           |     V     | bytes  |  | servers  |||
///  |        |<----------|  Racing   |<-------|--|          |||
///  |        | responses |           | first  |  +----------+||
///  +--------+           +-----------+ reply  |   +----------+|
///                             |              |    +----------+
///                     winners |              |
///                             V              |
///                       +-----------+        |
///                       |   stats   |        |
///                       +-----------+        |
/// ```
#[async_trait]
pub trait Resolver {
    async fn query(&self, request: Request) -> Result<Response, ResolveError>;
}

/// A decoded query together with the exact bytes the client sent.
#[derive(Clone, Debug)]
pub struct Request {
    pub query: Query,
    pub raw: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Answer synthesized from the override tables.
    Local(Answer),
    /// Upstream reply, relayed verbatim.
    Relayed { payload: Bytes, origin: SocketAddr },
}

impl Response {
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Response::Local(answer) => answer.to_bytes().map(Bytes::from),
            Response::Relayed { payload, .. } => Ok(payload.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no upstream replied within {0:?}")]
    TimedOut(Duration),
    #[error("no upstream servers configured")]
    NoUpstreams,
}
