use crate::{protocol::*, resolver::*};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// Locally configured names. CNAME entries take precedence over host
/// entries; matching is exact on the full name and ignores case.
#[derive(Clone, Debug, Default)]
pub struct OverrideTable {
    cnames: HashMap<String, String>,
    hosts: HashMap<String, Ipv4Addr>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a CNAME entry. The first entry for a name wins.
    pub fn with_cname(mut self, name: &str, target: impl Into<String>) -> Self {
        self.cnames.entry(fold(name)).or_insert_with(|| target.into());
        self
    }

    /// Adds a host entry. The first entry for a name wins.
    pub fn with_host(mut self, name: &str, address: Ipv4Addr) -> Self {
        self.hosts.entry(fold(name)).or_insert(address);
        self
    }

    pub fn len(&self) -> usize {
        self.cnames.len() + self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answers `query` from the tables, or `None` if it should go upstream.
    ///
    /// A CNAME answer carries no A record for its target.
    pub fn resolve(&self, query: &Query) -> Option<Answer> {
        let key = fold(&query.name);

        let data = if let Some(target) = self.cnames.get(&key) {
            AnswerData::Cname(target.clone())
        } else if let Some(address) = self.hosts.get(&key) {
            AnswerData::A(*address)
        } else {
            return None;
        };

        Some(Answer {
            id: query.id,
            name: query.name.clone(),
            data,
        })
    }
}

fn fold(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_lowercase()
}

/// Resolver that answers configured names itself and passes everything
/// else to the inner resolver.
pub struct Overrides<R> {
    table: OverrideTable,
    inner: R,
}

impl<R> Overrides<R> {
    pub fn new(resolver: R, table: OverrideTable) -> Self {
        Self {
            table,
            inner: resolver,
        }
    }
}

#[async_trait]
impl<R: Resolver + Send + Sync> Resolver for Overrides<R> {
    async fn query(&self, request: Request) -> Result<Response, ResolveError> {
        if let Some(answer) = self.table.resolve(&request.query) {
            debug!(name = %answer.name, data = ?answer.data, "Answering from overrides");
            return Ok(Response::Local(answer));
        }

        self.inner.query(request).await
    }
}
