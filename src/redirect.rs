//! Tiny HTTP responder for names that should land somewhere else.
//!
//! Pairs with the override tables: point `wiki` at this host in DNS and add a
//! `Redirect301s` entry sending it on to `wiki.lan:8080`.

use crate::config::Redirect;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::{io, net::Ipv4Addr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub fn router(redirects: Vec<Redirect>) -> Router {
    Router::new()
        .fallback(redirect)
        .with_state(Arc::<[Redirect]>::from(redirects))
}

async fn redirect(
    State(redirects): State<Arc<[Redirect]>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    match redirects.iter().find(|r| r.from.eq_ignore_ascii_case(host)) {
        Some(target) => {
            let location = format!("http://{}{}", target.to, path);
            info!(from = %format_args!("{host}{path}"), to = %location, "Redirecting");
            (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
        }
        None => {
            debug!(%host, "No redirect configured");
            (
                StatusCode::NOT_FOUND,
                format!("no redirect or reverse proxy config for {}\n", host),
            )
                .into_response()
        }
    }
}

/// Binds the redirect listener for `port` on the loopback interface.
pub async fn bind(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await
}

/// Serves redirects on an already bound listener until the process exits.
pub fn spawn(listener: TcpListener, redirects: Vec<Redirect>) {
    let app = router(redirects);
    tokio::spawn(async move {
        let addr = listener.local_addr().ok();
        if let Err(err) = axum::serve(listener, app).await {
            warn!(?addr, %err, "Redirect server stopped");
        }
    });
}
