//! HTTP requests carried over an overlay link

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{header, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};
use tunbridge_bridge::LinkConnector;

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Fetch `url` through the service that intercepts its host and port
pub async fn get(connector: &LinkConnector, url: &str) -> Result<HttpResponse> {
    let uri: Uri = url.parse().context(format!("Invalid URL: {}", url))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => bail!("Unsupported URL scheme: {}", other),
        None => bail!("URL must start with http://: {}", url),
    }

    let host = uri.host().context("URL has no host")?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host);
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let link = connector
        .connect(host, port)
        .await
        .context(format!("Failed to connect to {}:{}", host, port))?;
    let conn_id = link.conn_id();

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(link))
        .await
        .context("HTTP handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(conn_id, "HTTP connection error: {}", e);
        }
    });

    let request = Request::builder()
        .uri(path)
        .header(header::HOST, authority)
        .body(Empty::<Bytes>::new())
        .context("Failed to build request")?;

    let response = sender
        .send_request(request)
        .await
        .context("HTTP request failed")?;
    let status = response.status();
    debug!(conn_id, %status, "response received");

    let body = response
        .into_body()
        .collect()
        .await
        .context("Failed to read response body")?
        .to_bytes();

    Ok(HttpResponse { status, body })
}
