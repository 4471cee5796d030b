//! GET forwarding
//!
//! The request target is remapped, fetched with a pooled hyper client
//! (HTTP or HTTPS via rustls), and the response is written back as
//! `HTTP/1.1 <status>`, one line per header value, a blank line and the body
//! streamed as it arrives.
//!
//! The body reaches the client de-chunked, so `Transfer-Encoding` is not
//! repeated; the session closes after the body, which delimits it.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::TRANSFER_ENCODING;
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use moka::sync::Cache;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::response::response_head;
use crate::config::CacheConfig;
use crate::error::ProxyError;
use crate::remap::RemapTable;

type HttpClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// `Via` value added to every forwarded response
pub const VIA: &str = "1.1 tun-proxy";

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A complete 200 response kept for reuse
#[derive(Debug)]
struct CachedResponse {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Bytes,
    stored_at: Instant,
}

/// What a forwarded GET produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// Origin status code
    pub status: u16,
    /// Body bytes written to the client
    pub body_bytes: u64,
    /// Served from the cache
    pub cache_hit: bool,
}

/// Fetches GET targets on behalf of proxy clients
pub struct Forwarder {
    client: HttpClient,
    remap: RemapTable,
    cache: Option<Cache<String, Arc<CachedResponse>>>,
    max_cached_body: usize,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("remap_rules", &self.remap.len())
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    /// Create a forwarder
    ///
    /// `connect_timeout` bounds the TCP connect to the origin; there is no
    /// overall request deadline.
    #[must_use]
    pub fn new(remap: RemapTable, cache: &CacheConfig, connect_timeout: Option<Duration>) -> Self {
        init_crypto_provider();

        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(connect_timeout);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        let response_cache = cache.enabled.then(|| {
            Cache::builder()
                .max_capacity(cache.max_entries)
                .time_to_live(cache.ttl())
                .build()
        });

        Self {
            client,
            remap,
            cache: response_cache,
            max_cached_body: cache.max_body_bytes,
        }
    }

    /// Remap table in use
    #[must_use]
    pub fn remap(&self) -> &RemapTable {
        &self.remap
    }

    /// Handle `GET target`, writing the response to `client`
    ///
    /// # Errors
    ///
    /// - `Fetch` if the URL is invalid or the origin request or body fails
    /// - `Io` if writing to the client fails
    pub async fn handle_http_get<W>(
        &self,
        client: &mut W,
        target: &str,
    ) -> Result<ForwardOutcome, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let url = self.remap.apply(target).into_owned();
        if url != target {
            info!(from = %target, to = %url, "Request remapped");
        }

        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(&url)) {
            return write_cached(client, &cached).await;
        }

        let uri = parse_origin_uri(&url)?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProxyError::fetch(&url, e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProxyError::fetch(&url, describe_client_error(&e)))?;

        let status = response.status().as_u16();
        let cacheable = self.cache.is_some() && status == 200;

        let mut headers: Vec<(String, Vec<u8>)> = response
            .headers()
            .iter()
            .filter(|(name, _)| **name != TRANSFER_ENCODING)
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        headers.push(("Via".into(), VIA.as_bytes().to_vec()));
        if self.cache.is_some() {
            headers.push(("X-Cache".into(), b"MISS".to_vec()));
        }

        let head = response_head(
            status,
            headers.iter().map(|(n, v)| (n.as_str(), v.as_slice())),
        );
        client.write_all(&head).await?;

        let mut body = response.into_body();
        let mut kept = cacheable.then(BytesMut::new);
        let mut written = 0u64;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::fetch(&url, e.to_string()))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            client.write_all(&data).await?;
            written += data.len() as u64;

            if kept
                .as_ref()
                .is_some_and(|buf| buf.len() + data.len() > self.max_cached_body)
            {
                kept = None;
            }
            if let Some(buf) = kept.as_mut() {
                buf.extend_from_slice(&data);
            }
        }
        client.flush().await?;

        if let (Some(cache), Some(buf)) = (&self.cache, kept) {
            // Drop X-Cache; Via stays with the entry
            headers.pop();
            cache.insert(
                url.clone(),
                Arc::new(CachedResponse {
                    status,
                    headers,
                    body: buf.freeze(),
                    stored_at: Instant::now(),
                }),
            );
            debug!(url = %url, "Response cached");
        }

        debug!(url = %url, status, bytes = written, "GET forwarded");
        Ok(ForwardOutcome {
            status,
            body_bytes: written,
            cache_hit: false,
        })
    }
}

async fn write_cached<W>(client: &mut W, cached: &CachedResponse) -> Result<ForwardOutcome, ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let age = cached.stored_at.elapsed().as_secs().to_string();
    let extra = [
        ("X-Cache", &b"HIT"[..]),
        ("X-Cache-Age", age.as_bytes()),
    ];
    let head = response_head(
        cached.status,
        cached
            .headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
            .chain(extra),
    );
    client.write_all(&head).await?;
    client.write_all(&cached.body).await?;
    client.flush().await?;

    debug!(status = cached.status, bytes = cached.body.len(), "GET served from cache");
    Ok(ForwardOutcome {
        status: cached.status,
        body_bytes: cached.body.len() as u64,
        cache_hit: true,
    })
}

/// Parse an absolute `http://` or `https://` URL
fn parse_origin_uri(url: &str) -> Result<Uri, ProxyError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ProxyError::fetch(url, format!("Invalid URL {url}: {e}")))?;
    match uri.scheme_str() {
        Some("http" | "https") if uri.authority().is_some() => Ok(uri),
        _ => Err(ProxyError::fetch(
            url,
            format!("Unsupported URL {url}: absolute http or https URL required"),
        )),
    }
}

/// hyper's top-level error text hides the cause; append the chain
fn describe_client_error(e: &hyper_util::client::legacy::Error) -> String {
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::RemapRule;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Origin that answers every request with a fixed response and counts hits
    async fn spawn_origin(response: &'static [u8]) -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, hits)
    }

    fn forwarder(remap: RemapTable, cache_enabled: bool) -> Forwarder {
        let cache = CacheConfig {
            enabled: cache_enabled,
            ..CacheConfig::default()
        };
        Forwarder::new(remap, &cache, Some(Duration::from_secs(2)))
    }

    #[test]
    fn test_parse_origin_uri() {
        assert!(parse_origin_uri("http://example.com/").is_ok());
        assert!(parse_origin_uri("https://example.com/a?b=c").is_ok());
        assert!(parse_origin_uri("/relative").is_err());
        assert!(parse_origin_uri("ftp://example.com/").is_err());
        assert!(parse_origin_uri("not a url").is_err());
    }

    #[tokio::test]
    async fn test_forward_status_headers_body() {
        let (addr, _) = spawn_origin(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 7\r\nX-Test: a\r\nX-Test: b\r\nConnection: close\r\n\r\nmissing",
        )
        .await;
        let fwd = forwarder(RemapTable::empty(), false);

        let mut out = Vec::new();
        let outcome = fwd
            .handle_http_get(&mut out, &format!("http://{addr}/x"))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404\r\n"), "{text}");
        assert!(text.contains("x-test: a\r\n"));
        assert!(text.contains("x-test: b\r\n"));
        assert!(text.contains(&format!("Via: {VIA}\r\n")));
        assert!(text.ends_with("\r\n\r\nmissing"));
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.body_bytes, 7);
    }

    #[tokio::test]
    async fn test_chunked_body_is_dechunked() {
        let (addr, _) = spawn_origin(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await;
        let fwd = forwarder(RemapTable::empty(), false);

        let mut out = Vec::new();
        fwd.handle_http_get(&mut out, &format!("http://{addr}/"))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_remap_applied() {
        let (addr, hits) = spawn_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let remap = RemapTable::new(vec![RemapRule {
            from: "http://remapped.invalid/".into(),
            to: format!("http://{addr}/"),
        }]);
        let fwd = forwarder(remap, false);

        let mut out = Vec::new();
        let outcome = fwd
            .handle_http_get(&mut out, "http://remapped.invalid/page")
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_origin() {
        let (addr, hits) = spawn_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\ncache",
        )
        .await;
        let fwd = forwarder(RemapTable::empty(), true);
        let url = format!("http://{addr}/cached");

        let mut first = Vec::new();
        let outcome = fwd.handle_http_get(&mut first, &url).await.unwrap();
        assert!(!outcome.cache_hit);
        assert!(String::from_utf8_lossy(&first).contains("X-Cache: MISS\r\n"));

        let mut second = Vec::new();
        let outcome = fwd.handle_http_get(&mut second, &url).await.unwrap();
        assert!(outcome.cache_hit);
        let text = String::from_utf8(second).unwrap();
        assert!(text.starts_with("HTTP/1.1 200\r\n"));
        assert!(text.contains("X-Cache: HIT\r\n"));
        assert!(!text.contains("X-Cache: MISS"));
        assert!(text.ends_with("cache"));

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fwd = forwarder(RemapTable::empty(), false);
        let mut out = Vec::new();
        let err = fwd
            .handle_http_get(&mut out, &format!("http://{addr}/"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Fetch { .. }));
        assert!(!err.client_message().is_empty());
        assert!(out.is_empty());
    }
}
