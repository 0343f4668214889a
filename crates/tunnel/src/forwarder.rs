//! Upstream forwarding: verbatim TLS passthrough and the
//! browser-profile client used for consumer-web fetches.

use crate::httpparse::ParsedRequest;
use claudish_core::error::ProxyError;
use flate2::read::{GzDecoder, ZlibDecoder};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// A buffered upstream response, used by the sync-inject path.
#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Body with any `Content-Encoding` undone.
    pub fn decoded_body(&self) -> Result<Vec<u8>, ProxyError> {
        match self.content_encoding.as_deref() {
            Some("gzip") => {
                let mut out = Vec::new();
                GzDecoder::new(&self.body[..])
                    .read_to_end(&mut out)
                    .map_err(|e| ProxyError::Tunnel(format!("gzip decode: {e}")))?;
                Ok(out)
            }
            Some("deflate") => {
                let mut out = Vec::new();
                ZlibDecoder::new(&self.body[..])
                    .read_to_end(&mut out)
                    .map_err(|e| ProxyError::Tunnel(format!("deflate decode: {e}")))?;
                Ok(out)
            }
            Some(other) if !other.is_empty() && other != "identity" => Err(ProxyError::Tunnel(
                format!("unsupported content encoding: {other}"),
            )),
            _ => Ok(self.body.clone()),
        }
    }
}

pub struct Forwarder {
    connector: TlsConnector,
    handshake_timeout: Duration,
    /// Client carrying a browser header profile, for hosts that reject
    /// stock HTTP stacks.
    browser_client: Option<reqwest::Client>,
    plain_client: reqwest::Client,
}

impl Forwarder {
    pub fn new(handshake_timeout_secs: u64) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        // Pinned so the upstream response stays a parseable HTTP/1.1
        // byte stream we can relay verbatim.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            connector: TlsConnector::from(Arc::new(config)),
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            browser_client: build_browser_client(),
            plain_client: reqwest::Client::new(),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>, ProxyError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::Network(format!("connect {host}:{port}: {e}")))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::Network(format!("bad server name {host}: {e}")))?;
        tokio::time::timeout(self.handshake_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::Network(format!("TLS handshake with {host} timed out")))?
            .map_err(|e| ProxyError::Network(format!("TLS handshake with {host}: {e}")))
    }

    /// Forward one request to the real origin and relay the response
    /// bytes to the client exactly as they arrive.
    ///
    /// `Accept-Encoding` is stripped so responses stay readable;
    /// `Connection: close` makes upstream EOF the end-of-response marker,
    /// which preserves SSE framing without buffering.
    pub async fn passthrough<S>(
        &self,
        request: &ParsedRequest,
        host: &str,
        client: &mut S,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream = self.connect(host, 443).await?;
        let wire = request.serialize(&["accept-encoding"], &[("Connection", "close")]);
        upstream.write_all(&wire).await?;
        upstream.flush().await?;

        tokio::io::copy(&mut upstream, client)
            .await
            .map_err(|e| ProxyError::Network(format!("relay from {host}: {e}")))?;
        client.flush().await?;
        Ok(())
    }

    /// Switch a tunnel to opaque byte piping after a WebSocket upgrade.
    pub async fn pipe_websocket<S>(
        &self,
        request: &ParsedRequest,
        host: &str,
        client: &mut S,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream = self.connect(host, 443).await?;
        upstream.write_all(&request.raw).await?;
        upstream.flush().await?;

        // Either side closing tears down both.
        let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;
        Ok(())
    }

    /// Fetch a consumer-web URL with the browser-profile client, falling
    /// back to the plain client when the profile is unavailable or the
    /// request fails.
    pub async fn fetch_browser(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedResponse, ProxyError> {
        if let Some(browser) = &self.browser_client {
            match fetch_with(browser, url, headers).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!("browser-profile fetch of {url} failed ({e}), using native");
                }
            }
        }
        fetch_with(&self.plain_client, url, headers).await
    }
}

async fn fetch_with(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<FetchedResponse, ProxyError> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let content_encoding = response
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = response.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        content_encoding,
        body,
    })
}

fn build_browser_client() -> Option<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in [
        (
            "user-agent",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        ),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("accept-language", "en-US,en;q=0.9"),
        ("sec-ch-ua", "\"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\""),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"macOS\""),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
    ] {
        let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
            return None;
        };
        headers.insert(name, value);
    }
    reqwest::Client::builder().default_headers(headers).build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_decoded_body_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let response = FetchedResponse {
            status: 200,
            content_encoding: Some("gzip".to_string()),
            body: compressed,
        };
        assert_eq!(response.decoded_body().unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn test_decoded_body_identity() {
        let response = FetchedResponse {
            status: 200,
            content_encoding: None,
            body: b"plain".to_vec(),
        };
        assert_eq!(response.decoded_body().unwrap(), b"plain");
    }

    #[test]
    fn test_decoded_body_unknown_encoding() {
        let response = FetchedResponse {
            status: 200,
            content_encoding: Some("br".to_string()),
            body: vec![1, 2, 3],
        };
        assert!(response.decoded_body().is_err());
    }

    #[test]
    fn test_browser_client_builds() {
        assert!(build_browser_client().is_some());
    }
}
