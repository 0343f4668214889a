//! CONNECT dispatcher: accepts proxied tunnels, terminates TLS with
//! SNI-minted leaves, and drives each decrypted request through the
//! classifier.

use crate::classifier::{Classifier, Route, merge_injected};
use crate::forwarder::Forwarder;
use crate::httpparse::{ParsedRequest, RequestParser};
use claudish_core::config::ConfigHandle;
use claudish_core::convstore::ConversationStore;
use claudish_core::error::ProxyError;
use claudish_core::logs::LogStore;
use claudish_core::traffic::TrafficStore;
use claudish_core::usage::{PricingTable, UsageCounters};
use claudish_certs::CertManager;
use claudish_provider::adapter::{self, AuthContext};
use claudish_provider::canonical::{AdapterEvent, CanonicalRequest};
use claudish_provider::emit::MessageEncoder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_stream::StreamExt;

const CONNECT_HEAD_LIMIT: usize = 8 * 1024;

/// Everything a tunnel needs, owned by the proxy lifecycle and shared
/// read-only with each connection task.
pub struct TunnelContext {
    pub certs: Arc<CertManager>,
    pub classifier: Classifier,
    pub forwarder: Forwarder,
    pub traffic: Arc<TrafficStore>,
    pub logs: Arc<LogStore>,
    pub convstore: Arc<ConversationStore>,
    pub config: Arc<ConfigHandle>,
    pub usage: Arc<UsageCounters>,
    pub pricing: Arc<PricingTable>,
    pub auth: AuthContext,
    pub http: reqwest::Client,
}

/// Bind the dispatcher to a random loopback port.
pub async fn bind() -> Result<(TcpListener, u16), ProxyError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| ProxyError::Network(format!("dispatcher bind: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ProxyError::Network(e.to_string()))?
        .port();
    Ok((listener, port))
}

/// Accept loop. Each tunnel is an independent task; the loop exits when
/// the shutdown watch flips.
pub async fn run(
    ctx: Arc<TunnelContext>,
    listener: TcpListener,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(ctx.clone(), stream).await {
                                ctx.logs.debug("dispatcher", format!("tunnel from {peer} closed: {e}"));
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("dispatcher accept failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.wait_for(|v| *v) => {
                tracing::info!("dispatcher stopping");
                break;
            }
        }
    }
}

/// Parse the `CONNECT host:port` request line.
fn parse_connect_head(head: &str) -> Option<(String, u16)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "CONNECT" {
        return None;
    }
    let authority = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            (!host.is_empty()).then(|| (host.to_string(), port))
        }
        None => Some((authority.to_string(), 443)),
    }
}

async fn handle_connection(ctx: Arc<TunnelContext>, mut stream: TcpStream) -> Result<(), ProxyError> {
    // 1. Read the CONNECT head.
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > CONNECT_HEAD_LIMIT {
            return Err(ProxyError::Tunnel("CONNECT head too large".to_string()));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Tunnel("client closed before CONNECT".to_string()));
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head_text = String::from_utf8_lossy(&head);
    let Some((connect_host, _port)) = parse_connect_head(&head_text) else {
        let _ = stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nbad CONNECT")
            .await;
        return Err(ProxyError::Tunnel(format!(
            "malformed CONNECT: {:?}",
            head_text.lines().next().unwrap_or_default()
        )));
    };

    // 2. Acknowledge the tunnel.
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\nProxy-agent: claudish-proxy\r\n\r\n")
        .await?;

    // 3. TLS-accept with a leaf minted for the SNI the client actually
    // sends, falling back to the CONNECT authority.
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor
        .await
        .map_err(|e| ProxyError::Tunnel(format!("TLS client hello: {e}")))?;
    let sni = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| connect_host.clone());
    let server_config = ctx.certs.server_config_for(&sni)?;
    let mut tls = start
        .into_stream(server_config)
        .await
        .map_err(|e| ProxyError::Tunnel(format!("TLS accept for {sni}: {e}")))?;

    ctx.logs.debug("dispatcher", format!("tunnel open to {connect_host} (sni {sni})"));

    // 4. Sequential request loop over the decrypted stream.
    let mut parser = RequestParser::new();
    let mut read_buf = [0u8; 16 * 1024];
    loop {
        while !parser.is_complete() {
            let n = tls.read(&mut read_buf).await?;
            if n == 0 {
                return Ok(());
            }
            parser.feed(&read_buf[..n])?;
        }
        let request = parser
            .take()
            .ok_or_else(|| ProxyError::Internal("parser lost request".to_string()))?;

        ctx.traffic.record(
            &request.method,
            &connect_host,
            request.path_only(),
            request.body.len() as u64,
            request.header("user-agent"),
        );

        if request.is_websocket_upgrade() {
            ctx.logs.debug("dispatcher", format!("websocket upgrade on {connect_host}"));
            return ctx
                .forwarder
                .pipe_websocket(&request, &connect_host, &mut tls)
                .await;
        }

        match ctx.classifier.classify(&request) {
            Route::Passthrough => {
                ctx.forwarder
                    .passthrough(&request, &connect_host, &mut tls)
                    .await?;
            }
            Route::Intercept {
                conv_uuid,
                target_model,
            } => {
                run_intercept(&ctx, &request, &conv_uuid, &target_model, &mut tls).await?;
            }
            Route::SyncInject { conv_uuid } => {
                run_sync_inject(&ctx, &request, &conv_uuid, &connect_host, &mut tls).await?;
            }
        }

        parser.reset()?;
    }
}

// ── Intercepted completion ─────────────────────────────────────────────

async fn write_chunk<S: AsyncWrite + Unpin>(out: &mut S, data: &str) -> Result<(), ProxyError> {
    out.write_all(format!("{:X}\r\n", data.len()).as_bytes())
        .await?;
    out.write_all(data.as_bytes()).await?;
    out.write_all(b"\r\n").await?;
    out.flush().await?;
    Ok(())
}

async fn write_chunks<S: AsyncWrite + Unpin>(
    out: &mut S,
    frames: Vec<String>,
) -> Result<(), ProxyError> {
    for frame in frames {
        write_chunk(out, &frame).await?;
    }
    Ok(())
}

/// Satisfy a completion request from the routed provider, re-streaming
/// its output as vendor SSE over the already-open tunnel.
pub async fn run_intercept<S>(
    ctx: &TunnelContext,
    request: &ParsedRequest,
    conv_uuid: &str,
    target_model: &str,
    out: &mut S,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    out.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: text/event-stream\r\n\
          Cache-Control: no-cache\r\n\
          Transfer-Encoding: chunked\r\n\
          Connection: keep-alive\r\n\r\n",
    )
    .await?;

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
    let parent_uuid = body
        .get("parent_message_uuid")
        .and_then(|p| p.as_str())
        .map(String::from);
    let canonical = CanonicalRequest::from_vendor_completion(target_model, &body);

    let mut encoder = MessageEncoder::new(target_model);
    let result = stream_completion(ctx, &canonical, target_model, &mut encoder, out).await;

    match result {
        Ok(()) => {
            ctx.convstore.append(
                conv_uuid,
                canonical.user_text(),
                encoder.collected_text(),
                parent_uuid.as_deref(),
            );
            let (input_tokens, output_tokens) = encoder.usage();
            ctx.usage
                .record(target_model, input_tokens, output_tokens, &ctx.pricing);
            ctx.logs.info(
                "intercept",
                format!("completed {conv_uuid} via {target_model} ({input_tokens}/{output_tokens} tokens)"),
            );
        }
        Err(e) => {
            ctx.logs
                .error("intercept", format!("routing {conv_uuid} to {target_model}: {e}"));
            let frames =
                encoder.fail(&format!("Failed to route request to {target_model}: {e}"));
            write_chunks(out, frames).await?;
        }
    }

    // Terminating zero-length chunk.
    out.write_all(b"0\r\n\r\n").await?;
    out.flush().await?;
    Ok(())
}

/// Drive the adapter event stream into SSE chunks, emitting pings while
/// the upstream is quiet. Returns Err only for failures that still need
/// an error surface; transport errors writing to the client bubble out
/// of the chunk writers.
async fn stream_completion<S>(
    ctx: &TunnelContext,
    canonical: &CanonicalRequest,
    target_model: &str,
    encoder: &mut MessageEncoder,
    out: &mut S,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let resolved = claudish_provider::resolve(target_model)
        .ok_or_else(|| ProxyError::Config(format!("unknown provider prefix in {target_model}")))?;

    let mut events = adapter::run_completion(&ctx.http, &resolved, canonical, &ctx.auth).await?;

    write_chunk(out, &encoder.start()).await?;
    let ping_every = ctx.config.settings().ping_interval_secs.max(1);
    let mut ping = tokio::time::interval(Duration::from_secs(ping_every));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        write_chunks(out, encoder.handle(event)).await?;
                        if encoder.finished() {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        // Mid-stream upstream failure: surface as text,
                        // close cleanly. Already-delivered tokens stand.
                        let frames = encoder.fail(&format!(
                            "Failed to route request to {target_model}: {e}"
                        ));
                        write_chunks(out, frames).await?;
                        return Ok(());
                    }
                    None => {
                        if !encoder.finished() {
                            write_chunks(
                                out,
                                encoder.handle(AdapterEvent::Done {
                                    stop_reason: claudish_provider::canonical::StopReason::EndTurn,
                                }),
                            )
                            .await?;
                        }
                        return Ok(());
                    }
                }
            }
            _ = ping.tick() => {
                write_chunk(out, &encoder.ping()).await?;
            }
        }
    }
}

// ── Sync-inject ────────────────────────────────────────────────────────

/// Rewrite a conversation-sync response so injected messages appear in
/// the client's view of history. Any failure forwards the original
/// upstream bytes unmodified.
pub async fn run_sync_inject<S>(
    ctx: &TunnelContext,
    request: &ParsedRequest,
    conv_uuid: &str,
    host: &str,
    out: &mut S,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match build_sync_response(ctx, request, conv_uuid, host).await {
        Ok(body) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: keep-alive\r\n\r\n",
                body.len()
            );
            out.write_all(head.as_bytes()).await?;
            out.write_all(&body).await?;
            out.flush().await?;
            ctx.logs
                .info("sync", format!("merged injected history into {conv_uuid}"));
            Ok(())
        }
        Err(e) => {
            ctx.logs
                .warn("sync", format!("inject for {conv_uuid} failed ({e}), forwarding as-is"));
            ctx.forwarder.passthrough(request, host, out).await
        }
    }
}

async fn build_sync_response(
    ctx: &TunnelContext,
    request: &ParsedRequest,
    conv_uuid: &str,
    host: &str,
) -> Result<Vec<u8>, ProxyError> {
    let url = format!("https://{host}{}", request.path);

    // The live request carries fresh cookies; captured auth fills gaps.
    let mut headers: HashMap<String, String> = HashMap::new();
    for name in ["cookie", "authorization", "anthropic-client-version"] {
        if let Some(value) = request.header(name) {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    for (name, value) in ctx.classifier.captured.state().headers {
        headers.entry(name).or_insert(value);
    }

    let response = ctx.forwarder.fetch_browser(&url, &headers).await?;
    if response.status != 200 {
        return Err(ProxyError::Upstream {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }

    let decoded = response.decoded_body()?;
    let mut conversation: serde_json::Value = serde_json::from_slice(&decoded)?;

    let messages = ctx.convstore.get(conv_uuid);
    let leaf = ctx
        .convstore
        .current_leaf(conv_uuid)
        .ok_or_else(|| ProxyError::Internal("sync-inject with empty store".to_string()))?;
    merge_injected(&mut conversation, &messages, &leaf)?;

    serde_json::to_vec(&conversation).map_err(|e| ProxyError::Internal(e.to_string()))
}
