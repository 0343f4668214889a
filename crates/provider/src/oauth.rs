//! OAuth token lifecycle for OAuth-managed providers.
//!
//! Two flows: PKCE with a loopback callback (Gemini Code Assist) and the
//! RFC 8628 device authorization grant (Kimi/Moonshot). Credentials are
//! persisted with owner-only permissions; refresh is single-flight so
//! concurrent streams share one network call.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use claudish_core::error::ProxyError;
use claudish_core::paths::{self, Paths};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Refresh this long before the recorded expiry.
const EXPIRY_MARGIN_MS: i64 = 5 * 60 * 1000;

/// PKCE login must complete within this window.
const PKCE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at_ms: i64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
}

impl OAuthCredentials {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms - EXPIRY_MARGIN_MS
    }
}

/// Result of a token request, encoding the API-key fallback explicitly
/// instead of signalling it through an error type.
#[derive(Debug)]
pub enum TokenOutcome {
    Token(String),
    /// Refresh failed but the provider has a static key configured.
    NeedApiKey,
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: &'static str,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub device_auth_url: Option<String>,
    pub token_url: String,
    pub scope: String,
    pub api_key_env: &'static str,
}

/// Google OAuth client used by the Gemini CLI family of installed apps;
/// installed-app client ids are public by design.
pub fn gemini_oauth_config() -> OAuthConfig {
    OAuthConfig {
        provider: "gemini",
        client_id: "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com"
            .to_string(),
        client_secret: Some("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".to_string()),
        auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
        device_auth_url: None,
        token_url: "https://oauth2.googleapis.com/token".to_string(),
        scope: "https://www.googleapis.com/auth/cloud-platform \
                https://www.googleapis.com/auth/userinfo.email"
            .to_string(),
        api_key_env: "GEMINI_API_KEY",
    }
}

pub fn kimi_oauth_config() -> OAuthConfig {
    OAuthConfig {
        provider: "kimi",
        client_id: "claudish".to_string(),
        client_secret: None,
        auth_url: "https://api.moonshot.ai/oauth2/authorize".to_string(),
        device_auth_url: Some("https://api.moonshot.ai/oauth2/device/code".to_string()),
        token_url: "https://api.moonshot.ai/oauth2/token".to_string(),
        scope: "api".to_string(),
        api_key_env: "MOONSHOT_API_KEY",
    }
}

#[derive(Debug, Deserialize)]
struct WireTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceAuthResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// Per-provider OAuth handle, created once at proxy startup and passed
/// down; the persistence path is part of its configuration.
pub struct OAuthManager {
    config: OAuthConfig,
    paths: Paths,
    cached: Mutex<Option<OAuthCredentials>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl OAuthManager {
    pub fn new(config: OAuthConfig, paths: Paths) -> Self {
        let cached = load_credentials(&paths, config.provider);
        Self {
            config,
            paths,
            cached: Mutex::new(cached),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &str {
        self.config.provider
    }

    pub fn has_credentials(&self) -> bool {
        self.cached.lock().expect("credential lock").is_some()
    }

    fn cached_fresh_token(&self) -> Option<String> {
        let now = chrono::Utc::now().timestamp_millis();
        self.cached
            .lock()
            .expect("credential lock")
            .as_ref()
            .filter(|c| c.is_fresh(now))
            .map(|c| c.access_token.clone())
    }

    fn store(&self, credentials: OAuthCredentials) -> Result<(), ProxyError> {
        paths::ensure_private_dir(&self.paths.creds_dir())?;
        let body = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| ProxyError::OAuth(format!("encode credentials: {e}")))?;
        paths::write_atomic(
            &self.paths.oauth_credentials(self.config.provider),
            &body,
            0o600,
        )?;
        *self.cached.lock().expect("credential lock") = Some(credentials);
        Ok(())
    }

    fn discard(&self) {
        let _ = std::fs::remove_file(self.paths.oauth_credentials(self.config.provider));
        *self.cached.lock().expect("credential lock") = None;
    }

    /// Valid access token, refreshing under a single-flight lock when the
    /// cached one is stale.
    pub async fn get_access_token(&self, http: &reqwest::Client) -> TokenOutcome {
        match self
            .token_with_refresh(|| self.refresh_over_network(http))
            .await
        {
            Ok(token) => TokenOutcome::Token(token),
            Err(e) => {
                self.discard();
                if std::env::var(self.config.api_key_env).is_ok() {
                    TokenOutcome::NeedApiKey
                } else {
                    TokenOutcome::Fatal(format!(
                        "{} login expired ({e}); run the {} login flow again",
                        self.config.provider, self.config.provider
                    ))
                }
            }
        }
    }

    /// Single-flight core: concurrent callers during a refresh all await
    /// the same in-flight call and observe its result.
    pub async fn token_with_refresh<F, Fut>(&self, refresh: F) -> Result<String, ProxyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OAuthCredentials, ProxyError>>,
    {
        if let Some(token) = self.cached_fresh_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // A concurrent caller may have refreshed while we waited.
        if let Some(token) = self.cached_fresh_token() {
            return Ok(token);
        }

        let credentials = refresh().await?;
        let token = credentials.access_token.clone();
        self.store(credentials)?;
        Ok(token)
    }

    async fn refresh_over_network(
        &self,
        http: &reqwest::Client,
    ) -> Result<OAuthCredentials, ProxyError> {
        let (refresh_token, old) = {
            let cached = self.cached.lock().expect("credential lock");
            let creds = cached
                .as_ref()
                .ok_or_else(|| ProxyError::OAuth("no stored credentials".to_string()))?;
            let token = creds
                .refresh_token
                .clone()
                .ok_or_else(|| ProxyError::OAuth("no refresh token".to_string()))?;
            (token, creds.clone())
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        // Refresh is not retried: failures are structural, and a second
        // attempt with a consumed refresh token can only make it worse.
        let response = http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::OAuth(format!("refresh request: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::OAuth(format!("refresh body: {e}")))?;
        if !status.is_success() {
            return Err(ProxyError::OAuth(format!(
                "refresh rejected (status {status}): {body}"
            )));
        }

        let wire: WireTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProxyError::OAuth(format!("refresh response: {e}")))?;
        Ok(credentials_from_wire(wire, Some(&old)))
    }

    // ── PKCE flow (loopback callback) ──────────────────────────────────

    pub async fn login_pkce(&self, http: &reqwest::Client) -> Result<(), ProxyError> {
        let verifier = random_url_safe(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = random_url_safe(16);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProxyError::OAuth(format!("callback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProxyError::OAuth(e.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}/oauth/callback");

        let auth_url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}&access_type=offline&prompt=consent",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(&self.config.scope),
            challenge,
            state,
        );

        if webbrowser::open(&auth_url).is_err() {
            tracing::info!("open this URL to authorize {}: {auth_url}", self.config.provider);
        }

        let code = tokio::time::timeout(PKCE_TIMEOUT, wait_for_callback(listener, &state))
            .await
            .map_err(|_| ProxyError::OAuth("login timed out after 5 minutes".to_string()))??;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::OAuth(format!("code exchange: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::OAuth(e.to_string()))?;
        if !status.is_success() {
            return Err(ProxyError::OAuth(format!(
                "code exchange rejected (status {status}): {body}"
            )));
        }

        let wire: WireTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProxyError::OAuth(format!("token response: {e}")))?;
        self.store(credentials_from_wire(wire, None))
    }

    // ── Device authorization grant (RFC 8628) ──────────────────────────

    pub async fn login_device(&self, http: &reqwest::Client) -> Result<(), ProxyError> {
        let device_auth_url = self
            .config
            .device_auth_url
            .as_ref()
            .ok_or_else(|| ProxyError::OAuth("provider has no device flow".to_string()))?;

        let response = http
            .post(device_auth_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::OAuth(format!("device authorization: {e}")))?
            .error_for_status()
            .map_err(|e| ProxyError::OAuth(format!("device authorization: {e}")))?;

        let auth: DeviceAuthResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::OAuth(format!("device authorization response: {e}")))?;

        tracing::info!(
            "authorize {} at {} with code {}",
            self.config.provider,
            auth.verification_uri,
            auth.user_code
        );
        let open_url = auth
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&auth.verification_uri);
        let _ = webbrowser::open(open_url);

        let credentials = self.poll_device_token(http, &auth).await?;
        self.store(credentials)
    }

    async fn poll_device_token(
        &self,
        http: &reqwest::Client,
        auth: &DeviceAuthResponse,
    ) -> Result<OAuthCredentials, ProxyError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(auth.expires_in);
        let mut interval = auth.interval.max(1);
        let mut transient_failures = 0u32;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyError::OAuth("device authorization expired".to_string()));
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let result = http
                .post(&self.config.token_url)
                .form(&[
                    ("client_id", self.config.client_id.as_str()),
                    ("device_code", auth.device_code.as_str()),
                    (
                        "grant_type",
                        "urn:ietf:params:oauth:grant-type:device_code",
                    ),
                ])
                .send()
                .await;

            let body = match result {
                Ok(response) => response.text().await.unwrap_or_default(),
                Err(e) => {
                    // Exponential backoff for transient network errors.
                    transient_failures += 1;
                    if transient_failures > 3 {
                        return Err(ProxyError::OAuth(format!("polling failed: {e}")));
                    }
                    tokio::time::sleep(Duration::from_secs(1u64 << (transient_failures - 1))).await;
                    continue;
                }
            };
            transient_failures = 0;

            if let Ok(wire) = serde_json::from_str::<WireTokenResponse>(&body) {
                return Ok(credentials_from_wire(wire, None));
            }
            let error: WireTokenError = serde_json::from_str(&body)
                .map_err(|e| ProxyError::OAuth(format!("token poll response: {e}")))?;
            match error.error.as_str() {
                "authorization_pending" => {}
                "slow_down" => interval += 5,
                "expired_token" | "access_denied" => {
                    return Err(ProxyError::OAuth(format!(
                        "device authorization failed: {}",
                        error.error_description.unwrap_or(error.error)
                    )));
                }
                other => {
                    return Err(ProxyError::OAuth(format!("token poll error: {other}")));
                }
            }
        }
    }
}

fn credentials_from_wire(
    wire: WireTokenResponse,
    previous: Option<&OAuthCredentials>,
) -> OAuthCredentials {
    let expires_at_ms = chrono::Utc::now().timestamp_millis()
        + wire.expires_in.unwrap_or(3600) as i64 * 1000;
    OAuthCredentials {
        access_token: wire.access_token,
        // The server may omit the refresh token on rotation; keep the old
        // one so the next refresh still works.
        refresh_token: wire
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
        expires_at_ms,
        scope: wire
            .scope
            .or_else(|| previous.map(|p| p.scope.clone()))
            .unwrap_or_default(),
        token_type: wire.token_type.unwrap_or_else(|| "Bearer".to_string()),
    }
}

fn load_credentials(paths: &Paths, provider: &str) -> Option<OAuthCredentials> {
    let path = paths.oauth_credentials(provider);
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            tracing::warn!("discarding malformed credentials at {}: {e}", path.display());
            let _ = std::fs::remove_file(&path);
            None
        }
    }
}

fn random_url_safe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::fill(&mut buf[..]);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Accept loopback connections until the authorization redirect arrives,
/// validate `state`, and hand back the code.
async fn wait_for_callback(listener: TcpListener, expected_state: &str) -> Result<String, ProxyError> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| ProxyError::OAuth(format!("callback accept: {e}")))?;

        let mut buf = vec![0u8; 4096];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| ProxyError::OAuth(format!("callback read: {e}")))?;
        let head = String::from_utf8_lossy(&buf[..n]);

        let Some(query) = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|target| target.split_once('?'))
            .map(|(_, q)| q)
        else {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
            continue;
        };

        let mut code = None;
        let mut state = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("code", v)) => code = Some(v.to_string()),
                Some(("state", v)) => state = Some(v.to_string()),
                _ => {}
            }
        }

        if state.as_deref() != Some(expected_state) {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await;
            return Err(ProxyError::OAuth("state mismatch in callback".to_string()));
        }

        let page = "<html><body>Authorization complete. You can close this tab.</body></html>";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{page}",
            page.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;

        return code.ok_or_else(|| ProxyError::OAuth("callback carried no code".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn manager(dir: &tempfile::TempDir) -> OAuthManager {
        OAuthManager::new(kimi_oauth_config(), Paths::with_home(dir.path()))
    }

    fn fresh_credentials(token: &str) -> OAuthCredentials {
        OAuthCredentials {
            access_token: token.to_string(),
            refresh_token: Some("r1".to_string()),
            expires_at_ms: chrono::Utc::now().timestamp_millis() + 3_600_000,
            scope: "api".to_string(),
            token_type: "Bearer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_flight_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(&dir));
        let calls = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .token_with_refresh(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the lock long enough for every peer to pile up.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(fresh_credentials("t1"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "t1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_skips_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.store(fresh_credentials("cached")).unwrap();

        let token = manager
            .token_with_refresh(|| async { panic!("refresh must not run") })
            .await
            .unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn test_expired_token_triggers_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let mut stale = fresh_credentials("old");
        stale.expires_at_ms = chrono::Utc::now().timestamp_millis() + 1000; // inside margin
        manager.store(stale).unwrap();

        let token = manager
            .token_with_refresh(|| async { Ok(fresh_credentials("new")) })
            .await
            .unwrap();
        assert_eq!(token, "new");
    }

    #[test]
    fn test_refresh_token_preserved_when_omitted() {
        let old = fresh_credentials("old");
        let wire = WireTokenResponse {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: Some(600),
            scope: None,
            token_type: None,
        };
        let merged = credentials_from_wire(wire, Some(&old));
        assert_eq!(merged.refresh_token.as_deref(), Some("r1"));
        assert_eq!(merged.scope, "api");
    }

    #[cfg(unix)]
    #[test]
    fn test_credentials_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.store(fresh_credentials("t")).unwrap();

        let path = Paths::with_home(dir.path()).oauth_credentials("kimi");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_malformed_credentials_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        std::fs::create_dir_all(paths.creds_dir()).unwrap();
        std::fs::write(paths.oauth_credentials("kimi"), "not json").unwrap();

        let manager = OAuthManager::new(kimi_oauth_config(), paths.clone());
        assert!(!manager.has_credentials());
        assert!(!paths.oauth_credentials("kimi").exists());
    }

    #[tokio::test]
    async fn test_pkce_callback_state_validation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move { wait_for_callback(listener, "good").await });

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /oauth/callback?code=abc&state=good HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let code = task.await.unwrap().unwrap();
        assert_eq!(code, "abc");
    }

    #[tokio::test]
    async fn test_pkce_callback_rejects_bad_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move { wait_for_callback(listener, "good").await });

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /oauth/callback?code=abc&state=evil HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert!(task.await.unwrap().is_err());
    }
}
