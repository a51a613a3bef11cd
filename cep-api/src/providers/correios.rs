use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::provider::{AddressProvider, ProviderError, ResolvedAddress, Source};

/// Refresh this long before the token's reported expiry, so an in-flight
/// request never rides a token that dies mid-call.
const TOKEN_SAFETY_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    valid_until: DateTime<Utc>,
}

impl CachedToken {
    fn from_expiry(bearer: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            bearer,
            valid_until: expires_at - Duration::seconds(TOKEN_SAFETY_MARGIN_SECONDS),
        }
    }

    fn still_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
    #[serde(rename = "expiraEm")]
    expira_em: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CorreiosPayload {
    logradouro: Option<String>,
    cidade: String,
    uf: String,
}

/// Correios (national postal service), first in the fallback chain.
///
/// Lookups require a bearer token issued against contract credentials. The
/// token is cached with a safety margin under its real TTL and refreshed
/// proactively on expiry; a 401 triggers exactly one reactive refresh and
/// retry before the lookup is given up. The cache sits behind an async
/// mutex so only one token request is ever in flight.
pub struct CorreiosClient {
    client: reqwest::Client,
    cep_url: String,
    auth_url: String,
    username: String,
    password: String,
    token: Mutex<Option<CachedToken>>,
}

impl CorreiosClient {
    pub fn new(
        client: reqwest::Client,
        cep_url: String,
        auth_url: String,
        username: String,
        password: String,
    ) -> Self {
        Self {
            client,
            cep_url,
            auth_url,
            username,
            password,
            token: Mutex::new(None),
        }
    }

    /// Return a token valid for at least the safety margin, fetching a new
    /// one when the cache is empty or stale.
    async fn current_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.still_valid(Utc::now()) {
                return Ok(token.bearer.clone());
            }
        }

        let fresh = self.request_token().await?;
        let bearer = fresh.bearer.clone();
        *cached = Some(fresh);
        Ok(bearer)
    }

    /// Forget `stale` if it is still the cached token. Comparing first keeps
    /// us from discarding a newer token another task already fetched.
    async fn invalidate(&self, stale: &str) {
        let mut cached = self.token.lock().await;
        if cached.as_ref().is_some_and(|t| t.bearer == stale) {
            *cached = None;
        }
    }

    async fn request_token(&self) -> Result<CachedToken, ProviderError> {
        info!("requesting new Correios bearer token");
        let response = self
            .client
            .post(&self.auth_url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Auth),
            status if status.is_success() => {
                let payload: TokenPayload = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Network(format!("malformed token payload: {e}")))?;
                Ok(CachedToken::from_expiry(payload.token, payload.expira_em))
            }
            status => Err(ProviderError::Network(format!(
                "token request returned {status}"
            ))),
        }
    }

    async fn fetch_address(&self, code: &str, bearer: &str) -> Result<ResolvedAddress, ProviderError> {
        let url = format!("{}/{}", self.cep_url, code);
        let response = self.client.get(&url).bearer_auth(bearer).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            StatusCode::UNAUTHORIZED => Err(ProviderError::Auth),
            status if status.is_success() => {
                let payload: CorreiosPayload = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Network(format!("malformed payload: {e}")))?;

                Ok(ResolvedAddress {
                    street: payload.logradouro.filter(|s| !s.is_empty()),
                    city: payload.cidade,
                    state: payload.uf,
                    is_single_address: false,
                    source: Source::Correios,
                })
            }
            status => Err(ProviderError::Network(format!("unexpected status {status}"))),
        }
    }
}

#[async_trait]
impl AddressProvider for CorreiosClient {
    fn source(&self) -> Source {
        Source::Correios
    }

    async fn lookup(&self, code: &str) -> Result<ResolvedAddress, ProviderError> {
        let bearer = self.current_token().await?;

        match self.fetch_address(code, &bearer).await {
            Err(ProviderError::Auth) => {
                // One reactive refresh: the cached token was rejected, drop
                // it and retry with a fresh one. A second 401 is final.
                warn!(code, "Correios rejected cached token, refreshing once");
                self.invalidate(&bearer).await;
                let fresh = self.current_token().await?;
                self.fetch_address(code, &fresh).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Minimal Correios stand-in on a local port: POST issues numbered
    /// bearer tokens, GET serves the address endpoint and returns 401 for
    /// any bearer named in `rejected`.
    struct CorreiosStub {
        token_requests: AtomicUsize,
        address_requests: AtomicUsize,
        rejected: Vec<String>,
    }

    impl CorreiosStub {
        fn rejecting(rejected: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                token_requests: AtomicUsize::new(0),
                address_requests: AtomicUsize::new(0),
                rejected: rejected.iter().map(|b| (*b).to_owned()).collect(),
            })
        }

        async fn serve(self: Arc<Self>) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let stub = self;
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let stub = Arc::clone(&stub);
                    tokio::spawn(async move { stub.answer(socket).await });
                }
            });
            base
        }

        async fn answer(&self, mut socket: TcpStream) {
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                match socket.read(&mut buf[read..]).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => read += n,
                }
                if buf[..read].windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
                if read == buf.len() {
                    return;
                }
            }
            let request = String::from_utf8_lossy(&buf[..read]).into_owned();

            let response = if request.starts_with("POST") {
                let issued = self.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
                http_response(
                    "200 OK",
                    &format!(r#"{{"token": "bearer-{issued}", "expiraEm": "2099-01-01T00:00:00Z"}}"#),
                )
            } else {
                self.address_requests.fetch_add(1, Ordering::SeqCst);
                if self
                    .rejected
                    .iter()
                    .any(|bearer| request.contains(&format!("Bearer {bearer}")))
                {
                    http_response("401 Unauthorized", "{}")
                } else {
                    http_response(
                        "200 OK",
                        r#"{"logradouro": "Avenida Paulista", "cidade": "Sao Paulo", "uf": "SP"}"#,
                    )
                }
            };

            socket.write_all(response.as_bytes()).await.ok();
            socket.shutdown().await.ok();
        }
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn client_against(base: &str) -> CorreiosClient {
        CorreiosClient::new(
            reqwest::Client::new(),
            format!("{base}/cep"),
            format!("{base}/token"),
            "user".to_owned(),
            "pass".to_owned(),
        )
    }

    #[tokio::test]
    async fn test_lookup_refreshes_once_on_rejected_token() {
        let stub = CorreiosStub::rejecting(&["bearer-1"]);
        let client = client_against(&Arc::clone(&stub).serve().await);

        let address = client.lookup("01310100").await.unwrap();

        assert_eq!(address.city, "Sao Paulo");
        assert_eq!(address.source, Source::Correios);
        // The rejection triggers one fresh token and one retry with it.
        assert_eq!(stub.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(stub.address_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_gives_up_after_second_rejection() {
        let stub = CorreiosStub::rejecting(&["bearer-1", "bearer-2"]);
        let client = client_against(&Arc::clone(&stub).serve().await);

        let err = client.lookup("01310100").await.unwrap_err();

        assert!(matches!(err, ProviderError::Auth));
        // Exactly two attempts with two tokens, never a refresh loop.
        assert_eq!(stub.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(stub.address_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_reuses_cached_token_across_calls() {
        let stub = CorreiosStub::rejecting(&[]);
        let client = client_against(&Arc::clone(&stub).serve().await);

        client.lookup("01310100").await.unwrap();
        client.lookup("22041011").await.unwrap();

        assert_eq!(stub.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(stub.address_requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_token_valid_when_expiry_is_far_off() {
        let now = Utc::now();
        let token = CachedToken::from_expiry("t".to_owned(), now + Duration::minutes(10));
        assert!(token.still_valid(now));
    }

    #[test]
    fn test_token_stale_inside_safety_margin() {
        // Thirty seconds of life left is under the sixty-second margin.
        let now = Utc::now();
        let token = CachedToken::from_expiry("t".to_owned(), now + Duration::seconds(30));
        assert!(!token.still_valid(now));
    }

    #[test]
    fn test_token_stale_after_expiry() {
        let now = Utc::now();
        let token = CachedToken::from_expiry("t".to_owned(), now - Duration::seconds(1));
        assert!(!token.still_valid(now));
    }

    #[test]
    fn test_token_payload_parses() {
        let payload: TokenPayload = serde_json::from_str(
            r#"{"token": "eyJhbGci", "expiraEm": "2026-08-29T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(payload.token, "eyJhbGci");
        assert_eq!(payload.expira_em.to_rfc3339(), "2026-08-29T12:00:00+00:00");
    }

    #[tokio::test]
    async fn test_invalidate_only_discards_matching_token() {
        let client = CorreiosClient::new(
            reqwest::Client::new(),
            "http://localhost/cep".to_owned(),
            "http://localhost/token".to_owned(),
            "user".to_owned(),
            "pass".to_owned(),
        );

        let newer = CachedToken::from_expiry("newer".to_owned(), Utc::now() + Duration::hours(1));
        *client.token.lock().await = Some(newer);

        // A task holding the older token reports it stale; the newer one stays.
        client.invalidate("older").await;
        assert!(client.token.lock().await.is_some());

        client.invalidate("newer").await;
        assert!(client.token.lock().await.is_none());
    }
}
