// REST API v4 HTTP client
//
// Wraps `reqwest::Client` with API-root URL construction, bearer
// authentication, and status classification (401, 429, structured errors).
// Endpoint groups (auth, users, channels, ...) live in sibling files as
// inherent methods so this module stays focused on transport mechanics.

use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::models::ApiErrorBody;
use crate::transport::TransportConfig;

/// Header carrying the rate-limit reset delay, in seconds.
pub const RATE_LIMIT_RESET_HEADER: &str = "X-RateLimit-Reset";

/// Page size used for every paginated listing.
pub const PER_PAGE: usize = 200;

/// Raw HTTP client for the REST API.
///
/// Immutable once built: logging in produces a new authenticated client
/// via [`with_token`](Self::with_token) rather than mutating this one, so
/// a client can be shared freely across tasks.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    server_url: Url,
    api_base: Url,
    token: Option<SecretString>,
}

impl RestClient {
    /// Create an unauthenticated client for the server at `server_url`
    /// (e.g. `https://chat.example.com` or `http://localhost:8065`).
    pub fn new(server_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Self::with_client(http, server_url)
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, mut server_url: Url) -> Result<Self, Error> {
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }
        let api_base = server_url.join("api/v4/")?;
        Ok(Self {
            http,
            server_url,
            api_base,
            token: None,
        })
    }

    /// A copy of this client that authenticates every request with `token`.
    pub fn with_token(&self, token: SecretString) -> Self {
        Self {
            token: Some(token),
            ..self.clone()
        }
    }

    /// The session token, if this client is authenticated.
    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// The server root URL (always ends with `/`).
    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    /// The underlying HTTP client.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build `{server}/api/v4/{path}`.
    pub(crate) fn api_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.api_base.join(path.trim_start_matches('/'))?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match self.token {
            Some(ref token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    /// Send a GET request and decode the JSON body.
    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.api_url(path)?;
        debug!("GET {}", url);
        let resp = self.request(Method::GET, url).send().await?;
        parse_json(resp).await
    }

    /// Send a GET request with query parameters and decode the JSON body.
    pub(crate) async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Error> {
        let url = self.api_url(path)?;
        debug!("GET {} {:?}", url, query);
        let resp = self.request(Method::GET, url).query(query).send().await?;
        parse_json(resp).await
    }

    /// Send a POST request with JSON body and decode the JSON response.
    pub(crate) async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let resp = self.send_json(Method::POST, path, body).await?;
        parse_json(resp).await
    }

    /// Send a PUT request with JSON body and decode the JSON response.
    pub(crate) async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let resp = self.send_json(Method::PUT, path, body).await?;
        parse_json(resp).await
    }

    /// Send a DELETE request, discarding the response body.
    pub(crate) async fn delete(&self, path: &str) -> Result<(), Error> {
        let url = self.api_url(path)?;
        debug!("DELETE {}", url);
        let resp = self.request(Method::DELETE, url).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    /// Send a JSON request and return the raw response once its status
    /// has been checked.
    pub(crate) async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Response, Error> {
        let url = self.api_url(path)?;
        debug!("{} {}", method, url);
        let resp = self.request(method, url).json(body).send().await?;
        check_status(resp).await
    }

    /// Walk a paginated listing until a short page is returned.
    pub(crate) async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<T>, Error> {
        let mut all = Vec::new();
        let mut page = 0usize;
        loop {
            let mut query: Vec<(&str, String)> = extra.to_vec();
            query.push(("page", page.to_string()));
            query.push(("per_page", PER_PAGE.to_string()));

            let batch: Vec<T> = self.get_with_query(path, &query).await?;
            let len = batch.len();
            all.extend(batch);
            if len < PER_PAGE {
                break;
            }
            page += 1;
        }
        debug!(path, count = all.len(), pages = page + 1, "paginated listing complete");
        Ok(all)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("server_url", &self.server_url.as_str())
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

// ── Response classification ──────────────────────────────────────────

/// Decode a JSON body after classifying the status.
pub(crate) async fn parse_json<T: DeserializeOwned>(resp: Response) -> Result<T, Error> {
    let resp = check_status(resp).await?;
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Pass 2xx responses through, map everything else to an [`Error`].
///
/// - 401 becomes [`Error::Authentication`]
/// - 429 becomes [`Error::RateLimited`] or [`Error::RateLimitMalformed`]
/// - anything else becomes [`Error::Api`] using the server's
///   `{ id, message }` error body when it has one
pub(crate) async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(rate_limit_error(resp.headers()));
    }

    let body = resp.text().await.unwrap_or_default();
    let parsed: Option<ApiErrorBody> = serde_json::from_str(&body).ok();
    let (id, message) = match parsed {
        Some(err) => (err.id, err.message),
        None => (None, None),
    };
    let message = message
        .filter(|m| !m.is_empty())
        .or_else(|| (!body.is_empty()).then(|| body.clone()))
        .unwrap_or_else(|| status.to_string());

    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Authentication { message });
    }

    Err(Error::Api {
        message,
        id,
        status: status.as_u16(),
    })
}

/// Classify a 429 by its `X-RateLimit-Reset` header.
pub fn rate_limit_error(headers: &HeaderMap) -> Error {
    let raw = headers
        .get(RATE_LIMIT_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match raw.map(str::parse::<u64>) {
        Some(Ok(retry_after_secs)) => Error::RateLimited { retry_after_secs },
        _ => Error::RateLimitMalformed {
            value: raw.map(String::from),
        },
    }
}
