// Session authentication
//
// Password (optionally MFA) login, identity lookup, logout, and the
// unauthenticated availability probe. The session token comes back in the
// `Token` response header of the login call.

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::debug;

use crate::error::Error;
use crate::models::User;
use crate::rest::client::{RestClient, check_status, parse_json};

/// Response header carrying the session token after login.
pub const TOKEN_HEADER: &str = "Token";

/// Response header carrying the server build version.
pub const VERSION_HEADER: &str = "X-Version-Id";

impl RestClient {
    /// Probe `GET /system/ping`.
    ///
    /// Returns the server version from the `X-Version-Id` header, or `None`
    /// when the server answered without one (still starting up, or a proxy
    /// in front of it).
    pub async fn ping(&self) -> Result<Option<String>, Error> {
        let url = self.api_url("system/ping")?;
        debug!("probing {}", url);
        let resp = self.request(Method::GET, url).send().await?;
        let resp = check_status(resp).await?;
        let version = resp
            .headers()
            .get(VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);
        Ok(version)
    }

    /// Log in with a username/email and password.
    ///
    /// Returns a new client carrying the session token, and the logged-in
    /// user. `mfa_token` is sent as the login `token` field when present.
    pub async fn login(
        &self,
        login_id: &str,
        password: &SecretString,
        mfa_token: Option<&str>,
    ) -> Result<(RestClient, User), Error> {
        let url = self.api_url("users/login")?;
        debug!("logging in at {} as {}", url, login_id);

        let mut body = json!({
            "login_id": login_id,
            "password": password.expose_secret(),
        });
        if let Some(code) = mfa_token {
            body["token"] = json!(code);
        }

        let resp = self.http().post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success()
            && status != StatusCode::TOO_MANY_REQUESTS
            && !status.is_server_error()
        {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {text}"),
            });
        }
        let resp = check_status(resp).await?;

        let token = resp
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.to_owned()))
            .ok_or(Error::MissingToken)?;

        let user: User = parse_json(resp).await?;
        debug!(user_id = %user.id, "login successful");
        Ok((self.with_token(token), user))
    }

    /// `GET /users/me` -- validates the current token and returns its user.
    pub async fn me(&self) -> Result<User, Error> {
        if !self.is_authenticated() {
            return Err(Error::NotLoggedIn);
        }
        self.get("users/me").await
    }

    /// Invalidate the session server-side.
    pub async fn logout(&self) -> Result<(), Error> {
        if !self.is_authenticated() {
            return Err(Error::NotLoggedIn);
        }
        debug!("logging out");
        self.send_json(Method::POST, "users/logout", &json!({}))
            .await?;
        debug!("logout complete");
        Ok(())
    }
}
