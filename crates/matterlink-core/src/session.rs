// ── Session supervisor ──
//
// Full lifecycle of one chat-server session: probe, authenticate, populate
// the entity cache, attach the event stream, and keep all of it alive.
// Connection-scoped work (dispatch, keepalive, anti-idle) hangs off a
// per-connection cancellation token; logout cancels the session-wide one.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use strum::Display;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use matterlink_api::models::{FileInfo, NewPost, Post, UserStatus};
use matterlink_api::{
    RestClient, StreamConnection, StreamHandle, StreamOptions, TlsMode, TransportConfig,
};

use crate::backoff::Backoff;
use crate::cache::{ClientSlot, EntityCache};
use crate::config::{AuthMode, SESSION_COOKIE_NAME, SessionConfig, TlsVerification};
use crate::error::CoreError;
use crate::event::{InboundEvent, InboundEvents};
use crate::keepalive::LivenessClock;
use crate::observer::SessionObserver;
use crate::ratelimit::retry_rate_limited;
use crate::{anti_idle, dispatch, keepalive};

/// Number of recent post digests remembered for repost suppression.
const SEEN_POSTS_CAPACITY: usize = 500;

// ── SessionState ─────────────────────────────────────────────────

/// Supervisor state, observable through [`Session::subscribe_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    CacheLoading,
    StreamAttaching,
    Live,
    #[strum(to_string = "Reconnecting (attempt {attempt})")]
    Reconnecting { attempt: u32 },
    Closed,
}

// ── Reconnect guard ──────────────────────────────────────────────

/// Single-flight flag for reconnection sequences.
#[derive(Debug, Default)]
pub(crate) struct ReconnectGuard {
    flag: Arc<AtomicBool>,
}

/// Held for the duration of one reconnection sequence.
#[derive(Debug)]
pub(crate) struct ReconnectPermit {
    flag: Arc<AtomicBool>,
}

impl ReconnectGuard {
    pub(crate) fn try_acquire(&self) -> Option<ReconnectPermit> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconnectPermit {
                flag: Arc::clone(&self.flag),
            })
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Drop for ReconnectPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Handle to the running session.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Create with
/// [`new`](Self::new), take the event stream with [`events`](Self::events),
/// then call [`connect`](Self::connect).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct Connection {
    scope: CancellationToken,
    stream: StreamHandle,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionInner {
    config: SessionConfig,
    auth_mode: AuthMode,
    server_url: Url,
    anon: RestClient,
    accept_invalid_certs: bool,
    client: ClientSlot,
    cache: Arc<EntityCache>,
    state: watch::Sender<SessionState>,
    server_version: RwLock<Option<String>>,
    connected: AtomicBool,
    quit_requested: AtomicBool,
    reconnect: ReconnectGuard,
    shutdown: CancellationToken,
    connection: Mutex<Option<Connection>>,
    event_tx: std::sync::Mutex<Option<mpsc::Sender<InboundEvent>>>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    events_taken: AtomicBool,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    seen_posts: std::sync::Mutex<LruCache<[u8; 32], ()>>,
}

impl Session {
    /// Validate the configuration and build an idle session. Does NOT
    /// connect.
    ///
    /// Malformed token markers and unusable server addresses fail here.
    pub fn new(config: SessionConfig) -> Result<Self, CoreError> {
        let auth_mode = config.credentials.auth_mode()?;
        let server_url = config.credentials.server_url()?;

        let mut transport = build_transport(&config);
        if let AuthMode::SessionCookie(ref cookie) = auth_mode {
            transport =
                transport.with_session_cookie(&server_url, SESSION_COOKIE_NAME, cookie.expose_secret());
        }
        let accept_invalid_certs = transport.accepts_invalid_certs();
        let anon = RestClient::new(server_url.clone(), &transport)?;

        let client: ClientSlot = Arc::new(ArcSwapOption::empty());
        let cache = Arc::new(EntityCache::new(Arc::clone(&client)));
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let seen_capacity = NonZeroUsize::new(SEEN_POSTS_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        debug!(server = %server_url, auth = auth_mode.label(), "session created");

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                auth_mode,
                server_url,
                anon,
                accept_invalid_certs,
                client,
                cache,
                state,
                server_version: RwLock::new(None),
                connected: AtomicBool::new(false),
                quit_requested: AtomicBool::new(false),
                reconnect: ReconnectGuard::default(),
                shutdown: CancellationToken::new(),
                connection: Mutex::new(None),
                event_tx: std::sync::Mutex::new(Some(event_tx)),
                event_rx: std::sync::Mutex::new(Some(event_rx)),
                events_taken: AtomicBool::new(false),
                observers: RwLock::new(Vec::new()),
                seen_posts: std::sync::Mutex::new(LruCache::new(seen_capacity)),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.inner.auth_mode
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.inner.cache
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Server version discovered by the last successful probe.
    pub fn server_version(&self) -> Option<String> {
        self.inner
            .server_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the consumer event stream. Can only be taken once.
    pub fn events(&self) -> Result<InboundEvents, CoreError> {
        let rx = self
            .inner
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(CoreError::EventsTaken)?;
        self.inner.events_taken.store(true, Ordering::Release);
        Ok(InboundEvents::new(rx))
    }

    /// Register a lifecycle observer.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// The current authenticated REST client.
    pub fn rest(&self) -> Result<Arc<RestClient>, CoreError> {
        self.inner.client.load_full().ok_or(CoreError::NotConnected)
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        self.inner.reconnect.in_flight()
    }

    pub(crate) fn event_sender(&self) -> Option<mpsc::Sender<InboundEvent>> {
        if !self.inner.events_taken.load(Ordering::Acquire) {
            return None;
        }
        self.inner
            .event_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` the first time a given post payload is seen.
    pub(crate) fn first_delivery(&self, event: &str, raw_post: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(event.as_bytes());
        hasher.update([0u8]);
        hasher.update(raw_post.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        self.inner
            .seen_posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(digest, ())
            .is_none()
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.send_replace(state);
        debug!(%state, "session state");
    }

    fn quit_requested(&self) -> bool {
        self.inner.quit_requested.load(Ordering::Acquire)
    }

    /// Sleep, unless the session is shut down first.
    async fn pause(&self, delay: Duration) -> Result<(), CoreError> {
        tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => Err(CoreError::SessionClosed),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Sleep exactly the advertised reset delay of a rate-limited call.
    async fn wait_rate_limit(&self, call: &str, retry_after_secs: u64) -> Result<(), CoreError> {
        warn!(call, retry_after_secs, "rate limited, waiting for reset");
        self.pause(Duration::from_secs(retry_after_secs)).await
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect for the first time.
    ///
    /// Transport failures are retried with backoff. Authentication
    /// rejections, an unknown team, and cache population failures are
    /// returned as fatal. Fails with [`CoreError::AlreadyConnected`] while
    /// the session is live or reconnecting.
    pub async fn connect(&self) -> Result<(), CoreError> {
        if self.quit_requested() {
            return Err(CoreError::SessionClosed);
        }
        if self.is_connected() || self.is_reconnecting() {
            return Err(CoreError::AlreadyConnected);
        }
        match self.establish(true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "initial connection failed");
                self.inner.client.store(None);
                if !self.quit_requested() {
                    self.set_state(SessionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Run the connect sequence once. `first` makes authentication
    /// rejections fatal instead of retried.
    async fn establish(&self, first: bool) -> Result<(), CoreError> {
        let mut backoff = Backoff::new(self.inner.config.backoff);

        self.set_state(SessionState::Authenticating);
        self.probe_server(first, &mut backoff).await?;
        backoff.reset();

        let client = self.authenticate(first, &mut backoff).await?;
        backoff.reset();
        self.inner.client.store(Some(Arc::new(client)));

        self.set_state(SessionState::CacheLoading);
        let team = &self.inner.config.credentials.team;
        self.inner.cache.load_teams(team).await?;

        self.set_state(SessionState::StreamAttaching);
        self.inner.cache.refresh_all_channels().await?;
        let stream = self.attach_stream(&mut backoff).await?;

        self.go_live(stream).await
    }

    /// Retry `GET /system/ping` until the server reports a version.
    async fn probe_server(&self, first: bool, backoff: &mut Backoff) -> Result<(), CoreError> {
        loop {
            match self.inner.anon.ping().await {
                Ok(Some(version)) => {
                    info!(%version, server = %self.inner.server_url, "server is up");
                    *self
                        .inner
                        .server_version
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(version);
                    return Ok(());
                }
                Ok(None) => debug!("server answered without a version, not up yet"),
                Err(matterlink_api::Error::RateLimited { retry_after_secs }) => {
                    self.wait_rate_limit("ping", retry_after_secs).await?;
                    continue;
                }
                Err(e) if first && !e.is_transient() => return Err(e.into()),
                Err(e) => warn!(error = %e, attempt = backoff.attempt(), "server probe failed"),
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "waiting before next probe");
            self.pause(delay).await?;
        }
    }

    /// Log in according to the auth mode, retrying with backoff.
    async fn authenticate(
        &self,
        first: bool,
        backoff: &mut Backoff,
    ) -> Result<RestClient, CoreError> {
        loop {
            match self.login_once().await {
                Ok(client) => return Ok(client),
                Err(matterlink_api::Error::RateLimited { retry_after_secs }) => {
                    self.wait_rate_limit("login", retry_after_secs).await?;
                }
                Err(e) if first && !e.is_transient() => {
                    error!(error = %e, auth = self.inner.auth_mode.label(), "login rejected");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt(), "login failed, retrying");
                    self.pause(backoff.next_delay()).await?;
                }
            }
        }
    }

    async fn login_once(&self) -> Result<RestClient, matterlink_api::Error> {
        let creds = &self.inner.config.credentials;
        let (client, me) = match self.inner.auth_mode {
            AuthMode::Password => {
                self.inner
                    .anon
                    .login(&creds.login, &creds.secret, creds.mfa_token.as_deref())
                    .await?
            }
            AuthMode::PersonalToken(ref token) | AuthMode::SessionCookie(ref token) => {
                let client = self.inner.anon.with_token(token.clone());
                let me = client.me().await?;
                (client, me)
            }
        };
        info!(user = %me.username, auth = self.inner.auth_mode.label(), "logged in");
        self.inner.cache.set_me(me).await;
        Ok(client)
    }

    fn stream_options(&self, token: SecretString) -> Result<StreamOptions, CoreError> {
        let url = match self.inner.config.stream_url {
            Some(ref url) => url.clone(),
            None => matterlink_api::stream_url(&self.inner.server_url)?,
        };
        let mut options = StreamOptions::new(url, token);
        if let AuthMode::SessionCookie(ref cookie) = self.inner.auth_mode {
            options.cookie = Some(format!("{SESSION_COOKIE_NAME}={}", cookie.expose_secret()));
        }
        options.accept_invalid_certs = self.inner.accept_invalid_certs;
        options.ping_timeout = self.inner.config.ping_timeout;
        options.buffer = self.inner.config.event_buffer.max(1);
        Ok(options)
    }

    /// Open the event stream, retrying with backoff.
    async fn attach_stream(&self, backoff: &mut Backoff) -> Result<StreamConnection, CoreError> {
        let token = self
            .rest()?
            .token()
            .cloned()
            .ok_or(CoreError::NotConnected)?;
        let options = self.stream_options(token)?;
        loop {
            match StreamConnection::connect(options.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt(), "stream attach failed");
                    self.pause(backoff.next_delay()).await?;
                }
            }
        }
    }

    /// Install a fresh connection scope and start the connection tasks.
    async fn go_live(&self, stream: StreamConnection) -> Result<(), CoreError> {
        let StreamConnection { handle, inbound } = stream;
        let mut slot = self.inner.connection.lock().await;

        if self.quit_requested() {
            handle.close();
            return Err(CoreError::SessionClosed);
        }

        let scope = self.inner.shutdown.child_token();
        let clock = Arc::new(LivenessClock::new());
        let config = &self.inner.config;

        let mut tasks = vec![
            tokio::spawn(dispatch::run(
                self.clone(),
                handle.clone(),
                inbound,
                Arc::clone(&clock),
                config.dispatch_tick,
                scope.clone(),
            )),
            tokio::spawn(keepalive::run(
                self.clone(),
                handle.clone(),
                clock,
                config.keepalive,
                scope.clone(),
            )),
        ];
        if let Some(ref anti_idle) = config.anti_idle {
            tasks.push(tokio::spawn(anti_idle::run(
                self.clone(),
                anti_idle.clone(),
                scope.clone(),
            )));
        }

        let previous = slot.replace(Connection {
            scope,
            stream: handle,
            tasks,
        });
        drop(slot);
        if let Some(previous) = previous {
            warn!("replacing a connection that was still installed");
            previous.scope.cancel();
            previous.stream.close();
        }

        self.inner.connected.store(true, Ordering::Release);
        self.set_state(SessionState::Live);
        info!("session live");

        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_connected(self);
        }
        Ok(())
    }

    /// Cancel the connection scope, close the stream, and wait for the
    /// connection tasks to finish.
    async fn teardown(&self) {
        let connection = self.inner.connection.lock().await.take();
        self.inner.connected.store(false, Ordering::Release);

        let Some(connection) = connection else {
            return;
        };
        connection.scope.cancel();
        connection.stream.close();
        for task in connection.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
        debug!("connection torn down");
    }

    /// Request a full reconnection.
    ///
    /// Single-flight: while a reconnection sequence is running, further
    /// requests are dropped. Ignored after logout.
    pub fn trigger_reconnect(&self, reason: &str) {
        if self.quit_requested() {
            return;
        }
        let Some(permit) = self.inner.reconnect.try_acquire() else {
            debug!(reason, "reconnect already in flight, ignoring trigger");
            return;
        };
        warn!(reason, "connection lost, reconnecting");
        let session = self.clone();
        tokio::spawn(async move {
            session.reconnect(permit).await;
        });
    }

    async fn reconnect(&self, _permit: ReconnectPermit) {
        self.teardown().await;

        let mut backoff = Backoff::new(self.inner.config.backoff);
        let mut attempt: u32 = 0;
        loop {
            if self.quit_requested() {
                return;
            }
            attempt = attempt.saturating_add(1);
            self.set_state(SessionState::Reconnecting { attempt });

            match self.establish(false).await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return;
                }
                Err(CoreError::SessionClosed) => return,
                Err(e) => {
                    warn!(error = %e, attempt, "reconnect attempt failed");
                    if self.pause(backoff.next_delay()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// End the session: stop all background work, close the stream,
    /// invalidate a password session server-side, and end the consumer
    /// event stream. Idempotent.
    pub async fn logout(&self) -> Result<(), CoreError> {
        if self.inner.quit_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("logging out");
        self.inner.shutdown.cancel();
        self.teardown().await;

        let client = self.inner.client.swap(None);
        let result = match client {
            Some(client) if self.inner.auth_mode.owns_session() => {
                client.logout().await.map_err(CoreError::from)
            }
            Some(_) => {
                debug!(auth = self.inner.auth_mode.label(), "keeping server session alive");
                Ok(())
            }
            None => Ok(()),
        };
        if let Err(ref e) = result {
            warn!(error = %e, "server-side logout failed");
        }

        self.set_state(SessionState::Closed);
        self.inner
            .event_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("session closed");
        result
    }

    // ── Outbound helpers ─────────────────────────────────────────

    async fn my_id(&self) -> Result<String, CoreError> {
        self.inner
            .cache
            .me()
            .await
            .map(|me| me.id.clone())
            .ok_or(CoreError::NotConnected)
    }

    /// Post a message to a channel.
    pub async fn post_message(&self, channel_id: &str, text: &str) -> Result<Post, CoreError> {
        self.post_message_with_files(channel_id, text, "", &[]).await
    }

    /// Post a message with attachments, optionally as a thread reply.
    pub async fn post_message_with_files(
        &self,
        channel_id: &str,
        text: &str,
        root_id: &str,
        file_ids: &[String],
    ) -> Result<Post, CoreError> {
        let client = self.rest()?;
        let post = NewPost {
            channel_id: channel_id.to_owned(),
            message: text.to_owned(),
            root_id: root_id.to_owned(),
            file_ids: file_ids.to_vec(),
        };
        Ok(retry_rate_limited("create_post", || client.create_post(&post)).await?)
    }

    /// Replace the text of a post.
    pub async fn edit_message(&self, post_id: &str, text: &str) -> Result<Post, CoreError> {
        let client = self.rest()?;
        Ok(retry_rate_limited("patch_post", || client.patch_post(post_id, text)).await?)
    }

    pub async fn delete_message(&self, post_id: &str) -> Result<(), CoreError> {
        let client = self.rest()?;
        Ok(retry_rate_limited("delete_post", || client.delete_post(post_id)).await?)
    }

    /// Upload a file into a channel; attach it with
    /// [`post_message_with_files`](Self::post_message_with_files).
    pub async fn upload_file(
        &self,
        channel_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<FileInfo, CoreError> {
        let client = self.rest()?;
        Ok(retry_rate_limited("upload_file", || {
            client.upload_file(channel_id, file_name, data.clone())
        })
        .await?)
    }

    /// Public links for files, falling back to the authenticated download
    /// URL when public links are disabled.
    pub async fn file_links(&self, file_ids: &[String]) -> Result<Vec<String>, CoreError> {
        let client = self.rest()?;
        let mut links = Vec::with_capacity(file_ids.len());
        for id in file_ids {
            match retry_rate_limited("file_link", || client.file_link(id)).await {
                Ok(link) => links.push(link),
                Err(e) => {
                    debug!(file_id = %id, error = %e, "public link unavailable, using download URL");
                    links.push(client.file_download_url(id)?.to_string());
                }
            }
        }
        Ok(links)
    }

    /// When the session user last viewed a channel (ms since epoch), or
    /// now if that cannot be determined.
    pub async fn last_viewed_at(&self, channel_id: &str) -> i64 {
        let member = match (self.rest(), self.my_id().await) {
            (Ok(client), Ok(me)) => {
                retry_rate_limited("channel_member", || client.channel_member(channel_id, &me))
                    .await
                    .ok()
            }
            _ => None,
        };
        member.map_or_else(|| Utc::now().timestamp_millis(), |m| m.last_viewed_at)
    }

    /// Mark a channel as viewed by the session user.
    pub async fn update_last_viewed(&self, channel_id: &str) -> Result<(), CoreError> {
        let client = self.rest()?;
        let me = self.my_id().await?;
        Ok(retry_rate_limited("view_channel", || client.view_channel(&me, channel_id)).await?)
    }

    /// Set the session user's presence.
    pub async fn update_status(&self, status: UserStatus) -> Result<(), CoreError> {
        let client = self.rest()?;
        let me = self.my_id().await?;
        Ok(retry_rate_limited("update_status", || client.update_status(&me, status)).await?)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.inner.server_url.as_str())
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn build_transport(config: &SessionConfig) -> TransportConfig {
    let tls = match config.tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(ref path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    };
    TransportConfig {
        tls,
        timeout: config.timeout,
        cookie_jar: None,
    }
}
