//! A single-port authenticating reverse proxy.
//!
//! Each server owns one listener and forwards every authenticated
//! request to one fixed backend address. Unauthenticated requests are
//! redirected to a login page served under the configured redirect
//! path; `POST {redirect_path}/api/login` issues the session cookie.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::rejection::JsonRejection,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::Authorizer;
use crate::error::{ProxyError, Result};
use crate::session::SessionStore;

/// Login page served under the redirect path.
const LOGIN_PAGE: &str = include_str!("../assets/login.html");

/// Headers that are meaningful per hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// TLS listener configuration; `insecure` serves plain TCP instead.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub insecure: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    owner_id: Arc<str>,
    redirect_path: Arc<str>,
    backend: Url,
    session: Arc<SessionStore>,
    authorizer: Arc<dyn Authorizer>,
    client: reqwest::Client,
}

impl AppState {
    fn under_redirect_path(&self, path: &str) -> bool {
        path == &*self.redirect_path
            || path
                .strip_prefix(&*self.redirect_path)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// One HTTP(S) listener gating access to one backend port for one user.
pub struct ProxyServer {
    owner_id: String,
    redirect_path: String,
    tls: TlsConfig,
    listen_addr: Option<String>,
    backend: Option<Url>,
    session: Option<Arc<SessionStore>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    port_tx: watch::Sender<u16>,
}

impl ProxyServer {
    pub fn new(
        owner_id: impl Into<String>,
        redirect_path: impl Into<String>,
        tls: TlsConfig,
    ) -> Self {
        let (port_tx, _) = watch::channel(0);
        let mut redirect_path = redirect_path.into();
        while redirect_path.ends_with('/') {
            redirect_path.pop();
        }
        Self {
            owner_id: owner_id.into(),
            redirect_path,
            tls,
            listen_addr: None,
            backend: None,
            session: None,
            authorizer: None,
            port_tx,
        }
    }

    /// Install the listen address and the backend every non-login
    /// request is forwarded to. An address ending in `:0` binds an
    /// OS-assigned ephemeral port. Must be called before [`start`].
    ///
    /// [`start`]: ProxyServer::start
    pub fn configure_routes(&mut self, listen_addr: impl Into<String>, backend: Url) {
        self.listen_addr = Some(listen_addr.into());
        self.backend = Some(backend);
    }

    pub fn set_session_store(&mut self, store: Arc<SessionStore>) {
        self.session = Some(store);
    }

    pub fn set_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizer = Some(authorizer);
    }

    /// Port the listener is bound to; zero until [`start`] has bound it.
    /// Safe to read from other tasks.
    ///
    /// [`start`]: ProxyServer::start
    pub fn listener_port(&self) -> u16 {
        *self.port_tx.borrow()
    }

    pub fn port_watch(&self) -> watch::Receiver<u16> {
        self.port_tx.subscribe()
    }

    /// Serve until `shutdown` is cancelled, then drain open connections
    /// for at most `graceful_timeout` before aborting them.
    pub async fn start(
        &self,
        shutdown: CancellationToken,
        graceful_timeout: Duration,
    ) -> Result<()> {
        let listen_addr = self
            .listen_addr
            .clone()
            .ok_or(ProxyError::NotConfigured("routes"))?;
        let backend = self
            .backend
            .clone()
            .ok_or(ProxyError::NotConfigured("routes"))?;
        let session = self
            .session
            .clone()
            .ok_or(ProxyError::NotConfigured("session store"))?;
        let authorizer = self
            .authorizer
            .clone()
            .ok_or(ProxyError::NotConfigured("authorizer"))?;

        // The forwarding client must hand redirects back to the browser
        // untouched.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::HttpClient(e.to_string()))?;

        let state = AppState {
            owner_id: Arc::from(self.owner_id.as_str()),
            redirect_path: Arc::from(self.redirect_path.as_str()),
            backend,
            session,
            authorizer,
            client,
        };
        let app = router(state);

        let acceptor = if self.tls.insecure {
            None
        } else {
            Some(load_tls_acceptor(&self.tls)?)
        };

        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: listen_addr.clone(),
                source: e,
            })?;
        let local = listener.local_addr()?;
        self.port_tx.send_replace(local.port());
        info!(addr = %local, tls = acceptor.is_some(), backend = %self.backend.as_ref().map(Url::as_str).unwrap_or(""), "authenticating proxy listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted connection");
                    let app = app.clone();
                    let acceptor = acceptor.clone();
                    let cancel = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, acceptor, app, cancel).await {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(graceful_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(port = local.port(), "graceful shutdown timed out, aborting open connections");
            connections.shutdown().await;
        }
        self.port_tx.send_replace(0);
        info!(port = local.port(), "authenticating proxy stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    acceptor: Option<TlsAcceptor>,
    app: Router,
    cancel: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            serve_io(tls, app, cancel).await
        }
        None => serve_io(stream, app, cancel).await,
    }
}

async fn serve_io<S>(
    stream: S,
    app: Router,
    cancel: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        app.clone().call(request)
    });
    let builder = server::conn::auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            // Stop accepting new requests on this connection but let the
            // in-flight one finish; the caller bounds the overall drain.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = tls
        .cert_file
        .as_ref()
        .ok_or(ProxyError::NotConfigured("TLS certificate file"))?;
    let key_file = tls
        .key_file
        .as_ref()
        .ok_or(ProxyError::NotConfigured("TLS key file"))?;

    let mut cert_reader = BufReader::new(
        File::open(cert_file)
            .map_err(|e| ProxyError::Tls(format!("{}: {e}", cert_file.display())))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ProxyError::Tls(format!("{}: {e}", cert_file.display())))?;

    let mut key_reader = BufReader::new(
        File::open(key_file).map_err(|e| ProxyError::Tls(format!("{}: {e}", key_file.display())))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Tls(format!("{}: {e}", key_file.display())))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key in {}", key_file.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn router(state: AppState) -> Router {
    let base = state.redirect_path.to_string();
    Router::new()
        .route(&format!("{base}/api/login"), post(handle_login))
        .route(&base, get(login_page))
        .route(&format!("{base}/{{*rest}}"), get(login_page))
        .fallback(forward_request)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// Log every request before it is routed.
async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let host = header_str(req.headers(), header::HOST);
    let forwarded_for = header_str(req.headers(), "x-forwarded-for");
    let upgrade = header_str(req.headers(), header::UPGRADE);
    let user_agent = header_str(req.headers(), header::USER_AGENT);
    info!(
        %method,
        url = %uri,
        %host,
        x_forwarded_for = %forwarded_for,
        %upgrade,
        %user_agent,
        "request",
    );
    next.run(req).await
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Session check in front of everything that is not the login UI.
async fn auth_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    // manifest.json is probed by browsers without credentials.
    if path.contains("manifest.json") || state.under_redirect_path(path) {
        return next.run(req).await;
    }

    let now = Utc::now().timestamp();
    let record = match state.session.from_headers(req.headers()) {
        Some(record) => record,
        None => return redirect_to_login(&state, req.uri()),
    };
    if record.user_id != *state.owner_id || record.is_expired(now) {
        return redirect_to_login(&state, req.uri());
    }

    if record.deadline > 0 {
        // Requests must not outlive the session deadline.
        let remaining = Duration::from_secs((record.deadline - now).max(1) as u64);
        match tokio::time::timeout(remaining, next.run(req)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(user = %record.user_id, "request cancelled at session deadline");
                StatusCode::GATEWAY_TIMEOUT.into_response()
            }
        }
    } else {
        next.run(req).await
    }
}

fn redirect_to_login(state: &AppState, uri: &Uri) -> Response {
    let original = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("redirect_to", original)
        .finish();
    let location = format!("{}?{}", state.redirect_path, query);
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    id: String,
    password: String,
}

async fn handle_login(
    State(state): State<AppState>,
    payload: std::result::Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(login)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if login.id.is_empty() || login.password.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if login.id != *state.owner_id {
        info!(user = %login.id, "login attempt for foreign user");
        return StatusCode::FORBIDDEN.into_response();
    }
    match state.authorizer.authorize(&login.id, &login.password).await {
        Ok(true) => {}
        Ok(false) => {
            info!(user = %login.id, "login rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            warn!(user = %login.id, error = %e, "authorizer failure");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let record = state.session.new_record(&login.id);
    match state.session.save(&record) {
        Ok(cookie) => {
            info!(user = %login.id, "login succeeded");
            (StatusCode::OK, [(header::SET_COOKIE, cookie)]).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to encode session cookie");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Fallback for every path outside the login UI: reverse-proxy to the
/// backend. The auth gate has already run at this point.
async fn forward_request(State(state): State<AppState>, req: Request) -> Response {
    if state.under_redirect_path(req.uri().path()) {
        // Unmatched method or trailing slash under the login UI.
        return login_page().await.into_response();
    }
    let backend = state.backend.clone();
    match forward(&state, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, backend = %backend, "backend request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn forward(state: &AppState, req: Request) -> anyhow::Result<Response> {
    let mut url = state.backend.clone();
    url.set_path(req.uri().path());
    url.set_query(req.uri().query());

    let (parts, body) = req.into_parts();
    let mut builder = state.client.request(parts.method, url);
    for (name, value) in &parts.headers {
        let lower = name.as_str();
        if lower == "host" || lower == "content-length" || HOP_BY_HOP.contains(&lower) {
            continue;
        }
        builder = builder.header(name, value);
    }
    let upstream = builder
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
