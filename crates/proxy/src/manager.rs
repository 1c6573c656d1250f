//! Lifecycle authority for a fleet of authenticating proxies.
//!
//! All proxies spawned by one manager share one session secret, one
//! owner identity and one backend scheme, so a login on any of them is
//! honored by all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::Authorizer;
use crate::error::{ProxyError, Result};
use crate::server::{ProxyServer, TlsConfig};
use crate::session::{SessionSecret, SessionStore};

/// Interval between port-bind and health-check probes.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Extra drain budget handed to the server beyond what shutdown waits
/// for, so a drain that overruns surfaces as a timeout error here while
/// the server still cleans up behind it.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

/// Public identity of one running proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPortProxyInfo {
    /// Network rule name this proxy serves; unique within a manager.
    pub name: String,
    /// Real workload port the proxy forwards to.
    pub target_port: u16,
    /// Ephemeral port the proxy listens on.
    pub local_port: u16,
}

#[derive(Debug, Clone)]
pub struct ProxyManagerConfig {
    /// The only user identity whose sessions the fleet accepts.
    pub owner_id: String,
    /// Scheme the proxies themselves serve and target (`http`/`https`).
    pub backend_scheme: String,
    /// Path prefix for the login UI and API on every proxy.
    pub redirect_path: String,
    pub cookie_name: String,
    /// Session lifetime in seconds; zero means sessions never expire.
    pub session_max_age_secs: i64,
    /// Bound on waiting for a proxy to terminate.
    pub graceful_shutdown_timeout: Duration,
    /// Deadline for a freshly started proxy to answer its first probe.
    pub startup_check_timeout: Duration,
    pub tls: TlsConfig,
}

impl Default for ProxyManagerConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            backend_scheme: "http".to_string(),
            redirect_path: "/portgate".to_string(),
            cookie_name: "portgate-session".to_string(),
            session_max_age_secs: 86400,
            graceful_shutdown_timeout: Duration::from_secs(10),
            startup_check_timeout: Duration::from_secs(30),
            tls: TlsConfig {
                insecure: true,
                ..TlsConfig::default()
            },
        }
    }
}

struct ProxyEntry {
    info: LocalPortProxyInfo,
    shutdown: CancellationToken,
    done: oneshot::Receiver<Result<()>>,
}

/// Creates, tracks and tears down proxies, one per rule name.
pub struct ProxyManager {
    config: ProxyManagerConfig,
    session: Arc<SessionStore>,
    authorizer: Arc<dyn Authorizer>,
    probe: reqwest::Client,
    registry: RwLock<HashMap<String, ProxyEntry>>,
    // Serializes creation and teardown; creation fails fast when held.
    lifecycle_lock: Mutex<()>,
}

impl ProxyManager {
    /// Generate the shared session secret and an empty registry.
    pub fn new(config: ProxyManagerConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let secret = SessionSecret::generate()?;
        let session = Arc::new(SessionStore::new(
            &secret,
            &config.cookie_name,
            config.session_max_age_secs,
        )?);
        // Startup probes hit the proxy's own ephemeral port, whose
        // certificate is never valid for localhost.
        let probe = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProxyError::HttpClient(e.to_string()))?;
        Ok(Self {
            config,
            session,
            authorizer,
            probe,
            registry: RwLock::new(HashMap::new()),
            lifecycle_lock: Mutex::new(()),
        })
    }

    pub fn session_store(&self) -> Arc<SessionStore> {
        self.session.clone()
    }

    /// Start a proxy named `name` forwarding to `localhost:target_port`
    /// and wait until it is bound and answering probes.
    ///
    /// Fails if a proxy of that name exists (shut it down first), if
    /// another creation is in flight, or if the server does not come up
    /// before the startup deadline. On failure nothing stays registered.
    pub async fn create_proxy(
        &self,
        cancel: &CancellationToken,
        name: &str,
        target_port: u16,
    ) -> Result<LocalPortProxyInfo> {
        if self.registry.read().await.contains_key(name) {
            return Err(ProxyError::AlreadyRunning(name.to_string()));
        }
        let _guard = self
            .lifecycle_lock
            .try_lock()
            .map_err(|_| ProxyError::CreationInProgress)?;

        let backend = Url::parse(&format!(
            "{}://localhost:{}",
            self.config.backend_scheme, target_port
        ))
        .map_err(|e| ProxyError::InvalidBackend(e.to_string()))?;

        let mut server = ProxyServer::new(
            &self.config.owner_id,
            &self.config.redirect_path,
            self.config.tls.clone(),
        );
        server.configure_routes("127.0.0.1:0", backend);
        server.set_session_store(self.session.clone());
        server.set_authorizer(self.authorizer.clone());

        let port_rx = server.port_watch();
        let token = cancel.child_token();
        let (done_tx, mut done_rx) = oneshot::channel();
        {
            let token = token.clone();
            let graceful = self.config.graceful_shutdown_timeout + DRAIN_SLACK;
            let name = name.to_string();
            tokio::spawn(async move {
                let result = server.start(token, graceful).await;
                if let Err(e) = &result {
                    warn!(proxy = %name, error = %e, "proxy server terminated with error");
                }
                let _ = done_tx.send(result);
            });
        }

        // Wait for the listener to come up on its OS-assigned port.
        let local_port = loop {
            let port = *port_rx.borrow();
            if port != 0 {
                break port;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                exited = &mut done_rx => {
                    token.cancel();
                    let reason = match exited {
                        Ok(Err(e)) => e.to_string(),
                        _ => "server exited before binding".to_string(),
                    };
                    return Err(ProxyError::StartupFailed {
                        name: name.to_string(),
                        reason,
                    });
                }
                _ = cancel.cancelled() => {
                    token.cancel();
                    return Err(ProxyError::Cancelled);
                }
            }
        };

        let info = LocalPortProxyInfo {
            name: name.to_string(),
            target_port,
            local_port,
        };
        self.registry.write().await.insert(
            name.to_string(),
            ProxyEntry {
                info: info.clone(),
                shutdown: token.clone(),
                done: done_rx,
            },
        );

        // Probe until the proxy answers; an unauthenticated GET lands on
        // the login page, which is answer enough.
        let scheme = if self.config.tls.insecure { "http" } else { "https" };
        let url = format!("{scheme}://localhost:{local_port}/");
        let deadline = Instant::now() + self.config.startup_check_timeout;
        loop {
            match self.probe.get(&url).send().await {
                Ok(response) if response.status().is_success() => break,
                Ok(response) => {
                    debug!(proxy = %name, status = %response.status(), "startup check not ready")
                }
                Err(e) => debug!(proxy = %name, error = %e, "startup check failed"),
            }
            if Instant::now() >= deadline {
                self.abandon(name).await;
                return Err(ProxyError::StartupCheckTimeout {
                    name: name.to_string(),
                    timeout: self.config.startup_check_timeout,
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    self.abandon(name).await;
                    return Err(ProxyError::Cancelled);
                }
            }
        }

        info!(
            proxy = %name,
            target_port,
            local_port,
            "proxy started"
        );
        Ok(info)
    }

    /// Snapshot of every running proxy, sorted by name.
    pub async fn running_proxies(&self) -> Vec<LocalPortProxyInfo> {
        let registry = self.registry.read().await;
        let mut infos: Vec<_> = registry.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn running_proxy(&self, name: &str) -> Option<LocalPortProxyInfo> {
        self.registry.read().await.get(name).map(|e| e.info.clone())
    }

    /// Stop the named proxy and wait for it to terminate.
    ///
    /// The registry entry is removed before waiting, so the name is free
    /// for recreation even when the wait times out.
    pub async fn shutdown_proxy(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        let entry = self
            .registry
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ProxyError::NotRunning(name.to_string()))?;
        entry.shutdown.cancel();
        Self::await_termination(
            name,
            entry.done,
            self.config.graceful_shutdown_timeout,
            cancel,
        )
        .await
    }

    /// Shut down every proxy whose name is not in `names_still_wanted`.
    ///
    /// Failures are logged, never returned; cleanup is best effort and
    /// must not fail the caller's reconcile pass.
    pub async fn gc(&self, cancel: &CancellationToken, names_still_wanted: &[String]) {
        let _guard = self.lifecycle_lock.lock().await;
        let orphans: Vec<ProxyEntry> = {
            let mut registry = self.registry.write().await;
            let unwanted: Vec<String> = registry
                .keys()
                .filter(|name| !names_still_wanted.contains(name))
                .cloned()
                .collect();
            unwanted
                .into_iter()
                .filter_map(|name| registry.remove(&name))
                .collect()
        };
        if orphans.is_empty() {
            return;
        }
        let timeout = self.config.graceful_shutdown_timeout;
        futures::future::join_all(orphans.into_iter().map(|entry| async move {
            let name = entry.info.name.clone();
            entry.shutdown.cancel();
            match Self::await_termination(&name, entry.done, timeout, cancel).await {
                Ok(()) => info!(proxy = %name, "garbage collected proxy"),
                Err(e) => warn!(proxy = %name, error = %e, "failed to stop orphaned proxy"),
            }
        }))
        .await;
    }

    /// Remove a half-started proxy's bookkeeping and stop its server.
    async fn abandon(&self, name: &str) {
        if let Some(entry) = self.registry.write().await.remove(name) {
            entry.shutdown.cancel();
        }
    }

    async fn await_termination(
        name: &str,
        done: oneshot::Receiver<Result<()>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            exited = done => match exited {
                Ok(result) => result,
                // The server task is gone either way.
                Err(_) => Ok(()),
            },
            _ = tokio::time::sleep(timeout) => Err(ProxyError::ShutdownTimeout(name.to_string())),
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthorizer;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(graceful: Duration) -> ProxyManager {
        let config = ProxyManagerConfig {
            owner_id: "alice".to_string(),
            graceful_shutdown_timeout: graceful,
            startup_check_timeout: Duration::from_secs(10),
            ..ProxyManagerConfig::default()
        };
        ProxyManager::new(config, Arc::new(StaticAuthorizer::new("alice", "hunter2"))).unwrap()
    }

    #[tokio::test]
    async fn duplicate_name_fails_and_leaves_one_entry() {
        let backend = MockServer::start().await;
        let manager = manager(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let port = backend.address().port();

        let info = manager.create_proxy(&cancel, "nw1", port).await.unwrap();
        assert_eq!(info.target_port, port);
        assert!(info.local_port > 0);

        let err = manager.create_proxy(&cancel, "nw1", port).await.unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyRunning(_)));
        assert_eq!(manager.running_proxies().await.len(), 1);

        manager.shutdown_proxy(&cancel, "nw1").await.unwrap();
        assert!(manager.running_proxies().await.is_empty());
    }

    #[tokio::test]
    async fn gc_removes_only_orphans() {
        let backend = MockServer::start().await;
        let manager = manager(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let port = backend.address().port();

        for name in ["a", "b", "c"] {
            manager.create_proxy(&cancel, name, port).await.unwrap();
        }
        manager
            .gc(&cancel, &["a".to_string(), "b".to_string()])
            .await;

        let names: Vec<String> = manager
            .running_proxies()
            .await
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        manager.gc(&cancel, &[]).await;
        assert!(manager.running_proxies().await.is_empty());
    }

    #[tokio::test]
    async fn login_then_forward_through_running_proxy() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&backend)
            .await;

        let manager = manager(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let info = manager
            .create_proxy(&cancel, "nw1", backend.address().port())
            .await
            .unwrap();
        let base = format!("http://localhost:{}", info.local_port);

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        // No cookie: redirected to the login UI.
        let redirected = client.get(format!("{base}/data")).send().await.unwrap();
        assert_eq!(redirected.status(), 302);
        assert_eq!(
            redirected.headers()["location"],
            "/portgate?redirect_to=%2Fdata"
        );

        // Log in, then retry with the issued cookie.
        let login = client
            .post(format!("{base}/portgate/api/login"))
            .json(&json!({"id": "alice", "password": "hunter2"}))
            .send()
            .await
            .unwrap();
        assert_eq!(login.status(), 200);
        let cookie = login.headers()["set-cookie"]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let forwarded = client
            .get(format!("{base}/data"))
            .header("cookie", cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(forwarded.status(), 200);
        assert_eq!(forwarded.text().await.unwrap(), "payload");

        manager.gc(&cancel, &[]).await;
    }

    #[tokio::test]
    async fn shutdown_times_out_but_removes_the_entry() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(10)),
            )
            .mount(&backend)
            .await;

        let manager = Arc::new(manager(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let info = manager
            .create_proxy(&cancel, "nw1", backend.address().port())
            .await
            .unwrap();
        let base = format!("http://localhost:{}", info.local_port);

        let client = reqwest::Client::new();
        let login = client
            .post(format!("{base}/portgate/api/login"))
            .json(&json!({"id": "alice", "password": "hunter2"}))
            .send()
            .await
            .unwrap();
        let cookie = login.headers()["set-cookie"]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        // Park a request on the slow backend so the drain cannot finish.
        let slow = tokio::spawn(async move {
            let _ = client
                .get(format!("{base}/slow"))
                .header("cookie", cookie)
                .send()
                .await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = manager.shutdown_proxy(&cancel, "nw1").await.unwrap_err();
        assert!(matches!(err, ProxyError::ShutdownTimeout(_)));
        assert!(manager.running_proxy("nw1").await.is_none());
        slow.abort();
    }
}
