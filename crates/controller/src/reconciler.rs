//! Keeps the proxy fleet in sync with one workspace's network rules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use portgate_proxy::ProxyManager;

use crate::workspace::{NetworkRule, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

/// Narrow view of the Kubernetes API the reconciler needs.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Fetch the workspace; `None` when it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Workspace>, ReconcileError>;

    /// Persist an updated workspace. Conflicts surface as errors so the
    /// controller retries with a fresh read.
    async fn update(&self, workspace: &Workspace) -> Result<(), ReconcileError>;

    /// Emit an event attached to the workspace; best effort.
    async fn publish_event(
        &self,
        workspace: &Workspace,
        event_type: EventType,
        reason: &str,
        note: String,
    );
}

#[async_trait]
impl<A: WorkspaceApi + ?Sized> WorkspaceApi for Arc<A> {
    async fn get(&self, name: &str) -> Result<Option<Workspace>, ReconcileError> {
        (**self).get(name).await
    }

    async fn update(&self, workspace: &Workspace) -> Result<(), ReconcileError> {
        (**self).update(workspace).await
    }

    async fn publish_event(
        &self,
        workspace: &Workspace,
        event_type: EventType,
        reason: &str,
        note: String,
    ) {
        (**self).publish_event(workspace, event_type, reason, note).await;
    }
}

/// [`WorkspaceApi`] backed by the real cluster.
pub struct KubeWorkspaceApi {
    client: Client,
    api: Api<Workspace>,
    reporter: Reporter,
}

impl KubeWorkspaceApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        let api = Api::namespaced(client.clone(), namespace);
        Self {
            client,
            api,
            reporter: Reporter {
                controller: "portgate-controller".into(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl WorkspaceApi for KubeWorkspaceApi {
    async fn get(&self, name: &str) -> Result<Option<Workspace>, ReconcileError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn update(&self, workspace: &Workspace) -> Result<(), ReconcileError> {
        let name = workspace.name_any();
        self.api
            .replace(&name, &PostParams::default(), workspace)
            .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        workspace: &Workspace,
        event_type: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            workspace.object_ref(&()),
        );
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(error = %e, "failed to publish event");
        }
    }
}

/// Drives the proxy fleet toward the workspace's private network rules
/// and rewrites the rules' target ports to the proxies' local ports.
pub struct WorkspaceReconciler<A> {
    api: A,
    manager: Arc<ProxyManager>,
    workspace_name: String,
    shutdown: CancellationToken,
    create_timeout: Duration,
    // At most one reconcile body runs at a time, regardless of how the
    // watch delivers events.
    reconcile_lock: Mutex<()>,
}

impl<A: WorkspaceApi> WorkspaceReconciler<A> {
    pub fn new(
        api: A,
        manager: Arc<ProxyManager>,
        workspace_name: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            manager,
            workspace_name: workspace_name.into(),
            shutdown,
            create_timeout: Duration::from_secs(10),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// One reconcile pass for the named workspace.
    ///
    /// Re-running with no external change creates, recreates and shuts
    /// down nothing, and leaves the resource untouched.
    pub async fn reconcile(&self, name: &str) -> Result<(), ReconcileError> {
        if name != self.workspace_name {
            return Ok(());
        }
        let _guard = self.reconcile_lock.lock().await;

        let Some(fetched) = self.api.get(name).await? else {
            debug!(workspace = name, "workspace not found, nothing to do");
            return Ok(());
        };
        if fetched.spec.network.is_empty() {
            return Ok(());
        }

        let mut workspace = fetched.clone();
        let mut still_wanted = Vec::new();
        for rule in &mut workspace.spec.network {
            if rule.public {
                rule.target_port_number = Some(rule.port_number);
                continue;
            }
            still_wanted.push(rule.name.clone());
            self.converge_rule(&fetched, rule).await;
        }

        let update_result = if workspace.spec != fetched.spec {
            info!(workspace = name, "updating workspace network rules");
            self.api.update(&workspace).await
        } else {
            Ok(())
        };

        // Cleanup runs even when the update failed, so proxies for
        // removed rules never outlive their rule.
        self.manager.gc(&self.shutdown, &still_wanted).await;

        update_result
    }

    /// Make one private rule's proxy match the rule, rewriting the
    /// rule's target port in place. Per-rule failures are reported as
    /// events and skipped, not propagated.
    async fn converge_rule(&self, workspace: &Workspace, rule: &mut NetworkRule) {
        if let Some(running) = self.manager.running_proxy(&rule.name).await {
            if i32::from(running.target_port) == rule.port_number {
                rule.target_port_number = Some(running.local_port.into());
                return;
            }
            info!(
                rule = %rule.name,
                old_port = running.target_port,
                new_port = rule.port_number,
                "rule port changed, recreating proxy"
            );
            if let Err(e) = self.manager.shutdown_proxy(&self.shutdown, &rule.name).await {
                warn!(rule = %rule.name, error = %e, "failed to stop outdated proxy");
            }
        }

        let target_port = match u16::try_from(rule.port_number) {
            Ok(port) => port,
            Err(_) => {
                warn!(rule = %rule.name, port = rule.port_number, "rule port out of range");
                self.api
                    .publish_event(
                        workspace,
                        EventType::Warning,
                        "ProxyStartFailed",
                        format!(
                            "network rule {}: port {} is out of range",
                            rule.name, rule.port_number
                        ),
                    )
                    .await;
                return;
            }
        };

        // Bound the creation; cancelling the token makes the manager
        // clean up rather than leak a half-started proxy.
        let cancel = self.shutdown.child_token();
        let timer = {
            let cancel = cancel.clone();
            let timeout = self.create_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };
        let created = self.manager.create_proxy(&cancel, &rule.name, target_port).await;
        timer.abort();

        match created {
            Ok(info) => {
                self.api
                    .publish_event(
                        workspace,
                        EventType::Normal,
                        "ProxyStarted",
                        format!(
                            "started proxy for network rule {}: local port {} -> {}",
                            info.name, info.local_port, info.target_port
                        ),
                    )
                    .await;
                rule.target_port_number = Some(info.local_port.into());
            }
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "failed to start proxy");
                self.api
                    .publish_event(
                        workspace,
                        EventType::Warning,
                        "ProxyStartFailed",
                        format!("failed to start proxy for network rule {}: {}", rule.name, e),
                    )
                    .await;
            }
        }
    }
}

/// Watch the workspace resource and feed changes into the reconciler
/// until `shutdown` fires.
pub async fn run_controller(
    reconciler: Arc<WorkspaceReconciler<KubeWorkspaceApi>>,
    client: Client,
    namespace: String,
) {
    let api: Api<Workspace> = Api::namespaced(client, &namespace);
    let shutdown = reconciler.shutdown.clone();
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(
            |workspace, reconciler| async move {
                reconciler.reconcile(&workspace.name_any()).await?;
                Ok(Action::await_change())
            },
            |workspace, error: &ReconcileError, _reconciler| {
                warn!(
                    workspace = %workspace.name_any(),
                    error = %error,
                    "reconcile failed, requeueing"
                );
                Action::requeue(Duration::from_secs(5))
            },
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok(object) => debug!(?object, "reconciled"),
                Err(e) => debug!(error = %e, "controller error"),
            }
        })
        .await;
}
