use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use portgate_controller::workspace::{NetworkRule, Workspace, WorkspaceSpec};
use portgate_controller::{ReconcileError, WorkspaceApi, WorkspaceReconciler};
use portgate_proxy::{ProxyManager, ProxyManagerConfig, StaticAuthorizer};

struct FakeApi {
    workspace: Mutex<Option<Workspace>>,
    updates: AtomicUsize,
    events: Mutex<Vec<(EventType, String)>>,
}

impl FakeApi {
    fn new(workspace: Option<Workspace>) -> Arc<Self> {
        Arc::new(Self {
            workspace: Mutex::new(workspace),
            updates: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    async fn stored(&self) -> Workspace {
        self.workspace.lock().await.clone().unwrap()
    }

    async fn set(&self, workspace: Workspace) {
        *self.workspace.lock().await = Some(workspace);
    }

    fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    async fn event_reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl WorkspaceApi for FakeApi {
    async fn get(&self, _name: &str) -> Result<Option<Workspace>, ReconcileError> {
        Ok(self.workspace.lock().await.clone())
    }

    async fn update(&self, workspace: &Workspace) -> Result<(), ReconcileError> {
        *self.workspace.lock().await = Some(workspace.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_event(
        &self,
        _workspace: &Workspace,
        event_type: EventType,
        reason: &str,
        _note: String,
    ) {
        self.events
            .lock()
            .await
            .push((event_type, reason.to_string()));
    }
}

fn rule(name: &str, port: i32, public: bool) -> NetworkRule {
    NetworkRule {
        name: name.to_string(),
        port_number: port,
        target_port_number: None,
        http_path: None,
        host: None,
        group: None,
        public,
    }
}

fn workspace(rules: Vec<NetworkRule>) -> Workspace {
    Workspace::new("ws1", WorkspaceSpec { network: rules })
}

fn manager() -> Arc<ProxyManager> {
    let config = ProxyManagerConfig {
        owner_id: "alice".to_string(),
        ..ProxyManagerConfig::default()
    };
    Arc::new(
        ProxyManager::new(config, Arc::new(StaticAuthorizer::new("alice", "hunter2"))).unwrap(),
    )
}

fn reconciler(
    api: Arc<FakeApi>,
    manager: Arc<ProxyManager>,
) -> WorkspaceReconciler<Arc<FakeApi>> {
    WorkspaceReconciler::new(api, manager, "ws1", CancellationToken::new())
}

#[tokio::test]
async fn private_rule_gets_a_proxy_and_a_rewritten_target() {
    let api = FakeApi::new(Some(workspace(vec![rule("web", 8080, false)])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();

    let info = manager.running_proxy("web").await.unwrap();
    assert_eq!(info.target_port, 8080);

    let stored = api.stored().await;
    assert_eq!(
        stored.spec.network[0].target_port_number,
        Some(i32::from(info.local_port))
    );
    assert_eq!(api.update_count(), 1);
    assert_eq!(api.event_reasons().await, vec!["ProxyStarted"]);
}

#[tokio::test]
async fn repeated_reconcile_changes_nothing() {
    let api = FakeApi::new(Some(workspace(vec![rule("web", 8080, false)])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();
    let first = manager.running_proxy("web").await.unwrap();

    reconciler.reconcile("ws1").await.unwrap();
    let second = manager.running_proxy("web").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(api.update_count(), 1);
    assert_eq!(api.event_reasons().await.len(), 1);
}

#[tokio::test]
async fn port_change_recreates_the_proxy() {
    let api = FakeApi::new(Some(workspace(vec![rule("web", 8080, false)])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();
    let old = manager.running_proxy("web").await.unwrap();

    let mut changed = api.stored().await;
    changed.spec.network[0].port_number = 9090;
    api.set(changed).await;

    reconciler.reconcile("ws1").await.unwrap();
    let new = manager.running_proxy("web").await.unwrap();
    assert_eq!(new.target_port, 9090);
    assert_ne!(new.local_port, 0);

    let stored = api.stored().await;
    assert_eq!(
        stored.spec.network[0].target_port_number,
        Some(i32::from(new.local_port))
    );
    assert_ne!(old.target_port, new.target_port);
    assert_eq!(api.update_count(), 2);
}

#[tokio::test]
async fn flipping_a_rule_public_stops_its_proxy() {
    let api = FakeApi::new(Some(workspace(vec![rule("web", 8080, false)])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();
    assert!(manager.running_proxy("web").await.is_some());

    let mut changed = api.stored().await;
    changed.spec.network[0].public = true;
    api.set(changed).await;

    reconciler.reconcile("ws1").await.unwrap();
    assert!(manager.running_proxy("web").await.is_none());

    let stored = api.stored().await;
    assert_eq!(stored.spec.network[0].target_port_number, Some(8080));
    assert_eq!(api.update_count(), 2);
}

#[tokio::test]
async fn public_rules_never_get_a_proxy() {
    let api = FakeApi::new(Some(workspace(vec![
        rule("web", 8080, false),
        rule("docs", 3000, true),
    ])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();

    assert!(manager.running_proxy("web").await.is_some());
    assert!(manager.running_proxy("docs").await.is_none());

    let stored = api.stored().await;
    assert_eq!(stored.spec.network[1].target_port_number, Some(3000));
}

#[tokio::test]
async fn removed_rule_gets_garbage_collected() {
    let api = FakeApi::new(Some(workspace(vec![
        rule("web", 8080, false),
        rule("api", 9090, false),
    ])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();
    assert_eq!(manager.running_proxies().await.len(), 2);

    let mut changed = api.stored().await;
    changed.spec.network.retain(|r| r.name == "web");
    api.set(changed).await;

    reconciler.reconcile("ws1").await.unwrap();
    let names: Vec<String> = manager
        .running_proxies()
        .await
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["web"]);
}

#[tokio::test]
async fn missing_workspace_is_a_noop() {
    let api = FakeApi::new(None);
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("ws1").await.unwrap();
    assert!(manager.running_proxies().await.is_empty());
    assert_eq!(api.update_count(), 0);
}

#[tokio::test]
async fn foreign_workspace_names_are_ignored() {
    let api = FakeApi::new(Some(workspace(vec![rule("web", 8080, false)])));
    let manager = manager();
    let reconciler = reconciler(api.clone(), manager.clone());

    reconciler.reconcile("someone-else").await.unwrap();
    assert!(manager.running_proxies().await.is_empty());
    assert_eq!(api.update_count(), 0);
}
