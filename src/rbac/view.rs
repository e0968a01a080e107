use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding};
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::data::StringSet;
use crate::rbac::canonical;
use crate::rbac::graph::{
    Graph, CLUSTER_ROLE, CLUSTER_ROLE_BINDING, NAMESPACE, ROLE, ROLE_BINDING, TOKEN,
};
use crate::rbac::{NamespacesView, OwnedNamespaces};

/// How long a resolved `token -> OwnedNamespaces` entry may be served
/// before a fresh traversal; informer events invalidate earlier.
const AUTHORIZATION_TTL: Duration = Duration::from_secs(300);
const AUTHORIZATION_CACHE_SIZE: usize = 1024;

/// Delay before retrying an event that failed because a referenced object
/// has not landed in the caches yet.
const NOT_FOUND_RETRY: Duration = Duration::from_secs(2);

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
const CLUSTER_ROLE_KIND: &str = "ClusterRole";
const SERVICE_ACCOUNT_TOKEN_KEY: &str = "token";

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl ViewError {
    fn is_not_found(&self) -> bool {
        matches!(self, ViewError::NotFound(_))
    }
}

/// Graph mutations, serialised into a single worker. The graph is not
/// safe for concurrent mutation; one worker is the invariant.
#[derive(Clone, Debug)]
pub enum Op {
    ApplyRoleBinding(RoleBinding),
    DeleteRoleBinding(RoleBinding),
    ApplyClusterRoleBinding(ClusterRoleBinding),
    DeleteClusterRoleBinding(ClusterRoleBinding),
    ApplyRole(Role),
    DeleteRole(Role),
    ApplyClusterRole(ClusterRole),
    DeleteClusterRole(ClusterRole),
    DeleteServiceAccount(ServiceAccount),
    DeleteNamespace(Namespace),
}

impl Op {
    fn describe(&self) -> String {
        match self {
            Op::ApplyRoleBinding(rb) => format!("apply RoleBinding {}", object_key(&rb.metadata)),
            Op::DeleteRoleBinding(rb) => format!("delete RoleBinding {}", object_key(&rb.metadata)),
            Op::ApplyClusterRoleBinding(crb) => {
                format!("apply ClusterRoleBinding {}", object_name(&crb.metadata))
            }
            Op::DeleteClusterRoleBinding(crb) => {
                format!("delete ClusterRoleBinding {}", object_name(&crb.metadata))
            }
            Op::ApplyRole(role) => format!("apply Role {}", object_key(&role.metadata)),
            Op::DeleteRole(role) => format!("delete Role {}", object_key(&role.metadata)),
            Op::ApplyClusterRole(cr) => format!("apply ClusterRole {}", object_name(&cr.metadata)),
            Op::DeleteClusterRole(cr) => {
                format!("delete ClusterRole {}", object_name(&cr.metadata))
            }
            Op::DeleteServiceAccount(sa) => {
                format!("delete ServiceAccount {}", object_key(&sa.metadata))
            }
            Op::DeleteNamespace(ns) => format!("delete Namespace {}", object_name(&ns.metadata)),
        }
    }
}

fn object_name(meta: &kube::api::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn object_key(meta: &kube::api::ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// Resolves a ServiceAccount to its bound bearer token.
///
/// `Ok(None)` means the account does not exist at all (the subject is
/// skipped); `Err(NotFound)` means the account exists but its secret has
/// not been observed yet (the event is retried).
#[async_trait]
pub trait ServiceAccountTokens: Send + Sync {
    async fn token_for(&self, namespace: &str, name: &str) -> Result<Option<String>, ViewError>;

    async fn token_from_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<String, ViewError>;
}

/// Store-backed resolver with an API fallback for objects the informer
/// has not delivered yet.
pub struct ClusterTokens {
    client: Client,
    accounts: Store<ServiceAccount>,
    secrets: Store<Secret>,
}

impl ClusterTokens {
    pub fn new(client: Client, accounts: Store<ServiceAccount>, secrets: Store<Secret>) -> Self {
        Self {
            client,
            accounts,
            secrets,
        }
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret, ViewError> {
        if let Some(secret) = self
            .secrets
            .get(&ObjectRef::new(name).within(namespace))
        {
            return Ok((*secret).clone());
        }

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(secret),
            Err(kube::Error::Api(response)) if response.code == 404 => Err(ViewError::NotFound(
                format!("Secret '{namespace}/{name}'"),
            )),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ServiceAccountTokens for ClusterTokens {
    async fn token_for(&self, namespace: &str, name: &str) -> Result<Option<String>, ViewError> {
        let account = match self
            .accounts
            .get(&ObjectRef::new(name).within(namespace))
        {
            Some(account) => (*account).clone(),
            None => {
                let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
                match api.get(name).await {
                    Ok(account) => account,
                    Err(kube::Error::Api(response)) if response.code == 404 => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            }
        };

        self.token_from_account(&account).await.map(Some)
    }

    async fn token_from_account(&self, account: &ServiceAccount) -> Result<String, ViewError> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or_default();
        let name = account.metadata.name.as_deref().unwrap_or_default();

        let secrets = account.secrets.as_deref().unwrap_or_default();
        let secret_name = match secrets {
            [only] => only.name.as_deref().unwrap_or_default(),
            _ => {
                return Err(ViewError::NotFound(format!(
                    "Secret in ServiceAccount '{namespace}/{name}'"
                )))
            }
        };

        let secret = self.secret(namespace, secret_name).await?;
        let token = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SERVICE_ACCOUNT_TOKEN_KEY))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .unwrap_or_default();

        if token.is_empty() {
            return Err(ViewError::NotFound(format!(
                "Token in Secret '{namespace}/{secret_name}' of ServiceAccount '{namespace}/{name}'"
            )));
        }

        Ok(token)
    }
}

struct ViewState {
    graph: RwLock<Graph>,
    cache: Mutex<TtlCache<OwnedNamespaces>>,
}

/// Read side of the authorization graph. `own` is cheap: a cached hit, or
/// one breadth-first traversal shared across concurrent callers of the
/// same token.
pub struct RbacView {
    state: Arc<ViewState>,
    inflight: Mutex<HashMap<String, Arc<OnceLock<OwnedNamespaces>>>>,
}

impl RbacView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ViewState {
                graph: RwLock::new(Graph::new()),
                cache: Mutex::new(TtlCache::new(AUTHORIZATION_CACHE_SIZE, AUTHORIZATION_TTL)),
            }),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn search(&self, wrapped_token: &str) -> OwnedNamespaces {
        let graph = self.state.graph.read();
        let result = graph.search(wrapped_token, &NAMESPACE);
        if result.quit_early {
            OwnedNamespaces::All
        } else {
            OwnedNamespaces::Set(result.values)
        }
    }
}

impl NamespacesView for RbacView {
    fn own(&self, token: &str) -> OwnedNamespaces {
        let key = TOKEN.wrap(token);

        if let Some(hit) = self.state.cache.lock().get(&key) {
            return hit;
        }

        // Coalesce concurrent traversals for the same token; late arrivals
        // block on the cell instead of walking the graph again.
        let cell = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        let owned = cell.get_or_init(|| self.search(&key)).clone();
        self.inflight.lock().remove(&key);
        self.state.cache.lock().put(key, owned.clone());

        debug!(%owned, "resolved token authorization");
        owned
    }
}

/// Single mutator of the graph. Consumes the serialised event queue,
/// skips no-op updates by canonical comparison, and invalidates the
/// authorization cache after every applied change.
pub struct ViewWorker<T> {
    state: Arc<ViewState>,
    tokens: T,
    seen: HashMap<String, String>,
    tx: UnboundedSender<Op>,
    rx: UnboundedReceiver<Op>,
}

impl<T: ServiceAccountTokens> ViewWorker<T> {
    fn new(view: &Arc<RbacView>, tokens: T, tx: UnboundedSender<Op>, rx: UnboundedReceiver<Op>) -> Self {
        Self {
            state: view.state.clone(),
            tokens,
            seen: HashMap::new(),
            tx,
            rx,
        }
    }

    pub async fn run(mut self) {
        info!("starting authorization view worker");
        while let Some(op) = self.rx.recv().await {
            match self.handle(&op).await {
                Ok(()) => debug!("handled {}", op.describe()),
                Err(err) if err.is_not_found() => {
                    warn!("{}: {err}, retrying shortly", op.describe());
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(NOT_FOUND_RETRY).await;
                        let _ = tx.send(op);
                    });
                }
                Err(err) => {
                    error!("unable to handle {}: {err}", op.describe());
                    let _ = self.tx.send(op);
                }
            }
        }
        info!("authorization view worker stopped");
    }

    async fn handle(&mut self, op: &Op) -> Result<(), ViewError> {
        match op {
            Op::ApplyRoleBinding(binding) => self.apply_role_binding(binding).await,
            Op::DeleteRoleBinding(binding) => {
                self.delete_vertex(ROLE_BINDING.wrap(&object_key(&binding.metadata)));
                Ok(())
            }
            Op::ApplyClusterRoleBinding(binding) => self.apply_cluster_role_binding(binding).await,
            Op::DeleteClusterRoleBinding(binding) => {
                self.delete_vertex(CLUSTER_ROLE_BINDING.wrap(&object_name(&binding.metadata)));
                Ok(())
            }
            Op::ApplyRole(role) => {
                self.apply_role(role);
                Ok(())
            }
            Op::DeleteRole(role) => {
                self.delete_vertex(ROLE.wrap(&object_key(&role.metadata)));
                Ok(())
            }
            Op::ApplyClusterRole(cluster_role) => {
                self.apply_cluster_role(cluster_role);
                Ok(())
            }
            Op::DeleteClusterRole(cluster_role) => {
                self.delete_vertex(CLUSTER_ROLE.wrap(&object_name(&cluster_role.metadata)));
                Ok(())
            }
            Op::DeleteServiceAccount(account) => self.delete_service_account(account).await,
            Op::DeleteNamespace(namespace) => {
                self.delete_vertex(NAMESPACE.wrap(&object_name(&namespace.metadata)));
                Ok(())
            }
        }
    }

    async fn apply_role_binding(&mut self, binding: &RoleBinding) -> Result<(), ViewError> {
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let key = object_key(&binding.metadata);
        let vertex = ROLE_BINDING.wrap(&key);

        let current = canonical::binding(&binding.role_ref, binding.subjects.as_deref());
        if self.seen.get(&vertex) == Some(&current) {
            return Ok(());
        }

        // Resolve subjects before touching the graph so a retryable miss
        // never leaves a half-built vertex behind.
        let tokens = self
            .resolve_subject_tokens(&namespace, binding.subjects.as_deref())
            .await?;

        let target = if binding.role_ref.kind == CLUSTER_ROLE_KIND {
            CLUSTER_ROLE.wrap(&binding.role_ref.name)
        } else {
            ROLE.wrap(&format!("{namespace}/{}", binding.role_ref.name))
        };

        {
            let mut graph = self.state.graph.write();
            graph.del_vertex(&vertex);
            for token in &tokens {
                graph.add_edge(TOKEN.wrap(token), vertex.clone());
            }
            graph.add_edge(vertex.clone(), target);
        }

        self.seen.insert(vertex, current);
        self.invalidate();
        Ok(())
    }

    async fn apply_cluster_role_binding(
        &mut self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), ViewError> {
        let name = object_name(&binding.metadata);
        let vertex = CLUSTER_ROLE_BINDING.wrap(&name);

        let current = canonical::binding(&binding.role_ref, binding.subjects.as_deref());
        if self.seen.get(&vertex) == Some(&current) {
            return Ok(());
        }

        let tokens = self
            .resolve_subject_tokens("", binding.subjects.as_deref())
            .await?;
        let target = CLUSTER_ROLE.wrap(&binding.role_ref.name);

        {
            let mut graph = self.state.graph.write();
            graph.del_vertex(&vertex);
            for token in &tokens {
                graph.add_edge(TOKEN.wrap(token), vertex.clone());
            }
            graph.add_edge(vertex.clone(), target);
        }

        self.seen.insert(vertex, current);
        self.invalidate();
        Ok(())
    }

    fn apply_role(&mut self, role: &Role) {
        let namespace = role.metadata.namespace.clone().unwrap_or_default();
        let vertex = ROLE.wrap(&object_key(&role.metadata));

        let current = canonical::rules(role.rules.as_deref());
        if self.seen.get(&vertex) == Some(&current) {
            return;
        }

        {
            let mut graph = self.state.graph.write();
            graph.del_vertex(&vertex);
            graph.add_vertex(vertex.clone());
            if grants_namespace_read(role.rules.as_deref()) {
                graph.add_edge(vertex.clone(), NAMESPACE.wrap(&namespace));
            }
        }

        self.seen.insert(vertex, current);
        self.invalidate();
    }

    fn apply_cluster_role(&mut self, cluster_role: &ClusterRole) {
        let vertex = CLUSTER_ROLE.wrap(&object_name(&cluster_role.metadata));

        let current = canonical::cluster_role(
            cluster_role.rules.as_deref(),
            cluster_role.aggregation_rule.as_ref(),
        );
        if self.seen.get(&vertex) == Some(&current) {
            return;
        }

        let targets = cluster_role_namespaces(cluster_role.rules.as_deref());

        {
            let mut graph = self.state.graph.write();
            graph.del_vertex(&vertex);
            graph.add_vertex(vertex.clone());
            for namespace in targets.iter() {
                graph.add_edge(vertex.clone(), NAMESPACE.wrap(namespace));
            }
        }

        self.seen.insert(vertex, current);
        self.invalidate();
    }

    async fn delete_service_account(&mut self, account: &ServiceAccount) -> Result<(), ViewError> {
        // The token is looked up from the account's bound secret; when it
        // is already gone there is nothing left to unlink.
        match self.tokens.token_from_account(account).await {
            Ok(token) => {
                self.delete_vertex(TOKEN.wrap(&token));
                Ok(())
            }
            Err(err) => {
                debug!(
                    "no token recoverable for deleted ServiceAccount {}: {err}",
                    object_key(&account.metadata)
                );
                Ok(())
            }
        }
    }

    async fn resolve_subject_tokens(
        &self,
        binding_namespace: &str,
        subjects: Option<&[k8s_openapi::api::rbac::v1::Subject]>,
    ) -> Result<Vec<String>, ViewError> {
        let mut tokens = Vec::new();
        for subject in subjects.unwrap_or_default() {
            if subject.kind != SERVICE_ACCOUNT_KIND {
                continue;
            }
            let namespace = subject
                .namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .unwrap_or(binding_namespace);
            if let Some(token) = self.tokens.token_for(namespace, &subject.name).await? {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    fn delete_vertex(&mut self, vertex: String) {
        self.state.graph.write().del_vertex(&vertex);
        self.seen.remove(&vertex);
        self.invalidate();
    }

    fn invalidate(&self) {
        self.state.cache.lock().clear();
    }
}

/// A rule grants namespace visibility when it allows `get` (or `*`) on
/// `namespaces` (or `*`) in the core (or any) API group.
fn rule_grants_namespace_read(rule: &PolicyRule) -> bool {
    let groups = rule.api_groups.as_deref().unwrap_or_default();
    let resources = rule.resources.as_deref().unwrap_or_default();

    groups.iter().any(|g| g.is_empty() || g == "*")
        && resources.iter().any(|r| r == "namespaces" || r == "*")
        && rule.verbs.iter().any(|v| v == "get" || v == "*")
}

fn grants_namespace_read(rules: Option<&[PolicyRule]>) -> bool {
    rules
        .unwrap_or_default()
        .iter()
        .any(rule_grants_namespace_read)
}

/// Namespace targets of a cluster role: the rule's resource names, or the
/// owns-all sentinel when a granting rule names none.
fn cluster_role_namespaces(rules: Option<&[PolicyRule]>) -> StringSet {
    let mut namespaces = StringSet::new();
    for rule in rules.unwrap_or_default() {
        if !rule_grants_namespace_read(rule) {
            continue;
        }
        match rule.resource_names.as_deref() {
            None | Some([]) => namespaces.insert("*"),
            Some(names) => {
                for name in names {
                    namespaces.insert(name.clone());
                }
            }
        }
    }
    namespaces
}

/// Wires the watchers, the reflector stores and the worker, then runs
/// until the process shuts down. Spawn it once from startup.
pub async fn run(view: Arc<RbacView>, client: Client) {
    let (tx, rx) = mpsc::unbounded_channel();

    // ServiceAccount and Secret stores back token resolution; their
    // reflector streams are driven here. The account stream doubles as the
    // delete-event source.
    let account_writer = reflector::store::Writer::<ServiceAccount>::default();
    let account_store = account_writer.as_reader();
    let secret_writer = reflector::store::Writer::<Secret>::default();
    let secret_store = secret_writer.as_reader();

    let accounts_api: Api<ServiceAccount> = Api::all(client.clone());
    let account_tx = tx.clone();
    let account_stream = async move {
        let mut stream = reflector::reflector(
            account_writer,
            watcher(accounts_api, watcher::Config::default()),
        )
        .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Deleted(account)) => {
                    let _ = account_tx.send(Op::DeleteServiceAccount(account));
                }
                Ok(_) => {}
                Err(err) => warn!("ServiceAccount watch interrupted: {err}"),
            }
        }
    };

    let secrets_api: Api<Secret> = Api::all(client.clone());
    let secret_stream = async move {
        let mut stream = reflector::reflector(
            secret_writer,
            watcher(secrets_api, watcher::Config::default()),
        )
        .applied_objects()
        .boxed();
        while let Some(event) = stream.next().await {
            if let Err(err) = event {
                warn!("Secret watch interrupted: {err}");
            }
        }
    };

    let tokens = ClusterTokens::new(client.clone(), account_store, secret_store);
    let worker = ViewWorker::new(&view, tokens, tx.clone(), rx);

    tokio::join!(
        account_stream,
        secret_stream,
        watch_resource::<RoleBinding, _>(client.clone(), tx.clone(), "RoleBinding", |op, obj| {
            match op {
                WatchedOp::Apply => Op::ApplyRoleBinding(obj),
                WatchedOp::Delete => Op::DeleteRoleBinding(obj),
            }
        }),
        watch_resource::<ClusterRoleBinding, _>(
            client.clone(),
            tx.clone(),
            "ClusterRoleBinding",
            |op, obj| match op {
                WatchedOp::Apply => Op::ApplyClusterRoleBinding(obj),
                WatchedOp::Delete => Op::DeleteClusterRoleBinding(obj),
            }
        ),
        watch_resource::<Role, _>(client.clone(), tx.clone(), "Role", |op, obj| match op {
            WatchedOp::Apply => Op::ApplyRole(obj),
            WatchedOp::Delete => Op::DeleteRole(obj),
        }),
        watch_resource::<ClusterRole, _>(
            client.clone(),
            tx.clone(),
            "ClusterRole",
            |op, obj| match op {
                WatchedOp::Apply => Op::ApplyClusterRole(obj),
                WatchedOp::Delete => Op::DeleteClusterRole(obj),
            }
        ),
        watch_namespaces(client, tx),
        worker.run(),
    );
}

enum WatchedOp {
    Apply,
    Delete,
}

async fn watch_resource<K, F>(client: Client, tx: UnboundedSender<Op>, kind: &str, to_op: F)
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
    F: Fn(WatchedOp, K) -> Op,
{
    let api: Api<K> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => {
                let _ = tx.send(to_op(WatchedOp::Apply, obj));
            }
            Ok(watcher::Event::Deleted(obj)) => {
                let _ = tx.send(to_op(WatchedOp::Delete, obj));
            }
            Ok(watcher::Event::Restarted(objects)) => {
                for obj in objects {
                    let _ = tx.send(to_op(WatchedOp::Apply, obj));
                }
            }
            Err(err) => warn!("{kind} watch interrupted: {err}"),
        }
    }
}

async fn watch_namespaces(client: Client, tx: UnboundedSender<Op>) {
    let api: Api<Namespace> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Deleted(namespace)) => {
                let _ = tx.send(Op::DeleteNamespace(namespace));
            }
            Ok(_) => {}
            Err(err) => warn!("Namespace watch interrupted: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
    use kube::api::ObjectMeta;

    struct FixedTokens(HashMap<(String, String), String>);

    #[async_trait]
    impl ServiceAccountTokens for FixedTokens {
        async fn token_for(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<String>, ViewError> {
            Ok(self
                .0
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn token_from_account(
            &self,
            account: &ServiceAccount,
        ) -> Result<String, ViewError> {
            let namespace = account.metadata.namespace.clone().unwrap_or_default();
            let name = account.metadata.name.clone().unwrap_or_default();
            self.0
                .get(&(namespace.clone(), name.clone()))
                .cloned()
                .ok_or_else(|| {
                    ViewError::NotFound(format!("Secret in ServiceAccount '{namespace}/{name}'"))
                })
        }
    }

    fn worker_with(
        tokens: HashMap<(String, String), String>,
    ) -> (Arc<RbacView>, ViewWorker<FixedTokens>) {
        let view = RbacView::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ViewWorker::new(&view, FixedTokens(tokens), tx, rx);
        (view, worker)
    }

    fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    fn sa_subject(namespace: &str, name: &str) -> Subject {
        Subject {
            kind: SERVICE_ACCOUNT_KIND.to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    fn role_binding(namespace: &str, name: &str, role: &str, subjects: Vec<Subject>) -> RoleBinding {
        RoleBinding {
            metadata: meta(Some(namespace), name),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role.to_string(),
            },
            subjects: Some(subjects),
        }
    }

    fn namespace_role(namespace: &str, name: &str) -> Role {
        Role {
            metadata: meta(Some(namespace), name),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["namespaces".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            }]),
        }
    }

    fn reader_tokens() -> HashMap<(String, String), String> {
        let mut map = HashMap::new();
        map.insert(
            ("ns-a".to_string(), "reader".to_string()),
            "token-a".to_string(),
        );
        map
    }

    #[tokio::test]
    async fn binding_role_and_namespace_compose_to_ownership() {
        let (view, mut worker) = worker_with(reader_tokens());

        worker
            .handle(&Op::ApplyRole(namespace_role("ns-a", "reader")))
            .await
            .unwrap();
        worker
            .handle(&Op::ApplyRoleBinding(role_binding(
                "ns-a",
                "read",
                "reader",
                vec![sa_subject("ns-a", "reader")],
            )))
            .await
            .unwrap();

        assert_eq!(
            view.own("token-a"),
            OwnedNamespaces::Set(["ns-a"].iter().copied().collect())
        );
        assert_eq!(view.own("unknown"), OwnedNamespaces::Set(StringSet::new()));
    }

    #[tokio::test]
    async fn deleting_a_binding_revokes_reachability() {
        let (view, mut worker) = worker_with(reader_tokens());

        let binding = role_binding("ns-a", "read", "reader", vec![sa_subject("ns-a", "reader")]);
        worker
            .handle(&Op::ApplyRole(namespace_role("ns-a", "reader")))
            .await
            .unwrap();
        worker
            .handle(&Op::ApplyRoleBinding(binding.clone()))
            .await
            .unwrap();
        assert!(!view.own("token-a").is_empty());

        worker
            .handle(&Op::DeleteRoleBinding(binding))
            .await
            .unwrap();
        assert!(view.own("token-a").is_empty());
    }

    #[tokio::test]
    async fn cluster_role_without_resource_names_owns_all() {
        let (view, mut worker) = worker_with(reader_tokens());

        let cluster_role = ClusterRole {
            metadata: meta(None, "cluster-reader"),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            }]),
            aggregation_rule: None,
        };
        let binding = ClusterRoleBinding {
            metadata: meta(None, "cluster-read"),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: CLUSTER_ROLE_KIND.to_string(),
                name: "cluster-reader".to_string(),
            },
            subjects: Some(vec![sa_subject("ns-a", "reader")]),
        };

        worker
            .handle(&Op::ApplyClusterRole(cluster_role))
            .await
            .unwrap();
        worker
            .handle(&Op::ApplyClusterRoleBinding(binding))
            .await
            .unwrap();

        assert!(view.own("token-a").has_all());
    }

    #[tokio::test]
    async fn cluster_role_with_resource_names_owns_exactly_those() {
        let (view, mut worker) = worker_with(reader_tokens());

        let cluster_role = ClusterRole {
            metadata: meta(None, "scoped-reader"),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["namespaces".to_string()]),
                verbs: vec!["get".to_string()],
                resource_names: Some(vec!["ns-a".to_string(), "ns-b".to_string()]),
                ..Default::default()
            }]),
            aggregation_rule: None,
        };
        let binding = ClusterRoleBinding {
            metadata: meta(None, "scoped-read"),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: CLUSTER_ROLE_KIND.to_string(),
                name: "scoped-reader".to_string(),
            },
            subjects: Some(vec![sa_subject("ns-a", "reader")]),
        };

        worker
            .handle(&Op::ApplyClusterRole(cluster_role))
            .await
            .unwrap();
        worker
            .handle(&Op::ApplyClusterRoleBinding(binding))
            .await
            .unwrap();

        let owned = view.own("token-a");
        assert!(!owned.has_all());
        assert_eq!(owned.values(), vec!["ns-a", "ns-b"]);
    }

    #[tokio::test]
    async fn role_losing_its_grant_drops_the_namespace_edge() {
        let (view, mut worker) = worker_with(reader_tokens());

        worker
            .handle(&Op::ApplyRole(namespace_role("ns-a", "reader")))
            .await
            .unwrap();
        worker
            .handle(&Op::ApplyRoleBinding(role_binding(
                "ns-a",
                "read",
                "reader",
                vec![sa_subject("ns-a", "reader")],
            )))
            .await
            .unwrap();
        assert!(!view.own("token-a").is_empty());

        let demoted = Role {
            metadata: meta(Some("ns-a"), "reader"),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            }]),
        };
        worker.handle(&Op::ApplyRole(demoted)).await.unwrap();

        assert!(view.own("token-a").is_empty());
    }

    #[tokio::test]
    async fn unchanged_update_is_skipped() {
        let (_view, mut worker) = worker_with(reader_tokens());

        let role = namespace_role("ns-a", "reader");
        worker.handle(&Op::ApplyRole(role.clone())).await.unwrap();
        let seen_before = worker.seen.clone();

        worker.handle(&Op::ApplyRole(role)).await.unwrap();
        assert_eq!(worker.seen, seen_before);
    }

    #[tokio::test]
    async fn missing_secret_is_retryable() {
        let (_view, mut worker) = worker_with(HashMap::new());

        struct LaggingTokens;
        #[async_trait]
        impl ServiceAccountTokens for LaggingTokens {
            async fn token_for(&self, ns: &str, name: &str) -> Result<Option<String>, ViewError> {
                Err(ViewError::NotFound(format!(
                    "Secret in ServiceAccount '{ns}/{name}'"
                )))
            }
            async fn token_from_account(
                &self,
                _account: &ServiceAccount,
            ) -> Result<String, ViewError> {
                unreachable!()
            }
        }

        let view = RbacView::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut lagging = ViewWorker::new(&view, LaggingTokens, tx, rx);

        let err = lagging
            .handle(&Op::ApplyRoleBinding(role_binding(
                "ns-a",
                "read",
                "reader",
                vec![sa_subject("ns-a", "reader")],
            )))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // unresolved subjects whose account is simply absent are skipped
        worker
            .handle(&Op::ApplyRoleBinding(role_binding(
                "ns-a",
                "read",
                "reader",
                vec![sa_subject("ns-a", "ghost")],
            )))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn informer_event_invalidates_cached_authorization() {
        let (view, mut worker) = worker_with(reader_tokens());

        worker
            .handle(&Op::ApplyRole(namespace_role("ns-a", "reader")))
            .await
            .unwrap();
        let binding = role_binding("ns-a", "read", "reader", vec![sa_subject("ns-a", "reader")]);
        worker
            .handle(&Op::ApplyRoleBinding(binding.clone()))
            .await
            .unwrap();

        // prime the cache, then revoke
        assert_eq!(view.own("token-a").values(), vec!["ns-a"]);
        worker
            .handle(&Op::DeleteRoleBinding(binding))
            .await
            .unwrap();
        assert!(view.own("token-a").is_empty());
    }
}
