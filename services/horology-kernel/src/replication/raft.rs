use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{
    InitializeError, InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable,
};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Adaptor;
use openraft::{Config, Raft, RaftMetrics, RaftNetwork, RaftNetworkFactory, SnapshotPolicy};
use openraft_memstore::{MemStore, TypeConfig as MemStoreConfig};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use super::LeaderHandle;

/// Consensus group membership for the kernel cluster. The group elects the
/// scheduling leader; timer durability rides on the shared transition log, so
/// the raft log itself stays in memory and never snapshots.
#[derive(Clone, Debug)]
pub struct ConsensusSettings {
    pub node_id: u64,
    pub rpc_addr: SocketAddr,
    /// peer id -> http base url, e.g. `2 -> http://10.0.0.2:7207`.
    pub peers: HashMap<u64, String>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

type KernelRaft = Raft<MemStoreConfig>;

pub struct ConsensusSupervisor {
    raft: KernelRaft,
    http_task: JoinHandle<()>,
    http_shutdown: watch::Sender<bool>,
    metrics_task: JoinHandle<()>,
    leader: LeaderHandle,
}

impl ConsensusSupervisor {
    pub async fn start(settings: ConsensusSettings) -> Result<(Self, LeaderHandle)> {
        let leader = LeaderHandle::new();

        let peers = Arc::new(RwLock::new(settings.peers.clone()));
        {
            let mut guard = peers.write().await;
            guard.insert(settings.node_id, format!("http://{}", settings.rpc_addr));
        }

        let mut config = Config::default();
        config.cluster_name = "horology-kernel".into();
        config.election_timeout_min = settings.election_timeout_min_ms;
        config.election_timeout_max = settings.election_timeout_max_ms;
        config.heartbeat_interval = settings.heartbeat_interval_ms;
        config.snapshot_policy = SnapshotPolicy::Never;
        let config = Arc::new(config.validate().map_err(|err| anyhow!(err))?);

        let store = MemStore::new_async().await;
        let (log_store, state_machine) = Adaptor::new(store.clone());
        let network = PeerClientFactory::new(peers.clone());
        let raft = Raft::new(
            settings.node_id,
            config.clone(),
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|fatal| anyhow!(fatal))?;

        bootstrap_membership(&raft, settings.node_id, peers.clone()).await?;

        let (http_shutdown, mut http_rx) = watch::channel(false);
        let state = ConsensusHttpState { raft: raft.clone() };
        let app = Router::new()
            .route("/consensus/append", post(handle_append))
            .route("/consensus/vote", post(handle_vote))
            .route("/consensus/snapshot", post(handle_snapshot))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(settings.rpc_addr)
            .await
            .context("failed to bind consensus listener")?;

        let http_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_rx.changed().await;
                })
                .await
            {
                warn!(?error, "consensus http server exited with error");
            }
        });

        let metrics_task = spawn_leadership_watcher(raft.clone(), leader.clone(), settings.node_id);

        let supervisor = Self {
            raft,
            http_task,
            http_shutdown,
            metrics_task,
            leader: leader.clone(),
        };
        Ok((supervisor, leader))
    }

    pub async fn shutdown(self) -> Result<()> {
        self.leader.set_leader(false);
        let _ = self.http_shutdown.send(true);
        if let Err(error) = self.raft.shutdown().await {
            warn!(?error, "error during raft shutdown");
        }
        self.metrics_task.abort();
        let _ = self.metrics_task.await;
        if let Err(error) = self.http_task.await {
            warn!(?error, "error joining consensus http task");
        }
        Ok(())
    }
}

async fn bootstrap_membership(
    raft: &KernelRaft,
    local_id: u64,
    peers: Arc<RwLock<HashMap<u64, String>>>,
) -> Result<()> {
    let mut members = BTreeSet::new();
    members.insert(local_id);
    {
        let map = peers.read().await;
        for id in map.keys() {
            members.insert(*id);
        }
    }

    match raft.initialize(members).await {
        Ok(_) => Ok(()),
        // Already initialized from a previous run of the group.
        Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
        Err(RaftError::APIError(InitializeError::NotInMembers(err))) => {
            Err(anyhow!("local node missing from membership: {err:?}"))
        }
        Err(RaftError::Fatal(fatal)) => Err(anyhow!(fatal)),
    }
}

fn spawn_leadership_watcher(
    raft: KernelRaft,
    leader: LeaderHandle,
    local_id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut metrics = raft.metrics();
        apply_leadership(&leader, &metrics.borrow(), local_id);
        while metrics.changed().await.is_ok() {
            apply_leadership(&leader, &metrics.borrow(), local_id);
        }
        leader.set_leader(false);
    })
}

fn apply_leadership(handle: &LeaderHandle, metrics: &RaftMetrics<u64, ()>, local_id: u64) {
    let is_leader = metrics
        .current_leader
        .as_ref()
        .is_some_and(|leader| *leader == local_id);
    handle.set_leader(is_leader);
}

#[derive(Clone)]
struct PeerClientFactory {
    client: reqwest::Client,
    peers: Arc<RwLock<HashMap<u64, String>>>,
}

impl PeerClientFactory {
    fn new(peers: Arc<RwLock<HashMap<u64, String>>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            peers,
        }
    }
}

#[derive(Clone)]
struct PeerClient {
    client: reqwest::Client,
    target: u64,
    peers: Arc<RwLock<HashMap<u64, String>>>,
}

impl RaftNetworkFactory<MemStoreConfig> for PeerClientFactory {
    type Network = PeerClient;

    async fn new_client(&mut self, target: u64, _node: &()) -> Self::Network {
        PeerClient {
            client: self.client.clone(),
            target,
            peers: self.peers.clone(),
        }
    }
}

impl RaftNetwork<MemStoreConfig> for PeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<MemStoreConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, (), RaftError<u64>>> {
        let url = self.resolve("/consensus/append").await?;
        self.post_json(&url, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<MemStoreConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<InstallSnapshotResponse<u64>, RPCError<u64, (), RaftError<u64, InstallSnapshotError>>>
    {
        let url = self.resolve("/consensus/snapshot").await?;
        self.post_json(&url, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: openraft::network::RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, (), RaftError<u64>>> {
        let url = self.resolve("/consensus/vote").await?;
        self.post_json(&url, &rpc).await
    }
}

impl PeerClient {
    async fn resolve<E>(&self, path: &str) -> Result<String, RPCError<u64, (), E>>
    where
        E: std::error::Error,
    {
        let map = self.peers.read().await;
        map.get(&self.target)
            .map(|addr| format!("{addr}{path}"))
            .ok_or_else(|| {
                let err = io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown consensus peer {}", self.target),
                );
                RPCError::Unreachable(Unreachable::new(&err))
            })
    }

    async fn post_json<Req, Resp, E>(&self, url: &str, rpc: &Req) -> Result<Resp, RPCError<u64, (), E>>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
        E: std::error::Error,
    {
        let response = self
            .client
            .post(url)
            .json(rpc)
            .send()
            .await
            .map_err(|error| RPCError::Network(NetworkError::new(&error)))?;

        let response = response
            .error_for_status()
            .map_err(|error| RPCError::Network(NetworkError::new(&error)))?;

        response
            .json()
            .await
            .map_err(|error| RPCError::Network(NetworkError::new(&error)))
    }
}

#[derive(Clone)]
struct ConsensusHttpState {
    raft: KernelRaft,
}

async fn handle_append(
    State(state): State<ConsensusHttpState>,
    Json(rpc): Json<AppendEntriesRequest<MemStoreConfig>>,
) -> Result<Json<AppendEntriesResponse<u64>>, StatusCode> {
    state
        .raft
        .append_entries(rpc)
        .await
        .map(Json)
        .map_err(|error| {
            warn!(?error, "append_entries handler failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn handle_vote(
    State(state): State<ConsensusHttpState>,
    Json(rpc): Json<VoteRequest<u64>>,
) -> Result<Json<VoteResponse<u64>>, StatusCode> {
    state.raft.vote(rpc).await.map(Json).map_err(|error| {
        warn!(?error, "vote handler failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn handle_snapshot(
    State(state): State<ConsensusHttpState>,
    Json(rpc): Json<InstallSnapshotRequest<MemStoreConfig>>,
) -> Result<Json<InstallSnapshotResponse<u64>>, StatusCode> {
    state
        .raft
        .install_snapshot(rpc)
        .await
        .map(Json)
        .map_err(|error| {
            warn!(?error, "install_snapshot handler failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
