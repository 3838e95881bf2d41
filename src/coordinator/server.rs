//! Coordinator server
//!
//! Wires one node together: log store, admin state machine, Raft driver and
//! transport, the control-plane service, and the gRPC listener serving both
//! the public API and peer Raft traffic.

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::forward::GrpcForwarder;
use crate::coordinator::grpc::{ControlPlaneGrpc, RaftGrpc};
use crate::coordinator::placement::PartitionCalculator;
use crate::coordinator::service::ControlPlaneService;
use crate::coordinator::state_machine::AdminStateMachine;
use crate::raft::{
    FileStore, GrpcTransport, LogStore, MemoryStore, NodeId, RaftHandle, RaftNode, RaftOptions,
    RaftServer,
};

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let handle = self.start(listener).await?;

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down coordinator {}", handle.raft.id());
        handle.shutdown().await;
        Ok(())
    }

    /// Start the node on an already-bound listener.
    pub async fn start(self, listener: TcpListener) -> Result<CoordinatorHandle> {
        let config = self.config;
        let local_addr = listener.local_addr()?;
        let node_id: NodeId = config.node_id.clone();
        let advertise = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        tracing::info!("Starting coordinator: {}", node_id);
        tracing::info!("  gRPC API: {} (advertised as {})", local_addr, advertise);
        match &config.data_dir {
            Some(dir) => tracing::info!("  Data dir: {}", dir.display()),
            None => tracing::info!("  Data dir: none (in-memory log)"),
        }
        tracing::info!("  Peers: {:?}", config.peers);

        let store: Box<dyn LogStore> = match &config.data_dir {
            Some(dir) => Box::new(FileStore::open(dir)?),
            None => Box::new(MemoryStore::new()),
        };

        let calculator = PartitionCalculator::new(config.num_partitions);
        let fsm = AdminStateMachine::new(calculator);
        let reader = fsm.reader();

        let peers: BTreeSet<NodeId> = config.peers.keys().cloned().collect();
        let node = RaftNode::new(
            node_id.clone(),
            peers,
            store,
            Box::new(fsm),
            RaftOptions::from_config(&config),
            rand::random(),
        )?;

        let transport = Arc::new(GrpcTransport::new(&config.peers)?);
        let mut addresses = config.peers.clone();
        addresses.insert(node_id.clone(), advertise);
        let (raft, raft_task) =
            RaftServer::spawn(node, transport, addresses, config.tick_interval());

        let service = ControlPlaneService::new(
            raft.clone(),
            reader,
            calculator,
            Arc::new(GrpcForwarder::new()),
            config.read_consistency.clone(),
            config.apply_timeout(),
            config.tick_interval(),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tonic::transport::Server::builder()
            .add_service(RaftGrpc::new(raft.clone()).into_server())
            .add_service(ControlPlaneGrpc::new(service.clone()).into_server())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = shutdown_rx.await;
            });
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!("gRPC server error: {}", e);
            }
        });

        tracing::info!("✓ Coordinator {} ready", node_id);
        Ok(CoordinatorHandle {
            raft,
            service,
            local_addr,
            raft_task,
            server_task,
            shutdown: shutdown_tx,
        })
    }
}

/// A running coordinator.
pub struct CoordinatorHandle {
    pub raft: RaftHandle,
    pub service: ControlPlaneService,
    pub local_addr: SocketAddr,
    raft_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl CoordinatorHandle {
    /// Stop abruptly, as a crashed process would.
    pub fn kill(self) {
        self.raft_task.abort();
        self.server_task.abort();
    }

    /// Stop accepting requests, then stop the Raft node.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.server_task.await {
            tracing::warn!("gRPC server task ended abnormally: {}", e);
        }
        self.raft_task.abort();
    }
}
