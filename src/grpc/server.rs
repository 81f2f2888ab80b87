//! gRPC service implementation for the tree link protocol

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Server, Request, Response, Status, Streaming};
use tonic_reflection::server::Builder as ReflectionBuilder;

use crate::dispatch::CommandSpec;
use crate::grpc::pb;
use crate::runtime::NodeRuntime;
use crate::wire::{self, Envelope};

/// Default Exec deadline when the request does not carry one.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// The node's network surface: children attach their persistent link
/// stream here, and operators call `Exec` to fan commands out.
pub struct TreeLinkService {
    runtime: Arc<NodeRuntime>,
    logger: Logger,
}

impl TreeLinkService {
    pub fn new(runtime: Arc<NodeRuntime>, logger: Logger) -> Self {
        Self { runtime, logger }
    }
}

#[tonic::async_trait]
impl pb::tree_link_server::TreeLink for TreeLinkService {
    type AttachStream = ReceiverStream<Result<pb::Envelope, Status>>;

    async fn attach(
        &self,
        request: Request<Streaming<pb::Envelope>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before hello"))?;
        let hello = match Envelope::from_proto(first) {
            Ok(Envelope::Hello(hello)) => hello,
            Ok(other) => {
                return Err(Status::invalid_argument(format!(
                    "first frame must be hello, got {}",
                    other.kind()
                )))
            }
            Err(e) => return Err(Status::invalid_argument(e.to_string())),
        };
        let peer = hello.node_id.clone();
        debug!(self.logger, "link attach"; "peer" => %peer, "role" => %hello.role);

        let links = self.runtime.links().clone();
        let queue_depth = links.queue_depth();
        let (envelope_tx, mut envelope_rx) = mpsc::channel::<Envelope>(queue_depth);
        let (stream_tx, stream_rx) = mpsc::channel::<Result<pb::Envelope, Status>>(queue_depth);

        // Answer with our own hello before anything else flows.
        let local_hello = links.local_hello(hello.role.opposite());
        let _ = stream_tx
            .send(Ok(Envelope::Hello(local_hello).into_proto()))
            .await;

        let gen = links
            .accept(hello, envelope_tx)
            .await
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        // Outbound: envelopes queued by the link manager onto the wire.
        tokio::spawn(async move {
            while let Some(envelope) = envelope_rx.recv().await {
                if stream_tx.send(Ok(envelope.into_proto())).await.is_err() {
                    break;
                }
            }
        });

        // Inbound: the read loop for this link.
        let logger = self.logger.clone();
        let read_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => match Envelope::from_proto(frame) {
                        Ok(envelope) => {
                            if !links.deliver_inbound(&read_peer, gen, envelope).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(logger, "dropping malformed frame";
                                "peer" => %read_peer, "error" => %e);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(logger, "link stream error"; "peer" => %read_peer, "error" => %e);
                        break;
                    }
                }
            }
            links.peer_closed(&read_peer, gen).await;
        });

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    async fn exec(
        &self,
        request: Request<pb::ExecRequest>,
    ) -> Result<Response<pb::ExecResponse>, Status> {
        let req = request.into_inner();
        if req.command.is_empty() {
            return Err(Status::invalid_argument("command must not be empty"));
        }
        let timeout = if req.timeout_ms == 0 {
            DEFAULT_EXEC_TIMEOUT
        } else {
            Duration::from_millis(req.timeout_ms)
        };

        let set = self
            .runtime
            .execute(req.targets, CommandSpec::shell(req.command), timeout)
            .await;

        Ok(Response::new(pb::ExecResponse {
            request_id: set.request_id.to_string(),
            results: set
                .results
                .into_values()
                .map(wire::result_to_proto)
                .collect(),
        }))
    }
}

/// gRPC server handle with graceful shutdown support
pub struct GrpcServerHandle {
    shutdown_tx: oneshot::Sender<()>,
}

impl GrpcServerHandle {
    /// Trigger graceful shutdown of the server
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Start the node's gRPC server on its configured listen address.
pub async fn start_grpc_server(
    runtime: Arc<NodeRuntime>,
    logger: Logger,
) -> Result<GrpcServerHandle, Box<dyn std::error::Error>> {
    let addr = runtime.config().listen.parse()?;

    let service = TreeLinkService::new(runtime, logger.clone());

    let reflection_service = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let result = Server::builder()
            .add_service(pb::tree_link_server::TreeLinkServer::new(service))
            .add_service(reflection_service)
            .serve_with_shutdown(addr, async {
                shutdown_rx.await.ok();
            })
            .await;
        if let Err(e) = result {
            error!(logger, "gRPC server failed"; "error" => %e);
        }
    });

    Ok(GrpcServerHandle { shutdown_tx })
}
