//! gRPC dialer: the client side of a tree link

use std::sync::Arc;

use slog::{debug, warn, Logger};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use crate::error::LinkError;
use crate::grpc::pb;
use crate::grpc::pb::tree_link_client::TreeLinkClient;
use crate::link::{DialedLink, LinkDialer};
use crate::wire::{Envelope, Hello, PROTOCOL_VERSION};

/// Dials neighbors over gRPC and performs the hello exchange.
pub struct GrpcDialer {
    queue_depth: usize,
    logger: Logger,
}

impl GrpcDialer {
    pub fn new(queue_depth: usize, logger: Logger) -> Arc<Self> {
        Arc::new(GrpcDialer {
            queue_depth,
            logger,
        })
    }

    async fn open_channel(&self, addr: &str) -> Result<Channel, LinkError> {
        let endpoint =
            Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| LinkError::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        endpoint.connect().await.map_err(|e| LinkError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }
}

#[tonic::async_trait]
impl LinkDialer for GrpcDialer {
    async fn dial(&self, addr: &str, hello: Hello) -> Result<DialedLink, LinkError> {
        let channel = self.open_channel(addr).await?;
        let mut client = TreeLinkClient::new(channel);

        let (wire_tx, wire_rx) = mpsc::channel::<pb::Envelope>(self.queue_depth);
        wire_tx
            .send(Envelope::Hello(hello).into_proto())
            .await
            .map_err(|_| LinkError::Handshake {
                reason: "outbound stream closed before hello".to_string(),
            })?;

        let response = client
            .attach(ReceiverStream::new(wire_rx))
            .await
            .map_err(|e| LinkError::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let mut stream = response.into_inner();

        let first = stream
            .message()
            .await
            .map_err(|e| LinkError::Handshake {
                reason: e.to_string(),
            })?
            .ok_or_else(|| LinkError::Handshake {
                reason: "stream closed before hello".to_string(),
            })?;
        let remote = match Envelope::from_proto(first) {
            Ok(Envelope::Hello(remote)) => remote,
            Ok(other) => {
                return Err(LinkError::Handshake {
                    reason: format!("first frame must be hello, got {}", other.kind()),
                })
            }
            Err(e) => {
                return Err(LinkError::Handshake {
                    reason: e.to_string(),
                })
            }
        };
        if remote.protocol != PROTOCOL_VERSION {
            return Err(LinkError::Handshake {
                reason: format!("peer speaks protocol {}", remote.protocol),
            });
        }

        let (envelope_tx, mut envelope_rx) = mpsc::channel::<Envelope>(self.queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(self.queue_depth);

        // Outbound: envelopes from the link manager onto the wire.
        tokio::spawn(async move {
            while let Some(envelope) = envelope_rx.recv().await {
                if wire_tx.send(envelope.into_proto()).await.is_err() {
                    break;
                }
            }
        });

        // Inbound: frames off the wire toward the link manager. Closing
        // `inbound_tx` is how the manager learns the link died.
        let logger = self.logger.clone();
        let peer = remote.node_id.clone();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(frame)) => match Envelope::from_proto(frame) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(logger, "dropping malformed frame";
                                "peer" => %peer, "error" => %e);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(logger, "link stream ended"; "peer" => %peer, "error" => %e);
                        break;
                    }
                }
            }
        });

        Ok(DialedLink {
            peer: remote.node_id,
            subtree: remote.subtree,
            tx: envelope_tx,
            rx: inbound_rx,
        })
    }
}
