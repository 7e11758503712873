//! Local docker engine adapter.
//!
//! Docker nodes report the engine's image list, container list and event
//! stream to their controllers. The payloads are opaque JSON as far as the
//! cluster is concerned, so the adapter hands back encoded bytes.
//!
//! Engine failures are logged by the callers; they never affect cluster
//! connections.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::image::ListImagesOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Errors raised by a docker engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Docker engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Failed to encode engine payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event receiver dropped")]
    ReceiverClosed,
}

/// Source of the inventory and events a docker node reports.
#[async_trait]
pub trait DockerEngine: Send + Sync + 'static {
    /// Top-level images as a JSON array.
    async fn images(&self) -> Result<Vec<u8>, EngineError>;

    /// All containers, including stopped ones, as a JSON array.
    async fn containers(&self) -> Result<Vec<u8>, EngineError>;

    /// Streams engine events, each JSON-encoded, into `sender` until the
    /// engine stream ends or the receiver is dropped.
    async fn events(&self, sender: mpsc::Sender<Vec<u8>>) -> Result<(), EngineError>;
}

/// [`DockerEngine`] over the local docker socket.
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    /// Connects using the platform defaults (`DOCKER_HOST` or the unix
    /// socket).
    pub fn connect_local() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl DockerEngine for BollardEngine {
    async fn images(&self) -> Result<Vec<u8>, EngineError> {
        let opts = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        let images = self.docker.list_images(Some(opts)).await?;
        debug!(count = images.len(), "Listed images");
        Ok(serde_json::to_vec(&images)?)
    }

    async fn containers(&self) -> Result<Vec<u8>, EngineError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        debug!(count = containers.len(), "Listed containers");
        Ok(serde_json::to_vec(&containers)?)
    }

    async fn events(&self, sender: mpsc::Sender<Vec<u8>>) -> Result<(), EngineError> {
        let mut stream = self.docker.events(Some(EventsOptions::<String>::default()));

        info!("Listening for docker events");
        while let Some(event) = stream.next().await {
            let payload = serde_json::to_vec(&event?)?;
            sender
                .send(payload)
                .await
                .map_err(|_| EngineError::ReceiverClosed)?;
        }

        info!("Docker event stream ended");
        Ok(())
    }
}
