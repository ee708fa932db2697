//! Graceful-termination service, served by the plugin.

use std::sync::Arc;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::proto;

/// Fires the plugin's shutdown signal when the host calls `Shutdown`.
pub(crate) struct ControllerService {
    pub(crate) shutdown: Arc<watch::Sender<bool>>,
}

#[tonic::async_trait]
impl proto::controller_server::Controller for ControllerService {
    async fn shutdown(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::Empty>, Status> {
        debug!("host requested shutdown");
        let _ = self.shutdown.send(true);
        Ok(Response::new(proto::Empty {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::controller_server::Controller;

    #[tokio::test]
    async fn test_shutdown_fires_signal() {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service = ControllerService {
            shutdown: Arc::new(shutdown),
        };

        service
            .shutdown(Request::new(proto::Empty {}))
            .await
            .unwrap();
        shutdown_rx.changed().await.unwrap();
        assert!(*shutdown_rx.borrow());
    }
}
