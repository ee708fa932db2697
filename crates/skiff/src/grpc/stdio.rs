//! Stdio streaming service: the plugin's captured stdout/stderr, replayed
//! to the host over the primary connection.

use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use super::proto;
use super::proto::stdio_request::Channel;

/// Serves `ReadStdio`. Each channel can be claimed by exactly one stream;
/// the bounded queues behind the receivers keep a slow host from blocking
/// the plugin's own writes.
pub(crate) struct StdioService {
    stdout: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stderr: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl StdioService {
    pub(crate) fn new(
        stdout: Option<mpsc::Receiver<Vec<u8>>>,
        stderr: Option<mpsc::Receiver<Vec<u8>>>,
    ) -> StdioService {
        StdioService {
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
        }
    }
}

type ReadStdioStream =
    Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<proto::StdioChunk, Status>> + Send>>;

#[tonic::async_trait]
impl proto::stdio_server::Stdio for StdioService {
    type ReadStdioStream = ReadStdioStream;

    async fn read_stdio(
        &self,
        request: Request<proto::StdioRequest>,
    ) -> std::result::Result<Response<Self::ReadStdioStream>, Status> {
        let slot = match request.get_ref().channel() {
            Channel::Stdout => &self.stdout,
            Channel::Stderr => &self.stderr,
            Channel::Invalid => {
                return Err(Status::invalid_argument("stdio channel not specified"))
            }
        };

        let rx = slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Status::failed_precondition("stdio channel already claimed"))?;

        let stream = ReceiverStream::new(rx).map(|data| Ok(proto::StdioChunk { data }));
        Ok(Response::new(Box::pin(stream) as Self::ReadStdioStream))
    }
}
