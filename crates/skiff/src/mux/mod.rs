//! Session multiplexer for the request/response transport.
//!
//! One byte stream carries many lightweight substreams. Frames are
//! length-prefixed and tagged with a stream id and a kind:
//!
//! ```text
//! [payload_len: u32 BE][stream_id: u32 BE][kind: u8][payload]
//! ```
//!
//! Kinds: SYN opens a stream, DATA carries bytes, FIN closes, WINDOW grants
//! receive credit. Each substream has a byte-granular receive window so a
//! slow reader on one substream cannot stall the rest of the session.
//!
//! The side that dialed the connection opens odd stream ids, the accepting
//! side even ones. Streams 1, 3 and 5 are opened eagerly by the host as the
//! control, stdout and stderr channels.

pub mod broker;

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::config::BufferConfig;
use crate::error::{Result, SkiffError};

const KIND_SYN: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_FIN: u8 = 0x03;
const KIND_WINDOW: u8 = 0x04;

/// Which end of the connection this session is. Determines stream id
/// parity so both sides can open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; opens odd ids starting at 1.
    Client,
    /// Accepted the connection; opens even ids starting at 2.
    Server,
}

struct Frame {
    id: u32,
    kind: u8,
    payload: Vec<u8>,
}

#[derive(Default)]
struct InboundState {
    queue: VecDeque<Vec<u8>>,
    /// Partially consumed front chunk.
    current: Vec<u8>,
    pos: usize,
    eof: bool,
    waker: Option<Waker>,
}

struct SendState {
    window: u32,
    closed: bool,
    waker: Option<Waker>,
}

struct StreamShared {
    inbound: Mutex<InboundState>,
    send: Mutex<SendState>,
}

impl StreamShared {
    fn new() -> Arc<Self> {
        Arc::new(StreamShared {
            inbound: Mutex::new(InboundState::default()),
            send: Mutex::new(SendState {
                window: BufferConfig::MUX_WINDOW,
                closed: false,
                waker: None,
            }),
        })
    }

    fn push_data(&self, payload: Vec<u8>) {
        let mut inbound = self.inbound.lock().unwrap();
        inbound.queue.push_back(payload);
        if let Some(waker) = inbound.waker.take() {
            waker.wake();
        }
    }

    fn grant_window(&self, grant: u32) {
        let mut send = self.send.lock().unwrap();
        send.window = send.window.saturating_add(grant);
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }

    fn mark_closed(&self) {
        {
            let mut inbound = self.inbound.lock().unwrap();
            inbound.eof = true;
            if let Some(waker) = inbound.waker.take() {
                waker.wake();
            }
        }
        let mut send = self.send.lock().unwrap();
        send.closed = true;
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }
}

struct SessionShared {
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
}

impl SessionShared {
    fn shutdown_streams(&self) {
        let streams: Vec<_> = self.streams.lock().unwrap().values().cloned().collect();
        for stream in streams {
            stream.mark_closed();
        }
        let _ = self.closed.send(true);
    }
}

/// A multiplexed session over one byte stream. Cheap to clone; all clones
/// share the same substream space.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
}

impl Session {
    /// Start a session over `io`, spawning its read and write tasks.
    pub fn new<T>(io: T, role: Role) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(32);
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            streams: Mutex::new(HashMap::new()),
            out_tx,
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            closed: closed_tx,
        });

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(read_loop(read_half, shared.clone(), accept_tx));
        tokio::spawn(write_loop(write_half, out_rx, shared.clone()));

        Session {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Open a new substream toward the peer.
    pub fn open_stream(&self) -> Result<MuxStream> {
        if *self.shared.closed.borrow() {
            return Err(SkiffError::Transport {
                message: "session is closed".to_string(),
                source: None,
            });
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = StreamShared::new();
        self.shared.streams.lock().unwrap().insert(id, stream.clone());
        self.shared
            .out_tx
            .send(Frame {
                id,
                kind: KIND_SYN,
                payload: Vec::new(),
            })
            .map_err(|_| SkiffError::Transport {
                message: "session write task is gone".to_string(),
                source: None,
            })?;
        trace!(id, "opened substream");
        Ok(MuxStream {
            id,
            shared: stream,
            session: self.shared.clone(),
            fin_sent: false,
        })
    }

    /// Accept the next substream the peer opened. `None` once the session
    /// is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown_streams();
    }

    /// A watch that flips to true when the session dies.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shared.closed.subscribe()
    }
}

async fn read_loop<R>(
    mut reader: tokio::io::ReadHalf<R>,
    shared: Arc<SessionShared>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut closed = shared.closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closed.changed() => break,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "mux session read ended");
                break;
            }
        };

        match frame.kind {
            KIND_SYN => {
                let stream = StreamShared::new();
                let known = {
                    let mut streams = shared.streams.lock().unwrap();
                    if streams.contains_key(&frame.id) {
                        true
                    } else {
                        streams.insert(frame.id, stream.clone());
                        false
                    }
                };
                if known {
                    trace!(id = frame.id, "duplicate SYN ignored");
                    continue;
                }
                let mux_stream = MuxStream {
                    id: frame.id,
                    shared: stream,
                    session: shared.clone(),
                    fin_sent: false,
                };
                if accept_tx.send(mux_stream).await.is_err() {
                    break;
                }
            }
            KIND_DATA => {
                let stream = shared.streams.lock().unwrap().get(&frame.id).cloned();
                match stream {
                    Some(s) => s.push_data(frame.payload),
                    None => trace!(id = frame.id, "data for unknown substream dropped"),
                }
            }
            KIND_WINDOW => {
                if frame.payload.len() == 4 {
                    let grant =
                        u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]);
                    if let Some(s) = shared.streams.lock().unwrap().get(&frame.id) {
                        s.grant_window(grant);
                    }
                }
            }
            KIND_FIN => {
                if let Some(s) = shared.streams.lock().unwrap().get(&frame.id) {
                    s.mark_closed();
                }
            }
            other => {
                debug!(kind = other, "unknown mux frame kind, closing session");
                break;
            }
        }
    }
    shared.shutdown_streams();
}

async fn write_loop<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<SessionShared>,
) where
    W: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut closed = shared.closed.subscribe();
    'outer: loop {
        let frame = tokio::select! {
            biased;
            frame = out_rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
            _ = closed.changed() => {
                // Flush whatever was queued before the close, then stop.
                while let Ok(frame) = out_rx.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break 'outer;
                    }
                }
                break;
            }
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "mux session write ended");
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.shutdown_streams();
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
    let len = reader.read_u32().await? as usize;
    if len > BufferConfig::MUX_FRAME_MAX {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("mux frame of {len} bytes exceeds maximum"),
        ));
    }
    let id = reader.read_u32().await?;
    let kind = reader.read_u8().await?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { id, kind, payload })
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    writer.write_u32(frame.payload.len() as u32).await?;
    writer.write_u32(frame.id).await?;
    writer.write_u8(frame.kind).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

/// One substream of a session. Implements `AsyncRead`/`AsyncWrite`, so the
/// RPC layer treats it like any other connection.
pub struct MuxStream {
    id: u32,
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
    fin_sent: bool,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn send_frame(&self, kind: u8, payload: Vec<u8>) -> std::io::Result<()> {
        self.session
            .out_tx
            .send(Frame {
                id: self.id,
                kind,
                payload,
            })
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed"))
    }

    /// Send one delimited message on this substream: a four-byte big-endian
    /// length header and the payload, as a single write so it cannot
    /// interleave with other writers of the same stream.
    pub async fn send_message(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large to frame")
        })?;
        let mut message = Vec::with_capacity(4 + payload.len());
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(payload);
        self.write_all(&message).await
    }

    /// Receive one delimited message, rejecting anything over `max` bytes.
    /// `Ok(None)` when the substream ends cleanly between messages.
    pub async fn recv_message(&mut self, max: usize) -> std::io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > max {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message of {len} bytes exceeds the {max}-byte cap"),
            ));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = Pin::get_mut(self);
        let mut consumed = 0usize;
        {
            let mut inbound = this.shared.inbound.lock().unwrap();
            while buf.remaining() > 0 {
                if inbound.pos >= inbound.current.len() {
                    match inbound.queue.pop_front() {
                        Some(chunk) => {
                            inbound.current = chunk;
                            inbound.pos = 0;
                        }
                        None => break,
                    }
                }
                let n = buf.remaining().min(inbound.current.len() - inbound.pos);
                let start = inbound.pos;
                buf.put_slice(&inbound.current[start..start + n]);
                inbound.pos += n;
                consumed += n;
            }

            if consumed == 0 {
                if inbound.eof {
                    return Poll::Ready(Ok(()));
                }
                inbound.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }

        // Return the consumed bytes as fresh receive credit.
        let _ = this.send_frame(KIND_WINDOW, (consumed as u32).to_be_bytes().to_vec());
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = Pin::get_mut(self);
        let n = {
            let mut send = this.shared.send.lock().unwrap();
            if send.closed {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "substream closed",
                )));
            }
            if send.window == 0 {
                send.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = buf
                .len()
                .min(send.window as usize)
                .min(BufferConfig::MUX_FRAME_MAX);
            send.window -= n as u32;
            n
        };
        this.send_frame(KIND_DATA, buf[..n].to_vec())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = Pin::get_mut(self);
        if !this.fin_sent {
            this.fin_sent = true;
            let _ = this.send_frame(KIND_FIN, Vec::new());
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let _ = self.send_frame(KIND_FIN, Vec::new());
        }
        self.session.streams.lock().unwrap().remove(&self.id);
    }
}
