//! Length-prefixed JSON framing over a local Unix socket.
//!
//! Each frame is a 4-byte big-endian length followed by a UTF-8 JSON
//! payload. The server fans every connection into one inbound queue with a
//! single consumer. Any number of producers (connections or local senders)
//! may enqueue at the same time.

use cadence_core::constants::{MAX_FRAME_BYTES, TRANSPORT_QUEUE_CAPACITY};
use cadence_core::{AgentId, CadenceError, CadenceResult, ProgressReport, SystemError, TaskId};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

/// Messages exchanged between the supervisor and out-of-process workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello { agent_id: AgentId },
    Heartbeat { agent_id: AgentId },
    Progress(ProgressReport),
    Instruction { agent_id: AgentId, line: String },
    TaskDone { agent_id: AgentId, task_id: TaskId },
    TaskFailed {
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
    },
    Shutdown,
}

// ============================================================================
// CODEC
// ============================================================================

/// `WireMessage` codec on top of a 4-byte big-endian length prefix.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>, io::Error> {
        match self.inner.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(payload), dst)
    }
}

fn transport_error(reason: impl ToString) -> CadenceError {
    SystemError::Transport {
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// SERVER
// ============================================================================

/// Cloneable producer into a server's inbound queue.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<WireMessage>,
}

impl TransportSender {
    pub async fn send(&self, message: WireMessage) -> CadenceResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| transport_error("inbound queue closed"))
    }
}

/// Accepts worker connections on a Unix socket.
#[derive(Debug)]
pub struct TransportServer {
    path: PathBuf,
    rx: mpsc::Receiver<WireMessage>,
    tx: mpsc::Sender<WireMessage>,
    accept_task: JoinHandle<()>,
}

impl TransportServer {
    /// Bind `path`, replacing a stale socket file left by a previous run.
    pub async fn bind(path: impl AsRef<Path>) -> CadenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path).map_err(transport_error)?;
        }
        let listener = UnixListener::bind(&path).map_err(transport_error)?;
        let (tx, rx) = mpsc::channel(TRANSPORT_QUEUE_CAPACITY);
        let accept_task = tokio::spawn(accept_loop(listener, tx.clone()));
        tracing::info!(path = %path.display(), "transport listening");
        Ok(Self {
            path,
            rx,
            tx,
            accept_task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A producer handle for in-process senders.
    pub fn sender(&self) -> TransportSender {
        TransportSender {
            tx: self.tx.clone(),
        }
    }

    /// Next inbound message, in arrival order.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<WireMessage>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(read_connection(stream, tx.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport accept failed");
            }
        }
    }
}

async fn read_connection(stream: UnixStream, tx: mpsc::Sender<WireMessage>) {
    let mut frames = Framed::new(stream, FrameCodec::default());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // A bad frame poisons the byte stream; drop the connection.
                tracing::warn!(error = %e, "dropping transport connection");
                return;
            }
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug)]
pub struct TransportClient {
    frames: Framed<UnixStream, FrameCodec>,
}

impl TransportClient {
    pub async fn connect(path: impl AsRef<Path>) -> CadenceResult<Self> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(transport_error)?;
        Ok(Self {
            frames: Framed::new(stream, FrameCodec::default()),
        })
    }

    pub async fn send(&mut self, message: WireMessage) -> CadenceResult<()> {
        self.frames.send(message).await.map_err(transport_error)
    }

    /// Next message from the peer, `None` once it hangs up.
    pub async fn recv(&mut self) -> CadenceResult<Option<WireMessage>> {
        self.frames.next().await.transpose().map_err(transport_error)
    }
}
