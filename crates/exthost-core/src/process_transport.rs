use crate::channel::Channel;
use crate::error::ChannelError;
use crate::event::Emitter;
use crate::protocol::ControlMessage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One newline-delimited JSON line on a host pipe. RPC payloads that are not
/// UTF-8 travel on `rpc_binary` as a byte array.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "lane", rename_all = "snake_case")]
pub enum WireFrame {
    Rpc { payload: String },
    RpcBinary { payload: Vec<u8> },
    Control { message: ControlMessage },
}

enum Outbound {
    Frame(WireFrame),
    Flush(oneshot::Sender<()>),
}

struct PipeShared {
    outbound: mpsc::UnboundedSender<Outbound>,
    on_rpc: Emitter<Vec<u8>>,
    on_control: Emitter<ControlMessage>,
    on_close: Emitter<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl PipeShared {
    fn push(&self, frame: WireFrame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ChannelError::Closed)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.on_close.fire(&());
        }
    }
}

/// RPC lane of a host pipe.
pub struct PipeChannel {
    shared: Arc<PipeShared>,
}

/// Process-control lane of a host pipe, kept apart from RPC traffic.
pub struct ControlLane {
    shared: Arc<PipeShared>,
}

impl Channel for PipeChannel {
    fn send(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let frame = match String::from_utf8(bytes) {
            Ok(payload) => WireFrame::Rpc { payload },
            Err(err) => WireFrame::RpcBinary {
                payload: err.into_bytes(),
            },
        };
        self.shared.push(frame)
    }

    fn on_message(&self) -> &Emitter<Vec<u8>> {
        &self.shared.on_rpc
    }

    fn close(&self) {
        self.shared.mark_closed();
        self.shared.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl ControlLane {
    pub fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.shared.push(WireFrame::Control { message })
    }

    /// Resolves once every frame queued before the call has been written.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound::Flush(tx))
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    pub fn on_message(&self) -> &Emitter<ControlMessage> {
        &self.shared.on_control
    }

    /// Fired once, when the peer's end of the pipe is gone or the pipe is closed locally.
    pub fn on_close(&self) -> &Emitter<()> {
        &self.shared.on_close
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Frames `reader`/`writer` as a host pipe. Must be called within a Tokio runtime.
pub fn spawn_pipe<R, W>(reader: R, writer: W) -> (Arc<PipeChannel>, Arc<ControlLane>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(PipeShared {
        outbound: tx,
        on_rpc: Emitter::new(),
        on_control: Emitter::new(),
        on_close: Emitter::new(),
        closed: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
    });

    tokio::spawn(write_loop(writer, rx, shared.shutdown.clone()));
    tokio::spawn(read_loop(reader, shared.clone()));

    (
        Arc::new(PipeChannel {
            shared: shared.clone(),
        }),
        Arc::new(ControlLane { shared }),
    )
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = shutdown.cancelled() => None,
        };
        let Some(next) = next else {
            break;
        };

        match next {
            Outbound::Frame(frame) => {
                let mut line = match serde_json::to_vec(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "serialize pipe frame failed");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(err) = writer.write_all(&line).await {
                    tracing::debug!(error = %err, "write pipe failed");
                    break;
                }
                if let Err(err) = writer.flush().await {
                    tracing::debug!(error = %err, "flush pipe failed");
                    break;
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(reader: R, shared: Arc<PipeShared>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shared.shutdown.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "read pipe failed");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<WireFrame>(trimmed) {
            Ok(WireFrame::Rpc { payload }) => shared.on_rpc.fire(&payload.into_bytes()),
            Ok(WireFrame::RpcBinary { payload }) => shared.on_rpc.fire(&payload),
            Ok(WireFrame::Control { message }) => shared.on_control.fire(&message),
            Err(err) => tracing::warn!(error = %err, "invalid pipe frame"),
        }
    }
    shared.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn wire_frame_lanes() {
        let frame = WireFrame::Control {
            message: ControlMessage::TerminateAck,
        };
        let json = serde_json::to_string(&frame).expect("serialize frame");
        assert_eq!(json, r#"{"lane":"control","message":{"kind":"terminate_ack"}}"#);

        let parsed: WireFrame =
            serde_json::from_str(r#"{"lane":"rpc","payload":"{}"}"#).expect("parse frame");
        assert_eq!(
            parsed,
            WireFrame::Rpc {
                payload: "{}".to_string()
            }
        );
    }

    #[tokio::test]
    async fn lanes_are_demultiplexed_across_a_duplex_pipe() {
        let (owner_io, host_io) = tokio::io::duplex(4096);
        let (owner_read, owner_write) = tokio::io::split(owner_io);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (owner_rpc, owner_control) = spawn_pipe(owner_read, owner_write);
        let (host_rpc, host_control) = spawn_pipe(host_read, host_write);

        let rpc_seen = Arc::new(Mutex::new(Vec::new()));
        let control_seen = Arc::new(Mutex::new(Vec::new()));
        let _rpc = {
            let seen = rpc_seen.clone();
            host_rpc
                .on_message()
                .subscribe(move |bytes| seen.lock().push(bytes.clone()))
        };
        let _control = {
            let seen = control_seen.clone();
            host_control
                .on_message()
                .subscribe(move |message| seen.lock().push(message.clone()))
        };

        owner_rpc.send(br#"{"kind":"cancel","id":1}"#.to_vec()).expect("rpc send");
        owner_rpc.send(vec![0xff, 0x00, 0xfe]).expect("binary send");
        owner_control
            .send(ControlMessage::TerminateRequest {
                deadline_ms: Some(10),
            })
            .expect("control send");
        owner_control.flush().await.expect("flush");

        for _ in 0..100 {
            if rpc_seen.lock().len() == 2 && !control_seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *rpc_seen.lock(),
            vec![br#"{"kind":"cancel","id":1}"#.to_vec(), vec![0xff, 0x00, 0xfe]]
        );
        assert_eq!(
            *control_seen.lock(),
            vec![ControlMessage::TerminateRequest {
                deadline_ms: Some(10)
            }]
        );
    }

    #[tokio::test]
    async fn peer_shutdown_fires_close_once() {
        let (owner_io, host_io) = tokio::io::duplex(1024);
        let (owner_read, owner_write) = tokio::io::split(owner_io);
        let (_rpc, control) = spawn_pipe(owner_read, owner_write);
        let closes = Arc::new(Mutex::new(0));
        let _listener = {
            let closes = closes.clone();
            control.on_close().subscribe(move |_| *closes.lock() += 1)
        };

        drop(host_io);
        for _ in 0..100 {
            if control.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(control.is_closed());
        assert_eq!(*closes.lock(), 1);
        assert_eq!(
            control.send(ControlMessage::TerminateAck),
            Err(ChannelError::Closed)
        );
    }
}
