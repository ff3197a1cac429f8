//! TCP channel to the shuffle relay
//!
//! Frames are read off the socket by a background task, decoded, checked for
//! a valid sender signature and surfaced as [`ChannelEvent`]s. Everything
//! sent and received is kept in append-only logs for failure diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::Network;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{self, CodecError, HEADER_LEN};
use super::crypto_utils::SignatureError;
use super::messages::{classify, Packets, Reason, Signed};

/// What the channel reports to the round
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Message(Packets),
    /// An inbound packet failed verification and was dropped
    ProtocolViolation {
        reason: Reason,
        accused: Option<String>,
        invalid: Vec<Signed>,
    },
    Disconnected,
    ConnectError(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("channel closed")]
    Closed,
}

/// One logged frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub message_type: String,
    pub number: u32,
    pub from_key: Option<String>,
    pub packets: usize,
    pub frame: String,
}

impl FrameRecord {
    fn new(packets: &Packets, frame: &[u8]) -> Self {
        let first = packets.packet.first().and_then(|s| s.packet.as_ref());
        Self {
            message_type: first
                .map(|p| format!("{:?}", classify(p)))
                .unwrap_or_else(|| "Empty".to_string()),
            number: first.map(|p| p.number).unwrap_or_default(),
            from_key: first.and_then(|p| p.from_key_str()).map(str::to_string),
            packets: packets.packet.len(),
            frame: hex::encode(frame),
        }
    }
}

type FrameLog = Arc<Mutex<Vec<FrameRecord>>>;

/// Connection to the relay for the lifetime of one round
pub struct RelayChannel {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    incoming_rx: Arc<Mutex<mpsc::UnboundedReceiver<ChannelEvent>>>,
    reader_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    inbox: FrameLog,
    outbox: FrameLog,
    closed: AtomicBool,
}

impl RelayChannel {
    /// Connect to the relay and start reading
    ///
    /// The first event delivered is always [`ChannelEvent::Connected`].
    pub async fn connect(addr: &str, network: Network) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to relay");

        let (reader, writer) = stream.into_split();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let _ = incoming_tx.send(ChannelEvent::Connected);

        let inbox: FrameLog = Arc::new(Mutex::new(Vec::new()));
        let handle = tokio::spawn(Self::receive_frames(
            reader,
            network,
            incoming_tx,
            Arc::clone(&inbox),
        ));

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            incoming_rx: Arc::new(Mutex::new(incoming_rx)),
            reader_handle: Arc::new(Mutex::new(Some(handle))),
            inbox,
            outbox: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// Frame and send a signed batch
    pub async fn send(&self, packets: &Packets) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = codec::encode_frame(packets);
        if frame.len() - HEADER_LEN > codec::MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(frame.len() - HEADER_LEN).into());
        }

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        self.outbox.lock().await.push(FrameRecord::new(packets, &frame));
        Ok(())
    }

    /// Next event, or `None` once the reader has stopped and the queue is drained
    pub async fn recv(&self) -> Option<ChannelEvent> {
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop reading and shut the socket down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("socket shutdown: {e}");
        }
        info!("relay channel closed");
    }

    pub async fn inbox(&self) -> Vec<FrameRecord> {
        self.inbox.lock().await.clone()
    }

    pub async fn outbox(&self) -> Vec<FrameRecord> {
        self.outbox.lock().await.clone()
    }

    async fn receive_frames(
        mut reader: OwnedReadHalf,
        network: Network,
        incoming_tx: mpsc::UnboundedSender<ChannelEvent>,
        inbox: FrameLog,
    ) {
        let event = loop {
            let mut header = [0u8; HEADER_LEN];
            if let Err(e) = reader.read_exact(&mut header).await {
                debug!("relay stream ended: {e}");
                break ChannelEvent::Disconnected;
            }
            let len = match codec::decode_header(&header) {
                Ok(len) => len,
                Err(e) => {
                    warn!("unreadable frame header: {e}");
                    break ChannelEvent::ConnectError(e.to_string());
                }
            };

            let mut payload = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut payload).await {
                debug!("relay stream ended mid-frame: {e}");
                break ChannelEvent::Disconnected;
            }

            let event = match codec::decode_payload(&payload) {
                Ok(packets) => {
                    let mut frame = header.to_vec();
                    frame.extend_from_slice(&payload);
                    inbox.lock().await.push(FrameRecord::new(&packets, &frame));
                    Self::verify(packets, network)
                }
                Err(e) => {
                    warn!("undecodable payload: {e}");
                    ChannelEvent::ProtocolViolation {
                        reason: Reason::InvalidFormat,
                        accused: None,
                        invalid: Vec::new(),
                    }
                }
            };
            if incoming_tx.send(event).is_err() {
                return;
            }
        };
        let _ = incoming_tx.send(event);
    }

    /// Every packet in a batch must verify, or the whole batch is dropped
    fn verify(packets: Packets, network: Network) -> ChannelEvent {
        for signed in &packets.packet {
            if let Err(e) = codec::verify_signed(signed, network) {
                let accused = signed
                    .packet
                    .as_ref()
                    .and_then(|p| p.from_key_str())
                    .map(str::to_string);
                warn!(accused = ?accused, "dropping packet: {e}");
                let reason = match e {
                    SignatureError::InvalidFormat => Reason::InvalidFormat,
                    _ => Reason::InvalidSignature,
                };
                return ChannelEvent::ProtocolViolation {
                    reason,
                    accused,
                    invalid: vec![signed.clone()],
                };
            }
        }
        ChannelEvent::Message(packets)
    }
}
