//! WebSocket stream transport.
//!
//! `open` hands the TCP connect and WebSocket handshake to a short-lived
//! worker thread; the finished socket comes back over a channel and is
//! reported as `Opened` from `poll`. After that every read and write happens
//! on the caller's thread, with the socket read timeout bounded by the poll
//! timeout so the session driver is never parked on the network.
//!
//! Writes use a near-zero socket timeout. Whatever the kernel does not take
//! stays in the WebSocket write buffer and `in_flight()` reports true until a
//! later `poll` flushes it, so the scheduler drops ticks instead of piling
//! frames up behind a stalled service.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::protocol::{encode_outbound, parse_inbound, OutboundMessage};
use super::{Transport, TransportError, TransportEvent, TransportMode};
use crate::frame::Frame;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Longest a single socket write may park the caller once the stream is open.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1);

/// Hard cap on bytes buffered for the socket; writes past it are refused.
const MAX_WRITE_BUFFER: usize = 8 * 1024 * 1024;

/// Configuration for a stream transport.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// `ws://` or `wss://` endpoint (e.g. "ws://127.0.0.1:5000/ws/camera").
    pub url: String,
    /// Bound on TCP connect and the WebSocket handshake.
    pub io_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/ws/camera".to_string(),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Persistent bidirectional transport over a WebSocket.
pub struct StreamTransport {
    config: StreamConfig,
    state: StreamState,
    messages_sent: u64,
}

enum StreamState {
    Closed,
    Connecting(Receiver<Result<OpenSocket, TransportError>>),
    Open(OpenSocket),
}

struct OpenSocket {
    socket: Socket,
    /// Clone of the underlying TCP stream used to adjust timeouts.
    control: TcpStream,
    /// Bytes accepted by `write` that the kernel has not taken yet.
    unflushed: bool,
}

impl StreamTransport {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            state: StreamState::Closed,
            messages_sent: 0,
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    fn write(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let StreamState::Open(open) = &mut self.state else {
            return Err(TransportError::SendFailed("stream is not open".to_string()));
        };
        let text = encode_outbound(message)?;
        match open.socket.send(Message::Text(text)) {
            Ok(()) => {
                open.unflushed = false;
                self.messages_sent += 1;
                Ok(())
            }
            // Buffered; `poll` keeps flushing and `in_flight` holds off new frames.
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => {
                open.unflushed = true;
                self.messages_sent += 1;
                Ok(())
            }
            Err(tungstenite::Error::WriteBufferFull(_)) => Err(TransportError::SendFailed(
                "stream write buffer full".to_string(),
            )),
            Err(err) => {
                self.state = StreamState::Closed;
                Err(TransportError::ConnectionLost(err.to_string()))
            }
        }
    }

    /// Push buffered bytes to the socket without blocking past `WRITE_TIMEOUT`.
    fn flush_pending(&mut self) -> Option<TransportEvent> {
        let StreamState::Open(open) = &mut self.state else {
            return None;
        };
        if !open.unflushed {
            return None;
        }
        match open.socket.flush() {
            Ok(()) => {
                open.unflushed = false;
                None
            }
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => None,
            Err(err) => {
                self.state = StreamState::Closed;
                Some(TransportEvent::Failed(TransportError::ConnectionLost(
                    err.to_string(),
                )))
            }
        }
    }

    fn read(&mut self, timeout: Duration) -> Option<TransportEvent> {
        let StreamState::Open(open) = &mut self.state else {
            return None;
        };
        if let Err(err) = open
            .control
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
        {
            self.state = StreamState::Closed;
            return Some(TransportEvent::Failed(TransportError::ConnectionLost(
                err.to_string(),
            )));
        }

        match open.socket.read() {
            Ok(Message::Text(text)) => Some(inbound_event(text.as_bytes())),
            Ok(Message::Binary(bytes)) => Some(inbound_event(&bytes)),
            Ok(Message::Close(frame)) => {
                let _ = open.socket.flush();
                self.state = StreamState::Closed;
                let clean = frame.as_ref().map_or(true, |frame| {
                    matches!(frame.code, CloseCode::Normal | CloseCode::Away)
                });
                if clean {
                    Some(TransportEvent::Closed)
                } else {
                    let reason = frame
                        .map(|frame| format!("closed with {}: {}", frame.code, frame.reason))
                        .unwrap_or_default();
                    Some(TransportEvent::Failed(TransportError::ConnectionLost(reason)))
                }
            }
            Ok(_) => None,
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => None,
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                self.state = StreamState::Closed;
                Some(TransportEvent::Closed)
            }
            Err(err) => {
                self.state = StreamState::Closed;
                Some(TransportEvent::Failed(TransportError::ConnectionLost(
                    err.to_string(),
                )))
            }
        }
    }
}

impl Transport for StreamTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Stream
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.close();
        let url = self.config.url.clone();
        let timeout = self.config.io_timeout;
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("sentinel-ws-connect".to_string())
            .spawn(move || {
                // The receiver is gone if the session closed while connecting.
                let _ = tx.send(connect(&url, timeout));
            })
            .map_err(|e| TransportError::ConnectFailed(format!("spawn connect worker: {}", e)))?;
        log::info!("StreamTransport: connecting to {}", self.config.url);
        self.state = StreamState::Connecting(rx);
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.config.url
    }

    fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open(_))
    }

    /// True while the socket still holds bytes of an earlier send.
    fn in_flight(&self) -> bool {
        matches!(&self.state, StreamState::Open(open) if open.unflushed)
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.write(&OutboundMessage::process_frame(&frame))
    }

    fn send_control(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.write(message)
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent> {
        let outcome = match &self.state {
            StreamState::Closed => {
                std::thread::sleep(timeout);
                return None;
            }
            StreamState::Open(_) => {
                if let Some(event) = self.flush_pending() {
                    return Some(event);
                }
                return self.read(timeout);
            }
            StreamState::Connecting(rx) => rx.recv_timeout(timeout),
        };
        match outcome {
            Ok(Ok(open)) => {
                log::info!("StreamTransport: connected to {}", self.config.url);
                self.state = StreamState::Open(open);
                Some(TransportEvent::Opened)
            }
            Ok(Err(err)) => {
                self.state = StreamState::Closed;
                Some(TransportEvent::Failed(err))
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.state = StreamState::Closed;
                Some(TransportEvent::Failed(TransportError::ConnectFailed(
                    "connect worker exited".to_string(),
                )))
            }
        }
    }

    fn close(&mut self) {
        if let StreamState::Open(mut open) = std::mem::replace(&mut self.state, StreamState::Closed)
        {
            let _ = open.socket.close(None);
            let _ = open.socket.flush();
            log::info!("StreamTransport: closed {}", self.config.url);
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn inbound_event(payload: &[u8]) -> TransportEvent {
    match parse_inbound(payload) {
        Ok(message) => TransportEvent::Message(message),
        Err(err) => TransportEvent::Failed(err),
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn connect(url: &str, timeout: Duration) -> Result<OpenSocket, TransportError> {
    let parsed =
        Url::parse(url).map_err(|e| TransportError::ConnectFailed(format!("{}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::ConnectFailed(format!("{} has no host", url)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| TransportError::ConnectFailed(format!("{} has no port", url)))?;

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::ConnectFailed(format!("resolve {}: {}", host, e)))?;
    let mut last_error = format!("no addresses for {}", host);
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(err) => last_error = format!("{}: {}", addr, err),
        }
    }
    let stream = stream.ok_or(TransportError::ConnectFailed(last_error))?;

    let configure = |tcp: &TcpStream| -> std::io::Result<TcpStream> {
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
        tcp.try_clone()
    };
    let control = configure(&stream).map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_write_buffer_size = MAX_WRITE_BUFFER;
    let (socket, _response) = tungstenite::client_tls_with_config(url, stream, Some(ws_config), None)
        .map_err(|e| TransportError::ConnectFailed(format!("handshake with {}: {}", url, e)))?;
    control
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    Ok(OpenSocket {
        socket,
        control,
        unflushed: false,
    })
}
