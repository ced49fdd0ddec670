pub mod config;
pub mod event;
pub mod relay;

#[cfg(feature = "logrelay-fuzz")]
pub mod frame;
#[cfg(not(feature = "logrelay-fuzz"))]
mod frame;
mod handshake;

use frame::{Frame, FrameStream, Opcode};
use std::{fmt, string::FromUtf8Error, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    time::timeout,
};
use url::Url;

pub use config::RelayConfig;
pub use event::LogEvent;
pub use relay::{Relay, RelayError};

pub mod status {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not get random data")]
    GetRandom(getrandom::Error),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("No frame from the server within {0:?} of a ping")]
    KeepaliveTimeout(Duration),
    #[error("Invalid payload length")]
    InvalidPayloadLen,
    #[error("Message of {len} bytes exceeds the limit of {max} bytes")]
    TooLarge { len: u64, max: usize },
    #[error("The opcode was not expected at this time: {0:?}")]
    InvalidOpcode(Opcode),
    #[error("Got a fragmented control frame")]
    FragmentedControl,
    #[error("Got control frame larger than 125 bytes")]
    TooLargeControl,
    #[error("RSV bits were set")]
    RsvSet,
    #[error("Server sent a masked frame")]
    MaskedFrame,
    #[error("Connection reset without a closing handshake")]
    Reset,
    #[error("Tried to use a closed websocket")]
    WasClosed,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Incorrect scheme {0:?}, expected \"ws\"")]
    IncorrectScheme(String),
    #[error("URL does not have a host")]
    NoHostInUrl,
    #[error("Got an unexpected HTTP response: {0}")]
    UnexpectedResponse(String),
    #[error("Missing or invalid header: {0}")]
    MissingOrInvalidHeader(String),
    #[error("Response exceeded {0} bytes")]
    TooLong(usize),
}

#[derive(Error, Debug)]
pub enum Utf8Error {
    #[error("in handshake")]
    Handshake,
    #[error("in text message: {0}")]
    Text(#[from] FromUtf8Error),
    #[error("in close reason: {0}")]
    Close(#[from] std::str::Utf8Error),
}

impl From<getrandom::Error> for Error {
    fn from(error: getrandom::Error) -> Self {
        Error::GetRandom(error)
    }
}

impl Error {
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Reset | Error::WasClosed | Error::KeepaliveTimeout(_)
        )
    }

    pub fn close_status(&self) -> Option<u16> {
        match self {
            Error::InvalidPayloadLen
            | Error::InvalidOpcode(_)
            | Error::FragmentedControl
            | Error::TooLargeControl
            | Error::RsvSet
            | Error::MaskedFrame => Some(status::PROTOCOL_ERROR),
            Error::Utf8(_) => Some(status::INVALID_PAYLOAD),
            Error::TooLarge { .. } => Some(status::MESSAGE_TOO_BIG),
            Error::Io(_) | Error::Reset | Error::WasClosed | Error::KeepaliveTimeout(_) => None,
            Error::GetRandom(_) | Error::Handshake(_) | Error::Timeout(_) => {
                Some(status::INTERNAL_ERROR)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub status: u16,
    pub reason: String,
}

impl fmt::Display for Close {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} {}", self.status, self.reason)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<Close>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

// Codes a peer may put in a Close frame but that must never be sent back.
fn is_sendable_status(status: u16) -> bool {
    matches!(status, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

pub struct WebSocket<Stream> {
    stream: FrameStream<BufStream<Stream>>,
    state: ReadyState,
    keepalive: Option<Keepalive>,
    awaiting_pong: bool,
}

impl<Stream> WebSocket<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn client_from_stream(
        url: &Url,
        stream: Stream,
        max_message_size: usize,
    ) -> Result<Self, Error> {
        let mut stream = BufStream::new(stream);
        handshake::client(url, &mut stream, handshake::MAX_RESPONSE_LEN).await?;

        Ok(WebSocket {
            stream: FrameStream::new(stream, max_message_size),
            state: ReadyState::Open,
            keepalive: None,
            awaiting_pong: false,
        })
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    /// Pings after `interval` of silence; gives up `timeout` after an unanswered ping.
    pub fn set_keepalive(&mut self, keepalive: Option<Keepalive>) {
        self.keepalive = keepalive;
        self.awaiting_pong = false;
    }

    async fn next_frame(&mut self) -> Result<Frame, Error> {
        loop {
            let read = match self.keepalive {
                None => self.stream.read_frame().await?,
                Some(keepalive) => {
                    let wait = if self.awaiting_pong {
                        keepalive.timeout
                    } else {
                        keepalive.interval
                    };

                    // read_frame only buffers, so dropping it on timeout loses nothing.
                    match timeout(wait, self.stream.read_frame()).await {
                        Ok(read) => read?,
                        Err(_) if self.awaiting_pong => {
                            self.state = ReadyState::Closed;
                            return Err(Error::KeepaliveTimeout(wait));
                        }
                        Err(_) => {
                            tracing::trace!("idle, sending ping");
                            self.stream.write_frame(Opcode::Ping, Vec::new()).await?;
                            self.stream.flush().await?;
                            self.awaiting_pong = true;
                            continue;
                        }
                    }
                }
            };

            self.awaiting_pong = false;
            return match read {
                Some(frame) => Ok(frame),
                None => {
                    self.state = ReadyState::Closed;
                    Err(Error::Reset)
                }
            };
        }
    }

    pub async fn read(&mut self) -> Result<Message, Error> {
        if self.state == ReadyState::Closed {
            return Err(Error::WasClosed);
        }

        let mut partial: Option<(Opcode, Vec<u8>)> = None;

        loop {
            let frame = self.next_frame().await?;

            match frame.opcode() {
                Opcode::Ping => {
                    tracing::trace!(len = frame.payload_len(), "answering ping");
                    self.stream.write_frame(Opcode::Pong, frame.payload()).await?;
                    self.stream.flush().await?;
                }

                Opcode::Pong => {}

                Opcode::Close => return self.got_close(frame).await,

                opcode @ (Opcode::Text | Opcode::Binary) if partial.is_none() => {
                    if frame.fin() {
                        return into_message(opcode, frame.payload());
                    }
                    partial = Some((opcode, frame.payload()));
                }

                Opcode::Continuation => {
                    let Some((opcode, mut read_payload)) = partial.take() else {
                        return Err(Error::InvalidOpcode(Opcode::Continuation));
                    };

                    let len = (read_payload.len() + frame.payload_len()) as u64;
                    if len > self.stream.max_payload() as u64 {
                        return Err(Error::TooLarge {
                            len,
                            max: self.stream.max_payload(),
                        });
                    }

                    let fin = frame.fin();
                    read_payload.extend(frame.payload());
                    if fin {
                        return into_message(opcode, read_payload);
                    }
                    partial = Some((opcode, read_payload));
                }

                op => return Err(Error::InvalidOpcode(op)),
            }
        }
    }

    async fn got_close(&mut self, frame: Frame) -> Result<Message, Error> {
        let payload = frame.payload();
        let close = match payload[..] {
            [] => None,
            [_] => return Err(Error::InvalidPayloadLen),
            [status_high, status_low, ref reason @ ..] => Some(Close {
                status: u16::from_be_bytes([status_high, status_low]),
                reason: std::str::from_utf8(reason)
                    .map_err(Utf8Error::Close)?
                    .into(),
            }),
        };

        let reply = match &close {
            Some(close) if is_sendable_status(close.status) => close.status.to_be_bytes().to_vec(),
            Some(_) => status::NORMAL.to_be_bytes().to_vec(),
            None => Vec::new(),
        };
        self.state = ReadyState::Closed;
        if let Err(err) = self.send_close(reply).await {
            tracing::debug!(%err, "could not answer close frame");
        }

        Ok(Message::Close(close))
    }

    async fn send_close(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.stream.write_frame(Opcode::Close, payload).await?;
        self.stream.flush().await
    }

    pub async fn close(&mut self, status: u16) -> Result<(), Error> {
        if self.state == ReadyState::Closed {
            return Ok(());
        }
        self.state = ReadyState::Closed;
        self.send_close(status.to_be_bytes().to_vec()).await
    }
}

fn into_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message, Error> {
    match opcode {
        Opcode::Text => Ok(Message::Text(
            String::from_utf8(payload).map_err(Utf8Error::Text)?,
        )),
        Opcode::Binary => Ok(Message::Binary(payload)),
        _ => unreachable!("Not text or binary"),
    }
}
