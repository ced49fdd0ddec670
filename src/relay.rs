use crate::{
    config::{ConfigError, RelayConfig},
    event::{DecodeError, LogEvent},
    status, Close, Error, HandshakeError, Keepalive, Message, WebSocket,
};
use std::{convert::Infallible, io, io::Write, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("could not connect to {url}: {source}")]
    Connection { url: Url, source: Error },

    #[error("connection closed")]
    Closed(Option<Close>),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Receive(Error),
}

impl RelayError {
    pub fn close_status(&self) -> Option<u16> {
        match self {
            RelayError::Connection { .. } | RelayError::Closed(_) => None,
            RelayError::Decode(_) => Some(status::NORMAL),
            RelayError::Receive(err) => err.close_status(),
        }
    }
}

pub struct Session {
    ws: WebSocket<TcpStream>,
    close_timeout: Duration,
}

impl Session {
    pub async fn receive(&mut self) -> Result<LogEvent, RelayError> {
        match self.ws.read().await {
            Ok(Message::Text(text)) => Ok(LogEvent::decode(text.as_bytes())?),
            Ok(Message::Binary(data)) => Ok(LogEvent::decode(&data)?),
            Ok(Message::Close(close)) => Err(RelayError::Closed(close)),
            Err(err) if err.is_disconnect() => {
                tracing::debug!(%err, "connection lost");
                Err(RelayError::Closed(None))
            }
            Err(err) => Err(RelayError::Receive(err)),
        }
    }

    pub async fn close(mut self, status: u16) {
        match timeout(self.close_timeout, self.ws.close(status)).await {
            Ok(Ok(())) => tracing::debug!(status, "sent close frame"),
            Ok(Err(err)) => tracing::debug!(%err, "could not send close frame"),
            Err(_) => tracing::debug!(status, "timed out sending close frame"),
        }
    }
}

pub enum State {
    Disconnected,
    Connected(Session),
}

impl State {
    pub fn is_connected(&self) -> bool {
        matches!(self, State::Connected(_))
    }
}

pub struct Relay<W> {
    config: RelayConfig,
    out: W,
}

impl<W: Write> Relay<W> {
    pub fn new(config: RelayConfig, out: W) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Relay { config, out })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub async fn connect(&self) -> Result<Session, RelayError> {
        let url = &self.config.url;
        tracing::debug!(%url, "connecting");

        let open = async {
            let host = url
                .host_str()
                .ok_or(Error::Handshake(HandshakeError::NoHostInUrl))?;
            let port = url.port_or_known_default().unwrap_or(80);
            let stream = TcpStream::connect((host, port)).await?;
            WebSocket::client_from_stream(url, stream, self.config.max_message_size).await
        };

        let mut ws = match timeout(self.config.open_timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.open_timeout)),
        }
        .map_err(|source| RelayError::Connection {
            url: url.clone(),
            source,
        })?;

        ws.set_keepalive(Some(Keepalive {
            interval: self.config.ping_interval,
            timeout: self.config.ping_timeout,
        }));

        tracing::info!(%url, "connected");
        Ok(Session {
            ws,
            close_timeout: self.config.close_timeout,
        })
    }

    // Only a failed connect sleeps; losing a session reconnects on the next step.
    pub async fn step(&mut self, state: State) -> io::Result<State> {
        match state {
            State::Disconnected => match self.connect().await {
                Ok(session) => Ok(State::Connected(session)),
                Err(err) => {
                    self.report(&err)?;
                    tokio::time::sleep(self.config.retry_delay).await;
                    Ok(State::Disconnected)
                }
            },

            State::Connected(mut session) => match session.receive().await {
                Ok(event) => {
                    event.render(&mut self.out)?;
                    Ok(State::Connected(session))
                }
                Err(err) => {
                    self.report(&err)?;
                    if let Some(status) = err.close_status() {
                        session.close(status).await;
                    }
                    Ok(State::Disconnected)
                }
            },
        }
    }

    pub async fn run(&mut self) -> io::Result<Infallible> {
        let mut state = State::Disconnected;
        loop {
            state = self.step(state).await?;
        }
    }

    fn report(&mut self, err: &RelayError) -> io::Result<()> {
        match err {
            RelayError::Connection { .. } => {
                tracing::warn!(error = %err, "connection failed");
                writeln!(
                    self.out,
                    "Connection failed. Retrying in {} seconds...",
                    self.config.retry_delay.as_secs_f64()
                )?;
            }
            RelayError::Closed(close) => {
                match close {
                    Some(close) => tracing::info!(%close, "connection closed by server"),
                    None => tracing::info!("connection closed"),
                }
                writeln!(self.out, "Connection closed.")?;
            }
            RelayError::Decode(_) | RelayError::Receive(_) => {
                tracing::warn!(error = %err, "dropping connection");
                writeln!(self.out, "An error occurred: {err}")?;
            }
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(url: &str) -> Relay<Vec<u8>> {
        let config = RelayConfig {
            url: Url::parse(url).unwrap(),
            retry_delay: Duration::from_millis(20),
            ..RelayConfig::default()
        };
        Relay::new(config, Vec::new()).unwrap()
    }

    fn output(relay: &Relay<Vec<u8>>) -> &str {
        std::str::from_utf8(relay.output()).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RelayConfig {
            url: Url::parse("wss://localhost:3001").unwrap(),
            ..RelayConfig::default()
        };
        assert!(Relay::new(config, Vec::new()).is_err());
    }

    #[test]
    fn close_status_per_error_kind() {
        let decode = RelayError::from(LogEvent::decode(b"{}").unwrap_err());
        assert_eq!(decode.close_status(), Some(status::NORMAL));
        assert_eq!(RelayError::Closed(None).close_status(), None);
        assert_eq!(
            RelayError::Receive(Error::RsvSet).close_status(),
            Some(status::PROTOCOL_ERROR)
        );
    }

    #[test]
    fn reports_each_error_kind() {
        let mut relay = relay("ws://127.0.0.1:1");
        relay.report(&RelayError::Closed(None)).unwrap();
        relay
            .report(&RelayError::Receive(Error::MaskedFrame))
            .unwrap();
        relay
            .report(&RelayError::Connection {
                url: relay.config().url.clone(),
                source: Error::Reset,
            })
            .unwrap();
        assert_eq!(
            output(&relay),
            "Connection closed.\nAn error occurred: Server sent a masked frame\nConnection failed. Retrying in 0.02 seconds...\n"
        );
    }

    #[test]
    fn reports_default_retry_delay_in_whole_seconds() {
        let mut relay = Relay::new(RelayConfig::default(), Vec::new()).unwrap();
        relay
            .report(&RelayError::Connection {
                url: relay.config().url.clone(),
                source: Error::Reset,
            })
            .unwrap();
        assert_eq!(
            output(&relay),
            "Connection failed. Retrying in 5 seconds...\n"
        );
    }

    #[tokio::test]
    async fn failed_connect_waits_and_stays_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut relay = relay(&format!("ws://{addr}"));
        let started = std::time::Instant::now();
        let state = relay.step(State::Disconnected).await.unwrap();

        assert!(!state.is_connected());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            output(&relay),
            "Connection failed. Retrying in 0.02 seconds...\n"
        );
    }
}
