use crate::{Error, HandshakeError, Utf8Error};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1_smol::Sha1;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use url::Url;

pub const MAX_RESPONSE_LEN: usize = 8 * 1024;

const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101";
const SEC_WEBSOCKET_ACCEPT_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

struct CodepointReceiver {
    string: String,
    valid: bool,
}

impl utf8parse::Receiver for CodepointReceiver {
    fn codepoint(&mut self, c: char) {
        self.string.push(c);
    }

    fn invalid_sequence(&mut self) {
        self.valid = false;
    }
}

async fn read_utf8_until(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    max_len: usize,
    until: &'static str,
) -> Result<String, Error> {
    let mut parser = utf8parse::Parser::new();
    let mut receiver = CodepointReceiver {
        valid: true,
        string: String::new(),
    };

    loop {
        let byte = stream.read_u8().await?;
        parser.advance(&mut receiver, byte);
        if !receiver.valid {
            return Err(Error::Utf8(Utf8Error::Handshake));
        }
        if receiver.string.ends_with(until) {
            return Ok(receiver.string);
        }
        if receiver.string.len() > max_len {
            return Err(Error::Handshake(HandshakeError::TooLong(max_len)));
        }
    }
}

async fn read_headers(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    max_len: usize,
) -> Result<HashMap<String, String>, Error> {
    let headers_str = read_utf8_until(stream, max_len, "\r\n\r\n").await?;
    let mut headers = HashMap::new();

    for line in headers_str.lines() {
        if line.is_empty() {
            break;
        }

        let Some((header, value)) = line.split_once(':') else {
            return Err(Error::Handshake(HandshakeError::MissingOrInvalidHeader(
                line.into(),
            )));
        };

        headers.insert(header.trim().to_lowercase(), value.trim().into());
    }

    Ok(headers)
}

fn accept_key(key_base64: &str) -> String {
    let digest = Sha1::from(format!("{}{}", key_base64, SEC_WEBSOCKET_ACCEPT_UUID))
        .digest()
        .bytes();
    BASE64.encode(digest)
}

fn header_is(headers: &HashMap<String, String>, name: &'static str, expect: &str) -> bool {
    headers
        .get(name)
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(expect))
        })
        .unwrap_or(false)
}

// Bytes after the response stay buffered in `stream`, so framing must reuse it.
pub async fn client(
    url: &Url,
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    max_len: usize,
) -> Result<(), Error> {
    let "ws" = url.scheme() else {
        return Err(Error::Handshake(HandshakeError::IncorrectScheme(
            url.scheme().into(),
        )));
    };

    let host = url
        .host_str()
        .ok_or(Error::Handshake(HandshakeError::NoHostInUrl))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let resource_name = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().into(),
    };

    let mut key_bytes = [0u8; 16];
    getrandom::getrandom(&mut key_bytes)?;
    let key_base64 = BASE64.encode(key_bytes);

    let request = format!(
        concat!(
            "GET {} HTTP/1.1\r\n",
            "Host: {}:{}\r\n",
            "Connection: Upgrade\r\n",
            "Upgrade: websocket\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "Sec-WebSocket-Key: {}\r\n",
            "\r\n",
        ),
        resource_name, host, port, key_base64,
    );

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response_line = read_utf8_until(stream, max_len, "\n").await?;
    if !response_line.starts_with(SWITCHING_PROTOCOLS) {
        return Err(Error::Handshake(HandshakeError::UnexpectedResponse(
            response_line.trim().into(),
        )));
    }

    let headers = read_headers(stream, max_len).await?;

    if !header_is(&headers, "connection", "upgrade") {
        return Err(Error::Handshake(HandshakeError::MissingOrInvalidHeader(
            "Connection".into(),
        )));
    }

    if !header_is(&headers, "upgrade", "websocket") {
        return Err(Error::Handshake(HandshakeError::MissingOrInvalidHeader(
            "Upgrade".into(),
        )));
    }

    let expect_accept = accept_key(&key_base64);
    if headers.get("sec-websocket-accept") != Some(&expect_accept) {
        return Err(Error::Handshake(HandshakeError::MissingOrInvalidHeader(
            "Sec-WebSocket-Accept".into(),
        )));
    }

    Ok(())
}
