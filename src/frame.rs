use crate::Error;
use bytes::BytesMut;
use std::mem::size_of;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FIN: u16 = 0b1000_0000_0000_0000;
pub const RSV: u16 = 0b0111_0000_0000_0000;
pub const OPCODE: u16 = 0b0000_1111_0000_0000;
pub const MASK: u16 = 0b0000_0000_1000_0000;
pub const PAYLOAD_LEN: u16 = 0b0000_0000_0111_1111;
pub const SMALL_PAYLOAD: u16 = 0b0000_0000_0111_1101;
pub const SMALL_PAYLOAD_USIZE: usize = SMALL_PAYLOAD as usize;
pub const EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1110;
pub const BIG_EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1111;
pub const FIRST_SHORT_SIZE: usize = size_of::<u16>();
pub const EXTENDED_PAYLOAD_SIZE: usize = size_of::<u16>();
pub const BIG_EXTENDED_PAYLOAD_SIZE: usize = size_of::<u64>();
pub const MASK_KEY_SIZE: usize = size_of::<u32>();

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
    Reserved,
}

impl Opcode {
    fn from_first_short(first_short: u16) -> Self {
        match (first_short & OPCODE) >> 8 {
            0 => Opcode::Continuation,
            1 => Opcode::Text,
            2 => Opcode::Binary,
            8 => Opcode::Close,
            9 => Opcode::Ping,
            10 => Opcode::Pong,
            _ => Opcode::Reserved,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

fn mask_payload(payload: &mut [u8], mask_key: u32) {
    let mask_bytes = mask_key.to_be_bytes();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_bytes[i % 4];
    }
}

#[derive(Debug)]
pub struct Frame {
    first_short: u16,
    payload: Vec<u8>,
}

impl Frame {
    pub fn fin(&self) -> bool {
        self.first_short & FIN != 0
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_first_short(self.first_short)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Returns `Ok(None)` until the whole frame is buffered. Header violations are
/// reported as soon as the header is complete.
pub fn parse_frame(buffer: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, Error> {
    if buffer.len() < FIRST_SHORT_SIZE {
        return Ok(None);
    }

    let first_short = u16::from_be_bytes([buffer[0], buffer[1]]);
    let opcode = Opcode::from_first_short(first_short);

    if first_short & RSV != 0 {
        return Err(Error::RsvSet);
    }
    if first_short & MASK != 0 {
        return Err(Error::MaskedFrame);
    }
    if opcode == Opcode::Reserved {
        return Err(Error::InvalidOpcode(opcode));
    }
    if opcode.is_control() {
        if first_short & FIN == 0 {
            return Err(Error::FragmentedControl);
        }
        if first_short & PAYLOAD_LEN > SMALL_PAYLOAD {
            return Err(Error::TooLargeControl);
        }
    }

    let payload_len_size = match first_short & PAYLOAD_LEN {
        EXTENDED_PAYLOAD => EXTENDED_PAYLOAD_SIZE,
        BIG_EXTENDED_PAYLOAD => BIG_EXTENDED_PAYLOAD_SIZE,
        _ => 0,
    };
    let header_size = FIRST_SHORT_SIZE + payload_len_size;
    if buffer.len() < header_size {
        return Ok(None);
    }

    let extended = &buffer[FIRST_SHORT_SIZE..header_size];
    let payload_len = match *extended {
        [] => (first_short & PAYLOAD_LEN) as u64,
        [high, low] => u16::from_be_bytes([high, low]) as u64,
        [b0, b1, b2, b3, b4, b5, b6, b7] => {
            if b0 & 0x80 != 0 {
                return Err(Error::InvalidPayloadLen);
            }
            u64::from_be_bytes([b0, b1, b2, b3, b4, b5, b6, b7])
        }
        _ => unreachable!("extended length is 0, 2 or 8 bytes"),
    };
    if payload_len > max_payload as u64 {
        return Err(Error::TooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let frame_size = header_size + payload_len as usize;
    if buffer.len() < frame_size {
        buffer.reserve(frame_size - buffer.len());
        return Ok(None);
    }

    let whole_frame = buffer.split_to(frame_size);
    Ok(Some(Frame {
        first_short,
        payload: whole_frame[header_size..].to_vec(),
    }))
}

pub struct FrameStream<Stream> {
    stream: Stream,
    buffer: BytesMut,
    max_payload: usize,
}

impl<Stream> FrameStream<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: Stream, max_payload: usize) -> Self {
        FrameStream {
            stream,
            buffer: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = parse_frame(&mut self.buffer, self.max_payload)? {
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(Error::Reset);
                }
            }
        }
    }

    pub async fn write_frame(&mut self, opcode: Opcode, mut payload: Vec<u8>) -> Result<(), Error> {
        let mut mask_bytes = [0u8; MASK_KEY_SIZE];
        getrandom::getrandom(&mut mask_bytes)?;
        let mask_key = u32::from_be_bytes(mask_bytes);

        let mut first_short = FIN | MASK | ((opcode as u16) << 8);
        first_short |= match payload.len() {
            0..=SMALL_PAYLOAD_USIZE => payload.len() as u16,
            len if len <= u16::MAX as usize => EXTENDED_PAYLOAD,
            _ => BIG_EXTENDED_PAYLOAD,
        };

        self.stream.write_u16(first_short).await?;
        match first_short & PAYLOAD_LEN {
            EXTENDED_PAYLOAD => self.stream.write_u16(payload.len() as u16).await?,
            BIG_EXTENDED_PAYLOAD => self.stream.write_u64(payload.len() as u64).await?,
            _ => {}
        }
        self.stream.write_u32(mask_key).await?;

        mask_payload(&mut payload, mask_key);
        self.stream.write_all(&payload).await?;

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, BufStream};

    fn buffer(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn parses_small_text_frame() {
        let mut buf = buffer(b"\x81\x05hello");
        let frame = parse_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(frame.fin());
        assert_eq!(frame.opcode(), Opcode::Text);
        assert_eq!(frame.payload(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn leaves_trailing_bytes_for_the_next_frame() {
        let mut buf = buffer(b"\x01\x03abc\x80\x02de");
        let first = parse_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(!first.fin());
        assert_eq!(first.opcode(), Opcode::Text);

        let second = parse_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(second.fin());
        assert_eq!(second.opcode(), Opcode::Continuation);
        assert_eq!(second.payload(), b"de");
    }

    #[test]
    fn waits_for_incomplete_frames() {
        assert!(parse_frame(&mut buffer(b""), 1024).unwrap().is_none());
        assert!(parse_frame(&mut buffer(b"\x81"), 1024).unwrap().is_none());
        assert!(parse_frame(&mut buffer(b"\x81\x7e\x01"), 1024)
            .unwrap()
            .is_none());
        assert!(parse_frame(&mut buffer(b"\x81\x05hel"), 1024)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parses_extended_length() {
        let payload = vec![b'x'; 300];
        let mut bytes = vec![0x82, 0x7e, 0x01, 0x2c];
        bytes.extend(&payload);
        let frame = parse_frame(&mut buffer(&bytes), 1024).unwrap().unwrap();
        assert_eq!(frame.opcode(), Opcode::Binary);
        assert_eq!(frame.payload(), payload);
    }

    #[test]
    fn parses_big_extended_length() {
        let payload = vec![b'y'; 70_000];
        let mut bytes = vec![0x82, 0x7f];
        bytes.extend((payload.len() as u64).to_be_bytes());
        bytes.extend(&payload);
        let frame = parse_frame(&mut buffer(&bytes), 1 << 20).unwrap().unwrap();
        assert_eq!(frame.payload_len(), 70_000);
    }

    #[test]
    fn rejects_header_violations() {
        assert!(matches!(
            parse_frame(&mut buffer(b"\xc1\x00"), 1024),
            Err(Error::RsvSet)
        ));
        assert!(matches!(
            parse_frame(&mut buffer(b"\x81\x80\x00\x00\x00\x00"), 1024),
            Err(Error::MaskedFrame)
        ));
        assert!(matches!(
            parse_frame(&mut buffer(b"\x83\x00"), 1024),
            Err(Error::InvalidOpcode(Opcode::Reserved))
        ));
        assert!(matches!(
            parse_frame(&mut buffer(b"\x09\x00"), 1024),
            Err(Error::FragmentedControl)
        ));
        assert!(matches!(
            parse_frame(&mut buffer(b"\x89\x7e\x00\x80"), 1024),
            Err(Error::TooLargeControl)
        ));
        assert!(matches!(
            parse_frame(&mut buffer(b"\x82\x7f\x80\x00\x00\x00\x00\x00\x00\x00"), 1024),
            Err(Error::InvalidPayloadLen)
        ));
    }

    #[test]
    fn rejects_oversized_payload_before_it_arrives() {
        let result = parse_frame(&mut buffer(b"\x81\x7e\x04\x00"), 1000);
        assert!(matches!(
            result,
            Err(Error::TooLarge {
                len: 1024,
                max: 1000
            })
        ));
    }

    #[tokio::test]
    async fn writes_masked_frames() {
        let (client, mut server) = duplex(1024);
        let mut stream = FrameStream::new(BufStream::new(client), 1024);
        stream
            .write_frame(Opcode::Pong, b"are you there".to_vec())
            .await
            .unwrap();
        stream.flush().await.unwrap();

        let mut header = [0u8; 6];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x8a);
        assert_eq!(header[1], 0x80 | 13);

        let mut payload = vec![0u8; 13];
        server.read_exact(&mut payload).await.unwrap();
        mask_payload(
            &mut payload,
            u32::from_be_bytes([header[2], header[3], header[4], header[5]]),
        );
        assert_eq!(payload, b"are you there");
    }

    #[tokio::test]
    async fn writes_extended_length_header() {
        let (client, mut server) = duplex(4096);
        let mut stream = FrameStream::new(BufStream::new(client), 4096);
        stream.write_frame(Opcode::Binary, vec![0; 200]).await.unwrap();
        stream.flush().await.unwrap();

        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x82);
        assert_eq!(header[1], 0x80 | 0x7e);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 200);
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_a_reset() {
        let (client, mut server) = duplex(1024);
        let mut stream = FrameStream::new(BufStream::new(client), 1024);
        server.write_all(b"\x81\x05he").await.unwrap();
        drop(server);
        assert!(matches!(stream.read_frame().await, Err(Error::Reset)));
    }

    #[tokio::test]
    async fn eof_between_frames_is_none() {
        let (client, mut server) = duplex(1024);
        let mut stream = FrameStream::new(BufStream::new(client), 1024);
        server.write_all(b"\x81\x02hi").await.unwrap();
        drop(server);
        let frame = stream.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload(), b"hi");
        assert!(stream.read_frame().await.unwrap().is_none());
    }
}
