//! Built-in length-based framing.
//!
//! Two framings are supported:
//!
//! - **fixed**: every frame has the same size;
//! - **length field**: a big-endian unsigned length of 1, 2 or 4 bytes sits
//!   at a fixed offset and counts the payload bytes following it. The frame
//!   is emitted whole, header included:
//!
//! ```text
//! +-------- offset --------+-- width --+------ length ------+
//! | leading header bytes   |  length   |      payload       |
//! +------------------------+-----------+--------------------+
//! ```
//!
//! Frames are cut with [`Bytes::split_to`], so each one shares the channel
//! buffer's allocation. Incomplete trailing bytes stay pending until more
//! data arrives.

use {
    crate::{
        channel::TcpChannel,
        error::Error,
        handler::{ChannelHandler, Message},
        utils::Result,
    },
    async_trait::async_trait,
    byteorder::{BigEndian, ByteOrder},
    bytes::Bytes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Fixed(usize),
    LengthField { offset: usize, width: usize },
}

/// Splits the channel buffer into complete frames.
///
/// Expects [`Message::Buffer`] and yields [`Message::Frames`]; stops the
/// chain when no complete frame is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthBasedHandler {
    framing: Framing,
}

impl LengthBasedHandler {
    /// Frames of exactly `length` bytes.
    pub fn fixed(length: usize) -> Result<Self> {
        if length == 0 {
            return Err(Error::config("fixed frame length must be > 0"));
        }
        Ok(LengthBasedHandler {
            framing: Framing::Fixed(length),
        })
    }

    /// Frames announced by a `width`-byte length at `offset`.
    pub fn length_field(offset: usize, width: usize) -> Result<Self> {
        if !matches!(width, 1 | 2 | 4) {
            return Err(Error::config(format!(
                "length field width must be 1, 2 or 4, got {}",
                width
            )));
        }
        if offset.checked_add(width).is_none() {
            return Err(Error::config(format!(
                "length field offset {} is out of range",
                offset
            )));
        }
        Ok(LengthBasedHandler {
            framing: Framing::LengthField { offset, width },
        })
    }

    /// Smallest number of bytes that can hold one frame.
    pub fn min_frame_len(&self) -> usize {
        match self.framing {
            Framing::Fixed(length) => length,
            Framing::LengthField { offset, width } => offset + width,
        }
    }

    /// Cuts every complete frame off the front of `buf`.
    ///
    /// A bad length field is an error only if no frame precedes it in `buf`;
    /// otherwise the frames decoded so far are returned and the bad header
    /// stays in `buf`.
    pub fn decode(&self, buf: &mut Bytes) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        match self.framing {
            Framing::Fixed(length) => {
                while buf.len() >= length {
                    frames.push(buf.split_to(length));
                }
            }
            Framing::LengthField { offset, width } => {
                let header = offset + width;
                while buf.len() >= header {
                    let field = &buf[offset..header];
                    let length = match read_length(field) {
                        Ok(length) => length,
                        Err(e) if frames.is_empty() => return Err(e),
                        Err(_) => break,
                    };
                    let total = header + length;
                    if buf.len() < total {
                        break;
                    }
                    frames.push(buf.split_to(total));
                }
            }
        }
        Ok(frames)
    }
}

fn read_length(field: &[u8]) -> Result<usize> {
    let length = match field.len() {
        1 => u64::from(field[0]),
        2 => u64::from(BigEndian::read_u16(field)),
        _ => u64::from(BigEndian::read_u32(field)),
    };
    if length > i32::MAX as u64 {
        return Err(Error::Frame(format!("length {} exceeds {}", length, i32::MAX)));
    }
    Ok(length as usize)
}

#[async_trait]
impl ChannelHandler for LengthBasedHandler {
    async fn on_message<'a>(
        &self,
        _channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        let buf = match message {
            Message::Buffer(buf) => buf,
            other => {
                return Err(Error::Frame(format!(
                    "length-based handler expects the raw channel buffer, got {:?}",
                    other
                )));
            }
        };
        let frames = self.decode(buf)?;
        if frames.is_empty() {
            return Ok(None);
        }
        Ok(Some(Message::Frames(frames)))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::buffer::{BufferAllocator, compact, compact_with},
    };

    /// Feeds `stream` in `chunk`-sized pieces through decode + compaction.
    fn feed(handler: &LengthBasedHandler, stream: &[u8], chunk: usize) -> (Vec<Bytes>, Bytes) {
        let alloc = BufferAllocator::default();
        let mut pending = Bytes::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            let mut buf = compact_with(&pending, Bytes::copy_from_slice(piece), &alloc);
            let before = buf.len();
            frames.extend(handler.decode(&mut buf).unwrap());
            pending = compact(buf, before, &alloc);
        }
        (frames, pending)
    }

    #[test]
    fn fixed_frames_across_fragments() {
        let handler = LengthBasedHandler::fixed(3).unwrap();
        let pieces: [&[u8]; 8] = [
            b"a",
            b"bc",
            b"abc",
            b"ab",
            b"ca",
            b"bca",
            b"bc",
            b"abcabcabcabcabc",
        ];
        let alloc = BufferAllocator::default();
        let mut pending = Bytes::new();
        let mut frames = Vec::new();
        for piece in pieces {
            let mut buf = compact_with(&pending, Bytes::from_static(piece), &alloc);
            let before = buf.len();
            frames.extend(handler.decode(&mut buf).unwrap());
            pending = compact(buf, before, &alloc);
        }
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().all(|f| &f[..] == b"abc"));
        assert!(pending.is_empty());
    }

    #[test]
    fn length_field_is_chunk_independent() {
        let mut stream = Vec::new();
        for payload in [&b"hello"[..], b"", b"a", b"framing works"] {
            stream.extend_from_slice(&[0xAA, 0xBB]);
            stream.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            stream.extend_from_slice(payload);
        }
        // trailing partial frame
        stream.extend_from_slice(&[0xAA, 0xBB, 0x00, 0x09, b'x']);

        let handler = LengthBasedHandler::length_field(2, 2).unwrap();
        let (whole, whole_rest) = feed(&handler, &stream, stream.len());
        for chunk in [1, 2, 3, 5, 7] {
            let (frames, rest) = feed(&handler, &stream, chunk);
            assert_eq!(frames, whole, "chunk size {}", chunk);
            assert_eq!(rest, whole_rest, "chunk size {}", chunk);
        }
        assert_eq!(whole.len(), 4);
        assert_eq!(&whole[0][4..], b"hello");
        assert_eq!(whole[1].len(), 4);
        assert_eq!(&whole_rest[..], &[0xAA, 0xBB, 0x00, 0x09, b'x']);
    }

    #[test]
    fn one_byte_and_four_byte_widths() {
        let handler = LengthBasedHandler::length_field(0, 1).unwrap();
        let mut buf = Bytes::from_static(&[2, b'h', b'i', 1]);
        let frames = handler.decode(&mut buf).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[2, b'h', b'i'])]);
        assert_eq!(&buf[..], &[1]);

        let handler = LengthBasedHandler::length_field(0, 4).unwrap();
        let mut buf = Bytes::from_static(&[0, 0, 0, 3, b'a', b'b', b'c']);
        let frames = handler.decode(&mut buf).unwrap();
        assert_eq!(&frames[0][4..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let handler = LengthBasedHandler::length_field(0, 4).unwrap();
        let mut buf = Bytes::from_static(&[0x80, 0, 0, 0, 1, 2]);
        assert!(matches!(handler.decode(&mut buf), Err(Error::Frame(_))));
        assert_eq!(buf.len(), 6);

        // decoded frames are kept, the bad header stays pending
        let mut buf = Bytes::from_static(&[0, 0, 0, 1, 9, 0xFF, 0xFF, 0xFF, 0xFF]);
        let frames = handler.decode(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn invalid_configuration() {
        assert!(LengthBasedHandler::fixed(0).is_err());
        assert!(LengthBasedHandler::length_field(0, 3).is_err());
        assert!(LengthBasedHandler::length_field(0, 8).is_err());
        assert!(LengthBasedHandler::length_field(usize::MAX, 4).is_err());
        assert!(LengthBasedHandler::length_field(usize::MAX - 4, 4).is_ok());
        assert_eq!(LengthBasedHandler::length_field(3, 2).unwrap().min_frame_len(), 5);
    }
}
