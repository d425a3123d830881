//! Framing: 4-byte LE length prefix + tagged payload, fields hand-encoded.
//!
//! Payload layout is `u8 kind` followed by the kind's fields in declaration
//! order: strings and byte arrays as `u32 LE length || raw bytes`, integers
//! little-endian fixed width, booleans one byte. The layout is the external
//! contract, so encoding is written out field by field rather than derived.

use crate::protocol::{Kind, Message};

const LEN_SIZE: usize = 4;

/// Hard ceiling on one frame's payload. Leaves ample headroom over the
/// largest chunk-carrying frame.
pub const MAX_FRAME_LEN: u32 = 100 * 1024 * 1024; // 100 MiB

/// Encode a message into a full frame: 4-byte LE length + payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_payload(msg);
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode just the payload (kind tag + body), without the length prefix.
/// Never fails for a well-formed message value.
pub fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(msg.kind().tag());
    match msg {
        Message::Chat {
            sender,
            target,
            content,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, content);
        }
        Message::FileStart {
            sender,
            target,
            transfer_id,
            file_name,
            file_size,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, transfer_id);
            put_str(&mut out, file_name);
            out.extend_from_slice(&file_size.to_le_bytes());
        }
        Message::FileData {
            sender,
            target,
            transfer_id,
            seq,
            data,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, transfer_id);
            out.extend_from_slice(&seq.to_le_bytes());
            out.extend_from_slice(&(data.len() as i32).to_le_bytes());
            out.extend_from_slice(data);
        }
        Message::FileEnd {
            sender,
            target,
            transfer_id,
            success,
            error,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, transfer_id);
            out.push(u8::from(*success));
            put_str(&mut out, error);
        }
        Message::Ack {
            sender,
            target,
            transfer_id,
            seq,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, transfer_id);
            out.extend_from_slice(&seq.to_le_bytes());
        }
        Message::Error {
            sender,
            target,
            description,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, target);
            put_str(&mut out, description);
        }
        Message::Connect {
            sender,
            client_name,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, client_name);
        }
        Message::Disconnect { sender, reason } => {
            put_str(&mut out, sender);
            put_str(&mut out, reason);
        }
        Message::IdResponse { sender, client_id } => {
            put_str(&mut out, sender);
            put_str(&mut out, client_id);
        }
        Message::DownloadAccept {
            sender,
            transfer_id,
        }
        | Message::DownloadReject {
            sender,
            transfer_id,
        }
        | Message::UploadConfirmed {
            sender,
            transfer_id,
        } => {
            put_str(&mut out, sender);
            put_str(&mut out, transfer_id);
        }
    }
    out
}

/// Decode one complete payload (kind tag + body). Rejects unknown tags,
/// truncated fields, and trailing bytes.
pub fn decode_payload(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let mut r = Cursor::new(bytes);
    let tag = r.u8()?;
    let kind = Kind::from_tag(tag).ok_or(FrameDecodeError::UnknownKind(tag))?;
    let msg = match kind {
        Kind::Chat => Message::Chat {
            sender: r.string()?,
            target: r.string()?,
            content: r.string()?,
        },
        Kind::FileStart => Message::FileStart {
            sender: r.string()?,
            target: r.string()?,
            transfer_id: r.string()?,
            file_name: r.string()?,
            file_size: r.i64()?,
        },
        Kind::FileData => Message::FileData {
            sender: r.string()?,
            target: r.string()?,
            transfer_id: r.string()?,
            seq: r.i32()?,
            data: r.bytes_i32()?.to_vec(),
        },
        Kind::FileEnd => Message::FileEnd {
            sender: r.string()?,
            target: r.string()?,
            transfer_id: r.string()?,
            success: r.bool()?,
            error: r.string()?,
        },
        Kind::Ack => Message::Ack {
            sender: r.string()?,
            target: r.string()?,
            transfer_id: r.string()?,
            seq: r.i32()?,
        },
        Kind::Error => Message::Error {
            sender: r.string()?,
            target: r.string()?,
            description: r.string()?,
        },
        Kind::Connect => Message::Connect {
            sender: r.string()?,
            client_name: r.string()?,
        },
        Kind::Disconnect => Message::Disconnect {
            sender: r.string()?,
            reason: r.string()?,
        },
        Kind::IdResponse => Message::IdResponse {
            sender: r.string()?,
            client_id: r.string()?,
        },
        Kind::DownloadAccept => Message::DownloadAccept {
            sender: r.string()?,
            transfer_id: r.string()?,
        },
        Kind::DownloadReject => Message::DownloadReject {
            sender: r.string()?,
            transfer_id: r.string()?,
        },
        Kind::UploadConfirmed => Message::UploadConfirmed {
            sender: r.string()?,
            transfer_id: r.string()?,
        },
    };
    r.finish()?;
    Ok(msg)
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed. `NeedMore` means the buffer holds a partial
/// frame; callers retry after appending data.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len == 0 {
        return Err(FrameDecodeError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let total = LEN_SIZE + len as usize;
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_payload(&bytes[LEN_SIZE..total])?;
    Ok((msg, total))
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    TooLarge,
}

/// Error decoding a frame or payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame length is zero")]
    EmptyFrame,
    #[error("frame length {0} exceeds {MAX_FRAME_LEN}")]
    TooLarge(u32),
    #[error("unknown kind tag {0:#04x}")]
    UnknownKind(u8),
    #[error("payload truncated")]
    Truncated,
    #[error("negative length field")]
    NegativeLength,
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("string field is not valid UTF-8")]
    Utf8,
    #[error("boolean field is not 0 or 1")]
    BadBool,
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(FrameDecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(FrameDecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, FrameDecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, FrameDecodeError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn bool(&mut self) -> Result<bool, FrameDecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(FrameDecodeError::BadBool),
        }
    }

    fn string(&mut self) -> Result<String, FrameDecodeError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameDecodeError::Utf8)
    }

    /// Byte array with a signed 32-bit length prefix (FILE_DATA payload).
    fn bytes_i32(&mut self) -> Result<&'a [u8], FrameDecodeError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(FrameDecodeError::NegativeLength);
        }
        self.take(len as usize)
    }

    fn finish(self) -> Result<(), FrameDecodeError> {
        if self.pos != self.buf.len() {
            return Err(FrameDecodeError::TrailingBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::Chat {
                sender: "a1b2c3d4".into(),
                target: String::new(),
                content: "hi there".into(),
            },
            Message::FileStart {
                sender: "a1b2c3d4".into(),
                target: "e5f60718".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
                file_name: "x.bin".into(),
                file_size: 20000,
            },
            Message::FileData {
                sender: "a1b2c3d4".into(),
                target: "e5f60718".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
                seq: 2,
                data: vec![0xAB; 3616],
            },
            Message::FileEnd {
                sender: "a1b2c3d4".into(),
                target: "e5f60718".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
                success: true,
                error: String::new(),
            },
            Message::Ack {
                sender: "SERVER".into(),
                target: "a1b2c3d4".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
                seq: 0,
            },
            Message::Error {
                sender: "SERVER".into(),
                target: "a1b2c3d4".into(),
                description: "no such peer".into(),
            },
            Message::Connect {
                sender: String::new(),
                client_name: "alice".into(),
            },
            Message::Disconnect {
                sender: "a1b2c3d4".into(),
                reason: "quit".into(),
            },
            Message::IdResponse {
                sender: "SERVER".into(),
                client_id: "a1b2c3d4".into(),
            },
            Message::DownloadAccept {
                sender: "e5f60718".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
            },
            Message::DownloadReject {
                sender: "e5f60718".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
            },
            Message::UploadConfirmed {
                sender: "server".into(),
                transfer_id: "550e8400-e29b-41d4-a716-446655440000".into(),
            },
        ]
    }

    #[test]
    fn roundtrip_every_kind() {
        for msg in samples() {
            let payload = encode_payload(&msg);
            let decoded = decode_payload(&payload).expect("decode");
            assert_eq!(decoded, msg);

            let frame = encode_frame(&msg).expect("encode");
            let (decoded, consumed) = decode_frame(&frame).expect("decode frame");
            assert_eq!(consumed, frame.len());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn chat_byte_layout_is_fixed() {
        let msg = Message::Chat {
            sender: "ab".into(),
            target: String::new(),
            content: "hi".into(),
        };
        let mut expected = vec![0x01];
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(encode_payload(&msg), expected);

        let frame = encode_frame(&msg).unwrap();
        assert_eq!(&frame[..4], &(expected.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..], expected.as_slice());
    }

    #[test]
    fn file_data_byte_layout_is_fixed() {
        let msg = Message::FileData {
            sender: "ab".into(),
            target: "cd".into(),
            transfer_id: "t".into(),
            seq: 7,
            data: vec![1, 2, 3],
        };
        let mut expected = vec![0x03];
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"cd");
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(b"t");
        expected.extend_from_slice(&7i32.to_le_bytes());
        expected.extend_from_slice(&3i32.to_le_bytes());
        expected.extend_from_slice(&[1, 2, 3]);
        assert_eq!(encode_payload(&msg), expected);
    }

    #[test]
    fn partial_frame_needs_more() {
        let frame = encode_frame(&samples()[0]).unwrap();
        assert_eq!(decode_frame(&frame[..2]), Err(FrameDecodeError::NeedMore));
        assert_eq!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        );
        assert_eq!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        );
    }

    #[test]
    fn zero_length_frame_rejected() {
        assert_eq!(
            decode_frame(&[0, 0, 0, 0]),
            Err(FrameDecodeError::EmptyFrame)
        );
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.push(0x01);
        assert_eq!(
            decode_frame(&buf),
            Err(FrameDecodeError::TooLarge(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(
            decode_payload(&[0xFF]),
            Err(FrameDecodeError::UnknownKind(0xFF))
        );
        assert_eq!(decode_payload(&[0x00]), Err(FrameDecodeError::UnknownKind(0)));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut payload = encode_payload(&samples()[0]);
        payload.push(0x99);
        assert_eq!(
            decode_payload(&payload),
            Err(FrameDecodeError::TrailingBytes)
        );
    }

    #[test]
    fn truncated_inner_field_rejected() {
        let payload = encode_payload(&samples()[0]);
        assert_eq!(
            decode_payload(&payload[..payload.len() - 1]),
            Err(FrameDecodeError::Truncated)
        );
    }

    #[test]
    fn string_length_overrunning_buffer_rejected() {
        // CHAT with a sender length claiming far more bytes than present.
        let mut payload = vec![0x01];
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        payload.extend_from_slice(b"ab");
        assert_eq!(decode_payload(&payload), Err(FrameDecodeError::Truncated));
    }

    #[test]
    fn negative_data_length_rejected() {
        let mut payload = vec![0x03];
        put_str(&mut payload, "a");
        put_str(&mut payload, "b");
        put_str(&mut payload, "t");
        payload.extend_from_slice(&0i32.to_le_bytes()); // seq
        payload.extend_from_slice(&(-1i32).to_le_bytes()); // dataLen
        assert_eq!(
            decode_payload(&payload),
            Err(FrameDecodeError::NegativeLength)
        );
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut payload = vec![0x07];
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&[0xC3, 0x28]); // invalid sequence
        payload.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode_payload(&payload), Err(FrameDecodeError::Utf8));
    }

    #[test]
    fn bad_bool_rejected() {
        let msg = Message::FileEnd {
            sender: "a".into(),
            target: "b".into(),
            transfer_id: "t".into(),
            success: true,
            error: String::new(),
        };
        let mut payload = encode_payload(&msg);
        // success byte sits right before the trailing empty error string.
        let idx = payload.len() - 4 - 1;
        payload[idx] = 2;
        assert_eq!(decode_payload(&payload), Err(FrameDecodeError::BadBool));
    }

    #[test]
    fn consecutive_frames_in_one_buffer() {
        let a = encode_frame(&samples()[0]).unwrap();
        let b = encode_frame(&samples()[7]).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        assert!(matches!(m1, Message::Chat { .. }));
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert!(matches!(m2, Message::Disconnect { .. }));
    }

    #[test]
    fn empty_file_data_roundtrips() {
        let msg = Message::FileData {
            sender: "a".into(),
            target: "b".into(),
            transfer_id: "t".into(),
            seq: 0,
            data: Vec::new(),
        };
        let payload = encode_payload(&msg);
        assert_eq!(decode_payload(&payload).unwrap(), msg);
    }
}
