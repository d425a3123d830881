//! Ferry wire protocol: the closed message set and protocol constants.

/// Payload bytes carried by one FILE_DATA frame. The sender chunks files on
/// this boundary; the hub derives the expected chunk count from it.
pub const CHUNK_SIZE: usize = 8192;

/// Sender id stamped on hub-originated frames.
pub const SERVER_SENDER: &str = "SERVER";

/// Sender id on UPLOAD_CONFIRMED frames. Lowercase on the wire for this one
/// kind; peers compare server senders case-insensitively.
pub const UPLOAD_CONFIRMED_SENDER: &str = "server";

/// True when `sender` names the hub itself, in either case.
pub fn is_server_sender(sender: &str) -> bool {
    sender.eq_ignore_ascii_case(SERVER_SENDER)
}

/// Number of FILE_DATA frames a file of `size` bytes produces. Zero for an
/// empty file; a trailing partial chunk counts as one.
pub fn expected_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// One-byte kind tag opening every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Chat = 0x01,
    FileStart = 0x02,
    FileData = 0x03,
    FileEnd = 0x04,
    Ack = 0x05,
    Error = 0x06,
    Connect = 0x07,
    Disconnect = 0x08,
    IdResponse = 0x09,
    DownloadAccept = 0x0A,
    DownloadReject = 0x0B,
    UploadConfirmed = 0x0C,
}

impl Kind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Kind> {
        Some(match tag {
            0x01 => Kind::Chat,
            0x02 => Kind::FileStart,
            0x03 => Kind::FileData,
            0x04 => Kind::FileEnd,
            0x05 => Kind::Ack,
            0x06 => Kind::Error,
            0x07 => Kind::Connect,
            0x08 => Kind::Disconnect,
            0x09 => Kind::IdResponse,
            0x0A => Kind::DownloadAccept,
            0x0B => Kind::DownloadReject,
            0x0C => Kind::UploadConfirmed,
            _ => return None,
        })
    }
}

/// All wire message types. Field order matches the byte layout in the wire
/// module. Every variant opens with the sender id; the hub rewrites it to the
/// authoritative peer id before dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text chat. Empty target = broadcast to every other peer.
    Chat {
        sender: String,
        target: String,
        content: String,
    },
    /// Announce a transfer. No payload may flow until the target accepts.
    FileStart {
        sender: String,
        target: String,
        transfer_id: String,
        file_name: String,
        file_size: i64,
    },
    /// One payload chunk of an accepted transfer.
    FileData {
        sender: String,
        target: String,
        transfer_id: String,
        seq: i32,
        data: Vec<u8>,
    },
    /// Terminal frame of a transfer, from the sender or synthesised by the hub.
    FileEnd {
        sender: String,
        target: String,
        transfer_id: String,
        success: bool,
        error: String,
    },
    /// Per-chunk receipt, emitted by the hub back to the chunk sender.
    Ack {
        sender: String,
        target: String,
        transfer_id: String,
        seq: i32,
    },
    /// Protocol-level error notification. Does not terminate the connection.
    Error {
        sender: String,
        target: String,
        description: String,
    },
    /// First frame from a peer: announce the display name.
    Connect { sender: String, client_name: String },
    /// Graceful leave.
    Disconnect { sender: String, reason: String },
    /// Hub response to Connect, echoing the assigned peer id.
    IdResponse { sender: String, client_id: String },
    /// Recipient consents to a proposed transfer.
    DownloadAccept { sender: String, transfer_id: String },
    /// Recipient declines a proposed transfer.
    DownloadReject { sender: String, transfer_id: String },
    /// Hub tells the original sender that payload may flow.
    UploadConfirmed { sender: String, transfer_id: String },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Chat { .. } => Kind::Chat,
            Message::FileStart { .. } => Kind::FileStart,
            Message::FileData { .. } => Kind::FileData,
            Message::FileEnd { .. } => Kind::FileEnd,
            Message::Ack { .. } => Kind::Ack,
            Message::Error { .. } => Kind::Error,
            Message::Connect { .. } => Kind::Connect,
            Message::Disconnect { .. } => Kind::Disconnect,
            Message::IdResponse { .. } => Kind::IdResponse,
            Message::DownloadAccept { .. } => Kind::DownloadAccept,
            Message::DownloadReject { .. } => Kind::DownloadReject,
            Message::UploadConfirmed { .. } => Kind::UploadConfirmed,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Message::Chat { sender, .. }
            | Message::FileStart { sender, .. }
            | Message::FileData { sender, .. }
            | Message::FileEnd { sender, .. }
            | Message::Ack { sender, .. }
            | Message::Error { sender, .. }
            | Message::Connect { sender, .. }
            | Message::Disconnect { sender, .. }
            | Message::IdResponse { sender, .. }
            | Message::DownloadAccept { sender, .. }
            | Message::DownloadReject { sender, .. }
            | Message::UploadConfirmed { sender, .. } => sender,
        }
    }

    /// Overwrite the sender field. The hub applies this to every inbound
    /// frame so peers cannot spoof one another.
    pub fn set_sender(&mut self, id: &str) {
        match self {
            Message::Chat { sender, .. }
            | Message::FileStart { sender, .. }
            | Message::FileData { sender, .. }
            | Message::FileEnd { sender, .. }
            | Message::Ack { sender, .. }
            | Message::Error { sender, .. }
            | Message::Connect { sender, .. }
            | Message::Disconnect { sender, .. }
            | Message::IdResponse { sender, .. }
            | Message::DownloadAccept { sender, .. }
            | Message::DownloadReject { sender, .. }
            | Message::UploadConfirmed { sender, .. } => {
                id.clone_into(sender);
            }
        }
    }

    /// The addressed peer, for kinds that carry one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Message::Chat { target, .. }
            | Message::FileStart { target, .. }
            | Message::FileData { target, .. }
            | Message::FileEnd { target, .. }
            | Message::Ack { target, .. }
            | Message::Error { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(expected_chunks(0), 0);
        assert_eq!(expected_chunks(1), 1);
        assert_eq!(expected_chunks(CHUNK_SIZE as u64), 1);
        assert_eq!(expected_chunks(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(expected_chunks(20000), 3);
    }

    #[test]
    fn kind_tags_roundtrip() {
        for tag in 0x01..=0x0C {
            let kind = Kind::from_tag(tag).expect("tag in range");
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(Kind::from_tag(0x00), None);
        assert_eq!(Kind::from_tag(0x0D), None);
    }

    #[test]
    fn sender_rewrite() {
        let mut msg = Message::Chat {
            sender: "spoofed".into(),
            target: String::new(),
            content: "hi".into(),
        };
        msg.set_sender("a1b2c3d4");
        assert_eq!(msg.sender(), "a1b2c3d4");
    }

    #[test]
    fn server_sender_compares_case_insensitively() {
        assert!(is_server_sender(SERVER_SENDER));
        assert!(is_server_sender(UPLOAD_CONFIRMED_SENDER));
        assert!(!is_server_sender("a1b2c3d4"));
    }

    #[test]
    fn targets_only_on_routable_kinds() {
        let chat = Message::Chat {
            sender: "a".into(),
            target: "b".into(),
            content: "x".into(),
        };
        assert_eq!(chat.target(), Some("b"));
        let connect = Message::Connect {
            sender: "a".into(),
            client_name: "alice".into(),
        };
        assert_eq!(connect.target(), None);
    }
}
