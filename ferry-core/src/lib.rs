//! Ferry protocol library, shared by the hub and the peer client.
//!
//! The wire format is a stream of frames: a 4-byte little-endian length
//! followed by a tagged payload (see the `wire` module). `protocol` holds the
//! closed message set, `transfer` the hub-side bookkeeping for chunked file
//! transfers, `ident` the short hub-assigned peer ids, and `endpoint` the
//! tokio connection wrapper with a single reader and a serialized writer.
//!
//! `wire`, `protocol`, `ident` and `transfer` are I/O-free and usable without
//! a runtime; `endpoint` needs tokio.

pub mod endpoint;
pub mod ident;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use endpoint::{Endpoint, FrameReader, RecvError, SendError};
pub use ident::PeerId;
pub use protocol::{
    expected_chunks, is_server_sender, Kind, Message, CHUNK_SIZE, SERVER_SENDER,
    UPLOAD_CONFIRMED_SENDER,
};
pub use transfer::{
    ChunkError, ChunkOutcome, OpenError, Transfer, TransferError, TransferPhase, TransferPolicy,
    TransferRegistry, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_IDLE,
};
pub use wire::{
    decode_frame, decode_payload, encode_frame, encode_payload, FrameDecodeError,
    FrameEncodeError, MAX_FRAME_LEN,
};
