//! Hub-assigned peer identifiers.

use std::borrow::Borrow;
use std::fmt;

/// Peer id: the first 8 hex digits of a random 64-bit draw, lowercase.
/// Unique among currently connected peers (the hub redraws on collision);
/// a value may recur after its peer is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub const LEN: usize = 8;

    pub fn generate() -> Self {
        let draw: u64 = rand::random();
        let hex = format!("{draw:016x}");
        PeerId(hex[..Self::LEN].to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lets a `HashMap<PeerId, _>` be probed with the raw string off the wire.
impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
