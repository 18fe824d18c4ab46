//! Wire records carried by the file-transfer and request/offer services.
//!
//! Records ride the encrypted stream prefixed with a 2-byte service id
//! and 2-byte subtype (see the stream layer); bodies are bincode.

use serde::{Deserialize, Serialize};

use tether_core::{Error, PeerId, Result};

/// Service id for chunk data and chunk requests.
pub const SERVICE_FILE_DATA: u16 = 0x0011;
/// Service id for the item-level request/offer protocol.
pub const SERVICE_EXCHANGE: u16 = 0x0012;
/// Service id for the lightweight keepalive exchanged by connected peers.
pub const SERVICE_HEARTBEAT: u16 = 0x0001;

/// Subtypes within [`SERVICE_FILE_DATA`].
pub const SUBTYPE_CHUNK_DATA: u16 = 0x0001;
pub const SUBTYPE_CHUNK_REQUEST: u16 = 0x0002;

/// Subtypes within [`SERVICE_EXCHANGE`].
pub const SUBTYPE_ITEM_REQUEST: u16 = 0x0001;
pub const SUBTYPE_ITEM_RESPONSE: u16 = 0x0002;
pub const SUBTYPE_SUGGESTION: u16 = 0x0003;
pub const SUBTYPE_BORROW_COMPLETE: u16 = 0x0004;
pub const SUBTYPE_RETURN_COMPLETE: u16 = 0x0005;

/// Ask a peer for a byte range of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRequest {
    pub peer_id: PeerId,
    /// 40-hex file hash.
    pub hash: String,
    /// Total file size, so the receiver can create a provider cold.
    pub size: u64,
    pub offset: u64,
    pub chunk_size: u32,
}

/// A byte range of a file, answering a [`ChunkRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkData {
    pub peer_id: PeerId,
    pub hash: String,
    pub size: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// One file inside an item response or suggestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// Item-level request: resolve `item_id` into something concrete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemRequest {
    pub item_id: u32,
    pub display_name: String,
}

/// What an item resolved to on the owner's side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Concrete downloadable files.
    FileSet { files: Vec<FileMeta> },
    /// An offer to lend; accepting starts a borrow download.
    LendOffer { files: Vec<FileMeta>, borrow_key: String },
    /// The item opens a chat instead of resolving to files.
    Chat,
    /// The item is a plain message for the requester.
    Message { text: String },
    /// Currently lent to someone else.
    LentOut,
    /// The id does not exist on this peer.
    NoSuchItem,
    /// The owner has not matched the item to files yet.
    Unmatched,
    /// The item's files are missing or failed to hash.
    BrokenMatch,
    /// Resolution failed internally.
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemResponse {
    pub item_id: u32,
    pub title: String,
    pub outcome: ItemOutcome,
}

/// Unsolicited recommendation of a file set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suggestion {
    pub title: String,
    pub files: Vec<FileMeta>,
}

/// Borrower finished downloading: the lender may delete its local copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BorrowComplete {
    pub borrow_key: String,
}

/// Borrower acknowledges the return went through; the lender restores
/// the item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReturnComplete {
    pub borrow_key: String,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::protocol(format!("encode: {e}")))
}

pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| Error::protocol(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_request_roundtrip() {
        let req = ChunkRequest {
            peer_id: PeerId([7u8; 20]),
            hash: "ab".repeat(20),
            size: 100_000,
            offset: 8192,
            chunk_size: 8192,
        };
        let bytes = encode(&req).unwrap();
        let back: ChunkRequest = decode(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn item_outcome_variants_roundtrip() {
        for outcome in [
            ItemOutcome::Chat,
            ItemOutcome::LentOut,
            ItemOutcome::NoSuchItem,
            ItemOutcome::Message {
                text: "hi".to_string(),
            },
            ItemOutcome::LendOffer {
                files: vec![FileMeta {
                    name: "a.bin".into(),
                    hash: "cd".repeat(20),
                    size: 9,
                }],
                borrow_key: "k1".into(),
            },
        ] {
            let response = ItemResponse {
                item_id: 3,
                title: "t".into(),
                outcome,
            };
            let bytes = encode(&response).unwrap();
            let back: ItemResponse = decode(&bytes).unwrap();
            assert_eq!(back, response);
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode::<ItemResponse>(&[0xFF; 3]).is_err());
    }
}
