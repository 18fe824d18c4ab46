#![forbid(unsafe_code)]

//! Tether file-transfer core.
//!
//! Chunk scheduling with aging and rate adaptation, an append-with-holes
//! partial writer, ranged providers, the demultiplexer tying them
//! together, share lists, and the item-level request/offer protocol with
//! its borrow lifecycle.

pub mod chunks;
pub mod creator;
pub mod demux;
pub mod group;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod share;
pub mod state;
pub mod wire;

use std::sync::Arc;

use tracing::debug;

use tether_core::{DirectoryId, FileHash, PeerId};
use tether_stream::{RawMessage, Service, ServiceMux};

use demux::{search_flags, DataDemux};
use scheduler::DataSender;
use wire::{
    ChunkData, ChunkRequest, SERVICE_FILE_DATA, SUBTYPE_CHUNK_DATA, SUBTYPE_CHUNK_REQUEST,
};

/// Bridges the demultiplexer onto the service multiplexer: inbound chunk
/// records feed the demux queues, outbound requests and data become wire
/// records.
pub struct FileTransferService {
    demux: Arc<DataDemux>,
}

impl FileTransferService {
    pub fn new(demux: Arc<DataDemux>) -> Arc<Self> {
        Arc::new(Self { demux })
    }
}

impl Service for FileTransferService {
    fn service_id(&self) -> u16 {
        SERVICE_FILE_DATA
    }

    fn receive(&self, msg: RawMessage) {
        match msg.subtype {
            SUBTYPE_CHUNK_DATA => match wire::decode::<ChunkData>(&msg.body) {
                Ok(chunk) => match FileHash::new(&chunk.hash) {
                    Ok(hash) => self.demux.recv_data(msg.from, hash, chunk.offset, chunk.data),
                    Err(e) => debug!("chunk data with bad hash from {}: {e}", msg.from),
                },
                Err(e) => debug!("malformed chunk data from {}: {e}", msg.from),
            },
            SUBTYPE_CHUNK_REQUEST => match wire::decode::<ChunkRequest>(&msg.body) {
                Ok(request) => match FileHash::new(&request.hash) {
                    Ok(hash) => self.demux.recv_request(
                        msg.from,
                        hash,
                        request.size,
                        request.offset,
                        request.chunk_size,
                        search_flags::TEMP | search_flags::CATALOG | search_flags::OFF_CATALOG,
                    ),
                    Err(e) => debug!("chunk request with bad hash from {}: {e}", msg.from),
                },
                Err(e) => debug!("malformed chunk request from {}: {e}", msg.from),
            },
            other => debug!("unknown file-data subtype {other:#06x} from {}", msg.from),
        }
    }
}

/// [`DataSender`] over the service multiplexer. Records for friends
/// without a live channel are dropped; the scheduler re-requests after
/// aging, and providers simply answer the next request.
pub struct MuxDataSender {
    mux: Arc<ServiceMux>,
    own_peer_id: PeerId,
}

impl MuxDataSender {
    pub fn new(mux: Arc<ServiceMux>, own_peer_id: PeerId) -> Arc<Self> {
        Arc::new(Self { mux, own_peer_id })
    }
}

impl DataSender for MuxDataSender {
    fn send_chunk_request(
        &self,
        peer: DirectoryId,
        hash: &FileHash,
        size: u64,
        offset: u64,
        chunk_size: u32,
    ) {
        let request = ChunkRequest {
            peer_id: self.own_peer_id,
            hash: hash.to_string(),
            size,
            offset,
            chunk_size,
        };
        let Ok(body) = wire::encode(&request) else {
            return;
        };
        if let Err(e) = self
            .mux
            .queue_message(peer, SERVICE_FILE_DATA, SUBTYPE_CHUNK_REQUEST, &body)
        {
            debug!("chunk request to {peer} dropped: {e}");
        }
    }

    fn send_chunk_data(
        &self,
        peer: DirectoryId,
        hash: &FileHash,
        size: u64,
        offset: u64,
        data: Vec<u8>,
    ) {
        let chunk = ChunkData {
            peer_id: self.own_peer_id,
            hash: hash.to_string(),
            size,
            offset,
            data,
        };
        let Ok(body) = wire::encode(&chunk) else {
            return;
        };
        if let Err(e) = self
            .mux
            .queue_message(peer, SERVICE_FILE_DATA, SUBTYPE_CHUNK_DATA, &body)
        {
            debug!("chunk data to {peer} dropped: {e}");
        }
    }
}
