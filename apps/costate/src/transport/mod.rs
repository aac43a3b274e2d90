pub mod chunk;
pub mod codec;

pub use chunk::{
    Chunk, ChunkConfig, ChunkError, GcEvent, GcReason, IngestOutcome, Reassembled, Reassembler,
    decode_chunk, encode_chunk, split_payload,
};
pub use codec::{ChunkedCodec, Progress, ProgressFn, SIGNAL_ACTION, SIGNAL_CHUNK, SendReport};
