//! Streaming C/R: images travel through a helper process and are sharded
//! into checkpoint storage instead of being written to disk.

mod fs;
pub mod protocol;

pub use fs::{
    is_streamable, Mode, StreamConfig, StreamSession, StreamingFs, CAPTURE_SOCK,
    CONNECTION_TIMEOUT, INIT_PROGRESS_MSG, SERVE_SOCK, SHARD_PREFIX,
};
