//! Framed worker transport
//!
//! Workers connect over TCP and exchange discrete messages delimited by a
//! begin/end marker pair. This module only moves opaque payloads; decoding
//! them into reports is the protocol module's job.
//!
//! # Modules
//!
//! - `framing`: marker encoding and incremental frame reassembly
//! - `server`: listener, per-peer reader/writer tasks, broadcast handle

pub mod framing;
pub mod server;

pub use framing::{encode_frame, FrameDecoder, FrameError, FRAME_BEGIN, FRAME_END};
pub use server::{PeerId, TransportEvent, TransportHandle, WorkerTransport};
