//! Line-oriented wire protocol with the host.
//!
//! The worker speaks UTF-8 NDJSON over stdio: exactly one JSON object per
//! line, bidirectional. Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing
//!   with a hard per-line size cap.
//! - `envelope`: inbound instruction parsing and outbound line shapes.
//! - `writer`: async write task that serialises outbound lines to stdout.

pub mod codec;
pub mod envelope;
pub mod writer;
