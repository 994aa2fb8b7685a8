//! Server-side wire protocol core for the Scrutiny embedded debugging
//! framework: framing and payload codecs for the Scrutiny device protocol,
//! the connection lifecycle state machines (discover, connect, heartbeat,
//! info poll), priority-queued request dispatch under bitrate throttling,
//! and the datastore reconciliation pollers.

pub mod api;
pub mod blocks;
pub mod codec;
pub mod comm;
pub mod config;
pub mod crc;
pub mod datastore;
pub mod device;
pub mod dispatcher;
pub mod link;
pub mod memory_reader;
pub mod memory_writer;
pub mod protocol;
pub mod server;
pub mod throttler;
pub mod timebase;
