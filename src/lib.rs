//! huddle — small-group voice, screen share and text chat over a trusted
//! relay.
//!
//! The server (`server::run`) is a pure fan-out relay: framed control
//! messages, text and screen media over TLS, voice over UDP, never decoding
//! media. The client core (`client::Connection`) handles authentication,
//! the media pipelines, and publishes locked snapshots for a UI to render.

pub mod audio;
pub mod client;
pub mod net;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod video;
