//! Push-to-talk voice assistant core.
//!
//! The client turns key timing into sessions (`input`, `state_machine`,
//! `controller`), streams each utterance to the server (`net_link`,
//! `protocol`) and plays the reply through a single interruptible playback
//! worker (`audio`). The `server` module is the other end of the stream.

pub mod audio;
pub mod capture_bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod input;
pub mod net_link;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod tray_bridge;
