//! Client runtime for a turn-based voice conversation: websocket link,
//! turn arbitration, streamed audio playback and the GUI bridge.

pub mod audio;
pub mod chunk_tracker;
pub mod config;
pub mod controller;
pub mod error;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;
pub mod transcript;
pub mod turn;
