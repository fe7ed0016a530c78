pub mod chat;
pub mod config;
pub mod error;
pub mod models;

// Re-export the surface most embedders need.
pub use chat::{ChatController, ChatEvent, RoomState};
pub use config::ChatConfig;
pub use error::ChatError;
pub use models::*;
