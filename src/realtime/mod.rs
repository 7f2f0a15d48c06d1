pub mod events;
pub mod gateway;
pub mod sessions;

pub use gateway::{ws_handler, RealtimeGateway};
pub use sessions::SessionRegistry;
