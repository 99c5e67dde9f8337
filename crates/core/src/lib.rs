pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod key;
pub mod message;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};
pub use events::EventEmitter;
pub use ids::{ChannelId, LinkId};
pub use key::{CompositeKey, KeyField, TabKey, WindowKey};
pub use message::{AnnounceFrame, DeferMessage, ExtraArgs, ResolveMessage};
pub use paths::Paths;
