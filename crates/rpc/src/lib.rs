pub mod channel;
pub mod client;
pub mod procedures;
pub mod server;

pub use channel::{ChannelMessage, EventPort, MessageChannel, MessageKind, Subscription};
pub use client::{CallRequest, RpcClient};
pub use procedures::{
    BrowserPeer, BrowserProcedure, BrowserProcedures, PeerClient, PeerInfo, TabInfo, WindowInfo,
    IDENTITY_PROCEDURE,
};
pub use server::{ProcedureError, ProcedurePath, Procedures, RpcServer};
