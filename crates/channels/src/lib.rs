pub mod dialer;
pub mod discovery;
pub mod listener;
pub mod multiplexer;
pub mod peer;
pub mod provider;
pub mod registry;
pub mod server;

pub use dialer::DialerProvider;
pub use discovery::{DiscoveryEvent, DiscoveryState, HttpProbe, PortDiscoverer, Probe};
pub use listener::ListenerProvider;
pub use multiplexer::Multiplexer;
pub use peer::PeerHost;
pub use provider::{ChannelProvider, ProviderEvent};
pub use registry::{ChannelRegistry, PeerSummary};
pub use server::ListenerState;
