//! loraptor-services: connections, the connection registry, and the
//! transport gateway seam.

pub mod buffer;
pub mod connection;
pub mod loopback;
pub mod registry;
pub mod transport;

pub use buffer::MessageBuffer;
pub use connection::Connection;
pub use loopback::{LoopbackGateway, LoopbackMesh, SentFrame};
pub use registry::{ConnectionRegistry, FrameOutcome, RegistryError, SweepReport};
pub use transport::{GatewayCallbacks, TransportError, TransportGateway};
