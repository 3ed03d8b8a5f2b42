//! Client-side lifecycle: the catalog of connections and their state.

pub mod registry;

pub use registry::{
    ConnectionConfig, ConnectionDetails, ConnectionId, ConnectionInstance, ConnectionRegistry,
    ConnectionStatus,
};
