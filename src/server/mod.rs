//! Server-side lifecycle: the catalog of declared servers, their spawned
//! processes, and the supervisor that moves them between Stopped and
//! Running.

pub mod process;
pub mod registry;
pub mod supervisor;

pub use process::{ProcessExit, ProcessHandle, SpawnedProcess};
pub use registry::{
    ServerConfig, ServerConfigUpdate, ServerDetails, ServerId, ServerInstance, ServerRegistry,
    ServerStatus, ServerSummary, SseOptions,
};
pub use supervisor::Supervisor;
