pub mod backend;
pub mod config;
pub mod relay;
pub mod sink;

pub use config::{RelayConfig, RelayMode};
pub use relay::bridge::ConnectivityBridge;
pub use relay::engine::{Engine, EngineHandle};
pub use relay::registry::SessionRegistry;
pub use relay::supervisor::{ReadinessCell, ReadinessSupervisor};
pub use relay::types::{GenerationChunk, PullProgress, ReadinessState, RelayError, TransportState};
