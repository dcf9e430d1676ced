pub mod error;
pub mod types;
pub mod telemetry;
pub mod config;
pub mod ssh;
pub mod transport;
pub mod fingerprint;
pub mod inventory;
pub mod discovery;
pub mod credentials;
pub mod playbook;
pub mod renderer;
pub mod executor;

#[cfg(test)]
mod testing;

pub use error::DeployError;
pub use types::{
    CommandResult, Credentials, ExecutionOutcome, HostKeyPolicy, RunSummary, SshTarget,
};
pub use telemetry::{tracing_sink, EventSink, MemorySink, TracingSink};
pub use config::EngineConfig;
pub use ssh::SshClient;
pub use transport::{RemoteSession, SshTransport, Transport};
pub use fingerprint::{Detection, DetectionSettings, OsFingerprinter};
pub use inventory::{Host, Inventory, InventoryStore, RegisteredUser};
pub use discovery::{DiscoveryReport, HostDiscoverer, HostProbe, NetworkProbe};
pub use credentials::{resolve_credentials, CredentialSource, CredentialSources};
pub use playbook::{list_playbooks, Playbook, Task};
pub use renderer::{PlaybookRenderer, RenderOptions};
pub use executor::TaskExecutor;

// 便捷的重新导出
pub type Result<T> = std::result::Result<T, DeployError>;
