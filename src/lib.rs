// Library modules
pub mod broker;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod store;
pub mod wsserver;

// Re-export commonly used types
pub use broker::{BrokerClient, BrokerConfig};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use pool::{WorkerId, WorkerPool};
pub use processor::RequestProcessor;
pub use store::Store;
pub use wsserver::WsServer;
