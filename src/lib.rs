pub mod agent;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod store;
