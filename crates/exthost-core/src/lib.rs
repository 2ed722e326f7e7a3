pub mod activation;
pub mod channel;
pub mod command;
pub mod contribution;
pub mod error;
pub mod event;
pub mod fault;
pub mod host_runtime;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod process_transport;
pub mod protocol;
pub mod rejection;
pub mod rpc;
pub mod settings;
pub mod supervisor;
pub mod workspace;
