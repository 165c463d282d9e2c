pub mod broker;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod events;
pub mod logging;
pub mod presence;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod side_store;
pub mod storage;
pub mod transport;
