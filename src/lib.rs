pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod region;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
