pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod migrate;
pub mod packet;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod store;
