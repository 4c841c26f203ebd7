//! Configuration: schema and file-backed store

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, BundlePolicy, IceServer, IceTransportPolicy, LoopbackConfig, SessionConfig,
};
pub use store::{ConfigChange, ConfigStore};
