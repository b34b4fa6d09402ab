pub mod agent;
pub mod auth;
pub mod blob_cache;
pub mod cache;
pub mod config;
pub mod errcode;
pub mod error;
pub mod gateway;
pub mod hostmatch;
pub mod limit;
pub mod manifest;
pub mod pathinfo;
pub mod policy;
pub mod queue;
pub mod queue_client;
pub mod storage;
pub mod token;
pub mod ttl;
pub mod upstream;

pub use agent::{Agent, AgentOptions, BlobInfo};
pub use cache::Cache;
pub use config::{AgentConfig, GatewayConfig, PolicyConfig, UpstreamConfig};
pub use error::{ProxyError, Result};
pub use gateway::{Gateway, GatewayOptions};
pub use manifest::ManifestCache;
pub use pathinfo::PathInfo;
pub use storage::{FsDriver, StorageDriver};
pub use token::{Attribute, Authenticator, Token};
pub use upstream::UpstreamClient;
