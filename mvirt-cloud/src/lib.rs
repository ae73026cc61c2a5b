pub mod backendpool;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod cloud;
pub mod config;
pub mod disk;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod instances;
pub mod lockmap;
pub mod memory;
pub mod model;
pub mod nodes;
pub mod ratelimit;
pub mod registry;
pub mod vmset;

pub use backendpool::{BackendPool, NodeIpConfigPool, NodeIpPool, PoolReconcile};
pub use cache::{ReadMode, TimedCache};
pub use client::{ComputeClient, NetworkClient};
pub use cloud::Cloud;
pub use config::CloudConfig;
pub use disk::DiskCoordinator;
pub use error::{CloudError, Result};
pub use memory::MemoryCloud;
pub use nodes::{NodeEvent, NodeProjection};
pub use vmset::{StandaloneVmSet, UniformVmSet, VmSet};
