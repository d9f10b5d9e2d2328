//! Worker bookkeeping and the providers that run workers.
//!
//! - [`WorkerRegistry`]: the scheduler's private record of live workers
//! - [`WorkerProvider`]: launch/describe/stop interface to remote compute
//! - [`DockerProvider`]: one detached container per worker
//! - [`MemoryProvider`]: simulated workers for dry runs and tests
//!
//! # Worker lifecycle
//!
//! 1. The scheduler launches a worker for a claimed job; it is registered `Pending`
//! 2. Each tick refreshes its status from the provider
//! 3. Once its job is finished (or it turns out to be orphaned) a stop is requested
//! 4. The entry is removed after the provider reports it `Stopped`

pub mod docker;
pub mod memory;
pub mod provider;
pub mod registry;

pub use docker::DockerProvider;
pub use memory::MemoryProvider;
pub use provider::{ProviderError, ProviderWorker, WorkerProvider};
pub use registry::{RegistryError, Worker, WorkerId, WorkerRegistry, WorkerStatus};
