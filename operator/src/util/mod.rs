use std::time::Duration;
pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Requeue interval while a build pod is Ready and the build is running.
pub(crate) const BUILD_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Requeue interval for a fully converged App.
pub(crate) const APP_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Retry interval while the image-registry Service has not appeared yet.
pub(crate) const REGISTRY_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Short requeue used right after creating a child resource. The owns()
/// watches deliver the edge as well; this bounds the wait if they don't.
pub(crate) const REQUEUE_NOW: Duration = Duration::from_secs(1);

/// Upper bound on a single reconcile invocation.
pub(crate) const RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "manor-operator";
