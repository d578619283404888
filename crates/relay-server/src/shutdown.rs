//! Server-wide stop signal.
//!
//! Every session connection and in-flight chat request holds a child of
//! the root token, so one `shutdown()` closes sockets and aborts upstream
//! requests together.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root token; passing it around does not detach it.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// A token cancelled on shutdown that can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Signal shutdown, then give `tasks` up to `grace` to wind down.
    /// Returns `false` if some were still running when the grace ran out.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, grace: Duration) -> bool {
        self.shutdown();
        info!(tasks = tasks.len(), grace_secs = grace.as_secs(), "draining");

        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(?grace, "tasks still running after shutdown grace period");
                false
            }
        }
    }
}
