//! Thread-pinned command execution
//!
//! `setns` changes the namespace of one OS thread only. A command therefore
//! runs on a single-threaded Tokio runtime owned by the calling thread: every
//! task it spawns, including netlink connection tasks, is polled on that
//! thread, and nothing else is scheduled there while a namespace context is
//! open. The runtime is created per command and torn down when it returns.

use std::future::Future;
use tracing::debug;

/// Exclusive use of the calling thread for one command invocation.
pub struct PinnedRuntime {
    runtime: tokio::runtime::Runtime,
}

impl PinnedRuntime {
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Drive `command` to completion on this thread.
    ///
    /// `command` need not be `Send`; namespace contexts held across awaits
    /// are what makes most command futures `!Send`.
    pub fn run<F: Future>(self, command: F) -> F::Output {
        debug!("Running command on thread {:?}", std::thread::current().id());
        let output = self.runtime.block_on(command);
        drop(self.runtime);
        output
    }
}
