//! # uniproc: single-instance process coordination
//!
//! Lets independently, simultaneously launched processes of the same logical
//! application agree on exactly one **primary** and treat all others as
//! **secondaries**, and lets secondaries exchange request/reply byte messages
//! with the primary over a local socket. The classic consumer is a desktop
//! application that must not run twice ("open the file in the already-running
//! window"), but the mechanism covers any single-writer coordination problem
//! across OS processes on one host.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   election    ┌──────────────────┐   election   ┌──────────────┐
//! │  Process A   ├──────────────►│  Coordination    │◄─────────────┤  Process B   │
//! │  (primary)   │               │  Segment         │              │ (secondary)  │
//! │              │               │  /dev/shm block  │              │              │
//! │  IpcServer   │               │  + checksum      │              │  IpcClient   │
//! └──────┬───────┘               └──────────────────┘              └──────┬───────┘
//!        │                                                                │
//!        │                 framed messages over local socket              │
//!        └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Startup runs the same election in every process: the shared block is read
//! under a cross-process lock; a consistent read with no live primary claims
//! the primary role, any other consistent read admits the process as a
//! secondary with a fresh instance id. An inconsistent checksum is the crash
//! signal of a writer that died mid-update; after a bounded staleness window
//! the block is reinitialized rather than hanging forever. Between retries
//! each process sleeps a jittered interval so racing processes do not collide
//! in lockstep.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::ops::ControlFlow;
//! use uniproc::{InstanceCoordinator, StartOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = StartOptions::new("com.example.editor")
//!     .allow_secondary(true)
//!     .secondary_notification(true)
//!     .timeout_ms(1000);
//!
//! let mut coordinator = InstanceCoordinator::start(options)?;
//!
//! if coordinator.is_primary() {
//!     coordinator.admit_loop(|server, message| {
//!         println!("secondary {} says {:?}", message.origin_id, message.payload);
//!         server.reply_to(message.origin_id, b"ack", 500);
//!         ControlFlow::Continue(())
//!     })?;
//! } else {
//!     coordinator.send_message(b"open: /tmp/file.txt", 500);
//!     let reply = coordinator.wait_for_reply(500);
//!     println!("primary replied {:?}", reply);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! This is not a message bus and not a persistent queue: topology is strictly
//! primary↔secondary, undelivered messages are dropped, and the boolean
//! returns of [`InstanceCoordinator::send_message`] /
//! [`InstanceCoordinator::reply_message`] are the only delivery signal.
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, CoordError>`. Coordination
//! being unavailable is fatal by design:
//!
//! ```rust,no_run
//! use uniproc::{CoordError, InstanceCoordinator, StartOptions};
//!
//! match InstanceCoordinator::start(StartOptions::new("com.example.editor")) {
//!     Ok(_coordinator) => { /* resolved */ }
//!     Err(CoordError::StorageUnavailable { name, .. }) => {
//!         eprintln!("cannot coordinate: segment {} unusable", name);
//!         std::process::exit(uniproc::EXIT_COORDINATION_FAILURE);
//!     }
//!     Err(e) => eprintln!("startup failed: {}", e),
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative per process. The server multiplexes its
//! connections with `poll(2)` on the caller's thread; client calls block
//! their caller up to an explicit timeout. The shared block is the only
//! resource touched by more than one process, always inside the segment
//! lock, and critical sections never perform socket I/O.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod client;
pub mod codec;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod naming;
pub mod platform;
pub mod segment;
pub mod server;

pub use block::{BLOCK_LEN, CoordinationBlock};
pub use client::IpcClient;
pub use codec::{FrameDecoder, Message, MessageKind};
pub use coordinator::{
    EXIT_COORDINATION_FAILURE, EXIT_DUPLICATE_INSTANCE, InstanceCoordinator, Role, StartOptions,
};
pub use election::{ElectionConfig, JITTER_MAX_MS, JITTER_MIN_MS, Resolution, STALENESS_TIMEOUT};
pub use error::{CoordError, CoordResult};
pub use segment::{ConsistentRead, CoordinationSegment, SegmentOrigin};
pub use server::{Incoming, IpcServer};

/// Initialize tracing for coordination diagnostics
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
