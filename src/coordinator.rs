//! Public facade: role resolution and primary/secondary messaging
//!
//! `InstanceCoordinator::start` runs the whole bootstrap synchronously:
//! derive names, create or attach the coordination segment, resolve the role
//! under the election policy, then wire up the server (primary) or client
//! (secondary). By the time `start` returns, `is_primary`/`is_secondary` are
//! final.

use crate::client::IpcClient;
use crate::codec::MessageKind;
use crate::election::{ElectionConfig, Resolution, resolve_role};
use crate::error::CoordResult;
use crate::naming::{derive_base_name, endpoint_path, segment_name};
use crate::platform::{current_pid, current_user_name};
use crate::segment::CoordinationSegment;
use crate::server::{Incoming, IpcServer};
use std::ops::ControlFlow;
use std::path::PathBuf;

/// Process exit code when a disallowed secondary hands off to the primary.
///
/// A duplicate launch that successfully notified the running primary is a
/// success, not a failure.
pub const EXIT_DUPLICATE_INSTANCE: i32 = 0;

/// Suggested process exit code when coordination itself is unavailable
pub const EXIT_COORDINATION_FAILURE: i32 = 1;

/// Resolved role of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single authoritative instance; hosts the IPC server
    Primary,
    /// Any further instance; talks to the primary through the IPC client
    Secondary,
}

/// Startup options for [`InstanceCoordinator::start`]
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Application identifier; all cooperating processes must agree on it
    pub app_id: String,
    /// Whether resolving to secondary returns normally instead of exiting
    pub allow_secondary: bool,
    /// Whether secondaries announce themselves over a kept-open connection
    /// (and the primary keeps a connection table for replies)
    pub secondary_notification: bool,
    /// Extra bytes mixed into the derived segment/endpoint names
    pub extra_hash_data: Vec<u8>,
    /// Timeout for the secondary's initial connection to the primary, ms
    pub timeout_ms: u64,
    /// Election tunables; leave at default outside tests
    pub election: ElectionConfig,
}

impl StartOptions {
    /// Options with production defaults for the given application identifier
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            allow_secondary: false,
            secondary_notification: false,
            extra_hash_data: Vec::new(),
            timeout_ms: 1000,
            election: ElectionConfig::default(),
        }
    }

    /// Allow secondary instances to keep running
    pub fn allow_secondary(mut self, allow: bool) -> Self {
        self.allow_secondary = allow;
        self
    }

    /// Enable the secondary-notification connection mode
    pub fn secondary_notification(mut self, enabled: bool) -> Self {
        self.secondary_notification = enabled;
        self
    }

    /// Mix extra bytes into the derived names
    pub fn extra_hash_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.extra_hash_data = data.into();
        self
    }

    /// Timeout for the secondary's startup connection, in milliseconds
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Coordination handle for one process of the application.
///
/// Owns the segment handle plus either the server (primary) or the client
/// (secondary); dropped when the process is done coordinating.
pub struct InstanceCoordinator {
    _segment: CoordinationSegment,
    role: Role,
    instance_id: u32,
    primary_pid: i64,
    primary_user: String,
    endpoint: PathBuf,
    server: Option<IpcServer>,
    client: Option<IpcClient>,
}

impl InstanceCoordinator {
    /// Resolve this process's role and wire up its IPC side.
    ///
    /// Fatal coordination failures (`StorageUnavailable`,
    /// `ListenerUnavailable`) are returned for the host to terminate on;
    /// there is no degraded mode. A process that resolves to
    /// secondary while `allow_secondary` is false notifies the primary and
    /// exits with [`EXIT_DUPLICATE_INSTANCE`].
    pub fn start(options: StartOptions) -> CoordResult<Self> {
        let base = derive_base_name(&options.app_id, &options.extra_hash_data);
        let endpoint = endpoint_path(&base);

        let (mut segment, _origin) = CoordinationSegment::open_or_create(&segment_name(&base))?;

        let own_pid = current_pid();
        let own_user = current_user_name();
        let resolution = resolve_role(&mut segment, &options.election, own_pid, &own_user)?;

        match resolution {
            Resolution::Primary => {
                let server = IpcServer::bind(&endpoint, options.secondary_notification)?;
                Ok(Self {
                    _segment: segment,
                    role: Role::Primary,
                    instance_id: 0,
                    primary_pid: own_pid,
                    primary_user: own_user,
                    endpoint,
                    server: Some(server),
                    client: None,
                })
            }
            Resolution::Secondary {
                instance_id,
                primary_pid,
                primary_user,
            } => {
                if !options.allow_secondary {
                    // Hand off to the running primary and get out of the way
                    let mut client = IpcClient::new(&endpoint, instance_id);
                    if let Err(err) = client.connect(options.timeout_ms, MessageKind::NewInstance) {
                        tracing::warn!(%err, "could not notify primary of duplicate launch");
                    }
                    tracing::info!(instance_id, "duplicate instance, handing off to primary");
                    std::process::exit(EXIT_DUPLICATE_INSTANCE);
                }

                let mut client = IpcClient::new(&endpoint, instance_id);
                if options.secondary_notification {
                    if let Err(err) =
                        client.connect(options.timeout_ms, MessageKind::SecondaryInstance)
                    {
                        tracing::warn!(%err, "secondary notification connection failed");
                    }
                }

                Ok(Self {
                    _segment: segment,
                    role: Role::Secondary,
                    instance_id,
                    primary_pid,
                    primary_user,
                    endpoint,
                    server: None,
                    client: Some(client),
                })
            }
        }
    }

    /// Resolved role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this process is the primary
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Whether this process is a secondary
    pub fn is_secondary(&self) -> bool {
        self.role == Role::Secondary
    }

    /// This process's instance id; 0 for the primary, which never goes
    /// through admission
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Process id of the primary, as recorded at role resolution
    pub fn primary_pid(&self) -> i64 {
        self.primary_pid
    }

    /// User name of the primary, as recorded at role resolution
    pub fn primary_user(&self) -> &str {
        &self.primary_user
    }

    /// User name of the current process
    pub fn current_user_name(&self) -> String {
        current_user_name()
    }

    /// Endpoint path used for primary↔secondary messaging
    pub fn endpoint(&self) -> &PathBuf {
        &self.endpoint
    }

    /// Send a message to the primary (secondary role only).
    ///
    /// The primary itself has nobody to connect to and gets `false`.
    pub fn send_message(&mut self, payload: &[u8], timeout_ms: u64) -> bool {
        match self.client.as_mut() {
            Some(client) => client.send(payload, timeout_ms),
            None => false,
        }
    }

    /// Reply to a specific secondary (primary role only).
    ///
    /// `false` when no such secondary is connected or the write does not
    /// complete in time.
    pub fn reply_message(&mut self, instance_id: u32, payload: &[u8], timeout_ms: u64) -> bool {
        match self.server.as_mut() {
            Some(server) => server.reply_to(instance_id, payload, timeout_ms),
            None => false,
        }
    }

    /// Block until the primary replies or the timeout elapses (secondary role
    /// only); empty on timeout
    pub fn wait_for_reply(&mut self, timeout_ms: u64) -> Vec<u8> {
        match self.client.as_mut() {
            Some(client) => client.wait_for_reply(timeout_ms),
            None => Vec::new(),
        }
    }

    /// One server readiness pass (primary role only); empty for secondaries
    pub fn poll_messages(&mut self, timeout_ms: u64) -> CoordResult<Vec<Incoming>> {
        match self.server.as_mut() {
            Some(server) => server.poll_once(timeout_ms),
            None => Ok(Vec::new()),
        }
    }

    /// Run the primary's accept/dispatch loop until the callback breaks.
    ///
    /// No-op for secondaries.
    pub fn admit_loop<F>(&mut self, on_message: F) -> CoordResult<()>
    where
        F: FnMut(&mut IpcServer, Incoming) -> ControlFlow<()>,
    {
        match self.server.as_mut() {
            Some(server) => server.admit_loop(on_message),
            None => Ok(()),
        }
    }
}
