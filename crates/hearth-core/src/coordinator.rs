use crate::channel::{resolve_endpoint, send_command, Ack, ChannelError};
use crate::concurrency::InstanceLock;
use crate::CoreError;
use hearth_schema::{CommandLine, RuntimeSection, ServiceIdentity};
use hearth_store::RuntimeLayout;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How hard a losing invocation tries to reach the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Attempts after the first one.
    pub peer_retries: u32,
    pub peer_retry_delay: Duration,
    pub ack_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&RuntimeSection::default())
    }
}

impl From<&RuntimeSection> for CoordinatorOptions {
    fn from(section: &RuntimeSection) -> Self {
        Self {
            peer_retries: section.peer_retries,
            peer_retry_delay: section.peer_retry_delay(),
            ack_timeout: section.ack_timeout(),
        }
    }
}

/// What this invocation turned out to be.
#[derive(Debug)]
pub enum Role {
    /// The instance lock is ours: run the service.
    Primary(InstanceLock),
    /// Another instance is running and acknowledged our arguments.
    Peer(Ack),
}

/// Decides between primary and peer for one service identity.
#[derive(Debug, Clone)]
pub struct Coordinator {
    identity: ServiceIdentity,
    layout: RuntimeLayout,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(identity: ServiceIdentity, layout: RuntimeLayout, options: CoordinatorOptions) -> Self {
        Self {
            identity,
            layout,
            options,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Take the instance lock, or forward `args` to whoever holds it.
    ///
    /// The holder may have the lock but not yet its command channel, and may
    /// also exit between our lock attempt and our connect; each round
    /// therefore tries the lock again before reconnecting. Gives up with
    /// [`CoreError::PrimaryUnreachable`] after `peer_retries` further rounds.
    ///
    /// Only failures to connect are retried. Once the request may have
    /// reached the primary, a missing ack fails the claim without resending.
    pub fn claim(&self, args: &CommandLine) -> Result<Role, CoreError> {
        self.layout.initialize()?;
        let attempts = self.options.peer_retries.saturating_add(1);

        for attempt in 1..=attempts {
            if let Some(lock) = InstanceLock::try_acquire(&self.layout.lock_file())? {
                info!(identity = %self.identity, "running as primary");
                return Ok(Role::Primary(lock));
            }

            let forwarded = resolve_endpoint(&self.layout, &self.identity).and_then(|endpoint| {
                send_command(&endpoint, &self.identity, args, self.options.ack_timeout)
            });
            match forwarded {
                Ok(ack) => {
                    info!(identity = %self.identity, status = ?ack.status, "forwarded arguments to primary");
                    return Ok(Role::Peer(ack));
                }
                Err(e @ (ChannelError::Connect { .. } | ChannelError::NotListening(_))) => {
                    debug!(attempt, "primary not reachable yet: {e}");
                }
                Err(e) => {
                    warn!(identity = %self.identity, "no acknowledgement from primary: {e}");
                    return Err(CoreError::Channel(e));
                }
            }

            if attempt < attempts {
                thread::sleep(self.options.peer_retry_delay);
            }
        }

        Err(CoreError::PrimaryUnreachable {
            identity: self.identity.to_string(),
            attempts,
        })
    }
}
