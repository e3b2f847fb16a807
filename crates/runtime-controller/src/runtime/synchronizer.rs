//! Per-runtime mutual exclusion of starts, plus the watch-driven waits of
//! start and stop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{EventStream, RuntimeEvent};
use crate::error::{Error, Result};
use crate::model::RuntimeIdentity;

/// Registry of starts in flight, one per runtime
#[derive(Debug, Default)]
pub struct StartSynchronizer {
    in_flight: DashMap<RuntimeIdentity, CancellationToken>,
}

impl StartSynchronizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a start; Conflict when one is already running for `identity`
    pub fn begin(self: &Arc<Self>, identity: &RuntimeIdentity) -> Result<StartGuard> {
        match self.in_flight.entry(identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Conflict(format!(
                "Runtime {identity} is already starting"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(StartGuard {
                    registry: Arc::clone(self),
                    identity: identity.clone(),
                    token,
                })
            }
        }
    }

    #[must_use]
    pub fn is_starting(&self, identity: &RuntimeIdentity) -> bool {
        self.in_flight.contains_key(identity)
    }

    /// Ask a start to give up at its next wake-up. False when none is running.
    pub fn interrupt(&self, identity: &RuntimeIdentity) -> bool {
        match self.in_flight.get(identity) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Held for the whole start; dropping it unregisters the start
#[derive(Debug)]
pub struct StartGuard {
    registry: Arc<StartSynchronizer>,
    identity: RuntimeIdentity,
    token: CancellationToken,
}

impl StartGuard {
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        self.registry.in_flight.remove(&self.identity);
    }
}

/// Wait until every workload reports ready.
///
/// Failure events, timeout, cancellation and the end of the watch all fail
/// the wait.
pub async fn await_readiness(
    mut events: EventStream,
    workloads: BTreeSet<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pending = workloads;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::infrastructure("Start interrupted"));
            }
            () = &mut deadline => {
                return Err(Error::Timeout(format!(
                    "Pods {pending:?} not ready within {}s",
                    timeout.as_secs()
                )));
            }
            event = events.next() => {
                match event {
                    Some(RuntimeEvent::PodReady { pod }) => {
                        if pending.remove(&pod) {
                            debug!(pod = %pod, remaining = pending.len(), "Pod ready");
                        }
                    }
                    Some(RuntimeEvent::PodPending { .. }) => {}
                    Some(RuntimeEvent::PodFailed { pod, reason }) => {
                        return Err(Error::infrastructure(format!("Pod '{pod}' failed: {reason}")));
                    }
                    Some(RuntimeEvent::PodDeleted { pod }) if pending.contains(&pod) => {
                        return Err(Error::infrastructure(format!("Pod '{pod}' was deleted while starting")));
                    }
                    Some(RuntimeEvent::PodDeleted { .. }) => {}
                    Some(RuntimeEvent::Unrecoverable { object, reason, message }) => {
                        return Err(Error::infrastructure(format!("{object}: {reason}: {message}")));
                    }
                    None => {
                        return Err(Error::infrastructure("Watch ended before the runtime was ready"));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Wait for the deletion of every workload. False when the grace period ran out first.
pub async fn await_deletion(mut events: EventStream, workloads: BTreeSet<String>, grace: Duration) -> bool {
    let mut remaining = workloads;
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    while !remaining.is_empty() {
        tokio::select! {
            () = &mut deadline => {
                warn!(remaining = ?remaining, "Grace period elapsed before deletion completed");
                return false;
            }
            event = events.next() => {
                match event {
                    Some(RuntimeEvent::PodDeleted { pod }) => {
                        remaining.remove(&pod);
                    }
                    Some(_) => {}
                    None => return remaining.is_empty(),
                }
            }
        }
    }
    true
}
