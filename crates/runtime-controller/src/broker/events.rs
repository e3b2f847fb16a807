//! Completion reports from plugin broker processes.
//!
//! Every broker run gets its own report token. A report is only routed to
//! the waiting start when it carries the token handed to that run's broker.

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

const REPORT_TOKEN_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerEvent {
    Started,
    Done { tooling: serde_json::Value },
    Failed { error: String },
}

/// Receiving end of one broker run
#[derive(Debug)]
pub struct BrokerSubscription {
    /// Secret the broker must present with its reports
    pub token: String,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

#[derive(Debug)]
struct Subscriber {
    token: String,
    sender: mpsc::UnboundedSender<BrokerEvent>,
}

/// Routes broker reports to the start waiting for them
#[derive(Debug, Default)]
pub struct BrokerEvents {
    subscribers: DashMap<String, Subscriber>,
}

impl BrokerEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe before deploying the broker so no report is lost.
    ///
    /// A new subscription replaces the previous one of the workspace and
    /// invalidates its token.
    pub fn subscribe(&self, workspace_id: &str) -> BrokerSubscription {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REPORT_TOKEN_LEN)
            .map(char::from)
            .collect();
        let (sender, events) = mpsc::unbounded_channel();
        self.subscribers.insert(
            workspace_id.to_string(),
            Subscriber {
                token: token.clone(),
                sender,
            },
        );
        BrokerSubscription { token, events }
    }

    pub fn unsubscribe(&self, workspace_id: &str) {
        self.subscribers.remove(workspace_id);
    }

    /// Deliver `event` to the start waiting on `workspace_id`.
    ///
    /// NotFound when nobody waits, Forbidden when `token` is not the
    /// subscription's report token.
    pub fn publish(&self, workspace_id: &str, token: &str, event: BrokerEvent) -> Result<()> {
        let Some(subscriber) = self.subscribers.get(workspace_id) else {
            debug!(workspace_id = %workspace_id, "Broker event without subscriber");
            return Err(Error::NotFound(format!(
                "No plugin broker run for workspace '{workspace_id}'"
            )));
        };
        if !bool::from(subscriber.token.as_bytes().ct_eq(token.as_bytes())) {
            return Err(Error::Forbidden(format!(
                "Invalid broker report token for workspace '{workspace_id}'"
            )));
        }
        subscriber
            .sender
            .send(event)
            .map_err(|_| Error::NotFound(format!("Plugin broker run of '{workspace_id}' has ended")))
    }
}
