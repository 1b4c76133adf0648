//! Lifecycle events emitted by the transaction pipeline.
//!
//! Every submission gets a correlation id and emits, in order:
//! `preparing`, then either a terminal error or `awaiting-wallet-signature`,
//! `waiting-for-confirmation` and finally one terminal state. Exactly one
//! terminal state is emitted per submission.

use std::{fmt::Display, sync::Arc};

use log::{error, info};
use solana_sdk::signature::Signature;
use tokio::sync::broadcast;

/// Named states of a single submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Preparing,
    AwaitingWalletSignature,
    WaitingForConfirmation { signature: Signature },
    Confirmed { signature: Signature },
    ErrorWalletNotConnected,
    ErrorSimulationFailed { message: String },
    ErrorTransactionSendFailed { message: String },
    ErrorTransactionFailed { message: String },
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Preparing => "preparing",
            LifecycleState::AwaitingWalletSignature => "awaiting-wallet-signature",
            LifecycleState::WaitingForConfirmation { .. } => "waiting-for-confirmation",
            LifecycleState::Confirmed { .. } => "confirmed",
            LifecycleState::ErrorWalletNotConnected => "error-wallet-not-connected",
            LifecycleState::ErrorSimulationFailed { .. } => "error-simulation-failed",
            LifecycleState::ErrorTransactionSendFailed { .. } => "error-transaction-send-failed",
            LifecycleState::ErrorTransactionFailed { .. } => "error-transaction-failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            LifecycleState::Preparing
                | LifecycleState::AwaitingWalletSignature
                | LifecycleState::WaitingForConfirmation { .. }
        )
    }

    pub fn is_error(&self) -> bool {
        self.is_terminal() && !matches!(self, LifecycleState::Confirmed { .. })
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::WaitingForConfirmation { signature }
            | LifecycleState::Confirmed { signature } => write!(f, "{} ({signature})", self.name()),
            LifecycleState::ErrorSimulationFailed { message }
            | LifecycleState::ErrorTransactionSendFailed { message }
            | LifecycleState::ErrorTransactionFailed { message } => {
                write!(f, "{}: {message}", self.name())
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// One entry in a submission's event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub correlation_id: String,
    pub label: String,
    pub state: LifecycleState,
}

/// Receives every lifecycle event, in emission order per submission.
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Default listener: writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl LifecycleListener for LogListener {
    fn on_event(&self, event: &LifecycleEvent) {
        if event.state.is_error() {
            error!("[{}] {}: {}", event.correlation_id, event.label, event.state);
        } else {
            info!("[{}] {}: {}", event.correlation_id, event.label, event.state);
        }
    }
}

/// Fans events out to any number of `broadcast` receivers.
///
/// Receivers that lag behind lose the oldest events, per `broadcast`
/// semantics; sending with no receivers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastListener {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl LifecycleListener for BroadcastListener {
    fn on_event(&self, event: &LifecycleEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Client-generated identifier tying together one submission's events.
pub fn new_correlation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Emitter for a single submission.
pub(crate) struct Lifecycle {
    correlation_id: String,
    label: String,
    listener: Arc<dyn LifecycleListener>,
}

impl Lifecycle {
    /// Assign a correlation id and emit `preparing`.
    pub(crate) fn begin(label: &str, listener: Arc<dyn LifecycleListener>) -> Self {
        let lifecycle = Self {
            correlation_id: new_correlation_id(),
            label: label.to_string(),
            listener,
        };
        lifecycle.emit(LifecycleState::Preparing);
        lifecycle
    }

    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn emit(&self, state: LifecycleState) {
        self.listener.on_event(&LifecycleEvent {
            correlation_id: self.correlation_id.clone(),
            label: self.label.clone(),
            state,
        });
    }
}
