//! Polling a submitted signature until it is confirmed, fails, or its
//! blockhash expires.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use log::{debug, warn};
use solana_sdk::{commitment_config::CommitmentConfig, signature::Signature};

use crate::transaction::{
    SignatureState, TransactionRpc,
    error::{TransactionPipelineError, classify_transaction_error},
};

/// Poll intervals for confirmation. Intervals grow exponentially from
/// `initial_interval` up to `max_interval`; a `multiplier` of 1 gives a fixed
/// interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmationConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Consecutive failed status polls tolerated before giving up.
    pub max_poll_errors: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(4000),
            multiplier: 1.5,
            max_poll_errors: 10,
        }
    }
}

impl ConfirmationConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval.max(self.initial_interval))
            .with_multiplier(self.multiplier.max(1.0))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Wait until `signature` reaches `commitment`.
///
/// Expiry is checked after every status poll: once the current block height
/// is above `last_valid_block_height`, the transaction can no longer land.
pub(crate) async fn await_confirmation(
    rpc: &dyn TransactionRpc,
    signature: &Signature,
    last_valid_block_height: u64,
    commitment: CommitmentConfig,
    config: &ConfirmationConfig,
) -> Result<(), TransactionPipelineError> {
    let mut backoff = config.backoff();
    let mut poll_errors = 0;

    loop {
        match rpc.signature_status(signature, commitment).await {
            Ok(Some(SignatureState {
                confirmed: true,
                err,
                slot,
            })) => {
                debug!("Transaction {signature} reached {commitment:?} at slot {slot}");
                return match err {
                    None => Ok(()),
                    Some(err) => Err(TransactionPipelineError::TransactionFailed {
                        signature: *signature,
                        message: classify_transaction_error(&err, &[]),
                    }),
                };
            }
            Ok(_) => poll_errors = 0,
            Err(e) => {
                poll_errors += 1;
                warn!("Status poll {poll_errors} for {signature} failed: {e}");
            }
        }

        match rpc.block_height(commitment).await {
            Ok(height) if height > last_valid_block_height => {
                return Err(TransactionPipelineError::BlockhashExpired {
                    signature: *signature,
                    last_valid_block_height,
                });
            }
            Ok(_) => {}
            Err(e) => {
                poll_errors += 1;
                warn!("Block height poll for {signature} failed: {e}");
            }
        }

        if poll_errors > config.max_poll_errors {
            return Err(TransactionPipelineError::TransactionFailed {
                signature: *signature,
                message: format!("status unavailable after {poll_errors} failed polls"),
            });
        }

        let delay = backoff.next_backoff().unwrap_or(config.max_interval);
        tokio::time::sleep(delay).await;
    }
}
