//! Error types for the transaction pipeline, and classification of on-chain
//! failures into user-facing messages.
//!
//! Classification looks, in order, at:
//! 1. an Anchor-style `Error Message:` log line,
//! 2. a custom program error code from a well-known program,
//! 3. insufficient-funds log lines,
//! 4. well-known `TransactionError` variants,
//!
//! and falls back to the platform error's own display text.

use solana_client::client_error::ClientError;
use solana_sdk::{
    instruction::InstructionError, signature::Signature, transaction::TransactionError,
};
use thiserror::Error;

use crate::transaction::lifecycle::LifecycleState;

const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";
const TOKEN_PROGRAM: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const TOKEN_2022_PROGRAM: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

/// Errors that end a submission.
///
/// Each variant maps onto exactly one terminal lifecycle state through
/// [`TransactionPipelineError::terminal_state`].
#[derive(Debug, Error)]
pub enum TransactionPipelineError {
    /// No signer is bound to the pipeline.
    #[error("Wallet not connected")]
    WalletNotConnected,

    #[error("Failed to fetch latest blockhash")]
    BlockhashUnavailable(#[source] ClientError),

    #[error("Failed to compile transaction message: {0}")]
    CompileFailed(String),

    #[error("Transaction is {size} bytes, above the {limit} byte limit; use address lookup tables")]
    TransactionTooLarge { size: usize, limit: usize },

    /// Pre-flight rejection, with the classified cause and the program logs.
    #[error("Simulation failed: {message}")]
    SimulationFailed { message: String, logs: Vec<String> },

    /// The signer or the submit RPC failed.
    #[error("Failed to send transaction: {0}")]
    SendFailed(String),

    /// The transaction landed but execution failed, or its status could not
    /// be determined.
    #[error("Transaction {signature} failed: {message}")]
    TransactionFailed {
        signature: Signature,
        message: String,
    },

    /// The blockhash's last valid block height passed before confirmation.
    #[error("Transaction {signature} expired: block height exceeded {last_valid_block_height}")]
    BlockhashExpired {
        signature: Signature,
        last_valid_block_height: u64,
    },
}

impl TransactionPipelineError {
    /// The terminal lifecycle state reported for this failure.
    pub fn terminal_state(&self) -> LifecycleState {
        match self {
            TransactionPipelineError::WalletNotConnected => LifecycleState::ErrorWalletNotConnected,
            TransactionPipelineError::SimulationFailed { message, .. } => {
                LifecycleState::ErrorSimulationFailed {
                    message: message.clone(),
                }
            }
            TransactionPipelineError::BlockhashUnavailable(_)
            | TransactionPipelineError::CompileFailed(_)
            | TransactionPipelineError::TransactionTooLarge { .. }
            | TransactionPipelineError::SendFailed(_) => LifecycleState::ErrorTransactionSendFailed {
                message: self.to_string(),
            },
            TransactionPipelineError::TransactionFailed { message, .. } => {
                LifecycleState::ErrorTransactionFailed {
                    message: message.clone(),
                }
            }
            TransactionPipelineError::BlockhashExpired { .. } => {
                LifecycleState::ErrorTransactionFailed {
                    message: self.to_string(),
                }
            }
        }
    }
}

/// Ensures `TransactionPipelineError` satisfies `Send + Sync` at compile time.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TransactionPipelineError>();
};

/// Turn a structured transaction error plus program logs into a message a
/// user can act on.
pub fn classify_transaction_error(error: &TransactionError, logs: &[String]) -> String {
    if let Some(message) = anchor_error_message(logs) {
        return message;
    }

    if let TransactionError::InstructionError(_, InstructionError::Custom(code)) = error {
        let program = failing_program(logs);
        if let Some(message) = program.and_then(|program| known_program_error(program, *code)) {
            return message.to_string();
        }
        return match program {
            Some(program) => format!("Program {program} failed with custom error 0x{code:x}"),
            None => format!("Program failed with custom error 0x{code:x}"),
        };
    }

    if logs.iter().any(|line| {
        let line = line.to_ascii_lowercase();
        line.contains("insufficient lamports") || line.contains("insufficient funds")
    }) {
        return "Insufficient funds for this transaction".to_string();
    }

    match error {
        TransactionError::InsufficientFundsForFee => {
            "Insufficient SOL to pay the transaction fee".to_string()
        }
        TransactionError::InsufficientFundsForRent { .. } => {
            "Insufficient SOL to keep an account rent-exempt".to_string()
        }
        TransactionError::AccountNotFound => "Fee payer account does not exist".to_string(),
        TransactionError::BlockhashNotFound => {
            "Blockhash expired before the transaction landed; please retry".to_string()
        }
        TransactionError::AlreadyProcessed => "Transaction was already processed".to_string(),
        TransactionError::InstructionError(index, InstructionError::InsufficientFunds) => {
            format!("Instruction {index} failed: insufficient funds")
        }
        other => other.to_string(),
    }
}

/// The text after `Error Message:` in an Anchor error log line.
fn anchor_error_message(logs: &[String]) -> Option<String> {
    logs.iter().find_map(|line| {
        let (_, message) = line.split_once("Error Message: ")?;
        let message = message.trim().trim_end_matches('.');
        (!message.is_empty()).then(|| message.to_string())
    })
}

/// Program id from the last `Program <id> failed: ...` log line.
fn failing_program(logs: &[String]) -> Option<&str> {
    logs.iter().rev().find_map(|line| {
        let rest = line.strip_prefix("Program ")?;
        let (program, _) = rest.split_once(" failed")?;
        Some(program)
    })
}

fn known_program_error(program: &str, code: u32) -> Option<&'static str> {
    match (program, code) {
        (SYSTEM_PROGRAM, 0) => Some("Account is already in use"),
        (SYSTEM_PROGRAM, 1) => Some("Insufficient SOL balance for this transfer"),
        (SYSTEM_PROGRAM, 2) => Some("Account is not owned by the system program"),
        (SYSTEM_PROGRAM, 3) => Some("Invalid account data length"),
        (SYSTEM_PROGRAM, 4) => Some("Account data is too large"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 0) => Some("Account balance is below rent exemption"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 1) => Some("Insufficient token balance"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 2) => Some("Invalid token mint"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 3) => Some("Token account does not belong to this mint"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 4) => Some("Token account owner does not match"),
        (TOKEN_PROGRAM | TOKEN_2022_PROGRAM, 17) => Some("Token account is frozen"),
        _ => None,
    }
}
