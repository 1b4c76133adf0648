//! Transaction submission pipeline.
//!
//! `TransactionSender::send` walks a submission through
//! build → simulate → sign and send → confirm, emitting a lifecycle event at
//! each step, and on confirmation invalidates and refetches every account the
//! transaction could have written so the shared cache reflects the write.

pub mod confirmation;
pub mod error;
pub mod lifecycle;

use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashSet;
use async_trait::async_trait;
use log::{debug, warn};
use solana_client::{
    client_error::ClientError,
    rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig},
};
use solana_hash::Hash;
use solana_instruction::Instruction;
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    message::{AddressLookupTableAccount, Message, VersionedMessage, v0},
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::{TransactionError, VersionedTransaction},
};

use crate::{
    account_caching::AccountsCache,
    transaction::{
        confirmation::{ConfirmationConfig, await_confirmation},
        error::{TransactionPipelineError, classify_transaction_error},
        lifecycle::{Lifecycle, LifecycleListener, LifecycleState, LogListener},
    },
};

/// Largest serialized transaction the network accepts.
pub const MAX_TRANSACTION_SIZE: usize = 1232;

/// Outcome of a pre-flight simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub err: Option<TransactionError>,
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
}

/// Status of a submitted signature as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureState {
    pub slot: u64,
    pub err: Option<TransactionError>,
    /// Whether the status satisfies the requested commitment.
    pub confirmed: bool,
}

/// The RPCs the pipeline depends on.
#[async_trait]
pub trait TransactionRpc: Send + Sync + 'static {
    /// Latest blockhash and the last block height at which it is valid.
    async fn latest_blockhash(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<(Hash, u64), ClientError>;

    async fn simulate(
        &self,
        transaction: &VersionedTransaction,
        commitment: CommitmentConfig,
    ) -> Result<SimulationReport, ClientError>;

    /// `None` while the cluster has not seen the signature.
    async fn signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<Option<SignatureState>, ClientError>;

    async fn block_height(&self, commitment: CommitmentConfig) -> Result<u64, ClientError>;
}

#[async_trait]
impl TransactionRpc for RpcClient {
    async fn latest_blockhash(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<(Hash, u64), ClientError> {
        self.get_latest_blockhash_with_commitment(commitment).await
    }

    async fn simulate(
        &self,
        transaction: &VersionedTransaction,
        commitment: CommitmentConfig,
    ) -> Result<SimulationReport, ClientError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: false,
            commitment: Some(commitment),
            ..RpcSimulateTransactionConfig::default()
        };
        let response = self
            .simulate_transaction_with_config(transaction, config)
            .await?;

        Ok(SimulationReport {
            err: response.value.err,
            logs: response.value.logs.unwrap_or_default(),
            units_consumed: response.value.units_consumed,
        })
    }

    async fn signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<Option<SignatureState>, ClientError> {
        let response = self.get_signature_statuses(&[*signature]).await?;
        Ok(response
            .value
            .into_iter()
            .next()
            .flatten()
            .map(|status| SignatureState {
                slot: status.slot,
                confirmed: status.satisfies_commitment(commitment),
                err: status.err,
            }))
    }

    async fn block_height(&self, commitment: CommitmentConfig) -> Result<u64, ClientError> {
        self.get_block_height_with_commitment(commitment).await
    }
}

/// Error returned by a [`TransactionSigner`].
pub type SignerError = Box<dyn std::error::Error + Send + Sync>;

/// External signer performing a combined sign-and-send.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Fee payer and signing authority.
    fn pubkey(&self) -> Pubkey;

    async fn sign_and_send(&self, message: VersionedMessage) -> Result<Signature, SignerError>;
}

/// [`TransactionSigner`] holding a local keypair and submitting over RPC.
pub struct KeypairSigner {
    keypair: Keypair,
    rpc: Arc<RpcClient>,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair, rpc: Arc<RpcClient>) -> Self {
        Self { keypair, rpc }
    }
}

#[async_trait]
impl TransactionSigner for KeypairSigner {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_and_send(&self, message: VersionedMessage) -> Result<Signature, SignerError> {
        let transaction = VersionedTransaction::try_new(message, &[&self.keypair])?;
        // Pre-flight already ran in the pipeline unless the caller skipped it.
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            ..RpcSendTransactionConfig::default()
        };
        let signature = self
            .rpc
            .send_transaction_with_config(&transaction, config)
            .await?;
        Ok(signature)
    }
}

/// Settings shared by every submission of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub commitment: CommitmentConfig,
    /// Simulate before signing unless a submission opts out.
    pub simulate: bool,
    pub confirmation: ConfirmationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            commitment: CommitmentConfig::confirmed(),
            simulate: true,
            confirmation: ConfirmationConfig::default(),
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub compute_unit_limit: Option<u32>,
    /// Priority fee in micro-lamports per compute unit.
    pub compute_unit_price: Option<u64>,
    /// Compile a v0 message against these tables when non-empty.
    pub lookup_tables: Vec<AddressLookupTableAccount>,
    pub skip_simulation: bool,
    /// Refetch written accounts before `send` returns instead of in the
    /// background.
    pub wait_for_account_refetch: bool,
}

struct Confirmed {
    signature: Signature,
    writable: Vec<Pubkey>,
}

/// The transaction lifecycle pipeline.
pub struct TransactionSender {
    rpc: Arc<dyn TransactionRpc>,
    accounts: Arc<dyn AccountsCache>,
    signer: RwLock<Option<Arc<dyn TransactionSigner>>>,
    listener: Arc<dyn LifecycleListener>,
    config: PipelineConfig,
}

impl TransactionSender {
    pub fn new(
        rpc: Arc<dyn TransactionRpc>,
        accounts: Arc<dyn AccountsCache>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            rpc,
            accounts,
            signer: RwLock::new(None),
            listener: Arc::new(LogListener),
            config,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn bind_signer(&self, signer: Arc<dyn TransactionSigner>) {
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = Some(signer);
    }

    pub fn unbind_signer(&self) {
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn signer(&self) -> Option<Arc<dyn TransactionSigner>> {
        self.signer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submit `instructions` and wait for confirmation.
    ///
    /// Emits exactly one terminal lifecycle event. On success the written
    /// accounts are invalidated and refetched; a refetch failure is logged and
    /// never turns a confirmed transaction into an error.
    pub async fn send(
        &self,
        label: &str,
        instructions: Vec<Instruction>,
        options: SendOptions,
    ) -> Result<Signature, TransactionPipelineError> {
        let lifecycle = Lifecycle::begin(label, Arc::clone(&self.listener));

        match self.submit(&lifecycle, instructions, &options).await {
            Ok(Confirmed {
                signature,
                writable,
            }) => {
                lifecycle.emit(LifecycleState::Confirmed { signature });
                self.refetch_written(
                    lifecycle.correlation_id(),
                    writable,
                    options.wait_for_account_refetch,
                )
                .await;
                Ok(signature)
            }
            Err(e) => {
                lifecycle.emit(e.terminal_state());
                Err(e)
            }
        }
    }

    async fn submit(
        &self,
        lifecycle: &Lifecycle,
        instructions: Vec<Instruction>,
        options: &SendOptions,
    ) -> Result<Confirmed, TransactionPipelineError> {
        let signer = self
            .signer()
            .ok_or(TransactionPipelineError::WalletNotConnected)?;
        let payer = signer.pubkey();

        let instructions = with_compute_budget(instructions, options);
        let writable = writable_accounts(&payer, &instructions);

        let (blockhash, last_valid_block_height) = self
            .rpc
            .latest_blockhash(self.config.commitment)
            .await
            .map_err(TransactionPipelineError::BlockhashUnavailable)?;

        let message = compile_message(&payer, &instructions, &options.lookup_tables, blockhash)?;
        let unsigned = unsigned_transaction(message.clone());
        check_transaction_size(&unsigned)?;

        if self.config.simulate && !options.skip_simulation {
            self.simulate(&unsigned).await?;
        }

        lifecycle.emit(LifecycleState::AwaitingWalletSignature);
        let signature = signer
            .sign_and_send(message)
            .await
            .map_err(|e| TransactionPipelineError::SendFailed(e.to_string()))?;

        lifecycle.emit(LifecycleState::WaitingForConfirmation { signature });
        await_confirmation(
            self.rpc.as_ref(),
            &signature,
            last_valid_block_height,
            self.config.commitment,
            &self.config.confirmation,
        )
        .await?;

        Ok(Confirmed {
            signature,
            writable,
        })
    }

    async fn simulate(&self, transaction: &VersionedTransaction) -> Result<(), TransactionPipelineError> {
        let report = self
            .rpc
            .simulate(transaction, self.config.commitment)
            .await
            .map_err(|e| TransactionPipelineError::SimulationFailed {
                message: format!("simulation request failed: {e}"),
                logs: Vec::new(),
            })?;

        match report.err {
            None => {
                debug!(
                    "Simulation consumed {:?} compute units, {} log lines",
                    report.units_consumed,
                    report.logs.len()
                );
                Ok(())
            }
            Some(err) => {
                for line in &report.logs {
                    debug!("  {line}");
                }
                Err(TransactionPipelineError::SimulationFailed {
                    message: classify_transaction_error(&err, &report.logs),
                    logs: report.logs,
                })
            }
        }
    }

    async fn refetch_written(&self, correlation_id: &str, writable: Vec<Pubkey>, wait: bool) {
        self.accounts.invalidate_many(&writable);

        let accounts = Arc::clone(&self.accounts);
        let correlation_id = correlation_id.to_string();
        let refetch = async move {
            let results = accounts.get_accounts(&writable).await;
            for (pubkey, result) in writable.iter().zip(results) {
                if let Err(e) = result {
                    warn!("[{correlation_id}] Failed to refetch {pubkey} after confirmation: {e}");
                }
            }
        };

        if wait {
            refetch.await;
        } else {
            tokio::spawn(refetch);
        }
    }
}

fn with_compute_budget(instructions: Vec<Instruction>, options: &SendOptions) -> Vec<Instruction> {
    let mut budgeted = Vec::with_capacity(instructions.len() + 2);
    if let Some(limit) = options.compute_unit_limit {
        budgeted.push(ComputeBudgetInstruction::set_compute_unit_limit(limit));
    }
    if let Some(price) = options.compute_unit_price {
        budgeted.push(ComputeBudgetInstruction::set_compute_unit_price(price));
    }
    budgeted.extend(instructions);
    budgeted
}

/// Fee payer followed by every writable instruction account, deduplicated,
/// in first-seen order.
pub fn writable_accounts(payer: &Pubkey, instructions: &[Instruction]) -> Vec<Pubkey> {
    let mut seen = AHashSet::new();
    std::iter::once(*payer)
        .chain(
            instructions
                .iter()
                .flat_map(|ix| ix.accounts.iter())
                .filter(|meta| meta.is_writable)
                .map(|meta| meta.pubkey),
        )
        .filter(|pubkey| seen.insert(*pubkey))
        .collect()
}

fn compile_message(
    payer: &Pubkey,
    instructions: &[Instruction],
    lookup_tables: &[AddressLookupTableAccount],
    blockhash: Hash,
) -> Result<VersionedMessage, TransactionPipelineError> {
    if lookup_tables.is_empty() {
        return Ok(VersionedMessage::Legacy(Message::new_with_blockhash(
            instructions,
            Some(payer),
            &blockhash,
        )));
    }

    v0::Message::try_compile(payer, instructions, lookup_tables, blockhash)
        .map(VersionedMessage::V0)
        .map_err(|e| TransactionPipelineError::CompileFailed(e.to_string()))
}

/// A transaction with placeholder signatures, for size checks and simulation.
fn unsigned_transaction(message: VersionedMessage) -> VersionedTransaction {
    let signatures = vec![Signature::default(); message.header().num_required_signatures as usize];
    VersionedTransaction {
        signatures,
        message,
    }
}

fn check_transaction_size(transaction: &VersionedTransaction) -> Result<(), TransactionPipelineError> {
    let size = bincode::serialized_size(transaction)
        .map_err(|e| TransactionPipelineError::CompileFailed(e.to_string()))? as usize;
    if size > MAX_TRANSACTION_SIZE {
        return Err(TransactionPipelineError::TransactionTooLarge {
            size,
            limit: MAX_TRANSACTION_SIZE,
        });
    }
    Ok(())
}
