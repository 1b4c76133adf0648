#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::StreamExt;
use solana_account::Account;
use solana_account_decoder::{UiAccount, UiAccountData, UiAccountEncoding};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_hash::Hash;
use solana_pubkey::Pubkey;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    message::VersionedMessage,
    signature::Signature,
    transaction::{TransactionError, VersionedTransaction},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ledger_sync::{
    account_caching::{
        AccountCacheError,
        rpc_cache::AccountsRpc,
        subscription::{AccountNotificationStream, AccountSubscriptionSource},
    },
    transaction::{
        SignatureState, SignerError, SimulationReport, TransactionRpc, TransactionSigner,
        lifecycle::{LifecycleEvent, LifecycleListener},
    },
};

pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn client_error(message: &str) -> ClientError {
    ClientError::from(ClientErrorKind::Custom(message.to_string()))
}

/// Poll `condition` every few milliseconds for up to a second.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn account(lamports: u64, data: &[u8], owner: Pubkey) -> Account {
    Account {
        lamports,
        data: data.to_vec(),
        owner,
        executable: false,
        rent_epoch: 0,
    }
}

pub fn ui_account(lamports: u64, data: &[u8], owner: Pubkey) -> UiAccount {
    UiAccount {
        lamports,
        data: UiAccountData::Binary(STANDARD.encode(data), UiAccountEncoding::Base64),
        owner: owner.to_string(),
        executable: false,
        rent_epoch: 0,
        space: Some(data.len() as u64),
    }
}

/// In-memory `getMultipleAccounts` backend that records every call.
#[derive(Default)]
pub struct FakeAccountsRpc {
    accounts: Mutex<HashMap<Pubkey, Account>>,
    calls: Mutex<Vec<Vec<Pubkey>>>,
    commitments: Mutex<Vec<CommitmentConfig>>,
    failures: AtomicUsize,
    failing_call: Mutex<Option<usize>>,
}

impl FakeAccountsRpc {
    pub fn with_accounts(accounts: impl IntoIterator<Item = (Pubkey, Account)>) -> Self {
        let rpc = Self::default();
        rpc.accounts.lock().unwrap().extend(accounts);
        rpc
    }

    pub fn set_account(&self, pubkey: Pubkey, account: Account) {
        self.accounts.lock().unwrap().insert(pubkey, account);
    }

    /// Fail the next `n` calls with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail only the call with this zero-based index.
    pub fn fail_call(&self, index: usize) {
        *self.failing_call.lock().unwrap() = Some(index);
    }

    pub fn calls(&self) -> Vec<Vec<Pubkey>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn commitments(&self) -> Vec<CommitmentConfig> {
        self.commitments.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountsRpc for FakeAccountsRpc {
    async fn fetch_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Vec<Option<Account>>, ClientError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(pubkeys.to_vec());
            calls.len() - 1
        };
        self.commitments.lock().unwrap().push(commitment);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || *self.failing_call.lock().unwrap() == Some(index);
        if failing {
            return Err(client_error("connection reset"));
        }

        let accounts = self.accounts.lock().unwrap();
        Ok(pubkeys.iter().map(|pubkey| accounts.get(pubkey).cloned()).collect())
    }
}

type NotificationSender = mpsc::UnboundedSender<Result<UiAccount, AccountCacheError>>;

/// Push channel backend: every `subscribe` opens a new in-memory channel.
#[derive(Default)]
pub struct FakeSubscriptionSource {
    channels: Mutex<HashMap<Pubkey, Vec<NotificationSender>>>,
    opened: AtomicUsize,
}

impl FakeSubscriptionSource {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn channels_for(&self, address: &Pubkey) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(address)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn latest(&self, address: &Pubkey) -> Option<NotificationSender> {
        self.channels
            .lock()
            .unwrap()
            .get(address)
            .and_then(|senders| senders.last().cloned())
    }

    pub fn push(&self, address: &Pubkey, account: UiAccount) -> bool {
        self.latest(address)
            .map(|sender| sender.send(Ok(account)).is_ok())
            .unwrap_or(false)
    }

    pub fn fail(&self, address: &Pubkey, reason: &str) -> bool {
        let error = AccountCacheError::SubscriptionFailed {
            address: *address,
            reason: reason.to_string(),
        };
        self.latest(address)
            .map(|sender| sender.send(Err(error)).is_ok())
            .unwrap_or(false)
    }

    /// Whether the consumer dropped the latest channel for `address`.
    pub fn is_closed(&self, address: &Pubkey) -> bool {
        self.latest(address)
            .map(|sender| sender.is_closed())
            .unwrap_or(true)
    }
}

#[async_trait]
impl AccountSubscriptionSource for FakeSubscriptionSource {
    async fn subscribe(
        &self,
        address: &Pubkey,
        _commitment: CommitmentConfig,
    ) -> Result<AccountNotificationStream, AccountCacheError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap()
            .entry(*address)
            .or_default()
            .push(sender);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

/// Scripted transaction backend.
pub struct FakeTransactionRpc {
    pub simulation: Mutex<SimulationReport>,
    /// Status answers, consumed front to back; `None` once exhausted.
    pub statuses: Mutex<VecDeque<Option<SignatureState>>>,
    pub last_valid_block_height: u64,
    /// Every status poll fails with a transport error when set.
    pub status_unavailable: bool,
    block_height: AtomicU64,
    simulations: AtomicUsize,
    status_polls: AtomicUsize,
}

impl FakeTransactionRpc {
    pub fn new(last_valid_block_height: u64) -> Self {
        Self {
            simulation: Mutex::new(SimulationReport::default()),
            statuses: Mutex::new(VecDeque::new()),
            last_valid_block_height,
            status_unavailable: false,
            block_height: AtomicU64::new(0),
            simulations: AtomicUsize::new(0),
            status_polls: AtomicUsize::new(0),
        }
    }

    /// Not seen for `pending` polls, then confirmed with `err`.
    pub fn confirm_after(self, pending: usize, err: Option<TransactionError>) -> Self {
        {
            let mut statuses = self.statuses.lock().unwrap();
            statuses.extend(std::iter::repeat_n(None, pending));
            statuses.push_back(Some(SignatureState {
                slot: 42,
                err,
                confirmed: true,
            }));
        }
        self
    }

    pub fn fail_simulation(self, err: TransactionError, logs: &[&str]) -> Self {
        *self.simulation.lock().unwrap() = SimulationReport {
            err: Some(err),
            logs: logs.iter().map(|line| line.to_string()).collect(),
            units_consumed: Some(150),
        };
        self
    }

    pub fn status_unavailable(self) -> Self {
        Self {
            status_unavailable: true,
            ..self
        }
    }

    pub fn simulations(&self) -> usize {
        self.simulations.load(Ordering::SeqCst)
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionRpc for FakeTransactionRpc {
    async fn latest_blockhash(
        &self,
        _commitment: CommitmentConfig,
    ) -> Result<(Hash, u64), ClientError> {
        Ok((Hash::new_from_array([7; 32]), self.last_valid_block_height))
    }

    async fn simulate(
        &self,
        _transaction: &VersionedTransaction,
        _commitment: CommitmentConfig,
    ) -> Result<SimulationReport, ClientError> {
        self.simulations.fetch_add(1, Ordering::SeqCst);
        Ok(self.simulation.lock().unwrap().clone())
    }

    async fn signature_status(
        &self,
        _signature: &Signature,
        _commitment: CommitmentConfig,
    ) -> Result<Option<SignatureState>, ClientError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        if self.status_unavailable {
            return Err(client_error("status unavailable"));
        }
        Ok(self.statuses.lock().unwrap().pop_front().flatten())
    }

    async fn block_height(&self, _commitment: CommitmentConfig) -> Result<u64, ClientError> {
        Ok(self.block_height.fetch_add(1, Ordering::SeqCst))
    }
}

/// Signer that records messages and returns fresh signatures.
pub struct FakeSigner {
    pub pubkey: Pubkey,
    pub fail_with: Option<String>,
    pub sent: Mutex<Vec<VersionedMessage>>,
    next_signature: AtomicU64,
}

impl FakeSigner {
    pub fn new(pubkey: Pubkey) -> Self {
        Self {
            pubkey,
            fail_with: None,
            sent: Mutex::new(Vec::new()),
            next_signature: AtomicU64::new(1),
        }
    }

    pub fn failing(pubkey: Pubkey, reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::new(pubkey)
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl TransactionSigner for FakeSigner {
    fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    async fn sign_and_send(&self, message: VersionedMessage) -> Result<Signature, SignerError> {
        self.sent.lock().unwrap().push(message);
        match &self.fail_with {
            Some(reason) => Err(reason.clone().into()),
            None => {
                let n = self.next_signature.fetch_add(1, Ordering::SeqCst);
                let mut bytes = [0u8; 64];
                bytes[..8].copy_from_slice(&n.to_le_bytes());
                Ok(Signature::from(bytes))
            }
        }
    }
}

/// Lifecycle listener that keeps every event.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.state.name())
            .collect()
    }
}

impl LifecycleListener for RecordingListener {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
