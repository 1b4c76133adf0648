//! Consumer-facing surface of the sync engine.
//!
//! `SyncEngine` wires the batch fetcher, the subscription manager and the
//! transaction pipeline around one shared cache. Construct one per backend
//! connection; instances share nothing.

use std::sync::Arc;

use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_instruction::Instruction;
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::signature::{Keypair, Signature};

use crate::{
    account_caching::{
        AccountLookup, AccountRecord, AccountsCache,
        decoder::{AccountDecoder, Base64AccountDecoder},
        rpc_cache::{AccountBatchFetcher, AccountsRpc},
        subscription::{
            AccountSubscriptionSource, PubsubAccountSource, SubscriptionManager, Unsubscribe,
        },
    },
    config::EngineConfig,
    error::SyncError,
    transaction::{
        KeypairSigner, SendOptions, TransactionRpc, TransactionSender, TransactionSigner,
        error::TransactionPipelineError, lifecycle::LifecycleListener,
    },
};

pub struct SyncEngine {
    accounts: Arc<AccountBatchFetcher>,
    subscriptions: SubscriptionManager,
    transactions: TransactionSender,
    rpc_client: Option<Arc<RpcClient>>,
}

impl SyncEngine {
    /// Connect to the RPC and websocket endpoints named in `config`.
    pub async fn connect(config: &EngineConfig) -> Result<Self, SyncError> {
        config.validate()?;

        let rpc_client = Arc::new(RpcClient::new_with_commitment(
            config.rpc_url.clone(),
            config.commitment.into(),
        ));
        let pubsub = PubsubClient::new(&config.ws_url)
            .await
            .map_err(|e| SyncError::Connect {
                url: config.ws_url.clone(),
                reason: e.to_string(),
            })?;

        let mut engine = Self::new(
            Arc::clone(&rpc_client) as Arc<dyn AccountsRpc>,
            Arc::new(PubsubAccountSource::new(pubsub)),
            Arc::clone(&rpc_client) as Arc<dyn TransactionRpc>,
            config,
        );
        engine.rpc_client = Some(rpc_client);
        Ok(engine)
    }

    /// Build an engine over injected collaborators.
    pub fn new(
        accounts_rpc: Arc<dyn AccountsRpc>,
        subscription_source: Arc<dyn AccountSubscriptionSource>,
        transaction_rpc: Arc<dyn TransactionRpc>,
        config: &EngineConfig,
    ) -> Self {
        let accounts = Arc::new(AccountBatchFetcher::with_config(
            accounts_rpc,
            config.fetcher_config(),
        ));
        let cache: Arc<dyn AccountsCache> = Arc::clone(&accounts) as Arc<dyn AccountsCache>;
        let subscriptions = SubscriptionManager::new(
            subscription_source,
            Arc::clone(&cache),
            config.subscription_commitment.into(),
        );
        let transactions = TransactionSender::new(transaction_rpc, cache, config.pipeline_config());

        Self {
            accounts,
            subscriptions,
            transactions,
            rpc_client: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.transactions = self.transactions.with_listener(listener);
        self
    }

    pub fn accounts(&self) -> &AccountBatchFetcher {
        &self.accounts
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn bind_signer(&self, signer: Arc<dyn TransactionSigner>) {
        self.transactions.bind_signer(signer);
    }

    /// Bind a local keypair that signs and submits over this engine's RPC.
    ///
    /// Only available on engines built with [`SyncEngine::connect`].
    pub fn bind_keypair(&self, keypair: Keypair) -> Result<(), SyncError> {
        let rpc = self.rpc_client.as_ref().ok_or_else(|| {
            SyncError::InvalidConfig("engine has no RPC client to submit through".to_string())
        })?;
        self.bind_signer(Arc::new(KeypairSigner::new(keypair, Arc::clone(rpc))));
        Ok(())
    }

    pub fn unbind_signer(&self) {
        self.transactions.unbind_signer();
    }

    pub async fn get(&self, address: &Pubkey) -> AccountLookup {
        self.accounts.load(*address).await
    }

    pub async fn get_many(&self, addresses: &[Pubkey]) -> Vec<AccountLookup> {
        self.accounts.load_many(addresses).await
    }

    /// Like [`SyncEngine::get`], but a tombstone is an error.
    pub async fn get_existing(&self, address: &Pubkey) -> Result<AccountRecord, SyncError> {
        self.get(address)
            .await?
            .ok_or(SyncError::NoAccountFound(*address))
    }

    pub fn watch(&self, address: Pubkey, decoder: Arc<dyn AccountDecoder>) -> Unsubscribe {
        self.subscriptions.subscribe(address, decoder)
    }

    /// Watch with the default base64 decoder.
    pub fn watch_raw(&self, address: Pubkey) -> Unsubscribe {
        self.watch(address, Arc::new(Base64AccountDecoder))
    }

    pub async fn send(
        &self,
        label: &str,
        instructions: Vec<Instruction>,
        options: SendOptions,
    ) -> Result<Signature, TransactionPipelineError> {
        self.transactions.send(label, instructions, options).await
    }

    /// Resolved cache contents, without any I/O.
    pub fn cached(&self, address: &Pubkey) -> Option<AccountLookup> {
        self.accounts.cached(address)
    }

    pub fn invalidate(&self, address: &Pubkey) {
        self.accounts.clear(address);
    }

    pub fn invalidate_all(&self) {
        self.accounts.clear_all();
    }

    pub fn prime(&self, address: Pubkey, value: Option<AccountRecord>) {
        self.accounts.prime(address, Ok(value));
    }
}
