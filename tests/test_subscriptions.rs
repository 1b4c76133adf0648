mod common;

#[cfg(test)]
mod test_subscriptions {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use rstest::rstest;
    use solana_account_decoder::UiAccount;
    use solana_pubkey::Pubkey;
    use solana_sdk::commitment_config::CommitmentConfig;

    use ledger_sync::account_caching::{
        AccountCacheError, AccountRecord, AccountsCache,
        decoder::{AccountDecoder, Base64AccountDecoder},
        rpc_cache::{AccountBatchFetcher, AccountsRpc, FetcherConfig},
        subscription::{AccountSubscriptionSource, SubscriptionManager},
    };

    use crate::common::{
        FakeAccountsRpc, FakeSubscriptionSource, init_test_logger, ui_account, wait_until,
    };

    struct Harness {
        source: Arc<FakeSubscriptionSource>,
        cache: Arc<AccountBatchFetcher>,
        manager: SubscriptionManager,
    }

    fn harness() -> Harness {
        let source = Arc::new(FakeSubscriptionSource::default());
        let rpc: Arc<dyn AccountsRpc> = Arc::new(FakeAccountsRpc::default());
        let cache = Arc::new(AccountBatchFetcher::with_config(rpc, FetcherConfig::default()));
        let manager = SubscriptionManager::new(
            Arc::clone(&source) as Arc<dyn AccountSubscriptionSource>,
            Arc::clone(&cache) as Arc<dyn AccountsCache>,
            CommitmentConfig::confirmed(),
        );
        Harness {
            source,
            cache,
            manager,
        }
    }

    /// Decoder that tags records by overriding `space` and counts its calls.
    struct TaggingDecoder {
        tag: u64,
        calls: AtomicUsize,
    }

    impl TaggingDecoder {
        fn new(tag: u64) -> Arc<Self> {
            Arc::new(Self {
                tag,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AccountDecoder for TaggingDecoder {
        fn decode(
            &self,
            address: &Pubkey,
            account: &UiAccount,
        ) -> Result<AccountRecord, AccountCacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut record = Base64AccountDecoder.decode(address, account)?;
            record.space = self.tag;
            Ok(record)
        }
    }

    fn cached_lamports(cache: &AccountBatchFetcher, address: &Pubkey) -> Option<u64> {
        match cache.cached(address) {
            Some(Ok(Some(record))) => Some(record.lamports),
            _ => None,
        }
    }

    #[tokio::test]
    async fn watchers_share_one_channel_until_the_last_unsubscribe() {
        init_test_logger();
        let Harness {
            source, manager, ..
        } = harness();
        let address = Pubkey::new_unique();

        let first = manager.subscribe(address, Arc::new(Base64AccountDecoder));
        let second = manager.subscribe(address, Arc::new(Base64AccountDecoder));

        assert_eq!(manager.get_subscription_count(&address), 2);
        assert!(wait_until(|| source.opened() == 1).await);
        assert_eq!(source.channels_for(&address), 1);

        first.unsubscribe();
        assert_eq!(manager.get_subscription_count(&address), 1);
        assert!(!source.is_closed(&address));

        second.unsubscribe();
        assert_eq!(manager.get_subscription_count(&address), 0);
        assert_eq!(manager.active_channels(), 0);
        assert!(wait_until(|| source.is_closed(&address)).await);
        assert_eq!(source.opened(), 1);
    }

    #[tokio::test]
    async fn resubscribing_after_teardown_opens_a_new_channel() {
        init_test_logger();
        let Harness {
            source, manager, ..
        } = harness();
        let address = Pubkey::new_unique();

        manager
            .subscribe(address, Arc::new(Base64AccountDecoder))
            .unsubscribe();
        let again = manager.subscribe(address, Arc::new(Base64AccountDecoder));

        assert_eq!(manager.get_subscription_count(&address), 1);
        assert!(wait_until(|| source.opened() >= 1 && !source.is_closed(&address)).await);
        again.unsubscribe();
    }

    #[tokio::test]
    async fn pushed_update_is_written_to_the_cache() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let watcher = manager.subscribe(address, Arc::new(Base64AccountDecoder));
        assert!(wait_until(|| source.opened() == 1).await);
        assert!(source.push(&address, ui_account(7_000, &[4, 5, 6], owner)));

        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(7_000)).await);
        let record = cache.get_account(&address).await.unwrap().unwrap();
        assert_eq!(record.data, vec![4, 5, 6]);
        assert_eq!(record.owner, owner);
        watcher.unsubscribe();
    }

    #[tokio::test]
    async fn zero_lamport_update_writes_a_tombstone_without_decoding() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let decoder = TaggingDecoder::new(1);

        let watcher = manager.subscribe(address, decoder.clone());
        assert!(wait_until(|| source.opened() == 1).await);
        source.push(&address, ui_account(100, &[1], owner));
        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(100)).await);

        source.push(&address, ui_account(0, &[], owner));
        assert!(wait_until(|| matches!(cache.cached(&address), Some(Ok(None)))).await);
        assert_eq!(decoder.calls(), 1);
        watcher.unsubscribe();
    }

    #[rstest]
    #[case(0)]
    #[case(25)]
    #[tokio::test]
    async fn pushes_after_teardown_leave_the_cache_alone(#[case] lamports: u64) {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let watcher = manager.subscribe(address, Arc::new(Base64AccountDecoder));
        assert!(wait_until(|| source.opened() == 1).await);
        source.push(&address, ui_account(100, &[1], owner));
        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(100)).await);

        watcher.unsubscribe();
        source.push(&address, ui_account(lamports, &[], owner));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cached_lamports(&cache, &address), Some(100));
        assert_eq!(manager.active_channels(), 0);
    }

    #[tokio::test]
    async fn most_recent_watcher_decoder_is_used_for_all_pushes() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let older = TaggingDecoder::new(111);
        let newer = TaggingDecoder::new(222);

        let first = manager.subscribe(address, older.clone());
        let second = manager.subscribe(address, newer.clone());
        assert!(wait_until(|| source.opened() == 1).await);

        source.push(&address, ui_account(50, &[0; 8], owner));
        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(50)).await);

        let record = cache.get_account(&address).await.unwrap().unwrap();
        assert_eq!(record.space, 222);
        assert_eq!(older.calls(), 0);
        assert_eq!(newer.calls(), 1);

        first.unsubscribe();
        second.unsubscribe();
    }

    #[tokio::test]
    async fn decode_failure_keeps_the_channel_open() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let watcher = manager.subscribe(address, Arc::new(Base64AccountDecoder));
        assert!(wait_until(|| source.opened() == 1).await);

        let mut garbled = ui_account(10, &[1], owner);
        garbled.owner = "not-a-pubkey".to_string();
        source.push(&address, garbled);
        source.push(&address, ui_account(20, &[2], owner));

        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(20)).await);
        assert!(!source.is_closed(&address));
        watcher.unsubscribe();
    }

    #[tokio::test]
    async fn closure_decoders_are_accepted() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let decoder = |address: &Pubkey, account: &UiAccount| {
            Base64AccountDecoder.decode(address, account).map(|mut record| {
                record.data.reverse();
                record
            })
        };
        let watcher = manager.subscribe(address, Arc::new(decoder));
        assert!(wait_until(|| source.opened() == 1).await);
        source.push(&address, ui_account(5, &[1, 2, 3], owner));

        assert!(wait_until(|| cached_lamports(&cache, &address) == Some(5)).await);
        let record = cache.get_account(&address).await.unwrap().unwrap();
        assert_eq!(record.data, vec![3, 2, 1]);
        watcher.unsubscribe();
    }

    #[tokio::test]
    async fn channel_error_ends_delivery_but_keeps_the_watcher() {
        init_test_logger();
        let Harness {
            source,
            cache,
            manager,
        } = harness();
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let watcher = manager.subscribe(address, Arc::new(Base64AccountDecoder));
        assert!(wait_until(|| source.opened() == 1).await);
        assert!(source.fail(&address, "socket closed"));

        assert!(wait_until(|| source.is_closed(&address)).await);
        assert!(!source.push(&address, ui_account(99, &[], owner)));
        assert!(cache.cached(&address).is_none());

        // Channel errors are not retried; the watcher stays counted.
        assert_eq!(manager.get_subscription_count(&address), 1);
        assert_eq!(source.opened(), 1);
        watcher.unsubscribe();
        assert_eq!(manager.active_channels(), 0);
    }
}
