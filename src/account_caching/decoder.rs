//! Decoding of pushed account notifications into [`AccountRecord`]s.
//!
//! Subscriptions request base64 encoding, so the default decoder only accepts
//! `UiAccountData::Binary(_, Base64)` and fails loudly on anything else
//! instead of guessing at the payload shape.

use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use solana_account_decoder::{UiAccount, UiAccountData, UiAccountEncoding};
use solana_pubkey::Pubkey;

use crate::account_caching::{AccountCacheError, AccountRecord};

/// Turns a raw pushed account payload into a normalized record.
///
/// Implemented for any `Fn(&Pubkey, &UiAccount) -> Result<AccountRecord, _>`
/// closure, so callers can register ad-hoc decoders per address.
pub trait AccountDecoder: Send + Sync {
    fn decode(&self, address: &Pubkey, account: &UiAccount)
    -> Result<AccountRecord, AccountCacheError>;
}

impl<F> AccountDecoder for F
where
    F: Fn(&Pubkey, &UiAccount) -> Result<AccountRecord, AccountCacheError> + Send + Sync,
{
    fn decode(
        &self,
        address: &Pubkey,
        account: &UiAccount,
    ) -> Result<AccountRecord, AccountCacheError> {
        self(address, account)
    }
}

/// Default decoder for base64-encoded account notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64AccountDecoder;

impl AccountDecoder for Base64AccountDecoder {
    fn decode(
        &self,
        address: &Pubkey,
        account: &UiAccount,
    ) -> Result<AccountRecord, AccountCacheError> {
        let data = decode_binary_data(address, &account.data)?;
        let owner = Pubkey::from_str(&account.owner).map_err(|e| AccountCacheError::DecodeFailed {
            address: *address,
            reason: format!("invalid owner {}: {e}", account.owner),
        })?;
        let space = account.space.unwrap_or(data.len() as u64);

        Ok(AccountRecord {
            address: *address,
            data,
            executable: account.executable,
            lamports: account.lamports,
            owner,
            space,
        })
    }
}

/// Raw bytes of a base64 `UiAccountData` payload.
pub fn decode_binary_data(
    address: &Pubkey,
    data: &UiAccountData,
) -> Result<Vec<u8>, AccountCacheError> {
    match data {
        UiAccountData::Binary(encoded, UiAccountEncoding::Base64) => {
            STANDARD
                .decode(encoded)
                .map_err(|e| AccountCacheError::DecodeFailed {
                    address: *address,
                    reason: format!("invalid base64 payload: {e}"),
                })
        }
        UiAccountData::Binary(_, encoding) => Err(AccountCacheError::DecodeFailed {
            address: *address,
            reason: format!("unsupported encoding {encoding:?}"),
        }),
        UiAccountData::LegacyBinary(_) => Err(AccountCacheError::DecodeFailed {
            address: *address,
            reason: "unsupported legacy base58 encoding".to_string(),
        }),
        UiAccountData::Json(_) => Err(AccountCacheError::DecodeFailed {
            address: *address,
            reason: "unexpected jsonParsed payload".to_string(),
        }),
    }
}
