use std::str::FromStr;
use std::time::Duration;

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use tracing::debug;

use crate::error::{PayError, PayResult};

/// Timeout for a single RPC call. A timed-out call is a soft failure for
/// that one wallet this cycle, never fatal to the pass.
const RPC_TIMEOUT: Duration = Duration::from_secs(8);

/// Thin wrapper over the chain JSON-RPC: balance query, recent block
/// reference, signed native transfer submission. Everything else about the
/// chain is opaque to the payment core.
pub struct LedgerClient {
    client: RpcClient,
}

impl LedgerClient {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            client: RpcClient::new_with_timeout(rpc_url.to_string(), RPC_TIMEOUT),
        }
    }

    /// On-chain balance in base units (lamports).
    pub async fn balance(&self, pubkey: &Pubkey) -> PayResult<u64> {
        let lamports = self
            .client
            .get_balance(pubkey)
            .await
            .map_err(|e| PayError::LedgerRpc(format!("get_balance: {}", e)))?;

        debug!("Balance of {}: {} lamports", pubkey, lamports);
        Ok(lamports)
    }

    pub async fn latest_blockhash(&self) -> PayResult<Hash> {
        self.client
            .get_latest_blockhash()
            .await
            .map_err(|e| PayError::LedgerRpc(format!("get_latest_blockhash: {}", e)))
    }

    /// Build, sign and submit a native transfer from `from` to `to`.
    pub async fn submit_transfer(
        &self,
        from: &Keypair,
        to: &Pubkey,
        lamports: u64,
    ) -> PayResult<Signature> {
        let instruction = solana_system_interface::instruction::transfer(
            &from.pubkey(),
            to,
            lamports,
        );
        let blockhash = self.latest_blockhash().await?;
        let transaction = Transaction::new_signed_with_payer(
            &[instruction],
            Some(&from.pubkey()),
            &[from],
            blockhash,
        );

        self.client
            .send_transaction(&transaction)
            .await
            .map_err(|e| PayError::LedgerRpc(format!("send_transaction: {}", e)))
    }
}

pub fn parse_pubkey(address: &str) -> PayResult<Pubkey> {
    Pubkey::from_str(address).map_err(|_| PayError::InvalidAddress(address.to_string()))
}

/// Private key material is persisted as a JSON byte array alongside the
/// wallet row; its only legitimate consumer is the sweep path.
pub fn encode_keypair(keypair: &Keypair) -> String {
    serde_json::to_string(&keypair.to_bytes().to_vec())
        .unwrap_or_else(|_| String::from("[]"))
}

pub fn decode_keypair(raw: &str) -> PayResult<Keypair> {
    let bytes: Vec<u8> = serde_json::from_str(raw)
        .map_err(|e| PayError::InvalidKeyMaterial(format!("not a byte array: {}", e)))?;

    Keypair::try_from(bytes.as_slice())
        .map_err(|e| PayError::InvalidKeyMaterial(format!("bad keypair bytes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_encoding_roundtrips() {
        let keypair = Keypair::new();
        let encoded = encode_keypair(&keypair);
        let decoded = decode_keypair(&encoded).unwrap();
        assert_eq!(decoded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_keypair("not json").is_err());
        assert!(decode_keypair("[1,2,3]").is_err());
    }

    #[test]
    fn pubkey_parsing() {
        let keypair = Keypair::new();
        let address = keypair.pubkey().to_string();
        assert_eq!(parse_pubkey(&address).unwrap(), keypair.pubkey());
        assert!(parse_pubkey("definitely-not-base58!").is_err());
    }
}
