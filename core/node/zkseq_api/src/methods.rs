use std::sync::Arc;

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use web3::types::Address;
use zkseq_sequencer::Sequencer;
use zkseq_state::{StateError, StateStore};
use zkseq_types::{Transaction, TransactionKind, U256};

use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct NonceResult {
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResult {
    pub balance: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResult {
    #[serde(with = "hex_bytes")]
    pub code: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxHashResult {
    #[serde(with = "hex_bytes")]
    pub tx_hash: Vec<u8>,
}

/// Wire shape of `rollup_sendTransaction`'s single positional param (spec
/// §6.1): decimal-string amount, hex-0x data/signature, numeric
/// nonce/gas/type.
#[derive(Debug, Deserialize)]
pub struct SendTransactionParams {
    pub from: Address,
    pub to: Address,
    pub amount: String,
    pub nonce: u64,
    pub gas: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(rename = "type")]
    pub kind: u8,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

fn kind_from_discriminant(value: u8) -> Result<TransactionKind, ApiError> {
    match value {
        0 => Ok(TransactionKind::Transfer),
        1 => Ok(TransactionKind::ContractDeploy),
        2 => Ok(TransactionKind::ContractCall),
        other => Err(ApiError::InvalidParams(format!("unknown transaction type {other}"))),
    }
}

#[rpc(server, namespace = "rollup")]
pub trait RollupRpc {
    #[method(name = "getNonce")]
    async fn get_nonce(&self, address: Address) -> RpcResult<NonceResult>;

    #[method(name = "getBalance")]
    async fn get_balance(&self, address: Address) -> RpcResult<BalanceResult>;

    #[method(name = "getCode")]
    async fn get_code(&self, address: Address) -> RpcResult<CodeResult>;

    #[method(name = "sendTransaction")]
    async fn send_transaction(&self, tx: SendTransactionParams) -> RpcResult<TxHashResult>;
}

pub struct RollupApi {
    state: Arc<StateStore>,
    sequencer: Arc<Sequencer>,
}

impl RollupApi {
    pub fn new(state: Arc<StateStore>, sequencer: Arc<Sequencer>) -> Self {
        Self { state, sequencer }
    }

    /// Unknown accounts read as zeroed (balance 0, nonce 0, no code)
    /// rather than as an RPC error, matching how most account-model chains
    /// answer reads for an address that has never been written — the spec
    /// is silent on this and `StateStore::get_account` alone would return
    /// `AccountNotFound` for any address nobody has sent to yet.
    fn account_or_default(&self, address: &Address) -> Result<zkseq_types::Account, ApiError> {
        match self.state.get_account(address) {
            Ok(account) => Ok(account),
            Err(StateError::AccountNotFound(_)) => Ok(zkseq_types::Account::new(*address)),
            Err(err) => Err(ApiError::State(err)),
        }
    }
}

#[jsonrpsee::core::async_trait]
impl RollupRpcServer for RollupApi {
    async fn get_nonce(&self, address: Address) -> RpcResult<NonceResult> {
        let account = self.account_or_default(&address).map_err(ErrorObjectOwned::from)?;
        Ok(NonceResult { nonce: account.nonce })
    }

    async fn get_balance(&self, address: Address) -> RpcResult<BalanceResult> {
        let account = self.account_or_default(&address).map_err(ErrorObjectOwned::from)?;
        Ok(BalanceResult {
            balance: account.balance.to_string(),
        })
    }

    async fn get_code(&self, address: Address) -> RpcResult<CodeResult> {
        let code = self
            .state
            .get_code(&address)
            .map_err(|err| ErrorObjectOwned::from(ApiError::State(err)))?
            .unwrap_or_default();
        Ok(CodeResult { code })
    }

    async fn send_transaction(&self, tx: SendTransactionParams) -> RpcResult<TxHashResult> {
        let amount = U256::from_dec_str(&tx.amount)
            .map_err(|err| ErrorObjectOwned::from(ApiError::InvalidParams(err.to_string())))?;
        let kind = kind_from_discriminant(tx.kind).map_err(ErrorObjectOwned::from)?;

        let transaction = Transaction {
            kind,
            from: tx.from,
            to: tx.to,
            amount,
            nonce: tx.nonce,
            data: tx.data,
            gas: tx.gas,
            signature: tx.signature,
        };

        let hash = self
            .sequencer
            .admit_transaction(transaction)
            .await
            .map_err(|err| ErrorObjectOwned::from(ApiError::Pool(err)))?;

        Ok(TxHashResult { tx_hash: hash.to_vec() })
    }
}
