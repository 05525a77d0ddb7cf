//! zkama-chain
//!
//! Client for the AMA contract: session groups, question posting and voting
//! behind Semaphore membership proofs. The web layer treats the contract as
//! an RPC dependency; everything here is transaction plumbing plus
//! revert-reason extraction so callers see the contract's own words when a
//! call is rejected.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::{
    contract::{abigen, ContractError},
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::Address,
};
use thiserror::Error;
use tracing::{debug, info};

use zkama_common::{QuestionId, SessionId};
use zkama_proof::Signal;

pub use ethers::types::U256;

#[cfg(feature = "mock")]
pub mod mock;

const RPC_URL_ENV: &str = "ZKAMA_RPC_URL";
const CONTRACT_ADDRESS_ENV: &str = "ZKAMA_CONTRACT_ADDRESS";
const PRIVATE_KEY_ENV: &str = "ZKAMA_PRIVATE_KEY";
const CHAIN_ID_ENV: &str = "ZKAMA_CHAIN_ID";

/// Polygon Mumbai, the network the contract is deployed to by default.
const DEFAULT_CHAIN_ID: u64 = 80001;

abigen!(
    Ama,
    r#"[
        function createAmaSession(uint256 sessionId) external payable
        function startAmaSession(uint256 sessionId) external
        function pauseAmaSession(uint256 sessionId) external
        function resumeAmaSession(uint256 sessionId) external
        function endAmaSession(uint256 sessionId) external
        function joinAmaSession(uint256 sessionId, uint256 identityCommitment) external
        function postQuestion(uint256 sessionId, uint256 questionId, bytes32 signal, uint256 root, uint256 nullifierHash, uint256 externalNullifier, uint256[8] proof) external
        function voteQuestion(uint256 sessionId, uint256 questionId, bytes32 signal, uint256 root, uint256 nullifierHash, uint256 externalNullifier, uint256[8] proof) external
        function getFee() external view returns (uint256)
        function getIdentityCommitments(uint256 sessionId) external view returns (uint256[])
        event AmaSessionCreated(uint256 sessionId)
        event AmaSessionStatusChanged(uint256 sessionId, uint256 status)
        event QuestionVoted(uint256 sessionId, uint256 questionId, uint256 votes)
    ]"#
);

#[derive(Debug, Error)]
pub enum ChainError {
    /// The contract rejected the call; the reason string is surfaced
    /// verbatim.
    #[error("{0}")]
    Revert(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("invalid chain configuration: {0}")]
    Config(String),

    #[error("transaction dropped from the mempool")]
    Dropped,

    #[error("expected {0} event missing from receipt")]
    MissingEvent(&'static str),
}

/// Connection settings for the AMA contract, read from the environment the
/// way the rest of the stack is configured.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub private_key: String,
    pub chain_id: u64,
}

impl ChainConfig {
    pub fn from_env() -> Result<Self, ChainError> {
        let rpc_url = env::var(RPC_URL_ENV)
            .map_err(|_| ChainError::Config(format!("{} is not set", RPC_URL_ENV)))?;
        let contract_address = env::var(CONTRACT_ADDRESS_ENV)
            .map_err(|_| ChainError::Config(format!("{} is not set", CONTRACT_ADDRESS_ENV)))?;
        let private_key = env::var(PRIVATE_KEY_ENV)
            .map_err(|_| ChainError::Config(format!("{} is not set", PRIVATE_KEY_ENV)))?;
        let chain_id = env::var(CHAIN_ID_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_CHAIN_ID);
        Ok(Self {
            rpc_url,
            contract_address,
            private_key,
            chain_id,
        })
    }
}

/// Proof-carrying call targeting one question: the shared shape of
/// `postQuestion` and `voteQuestion`.
#[derive(Debug, Clone)]
pub struct SignalCall {
    pub session_id: SessionId,
    pub question_id: QuestionId,
    pub signal: Signal,
    pub root: U256,
    pub nullifier_hash: U256,
    pub external_nullifier: U256,
    pub proof: [U256; 8],
}

/// Outcome of a successful `voteQuestion`, carrying the authoritative vote
/// count decoded from the `QuestionVoted` event.
#[derive(Debug, Clone)]
pub struct VoteReceipt {
    pub tx_hash: String,
    pub question_id: QuestionId,
    pub votes: i64,
}

/// Seam between the HTTP layer and the contract, so the backend tests run
/// against an in-memory chain with the same nullifier semantics.
#[async_trait]
pub trait AmaChain: Send + Sync {
    /// Current session-creation fee in wei.
    async fn fee(&self) -> Result<U256, ChainError>;

    /// All identity commitments registered in a session's group, in
    /// insertion order.
    async fn identity_commitments(&self, session_id: SessionId) -> Result<Vec<U256>, ChainError>;

    /// Register an identity commitment in the session's group.
    async fn join_session(
        &self,
        session_id: SessionId,
        identity_commitment: U256,
    ) -> Result<String, ChainError>;

    /// Submit a question's membership proof on-chain. Returns the
    /// transaction hash.
    async fn post_question(&self, call: &SignalCall) -> Result<String, ChainError>;

    /// Submit a vote on-chain and decode the resulting count.
    async fn vote_question(&self, call: &SignalCall) -> Result<VoteReceipt, ChainError>;
}

type AmaMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// ethers-backed client signing with the service key, the way join/post/vote
/// transactions are relayed for anonymous participants.
pub struct AmaContractClient {
    contract: Ama<AmaMiddleware>,
}

impl AmaContractClient {
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|err| ChainError::Config(format!("invalid rpc url: {err}")))?;

        let wallet = config
            .private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|err| ChainError::Config(format!("invalid private key: {err}")))?
            .with_chain_id(config.chain_id);

        let address: Address = config
            .contract_address
            .parse()
            .map_err(|err| ChainError::Config(format!("invalid contract address: {err}")))?;

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        info!(
            contract = %config.contract_address,
            chain_id = config.chain_id,
            "connected AMA contract client"
        );

        Ok(Self {
            contract: Ama::new(address, client),
        })
    }

    fn u256(id: i64) -> U256 {
        U256::from(id as u64)
    }

    async fn send_and_confirm(
        &self,
        call: ethers::contract::ContractCall<AmaMiddleware, ()>,
    ) -> Result<ethers::types::TransactionReceipt, ChainError> {
        let pending = call.send().await.map_err(map_contract_error)?;
        let receipt = pending
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?
            .ok_or(ChainError::Dropped)?;
        if receipt.status == Some(0.into()) {
            return Err(ChainError::Revert("transaction reverted".to_string()));
        }
        Ok(receipt)
    }
}

#[async_trait]
impl AmaChain for AmaContractClient {
    async fn fee(&self) -> Result<U256, ChainError> {
        self.contract
            .get_fee()
            .call()
            .await
            .map_err(map_contract_error)
    }

    async fn identity_commitments(&self, session_id: SessionId) -> Result<Vec<U256>, ChainError> {
        self.contract
            .get_identity_commitments(Self::u256(session_id))
            .call()
            .await
            .map_err(map_contract_error)
    }

    async fn join_session(
        &self,
        session_id: SessionId,
        identity_commitment: U256,
    ) -> Result<String, ChainError> {
        debug!(session_id, "submitting joinAmaSession");
        let call = self
            .contract
            .join_ama_session(Self::u256(session_id), identity_commitment);
        let receipt = self.send_and_confirm(call).await?;
        Ok(format!("{:#x}", receipt.transaction_hash))
    }

    async fn post_question(&self, call: &SignalCall) -> Result<String, ChainError> {
        debug!(
            session_id = call.session_id,
            question_id = call.question_id,
            "submitting postQuestion"
        );
        let tx = self.contract.post_question(
            Self::u256(call.session_id),
            Self::u256(call.question_id),
            call.signal.as_bytes32(),
            call.root,
            call.nullifier_hash,
            call.external_nullifier,
            call.proof,
        );
        let receipt = self.send_and_confirm(tx).await?;
        Ok(format!("{:#x}", receipt.transaction_hash))
    }

    async fn vote_question(&self, call: &SignalCall) -> Result<VoteReceipt, ChainError> {
        debug!(
            session_id = call.session_id,
            question_id = call.question_id,
            "submitting voteQuestion"
        );
        let tx = self.contract.vote_question(
            Self::u256(call.session_id),
            Self::u256(call.question_id),
            call.signal.as_bytes32(),
            call.root,
            call.nullifier_hash,
            call.external_nullifier,
            call.proof,
        );
        let receipt = self.send_and_confirm(tx).await?;
        let tx_hash = format!("{:#x}", receipt.transaction_hash);

        for log in &receipt.logs {
            if let Ok(event) = ethers::contract::parse_log::<QuestionVotedFilter>(log.clone()) {
                return Ok(VoteReceipt {
                    tx_hash,
                    question_id: event.question_id.as_u64() as i64,
                    votes: event.votes.as_u64() as i64,
                });
            }
        }
        Err(ChainError::MissingEvent("QuestionVoted"))
    }
}

/// Pull the contract's revert reason out of an ethers error; anything without
/// a decodable reason is a transport problem.
fn map_contract_error<M: Middleware>(err: ContractError<M>) -> ChainError {
    match err.decode_revert::<String>() {
        Some(reason) => ChainError::Revert(reason),
        None => ChainError::Rpc(err.to_string()),
    }
}

/// Parse a uint256 sent as either a decimal string (the usual wire format) or
/// `0x`-prefixed hex.
pub fn parse_u256(value: &str) -> Result<U256, ChainError> {
    let trimmed = value.trim();
    let parsed = if let Some(hex_digits) = trimmed.strip_prefix("0x") {
        U256::from_str_radix(hex_digits, 16).ok()
    } else {
        U256::from_dec_str(trimmed).ok()
    };
    parsed.ok_or_else(|| ChainError::Config(format!("invalid uint256 value: {value}")))
}
