//! In-memory stand-in for the AMA contract, reproducing the pieces of
//! behavior the web layer depends on: group membership bookkeeping and
//! chain-level nullifier uniqueness. State changes are atomic under one
//! lock, matching the contract's per-transaction atomicity.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::U256;

use zkama_common::{QuestionId, SessionId};

use crate::{AmaChain, ChainError, SignalCall, VoteReceipt};

/// Revert reason the Semaphore core emits on a reused nullifier.
pub const ERR_DUPLICATE_NULLIFIER: &str =
    "SemaphoreCore: you cannot use the same nullifier twice";

/// Revert reason for re-registering an identity commitment.
pub const ERR_ALREADY_JOINED: &str = "AMA: identity commitment already registered";

#[derive(Default)]
struct MockState {
    groups: HashMap<SessionId, Vec<U256>>,
    spent_nullifiers: HashSet<U256>,
    votes: HashMap<QuestionId, i64>,
    tx_counter: u64,
}

/// Mock chain with configurable fee. Groups spring into existence on first
/// join, so tests do not have to replay the owner's wallet-side
/// `createAmaSession`.
pub struct MockAmaChain {
    fee: U256,
    state: Mutex<MockState>,
}

impl Default for MockAmaChain {
    fn default() -> Self {
        Self {
            // 1 MATIC, the deployed contract's initial fee
            fee: U256::exp10(18),
            state: Mutex::new(MockState::default()),
        }
    }
}

impl MockAmaChain {
    pub fn with_fee(fee: U256) -> Self {
        Self {
            fee,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Vote count currently recorded for a question.
    pub fn votes(&self, question_id: QuestionId) -> i64 {
        let state = self.state.lock().expect("mock chain poisoned");
        state.votes.get(&question_id).copied().unwrap_or(0)
    }

    fn next_tx_hash(state: &mut MockState) -> String {
        state.tx_counter += 1;
        format!("0x{:064x}", state.tx_counter)
    }

    fn spend_nullifier(state: &mut MockState, nullifier_hash: U256) -> Result<(), ChainError> {
        if !state.spent_nullifiers.insert(nullifier_hash) {
            return Err(ChainError::Revert(ERR_DUPLICATE_NULLIFIER.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AmaChain for MockAmaChain {
    async fn fee(&self) -> Result<U256, ChainError> {
        Ok(self.fee)
    }

    async fn identity_commitments(&self, session_id: SessionId) -> Result<Vec<U256>, ChainError> {
        let state = self.state.lock().expect("mock chain poisoned");
        Ok(state.groups.get(&session_id).cloned().unwrap_or_default())
    }

    async fn join_session(
        &self,
        session_id: SessionId,
        identity_commitment: U256,
    ) -> Result<String, ChainError> {
        let mut state = self.state.lock().expect("mock chain poisoned");
        let group = state.groups.entry(session_id).or_default();
        if group.contains(&identity_commitment) {
            return Err(ChainError::Revert(ERR_ALREADY_JOINED.to_string()));
        }
        group.push(identity_commitment);
        Ok(Self::next_tx_hash(&mut state))
    }

    async fn post_question(&self, call: &SignalCall) -> Result<String, ChainError> {
        let mut state = self.state.lock().expect("mock chain poisoned");
        Self::spend_nullifier(&mut state, call.nullifier_hash)?;
        Ok(Self::next_tx_hash(&mut state))
    }

    async fn vote_question(&self, call: &SignalCall) -> Result<VoteReceipt, ChainError> {
        let mut state = self.state.lock().expect("mock chain poisoned");
        Self::spend_nullifier(&mut state, call.nullifier_hash)?;
        let votes = state
            .votes
            .entry(call.question_id)
            .and_modify(|count| *count += 1)
            .or_insert(1);
        let votes = *votes;
        let tx_hash = Self::next_tx_hash(&mut state);
        Ok(VoteReceipt {
            tx_hash,
            question_id: call.question_id,
            votes,
        })
    }
}
