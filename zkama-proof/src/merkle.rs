//! Fixed-depth incremental Merkle tree over the session's identity
//! commitments, hashed with the circom Poseidon parameterization so roots
//! match what the contract's group bookkeeping produces.
//!
//! Zero leaves are literal zero; the zero node at level `i + 1` is
//! `poseidon(zero_i, zero_i)`.

use ark_bn254::Fr;
use ark_ff::Zero;
use serde::{Deserialize, Serialize};

use crate::{field_from_dec, field_to_dec, poseidon2, ProofError, TREE_DEPTH};

/// Membership proof for one leaf: the sibling path and the bit per level
/// saying which side the leaf's subtree is on (0 = left, 1 = right).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipProof {
    pub root: String,
    pub leaf: String,
    #[serde(skip)]
    pub siblings: Vec<Fr>,
    pub path_indices: Vec<u8>,
}

impl MembershipProof {
    /// Sibling path as decimal strings, for handing to the external prover.
    pub fn sibling_strings(&self) -> Vec<String> {
        self.siblings.iter().map(|s| field_to_dec(*s)).collect()
    }
}

/// Depth-20 Merkle tree rebuilt from the full commitment list fetched off the
/// chain. Session groups are small, so a straight rebuild is cheaper to get
/// right than an incrementally cached tree.
pub struct MembershipTree {
    depth: usize,
    zeroes: Vec<Fr>,
    leaves: Vec<Fr>,
}

impl MembershipTree {
    /// Empty tree at the circuit's fixed depth.
    pub fn new() -> Result<Self, ProofError> {
        Self::with_depth(TREE_DEPTH)
    }

    /// Tree at an explicit depth. The proving circuit only accepts
    /// [`TREE_DEPTH`]; other depths exist for tests.
    pub fn with_depth(depth: usize) -> Result<Self, ProofError> {
        let mut zeroes = Vec::with_capacity(depth + 1);
        let mut zero = Fr::zero();
        zeroes.push(zero);
        for _ in 0..depth {
            zero = poseidon2(zero, zero)?;
            zeroes.push(zero);
        }
        Ok(Self {
            depth,
            zeroes,
            leaves: Vec::new(),
        })
    }

    /// Build the tree from the commitment list returned by
    /// `getIdentityCommitments`, in on-chain insertion order.
    pub fn from_commitments<I, S>(commitments: I) -> Result<Self, ProofError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::new()?;
        for commitment in commitments {
            tree.insert_str(commitment.as_ref())?;
        }
        Ok(tree)
    }

    pub fn insert(&mut self, commitment: Fr) {
        self.leaves.push(commitment);
    }

    pub fn insert_str(&mut self, commitment: &str) -> Result<(), ProofError> {
        self.insert(field_from_dec(commitment)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Current root.
    pub fn root(&self) -> Result<Fr, ProofError> {
        let (root, _) = self.compute(None)?;
        Ok(root)
    }

    /// Membership proof for `commitment`, or [`ProofError::IdentityNotInGroup`]
    /// if it was never inserted. This is the check that fires before any
    /// network call when a visitor tries to post or vote without joining.
    pub fn proof_for(&self, commitment: Fr) -> Result<MembershipProof, ProofError> {
        let index = self
            .leaves
            .iter()
            .position(|leaf| *leaf == commitment)
            .ok_or(ProofError::IdentityNotInGroup)?;
        let (root, proof) = self.compute(Some(index))?;
        let (siblings, path_indices) = proof.expect("proof requested for known index");
        Ok(MembershipProof {
            root: field_to_dec(root),
            leaf: field_to_dec(commitment),
            siblings,
            path_indices,
        })
    }

    pub fn proof_for_str(&self, commitment: &str) -> Result<MembershipProof, ProofError> {
        self.proof_for(field_from_dec(commitment)?)
    }

    /// One bottom-up pass computing the root and, if asked, the sibling path
    /// for `target` on the way.
    #[allow(clippy::type_complexity)]
    fn compute(
        &self,
        target: Option<usize>,
    ) -> Result<(Fr, Option<(Vec<Fr>, Vec<u8>)>), ProofError> {
        let mut level: Vec<Fr> = self.leaves.clone();
        let mut index = target;
        let mut siblings = Vec::with_capacity(self.depth);
        let mut path_indices = Vec::with_capacity(self.depth);

        for height in 0..self.depth {
            if let Some(i) = index {
                let sibling_index = i ^ 1;
                let sibling = level
                    .get(sibling_index)
                    .copied()
                    .unwrap_or(self.zeroes[height]);
                siblings.push(sibling);
                path_indices.push((i & 1) as u8);
                index = Some(i >> 1);
            }

            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(self.zeroes[height]);
                next.push(poseidon2(left, right)?);
            }
            if next.is_empty() {
                next.push(self.zeroes[height + 1]);
            }
            level = next;
        }

        let root = level[0];
        Ok((root, target.map(|_| (siblings, path_indices))))
    }
}

/// Recompute the root from a proof and compare. Local sanity check before the
/// expensive external proving step.
pub fn verify_membership(proof: &MembershipProof) -> Result<bool, ProofError> {
    let mut node = field_from_dec(&proof.leaf)?;
    for (sibling, bit) in proof.siblings.iter().zip(&proof.path_indices) {
        node = if *bit == 0 {
            poseidon2(node, *sibling)?
        } else {
            poseidon2(*sibling, node)?
        };
    }
    Ok(field_to_dec(node) == proof.root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitments() -> Vec<String> {
        // arbitrary group members, as decimal uint256 strings
        vec![
            "12345678901234567890123456789012345678901234567890".to_string(),
            "98765432109876543210987654321098765432109876543210".to_string(),
            "11111111111111111111111111111111111111111111111111".to_string(),
        ]
    }

    #[test]
    fn proofs_verify_for_every_member() {
        let tree = MembershipTree::from_commitments(commitments()).unwrap();
        assert_eq!(tree.len(), 3);
        for commitment in commitments() {
            let proof = tree.proof_for_str(&commitment).unwrap();
            assert_eq!(proof.siblings.len(), TREE_DEPTH);
            assert_eq!(proof.path_indices.len(), TREE_DEPTH);
            assert!(verify_membership(&proof).unwrap());
        }
    }

    #[test]
    fn non_member_is_rejected_locally() {
        let tree = MembershipTree::from_commitments(commitments()).unwrap();
        let err = tree.proof_for_str("4242424242").unwrap_err();
        assert!(matches!(err, ProofError::IdentityNotInGroup));
    }

    #[test]
    fn proof_root_matches_tree_root() {
        let tree = MembershipTree::from_commitments(commitments()).unwrap();
        let proof = tree.proof_for_str(&commitments()[1]).unwrap();
        assert_eq!(proof.root, field_to_dec(tree.root().unwrap()));
    }

    #[test]
    fn root_changes_with_membership() {
        let mut tree = MembershipTree::from_commitments(commitments()).unwrap();
        let before = tree.root().unwrap();
        tree.insert_str("222222222222").unwrap();
        assert_ne!(before, tree.root().unwrap());
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let tree = MembershipTree::from_commitments(commitments()).unwrap();
        let mut proof = tree.proof_for_str(&commitments()[0]).unwrap();
        proof.leaf = "999".to_string();
        assert!(!verify_membership(&proof).unwrap());
    }

    #[test]
    fn empty_tree_root_is_the_zero_cascade() {
        let tree = MembershipTree::new().unwrap();
        assert!(tree.is_empty());
        // same root as a tree of explicit zero leaves
        let mut explicit = MembershipTree::new().unwrap();
        explicit.insert(ark_bn254::Fr::zero());
        assert_eq!(tree.root().unwrap(), explicit.root().unwrap());
    }
}
