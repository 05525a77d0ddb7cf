//! zkama-proof
//!
//! Input construction for the external Semaphore proving circuit. The circuit
//! itself (`semaphore.wasm` + `semaphore_final.zkey`) is an opaque artifact
//! pair; this crate produces everything it consumes: the bytes32 signal tag,
//! the external nullifier derived from the `{session_id}_{question_id}` seed,
//! and the fixed-depth Merkle membership proof over the session's identity
//! commitments.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ark_bn254::Fr;
use ark_ff::PrimeField;
use light_poseidon::{Poseidon, PoseidonHasher};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use zkama_common::{QuestionId, SessionId};

pub mod merkle;

pub use merkle::{MembershipProof, MembershipTree};

/// Merkle depth the circuit was compiled for.
pub const TREE_DEPTH: usize = 20;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("identity commitment is not a member of the session group")]
    IdentityNotInGroup,

    #[error("invalid field element: {0}")]
    InvalidElement(String),

    #[error("poseidon hash failed: {0}")]
    Poseidon(String),

    #[error("circuit artifact missing: {0}")]
    ArtifactMissing(PathBuf),
}

/// Action tag bound into the proof: a member may post a question or vote on
/// one, and the nullifier scope keeps the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Post,
    Vote,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Vote => "vote",
        }
    }

    /// The tag as the contract expects it: UTF-8 bytes, zero-padded to 32
    /// (the `formatBytes32String` encoding).
    pub fn as_bytes32(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let bytes = self.as_str().as_bytes();
        out[..bytes.len()].copy_from_slice(bytes);
        out
    }

    /// Signal hash fed to the circuit: Keccak-256 of the bytes32 tag, shifted
    /// right one byte to fit the snark scalar field.
    pub fn signal_hash(self) -> [u8; 32] {
        let digest = Keccak256::digest(self.as_bytes32());
        let mut out = [0u8; 32];
        out[1..].copy_from_slice(&digest[..31]);
        out
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seed string for a question-scoped action nullifier. The off-chain question
/// id is reused verbatim here, which is why it must be allocated before the
/// proof can be generated.
pub fn nullifier_seed(session_id: SessionId, question_id: QuestionId) -> String {
    format!("{}_{}", session_id, question_id)
}

/// External nullifier: Keccak-256 of the seed with the top three bytes
/// cleared, so the value fits the snark scalar field (the `genExternalNullifier`
/// truncation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNullifier(pub [u8; 32]);

impl ExternalNullifier {
    pub fn from_seed(seed: &str) -> Self {
        let mut bytes: [u8; 32] = Keccak256::digest(seed.as_bytes()).into();
        bytes[..3].fill(0);
        Self(bytes)
    }

    pub fn for_question(session_id: SessionId, question_id: QuestionId) -> Self {
        Self::from_seed(&nullifier_seed(session_id, question_id))
    }

    pub fn to_hex(self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_field(self) -> Fr {
        Fr::from_be_bytes_mod_order(&self.0)
    }
}

/// Opaque proving artifact pair. The witness evaluation and proof generation
/// happen outside this codebase; all we do is hand these paths to the prover
/// and refuse early when they are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitArtifacts {
    pub wasm: PathBuf,
    pub zkey: PathBuf,
}

impl CircuitArtifacts {
    pub fn load(wasm: impl Into<PathBuf>, zkey: impl Into<PathBuf>) -> Result<Self, ProofError> {
        let artifacts = Self {
            wasm: wasm.into(),
            zkey: zkey.into(),
        };
        for path in [&artifacts.wasm, &artifacts.zkey] {
            if !path.exists() {
                return Err(ProofError::ArtifactMissing(path.clone()));
            }
        }
        Ok(artifacts)
    }

    pub fn wasm_path(&self) -> &Path {
        &self.wasm
    }

    pub fn zkey_path(&self) -> &Path {
        &self.zkey
    }
}

/// Witness input for the external prover, using the circuit's own input
/// names. Identity trapdoor and nullifier are the caller's secrets and pass
/// through untouched as decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessInput {
    pub identity_nullifier: String,
    pub identity_trapdoor: String,
    pub identity_path_index: Vec<u8>,
    pub path_elements: Vec<String>,
    pub external_nullifier: String,
    pub signal_hash: String,
}

impl WitnessInput {
    /// Assemble the full witness from the caller's identity secrets, a
    /// membership proof and the action scope.
    pub fn assemble(
        identity_trapdoor: String,
        identity_nullifier: String,
        membership: &MembershipProof,
        external_nullifier: ExternalNullifier,
        signal: Signal,
    ) -> Self {
        Self {
            identity_nullifier,
            identity_trapdoor,
            identity_path_index: membership.path_indices.clone(),
            path_elements: membership
                .siblings
                .iter()
                .map(|element| field_to_dec(*element))
                .collect(),
            external_nullifier: field_to_dec(external_nullifier.as_field()),
            signal_hash: field_to_dec(Fr::from_be_bytes_mod_order(&signal.signal_hash())),
        }
    }
}

/// Parse a decimal uint256 string into a field element.
pub fn field_from_dec(value: &str) -> Result<Fr, ProofError> {
    Fr::from_str(value.trim()).map_err(|_| ProofError::InvalidElement(value.to_string()))
}

/// Render a field element as the decimal string the prover and contract
/// tooling exchange.
pub fn field_to_dec(value: Fr) -> String {
    value.into_bigint().to_string()
}

pub(crate) fn poseidon2(left: Fr, right: Fr) -> Result<Fr, ProofError> {
    let mut hasher =
        Poseidon::<Fr>::new_circom(2).map_err(|err| ProofError::Poseidon(err.to_string()))?;
    hasher
        .hash(&[left, right])
        .map_err(|err| ProofError::Poseidon(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::Zero;

    #[test]
    fn signal_bytes32_matches_format_bytes32_string() {
        assert_eq!(
            hex::encode(Signal::Post.as_bytes32()),
            "706f737400000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            hex::encode(Signal::Vote.as_bytes32()),
            "766f746500000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn signal_hash_is_shifted_keccak() {
        assert_eq!(
            hex::encode(Signal::Post.signal_hash()),
            "00b4905605f7449af7ae49c1fa98c740d54d03cee3d221fd0a40343287ea2298"
        );
        assert_eq!(
            hex::encode(Signal::Vote.signal_hash()),
            "0081f04416189b1f9e6b354bd4094787e428ede8d1e480f072298172807fb22a"
        );
    }

    #[test]
    fn nullifier_seed_uses_both_ids_verbatim() {
        assert_eq!(nullifier_seed(7, 42), "7_42");
    }

    #[test]
    fn external_nullifier_truncates_keccak() {
        // keccak256("1_1") = 7bc1c988...; the top three bytes get cleared.
        let nullifier = ExternalNullifier::for_question(1, 1);
        assert_eq!(
            nullifier.to_hex(),
            "0x000000889e0858302721aa6da0318e4e6eb7eab947465105c4873f8c5c6ee34c"
        );
        assert_eq!(&nullifier.0[..3], &[0, 0, 0]);
    }

    #[test]
    fn external_nullifier_is_scoped_per_question() {
        let a = ExternalNullifier::for_question(1, 1);
        let b = ExternalNullifier::for_question(1, 2);
        let c = ExternalNullifier::for_question(2, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(a, ExternalNullifier::for_question(1, 1));
    }

    #[test]
    fn missing_artifacts_are_rejected() {
        let err = CircuitArtifacts::load("/definitely/not/semaphore.wasm", "/nope.zkey")
            .unwrap_err();
        assert!(matches!(err, ProofError::ArtifactMissing(_)));
    }

    #[test]
    fn field_dec_roundtrip() {
        let value = field_from_dec("12345678901234567890").unwrap();
        assert_eq!(field_to_dec(value), "12345678901234567890");
        assert_eq!(field_to_dec(Fr::zero()), "0");
        assert!(field_from_dec("not a number").is_err());
    }
}
