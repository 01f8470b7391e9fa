//! Vote-extension validation
//!
//! Verifies that an extended commit carries a supermajority (>= 2/3 voting
//! power) of vote extensions whose signatures are valid for the given height,
//! and that each embedded oracle payload is well formed. Validation never
//! mutates state.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use prost::Message;

use super::types::{BlockIdFlag, CanonicalVoteExtension, ExtendedCommitInfo, OracleVoteExtension};

/// Upper bound on one vote extension's encoded size.
pub const MAX_VOTE_EXTENSION_SIZE: usize = 64 * 1024;

/// Upper bound on the number of prices one oracle payload may carry.
pub const MAX_ORACLE_PRICES: usize = 2_000;

/// A price value is at most 256 bits wide.
const MAX_PRICE_BYTES: usize = 32;

/// One validator as known to the verifier.
#[derive(Debug, Clone)]
pub struct SetValidator {
    pub pub_key: VerifyingKey,
    pub power: i64,
}

/// The validator set active at some height.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    validators: BTreeMap<Vec<u8>, SetValidator>,
}

impl ValidatorSet {
    pub fn new(validators: impl IntoIterator<Item = (Vec<u8>, SetValidator)>) -> Self {
        Self {
            validators: validators.into_iter().collect(),
        }
    }

    pub fn get(&self, address: &[u8]) -> Option<&SetValidator> {
        self.validators.get(address)
    }

    pub fn total_power(&self) -> i64 {
        self.validators.values().map(|v| v.power).sum()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Looks up the validator set active at a height.
pub trait ValidatorStore: Send + Sync {
    fn validator_set(&self, height: i64) -> Result<ValidatorSet>;
}

/// Stateless verifier for extended commits.
pub struct VoteExtensionVerifier<S> {
    chain_id: String,
    /// Vote extensions are enabled at heights strictly above this; zero
    /// disables them entirely.
    enable_height: i64,
    store: S,
}

impl<S: ValidatorStore> VoteExtensionVerifier<S> {
    pub fn new(chain_id: impl Into<String>, enable_height: i64, store: S) -> Self {
        Self {
            chain_id: chain_id.into(),
            enable_height,
            store,
        }
    }

    pub fn enabled(&self, height: i64) -> bool {
        self.enable_height > 0 && height > self.enable_height
    }

    /// The canonical payload a validator signs for `(height, round)`.
    pub fn signing_payload(&self, height: i64, round: i64, extension: &Bytes) -> Bytes {
        CanonicalVoteExtension {
            extension: extension.clone(),
            height,
            round,
            chain_id: self.chain_id.clone(),
        }
        .encode_to_vec()
        .into()
    }

    /// Validate an extended commit for `height`.
    pub fn validate(&self, height: i64, commit: &ExtendedCommitInfo) -> Result<()> {
        let set = self
            .store
            .validator_set(height)
            .with_context(|| format!("no validator set for height {height}"))?;
        if set.is_empty() {
            bail!("validator set at height {height} is empty");
        }

        // Votes must arrive in the engine's canonical order: descending
        // power, ties broken by ascending address. Anything else cannot have
        // come from a well-behaved proposer and would break byte-identical
        // re-encoding.
        for window in commit.votes.windows(2) {
            let a = window[0]
                .validator
                .as_ref()
                .context("vote is missing its validator")?;
            let b = window[1]
                .validator
                .as_ref()
                .context("vote is missing its validator")?;
            let out_of_order =
                b.power > a.power || (b.power == a.power && b.address < a.address);
            if out_of_order {
                bail!("extended commit votes are not in canonical order");
            }
        }

        let mut commit_power: i128 = 0;
        for vote in &commit.votes {
            let validator = vote
                .validator
                .as_ref()
                .context("vote is missing its validator")?;
            let known = set.get(&validator.address).with_context(|| {
                format!(
                    "vote from unknown validator {}",
                    hex::encode(&validator.address)
                )
            })?;
            if known.power != validator.power {
                bail!(
                    "validator {} claims power {}, expected {}",
                    hex::encode(&validator.address),
                    validator.power,
                    known.power
                );
            }

            match vote.flag() {
                BlockIdFlag::Commit => {
                    self.validate_extension(height, commit.round as i64, vote, known)?;
                    commit_power += i128::from(validator.power);
                }
                BlockIdFlag::Absent | BlockIdFlag::Nil => {
                    if !vote.vote_extension.is_empty() || !vote.extension_signature.is_empty() {
                        bail!(
                            "non-commit vote from {} carries a vote extension",
                            hex::encode(&validator.address)
                        );
                    }
                }
                BlockIdFlag::Unknown => {
                    bail!(
                        "vote from {} has an unknown block-id flag",
                        hex::encode(&validator.address)
                    );
                }
            }
        }

        let total_power = i128::from(set.total_power());
        if commit_power * 3 < total_power * 2 {
            bail!(
                "insufficient voting power: got {commit_power}, need at least 2/3 of {total_power}"
            );
        }

        Ok(())
    }

    fn validate_extension(
        &self,
        height: i64,
        round: i64,
        vote: &super::types::ExtendedVoteInfo,
        validator: &SetValidator,
    ) -> Result<()> {
        if vote.vote_extension.len() > MAX_VOTE_EXTENSION_SIZE {
            bail!(
                "vote extension exceeds {} bytes: {}",
                MAX_VOTE_EXTENSION_SIZE,
                vote.vote_extension.len()
            );
        }

        let payload = OracleVoteExtension::decode(vote.vote_extension.as_ref())
            .context("vote extension does not decode as an oracle payload")?;
        if payload.prices.len() > MAX_ORACLE_PRICES {
            bail!(
                "oracle payload carries {} prices, limit is {}",
                payload.prices.len(),
                MAX_ORACLE_PRICES
            );
        }
        for (id, price) in &payload.prices {
            if price.len() > MAX_PRICE_BYTES {
                bail!("price for pair id {id} is wider than 256 bits");
            }
        }

        let signature = Signature::from_slice(&vote.extension_signature)
            .context("malformed extension signature")?;
        let message = self.signing_payload(height, round, &vote.vote_extension);
        validator
            .pub_key
            .verify(&message, &signature)
            .context("extension signature verification failed")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    use crate::consensus::types::{ExtendedVoteInfo, Validator};

    use super::*;

    struct FixedStore {
        set: ValidatorSet,
    }

    impl ValidatorStore for FixedStore {
        fn validator_set(&self, _height: i64) -> Result<ValidatorSet> {
            Ok(self.set.clone())
        }
    }

    struct TestValidator {
        key: SigningKey,
        address: Vec<u8>,
        power: i64,
    }

    fn test_validator(tag: u8, power: i64) -> TestValidator {
        let key = SigningKey::generate(&mut OsRng);
        TestValidator {
            key,
            address: vec![tag; 20],
            power,
        }
    }

    fn verifier_for(
        validators: &[&TestValidator],
    ) -> VoteExtensionVerifier<FixedStore> {
        let set = ValidatorSet::new(validators.iter().map(|v| {
            (
                v.address.clone(),
                SetValidator {
                    pub_key: v.key.verifying_key(),
                    power: v.power,
                },
            )
        }));
        VoteExtensionVerifier::new("test-chain", 1, FixedStore { set })
    }

    fn oracle_extension() -> Bytes {
        let mut payload = OracleVoteExtension::default();
        payload.prices.insert(1, vec![0x01, 0x86, 0xa0]);
        payload.encode_to_vec().into()
    }

    fn commit_vote(
        verifier: &VoteExtensionVerifier<FixedStore>,
        validator: &TestValidator,
        height: i64,
        round: i64,
    ) -> ExtendedVoteInfo {
        let extension = oracle_extension();
        let payload = verifier.signing_payload(height, round, &extension);
        let signature = validator.key.sign(&payload);
        ExtendedVoteInfo {
            validator: Some(Validator {
                address: validator.address.clone().into(),
                power: validator.power,
            }),
            vote_extension: extension,
            extension_signature: Bytes::copy_from_slice(&signature.to_bytes()),
            block_id_flag: BlockIdFlag::Commit as i32,
        }
    }

    fn absent_vote(validator: &TestValidator) -> ExtendedVoteInfo {
        ExtendedVoteInfo {
            validator: Some(Validator {
                address: validator.address.clone().into(),
                power: validator.power,
            }),
            vote_extension: Bytes::new(),
            extension_signature: Bytes::new(),
            block_id_flag: BlockIdFlag::Absent as i32,
        }
    }

    #[test]
    fn enable_height_rule() {
        let v = test_validator(1, 10);
        let verifier = verifier_for(&[&v]);
        assert!(!verifier.enabled(1));
        assert!(verifier.enabled(2));

        let disabled = VoteExtensionVerifier::new(
            "test-chain",
            0,
            FixedStore {
                set: ValidatorSet::default(),
            },
        );
        assert!(!disabled.enabled(100));
    }

    #[test]
    fn accepts_full_participation() {
        let a = test_validator(1, 10);
        let b = test_validator(2, 5);
        let verifier = verifier_for(&[&a, &b]);

        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![commit_vote(&verifier, &a, 5, 0), commit_vote(&verifier, &b, 5, 0)],
        };
        verifier.validate(5, &commit).expect("commit should verify");
    }

    #[test]
    fn accepts_exactly_two_thirds() {
        let a = test_validator(1, 2);
        let b = test_validator(2, 1);
        let verifier = verifier_for(&[&a, &b]);

        // 2 of 3 power commits; 3*2 >= 2*3 holds exactly.
        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![commit_vote(&verifier, &a, 5, 0), absent_vote(&b)],
        };
        verifier.validate(5, &commit).expect("commit should verify");
    }

    #[test]
    fn rejects_insufficient_power() {
        let a = test_validator(1, 1);
        let b = test_validator(2, 2);
        let verifier = verifier_for(&[&a, &b]);

        // Only 1 of 3 power commits.
        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![absent_vote(&b), commit_vote(&verifier, &a, 5, 0)],
        };
        let err = verifier.validate(5, &commit).expect_err("must reject");
        assert!(err.to_string().contains("insufficient voting power"));
    }

    #[test]
    fn rejects_bad_signature() {
        let a = test_validator(1, 10);
        let verifier = verifier_for(&[&a]);

        let mut vote = commit_vote(&verifier, &a, 5, 0);
        // Signature over the wrong height.
        let wrong = verifier.signing_payload(6, 0, &vote.vote_extension);
        vote.extension_signature = Bytes::copy_from_slice(&a.key.sign(&wrong).to_bytes());

        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![vote],
        };
        assert!(verifier.validate(5, &commit).is_err());
    }

    #[test]
    fn rejects_unknown_validator_and_power_mismatch() {
        let a = test_validator(1, 10);
        let stranger = test_validator(9, 10);
        let verifier = verifier_for(&[&a]);

        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![commit_vote(&verifier, &stranger, 5, 0)],
        };
        assert!(verifier.validate(5, &commit).is_err());

        let mut vote = commit_vote(&verifier, &a, 5, 0);
        vote.validator.as_mut().expect("validator present").power = 99;
        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![vote],
        };
        assert!(verifier.validate(5, &commit).is_err());
    }

    #[test]
    fn rejects_non_canonical_vote_order() {
        let a = test_validator(1, 5);
        let b = test_validator(2, 10);
        let verifier = verifier_for(&[&a, &b]);

        // Lower power listed first.
        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![commit_vote(&verifier, &a, 5, 0), commit_vote(&verifier, &b, 5, 0)],
        };
        let err = verifier.validate(5, &commit).expect_err("must reject");
        assert!(err.to_string().contains("canonical order"));
    }

    #[test]
    fn rejects_extension_on_absent_vote() {
        let a = test_validator(1, 10);
        let verifier = verifier_for(&[&a]);

        let mut vote = commit_vote(&verifier, &a, 5, 0);
        vote.block_id_flag = BlockIdFlag::Absent as i32;
        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![vote],
        };
        let err = verifier.validate(5, &commit).expect_err("must reject");
        assert!(err.to_string().contains("carries a vote extension"));
    }

    #[test]
    fn rejects_malformed_oracle_payload() {
        let a = test_validator(1, 10);
        let verifier = verifier_for(&[&a]);

        // A price wider than 256 bits.
        let mut payload = OracleVoteExtension::default();
        payload.prices.insert(1, vec![0xff; 40]);
        let extension: Bytes = payload.encode_to_vec().into();

        let signed = verifier.signing_payload(5, 0, &extension);
        let signature = a.key.sign(&signed);
        let vote = ExtendedVoteInfo {
            validator: Some(Validator {
                address: a.address.clone().into(),
                power: a.power,
            }),
            vote_extension: extension,
            extension_signature: Bytes::copy_from_slice(&signature.to_bytes()),
            block_id_flag: BlockIdFlag::Commit as i32,
        };

        let commit = ExtendedCommitInfo {
            round: 0,
            votes: vec![vote],
        };
        let err = verifier.validate(5, &commit).expect_err("must reject");
        assert!(err.to_string().contains("wider than 256 bits"));
    }
}
