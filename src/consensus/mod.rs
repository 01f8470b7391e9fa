//! Consensus-side integration
//!
//! Ships the oracle output into deterministic state: the proposal handler
//! injects the canonical extended-commit-info bytes as the synthetic first
//! transaction of a block proposal and verifies them on receipt, and the
//! vote-extension validator checks that a commit carries a supermajority of
//! correctly signed extensions.

pub mod proposals;
pub mod types;
pub mod ve;

pub use proposals::{
    PrepareHandler, PrepareProposalRequest, PrepareProposalResponse, ProcessHandler,
    ProcessProposalRequest, ProcessProposalResponse, ProposalHandler, ProposalStatus,
    NUM_INJECTED_TXS, ORACLE_INFO_INDEX,
};
pub use ve::{ValidatorSet, ValidatorStore, VoteExtensionVerifier};
