//! Block proposal handling
//!
//! Wraps an application's prepare/process handlers. When vote extensions are
//! enabled for a height, the proposer injects the canonical extended-commit
//! bytes as the synthetic first transaction; verifiers require, validate, and
//! strip that transaction before the wrapped handler sees the proposal.
//!
//! Both entry points run synchronously on the consensus thread's hot path and
//! do only bounded work. An `Err` from `prepare_proposal` means the proposer
//! must fall back to an empty proposal; an `Err` from `process_proposal`
//! means REJECT, with the reason in the error.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, info};

use super::types::ExtendedCommitInfo;
use super::ve::{ValidatorStore, VoteExtensionVerifier};

/// Number of synthetic transactions injected into a proposal.
pub const NUM_INJECTED_TXS: usize = 1;

/// Index of the extended commit info within the proposal's transactions.
pub const ORACLE_INFO_INDEX: usize = 0;

#[derive(Debug, Clone)]
pub struct PrepareProposalRequest {
    pub height: i64,
    pub txs: Vec<Bytes>,
    /// The proposer's locally observed extended commit for the last height.
    pub local_last_commit: ExtendedCommitInfo,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareProposalResponse {
    pub txs: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct ProcessProposalRequest {
    pub height: i64,
    pub txs: Vec<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessProposalResponse {
    pub status: ProposalStatus,
}

impl ProcessProposalResponse {
    pub fn accept() -> Self {
        Self {
            status: ProposalStatus::Accept,
        }
    }

    pub fn reject() -> Self {
        Self {
            status: ProposalStatus::Reject,
        }
    }
}

/// The application's proposal-filling handler.
#[async_trait]
pub trait PrepareHandler: Send + Sync {
    async fn prepare(&self, req: PrepareProposalRequest) -> Result<PrepareProposalResponse>;
}

/// The application's transaction-verification handler.
#[async_trait]
pub trait ProcessHandler: Send + Sync {
    async fn process(&self, req: ProcessProposalRequest) -> Result<ProcessProposalResponse>;
}

pub struct ProposalHandler<P, Q, S> {
    prepare_handler: P,
    process_handler: Q,
    verifier: VoteExtensionVerifier<S>,
}

impl<P, Q, S> ProposalHandler<P, Q, S>
where
    P: PrepareHandler,
    Q: ProcessHandler,
    S: ValidatorStore,
{
    pub fn new(prepare_handler: P, process_handler: Q, verifier: VoteExtensionVerifier<S>) -> Self {
        Self {
            prepare_handler,
            process_handler,
            verifier,
        }
    }

    /// Proposer side: validate the local commit, inject its canonical bytes
    /// at index 0, and delegate. If the wrapped handler reordered or dropped
    /// the injected bytes, they are re-prepended unconditionally.
    pub async fn prepare_proposal(
        &self,
        mut req: PrepareProposalRequest,
    ) -> Result<PrepareProposalResponse> {
        if !self.verifier.enabled(req.height) {
            return self.prepare_handler.prepare(req).await;
        }

        info!(height = req.height, "Injecting oracle data into proposal");

        self.verifier
            .validate(req.height, &req.local_last_commit)
            .map_err(|e| {
                error!(height = req.height, error = %e, "Failed to validate local commit");
                e
            })?;

        let ext_bytes = req.local_last_commit.to_bytes();
        req.txs.insert(ORACLE_INFO_INDEX, ext_bytes.clone());

        let mut resp = self
            .prepare_handler
            .prepare(req)
            .await
            .context("wrapped prepare handler failed")?;

        if resp.txs.first() != Some(&ext_bytes) {
            resp.txs.insert(ORACLE_INFO_INDEX, ext_bytes);
        }

        Ok(resp)
    }

    /// Verifier side: require the injected commit at index 0, validate it,
    /// strip it, and delegate the remaining transactions verbatim.
    pub async fn process_proposal(
        &self,
        mut req: ProcessProposalRequest,
    ) -> Result<ProcessProposalResponse> {
        if !self.verifier.enabled(req.height) {
            return self.process_handler.process(req).await;
        }

        if req.txs.len() < NUM_INJECTED_TXS {
            error!(height = req.height, num_txs = req.txs.len(), "Missing commit info");
            bail!("missing commit info");
        }

        let commit = ExtendedCommitInfo::from_bytes(&req.txs[ORACLE_INFO_INDEX])
            .context("failed to unmarshal commit info")?;

        self.verifier.validate(req.height, &commit).map_err(|e| {
            error!(height = req.height, error = %e, "Failed to validate injected commit");
            e
        })?;

        req.txs.drain(..NUM_INJECTED_TXS);
        self.process_handler.process(req).await
    }
}
