//! Canonical consensus wire types
//!
//! Hand-derived prost messages for the extended commit and the oracle
//! vote-extension payload. The proposer and every verifier must produce
//! byte-identical encodings for the same logical input, so the commit
//! carries its votes in an explicitly ordered list; nothing here encodes a
//! map in iteration order.

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

/// Flag carried per vote, mirroring the consensus engine's block-ID flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BlockIdFlag {
    Unknown = 0,
    /// The validator did not vote.
    Absent = 1,
    /// The validator committed to the block; extension + signature present.
    Commit = 2,
    /// The validator voted nil.
    Nil = 3,
}

/// Identity and power of one validator, as recorded in a commit.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Validator {
    #[prost(bytes = "bytes", tag = "1")]
    pub address: Bytes,
    #[prost(int64, tag = "2")]
    pub power: i64,
}

/// One validator's vote for a height, with its signed vote extension.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtendedVoteInfo {
    #[prost(message, optional, tag = "1")]
    pub validator: Option<Validator>,
    #[prost(bytes = "bytes", tag = "2")]
    pub vote_extension: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub extension_signature: Bytes,
    #[prost(enumeration = "BlockIdFlag", tag = "4")]
    pub block_id_flag: i32,
}

impl ExtendedVoteInfo {
    pub fn flag(&self) -> BlockIdFlag {
        BlockIdFlag::try_from(self.block_id_flag).unwrap_or(BlockIdFlag::Unknown)
    }
}

/// The aggregate of all validators' vote extensions for one height. Its
/// canonical bytes are the payload injected as the synthetic first
/// transaction of a proposal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtendedCommitInfo {
    #[prost(int32, tag = "1")]
    pub round: i32,
    #[prost(message, repeated, tag = "2")]
    pub votes: Vec<ExtendedVoteInfo>,
}

impl ExtendedCommitInfo {
    /// Canonical byte encoding.
    pub fn to_bytes(&self) -> Bytes {
        self.encode_to_vec().into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

/// The payload each validator signs over: the extension bound to its height,
/// round, and chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CanonicalVoteExtension {
    #[prost(bytes = "bytes", tag = "1")]
    pub extension: Bytes,
    #[prost(int64, tag = "2")]
    pub height: i64,
    #[prost(int64, tag = "3")]
    pub round: i64,
    #[prost(string, tag = "4")]
    pub chain_id: String,
}

/// The oracle payload embedded in each vote extension: pair id to the
/// big-endian bytes of the observed price.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OracleVoteExtension {
    #[prost(map = "uint64, bytes", tag = "1")]
    pub prices: HashMap<u64, Vec<u8>>,
}
