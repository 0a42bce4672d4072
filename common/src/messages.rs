//! Definition of Obelisk messages

// We don't use these messages in the obelisk_common crate itself
#![allow(dead_code)]

use crate::types::*;

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

/// Request for blocks by hash, carrying the requestor's reply topic
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockRequestMessage {
    /// Where to send the reply
    pub requestor: RequestorId,

    /// Hashes wanted, in the requestor's preferred order
    pub hashes: Vec<BlockHash>,
}

/// Completion of a batch of asynchronous store location lookups
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockReadyMessage {
    /// Hash/location pairs, valid or not
    pub blocks: Vec<(BlockHash, BlockLocation)>,
}

/// Raw block bytes submitted for validation and storage
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitBlockMessage {
    /// Raw Data
    pub raw: Vec<u8>,
}

/// Reply to a requestor - every pair carries a valid location
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockReplyMessage {
    /// Hash/location pairs in the order they became available
    pub blocks: Vec<(BlockHash, BlockLocation)>,
}

/// External signal that a new full block is on the chain
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TipUpdateMessage {
    /// Block height
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,
}

/// Internal progress notification scoped to one chain
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProgressMessage {
    /// Chain identifier
    pub chain: String,

    /// Block height
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,
}

/// A new header announced by the header-chain oracle
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeaderAnnounceMessage {
    /// Block height
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,
}

/// The header chain rolled back to the given height
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReorgMessage {
    /// Height of the fork point - everything above it is orphaned
    pub height: u64,
}

/// Control commands for the block oracle
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum OracleCommand {
    /// Broadcast the current tip
    Report,

    /// Release collaborators and stop
    Shutdown,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()),                             // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),                       // Simple string
    JSON(serde_json::Value),              // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage),              // Clock tick

    // Block oracle messages
    BlockRequest(BlockRequestMessage),    // Client wants blocks by hash
    BlockReady(BlockReadyMessage),        // Store lookup batch completed
    SubmitBlock(SubmitBlockMessage),      // Raw block for storage
    BlockReply(BlockReplyMessage),        // Blocks delivered to a requestor
    TipUpdate(TipUpdateMessage),          // New full block on the chain
    Progress(ProgressMessage),            // Chain-scoped progress
    HeaderAnnounce(HeaderAnnounceMessage),// Header chain advanced
    Reorg(ReorgMessage),                  // Header chain rolled back
    Command(OracleCommand),               // Oracle control command
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<BlockRequestMessage> for Message {
    fn from(msg: BlockRequestMessage) -> Self {
        Message::BlockRequest(msg)
    }
}

impl From<BlockReadyMessage> for Message {
    fn from(msg: BlockReadyMessage) -> Self {
        Message::BlockReady(msg)
    }
}

impl From<SubmitBlockMessage> for Message {
    fn from(msg: SubmitBlockMessage) -> Self {
        Message::SubmitBlock(msg)
    }
}

impl From<BlockReplyMessage> for Message {
    fn from(msg: BlockReplyMessage) -> Self {
        Message::BlockReply(msg)
    }
}

impl From<TipUpdateMessage> for Message {
    fn from(msg: TipUpdateMessage) -> Self {
        Message::TipUpdate(msg)
    }
}

impl From<ProgressMessage> for Message {
    fn from(msg: ProgressMessage) -> Self {
        Message::Progress(msg)
    }
}

impl From<HeaderAnnounceMessage> for Message {
    fn from(msg: HeaderAnnounceMessage) -> Self {
        Message::HeaderAnnounce(msg)
    }
}

impl From<ReorgMessage> for Message {
    fn from(msg: ReorgMessage) -> Self {
        Message::Reorg(msg)
    }
}

impl From<OracleCommand> for Message {
    fn from(msg: OracleCommand) -> Self {
        Message::Command(msg)
    }
}
