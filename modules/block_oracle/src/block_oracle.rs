//! Obelisk block oracle module for Caryatid
//! Acquires, caches and distributes full blocks for a tracked chain

mod configuration;
pub mod downloader;
pub mod header_chain;
pub mod multiplexer;
pub mod oracle;
pub mod store;

use std::sync::Arc;

use anyhow::{bail, Result};
use caryatid_sdk::{module, Context, Module};
use config::Config;
use obelisk_common::messages::{
    BlockReadyMessage, BlockReplyMessage, Message, OracleCommand, ProgressMessage,
    TipUpdateMessage,
};
use obelisk_common::BlockHash;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::configuration::OracleConfig;
use crate::header_chain::MemoryHeaderChain;
use crate::oracle::{Oracle, Outbound};
use crate::store::{BlockStore, MemoryBlockStore, SharedStore};

/// Block oracle module
#[module(
    message_type(Message),
    name = "block-oracle",
    description = "Block acquisition and delivery oracle"
)]
pub struct BlockOracle;

impl BlockOracle {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = OracleConfig::try_load(&config)?;

        let store: Arc<dyn BlockStore> = match cfg.store.as_str() {
            "memory" => Arc::new(MemoryBlockStore::new()),
            _ => bail!("Unknown store type {}", cfg.store),
        };
        let shared = Arc::new(SharedStore::new(store, cfg.download_blocks));
        let headers = Arc::new(MemoryHeaderChain::new());

        let mut oracle = Oracle::new(
            cfg.chain.clone(),
            shared.clone(),
            headers.clone(),
            cfg.fetch_batch_size,
        );
        let outbound = oracle.start()?;
        Self::publish_outbound(&context, &cfg, outbound).await;
        let oracle = Arc::new(Mutex::new(oracle));

        info!(
            chain = cfg.chain,
            "Creating subscriber on '{}'", cfg.request_topic
        );

        // Client block requests
        let mut requests = context.subscribe(&cfg.request_topic).await?;
        {
            let oracle = oracle.clone();
            let cfg = cfg.clone();
            let context = context.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = requests.read().await else {
                        return;
                    };
                    match message.as_ref() {
                        Message::BlockRequest(request) => {
                            let result = oracle
                                .lock()
                                .await
                                .handle_request_blocks(&request.requestor, &request.hashes);
                            match result {
                                Ok(outbound) => {
                                    Self::publish_outbound(&context, &cfg, outbound).await
                                }
                                Err(e) => error!("Cannot handle block request: {e:#}"),
                            }
                        }
                        _ => error!("Unexpected message type: {message:?}"),
                    }
                }
            });
        }

        // Async store lookup completions
        let mut ready = context.subscribe(&cfg.block_ready_topic).await?;
        {
            let oracle = oracle.clone();
            let cfg = cfg.clone();
            let context = context.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = ready.read().await else {
                        return;
                    };
                    match message.as_ref() {
                        Message::BlockReady(completion) => {
                            let result =
                                oracle.lock().await.handle_block_ready(&completion.blocks);
                            match result {
                                Ok(outbound) => {
                                    Self::publish_outbound(&context, &cfg, outbound).await
                                }
                                Err(e) => error!("Cannot handle block-ready: {e:#}"),
                            }
                        }
                        _ => error!("Unexpected message type: {message:?}"),
                    }
                }
            });
        }

        // Submitted raw blocks. The memory store completes its lookups
        // synchronously, so the completion is posted straight back to the
        // block-ready topic to arrive like any other async completion.
        let mut submissions = context.subscribe(&cfg.submit_topic).await?;
        {
            let oracle = oracle.clone();
            let shared = shared.clone();
            let cfg = cfg.clone();
            let context = context.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = submissions.read().await else {
                        return;
                    };
                    match message.as_ref() {
                        Message::SubmitBlock(submit) => {
                            let hash = BlockHash::digest(&submit.raw);
                            let result =
                                oracle.lock().await.handle_submit_block(submit.raw.clone());
                            if let Err(e) = result {
                                error!("Cannot store submitted block {hash}: {e:#}");
                                continue;
                            }
                            match shared.get_blocks(&[hash]) {
                                Ok(locations) => {
                                    let message =
                                        Arc::new(Message::BlockReady(BlockReadyMessage {
                                            blocks: vec![(hash, locations[0])],
                                        }));
                                    if let Err(e) =
                                        context.publish(&cfg.block_ready_topic, message).await
                                    {
                                        error!("Cannot publish block-ready: {e:#}");
                                    }
                                }
                                Err(e) => error!("Cannot look up submitted block: {e:#}"),
                            }
                        }
                        _ => error!("Unexpected message type: {message:?}"),
                    }
                }
            });
        }

        // Control commands
        let mut commands = context.subscribe(&cfg.command_topic).await?;
        {
            let oracle = oracle.clone();
            let cfg = cfg.clone();
            let context = context.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = commands.read().await else {
                        return;
                    };
                    match message.as_ref() {
                        Message::Command(OracleCommand::Report) => {
                            let outbound = oracle.lock().await.report();
                            Self::publish_outbound(&context, &cfg, outbound).await;
                        }
                        Message::Command(OracleCommand::Shutdown) => {
                            oracle.lock().await.shutdown();
                        }
                        _ => error!("Unexpected message type: {message:?}"),
                    }
                }
            });
        }

        // Header chain announcements keep the collaborator current - the
        // oracle itself takes no action on them; the next work cycle picks
        // up whatever the header chain now reports
        let mut announcements = context.subscribe(&cfg.header_topic).await?;
        {
            let headers = headers.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = announcements.read().await else {
                        return;
                    };
                    match message.as_ref() {
                        Message::HeaderAnnounce(header) => {
                            debug!(
                                height = header.height,
                                hash = %header.hash,
                                "header announced"
                            );
                            headers.announce(header.height, header.hash);
                        }
                        Message::Reorg(reorg) => {
                            info!(height = reorg.height, "header chain rolled back");
                            headers.rollback_to(reorg.height);
                        }
                        _ => error!("Unexpected message type: {message:?}"),
                    }
                }
            });
        }

        // Periodic work ticks
        if cfg.download_blocks {
            let mut ticks = context.subscribe("clock.tick").await?;
            let oracle = oracle.clone();
            let cfg = cfg.clone();
            let context = context.clone();
            context.clone().run(async move {
                loop {
                    let Ok((_, message)) = ticks.read().await else {
                        return;
                    };
                    if !matches!(message.as_ref(), Message::Clock(_)) {
                        continue;
                    }
                    // Keep cycling while the downloader reports more work;
                    // a failed cycle waits for the next tick instead
                    loop {
                        let outcome = oracle.lock().await.work();
                        match outcome {
                            Ok(outcome) => {
                                Self::publish_outbound(&context, &cfg, outcome.outbound).await;
                                if !outcome.more {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Work cycle failed, will retry: {e:#}");
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    async fn publish_outbound(
        context: &Context<Message>,
        cfg: &OracleConfig,
        outbound: Vec<Outbound>,
    ) {
        for item in outbound {
            let (topic, message) = match item {
                Outbound::Reply { requestor, blocks } => (
                    requestor.topic().to_string(),
                    Arc::new(Message::BlockReply(BlockReplyMessage { blocks })),
                ),
                Outbound::TipUpdate(position) => (
                    cfg.tip_topic.clone(),
                    Arc::new(Message::TipUpdate(TipUpdateMessage {
                        height: position.height,
                        hash: position.hash,
                    })),
                ),
                Outbound::Progress { chain, position } => (
                    cfg.progress_topic.clone(),
                    Arc::new(Message::Progress(ProgressMessage {
                        chain,
                        height: position.height,
                        hash: position.hash,
                    })),
                ),
            };
            if let Err(e) = context.publish(&topic, message).await {
                error!("Cannot publish to {topic}: {e:#}");
            }
        }
    }
}
