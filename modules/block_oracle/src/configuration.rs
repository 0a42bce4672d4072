use anyhow::Result;
use config::Config;

#[derive(Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OracleConfig {
    /// Chain identifier carried in progress notifications
    pub chain: String,

    /// Whether this oracle actively pulls blocks towards the header tip
    pub download_blocks: bool,

    /// Upper bound on hashes queued per work cycle
    pub fetch_batch_size: usize,

    /// Store backend selector
    pub store: String,

    pub request_topic: String,
    pub block_ready_topic: String,
    pub submit_topic: String,
    pub command_topic: String,
    pub header_topic: String,
    pub tip_topic: String,
    pub progress_topic: String,
}

impl OracleConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}
