use std::sync::Arc;

use ptt_voice_rs::config::Config;
use ptt_voice_rs::server::{self, ContextSource, NoContext, StaticContext, ToneSpeechGenerator};
use tokio::signal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new().map_err(anyhow::Error::msg)?;

    // 可选：从文件加载上下文（记忆），原样交给生成器
    let context: Arc<dyn ContextSource> = match std::env::var("PTT_CONTEXT_FILE") {
        Ok(path) => {
            let blob = std::fs::read_to_string(&path)?;
            log::info!("Loaded context from {} ({} bytes)", path, blob.len());
            Arc::new(StaticContext(blob))
        }
        Err(_) => Arc::new(NoContext),
    };
    let generator = Arc::new(ToneSpeechGenerator::new(config.server.sample_rate));

    log::info!("{} server {} starting", config.app_name, config.app_version);
    tokio::select! {
        r = server::serve(config.server.clone(), generator, context) => r?,
        _ = signal::ctrl_c() => log::info!("Received Ctrl+C, shutting down..."),
    }
    Ok(())
}
