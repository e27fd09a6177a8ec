//! 死信回执回放
//!
//! 一次性批处理：范围由 `replay.from_id` / `replay.to_id` 配置（可用 NOTIFY_REPLAY__FROM_ID 等覆盖）。
//! 参数无效（区间为空或渠道不是邮件）或批处理返回错误时以非零码退出。

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use dead_letter_replayer::event_grid::HttpEventPoster;
use dead_letter_replayer::replayer::{DeadLetterReplayer, ReplaySettings};
use dead_letter_replayer::repository::{PgDeadDeliveryReportRepository, PgTerminalStateLookup};
use notify_shared::config::AppConfig;
use notify_shared::database::Database;
use notify_shared::observability;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // 配置或日志初始化失败时订阅器尚未安装，错误只能直接写到 stderr
            eprintln!("{e:?}");
            error!(error = ?e, "死信回放异常终止");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load("dead-letter-replayer")?;
    observability::init(&config.service_name, &config.observability)?;

    let replay = &config.replay;
    let settings = ReplaySettings::from(replay);
    settings.validate()?;

    let db = Database::connect(&config.database).await?;
    let poster = HttpEventPoster::new(
        replay.event_grid_endpoint.clone(),
        replay.event_grid_access_key.clone(),
        Duration::from_secs(replay.request_timeout_secs),
    )?;

    let replayer = DeadLetterReplayer::new(
        Arc::new(PgDeadDeliveryReportRepository::new(db.pool().clone())),
        Arc::new(PgTerminalStateLookup::new(db.pool().clone())),
        Arc::new(poster),
        settings,
    );

    let result = replayer.run().await;
    db.close().await;
    let summary = result?;

    info!(
        posted = summary.posted,
        failed = summary.failed,
        skipped = summary.skipped_resolved + summary.skipped_unparseable,
        "dead-letter-replayer 已完成"
    );
    Ok(())
}
