//! リプレイ入力解析 CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use replay_input_analyzer::background::{BackgroundWorkers, JobScheduler, SpoolScheduler};
use replay_input_analyzer::config::AppConfig;
use replay_input_analyzer::logger;
use replay_input_analyzer::replay_analyzer::ReplayAnalyzer;

#[derive(Parser)]
#[command(name = "replay_input_analyzer")]
#[command(about = "リプレイ動画から両プレイヤーの入力ログを復元する")]
#[command(version)]
struct Cli {
    /// 設定ファイル（省略時は config.toml、無ければデフォルト値）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// リプレイを解析する
    Analyze {
        /// リプレイID（省略時は設定・環境変数の値）
        replay_id: Option<String>,
    },

    /// 後続の解析ジョブを登録する
    Schedule {
        /// リプレイID
        #[arg(required = true)]
        replay_ids: Vec<String>,
    },

    /// 登録済みのジョブをすべて解析する
    Pending,
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load(&path)?;
            config.apply_env();
            Ok(config)
        }
        None => AppConfig::load_or_default(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    logger::init(&config.log)?;

    match cli.command {
        Commands::Analyze { replay_id } => {
            let replay_id = replay_id
                .or_else(|| config.replay_analyzer.replay_id.clone())
                .context("リプレイIDが指定されていません")?;

            let analyzer = ReplayAnalyzer::from_config(&config)?;
            analyzer.analyze_replay(&replay_id)?;
        }
        Commands::Schedule { replay_ids } => {
            let scheduler: Arc<dyn JobScheduler> = Arc::new(SpoolScheduler::new(&config.background.spool_dir));
            let workers = BackgroundWorkers::with_capacity(config.background.workers, config.background.queue_capacity)?;

            for replay_id in replay_ids {
                let scheduler = Arc::clone(&scheduler);
                workers.submit(format!("schedule {}", replay_id), move || {
                    scheduler.schedule_analysis(&replay_id)
                });
            }
        }
        Commands::Pending => {
            let scheduler = SpoolScheduler::new(&config.background.spool_dir);
            let pending = scheduler.pending()?;
            info!(count = pending.len(), "未処理のジョブ");

            let analyzer = ReplayAnalyzer::from_config(&config)?;
            let mut failed = 0;
            for replay_id in pending {
                match analyzer.analyze_replay(&replay_id) {
                    Ok(()) => scheduler.complete(&replay_id)?,
                    Err(e) => {
                        failed += 1;
                        error!(replay_id, error = %e, "リプレイの解析に失敗しました");
                    }
                }
            }

            if failed > 0 {
                anyhow::bail!("{}件のリプレイの解析に失敗しました", failed);
            }
        }
    }

    Ok(())
}
