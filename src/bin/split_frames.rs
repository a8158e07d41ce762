//! 動画をフレーム画像に分割するユーティリティ
//!
//! # 使用方法
//! ```bash
//! cargo run --bin split_frames -- replays/r1/1.mp4 --export-dir output/frames
//! ```
//!
//! 解析は行わず、設定どおりにバッチ単位でフレームを書き出す。
//! `clear_per_batch` は無効にするので、最後に全フレームが残る。

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use replay_input_analyzer::config::AppConfig;
use replay_input_analyzer::frame_batcher::FrameBatcher;
use replay_input_analyzer::frame_extractor::build_decoder;
use replay_input_analyzer::logger;

#[derive(Parser)]
#[command(name = "split_frames")]
#[command(about = "動画をフレーム画像に分割する")]
struct Args {
    /// 入力動画
    video: PathBuf,

    /// 書き出し先（省略時は設定の export_dir）
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// 1バッチのフレーム数
    #[arg(long)]
    batch_size: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("=== フレーム分割 ===\n");

    let config = AppConfig::load_or_default()?;
    logger::init(&config.log)?;
    let settings = &config.replay_analyzer;

    let mut batcher_config = settings.batcher_config();
    batcher_config.clear_per_batch = false;
    batcher_config.skip_split = false;
    if let Some(dir) = args.export_dir {
        batcher_config.export_dir = dir;
    }
    if let Some(size) = args.batch_size {
        batcher_config.batch_size = size;
    }

    let decoder = build_decoder(settings.decoder)?;
    let batcher = FrameBatcher::new(batcher_config, decoder);

    let mut frame_count = 0;
    for batch in batcher.split(&args.video)? {
        let batch = batch?;
        frame_count += batch.frame_range.end - batch.frame_range.start;
        println!(
            "  バッチ {}..{} / 総フレーム数 {}",
            batch.frame_range.start, batch.frame_range.end, batch.total_frame_count
        );
    }

    println!("\n✓ {}フレームを書き出しました", frame_count);
    println!("  出力先: {}", batcher.config().export_dir.display());

    Ok(())
}
