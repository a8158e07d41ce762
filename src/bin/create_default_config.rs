//! デフォルト設定ファイルを生成するユーティリティ
//!
//! # 使用方法
//! ```bash
//! cargo run --bin create_default_config -- --output config.toml
//! ```

use clap::Parser;
use std::path::PathBuf;

use replay_input_analyzer::config::{AppConfig, REPLAY_ID_ENV};

#[derive(Parser)]
#[command(about = "デフォルトの config.toml を書き出す")]
struct Args {
    /// 出力先（省略時は config.toml）
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 既存のファイルを上書きする
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = args.output.unwrap_or_else(AppConfig::default_path);

    if path.exists() && !args.force {
        anyhow::bail!("設定ファイルが既に存在します（--force で上書き）: {}", path.display());
    }

    let config = AppConfig::default();
    config.display();
    config.save(&path)?;

    println!("✓ {} を書き出しました", path.display());
    println!("リプレイIDは環境変数 {} でも指定できます。", REPLAY_ID_ENV);

    Ok(())
}
