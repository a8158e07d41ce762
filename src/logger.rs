//! ログ出力の初期化

use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::LogConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// ログファイルのパス
pub fn log_file_path(config: &LogConfig) -> PathBuf {
    config.dir_path.join(&config.file_name)
}

/// 設定に従ってグローバルなサブスクライバを登録する
///
/// 2回目以降の呼び出しはエラーになる。
pub fn init(config: &LogConfig) -> Result<()> {
    let level = LevelFilter::from_str(&config.level)
        .map_err(|_| anyhow!("不正なログレベルです: {}", config.level))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.standard_output {
        let layer: BoxedLayer = if config.json {
            fmt::layer().json().with_writer(std::io::stdout).boxed()
        } else {
            fmt::layer().with_writer(std::io::stdout).boxed()
        };
        layers.push(layer.with_filter(level).boxed());
    }

    if config.file_output {
        std::fs::create_dir_all(&config.dir_path)
            .with_context(|| format!("ログディレクトリの作成に失敗しました: {}", config.dir_path.display()))?;

        let path = log_file_path(config);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!config.clear_everytime)
            .truncate(config.clear_everytime)
            .open(&path)
            .with_context(|| format!("ログファイルを開けませんでした: {}", path.display()))?;
        let writer = Mutex::new(file);

        let layer: BoxedLayer = if config.json {
            fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        };
        layers.push(layer.with_filter(level).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("ログの初期化に失敗しました")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let config = LogConfig {
            dir_path: PathBuf::from("logs"),
            file_name: "a.log".to_string(),
            ..Default::default()
        };
        assert_eq!(log_file_path(&config), PathBuf::from("logs/a.log"));
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LogConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(init(&config).is_err());
    }
}
