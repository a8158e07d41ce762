//! アプリケーション設定
//!
//! `config.toml` から読み込む。ファイルが無ければデフォルト値を使う。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::background::DEFAULT_QUEUE_CAPACITY;
use crate::frame_batcher::FrameBatcherConfig;
use crate::frame_extractor::DecoderKind;
use crate::round_analyzer::RoundAnalyzerConfig;

/// 解析対象のリプレイIDを上書きする環境変数
pub const REPLAY_ID_ENV: &str = "REPLAY_ANALYZER_REPLAY_ID";

/// 設定ファイル全体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub game: GameConfig,
    pub replay_analyzer: ReplayAnalyzerSettings,
    pub storage: StorageConfig,
    pub background: BackgroundConfig,
}

/// ログ出力の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 最大ログレベル（trace/debug/info/warn/error）
    pub level: String,
    /// JSON形式で出力する
    pub json: bool,
    pub standard_output: bool,
    pub file_output: bool,
    pub dir_path: PathBuf,
    pub file_name: String,
    /// 起動ごとにログファイルを空にする
    pub clear_everytime: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            standard_output: true,
            file_output: false,
            dir_path: PathBuf::from("logs"),
            file_name: "replay_analyzer.log".to_string(),
            clear_everytime: false,
        }
    }
}

/// 対応ゲームタイトル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameTitle {
    #[default]
    Sf6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub title: GameTitle,
    /// `<templates_dir>/<幅>x<高さ>/<用途>/` にテンプレート画像を置く
    pub templates_dir: PathBuf,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            title: GameTitle::Sf6,
            templates_dir: PathBuf::from("templates/sf6"),
        }
    }
}

/// リプレイ解析の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayAnalyzerSettings {
    /// 解析対象のリプレイID（CLI引数・環境変数で上書き可能）
    pub replay_id: Option<String>,
    pub export_dir: PathBuf,
    pub batch_size: u64,
    pub clear_per_batch: bool,
    pub skip_split: bool,
    pub decoder: DecoderKind,
    pub jpeg_quality: u8,
    pub start_frame_at: Option<u64>,
    pub stop_frame_at: Option<u64>,
    pub log_collapsed_inputs: bool,
    pub verify_inputs_count: bool,
    /// バッチごとのフレーム画像をアーカイブしてアップロードする
    pub upload_split_frames: bool,
    /// ラウンド終了時に診断画像をアップロードする
    pub upload_last_images: bool,
    pub save_last_images: bool,
    pub last_images_dir: PathBuf,
}

impl Default for ReplayAnalyzerSettings {
    fn default() -> Self {
        let batcher = FrameBatcherConfig::default();
        Self {
            replay_id: None,
            export_dir: batcher.export_dir,
            batch_size: batcher.batch_size,
            clear_per_batch: batcher.clear_per_batch,
            skip_split: batcher.skip_split,
            decoder: DecoderKind::default(),
            jpeg_quality: batcher.jpeg_quality,
            start_frame_at: None,
            stop_frame_at: None,
            log_collapsed_inputs: false,
            verify_inputs_count: true,
            upload_split_frames: false,
            upload_last_images: true,
            save_last_images: true,
            last_images_dir: PathBuf::from("last_images"),
        }
    }
}

impl ReplayAnalyzerSettings {
    pub fn batcher_config(&self) -> FrameBatcherConfig {
        FrameBatcherConfig {
            export_dir: self.export_dir.clone(),
            batch_size: self.batch_size,
            clear_per_batch: self.clear_per_batch,
            skip_split: self.skip_split,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn round_config(&self) -> RoundAnalyzerConfig {
        RoundAnalyzerConfig {
            start_frame_at: self.start_frame_at,
            stop_frame_at: self.stop_frame_at,
            log_collapsed_inputs: self.log_collapsed_inputs,
            verify_inputs_count: self.verify_inputs_count,
            last_images_dir: self.save_last_images.then(|| self.last_images_dir.clone()),
        }
    }
}

/// ローカルストレージの配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 録画済みリプレイ `<replays_dir>/<replay_id>/<round_id>.mp4`
    pub replays_dir: PathBuf,
    /// 解析中の動画の置き場所
    pub download_dir: PathBuf,
    /// 動画を `download_dir` に置かれたまま使い、削除もしない
    pub skip_download: bool,
    /// アップロードされたアーカイブの保存先
    pub artifacts_dir: PathBuf,
    /// フレームレコードとリプレイメタデータ
    pub dataset_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            replays_dir: PathBuf::from("replays"),
            download_dir: PathBuf::from("downloads"),
            skip_download: false,
            artifacts_dir: PathBuf::from("artifacts"),
            dataset_dir: PathBuf::from("dataset"),
        }
    }
}

/// バックグラウンド処理の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// ワーカースレッド数
    pub workers: usize,
    /// 待機できるタスク数。一杯になると解析側が待つ
    pub queue_capacity: usize,
    /// 後続解析ジョブの置き場所
    pub spool_dir: PathBuf,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            spool_dir: PathBuf::from("spool"),
        }
    }
}

impl AppConfig {
    /// デフォルトの設定ファイルパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    /// 設定ファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルの読み込みに失敗しました: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("設定ファイルの解析に失敗しました: {}", path.display()))?;
        Ok(config)
    }

    /// デフォルトパスにあれば読み込み、無ければデフォルト値。環境変数を反映する
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// 環境変数による上書き
    pub fn apply_env(&mut self) {
        self.apply_replay_id_override(std::env::var(REPLAY_ID_ENV).ok());
    }

    fn apply_replay_id_override(&mut self, replay_id: Option<String>) {
        if let Some(replay_id) = replay_id.filter(|id| !id.trim().is_empty()) {
            self.replay_analyzer.replay_id = Some(replay_id);
        }
    }

    /// 設定ファイルを保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("設定ディレクトリの作成に失敗しました: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("設定のシリアライズに失敗しました")?;
        fs::write(path, contents)
            .with_context(|| format!("設定ファイルの書き込みに失敗しました: {}", path.display()))?;
        Ok(())
    }

    /// 設定内容を表示
    pub fn display(&self) {
        let ra = &self.replay_analyzer;
        println!("[log]");
        println!("  レベル: {} (json: {})", self.log.level, self.log.json);
        println!(
            "  出力: 標準出力={} ファイル={} ({})",
            self.log.standard_output,
            self.log.file_output,
            self.log.dir_path.join(&self.log.file_name).display()
        );
        println!("[game]");
        println!("  タイトル: {:?}", self.game.title);
        println!("  テンプレート: {}", self.game.templates_dir.display());
        println!("[replay_analyzer]");
        println!("  リプレイID: {}", ra.replay_id.as_deref().unwrap_or("(未指定)"));
        println!("  フレーム書き出し先: {}", ra.export_dir.display());
        println!("  バッチサイズ: {} (バッチごとに削除: {})", ra.batch_size, ra.clear_per_batch);
        println!("  デコーダ: {:?} / JPEG品質: {}", ra.decoder, ra.jpeg_quality);
        println!("  入力数の検証: {}", ra.verify_inputs_count);
        println!("[storage]");
        println!("  リプレイ: {}", self.storage.replays_dir.display());
        println!("  データセット: {}", self.storage.dataset_dir.display());
        println!("  アーカイブ: {}", self.storage.artifacts_dir.display());
        println!("[background]");
        println!("  ワーカー数: {}", self.background.workers);
        println!("  キュー容量: {}", self.background.queue_capacity);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = AppConfig::default();
        config.replay_analyzer.batch_size = 120;
        config.replay_analyzer.stop_frame_at = Some(4000);
        config.replay_analyzer.decoder = DecoderKind::Gstreamer;
        config.storage.skip_download = true;

        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [replay_analyzer]
            batch_size = 60
            decoder = "ffmpeg"

            [game]
            title = "sf6"
            "#,
        )
        .unwrap();

        assert_eq!(config.replay_analyzer.batch_size, 60);
        assert!(config.replay_analyzer.clear_per_batch);
        assert_eq!(config.log, LogConfig::default());
        assert_eq!(config.background.workers, 2);
        assert_eq!(config.background.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_replay_id_override() {
        let mut config = AppConfig::default();
        config.apply_replay_id_override(Some("  ".to_string()));
        assert_eq!(config.replay_analyzer.replay_id, None);

        config.apply_replay_id_override(Some("abc123".to_string()));
        assert_eq!(config.replay_analyzer.replay_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_round_config_respects_save_last_images() {
        let mut settings = ReplayAnalyzerSettings::default();
        assert_eq!(settings.round_config().last_images_dir, Some(PathBuf::from("last_images")));

        settings.save_last_images = false;
        assert_eq!(settings.round_config().last_images_dir, None);
        assert_eq!(settings.batcher_config().batch_size, settings.batch_size);
    }
}
