//! リプレイ1件分の解析
//!
//! ラウンドごとに動画を取得し、フレーム分割とラウンド解析をバッチ単位で進める。
//! バッチの解析結果は成功・ラウンド終了・失敗のいずれでも保存してから次に進む。

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::background::BackgroundWorkers;
use crate::config::{AppConfig, ReplayAnalyzerSettings};
use crate::error::{AnalysisResult, BatchOutcome};
use crate::frame_batcher::{Batch, FrameBatcher};
use crate::frame_extractor::{build_decoder, VideoDecoder};
use crate::recognizer::{build_recognizer, InputMode, Recognizer};
use crate::round_analyzer::RoundAnalyzer;
use crate::storage::{Dataset, JsonlDataset, LocalReplayStorage, ReplayStorage};

/// リプレイ解析器
pub struct ReplayAnalyzer {
    settings: ReplayAnalyzerSettings,
    recognizer: Box<dyn Recognizer>,
    batcher: FrameBatcher,
    dataset: Box<dyn Dataset>,
    storage: Arc<dyn ReplayStorage>,
    workers: BackgroundWorkers,
}

impl ReplayAnalyzer {
    pub fn new(
        settings: ReplayAnalyzerSettings,
        recognizer: Box<dyn Recognizer>,
        decoder: Box<dyn VideoDecoder>,
        dataset: Box<dyn Dataset>,
        storage: Arc<dyn ReplayStorage>,
        workers: BackgroundWorkers,
    ) -> Self {
        let batcher = FrameBatcher::new(settings.batcher_config(), decoder);
        Self {
            settings,
            recognizer,
            batcher,
            dataset,
            storage,
            workers,
        }
    }

    /// 設定からローカル実装の解析器を組み立てる
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let storage = &config.storage;
        Ok(Self::new(
            config.replay_analyzer.clone(),
            build_recognizer(&config.game),
            build_decoder(config.replay_analyzer.decoder)?,
            Box::new(JsonlDataset::new(&storage.dataset_dir)),
            Arc::new(LocalReplayStorage::new(
                &storage.replays_dir,
                &storage.download_dir,
                &storage.artifacts_dir,
                storage.skip_download,
            )),
            BackgroundWorkers::with_capacity(config.background.workers, config.background.queue_capacity)?,
        ))
    }

    /// リプレイの全ラウンドを解析する
    ///
    /// 保存済みのラウンドは読み飛ばすので、途中で失敗しても再実行できる。
    pub fn analyze_replay(&self, replay_id: &str) -> AnalysisResult<()> {
        info!(replay_id, "リプレイの解析を開始します");

        let metadata = self.dataset.get_replay_metadata(replay_id)?;
        info!(replay_id, metadata = %metadata.0, "メタデータ");
        let modes = metadata.player_modes()?;

        for round_id in self.storage.list_round_ids(replay_id)? {
            if self.dataset.is_round_analyzed(replay_id, round_id)? {
                info!(replay_id, round_id, "解析済みのラウンドをスキップします");
                continue;
            }

            self.analyze_round(replay_id, round_id, modes)?;
        }

        info!(replay_id, "リプレイの解析が完了しました");
        Ok(())
    }

    fn analyze_round(&self, replay_id: &str, round_id: u32, modes: [InputMode; 2]) -> AnalysisResult<()> {
        let video = self.storage.acquire_round_video(replay_id, round_id)?;

        let mut analyzer = RoundAnalyzer::new(
            self.recognizer.as_ref(),
            self.settings.round_config(),
            replay_id,
            round_id,
            modes,
        )?;

        let result = self.drive_round(&mut analyzer, video.path());

        if self.settings.upload_last_images && self.settings.save_last_images {
            let dir = &self.settings.last_images_dir;
            if dir.is_dir() {
                self.upload_directory(dir, format!("{}/{}/last_images.tar.gz", replay_id, round_id));
            }
        }

        let state = analyzer.state();
        info!(
            replay_id,
            round_id,
            duplicate_frame_count = state.duplicate_frame_count,
            dropped_frame_count = state.dropped_frame_count,
            "ラウンドの解析を終了しました"
        );

        result
    }

    fn drive_round(&self, analyzer: &mut RoundAnalyzer<'_>, video_path: &Path) -> AnalysisResult<()> {
        for batch in self.batcher.split(video_path)? {
            let batch = batch?;

            let outcome = analyzer.analyze_batch(&batch);
            if let Err(e) = &outcome {
                error!(
                    replay_id = analyzer.replay_id(),
                    round_id = analyzer.round_id(),
                    frame_range = ?batch.frame_range,
                    error = %e,
                    "フレーム解析に失敗しました"
                );
            }

            let finalized = self.finalize_batch(analyzer, &batch);

            match (outcome, finalized) {
                (Err(e), Err(flush_error)) => {
                    let message = format!("{:#}", flush_error);
                    error!(error = %message, "解析結果の保存にも失敗しました");
                    return Err(e);
                }
                (Err(e), Ok(())) => return Err(e),
                (Ok(_), Err(flush_error)) => return Err(flush_error.into()),
                (Ok(BatchOutcome::RoundEnded { frame_id }), Ok(())) => {
                    info!(
                        replay_id = analyzer.replay_id(),
                        round_id = analyzer.round_id(),
                        frame_id,
                        "ラウンド終了を検出しました"
                    );
                    break;
                }
                (Ok(BatchOutcome::Completed), Ok(())) => {}
            }
        }

        Ok(())
    }

    /// 蓄積したレコードを保存し、必要ならフレーム画像をアーカイブする
    fn finalize_batch(&self, analyzer: &mut RoundAnalyzer<'_>, batch: &Batch) -> anyhow::Result<()> {
        let records = analyzer.take_records();
        self.dataset
            .insert_frame_records(analyzer.replay_id(), analyzer.round_id(), &records)
            .with_context(|| format!("フレームレコードの保存に失敗しました: {:?}", batch.frame_range))?;

        if self.settings.upload_split_frames && !batch.frame_range.is_empty() {
            let key = format!(
                "{}/{}/frames/{}-{}.tar.gz",
                analyzer.replay_id(),
                analyzer.round_id(),
                batch.frame_range.start,
                batch.frame_range.end - 1
            );
            self.upload_directory(&batch.frame_dir, key);
        }

        Ok(())
    }

    /// ディレクトリをその場でアーカイブし、アップロードはワーカーに任せる
    ///
    /// 失敗してもログに残すだけで解析は止めない。
    fn upload_directory(&self, dir: &Path, key: String) {
        let staged = match self.storage.archive_directory(dir, &key) {
            Ok(staged) => staged,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(key = %key, error = %message, "アーカイブの作成に失敗しました");
                return;
            }
        };

        let storage = Arc::clone(&self.storage);
        self.workers
            .submit(format!("upload {}", key), move || storage.upload_staged(staged));
    }
}
