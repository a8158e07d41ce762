//! 動画をフレーム画像に分割してバッチ単位で渡す
//!
//! フレームは`<export_dir>/<フレーム番号>.jpeg`として書き出される。
//! `clear_per_batch`が有効な場合、次のバッチを要求された時点で前のバッチの画像を
//! 消すので、呼び出し側は受け取ったバッチを処理し終えてから次を要求すること。

use crate::error::{AnalysisError, AnalysisResult};
use crate::frame_extractor::{save_jpeg, FrameStream, VideoDecoder};
use anyhow::Context;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::info;

/// 解析対象として許容する最低フレームレート
pub const MIN_FPS: f64 = 60.0;

/// 解析対象として許容する最低フレーム数
pub const MIN_FRAME_COUNT: u64 = 60;

/// フレーム分割の設定
#[derive(Debug, Clone)]
pub struct FrameBatcherConfig {
    /// フレーム画像の書き出し先
    pub export_dir: PathBuf,
    /// 1バッチのフレーム数
    pub batch_size: u64,
    /// バッチごとに書き出し先を空にする
    pub clear_per_batch: bool,
    /// 分割を行わず、書き出し先に既にある画像を1バッチとして渡す
    pub skip_split: bool,
    /// JPEGの品質（0-100）
    pub jpeg_quality: u8,
}

impl Default for FrameBatcherConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("output/frames"),
            batch_size: 600,
            clear_per_batch: true,
            skip_split: false,
            jpeg_quality: 95,
        }
    }
}

/// 連続したフレームの集まり
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub frame_range: Range<u64>,
    pub frame_dir: PathBuf,
    /// 元動画の総フレーム数
    pub total_frame_count: u64,
}

impl Batch {
    /// フレーム画像のパス
    pub fn frame_path(&self, frame_id: u64) -> PathBuf {
        frame_path(&self.frame_dir, frame_id)
    }
}

pub fn frame_path(dir: &Path, frame_id: u64) -> PathBuf {
    dir.join(format!("{}.jpeg", frame_id))
}

/// 書き出し先を空の状態で作り直す
fn reset_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("ディレクトリの削除に失敗しました: {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("ディレクトリの作成に失敗しました: {}", dir.display()))?;
    Ok(())
}

/// フレーム分割器
pub struct FrameBatcher {
    config: FrameBatcherConfig,
    decoder: Box<dyn VideoDecoder>,
}

impl FrameBatcher {
    /// 新しいフレーム分割器を作成
    pub fn new(config: FrameBatcherConfig, decoder: Box<dyn VideoDecoder>) -> Self {
        Self { config, decoder }
    }

    pub fn config(&self) -> &FrameBatcherConfig {
        &self.config
    }

    /// 動画をバッチに分割する
    ///
    /// 動画の検証はここで行い、フレームのデコードはイテレータを進めたときに行う。
    pub fn split(&self, video_path: &Path) -> AnalysisResult<Batches> {
        let export_dir = self.config.export_dir.clone();

        if self.config.skip_split {
            info!(
                video_path = %video_path.display(),
                "設定によりフレーム分割をスキップします"
            );
            let batch = existing_frames_batch(&export_dir)?;
            return Ok(Batches {
                state: BatchesState::Prepared(Some(batch)),
            });
        }

        reset_dir(&export_dir)?;

        info!(video_path = %video_path.display(), "動画ファイルを開いています");
        let stream = self.decoder.open(video_path)?;
        let video = stream.info().clone();
        info!(
            width = video.width,
            height = video.height,
            fps = video.fps,
            frame_count = video.frame_count,
            "動画情報"
        );

        if video.fps < MIN_FPS || video.frame_count < MIN_FRAME_COUNT {
            return Err(AnalysisError::InvalidVideo {
                fps: video.fps,
                frame_count: video.frame_count,
            });
        }

        info!(
            export_dir = %export_dir.display(),
            batch_size = self.config.batch_size,
            "フレームをバッチ単位で書き出します"
        );

        Ok(Batches {
            state: BatchesState::Decoding(DecodingBatches {
                stream,
                export_dir,
                batch_size: self.config.batch_size.max(1),
                clear_per_batch: self.config.clear_per_batch,
                jpeg_quality: self.config.jpeg_quality,
                total_frame_count: video.frame_count,
                next_frame_id: 0,
                pending_clear: false,
                finished: false,
            }),
        })
    }
}

/// 書き出し先に既にあるフレーム画像を1バッチにまとめる
fn existing_frames_batch(dir: &Path) -> AnalysisResult<Batch> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("フレームディレクトリを読めませんでした: {}", dir.display()))?;

    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("jpeg") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }

    let (Some(&first), Some(&last)) = (ids.iter().min(), ids.iter().max()) else {
        return Err(anyhow::anyhow!("フレーム画像が見つかりません: {}", dir.display()).into());
    };

    Ok(Batch {
        frame_range: first..last + 1,
        frame_dir: dir.to_path_buf(),
        total_frame_count: ids.len() as u64,
    })
}

/// バッチのイテレータ（一度しか走査できない）
pub struct Batches {
    state: BatchesState,
}

enum BatchesState {
    Prepared(Option<Batch>),
    Decoding(DecodingBatches),
}

struct DecodingBatches {
    stream: Box<dyn FrameStream>,
    export_dir: PathBuf,
    batch_size: u64,
    clear_per_batch: bool,
    jpeg_quality: u8,
    total_frame_count: u64,
    next_frame_id: u64,
    pending_clear: bool,
    finished: bool,
}

impl DecodingBatches {
    fn next_batch(&mut self) -> Option<AnalysisResult<Batch>> {
        // 前のバッチは呼び出し側が処理済み
        if self.pending_clear {
            self.pending_clear = false;
            if let Err(e) = reset_dir(&self.export_dir) {
                self.finished = true;
                return Some(Err(e.into()));
            }
            info!(export_dir = %self.export_dir.display(), "書き出し先を空にしました");
        }

        if self.finished {
            return None;
        }

        let start = self.next_frame_id;
        while self.next_frame_id - start < self.batch_size {
            match self.stream.next_frame() {
                Ok(Some(image)) => {
                    let path = frame_path(&self.export_dir, self.next_frame_id);
                    if let Err(e) = save_jpeg(&image, &path, self.jpeg_quality) {
                        self.finished = true;
                        return Some(Err(e.into()));
                    }
                    self.next_frame_id += 1;
                }
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(AnalysisError::Decode(format!("{:#}", e))));
                }
            }
        }

        if self.next_frame_id == start {
            return None;
        }

        let batch = Batch {
            frame_range: start..self.next_frame_id,
            frame_dir: self.export_dir.clone(),
            total_frame_count: self.total_frame_count,
        };
        info!(frame_range = ?batch.frame_range, "フレームのバッチを準備しました");

        self.pending_clear = self.clear_per_batch;
        Some(Ok(batch))
    }
}

impl Iterator for Batches {
    type Item = AnalysisResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            BatchesState::Prepared(batch) => batch.take().map(Ok),
            BatchesState::Decoding(decoding) => decoding.next_batch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::VideoInfo;
    use image::{Rgb, RgbImage};

    struct FakeDecoder {
        fps: f64,
        frame_count: u64,
    }

    struct FakeStream {
        info: VideoInfo,
        produced: u64,
    }

    impl FrameStream for FakeStream {
        fn info(&self) -> &VideoInfo {
            &self.info
        }

        fn next_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
            if self.produced >= self.info.frame_count {
                return Ok(None);
            }
            self.produced += 1;
            Ok(Some(RgbImage::from_pixel(4, 4, Rgb([self.produced as u8, 0, 0]))))
        }
    }

    impl VideoDecoder for FakeDecoder {
        fn probe(&self, _video_path: &Path) -> anyhow::Result<VideoInfo> {
            Ok(VideoInfo {
                width: 4,
                height: 4,
                fps: self.fps,
                frame_count: self.frame_count,
            })
        }

        fn open(&self, video_path: &Path) -> anyhow::Result<Box<dyn FrameStream>> {
            Ok(Box::new(FakeStream {
                info: self.probe(video_path)?,
                produced: 0,
            }))
        }
    }

    fn batcher(dir: &Path, fps: f64, frame_count: u64, clear_per_batch: bool) -> FrameBatcher {
        let config = FrameBatcherConfig {
            export_dir: dir.join("frames"),
            batch_size: 60,
            clear_per_batch,
            skip_split: false,
            jpeg_quality: 80,
        };
        FrameBatcher::new(config, Box::new(FakeDecoder { fps, frame_count }))
    }

    #[test]
    fn test_rejects_low_fps() {
        let dir = tempfile::tempdir().unwrap();
        let result = batcher(dir.path(), 30.0, 600, false).split(Path::new("round.mp4"));
        assert!(matches!(result, Err(AnalysisError::InvalidVideo { .. })));
    }

    #[test]
    fn test_rejects_short_video() {
        let dir = tempfile::tempdir().unwrap();
        let result = batcher(dir.path(), 60.0, 59, false).split(Path::new("round.mp4"));
        assert!(matches!(
            result,
            Err(AnalysisError::InvalidVideo { frame_count: 59, .. })
        ));
    }

    #[test]
    fn test_yields_partial_last_batch() {
        let dir = tempfile::tempdir().unwrap();
        let batches: Vec<Batch> = batcher(dir.path(), 60.0, 150, false)
            .split(Path::new("round.mp4"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let ranges: Vec<Range<u64>> = batches.iter().map(|b| b.frame_range.clone()).collect();
        assert_eq!(ranges, vec![0..60, 60..120, 120..150]);
        assert!(batches.iter().all(|b| b.total_frame_count == 150));
        assert!(dir.path().join("frames/0.jpeg").exists());
        assert!(dir.path().join("frames/149.jpeg").exists());
    }

    #[test]
    fn test_clear_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        let mut batches = batcher(dir.path(), 60.0, 90, true)
            .split(Path::new("round.mp4"))
            .unwrap();

        let first = batches.next().unwrap().unwrap();
        assert_eq!(first.frame_range, 0..60);
        assert!(first.frame_path(59).exists());

        let second = batches.next().unwrap().unwrap();
        assert_eq!(second.frame_range, 60..90);
        assert!(!frames.join("0.jpeg").exists());
        assert!(second.frame_path(60).exists());

        assert!(batches.next().is_none());
        assert_eq!(std::fs::read_dir(&frames).unwrap().count(), 0);
    }

    #[test]
    fn test_skip_split_uses_existing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir_all(&frames).unwrap();
        for id in 5..10 {
            RgbImage::new(2, 2).save(frame_path(&frames, id)).unwrap();
        }
        std::fs::write(frames.join("notes.txt"), "x").unwrap();

        let config = FrameBatcherConfig {
            export_dir: frames.clone(),
            skip_split: true,
            ..Default::default()
        };
        let batcher = FrameBatcher::new(config, Box::new(FakeDecoder { fps: 0.0, frame_count: 0 }));
        let batches: Vec<Batch> = batcher
            .split(Path::new("unused.mp4"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            batches,
            vec![Batch {
                frame_range: 5..10,
                frame_dir: frames,
                total_frame_count: 5,
            }]
        );
    }
}
