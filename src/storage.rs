//! 解析結果の保存先とリプレイ動画の取得元
//!
//! どちらもトレイトで抽象化し、ローカルファイルシステム上の実装を持つ。

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive;
use crate::recognizer::{InputMode, InputToken, Player};
use crate::round_analyzer::FrameRecord;

/// リプレイのメタデータ（任意のJSON）
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayMetadata(pub Value);

impl ReplayMetadata {
    /// プレイヤーの操作タイプ（`<player>.mode`）
    pub fn player_mode(&self, player: Player) -> Result<InputMode> {
        let mode = self
            .0
            .get(player.as_str())
            .and_then(|p| p.get("mode"))
            .and_then(Value::as_str)
            .with_context(|| format!("メタデータに {}.mode がありません", player))?;

        InputMode::parse(mode).with_context(|| format!("不明な操作タイプです: {} ({})", mode, player))
    }

    pub fn player_modes(&self) -> Result<[InputMode; 2]> {
        Ok([self.player_mode(Player::P1)?, self.player_mode(Player::P2)?])
    }
}

/// フレームレコードとメタデータの保存先
pub trait Dataset {
    /// ラウンドのフレームレコードが既に保存されているか
    fn is_round_analyzed(&self, replay_id: &str, round_id: u32) -> Result<bool>;

    /// フレームレコードを追記する（空なら何もしない）
    fn insert_frame_records(&self, replay_id: &str, round_id: u32, records: &[FrameRecord]) -> Result<()>;

    fn get_replay_metadata(&self, replay_id: &str) -> Result<ReplayMetadata>;
}

/// 1行分の保存形式
#[derive(Serialize)]
struct FrameRow<'a> {
    replay_id: &'a str,
    round_id: u32,
    frame_id: u64,
    p1_input: &'a InputToken,
    p2_input: &'a InputToken,
}

/// JSON Lines で保存するデータセット
///
/// - `<root>/frames/<replay_id>/<round_id>.jsonl`
/// - `<root>/replays/<replay_id>.json`
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    root: PathBuf,
}

impl JsonlDataset {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn frames_path(&self, replay_id: &str, round_id: u32) -> PathBuf {
        self.root
            .join("frames")
            .join(replay_id)
            .join(format!("{}.jsonl", round_id))
    }

    pub fn metadata_path(&self, replay_id: &str) -> PathBuf {
        self.root.join("replays").join(format!("{}.json", replay_id))
    }

    /// 保存済みのレコードを読み込む
    pub fn load_frame_records(&self, replay_id: &str, round_id: u32) -> Result<Vec<FrameRecord>> {
        let path = self.frames_path(replay_id, round_id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("フレームレコードの読み込みに失敗しました: {}", path.display()))?;

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<FrameRecord>(line)
                    .with_context(|| format!("フレームレコードの解析に失敗しました: {}", line))
            })
            .collect()
    }
}

impl Dataset for JsonlDataset {
    fn is_round_analyzed(&self, replay_id: &str, round_id: u32) -> Result<bool> {
        let path = self.frames_path(replay_id, round_id);
        Ok(path.is_file())
    }

    fn insert_frame_records(&self, replay_id: &str, round_id: u32, records: &[FrameRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let path = self.frames_path(replay_id, round_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("データセットディレクトリの作成に失敗しました: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("フレームレコードファイルを開けませんでした: {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        for record in records {
            let row = FrameRow {
                replay_id,
                round_id,
                frame_id: record.frame_id,
                p1_input: &record.p1_input,
                p2_input: &record.p2_input,
            };
            serde_json::to_writer(&mut writer, &row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        info!(replay_id, round_id, count = records.len(), "フレームレコードを保存しました");
        Ok(())
    }

    fn get_replay_metadata(&self, replay_id: &str) -> Result<ReplayMetadata> {
        let path = self.metadata_path(replay_id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("リプレイメタデータの読み込みに失敗しました: {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("リプレイメタデータの解析に失敗しました: {}", path.display()))?;
        Ok(ReplayMetadata(value))
    }
}

/// 解析中だけ使うラウンド動画
///
/// スコープを抜けると（エラー時も含めて）ローカルの動画を削除する。
#[derive(Debug)]
pub struct RoundVideo {
    path: PathBuf,
    remove_on_drop: bool,
}

impl RoundVideo {
    pub fn new(path: PathBuf, remove_on_drop: bool) -> Self {
        Self { path, remove_on_drop }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RoundVideo {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "ラウンド動画を削除しました"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "ラウンド動画の削除に失敗しました"),
        }
    }
}

/// アップロード待ちのアーカイブ
///
/// アップロードの成否にかかわらず、ドロップ時に一時ファイルを削除する。
#[derive(Debug)]
pub struct StagedArchive {
    path: PathBuf,
    key: String,
}

impl StagedArchive {
    pub fn new(path: PathBuf, key: impl Into<String>) -> Self {
        Self { path, key: key.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for StagedArchive {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "一時アーカイブの削除に失敗しました"),
        }
    }
}

/// リプレイ動画とアーカイブの保管場所
pub trait ReplayStorage: Send + Sync {
    /// ラウンドIDを昇順で返す。2ラウンド未満はエラー
    fn list_round_ids(&self, replay_id: &str) -> Result<Vec<u32>>;

    /// ラウンド動画をローカルに用意する
    fn acquire_round_video(&self, replay_id: &str, round_id: u32) -> Result<RoundVideo>;

    /// 作成済みのアーカイブを `key` の場所にアップロードする
    fn upload_archive(&self, archive: &Path, key: &str) -> Result<()>;

    /// ディレクトリをその場で tar.gz にまとめる
    ///
    /// アップロードは返した[`StagedArchive`]を[`ReplayStorage::upload_staged`]に渡して行う。
    /// 書き出し途中で失敗した場合も一時ファイルは残らない。
    fn archive_directory(&self, dir: &Path, key: &str) -> Result<StagedArchive> {
        let staged = StagedArchive::new(archive::staging_path(key), key);
        archive::pack_directory(dir, staged.path())?;
        Ok(staged)
    }

    /// まとめたアーカイブをアップロードし、一時ファイルを片付ける
    fn upload_staged(&self, staged: StagedArchive) -> Result<()> {
        self.upload_archive(staged.path(), staged.key())
    }
}

/// ローカルディレクトリを使うリプレイストレージ
#[derive(Debug, Clone)]
pub struct LocalReplayStorage {
    replays_dir: PathBuf,
    download_dir: PathBuf,
    artifacts_dir: PathBuf,
    skip_download: bool,
}

impl LocalReplayStorage {
    pub fn new<P: Into<PathBuf>>(replays_dir: P, download_dir: P, artifacts_dir: P, skip_download: bool) -> Self {
        Self {
            replays_dir: replays_dir.into(),
            download_dir: download_dir.into(),
            artifacts_dir: artifacts_dir.into(),
            skip_download,
        }
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.artifacts_dir.join(key)
    }

    fn round_file(dir: &Path, replay_id: &str, round_id: u32) -> PathBuf {
        dir.join(replay_id).join(format!("{}.mp4", round_id))
    }
}

impl ReplayStorage for LocalReplayStorage {
    fn list_round_ids(&self, replay_id: &str) -> Result<Vec<u32>> {
        let dir = self.replays_dir.join(replay_id);
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("リプレイディレクトリを読めませんでした: {}", dir.display()))?;

        let mut round_ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("mp4") {
                continue;
            }
            if let Some(round_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                round_ids.push(round_id);
            }
        }

        if round_ids.len() < 2 {
            bail!(
                "ラウンド動画が2つ未満です: replay_id={} ({}件)",
                replay_id,
                round_ids.len()
            );
        }

        round_ids.sort_unstable();
        Ok(round_ids)
    }

    fn acquire_round_video(&self, replay_id: &str, round_id: u32) -> Result<RoundVideo> {
        let local = Self::round_file(&self.download_dir, replay_id, round_id);

        if self.skip_download {
            if !local.is_file() {
                bail!("ダウンロード済みの動画が見つかりません: {}", local.display());
            }
            return Ok(RoundVideo::new(local, false));
        }

        if !local.is_file() {
            let source = Self::round_file(&self.replays_dir, replay_id, round_id);
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("ダウンロード先の作成に失敗しました: {}", parent.display()))?;
            }
            fs::copy(&source, &local).with_context(|| {
                format!("動画のダウンロードに失敗しました: {} -> {}", source.display(), local.display())
            })?;
            info!(replay_id, round_id, path = %local.display(), "ラウンド動画をダウンロードしました");
        }

        Ok(RoundVideo::new(local, true))
    }

    fn upload_archive(&self, archive: &Path, key: &str) -> Result<()> {
        let dest = self.artifact_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("アップロード先の作成に失敗しました: {}", parent.display()))?;
        }
        fs::copy(archive, &dest)
            .with_context(|| format!("アーカイブのアップロードに失敗しました: {}", dest.display()))?;
        info!(key, "アーカイブをアップロードしました");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(frame_id: u64, p1: &str, p2: &str) -> FrameRecord {
        FrameRecord {
            frame_id,
            p1_input: InputToken::parse(p1).unwrap(),
            p2_input: InputToken::parse(p2).unwrap(),
        }
    }

    fn storage(root: &Path, skip_download: bool) -> LocalReplayStorage {
        LocalReplayStorage::new(
            root.join("replays"),
            root.join("downloads"),
            root.join("artifacts"),
            skip_download,
        )
    }

    #[test]
    fn test_metadata_player_mode() {
        let metadata = ReplayMetadata(json!({"p1": {"mode": "classic"}, "p2": {"mode": "modern"}}));
        assert_eq!(metadata.player_modes().unwrap(), [InputMode::Classic, InputMode::Modern]);

        let broken = ReplayMetadata(json!({"p1": {"mode": "arcade"}}));
        assert!(broken.player_mode(Player::P1).is_err());
        assert!(broken.player_mode(Player::P2).is_err());
    }

    #[test]
    fn test_jsonl_dataset_insert_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonlDataset::new(dir.path());

        assert!(!dataset.is_round_analyzed("r1", 1).unwrap());
        dataset.insert_frame_records("r1", 1, &[]).unwrap();
        assert!(!dataset.is_round_analyzed("r1", 1).unwrap());

        dataset
            .insert_frame_records("r1", 1, &[record(10, "5", "6 lp hk"), record(11, "2 mk", "6 lp hk")])
            .unwrap();
        dataset.insert_frame_records("r1", 1, &[record(12, "2", "4")]).unwrap();
        assert!(dataset.is_round_analyzed("r1", 1).unwrap());

        let contents = fs::read_to_string(dataset.frames_path("r1", 1)).unwrap();
        let first: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(
            first,
            json!({"replay_id": "r1", "round_id": 1, "frame_id": 10, "p1_input": "5", "p2_input": "6 lp hk"})
        );

        let loaded = dataset.load_frame_records("r1", 1).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1], record(11, "2 mk", "6 lp hk"));
    }

    #[test]
    fn test_list_round_ids_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let replay_dir = dir.path().join("replays/r1");
        fs::create_dir_all(&replay_dir).unwrap();
        for name in ["10.mp4", "2.mp4", "1.mp4", "notes.txt", "x.mp4"] {
            fs::write(replay_dir.join(name), b"").unwrap();
        }

        let storage = storage(dir.path(), false);
        assert_eq!(storage.list_round_ids("r1").unwrap(), vec![1, 2, 10]);
    }

    #[test]
    fn test_list_round_ids_requires_two_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let replay_dir = dir.path().join("replays/r1");
        fs::create_dir_all(&replay_dir).unwrap();
        fs::write(replay_dir.join("1.mp4"), b"").unwrap();

        assert!(storage(dir.path(), false).list_round_ids("r1").is_err());
        assert!(storage(dir.path(), false).list_round_ids("missing").is_err());
    }

    #[test]
    fn test_round_video_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let replay_dir = dir.path().join("replays/r1");
        fs::create_dir_all(&replay_dir).unwrap();
        fs::write(replay_dir.join("1.mp4"), b"video").unwrap();

        let storage = storage(dir.path(), false);
        let video = storage.acquire_round_video("r1", 1).unwrap();
        let path = video.path().to_path_buf();
        assert_eq!(fs::read(&path).unwrap(), b"video");
        drop(video);
        assert!(!path.exists());
        assert!(replay_dir.join("1.mp4").exists());
    }

    #[test]
    fn test_skip_download_keeps_video() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), true);
        assert!(storage.acquire_round_video("r1", 1).is_err());

        let local = dir.path().join("downloads/r1/1.mp4");
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, b"video").unwrap();

        drop(storage.acquire_round_video("r1", 1).unwrap());
        assert!(local.exists());
    }

    #[test]
    fn test_archive_directory_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("last_images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("frame.jpeg"), b"jpeg").unwrap();

        let storage = storage(dir.path(), false);
        let key = "r1/1/last_images.tar.gz";
        let staged = storage.archive_directory(&images, key).unwrap();
        let staging = staged.path().to_path_buf();
        assert!(staging.is_file());
        assert_eq!(staged.key(), key);

        // まとめた後に元のディレクトリが消えてもアップロードできる
        fs::remove_dir_all(&images).unwrap();
        storage.upload_staged(staged).unwrap();
        assert!(!staging.exists());

        let files = archive::list_files(storage.artifact_path(key)).unwrap();
        assert_eq!(files, vec![PathBuf::from("frame.jpeg")]);
    }

    #[test]
    fn test_staged_archive_removed_without_upload() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("frames");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("0.jpeg"), b"jpeg").unwrap();

        let storage = storage(dir.path(), false);
        let staged = storage.archive_directory(&images, "r1/1/frames/0-0.tar.gz").unwrap();
        let staging = staged.path().to_path_buf();
        drop(staged);
        assert!(!staging.exists());
        assert!(!storage.artifact_path("r1/1/frames/0-0.tar.gz").exists());

        assert!(storage.archive_directory(&dir.path().join("missing"), "r1/x.tar.gz").is_err());
    }
}
