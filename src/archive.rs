//! ディレクトリの tar.gz アーカイブ

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// アップロード前のアーカイブを置く一時パス（呼び出しごとに異なる）
///
/// キーの区切り文字は`_`に置き換える。
pub fn staging_path(key: &str) -> PathBuf {
    let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join("replay_input_analyzer").join(format!(
        "{}-{}-{}",
        std::process::id(),
        sequence,
        key.replace('/', "_")
    ))
}

/// ディレクトリの中身を tar.gz にまとめる
///
/// アーカイブ内のパスはディレクトリからの相対パス。
pub fn pack_directory<P: AsRef<Path>, Q: AsRef<Path>>(dir: P, dest: Q) -> Result<()> {
    let dir = dir.as_ref();
    let dest = dest.as_ref();

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("出力ディレクトリの作成に失敗しました: {}", parent.display()))?;
    }

    let file = File::create(dest)
        .with_context(|| format!("アーカイブファイルの作成に失敗しました: {}", dest.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    builder
        .append_dir_all("", dir)
        .with_context(|| format!("アーカイブへの追加に失敗しました: {}", dir.display()))?;

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("アーカイブの書き込みに失敗しました: {}", dest.display()))?;

    Ok(())
}

/// アーカイブ内のファイル一覧（ディレクトリは除く）
pub fn list_files<P: AsRef<Path>>(archive: P) -> Result<Vec<PathBuf>> {
    let archive = archive.as_ref();
    let file = File::open(archive)
        .with_context(|| format!("アーカイブを開けませんでした: {}", archive.display()))?;
    let mut archive_reader = tar::Archive::new(GzDecoder::new(file));

    let mut files = Vec::new();
    for entry in archive_reader.entries().context("アーカイブの読み込みに失敗しました")? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            let path = entry.path()?;
            files.push(path.strip_prefix(".").unwrap_or(&path).to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_directory() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("1.jpeg"), b"a").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/frame.jpeg"), b"b").unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("r1/1/last_images.tar.gz");
        pack_directory(src.path(), &dest).unwrap();

        let files = list_files(&dest).unwrap();
        assert_eq!(files, vec![PathBuf::from("1.jpeg"), PathBuf::from("sub/frame.jpeg")]);
    }

    #[test]
    fn test_staging_path_flattens_key() {
        let path = staging_path("r1/2/frames/0-599.tar.gz");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-r1_2_frames_0-599.tar.gz"));
        assert_ne!(staging_path("a"), staging_path("a"));
    }

    #[test]
    fn test_pack_missing_directory_fails() {
        let out = tempfile::tempdir().unwrap();
        let result = pack_directory(out.path().join("missing"), out.path().join("a.tar.gz"));
        assert!(result.is_err());
    }
}
