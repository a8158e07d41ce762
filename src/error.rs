//! 解析パイプラインのエラー分類

use crate::recognizer::Player;
use thiserror::Error;

/// ラウンド解析を中断させるエラー
///
/// 重複フレーム・フレーム落ちはカウンタとして記録されるだけで、ここには現れない。
/// ラウンド終了も正常系なので [`BatchOutcome::RoundEnded`] で表現する。
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("動画が不正です: fps={fps:.2}, フレーム数={frame_count} (どちらも60以上が必要)")]
    InvalidVideo { fps: f64, frame_count: u64 },

    #[error("{player}の方向入力を認識できませんでした (frame_id={frame_id})")]
    UndefinedInput { player: Player, frame_id: u64 },

    #[error(
        "{player}の入力継続フレーム数が一致しません: 画面表示={expected}, 追跡値={actual}, 直近の入力={last_input} (frame_id={frame_id})"
    )]
    VerificationMismatch {
        player: Player,
        expected: u32,
        actual: u32,
        frame_id: u64,
        last_input: String,
    },

    #[error("デバッグ用の停止フレームに到達しました (frame_id={frame_id})")]
    StoppedAt { frame_id: u64 },

    #[error("動画のデコードに失敗しました: {0}")]
    Decode(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("画像の読み書きに失敗しました: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 1バッチ分の解析結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// バッチ内の全フレームを処理した
    Completed,
    /// ラウンド終了を検出した。以降のバッチは読まない
    RoundEnded { frame_id: u64 },
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;
