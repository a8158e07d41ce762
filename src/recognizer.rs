//! フレーム認識のインターフェース
//!
//! ゲームタイトルごとの画面認識（開始判定・入力アイコン・入力カウンタ）はこのトレイトの
//! 背後に隠す。解析ステートマシンはここで定義された操作しか使わない。

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{GameConfig, GameTitle};
use crate::sf6::Sf6Recognizer;

/// 重複フレームとみなす平均二乗誤差のしきい値
pub const DUPLICATE_MSE_THRESHOLD: f64 = 5.0;

/// プレイヤー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Player {
    P1,
    P2,
}

impl Player {
    /// 状態配列のインデックス
    pub fn index(self) -> usize {
        match self {
            Player::P1 => 0,
            Player::P2 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Player::P1 => "p1",
            Player::P2 => "p2",
        }
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作タイプ（ボタン構成が異なる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Classic,
    Modern,
}

impl InputMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classic" => Some(Self::Classic),
            "modern" => Some(Self::Modern),
            _ => None,
        }
    }
}

/// 1フレームの入力（方向 + 同時押しボタン）
///
/// 文字列表現は方向を先頭にした空白区切り（例: `"6 lp hk"`）。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputToken {
    pub arrow: String,
    pub buttons: Vec<String>,
}

impl InputToken {
    pub fn new<I, S>(arrow: impl Into<String>, buttons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arrow: arrow.into(),
            buttons: buttons.into_iter().map(Into::into).collect(),
        }
    }

    /// 方向のみ
    pub fn arrow(arrow: impl Into<String>) -> Self {
        Self {
            arrow: arrow.into(),
            buttons: Vec::new(),
        }
    }

    /// 空白区切りの文字列から復元
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let arrow = parts.next()?;
        Some(Self::new(arrow, parts))
    }
}

impl fmt::Display for InputToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arrow)?;
        for button in &self.buttons {
            write!(f, " {}", button)?;
        }
        Ok(())
    }
}

impl Serialize for InputToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        InputToken::parse(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("不正な入力表現です: {:?}", value)))
    }
}

/// デコード済みの1フレーム
#[derive(Debug, Clone)]
pub struct Frame {
    /// 動画先頭からの0始まりのフレーム番号
    pub id: u64,
    pub image: RgbImage,
}

/// ゲームタイトルごとの画面認識
pub trait Recognizer {
    /// リプレイ再生が始まっているか
    fn is_round_started(&self, frame: &Frame) -> Result<bool>;

    /// 2フレーム間の差分（グレースケール化後の平均二乗誤差）
    fn frame_difference(&self, current: &Frame, previous: &Frame) -> Result<f64> {
        Ok(mse_grayscale(&current.image, &previous.image))
    }

    /// 入力カウンタの上から`row_count`行分を読む（各値は0..=99）
    fn read_input_counter_rows(&self, frame: &Frame, player: Player, row_count: usize) -> Result<Vec<u32>>;

    /// 現在の入力を読む。方向が読めなければ`None`
    fn read_input_token(&self, frame: &Frame, player: Player, mode: InputMode) -> Result<Option<InputToken>>;

    /// 直前に終わった入力の継続フレーム数（画面表示は99で頭打ち）
    fn read_input_run_overlay_count(&self, frame: &Frame, player: Player) -> Result<u32>;
}

/// 設定されたゲームタイトルの認識器を作成
pub fn build_recognizer(config: &GameConfig) -> Box<dyn Recognizer> {
    match config.title {
        GameTitle::Sf6 => Box::new(Sf6Recognizer::new(&config.templates_dir)),
    }
}

/// グレースケール化した2画像の平均二乗誤差
///
/// サイズが異なる場合は比較できないので`f64::MAX`を返す。
pub fn mse_grayscale(a: &RgbImage, b: &RgbImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return f64::MAX;
    }

    let (width, height) = a.dimensions();
    let pixels = (width as u64 * height as u64) as f64;
    if pixels == 0.0 {
        return 0.0;
    }

    let sum: f64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            let diff = luma(pa.0) - luma(pb.0);
            diff * diff
        })
        .sum();

    sum / pixels
}

/// ITU-R BT.601 の輝度
fn luma(rgb: [u8; 3]) -> f64 {
    0.299 * rgb[0] as f64 + 0.587 * rgb[1] as f64 + 0.114 * rgb[2] as f64
}
