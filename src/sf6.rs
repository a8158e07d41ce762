//! Street Fighter 6 のリプレイ画面認識
//!
//! 入力表示（トレーニングモードと同じ入力履歴）の領域は1280x720基準で定義し、
//! 実際の画面サイズに合わせて拡大する。2P側の領域は1P側を左右反転したもの。

use anyhow::{anyhow, Context, Result};
use image::{imageops, GrayImage, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::input_recognizer::TemplateSet;
use crate::recognizer::{Frame, InputMode, InputToken, Player, Recognizer};

/// 基準画面サイズ
const BASE_WIDTH: u32 = 1280;
/// 対応する画面サイズ
const SCREEN_SIZES: [(u32, u32); 2] = [(1280, 720), (1920, 1080)];
/// 画面サイズの許容誤差
const SCREEN_MARGIN: u32 = 50;

/// 再生中表示の領域としきい値
const REPLAY_CENTER_ROI: Roi = Roi::new(605, 174, 76, 57);
const REPLAY_CENTER_THRESHOLD: f64 = 0.7;
const REPLAY_PLAYING: &str = "play";

/// 最新の入力行（方向アイコン + ボタンアイコン6個）
const INPUT_CENTERS_X: [u32; 7] = [72, 92, 112, 132, 152, 172, 192];
const INPUT_CENTER_Y: u32 = 163;
const INPUT_DIAMETER: u32 = 18;
const ARROW_THRESHOLD: f64 = 0.67;
const BUTTON_THRESHOLD: f64 = 0.69;

/// 入力カウンタ（2桁）の各行のY座標
const COUNTER_ROWS_Y: [u32; 5] = [155, 179, 201, 223, 246];
const COUNTER_TENS_X: u32 = 35;
const COUNTER_ONES_X: u32 = 44;
const DIGIT_WIDTH: u32 = 11;
const DIGIT_HEIGHT: u32 = 15;
const DIGIT_THRESHOLD: f64 = 0.68;
/// 直前の入力の継続フレーム数が表示される行
const RUN_OVERLAY_ROW: usize = 1;

/// ボタン強度を判定する画素数（アイコン面積の約1/3）
const STRENGTH_PIXEL_THRESHOLD: usize = 96;

/// 画面に並ぶ順のボタン
const CLASSIC_BUTTONS: [&str; 6] = ["lp", "mp", "hp", "lk", "mk", "hk"];
const MODERN_BUTTONS: [&str; 8] = ["la", "sp", "dp", "ma", "ha", "auto", "di", "grab"];
/// 強度を持たないモダン操作のボタン
const MODERN_WITHOUT_STRENGTH: [&str; 5] = ["sp", "dp", "auto", "di", "grab"];

/// テンプレートディレクトリ名
const REPLAY_CENTER_DIR: &str = "replay_center";
const ARROWS_DIR: &str = "replay_inputs_arrows";
const CLASSIC_DIR: &str = "replay_inputs_classic";
const MODERN_DIR: &str = "replay_inputs_modern";
const COUNT_DIR: &str = "replay_inputs_count";

/// 画面上の矩形領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// 中心と直径から作成
    pub const fn centered(center_x: u32, center_y: u32, diameter: u32) -> Self {
        let radius = diameter / 2;
        Self::new(center_x - radius, center_y - radius, diameter, diameter)
    }

    pub fn scaled(self, scale: f64) -> Self {
        let s = |v: u32| (v as f64 * scale).round() as u32;
        Self::new(s(self.x), s(self.y), s(self.width), s(self.height))
    }

    /// 画面の左右反転
    pub fn mirrored(self, screen_width: u32) -> Self {
        Self {
            x: screen_width.saturating_sub(self.x + self.width),
            ..self
        }
    }

    /// 画像から切り出す（画像外にはみ出した部分は切り詰める）
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        imageops::crop_imm(image, self.x, self.y, self.width, self.height).to_image()
    }
}

/// 画面サイズを対応サイズに丸める
pub fn normalize_screen_size(width: u32, height: u32) -> Result<(u32, u32)> {
    let near = |actual: u32, expected: u32| actual.abs_diff(expected) < SCREEN_MARGIN;

    SCREEN_SIZES
        .iter()
        .copied()
        .find(|&(w, h)| near(width, w) && near(height, h))
        .ok_or_else(|| anyhow!("対応していない画面サイズです: {}x{}", width, height))
}

/// 画面サイズに応じた領域配置
#[derive(Debug, Clone, Copy)]
struct ScreenLayout {
    /// 実際の画面幅（反転の基準）
    width: u32,
    scale: f64,
}

impl ScreenLayout {
    fn place(&self, roi: Roi, player: Player) -> Roi {
        let roi = roi.scaled(self.scale);
        match player {
            Player::P1 => roi,
            Player::P2 => roi.mirrored(self.width),
        }
    }
}

/// RGB各成分の範囲
#[derive(Debug, Clone, Copy)]
struct ColorRange {
    lower: [u8; 3],
    upper: [u8; 3],
}

impl ColorRange {
    const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    fn contains(&self, rgb: [u8; 3]) -> bool {
        (0..3).all(|i| self.lower[i] <= rgb[i] && rgb[i] <= self.upper[i])
    }
}

/// クラシック操作のボタン強度の色（h/m/l）
const CLASSIC_STRENGTH_COLORS: [(char, ColorRange); 3] = [
    ('h', ColorRange::new([133, 51, 58], [255, 155, 164])),
    ('m', ColorRange::new([141, 148, 45], [255, 255, 125])),
    ('l', ColorRange::new([46, 106, 116], [153, 255, 255])),
];

/// モダン操作のボタン強度の色
const MODERN_STRENGTH_COLORS: [(char, ColorRange); 3] = [
    ('h', ColorRange::new([101, 39, 60], [188, 116, 124])),
    ('m', ColorRange::new([100, 108, 44], [188, 196, 114])),
    ('l', ColorRange::new([40, 119, 135], [164, 198, 200])),
];

/// アイコン内で最も多い強度色
fn detect_strength(icon: &RgbImage, colors: &[(char, ColorRange)]) -> Option<char> {
    let mut best: Option<(char, usize)> = None;

    for &(strength, range) in colors {
        let count = icon.pixels().filter(|p| range.contains(p.0)).count();
        if count > STRENGTH_PIXEL_THRESHOLD && best.map_or(true, |(_, c)| count > c) {
            best = Some((strength, count));
        }
    }

    best.map(|(strength, _)| strength)
}

fn to_gray(image: &RgbImage) -> GrayImage {
    imageops::grayscale(image)
}

/// 1つの画面サイズ分のテンプレート
#[derive(Debug, Clone, Default)]
pub struct Sf6Templates {
    pub replay_center: TemplateSet,
    pub arrows: TemplateSet,
    pub classic: TemplateSet,
    pub modern: TemplateSet,
    /// 名前の先頭が数字（`3.jpeg`, `3_b.jpeg` など）
    pub digits: TemplateSet,
}

impl Sf6Templates {
    /// `<dir>/<用途>/` 以下のテンプレートを読み込む
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            replay_center: TemplateSet::load_dir(dir.join(REPLAY_CENTER_DIR))?,
            arrows: TemplateSet::load_dir(dir.join(ARROWS_DIR))?,
            classic: TemplateSet::load_dir(dir.join(CLASSIC_DIR))?,
            modern: TemplateSet::load_dir(dir.join(MODERN_DIR))?,
            digits: TemplateSet::load_dir(dir.join(COUNT_DIR))?,
        })
    }
}

/// SF6 のリプレイ画面認識器
///
/// テンプレートは `<templates_dir>/<幅>x<高さ>/` から画面サイズごとに遅延読み込みする。
pub struct Sf6Recognizer {
    templates_dir: PathBuf,
    cache: Mutex<HashMap<(u32, u32), Arc<Sf6Templates>>>,
}

impl Sf6Recognizer {
    pub fn new<P: Into<PathBuf>>(templates_dir: P) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 読み込み済みのテンプレートで作成
    pub fn with_templates(screen_size: (u32, u32), templates: Sf6Templates) -> Self {
        let mut cache = HashMap::new();
        cache.insert(screen_size, Arc::new(templates));
        Self {
            templates_dir: PathBuf::new(),
            cache: Mutex::new(cache),
        }
    }

    fn prepare(&self, image: &RgbImage) -> Result<(ScreenLayout, Arc<Sf6Templates>)> {
        let (width, height) = image.dimensions();
        let size = normalize_screen_size(width, height)?;
        let layout = ScreenLayout {
            width,
            scale: size.0 as f64 / BASE_WIDTH as f64,
        };

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("テンプレートキャッシュのロックに失敗しました"))?;

        if let Some(templates) = cache.get(&size) {
            return Ok((layout, Arc::clone(templates)));
        }

        let dir = self.templates_dir.join(format!("{}x{}", size.0, size.1));
        let templates = Arc::new(
            Sf6Templates::load(&dir)
                .with_context(|| format!("テンプレートの読み込みに失敗しました: {}", dir.display()))?,
        );
        info!(dir = %dir.display(), "SF6 テンプレートを読み込みました");
        cache.insert(size, Arc::clone(&templates));
        Ok((layout, templates))
    }

    fn read_counter(
        &self,
        image: &RgbImage,
        layout: &ScreenLayout,
        templates: &Sf6Templates,
        player: Player,
        row: usize,
    ) -> Result<u32> {
        let y = *COUNTER_ROWS_Y
            .get(row)
            .with_context(|| format!("入力カウンタの行番号が範囲外です: {}", row))?;

        let tens = Roi::new(COUNTER_TENS_X, y, DIGIT_WIDTH, DIGIT_HEIGHT);
        let ones = Roi::new(COUNTER_ONES_X, y, DIGIT_WIDTH, DIGIT_HEIGHT);

        // 反転すると左右が入れ替わる
        let (tens, ones) = match player {
            Player::P1 => (tens, ones),
            Player::P2 => (ones, tens),
        };

        let read_digit = |roi: Roi| -> u32 {
            let region = to_gray(&layout.place(roi, player).crop(image));
            templates
                .digits
                .identify(&region, DIGIT_THRESHOLD)
                .and_then(|m| m.name.chars().next())
                .and_then(|c| c.to_digit(10))
                .unwrap_or(0)
        };

        Ok(read_digit(tens) * 10 + read_digit(ones))
    }

    /// ボタンアイコン1つを読む（例: `hp`, `sp`）
    fn read_button(&self, icon: &RgbImage, templates: &Sf6Templates, mode: InputMode) -> Option<String> {
        let (set, colors) = match mode {
            InputMode::Classic => (&templates.classic, &CLASSIC_STRENGTH_COLORS),
            InputMode::Modern => (&templates.modern, &MODERN_STRENGTH_COLORS),
        };

        let found = set.identify(&to_gray(icon), BUTTON_THRESHOLD)?;

        if mode == InputMode::Modern && MODERN_WITHOUT_STRENGTH.contains(&found.name.as_str()) {
            return Some(found.name);
        }

        let matched = Roi::new(found.x, found.y, found.width, found.height).crop(icon);
        let strength = detect_strength(&matched, colors)?;
        Some(format!("{}{}", strength, found.name))
    }
}

impl Recognizer for Sf6Recognizer {
    fn is_round_started(&self, frame: &Frame) -> Result<bool> {
        let (layout, templates) = self.prepare(&frame.image)?;
        let region = to_gray(&layout.place(REPLAY_CENTER_ROI, Player::P1).crop(&frame.image));

        Ok(templates
            .replay_center
            .identify(&region, REPLAY_CENTER_THRESHOLD)
            .is_some_and(|m| m.name == REPLAY_PLAYING))
    }

    fn read_input_counter_rows(&self, frame: &Frame, player: Player, row_count: usize) -> Result<Vec<u32>> {
        let (layout, templates) = self.prepare(&frame.image)?;
        (0..row_count)
            .map(|row| self.read_counter(&frame.image, &layout, &templates, player, row))
            .collect()
    }

    fn read_input_token(&self, frame: &Frame, player: Player, mode: InputMode) -> Result<Option<InputToken>> {
        let (layout, templates) = self.prepare(&frame.image)?;

        let mut rois = INPUT_CENTERS_X
            .iter()
            .map(|&x| layout.place(Roi::centered(x, INPUT_CENTER_Y, INPUT_DIAMETER), player));

        let Some(arrow_roi) = rois.next() else {
            return Ok(None);
        };
        let Some(arrow) = templates
            .arrows
            .identify(&to_gray(&arrow_roi.crop(&frame.image)), ARROW_THRESHOLD)
        else {
            return Ok(None);
        };

        // ボタンは画面上で決まった順に並ぶので、読めたボタンより前の候補は捨てる
        let mut candidates: Vec<&str> = match mode {
            InputMode::Classic => CLASSIC_BUTTONS.to_vec(),
            InputMode::Modern => MODERN_BUTTONS.to_vec(),
        };
        if player == Player::P2 {
            candidates.reverse();
        }

        let mut buttons = Vec::new();
        for roi in rois {
            if candidates.is_empty() {
                break;
            }
            let Some(button) = self.read_button(&roi.crop(&frame.image), &templates, mode) else {
                break;
            };
            let Some(position) = candidates.iter().position(|c| *c == button) else {
                debug!(frame_id = frame.id, %player, %button, "並び順に合わないボタンです");
                break;
            };
            candidates.drain(..=position);
            buttons.push(button);
        }

        if player == Player::P2 {
            buttons.reverse();
        }

        Ok(Some(InputToken::new(arrow.name, buttons)))
    }

    fn read_input_run_overlay_count(&self, frame: &Frame, player: Player) -> Result<u32> {
        let (layout, templates) = self.prepare(&frame.image)?;
        self.read_counter(&frame.image, &layout, &templates, player, RUN_OVERLAY_ROW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_recognizer::Template;
    use image::Rgb;

    fn gray_pattern(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let v = (x * 131 + y * 71 + seed * 977) ^ (x * y * 13 + seed * 29);
            image::Luma([(v % 256) as u8])
        })
    }

    fn paste_gray(frame: &mut RgbImage, pattern: &GrayImage, x: u32, y: u32) {
        for (px, py, p) in pattern.enumerate_pixels() {
            frame.put_pixel(x + px, y + py, Rgb([p[0], p[0], p[0]]));
        }
    }

    /// 強い(h)色のボタンアイコン
    fn heavy_icon(seed: u32) -> RgbImage {
        RgbImage::from_fn(16, 16, |x, y| {
            if (x * 7 + y * 3 + seed) % 5 < 3 {
                Rgb([200, 100, 110])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn digit_templates() -> TemplateSet {
        TemplateSet::new(
            (0..10)
                .map(|d| Template::new(d.to_string(), gray_pattern(DIGIT_WIDTH, DIGIT_HEIGHT, d + 1)))
                .collect(),
        )
    }

    fn frame(image: RgbImage) -> Frame {
        Frame { id: 1, image }
    }

    #[test]
    fn test_roi_geometry() {
        assert_eq!(Roi::centered(72, 163, 18), Roi::new(63, 154, 18, 18));
        assert_eq!(Roi::new(35, 155, 11, 15).scaled(1.5), Roi::new(53, 233, 17, 23));
        assert_eq!(Roi::new(44, 155, 11, 15).mirrored(1280), Roi::new(1225, 155, 11, 15));
    }

    #[test]
    fn test_normalize_screen_size() {
        assert_eq!(normalize_screen_size(1280, 720).unwrap(), (1280, 720));
        assert_eq!(normalize_screen_size(1270, 740).unwrap(), (1280, 720));
        assert_eq!(normalize_screen_size(1920, 1080).unwrap(), (1920, 1080));
        assert!(normalize_screen_size(640, 480).is_err());
        assert!(normalize_screen_size(1280, 1080).is_err());
    }

    #[test]
    fn test_detect_strength() {
        assert_eq!(detect_strength(&heavy_icon(0), &CLASSIC_STRENGTH_COLORS), Some('h'));
        let dark = RgbImage::new(16, 16);
        assert_eq!(detect_strength(&dark, &CLASSIC_STRENGTH_COLORS), None);
    }

    #[test]
    fn test_read_counter_rows_for_both_players() {
        let templates = Sf6Templates {
            digits: digit_templates(),
            ..Default::default()
        };
        let digits: Vec<GrayImage> = (0..10).map(|d| gray_pattern(DIGIT_WIDTH, DIGIT_HEIGHT, d + 1)).collect();

        let mut image = RgbImage::new(1280, 720);
        // 1P: 12, 34 / 2P: 56, 7
        paste_gray(&mut image, &digits[1], 35, 155);
        paste_gray(&mut image, &digits[2], 44, 155);
        paste_gray(&mut image, &digits[3], 35, 179);
        paste_gray(&mut image, &digits[4], 44, 179);
        paste_gray(&mut image, &digits[5], 1225, 155);
        paste_gray(&mut image, &digits[6], 1234, 155);
        paste_gray(&mut image, &digits[7], 1234, 179);

        let recognizer = Sf6Recognizer::with_templates((1280, 720), templates);
        let frame = frame(image);

        assert_eq!(recognizer.read_input_counter_rows(&frame, Player::P1, 3).unwrap(), vec![12, 34, 0]);
        assert_eq!(recognizer.read_input_counter_rows(&frame, Player::P2, 2).unwrap(), vec![56, 7]);
        assert_eq!(recognizer.read_input_run_overlay_count(&frame, Player::P1).unwrap(), 34);
        assert!(recognizer.read_input_counter_rows(&frame, Player::P1, 6).is_err());
    }

    #[test]
    fn test_read_input_token_classic() {
        let arrow_6 = gray_pattern(16, 16, 60);
        let arrow_4 = gray_pattern(16, 16, 40);
        let icon = heavy_icon(1);
        let templates = Sf6Templates {
            arrows: TemplateSet::new(vec![
                Template::new("6", arrow_6.clone()),
                Template::new("4", arrow_4),
            ]),
            classic: TemplateSet::new(vec![
                Template::new("p", to_gray(&icon)),
                Template::new("k", gray_pattern(16, 16, 3)),
            ]),
            ..Default::default()
        };

        let mut image = RgbImage::new(1280, 720);
        paste_gray(&mut image, &arrow_6, 64, 155);
        imageops::replace(&mut image, &icon, 84, 155);

        let recognizer = Sf6Recognizer::with_templates((1280, 720), templates);
        let frame = frame(image);

        let token = recognizer
            .read_input_token(&frame, Player::P1, InputMode::Classic)
            .unwrap()
            .unwrap();
        assert_eq!(token.to_string(), "6 hp");

        // 2P側は何も表示されていない
        assert_eq!(recognizer.read_input_token(&frame, Player::P2, InputMode::Classic).unwrap(), None);
    }

    #[test]
    fn test_is_round_started() {
        let play = gray_pattern(20, 20, 11);
        let templates = Sf6Templates {
            replay_center: TemplateSet::new(vec![Template::new("play", play.clone())]),
            ..Default::default()
        };
        let recognizer = Sf6Recognizer::with_templates((1280, 720), templates);

        let paused = frame(RgbImage::new(1280, 720));
        assert!(!recognizer.is_round_started(&paused).unwrap());

        let mut image = RgbImage::new(1280, 720);
        paste_gray(&mut image, &play, 620, 190);
        assert!(recognizer.is_round_started(&frame(image)).unwrap());
    }

    #[test]
    fn test_unsupported_screen_size() {
        let recognizer = Sf6Recognizer::with_templates((1280, 720), Sf6Templates::default());
        assert!(recognizer.is_round_started(&frame(RgbImage::new(640, 360))).is_err());
    }
}
