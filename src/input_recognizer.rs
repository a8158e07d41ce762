//! テンプレートマッチングによる画像認識

use anyhow::{Context, Result};
use image::GrayImage;
use std::path::Path;
use tracing::{debug, warn};

/// テンプレートとして読み込む拡張子
const TEMPLATE_EXTENSIONS: [&str; 3] = ["png", "jpeg", "jpg"];

/// テンプレート画像
#[derive(Debug, Clone)]
pub struct Template {
    /// 認識結果として返す名前
    pub name: String,
    pub image: GrayImage,
}

impl Template {
    pub fn new(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    /// テンプレート画像を読み込み
    ///
    /// 名前はファイル名の最初の`_`より前の部分（`play_01.png` → `play`）。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.split('_').next())
            .filter(|s| !s.is_empty())
            .with_context(|| format!("テンプレート名を決められません: {}", path.display()))?
            .to_string();
        let image = image::open(path)
            .with_context(|| format!("テンプレート画像の読み込みに失敗しました: {}", path.display()))?
            .to_luma8();
        Ok(Self::new(name, image))
    }
}

/// マッチング結果
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    pub name: String,
    /// 信頼度（0.0-1.0）
    pub score: f64,
    /// 探索領域内での位置とサイズ
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 同じ用途のテンプレートの集まり
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: Vec<Template>,
}

impl TemplateSet {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// ディレクトリ内のテンプレート画像をすべて読み込む
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut templates = Vec::new();

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("テンプレートディレクトリを読めませんでした: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !is_image {
                continue;
            }

            match Template::load(&path) {
                Ok(template) => templates.push(template),
                Err(e) => warn!(path = %path.display(), error = %e, "テンプレート読み込みエラー"),
            }
        }

        if templates.is_empty() {
            warn!(dir = %dir.display(), "テンプレートが見つかりません");
        } else {
            debug!(dir = %dir.display(), count = templates.len(), "テンプレートを読み込みました");
        }

        // read_dirの順序は不定なので名前順にそろえる
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { templates })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// しきい値を超えた中で最も信頼度の高いテンプレートを返す
    pub fn identify(&self, region: &GrayImage, threshold: f64) -> Option<TemplateMatch> {
        let mut best: Option<TemplateMatch> = None;

        for template in &self.templates {
            let Some((score, x, y)) = best_match(region, &template.image) else {
                continue;
            };

            if score > threshold && best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(TemplateMatch {
                    name: template.name.clone(),
                    score,
                    x,
                    y,
                    width: template.image.width(),
                    height: template.image.height(),
                });
            }
        }

        best
    }
}

/// 同じサイズの2画像の類似度（正規化相互相関）
fn similarity_at(image: &GrayImage, template: &GrayImage, offset_x: u32, offset_y: u32) -> f64 {
    let (width, height) = template.dimensions();
    let n = (width * height) as f64;

    let mut sum_image = 0.0;
    let mut sum_template = 0.0;
    let mut sum_product = 0.0;
    let mut sum_image_sq = 0.0;
    let mut sum_template_sq = 0.0;

    for y in 0..height {
        for x in 0..width {
            let img_val = image.get_pixel(offset_x + x, offset_y + y)[0] as f64;
            let tpl_val = template.get_pixel(x, y)[0] as f64;

            sum_image += img_val;
            sum_template += tpl_val;
            sum_product += img_val * tpl_val;
            sum_image_sq += img_val * img_val;
            sum_template_sq += tpl_val * tpl_val;
        }
    }

    let mean_image = sum_image / n;
    let mean_template = sum_template / n;

    let numerator = sum_product - n * mean_image * mean_template;
    let denominator = ((sum_image_sq - n * mean_image * mean_image)
        * (sum_template_sq - n * mean_template * mean_template))
        .sqrt();

    if denominator == 0.0 {
        return 0.0;
    }

    (numerator / denominator).clamp(0.0, 1.0)
}

/// 同じサイズの2画像の類似度
pub fn similarity(image: &GrayImage, template: &GrayImage) -> f64 {
    if image.dimensions() != template.dimensions() {
        return 0.0;
    }
    similarity_at(image, template, 0, 0)
}

/// 探索領域内でテンプレートを走査し、最も類似度の高い位置を返す
///
/// テンプレートが領域より大きい場合は`None`。
pub fn best_match(region: &GrayImage, template: &GrayImage) -> Option<(f64, u32, u32)> {
    let (rw, rh) = region.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > rw || th > rh {
        return None;
    }

    let mut best = (0.0, 0, 0);
    for y in 0..=(rh - th) {
        for x in 0..=(rw - tw) {
            let score = similarity_at(region, template, x, y);
            if score > best.0 {
                best = (score, x, y);
            }
        }
    }
    Some(best)
}
