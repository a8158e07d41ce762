//! 動画デコーダ
//!
//! 動画ファイルを先頭から1フレームずつRGB画像として取り出す。
//! 既定は`ffmpeg`/`ffprobe`コマンドを子プロセスとして使う実装で、
//! `gstreamer`フィーチャを有効にするとGStreamerのパイプラインも選べる。

use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

/// 動画情報
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 総フレーム数
    pub frame_count: u64,
}

/// 使用するデコーダの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Ffmpeg,
    Gstreamer,
}

/// デコード済みフレームのストリーム
pub trait FrameStream {
    fn info(&self) -> &VideoInfo;

    /// 次のフレーム。動画の終端なら`None`
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// 動画デコーダ
pub trait VideoDecoder {
    /// 動画ファイルの情報を取得
    fn probe(&self, video_path: &Path) -> Result<VideoInfo>;

    /// 先頭からフレームを読み出すストリームを開く
    fn open(&self, video_path: &Path) -> Result<Box<dyn FrameStream>>;
}

/// 設定に応じたデコーダを作成
pub fn build_decoder(kind: DecoderKind) -> Result<Box<dyn VideoDecoder>> {
    match kind {
        DecoderKind::Ffmpeg => Ok(Box::new(FfmpegExtractor::default())),
        #[cfg(feature = "gstreamer")]
        DecoderKind::Gstreamer => Ok(Box::new(gst_backend::GstreamerExtractor::new()?)),
        #[cfg(not(feature = "gstreamer"))]
        DecoderKind::Gstreamer => anyhow::bail!(
            "GStreamerデコーダは 'gstreamer' フィーチャを有効にしてビルドする必要があります"
        ),
    }
}

/// フレームをJPEGで保存
pub fn save_jpeg<P: AsRef<Path>>(image: &RgbImage, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("ファイルの作成に失敗: {}", path.display()))?;
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    image
        .write_with_encoder(encoder)
        .with_context(|| format!("JPEG画像の書き込みに失敗しました: {}", path.display()))?;
    Ok(())
}

/// `ffmpeg`コマンドによるデコーダ
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    nb_read_packets: Option<String>,
    #[serde(default)]
    nb_frames: Option<String>,
}

/// `"60000/1001"`形式のフレームレートを数値に変換
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(num / den)
}

fn parse_probe_output(json: &[u8]) -> Result<VideoInfo> {
    let output: ProbeOutput =
        serde_json::from_slice(json).context("ffprobeの出力を解析できませんでした")?;
    let stream = output
        .streams
        .into_iter()
        .next()
        .context("動画ストリームが見つかりません")?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let frame_count = stream
        .nb_read_packets
        .as_deref()
        .or(stream.nb_frames.as_deref())
        .and_then(|n| n.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Ok(VideoInfo {
        width: stream.width,
        height: stream.height,
        fps,
        frame_count,
    })
}

impl VideoDecoder for FfmpegExtractor {
    fn probe(&self, video_path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0", "-count_packets"])
            .args([
                "-show_entries",
                "stream=width,height,avg_frame_rate,r_frame_rate,nb_read_packets,nb_frames",
            ])
            .args(["-of", "json"])
            .arg(video_path)
            .stderr(Stdio::piped())
            .output()
            .context("ffprobeの起動に失敗しました")?;

        if !output.status.success() {
            anyhow::bail!(
                "動画の解析に失敗しました: {} ({})",
                video_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_probe_output(&output.stdout)
    }

    fn open(&self, video_path: &Path) -> Result<Box<dyn FrameStream>> {
        let info = self.probe(video_path)?;

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(video_path)
            .args(["-vsync", "0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("ffmpegの起動に失敗しました")?;

        let stdout = child
            .stdout
            .take()
            .context("ffmpegの標準出力を開けませんでした")?;

        Ok(Box::new(FfmpegFrameStream {
            frame_size: info.width as usize * info.height as usize * 3,
            info,
            child,
            reader: BufReader::new(stdout),
            finished: false,
        }))
    }
}

struct FfmpegFrameStream {
    info: VideoInfo,
    frame_size: usize,
    child: Child,
    reader: BufReader<ChildStdout>,
    finished: bool,
}

impl FrameStream for FfmpegFrameStream {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.frame_size];
        match self.reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.finished = true;
                let status = self.child.wait().context("ffmpegの終了待ちに失敗しました")?;
                if !status.success() {
                    anyhow::bail!("ffmpegが異常終了しました: {}", status);
                }
                return Ok(None);
            }
            Err(e) => return Err(e).context("ffmpegの出力の読み込みに失敗しました"),
        }

        let frame = RgbImage::from_raw(self.info.width, self.info.height, buffer)
            .context("フレームバッファのサイズが不正です")?;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegFrameStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(feature = "gstreamer")]
mod gst_backend {
    use super::{FrameStream, VideoDecoder, VideoInfo};
    use anyhow::{Context, Result};
    use gstreamer::prelude::*;
    use gstreamer::{self as gst, ElementFactory};
    use gstreamer_app::AppSink;
    use image::RgbImage;
    use std::path::Path;

    /// GStreamerによるデコーダ
    pub struct GstreamerExtractor;

    impl GstreamerExtractor {
        /// GStreamerを初期化して作成
        pub fn new() -> Result<Self> {
            gst::init().context("GStreamerの初期化に失敗しました")?;
            Ok(Self)
        }
    }

    fn file_uri(video_path: &Path) -> Result<String> {
        let canonical = video_path
            .canonicalize()
            .context("動画ファイルのパスを解決できませんでした")?;
        let path = canonical
            .to_str()
            .context("動画ファイルのパスがUTF-8ではありません")?
            .replace('\\', "/");
        Ok(format!("file:///{}", path.trim_start_matches("//?/").trim_start_matches('/')))
    }

    impl VideoDecoder for GstreamerExtractor {
        fn probe(&self, video_path: &Path) -> Result<VideoInfo> {
            let uri = file_uri(video_path)?;

            let discoverer = gstreamer_pbutils::Discoverer::new(gst::ClockTime::from_seconds(10))
                .context("Discovererの作成に失敗しました")?;
            let info = discoverer
                .discover_uri(&uri)
                .context("動画の解析に失敗しました")?;

            let video_streams = info.video_streams();
            let video_stream = video_streams.first().context("動画ストリームが見つかりません")?;

            let framerate = video_stream.framerate();
            let fps = if framerate.denom() == 0 {
                0.0
            } else {
                framerate.numer() as f64 / framerate.denom() as f64
            };
            let duration_sec = info
                .duration()
                .map(|d| d.nseconds() as f64 / 1_000_000_000.0)
                .unwrap_or(0.0);

            Ok(VideoInfo {
                width: video_stream.width(),
                height: video_stream.height(),
                fps,
                frame_count: (duration_sec * fps).round() as u64,
            })
        }

        fn open(&self, video_path: &Path) -> Result<Box<dyn FrameStream>> {
            let info = self.probe(video_path)?;
            let location = video_path
                .to_str()
                .context("動画ファイルのパスがUTF-8ではありません")?;

            let pipeline = gst::Pipeline::new();
            let source = ElementFactory::make("filesrc")
                .name("source")
                .property("location", location)
                .build()
                .context("filesrcの作成に失敗しました")?;
            let decodebin = ElementFactory::make("decodebin")
                .name("decoder")
                .build()
                .context("decodebinの作成に失敗しました")?;
            let videoconvert = ElementFactory::make("videoconvert")
                .name("converter")
                .build()
                .context("videoconvertの作成に失敗しました")?;
            let appsink = AppSink::builder()
                .name("sink")
                .caps(&gst::Caps::builder("video/x-raw").field("format", "RGB").build())
                .sync(false)
                .build();

            pipeline
                .add_many([&source, &decodebin, &videoconvert, appsink.upcast_ref::<gst::Element>()])
                .context("エレメントの追加に失敗しました")?;
            source
                .link(&decodebin)
                .context("sourceとdecoderのリンクに失敗しました")?;
            videoconvert
                .link(&appsink)
                .context("converterとsinkのリンクに失敗しました")?;

            let videoconvert_clone = videoconvert.clone();
            decodebin.connect_pad_added(move |_src, src_pad| {
                let Some(sink_pad) = videoconvert_clone.static_pad("sink") else {
                    tracing::error!("videoconvertのsinkパッドが見つかりません");
                    return;
                };
                if !sink_pad.is_linked() {
                    if let Err(e) = src_pad.link(&sink_pad) {
                        tracing::warn!(error = ?e, "パッドのリンクに失敗");
                    }
                }
            });

            pipeline
                .set_state(gst::State::Playing)
                .context("パイプラインの開始に失敗しました")?;

            Ok(Box::new(GstreamerFrameStream {
                info,
                pipeline,
                appsink,
            }))
        }
    }

    struct GstreamerFrameStream {
        info: VideoInfo,
        pipeline: gst::Pipeline,
        appsink: AppSink,
    }

    impl FrameStream for GstreamerFrameStream {
        fn info(&self) -> &VideoInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            let sample = match self.appsink.pull_sample() {
                Ok(sample) => sample,
                Err(_) if self.appsink.is_eos() => return Ok(None),
                Err(e) => return Err(e).context("フレームの取得に失敗しました"),
            };

            let buffer = sample.buffer().context("サンプルにバッファがありません")?;
            let caps = sample.caps().context("サンプルにcapsがありません")?;
            let video_info = gstreamer_video::VideoInfo::from_caps(caps)
                .context("capsから動画情報を取得できませんでした")?;
            let map = buffer
                .map_readable()
                .context("バッファの読み込みに失敗しました")?;

            let width = video_info.width();
            let height = video_info.height();
            let stride = video_info.stride()[0] as usize;
            let row_bytes = width as usize * 3;
            let data = map.as_slice();

            // 行末のパディングを取り除く
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                let line = data
                    .get(start..start + row_bytes)
                    .context("フレームバッファのサイズが不正です")?;
                pixels.extend_from_slice(line);
            }

            let frame = RgbImage::from_raw(width, height, pixels)
                .context("フレームバッファのサイズが不正です")?;
            Ok(Some(frame))
        }
    }

    impl Drop for GstreamerFrameStream {
        fn drop(&mut self) {
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                tracing::warn!(error = ?e, "パイプラインの停止に失敗しました");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("60/1"), Some(60.0));
        assert!((parse_frame_rate("60000/1001").unwrap() - 59.94).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("30"), Some(30.0));
    }

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{"streams":[{"width":1280,"height":720,"avg_frame_rate":"60/1","r_frame_rate":"60/1","nb_read_packets":"3600"}]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(
            info,
            VideoInfo {
                width: 1280,
                height: 720,
                fps: 60.0,
                frame_count: 3600,
            }
        );
    }

    #[test]
    fn test_parse_probe_output_without_stream() {
        assert!(parse_probe_output(br#"{"streams":[]}"#).is_err());
    }

    #[test]
    fn test_save_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.jpeg");
        let img = RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]));
        save_jpeg(&img, &path, 95).unwrap();

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (8, 8));
    }

    #[test]
    fn test_decoder_kind_default() {
        assert_eq!(DecoderKind::default(), DecoderKind::Ffmpeg);
        assert!(build_decoder(DecoderKind::Ffmpeg).is_ok());
    }
}
