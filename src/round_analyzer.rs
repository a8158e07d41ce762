//! ラウンド単位のフレーム解析
//!
//! 1ラウンド分のフレームを順番に読み、両プレイヤーの入力を1フレーム1レコードとして
//! 復元する。認識結果そのものの正解はないので、画面上の入力カウンタとの整合性だけで
//! キャプチャ品質（重複フレーム・フレーム落ち）を判定する。
//!
//! # 1フレームの処理順
//! 1. 開始判定: 再生開始を検出するまでは破棄
//! 2. 重複判定: 直前フレームとの差分が小さければ破棄
//! 3. ラウンド終了判定: どちらかの最新行カウンタが0なら終了
//! 4. フレーム落ち判定: 3行分のカウンタの連続性を確認
//! 5. 入力の読み取り
//! 6. 継続フレーム数の検証
//! 7. レコード出力

use crate::error::{AnalysisError, AnalysisResult, BatchOutcome};
use crate::frame_batcher::Batch;
use crate::frame_extractor::save_jpeg;
use crate::recognizer::{Frame, InputMode, InputToken, Player, Recognizer, DUPLICATE_MSE_THRESHOLD};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// フレーム落ち判定に使うカウンタの行数
pub const COUNTER_ROWS: usize = 3;

/// 画面のカウンタ表示は99で頭打ちになる。この値以上の継続は検証できない
pub const RUN_LENGTH_SATURATION: u32 = 100;

/// カウンタ表示の上限
const COUNTER_DISPLAY_MAX: u32 = 99;

/// 最新フレームの保存先ファイル名
const LAST_FRAME_FILE: &str = "frame.jpeg";

const LAST_IMAGE_QUALITY: u8 = 90;

/// 解析済み1フレーム分の入力
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_id: u64,
    pub p1_input: InputToken,
    pub p2_input: InputToken,
}

/// カウンタ連続性の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropVerdict {
    Ok,
    Dropped,
}

/// 1フレームの処理結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStep {
    /// 再生開始前
    NotStarted,
    /// 直前フレームと同一
    Duplicate,
    /// ラウンド終了を検出
    RoundEnded,
    Recorded(FrameRecord),
}

/// ラウンド解析の設定
#[derive(Debug, Clone, Default)]
pub struct RoundAnalyzerConfig {
    /// このフレーム番号以下は読み飛ばす
    pub start_frame_at: Option<u64>,
    /// デバッグ用。このフレームに到達したら停止する
    pub stop_frame_at: Option<u64>,
    /// 入力の切り替わりごとに継続フレーム数をログ出力する
    pub log_collapsed_inputs: bool,
    /// 画面上の継続フレーム数と突き合わせる
    pub verify_inputs_count: bool,
    /// 診断用画像の保存先（Noneなら保存しない）
    pub last_images_dir: Option<PathBuf>,
}

/// ラウンド内で持ち回る状態
///
/// プレイヤーごとの値は`Player::index()`で引く。
#[derive(Debug, Clone)]
pub struct RoundAnalysisState {
    pub replay_started: bool,
    pub previous_frame: Option<Frame>,
    pub previous_counter_rows: [Option<Vec<u32>>; 2],
    pub input_history: [Vec<InputToken>; 2],
    pub current_run_length: [u32; 2],
    pub run_verifiable: [bool; 2],
    pub duplicate_frame_count: u64,
    pub dropped_frame_count: u64,
}

impl Default for RoundAnalysisState {
    fn default() -> Self {
        Self {
            replay_started: false,
            previous_frame: None,
            previous_counter_rows: [None, None],
            input_history: [Vec::new(), Vec::new()],
            current_run_length: [1, 1],
            run_verifiable: [false, false],
            duplicate_frame_count: 0,
            dropped_frame_count: 0,
        }
    }
}

impl RoundAnalysisState {
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate_runs(&mut self) {
        self.run_verifiable = [false, false];
    }
}

/// 1フレームの処理に必要な読み取り専用の文脈
pub struct FrameContext<'a> {
    pub recognizer: &'a dyn Recognizer,
    pub config: &'a RoundAnalyzerConfig,
    pub modes: [InputMode; 2],
    pub round_id: u32,
}

/// 1プレイヤー分のカウンタ行を直前の読み取りと比較する
///
/// 次のいずれかなら連続とみなす。
/// - 最新行が1増え、2行目以降が変わらない
/// - 最新行が1に戻り、直前の行がそのまま1行下にずれた
/// - 最新行が99（表示上限）で、2行目以降が変わらない
pub fn compare_counter_rows(current: &[u32], previous: &[u32]) -> DropVerdict {
    // 行数が食い違う読み取りは比較の時点で不一致になる
    let (Some((&head, tail)), Some((&prev_head, prev_tail))) = (current.split_first(), previous.split_first())
    else {
        return DropVerdict::Dropped;
    };

    if head == prev_head + 1 && tail == prev_tail {
        return DropVerdict::Ok;
    }
    if head == 1 && tail == &previous[..previous.len() - 1] {
        return DropVerdict::Ok;
    }
    if head == COUNTER_DISPLAY_MAX && tail == prev_tail {
        return DropVerdict::Ok;
    }

    DropVerdict::Dropped
}

/// 両プレイヤーのカウンタから判定する。初回の読み取りは無条件で連続扱い
pub fn evaluate_counter_rows(current: [&[u32]; 2], previous: [Option<&[u32]>; 2]) -> DropVerdict {
    let (Some(prev_p1), Some(prev_p2)) = (previous[0], previous[1]) else {
        return DropVerdict::Ok;
    };

    if compare_counter_rows(current[0], prev_p1) == DropVerdict::Ok
        && compare_counter_rows(current[1], prev_p2) == DropVerdict::Ok
    {
        DropVerdict::Ok
    } else {
        DropVerdict::Dropped
    }
}

/// 1フレームを処理して状態を進める
pub fn analyze_frame(
    ctx: &FrameContext<'_>,
    state: &mut RoundAnalysisState,
    frame: Frame,
) -> AnalysisResult<FrameStep> {
    let frame_id = frame.id;

    if !state.replay_started {
        if !ctx.recognizer.is_round_started(&frame)? {
            return Ok(FrameStep::NotStarted);
        }
        info!(round_id = ctx.round_id, frame_id, "リプレイ再生の開始を検出しました");
        state.replay_started = true;
    }

    let duplicate = match &state.previous_frame {
        Some(previous) => ctx.recognizer.frame_difference(&frame, previous)? < DUPLICATE_MSE_THRESHOLD,
        None => false,
    };
    if duplicate {
        debug!(frame_id, "duplicate");
        state.duplicate_frame_count += 1;
        state.previous_frame = Some(frame);
        return Ok(FrameStep::Duplicate);
    }

    if is_round_over(ctx, &frame)? {
        info!(round_id = ctx.round_id, frame_id, "game_over");
        state.previous_frame = Some(frame);
        return Ok(FrameStep::RoundEnded);
    }

    if let Some(dir) = &ctx.config.last_images_dir {
        save_jpeg(&frame.image, dir.join(LAST_FRAME_FILE), LAST_IMAGE_QUALITY)?;
    }

    let verdict = check_dropped_frames(ctx, state, &frame)?;

    if ctx.config.stop_frame_at == Some(frame_id) {
        return Err(AnalysisError::StoppedAt { frame_id });
    }

    if verdict == DropVerdict::Dropped {
        state.invalidate_runs();
    }

    let p1_input = ctx.recognizer.read_input_token(&frame, Player::P1, ctx.modes[0])?;
    let p2_input = ctx.recognizer.read_input_token(&frame, Player::P2, ctx.modes[1])?;

    debug!(
        round_id = ctx.round_id,
        frame_id,
        p1 = %display_reading(&p1_input),
        p2 = %display_reading(&p2_input),
        "input"
    );

    let p1_input = verify_player_input(ctx, state, &frame, Player::P1, p1_input)?;
    let p2_input = verify_player_input(ctx, state, &frame, Player::P2, p2_input)?;

    // 落ちたフレームで始まった入力は継続数が信用できない
    if verdict == DropVerdict::Dropped {
        state.invalidate_runs();
    }

    state.previous_frame = Some(frame);

    Ok(FrameStep::Recorded(FrameRecord {
        frame_id,
        p1_input,
        p2_input,
    }))
}

fn display_reading(reading: &Option<InputToken>) -> String {
    match reading {
        Some(token) => token.to_string(),
        None => "undefined".to_string(),
    }
}

fn read_head_counter(ctx: &FrameContext<'_>, frame: &Frame, player: Player) -> AnalysisResult<u32> {
    let rows = ctx.recognizer.read_input_counter_rows(frame, player, 1)?;
    let head = rows
        .first()
        .copied()
        .with_context(|| format!("{}の入力カウンタを読めませんでした (frame_id={})", player, frame.id))?;
    Ok(head)
}

fn is_round_over(ctx: &FrameContext<'_>, frame: &Frame) -> AnalysisResult<bool> {
    let p1 = read_head_counter(ctx, frame, Player::P1)?;
    let p2 = read_head_counter(ctx, frame, Player::P2)?;
    Ok(p1 == 0 || p2 == 0)
}

fn check_dropped_frames(
    ctx: &FrameContext<'_>,
    state: &mut RoundAnalysisState,
    frame: &Frame,
) -> AnalysisResult<DropVerdict> {
    let p1_rows = ctx.recognizer.read_input_counter_rows(frame, Player::P1, COUNTER_ROWS)?;
    let p2_rows = ctx.recognizer.read_input_counter_rows(frame, Player::P2, COUNTER_ROWS)?;

    let verdict = evaluate_counter_rows(
        [p1_rows.as_slice(), p2_rows.as_slice()],
        [
            state.previous_counter_rows[0].as_deref(),
            state.previous_counter_rows[1].as_deref(),
        ],
    );

    if verdict == DropVerdict::Dropped {
        state.dropped_frame_count += 1;
    }

    debug!(
        frame_id = frame.id,
        ret = ?verdict,
        p1_counts = ?p1_rows,
        p2_counts = ?p2_rows,
        "check_dropped_frames"
    );

    state.previous_counter_rows = [Some(p1_rows), Some(p2_rows)];
    Ok(verdict)
}

fn verify_player_input(
    ctx: &FrameContext<'_>,
    state: &mut RoundAnalysisState,
    frame: &Frame,
    player: Player,
    reading: Option<InputToken>,
) -> AnalysisResult<InputToken> {
    let Some(input) = reading else {
        return Err(AnalysisError::UndefinedInput {
            player,
            frame_id: frame.id,
        });
    };

    let i = player.index();

    match state.input_history[i].last() {
        Some(last) if *last == input => {
            state.current_run_length[i] += 1;
        }
        Some(last) => {
            let run_length = state.current_run_length[i];

            if ctx.config.log_collapsed_inputs {
                info!(player = %player, count = run_length, input = %last, "collapsed");
            }

            if ctx.config.verify_inputs_count && state.run_verifiable[i] {
                let expected = ctx.recognizer.read_input_run_overlay_count(frame, player)?;

                if run_length < RUN_LENGTH_SATURATION && expected != run_length {
                    if let Some(dir) = &ctx.config.last_images_dir {
                        let path = dir.join(format!("{}_input_verification_error.jpeg", player));
                        save_jpeg(&frame.image, path, LAST_IMAGE_QUALITY)?;
                    }

                    return Err(AnalysisError::VerificationMismatch {
                        player,
                        expected,
                        actual: run_length,
                        frame_id: frame.id,
                        last_input: last.to_string(),
                    });
                }
            }

            state.run_verifiable[i] = true;
            state.current_run_length[i] = 1;
        }
        None => {}
    }

    state.input_history[i].push(input.clone());
    Ok(input)
}

/// 1ラウンド分の解析器
///
/// バッチを順に受け取り、出力したレコードは[`RoundAnalyzer::take_records`]で
/// 取り出されるまで保持する。成功・失敗どちらの場合も呼び出し側が取り出すこと。
pub struct RoundAnalyzer<'a> {
    recognizer: &'a dyn Recognizer,
    config: RoundAnalyzerConfig,
    modes: [InputMode; 2],
    replay_id: String,
    round_id: u32,
    state: RoundAnalysisState,
    records: Vec<FrameRecord>,
}

impl<'a> RoundAnalyzer<'a> {
    /// 新しい解析器を作成
    pub fn new(
        recognizer: &'a dyn Recognizer,
        config: RoundAnalyzerConfig,
        replay_id: impl Into<String>,
        round_id: u32,
        modes: [InputMode; 2],
    ) -> AnalysisResult<Self> {
        if let Some(dir) = &config.last_images_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("診断画像ディレクトリの作成に失敗: {}", dir.display()))?;
        }

        Ok(Self {
            recognizer,
            config,
            modes,
            replay_id: replay_id.into(),
            round_id,
            state: RoundAnalysisState::new(),
            records: Vec::new(),
        })
    }

    pub fn replay_id(&self) -> &str {
        &self.replay_id
    }

    pub fn round_id(&self) -> u32 {
        self.round_id
    }

    pub fn state(&self) -> &RoundAnalysisState {
        &self.state
    }

    /// 1フレームを処理し、出力されたレコードを蓄積する
    pub fn analyze_frame(&mut self, frame: Frame) -> AnalysisResult<FrameStep> {
        let ctx = FrameContext {
            recognizer: self.recognizer,
            config: &self.config,
            modes: self.modes,
            round_id: self.round_id,
        };

        let step = analyze_frame(&ctx, &mut self.state, frame)?;
        if let FrameStep::Recorded(record) = &step {
            self.records.push(record.clone());
        }
        Ok(step)
    }

    /// バッチ内のフレームを順に解析
    pub fn analyze_batch(&mut self, batch: &Batch) -> AnalysisResult<BatchOutcome> {
        info!(
            replay_id = %self.replay_id,
            round_id = self.round_id,
            frame_range = ?batch.frame_range,
            frame_dir = %batch.frame_dir.display(),
            "フレーム解析を開始します"
        );

        for frame_id in batch.frame_range.clone() {
            if self.config.start_frame_at.is_some_and(|start| frame_id <= start) {
                continue;
            }

            let path = batch.frame_path(frame_id);
            let image = image::open(&path)
                .with_context(|| format!("フレーム画像を開けませんでした: {}", path.display()))?
                .to_rgb8();

            if let FrameStep::RoundEnded = self.analyze_frame(Frame { id: frame_id, image })? {
                return Ok(BatchOutcome::RoundEnded { frame_id });
            }
        }

        Ok(BatchOutcome::Completed)
    }

    /// 蓄積したレコードを取り出して空にする
    pub fn take_records(&mut self) -> Vec<FrameRecord> {
        std::mem::take(&mut self.records)
    }
}
