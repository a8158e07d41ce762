//! バックグラウンド処理
//!
//! アーカイブのアップロードや後続ジョブの登録はメインの解析を止めずにワーカーで行う。
//! 失敗はログに残すだけで呼び出し元には伝えない。

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Task {
    label: String,
    job: Job,
}

/// 待機できるタスク数の既定値
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// 固定数のワーカースレッド
///
/// 待機中のタスクが`queue_capacity`件に達すると、空きが出るまで`submit`が待つ。
/// ドロップ時に残りのタスクを処理し終えるまで待つ。
pub struct BackgroundWorkers {
    sender: Option<SyncSender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_capacity(workers, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(workers: usize, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut threads = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("BackgroundWorker-{}", index))
                .spawn(move || run(receiver))
                .with_context(|| format!("ワーカースレッドの起動に失敗しました: {}", index))?;
            threads.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            threads,
        })
    }

    /// タスクを登録する
    ///
    /// キューが一杯の間はブロックする。
    pub fn submit<F>(&self, label: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        let Some(sender) = &self.sender else {
            error!(label = %label, "ワーカーは停止済みです");
            return;
        };

        debug!(label = %label, "バックグラウンドタスクを登録します");
        let task = Task {
            label,
            job: Box::new(job),
        };
        let result = match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                warn!(label = %task.label, "タスクキューが一杯のため空きを待ちます");
                sender.send(task).map_err(|e| e.0)
            }
            Err(TrySendError::Disconnected(task)) => Err(task),
        };

        if let Err(task) = result {
            error!(label = %task.label, "バックグラウンドタスクを登録できませんでした");
        }
    }
}

fn run(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => {
                error!("タスクキューのロックに失敗しました");
                return;
            }
        };

        // 送信側が閉じられたら終了
        let Ok(Task { label, job }) = task else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => debug!(label = %label, "バックグラウンドタスクが完了しました"),
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                error!(label = %label, error = %message, "バックグラウンドタスクが失敗しました");
            }
            Err(_) => error!(label = %label, "バックグラウンドタスクがパニックしました"),
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        drop(self.sender.take());

        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                error!(error = ?e, "ワーカースレッドの終了に失敗しました");
            }
        }
    }
}

/// 後続の解析ジョブの登録先
pub trait JobScheduler: Send + Sync {
    fn schedule_analysis(&self, replay_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SpooledJob {
    replay_id: String,
}

/// `<dir>/<replay_id>.job` としてジョブを置くスケジューラ
#[derive(Debug, Clone)]
pub struct SpoolScheduler {
    dir: PathBuf,
}

impl SpoolScheduler {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn job_path(&self, replay_id: &str) -> PathBuf {
        self.dir.join(format!("{}.job", replay_id))
    }

    /// 未処理のリプレイID（昇順）
    pub fn pending(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut replay_ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("スプールを読めませんでした: {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("job") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("ジョブファイルの読み込みに失敗しました: {}", path.display()))?;
            let job: SpooledJob = serde_json::from_str(&contents)
                .with_context(|| format!("ジョブファイルの解析に失敗しました: {}", path.display()))?;
            replay_ids.push(job.replay_id);
        }

        replay_ids.sort();
        Ok(replay_ids)
    }

    /// 処理済みのジョブを取り除く
    pub fn complete(&self, replay_id: &str) -> Result<()> {
        let path = self.job_path(replay_id);
        fs::remove_file(&path)
            .with_context(|| format!("ジョブファイルの削除に失敗しました: {}", path.display()))
    }
}

impl JobScheduler for SpoolScheduler {
    fn schedule_analysis(&self, replay_id: &str) -> Result<()> {
        if replay_id.is_empty() || replay_id.contains(['/', '\\']) {
            return Err(anyhow!("不正なリプレイIDです: {:?}", replay_id));
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("スプールの作成に失敗しました: {}", self.dir.display()))?;

        let path = self.job_path(replay_id);
        let job = SpooledJob {
            replay_id: replay_id.to_string(),
        };
        fs::write(&path, serde_json::to_vec(&job)?)
            .with_context(|| format!("ジョブファイルの書き込みに失敗しました: {}", path.display()))?;

        info!(replay_id, "解析ジョブを登録しました");
        Ok(())
    }
}
