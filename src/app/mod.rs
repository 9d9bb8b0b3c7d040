// 嵌入层：核心之外的外部协作者（任务队列 / 进度展示 / 渲染占位）

use crate::core::{PipelineObserver, TrackKind, VideoFrame};
use crate::pipeline::VideoSurface;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info};
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

/// 提交给工作线程池的任务
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 有界任务队列 + 固定工作线程
///
/// 核心 API 是同步阻塞的，并发完全是嵌入层的事：一个 driver 独占
/// 一个工作线程跑到结束，队列满时 submit 阻塞形成背压
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(queue_capacity);

        let workers = (0..worker_count)
            .map(|i| {
                let job_rx = job_rx.clone();
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            job();
                        }
                        debug!("工作线程 {} 退出", i);
                    })
                    .expect("创建工作线程失败")
            })
            .collect();

        Self { job_tx: Some(job_tx), workers }
    }

    /// 提交任务；队列满时阻塞
    pub fn submit(&self, job: Job) {
        if let Some(job_tx) = &self.job_tx {
            let _ = job_tx.send(job);
        }
    }

    /// 关闭队列并等待全部任务跑完（幂等）
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 控制台观察者 - 进度时间标签按秒节流，完成/缺轨道走日志
pub struct ConsoleObserver {
    last_second: AtomicI64,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self { last_second: AtomicI64::new(-1) }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineObserver for ConsoleObserver {
    fn on_progress(&self, presentation_time_ms: i64) {
        let second = presentation_time_ms / 1000;
        if self.last_second.swap(second, Ordering::Relaxed) != second {
            info!("进度 {}", format_time(presentation_time_ms));
        }
    }

    fn on_complete(&self, output_path: &str) {
        info!("✅ 抽取完成，输出文件: {}", output_path);
    }

    fn on_track_missing(&self, kind: TrackKind) {
        error!("没有匹配的{}轨道", kind);
    }
}

/// 渲染目标占位 - 只统计按时释放的帧，像素呈现不在本工具范围内
#[derive(Default)]
pub struct StatsSurface {
    frames: u64,
    last_pts_us: i64,
}

impl VideoSurface for StatsSurface {
    fn render_frame(&mut self, frame: &VideoFrame) {
        self.frames += 1;
        self.last_pts_us = frame.pts_us;
        if self.frames % 30 == 0 {
            debug!(
                "已渲染 {} 帧, {}x{}, pts = {}",
                self.frames, frame.width, frame.height,
                format_time(frame.pts_us / 1000)
            );
        }
    }
}

impl Drop for StatsSurface {
    fn drop(&mut self) {
        if self.frames > 0 {
            info!("共渲染 {} 帧，最后 pts = {}", self.frames, format_time(self.last_pts_us / 1000));
        }
    }
}

/// 毫秒时间格式化为 HH:MM:SS
pub fn format_time(time_ms: i64) -> String {
    let total_seconds = (time_ms / 1000).max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
