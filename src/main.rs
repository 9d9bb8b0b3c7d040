use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

mod app;
mod core;
mod pipeline;

use crate::core::{DriverConfig, RetryPolicy, TrackKind};
use crate::pipeline::{
    run_extract, run_play_audio, run_play_video, AudioSink, CodecBackend, Demuxer, FfmpegBackend,
    PcmOutput, Remuxer, SampleSource, SampleWriter,
};
use app::{ConsoleObserver, StatsSurface, WorkerPool};

#[derive(Parser)]
#[command(name = "myy_codec", about = "媒体解封装/解码/抽取工具", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MediaKind {
    Audio,
    Video,
}

impl From<MediaKind> for TrackKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => TrackKind::Audio,
            MediaKind::Video => TrackKind::Video,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// 枚举容器里的轨道信息（JSON 输出）
    Probe { input: String },

    /// 无损抽取单条轨道到新的 MP4 容器
    Extract {
        input: String,

        /// 输出文件路径
        #[arg(short, long)]
        output: String,

        /// 抽取的轨道类型
        #[arg(long, value_enum, default_value = "audio")]
        kind: MediaKind,
    },

    /// 解码播放：音频到输出设备，视频按墙钟节拍释放
    Play {
        input: String,

        /// 只播放音频轨道
        #[arg(long, conflicts_with = "video_only")]
        audio_only: bool,

        /// 只解码视频轨道
        #[arg(long)]
        video_only: bool,

        /// 音量 (0.0 - 1.0)
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        /// 输入缓冲区不可用时立即中止（默认有界重试）
        #[arg(long)]
        abort_on_input_stall: bool,
    },
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // 初始化 FFmpeg
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;

    let cli = Cli::parse();
    match cli.command {
        Command::Probe { input } => probe(&input),
        Command::Extract { input, output, kind } => extract(&input, &output, kind.into()),
        Command::Play { input, audio_only, video_only, volume, abort_on_input_stall } => {
            let config = DriverConfig {
                retry: if abort_on_input_stall {
                    RetryPolicy::Abort
                } else {
                    RetryPolicy::Bounded { attempts: 50, backoff: Duration::from_millis(5) }
                },
                ..DriverConfig::default()
            };
            play(&input, audio_only, video_only, volume, config)
        }
    }
}

/// 枚举轨道并以 JSON 打印
fn probe(input: &str) -> Result<()> {
    let mut demuxer = Demuxer::open(input)?;
    println!("{}", serde_json::to_string_pretty(demuxer.tracks())?);
    demuxer.release();
    Ok(())
}

/// 无损抽取选中轨道
fn extract(input: &str, output: &str, kind: TrackKind) -> Result<()> {
    let observer = ConsoleObserver::new();
    let cancel = AtomicBool::new(false);

    let mut demuxer = Demuxer::open(input)?;
    let output_path = output.to_string();
    let written = run_extract(
        &mut demuxer,
        &mut |_track| Ok(Box::new(Remuxer::create(&output_path)?) as Box<dyn SampleWriter>),
        kind,
        output,
        &observer,
        &cancel,
    )?;
    info!("共抽取 {} 个样本", written);
    Ok(())
}

/// 解码播放：音频/视频 driver 各占一个工作线程，相互之间没有顺序保证
fn play(
    input: &str,
    audio_only: bool,
    video_only: bool,
    volume: f32,
    config: DriverConfig,
) -> Result<()> {
    let observer = Arc::new(ConsoleObserver::new());
    let cancel = Arc::new(AtomicBool::new(false));

    let mut pool = WorkerPool::new(2, 4);

    if !video_only {
        let path = input.to_string();
        let observer = observer.clone();
        let cancel = cancel.clone();
        pool.submit(Box::new(move || {
            let result = Demuxer::open(&path).and_then(|mut demuxer| {
                run_play_audio(
                    &mut demuxer,
                    &mut |track| Ok(Box::new(FfmpegBackend::new(track)?) as Box<dyn CodecBackend>),
                    &mut |format| {
                        let sink = AudioSink::create(format.sample_rate, format.channel_count)?;
                        sink.set_volume(volume);
                        Ok(Box::new(sink) as Box<dyn PcmOutput>)
                    },
                    observer.as_ref(),
                    &cancel,
                    &config,
                )
            });
            match result {
                Ok(stats) => info!("音频播放结束: {} 帧 / {} 字节", stats.frames, stats.decoded_bytes),
                Err(e) => error!("音频播放失败: {}", e),
            }
        }));
    }

    if !audio_only {
        let path = input.to_string();
        let observer = observer.clone();
        let cancel = cancel.clone();
        pool.submit(Box::new(move || {
            let result = Demuxer::open(&path).and_then(|mut demuxer| {
                run_play_video(
                    &mut demuxer,
                    &mut |track| Ok(Box::new(FfmpegBackend::new(track)?) as Box<dyn CodecBackend>),
                    Box::new(StatsSurface::default()),
                    observer.as_ref(),
                    &cancel,
                    &config,
                )
            });
            match result {
                Ok(stats) => info!("视频解码结束: {} 帧", stats.frames),
                Err(e) => error!("视频解码失败: {}", e),
            }
        }));
    }

    pool.shutdown();
    Ok(())
}
