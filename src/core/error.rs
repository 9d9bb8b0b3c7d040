use thiserror::Error;

use crate::core::types::TrackKind;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("没有匹配的{0}轨道")]
    NoMatchingTrack(TrackKind),

    #[error("输入缓冲区不可用（重试预算已耗尽）")]
    InputBufferUnavailable,

    #[error("解码器配置失败: {0}")]
    CodecConfiguration(String),

    #[error("输出缓冲区无效")]
    OutputBufferInvalid,

    #[error("状态错误: {0}")]
    InvalidState(&'static str),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("封装错误: {0}")]
    MuxError(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
