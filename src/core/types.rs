use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Subtitle,
    Other,
}

impl TrackKind {
    /// 对应的 mime 前缀（用于轨道选择）
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio/",
            TrackKind::Video => "video/",
            TrackKind::Subtitle => "text/",
            TrackKind::Other => "application/",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackKind::Audio => "音频",
            TrackKind::Video => "视频",
            TrackKind::Subtitle => "字幕",
            TrackKind::Other => "数据",
        };
        write!(f, "{}", name)
    }
}

/// 轨道信息 - 从容器读出后不可变
#[derive(Clone, Serialize)]
pub struct TrackInfo {
    pub index: usize,
    pub mime_type: String,      // 例如 "audio/aac"、"video/h264"
    pub kind: TrackKind,
    pub sample_rate: u32,       // 音频有效
    pub channel_count: u16,     // 音频有效
    pub width: u32,             // 视频有效
    pub height: u32,            // 视频有效
    pub max_input_size: usize,  // 输入缓冲区大小提示
    pub duration_us: i64,       // 轨道时长（微秒，未知为 0）

    /// 编解码器参数（解码器/封装器构造用），probe 输出时跳过
    #[serde(skip)]
    pub parameters: Option<ffmpeg_next::codec::Parameters>,
}

// ffmpeg_next::codec::Parameters 未实现 Debug，这里手动实现 TrackInfo 的
// Debug，parameters 字段仅显示是否存在
impl fmt::Debug for TrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackInfo")
            .field("index", &self.index)
            .field("mime_type", &self.mime_type)
            .field("kind", &self.kind)
            .field("sample_rate", &self.sample_rate)
            .field("channel_count", &self.channel_count)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("max_input_size", &self.max_input_size)
            .field("duration_us", &self.duration_us)
            .field("parameters", &self.parameters.is_some())
            .finish()
    }
}

// Parameters 包裹的是 FFmpeg 分配的参数块，轨道信息在选择后只在
// 单个 driver 线程中使用，跨线程传递是安全的
unsafe impl Send for TrackInfo {}

/// 样本标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags {
    pub is_sync: bool,
    pub is_end_of_stream: bool,
}

impl SampleFlags {
    pub fn sync() -> Self {
        Self { is_sync: true, is_end_of_stream: false }
    }
}

/// 写入封装器时的样本描述
#[derive(Debug, Clone, Copy)]
pub struct SampleInfo {
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: SampleFlags,
}

/// 解码输出格式（FormatChanged 事件携带）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub width: u32,
    pub height: u32,
}

/// 解码输出事件 - 取代魔法负数返回码
#[derive(Debug)]
pub enum OutputEvent {
    /// 一个输出缓冲区就绪（end_of_stream 时 size 为 0）
    FrameReady {
        handle: usize,
        presentation_time_us: i64,
        size: usize,
        end_of_stream: bool,
    },
    /// 输出格式确定/变化，总是先于第一帧
    FormatChanged(OutputFormat),
    /// 暂无输出，本轮排空结束
    NotReady,
}

/// 视频帧数据（RGBA）
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts_us: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// 音频帧数据（交织 f32）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts_us: i64,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

/// 解码后的一帧
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl DecodedFrame {
    pub fn pts_us(&self) -> i64 {
        match self {
            DecodedFrame::Audio(f) => f.pts_us,
            DecodedFrame::Video(f) => f.pts_us,
        }
    }

    /// 有效载荷字节数
    pub fn byte_size(&self) -> usize {
        match self {
            DecodedFrame::Audio(f) => f.data.len() * std::mem::size_of::<f32>(),
            DecodedFrame::Video(f) => f.data.len(),
        }
    }

    pub fn format(&self) -> OutputFormat {
        match self {
            DecodedFrame::Audio(f) => OutputFormat {
                sample_rate: f.sample_rate,
                channel_count: f.channels,
                ..Default::default()
            },
            DecodedFrame::Video(f) => OutputFormat {
                width: f.width,
                height: f.height,
                ..Default::default()
            },
        }
    }
}

/// 管线观察者 - 核心通过它回调外部（UI/日志），不依赖任何展示层
pub trait PipelineObserver: Send + Sync {
    /// 每成功推进一个样本后调用（毫秒）
    fn on_progress(&self, _presentation_time_ms: i64) {}

    /// 抽取成功完成后调用一次
    fn on_complete(&self, _output_path: &str) {}

    /// 轨道选择失败时调用
    fn on_track_missing(&self, _kind: TrackKind) {}
}

/// 空观察者（测试/无界面场景）
pub struct NullObserver;

impl PipelineObserver for NullObserver {}

/// 输入缓冲区不可用时的处理策略
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    /// 立即中止本次运行（上游原始行为，截断输出）
    Abort,
    /// 有界重试 + 退避，预算耗尽才中止
    Bounded { attempts: u32, backoff: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded {
            attempts: 50,
            backoff: Duration::from_millis(5),
        }
    }
}

/// 解码 driver 配置
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub retry: RetryPolicy,
    pub input_timeout: Duration,
    pub output_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            input_timeout: Duration::from_millis(10),
            output_timeout: Duration::from_millis(10),
        }
    }
}
