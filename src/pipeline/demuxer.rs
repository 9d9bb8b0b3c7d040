use crate::core::{PipelineError, Result, SampleFlags, TrackInfo, TrackKind};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};

/// 样本源抽象接口
///
/// 读取语义固定：read_sample 不消费当前样本，重复调用返回同一个样本，
/// 直到 advance 推进位置
pub trait SampleSource: Send {
    /// 轨道数量
    fn track_count(&self) -> usize;

    /// 轨道信息
    fn track_info(&self, index: usize) -> Option<&TrackInfo>;

    /// 选择轨道，之后的读取只返回该轨道的样本
    fn select_track(&mut self, index: usize) -> Result<()>;

    /// 读取当前样本到 buf
    ///
    /// 返回：
    /// - Ok(Some(size)): 成功读取，buf 中为样本载荷
    /// - Ok(None): 到达流末尾
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>>;

    /// 推进到下一个样本，返回是否还有样本
    fn advance(&mut self) -> Result<bool>;

    /// 当前样本的显示时间戳（微秒，无样本时为 -1）
    fn sample_time_us(&self) -> i64;

    /// 当前样本的标志
    fn sample_flags(&self) -> SampleFlags;

    /// 幂等释放
    fn release(&mut self);
}

/// 轨道选择算法：按索引顺序线性扫描，选中第一个 mime 前缀匹配的轨道
///
/// 没有匹配轨道时返回 NoMatchingTrack，调用方必须中止本次运行，
/// 不产生任何输出副作用
pub fn select_track_by_kind(source: &mut dyn SampleSource, kind: TrackKind) -> Result<TrackInfo> {
    let prefix = kind.mime_prefix();
    for index in 0..source.track_count() {
        let matched = match source.track_info(index) {
            Some(track) => {
                debug!("轨道 {}: mime = {}", index, track.mime_type);
                track.mime_type.starts_with(prefix)
            }
            None => false,
        };
        if matched {
            source.select_track(index)?;
            // select_track 校验过索引，这里一定存在
            return Ok(source.track_info(index).cloned().unwrap());
        }
    }
    Err(PipelineError::NoMatchingTrack(kind))
}

/// 当前样本（已从容器读出，等待消费或推进）
struct CurrentSample {
    packet: ffmpeg::Packet,
    pts_us: i64,
    flags: SampleFlags,
}

/// 解封装器 - 打开容器、枚举轨道、顺序读取选中轨道的样本
pub struct Demuxer {
    input_ctx: Option<format::context::Input>,
    tracks: Vec<TrackInfo>,
    selected: Option<usize>,
    current: Option<CurrentSample>,
    exhausted: bool,
    source_path: String,
}

// ffmpeg::Packet 本身不是 Send，但 Demuxer 的所有操作都在拥有它的
// driver 线程上顺序执行，跨线程移动是安全的
unsafe impl Send for Demuxer {}

impl Demuxer {
    /// 打开媒体文件并枚举轨道
    pub fn open(path: &str) -> Result<Self> {
        info!("正在打开文件: {}", path);

        let input_ctx = format::input(&path)
            .map_err(|e| PipelineError::OpenError(format!("无法打开文件 {}: {}", path, e)))?;

        let container_duration_us = input_ctx.duration().max(0);
        let mut tracks = Vec::new();
        for stream in input_ctx.streams() {
            let track = Self::probe_track(&stream, container_duration_us);
            debug!("轨道 {}: mime = {}", track.index, track.mime_type);
            tracks.push(track);
        }

        Ok(Self {
            input_ctx: Some(input_ctx),
            tracks,
            selected: None,
            current: None,
            exhausted: false,
            source_path: path.to_string(),
        })
    }

    /// 读取一条轨道的信息
    fn probe_track(stream: &format::stream::Stream, container_duration_us: i64) -> TrackInfo {
        let parameters = stream.parameters();
        let kind = match parameters.medium() {
            media::Type::Audio => TrackKind::Audio,
            media::Type::Video => TrackKind::Video,
            media::Type::Subtitle => TrackKind::Subtitle,
            _ => TrackKind::Other,
        };
        let mime_type = mime_for(kind, parameters.id().name());

        // 宽高/采样率要从解码器上下文取；取不到时保持 0，不影响轨道选择
        let mut sample_rate = 0u32;
        let mut channel_count = 0u16;
        let mut width = 0u32;
        let mut height = 0u32;
        if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(parameters.clone()) {
            match kind {
                TrackKind::Audio => {
                    if let Ok(audio) = ctx.decoder().audio() {
                        sample_rate = audio.rate();
                        channel_count = audio.channels();
                    }
                }
                TrackKind::Video => {
                    if let Ok(video) = ctx.decoder().video() {
                        width = video.width();
                        height = video.height();
                    }
                }
                _ => {}
            }
        }

        let tb = stream.time_base();
        let tb_f = tb.numerator() as f64 / tb.denominator() as f64;
        let stream_duration = stream.duration();
        let duration_us = if stream_duration > 0 {
            (stream_duration as f64 * tb_f * 1_000_000.0) as i64
        } else {
            container_duration_us
        };

        TrackInfo {
            index: stream.index(),
            mime_type,
            kind,
            sample_rate,
            channel_count,
            width,
            height,
            max_input_size: input_size_hint(kind, width, height),
            duration_us,
            parameters: Some(parameters),
        }
    }

    /// 拉取选中轨道的下一个包，其他轨道的包跳过
    fn pull_next(&mut self) -> Result<()> {
        let selected = self
            .selected
            .ok_or(PipelineError::InvalidState("读取样本前必须先选择轨道"))?;
        let input_ctx = self
            .input_ctx
            .as_mut()
            .ok_or(PipelineError::InvalidState("解封装器已释放"))?;

        let tb = input_ctx
            .stream(selected)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg::Rational(1, 1_000_000));
        let tb_f = tb.numerator() as f64 / tb.denominator() as f64;

        loop {
            match input_ctx.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != selected {
                        continue;
                    }
                    let ts = packet.pts().or(packet.dts()).unwrap_or(0);
                    let pts_us = (ts as f64 * tb_f * 1_000_000.0) as i64;
                    let flags = SampleFlags {
                        is_sync: packet.is_key(),
                        is_end_of_stream: false,
                    };
                    self.current = Some(CurrentSample { packet, pts_us, flags });
                    return Ok(());
                }
                None => {
                    self.exhausted = true;
                    self.current = None;
                    return Ok(());
                }
            }
        }
    }

    /// 全部轨道信息（probe 用）
    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }
}

impl SampleSource for Demuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_info(&self, index: usize) -> Option<&TrackInfo> {
        self.tracks.get(index)
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(PipelineError::InvalidState("轨道索引越界"));
        }
        self.selected = Some(index);
        self.current = None;
        self.exhausted = false;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        if self.current.is_none() && !self.exhausted {
            self.pull_next()?;
        }
        match &self.current {
            Some(sample) => {
                let data = sample.packet.data().unwrap_or(&[]);
                buf.clear();
                buf.extend_from_slice(data);
                Ok(Some(data.len()))
            }
            None => Ok(None),
        }
    }

    fn advance(&mut self) -> Result<bool> {
        self.current = None;
        if !self.exhausted {
            self.pull_next()?;
        }
        Ok(self.current.is_some())
    }

    fn sample_time_us(&self) -> i64 {
        self.current.as_ref().map(|s| s.pts_us).unwrap_or(-1)
    }

    fn sample_flags(&self) -> SampleFlags {
        self.current.as_ref().map(|s| s.flags).unwrap_or_default()
    }

    fn release(&mut self) {
        self.current = None;
        if self.input_ctx.take().is_some() {
            debug!("解封装器已释放: {}", self.source_path);
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if self.input_ctx.is_some() {
            warn!("Demuxer 被 drop 时尚未显式释放: {}", self.source_path);
        }
        self.release();
    }
}

/// 由轨道类型和编解码器名推导 mime 类型
pub fn mime_for(kind: TrackKind, codec_name: &str) -> String {
    format!("{}{}", kind.mime_prefix(), codec_name)
}

/// 输入缓冲区大小提示（容器没有显式提示时的估算值）
fn input_size_hint(kind: TrackKind, width: u32, height: u32) -> usize {
    match kind {
        TrackKind::Audio => 64 * 1024,
        TrackKind::Video => ((width * height) as usize).max(1024 * 1024),
        _ => 64 * 1024,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// 测试用样本
    #[derive(Clone)]
    pub struct FakeSample {
        pub data: Vec<u8>,
        pub pts_us: i64,
        pub is_sync: bool,
    }

    /// 测试用样本源：固定轨道表 + 预置样本序列
    pub struct FakeSource {
        pub tracks: Vec<TrackInfo>,
        pub samples: Vec<FakeSample>,
        pub selected: Option<usize>,
        pos: usize,
        pub release_count: usize,
    }

    impl FakeSource {
        pub fn new(mimes: &[&str], samples: Vec<FakeSample>) -> Self {
            let tracks = mimes
                .iter()
                .enumerate()
                .map(|(index, mime)| {
                    let kind = if mime.starts_with("audio/") {
                        TrackKind::Audio
                    } else if mime.starts_with("video/") {
                        TrackKind::Video
                    } else {
                        TrackKind::Other
                    };
                    TrackInfo {
                        index,
                        mime_type: mime.to_string(),
                        kind,
                        sample_rate: 44100,
                        channel_count: 2,
                        width: 0,
                        height: 0,
                        max_input_size: 4096,
                        duration_us: 0,
                        parameters: None,
                    }
                })
                .collect();
            Self {
                tracks,
                samples,
                selected: None,
                pos: 0,
                release_count: 0,
            }
        }

        fn current(&self) -> Option<&FakeSample> {
            self.samples.get(self.pos)
        }
    }

    impl SampleSource for FakeSource {
        fn track_count(&self) -> usize {
            self.tracks.len()
        }

        fn track_info(&self, index: usize) -> Option<&TrackInfo> {
            self.tracks.get(index)
        }

        fn select_track(&mut self, index: usize) -> Result<()> {
            if index >= self.tracks.len() {
                return Err(PipelineError::InvalidState("轨道索引越界"));
            }
            self.selected = Some(index);
            Ok(())
        }

        fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>> {
            match self.current() {
                Some(sample) => {
                    buf.clear();
                    buf.extend_from_slice(&sample.data);
                    Ok(Some(sample.data.len()))
                }
                None => Ok(None),
            }
        }

        fn advance(&mut self) -> Result<bool> {
            if self.pos < self.samples.len() {
                self.pos += 1;
            }
            Ok(self.pos < self.samples.len())
        }

        fn sample_time_us(&self) -> i64 {
            self.current().map(|s| s.pts_us).unwrap_or(-1)
        }

        fn sample_flags(&self) -> SampleFlags {
            self.current()
                .map(|s| SampleFlags { is_sync: s.is_sync, is_end_of_stream: false })
                .unwrap_or_default()
        }

        fn release(&mut self) {
            self.release_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSource;
    use super::*;

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(TrackKind::Audio, "aac"), "audio/aac");
        assert_eq!(mime_for(TrackKind::Video, "h264"), "video/h264");
    }

    #[test]
    fn test_select_first_matching_track() {
        let mut source = FakeSource::new(&["audio/mp4a-latm", "video/avc"], vec![]);
        let track = select_track_by_kind(&mut source, TrackKind::Audio).unwrap();
        assert_eq!(track.index, 0);
        assert_eq!(source.selected, Some(0));

        let mut source = FakeSource::new(&["audio/mp4a-latm", "video/avc"], vec![]);
        let track = select_track_by_kind(&mut source, TrackKind::Video).unwrap();
        assert_eq!(track.index, 1);
        assert_eq!(source.selected, Some(1));
    }

    #[test]
    fn test_no_matching_track() {
        let mut source = FakeSource::new(&["text/vtt"], vec![]);
        let err = select_track_by_kind(&mut source, TrackKind::Audio).unwrap_err();
        assert!(matches!(err, PipelineError::NoMatchingTrack(TrackKind::Audio)));
        assert_eq!(source.selected, None);
    }

    #[test]
    fn test_release_idempotent() {
        let mut source = FakeSource::new(&["audio/aac"], vec![]);
        source.release();
        source.release();
        assert_eq!(source.release_count, 2);
    }
}
