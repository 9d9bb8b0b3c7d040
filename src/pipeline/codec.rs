use crate::core::{
    AudioFrame, DecodedFrame, OutputEvent, OutputFormat, PipelineError, Result, SampleFlags,
    TrackInfo, TrackKind, VideoFrame,
};
use crate::pipeline::video_sink::VideoSurface;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, software, util};
use log::debug;
use std::time::{Duration, Instant};

/// 输入槽位数量（对齐常见硬件解码器的输入队列深度）
const INPUT_SLOTS: usize = 4;
/// 输出槽位数量
const OUTPUT_SLOTS: usize = 8;

/// 会话状态机 - 取代原始实现里嵌套循环中的隐式布尔标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configured,
    Running,
    Draining,
    Stopped,
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// 解码器暂时不收（背压），稍后重试
    TryLater,
}

/// 轮询结果
pub enum PollOutcome {
    Frame(DecodedFrame),
    Pending,
    EndOfStream,
}

/// 解码后端抽象接口
///
/// 生产实现包装 FFmpeg 解码器；测试注入可编排的假后端
pub trait CodecBackend: Send {
    /// 提交一个压缩样本
    fn submit(&mut self, data: &[u8], pts_us: i64) -> Result<SubmitOutcome>;

    /// 通知不再有输入
    fn submit_eos(&mut self) -> Result<()>;

    /// 取一帧解码输出
    fn poll_frame(&mut self) -> Result<PollOutcome>;

    /// 描述信息（用于日志）
    fn describe(&self) -> String;
}

/// backend EAGAIN 时暂存的输入（槽位保持占用直到被接受）
struct PendingInput {
    slot: usize,
    size: usize,
    pts_us: i64,
}

/// 解码会话 - 管理一条轨道的解码器及其输入/输出缓冲队列
///
/// 缓冲区所有权纪律：每个槽位按 dequeue → queue/release 恰好一次流转，
/// 重复释放或越权访问都是错误
pub struct CodecSession {
    state: SessionState,
    backend: Option<Box<dyn CodecBackend>>,
    surface: Option<Box<dyn VideoSurface>>,

    input_slots: Vec<Vec<u8>>,
    input_free: Vec<usize>,
    input_acquired: Vec<bool>,
    input_pending: Option<PendingInput>,

    output_slots: Vec<Option<DecodedFrame>>,
    output_free: Vec<usize>,
    output_acquired: Vec<bool>,

    /// FormatChanged 先行返回时暂存的帧
    stashed_frame: Option<DecodedFrame>,
    last_format: Option<OutputFormat>,
    last_pts_us: i64,
}

impl CodecSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            backend: None,
            surface: None,
            input_slots: Vec::new(),
            input_free: Vec::new(),
            input_acquired: Vec::new(),
            input_pending: None,
            output_slots: Vec::new(),
            output_free: Vec::new(),
            output_acquired: Vec::new(),
            stashed_frame: None,
            last_format: None,
            last_pts_us: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 配置解码后端和可选的渲染目标
    pub fn configure(
        &mut self,
        backend: Box<dyn CodecBackend>,
        surface: Option<Box<dyn VideoSurface>>,
    ) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(PipelineError::InvalidState("会话已配置过"));
        }
        debug!("配置解码会话: {}", backend.describe());
        self.backend = Some(backend);
        self.surface = surface;
        self.input_slots = (0..INPUT_SLOTS).map(|_| Vec::new()).collect();
        self.input_free = (0..INPUT_SLOTS).rev().collect();
        self.input_acquired = vec![false; INPUT_SLOTS];
        self.output_slots = (0..OUTPUT_SLOTS).map(|_| None).collect();
        self.output_free = (0..OUTPUT_SLOTS).rev().collect();
        self.output_acquired = vec![false; OUTPUT_SLOTS];
        self.state = SessionState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Configured {
            return Err(PipelineError::InvalidState("未配置的会话不能启动"));
        }
        self.state = SessionState::Running;
        Ok(())
    }

    /// 获取一个空闲输入缓冲区；超时内没有可用槽位时返回 None
    pub fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>> {
        if self.state != SessionState::Running {
            return Err(PipelineError::InvalidState("只有 Running 状态可以获取输入缓冲区"));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // 先尝试把暂存的输入重新提交给后端
            self.flush_pending_input()?;

            if self.input_pending.is_none() {
                if let Some(slot) = self.input_free.pop() {
                    self.input_acquired[slot] = true;
                    return Ok(Some(slot));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn flush_pending_input(&mut self) -> Result<()> {
        if let Some(pending) = self.input_pending.take() {
            let backend = self
                .backend
                .as_mut()
                .ok_or(PipelineError::InvalidState("后端缺失"))?;
            let data = &self.input_slots[pending.slot][..pending.size];
            match backend.submit(data, pending.pts_us)? {
                SubmitOutcome::Accepted => {
                    self.input_free.push(pending.slot);
                }
                SubmitOutcome::TryLater => {
                    self.input_pending = Some(pending);
                }
            }
        }
        Ok(())
    }

    /// 已获取输入缓冲区的可写视图
    pub fn input_buffer_mut(&mut self, handle: usize) -> Result<&mut Vec<u8>> {
        if handle >= self.input_slots.len() || !self.input_acquired[handle] {
            return Err(PipelineError::InvalidState("输入缓冲区句柄未处于已获取状态"));
        }
        Ok(&mut self.input_slots[handle])
    }

    /// 提交已填充的输入缓冲区
    ///
    /// size == 0 且带 EOS 标志时向解码器宣告不再有输入，会话进入 Draining
    pub fn queue_input_buffer(
        &mut self,
        handle: usize,
        size: usize,
        pts_us: i64,
        flags: SampleFlags,
    ) -> Result<()> {
        if self.state != SessionState::Running {
            return Err(PipelineError::InvalidState("只有 Running 状态可以提交输入缓冲区"));
        }
        if handle >= self.input_slots.len() || !self.input_acquired[handle] {
            return Err(PipelineError::InvalidState("输入缓冲区句柄未处于已获取状态"));
        }
        self.input_acquired[handle] = false;

        let backend = self
            .backend
            .as_mut()
            .ok_or(PipelineError::InvalidState("后端缺失"))?;

        if flags.is_end_of_stream && size == 0 {
            backend.submit_eos()?;
            self.input_free.push(handle);
            self.state = SessionState::Draining;
            debug!("输入结束已提交，会话进入 Draining");
            return Ok(());
        }

        match backend.submit(&self.input_slots[handle][..size], pts_us)? {
            SubmitOutcome::Accepted => {
                self.input_free.push(handle);
            }
            SubmitOutcome::TryLater => {
                // 槽位不回空闲表，留在暂存区等待下次 dequeue 时重新提交
                self.input_pending = Some(PendingInput { slot: handle, size, pts_us });
            }
        }
        Ok(())
    }

    /// 取一个输出事件；超时内没有输出时返回 NotReady
    ///
    /// FormatChanged 总是先于使用该格式的第一帧返回
    pub fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent> {
        if self.state != SessionState::Running && self.state != SessionState::Draining {
            return Err(PipelineError::InvalidState("只有 Running/Draining 状态可以获取输出"));
        }

        if let Some(frame) = self.stashed_frame.take() {
            return self.deliver_frame(frame);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let backend = self
                .backend
                .as_mut()
                .ok_or(PipelineError::InvalidState("后端缺失"))?;
            match backend.poll_frame()? {
                PollOutcome::Frame(frame) => {
                    let format = frame.format();
                    if self.last_format != Some(format) {
                        // 格式确定/变化：先报告格式，帧暂存到下一次调用
                        self.last_format = Some(format);
                        self.stashed_frame = Some(frame);
                        return Ok(OutputEvent::FormatChanged(format));
                    }
                    return self.deliver_frame(frame);
                }
                PollOutcome::EndOfStream => {
                    let handle = self.acquire_output_slot(None)?;
                    return Ok(OutputEvent::FrameReady {
                        handle,
                        presentation_time_us: self.last_pts_us,
                        size: 0,
                        end_of_stream: true,
                    });
                }
                PollOutcome::Pending => {
                    if Instant::now() >= deadline {
                        return Ok(OutputEvent::NotReady);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn deliver_frame(&mut self, frame: DecodedFrame) -> Result<OutputEvent> {
        let pts_us = frame.pts_us();
        let size = frame.byte_size();
        self.last_pts_us = pts_us;
        let handle = self.acquire_output_slot(Some(frame))?;
        Ok(OutputEvent::FrameReady {
            handle,
            presentation_time_us: pts_us,
            size,
            end_of_stream: false,
        })
    }

    fn acquire_output_slot(&mut self, frame: Option<DecodedFrame>) -> Result<usize> {
        let slot = self
            .output_free
            .pop()
            .ok_or(PipelineError::InvalidState("输出缓冲池耗尽：排空前未释放已获取的缓冲区"))?;
        self.output_slots[slot] = frame;
        self.output_acquired[slot] = true;
        Ok(slot)
    }

    /// 已获取输出缓冲区的只读视图；槽位无可用内容时返回 None
    pub fn output_buffer(&self, handle: usize) -> Option<&DecodedFrame> {
        if handle >= self.output_slots.len() || !self.output_acquired[handle] {
            return None;
        }
        self.output_slots[handle].as_ref()
    }

    /// 归还输出缓冲区；render = true 时先把帧交给配置的渲染目标
    ///
    /// 重复释放同一个句柄是协议违规
    pub fn release_output_buffer(&mut self, handle: usize, render: bool) -> Result<()> {
        if handle >= self.output_slots.len() || !self.output_acquired[handle] {
            return Err(PipelineError::OutputBufferInvalid);
        }
        let frame = self.output_slots[handle].take();
        self.output_acquired[handle] = false;
        self.output_free.push(handle);

        if render {
            if let (Some(DecodedFrame::Video(frame)), Some(surface)) =
                (frame.as_ref(), self.surface.as_mut())
            {
                surface.render_frame(frame);
            }
        }
        Ok(())
    }

    /// 停止会话（幂等）
    pub fn stop(&mut self) {
        if self.state == SessionState::Running || self.state == SessionState::Draining {
            self.state = SessionState::Stopped;
        }
    }

    /// 释放会话（幂等；未配置或已释放时为空操作）
    pub fn release(&mut self) {
        self.stop();
        if self.backend.take().is_some() {
            debug!("解码会话已释放");
        }
        self.surface = None;
        self.input_slots.clear();
        self.input_free.clear();
        self.input_pending = None;
        self.output_slots.clear();
        self.output_free.clear();
        self.stashed_frame = None;
        self.state = SessionState::Stopped;
    }
}

impl Default for CodecSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        self.release();
    }
}

// ============= FFmpeg 后端实现 =============

enum BackendKind {
    Audio {
        decoder: codec::decoder::Audio,
        resampler: Option<software::resampling::Context>,
    },
    Video {
        decoder: codec::decoder::Video,
        scaler: Option<software::scaling::Context>,
    },
}

/// FFmpeg 解码后端
pub struct FfmpegBackend {
    inner: BackendKind,
    mime_type: String,
}

// SwsContext/SwrContext 不是 Send，但每个后端实例只在一个 driver 线程中使用
unsafe impl Send for FfmpegBackend {}

impl FfmpegBackend {
    /// 按轨道信息创建解码器
    pub fn new(track: &TrackInfo) -> Result<Self> {
        let parameters = track
            .parameters
            .clone()
            .ok_or_else(|| PipelineError::CodecConfiguration("轨道缺少编解码器参数".to_string()))?;
        let context = codec::context::Context::from_parameters(parameters)
            .map_err(|e| PipelineError::CodecConfiguration(format!("解码器上下文创建失败: {}", e)))?;

        let inner = match track.kind {
            TrackKind::Audio => {
                let decoder = context
                    .decoder()
                    .audio()
                    .map_err(|e| PipelineError::CodecConfiguration(format!("音频解码器创建失败: {}", e)))?;
                BackendKind::Audio { decoder, resampler: None }
            }
            TrackKind::Video => {
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| PipelineError::CodecConfiguration(format!("视频解码器创建失败: {}", e)))?;
                BackendKind::Video { decoder, scaler: None }
            }
            _ => {
                return Err(PipelineError::CodecConfiguration(format!(
                    "不支持的轨道类型: {}",
                    track.mime_type
                )))
            }
        };

        Ok(Self { inner, mime_type: track.mime_type.clone() })
    }

    fn is_again(err: &ffmpeg::Error) -> bool {
        matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
    }
}

impl CodecBackend for FfmpegBackend {
    fn submit(&mut self, data: &[u8], pts_us: i64) -> Result<SubmitOutcome> {
        let mut packet = ffmpeg::Packet::copy(data);
        packet.set_pts(Some(pts_us));

        let sent = match &mut self.inner {
            BackendKind::Audio { decoder, .. } => decoder.send_packet(&packet),
            BackendKind::Video { decoder, .. } => decoder.send_packet(&packet),
        };
        match sent {
            Ok(()) => Ok(SubmitOutcome::Accepted),
            Err(e) if Self::is_again(&e) => Ok(SubmitOutcome::TryLater),
            Err(e) => Err(e.into()),
        }
    }

    fn submit_eos(&mut self) -> Result<()> {
        let sent = match &mut self.inner {
            BackendKind::Audio { decoder, .. } => decoder.send_eof(),
            BackendKind::Video { decoder, .. } => decoder.send_eof(),
        };
        match sent {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_frame(&mut self) -> Result<PollOutcome> {
        match &mut self.inner {
            BackendKind::Audio { decoder, resampler } => {
                let mut decoded = util::frame::Audio::empty();
                match decoder.receive_frame(&mut decoded) {
                    Ok(()) => Ok(PollOutcome::Frame(DecodedFrame::Audio(convert_audio(
                        resampler, decoded,
                    )?))),
                    Err(e) if Self::is_again(&e) => Ok(PollOutcome::Pending),
                    Err(ffmpeg::Error::Eof) => Ok(PollOutcome::EndOfStream),
                    Err(e) => Err(e.into()),
                }
            }
            BackendKind::Video { decoder, scaler } => {
                let mut decoded = util::frame::Video::empty();
                match decoder.receive_frame(&mut decoded) {
                    Ok(()) => Ok(PollOutcome::Frame(DecodedFrame::Video(convert_video(
                        scaler, decoded,
                    )?))),
                    Err(e) if Self::is_again(&e) => Ok(PollOutcome::Pending),
                    Err(ffmpeg::Error::Eof) => Ok(PollOutcome::EndOfStream),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("FFmpeg 解码器: {}", self.mime_type)
    }
}

/// 音频帧转换为交织 f32（保持源采样率和声道布局）
fn convert_audio(
    resampler: &mut Option<software::resampling::Context>,
    frame: util::frame::Audio,
) -> Result<AudioFrame> {
    let rate = frame.rate();
    let channels = frame.channels();

    if resampler.is_none() {
        debug!("初始化音频重采样器: {}Hz/{}ch -> f32 packed", rate, channels);
        *resampler = Some(software::resampling::Context::get(
            frame.format(),
            frame.channel_layout(),
            rate,
            util::format::Sample::F32(util::format::sample::Type::Packed),
            frame.channel_layout(),
            rate,
        )?);
    }

    let mut resampled = util::frame::Audio::empty();
    resampler.as_mut().unwrap().run(&frame, &mut resampled)?;

    let pts_us = frame.timestamp().unwrap_or(0);
    let samples = resampled.samples();
    let data_size = samples * channels as usize;
    let mut data = vec![0f32; data_size];
    let frame_data = resampled.data(0);
    let sample_slice =
        unsafe { std::slice::from_raw_parts(frame_data.as_ptr() as *const f32, data_size) };
    data.copy_from_slice(sample_slice);

    Ok(AudioFrame { pts_us, sample_rate: rate, channels, data })
}

/// 视频帧转换为 RGBA 连续内存
fn convert_video(
    scaler: &mut Option<software::scaling::Context>,
    frame: util::frame::Video,
) -> Result<VideoFrame> {
    let width = frame.width();
    let height = frame.height();

    if scaler.is_none() {
        debug!("初始化视频缩放器: {}x{} -> RGBA", width, height);
        *scaler = Some(software::scaling::Context::get(
            frame.format(),
            width,
            height,
            util::format::Pixel::RGBA,
            width,
            height,
            software::scaling::Flags::BILINEAR,
        )?);
    }

    let mut rgba_frame = util::frame::Video::empty();
    scaler.as_mut().unwrap().run(&frame, &mut rgba_frame)?;

    let pts_us = frame.timestamp().unwrap_or(0);

    // 按行复制，去掉 stride 填充
    let row_size = width as usize * 4;
    let mut data = vec![0u8; row_size * height as usize];
    let stride = rgba_frame.stride(0);
    let frame_data = rgba_frame.data(0);
    for y in 0..height as usize {
        let src_offset = y * stride;
        let dst_offset = y * row_size;
        data[dst_offset..dst_offset + row_size]
            .copy_from_slice(&frame_data[src_offset..src_offset + row_size]);
    }

    Ok(VideoFrame { pts_us, width, height, data })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// 假后端记录的操作序列（用于校验喂入/排空协议）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Op {
        Submit,
        SubmitRejected,
        SubmitEos,
        PollFrame,
        PollPending,
        PollEos,
    }

    /// 可编排的假解码后端：每个输入样本产出一帧输出
    ///
    /// 操作序列记录在共享句柄里，会话释放后测试仍可检查
    pub struct FakeBackend {
        ops: Arc<Mutex<Vec<Op>>>,
        queue: VecDeque<DecodedFrame>,
        eos_submitted: bool,
        /// 前 N 次 submit 返回 TryLater（模拟输入背压）
        reject_submits: u32,
        video_mode: bool,
        format: OutputFormat,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                queue: VecDeque::new(),
                eos_submitted: false,
                reject_submits: 0,
                video_mode: false,
                format: OutputFormat {
                    sample_rate: 44100,
                    channel_count: 2,
                    ..Default::default()
                },
            }
        }

        /// 产出视频帧的假后端
        pub fn video() -> Self {
            let mut backend = Self::new();
            backend.video_mode = true;
            backend.format = OutputFormat { width: 4, height: 2, ..Default::default() };
            backend
        }

        pub fn rejecting_first(reject: u32) -> Self {
            let mut backend = Self::new();
            backend.reject_submits = reject;
            backend
        }

        /// 操作序列的共享句柄
        pub fn ops(&self) -> Arc<Mutex<Vec<Op>>> {
            self.ops.clone()
        }
    }

    impl CodecBackend for FakeBackend {
        fn submit(&mut self, data: &[u8], pts_us: i64) -> Result<SubmitOutcome> {
            if self.reject_submits > 0 {
                self.reject_submits -= 1;
                self.ops.lock().unwrap().push(Op::SubmitRejected);
                return Ok(SubmitOutcome::TryLater);
            }
            self.ops.lock().unwrap().push(Op::Submit);
            let frame = if self.video_mode {
                DecodedFrame::Video(VideoFrame {
                    pts_us,
                    width: self.format.width,
                    height: self.format.height,
                    data: vec![0u8; (self.format.width * self.format.height * 4) as usize],
                })
            } else {
                DecodedFrame::Audio(AudioFrame {
                    pts_us,
                    sample_rate: self.format.sample_rate,
                    channels: self.format.channel_count,
                    data: vec![0.0; data.len().max(1)],
                })
            };
            self.queue.push_back(frame);
            Ok(SubmitOutcome::Accepted)
        }

        fn submit_eos(&mut self) -> Result<()> {
            self.ops.lock().unwrap().push(Op::SubmitEos);
            self.eos_submitted = true;
            Ok(())
        }

        fn poll_frame(&mut self) -> Result<PollOutcome> {
            match self.queue.pop_front() {
                Some(frame) => {
                    self.ops.lock().unwrap().push(Op::PollFrame);
                    Ok(PollOutcome::Frame(frame))
                }
                None if self.eos_submitted => {
                    self.ops.lock().unwrap().push(Op::PollEos);
                    Ok(PollOutcome::EndOfStream)
                }
                None => {
                    self.ops.lock().unwrap().push(Op::PollPending);
                    Ok(PollOutcome::Pending)
                }
            }
        }

        fn describe(&self) -> String {
            "假解码后端".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;

    fn running_session() -> CodecSession {
        let mut session = CodecSession::new();
        session.configure(Box::new(FakeBackend::new()), None).unwrap();
        session.start().unwrap();
        session
    }

    const T: Duration = Duration::from_millis(0);

    #[test]
    fn test_dequeue_outside_running_is_error() {
        let mut session = CodecSession::new();
        assert!(matches!(
            session.dequeue_input_buffer(T),
            Err(PipelineError::InvalidState(_))
        ));

        let mut session = CodecSession::new();
        session.configure(Box::new(FakeBackend::new()), None).unwrap();
        // Configured 但未 start
        assert!(matches!(
            session.dequeue_input_buffer(T),
            Err(PipelineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_format_changed_precedes_first_frame() {
        let mut session = running_session();

        let handle = session.dequeue_input_buffer(T).unwrap().unwrap();
        let buf = session.input_buffer_mut(handle).unwrap();
        buf.clear();
        buf.extend_from_slice(&[1, 2, 3, 4]);
        session
            .queue_input_buffer(handle, 4, 1000, SampleFlags::sync())
            .unwrap();

        match session.dequeue_output_buffer(T).unwrap() {
            OutputEvent::FormatChanged(format) => {
                assert_eq!(format.sample_rate, 44100);
                assert_eq!(format.channel_count, 2);
            }
            other => panic!("第一个事件应是 FormatChanged，实际: {:?}", other),
        }
        match session.dequeue_output_buffer(T).unwrap() {
            OutputEvent::FrameReady { presentation_time_us, size, end_of_stream, .. } => {
                assert_eq!(presentation_time_us, 1000);
                assert!(size > 0);
                assert!(!end_of_stream);
            }
            other => panic!("第二个事件应是 FrameReady，实际: {:?}", other),
        }
    }

    #[test]
    fn test_eos_roundtrip() {
        let mut session = running_session();

        let handle = session.dequeue_input_buffer(T).unwrap().unwrap();
        session
            .queue_input_buffer(
                handle,
                0,
                0,
                SampleFlags { is_sync: false, is_end_of_stream: true },
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Draining);

        match session.dequeue_output_buffer(T).unwrap() {
            OutputEvent::FrameReady { handle, size, end_of_stream, .. } => {
                assert!(end_of_stream);
                assert_eq!(size, 0);
                session.release_output_buffer(handle, false).unwrap();
            }
            other => panic!("应得到 EOS 输出，实际: {:?}", other),
        }
    }

    #[test]
    fn test_double_release_is_invalid() {
        let mut session = running_session();

        let handle = session.dequeue_input_buffer(T).unwrap().unwrap();
        let buf = session.input_buffer_mut(handle).unwrap();
        buf.clear();
        buf.extend_from_slice(&[9; 8]);
        session
            .queue_input_buffer(handle, 8, 0, SampleFlags::sync())
            .unwrap();

        // FormatChanged 先行
        assert!(matches!(
            session.dequeue_output_buffer(T).unwrap(),
            OutputEvent::FormatChanged(_)
        ));
        let handle = match session.dequeue_output_buffer(T).unwrap() {
            OutputEvent::FrameReady { handle, .. } => handle,
            other => panic!("应得到 FrameReady，实际: {:?}", other),
        };

        session.release_output_buffer(handle, false).unwrap();
        assert!(matches!(
            session.release_output_buffer(handle, false),
            Err(PipelineError::OutputBufferInvalid)
        ));
    }

    #[test]
    fn test_input_backpressure_surfaces_as_unavailable() {
        let mut session = CodecSession::new();
        session
            .configure(Box::new(FakeBackend::rejecting_first(1)), None)
            .unwrap();
        session.start().unwrap();

        let handle = session.dequeue_input_buffer(T).unwrap().unwrap();
        let buf = session.input_buffer_mut(handle).unwrap();
        buf.clear();
        buf.extend_from_slice(&[1; 4]);
        // 提交被后端拒绝，进入暂存区
        session
            .queue_input_buffer(handle, 4, 0, SampleFlags::sync())
            .unwrap();

        // 下一次 dequeue 先重试暂存提交（这次会被接受），然后才能拿到槽位
        let next = session.dequeue_input_buffer(Duration::from_millis(20)).unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn test_stop_release_idempotent() {
        let mut session = running_session();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        session.release();
        session.release();
        assert_eq!(session.state(), SessionState::Stopped);

        // 未配置的会话释放是空操作
        let mut fresh = CodecSession::new();
        fresh.release();
        fresh.release();
    }
}
