use crate::core::{
    DecodedFrame, DriverConfig, OutputEvent, OutputFormat, Pacer, PipelineError, PipelineObserver,
    Result, RetryPolicy, SampleFlags, SampleInfo, TrackInfo, TrackKind,
};
use crate::pipeline::audio_sink::PcmOutput;
use crate::pipeline::codec::{CodecBackend, CodecSession};
use crate::pipeline::demuxer::{select_track_by_kind, SampleSource};
use crate::pipeline::remuxer::SampleWriter;
use crate::pipeline::video_sink::VideoSurface;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// 一次 driver 运行的管线状态 - 取代原始实现的隐式循环退出标志
///
/// 终止条件：解码循环在观察到输出 EOS 时结束；抽取循环在读取返回
/// 流末尾时结束
#[derive(Debug, Default, Clone, Copy)]
struct PipelineState {
    demux_done: bool,
    input_eos_queued: bool,
    output_eos: bool,
}

/// 解码运行统计
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeStats {
    pub frames: u64,
    pub decoded_bytes: u64,
    pub eos_events: u32,
}

/// 解码后端工厂（按选中的轨道创建）
pub type BackendFactory<'a> = &'a mut dyn FnMut(&TrackInfo) -> Result<Box<dyn CodecBackend>>;
/// 音频输出工厂（按 FormatChanged 携带的格式创建）
pub type SinkFactory<'a> = &'a mut dyn FnMut(&OutputFormat) -> Result<Box<dyn PcmOutput>>;
/// 样本写入端工厂（轨道选择成功后才创建，保证失败时不产生输出文件）
pub type WriterFactory<'a> = &'a mut dyn FnMut(&TrackInfo) -> Result<Box<dyn SampleWriter>>;

/// 按重试策略获取输入缓冲区
///
/// Unavailable 是瞬时背压：默认有界重试 + 退避；Abort 策略保留上游
/// 立即中止的原始行为
fn dequeue_input_with_retry(session: &mut CodecSession, config: &DriverConfig) -> Result<usize> {
    match config.retry {
        RetryPolicy::Abort => session
            .dequeue_input_buffer(config.input_timeout)?
            .ok_or(PipelineError::InputBufferUnavailable),
        RetryPolicy::Bounded { attempts, backoff } => {
            for attempt in 0..=attempts {
                if let Some(handle) = session.dequeue_input_buffer(config.input_timeout)? {
                    return Ok(handle);
                }
                if attempt < attempts {
                    debug!("输入缓冲区不可用，重试 {}/{}", attempt + 1, attempts);
                    std::thread::sleep(backoff);
                }
            }
            warn!("输入缓冲区重试预算耗尽");
            Err(PipelineError::InputBufferUnavailable)
        }
    }
}

/// 每轮循环恰好尝试一次输入喂入：读一个样本提交给解码器，
/// 或在样本源耗尽后提交一次空的 EOS 缓冲区
fn feed_one(
    session: &mut CodecSession,
    source: &mut dyn SampleSource,
    state: &mut PipelineState,
    config: &DriverConfig,
    observer: &dyn PipelineObserver,
    read_buf: &mut Vec<u8>,
) -> Result<()> {
    if state.input_eos_queued {
        return Ok(());
    }

    let handle = dequeue_input_with_retry(session, config)?;
    match source.read_sample(read_buf)? {
        Some(size) => {
            let pts_us = source.sample_time_us();
            let flags = source.sample_flags();
            let input = session.input_buffer_mut(handle)?;
            input.clear();
            input.extend_from_slice(&read_buf[..size]);
            session.queue_input_buffer(handle, size, pts_us, flags)?;
            source.advance()?;
            observer.on_progress(pts_us / 1000);
        }
        None => {
            state.demux_done = true;
            session.queue_input_buffer(
                handle,
                0,
                0,
                SampleFlags { is_sync: false, is_end_of_stream: true },
            )?;
            state.input_eos_queued = true;
            debug!("样本源读取完毕，已向解码器提交 EOS");
        }
    }
    Ok(())
}

// ============= 抽取 driver（直通，不解码） =============

/// 把选中轨道的样本无损复制到新容器
///
/// 算法：预读一个样本建立同步帧对齐（首样本不是同步帧则跳过），
/// 然后 读样本 → 填充信息 → 写入 → 推进，直到流末尾
pub fn run_extract(
    source: &mut dyn SampleSource,
    writer_factory: WriterFactory,
    kind: TrackKind,
    dest_path: &str,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
) -> Result<u64> {
    let track = match select_track_by_kind(source, kind) {
        Ok(track) => track,
        Err(e) => {
            if let PipelineError::NoMatchingTrack(kind) = &e {
                observer.on_track_missing(*kind);
            }
            source.release();
            return Err(e);
        }
    };
    info!("抽取轨道 {} ({}) -> {}", track.index, track.mime_type, dest_path);

    let mut writer = match writer_factory(&track) {
        Ok(writer) => writer,
        Err(e) => {
            source.release();
            return Err(e);
        }
    };

    let result = extract_loop(source, writer.as_mut(), &track, observer, cancel);

    // 正常完成、取消、出错都要恰好释放一次
    if let Err(e) = writer.release() {
        warn!("释放封装器失败（不完整的输出文件已保留）: {}", e);
    }
    source.release();

    let written = result?;
    observer.on_complete(dest_path);
    Ok(written)
}

fn extract_loop(
    source: &mut dyn SampleSource,
    writer: &mut dyn SampleWriter,
    track: &TrackInfo,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
) -> Result<u64> {
    let write_index = writer.add_track(track)?;
    writer.start()?;

    let mut buf = Vec::with_capacity(track.max_input_size);

    // 同步帧对齐预读
    if source.read_sample(&mut buf)?.is_some() && !source.sample_flags().is_sync {
        debug!("首样本不是同步帧，跳过");
        source.advance()?;
    }

    let mut written = 0u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            info!("抽取被取消，已写入 {} 个样本", written);
            break;
        }
        match source.read_sample(&mut buf)? {
            None => break,
            Some(size) => {
                let info = SampleInfo {
                    size,
                    presentation_time_us: source.sample_time_us(),
                    flags: source.sample_flags(),
                };
                writer.write_sample(write_index, &buf, &info)?;
                written += 1;
                observer.on_progress(info.presentation_time_us / 1000);
                source.advance()?;
            }
        }
    }

    info!("抽取完成，共写入 {} 个样本", written);
    Ok(written)
}

// ============= 音频解码 driver =============

/// 解码音频轨道并写入 PCM 输出
///
/// 没有显式节拍：输出端的阻塞写入就是音频路径的反压节拍
pub fn run_play_audio(
    source: &mut dyn SampleSource,
    backend_factory: BackendFactory,
    sink_factory: SinkFactory,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
    config: &DriverConfig,
) -> Result<DecodeStats> {
    let track = match select_track_by_kind(source, TrackKind::Audio) {
        Ok(track) => track,
        Err(e) => {
            if let PipelineError::NoMatchingTrack(kind) = &e {
                observer.on_track_missing(*kind);
            }
            source.release();
            return Err(e);
        }
    };
    info!("解码音频轨道 {} ({})", track.index, track.mime_type);

    let mut session = CodecSession::new();
    let result = audio_loop(
        source,
        &mut session,
        backend_factory,
        sink_factory,
        &track,
        observer,
        cancel,
        config,
    );
    session.release();
    source.release();
    result
}

fn audio_loop(
    source: &mut dyn SampleSource,
    session: &mut CodecSession,
    backend_factory: BackendFactory,
    sink_factory: SinkFactory,
    track: &TrackInfo,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
    config: &DriverConfig,
) -> Result<DecodeStats> {
    session.configure(backend_factory(track)?, None)?;
    session.start()?;

    let mut sink: Option<Box<dyn PcmOutput>> = None;
    let mut stats = DecodeStats::default();
    let mut state = PipelineState::default();
    let mut read_buf = Vec::with_capacity(track.max_input_size);

    let result: Result<()> = (|| {
        while !state.output_eos {
            if cancel.load(Ordering::Relaxed) {
                info!("音频解码被取消");
                break;
            }

            feed_one(session, source, &mut state, config, observer, &mut read_buf)?;

            // 排空所有当前可取的输出，直到 NotReady
            loop {
                match session.dequeue_output_buffer(config.output_timeout)? {
                    OutputEvent::NotReady => break,
                    OutputEvent::FormatChanged(format) => {
                        info!(
                            "输出格式确定: {} Hz, {} 声道",
                            format.sample_rate, format.channel_count
                        );
                        let mut new_sink = sink_factory(&format)?;
                        new_sink.start()?;
                        if let Some(mut old) = sink.replace(new_sink) {
                            old.stop();
                        }
                    }
                    OutputEvent::FrameReady { handle, end_of_stream, .. } => {
                        // 音频路径先把字节拷出再归还缓冲区，从不渲染
                        let chunk = match session.output_buffer(handle) {
                            Some(DecodedFrame::Audio(frame)) => Some(frame.data.clone()),
                            Some(_) => None,
                            None if end_of_stream => None,
                            None => {
                                warn!("输出缓冲区无效，跳过本次输出");
                                None
                            }
                        };
                        session.release_output_buffer(handle, false)?;

                        if let Some(chunk) = chunk {
                            stats.frames += 1;
                            stats.decoded_bytes +=
                                (chunk.len() * std::mem::size_of::<f32>()) as u64;
                            if let Some(sink) = sink.as_mut() {
                                sink.write(&chunk);
                            }
                        }
                        if end_of_stream {
                            stats.eos_events += 1;
                            state.output_eos = true;
                            info!("音频解码完成: {} 帧, {} 字节", stats.frames, stats.decoded_bytes);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    })();

    debug!(
        "管线状态: 源耗尽 = {}, 已提交输入 EOS = {}, 输出 EOS = {}, EOS 事件 = {}",
        state.demux_done, state.input_eos_queued, state.output_eos, stats.eos_events
    );
    if let Some(mut sink) = sink {
        sink.stop();
    }
    session.stop();
    result.map(|_| stats)
}

// ============= 视频解码 driver =============

/// 解码视频轨道并按显示时间戳对齐墙钟释放到渲染目标
pub fn run_play_video(
    source: &mut dyn SampleSource,
    backend_factory: BackendFactory,
    surface: Box<dyn VideoSurface>,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
    config: &DriverConfig,
) -> Result<DecodeStats> {
    let track = match select_track_by_kind(source, TrackKind::Video) {
        Ok(track) => track,
        Err(e) => {
            if let PipelineError::NoMatchingTrack(kind) = &e {
                observer.on_track_missing(*kind);
            }
            source.release();
            return Err(e);
        }
    };
    info!(
        "解码视频轨道 {} ({}, {}x{})",
        track.index, track.mime_type, track.width, track.height
    );

    let mut session = CodecSession::new();
    let result = video_loop(
        source,
        &mut session,
        backend_factory,
        surface,
        &track,
        observer,
        cancel,
        config,
    );
    session.release();
    source.release();
    result
}

fn video_loop(
    source: &mut dyn SampleSource,
    session: &mut CodecSession,
    backend_factory: BackendFactory,
    surface: Box<dyn VideoSurface>,
    track: &TrackInfo,
    observer: &dyn PipelineObserver,
    cancel: &AtomicBool,
    config: &DriverConfig,
) -> Result<DecodeStats> {
    session.configure(backend_factory(track)?, Some(surface))?;
    session.start()?;

    let mut stats = DecodeStats::default();
    let mut state = PipelineState::default();
    let mut read_buf = Vec::with_capacity(track.max_input_size);

    // 参考墙钟在解码循环开始时捕获一次，格式变化不重置
    let pacer = Pacer::start();

    let result: Result<()> = (|| {
        while !state.output_eos {
            if cancel.load(Ordering::Relaxed) {
                info!("视频解码被取消");
                break;
            }

            feed_one(session, source, &mut state, config, observer, &mut read_buf)?;

            loop {
                match session.dequeue_output_buffer(config.output_timeout)? {
                    OutputEvent::NotReady => break,
                    OutputEvent::FormatChanged(format) => {
                        info!("输出格式确定: {}x{}", format.width, format.height);
                    }
                    OutputEvent::FrameReady {
                        handle,
                        presentation_time_us,
                        size,
                        end_of_stream,
                    } => {
                        if end_of_stream {
                            session.release_output_buffer(handle, false)?;
                            stats.eos_events += 1;
                            state.output_eos = true;
                            info!("视频解码完成: {} 帧", stats.frames);
                            break;
                        }
                        if session.output_buffer(handle).is_none() {
                            warn!("输出缓冲区无效，跳过本次输出");
                            session.release_output_buffer(handle, false)?;
                            continue;
                        }
                        // 挂起到该帧的显示时刻，零或负差值立即释放
                        pacer.wait_until(presentation_time_us);
                        session.release_output_buffer(handle, true)?;
                        stats.frames += 1;
                        stats.decoded_bytes += size as u64;
                    }
                }
            }
        }
        Ok(())
    })();

    debug!(
        "管线状态: 源耗尽 = {}, 已提交输入 EOS = {}, 输出 EOS = {}, EOS 事件 = {}",
        state.demux_done, state.input_eos_queued, state.output_eos, stats.eos_events
    );
    session.stop();
    result.map(|_| stats)
}
