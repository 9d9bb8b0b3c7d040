use crate::core::{PipelineError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// PCM 输出抽象接口
///
/// write 是阻塞调用：按显示时间顺序接收样本，内部缓冲超过水位时
/// 挂起调用方 —— 这是音频路径上唯一的节拍机制
pub trait PcmOutput: Send {
    /// 开始流式播放
    fn start(&mut self) -> Result<()>;

    /// 写入一段交织 f32 样本（阻塞直到缓冲回落）
    fn write(&mut self, samples: &[f32]);

    /// 停止播放（幂等）
    fn stop(&mut self);
}

/// 根据轨道声道数选择输出声道布局：2 声道用立体声，其余用单声道
pub fn output_channels(channel_count: u16) -> u16 {
    if channel_count == 2 {
        2
    } else {
        1
    }
}

/// 缓冲高水位（采样数）：约 0.5 秒
fn high_water_mark(sample_rate: u32, channels: u16) -> usize {
    (sample_rate as usize * channels as usize) / 2
}

/// 音频输出 - 使用 cpal 播放解码后的 PCM
pub struct AudioSink {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    buffer: Arc<SegQueue<f32>>,
    volume: Arc<Mutex<f32>>,
    high_water: usize,
}

// cpal::Stream 本身不是 Send，但 AudioSink 只在创建它的 driver 线程中使用
unsafe impl Send for AudioSink {}

impl AudioSink {
    /// 按解码输出格式创建音频输出（就绪但未开始播放）
    pub fn create(sample_rate: u32, channel_count: u16) -> Result<Self> {
        let channels = output_channels(channel_count);
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PipelineError::AudioError("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // 检查设备是否支持该配置
        let supported_configs = device
            .supported_output_configs()
            .map_err(|e| PipelineError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        let mut matched = None;
        for supported_config in supported_configs {
            if Self::is_config_compatible(&config, &supported_config) {
                matched = Some(supported_config);
                break;
            }
        }
        let supported = matched.ok_or_else(|| {
            PipelineError::AudioError(format!(
                "音频设备不支持 {} Hz, {} 声道配置",
                sample_rate, channels
            ))
        })?;

        // 平台最小缓冲区
        let buffer_size = match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => cpal::BufferSize::Fixed(*min),
            cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
        };
        let config = StreamConfig { buffer_size, ..config };

        Ok(Self {
            device,
            config,
            stream: None,
            buffer: Arc::new(SegQueue::new()),
            volume: Arc::new(Mutex::new(1.0)),
            high_water: high_water_mark(sample_rate, channels),
        })
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        let channels_match = config.channels == supported.channels();
        rate_in_range && channels_match
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume.clamp(0.0, 1.0);
    }
}

impl PcmOutput for AudioSink {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = self.buffer.clone();
        let volume = self.volume.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let vol = *volume.lock().unwrap();
                    for sample in data.iter_mut() {
                        if let Some(value) = buffer.pop() {
                            *sample = value * vol;
                        } else {
                            *sample = 0.0;
                        }
                    }
                },
                move |err| {
                    warn!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PipelineError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PipelineError::AudioError(format!("启动音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("音频输出已启动");
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) {
        for sample in samples {
            self.buffer.push(*sample);
        }
        // 缓冲超过水位时挂起，让设备消费端反压解码循环
        while self.stream.is_some() && self.buffer.len() > self.high_water {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// CapturePcm 的可共享内部状态
    #[derive(Default)]
    pub struct PcmState {
        pub samples: Vec<f32>,
        pub start_count: usize,
        pub stop_count: usize,
    }

    /// 测试用 PCM 输出：把写入的样本记到共享句柄里
    #[derive(Default)]
    pub struct CapturePcm {
        state: Arc<Mutex<PcmState>>,
    }

    impl CapturePcm {
        pub fn state(&self) -> Arc<Mutex<PcmState>> {
            self.state.clone()
        }
    }

    impl PcmOutput for CapturePcm {
        fn start(&mut self) -> Result<()> {
            self.state.lock().unwrap().start_count += 1;
            Ok(())
        }

        fn write(&mut self, samples: &[f32]) {
            self.state.lock().unwrap().samples.extend_from_slice(samples);
        }

        fn stop(&mut self) {
            self.state.lock().unwrap().stop_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_channels() {
        assert_eq!(output_channels(2), 2);
        assert_eq!(output_channels(1), 1);
        assert_eq!(output_channels(6), 1);
    }

    #[test]
    fn test_high_water_mark() {
        // 44100Hz 立体声约 0.5 秒
        assert_eq!(high_water_mark(44100, 2), 44100);
    }
}
