use crate::core::{PipelineError, Result, SampleInfo, TrackInfo};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format};
use log::{debug, info, warn};

/// 样本写入端抽象接口（无损直写，不经过解码）
pub trait SampleWriter: Send {
    /// 注册一条输出轨道，返回写入索引；必须在 start 之前调用
    fn add_track(&mut self, track: &TrackInfo) -> Result<usize>;

    /// 写出容器头，之后才能写样本
    fn start(&mut self) -> Result<()>;

    /// 写入一个样本：时间戳与标志逐字拷贝
    fn write_sample(&mut self, track_index: usize, data: &[u8], info: &SampleInfo) -> Result<()>;

    /// 写出容器尾并关闭（幂等）
    ///
    /// 失败运行留下的不完整输出文件会原样保留
    fn release(&mut self) -> Result<()>;
}

/// 封装器 - 把选中轨道的样本原样复制进新的 MP4 容器
pub struct Remuxer {
    octx: Option<format::context::Output>,
    started: bool,
    dest_path: String,
}

// Output 上下文只在拥有它的 driver 线程中顺序使用
unsafe impl Send for Remuxer {}

impl Remuxer {
    /// 在目标路径创建 MP4 族容器
    pub fn create(dest_path: &str) -> Result<Self> {
        info!("创建输出容器: {}", dest_path);
        let octx = format::output_as(&dest_path, "mp4")
            .map_err(|e| PipelineError::MuxError(format!("无法创建输出容器 {}: {}", dest_path, e)))?;
        Ok(Self {
            octx: Some(octx),
            started: false,
            dest_path: dest_path.to_string(),
        })
    }
}

impl SampleWriter for Remuxer {
    fn add_track(&mut self, track: &TrackInfo) -> Result<usize> {
        if self.started {
            return Err(PipelineError::InvalidState("start 之后不能再注册轨道"));
        }
        let octx = self
            .octx
            .as_mut()
            .ok_or(PipelineError::InvalidState("封装器已释放"))?;
        let parameters = track
            .parameters
            .clone()
            .ok_or_else(|| PipelineError::MuxError("轨道缺少编解码器参数".to_string()))?;

        let mut ost = octx
            .add_stream(ffmpeg::encoder::find(codec::Id::None))
            .map_err(|e| PipelineError::MuxError(format!("注册输出轨道失败: {}", e)))?;
        ost.set_parameters(parameters);
        // 容器族变化后原 codec_tag 不再有效
        unsafe {
            (*ost.parameters().as_mut_ptr()).codec_tag = 0;
        }
        let index = ost.index();
        debug!("输出轨道 {} <- {} ({})", index, track.index, track.mime_type);
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        let octx = self
            .octx
            .as_mut()
            .ok_or(PipelineError::InvalidState("封装器已释放"))?;
        octx.write_header()
            .map_err(|e| PipelineError::MuxError(format!("写容器头失败: {}", e)))?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, data: &[u8], info: &SampleInfo) -> Result<()> {
        if !self.started {
            return Err(PipelineError::InvalidState("写样本前必须先 start"));
        }
        let octx = self
            .octx
            .as_mut()
            .ok_or(PipelineError::InvalidState("封装器已释放"))?;
        let ost_time_base = octx
            .stream(track_index)
            .ok_or(PipelineError::InvalidState("写入索引越界"))?
            .time_base();

        let mut packet = ffmpeg::Packet::copy(&data[..info.size]);
        packet.set_stream(track_index);
        packet.set_pts(Some(info.presentation_time_us));
        packet.set_dts(Some(info.presentation_time_us));
        if info.flags.is_sync {
            packet.set_flags(codec::packet::Flags::KEY);
        }
        packet.set_position(-1);
        packet.rescale_ts(ffmpeg::Rational(1, 1_000_000), ost_time_base);

        packet
            .write_interleaved(octx)
            .map_err(|e| PipelineError::MuxError(format!("写样本失败: {}", e)))
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut octx) = self.octx.take() {
            if self.started {
                octx.write_trailer()
                    .map_err(|e| PipelineError::MuxError(format!("写容器尾失败: {}", e)))?;
            }
            debug!("封装器已释放: {}", self.dest_path);
        }
        Ok(())
    }
}

impl Drop for Remuxer {
    fn drop(&mut self) {
        if self.octx.is_some() {
            if let Err(e) = self.release() {
                warn!("Remuxer drop 时释放失败: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::SampleFlags;
    use std::sync::{Arc, Mutex};

    /// CaptureWriter 的可共享内部状态
    #[derive(Default)]
    pub struct WriterState {
        pub tracks: Vec<String>,
        pub started: bool,
        pub samples: Vec<(usize, Vec<u8>, i64, SampleFlags)>,
        pub release_count: usize,
    }

    /// 测试用写入端：把写入的样本序列记到共享句柄里
    #[derive(Default)]
    pub struct CaptureWriter {
        state: Arc<Mutex<WriterState>>,
    }

    impl CaptureWriter {
        pub fn state(&self) -> Arc<Mutex<WriterState>> {
            self.state.clone()
        }
    }

    impl SampleWriter for CaptureWriter {
        fn add_track(&mut self, track: &TrackInfo) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Err(PipelineError::InvalidState("start 之后不能再注册轨道"));
            }
            state.tracks.push(track.mime_type.clone());
            Ok(state.tracks.len() - 1)
        }

        fn start(&mut self) -> Result<()> {
            self.state.lock().unwrap().started = true;
            Ok(())
        }

        fn write_sample(&mut self, track_index: usize, data: &[u8], info: &SampleInfo) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.started {
                return Err(PipelineError::InvalidState("写样本前必须先 start"));
            }
            state.samples.push((
                track_index,
                data[..info.size].to_vec(),
                info.presentation_time_us,
                info.flags,
            ));
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.state.lock().unwrap().release_count += 1;
            Ok(())
        }
    }
}
