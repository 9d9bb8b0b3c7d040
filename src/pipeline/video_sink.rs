use crate::core::VideoFrame;

/// 视频渲染目标抽象接口
///
/// 核心的职责到"按时释放缓冲区"为止：release_output_buffer(render=true)
/// 把解码帧交到这里，实际的像素呈现属于外部协作者
pub trait VideoSurface: Send {
    /// 收到一帧按时释放的解码数据
    fn render_frame(&mut self, frame: &VideoFrame);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// 测试用渲染目标：把收到的帧记到共享句柄里
    #[derive(Default)]
    pub struct CaptureSurface {
        frames: Arc<Mutex<Vec<(i64, u32, u32)>>>,
    }

    impl CaptureSurface {
        pub fn frames(&self) -> Arc<Mutex<Vec<(i64, u32, u32)>>> {
            self.frames.clone()
        }
    }

    impl VideoSurface for CaptureSurface {
        fn render_frame(&mut self, frame: &VideoFrame) {
            self.frames
                .lock()
                .unwrap()
                .push((frame.pts_us, frame.width, frame.height));
        }
    }
}
