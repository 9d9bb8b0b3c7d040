use std::time::{Duration, Instant};

/// 帧释放节拍器 - 让视频帧的显示时间戳对齐到墙钟播放时间
///
/// 参考时刻在解码循环开始时捕获一次，中途（包括输出格式变化）不再重置；
/// 每帧独立比较，不累计漂移。
pub struct Pacer {
    start: Instant,
}

impl Pacer {
    /// 在解码循环开始的时刻捕获参考墙钟
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// 计算该帧释放前需要挂起的时长；None 表示立即释放
    pub fn delay_for(&self, presentation_time_us: i64) -> Option<Duration> {
        let elapsed_ms = self.start.elapsed().as_millis() as i64;
        let diff = delay_ms(presentation_time_us, elapsed_ms);
        if diff > 0 {
            Some(Duration::from_millis(diff as u64))
        } else {
            None
        }
    }

    /// 等到该帧的显示时刻（零或负差值不补偿，立即返回）
    pub fn wait_until(&self, presentation_time_us: i64) {
        if let Some(delay) = self.delay_for(presentation_time_us) {
            std::thread::sleep(delay);
        }
    }
}

/// 显示时间戳相对已流逝墙钟时间的差值（毫秒）
pub fn delay_ms(presentation_time_us: i64, elapsed_ms: i64) -> i64 {
    presentation_time_us / 1000 - elapsed_ms
}
