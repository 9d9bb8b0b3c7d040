// 管线核心模块

pub mod demuxer;
pub mod codec;
pub mod audio_sink;
pub mod video_sink;
pub mod remuxer;
pub mod driver;

pub use demuxer::{Demuxer, SampleSource};
pub use codec::{CodecBackend, FfmpegBackend};
pub use audio_sink::{AudioSink, PcmOutput};
pub use video_sink::VideoSurface;
pub use remuxer::{Remuxer, SampleWriter};
pub use driver::{run_extract, run_play_audio, run_play_video};
