// 核心数据结构和类型定义

pub mod types;
pub mod pacer;
pub mod error;

// 重新导出常用类型
pub use types::*;
pub use pacer::*;
pub use error::*;
