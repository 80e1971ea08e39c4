//! 媒体播放流水线
//!
//! 输入线程驱动解复用并处理控制命令，ES 输出管理器维护节目和轨道、
//! 协调缓冲，每个选中的轨道由独立的解码线程解码并送往输出设备。

pub mod core;
pub mod player;
