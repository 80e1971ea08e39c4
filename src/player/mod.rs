// 播放流水线：输入线程 -> ES 输出管理 -> 解码线程

pub mod context;
pub mod control;
pub mod decoder;
pub mod demuxer_source; // Demuxer 抽象接口
pub mod es_out;
pub mod events;
pub mod input;
pub mod modules; // 解码模块 / 输出设备接口
mod selection;
pub mod stats;
pub mod synthetic; // 合成数据源与记录型输出，用于演示和测试

pub use context::PipelineContext;
pub use control::{Control, ControlQueue, RendererHandle, SlaveDescriptor, SlaveKind};
pub use decoder::DecoderWorker;
pub use demuxer_source::{DemuxStatus, DemuxerSource, NavAction, TitleInfo};
pub use es_out::{EpgEvent, EsOut, EsOutMode, EsPolicy};
pub use events::{EventSender, InputEvent};
pub use input::{Bookmark, InputOptions, InputThread, SlaveOpener};
pub use stats::{InputStats, StatsSnapshot};
