use crate::core::PipelineConfig;
use crate::player::events::{EventSender, InputEvent};
use crate::player::modules::{ModuleFactory, SinkPool};
use crate::player::stats::InputStats;
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// 流水线上下文：所有组件共享的配置、外部模块和事件通道
/// 显式传给每个组件的构造函数
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub modules: Arc<dyn ModuleFactory>,
    pub sinks: Arc<dyn SinkPool>,
    pub stats: Arc<InputStats>,
    pub events: EventSender,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        modules: Arc<dyn ModuleFactory>,
        sinks: Arc<dyn SinkPool>,
    ) -> (Self, Receiver<InputEvent>) {
        let (events, rx) = EventSender::channel();
        (
            Self {
                config: Arc::new(config),
                modules,
                sinks,
                stats: Arc::new(InputStats::new()),
                events,
            },
            rx,
        )
    }
}
