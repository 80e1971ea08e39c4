use anyhow::Result;
use log::{info, warn};
use myy_pipeline::core::{ms, EsCategory, InputState, PipelineConfig};
use myy_pipeline::player::synthetic::{RawModuleFactory, RecordingSinkPool, SyntheticDemuxer};
use myy_pipeline::player::modules::SinkPool;
use myy_pipeline::player::{Control, InputEvent, InputOptions, InputThread, PipelineContext};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    // 初始化日志（RUST_LOG 优先，默认 info）
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🎬 MYY Pipeline 演示启动");

    // 第一个参数可以指定 JSON 配置文件
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };

    let pool = RecordingSinkPool::new();
    let sinks: Arc<dyn SinkPool> = pool.clone();
    let (ctx, events) = PipelineContext::new(config, Arc::new(RawModuleFactory::new()), sinks);

    let source = SyntheticDemuxer::demo(ms(8_000));
    let mut input = InputThread::create(ctx, Box::new(source), InputOptions::default());
    input.start()?;

    let printer = thread::Builder::new()
        .name("events".to_string())
        .spawn(move || {
            for event in events.iter() {
                match &event {
                    InputEvent::Statistics(_) | InputEvent::Position { .. } => {}
                    InputEvent::Dead => {
                        info!("📣 {:?}", event);
                        break;
                    }
                    _ => info!("📣 {:?}", event),
                }
            }
        })?;

    let script = [
        (800, Control::SetState(InputState::Paused)),
        (500, Control::SetState(InputState::Playing)),
        (700, Control::SetTime { time: ms(4_000), fast: false }),
        (700, Control::SetRate(2.0)),
        (500, Control::SetRate(1.0)),
        (500, Control::SetEs(201)),
        (500, Control::SetSeekpointPrev),
        (1_000, Control::SetState(InputState::Paused)),
    ];
    for (delay, control) in script {
        thread::sleep(Duration::from_millis(delay));
        info!("🎛 发送控制命令: {}", control.name());
        if !input.push_control(control) {
            warn!("⚠ 控制命令被丢弃");
        }
    }

    thread::sleep(Duration::from_millis(500));
    info!(
        "🔊 当前音轨: {:?}, 视频输出 {} 帧, 音频输出 {} 块",
        input.es_out().selected_es(EsCategory::Audio),
        pool.delivered_for(EsCategory::Video).len(),
        pool.delivered_for(EsCategory::Audio).len()
    );

    input.close();
    if printer.join().is_err() {
        warn!("⚠ 事件线程异常退出");
    }
    info!("👋 演示结束");
    Ok(())
}
