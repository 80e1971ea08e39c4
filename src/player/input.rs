use crate::core::{
    deadline_instant, mdate, EsCategory, InputState, PipelineError, Result, Tick, Viewpoint,
    TICK_PER_SEC,
};
use crate::player::context::PipelineContext;
use crate::player::control::{Control, ControlQueue, RendererHandle, SlaveDescriptor, SlaveKind};
use crate::player::demuxer_source::{DemuxStatus, DemuxerSource, NavAction};
use crate::player::es_out::{EsOut, EsOutMode};
use crate::player::events::InputEvent;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 章节内超过该时长时 "上一章" 回到本章开头
const SEEKPOINT_PREV_THRESHOLD: Tick = 3 * TICK_PER_SEC;
/// 左右导航键的跳转步长
const SHORT_JUMP: Tick = 10 * TICK_PER_SEC;

/// 书签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    pub name: String,
    pub time: Tick,
}

/// 输入启动参数
#[derive(Debug, Clone)]
pub struct InputOptions {
    pub start_time: Option<Tick>,
    /// 到达该时间视为结束
    pub stop_time: Option<Tick>,
    pub rate: f32,
    pub start_paused: bool,
    pub bookmarks: Vec<Bookmark>,
    /// 输出端（而非时钟）控制读取节奏
    pub out_pace_control: bool,
    pub slaves: Vec<SlaveDescriptor>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            start_time: None,
            stop_time: None,
            rate: 1.0,
            start_paused: false,
            bookmarks: Vec::new(),
            out_pace_control: false,
            slaves: Vec::new(),
        }
    }
}

/// 打开附加输入（外挂字幕 / 音轨）
pub trait SlaveOpener: Send + Sync {
    fn open(&self, slave: &SlaveDescriptor) -> Result<Box<dyn DemuxerSource>>;
}

struct InputShared {
    ctx: PipelineContext,
    control: ControlQueue,
    state: Mutex<InputState>,
    es_out: Arc<EsOut>,
}

impl InputShared {
    fn set_state(&self, state: InputState) {
        let mut current = self.state.lock();
        if *current == state {
            return;
        }
        info!("{} 🔀 输入状态: {:?} -> {:?}", log_ctx(), *current, state);
        *current = state;
        drop(current);
        self.ctx.events.send(InputEvent::State(state));
    }

    fn state(&self) -> InputState {
        *self.state.lock()
    }
}

/// 输入线程句柄
///
/// create 之后 start 启动线程；stop 只设置停止标志并唤醒线程，
/// close 等待线程退出并释放未执行的命令。
pub struct InputThread {
    shared: Arc<InputShared>,
    runner: Option<InputRunner>,
    handle: Option<JoinHandle<()>>,
}

impl InputThread {
    pub fn create(ctx: PipelineContext, source: Box<dyn DemuxerSource>, options: InputOptions) -> Self {
        let es_out = Arc::new(EsOut::new(ctx.clone()));
        let shared = Arc::new(InputShared {
            control: ControlQueue::new(ctx.config.control_fifo_size),
            state: Mutex::new(InputState::Init),
            es_out,
            ctx,
        });
        let runner = InputRunner::new(shared.clone(), source, options);
        Self {
            shared,
            runner: Some(runner),
            handle: None,
        }
    }

    pub fn with_slave_opener(mut self, opener: Arc<dyn SlaveOpener>) -> Self {
        if let Some(runner) = self.runner.as_mut() {
            runner.slave_opener = Some(opener);
        }
        self
    }

    pub fn start(&mut self) -> Result<()> {
        let runner = self
            .runner
            .take()
            .ok_or_else(|| PipelineError::InvalidArgument("输入线程已经启动".to_string()))?;
        let handle = thread::Builder::new()
            .name("input".to_string())
            .spawn(move || runner.run())?;
        self.handle = Some(handle);
        Ok(())
    }

    /// 请求停止；之后的 push_control 全部失败
    pub fn stop(&self) {
        info!("{} ⏹ 请求停止输入线程", log_ctx());
        self.shared.control.stop();
        self.shared.es_out.interrupt();
    }

    /// 停止并等待线程退出
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 输入线程异常退出", log_ctx());
            }
        }
        let released = self.shared.control.drain_release();
        if released > 0 {
            debug!("{} 释放 {} 个未执行的控制命令", log_ctx(), released);
        }
    }

    pub fn push_control(&self, control: Control) -> bool {
        self.shared.control.push(control)
    }

    pub fn state(&self) -> InputState {
        self.shared.state()
    }

    pub fn es_out(&self) -> &Arc<EsOut> {
        &self.shared.es_out
    }
}

impl Drop for InputThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Slave {
    uri: String,
    source: Box<dyn DemuxerSource>,
    eof: bool,
}

/// 输入线程本体，只在输入线程中访问
struct InputRunner {
    shared: Arc<InputShared>,
    es_out: Arc<EsOut>,
    source: Box<dyn DemuxerSource>,
    options: InputOptions,
    slave_opener: Option<Arc<dyn SlaveOpener>>,
    slaves: Vec<Slave>,

    eof: bool,
    can_pause: bool,
    can_pace_control: bool,
    can_rate_control: bool,
    rescale_ts: bool,
    rate: f32,
    recording: bool,
    title_count: usize,
    title: usize,
    seekpoint: usize,
    pts_delay: Tick,
    audio_delay: Tick,
    spu_delay: Tick,
    viewpoint: Viewpoint,
    viewpoint_changed: bool,
    renderer: Option<RendererHandle>,
}

impl InputRunner {
    fn new(shared: Arc<InputShared>, source: Box<dyn DemuxerSource>, options: InputOptions) -> Self {
        let es_out = shared.es_out.clone();
        let pts_delay = shared.ctx.config.pts_delay;
        Self {
            shared,
            es_out,
            source,
            options,
            slave_opener: None,
            slaves: Vec::new(),
            eof: false,
            can_pause: true,
            can_pace_control: true,
            can_rate_control: false,
            rescale_ts: true,
            rate: 1.0,
            recording: false,
            title_count: 0,
            title: 0,
            seekpoint: 0,
            pts_delay,
            audio_delay: 0,
            spu_delay: 0,
            viewpoint: Viewpoint::default(),
            viewpoint_changed: false,
            renderer: None,
        }
    }

    fn send_event(&self, event: InputEvent) {
        self.shared.ctx.events.send(event);
    }

    fn run(mut self) {
        info!("{} 🎬 输入线程启动: {}", log_ctx(), self.source.description());
        match self.init() {
            Ok(()) => self.main_loop(),
            Err(e) => {
                error!("{} ❌ 打开输入失败: {}", log_ctx(), e);
                self.shared.set_state(InputState::Error);
            }
        }
        self.end();
        self.send_event(InputEvent::Dead);
        info!("{} 🛑 输入线程退出", log_ctx());
    }

    // ========== 初始化 ==========

    fn init(&mut self) -> Result<()> {
        self.shared.set_state(InputState::Opening);
        self.source.open(&self.es_out)?;

        self.can_pause = self.source.can_pause();
        self.can_pace_control = self.source.can_control_pace();
        let (can_rate_control, rescale_ts) = self.source.rate_control();
        self.can_rate_control = can_rate_control;
        self.rescale_ts = rescale_ts;
        self.es_out
            .set_pace_control(self.can_pace_control, self.options.out_pace_control);

        if let Some(pts_delay) = self.source.pts_delay() {
            self.pts_delay = pts_delay;
        }
        self.es_out.set_jitter(self.pts_delay, 0);

        let titles = self.source.titles();
        self.title_count = titles.len();
        if self.title_count > 0 {
            self.title = self.source.title();
            self.seekpoint = self.source.seekpoint();
            self.send_event(InputEvent::Title(self.title));
        }
        if let Some(length) = self.source.length() {
            self.send_event(InputEvent::Length(length));
        }

        for slave in self.options.slaves.clone() {
            self.add_slave(slave);
        }

        // 初始参数走控制队列，与用户命令保持同样的处理路径
        if let Some(start) = self.options.start_time.filter(|t| *t > 0) {
            info!("{} ⏩ 从 {}ms 开始播放", log_ctx(), start / 1000);
            self.shared.control.push(Control::SetTime { time: start, fast: false });
        }
        if self.options.rate != 1.0 {
            self.shared.control.push(Control::SetRate(self.options.rate));
        }

        self.es_out.set_mode(EsOutMode::Auto);
        self.shared.set_state(InputState::Playing);
        if self.options.start_paused {
            self.shared.control.push(Control::SetState(InputState::Paused));
        }
        Ok(())
    }

    // ========== 主循环 ==========

    fn main_loop(&mut self) {
        let config = self.shared.ctx.config.clone();
        let mut last_seek: Option<Tick> = None;
        let mut intf_update: Tick = 0;

        while !self.shared.control.is_stopped() && self.shared.state() != InputState::Error {
            // None 表示一直等待控制命令
            let mut wakeup: Option<Tick> = None;

            let mut paused = self.shared.state() == InputState::Paused;
            if paused {
                paused = !self.es_out.is_buffering() || self.eof;
            }

            if !paused {
                if !self.eof {
                    if self.demux_once() {
                        intf_update = 0;
                    }
                    wakeup = Some(self.es_out.wakeup());
                } else if !self.es_out.is_empty() {
                    debug!("{} 等待解码线程排空", log_ctx());
                    wakeup = Some(mdate() + config.idle_sleep);
                } else {
                    info!("{} 🏁 播放结束", log_ctx());
                    break;
                }

                let now = mdate();
                if now >= intf_update {
                    self.update_statistics();
                    intf_update = now + config.stats_interval;
                }
            }

            // 处理控制命令，直到唤醒时间
            loop {
                let mut deadline = wakeup;
                let mut postpone = self.es_out.is_buffering() && !self.eof;
                if postpone {
                    let now = mdate();
                    let within_window =
                        last_seek.map_or(false, |t| now < t + config.seek_postpone_window);
                    let poll = now + config.seek_postpone_poll;
                    if within_window && deadline.map_or(true, |d| d > poll) {
                        deadline = Some(poll);
                    } else {
                        postpone = false;
                    }
                }

                let control = self
                    .shared
                    .control
                    .pop(deadline.map(deadline_instant), postpone);
                let Some(control) = control else {
                    if postpone && !self.shared.control.is_stopped() {
                        continue;
                    }
                    break;
                };

                let seek = control.is_seek_request();
                debug!("{} 🎛 控制命令 {}", log_ctx(), control.name());
                if self.apply(control) {
                    if seek {
                        last_seek = Some(mdate());
                    }
                    intf_update = 0;
                }
                if wakeup != Some(0) {
                    wakeup = Some(self.es_out.wakeup());
                }
                if self.shared.state() == InputState::Error {
                    break;
                }
            }
        }
    }

    /// 读取一次数据，返回是否需要立即刷新界面
    fn demux_once(&mut self) -> bool {
        let mut status = self.source.demux(&self.es_out);

        if status == DemuxStatus::Ok {
            if let (Some(stop), Some(time)) = (self.options.stop_time, self.source.time()) {
                if time >= stop {
                    info!("{} ⏹ 到达结束时间 {}ms", log_ctx(), stop / 1000);
                    status = DemuxStatus::Eof;
                }
            }
        }

        match status {
            DemuxStatus::Ok => {
                self.slave_demux();
                self.update_title_seekpoint()
            }
            DemuxStatus::Eof => {
                debug!("{} 📭 到达 EOF", log_ctx());
                self.eof = true;
                self.es_out.set_eos();
                false
            }
            DemuxStatus::Error(message) => {
                error!("{} ❌ 解复用失败: {}", log_ctx(), message);
                self.send_event(InputEvent::UserError {
                    title: "读取失败".to_string(),
                    message,
                });
                self.shared.set_state(InputState::Error);
                false
            }
        }
    }

    fn update_title_seekpoint(&mut self) -> bool {
        if self.title_count == 0 {
            return false;
        }
        let title = self.source.title();
        let seekpoint = self.source.seekpoint();
        let mut changed = false;
        if title != self.title {
            self.title = title;
            self.send_event(InputEvent::Title(title));
            changed = true;
        }
        if seekpoint != self.seekpoint || changed {
            self.seekpoint = seekpoint;
            self.send_event(InputEvent::Seekpoint { title, seekpoint });
            changed = true;
        }
        changed
    }

    fn update_statistics(&self) {
        let time = self.source.time().unwrap_or(0);
        let length = self.source.length().unwrap_or(0);
        self.es_out.set_times(self.source.position(), time, length);
        self.send_event(InputEvent::Statistics(self.shared.ctx.stats.snapshot()));
    }

    fn end(&mut self) {
        if self.shared.state() != InputState::Error {
            self.shared.set_state(InputState::End);
        }
        self.es_out.set_mode(EsOutMode::End);
        self.es_out.close();
        for slave in self.slaves.drain(..) {
            debug!("{} 关闭附加输入 {}", log_ctx(), slave.uri);
        }
        if let Some(renderer) = self.renderer.take() {
            debug!("{} 释放渲染目标 {}", log_ctx(), renderer.name);
        }
        self.update_statistics();
    }

    // ========== 附加输入 ==========

    fn add_slave(&mut self, slave: SlaveDescriptor) {
        let Some(opener) = self.slave_opener.clone() else {
            warn!("{} ⚠ 没有附加输入打开器，忽略 {}", log_ctx(), slave.uri);
            return;
        };
        let mut source = match opener.open(&slave) {
            Ok(source) => source,
            Err(e) => {
                warn!("{} ⚠ 无法打开附加输入 {}: {}", log_ctx(), slave.uri, e);
                return;
            }
        };

        let before = self.es_out.es_ids();
        if let Err(e) = source.open(&self.es_out) {
            warn!("{} ⚠ 附加输入 {} 初始化失败: {}", log_ctx(), slave.uri, e);
            return;
        }
        if let Some(time) = self.source.time() {
            if let Err(e) = source.seek_time(time, true) {
                debug!("{} 附加输入无法定位到 {}ms: {}", log_ctx(), time / 1000, e);
            }
        }

        if slave.forced {
            let category = match slave.kind {
                SlaveKind::Audio => EsCategory::Audio,
                SlaveKind::Subtitle => EsCategory::Subtitle,
            };
            let added = self
                .es_out
                .es_ids()
                .into_iter()
                .filter(|id| !before.contains(id))
                .find(|id| {
                    self.es_out
                        .es_format(*id)
                        .map_or(false, |fmt| fmt.category == category)
                });
            if let Some(id) = added {
                if let Err(e) = self.es_out.set_es(id) {
                    warn!("{} ⚠ 选中附加轨道失败: {}", log_ctx(), e);
                }
            }
        }

        info!("{} ➕ 附加输入: {}", log_ctx(), slave.uri);
        self.slaves.push(Slave {
            uri: slave.uri,
            source,
            eof: false,
        });
    }

    /// 让附加输入追上主输入的时间
    fn slave_demux(&mut self) {
        if self.slaves.is_empty() {
            return;
        }
        let Some(time) = self.source.time() else {
            return;
        };
        for slave in self.slaves.iter_mut().filter(|s| !s.eof) {
            loop {
                let Some(slave_time) = slave.source.time() else {
                    warn!("{} ⚠ 附加输入 {} 无法获取时间，视为结束", log_ctx(), slave.uri);
                    slave.eof = true;
                    break;
                };
                if slave_time >= time {
                    break;
                }
                if slave.source.demux(&self.es_out) != DemuxStatus::Ok {
                    debug!("{} 附加输入 {} 结束", log_ctx(), slave.uri);
                    slave.eof = true;
                    break;
                }
            }
        }
    }

    fn slave_seek(&mut self) {
        let Some(time) = self.source.time() else {
            return;
        };
        for slave in self.slaves.iter_mut() {
            match slave.source.seek_time(time, true) {
                Ok(()) => slave.eof = false,
                Err(e) => {
                    if !slave.eof {
                        warn!("{} ⚠ 附加输入 {} 定位失败: {}", log_ctx(), slave.uri, e);
                    }
                    slave.eof = true;
                }
            }
        }
    }

    // ========== 控制命令 ==========

    /// 执行一个控制命令，返回是否需要立即刷新界面
    fn apply(&mut self, control: Control) -> bool {
        let date = mdate();
        match control {
            Control::SetState(InputState::Playing) => {
                if self.shared.state() == InputState::Paused {
                    self.unpause(date);
                    return true;
                }
                false
            }
            Control::SetState(InputState::Paused) => {
                if self.shared.state() == InputState::Playing {
                    self.pause(date);
                    return true;
                }
                false
            }
            Control::SetState(other) => {
                error!("{} ❌ 非法的目标状态 {:?}", log_ctx(), other);
                false
            }
            Control::SetRate(rate) => self.set_rate(rate),
            Control::SetPosition { position, fast } => self.seek_position(position, fast),
            Control::SetTime { time, fast } => self.seek_time(time, fast),
            Control::SetProgram(group) => {
                if let Err(e) = self.es_out.program_select(group) {
                    warn!("{} ⚠ 切换节目 {} 失败: {}", log_ctx(), group, e);
                    return false;
                }
                if let Err(e) = self.source.set_group(group) {
                    debug!("{} 数据源不处理节目切换: {}", log_ctx(), e);
                }
                true
            }
            Control::SetTitle(title) => self.set_title(Some(title), 0),
            Control::SetTitleNext => self.set_title(None, 1),
            Control::SetTitlePrev => self.set_title(None, -1),
            Control::SetSeekpoint(seekpoint) => self.set_seekpoint(Some(seekpoint), 0),
            Control::SetSeekpointNext => self.set_seekpoint(None, 1),
            Control::SetSeekpointPrev => self.set_seekpoint(None, -1),
            Control::SetBookmark(index) => {
                let Some(bookmark) = self.options.bookmarks.get(index).cloned() else {
                    warn!("{} ⚠ 书签 {} 不存在", log_ctx(), index);
                    return false;
                };
                info!("{} 🔖 跳转到书签 {}", log_ctx(), bookmark.name);
                self.seek_time(bookmark.time, false)
            }
            Control::Nav(action) => self.navigate(action),
            Control::SetEs(id) => {
                if let Err(e) = self.es_out.set_es(id) {
                    warn!("{} ⚠ 选中 ES {} 失败: {}", log_ctx(), id, e);
                    return false;
                }
                if let Err(e) = self.source.set_es(id) {
                    debug!("{} 数据源不处理轨道切换: {}", log_ctx(), e);
                }
                true
            }
            Control::UnsetEs(id) => self.report(self.es_out.unset_es(id), "取消选中 ES"),
            Control::RestartEs(id) => self.report(self.es_out.restart_es(id), "重启 ES"),
            Control::SetEsList { category, ids } => {
                self.report(self.es_out.set_es_list(category, &ids), "选中轨道列表")
            }
            Control::SetViewpoint(viewpoint) => {
                self.viewpoint = viewpoint;
                self.viewpoint_changed = true;
                self.apply_viewpoint();
                true
            }
            Control::UpdateViewpoint(delta) => {
                self.viewpoint.add(&delta);
                self.viewpoint_changed = true;
                self.apply_viewpoint();
                true
            }
            Control::SetInitialViewpoint(viewpoint) => {
                if self.viewpoint_changed {
                    return false;
                }
                self.viewpoint = viewpoint;
                self.apply_viewpoint();
                true
            }
            Control::SetAudioDelay(delay) => {
                self.audio_delay = delay;
                self.es_out.set_delay(EsCategory::Audio, delay);
                self.send_event(InputEvent::AudioDelay(delay));
                self.update_pts_delay();
                true
            }
            Control::SetSpuDelay(delay) => {
                self.spu_delay = delay;
                self.es_out.set_delay(EsCategory::Subtitle, delay);
                self.send_event(InputEvent::SpuDelay(delay));
                self.update_pts_delay();
                true
            }
            Control::AddSlave(slave) => {
                self.add_slave(slave);
                true
            }
            Control::SetRecordState(recording) => self.set_record_state(recording),
            Control::SetFrameNext => {
                match self.shared.state() {
                    InputState::Paused => {
                        if let Err(e) = self.es_out.frame_next() {
                            warn!("{} ⚠ 逐帧失败: {}", log_ctx(), e);
                        }
                    }
                    InputState::Playing => self.pause(date),
                    other => error!("{} ❌ 状态 {:?} 下不能逐帧", log_ctx(), other),
                }
                true
            }
            Control::SetRenderer(renderer) => {
                match &renderer {
                    Some(r) => info!("{} 📡 切换渲染目标: {}", log_ctx(), r.name),
                    None => info!("{} 📡 切回本地渲染", log_ctx()),
                }
                self.renderer = renderer;
                let ids = self.es_out.stop_all_es();
                self.es_out.start_all_es(&ids);
                true
            }
        }
    }

    fn report(&self, result: Result<()>, what: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{} ⚠ {}失败: {}", log_ctx(), what, e);
                false
            }
        }
    }

    fn pause(&mut self, date: Tick) {
        if self.can_pause {
            if let Err(e) = self.source.set_pause_state(true) {
                warn!("{} ⚠ 数据源无法暂停: {}", log_ctx(), e);
                return;
            }
        }
        self.es_out.set_pause_state(true, date);
        self.shared.set_state(InputState::Paused);
    }

    fn unpause(&mut self, date: Tick) {
        if self.can_pause {
            if let Err(e) = self.source.set_pause_state(false) {
                error!("{} ❌ 无法恢复播放: {}", log_ctx(), e);
                self.shared.set_state(InputState::Error);
                return;
            }
        }
        self.shared.set_state(InputState::Playing);
        self.es_out.set_pause_state(false, date);
    }

    fn set_rate(&mut self, requested: f32) -> bool {
        let config = &self.shared.ctx.config;
        let mut rate = clamp_rate(requested, config.min_rate, config.max_rate);

        if rate < 0.0 && !self.rescale_ts {
            warn!("{} ⚠ 数据源不支持倒放，忽略速率 {}", log_ctx(), rate);
            return false;
        }
        if rate != 1.0
            && ((!self.can_rate_control && !self.rescale_ts) || self.options.out_pace_control)
        {
            debug!("{} 无法改变速率", log_ctx());
            rate = 1.0;
        }
        if rate != self.rate && !self.can_pace_control && self.can_rate_control {
            if !self.rescale_ts {
                self.es_out.change_position();
            }
            rate = match self.source.set_rate(rate) {
                Ok(applied) => applied,
                Err(e) => {
                    warn!("{} ⚠ 数据源设置速率失败: {}", log_ctx(), e);
                    self.rate
                }
            };
        }
        if rate == self.rate {
            return false;
        }

        info!("{} ⏩ 播放速率: {} -> {}", log_ctx(), self.rate, rate);
        self.rate = rate;
        self.send_event(InputEvent::Rate(rate));
        if self.rescale_ts {
            let clock_rate = if self.can_pace_control || self.can_rate_control {
                rate.abs()
            } else {
                1.0
            };
            self.es_out.set_rate(clock_rate);
        }
        true
    }

    fn seek_position(&mut self, position: f64, fast: bool) -> bool {
        if self.recording {
            error!("{} ❌ 录制中不能跳转", log_ctx());
            return false;
        }
        let position = position.clamp(0.0, 1.0);
        // 先 flush 再跳转：跳转失败时排队的数据同样丢弃并重新缓冲，状态不变
        self.es_out.change_position();
        if let Err(e) = self.source.seek_position(position, !fast) {
            error!("{} ❌ 跳转到 {:.1}% 失败: {}", log_ctx(), position * 100.0, e);
            return false;
        }
        self.after_seek();
        true
    }

    fn seek_time(&mut self, time: Tick, fast: bool) -> bool {
        if self.recording {
            error!("{} ❌ 录制中不能跳转", log_ctx());
            return false;
        }
        let time = time.max(0);
        // 同 seek_position，flush 先于跳转请求
        self.es_out.change_position();

        let mut result = self.source.seek_time(time, !fast);
        if result.is_err() {
            // 按时长换算成位置
            if let Some(length) = self.source.length().filter(|l| *l > 0) {
                result = self
                    .source
                    .seek_position(time as f64 / length as f64, !fast);
            }
        }
        if let Err(e) = result {
            warn!("{} ⚠ 跳转到 {}ms 失败: {}", log_ctx(), time / 1000, e);
            return false;
        }
        if !fast {
            self.es_out.set_next_display_time(time);
        }
        self.after_seek();
        true
    }

    fn after_seek(&mut self) {
        self.slave_seek();
        self.eof = false;
        info!("{} ⏩ 跳转完成，当前 {}ms", log_ctx(), self.source.time().unwrap_or(0) / 1000);
    }

    fn set_title(&mut self, title: Option<usize>, step: i64) -> bool {
        if self.recording {
            error!("{} ❌ 录制中不能切换标题", log_ctx());
            return false;
        }
        if self.title_count == 0 {
            return false;
        }
        let target = match title {
            Some(title) => title as i64,
            None => self.source.title() as i64 + step,
        };
        if target < 0 || target >= self.title_count as i64 {
            return false;
        }
        let target = target as usize;
        self.es_out.change_position();
        if let Err(e) = self.source.set_title(target) {
            warn!("{} ⚠ 切换到标题 {} 失败: {}", log_ctx(), target, e);
            return false;
        }
        self.title = target;
        self.seekpoint = self.source.seekpoint();
        self.send_event(InputEvent::Title(target));
        self.after_seek();
        true
    }

    fn set_seekpoint(&mut self, seekpoint: Option<usize>, step: i64) -> bool {
        if self.recording {
            error!("{} ❌ 录制中不能切换章节", log_ctx());
            return false;
        }
        if self.title_count == 0 {
            return false;
        }
        let title = self.source.title();
        let current = self.source.seekpoint();
        let seekpoints = self
            .source
            .titles()
            .get(title)
            .map(|t| t.seekpoints.clone())
            .unwrap_or_default();

        let target = match (seekpoint, step) {
            (Some(seekpoint), _) => seekpoint as i64,
            (None, step) if step < 0 => {
                previous_seekpoint(&seekpoints, current, self.source.time()) as i64
            }
            (None, step) => current as i64 + step,
        };
        if target < 0 || target >= seekpoints.len() as i64 {
            return false;
        }
        let target = target as usize;
        self.es_out.change_position();
        if let Err(e) = self.source.set_seekpoint(target) {
            warn!("{} ⚠ 切换到章节 {} 失败: {}", log_ctx(), target, e);
            return false;
        }
        self.seekpoint = target;
        self.send_event(InputEvent::Seekpoint { title, seekpoint: target });
        self.after_seek();
        true
    }

    fn navigate(&mut self, action: NavAction) -> bool {
        if self.source.navigate(action).is_ok() {
            return true;
        }
        // 数据源没有菜单时，左右键做短跳转
        match action {
            NavAction::Left | NavAction::Right => {
                let direction = if action == NavAction::Left { -1 } else { 1 };
                let time = self.source.time().unwrap_or(0) + direction * SHORT_JUMP;
                self.seek_time(time, true)
            }
            NavAction::Up | NavAction::Down => {
                debug!("{} 忽略导航 {:?}", log_ctx(), action);
                false
            }
            NavAction::Activate | NavAction::Popup | NavAction::Menu => false,
        }
    }

    fn set_record_state(&mut self, recording: bool) -> bool {
        if self.recording == recording {
            return false;
        }
        let applied = match self.source.set_record_state(recording) {
            Ok(()) => recording,
            Err(_) => match self.es_out.set_record_state(recording) {
                Ok(()) => recording,
                Err(e) => {
                    warn!("{} ⚠ 无法切换录制状态: {}", log_ctx(), e);
                    false
                }
            },
        };
        self.recording = applied;
        self.send_event(InputEvent::RecordState(applied));
        true
    }

    fn apply_viewpoint(&mut self) {
        self.viewpoint.clip();
        self.send_event(InputEvent::Viewpoint(self.viewpoint));
    }

    /// 负的音频 / 字幕延迟需要额外的缓冲
    fn update_pts_delay(&self) {
        let extra = (-self.audio_delay.min(self.spu_delay)).max(0);
        self.es_out.set_jitter(self.pts_delay + extra, 0);
    }
}

/// 按绝对值限制速率，保留方向
fn clamp_rate(rate: f32, min: f32, max: f32) -> f32 {
    if rate == 0.0 || !rate.is_finite() {
        return 1.0;
    }
    rate.signum() * rate.abs().clamp(min, max)
}

/// "上一章"：在本章开头 3 秒以内回到上一章，否则回到本章开头
fn previous_seekpoint(seekpoints: &[Tick], current: usize, time: Option<Tick>) -> i64 {
    match (seekpoints.get(current), time) {
        (Some(start), Some(time)) if *start >= 0 && time >= 0 => {
            if time < start + SEEKPOINT_PREV_THRESHOLD {
                current as i64 - 1
            } else {
                current as i64
            }
        }
        _ => current as i64 - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ms, EsFormat, PipelineConfig};
    use crate::player::modules::SinkPool;
    use crate::player::synthetic::{RawModuleFactory, RecordingSinkPool, SyntheticDemuxer};
    use crossbeam_channel::Receiver;
    use std::time::{Duration, Instant};

    fn context() -> (PipelineContext, Arc<RecordingSinkPool>, Receiver<InputEvent>) {
        let config = PipelineConfig {
            pts_delay: ms(50),
            stats_interval: ms(50),
            idle_sleep: ms(10),
            ..PipelineConfig::default()
        };
        let pool = RecordingSinkPool::new();
        let sinks: Arc<dyn SinkPool> = pool.clone();
        let (ctx, rx) = PipelineContext::new(config, Arc::new(RawModuleFactory::new()), sinks);
        (ctx, pool, rx)
    }

    fn audio_source(length: Tick) -> SyntheticDemuxer {
        SyntheticDemuxer::new(length).with_track(
            EsFormat::new(EsCategory::Audio, "raw-audio").with_language("en"),
            ms(20),
        )
    }

    /// 不支持跳转的数据源
    struct UnseekableSource(SyntheticDemuxer);

    impl DemuxerSource for UnseekableSource {
        fn open(&mut self, out: &EsOut) -> Result<()> {
            self.0.open(out)
        }

        fn demux(&mut self, out: &EsOut) -> DemuxStatus {
            self.0.demux(out)
        }

        fn time(&self) -> Option<Tick> {
            self.0.time()
        }

        fn position(&self) -> f64 {
            self.0.position()
        }

        fn length(&self) -> Option<Tick> {
            self.0.length()
        }

        fn description(&self) -> String {
            "unseekable".to_string()
        }
    }

    /// 收集事件直到满足条件或超时
    fn wait_event(rx: &Receiver<InputEvent>, seen: &mut Vec<InputEvent>, pred: impl Fn(&InputEvent) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(20)) {
                let hit = pred(&event);
                seen.push(event);
                if hit {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_plays_to_end() {
        let (ctx, pool, rx) = context();
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(300))), InputOptions::default());
        input.start().unwrap();

        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Dead));
        assert!(seen.contains(&InputEvent::State(InputState::Opening)));
        assert!(seen.contains(&InputEvent::State(InputState::Playing)));
        assert!(seen.contains(&InputEvent::State(InputState::End)));
        assert_eq!(input.state(), InputState::End);
        assert_eq!(pool.delivered().len(), 15);
        input.close();
    }

    #[test]
    fn test_demux_error_ends_in_error_state() {
        let (ctx, _pool, rx) = context();
        let source = audio_source(ms(5_000)).with_failure_at(ms(100));
        let mut input = InputThread::create(ctx, Box::new(source), InputOptions::default());
        input.start().unwrap();

        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Dead));
        assert!(seen.contains(&InputEvent::State(InputState::Error)));
        assert!(!seen.contains(&InputEvent::State(InputState::End)));
        assert_eq!(input.state(), InputState::Error);
        assert_eq!(seen.iter().filter(|e| **e == InputEvent::Dead).count(), 1);
    }

    #[test]
    fn test_stop_fails_pushes_closed() {
        let (ctx, _pool, rx) = context();
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(60_000))), InputOptions::default());
        input.start().unwrap();
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::State(InputState::Playing)));

        input.stop();
        assert!(!input.push_control(Control::SetRate(2.0)));
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Dead));
        input.close();
    }

    #[test]
    fn test_pause_and_resume() {
        let (ctx, _pool, rx) = context();
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(60_000))), InputOptions::default());
        input.start().unwrap();
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::State(InputState::Playing)));

        assert!(input.push_control(Control::SetState(InputState::Paused)));
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::State(InputState::Paused)));
        assert!(input.push_control(Control::SetState(InputState::Playing)));
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::State(InputState::Playing)));
        input.close();
    }

    #[test]
    fn test_rate_is_clamped() {
        let (ctx, _pool, rx) = context();
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(60_000))), InputOptions::default());
        input.start().unwrap();
        assert!(input.push_control(Control::SetRate(64.0)));
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| matches!(e, InputEvent::Rate(_))));
        assert_eq!(seen.last(), Some(&InputEvent::Rate(32.0)));
        input.close();
    }

    #[test]
    fn test_recording_blocks_seek() {
        let (ctx, _pool, rx) = context();
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(60_000))), InputOptions::default());
        input.start().unwrap();
        assert!(input.push_control(Control::SetRecordState(true)));
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::RecordState(true)));

        assert!(input.push_control(Control::SetTime { time: ms(30_000), fast: true }));
        thread::sleep(Duration::from_millis(200));
        let time = seen
            .iter()
            .chain(rx.try_iter().collect::<Vec<_>>().iter())
            .filter_map(|e| match e {
                InputEvent::Position { time, .. } => Some(*time),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        assert!(time < ms(30_000));
        input.close();
    }

    #[test]
    fn test_failed_seek_rebuffers_and_keeps_playing() {
        let (ctx, _pool, rx) = context();
        let source = UnseekableSource(audio_source(ms(60_000)));
        let mut input = InputThread::create(ctx, Box::new(source), InputOptions::default());
        input.start().unwrap();
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Cache(1.0)));

        // 跳转失败前已经 flush，数据源继续从原位置缓冲
        seen.clear();
        assert!(input.push_control(Control::SetTime { time: ms(30_000), fast: true }));
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Cache(0.0)));
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::Cache(1.0)));
        assert!(!seen.iter().any(|e| matches!(e, InputEvent::State(_))));
        assert_eq!(input.state(), InputState::Playing);
        assert!(!input.es_out().selected_es(EsCategory::Audio).is_empty());
        input.close();
    }

    #[test]
    fn test_chapter_navigation_events() {
        let (ctx, _pool, rx) = context();
        let source = audio_source(ms(60_000)).with_chapters(vec![0, ms(20_000), ms(40_000)]);
        let mut input = InputThread::create(ctx, Box::new(source), InputOptions::default());
        input.start().unwrap();
        assert!(input.push_control(Control::SetSeekpointNext));
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e
            == InputEvent::Seekpoint { title: 0, seekpoint: 1 }));
        input.close();
    }

    #[test]
    fn test_start_paused_at_time() {
        let (ctx, _pool, rx) = context();
        let options = InputOptions {
            start_time: Some(ms(1_000)),
            start_paused: true,
            ..InputOptions::default()
        };
        let mut input = InputThread::create(ctx, Box::new(audio_source(ms(60_000))), options);
        input.start().unwrap();
        let mut seen = Vec::new();
        assert!(wait_event(&rx, &mut seen, |e| *e == InputEvent::State(InputState::Paused)));
        input.close();
    }

    #[test]
    fn test_clamp_rate() {
        assert_eq!(clamp_rate(64.0, 1.0 / 32.0, 32.0), 32.0);
        assert_eq!(clamp_rate(-0.001, 1.0 / 32.0, 32.0), -1.0 / 32.0);
        assert_eq!(clamp_rate(0.0, 1.0 / 32.0, 32.0), 1.0);
        assert_eq!(clamp_rate(2.0, 1.0 / 32.0, 32.0), 2.0);
    }

    #[test]
    fn test_previous_seekpoint_rule() {
        let seekpoints = [0, ms(60_000), ms(120_000)];
        assert_eq!(previous_seekpoint(&seekpoints, 1, Some(ms(61_000))), 0);
        assert_eq!(previous_seekpoint(&seekpoints, 1, Some(ms(70_000))), 1);
        assert_eq!(previous_seekpoint(&seekpoints, 0, Some(ms(1_000))), -1);
        assert_eq!(previous_seekpoint(&seekpoints, 2, None), 1);
    }
}
