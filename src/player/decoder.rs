use crate::core::{
    deadline_instant, Block, BlockFlags, CcCodec, CcDescriptor, DecodedUnit, EsCategory, EsFormat,
    PipelineError, ProgramClock, Result, Tick, TICK_PER_MS,
};
use crate::player::context::PipelineContext;
use crate::player::events::InputEvent;
use crate::player::modules::{
    AudioSink, DecodeStatus, DecoderModule, DecoderOutput, Packetizer, SinkStatus, SpuSink,
    VideoSink,
};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 字幕最多提前这么久交给输出
const SPU_MAX_PREPARE_TIME: Tick = 500 * TICK_PER_MS;
/// 阻塞等待时的轮询间隔（用于检查取消）
const WAIT_POLL: Duration = Duration::from_millis(20);
/// 视频输出在解码器参考帧之外额外需要的缓冲数
const VIDEO_EXTRA_BUFFERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadRequest {
    None,
    Decoder,
    DecoderAndSink,
}

/// 预滚动：seek 之后丢弃目标时间点之前的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preroll {
    Off,
    /// 丢弃所有输出
    All,
    /// 丢弃时间戳早于该值的输出
    Until(Tick),
}

impl Preroll {
    fn update(&mut self, block: &Block) {
        let discontinuity = block.flags.contains(BlockFlags::DISCONTINUITY)
            && (block.data.is_empty() || block.flags.contains(BlockFlags::CORRUPTED));
        if block.flags.contains(BlockFlags::PREROLL) || discontinuity {
            *self = Preroll::All;
            return;
        }
        if let Some(ts) = block.dts.or(block.pts) {
            *self = match *self {
                Preroll::Off => Preroll::Off,
                Preroll::All => Preroll::Until(ts),
                Preroll::Until(end) => Preroll::Until(end.min(ts)),
            };
        }
    }

    fn rejects(&self, ts: Option<Tick>) -> bool {
        match (*self, ts) {
            (Preroll::Off, _) => false,
            (Preroll::All, _) => true,
            (Preroll::Until(end), Some(ts)) => ts < end,
            (Preroll::Until(_), None) => false,
        }
    }
}

/// FIFO 侧状态（由 fifo 锁保护）
struct FifoState {
    blocks: VecDeque<Block>,
    bytes: usize,
    flushing: bool,
    draining: bool,
    drained: bool,
    paused: bool,
    pause_date: Tick,
    /// 暂停时还允许输出的帧数（逐帧播放）
    frames_countdown: u32,
    idle: bool,
    busy: bool,
}

impl FifoState {
    fn clear(&mut self) {
        self.blocks.clear();
        self.bytes = 0;
    }
}

/// 解码 / 输出侧状态（由 state 锁保护）
struct OwnerState {
    waiting: bool,
    first: bool,
    has_data: bool,
    error: bool,
    preroll: Preroll,
    reload: ReloadRequest,
    ts_delay: Tick,
    fmt_out: Option<EsFormat>,
    fmt_changed: bool,
    video_sink: Option<Box<dyn VideoSink>>,
    audio_sink: Option<Box<dyn AudioSink>>,
    spu_sink: Option<Box<dyn SpuSink>>,
    cc_desc: CcDescriptor,
    cc_subs: BTreeMap<(CcCodec, u8), DecoderWorker>,
}

/// 解码线程与控制方共享的部分
/// 锁顺序：state → fifo，持有 fifo 时不得再获取 state
struct DecoderOwner {
    ctx: PipelineContext,
    fmt: EsFormat,
    category: EsCategory,
    clock: Option<ProgramClock>,

    fifo: Mutex<FifoState>,
    /// 唤醒解码线程
    wait_request: Condvar,
    /// 唤醒等待 FIFO 腾出空间的生产者
    wait_fifo: Condvar,

    state: Mutex<OwnerState>,
    /// 解码线程已拿到首个输出
    wait_acknowledge: Condvar,
    /// 解除输出阻塞（stop_wait / flush / 取消）
    wait_unblock: Condvar,

    cancelled: AtomicBool,
    /// flush 已请求但解码线程尚未处理，期间输出全部丢弃
    flush_pending: AtomicBool,
}

/// 每个选中轨道对应一个解码线程
///
/// 数据块经 FIFO 交给独立线程解码，解码输出按节目时钟换算成系统时间后交给输出设备。
/// 控制方法（flush / 暂停 / 等待等）可以在任意线程调用。
pub struct DecoderWorker {
    owner: Arc<DecoderOwner>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderWorker {
    /// 打开解码模块并启动解码线程
    ///
    /// 找不到合适的解码模块时发出一次用户可见的错误通知并返回 `UnsupportedCodec`
    pub fn new(ctx: &PipelineContext, fmt: &EsFormat, clock: Option<ProgramClock>) -> Result<Self> {
        let module = match ctx.modules.open_decoder(fmt) {
            Ok(module) => module,
            Err(e) => {
                error!("{} ❌ 无法打开 {} 解码模块: {}", log_ctx(), fmt.codec, e);
                ctx.events.send(InputEvent::UserError {
                    title: "不支持的编码".to_string(),
                    message: format!("没有可用的 {} 解码模块 ({})", fmt.codec, fmt.category),
                });
                return Err(PipelineError::UnsupportedCodec(fmt.codec.clone()));
            }
        };
        let packetizer = if fmt.packetized {
            None
        } else {
            ctx.modules.open_packetizer(fmt)?
        };
        let fmt_dec = packetizer
            .as_ref()
            .map(|p| p.output_format().clone())
            .unwrap_or_else(|| fmt.clone());

        let owner = Arc::new(DecoderOwner {
            ctx: ctx.clone(),
            fmt: fmt.clone(),
            category: fmt.category,
            clock,
            fifo: Mutex::new(FifoState {
                blocks: VecDeque::new(),
                bytes: 0,
                flushing: false,
                draining: false,
                drained: false,
                paused: false,
                pause_date: 0,
                frames_countdown: 0,
                idle: false,
                busy: false,
            }),
            wait_request: Condvar::new(),
            wait_fifo: Condvar::new(),
            state: Mutex::new(OwnerState {
                waiting: false,
                first: true,
                has_data: false,
                error: false,
                preroll: Preroll::Off,
                reload: ReloadRequest::None,
                ts_delay: 0,
                fmt_out: None,
                fmt_changed: false,
                video_sink: None,
                audio_sink: None,
                spu_sink: None,
                cc_desc: CcDescriptor::default(),
                cc_subs: BTreeMap::new(),
            }),
            wait_acknowledge: Condvar::new(),
            wait_unblock: Condvar::new(),
            cancelled: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
        });

        let runtime = DecoderRuntime {
            owner: owner.clone(),
            module: Some(module),
            packetizer,
            fmt_dec,
        };
        let thread = thread::Builder::new()
            .name(format!("dec-{}-{}", fmt.category, fmt.id))
            .spawn(move || runtime.run())?;

        info!(
            "{} 🎬 创建解码线程: {} ({}, es={})",
            log_ctx(),
            fmt.codec,
            fmt.category,
            fmt.id
        );
        Ok(Self {
            owner,
            thread: Some(thread),
        })
    }

    pub fn category(&self) -> EsCategory {
        self.owner.category
    }

    /// 投递一个数据块
    ///
    /// pace 为 true 时在 FIFO 达到水位线后阻塞（缓冲等待期间除外）；
    /// 否则 FIFO 超过字节上限时整体丢弃，并给新块打上不连续标记
    pub fn decode(&self, mut block: Block, pace: bool) {
        let config = &self.owner.ctx.config;
        let waiting = self.owner.state.lock().waiting;

        let mut fifo = self.owner.fifo.lock();
        if !pace {
            if fifo.bytes > config.fifo_max_bytes {
                warn!(
                    "{} ⚠ {} 解码 FIFO 过大 ({} 字节)，重置",
                    log_ctx(),
                    self.owner.category,
                    fifo.bytes
                );
                fifo.clear();
                block.flags.insert(BlockFlags::DISCONTINUITY);
            }
        } else if !waiting {
            while fifo.blocks.len() >= config.pace_watermark
                && !self.owner.cancelled.load(Ordering::Acquire)
            {
                self.owner.wait_fifo.wait(&mut fifo);
            }
        }

        fifo.bytes += block.size();
        fifo.blocks.push_back(block);
        fifo.drained = false;
        self.owner.wait_request.notify_all();
    }

    /// 丢弃所有排队和缓存的数据
    pub fn flush(&self) {
        {
            let mut fifo = self.owner.fifo.lock();
            fifo.clear();
            fifo.flushing = true;
            self.owner.flush_pending.store(true, Ordering::Release);

            // 暂停时 flush 后允许输出一帧，刷新静止画面
            let still = matches!(self.owner.category, EsCategory::Video | EsCategory::Subtitle);
            if fifo.paused && still && fifo.frames_countdown == 0 {
                fifo.frames_countdown += 1;
            }
            self.owner.wait_request.notify_all();
        }
        let _st = self.owner.state.lock();
        self.owner.wait_unblock.notify_all();
    }

    /// 处理完剩余数据后排空解码模块和输出
    pub fn drain(&self) {
        let mut fifo = self.owner.fifo.lock();
        fifo.draining = true;
        self.owner.wait_request.notify_all();
    }

    pub fn change_pause(&self, paused: bool, date: Tick) {
        {
            let mut fifo = self.owner.fifo.lock();
            fifo.paused = paused;
            fifo.pause_date = date;
            fifo.frames_countdown = 0;
            self.owner.wait_request.notify_all();
        }
        let st = self.owner.state.lock();
        for sub in st.cc_subs.values() {
            sub.change_pause(paused, date);
        }
    }

    /// 音频 / 字幕的时间戳偏移
    pub fn change_delay(&self, delay: Tick) {
        self.owner.state.lock().ts_delay = delay;
    }

    /// 进入缓冲等待：首个输出之后阻塞，直到 stop_wait
    pub fn start_wait(&self) {
        let mut st = self.owner.state.lock();
        st.first = true;
        st.has_data = false;
        st.waiting = true;
        for sub in st.cc_subs.values() {
            sub.start_wait();
        }
        drop(st);
        self.owner.wait_request.notify_all();
    }

    pub fn stop_wait(&self) {
        let mut st = self.owner.state.lock();
        st.waiting = false;
        for sub in st.cc_subs.values() {
            sub.stop_wait();
        }
        self.owner.wait_unblock.notify_all();
    }

    /// 阻塞直到解码线程产出首个输出（暂停或空闲时提前返回）
    pub fn wait(&self) {
        let mut st = self.owner.state.lock();
        while !st.has_data {
            if self.owner.cancelled.load(Ordering::Acquire) {
                break;
            }
            {
                let fifo = self.owner.fifo.lock();
                if fifo.paused {
                    break;
                }
                if fifo.idle && fifo.blocks.is_empty() && !fifo.flushing {
                    warn!("{} ⚠ {} 解码线程空闲且无数据，避免缓冲死锁", log_ctx(), self.owner.category);
                    break;
                }
            }
            self.owner.wait_acknowledge.wait_for(&mut st, WAIT_POLL);
        }
    }

    /// 暂停时前进一帧，返回该帧时长（仅视频有效）
    pub fn frame_next(&self) -> Option<Tick> {
        {
            let mut fifo = self.owner.fifo.lock();
            fifo.frames_countdown += 1;
            self.owner.wait_request.notify_all();
        }
        let mut st = self.owner.state.lock();
        if self.owner.category == EsCategory::Video {
            st.video_sink.as_mut().and_then(|s| s.next_picture())
        } else {
            None
        }
    }

    /// FIFO 中排队的字节数
    pub fn fifo_size(&self) -> usize {
        self.owner.fifo.lock().bytes
    }

    /// FIFO 为空、没有正在处理的数据且输出已播完
    pub fn is_empty(&self) -> bool {
        {
            let fifo = self.owner.fifo.lock();
            if !fifo.blocks.is_empty() || fifo.draining || fifo.busy || fifo.flushing {
                return false;
            }
        }
        let st = self.owner.state.lock();
        match self.owner.category {
            EsCategory::Video => st.video_sink.as_ref().map_or(true, |s| s.is_empty()),
            _ => true,
        }
    }

    /// 最近一次 drain 是否已完成
    pub fn is_drained(&self) -> bool {
        self.owner.fifo.lock().drained
    }

    pub fn has_error(&self) -> bool {
        self.owner.state.lock().error
    }

    /// 取出输出格式变化（每次变化只报告一次）
    pub fn take_format_change(&self) -> Option<EsFormat> {
        let mut st = self.owner.state.lock();
        if !st.fmt_changed {
            return None;
        }
        st.fmt_changed = false;
        st.fmt_out.clone()
    }

    pub fn cc_desc(&self) -> CcDescriptor {
        self.owner.state.lock().cc_desc.clone()
    }

    /// 打开 / 关闭一个 CC 通道的子解码线程
    pub fn set_cc_state(&self, codec: CcCodec, channel: u8, enable: bool) -> Result<()> {
        let mut st = self.owner.state.lock();
        let key = (codec, channel);
        if enable {
            if st.cc_desc.codec != Some(codec) || !st.cc_desc.channels.contains(&channel) {
                return Err(PipelineError::InvalidArgument(format!(
                    "CC 通道 {} #{} 不存在",
                    codec.as_str(),
                    channel
                )));
            }
            if st.cc_subs.contains_key(&key) {
                return Ok(());
            }
            let mut fmt = EsFormat::new(EsCategory::Subtitle, codec.as_str())
                .with_group(self.owner.fmt.group)
                .with_id(self.owner.fmt.id);
            fmt.subtitle.cc = Some(key);
            let sub = DecoderWorker::new(&self.owner.ctx, &fmt, self.owner.clock.clone())?;
            if st.waiting {
                sub.start_wait();
            }
            debug!("{} 📝 开启 CC 通道 {} #{}", log_ctx(), codec.as_str(), channel);
            st.cc_subs.insert(key, sub);
        } else {
            let removed = st.cc_subs.remove(&key);
            drop(st);
            if let Some(sub) = removed {
                debug!("{} 📝 关闭 CC 通道 {} #{}", log_ctx(), codec.as_str(), channel);
                sub.delete();
            }
        }
        Ok(())
    }

    pub fn cc_state(&self, codec: CcCodec, channel: u8) -> bool {
        self.owner.state.lock().cc_subs.contains_key(&(codec, channel))
    }

    /// 当前持有的 (视频, 音频) 输出设备描述
    pub fn sinks(&self) -> (Option<String>, Option<String>) {
        let st = self.owner.state.lock();
        (
            st.video_sink.as_ref().map(|s| s.description()),
            st.audio_sink.as_ref().map(|s| s.description()),
        )
    }

    /// 停止解码线程，归还输出设备并关闭 CC 通道
    pub fn delete(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        debug!("{} 🛑 停止 {} 解码线程", log_ctx(), self.owner.category);
        self.owner.cancelled.store(true, Ordering::Release);
        {
            let mut fifo = self.owner.fifo.lock();
            fifo.clear();
            fifo.flushing = true;
            self.owner.wait_request.notify_all();
            self.owner.wait_fifo.notify_all();
        }
        {
            let mut st = self.owner.state.lock();
            st.waiting = false;
            self.owner.wait_unblock.notify_all();
            self.owner.wait_acknowledge.notify_all();
        }
        if handle.join().is_err() {
            error!("{} ❌ 解码线程异常退出", log_ctx());
        }

        let subs = {
            let mut st = self.owner.state.lock();
            self.owner.release_sinks(&mut st);
            std::mem::take(&mut st.cc_subs)
        };
        for sub in subs.into_values() {
            sub.delete();
        }
    }

    #[cfg(test)]
    fn queued_flags(&self) -> Vec<BlockFlags> {
        self.owner.fifo.lock().blocks.iter().map(|b| b.flags).collect()
    }
}

impl Drop for DecoderWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DecoderOwner {
    fn has_sink(&self, st: &OwnerState) -> bool {
        match self.category {
            EsCategory::Video => st.video_sink.is_some(),
            EsCategory::Audio => st.audio_sink.is_some(),
            EsCategory::Subtitle => st.spu_sink.is_some(),
        }
    }

    /// 从设备池借用输出设备，失败时按配置间隔重试
    fn acquire_sink(&self, st: &mut MutexGuard<'_, OwnerState>, fmt: &EsFormat) -> bool {
        if self.has_sink(st) {
            return true;
        }
        let config = &self.ctx.config;
        let attempts = config.sink_request_attempts.max(1);
        let retry = Duration::from_micros(config.sink_request_retry.max(0) as u64);

        for attempt in 0..attempts {
            if self.cancelled.load(Ordering::Acquire) {
                return false;
            }
            let sinks = &self.ctx.sinks;
            let description = match self.category {
                EsCategory::Video => {
                    let buffers = fmt.video.dpb_size as usize + VIDEO_EXTRA_BUFFERS;
                    st.video_sink = sinks.request_video_sink(fmt, buffers);
                    st.video_sink.as_ref().map(|s| s.description())
                }
                EsCategory::Audio => {
                    st.audio_sink = sinks.request_audio_sink(fmt);
                    st.audio_sink.as_ref().map(|s| s.description())
                }
                EsCategory::Subtitle => {
                    st.spu_sink = sinks.request_spu_sink(fmt);
                    st.spu_sink.as_ref().map(|s| s.description())
                }
            };
            if let Some(description) = description {
                info!("{} 🔌 {} 获取输出设备: {}", log_ctx(), self.category, description);
                return true;
            }
            if attempt + 1 < attempts {
                debug!("{} ⏳ {} 输出设备暂不可用，稍后重试", log_ctx(), self.category);
                MutexGuard::unlocked(st, || thread::sleep(retry));
            }
        }
        warn!("{} ⚠ 无法获取 {} 输出设备，放弃", log_ctx(), self.category);
        false
    }

    /// 归还输出设备到设备池（不销毁，以便复用）
    fn release_sinks(&self, st: &mut OwnerState) {
        let sinks = &self.ctx.sinks;
        if let Some(mut sink) = st.video_sink.take() {
            sink.flush();
            sinks.release_video_sink(sink);
        }
        if let Some(mut sink) = st.audio_sink.take() {
            sink.flush();
            sinks.release_audio_sink(sink);
        }
        if let Some(mut sink) = st.spu_sink.take() {
            sink.flush();
            sinks.release_spu_sink(sink);
        }
    }

    fn flush_sinks(&self, st: &mut OwnerState) {
        if let Some(sink) = st.video_sink.as_mut() {
            sink.flush();
        }
        if let Some(sink) = st.audio_sink.as_mut() {
            sink.flush();
        }
        if let Some(sink) = st.spu_sink.as_mut() {
            sink.flush();
        }
    }

    fn request_reload(&self, st: &mut OwnerState, request: ReloadRequest) {
        if request == ReloadRequest::DecoderAndSink || st.reload == ReloadRequest::None {
            st.reload = request;
        }
    }

    fn update_format(&self, fmt: &EsFormat) -> Result<()> {
        let mut st = self.state.lock();
        let changed = st.fmt_out.as_ref().map_or(true, |old| !old.is_similar(fmt));
        if changed {
            if st.fmt_out.is_some() {
                info!("{} 🔄 {} 输出格式变化，更换输出设备", log_ctx(), self.category);
                self.release_sinks(&mut st);
            }
            st.fmt_out = Some(fmt.clone());
            st.fmt_changed = true;
        }
        if self.acquire_sink(&mut st, fmt) {
            Ok(())
        } else {
            Err(PipelineError::SinkUnavailable(format!("{} ({})", fmt.codec, self.category)))
        }
    }

    /// 视频时间戳超前上限，跟随节目时钟当前的 pts_delay
    fn bogus_video_delay(&self) -> Tick {
        let pts_delay = self
            .clock
            .as_ref()
            .map_or(self.ctx.config.pts_delay, |clock| clock.pts_delay());
        self.ctx.config.bogus_video_delay(pts_delay)
    }

    /// 流时间 → 系统时间；没有时钟时原样返回
    fn fix_ts(&self, ts: Option<Tick>, delay: Tick, bound: Option<Tick>) -> Option<Tick> {
        let ts = ts? + delay;
        match &self.clock {
            Some(clock) => clock.convert_ts(ts, bound).ok(),
            None => Some(ts),
        }
    }

    /// 输出阻塞：缓冲等待期间，拿到首个输出后停在这里直到 stop_wait
    fn wait_unblock(&self, st: &mut MutexGuard<'_, OwnerState>) {
        while st.waiting && st.has_data {
            if self.cancelled.load(Ordering::Acquire) || self.flush_pending.load(Ordering::Acquire) {
                break;
            }
            self.wait_unblock.wait_for(st, WAIT_POLL);
        }
    }

    /// 等待到 deadline；期间被 flush / 等待 / 取消打断时返回 true（输出应丢弃）
    fn wait_date(&self, st: &mut MutexGuard<'_, OwnerState>, deadline: Tick) -> bool {
        let deadline = deadline_instant(deadline);
        loop {
            if self.cancelled.load(Ordering::Acquire)
                || self.flush_pending.load(Ordering::Acquire)
                || st.waiting
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let until = deadline.min(now + WAIT_POLL);
            self.wait_unblock.wait_until(st, until);
        }
    }

    /// 把一个解码单元交给输出设备
    fn play(&self, mut unit: DecodedUnit) {
        let category = self.category;
        let stats = &self.ctx.stats;
        if self.flush_pending.load(Ordering::Acquire) {
            trace!("{} flush 进行中，丢弃 {} 输出", log_ctx(), category);
            return;
        }

        let mut st = self.state.lock();

        // ========== 预滚动 ==========
        let rejected = match category {
            EsCategory::Subtitle => {
                st.preroll.rejects(unit.pts) && (unit.stop.is_none() || st.preroll.rejects(unit.stop))
            }
            _ => st.preroll.rejects(unit.pts),
        };
        if rejected {
            trace!("{} ⏩ 预滚动丢弃 {} pts={:?}", log_ctx(), category, unit.pts);
            return;
        }
        if st.preroll != Preroll::Off {
            debug!("{} ⏩ {} 预滚动结束 pts={:?}", log_ctx(), category, unit.pts);
            st.preroll = Preroll::Off;
            self.flush_sinks(&mut st);
        }

        // ========== 缓冲等待 ==========
        if st.waiting {
            st.has_data = true;
            self.wait_acknowledge.notify_all();
        }
        self.wait_unblock(&mut st);
        if self.cancelled.load(Ordering::Acquire) || self.flush_pending.load(Ordering::Acquire) {
            return;
        }
        if st.first {
            debug!("{} ▶ {} 缓冲结束后的首个输出 pts={:?}", log_ctx(), category, unit.pts);
            st.first = false;
        }

        // ========== 时间戳换算 ==========
        let (delay, bound) = match category {
            EsCategory::Video => (0, Some(self.bogus_video_delay())),
            _ => (st.ts_delay, None),
        };
        let Some(date) = self.fix_ts(unit.pts, delay, bound) else {
            warn!("{} ⚠ {} 输出时间戳无效，丢弃 pts={:?}", log_ctx(), category, unit.pts);
            stats.add_lost(category);
            return;
        };
        unit.date = date;
        if let Some(stop) = unit.stop {
            unit.stop = self.fix_ts(Some(stop), delay, None);
        }

        if category == EsCategory::Subtitle && self.wait_date(&mut st, date - SPU_MAX_PREPARE_TIME) {
            debug!("{} 字幕等待被打断，丢弃", log_ctx());
            return;
        }

        {
            let mut fifo = self.fifo.lock();
            if fifo.paused && fifo.frames_countdown > 0 {
                fifo.frames_countdown -= 1;
            }
        }

        // ========== 输出 ==========
        if !self.has_sink(&st) {
            let fmt = st.fmt_out.clone().unwrap_or_else(|| self.fmt.clone());
            if !self.acquire_sink(&mut st, &fmt) {
                stats.add_lost(category);
                return;
            }
        }
        let status = match category {
            EsCategory::Video => st.video_sink.as_mut().map(|s| s.display(unit)),
            EsCategory::Audio => st.audio_sink.as_mut().map(|s| s.play(unit)),
            EsCategory::Subtitle => st.spu_sink.as_mut().map(|s| s.display(unit)),
        };
        match status {
            Some(SinkStatus::Accepted) => stats.add_displayed(category),
            Some(SinkStatus::FormatChanged) => {
                warn!("{} ⚠ {} 输出要求重新协商格式，重载解码模块", log_ctx(), category);
                self.request_reload(&mut st, ReloadRequest::Decoder);
                stats.add_displayed(category);
            }
            Some(SinkStatus::Failed) => {
                warn!("{} ⚠ {} 输出设备失效，重建解码模块和设备", log_ctx(), category);
                self.request_reload(&mut st, ReloadRequest::DecoderAndSink);
                stats.add_lost(category);
            }
            None => stats.add_lost(category),
        }
    }

    /// 把 CC 数据分发给已打开的通道
    fn queue_cc(&self, block: Block, desc: CcDescriptor) {
        let mut st = self.state.lock();
        if st.cc_desc != desc {
            debug!(
                "{} 📝 检测到 CC: {:?} 通道 {:?}",
                log_ctx(),
                desc.codec.map(|c| c.as_str()),
                desc.channels
            );
            st.cc_desc = desc;
        }
        let codec = st.cc_desc.codec;
        for ((sub_codec, _), sub) in st.cc_subs.iter() {
            if Some(*sub_codec) == codec {
                sub.decode(block.clone(), false);
            }
        }
    }

    fn output_change_pause(&self, paused: bool, date: Tick) {
        let mut st = self.state.lock();
        if let Some(sink) = st.video_sink.as_mut() {
            sink.change_pause(paused, date);
        }
        if let Some(sink) = st.audio_sink.as_mut() {
            sink.change_pause(paused, date);
        }
    }
}

/// 解码模块的输出回调
struct OutputBridge<'a> {
    owner: &'a DecoderOwner,
}

impl DecoderOutput for OutputBridge<'_> {
    fn update_format(&mut self, fmt: &EsFormat) -> Result<()> {
        self.owner.update_format(fmt)
    }

    fn queue(&mut self, unit: DecodedUnit) {
        self.owner.ctx.stats.add_decoded(unit.category);
        self.owner.play(unit);
    }

    fn queue_cc(&mut self, block: Block, desc: CcDescriptor) {
        self.owner.queue_cc(block, desc);
    }
}

/// 只在解码线程内部使用的部分
struct DecoderRuntime {
    owner: Arc<DecoderOwner>,
    module: Option<Box<dyn DecoderModule>>,
    packetizer: Option<Box<dyn Packetizer>>,
    /// 解码模块当前使用的输入格式
    fmt_dec: EsFormat,
}

impl DecoderRuntime {
    fn run(mut self) {
        info!("{} 🎬 解码线程启动: {}", log_ctx(), self.owner.fmt.codec);
        let owner = self.owner.clone();
        let mut fifo = owner.fifo.lock();
        let mut output_paused = false;
        let mut processed: u64 = 0;

        loop {
            if owner.cancelled.load(Ordering::Acquire) {
                break;
            }

            if fifo.flushing {
                MutexGuard::unlocked(&mut fifo, || self.process_flush());
                fifo.flushing = false;
                owner.flush_pending.store(false, Ordering::Release);
                continue;
            }

            if fifo.paused != output_paused {
                let (paused, date) = (fifo.paused, fifo.pause_date);
                output_paused = paused;
                MutexGuard::unlocked(&mut fifo, || owner.output_change_pause(paused, date));
                continue;
            }

            if fifo.paused && fifo.frames_countdown == 0 {
                fifo.idle = true;
                owner.wait_request.wait(&mut fifo);
                fifo.idle = false;
                continue;
            }

            match fifo.blocks.pop_front() {
                Some(block) => {
                    fifo.bytes = fifo.bytes.saturating_sub(block.size());
                    fifo.busy = true;
                    owner.wait_fifo.notify_all();
                    MutexGuard::unlocked(&mut fifo, || self.process(Some(block)));
                    fifo.busy = false;
                    processed += 1;
                }
                None if fifo.draining => {
                    fifo.draining = false;
                    fifo.busy = true;
                    MutexGuard::unlocked(&mut fifo, || {
                        self.process(None);
                        self.drain_output();
                    });
                    fifo.busy = false;
                    fifo.drained = true;
                    debug!("{} 🏁 {} 解码已排空", log_ctx(), owner.category);
                }
                None => {
                    fifo.idle = true;
                    owner.wait_request.wait(&mut fifo);
                    fifo.idle = false;
                }
            }
        }
        drop(fifo);

        self.packetizer = None;
        self.module = None;
        info!(
            "{} 🛑 解码线程退出: {} (共处理 {} 个数据块)",
            log_ctx(),
            owner.fmt.codec,
            processed
        );
    }

    fn process(&mut self, block: Option<Block>) {
        let reload = {
            let mut st = self.owner.state.lock();
            if st.error {
                return;
            }
            if let Some(block) = &block {
                st.preroll.update(block);
            }
            std::mem::replace(&mut st.reload, ReloadRequest::None)
        };
        if reload != ReloadRequest::None {
            let fmt = self.fmt_dec.clone();
            if !self.reload(&fmt, reload) {
                return;
            }
        }

        let reloaded = block
            .as_ref()
            .map_or(false, |b| b.flags.contains(BlockFlags::RELOADED));
        if self.packetizer.is_none() || reloaded {
            self.decode_block(block);
            return;
        }

        let drain = block.is_none();
        let (packets, new_fmt) = match self.packetizer.as_mut() {
            Some(packetizer) => {
                let packets = packetizer.packetize(block);
                let fmt = packetizer.output_format();
                let new_fmt = (!fmt.is_similar(&self.fmt_dec)).then(|| fmt.clone());
                (packets, new_fmt)
            }
            None => return,
        };
        if let Some(fmt) = new_fmt {
            info!("{} 🔄 码流参数变化，重新打开解码模块", log_ctx());
            self.decode_block(None);
            if !self.reload(&fmt, ReloadRequest::Decoder) {
                return;
            }
        }
        for packet in packets {
            self.decode_block(Some(packet));
        }
        if drain {
            self.decode_block(None);
        }
    }

    fn decode_block(&mut self, block: Option<Block>) {
        let Some(module) = self.module.as_mut() else {
            return;
        };
        let mut bridge = OutputBridge { owner: &self.owner };
        let status = module.decode(block.as_ref(), &mut bridge);

        match status {
            DecodeStatus::Success => {}
            DecodeStatus::Critical => {
                error!("{} ❌ {} 解码模块出现不可恢复错误，停止解码", log_ctx(), self.owner.category);
                self.owner.state.lock().error = true;
            }
            DecodeStatus::Reload => {
                {
                    let mut st = self.owner.state.lock();
                    self.owner.request_reload(&mut st, ReloadRequest::Decoder);
                }
                match block {
                    Some(mut block) if !block.flags.contains(BlockFlags::RELOADED) => {
                        block.flags.insert(BlockFlags::RELOADED);
                        self.process(Some(block));
                    }
                    Some(_) => {
                        warn!("{} ⚠ 重载后解码模块再次要求重载，丢弃数据块", log_ctx());
                    }
                    None => {}
                }
            }
        }
    }

    /// 重新打开解码模块；DecoderAndSink 时先归还输出设备
    fn reload(&mut self, fmt: &EsFormat, request: ReloadRequest) -> bool {
        info!("{} 🔁 重新加载 {} 解码模块 ({:?})", log_ctx(), fmt.codec, request);
        if request == ReloadRequest::DecoderAndSink {
            let mut st = self.owner.state.lock();
            self.owner.release_sinks(&mut st);
        }
        self.module = None;
        match self.owner.ctx.modules.open_decoder(fmt) {
            Ok(module) => {
                self.module = Some(module);
                self.fmt_dec = fmt.clone();
                true
            }
            Err(e) => {
                error!("{} ❌ 重新打开解码模块失败: {}", log_ctx(), e);
                self.owner.state.lock().error = true;
                false
            }
        }
    }

    fn process_flush(&mut self) {
        debug!("{} 🧹 {} 解码线程处理 flush", log_ctx(), self.owner.category);
        if let Some(packetizer) = self.packetizer.as_mut() {
            packetizer.flush();
        }
        if let Some(module) = self.module.as_mut() {
            module.flush();
        }
        let mut st = self.owner.state.lock();
        st.preroll = Preroll::Off;
        if st.waiting {
            st.has_data = false;
        }
        self.owner.flush_sinks(&mut st);
        for sub in st.cc_subs.values() {
            sub.flush();
        }
    }

    fn drain_output(&mut self) {
        let mut st = self.owner.state.lock();
        if let Some(sink) = st.audio_sink.as_mut() {
            sink.drain();
        }
        for sub in st.cc_subs.values() {
            sub.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{mdate, ms, PipelineConfig};
    use crate::player::modules::{ModuleFactory, SinkPool};
    use crate::player::synthetic::{RawModuleFactory, RecordingSinkPool, SinkEvent, CC608_MARKER};
    use crossbeam_channel::Receiver;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn setup(
        config: PipelineConfig,
        modules: Arc<dyn ModuleFactory>,
    ) -> (PipelineContext, Arc<RecordingSinkPool>, Receiver<InputEvent>) {
        let pool = RecordingSinkPool::new();
        let sinks: Arc<dyn SinkPool> = pool.clone();
        let (ctx, rx) = PipelineContext::new(config, modules, sinks);
        (ctx, pool, rx)
    }

    fn raw_setup() -> (PipelineContext, Arc<RecordingSinkPool>, Receiver<InputEvent>) {
        setup(PipelineConfig::default(), Arc::new(RawModuleFactory::new()))
    }

    fn block(pts: Tick) -> Block {
        Block::new(vec![0u8; 16]).with_pts(pts).with_dts(pts).with_length(ms(40))
    }

    fn delivered_pts(pool: &RecordingSinkPool) -> Vec<Option<Tick>> {
        pool.delivered().iter().map(|d| d.unit.pts).collect()
    }

    /// 按脚本返回解码结果的模块，记录收到的数据块标记
    struct ScriptedFactory {
        opens: AtomicUsize,
        script: Vec<DecodeStatus>,
        seen: Arc<Mutex<Vec<BlockFlags>>>,
    }

    struct ScriptedDecoder {
        fmt: EsFormat,
        script: Vec<DecodeStatus>,
        seen: Arc<Mutex<Vec<BlockFlags>>>,
    }

    impl DecoderModule for ScriptedDecoder {
        fn decode(&mut self, block: Option<&Block>, out: &mut dyn DecoderOutput) -> DecodeStatus {
            let Some(block) = block else {
                return DecodeStatus::Success;
            };
            let _ = out.update_format(&self.fmt);
            let index = {
                let mut seen = self.seen.lock();
                seen.push(block.flags);
                seen.len() - 1
            };
            let status = self.script.get(index).copied().unwrap_or(DecodeStatus::Success);
            if status == DecodeStatus::Success {
                out.queue(DecodedUnit::new(self.fmt.category, block.pts, block.length, Vec::new()));
            }
            status
        }

        fn flush(&mut self) {}

        fn name(&self) -> &str {
            "scripted"
        }
    }

    impl ModuleFactory for ScriptedFactory {
        fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedDecoder {
                fmt: fmt.clone(),
                script: self.script.clone(),
                seen: self.seen.clone(),
            }))
        }

        fn open_packetizer(&self, _fmt: &EsFormat) -> Result<Option<Box<dyn Packetizer>>> {
            Ok(None)
        }
    }

    fn scripted(script: Vec<DecodeStatus>) -> Arc<ScriptedFactory> {
        Arc::new(ScriptedFactory {
            opens: AtomicUsize::new(0),
            script,
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    #[test]
    fn test_units_reach_sink_in_order() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();
        for i in 0..5 {
            worker.decode(block(ms(i * 20)), false);
        }
        assert!(wait_until(|| pool.delivered().len() == 5));
        let expected: Vec<_> = (0..5).map(|i| Some(ms(i * 20))).collect();
        assert_eq!(delivered_pts(&pool), expected);
        // 没有时钟时日期等于时间戳
        assert_eq!(pool.delivered()[1].unit.date, ms(20));
        assert!(wait_until(|| worker.is_empty()));
    }

    #[test]
    fn test_preroll_drops_units_before_target() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Video, "raw-video");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.decode(block(0).with_flags(BlockFlags::PREROLL), false);
        worker.decode(block(ms(40)).with_flags(BlockFlags::PREROLL), false);
        worker.decode(block(ms(80)), false);

        assert!(wait_until(|| pool.delivered().len() == 1));
        assert!(wait_until(|| worker.is_empty()));
        assert_eq!(delivered_pts(&pool), vec![Some(ms(80))]);
        assert!(pool.events().iter().any(|e| matches!(e, SinkEvent::Flush(_))));
    }

    #[test]
    fn test_flush_discards_queued_blocks() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.change_pause(true, mdate());
        for i in 0..4 {
            worker.decode(block(ms(i * 20)), false);
        }
        assert_eq!(worker.fifo_size(), 64);
        worker.flush();
        assert_eq!(worker.fifo_size(), 0);

        worker.change_pause(false, mdate());
        worker.decode(block(ms(500)), false);
        assert!(wait_until(|| pool.delivered().len() == 1));
        assert_eq!(delivered_pts(&pool), vec![Some(ms(500))]);
    }

    #[test]
    fn test_fifo_ceiling_resets_with_discontinuity() {
        let config = PipelineConfig {
            fifo_max_bytes: 100,
            ..PipelineConfig::default()
        };
        let (ctx, _pool, _rx) = setup(config, Arc::new(RawModuleFactory::new()));
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.change_pause(true, mdate());
        for i in 0..3 {
            worker.decode(Block::new(vec![0u8; 60]).with_pts(ms(i * 20)), false);
        }
        assert_eq!(worker.fifo_size(), 60);
        assert_eq!(worker.queued_flags(), vec![BlockFlags::DISCONTINUITY]);
    }

    #[test]
    fn test_reload_redelivers_block_once() {
        let factory = scripted(vec![DecodeStatus::Reload, DecodeStatus::Reload]);
        let (ctx, pool, _rx) = setup(PipelineConfig::default(), factory.clone());
        let fmt = EsFormat::new(EsCategory::Audio, "pcm");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.decode(block(0), false);
        assert!(wait_until(|| factory.seen.lock().len() == 2));
        assert!(wait_until(|| worker.is_empty()));

        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(*factory.seen.lock(), vec![BlockFlags::NONE, BlockFlags::RELOADED]);
        assert!(pool.delivered().is_empty());
    }

    #[test]
    fn test_reload_then_success_delivers() {
        let factory = scripted(vec![DecodeStatus::Reload]);
        let (ctx, pool, _rx) = setup(PipelineConfig::default(), factory.clone());
        let fmt = EsFormat::new(EsCategory::Audio, "pcm");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.decode(block(ms(10)), false);
        assert!(wait_until(|| pool.delivered().len() == 1));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert!(!worker.has_error());
    }

    #[test]
    fn test_critical_error_stops_decoding() {
        let factory = scripted(vec![DecodeStatus::Critical]);
        let (ctx, pool, _rx) = setup(PipelineConfig::default(), factory.clone());
        let fmt = EsFormat::new(EsCategory::Audio, "pcm");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.decode(block(0), false);
        assert!(wait_until(|| worker.has_error()));
        worker.decode(block(ms(20)), false);
        assert!(wait_until(|| worker.is_empty()));
        assert_eq!(factory.seen.lock().len(), 1);
        assert!(pool.delivered().is_empty());
    }

    #[test]
    fn test_waiting_holds_output_until_released() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Video, "raw-video");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.start_wait();
        worker.decode(block(0), false);
        worker.decode(block(ms(40)), false);
        worker.wait();
        thread::sleep(Duration::from_millis(30));
        assert!(pool.delivered().is_empty());

        worker.stop_wait();
        assert!(wait_until(|| pool.delivered().len() == 2));
    }

    #[test]
    fn test_wait_returns_when_idle_without_data() {
        let (ctx, _pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();
        worker.start_wait();
        let started = Instant::now();
        worker.wait();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_pause_and_frame_next() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Video, "raw-video");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.change_pause(true, mdate());
        for i in 0..3 {
            worker.decode(block(ms(i * 40)), false);
        }
        thread::sleep(Duration::from_millis(30));
        assert!(pool.delivered().is_empty());

        worker.frame_next();
        assert!(wait_until(|| pool.delivered().len() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.delivered().len(), 1);

        worker.change_pause(false, mdate());
        assert!(wait_until(|| pool.delivered().len() == 3));
    }

    #[test]
    fn test_resume_never_replays_before_pause_date() {
        let (ctx, pool, _rx) = raw_setup();
        let clock = ProgramClock::new(0, 1.0);
        clock.update(0, mdate());
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, Some(clock.clone())).unwrap();

        let pause_date = mdate();
        clock.change_pause(true, pause_date);
        worker.change_pause(true, pause_date);
        worker.decode(block(ms(10)), false);
        worker.decode(block(ms(20)), false);
        thread::sleep(Duration::from_millis(50));

        let resume_date = mdate();
        clock.change_pause(false, resume_date);
        worker.change_pause(false, resume_date);
        assert!(wait_until(|| pool.delivered().len() == 2));
        assert!(pool.delivered().iter().all(|d| d.unit.date >= pause_date));
    }

    #[test]
    fn test_video_bound_follows_clock_pts_delay() {
        let (ctx, pool, _rx) = raw_setup();
        let clock = ProgramClock::new(ms(10), 1.0);
        clock.update(0, mdate());
        let fmt = EsFormat::new(EsCategory::Video, "raw-video");
        let worker = DecoderWorker::new(&ctx, &fmt, Some(clock.clone())).unwrap();

        // 上限 = 30 * 10ms，2 秒后的画面非法
        worker.decode(block(0), false);
        worker.decode(block(ms(2_000)), false);
        assert!(wait_until(|| worker.is_empty()));
        assert_eq!(delivered_pts(&pool), vec![Some(0)]);

        // pts_delay 调大后上限随之放宽
        clock.set_jitter(ms(100));
        worker.decode(block(ms(2_000)), false);
        assert!(wait_until(|| pool.delivered().len() == 2));
    }

    #[test]
    fn test_sink_failure_reloads_decoder_and_sink() {
        let factory = Arc::new(RawModuleFactory::new());
        let (ctx, pool, _rx) = setup(PipelineConfig::default(), factory.clone());
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        pool.fail_next(1);
        worker.decode(block(0), false);
        assert!(wait_until(|| worker.is_empty()));
        worker.decode(block(ms(20)), false);
        assert!(wait_until(|| pool.delivered().len() == 1));

        assert_eq!(factory.opened(), 2);
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.requested(), 2);
    }

    #[test]
    fn test_unsupported_codec_notifies_once() {
        let factory = Arc::new(RawModuleFactory::new().with_unsupported("mystery"));
        let (ctx, _pool, rx) = setup(PipelineConfig::default(), factory);
        let fmt = EsFormat::new(EsCategory::Video, "mystery");

        let result = DecoderWorker::new(&ctx, &fmt, None);
        assert!(matches!(result, Err(PipelineError::UnsupportedCodec(_))));
        let errors: Vec<_> = rx
            .try_iter()
            .filter(|e| matches!(e, InputEvent::UserError { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_drain_completes() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Audio, "raw-audio");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();
        worker.decode(block(0), false);
        worker.drain();
        assert!(wait_until(|| worker.is_drained() && worker.is_empty()));
        assert!(pool.events().iter().any(|e| matches!(e, SinkEvent::Drain(_))));
    }

    #[test]
    fn test_cc_channel_decodes_into_spu_sink() {
        let (ctx, pool, _rx) = raw_setup();
        let mut fmt = EsFormat::new(EsCategory::Video, "raw-video");
        fmt.extra = CC608_MARKER.to_vec();
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();

        worker.decode(block(0), false);
        assert!(wait_until(|| !worker.cc_desc().is_empty()));
        assert_eq!(worker.cc_desc().codec, Some(CcCodec::Cea608));
        assert!(worker.set_cc_state(CcCodec::Cea708, 0, true).is_err());

        worker.set_cc_state(CcCodec::Cea608, 0, true).unwrap();
        assert!(worker.cc_state(CcCodec::Cea608, 0));
        worker.decode(block(ms(40)), false);
        assert!(wait_until(|| !pool.delivered_for(EsCategory::Subtitle).is_empty()));

        worker.set_cc_state(CcCodec::Cea608, 0, false).unwrap();
        assert!(!worker.cc_state(CcCodec::Cea608, 0));
    }

    #[test]
    fn test_delete_returns_sinks_to_pool() {
        let (ctx, pool, _rx) = raw_setup();
        let fmt = EsFormat::new(EsCategory::Video, "raw-video");
        let worker = DecoderWorker::new(&ctx, &fmt, None).unwrap();
        worker.decode(block(0), false);
        assert!(wait_until(|| pool.delivered().len() == 1));
        assert!(worker.sinks().0.is_some());
        worker.delete();
        assert_eq!(pool.released(), 1);
    }
}
