use crate::core::{
    mdate, Block, BlockFlags, CcCodec, CcDescriptor, ClockState, EsCategory, EsFormat, EsId,
    GroupId, PipelineError, ProgramClock, Result, Tick, ES_PRIORITY_SELECTABLE_MIN, TICK_PER_SEC,
};
use crate::player::context::PipelineContext;
use crate::player::decoder::DecoderWorker;
use crate::player::events::InputEvent;
use crate::player::selection::{self, Candidate, TrackPrefs};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// pts_delay 的绝对上限
const PTS_DELAY_MAX: Tick = 60 * TICK_PER_SEC;

/// ES 输出模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsOutMode {
    /// 不选择任何轨道
    None,
    /// 选择所有轨道
    All,
    /// 按偏好自动选择
    Auto,
    /// 只选择指定节目中的轨道
    Partial,
    /// 输入结束，关闭所有解码线程
    End,
}

/// 同类别轨道能否同时选中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsPolicy {
    Exclusive,
    Simultaneous,
}

/// 节目指南条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpgEvent {
    pub start: i64,
    pub duration: Tick,
    pub name: String,
    pub description: String,
}

/// 节目（一组共享时钟的轨道）
struct Program {
    id: GroupId,
    es_count: usize,
    selected: bool,
    scrambled: bool,
    clock: ProgramClock,
    last_pcr: Option<Tick>,
    meta: BTreeMap<String, String>,
    epg: Vec<EpgEvent>,
}

#[derive(Default)]
struct EsCc {
    codec: Option<CcCodec>,
    channels: BTreeMap<u8, EsId>,
}

struct Es {
    id: EsId,
    fmt: EsFormat,
    group: GroupId,
    channel: i32,
    language: Option<String>,
    scrambled: bool,
    decoder: Option<DecoderWorker>,
    /// 解码模块不可用，不再尝试
    unsupported: bool,
    pts_level: Option<Tick>,
    cc: EsCc,
    /// CC 子轨道所属的视频轨道
    master: Option<EsId>,
}

impl Es {
    fn candidate(&self) -> Candidate<'_> {
        Candidate {
            id: self.id,
            channel: self.channel,
            language: self.language.as_deref(),
            priority: self.fmt.priority,
        }
    }

    fn category(&self) -> EsCategory {
        self.fmt.category
    }
}

/// 每个类别的选择偏好
struct CategoryProps {
    policy: EsPolicy,
    main_es: Option<EsId>,
    requested_id: Option<EsId>,
    requested_channel: Option<i32>,
    languages: Vec<String>,
    demux_default: Option<EsId>,
    autoselect: bool,
    count: i32,
    delay: Tick,
}

impl CategoryProps {
    fn new(policy: EsPolicy, autoselect: bool, requested_id: Option<EsId>, languages: Vec<String>) -> Self {
        Self {
            policy,
            main_es: None,
            requested_id,
            requested_channel: None,
            languages,
            demux_default: None,
            autoselect,
            count: 0,
            delay: 0,
        }
    }
}

struct EsOutSys {
    ctx: PipelineContext,
    interrupted: Arc<AtomicBool>,

    mode: EsOutMode,
    active: bool,
    programs: Vec<Program>,
    current: Option<GroupId>,
    group_forced: Option<GroupId>,
    partial_programs: Vec<GroupId>,
    es: Vec<Es>,
    next_id: EsId,
    props: [CategoryProps; 3],

    pts_delay: Tick,
    pts_jitter: Tick,
    rate: f32,
    paused: bool,
    pause_date: Tick,

    buffering: bool,
    preroll_end: Option<Tick>,
    prev_level: Option<i32>,
    extra_initial: Tick,
    extra_stream: Tick,
    extra_system: Tick,

    recording: bool,
    can_pace_control: bool,
    out_pace_control: bool,
    last_length: Option<Tick>,
}

/// ES 输出管理器
///
/// 维护节目表和轨道表，按选择策略创建 / 销毁解码线程，
/// 并在 seek 和启动时协调所有解码线程的缓冲过程。
/// 所有方法都可以跨线程调用，内部用一把锁串行化。
pub struct EsOut {
    sys: Mutex<EsOutSys>,
    interrupted: Arc<AtomicBool>,
}

impl EsOut {
    pub fn new(ctx: PipelineContext) -> Self {
        let config = ctx.config.clone();
        let interrupted = Arc::new(AtomicBool::new(false));
        let props = [
            CategoryProps::new(EsPolicy::Simultaneous, true, config.video_track_id, Vec::new()),
            CategoryProps::new(
                EsPolicy::Exclusive,
                true,
                config.audio_track_id,
                config.audio_languages.clone(),
            ),
            CategoryProps::new(
                EsPolicy::Exclusive,
                false,
                config.subtitle_track_id,
                config.subtitle_languages.clone(),
            ),
        ];
        let sys = EsOutSys {
            ctx,
            interrupted: interrupted.clone(),
            mode: EsOutMode::None,
            active: false,
            programs: Vec::new(),
            current: None,
            group_forced: None,
            partial_programs: Vec::new(),
            es: Vec::new(),
            next_id: 0,
            props,
            pts_delay: config.pts_delay,
            pts_jitter: 0,
            rate: 1.0,
            paused: false,
            pause_date: 0,
            buffering: true,
            preroll_end: None,
            prev_level: None,
            extra_initial: 0,
            extra_stream: 0,
            extra_system: 0,
            recording: false,
            can_pace_control: true,
            out_pace_control: false,
            last_length: None,
        };
        Self {
            sys: Mutex::new(sys),
            interrupted,
        }
    }

    // ========== 解复用器事件 ==========

    /// 声明一条新轨道，返回分配的 id
    pub fn add_es(&self, fmt: EsFormat) -> Result<EsId> {
        self.sys.lock().es_add(fmt, None)
    }

    /// 删除轨道；选中的轨道会先排空解码线程
    pub fn del_es(&self, id: EsId) -> Result<()> {
        self.sys.lock().es_del(id)
    }

    /// 投递一个数据块
    pub fn send(&self, id: EsId, mut block: Block) -> Result<()> {
        let mut sys = self.sys.lock();
        sys.ctx.stats.add_demux_read(
            block.size(),
            block.flags.contains(BlockFlags::CORRUPTED),
            block.flags.contains(BlockFlags::DISCONTINUITY),
        );
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;

        if let Some(preroll_end) = sys.preroll_end {
            let last_pcr = sys.program_pos(sys.es[pos].group).and_then(|p| sys.programs[p].last_pcr);
            let es = &mut sys.es[pos];
            let date = block.pts.or(block.dts).or(es.pts_level).or(last_pcr);
            if let Some(date) = date {
                es.pts_level = Some(date + block.length);
            }
            if date.map_or(true, |d| d < preroll_end) {
                block.flags.insert(BlockFlags::PREROLL);
            }
        }

        let pace = sys.out_pace_control;
        let Some(decoder) = sys.es[pos].decoder.as_ref() else {
            return Ok(());
        };
        decoder.decode(block, pace);

        if let Some(fmt) = decoder.take_format_change() {
            debug!("{} 🔄 ES {} 输出格式更新: {}", log_ctx(), id, fmt.codec);
        }
        if decoder.category() == EsCategory::Video {
            let desc = decoder.cc_desc();
            if !desc.is_empty() {
                sys.create_cc_channels(id, &desc);
            }
        }
        Ok(())
    }

    /// 当前节目的 PCR
    pub fn set_pcr(&self, pcr: Tick) -> Result<()> {
        let mut sys = self.sys.lock();
        let group = match sys.current {
            Some(group) => group,
            None => sys.es.first().map(|e| e.group).unwrap_or(0),
        };
        sys.set_group_pcr(group, pcr)
    }

    pub fn set_group_pcr(&self, group: GroupId, pcr: Tick) -> Result<()> {
        self.sys.lock().set_group_pcr(group, pcr)
    }

    pub fn set_group_meta(&self, group: GroupId, meta: BTreeMap<String, String>) {
        let mut sys = self.sys.lock();
        let pos = sys.program_find_or_add(group);
        sys.programs[pos].meta.extend(meta);
        sys.send_event(InputEvent::ProgramUpdated(group));
    }

    pub fn set_group_epg(&self, group: GroupId, epg: Vec<EpgEvent>) {
        let mut sys = self.sys.lock();
        let pos = sys.program_find_or_add(group);
        debug!("{} 📺 节目 {} 更新 EPG ({} 条)", log_ctx(), group, epg.len());
        sys.programs[pos].epg = epg;
        sys.send_event(InputEvent::ProgramUpdated(group));
    }

    pub fn set_mode(&self, mode: EsOutMode) {
        self.sys.lock().set_mode(mode);
    }

    /// 上报播放进度（扣除仍在缓冲中的时长）
    pub fn set_times(&self, position: f64, time: Tick, length: Tick) {
        let mut sys = self.sys.lock();
        if sys.last_length != Some(length) {
            sys.last_length = Some(length);
            sys.send_event(InputEvent::Length(length));
        }
        if sys.buffering {
            return;
        }
        let delay = sys.buffering_delay();
        let time = (time - delay).max(0);
        let position = if length > 0 {
            (position - delay as f64 / length as f64).max(0.0)
        } else {
            position
        };
        sys.send_event(InputEvent::Position { position, time });
    }

    /// 丢弃时间戳早于 date 的输出（精确 seek）
    pub fn set_next_display_time(&self, date: Tick) {
        self.sys.lock().preroll_end = Some(date);
    }

    pub fn set_es_scrambled(&self, id: EsId, scrambled: bool) -> Result<()> {
        let mut sys = self.sys.lock();
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        if sys.es[pos].scrambled == scrambled {
            return Ok(());
        }
        sys.es[pos].scrambled = scrambled;
        let group = sys.es[pos].group;
        sys.update_program_scrambled(group);
        Ok(())
    }

    /// 替换轨道格式，已选中的轨道会重建解码线程
    pub fn set_es_fmt(&self, id: EsId, mut fmt: EsFormat) -> Result<()> {
        let mut sys = self.sys.lock();
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        fmt.id = id;
        fmt.group = sys.es[pos].group;
        sys.es[pos].fmt = fmt;
        sys.es[pos].unsupported = false;
        if sys.es[pos].decoder.is_some() {
            sys.destroy_decoder(id);
            sys.create_decoder(id);
        }
        Ok(())
    }

    // ========== 选择控制 ==========

    /// 显式选中一条轨道（独占类别会先取消同类其他轨道）
    pub fn set_es(&self, id: EsId) -> Result<()> {
        let mut sys = self.sys.lock();
        sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        sys.select(id, true);
        Ok(())
    }

    /// 取消选中；对未选中的轨道不做任何事
    pub fn unset_es(&self, id: EsId) -> Result<()> {
        let mut sys = self.sys.lock();
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        let update = Some(sys.es[pos].group) == sys.current;
        sys.es_unselect(id, update);
        Ok(())
    }

    /// 只保留 ids 中的同类轨道为选中状态
    pub fn set_es_list(&self, category: EsCategory, ids: &[EsId]) -> Result<()> {
        let mut sys = self.sys.lock();
        for id in ids {
            let pos = sys.es_pos(*id).ok_or(PipelineError::UnknownEs(*id))?;
            if sys.es[pos].category() != category {
                return Err(PipelineError::InvalidArgument(format!(
                    "ES {} 不属于 {}",
                    id, category
                )));
            }
        }
        let others: Vec<EsId> = sys
            .es
            .iter()
            .filter(|e| e.category() == category && !ids.contains(&e.id))
            .map(|e| e.id)
            .collect();
        for id in others {
            if sys.is_selected(id) {
                let update = sys.es_pos(id).map_or(false, |p| Some(sys.es[p].group) == sys.current);
                sys.es_unselect(id, update);
            }
        }
        for id in ids {
            if !sys.is_selected(*id) {
                sys.es_select(*id);
            }
        }
        if let Some(first) = ids.first() {
            sys.props[category.index()].main_es = Some(*first);
        }
        Ok(())
    }

    /// 重建已选中轨道的解码线程
    pub fn restart_es(&self, id: EsId) -> Result<()> {
        let mut sys = self.sys.lock();
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        if sys.es[pos].decoder.is_some() {
            info!("{} 🔁 重启 ES {} 的解码线程", log_ctx(), id);
            sys.destroy_decoder(id);
            sys.create_decoder(id);
        }
        Ok(())
    }

    /// 解复用器声明的默认轨道
    pub fn set_es_default(&self, id: EsId) -> Result<()> {
        let mut sys = self.sys.lock();
        let pos = sys.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        let category = sys.es[pos].category();
        sys.props[category.index()].demux_default = Some(id);
        Ok(())
    }

    pub fn set_policy(&self, category: EsCategory, policy: EsPolicy) {
        self.sys.lock().props[category.index()].policy = policy;
    }

    /// 用户指定的轨道 id / 序号
    pub fn set_track_request(&self, category: EsCategory, id: Option<EsId>, channel: Option<i32>) {
        let mut sys = self.sys.lock();
        let props = &mut sys.props[category.index()];
        props.requested_id = id;
        props.requested_channel = channel;
    }

    pub fn set_language_preference(&self, category: EsCategory, languages: Vec<String>) {
        self.sys.lock().props[category.index()].languages = languages;
    }

    pub fn set_partial_programs(&self, groups: Vec<GroupId>) {
        self.sys.lock().partial_programs = groups;
    }

    /// 切换到指定节目（之后新建的同号节目也会被自动选中）
    pub fn program_select(&self, group: GroupId) -> Result<()> {
        let mut sys = self.sys.lock();
        sys.group_forced = Some(group);
        sys.program_select(group)
    }

    /// 删除节目；仍有轨道时失败
    pub fn program_del(&self, group: GroupId) -> Result<()> {
        self.sys.lock().program_del(group)
    }

    pub fn group_forced(&self) -> Option<GroupId> {
        self.sys.lock().group_forced
    }

    // ========== 输入线程控制 ==========

    pub fn set_delay(&self, category: EsCategory, delay: Tick) {
        let mut sys = self.sys.lock();
        sys.props[category.index()].delay = delay;
        if category == EsCategory::Video {
            return;
        }
        for es in sys.es.iter().filter(|e| e.category() == category) {
            if let Some(decoder) = &es.decoder {
                decoder.change_delay(delay);
            }
        }
    }

    pub fn set_record_state(&self, recording: bool) -> Result<()> {
        let mut sys = self.sys.lock();
        if sys.recording == recording {
            return Ok(());
        }
        info!("{} ⏺ 录制状态: {}", log_ctx(), recording);
        sys.recording = recording;
        Ok(())
    }

    /// 输入结束：排空所有解码线程
    pub fn set_eos(&self) {
        let sys = self.sys.lock();
        info!("{} 🏁 输入结束，排空解码线程", log_ctx());
        for decoder in sys.es.iter().filter_map(|e| e.decoder.as_ref()) {
            decoder.drain();
        }
    }

    /// 设置基础 pts_delay 和额外抖动
    pub fn set_jitter(&self, pts_delay: Tick, jitter: Tick) {
        self.sys.lock().set_jitter(pts_delay, jitter);
    }

    pub fn set_rate(&self, rate: f32) {
        let mut sys = self.sys.lock();
        sys.rate = rate;
        for program in &sys.programs {
            program.clock.change_rate(rate);
        }
    }

    /// seek 之后调用：flush 所有解码线程并重新进入缓冲
    pub fn change_position(&self) {
        self.sys.lock().change_position();
    }

    pub fn set_pause_state(&self, paused: bool, date: Tick) {
        self.sys.lock().change_pause(paused, date);
    }

    /// 暂停时前进一帧，返回该帧时长
    pub fn frame_next(&self) -> Result<Tick> {
        self.sys.lock().frame_next()
    }

    /// 下次唤醒解复用的系统时间，0 表示立即
    pub fn wakeup(&self) -> Tick {
        let sys = self.sys.lock();
        if sys.buffering || !sys.can_pace_control || sys.out_pace_control {
            return 0;
        }
        sys.current_clock()
            .and_then(|clock| clock.wakeup())
            .unwrap_or(0)
    }

    pub fn is_buffering(&self) -> bool {
        self.sys.lock().buffering
    }

    /// 当前生效的 pts_delay（基础值加抖动）
    pub fn pts_delay(&self) -> Tick {
        self.sys.lock().total_pts_delay()
    }

    /// 所有解码线程都已播完（缓冲中会先强制结束缓冲）
    pub fn is_empty(&self) -> bool {
        let mut sys = self.sys.lock();
        if sys.buffering && sys.current.is_some() {
            sys.stop_buffering(true);
            if sys.buffering {
                return true;
            }
        }
        sys.es
            .iter()
            .filter_map(|e| e.decoder.as_ref())
            .all(|d| d.is_empty())
    }

    pub fn is_extra_buffering_allowed(&self) -> bool {
        self.sys.lock().extra_buffering_allowed()
    }

    pub fn set_pace_control(&self, can_pace_control: bool, out_pace_control: bool) {
        let mut sys = self.sys.lock();
        sys.can_pace_control = can_pace_control;
        sys.out_pace_control = out_pace_control;
    }

    /// 停止所有已选中轨道的解码线程，返回它们的 id（切换渲染器时使用）
    pub fn stop_all_es(&self) -> Vec<EsId> {
        let mut sys = self.sys.lock();
        let selected: Vec<EsId> = sys
            .es
            .iter()
            .filter(|e| e.master.is_none() && e.decoder.is_some())
            .map(|e| e.id)
            .collect();
        for id in &selected {
            sys.delete_cc_channels(*id);
            sys.destroy_decoder(*id);
        }
        selected
    }

    pub fn start_all_es(&self, ids: &[EsId]) {
        let mut sys = self.sys.lock();
        for id in ids {
            if sys.es_pos(*id).is_some() {
                sys.create_decoder(*id);
            }
        }
    }

    /// 打断可能阻塞的排空等待
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// 关闭所有解码线程
    pub fn close(&self) {
        let mut sys = self.sys.lock();
        sys.terminate();
    }

    // ========== 查询 ==========

    pub fn mode(&self) -> EsOutMode {
        self.sys.lock().mode
    }

    pub fn es_ids(&self) -> Vec<EsId> {
        self.sys.lock().es.iter().map(|e| e.id).collect()
    }

    pub fn is_es_selected(&self, id: EsId) -> bool {
        self.sys.lock().is_selected(id)
    }

    pub fn selected_es(&self, category: EsCategory) -> Vec<EsId> {
        let sys = self.sys.lock();
        sys.es
            .iter()
            .filter(|e| e.category() == category && sys.is_selected(e.id))
            .map(|e| e.id)
            .collect()
    }

    pub fn es_format(&self, id: EsId) -> Option<EsFormat> {
        let sys = self.sys.lock();
        sys.es_pos(id).map(|pos| sys.es[pos].fmt.clone())
    }

    /// CC 子轨道 (通道, id)
    pub fn cc_children(&self, id: EsId) -> Vec<(u8, EsId)> {
        let sys = self.sys.lock();
        sys.es_pos(id)
            .map(|pos| sys.es[pos].cc.channels.iter().map(|(ch, id)| (*ch, *id)).collect())
            .unwrap_or_default()
    }

    pub fn program_ids(&self) -> Vec<GroupId> {
        self.sys.lock().programs.iter().map(|p| p.id).collect()
    }

    pub fn current_program(&self) -> Option<GroupId> {
        self.sys.lock().current
    }

    pub fn program_es_count(&self, group: GroupId) -> Option<usize> {
        let sys = self.sys.lock();
        sys.program_pos(group).map(|pos| sys.programs[pos].es_count)
    }

    pub fn program_meta(&self, group: GroupId) -> Option<BTreeMap<String, String>> {
        let sys = self.sys.lock();
        sys.program_pos(group).map(|pos| sys.programs[pos].meta.clone())
    }

    pub fn program_epg(&self, group: GroupId) -> Option<Vec<EpgEvent>> {
        let sys = self.sys.lock();
        sys.program_pos(group).map(|pos| sys.programs[pos].epg.clone())
    }

    pub fn is_program_scrambled(&self, group: GroupId) -> bool {
        let sys = self.sys.lock();
        sys.program_pos(group).map_or(false, |pos| sys.programs[pos].scrambled)
    }
}

impl EsOutSys {
    fn send_event(&self, event: InputEvent) {
        self.ctx.events.send(event);
    }

    fn es_pos(&self, id: EsId) -> Option<usize> {
        self.es.iter().position(|e| e.id == id)
    }

    fn program_pos(&self, group: GroupId) -> Option<usize> {
        self.programs.iter().position(|p| p.id == group)
    }

    fn current_clock(&self) -> Option<&ProgramClock> {
        let pos = self.program_pos(self.current?)?;
        Some(&self.programs[pos].clock)
    }

    fn total_pts_delay(&self) -> Tick {
        self.pts_delay + self.pts_jitter
    }

    fn is_selected(&self, id: EsId) -> bool {
        let Some(pos) = self.es_pos(id) else {
            return false;
        };
        let es = &self.es[pos];
        match es.master {
            Some(master) => {
                let parent = self.es_pos(master).and_then(|p| self.es[p].decoder.as_ref());
                match (parent, es.fmt.subtitle.cc) {
                    (Some(decoder), Some((codec, channel))) => decoder.cc_state(codec, channel),
                    _ => false,
                }
            }
            None => es.decoder.is_some(),
        }
    }

    fn extra_buffering_allowed(&self) -> bool {
        let size: usize = self
            .es
            .iter()
            .filter_map(|e| e.decoder.as_ref())
            .map(|d| d.fifo_size())
            .sum();
        size < self.ctx.config.extra_buffering_max_bytes
    }

    // ========== 节目 ==========

    fn program_add(&mut self, group: GroupId) -> usize {
        let clock = ProgramClock::new(self.total_pts_delay(), self.rate);
        if self.paused {
            clock.change_pause(true, self.pause_date);
        }
        self.programs.push(Program {
            id: group,
            es_count: 0,
            selected: false,
            scrambled: false,
            clock,
            last_pcr: None,
            meta: BTreeMap::new(),
            epg: Vec::new(),
        });
        info!("{} 📺 新节目 {}", log_ctx(), group);
        self.send_event(InputEvent::ProgramAdded(group));

        if self.group_forced == Some(group) || (self.current.is_none() && self.group_forced.is_none()) {
            if let Err(e) = self.program_select(group) {
                warn!("{} ⚠ 选中节目 {} 失败: {}", log_ctx(), group, e);
            }
        }
        self.programs.len() - 1
    }

    fn program_find_or_add(&mut self, group: GroupId) -> usize {
        match self.program_pos(group) {
            Some(pos) => pos,
            None => self.program_add(group),
        }
    }

    fn program_select(&mut self, group: GroupId) -> Result<()> {
        self.program_pos(group).ok_or(PipelineError::UnknownProgram(group))?;
        if self.current == Some(group) {
            return Ok(());
        }

        if let Some(old) = self.current {
            info!("{} 📺 取消选中节目 {}", log_ctx(), old);
            if let Some(pos) = self.program_pos(old) {
                self.programs[pos].selected = false;
            }
            if self.mode != EsOutMode::All {
                let ids: Vec<EsId> = self.es.iter().filter(|e| e.group == old).map(|e| e.id).collect();
                for id in ids {
                    if self.is_selected(id) {
                        self.es_unselect(id, true);
                    }
                }
            }
            for props in self.props.iter_mut() {
                props.main_es = None;
            }
        }

        info!("{} 📺 选中节目 {}", log_ctx(), group);
        self.current = Some(group);
        let pos = self.program_pos(group).ok_or(PipelineError::UnknownProgram(group))?;
        self.programs[pos].selected = true;
        let scrambled = self.programs[pos].scrambled;
        self.send_event(InputEvent::ProgramSelected(group));
        self.send_event(InputEvent::ProgramScrambled { group, scrambled });

        for es in self.es.iter().filter(|e| e.group == group) {
            self.send_event(InputEvent::EsAdded {
                category: es.category(),
                id: es.id,
                label: es_label(&es.fmt, es.channel),
            });
        }
        let ids: Vec<EsId> = self.es.iter().map(|e| e.id).collect();
        for id in ids {
            self.select(id, false);
        }
        Ok(())
    }

    fn program_del(&mut self, group: GroupId) -> Result<()> {
        let pos = self.program_pos(group).ok_or(PipelineError::UnknownProgram(group))?;
        let count = self.programs[pos].es_count;
        if count > 0 {
            debug!("{} 节目 {} 仍有 {} 个 ES，不能删除", log_ctx(), group, count);
            return Err(PipelineError::ProgramInUse(group, count));
        }
        self.remove_program(pos);
        Ok(())
    }

    fn remove_program(&mut self, pos: usize) {
        let program = self.programs.remove(pos);
        if self.current == Some(program.id) {
            self.current = None;
        }
        info!("{} 📺 删除节目 {}", log_ctx(), program.id);
        self.send_event(InputEvent::ProgramDeleted(program.id));
    }

    fn update_program_scrambled(&mut self, group: GroupId) {
        let scrambled = self.es.iter().any(|e| e.group == group && e.scrambled);
        let Some(pos) = self.program_pos(group) else {
            return;
        };
        if self.programs[pos].scrambled == scrambled {
            return;
        }
        self.programs[pos].scrambled = scrambled;
        self.send_event(InputEvent::ProgramScrambled { group, scrambled });
    }

    // ========== ES ==========

    fn next_free_id(&mut self) -> EsId {
        loop {
            let id = self.next_id;
            self.next_id += 1;
            if self.es_pos(id).is_none() {
                return id;
            }
        }
    }

    fn es_add(&mut self, mut fmt: EsFormat, master: Option<EsId>) -> Result<EsId> {
        let group = fmt.group;
        let ppos = self.program_find_or_add(group);

        let id = if fmt.id >= 0 && self.es_pos(fmt.id).is_none() {
            fmt.id
        } else {
            if fmt.id >= 0 {
                warn!("{} ⚠ ES id {} 已存在，重新分配", log_ctx(), fmt.id);
            }
            self.next_free_id()
        };
        fmt.id = id;

        let category = fmt.category;
        let props = &mut self.props[category.index()];
        let channel = props.count;
        props.count += 1;

        self.programs[ppos].es_count += 1;
        let language = fmt.language.as_ref().map(|l| l.to_ascii_lowercase());
        let label = es_label(&fmt, channel);
        info!("{} ➕ 新 ES {}: {} [{}] {}", log_ctx(), id, category, fmt.codec, label);

        self.es.push(Es {
            id,
            fmt,
            group,
            channel,
            language,
            scrambled: false,
            decoder: None,
            unsupported: false,
            pts_level: None,
            cc: EsCc::default(),
            master,
        });
        if Some(group) == self.current {
            self.send_event(InputEvent::EsAdded { category, id, label });
        }
        self.select(id, false);
        Ok(id)
    }

    fn es_del(&mut self, id: EsId) -> Result<()> {
        let pos = self.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;

        // 选中的轨道先排空，保证已投递的数据播放完
        if let Some(decoder) = self.es[pos].decoder.as_ref() {
            decoder.drain();
            let poll = Duration::from_micros(self.ctx.config.drain_poll.max(1) as u64);
            loop {
                if self.interrupted.load(Ordering::Acquire) || self.buffering || self.paused {
                    break;
                }
                if decoder.is_empty() || decoder.has_error() {
                    break;
                }
                thread::sleep(poll);
            }
        }

        let group = self.es[pos].group;
        if self.is_selected(id) {
            let update = Some(group) == self.current;
            self.es_unselect(id, update);
        }

        let pos = self.es_pos(id).ok_or(PipelineError::UnknownEs(id))?;
        let es = self.es.remove(pos);
        let category = es.category();
        info!("{} ➖ 删除 ES {} ({})", log_ctx(), id, category);
        if Some(group) == self.current {
            self.send_event(InputEvent::EsDeleted { category, id });
        }
        if let Some(master) = es.master {
            if let Some(mpos) = self.es_pos(master) {
                self.es[mpos].cc.channels.retain(|_, child| *child != id);
            }
        }

        if let Some(ppos) = self.program_pos(group) {
            self.programs[ppos].es_count = self.programs[ppos].es_count.saturating_sub(1);
            if self.programs[ppos].es_count == 0 {
                self.remove_program(ppos);
            } else if es.scrambled {
                self.update_program_scrambled(group);
            }
        }

        let props = &mut self.props[category.index()];
        if props.main_es == Some(id) {
            props.main_es = None;
            let others: Vec<EsId> = self
                .es
                .iter()
                .filter(|e| e.category() == category)
                .map(|e| e.id)
                .collect();
            for other in others {
                if self.is_selected(other) {
                    self.send_event(InputEvent::EsSelected { category, id: Some(other) });
                    let props = &mut self.props[category.index()];
                    if props.main_es.is_none() {
                        props.main_es = Some(other);
                    }
                } else {
                    self.select(other, false);
                }
            }
        }
        Ok(())
    }

    /// 按当前模式和偏好决定是否选中 id；force 表示用户显式请求
    fn select(&mut self, id: EsId, force: bool) {
        let Some(pos) = self.es_pos(id) else {
            return;
        };
        let (category, group, priority) = {
            let es = &self.es[pos];
            (es.category(), es.group, es.fmt.priority)
        };
        if !self.active || (!force && priority < ES_PRIORITY_SELECTABLE_MIN) {
            return;
        }
        let index = category.index();
        let policy = self.props[index].policy;

        if self.mode == EsOutMode::All || force {
            if !self.is_selected(id) {
                if self.mode == EsOutMode::Auto && policy == EsPolicy::Exclusive {
                    self.unselect_category(category, id);
                }
                self.es_select(id);
            }
        } else if self.mode == EsOutMode::Partial {
            if self.partial_programs.contains(&group) && !self.is_selected(id) {
                self.es_select(id);
            }
        } else if self.mode == EsOutMode::Auto {
            if Some(group) != self.current {
                return;
            }
            let wanted = {
                let props = &self.props[index];
                let prefs = TrackPrefs {
                    requested_id: props.requested_id,
                    requested_channel: props.requested_channel,
                    languages: &props.languages,
                    demux_default: props.demux_default,
                    autoselect: props.autoselect,
                };
                let main = props
                    .main_es
                    .and_then(|m| self.es_pos(m))
                    .map(|p| self.es[p].candidate());
                selection::is_wanted(&prefs, &self.es[pos].candidate(), main.as_ref())
            };
            if wanted && !self.is_selected(id) {
                if policy == EsPolicy::Exclusive {
                    if let Some(main) = self.props[index].main_es {
                        if self.is_selected(main) {
                            self.es_unselect(main, false);
                        }
                    }
                }
                self.es_select(id);
            }
        }

        if self.mode == EsOutMode::Auto && self.is_selected(id) {
            self.props[index].main_es = Some(id);
        }
    }

    fn unselect_category(&mut self, category: EsCategory, except: EsId) {
        let ids: Vec<EsId> = self
            .es
            .iter()
            .filter(|e| e.category() == category && e.id != except)
            .map(|e| e.id)
            .collect();
        for id in ids {
            if self.is_selected(id) {
                self.es_unselect(id, false);
            }
        }
    }

    fn es_select(&mut self, id: EsId) {
        if self.is_selected(id) {
            warn!("{} ⚠ ES {} 已经处于选中状态", log_ctx(), id);
            return;
        }
        let Some(pos) = self.es_pos(id) else {
            return;
        };
        let category = self.es[pos].category();

        if let Some(master) = self.es[pos].master {
            let Some((codec, channel)) = self.es[pos].fmt.subtitle.cc else {
                return;
            };
            let Some(decoder) = self.es_pos(master).and_then(|p| self.es[p].decoder.as_ref()) else {
                return;
            };
            if let Err(e) = decoder.set_cc_state(codec, channel, true) {
                warn!("{} ⚠ 无法开启 CC 通道 {}: {}", log_ctx(), channel, e);
                return;
            }
        } else {
            let config = &self.ctx.config;
            let enabled = match category {
                EsCategory::Video => config.video_enabled,
                EsCategory::Audio => config.audio_enabled,
                EsCategory::Subtitle => config.subtitle_enabled,
            };
            if !enabled {
                debug!("{} {} 输出已禁用，不选中 ES {}", log_ctx(), category, id);
                return;
            }
            if self.es[pos].unsupported {
                return;
            }
            self.create_decoder(id);
            let es = &self.es[pos];
            if es.decoder.is_none() || Some(es.group) != self.current {
                return;
            }
        }

        info!("{} ✅ 选中 ES {} ({})", log_ctx(), id, category);
        self.send_event(InputEvent::EsSelected { category, id: Some(id) });
    }

    fn es_unselect(&mut self, id: EsId, update: bool) {
        if !self.is_selected(id) {
            warn!("{} ⚠ ES {} 已经处于未选中状态", log_ctx(), id);
            return;
        }
        let Some(pos) = self.es_pos(id) else {
            return;
        };
        let category = self.es[pos].category();

        if let Some(master) = self.es[pos].master {
            let parent = self.es_pos(master).and_then(|p| self.es[p].decoder.as_ref());
            if let (Some(decoder), Some((codec, channel))) = (parent, self.es[pos].fmt.subtitle.cc) {
                if let Err(e) = decoder.set_cc_state(codec, channel, false) {
                    warn!("{} ⚠ 无法关闭 CC 通道 {}: {}", log_ctx(), channel, e);
                }
            }
        } else {
            self.delete_cc_channels(id);
            self.destroy_decoder(id);
        }

        if update {
            info!("{} ❎ 取消选中 ES {} ({})", log_ctx(), id, category);
            self.send_event(InputEvent::EsSelected { category, id: None });
        }
    }

    fn create_decoder(&mut self, id: EsId) {
        let Some(pos) = self.es_pos(id) else {
            return;
        };
        let group = self.es[pos].group;
        let Some(clock) = self.program_pos(group).map(|p| self.programs[p].clock.clone()) else {
            return;
        };
        match DecoderWorker::new(&self.ctx, &self.es[pos].fmt, Some(clock)) {
            Ok(decoder) => {
                if self.buffering {
                    decoder.start_wait();
                }
                if self.paused {
                    decoder.change_pause(true, self.pause_date);
                }
                let category = self.es[pos].category();
                if category != EsCategory::Video {
                    decoder.change_delay(self.props[category.index()].delay);
                }
                self.es[pos].decoder = Some(decoder);
            }
            Err(PipelineError::UnsupportedCodec(codec)) => {
                warn!("{} ⚠ ES {} 编码 {} 不受支持，不再尝试", log_ctx(), id, codec);
                self.es[pos].unsupported = true;
            }
            Err(e) => {
                error!("{} ❌ ES {} 创建解码线程失败: {}", log_ctx(), id, e);
            }
        }
    }

    fn destroy_decoder(&mut self, id: EsId) {
        let decoder = self.es_pos(id).and_then(|pos| self.es[pos].decoder.take());
        if let Some(decoder) = decoder {
            decoder.delete();
        }
    }

    // ========== CC 子轨道 ==========

    fn create_cc_channels(&mut self, parent: EsId, desc: &CcDescriptor) {
        let Some(codec) = desc.codec else {
            return;
        };
        if codec == CcCodec::Cea708 && !self.ctx.config.cc_prefer_708 {
            return;
        }
        let Some(pos) = self.es_pos(parent) else {
            return;
        };
        if self.es[pos].cc.codec.map_or(false, |existing| existing != codec) {
            return;
        }
        let group = self.es[pos].group;
        let missing: Vec<u8> = desc
            .channels
            .iter()
            .filter(|ch| !self.es[pos].cc.channels.contains_key(ch))
            .copied()
            .collect();

        for channel in missing {
            let mut fmt = EsFormat::new(EsCategory::Subtitle, codec.as_str()).with_group(group);
            fmt.subtitle.cc = Some((codec, channel));
            fmt.description = Some(format!("Closed captions {}", channel + 1));
            debug!("{} 📝 ES {} 添加 CC 子轨道 {}", log_ctx(), parent, channel);

            let child = match self.es_add(fmt, Some(parent)) {
                Ok(child) => child,
                Err(e) => {
                    warn!("{} ⚠ 添加 CC 子轨道失败: {}", log_ctx(), e);
                    continue;
                }
            };
            if let Some(pos) = self.es_pos(parent) {
                let cc = &mut self.es[pos].cc;
                cc.codec = Some(codec);
                cc.channels.insert(channel, child);
            }
            if self.ctx.config.cc_default_channel == Some(channel) {
                self.select(child, true);
            }
        }
    }

    fn delete_cc_channels(&mut self, parent: EsId) {
        let Some(pos) = self.es_pos(parent) else {
            return;
        };
        let children: Vec<EsId> = self.es[pos].cc.channels.values().copied().collect();
        for child in children {
            if self.is_selected(child) {
                self.send_event(InputEvent::EsSelected {
                    category: EsCategory::Subtitle,
                    id: None,
                });
            }
            if let Err(e) = self.es_del(child) {
                warn!("{} ⚠ 删除 CC 子轨道 {} 失败: {}", log_ctx(), child, e);
            }
        }
        if let Some(pos) = self.es_pos(parent) {
            self.es[pos].cc = EsCc::default();
        }
    }

    // ========== 时钟与缓冲 ==========

    fn set_group_pcr(&mut self, group: GroupId, pcr: Tick) -> Result<()> {
        if pcr < 0 {
            error!("{} ❌ 非法 PCR: {}", log_ctx(), pcr);
            return Err(PipelineError::InvalidTimestamp);
        }
        let pos = self.program_find_or_add(group);
        let program = &mut self.programs[pos];
        program.last_pcr = Some(pcr);
        let late = program.clock.update(pcr, mdate());
        let clock = program.clock.clone();

        if Some(group) != self.current {
            return Ok(());
        }
        if self.buffering {
            self.stop_buffering(false);
        } else if let Some(late) = late {
            if !self.out_pace_control {
                self.handle_late_pcr(&clock, late);
            }
        }
        Ok(())
    }

    /// PCR 到达过晚：增大 pts_delay 并重新缓冲，抖动过大时直接重置时钟
    fn handle_late_pcr(&mut self, clock: &ProgramClock, late: Tick) {
        let base = self.pts_delay;
        let mut pts_delay = clock.jitter();
        let cap = (base + self.ctx.config.jitter_max).min(PTS_DELAY_MAX);

        if pts_delay > cap || !self.extra_buffering_allowed() {
            error!(
                "{} ❌ PCR 到达过晚 {}ms (忽略 {}ms 抖动)",
                log_ctx(),
                late / 1000,
                (pts_delay - base) / 1000
            );
            pts_delay = self.total_pts_delay();
            for program in &self.programs {
                program.clock.reset();
            }
        } else {
            error!(
                "{} ❌ PCR 到达过晚 {}ms (pts_delay 增加到 {}ms)",
                log_ctx(),
                late / 1000,
                pts_delay / 1000
            );
            self.change_position();
        }
        self.set_jitter(base, pts_delay - base);
    }

    fn set_jitter(&mut self, pts_delay: Tick, jitter: Tick) {
        let jitter = jitter.max(0);
        let changed = pts_delay + jitter != self.total_pts_delay();
        self.pts_delay = pts_delay;
        self.pts_jitter = jitter;
        if changed {
            debug!("{} ⏱ pts_delay = {}ms + {}ms", log_ctx(), pts_delay / 1000, jitter / 1000);
            let total = self.total_pts_delay();
            for program in &self.programs {
                program.clock.set_jitter(total);
            }
        }
    }

    fn stop_buffering(&mut self, forced: bool) {
        if !self.buffering {
            return;
        }
        let Some(clock) = self.current_clock().cloned() else {
            return;
        };
        let state = match clock.state() {
            Some(state) => state,
            None if forced => ClockState {
                stream_start: 0,
                system_start: 0,
                stream_duration: 0,
                system_duration: 0,
            },
            None => return,
        };

        let preroll = self
            .preroll_end
            .map_or(0, |end| (end - state.stream_start).max(0));
        let buffering_duration =
            self.total_pts_delay() + preroll + self.extra_stream - self.extra_initial;

        if state.stream_duration < buffering_duration && !forced {
            let level = if buffering_duration > 0 {
                (state.stream_duration as f64 / buffering_duration as f64).clamp(0.0, 1.0)
            } else {
                1.0
            };
            let percent = (level * 100.0) as i32;
            if self.prev_level != Some(percent) {
                debug!("{} ⏳ 缓冲中 {}%", log_ctx(), percent);
                self.prev_level = Some(percent);
                self.send_event(InputEvent::Cache(level));
            }
            return;
        }

        self.send_event(InputEvent::Cache(1.0));
        info!(
            "{} ✅ 缓冲完成 ({}ms 数据, 耗时 {}ms)",
            log_ctx(),
            state.stream_duration / 1000,
            state.system_duration / 1000
        );
        self.buffering = false;
        self.preroll_end = None;
        self.prev_level = None;

        // 逐帧播放引起的额外缓冲不重新对齐时钟
        if self.extra_initial > 0 {
            return;
        }

        for decoder in self
            .es
            .iter()
            .filter(|e| e.category() != EsCategory::Subtitle)
            .filter_map(|e| e.decoder.as_ref())
        {
            decoder.wait();
        }

        let now = if self.paused { self.pause_date } else { mdate() };
        clock.change_system_origin(now + self.ctx.config.wake_ahead - buffering_duration);

        for decoder in self.es.iter().filter_map(|e| e.decoder.as_ref()) {
            decoder.stop_wait();
        }
    }

    fn change_position(&mut self) {
        debug!("{} ⏩ 位置变化，flush 并重新缓冲", log_ctx());
        self.send_event(InputEvent::Cache(0.0));
        let buffering = self.buffering;
        for es in self.es.iter_mut() {
            if let Some(decoder) = &es.decoder {
                decoder.flush();
                if !buffering {
                    decoder.start_wait();
                }
            }
            es.pts_level = None;
        }
        for program in self.programs.iter_mut() {
            program.clock.reset();
            program.last_pcr = None;
        }
        self.buffering = true;
        self.preroll_end = None;
        self.prev_level = None;
        self.extra_initial = 0;
        self.extra_stream = 0;
        self.extra_system = 0;
    }

    /// 仍在输出端排队、尚未播放的时长
    fn buffering_delay(&self) -> Tick {
        let Some(state) = self.current_clock().and_then(|c| c.state()) else {
            return 0;
        };
        let delay = if self.buffering && self.extra_initial <= 0 {
            state.stream_duration
        } else {
            let system_duration = if self.paused {
                let mut d = self.pause_date - state.system_start;
                if self.extra_initial > 0 {
                    d += self.extra_system - self.extra_initial;
                }
                d
            } else {
                mdate() - state.system_start
            };
            let consumed = (system_duration as f64 * self.rate as f64) as Tick - state.stream_duration;
            self.total_pts_delay() - consumed
        };
        delay.max(0)
    }

    fn change_pause(&mut self, paused: bool, mut date: Tick) {
        if paused {
            for decoder in self.es.iter().filter_map(|e| e.decoder.as_ref()) {
                decoder.change_pause(true, date);
            }
            for program in &self.programs {
                program.clock.change_pause(true, date);
            }
        } else {
            if self.extra_initial > 0 {
                if self.current_clock().and_then(|c| c.state()).is_some() {
                    date -= self.extra_system - self.extra_initial;
                }
                self.extra_initial = 0;
                self.extra_stream = 0;
                self.extra_system = 0;
            }
            for program in &self.programs {
                program.clock.change_pause(false, date);
            }
            for decoder in self.es.iter().filter_map(|e| e.decoder.as_ref()) {
                decoder.change_pause(false, date);
            }
            for program in &self.programs {
                program.clock.change_rate(self.rate);
            }
        }
        self.paused = paused;
        self.pause_date = date;
    }

    fn frame_next(&mut self) -> Result<Tick> {
        if self.buffering {
            warn!("{} ⚠ 正在缓冲，忽略逐帧请求", log_ctx());
            return Err(PipelineError::ControlRejected("缓冲中".to_string()));
        }
        let video = self
            .es
            .iter()
            .filter(|e| e.category() == EsCategory::Video)
            .find_map(|e| e.decoder.as_ref())
            .ok_or_else(|| PipelineError::ControlRejected("没有选中的视频轨道".to_string()))?;

        let duration = video
            .frame_next()
            .filter(|d| *d > 0)
            .unwrap_or(self.ctx.config.frame_next_default_duration);
        debug!("{} ⏭ 逐帧前进 {}ms", log_ctx(), duration / 1000);

        if self.extra_initial <= 0 {
            let state = self
                .current_clock()
                .and_then(|c| c.state())
                .ok_or(PipelineError::InvalidTimestamp)?;
            self.extra_initial = 1 + state.stream_duration - self.total_pts_delay();
            self.extra_system = self.extra_initial;
            self.extra_stream = self.extra_initial;
        }

        let rate = self.current_clock().map_or(self.rate, |c| c.rate());
        self.buffering = true;
        self.extra_system += duration;
        self.extra_stream = self.extra_initial
            + ((self.extra_system - self.extra_initial) as f64 * rate as f64) as Tick;
        self.preroll_end = None;
        self.prev_level = None;
        Ok(duration)
    }

    fn set_mode(&mut self, mode: EsOutMode) {
        if mode == self.mode {
            return;
        }
        info!("{} 🎚 ES 输出模式: {:?} -> {:?}", log_ctx(), self.mode, mode);
        self.active = mode != EsOutMode::None && mode != EsOutMode::End;
        self.mode = mode;

        let ids: Vec<EsId> = self.es.iter().map(|e| e.id).collect();
        for id in &ids {
            if self.is_selected(*id) {
                let update = self.es_pos(*id).map_or(false, |p| Some(self.es[p].group) == self.current);
                self.es_unselect(*id, update);
            }
        }
        for id in &ids {
            self.select(*id, false);
        }
        if mode == EsOutMode::End {
            self.terminate();
        }
    }

    fn terminate(&mut self) {
        let ids: Vec<EsId> = self
            .es
            .iter()
            .filter(|e| e.master.is_none() && e.decoder.is_some())
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.delete_cc_channels(id);
            self.destroy_decoder(id);
        }
        self.active = false;
    }
}

fn es_label(fmt: &EsFormat, channel: i32) -> String {
    let base = fmt
        .description
        .clone()
        .unwrap_or_else(|| format!("Track {}", channel + 1));
    match &fmt.language {
        Some(language) => format!("{} - [{}]", base, language),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ms, PipelineConfig};
    use crate::player::modules::SinkPool;
    use crate::player::synthetic::{RawModuleFactory, RecordingSinkPool, CC608_MARKER};
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn setup_with(config: PipelineConfig) -> (EsOut, Arc<RecordingSinkPool>, Receiver<InputEvent>) {
        let pool = RecordingSinkPool::new();
        let sinks: Arc<dyn SinkPool> = pool.clone();
        let modules = Arc::new(RawModuleFactory::new().with_unsupported("mystery"));
        let (ctx, rx) = PipelineContext::new(config, modules, sinks);
        (EsOut::new(ctx), pool, rx)
    }

    fn setup() -> (EsOut, Arc<RecordingSinkPool>, Receiver<InputEvent>) {
        let config = PipelineConfig {
            pts_delay: ms(50),
            ..PipelineConfig::default()
        };
        setup_with(config)
    }

    fn audio(id: EsId, language: &str) -> EsFormat {
        EsFormat::new(EsCategory::Audio, "raw-audio")
            .with_id(id)
            .with_language(language)
    }

    fn block(pts: Tick) -> Block {
        Block::new(vec![1u8; 8]).with_pts(pts).with_length(ms(20))
    }

    /// 投递 [from, to) 的音频数据并推进 PCR
    fn feed(out: &EsOut, id: EsId, from: Tick, to: Tick) {
        let mut pts = from;
        while pts < to {
            out.set_pcr(pts).unwrap();
            out.send(id, block(pts)).unwrap();
            pts += ms(20);
        }
    }

    #[test]
    fn test_es_count_and_program_teardown() {
        let (out, _pool, rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en").with_group(7)).unwrap();
        let b = out.add_es(audio(2, "fr").with_group(7)).unwrap();
        assert_eq!(out.program_ids(), vec![7]);
        assert_eq!(out.program_es_count(7), Some(2));
        assert_eq!(out.current_program(), Some(7));

        out.del_es(a).unwrap();
        assert_eq!(out.program_es_count(7), Some(1));
        out.del_es(b).unwrap();
        assert!(out.program_ids().is_empty());
        assert_eq!(out.current_program(), None);
        assert!(rx.try_iter().any(|e| e == InputEvent::ProgramDeleted(7)));
        assert!(matches!(out.del_es(a), Err(PipelineError::UnknownEs(1))));
    }

    #[test]
    fn test_exclusive_audio_switch() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        let b = out.add_es(audio(2, "fr")).unwrap();
        assert_eq!(out.selected_es(EsCategory::Audio), vec![a]);

        out.set_es(b).unwrap();
        assert_eq!(out.selected_es(EsCategory::Audio), vec![b]);
        assert!(!out.is_es_selected(a));
    }

    #[test]
    fn test_simultaneous_video_tracks() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let v1 = out.add_es(EsFormat::new(EsCategory::Video, "raw-video")).unwrap();
        let v2 = out.add_es(EsFormat::new(EsCategory::Video, "raw-video")).unwrap();
        out.set_es(v2).unwrap();
        assert!(out.is_es_selected(v1));
        assert!(out.is_es_selected(v2));
    }

    #[test]
    fn test_es_list_selects_several_subtitles() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let s1 = out.add_es(EsFormat::new(EsCategory::Subtitle, "raw-text")).unwrap();
        let s2 = out.add_es(EsFormat::new(EsCategory::Subtitle, "raw-text")).unwrap();
        let a = out.add_es(audio(9, "en")).unwrap();

        out.set_es_list(EsCategory::Subtitle, &[s1, s2]).unwrap();
        assert_eq!(out.selected_es(EsCategory::Subtitle), vec![s1, s2]);
        out.set_es_list(EsCategory::Subtitle, &[s2]).unwrap();
        assert_eq!(out.selected_es(EsCategory::Subtitle), vec![s2]);
        assert!(out.set_es_list(EsCategory::Subtitle, &[a]).is_err());
    }

    #[test]
    fn test_double_unselect_is_noop() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        assert!(out.is_es_selected(a));
        out.unset_es(a).unwrap();
        assert!(!out.is_es_selected(a));
        out.unset_es(a).unwrap();
        assert!(!out.is_es_selected(a));
        assert_eq!(out.program_es_count(0), Some(1));
    }

    #[test]
    fn test_mode_none_selects_nothing_until_auto() {
        let (out, _pool, _rx) = setup();
        let a = out.add_es(audio(1, "en")).unwrap();
        assert!(!out.is_es_selected(a));
        out.set_mode(EsOutMode::Auto);
        assert!(out.is_es_selected(a));
        out.set_mode(EsOutMode::None);
        assert!(!out.is_es_selected(a));
    }

    #[test]
    fn test_language_preference() {
        let config = PipelineConfig {
            pts_delay: ms(50),
            audio_languages: vec!["fr".to_string()],
            ..PipelineConfig::default()
        };
        let (out, _pool, _rx) = setup_with(config);
        out.set_mode(EsOutMode::Auto);
        let en = out.add_es(audio(1, "en")).unwrap();
        let fr = out.add_es(audio(2, "FR")).unwrap();
        assert_eq!(out.selected_es(EsCategory::Audio), vec![fr]);
        assert!(!out.is_es_selected(en));
    }

    #[test]
    fn test_subtitles_not_autoselected() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let spu = out
            .add_es(EsFormat::new(EsCategory::Subtitle, "raw-text"))
            .unwrap();
        assert!(!out.is_es_selected(spu));
    }

    #[test]
    fn test_unsupported_codec_reported_once() {
        let (out, _pool, rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let id = out
            .add_es(EsFormat::new(EsCategory::Audio, "mystery"))
            .unwrap();
        assert!(!out.is_es_selected(id));
        out.set_es(id).unwrap();
        let errors = rx
            .try_iter()
            .filter(|e| matches!(e, InputEvent::UserError { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_program_del_in_use() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        out.add_es(audio(1, "en").with_group(2)).unwrap();
        assert!(matches!(out.program_del(2), Err(PipelineError::ProgramInUse(2, 1))));
        assert!(matches!(out.program_del(9), Err(PipelineError::UnknownProgram(9))));

        out.set_group_meta(5, BTreeMap::from([("name".to_string(), "news".to_string())]));
        assert_eq!(out.program_es_count(5), Some(0));
        out.program_del(5).unwrap();
        assert!(!out.program_ids().contains(&5));
    }

    #[test]
    fn test_program_switch_reselects() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en").with_group(1)).unwrap();
        let b = out.add_es(audio(2, "en").with_group(2)).unwrap();
        assert!(out.is_es_selected(a));
        assert!(!out.is_es_selected(b));

        out.program_select(2).unwrap();
        assert_eq!(out.current_program(), Some(2));
        assert!(!out.is_es_selected(a));
        assert!(out.is_es_selected(b));
        assert_eq!(out.group_forced(), Some(2));
    }

    #[test]
    fn test_no_output_while_buffering() {
        let (out, pool, rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();

        feed(&out, a, 0, ms(40));
        assert!(out.is_buffering());
        thread::sleep(Duration::from_millis(50));
        assert!(pool.delivered().is_empty());

        feed(&out, a, ms(40), ms(120));
        assert!(!out.is_buffering());
        assert!(wait_until(|| !pool.delivered().is_empty()));

        // 缓冲完成只发生一次
        feed(&out, a, ms(120), ms(200));
        let completions = rx
            .try_iter()
            .filter(|e| *e == InputEvent::Cache(1.0))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_preroll_after_seek() {
        let (out, pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();

        out.change_position();
        out.set_next_display_time(ms(80));
        feed(&out, a, 0, ms(200));
        assert!(!out.is_buffering());
        assert!(wait_until(|| pool.delivered().len() >= 6));
        assert!(pool
            .delivered()
            .iter()
            .all(|d| d.unit.pts.map_or(false, |pts| pts >= ms(80))));
    }

    #[test]
    fn test_del_es_drains_queued_units() {
        let (out, pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        feed(&out, a, 0, ms(200));
        assert!(!out.is_buffering());
        out.del_es(a).unwrap();
        assert_eq!(pool.delivered().len(), 10);
        assert_eq!(pool.released(), 1);
    }

    #[test]
    fn test_cc_sub_tracks() {
        let (out, pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let mut fmt = EsFormat::new(EsCategory::Video, "raw-video");
        fmt.extra = CC608_MARKER.to_vec();
        let video = out.add_es(fmt).unwrap();

        let mut pts = 0;
        assert!(wait_until(|| {
            out.set_pcr(pts).unwrap();
            out.send(video, block(pts)).unwrap();
            pts += ms(20);
            out.cc_children(video).len() == 2
        }));
        let children = out.cc_children(video);
        let (channel, first) = children[0];
        assert_eq!(channel, 0);
        assert!(out.is_es_selected(first));
        assert!(!out.is_es_selected(children[1].1));
        assert_eq!(
            out.es_format(first).and_then(|f| f.subtitle.cc),
            Some((CcCodec::Cea608, 0))
        );

        // 取消视频轨道时 CC 子轨道一并删除
        out.unset_es(video).unwrap();
        assert!(out.cc_children(video).is_empty());
        assert_eq!(out.es_ids(), vec![video]);
        assert!(pool.released() >= 1);
    }

    #[test]
    fn test_scrambled_program() {
        let (out, _pool, rx) = setup();
        let a = out.add_es(audio(1, "en")).unwrap();
        out.set_es_scrambled(a, true).unwrap();
        assert!(out.is_program_scrambled(0));
        assert!(rx
            .try_iter()
            .any(|e| e == InputEvent::ProgramScrambled { group: 0, scrambled: true }));
    }

    #[test]
    fn test_wakeup_zero_while_buffering() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        assert_eq!(out.wakeup(), 0);
        feed(&out, a, 0, ms(120));
        assert!(!out.is_buffering());
        assert!(out.wakeup() > 0);
    }

    #[test]
    fn test_buffering_ends_at_exact_threshold() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        out.set_pcr(0).unwrap();
        out.send(a, block(0)).unwrap();
        assert!(out.is_buffering());
        out.set_pcr(ms(50)).unwrap();
        assert!(!out.is_buffering());
    }

    /// 缓冲完成后停顿 300ms 再送下一个 PCR，返回该 PCR
    fn stall_after(out: &EsOut, id: EsId, from: Tick) -> Tick {
        feed(out, id, from, from + ms(80));
        assert!(!out.is_buffering());
        thread::sleep(Duration::from_millis(300));
        let pcr = from + ms(80);
        out.set_pcr(pcr).unwrap();
        pcr
    }

    #[test]
    fn test_late_pcr_raises_jitter_and_rebuffers() {
        let (out, _pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();

        // 单次迟到只触发重新缓冲
        let next = stall_after(&out, a, 0);
        assert!(out.is_buffering());
        assert_eq!(out.pts_delay(), ms(50));

        // 第二次迟到后迟到样本的中位数计入 pts_delay
        stall_after(&out, a, next);
        assert!(out.is_buffering());
        assert!(out.pts_delay() >= ms(150));
    }

    #[test]
    fn test_late_pcr_past_jitter_cap_resets_clocks() {
        let config = PipelineConfig {
            pts_delay: ms(50),
            jitter_max: ms(50),
            ..PipelineConfig::default()
        };
        let (out, _pool, _rx) = setup_with(config);
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();

        let next = stall_after(&out, a, 0);
        assert!(out.is_buffering());

        stall_after(&out, a, next);
        assert!(!out.is_buffering());
        assert_eq!(out.pts_delay(), ms(50));
        assert_eq!(out.wakeup(), 0);
    }

    #[test]
    fn test_late_pcr_without_extra_buffering_resets_clocks() {
        let config = PipelineConfig {
            pts_delay: ms(50),
            extra_buffering_max_bytes: 0,
            ..PipelineConfig::default()
        };
        let (out, _pool, _rx) = setup_with(config);
        out.set_mode(EsOutMode::Auto);
        let a = out.add_es(audio(1, "en")).unwrap();
        assert!(!out.is_extra_buffering_allowed());

        stall_after(&out, a, 0);
        assert!(!out.is_buffering());
        assert_eq!(out.pts_delay(), ms(50));
        assert_eq!(out.wakeup(), 0);

        // 下一个 PCR 重新建立时钟参考点
        out.set_pcr(ms(100)).unwrap();
        assert!(out.wakeup() > 0);
    }

    #[test]
    fn test_frame_next_releases_one_unit_while_paused() {
        let (out, pool, _rx) = setup();
        out.set_mode(EsOutMode::Auto);
        let video = out.add_es(EsFormat::new(EsCategory::Video, "raw-video")).unwrap();
        let shown = || pool.delivered_for(EsCategory::Video).len();

        feed(&out, video, 0, ms(200));
        assert!(!out.is_buffering());
        assert!(wait_until(|| shown() == 10));

        out.set_pause_state(true, mdate());
        feed(&out, video, ms(200), ms(300));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(shown(), 10);

        assert_eq!(out.frame_next().unwrap(), ms(40));
        // 逐帧扩大了缓冲窗口
        assert!(out.is_buffering());
        assert!(wait_until(|| shown() == 11));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(shown(), 11);
    }
}
