//! 合成的外部协作者：直通解码模块、记录型输出设备池和合成 Demuxer
//! 用于演示程序和测试，不依赖真实的编解码库

use crate::core::{
    mdate, ms, Block, BlockFlags, CcCodec, CcDescriptor, DecodedUnit, EsCategory, EsFormat, EsId,
    PipelineError, Result, Tick,
};
use crate::player::demuxer_source::{DemuxStatus, DemuxerSource, TitleInfo};
use crate::player::es_out::EsOut;
use crate::player::modules::{
    AudioSink, DecodeStatus, DecoderModule, DecoderOutput, ModuleFactory, Packetizer, SinkPool,
    SinkStatus, SpuSink, VideoSink,
};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// 视频格式 extra 中带这个标记时，直通解码器会输出 608 CC 数据
pub const CC608_MARKER: &[u8] = b"cc608";

// ========== 解码模块 ==========

/// 直通解码器：每个数据块产出一个解码单元
pub struct RawDecoder {
    fmt: EsFormat,
    format_sent: bool,
    cc: Option<CcDescriptor>,
}

impl RawDecoder {
    pub fn new(fmt: &EsFormat) -> Self {
        let cc = (fmt.category == EsCategory::Video && fmt.extra == CC608_MARKER)
            .then(|| CcDescriptor::new(CcCodec::Cea608, [0, 1]));
        Self {
            fmt: fmt.clone(),
            format_sent: false,
            cc,
        }
    }
}

impl DecoderModule for RawDecoder {
    fn decode(&mut self, block: Option<&Block>, out: &mut dyn DecoderOutput) -> DecodeStatus {
        let Some(block) = block else {
            return DecodeStatus::Success;
        };
        if !self.format_sent && out.update_format(&self.fmt).is_ok() {
            self.format_sent = true;
        }
        if block.flags.contains(BlockFlags::CORRUPTED) {
            return DecodeStatus::Success;
        }

        let pts = block.pts.or(block.dts);
        if let Some(desc) = &self.cc {
            let mut cc = Block::new(block.data.clone()).with_length(block.length);
            if let Some(pts) = pts {
                cc = cc.with_pts(pts);
            }
            out.queue_cc(cc, desc.clone());
        }

        let mut unit = DecodedUnit::new(self.fmt.category, pts, block.length, block.data.clone());
        if self.fmt.category == EsCategory::Subtitle {
            unit.stop = pts.map(|p| p + block.length);
        }
        out.queue(unit);
        DecodeStatus::Success
    }

    fn flush(&mut self) {}

    fn name(&self) -> &str {
        "raw"
    }
}

/// 直通分帧器，原样输出
pub struct RawPacketizer {
    fmt: EsFormat,
}

impl Packetizer for RawPacketizer {
    fn packetize(&mut self, block: Option<Block>) -> Vec<Block> {
        block.into_iter().collect()
    }

    fn flush(&mut self) {}

    fn output_format(&self) -> &EsFormat {
        &self.fmt
    }
}

/// 直通模块工厂，可以配置若干不支持的编码
#[derive(Default)]
pub struct RawModuleFactory {
    unsupported: Vec<String>,
    opened: AtomicUsize,
}

impl RawModuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unsupported(mut self, codec: impl Into<String>) -> Self {
        self.unsupported.push(codec.into());
        self
    }

    /// 已打开的解码模块数量
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ModuleFactory for RawModuleFactory {
    fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
        if self.unsupported.iter().any(|c| c == &fmt.codec) {
            return Err(PipelineError::UnsupportedCodec(fmt.codec.clone()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RawDecoder::new(fmt)))
    }

    fn open_packetizer(&self, fmt: &EsFormat) -> Result<Option<Box<dyn Packetizer>>> {
        if fmt.packetized {
            return Ok(None);
        }
        let mut out = fmt.clone();
        out.packetized = true;
        Ok(Some(Box::new(RawPacketizer { fmt: out })))
    }
}

// ========== 输出设备 ==========

/// 送达输出设备的一个单元
#[derive(Debug, Clone)]
pub struct Delivered {
    pub sink: String,
    pub unit: DecodedUnit,
    /// 送达时的系统时间
    pub at: Tick,
}

/// 输出设备收到的控制动作
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Flush(String),
    Pause { sink: String, paused: bool, date: Tick },
    Drain(String),
}

/// 所有记录型设备共享的状态
#[derive(Default)]
struct SinkShared {
    delivered: SegQueue<Delivered>,
    history: Mutex<Vec<Delivered>>,
    events: SegQueue<SinkEvent>,
    event_history: Mutex<Vec<SinkEvent>>,
    fail_next: AtomicUsize,
}

impl SinkShared {
    fn accept(&self, sink: &str, unit: DecodedUnit) -> SinkStatus {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            warn!("⚠ {} 模拟设备失效", sink);
            return SinkStatus::Failed;
        }
        self.delivered.push(Delivered {
            sink: sink.to_string(),
            unit,
            at: mdate(),
        });
        SinkStatus::Accepted
    }
}

struct RecordingSink {
    name: String,
    shared: Arc<SinkShared>,
    pending: usize,
}

impl RecordingSink {
    fn deliver(&mut self, unit: DecodedUnit) -> SinkStatus {
        self.shared.accept(&self.name, unit)
    }

    fn flush(&mut self) {
        self.pending = 0;
        self.shared.events.push(SinkEvent::Flush(self.name.clone()));
    }

    fn change_pause(&mut self, paused: bool, date: Tick) {
        self.shared.events.push(SinkEvent::Pause {
            sink: self.name.clone(),
            paused,
            date,
        });
    }
}

impl VideoSink for RecordingSink {
    fn display(&mut self, unit: DecodedUnit) -> SinkStatus {
        self.deliver(unit)
    }

    fn flush(&mut self) {
        RecordingSink::flush(self)
    }

    fn change_pause(&mut self, paused: bool, date: Tick) {
        RecordingSink::change_pause(self, paused, date)
    }

    fn next_picture(&mut self) -> Option<Tick> {
        Some(ms(40))
    }

    fn is_empty(&self) -> bool {
        self.pending == 0
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

impl AudioSink for RecordingSink {
    fn play(&mut self, unit: DecodedUnit) -> SinkStatus {
        self.deliver(unit)
    }

    fn flush(&mut self) {
        RecordingSink::flush(self)
    }

    fn drain(&mut self) {
        self.shared.events.push(SinkEvent::Drain(self.name.clone()));
    }

    fn change_pause(&mut self, paused: bool, date: Tick) {
        RecordingSink::change_pause(self, paused, date)
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

impl SpuSink for RecordingSink {
    fn display(&mut self, unit: DecodedUnit) -> SinkStatus {
        self.deliver(unit)
    }

    fn flush(&mut self) {
        RecordingSink::flush(self)
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

/// 记录所有送达单元的设备池；归还的设备会被下一次请求复用
pub struct RecordingSinkPool {
    shared: Arc<SinkShared>,
    available: AtomicBool,
    next_id: AtomicUsize,
    requested: AtomicUsize,
    released: AtomicUsize,
    parked_video: Mutex<Vec<Box<dyn VideoSink>>>,
    parked_audio: Mutex<Vec<Box<dyn AudioSink>>>,
    parked_spu: Mutex<Vec<Box<dyn SpuSink>>>,
}

impl RecordingSinkPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(SinkShared::default()),
            available: AtomicBool::new(true),
            next_id: AtomicUsize::new(1),
            requested: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            parked_video: Mutex::new(Vec::new()),
            parked_audio: Mutex::new(Vec::new()),
            parked_spu: Mutex::new(Vec::new()),
        })
    }

    /// 模拟设备耗尽
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 让接下来 n 次输出返回 Failed
    pub fn fail_next(&self, n: usize) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// 迄今为止送达的全部单元
    pub fn delivered(&self) -> Vec<Delivered> {
        let mut history = self.shared.history.lock();
        while let Some(d) = self.shared.delivered.pop() {
            history.push(d);
        }
        history.clone()
    }

    pub fn delivered_for(&self, category: EsCategory) -> Vec<Delivered> {
        self.delivered()
            .into_iter()
            .filter(|d| d.unit.category == category)
            .collect()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        let mut history = self.shared.event_history.lock();
        while let Some(e) = self.shared.events.pop() {
            history.push(e);
        }
        history.clone()
    }

    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn create(&self, category: EsCategory) -> Option<RecordingSink> {
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        self.requested.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Some(RecordingSink {
            name: format!("{}-{}", category, id),
            shared: self.shared.clone(),
            pending: 0,
        })
    }
}

impl SinkPool for RecordingSinkPool {
    fn request_video_sink(&self, fmt: &EsFormat, buffer_count: usize) -> Option<Box<dyn VideoSink>> {
        debug!("🖼 请求视频输出: {} ({} 个缓冲)", fmt.codec, buffer_count);
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(sink) = self.parked_video.lock().pop() {
            self.requested.fetch_add(1, Ordering::SeqCst);
            return Some(sink);
        }
        self.create(EsCategory::Video).map(|s| Box::new(s) as Box<dyn VideoSink>)
    }

    fn request_audio_sink(&self, fmt: &EsFormat) -> Option<Box<dyn AudioSink>> {
        debug!("🔊 请求音频输出: {}", fmt.codec);
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(sink) = self.parked_audio.lock().pop() {
            self.requested.fetch_add(1, Ordering::SeqCst);
            return Some(sink);
        }
        self.create(EsCategory::Audio).map(|s| Box::new(s) as Box<dyn AudioSink>)
    }

    fn request_spu_sink(&self, _fmt: &EsFormat) -> Option<Box<dyn SpuSink>> {
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(sink) = self.parked_spu.lock().pop() {
            self.requested.fetch_add(1, Ordering::SeqCst);
            return Some(sink);
        }
        self.create(EsCategory::Subtitle).map(|s| Box::new(s) as Box<dyn SpuSink>)
    }

    fn release_video_sink(&self, sink: Box<dyn VideoSink>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.parked_video.lock().push(sink);
    }

    fn release_audio_sink(&self, sink: Box<dyn AudioSink>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.parked_audio.lock().push(sink);
    }

    fn release_spu_sink(&self, sink: Box<dyn SpuSink>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.parked_spu.lock().push(sink);
    }
}

// ========== 合成 Demuxer ==========

/// 合成轨道：按固定间隔产生数据块
#[derive(Debug, Clone)]
pub struct SyntheticTrack {
    pub fmt: EsFormat,
    pub interval: Tick,
    pub payload: usize,
}

/// 按时间步进产生数据的 Demuxer
/// 每次 demux 先投递 PCR，再投递 [time, time + step) 内的数据块
pub struct SyntheticDemuxer {
    tracks: Vec<SyntheticTrack>,
    ids: Vec<EsId>,
    next_pts: Vec<Tick>,
    time: Tick,
    step: Tick,
    length: Tick,
    fail_at: Option<Tick>,
    titles: Vec<TitleInfo>,
    title: usize,
    seekpoint: usize,
    pending_discontinuity: bool,
}

impl SyntheticDemuxer {
    pub fn new(length: Tick) -> Self {
        Self {
            tracks: Vec::new(),
            ids: Vec::new(),
            next_pts: Vec::new(),
            time: 0,
            step: ms(20),
            length,
            fail_at: None,
            titles: Vec::new(),
            title: 0,
            seekpoint: 0,
            pending_discontinuity: false,
        }
    }

    pub fn with_track(mut self, fmt: EsFormat, interval: Tick) -> Self {
        self.tracks.push(SyntheticTrack {
            fmt,
            interval: interval.max(1),
            payload: 188,
        });
        self
    }

    /// 在该时间点返回解复用错误
    pub fn with_failure_at(mut self, time: Tick) -> Self {
        self.fail_at = Some(time);
        self
    }

    /// 单一标题，按给定起点划分章节
    pub fn with_chapters(mut self, seekpoints: Vec<Tick>) -> Self {
        self.titles = vec![TitleInfo {
            name: "main".to_string(),
            length: self.length,
            seekpoints,
        }];
        self
    }

    /// 演示用的节目：带 CC 的视频、两条音轨和一条字幕
    pub fn demo(length: Tick) -> Self {
        let mut video = EsFormat::new(EsCategory::Video, "raw-video").with_id(100);
        video.video.width = 1280;
        video.video.height = 720;
        video.video.frame_rate_num = 25;
        video.video.frame_rate_den = 1;
        video.video.dpb_size = 2;
        video.extra = CC608_MARKER.to_vec();

        let mut audio_en = EsFormat::new(EsCategory::Audio, "raw-audio")
            .with_id(200)
            .with_language("en");
        audio_en.audio.sample_rate = 48_000;
        audio_en.audio.channels = 2;
        let mut audio_fr = audio_en.clone().with_id(201).with_language("fr");
        audio_fr.description = Some("Français".to_string());

        let subtitle = EsFormat::new(EsCategory::Subtitle, "raw-text")
            .with_id(300)
            .with_language("en");

        Self::new(length)
            .with_track(video, ms(40))
            .with_track(audio_en, ms(20))
            .with_track(audio_fr, ms(20))
            .with_track(subtitle, ms(1000))
            .with_chapters(vec![0, length / 2])
    }

    fn align(&mut self) {
        for (i, track) in self.tracks.iter().enumerate() {
            let aligned = (self.time + track.interval - 1) / track.interval * track.interval;
            self.next_pts[i] = aligned;
        }
        self.seekpoint = self.current_seekpoint();
        self.pending_discontinuity = true;
    }

    fn current_seekpoint(&self) -> usize {
        self.titles
            .get(self.title)
            .map(|t| t.seekpoints.iter().filter(|&&s| s <= self.time).count().saturating_sub(1))
            .unwrap_or(0)
    }
}

impl DemuxerSource for SyntheticDemuxer {
    fn open(&mut self, out: &EsOut) -> Result<()> {
        info!("📂 打开合成数据源: {} 条轨道, 时长 {}ms", self.tracks.len(), self.length / 1000);
        self.ids.clear();
        for track in &self.tracks {
            let id = out.add_es(track.fmt.clone())?;
            self.ids.push(id);
        }
        self.next_pts = vec![0; self.tracks.len()];
        Ok(())
    }

    fn demux(&mut self, out: &EsOut) -> DemuxStatus {
        if let Some(fail_at) = self.fail_at {
            if self.time >= fail_at {
                return DemuxStatus::Error(format!("合成数据在 {}ms 处损坏", fail_at / 1000));
            }
        }
        if self.time >= self.length {
            return DemuxStatus::Eof;
        }

        if let Err(e) = out.set_pcr(self.time) {
            return DemuxStatus::Error(e.to_string());
        }

        let end = (self.time + self.step).min(self.length);
        for (i, track) in self.tracks.iter().enumerate() {
            while self.next_pts[i] < end {
                let pts = self.next_pts[i];
                let mut block = Block::new(vec![(pts / 1000 % 251) as u8; track.payload])
                    .with_pts(pts)
                    .with_dts(pts)
                    .with_length(track.interval);
                if self.pending_discontinuity {
                    block = block.with_flags(BlockFlags::DISCONTINUITY);
                }
                if let Err(e) = out.send(self.ids[i], block) {
                    warn!("⚠ 投递数据块失败: {}", e);
                }
                self.next_pts[i] += track.interval;
            }
        }
        self.pending_discontinuity = false;
        self.time = end;
        self.seekpoint = self.current_seekpoint();
        DemuxStatus::Ok
    }

    fn seek_time(&mut self, time: Tick, _precise: bool) -> Result<()> {
        self.time = time.clamp(0, self.length);
        self.align();
        Ok(())
    }

    fn seek_position(&mut self, position: f64, precise: bool) -> Result<()> {
        let time = (position.clamp(0.0, 1.0) * self.length as f64) as Tick;
        self.seek_time(time, precise)
    }

    fn time(&self) -> Option<Tick> {
        Some(self.time)
    }

    fn position(&self) -> f64 {
        if self.length > 0 {
            self.time as f64 / self.length as f64
        } else {
            0.0
        }
    }

    fn length(&self) -> Option<Tick> {
        Some(self.length)
    }

    fn titles(&self) -> Vec<TitleInfo> {
        self.titles.clone()
    }

    fn title(&self) -> usize {
        self.title
    }

    fn seekpoint(&self) -> usize {
        self.seekpoint
    }

    fn set_title(&mut self, title: usize) -> Result<()> {
        if title >= self.titles.len() {
            return Err(PipelineError::InvalidArgument(format!("标题 {} 不存在", title)));
        }
        self.title = title;
        self.seek_time(0, true)
    }

    fn set_seekpoint(&mut self, seekpoint: usize) -> Result<()> {
        let start = self
            .titles
            .get(self.title)
            .and_then(|t| t.seekpoints.get(seekpoint))
            .copied()
            .ok_or_else(|| PipelineError::InvalidArgument(format!("章节 {} 不存在", seekpoint)))?;
        self.seek_time(start, true)
    }

    fn description(&self) -> String {
        format!("synthetic://{}ms", self.length / 1000)
    }
}
