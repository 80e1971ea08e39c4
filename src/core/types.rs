use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// 时间刻度（微秒）
pub type Tick = i64;

pub const TICK_PER_MS: Tick = 1_000;
pub const TICK_PER_SEC: Tick = 1_000_000;

/// 毫秒转 Tick
pub const fn ms(v: i64) -> Tick {
    v * TICK_PER_MS
}

/// ES 标识（由 ES 输出管理器分配）
pub type EsId = i32;

/// 节目（group）标识
pub type GroupId = i32;

/// 可被自动选择的最低优先级
pub const ES_PRIORITY_SELECTABLE_MIN: i32 = 0;
/// 不可被自动选择
pub const ES_PRIORITY_NOT_SELECTABLE: i32 = -1;

/// ES 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EsCategory {
    Video,
    Audio,
    Subtitle,
}

impl EsCategory {
    pub const ALL: [EsCategory; 3] = [EsCategory::Video, EsCategory::Audio, EsCategory::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            EsCategory::Video => "video",
            EsCategory::Audio => "audio",
            EsCategory::Subtitle => "spu",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EsCategory::Video => 0,
            EsCategory::Audio => 1,
            EsCategory::Subtitle => 2,
        }
    }
}

impl fmt::Display for EsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 视频格式参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// 解码器需要保留的参考帧数
    pub dpb_size: u32,
}

impl VideoFormat {
    /// 单帧时长，未知时返回 None
    pub fn frame_duration(&self) -> Option<Tick> {
        if self.frame_rate_num == 0 || self.frame_rate_den == 0 {
            return None;
        }
        Some(TICK_PER_SEC * self.frame_rate_den as i64 / self.frame_rate_num as i64)
    }
}

/// 音频格式参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 隐藏字幕（Closed Caption）编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CcCodec {
    Cea608,
    Cea708,
}

impl CcCodec {
    /// 该编码允许的最大通道数
    pub fn max_channels(&self) -> u8 {
        match self {
            CcCodec::Cea608 => 4,
            CcCodec::Cea708 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CcCodec::Cea608 => "cc608",
            CcCodec::Cea708 => "cc708",
        }
    }
}

/// 字幕格式参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleFormat {
    /// CC 子轨道：所属编码与通道
    pub cc: Option<(CcCodec, u8)>,
}

/// ES 格式描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsFormat {
    pub category: EsCategory,
    /// 编码标识（如 "h264"、"aac"、"srt"）
    pub codec: String,
    /// 解复用器声明的轨道 id，负数表示由管理器分配
    pub id: EsId,
    pub group: GroupId,
    pub priority: i32,
    pub language: Option<String>,
    pub description: Option<String>,
    /// 数据块是否已经按帧切分（否则需要 packetizer）
    pub packetized: bool,
    pub video: VideoFormat,
    pub audio: AudioFormat,
    pub subtitle: SubtitleFormat,
    #[serde(default)]
    pub extra: Vec<u8>,
}

impl EsFormat {
    pub fn new(category: EsCategory, codec: impl Into<String>) -> Self {
        Self {
            category,
            codec: codec.into(),
            id: -1,
            group: 0,
            priority: ES_PRIORITY_SELECTABLE_MIN,
            language: None,
            description: None,
            packetized: true,
            video: VideoFormat::default(),
            audio: AudioFormat::default(),
            subtitle: SubtitleFormat::default(),
            extra: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: EsId) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = group;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 判断两个格式对于解码模块来说是否等价（忽略描述信息）
    pub fn is_similar(&self, other: &EsFormat) -> bool {
        if self.category != other.category || self.codec != other.codec {
            return false;
        }
        match self.category {
            EsCategory::Video => {
                self.video.width == other.video.width && self.video.height == other.video.height
            }
            EsCategory::Audio => {
                self.audio.sample_rate == other.audio.sample_rate
                    && self.audio.channels == other.audio.channels
            }
            EsCategory::Subtitle => self.subtitle == other.subtitle,
        }
    }
}

/// 数据块标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockFlags(u32);

impl BlockFlags {
    pub const NONE: BlockFlags = BlockFlags(0);
    /// 与前一个数据块不连续
    pub const DISCONTINUITY: BlockFlags = BlockFlags(1 << 0);
    /// 数据已损坏
    pub const CORRUPTED: BlockFlags = BlockFlags(1 << 1);
    /// 仅用于预滚动，不得显示
    pub const PREROLL: BlockFlags = BlockFlags(1 << 2);
    /// 已触发过一次模块重载
    pub const RELOADED: BlockFlags = BlockFlags(1 << 3);

    pub fn contains(&self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BlockFlags {
    type Output = BlockFlags;

    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BlockFlags {
    fn bitor_assign(&mut self, rhs: BlockFlags) {
        self.0 |= rhs.0;
    }
}

/// 压缩数据块（解复用器 → 解码线程）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    pub pts: Option<Tick>,
    pub dts: Option<Tick>,
    /// 持续时长，未知为 0
    pub length: Tick,
    pub flags: BlockFlags,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pts: None,
            dts: None,
            length: 0,
            flags: BlockFlags::NONE,
        }
    }

    pub fn with_pts(mut self, pts: Tick) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: Tick) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_length(mut self, length: Tick) -> Self {
        self.length = length;
        self
    }

    pub fn with_flags(mut self, flags: BlockFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 解码后的输出单元（视频帧 / 音频缓冲 / 字幕画面）
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUnit {
    pub category: EsCategory,
    /// 流时间戳
    pub pts: Option<Tick>,
    /// 字幕结束时间（流时间，输出前由解码线程换算为系统时间）
    pub stop: Option<Tick>,
    pub duration: Tick,
    /// 转换后的系统时间，由解码线程填写
    pub date: Tick,
    pub data: Vec<u8>,
}

impl DecodedUnit {
    pub fn new(category: EsCategory, pts: Option<Tick>, duration: Tick, data: Vec<u8>) -> Self {
        Self {
            category,
            pts,
            stop: None,
            duration,
            date: 0,
            data,
        }
    }
}

/// 解码器报告的 CC 可用通道
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CcDescriptor {
    pub codec: Option<CcCodec>,
    pub channels: BTreeSet<u8>,
}

impl CcDescriptor {
    pub fn new(codec: CcCodec, channels: impl IntoIterator<Item = u8>) -> Self {
        Self {
            codec: Some(codec),
            channels: channels
                .into_iter()
                .filter(|ch| *ch < codec.max_channels())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// 输入线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputState {
    Init,
    Opening,
    Playing,
    Paused,
    End,
    Error,
}

impl Default for InputState {
    fn default() -> Self {
        InputState::Init
    }
}

/// 360° 视角
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub fov: f32,
}

impl Viewpoint {
    /// 将角度限制在合法范围内
    pub fn clip(&mut self) {
        self.yaw = self.yaw.rem_euclid(360.0);
        self.pitch = self.pitch.clamp(-90.0, 90.0);
        self.roll = self.roll.rem_euclid(360.0);
        self.fov = self.fov.clamp(20.0, 150.0);
    }

    /// 在当前视角上叠加相对变化
    pub fn add(&mut self, delta: &Viewpoint) {
        self.yaw += delta.yaw;
        self.pitch += delta.pitch;
        self.roll += delta.roll;
        self.fov += delta.fov;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_flags() {
        let mut flags = BlockFlags::DISCONTINUITY | BlockFlags::CORRUPTED;
        assert!(flags.contains(BlockFlags::DISCONTINUITY));
        assert!(!flags.contains(BlockFlags::PREROLL));
        flags.remove(BlockFlags::DISCONTINUITY);
        assert!(!flags.contains(BlockFlags::DISCONTINUITY));
        assert!(flags.contains(BlockFlags::CORRUPTED));
    }

    #[test]
    fn test_cc_descriptor_filters_channels() {
        let desc = CcDescriptor::new(CcCodec::Cea608, [0, 3, 4, 9]);
        assert_eq!(desc.channels.into_iter().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_format_similarity() {
        let mut a = EsFormat::new(EsCategory::Video, "h264");
        a.video.width = 1920;
        a.video.height = 1080;
        let mut b = a.clone().with_language("en");
        assert!(a.is_similar(&b));
        b.video.width = 1280;
        assert!(!a.is_similar(&b));
    }

    #[test]
    fn test_viewpoint_clip() {
        let mut vp = Viewpoint { yaw: 370.0, pitch: 120.0, roll: -10.0, fov: 10.0 };
        vp.clip();
        assert_eq!(vp.yaw, 10.0);
        assert_eq!(vp.pitch, 90.0);
        assert_eq!(vp.roll, 350.0);
        assert_eq!(vp.fov, 20.0);
    }
}
