use crate::core::{EsId, GroupId, PipelineError, Result, Tick};
use crate::player::es_out::EsOut;

/// 一次 demux 调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxStatus {
    Ok,
    Eof,
    Error(String),
}

/// 标题（章节集合）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TitleInfo {
    pub name: String,
    pub length: Tick,
    /// 每个 seekpoint 的起始时间
    pub seekpoints: Vec<Tick>,
}

/// 菜单导航动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    Activate,
    Up,
    Down,
    Left,
    Right,
    Popup,
    Menu,
}

/// Demuxer 数据源抽象接口
///
/// 不同的媒体源（本地文件、网络流、内存流等）实现这个接口。
/// 数据源通过 EsOut 声明轨道、投递数据块和 PCR，
/// 所有方法都只在输入线程中调用。
pub trait DemuxerSource: Send {
    /// 打开数据源并声明初始轨道
    fn open(&mut self, out: &EsOut) -> Result<()>;

    /// 读取并投递下一批数据
    fn demux(&mut self, out: &EsOut) -> DemuxStatus;

    /// 跳转到指定时间；precise 为 false 时允许跳到附近的关键帧
    fn seek_time(&mut self, _time: Tick, _precise: bool) -> Result<()> {
        Err(PipelineError::Unsupported("seek_time"))
    }

    /// 跳转到相对位置 [0, 1]
    fn seek_position(&mut self, _position: f64, _precise: bool) -> Result<()> {
        Err(PipelineError::Unsupported("seek_position"))
    }

    fn time(&self) -> Option<Tick>;

    fn position(&self) -> f64;

    fn length(&self) -> Option<Tick>;

    fn can_pause(&self) -> bool {
        true
    }

    /// 能否由播放端控制读取节奏（本地文件可以，直播流不行）
    fn can_control_pace(&self) -> bool {
        true
    }

    /// (能否自行控制速率, 是否需要由时钟缩放时间戳)
    fn rate_control(&self) -> (bool, bool) {
        (false, true)
    }

    /// 返回实际生效的速率
    fn set_rate(&mut self, _rate: f32) -> Result<f32> {
        Err(PipelineError::Unsupported("set_rate"))
    }

    fn set_pause_state(&mut self, _paused: bool) -> Result<()> {
        Ok(())
    }

    /// 推荐的 pts_delay（直播流通常更大）
    fn pts_delay(&self) -> Option<Tick> {
        None
    }

    fn titles(&self) -> Vec<TitleInfo> {
        Vec::new()
    }

    fn title(&self) -> usize {
        0
    }

    fn seekpoint(&self) -> usize {
        0
    }

    fn set_title(&mut self, _title: usize) -> Result<()> {
        Err(PipelineError::Unsupported("set_title"))
    }

    fn set_seekpoint(&mut self, _seekpoint: usize) -> Result<()> {
        Err(PipelineError::Unsupported("set_seekpoint"))
    }

    fn navigate(&mut self, _action: NavAction) -> Result<()> {
        Err(PipelineError::Unsupported("navigate"))
    }

    /// 通知数据源切换了节目
    fn set_group(&mut self, _group: GroupId) -> Result<()> {
        Ok(())
    }

    /// 通知数据源选中了某个轨道
    fn set_es(&mut self, _id: EsId) -> Result<()> {
        Ok(())
    }

    /// 数据源自带录制能力时返回 Ok
    fn set_record_state(&mut self, _recording: bool) -> Result<()> {
        Err(PipelineError::Unsupported("record"))
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
