use crate::core::{Block, CcDescriptor, DecodedUnit, EsFormat, Result, Tick};

/// 解码模块处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Success,
    /// 需要重新加载解码模块（当前数据块会重新投递一次）
    Reload,
    /// 不可恢复的错误，该轨道停止解码
    Critical,
}

/// 输出设备处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Accepted,
    /// 设备要求重新协商格式，只重载解码模块
    FormatChanged,
    /// 设备失效，解码模块和设备都要重建
    Failed,
}

/// 解码模块的输出回调，由解码线程实现
pub trait DecoderOutput {
    /// 解码输出格式确定 / 变化时调用
    fn update_format(&mut self, fmt: &EsFormat) -> Result<()>;

    /// 提交一个解码单元
    fn queue(&mut self, unit: DecodedUnit);

    /// 提交从视频流中提取的 CC 数据
    fn queue_cc(&mut self, block: Block, desc: CcDescriptor);
}

/// 解码模块
pub trait DecoderModule: Send {
    /// 解码一个数据块；None 表示排空（输出所有缓存的数据）
    fn decode(&mut self, block: Option<&Block>, out: &mut dyn DecoderOutput) -> DecodeStatus;

    /// 丢弃内部缓存
    fn flush(&mut self);

    fn name(&self) -> &str;
}

/// 分帧模块：把未切分的数据流切分成完整的帧
pub trait Packetizer: Send {
    /// 输入数据块；None 表示排空
    fn packetize(&mut self, block: Option<Block>) -> Vec<Block>;

    fn flush(&mut self);

    /// 当前输出格式（随码流参数变化而变化）
    fn output_format(&self) -> &EsFormat;
}

/// 模块工厂：按格式打开解码 / 分帧模块
pub trait ModuleFactory: Send + Sync {
    fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>>;

    /// 返回 Ok(None) 表示该格式不需要分帧
    fn open_packetizer(&self, fmt: &EsFormat) -> Result<Option<Box<dyn Packetizer>>>;
}

/// 视频输出
pub trait VideoSink: Send {
    fn display(&mut self, unit: DecodedUnit) -> SinkStatus;

    /// 丢弃尚未显示的画面
    fn flush(&mut self);

    fn change_pause(&mut self, paused: bool, date: Tick);

    /// 暂停时显示下一帧，返回该帧时长
    fn next_picture(&mut self) -> Option<Tick> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn description(&self) -> String;
}

/// 音频输出
pub trait AudioSink: Send {
    fn play(&mut self, unit: DecodedUnit) -> SinkStatus;

    fn flush(&mut self);

    /// 播放完剩余缓冲
    fn drain(&mut self) {}

    fn change_pause(&mut self, paused: bool, date: Tick);

    fn description(&self) -> String;
}

/// 字幕输出
pub trait SpuSink: Send {
    fn display(&mut self, unit: DecodedUnit) -> SinkStatus;

    fn flush(&mut self);

    fn description(&self) -> String;
}

/// 共享的输出设备池（外部提供）
/// 解码线程按格式借用设备，结束后归还以便在切换轨道时复用
pub trait SinkPool: Send + Sync {
    fn request_video_sink(&self, fmt: &EsFormat, buffer_count: usize) -> Option<Box<dyn VideoSink>>;

    fn request_audio_sink(&self, fmt: &EsFormat) -> Option<Box<dyn AudioSink>>;

    fn request_spu_sink(&self, fmt: &EsFormat) -> Option<Box<dyn SpuSink>>;

    fn release_video_sink(&self, sink: Box<dyn VideoSink>);

    fn release_audio_sink(&self, sink: Box<dyn AudioSink>);

    fn release_spu_sink(&self, sink: Box<dyn SpuSink>);
}
