use crate::core::types::{EsId, GroupId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析失败: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("不支持的编码: {0}")]
    UnsupportedCodec(String),

    #[error("解码模块打开失败: {0}")]
    ModuleError(String),

    #[error("无法获取输出设备: {0}")]
    SinkUnavailable(String),

    #[error("解复用错误: {0}")]
    DemuxError(String),

    #[error("该操作不受支持: {0}")]
    Unsupported(&'static str),

    #[error("控制命令被拒绝: {0}")]
    ControlRejected(String),

    #[error("未知 ES: {0}")]
    UnknownEs(EsId),

    #[error("未知节目: {0}")]
    UnknownProgram(GroupId),

    #[error("节目 {0} 仍包含 {1} 个 ES")]
    ProgramInUse(GroupId, usize),

    #[error("非法时间戳")]
    InvalidTimestamp,

    #[error("参数错误: {0}")]
    InvalidArgument(String),

    #[error("输入线程已停止")]
    Stopped,

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
