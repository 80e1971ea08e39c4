use crate::core::error::Result;
use crate::core::types::{ms, EsId, Tick};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: usize = 1024 * 1024;

/// 流水线调优参数
/// 所有字段都有默认值，JSON 配置中缺省的字段沿用默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 单个解码器 FIFO 的字节上限（非节流模式下超过即整体丢弃）
    pub fifo_max_bytes: usize,
    /// 所有解码器 FIFO 之和超过该值时禁止额外缓冲
    pub extra_buffering_max_bytes: usize,
    /// 节流模式下 FIFO 的块数水位
    pub pace_watermark: usize,
    /// 缓冲时长
    pub pts_delay: Tick,
    /// 视频时间戳最大超前量，按生效 pts_delay 的倍数计
    pub bogus_video_delay_factor: i64,
    /// 缓冲结束后时钟原点的提前量
    pub wake_ahead: Tick,
    /// 缓冲期间推迟 seek 的最长窗口
    pub seek_postpone_window: Tick,
    /// 推迟 seek 时的轮询间隔
    pub seek_postpone_poll: Tick,
    /// 控制命令队列容量
    pub control_fifo_size: usize,
    /// 删除 ES 时等待解码器排空的轮询间隔
    pub drain_poll: Tick,
    /// 申请输出设备的重试间隔
    pub sink_request_retry: Tick,
    /// 申请输出设备的重试次数
    pub sink_request_attempts: u32,
    /// 逐帧播放时帧时长未知的默认值
    pub frame_next_default_duration: Tick,
    /// PCR 迟到时允许的最大抖动
    pub jitter_max: Tick,
    pub min_rate: f32,
    pub max_rate: f32,
    /// 统计信息刷新间隔
    pub stats_interval: Tick,
    /// EOF 后等待解码器排空的轮询间隔
    pub idle_sleep: Tick,
    /// 音频语言偏好（"none" 表示禁止回退）
    pub audio_languages: Vec<String>,
    /// 字幕语言偏好
    pub subtitle_languages: Vec<String>,
    pub audio_track_id: Option<EsId>,
    pub subtitle_track_id: Option<EsId>,
    pub video_track_id: Option<EsId>,
    /// 自动选择的 CC 通道（从 0 开始）
    pub cc_default_channel: Option<u8>,
    /// 是否启用 CEA-708（否则只创建 608 通道）
    pub cc_prefer_708: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub subtitle_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fifo_max_bytes: 400 * MIB,
            extra_buffering_max_bytes: 10 * MIB,
            pace_watermark: 10,
            pts_delay: ms(300),
            bogus_video_delay_factor: 30,
            wake_ahead: ms(10),
            seek_postpone_window: ms(125),
            seek_postpone_poll: ms(20),
            control_fifo_size: 100,
            drain_poll: ms(20),
            sink_request_retry: ms(20),
            sink_request_attempts: 5,
            frame_next_default_duration: ms(40),
            jitter_max: ms(60_000),
            min_rate: 1.0 / 32.0,
            max_rate: 32.0,
            stats_interval: ms(250),
            idle_sleep: ms(100),
            audio_languages: Vec::new(),
            subtitle_languages: Vec::new(),
            audio_track_id: None,
            subtitle_track_id: None,
            video_track_id: None,
            cc_default_channel: Some(0),
            cc_prefer_708: false,
            video_enabled: true,
            audio_enabled: true,
            subtitle_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        info!("⚙ 加载配置: {}", path.display());
        Ok(config)
    }

    /// 保存配置为 JSON 文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// 视频时间戳超过 now + pts_delay + 该值时视为非法
    pub fn bogus_video_delay(&self, pts_delay: Tick) -> Tick {
        pts_delay * self.bogus_video_delay_factor
    }

    /// 把语言偏好字符串（逗号分隔）拆成列表
    pub fn parse_languages(list: &str) -> Vec<String> {
        list.split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.fifo_max_bytes, 400 * 1024 * 1024);
        assert_eq!(config.extra_buffering_max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.pace_watermark, 10);
        assert_eq!(config.seek_postpone_window, ms(125));
        assert_eq!(config.control_fifo_size, 100);
        assert_eq!(config.bogus_video_delay(config.pts_delay), 30 * config.pts_delay);
        assert_eq!(config.bogus_video_delay(ms(50)), ms(1_500));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "pace_watermark": 4, "audio_languages": ["fr", "en"] }}"#).unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.pace_watermark, 4);
        assert_eq!(config.audio_languages, vec!["fr".to_string(), "en".to_string()]);
        assert_eq!(config.control_fifo_size, 100);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut config = PipelineConfig::default();
        config.subtitle_track_id = Some(7);
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(PipelineConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_parse_languages() {
        assert_eq!(PipelineConfig::parse_languages("EN, fr,,none"), vec!["en", "fr", "none"]);
    }
}
