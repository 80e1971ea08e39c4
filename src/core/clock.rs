use crate::core::error::{PipelineError, Result};
use crate::core::types::{Tick, TICK_PER_SEC};
use log::{error, warn};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// 流时间戳跳变超过该值视为不连续
const CR_MAX_GAP: Tick = 60 * TICK_PER_SEC;
/// 保留的迟到样本数
const LATE_COUNT: usize = 3;

/// 单调系统时间（微秒）
pub fn mdate() -> Tick {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as Tick + 1
}

/// 把系统时间点换算成 Instant（用于带截止时间的等待）
pub fn deadline_instant(date: Tick) -> Instant {
    let delta = (date - mdate()).max(0) as u64;
    Instant::now() + Duration::from_micros(delta)
}

#[derive(Debug, Clone, Copy)]
struct ClockPoint {
    stream: Tick,
    system: Tick,
}

/// 时钟状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub stream_start: Tick,
    pub system_start: Tick,
    pub stream_duration: Tick,
    pub system_duration: Tick,
}

/// 节目时钟 - 把流时间戳映射到系统时间
/// 同一节目的所有 ES 共享一个实例，内部自带锁
#[derive(Clone)]
pub struct ProgramClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    reference: Option<ClockPoint>,
    last: Option<ClockPoint>,
    rate: f32,
    paused: bool,
    pause_date: Tick,
    pts_delay: Tick,
    late: [Tick; LATE_COUNT],
    late_index: usize,
}

impl ClockInner {
    fn stream_to_system(&self, reference: ClockPoint, ts: Tick) -> Tick {
        reference.system + ((ts - reference.stream) as f64 / self.rate as f64) as Tick
    }

    fn late_median(&self) -> Tick {
        let mut values = self.late;
        values.sort_unstable();
        values[LATE_COUNT / 2]
    }
}

impl ProgramClock {
    pub fn new(pts_delay: Tick, rate: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                reference: None,
                last: None,
                rate,
                paused: false,
                pause_date: 0,
                pts_delay,
                late: [0; LATE_COUNT],
                late_index: 0,
            })),
        }
    }

    /// 输入新的 PCR
    /// 返回 PCR 迟到的时长（未迟到返回 None）
    pub fn update(&self, stream: Tick, system: Tick) -> Option<Tick> {
        let mut inner = self.inner.lock();

        let gap = inner
            .last
            .map(|last| (last.stream - stream).abs() > CR_MAX_GAP)
            .unwrap_or(false);
        if inner.reference.is_none() || gap {
            if gap {
                warn!("⚠ 时钟跳变，重新建立参考点 (stream={}us)", stream);
            }
            inner.reference = Some(ClockPoint { stream, system });
        }

        inner.last = Some(ClockPoint { stream, system });

        let reference = inner.reference?;
        let expected = inner.stream_to_system(reference, stream);
        let late = (system - inner.pts_delay) - expected;
        if late <= 0 {
            return None;
        }
        let index = inner.late_index;
        inner.late[index] = late;
        inner.late_index = (index + 1) % LATE_COUNT;
        Some(late)
    }

    /// 丢弃参考点，下一次 PCR 重新建立映射
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.reference = None;
        inner.last = None;
    }

    /// 修改播放速率，保持最近一次 PCR 的映射不变
    pub fn change_rate(&self, rate: f32) {
        let mut inner = self.inner.lock();
        if let (Some(mut reference), Some(last)) = (inner.reference, inner.last) {
            let elapsed = (last.system - reference.system) as f64;
            reference.system = last.system - (elapsed * inner.rate as f64 / rate as f64) as Tick;
            inner.reference = Some(reference);
        }
        inner.rate = rate;
    }

    /// 暂停 / 恢复；恢复时把参考点后移暂停的时长
    pub fn change_pause(&self, paused: bool, date: Tick) {
        let mut inner = self.inner.lock();
        if inner.paused {
            let duration = date - inner.pause_date;
            if duration > 0 {
                if let Some(reference) = inner.reference.as_mut() {
                    reference.system += duration;
                }
                if let Some(last) = inner.last.as_mut() {
                    last.system += duration;
                }
            }
        }
        inner.pause_date = date;
        inner.paused = paused;
    }

    /// 平移系统时间原点，使参考点对应到 system
    pub fn change_system_origin(&self, system: Tick) {
        let mut inner = self.inner.lock();
        if let Some(reference) = inner.reference {
            let offset = system - reference.system;
            if let Some(r) = inner.reference.as_mut() {
                r.system += offset;
            }
            if let Some(last) = inner.last.as_mut() {
                last.system += offset;
            }
        }
    }

    /// 流时间 → 系统时间（已加上 pts_delay）
    /// bound: 结果超过 now + pts_delay + bound 视为非法
    pub fn convert_ts(&self, ts: Tick, bound: Option<Tick>) -> Result<Tick> {
        let inner = self.inner.lock();
        let reference = inner.reference.ok_or(PipelineError::InvalidTimestamp)?;

        let system = inner.stream_to_system(reference, ts);
        let converted = system + inner.pts_delay;

        if let Some(bound) = bound {
            if converted >= mdate() + inner.pts_delay + bound {
                error!(
                    "❌ 时间戳转换失败: 超出上限 {}ms",
                    (converted - mdate()) / 1000
                );
                return Err(PipelineError::InvalidTimestamp);
            }
        }
        Ok(converted)
    }

    /// 下一次需要唤醒解复用的系统时间
    pub fn wakeup(&self) -> Option<Tick> {
        let inner = self.inner.lock();
        let (reference, last) = (inner.reference?, inner.last?);
        Some(inner.stream_to_system(reference, last.stream))
    }

    pub fn state(&self) -> Option<ClockState> {
        let inner = self.inner.lock();
        let (reference, last) = (inner.reference?, inner.last?);
        Some(ClockState {
            stream_start: reference.stream,
            system_start: reference.system,
            stream_duration: last.stream - reference.stream,
            system_duration: last.system - reference.system,
        })
    }

    pub fn set_jitter(&self, pts_delay: Tick) {
        let mut inner = self.inner.lock();
        let delta = pts_delay - inner.pts_delay;
        for late in inner.late.iter_mut() {
            *late = (*late - delta).max(0);
        }
        inner.pts_delay = pts_delay;
    }

    /// 当前抖动估计：pts_delay 加上迟到样本的中位数
    pub fn jitter(&self) -> Tick {
        let inner = self.inner.lock();
        inner.pts_delay + inner.late_median()
    }

    pub fn rate(&self) -> f32 {
        self.inner.lock().rate
    }

    /// 当前生效的 pts_delay（含抖动）
    pub fn pts_delay(&self) -> Tick {
        self.inner.lock().pts_delay
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn has_reference(&self) -> bool {
        self.inner.lock().reference.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ms;

    #[test]
    fn test_convert_without_reference_fails() {
        let clock = ProgramClock::new(ms(300), 1.0);
        assert!(clock.convert_ts(0, None).is_err());
        assert!(clock.state().is_none());
        assert!(clock.wakeup().is_none());
    }

    #[test]
    fn test_convert_after_update() {
        let clock = ProgramClock::new(ms(100), 1.0);
        let now = mdate();
        clock.update(ms(1000), now);
        assert_eq!(clock.convert_ts(ms(1500), None).unwrap(), now + ms(500) + ms(100));
    }

    #[test]
    fn test_state_tracks_stream_duration() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(ms(1000), now);
        clock.update(ms(1400), now + ms(10));
        let state = clock.state().unwrap();
        assert_eq!(state.stream_start, ms(1000));
        assert_eq!(state.stream_duration, ms(400));
        assert_eq!(state.system_duration, ms(10));
    }

    #[test]
    fn test_pause_shifts_reference() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(0, now);
        let before = clock.convert_ts(ms(100), None).unwrap();
        clock.change_pause(true, now + ms(50));
        clock.change_pause(false, now + ms(550));
        let after = clock.convert_ts(ms(100), None).unwrap();
        assert_eq!(after - before, ms(500));
    }

    #[test]
    fn test_conversion_unchanged_while_paused() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(0, now);
        let before = clock.convert_ts(ms(100), None).unwrap();
        clock.change_pause(true, now + ms(50));
        // 暂停期间仍沿用暂停前的映射，恢复时才整体后移
        assert_eq!(clock.convert_ts(ms(100), None).unwrap(), before);
        assert!(clock.is_paused());
        clock.change_pause(false, now + ms(250));
        assert_eq!(clock.convert_ts(ms(100), None).unwrap(), before + ms(200));
    }

    #[test]
    fn test_rate_change_keeps_last_point() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(0, now);
        clock.update(ms(1000), now + ms(1000));
        let at_last = clock.convert_ts(ms(1000), None).unwrap();
        clock.change_rate(2.0);
        assert_eq!(clock.convert_ts(ms(1000), None).unwrap(), at_last);
        // 两倍速下 1 秒流时间只占 500ms
        assert_eq!(clock.convert_ts(ms(2000), None).unwrap(), at_last + ms(500));
    }

    #[test]
    fn test_system_origin_rebase() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(ms(5000), now);
        clock.change_system_origin(now + ms(40));
        assert_eq!(clock.convert_ts(ms(5000), None).unwrap(), now + ms(40));
    }

    #[test]
    fn test_late_pcr_raises_jitter() {
        let clock = ProgramClock::new(ms(100), 1.0);
        let now = mdate();
        clock.update(0, now);
        // 流时间 100ms 的 PCR 晚到了 400ms
        let late = clock.update(ms(100), now + ms(600));
        assert_eq!(late, Some(ms(400)));
        clock.update(ms(200), now + ms(700));
        clock.update(ms(300), now + ms(800));
        assert_eq!(clock.jitter(), ms(100) + ms(400));
    }

    #[test]
    fn test_bogus_bound() {
        let clock = ProgramClock::new(0, 1.0);
        clock.update(0, mdate());
        assert!(clock.convert_ts(ms(60_000), Some(ms(1000))).is_err());
        assert!(clock.convert_ts(ms(10), Some(ms(1000))).is_ok());
    }

    #[test]
    fn test_gap_resets_reference() {
        let clock = ProgramClock::new(0, 1.0);
        let now = mdate();
        clock.update(0, now);
        clock.update(ms(120_000), now + ms(5));
        let state = clock.state().unwrap();
        assert_eq!(state.stream_start, ms(120_000));
        assert_eq!(state.stream_duration, 0);
    }
}
