use crate::core::EsCategory;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 输入统计计数器（各线程并发累加）
#[derive(Debug, Default)]
pub struct InputStats {
    demux_read_bytes: AtomicU64,
    demux_corrupted: AtomicU64,
    demux_discontinuity: AtomicU64,
    decoded_video: AtomicU64,
    decoded_audio: AtomicU64,
    decoded_sub: AtomicU64,
    displayed_pictures: AtomicU64,
    lost_pictures: AtomicU64,
    played_abuffers: AtomicU64,
    lost_abuffers: AtomicU64,
    displayed_subpictures: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub demux_read_bytes: u64,
    pub demux_corrupted: u64,
    pub demux_discontinuity: u64,
    pub decoded_video: u64,
    pub decoded_audio: u64,
    pub decoded_sub: u64,
    pub displayed_pictures: u64,
    pub lost_pictures: u64,
    pub played_abuffers: u64,
    pub lost_abuffers: u64,
    pub displayed_subpictures: u64,
}

impl InputStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_demux_read(&self, bytes: usize, corrupted: bool, discontinuity: bool) {
        self.demux_read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if corrupted {
            self.demux_corrupted.fetch_add(1, Ordering::Relaxed);
        }
        if discontinuity {
            self.demux_discontinuity.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_decoded(&self, category: EsCategory) {
        let counter = match category {
            EsCategory::Video => &self.decoded_video,
            EsCategory::Audio => &self.decoded_audio,
            EsCategory::Subtitle => &self.decoded_sub,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_displayed(&self, category: EsCategory) {
        let counter = match category {
            EsCategory::Video => &self.displayed_pictures,
            EsCategory::Audio => &self.played_abuffers,
            EsCategory::Subtitle => &self.displayed_subpictures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lost(&self, category: EsCategory) {
        match category {
            EsCategory::Video | EsCategory::Subtitle => &self.lost_pictures,
            EsCategory::Audio => &self.lost_abuffers,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            demux_read_bytes: self.demux_read_bytes.load(Ordering::Relaxed),
            demux_corrupted: self.demux_corrupted.load(Ordering::Relaxed),
            demux_discontinuity: self.demux_discontinuity.load(Ordering::Relaxed),
            decoded_video: self.decoded_video.load(Ordering::Relaxed),
            decoded_audio: self.decoded_audio.load(Ordering::Relaxed),
            decoded_sub: self.decoded_sub.load(Ordering::Relaxed),
            displayed_pictures: self.displayed_pictures.load(Ordering::Relaxed),
            lost_pictures: self.lost_pictures.load(Ordering::Relaxed),
            played_abuffers: self.played_abuffers.load(Ordering::Relaxed),
            lost_abuffers: self.lost_abuffers.load(Ordering::Relaxed),
            displayed_subpictures: self.displayed_subpictures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = InputStats::new();
        stats.add_demux_read(100, true, false);
        stats.add_demux_read(50, false, true);
        stats.add_decoded(EsCategory::Audio);
        stats.add_displayed(EsCategory::Audio);
        stats.add_lost(EsCategory::Subtitle);
        let snap = stats.snapshot();
        assert_eq!(snap.demux_read_bytes, 150);
        assert_eq!(snap.demux_corrupted, 1);
        assert_eq!(snap.demux_discontinuity, 1);
        assert_eq!(snap.decoded_audio, 1);
        assert_eq!(snap.played_abuffers, 1);
        assert_eq!(snap.lost_pictures, 1);
    }
}
