use crate::core::{EsCategory, EsId, GroupId, InputState, Tick, Viewpoint};
use crate::player::stats::StatsSnapshot;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// 输入线程对外发布的事件（由界面层消费）
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    State(InputState),
    /// 输入线程已退出，之后不会再有事件
    Dead,
    Rate(f32),
    Position { position: f64, time: Tick },
    Length(Tick),
    Title(usize),
    Seekpoint { title: usize, seekpoint: usize },
    EsAdded { category: EsCategory, id: EsId, label: String },
    EsDeleted { category: EsCategory, id: EsId },
    /// id 为 None 表示该类别没有选中的轨道
    EsSelected { category: EsCategory, id: Option<EsId> },
    ProgramAdded(GroupId),
    ProgramDeleted(GroupId),
    ProgramSelected(GroupId),
    ProgramUpdated(GroupId),
    ProgramScrambled { group: GroupId, scrambled: bool },
    RecordState(bool),
    /// 缓冲进度 0.0 - 1.0
    Cache(f64),
    AudioDelay(Tick),
    SpuDelay(Tick),
    Viewpoint(Viewpoint),
    Statistics(StatsSnapshot),
    UserError { title: String, message: String },
}

/// 事件发送端，接收端断开后发送静默丢弃
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<InputEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, Receiver<InputEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: InputEvent) {
        let _ = self.tx.send(event);
    }
}
