use crate::core::{EsCategory, EsId, GroupId, InputState, Tick, Viewpoint};
use crate::player::demuxer_source::NavAction;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;
use std::process;
use std::thread;
use std::time::Instant;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 附加输入（外挂音轨 / 字幕）的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveKind {
    Audio,
    Subtitle,
}

/// 附加输入描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveDescriptor {
    pub uri: String,
    pub kind: SlaveKind,
    /// 打开后立即选中其轨道
    pub forced: bool,
}

/// 渲染目标（投屏设备等）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererHandle {
    pub name: String,
}

/// 输入线程控制命令
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    SetState(InputState),
    SetRate(f32),
    SetPosition { position: f64, fast: bool },
    SetTime { time: Tick, fast: bool },
    SetProgram(GroupId),

    SetTitle(usize),
    SetTitleNext,
    SetTitlePrev,
    SetSeekpoint(usize),
    SetSeekpointNext,
    SetSeekpointPrev,
    SetBookmark(usize),

    Nav(NavAction),

    SetEs(EsId),
    UnsetEs(EsId),
    RestartEs(EsId),
    SetEsList { category: EsCategory, ids: Vec<EsId> },

    SetViewpoint(Viewpoint),
    SetInitialViewpoint(Viewpoint),
    UpdateViewpoint(Viewpoint),

    SetAudioDelay(Tick),
    SetSpuDelay(Tick),

    AddSlave(SlaveDescriptor),
    SetRecordState(bool),
    SetFrameNext,
    SetRenderer(Option<RendererHandle>),
}

impl Control {
    /// 会改变读取位置的命令（缓冲期间推迟执行）
    pub fn is_seek_request(&self) -> bool {
        matches!(
            self,
            Control::SetPosition { .. }
                | Control::SetTime { .. }
                | Control::SetTitle(_)
                | Control::SetTitleNext
                | Control::SetTitlePrev
                | Control::SetSeekpoint(_)
                | Control::SetSeekpointNext
                | Control::SetSeekpointPrev
                | Control::SetBookmark(_)
                | Control::Nav(_)
        )
    }

    /// 连续的同类命令只需要执行最后一个
    pub fn is_coalescable(&self) -> bool {
        matches!(
            self,
            Control::SetState(_)
                | Control::SetRate(_)
                | Control::SetPosition { .. }
                | Control::SetTime { .. }
                | Control::SetProgram(_)
                | Control::SetTitle(_)
                | Control::SetSeekpoint(_)
                | Control::SetBookmark(_)
        )
    }

    pub fn same_kind(&self, other: &Control) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Control::SetState(_) => "SetState",
            Control::SetRate(_) => "SetRate",
            Control::SetPosition { .. } => "SetPosition",
            Control::SetTime { .. } => "SetTime",
            Control::SetProgram(_) => "SetProgram",
            Control::SetTitle(_) => "SetTitle",
            Control::SetTitleNext => "SetTitleNext",
            Control::SetTitlePrev => "SetTitlePrev",
            Control::SetSeekpoint(_) => "SetSeekpoint",
            Control::SetSeekpointNext => "SetSeekpointNext",
            Control::SetSeekpointPrev => "SetSeekpointPrev",
            Control::SetBookmark(_) => "SetBookmark",
            Control::Nav(_) => "Nav",
            Control::SetEs(_) => "SetEs",
            Control::UnsetEs(_) => "UnsetEs",
            Control::RestartEs(_) => "RestartEs",
            Control::SetEsList { .. } => "SetEsList",
            Control::SetViewpoint(_) => "SetViewpoint",
            Control::SetInitialViewpoint(_) => "SetInitialViewpoint",
            Control::UpdateViewpoint(_) => "UpdateViewpoint",
            Control::SetAudioDelay(_) => "SetAudioDelay",
            Control::SetSpuDelay(_) => "SetSpuDelay",
            Control::AddSlave(_) => "AddSlave",
            Control::SetRecordState(_) => "SetRecordState",
            Control::SetFrameNext => "SetFrameNext",
            Control::SetRenderer(_) => "SetRenderer",
        }
    }

    /// 丢弃未执行的命令，释放其携带的资源
    pub fn release(self) {
        match self {
            Control::AddSlave(slave) => {
                debug!("{} 🗑 丢弃附加输入 {}", log_ctx(), slave.uri);
            }
            Control::SetRenderer(Some(renderer)) => {
                debug!("{} 🗑 丢弃渲染目标 {}", log_ctx(), renderer.name);
            }
            other => {
                debug!("{} 🗑 丢弃控制命令 {}", log_ctx(), other.name());
            }
        }
    }
}

struct ControlFifo {
    queue: VecDeque<Control>,
    stopped: bool,
}

impl ControlFifo {
    /// 开头一串可合并的同类命令中最后一个的下标
    fn reduced_index(&self) -> usize {
        let Some(first) = self.queue.front() else {
            return 0;
        };
        if !first.is_coalescable() {
            return 0;
        }
        self.queue
            .iter()
            .skip(1)
            .take_while(|c| c.same_kind(first))
            .count()
    }
}

/// 有界控制命令队列
///
/// 任意线程都可以 push，永不阻塞；队列满或已停止时命令被直接丢弃。
/// 只有输入线程 pop。
pub struct ControlQueue {
    fifo: Mutex<ControlFifo>,
    wait: Condvar,
    capacity: usize,
}

impl ControlQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            fifo: Mutex::new(ControlFifo {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            wait: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// 入队；失败时命令已被释放
    pub fn push(&self, control: Control) -> bool {
        let mut fifo = self.fifo.lock();
        if fifo.stopped {
            debug!("{} 控制队列已停止，丢弃 {}", log_ctx(), control.name());
            drop(fifo);
            control.release();
            return false;
        }
        if fifo.queue.len() >= self.capacity {
            error!("{} ❌ 控制队列溢出，丢弃 {}", log_ctx(), control.name());
            drop(fifo);
            control.release();
            return false;
        }
        fifo.queue.push_back(control);
        self.wait.notify_one();
        true
    }

    /// 出队，最多等到 deadline；postpone_seek 时队首的 seek 类命令暂不取出
    pub fn pop(&self, deadline: Option<Instant>, postpone_seek: bool) -> Option<Control> {
        let mut fifo = self.fifo.lock();
        while fifo.queue.is_empty()
            || (postpone_seek && fifo.queue.front().map_or(false, |c| c.is_seek_request()))
        {
            if fifo.stopped {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.wait.wait_until(&mut fifo, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.wait.wait(&mut fifo),
            }
        }

        let reduced = fifo.reduced_index();
        let stale: Vec<Control> = fifo.queue.drain(..reduced).collect();
        let control = fifo.queue.pop_front();
        drop(fifo);

        if !stale.is_empty() {
            debug!("{} 合并 {} 个过期的控制命令", log_ctx(), stale.len());
        }
        for c in stale {
            c.release();
        }
        control
    }

    /// 停止队列：之后的 push 全部失败，并唤醒等待中的 pop
    pub fn stop(&self) {
        let mut fifo = self.fifo.lock();
        fifo.stopped = true;
        self.wait.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.fifo.lock().stopped
    }

    /// 释放所有未执行的命令
    pub fn drain_release(&self) -> usize {
        let pending: Vec<Control> = self.fifo.lock().queue.drain(..).collect();
        let count = pending.len();
        for c in pending {
            c.release();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.fifo.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
