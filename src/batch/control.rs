//! 任务控制面：pause / resume / stop，均为幂等操作。
//!
//! 暂停只影响“下一个批次何时开始”，不会打断正在进行的调用；
//! 停止后不再启动新批次，已在进行的调用结算完毕后任务返回。

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct JobControl {
    tx: Arc<watch::Sender<RunState>>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    /// 已停止时不会被恢复成暂停。
    pub fn pause(&self) -> RunState {
        self.tx.send_if_modified(|s| {
            if *s == RunState::Running {
                *s = RunState::Paused;
                true
            } else {
                false
            }
        });
        self.state()
    }

    pub fn resume(&self) -> RunState {
        self.tx.send_if_modified(|s| {
            if *s == RunState::Paused {
                *s = RunState::Running;
                true
            } else {
                false
            }
        });
        self.state()
    }

    pub fn stop(&self) -> RunState {
        self.tx.send_if_modified(|s| {
            if *s == RunState::Stopped {
                false
            } else {
                *s = RunState::Stopped;
                true
            }
        });
        self.state()
    }

    /// 新任务开始前复位。
    pub fn reset(&self) {
        self.tx.send_replace(RunState::Running);
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == RunState::Stopped
    }

    /// 暂停期间挂起；返回 false 表示任务已被停止。
    pub async fn wait_runnable(&self) -> bool {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| *s != RunState::Paused).await {
            Ok(state) => *state == RunState::Running,
            Err(_) => false,
        }
    }
}
