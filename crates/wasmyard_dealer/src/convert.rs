use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;

use crate::platform::{ProcessState, TaskState};
use crate::proto;

pub fn to_timestamp(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(t: &Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(t.seconds, t.nanos.max(0) as u32)
        .single()
        .unwrap_or_default()
}

impl From<TaskState> for proto::TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Unknown => proto::TaskStatus::Unknown,
            TaskState::Created => proto::TaskStatus::Created,
            TaskState::Running => proto::TaskStatus::Running,
            TaskState::Stopped => proto::TaskStatus::Stopped,
            TaskState::Paused => proto::TaskStatus::Paused,
            TaskState::Pausing => proto::TaskStatus::Pausing,
        }
    }
}

impl From<proto::TaskStatus> for TaskState {
    fn from(status: proto::TaskStatus) -> Self {
        match status {
            proto::TaskStatus::Unknown => TaskState::Unknown,
            proto::TaskStatus::Created => TaskState::Created,
            proto::TaskStatus::Running => TaskState::Running,
            proto::TaskStatus::Stopped => TaskState::Stopped,
            proto::TaskStatus::Paused => TaskState::Paused,
            proto::TaskStatus::Pausing => TaskState::Pausing,
        }
    }
}

impl From<ProcessState> for proto::TaskProcess {
    fn from(state: ProcessState) -> Self {
        proto::TaskProcess {
            id: state.id,
            pid: state.pid,
            status: proto::TaskStatus::from(state.status) as i32,
            stdin: state.stdin,
            stdout: state.stdout,
            stderr: state.stderr,
            terminal: state.terminal,
            exit_status: state.exit_status,
            exited_at: state.exited_at.map(to_timestamp),
        }
    }
}

impl proto::TaskProcess {
    pub fn task_state(&self) -> TaskState {
        proto::TaskStatus::try_from(self.status)
            .unwrap_or(proto::TaskStatus::Unknown)
            .into()
    }
}
