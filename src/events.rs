//! Everything the workflow shows to the user
//!
//! The workflow never draws anything itself. It hands [`WorkflowEvent`]s,
//! notifications and busy toggles to a [`Presenter`], which may be a terminal,
//! a test recorder or anything else.

use crate::{
    device_client::OtaInfo,
    services::{reconnect::ReconnectAttempt, upload::UploadEvent},
};

#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowEvent {
    InfoLoaded(OtaInfo),
    Upload(UploadEvent),
    /// Seconds left before reconnect polling starts
    RestartCountdown { remaining_secs: u32 },
    Reconnecting(ReconnectAttempt),
    /// The device answered after a restart, reload its state
    DeviceOnline { attempts: u32 },
    ReconnectTimedOut { attempts: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Operation that owns the busy indicator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Update,
    Rollback,
}

pub trait Presenter: Send + Sync {
    fn render(&self, event: &WorkflowEvent);
    fn notify(&self, message: &str, level: NotifyLevel);
    fn set_busy(&self, action: Action, busy: bool);
}
