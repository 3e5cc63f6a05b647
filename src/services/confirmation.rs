//! Confirmation gate for destructive device operations
//!
//! Update and rollback both restart the device. Before either one starts, the
//! user sees what is going to happen and has to accept it explicitly.

use crate::services::{
    firmware::ValidatedFirmware,
    format::{estimate_upload_duration, format_size},
};
use log::debug;
#[cfg(feature = "mock")]
use mockall::automock;
use std::future::Future;
use trait_variant::make;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

/// Content of a confirmation dialog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub title: String,
    pub body: Vec<String>,
    pub confirm_label: String,
    pub cancel_label: Option<String>,
    pub severity: Severity,
}

/// The dialog primitive of the front end
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait ConfirmationDialog {
    /// Resolves to true when the user accepted
    async fn show_dialog(&self, request: &ConfirmationRequest) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub enum ConfirmAction<'a> {
    Update(&'a ValidatedFirmware),
    Rollback,
}

pub struct ConfirmationGate<D> {
    dialog: D,
}

impl<D: ConfirmationDialog> ConfirmationGate<D> {
    pub fn new(dialog: D) -> Self {
        Self { dialog }
    }

    pub fn dialog(&self) -> &D {
        &self.dialog
    }

    /// Ask the user, true only when the dialog was accepted
    pub async fn confirm(&self, action: ConfirmAction<'_>) -> bool {
        let request = Self::request_for(action);
        let accepted = self.dialog.show_dialog(&request).await;
        debug!("confirmation '{}' answered with {accepted}", request.title);
        accepted
    }

    /// Run `op` only after the user accepted `action`
    ///
    /// Returns None and never polls `op` when the dialog was declined.
    pub async fn run_confirmed<T, F, Fut>(&self, action: ConfirmAction<'_>, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.confirm(action).await {
            return None;
        }
        Some(op().await)
    }

    pub fn request_for(action: ConfirmAction<'_>) -> ConfirmationRequest {
        match action {
            ConfirmAction::Update(firmware) => ConfirmationRequest {
                title: "Firmware Update Confirmation".to_string(),
                body: vec![
                    format!("Firmware File: {}", firmware.name()),
                    format!("File Size: {}", format_size(firmware.size_bytes())),
                    format!(
                        "Estimated Duration: {}",
                        estimate_upload_duration(firmware.size_bytes())
                    ),
                    "The device will restart automatically after the update.".to_string(),
                    "Do not power off or disconnect the device during the update.".to_string(),
                    "Do you want to proceed with the firmware update?".to_string(),
                ],
                confirm_label: "Yes, Update Firmware".to_string(),
                cancel_label: Some("Cancel".to_string()),
                severity: Severity::Danger,
            },
            ConfirmAction::Rollback => ConfirmationRequest {
                title: "Firmware Rollback Confirmation".to_string(),
                body: vec![
                    "This will revert the device to the previous firmware version.".to_string(),
                    "The device will restart immediately after rollback.".to_string(),
                    "All settings will be preserved.".to_string(),
                    "Do you want to rollback to the previous firmware?".to_string(),
                ],
                confirm_label: "Yes, Rollback Firmware".to_string(),
                cancel_label: Some("Cancel".to_string()),
                severity: Severity::Warning,
            },
        }
    }
}
