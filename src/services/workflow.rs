//! Update and rollback orchestration
//!
//! [`OtaWorkflow`] sequences one user action end to end: validation,
//! confirmation, upload or rollback request, restart countdown and reconnect
//! polling. Presentation goes through the injected [`Presenter`], decisions
//! through the injected [`ConfirmationDialog`].

use crate::{
    config::AppConfig,
    device_client::{DeviceClient, OtaInfo},
    errors::{PollError, ResponseError, TransportError, UploadError, WorkflowError},
    events::{Action, NotifyLevel, Presenter, WorkflowEvent},
    services::{
        confirmation::{ConfirmAction, ConfirmationDialog, ConfirmationGate},
        firmware::{FileValidator, FirmwareFile, FirmwarePolicy, ValidatedFirmware},
        reconnect::{Reachable, ReconnectPolicy, ReconnectPoller},
        upload::drive_upload,
    },
};
use log::{debug, error, info, warn};
use std::{path::Path, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RESTART_COUNTDOWN_SECS: u32 = 5;

const FIRMWARE_INTACT_NOTICE: &str =
    "Your current firmware is still intact and the device is functioning normally.";
const DEFAULT_ROLLBACK_FAILURE: &str = "Rollback failed";

/// How a confirmed action ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The user declined, nothing was sent to the device
    Declined,
    /// The device came back after its restart
    Reachable { attempts: u32 },
    /// The device restarted but did not answer in time
    ReloadManually { attempts: u32 },
}

pub struct OtaWorkflow<C, D, P> {
    client: C,
    gate: ConfirmationGate<D>,
    presenter: P,
    validator: FileValidator,
    poller: ReconnectPoller,
    restart_countdown_secs: u32,
}

impl<C, D, P> OtaWorkflow<C, D, P>
where
    C: DeviceClient,
    D: ConfirmationDialog,
    P: Presenter,
{
    pub fn new(client: C, dialog: D, presenter: P) -> Self {
        Self {
            client,
            gate: ConfirmationGate::new(dialog),
            presenter,
            validator: FileValidator::default(),
            poller: ReconnectPoller::default(),
            restart_countdown_secs: DEFAULT_RESTART_COUNTDOWN_SECS,
        }
    }

    pub fn from_config(client: C, dialog: D, presenter: P, config: &AppConfig) -> Self {
        Self::new(client, dialog, presenter)
            .with_firmware_policy(config.firmware.clone())
            .with_reconnect_policy(config.reconnect.clone())
            .with_restart_countdown(config.restart_countdown_secs)
    }

    pub fn with_firmware_policy(mut self, policy: FirmwarePolicy) -> Self {
        self.validator = FileValidator::new(policy);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.poller = ReconnectPoller::new(policy);
        self
    }

    pub fn with_restart_countdown(mut self, seconds: u32) -> Self {
        self.restart_countdown_secs = seconds;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn dialog(&self) -> &D {
        self.gate.dialog()
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    /// Fetch the running firmware's metadata and present it
    pub async fn load_info(&self) -> Result<OtaInfo, WorkflowError> {
        debug!("load_info() called");

        let info = self.client.ota_info().await.map_err(|e| {
            self.report(WorkflowError::Device(format!("{e:#}")), "Failed to load firmware info")
        })?;

        self.presenter.render(&WorkflowEvent::InfoLoaded(info.clone()));
        Ok(info)
    }

    /// Validate, confirm and upload the firmware at `path`, then follow the restart
    pub async fn update(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Completion, WorkflowError> {
        debug!("update() called with {path:?}");

        let file = FirmwareFile::from_path(path).await.map_err(|e| {
            self.report(
                WorkflowError::FileAccess(format!("{e:#}")),
                "Error reading firmware file",
            )
        })?;

        let firmware = self.validator.validate(file).map_err(|e| {
            self.presenter.notify(&e.to_string(), NotifyLevel::Error);
            warn!("firmware rejected: {e}");
            WorkflowError::from(e)
        })?;

        match self
            .gate
            .run_confirmed(ConfirmAction::Update(&firmware), || {
                self.busy(Action::Update, self.upload_and_restart(&firmware, cancel))
            })
            .await
        {
            Some(result) => result,
            None => {
                info!("firmware update declined");
                Ok(Completion::Declined)
            }
        }
    }

    /// Revert to the previous firmware after confirmation, then follow the restart
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<Completion, WorkflowError> {
        debug!("rollback() called");

        let info = self.load_info().await?;
        if !info.can_rollback {
            self.presenter.notify(
                "No previous firmware available for rollback",
                NotifyLevel::Warning,
            );
            return Err(WorkflowError::RollbackUnavailable);
        }

        match self
            .gate
            .run_confirmed(ConfirmAction::Rollback, || {
                self.busy(Action::Rollback, self.rollback_and_restart(cancel))
            })
            .await
        {
            Some(result) => result,
            None => {
                info!("firmware rollback declined");
                Ok(Completion::Declined)
            }
        }
    }

    async fn busy<T>(&self, action: Action, op: impl Future<Output = T>) -> T {
        self.presenter.set_busy(action, true);
        let result = op.await;
        self.presenter.set_busy(action, false);
        result
    }

    async fn upload_and_restart(
        &self,
        firmware: &ValidatedFirmware,
        cancel: &CancellationToken,
    ) -> Result<Completion, WorkflowError> {
        let data = firmware.read().await.map_err(|e| {
            self.report(
                WorkflowError::FileAccess(format!("{e:#}")),
                "Error reading firmware file",
            )
        })?;

        info!("uploading {} ({} bytes)", firmware.name(), data.len());
        let presenter = &self.presenter;
        if let Err(e) = drive_upload(&self.client, firmware, data, cancel, |event| {
            presenter.render(&WorkflowEvent::Upload(event.clone()))
        })
        .await
        {
            self.report_upload_failure(&e);
            return Err(e.into());
        }

        self.presenter.notify(
            &format!(
                "Firmware uploaded successfully! Device will restart in {} seconds...",
                self.restart_countdown_secs
            ),
            NotifyLevel::Success,
        );
        self.follow_restart(cancel).await
    }

    async fn rollback_and_restart(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Completion, WorkflowError> {
        let response = self.client.rollback().await.map_err(|e| {
            self.report(WorkflowError::Device(format!("{e:#}")), "Error during rollback")
        })?;

        if !response.success {
            let message = response
                .message
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| DEFAULT_ROLLBACK_FAILURE.to_string());
            error!("rollback rejected by device: {message}");
            self.presenter.notify(&message, NotifyLevel::Error);
            return Err(WorkflowError::Rollback(message));
        }

        self.presenter.notify(
            "Rollback initiated. Device will restart...",
            NotifyLevel::Success,
        );
        self.follow_restart(cancel).await
    }

    /// Count down, then poll until the restarted device answers
    async fn follow_restart(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Completion, WorkflowError> {
        self.restart_countdown(cancel).await.inspect_err(|_| {
            self.presenter
                .notify("Waiting for the device was cancelled", NotifyLevel::Warning)
        })?;

        let client = &self.client;
        let presenter = &self.presenter;
        let polled = self
            .poller
            .poll_until_reachable(
                || client.system_state(),
                cancel,
                |attempt| presenter.render(&WorkflowEvent::Reconnecting(attempt.clone())),
            )
            .await;

        match polled {
            Ok(Reachable { attempts }) => {
                info!("device back online after {attempts} attempts");
                self.presenter.render(&WorkflowEvent::DeviceOnline { attempts });
                self.presenter.notify("Device is back online", NotifyLevel::Success);
                Ok(Completion::Reachable { attempts })
            }
            Err(PollError::TimedOut { attempts }) => {
                warn!("device did not come back after {attempts} attempts");
                self.presenter
                    .render(&WorkflowEvent::ReconnectTimedOut { attempts });
                self.presenter.notify(
                    "Device is taking longer than expected to restart. Please reload manually.",
                    NotifyLevel::Warning,
                );
                Ok(Completion::ReloadManually { attempts })
            }
            Err(e) => {
                self.presenter
                    .notify("Waiting for the device was cancelled", NotifyLevel::Warning);
                Err(e.into())
            }
        }
    }

    async fn restart_countdown(&self, cancel: &CancellationToken) -> Result<(), PollError> {
        for remaining_secs in (1..=self.restart_countdown_secs).rev() {
            self.presenter
                .render(&WorkflowEvent::RestartCountdown { remaining_secs });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled { attempts: 0 }),
                _ = time::sleep(Duration::from_secs(1)) => {}
            }
        }
        Ok(())
    }

    fn report_upload_failure(&self, e: &UploadError) {
        let (message, level) = match e {
            UploadError::Transport(TransportError::Cancelled) => {
                ("Upload cancelled".to_string(), NotifyLevel::Warning)
            }
            UploadError::Transport(TransportError::NetworkError(_)) => (
                "Network error during upload. Please try again.".to_string(),
                NotifyLevel::Error,
            ),
            UploadError::Response(ResponseError::HttpError { status }) => {
                (format!("Upload failed: HTTP {status}"), NotifyLevel::Error)
            }
            UploadError::Response(ResponseError::MalformedResponse(_)) => (
                "Error: Invalid server response".to_string(),
                NotifyLevel::Error,
            ),
            UploadError::Response(ResponseError::ServerRejected { message }) => (
                format!("Firmware upload failed: {message}"),
                NotifyLevel::Error,
            ),
        };

        if e.is_cancelled() {
            info!("firmware upload cancelled");
        } else {
            error!("firmware upload failed: {e}");
        }
        self.presenter.notify(&message, level);
        self.presenter.notify(FIRMWARE_INTACT_NOTICE, NotifyLevel::Info);
    }

    fn report(&self, e: WorkflowError, headline: &str) -> WorkflowError {
        error!("{headline}: {e}");
        self.presenter.notify(&format!("{headline}: {e}"), NotifyLevel::Error);
        e
    }
}
