//! Firmware upload tracking
//!
//! [`UploadTracker`] is the upload state machine. It never touches the network
//! or the screen: the transport feeds it progress and completion callbacks and
//! it answers with the [`UploadEvent`]s to present. [`drive_upload`] wires it to
//! a [`DeviceClient`] and a [`CancellationToken`].

use crate::{
    device_client::{DeviceClient, FirmwareUpload, RawResponse, UploadResponse},
    errors::{ResponseError, TransportError, UploadError},
    services::firmware::ValidatedFirmware,
};
use log::{debug, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Minimum time between two speed/ETA samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_REJECT_MESSAGE: &str = "Upload failed";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadStatus {
    #[default]
    Idle,
    Uploading,
    /// All bytes are on the device, waiting for its verdict
    Validating,
    Succeeded,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Validating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Succeeded | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSample {
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    /// None while the measured speed is zero
    pub eta_secs: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UploadEvent {
    StatusChanged(UploadStatus),
    Progress {
        bytes_sent: u64,
        total: u64,
        percent: f64,
    },
    Sample(ProgressSample),
    Finished(Result<(), UploadError>),
}

/// State of one upload, created by [`UploadTracker::start`]
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub file_name: String,
    pub total: u64,
    pub started_at: Instant,
    pub bytes_sent: u64,
    pub last_sample_at: Instant,
    pub last_sample_bytes: u64,
    pub status: UploadStatus,
}

impl UploadSession {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.bytes_sent as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Default)]
pub struct UploadTracker {
    session: Option<UploadSession>,
    outcome: Option<Result<(), UploadError>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> UploadStatus {
        self.session
            .as_ref()
            .map_or(UploadStatus::Idle, |session| session.status)
    }

    pub fn session(&self) -> Option<&UploadSession> {
        self.session.as_ref()
    }

    /// Terminal result, None while idle or in flight
    pub fn outcome(&self) -> Option<&Result<(), UploadError>> {
        self.outcome.as_ref()
    }

    pub fn start(&mut self, firmware: &ValidatedFirmware, now: Instant) -> Vec<UploadEvent> {
        if self.session.is_some() {
            warn!("start() ignored: upload already started");
            return vec![];
        }

        debug!("upload of {} started", firmware.name());
        self.session = Some(UploadSession {
            file_name: firmware.name().to_string(),
            total: firmware.size_bytes(),
            started_at: now,
            bytes_sent: 0,
            last_sample_at: now,
            last_sample_bytes: 0,
            status: UploadStatus::Uploading,
        });

        vec![UploadEvent::StatusChanged(UploadStatus::Uploading)]
    }

    pub fn on_progress(&mut self, loaded: u64, total: u64, now: Instant) -> Vec<UploadEvent> {
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        if session.status != UploadStatus::Uploading {
            return vec![];
        }

        session.total = total;
        session.bytes_sent = session.bytes_sent.max(loaded.min(total));

        let mut events = vec![UploadEvent::Progress {
            bytes_sent: session.bytes_sent,
            total: session.total,
            percent: session.percent(),
        }];

        let elapsed = now.saturating_duration_since(session.last_sample_at);
        if elapsed >= SAMPLE_INTERVAL {
            let delta = session.bytes_sent.saturating_sub(session.last_sample_bytes);
            let speed = delta as f64 / elapsed.as_secs_f64();
            let remaining = session.total.saturating_sub(session.bytes_sent);

            events.push(UploadEvent::Sample(ProgressSample {
                percent: session.percent(),
                speed_bytes_per_sec: speed,
                eta_secs: (speed > 0.0).then(|| remaining as f64 / speed),
            }));

            session.last_sample_at = now;
            session.last_sample_bytes = session.bytes_sent;
        }

        if session.bytes_sent >= session.total {
            session.status = UploadStatus::Validating;
            events.push(UploadEvent::StatusChanged(UploadStatus::Validating));
        }

        events
    }

    /// The device answered the upload request
    pub fn on_response(&mut self, response: &RawResponse) -> Vec<UploadEvent> {
        if !self.status().is_active() {
            return vec![];
        }

        match Self::classify(response) {
            Ok(()) => self.finish(UploadStatus::Succeeded, Ok(())),
            Err(e) => self.finish(UploadStatus::Failed, Err(e.into())),
        }
    }

    pub fn on_transport_error(&mut self, error: TransportError) -> Vec<UploadEvent> {
        if error == TransportError::Cancelled {
            return self.cancel();
        }
        if !self.status().is_active() {
            return vec![];
        }

        self.finish(UploadStatus::Failed, Err(error.into()))
    }

    /// Cancel an in-flight upload, no-op once terminal
    pub fn cancel(&mut self) -> Vec<UploadEvent> {
        if !self.status().is_active() {
            return vec![];
        }

        self.finish(
            UploadStatus::Cancelled,
            Err(TransportError::Cancelled.into()),
        )
    }

    fn classify(response: &RawResponse) -> Result<(), ResponseError> {
        if !(200..300).contains(&response.status) {
            return Err(ResponseError::HttpError {
                status: response.status,
            });
        }

        let payload: UploadResponse = serde_json::from_str(&response.body)
            .map_err(|e| ResponseError::MalformedResponse(e.to_string()))?;

        if !payload.success {
            return Err(ResponseError::ServerRejected {
                message: payload
                    .error
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string()),
            });
        }

        Ok(())
    }

    fn finish(
        &mut self,
        status: UploadStatus,
        outcome: Result<(), UploadError>,
    ) -> Vec<UploadEvent> {
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
        self.outcome = Some(outcome.clone());

        vec![
            UploadEvent::StatusChanged(status),
            UploadEvent::Finished(outcome),
        ]
    }
}

/// Upload `data` to the device and feed the tracker until it is terminal
///
/// Every event is handed to `on_event` as it happens. Cancelling `cancel`
/// drops the request future, which aborts the transfer.
pub async fn drive_upload<C, F>(
    client: &C,
    firmware: &ValidatedFirmware,
    data: Vec<u8>,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<(), UploadError>
where
    C: DeviceClient,
    F: FnMut(&UploadEvent),
{
    let mut tracker = UploadTracker::new();
    let total = data.len() as u64;
    let mut emit = |events: Vec<UploadEvent>| events.iter().for_each(&mut on_event);

    emit(tracker.start(firmware, now()));

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let upload = client.upload_firmware(
        FirmwareUpload {
            name: firmware.name().to_string(),
            data,
        },
        progress_tx,
    );
    tokio::pin!(upload);

    while !tracker.status().is_terminal() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("upload cancelled");
                emit(tracker.cancel());
            }
            Some(sent) = progress_rx.recv() => {
                emit(tracker.on_progress(sent, total, now()));
            }
            result = &mut upload => {
                while let Ok(sent) = progress_rx.try_recv() {
                    emit(tracker.on_progress(sent, total, now()));
                }
                match result {
                    Ok(response) => {
                        // an answered request sent every byte, even without chunks
                        if tracker.status() == UploadStatus::Uploading {
                            emit(tracker.on_progress(total, total, now()));
                        }
                        emit(tracker.on_response(&response));
                    }
                    Err(e) => emit(tracker.on_transport_error(e)),
                }
            }
        }
    }

    tracker
        .outcome()
        .cloned()
        .unwrap_or(Err(TransportError::Cancelled.into()))
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::firmware::{FileValidator, FirmwareFile};

    fn firmware(size_bytes: u64) -> ValidatedFirmware {
        FileValidator::default()
            .validate(FirmwareFile::new("fw.bin", size_bytes, "/tmp/fw.bin"))
            .expect("should validate")
    }

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
        }
    }

    fn started(size_bytes: u64) -> (UploadTracker, Instant) {
        let mut tracker = UploadTracker::new();
        let t0 = Instant::now();
        tracker.start(&firmware(size_bytes), t0);
        (tracker, t0)
    }

    fn percents(events: &[UploadEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|event| match event {
                UploadEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    fn statuses(events: &[UploadEvent]) -> Vec<UploadStatus> {
        events
            .iter()
            .filter_map(|event| match event {
                UploadEvent::StatusChanged(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    mod state_machine {
        use super::*;

        #[test]
        fn starts_idle() {
            let tracker = UploadTracker::new();
            assert_eq!(tracker.status(), UploadStatus::Idle);
            assert!(tracker.outcome().is_none());
        }

        #[test]
        fn start_enters_uploading_once() {
            let mut tracker = UploadTracker::new();
            let events = tracker.start(&firmware(10), Instant::now());
            assert_eq!(events, vec![UploadEvent::StatusChanged(UploadStatus::Uploading)]);
            assert_eq!(tracker.status(), UploadStatus::Uploading);

            assert!(tracker.start(&firmware(10), Instant::now()).is_empty());
        }

        #[test]
        fn progress_before_start_is_ignored() {
            let mut tracker = UploadTracker::new();
            assert!(tracker.on_progress(5, 10, Instant::now()).is_empty());
            assert!(tracker.on_response(&response(200, r#"{"success":true}"#)).is_empty());
            assert_eq!(tracker.status(), UploadStatus::Idle);
        }

        #[test]
        fn full_progress_reaches_100_percent_before_validating() {
            let (mut tracker, t0) = started(1000);

            let events = tracker.on_progress(1000, 1000, t0 + Duration::from_millis(100));
            assert_eq!(percents(&events), vec![100.0]);
            assert_eq!(
                events.last(),
                Some(&UploadEvent::StatusChanged(UploadStatus::Validating))
            );
            assert_eq!(tracker.status(), UploadStatus::Validating);
            assert!(tracker.outcome().is_none());
        }

        #[test]
        fn success_response_succeeds() {
            let (mut tracker, t0) = started(10);
            tracker.on_progress(10, 10, t0);

            let events = tracker.on_response(&response(200, r#"{"success":true}"#));
            assert_eq!(
                events,
                vec![
                    UploadEvent::StatusChanged(UploadStatus::Succeeded),
                    UploadEvent::Finished(Ok(())),
                ]
            );
            assert_eq!(tracker.outcome(), Some(&Ok(())));
        }

        #[test]
        fn response_while_still_uploading_is_accepted() {
            let (mut tracker, _) = started(10);
            tracker.on_response(&response(201, r#"{"success":true,"error":null}"#));
            assert_eq!(tracker.status(), UploadStatus::Succeeded);
        }

        #[test]
        fn http_500_fails_with_http_error() {
            let (mut tracker, t0) = started(10);
            tracker.on_progress(10, 10, t0);

            tracker.on_response(&response(500, "internal error"));
            assert_eq!(tracker.status(), UploadStatus::Failed);
            assert_eq!(
                tracker.outcome(),
                Some(&Err(ResponseError::HttpError { status: 500 }.into()))
            );
        }

        #[test]
        fn malformed_body_fails_with_malformed_response() {
            for body in ["<html>", "", r#"{"ok":true}"#, r#"{"success":"yes"}"#] {
                let (mut tracker, _) = started(10);
                tracker.on_response(&response(200, body));
                assert!(
                    matches!(
                        tracker.outcome(),
                        Some(Err(UploadError::Response(ResponseError::MalformedResponse(_))))
                    ),
                    "{body}"
                );
            }
        }

        #[test]
        fn rejected_payload_carries_device_message() {
            let (mut tracker, _) = started(10);
            tracker.on_response(&response(
                200,
                r#"{"success":false,"error":"Invalid image magic"}"#,
            ));
            assert_eq!(
                tracker.outcome(),
                Some(&Err(ResponseError::ServerRejected {
                    message: "Invalid image magic".to_string()
                }
                .into()))
            );
        }

        #[test]
        fn rejected_payload_without_message_uses_default() {
            let (mut tracker, _) = started(10);
            tracker.on_response(&response(200, r#"{"success":false}"#));
            assert_eq!(
                tracker.outcome(),
                Some(&Err(ResponseError::ServerRejected {
                    message: "Upload failed".to_string()
                }
                .into()))
            );
        }

        #[test]
        fn network_error_fails() {
            let (mut tracker, _) = started(10);
            let events = tracker.on_transport_error(TransportError::NetworkError("reset".into()));
            assert_eq!(tracker.status(), UploadStatus::Failed);
            assert_eq!(events.len(), 2);
        }

        #[test]
        fn cancel_is_reported_exactly_once() {
            let (mut tracker, t0) = started(10);
            tracker.on_progress(3, 10, t0);

            let events = tracker.cancel();
            assert_eq!(
                events,
                vec![
                    UploadEvent::StatusChanged(UploadStatus::Cancelled),
                    UploadEvent::Finished(Err(TransportError::Cancelled.into())),
                ]
            );
            assert!(tracker.cancel().is_empty());
            assert!(tracker.on_transport_error(TransportError::Cancelled).is_empty());
            assert_eq!(tracker.status(), UploadStatus::Cancelled);
        }

        #[test]
        fn events_after_terminal_state_are_ignored() {
            let (mut tracker, t0) = started(10);
            tracker.on_response(&response(500, ""));

            assert!(tracker.on_progress(10, 10, t0).is_empty());
            assert!(tracker.on_response(&response(200, r#"{"success":true}"#)).is_empty());
            assert!(tracker.cancel().is_empty());
            assert_eq!(tracker.status(), UploadStatus::Failed);
        }

        #[test]
        fn cancel_of_idle_tracker_is_noop() {
            let mut tracker = UploadTracker::new();
            assert!(tracker.cancel().is_empty());
            assert_eq!(tracker.status(), UploadStatus::Idle);
        }
    }

    mod progress {
        use super::*;

        #[test]
        fn bytes_sent_never_decreases() {
            let (mut tracker, t0) = started(100);
            tracker.on_progress(60, 100, t0);
            let events = tracker.on_progress(40, 100, t0);

            assert_eq!(percents(&events), vec![60.0]);
            assert_eq!(tracker.session().map(|s| s.bytes_sent), Some(60));
        }

        #[test]
        fn percent_is_clamped() {
            let (mut tracker, t0) = started(100);
            let events = tracker.on_progress(250, 100, t0);
            assert_eq!(percents(&events), vec![100.0]);
        }

        #[test]
        fn empty_file_counts_as_complete() {
            let (mut tracker, t0) = started(0);
            let events = tracker.on_progress(0, 0, t0);
            assert_eq!(percents(&events), vec![100.0]);
            assert_eq!(tracker.status(), UploadStatus::Validating);
        }

        #[test]
        fn samples_at_most_every_half_second() {
            let (mut tracker, t0) = started(10_000);

            let events = tracker.on_progress(1_000, 10_000, t0 + Duration::from_millis(200));
            assert!(!events.iter().any(|e| matches!(e, UploadEvent::Sample(_))));

            let events = tracker.on_progress(2_000, 10_000, t0 + Duration::from_millis(500));
            let sample = events
                .iter()
                .find_map(|e| match e {
                    UploadEvent::Sample(sample) => Some(sample.clone()),
                    _ => None,
                })
                .expect("should sample after 0.5 s");

            assert_eq!(sample.percent, 20.0);
            assert!((sample.speed_bytes_per_sec - 4_000.0).abs() < 1e-6);
            assert!((sample.eta_secs.expect("should have eta") - 2.0).abs() < 1e-6);

            let events = tracker.on_progress(2_500, 10_000, t0 + Duration::from_millis(700));
            assert!(!events.iter().any(|e| matches!(e, UploadEvent::Sample(_))));
        }

        #[test]
        fn zero_speed_has_no_eta() {
            let (mut tracker, t0) = started(10_000);
            let events = tracker.on_progress(0, 10_000, t0 + Duration::from_secs(1));

            assert!(events.iter().any(|e| matches!(
                e,
                UploadEvent::Sample(ProgressSample {
                    eta_secs: None,
                    ..
                })
            )));
        }
    }

    mod driver {
        use super::*;
        use anyhow::Result;
        use crate::device_client::{OtaInfo, RollbackResponse};

        struct ScriptedDevice {
            chunks: Vec<u64>,
            result: Result<RawResponse, TransportError>,
            stall: bool,
        }

        impl DeviceClient for ScriptedDevice {
            async fn ota_info(&self) -> Result<OtaInfo> {
                unimplemented!()
            }

            async fn upload_firmware(
                &self,
                _upload: FirmwareUpload,
                progress: mpsc::UnboundedSender<u64>,
            ) -> Result<RawResponse, TransportError> {
                for sent in &self.chunks {
                    let _ = progress.send(*sent);
                    tokio::task::yield_now().await;
                }
                if self.stall {
                    std::future::pending::<()>().await;
                }
                self.result.clone()
            }

            async fn rollback(&self) -> Result<RollbackResponse> {
                unimplemented!()
            }

            async fn system_state(&self) -> Result<()> {
                unimplemented!()
            }
        }

        #[tokio::test]
        async fn reports_progress_then_success() {
            let device = ScriptedDevice {
                chunks: vec![4, 8, 10],
                result: Ok(response(200, r#"{"success":true}"#)),
                stall: false,
            };
            let mut events = vec![];

            let result = drive_upload(
                &device,
                &firmware(10),
                vec![0; 10],
                &CancellationToken::new(),
                |event| events.push(event.clone()),
            )
            .await;

            assert_eq!(result, Ok(()));
            assert_eq!(percents(&events), vec![40.0, 80.0, 100.0]);

            let validating = events
                .iter()
                .position(|e| *e == UploadEvent::StatusChanged(UploadStatus::Validating))
                .expect("should validate");
            let succeeded = events
                .iter()
                .position(|e| *e == UploadEvent::StatusChanged(UploadStatus::Succeeded))
                .expect("should succeed");
            assert!(validating < succeeded);
        }

        #[tokio::test]
        async fn surfaces_transport_failure() {
            let device = ScriptedDevice {
                chunks: vec![2],
                result: Err(TransportError::NetworkError("connection reset".into())),
                stall: false,
            };

            let result = drive_upload(
                &device,
                &firmware(10),
                vec![0; 10],
                &CancellationToken::new(),
                |_| {},
            )
            .await;

            assert_eq!(
                result,
                Err(TransportError::NetworkError("connection reset".into()).into())
            );
        }

        #[tokio::test]
        async fn cancel_aborts_stalled_upload() {
            let device = ScriptedDevice {
                chunks: vec![5],
                result: Ok(response(200, r#"{"success":true}"#)),
                stall: true,
            };
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            let mut finished = 0;

            let result = drive_upload(&device, &firmware(10), vec![0; 10], &cancel, |event| {
                if matches!(event, UploadEvent::Progress { .. }) {
                    canceller.cancel();
                }
                if matches!(event, UploadEvent::Finished(_)) {
                    finished += 1;
                }
            })
            .await;

            assert!(result.expect_err("should be cancelled").is_cancelled());
            assert_eq!(finished, 1);
        }

        #[tokio::test]
        async fn already_cancelled_token_never_succeeds() {
            let device = ScriptedDevice {
                chunks: vec![],
                result: Ok(response(200, r#"{"success":true}"#)),
                stall: false,
            };
            let cancel = CancellationToken::new();
            cancel.cancel();

            let result = drive_upload(&device, &firmware(10), vec![0; 10], &cancel, |_| {}).await;
            assert!(result.expect_err("should be cancelled").is_cancelled());
        }

        #[tokio::test]
        async fn empty_image_still_reaches_full_progress() {
            let device = ScriptedDevice {
                chunks: vec![],
                result: Ok(response(200, r#"{"success":true}"#)),
                stall: false,
            };
            let mut events = vec![];

            let result = drive_upload(
                &device,
                &firmware(0),
                vec![],
                &CancellationToken::new(),
                |event| events.push(event.clone()),
            )
            .await;

            assert_eq!(result, Ok(()));
            assert_eq!(percents(&events), vec![100.0]);
            assert_eq!(
                statuses(&events),
                vec![
                    UploadStatus::Uploading,
                    UploadStatus::Validating,
                    UploadStatus::Succeeded
                ]
            );
        }

        #[tokio::test]
        async fn unreported_tail_is_flushed_before_verdict() {
            let device = ScriptedDevice {
                chunks: vec![4],
                result: Ok(response(200, r#"{"success":true}"#)),
                stall: false,
            };
            let mut events = vec![];

            drive_upload(
                &device,
                &firmware(10),
                vec![0; 10],
                &CancellationToken::new(),
                |event| events.push(event.clone()),
            )
            .await
            .expect("upload should succeed");

            assert_eq!(percents(&events), vec![40.0, 100.0]);
        }
    }
}
