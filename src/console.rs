//! Terminal front end
//!
//! Renders workflow events with an indicatif progress bar and asks for
//! confirmation on stdin.

use crate::{
    device_client::OtaInfo,
    events::{Action, NotifyLevel, Presenter, WorkflowEvent},
    services::{
        confirmation::{ConfirmationDialog, ConfirmationRequest, Severity},
        format::{format_duration, format_rate, format_size},
        upload::{UploadEvent, UploadStatus},
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::{io::Write, sync::Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

const UNKNOWN: &str = "Unknown";
const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

#[derive(Default)]
pub struct TerminalPresenter {
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bar(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        match self.bar.lock() {
            Ok(mut bar) => f(&mut bar),
            Err(e) => warn!("progress bar unavailable: {e}"),
        }
    }

    /// Print above the progress bar if one is shown
    fn line(&self, text: &str) {
        self.with_bar(|bar| match bar {
            Some(bar) => bar.println(text),
            None => println!("{text}"),
        });
    }

    fn render_upload(&self, event: &UploadEvent) {
        self.with_bar(|bar| match event {
            UploadEvent::StatusChanged(UploadStatus::Uploading) => {
                let progress = ProgressBar::new(0);
                progress.set_style(
                    ProgressStyle::with_template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                progress.set_message("uploading");
                *bar = Some(progress);
            }
            UploadEvent::StatusChanged(UploadStatus::Validating) => {
                if let Some(bar) = bar {
                    bar.set_message("validating firmware on device...");
                }
            }
            UploadEvent::StatusChanged(status) if status.is_terminal() => {
                if let Some(bar) = bar.take() {
                    if *status == UploadStatus::Succeeded {
                        bar.finish_with_message("done");
                    } else {
                        bar.abandon();
                    }
                }
            }
            UploadEvent::Progress {
                bytes_sent, total, ..
            } => {
                if let Some(bar) = bar {
                    bar.set_length(*total);
                    bar.set_position(*bytes_sent);
                }
            }
            UploadEvent::Sample(sample) => {
                if let Some(bar) = bar {
                    bar.set_message(sample_message(
                        sample.speed_bytes_per_sec,
                        sample.eta_secs,
                    ));
                }
            }
            _ => {}
        });
    }
}

impl Presenter for TerminalPresenter {
    fn render(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::InfoLoaded(info) => {
                for line in info_lines(info) {
                    self.line(&line);
                }
            }
            WorkflowEvent::Upload(event) => self.render_upload(event),
            WorkflowEvent::RestartCountdown { remaining_secs } => {
                self.line(&format!("Device restarting in {remaining_secs}s..."))
            }
            WorkflowEvent::Reconnecting(attempt) => self.line(&format!(
                "Waiting for device... (attempt {}/{})",
                attempt.attempt_number, attempt.max_attempts
            )),
            WorkflowEvent::DeviceOnline { attempts } => {
                debug!("device online after {attempts} attempts")
            }
            WorkflowEvent::ReconnectTimedOut { attempts } => self.line(&format!(
                "Device did not respond after {attempts} attempts. Check it manually and run `info` again."
            )),
        }
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Error => eprintln!("error: {message}"),
            NotifyLevel::Warning => self.line(&format!("warning: {message}")),
            NotifyLevel::Success | NotifyLevel::Info => self.line(message),
        }
    }

    fn set_busy(&self, action: Action, busy: bool) {
        debug!("{action:?} busy: {busy}");
    }
}

/// Confirmation on stdin, `assume_yes` accepts without asking
pub struct TerminalDialog {
    assume_yes: bool,
}

impl TerminalDialog {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl ConfirmationDialog for TerminalDialog {
    async fn show_dialog(&self, request: &ConfirmationRequest) -> bool {
        println!("{}", dialog_text(request));

        if self.assume_yes {
            println!("{} (--yes)", request.confirm_label);
            return true;
        }

        print!("{}? (y/N): ", request.confirm_label);
        if let Err(e) = std::io::stdout().flush() {
            warn!("failed to flush stdout: {e}");
        }

        let mut answer = String::new();
        match BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await
        {
            Ok(_) => is_yes(&answer),
            Err(e) => {
                warn!("failed to read confirmation: {e}");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn dialog_text(request: &ConfirmationRequest) -> String {
    let marker = match request.severity {
        Severity::Info => "",
        Severity::Warning | Severity::Danger => "WARNING: ",
    };

    let mut text = format!("\n{marker}{}\n", request.title);
    for line in &request.body {
        text.push_str(&format!("  {line}\n"));
    }
    text
}

fn sample_message(speed_bytes_per_sec: f64, eta_secs: Option<f64>) -> String {
    match eta_secs {
        Some(eta) => format!(
            "{} - {} remaining",
            format_rate(speed_bytes_per_sec),
            format_duration(eta)
        ),
        None => format!("{} - calculating...", format_rate(speed_bytes_per_sec)),
    }
}

fn info_lines(info: &OtaInfo) -> Vec<String> {
    let text = |value: &Option<String>| value.clone().unwrap_or_else(|| UNKNOWN.to_string());

    let mut lines = vec![
        format!("Firmware Version: {}", text(&info.version)),
        format!("Build Date:       {}", text(&info.build_date)),
        format!("IDF Version:      {}", text(&info.idf_version)),
    ];
    if let Some(label) = &info.partition_label {
        lines.push(format!("Partition:        {label}"));
    }
    if let Some(size) = info.app_size {
        lines.push(format!("App Size:         {}", format_size(size)));
    }
    lines.push(format!(
        "Rollback:         {}",
        if info.can_rollback {
            "available"
        } else {
            "no previous firmware"
        }
    ));
    lines
}
