//! OTA workflow services
//!
//! This module contains the update logic separated from HTTP and terminal
//! concerns. Each service takes its collaborators as arguments or trait
//! implementations so it can be tested without a device.

pub mod confirmation;
pub mod firmware;
pub mod format;
pub mod reconnect;
pub mod upload;
pub mod workflow;
