// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the telemetry SDK.

use std::time::Duration;

use loom_telemetry_core::EncodeError;
use thiserror::Error;

use crate::delivery::DeliveryOutcome;

/// Result type alias for client construction and configuration.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while building or configuring the telemetry client.
#[derive(Debug, Error)]
pub enum TelemetryError {
	/// API key missing or empty.
	#[error("invalid API key: must be non-empty")]
	InvalidApiKey,

	/// Neither an endpoint nor a custom delivery was supplied.
	#[error("an endpoint or a custom delivery is required")]
	MissingEndpoint,

	/// No tokio runtime handle was supplied and none is current.
	#[error("a tokio runtime is required")]
	MissingRuntime,

	/// A configuration value is out of range.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// The on-disk record store could not be opened.
	#[error("record store unavailable: {0}")]
	Store(#[from] StoreError),

	/// The HTTP delivery could not be constructed.
	#[error("delivery unavailable: {0}")]
	Delivery(#[from] DeliveryError),

	/// The hang watchdog could not be started.
	#[error("watchdog unavailable: {0}")]
	Watchdog(#[from] WatchdogError),
}

/// Errors raised by a [`RecordStore`](crate::store::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("record not found: {0}")]
	NotFound(String),

	#[error("invalid record id: {0}")]
	InvalidRecordId(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Encode(#[from] EncodeError),
}

impl StoreError {
	pub fn is_not_found(&self) -> bool {
		match self {
			Self::NotFound(_) => true,
			Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
			Self::InvalidRecordId(_) | Self::Encode(_) => false,
		}
	}
}

/// Errors raised while capturing an event.
#[derive(Debug, Error)]
pub enum CaptureError {
	/// The event could not be written to the record store.
	#[error("failed to persist event: {0}")]
	Persist(#[from] StoreError),

	/// The client or queue has been shut down.
	#[error("telemetry client has been shut down")]
	Shutdown,
}

/// Errors surfaced by a [`Delivery`](crate::delivery::Delivery) collaborator.
#[derive(Debug, Error)]
pub enum DeliveryError {
	/// The request never produced a response.
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),

	/// The collaborator classified a response itself.
	#[error("server responded with status {status}: {message}")]
	Status { status: u16, message: String },

	/// Any other collaborator failure.
	#[error("delivery failed: {0}")]
	Other(String),
}

impl DeliveryError {
	/// Whether the record should be kept for the next flush.
	///
	/// Transport failures are always retryable. Status failures follow
	/// [`DeliveryOutcome::for_status`].
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Transport(_) => true,
			Self::Status { status, .. } => {
				DeliveryOutcome::for_status(*status) != DeliveryOutcome::RejectedPermanently
			}
			Self::Other(_) => true,
		}
	}
}

/// Errors raised by the hang watchdog.
#[derive(Debug, Error)]
pub enum WatchdogError {
	#[error("hang threshold must be greater than zero, got {0:?}")]
	InvalidThreshold(Duration),

	#[error("watchdog is already running")]
	AlreadyRunning,

	#[error("failed to spawn watchdog thread: {0}")]
	Spawn(#[source] std::io::Error),
}
