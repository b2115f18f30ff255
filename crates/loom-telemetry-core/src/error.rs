// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for telemetry core types and the stream encoder.

use thiserror::Error;

/// Errors raised when parsing core telemetry types.
#[derive(Debug, Error)]
pub enum CoreError {
	#[error("invalid breadcrumb type: {0}")]
	InvalidBreadcrumbType(String),

	#[error("invalid severity: {0}")]
	InvalidSeverity(String),

	#[error("invalid severity reason: {0}")]
	InvalidSeverityReason(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Result type for core telemetry operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while streaming a document.
///
/// `Io` means the sink (or a raw content source) failed and the document is
/// incomplete. `Unsupported` is a programmer error: the value or call
/// sequence cannot be represented and retrying will not help.
#[derive(Debug, Error)]
pub enum EncodeError {
	#[error("encoding failed: {0}")]
	Io(#[from] std::io::Error),

	#[error("unsupported value: {0}")]
	Unsupported(String),
}

impl EncodeError {
	pub(crate) fn unsupported(message: impl Into<String>) -> Self {
		Self::Unsupported(message.into())
	}

	pub(crate) fn from_json(err: serde_json::Error) -> Self {
		if err.is_io() {
			Self::Io(err.into())
		} else {
			Self::Unsupported(err.to_string())
		}
	}

	/// Returns true if the failure came from the sink rather than the value.
	pub fn is_io(&self) -> bool {
		matches!(self, Self::Io(_))
	}
}

/// Result type for stream encoding.
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;
