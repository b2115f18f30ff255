// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Failure events: one captured, reportable incident.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breadcrumb::Breadcrumb;
use crate::context::UserContext;
use crate::error::{CoreError, EncodeResult};
use crate::session::Session;
use crate::stream::{JsonStream, Streamable};

/// Metadata sections: section name -> key -> value.
pub type Metadata = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// Unique identifier for a failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Error,
	Warning,
	Info,
}

impl Severity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Error => "error",
			Self::Warning => "warning",
			Self::Info => "info",
		}
	}
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Severity {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"error" => Ok(Self::Error),
			"warning" => Ok(Self::Warning),
			"info" => Ok(Self::Info),
			_ => Err(CoreError::InvalidSeverity(s.to_string())),
		}
	}
}

/// Why an event has its severity and handled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityReason {
	HandledException,
	UnhandledException,
	UnhandledPanic,
	ThreadBlocked,
	UserSpecifiedSeverity,
	CallbackSpecifiedSeverity,
}

impl SeverityReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::HandledException => "handled_exception",
			Self::UnhandledException => "unhandled_exception",
			Self::UnhandledPanic => "unhandled_panic",
			Self::ThreadBlocked => "thread_blocked",
			Self::UserSpecifiedSeverity => "user_specified_severity",
			Self::CallbackSpecifiedSeverity => "callback_specified_severity",
		}
	}
}

impl fmt::Display for SeverityReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SeverityReason {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		[
			Self::HandledException,
			Self::UnhandledException,
			Self::UnhandledPanic,
			Self::ThreadBlocked,
			Self::UserSpecifiedSeverity,
			Self::CallbackSpecifiedSeverity,
		]
		.into_iter()
		.find(|reason| reason.as_str() == s)
		.ok_or_else(|| CoreError::InvalidSeverityReason(s.to_string()))
	}
}

/// Handled/unhandled tag plus the reason for the event's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandledState {
	pub unhandled: bool,
	pub severity_reason: SeverityReason,
}

impl HandledState {
	pub fn handled() -> Self {
		Self {
			unhandled: false,
			severity_reason: SeverityReason::HandledException,
		}
	}

	pub fn unhandled(reason: SeverityReason) -> Self {
		Self {
			unhandled: true,
			severity_reason: reason,
		}
	}

	/// Default severity for the reason.
	pub fn default_severity(&self) -> Severity {
		match self.severity_reason {
			SeverityReason::HandledException => Severity::Warning,
			_ => Severity::Error,
		}
	}
}

impl Streamable for HandledState {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("unhandled", &self.unhandled)?;
		stream.field("severityReason", self.severity_reason.as_str())?;
		stream.end_object()?;
		Ok(())
	}
}

/// A single stack frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lineno: Option<u32>,
	#[serde(default)]
	pub in_app: bool,
}

impl Streamable for Frame {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("function", &self.function)?;
		stream.field("module", &self.module)?;
		stream.field("filename", &self.filename)?;
		stream.field("lineno", &self.lineno)?;
		stream.field("inApp", &self.in_app)?;
		stream.end_object()?;
		Ok(())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stacktrace {
	pub frames: Vec<Frame>,
}

impl Streamable for Stacktrace {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("frames", &self.frames)?;
		stream.end_object()?;
		Ok(())
	}
}

/// A snapshot of one reportable incident.
///
/// Mutable only while the failure callbacks run; the queue treats it as
/// immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
	pub id: EventId,
	pub timestamp: DateTime<Utc>,
	pub api_key: String,
	pub error_class: String,
	pub message: String,
	#[serde(default)]
	pub stacktrace: Stacktrace,
	pub severity: Severity,
	pub handled_state: HandledState,
	#[serde(default)]
	pub breadcrumbs: Vec<Breadcrumb>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session: Option<Session>,
	#[serde(default)]
	pub metadata: Metadata,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context: Option<String>,
	#[serde(default)]
	pub user: UserContext,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub release_stage: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub thread_name: Option<String>,
}

impl FailureEvent {
	/// Creates an event with the severity implied by `handled_state`.
	pub fn new(
		error_class: impl Into<String>,
		message: impl Into<String>,
		handled_state: HandledState,
	) -> Self {
		Self {
			id: EventId::new(),
			timestamp: Utc::now(),
			api_key: String::new(),
			error_class: error_class.into(),
			message: message.into(),
			stacktrace: Stacktrace::default(),
			severity: handled_state.default_severity(),
			handled_state,
			breadcrumbs: Vec::new(),
			session: None,
			metadata: Metadata::new(),
			context: None,
			user: UserContext::default(),
			app_version: None,
			release_stage: None,
			thread_name: None,
		}
	}

	pub fn is_unhandled(&self) -> bool {
		self.handled_state.unhandled
	}

	/// Adds or replaces one metadata value.
	pub fn add_metadata(
		&mut self,
		section: impl Into<String>,
		key: impl Into<String>,
		value: serde_json::Value,
	) {
		self.metadata
			.entry(section.into())
			.or_default()
			.insert(key.into(), value);
	}

	pub fn clear_metadata(&mut self, section: &str) {
		self.metadata.remove(section);
	}

	/// Sets the severity as an explicit user choice.
	pub fn set_severity(&mut self, severity: Severity) {
		self.severity = severity;
		if !self.handled_state.unhandled {
			self.handled_state.severity_reason = SeverityReason::UserSpecifiedSeverity;
		}
	}
}

impl Streamable for FailureEvent {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("id", &self.id.to_string())?;
		stream.field("timestamp", &self.timestamp)?;
		stream.field("apiKey", &self.api_key)?;
		stream.field("errorClass", &self.error_class)?;
		stream.field("message", &self.message)?;
		stream.field("stacktrace", &self.stacktrace)?;
		stream.field("severity", self.severity.as_str())?;
		stream.field("handledState", &self.handled_state)?;
		stream.field("breadcrumbs", &self.breadcrumbs)?;
		stream.field("session", &self.session)?;
		stream.field("metadata", &self.metadata)?;
		stream.field("context", &self.context)?;
		stream.field("user", &self.user)?;
		stream.field("appVersion", &self.app_version)?;
		stream.field("releaseStage", &self.release_stage)?;
		stream.field("threadName", &self.thread_name)?;
		stream.end_object()?;
		Ok(())
	}
}
