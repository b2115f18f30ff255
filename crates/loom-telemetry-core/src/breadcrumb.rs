// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Breadcrumb types (diagnostic markers leading up to a failure).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, EncodeResult};
use crate::stream::{JsonStream, Streamable};

/// Messages longer than this are truncated on construction.
pub const MAX_BREADCRUMB_MESSAGE_CHARS: usize = 140;

/// A timestamped marker describing app activity before a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
	pub timestamp: DateTime<Utc>,
	pub message: String,
	#[serde(rename = "type")]
	pub kind: BreadcrumbType,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Breadcrumb {
	/// Creates a manual breadcrumb with no metadata.
	pub fn new(message: impl Into<String>) -> Self {
		Self::with_type(message, BreadcrumbType::Manual, BTreeMap::new())
	}

	pub fn with_type(
		message: impl Into<String>,
		kind: BreadcrumbType,
		metadata: BTreeMap<String, serde_json::Value>,
	) -> Self {
		Self {
			timestamp: Utc::now(),
			message: truncate_message(message.into()),
			kind,
			metadata,
		}
	}
}

fn truncate_message(message: String) -> String {
	match message.char_indices().nth(MAX_BREADCRUMB_MESSAGE_CHARS) {
		Some((idx, _)) => message[..idx].to_string(),
		None => message,
	}
}

impl Streamable for Breadcrumb {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("timestamp", &self.timestamp)?;
		stream.field("message", &self.message)?;
		stream.field("type", self.kind.as_str())?;
		if !self.metadata.is_empty() {
			stream.field("metadata", &self.metadata)?;
		}
		stream.end_object()?;
		Ok(())
	}
}

/// Closed set of breadcrumb categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbType {
	State,
	Navigation,
	Request,
	Error,
	Log,
	User,
	Process,
	Manual,
}

impl BreadcrumbType {
	pub const ALL: [BreadcrumbType; 8] = [
		Self::State,
		Self::Navigation,
		Self::Request,
		Self::Error,
		Self::Log,
		Self::User,
		Self::Process,
		Self::Manual,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::State => "state",
			Self::Navigation => "navigation",
			Self::Request => "request",
			Self::Error => "error",
			Self::Log => "log",
			Self::User => "user",
			Self::Process => "process",
			Self::Manual => "manual",
		}
	}
}

impl fmt::Display for BreadcrumbType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BreadcrumbType {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|kind| kind.as_str() == s)
			.ok_or_else(|| CoreError::InvalidBreadcrumbType(s.to_string()))
	}
}
