// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process session types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EncodeResult;
use crate::stream::{JsonStream, Streamable};

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for SessionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// A single period of app use. Events copy the session at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	pub id: SessionId,
	pub started_at: DateTime<Utc>,
	/// Handled failures captured during the session.
	pub handled_count: u32,
	/// Unhandled failures (crashes, panics, hangs) captured during the session.
	pub unhandled_count: u32,
}

impl Session {
	#[must_use]
	pub fn new() -> Self {
		Self {
			id: SessionId::new(),
			started_at: Utc::now(),
			handled_count: 0,
			unhandled_count: 0,
		}
	}
}

impl Default for Session {
	fn default() -> Self {
		Self::new()
	}
}

impl Streamable for Session {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("id", &self.id.to_string())?;
		stream.field("startedAt", &self.started_at)?;
		stream.field("handledCount", &self.handled_count)?;
		stream.field("unhandledCount", &self.unhandled_count)?;
		stream.end_object()?;
		Ok(())
	}
}
