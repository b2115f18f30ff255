// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User context attached to failure events.

use serde::{Deserialize, Serialize};

use crate::error::EncodeResult;
use crate::stream::{JsonStream, Streamable};

/// User context at capture time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
}

impl UserContext {
	pub fn is_empty(&self) -> bool {
		self.id.is_none() && self.email.is_none() && self.username.is_none()
	}
}

impl Streamable for UserContext {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		stream.field("id", &self.id)?;
		stream.field("email", &self.email)?;
		stream.field("username", &self.username)?;
		stream.end_object()?;
		Ok(())
	}
}
