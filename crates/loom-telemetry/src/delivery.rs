// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of encoded payloads to the collector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// SDK version for identification.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
/// SDK name for identification.
pub const SDK_NAME: &str = "loom-telemetry-rust";

pub const HEADER_API_KEY: &str = "X-Loom-Api-Key";
pub const HEADER_PAYLOAD_VERSION: &str = "X-Loom-Payload-Version";
pub const HEADER_SENT_AT: &str = "X-Loom-Sent-At";
pub const HEADER_EVENT_ID: &str = "X-Loom-Event-Id";

/// Result of one delivery attempt, as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// Accepted by the collector. The record is removed.
	Delivered,
	/// The collector will never accept this payload. The record is removed.
	RejectedPermanently,
	/// Retry on the next flush. The record is kept.
	TransientFailure,
}

impl DeliveryOutcome {
	/// Maps an HTTP status to an outcome.
	///
	/// 2xx is delivered. 408 and 429 are transient. Any other 4xx is a
	/// permanent rejection. Everything else, including 1xx, 3xx and 5xx, is
	/// transient.
	pub fn for_status(status: u16) -> Self {
		match status {
			200..=299 => Self::Delivered,
			408 | 429 => Self::TransientFailure,
			400..=499 => Self::RejectedPermanently,
			_ => Self::TransientFailure,
		}
	}

	pub fn removes_record(&self) -> bool {
		!matches!(self, Self::TransientFailure)
	}
}

/// Headers sent with every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHeaders {
	pub api_key: String,
	pub payload_version: String,
	pub sent_at: DateTime<Utc>,
	/// The record id. Stable across retries so the collector can dedupe.
	pub event_id: String,
}

impl DeliveryHeaders {
	pub fn pairs(&self) -> [(&'static str, String); 4] {
		[
			(HEADER_API_KEY, self.api_key.clone()),
			(HEADER_PAYLOAD_VERSION, self.payload_version.clone()),
			(
				HEADER_SENT_AT,
				self.sent_at.to_rfc3339_opts(SecondsFormat::Millis, true),
			),
			(HEADER_EVENT_ID, self.event_id.clone()),
		]
	}
}

/// Ships an encoded payload somewhere.
///
/// Implementations own timeouts and transport details. Returning an error is
/// treated as transient unless [`DeliveryError::is_retryable`] says otherwise.
#[async_trait]
pub trait Delivery: Send + Sync {
	async fn deliver(
		&self,
		payload: Vec<u8>,
		headers: &DeliveryHeaders,
	) -> Result<DeliveryOutcome, DeliveryError>;
}

/// Posts payloads as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
	endpoint: String,
	client: Client,
}

impl HttpDelivery {
	pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
		let client = Client::builder()
			.timeout(timeout)
			.user_agent(format!("{SDK_NAME}/{SDK_VERSION}"))
			.build()?;
		Ok(Self::with_client(endpoint, client))
	}

	/// Uses an existing client, keeping its connection pool and settings.
	pub fn with_client(endpoint: impl Into<String>, client: Client) -> Self {
		Self {
			endpoint: endpoint.into(),
			client,
		}
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}
}

#[async_trait]
impl Delivery for HttpDelivery {
	async fn deliver(
		&self,
		payload: Vec<u8>,
		headers: &DeliveryHeaders,
	) -> Result<DeliveryOutcome, DeliveryError> {
		debug!(
			endpoint = %self.endpoint,
			event_id = %headers.event_id,
			bytes = payload.len(),
			"Sending telemetry payload"
		);

		let mut request = self
			.client
			.post(&self.endpoint)
			.header(reqwest::header::CONTENT_TYPE, "application/json")
			.body(payload);
		for (name, value) in headers.pairs() {
			request = request.header(name, value);
		}

		let response = request.send().await?;
		let status = response.status().as_u16();
		let outcome = DeliveryOutcome::for_status(status);

		if outcome == DeliveryOutcome::RejectedPermanently {
			let message = response.text().await.unwrap_or_default();
			warn!(status, message = %message, "Collector rejected telemetry payload");
		} else {
			debug!(status, outcome = ?outcome, "Collector responded");
		}

		Ok(outcome)
	}
}
