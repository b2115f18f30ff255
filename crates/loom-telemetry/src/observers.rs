// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Change notifications for external observers.

use loom_telemetry_core::{Breadcrumb, Session};
use tokio::sync::broadcast;

use crate::queue::AttemptOutcome;
use crate::store::RecordId;
use crate::watchdog::BlockedThread;

/// Default number of notifications buffered per subscriber.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// A state change inside the telemetry pipeline.
#[derive(Debug, Clone)]
pub enum TelemetryNotification {
	/// A breadcrumb was appended. `trail_len` is the trail size after the append.
	BreadcrumbAdded {
		breadcrumb: Breadcrumb,
		trail_len: usize,
	},
	/// A delivery attempt finished for a record.
	DeliveryAttempted {
		record_id: RecordId,
		outcome: AttemptOutcome,
	},
	/// A persisted record could not be decoded and was dropped.
	RecordCorrupt { record_id: RecordId },
	/// The monitored thread stopped processing its queue.
	HangDetected { thread: BlockedThread },
	/// A new session was accepted.
	SessionStarted { session: Session },
	/// Network connectivity changed.
	ConnectivityChanged {
		has_connection: bool,
		network_state: String,
	},
}

/// Fan-out of [`TelemetryNotification`]s to any number of subscribers.
///
/// Notifying with no subscribers is not an error. Slow subscribers lag and
/// miss the oldest notifications rather than blocking the pipeline.
#[derive(Debug, Clone)]
pub struct Observers {
	sender: broadcast::Sender<TelemetryNotification>,
}

impl Observers {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TelemetryNotification> {
		self.sender.subscribe()
	}

	pub fn notify(&self, notification: TelemetryNotification) {
		// Ignore errors if no subscribers
		let _ = self.sender.send(notification);
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for Observers {
	fn default() -> Self {
		Self::new(DEFAULT_OBSERVER_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_notify_without_subscribers_is_ok() {
		let observers = Observers::default();
		observers.notify(TelemetryNotification::ConnectivityChanged {
			has_connection: true,
			network_state: "wifi".to_string(),
		});
		assert_eq!(observers.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn test_every_subscriber_receives_notification() {
		let observers = Observers::default();
		let mut first = observers.subscribe();
		let mut second = observers.subscribe();

		observers.notify(TelemetryNotification::RecordCorrupt {
			record_id: RecordId::generate(),
		});

		assert!(matches!(
			first.recv().await.unwrap(),
			TelemetryNotification::RecordCorrupt { .. }
		));
		assert!(matches!(
			second.recv().await.unwrap(),
			TelemetryNotification::RecordCorrupt { .. }
		));
	}
}
