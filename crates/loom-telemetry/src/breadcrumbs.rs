// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded trail of breadcrumbs leading up to a failure.

use std::collections::VecDeque;
use std::sync::Arc;

use loom_telemetry_core::Breadcrumb;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::callbacks::CallbackChain;
use crate::observers::{Observers, TelemetryNotification};

/// Default number of breadcrumbs retained.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 25;
/// Largest configurable trail.
pub const MAX_BREADCRUMBS_LIMIT: usize = 100;

/// Ring buffer of the most recent breadcrumbs.
pub struct BreadcrumbTrail {
	entries: RwLock<VecDeque<Breadcrumb>>,
	capacity: usize,
	callbacks: Arc<CallbackChain<Breadcrumb>>,
	observers: Observers,
}

impl BreadcrumbTrail {
	/// Creates a trail holding at most `capacity` breadcrumbs. A capacity of
	/// zero disables storage.
	pub fn new(
		capacity: usize,
		callbacks: Arc<CallbackChain<Breadcrumb>>,
		observers: Observers,
	) -> Self {
		Self {
			entries: RwLock::new(VecDeque::with_capacity(capacity)),
			capacity,
			callbacks,
			observers,
		}
	}

	/// Runs the on_breadcrumb chain and stores the breadcrumb if accepted.
	pub fn append(&self, mut breadcrumb: Breadcrumb) -> bool {
		if self.capacity == 0 {
			return false;
		}
		if !self.callbacks.run(&mut breadcrumb) {
			debug!(message = %breadcrumb.message, "Breadcrumb vetoed by on_breadcrumb callback");
			return false;
		}

		let trail_len = {
			let mut entries = self.entries.write();
			if entries.len() >= self.capacity {
				entries.pop_front();
			}
			entries.push_back(breadcrumb.clone());
			entries.len()
		};

		self.observers
			.notify(TelemetryNotification::BreadcrumbAdded {
				breadcrumb,
				trail_len,
			});
		true
	}

	/// Copy of the trail, oldest first.
	pub fn snapshot(&self) -> Vec<Breadcrumb> {
		self.entries.read().iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn clear(&self) {
		self.entries.write().clear();
	}
}

/// Clamps a configured trail size to [`MAX_BREADCRUMBS_LIMIT`].
pub(crate) fn clamp_capacity(requested: usize) -> usize {
	if requested > MAX_BREADCRUMBS_LIMIT {
		warn!(
			requested,
			limit = MAX_BREADCRUMBS_LIMIT,
			"max_breadcrumbs above limit, clamping"
		);
		MAX_BREADCRUMBS_LIMIT
	} else {
		requested
	}
}
