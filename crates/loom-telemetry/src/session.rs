// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process session tracking.

use std::sync::Arc;

use loom_telemetry_core::Session;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::callbacks::CallbackChain;
use crate::observers::{Observers, TelemetryNotification};

struct SessionState {
	current: Option<Session>,
	paused: bool,
}

/// Tracks the current session and its failure counters.
pub struct SessionTracker {
	state: RwLock<SessionState>,
	callbacks: Arc<CallbackChain<Session>>,
	observers: Observers,
}

impl SessionTracker {
	pub fn new(callbacks: Arc<CallbackChain<Session>>, observers: Observers) -> Self {
		Self {
			state: RwLock::new(SessionState {
				current: None,
				paused: false,
			}),
			callbacks,
			observers,
		}
	}

	/// Starts a new session, replacing any current one.
	///
	/// Returns `None` if an on_session_start callback vetoed it, in which case
	/// the previous session is left untouched.
	pub fn start_session(&self) -> Option<Session> {
		let mut session = Session::new();
		if !self.callbacks.run(&mut session) {
			debug!(session_id = %session.id, "Session vetoed by on_session_start callback");
			return None;
		}

		{
			let mut state = self.state.write();
			state.current = Some(session.clone());
			state.paused = false;
		}
		info!(session_id = %session.id, "Session started");
		self.observers.notify(TelemetryNotification::SessionStarted {
			session: session.clone(),
		});
		Some(session)
	}

	/// Stops attaching the current session to events until resumed.
	pub fn pause_session(&self) {
		let mut state = self.state.write();
		if state.current.is_some() && !state.paused {
			state.paused = true;
			debug!("Session paused");
		}
	}

	/// Resumes a paused session. Returns true if one was resumed.
	///
	/// Starts a new session if there is none and returns false.
	pub fn resume_session(&self) -> bool {
		{
			let mut state = self.state.write();
			if state.current.is_some() {
				let resumed = state.paused;
				state.paused = false;
				if resumed {
					debug!("Session resumed");
				}
				return resumed;
			}
		}
		self.start_session();
		false
	}

	/// The active session. `None` while paused.
	pub fn current_session(&self) -> Option<Session> {
		let state = self.state.read();
		if state.paused {
			None
		} else {
			state.current.clone()
		}
	}

	/// Counts a captured event against the active session and returns the
	/// updated copy to embed in the event.
	pub fn record_event(&self, unhandled: bool) -> Option<Session> {
		let mut state = self.state.write();
		if state.paused {
			return None;
		}
		let session = state.current.as_mut()?;
		if unhandled {
			session.unhandled_count += 1;
		} else {
			session.handled_count += 1;
		}
		Some(session.clone())
	}
}
