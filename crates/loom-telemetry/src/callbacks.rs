// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Veto callbacks run before events, breadcrumbs and sessions are accepted.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use loom_telemetry_core::{Breadcrumb, FailureEvent, Session};
use parking_lot::RwLock;
use tracing::error;

thread_local! {
	static IN_USER_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Runs user code, catching any panic it raises.
///
/// While `f` runs, [`in_user_callback`] is true on this thread so the panic
/// hook leaves the panic to the surrounding `catch_unwind`.
pub(crate) fn catch_user_panic<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
	let outer = IN_USER_CALLBACK.with(|flag| flag.replace(true));
	let result = catch_unwind(AssertUnwindSafe(f));
	IN_USER_CALLBACK.with(|flag| flag.set(outer));
	result
}

/// True while this thread is inside [`catch_user_panic`].
pub(crate) fn in_user_callback() -> bool {
	IN_USER_CALLBACK.with(Cell::get)
}

/// A predicate that may mutate its subject. Returning `false` vetoes it.
pub type Callback<T> = Arc<dyn Fn(&mut T) -> bool + Send + Sync>;

/// An ordered set of callbacks, compared by identity.
///
/// The list is copy-on-write: a run iterates the snapshot it started with,
/// so callbacks added or removed mid-run only affect later runs.
pub struct CallbackChain<T> {
	callbacks: RwLock<Arc<Vec<Callback<T>>>>,
}

impl<T> CallbackChain<T> {
	pub fn new() -> Self {
		Self {
			callbacks: RwLock::new(Arc::new(Vec::new())),
		}
	}

	/// Registers `callback`. Returns false if it was already registered.
	pub fn add(&self, callback: Callback<T>) -> bool {
		let mut callbacks = self.callbacks.write();
		if callbacks.iter().any(|existing| same_callback(existing, &callback)) {
			return false;
		}
		Arc::make_mut(&mut *callbacks).push(callback);
		true
	}

	/// Unregisters `callback`. Returns false if it was not registered.
	pub fn remove(&self, callback: &Callback<T>) -> bool {
		let mut callbacks = self.callbacks.write();
		let Some(idx) = callbacks
			.iter()
			.position(|existing| same_callback(existing, callback))
		else {
			return false;
		};
		Arc::make_mut(&mut *callbacks).remove(idx);
		true
	}

	/// Runs every callback in registration order.
	///
	/// Stops at the first veto and returns false. A panicking callback is
	/// logged and skipped.
	pub fn run(&self, subject: &mut T) -> bool {
		let snapshot = Arc::clone(&self.callbacks.read());
		for (idx, callback) in snapshot.iter().enumerate() {
			match catch_user_panic(|| callback(subject)) {
				Ok(true) => {}
				Ok(false) => return false,
				Err(payload) => {
					error!(
						callback_index = idx,
						panic = %panic_message(payload.as_ref()),
						"Telemetry callback panicked, skipping it"
					);
				}
			}
		}
		true
	}

	pub fn len(&self) -> usize {
		self.callbacks.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.callbacks.read().is_empty()
	}
}

impl<T> Default for CallbackChain<T> {
	fn default() -> Self {
		Self::new()
	}
}

fn same_callback<T>(a: &Callback<T>, b: &Callback<T>) -> bool {
	Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Runs a one-off callback passed with a single capture. A panic is logged
/// and counts as accepting.
pub(crate) fn run_call_callback<T>(callback: impl FnOnce(&mut T) -> bool, subject: &mut T) -> bool {
	match catch_user_panic(|| callback(subject)) {
		Ok(keep) => keep,
		Err(payload) => {
			error!(
				panic = %panic_message(payload.as_ref()),
				"Per-call telemetry callback panicked, keeping subject"
			);
			true
		}
	}
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}

/// The three callback chains shared by the client's components.
#[derive(Clone, Default)]
pub struct CallbackState {
	pub on_failure: Arc<CallbackChain<FailureEvent>>,
	pub on_breadcrumb: Arc<CallbackChain<Breadcrumb>>,
	pub on_session_start: Arc<CallbackChain<Session>>,
}

impl CallbackState {
	pub fn new() -> Self {
		Self::default()
	}
}
