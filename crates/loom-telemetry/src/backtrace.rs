// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stack capture for synthetic and panic events.

use std::backtrace::Backtrace;

use loom_telemetry_core::{Frame, Stacktrace};
use rustc_demangle::demangle;

/// Captures the current thread's stack.
pub fn capture_stacktrace() -> Stacktrace {
	let backtrace = Backtrace::force_capture();
	Stacktrace {
		frames: parse_frames(&format!("{backtrace:#}")),
	}
}

/// Parses the std backtrace text format.
///
/// Symbol lines look like `  3: my_app::run`; each may be followed by a
/// location line `at ./src/main.rs:10:5` belonging to that symbol.
fn parse_frames(text: &str) -> Vec<Frame> {
	let mut frames: Vec<Frame> = Vec::new();

	for line in text.lines().map(str::trim) {
		if line.is_empty() {
			continue;
		}
		if let Some(location) = line.strip_prefix("at ") {
			if let Some(frame) = frames.last_mut() {
				let (filename, lineno) = parse_location(location);
				frame.filename = Some(filename);
				frame.lineno = lineno;
			}
			continue;
		}
		if let Some(frame) = parse_symbol_line(line) {
			frames.push(frame);
		}
	}

	frames
}

fn parse_symbol_line(line: &str) -> Option<Frame> {
	let symbol = match line.split_once(':') {
		Some((index, rest)) if index.trim().parse::<u32>().is_ok() => rest.trim(),
		_ => line,
	};
	if symbol.is_empty() {
		return None;
	}

	let function = demangle(symbol).to_string();
	let module = function.rfind("::").map(|idx| function[..idx].to_string());
	let in_app = is_in_app_frame(&function);

	Some(Frame {
		function: Some(function),
		module,
		filename: None,
		lineno: None,
		in_app,
	})
}

/// Splits `path:line:col` into the path and line number.
fn parse_location(location: &str) -> (String, Option<u32>) {
	let mut parts = location.rsplitn(3, ':');
	let col = parts.next();
	let line = parts.next();
	let path = parts.next();

	match (path, line, col) {
		(Some(path), Some(line), Some(col))
			if line.parse::<u32>().is_ok() && col.parse::<u32>().is_ok() =>
		{
			(path.to_string(), line.parse().ok())
		}
		_ => (location.to_string(), None),
	}
}

/// Whether a demangled symbol belongs to application code rather than the
/// standard library, the async runtime or this SDK.
fn is_in_app_frame(function: &str) -> bool {
	const SYSTEM_PREFIXES: &[&str] = &[
		"std::",
		"core::",
		"alloc::",
		"<std::",
		"<core::",
		"<alloc::",
		"tokio::",
		"<tokio::",
		"tokio_util::",
		"tracing::",
		"<tracing::",
		"loom_telemetry::",
		"<loom_telemetry::",
		"panic_unwind::",
		"rust_begin_unwind",
		"rust_panic",
		"__rust_",
		"_rust_",
		"__libc_",
		"_start",
	];
	const SYSTEM_CONTAINS: &[&str] = &["::panicking::", "::sys_common::", "::rt::lang_start"];

	!SYSTEM_PREFIXES.iter().any(|p| function.starts_with(p))
		&& !SYSTEM_CONTAINS.iter().any(|c| function.contains(c))
}
