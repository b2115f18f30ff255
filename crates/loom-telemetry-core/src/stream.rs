// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming JSON encoder.
//!
//! [`JsonStream`] writes a single JSON document straight into a sink without
//! building an intermediate tree. Types describe themselves through
//! [`Streamable`]; raw content (for example a report file written by another
//! process) is copied through in chunks.
//!
//! Object keys are deferred until their value arrives, so a key whose value
//! is null is dropped instead of being written as `"key":null`. Nulls inside
//! arrays are kept.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::trace;

use crate::error::{EncodeError, EncodeResult};

const RAW_CHUNK_SIZE: usize = 8 * 1024;

/// A value that knows how to write itself into a [`JsonStream`].
pub trait Streamable {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
	Object,
	Array,
}

#[derive(Debug)]
struct Scope {
	kind: ScopeKind,
	has_items: bool,
}

/// Incremental JSON writer over any [`Write`] sink.
pub struct JsonStream<'w> {
	out: &'w mut dyn Write,
	scopes: Vec<Scope>,
	deferred_name: Option<String>,
	root_written: bool,
}

impl std::fmt::Debug for JsonStream<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JsonStream")
			.field("scopes", &self.scopes)
			.field("deferred_name", &self.deferred_name)
			.field("root_written", &self.root_written)
			.finish_non_exhaustive()
	}
}

impl<'w> JsonStream<'w> {
	pub fn new(out: &'w mut dyn Write) -> Self {
		Self {
			out,
			scopes: Vec::new(),
			deferred_name: None,
			root_written: false,
		}
	}

	pub fn begin_object(&mut self) -> EncodeResult<&mut Self> {
		trace!(kind = "object", depth = self.scopes.len(), "writing value to stream");
		self.before_value()?;
		self.out.write_all(b"{")?;
		self.scopes.push(Scope {
			kind: ScopeKind::Object,
			has_items: false,
		});
		Ok(self)
	}

	pub fn end_object(&mut self) -> EncodeResult<&mut Self> {
		self.close(ScopeKind::Object, b"}")
	}

	pub fn begin_array(&mut self) -> EncodeResult<&mut Self> {
		trace!(kind = "array", depth = self.scopes.len(), "writing value to stream");
		self.before_value()?;
		self.out.write_all(b"[")?;
		self.scopes.push(Scope {
			kind: ScopeKind::Array,
			has_items: false,
		});
		Ok(self)
	}

	pub fn end_array(&mut self) -> EncodeResult<&mut Self> {
		self.close(ScopeKind::Array, b"]")
	}

	/// Sets the key for the next value inside the current object.
	pub fn name(&mut self, name: &str) -> EncodeResult<&mut Self> {
		match self.scopes.last() {
			Some(scope) if scope.kind == ScopeKind::Object => {}
			_ => {
				return Err(EncodeError::unsupported(format!(
					"key `{name}` written outside of an object"
				)))
			}
		}
		if let Some(pending) = &self.deferred_name {
			return Err(EncodeError::unsupported(format!(
				"key `{name}` written while key `{pending}` has no value"
			)));
		}
		self.deferred_name = Some(name.to_string());
		Ok(self)
	}

	pub fn null_value(&mut self) -> EncodeResult<&mut Self> {
		if self.deferred_name.take().is_some() {
			return Ok(self);
		}
		self.before_value()?;
		self.out.write_all(b"null")?;
		Ok(self)
	}

	pub fn bool_value(&mut self, value: bool) -> EncodeResult<&mut Self> {
		self.scalar(&value)
	}

	pub fn i64_value(&mut self, value: i64) -> EncodeResult<&mut Self> {
		self.scalar(&value)
	}

	pub fn u64_value(&mut self, value: u64) -> EncodeResult<&mut Self> {
		self.scalar(&value)
	}

	pub fn f64_value(&mut self, value: f64) -> EncodeResult<&mut Self> {
		if !value.is_finite() {
			return Err(EncodeError::unsupported(format!(
				"non-finite number {value} cannot be encoded"
			)));
		}
		self.scalar(&value)
	}

	pub fn string_value(&mut self, value: &str) -> EncodeResult<&mut Self> {
		self.scalar(value)
	}

	/// Writes any self-describing value.
	pub fn value<S: Streamable + ?Sized>(&mut self, value: &S) -> EncodeResult<&mut Self> {
		value.to_stream(self)?;
		Ok(self)
	}

	/// Writes `name` followed by `value`.
	pub fn field<S: Streamable + ?Sized>(
		&mut self,
		name: &str,
		value: &S,
	) -> EncodeResult<&mut Self> {
		self.name(name)?;
		self.value(value)
	}

	/// Copies already-encoded JSON from `reader` into the document.
	///
	/// The content is not parsed. Empty content is written as null, which
	/// drops the pending key when inside an object.
	pub fn raw_reader<R: Read>(&mut self, mut reader: R) -> EncodeResult<&mut Self> {
		trace!(kind = "raw", depth = self.scopes.len(), "writing value to stream");
		let mut chunk = [0u8; RAW_CHUNK_SIZE];
		let first = read_chunk(&mut reader, &mut chunk)?;
		if first == 0 {
			return self.null_value();
		}

		self.before_value()?;
		self.out.write_all(&chunk[..first])?;
		loop {
			let read = read_chunk(&mut reader, &mut chunk)?;
			if read == 0 {
				break;
			}
			self.out.write_all(&chunk[..read])?;
		}
		Ok(self)
	}

	/// Copies the contents of a file holding encoded JSON into the document.
	pub fn raw_file(&mut self, path: &Path) -> EncodeResult<&mut Self> {
		let file = File::open(path)?;
		self.raw_reader(file)
	}

	/// Validates that exactly one complete document was written and flushes.
	pub fn finish(mut self) -> EncodeResult<()> {
		if let Some(name) = self.deferred_name.take() {
			return Err(EncodeError::unsupported(format!(
				"key `{name}` has no value"
			)));
		}
		if !self.scopes.is_empty() {
			return Err(EncodeError::unsupported(format!(
				"{} unclosed scope(s) at end of document",
				self.scopes.len()
			)));
		}
		if !self.root_written {
			return Err(EncodeError::unsupported("empty document"));
		}
		self.out.flush()?;
		Ok(())
	}

	fn scalar<T: Serialize + ?Sized>(&mut self, value: &T) -> EncodeResult<&mut Self> {
		self.before_value()?;
		serde_json::to_writer(&mut *self.out, value).map_err(EncodeError::from_json)?;
		Ok(self)
	}

	fn before_value(&mut self) -> EncodeResult<()> {
		let Some(scope) = self.scopes.last_mut() else {
			if self.root_written {
				return Err(EncodeError::unsupported(
					"a document holds a single top-level value",
				));
			}
			self.root_written = true;
			return Ok(());
		};

		let name = match scope.kind {
			ScopeKind::Object => Some(self.deferred_name.take().ok_or_else(|| {
				EncodeError::unsupported("value written inside an object without a key")
			})?),
			ScopeKind::Array => None,
		};

		if scope.has_items {
			self.out.write_all(b",")?;
		}
		scope.has_items = true;

		if let Some(name) = name {
			serde_json::to_writer(&mut *self.out, &name).map_err(EncodeError::from_json)?;
			self.out.write_all(b":")?;
		}
		Ok(())
	}

	fn close(&mut self, kind: ScopeKind, token: &[u8]) -> EncodeResult<&mut Self> {
		match self.scopes.last() {
			Some(scope) if scope.kind == kind => {}
			_ => {
				return Err(EncodeError::unsupported(format!(
					"mismatched close of {kind:?}"
				)))
			}
		}
		if let Some(name) = self.deferred_name.take() {
			return Err(EncodeError::unsupported(format!(
				"key `{name}` has no value"
			)));
		}
		self.scopes.pop();
		self.out.write_all(token)?;
		Ok(self)
	}
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
	loop {
		match reader.read(buf) {
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			other => return other,
		}
	}
}

/// Encodes `value` into a freshly allocated buffer.
pub fn to_vec<S: Streamable + ?Sized>(value: &S) -> EncodeResult<Vec<u8>> {
	let mut buf = Vec::new();
	let mut stream = JsonStream::new(&mut buf);
	stream.value(value)?;
	stream.finish()?;
	Ok(buf)
}

/// Raw JSON content of a file, streamed without loading it into memory.
#[derive(Debug, Clone, Copy)]
pub struct FileContent<'a>(pub &'a Path);

impl Streamable for FileContent<'_> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.raw_file(self.0)?;
		Ok(())
	}
}

impl<T: Streamable + ?Sized> Streamable for &T {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		(**self).to_stream(stream)
	}
}

impl Streamable for str {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.string_value(self)?;
		Ok(())
	}
}

impl Streamable for String {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.string_value(self)?;
		Ok(())
	}
}

impl Streamable for bool {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.bool_value(*self)?;
		Ok(())
	}
}

macro_rules! signed_streamable {
	($($ty:ty),*) => {
		$(impl Streamable for $ty {
			fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
				stream.i64_value(i64::from(*self))?;
				Ok(())
			}
		})*
	};
}

macro_rules! unsigned_streamable {
	($($ty:ty),*) => {
		$(impl Streamable for $ty {
			fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
				stream.u64_value(u64::from(*self))?;
				Ok(())
			}
		})*
	};
}

signed_streamable!(i8, i16, i32, i64);
unsigned_streamable!(u8, u16, u32, u64);

impl Streamable for usize {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.u64_value(*self as u64)?;
		Ok(())
	}
}

impl Streamable for f64 {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.f64_value(*self)?;
		Ok(())
	}
}

impl<T: Streamable> Streamable for Option<T> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		match self {
			Some(value) => value.to_stream(stream),
			None => {
				stream.null_value()?;
				Ok(())
			}
		}
	}
}

impl<T: Streamable> Streamable for [T] {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_array()?;
		for item in self {
			stream.value(item)?;
		}
		stream.end_array()?;
		Ok(())
	}
}

impl<T: Streamable> Streamable for Vec<T> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		self.as_slice().to_stream(stream)
	}
}

impl<T: Streamable> Streamable for BTreeMap<String, T> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		for (key, value) in self {
			stream.field(key, value)?;
		}
		stream.end_object()?;
		Ok(())
	}
}

impl<T: Streamable, S> Streamable for HashMap<String, T, S> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.begin_object()?;
		for (key, value) in self {
			stream.field(key, value)?;
		}
		stream.end_object()?;
		Ok(())
	}
}

impl Streamable for serde_json::Value {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		use serde_json::Value;

		match self {
			Value::Null => {
				stream.null_value()?;
			}
			Value::Bool(b) => {
				stream.bool_value(*b)?;
			}
			Value::Number(n) => {
				stream.scalar(n)?;
			}
			Value::String(s) => {
				stream.string_value(s)?;
			}
			Value::Array(items) => {
				stream.begin_array()?;
				for item in items {
					stream.value(item)?;
				}
				stream.end_array()?;
			}
			Value::Object(map) => {
				stream.begin_object()?;
				for (key, value) in map {
					stream.field(key, value)?;
				}
				stream.end_object()?;
			}
		}
		Ok(())
	}
}

impl Streamable for DateTime<Utc> {
	fn to_stream(&self, stream: &mut JsonStream<'_>) -> EncodeResult<()> {
		stream.string_value(&self.to_rfc3339_opts(SecondsFormat::Millis, true))?;
		Ok(())
	}
}
