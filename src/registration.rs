// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Service registration against an external, ZooKeeper-style path store.
//! The core only needs one capability from that store: ensure a path
//! exists, treating "already there" as success.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// `pid` in the provider URL is a monotonic counter shared across every
/// registrar in the process, not a real process id.
static PID_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_pid() -> u32 {
    PID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A failure ensuring a path exists in the backing coordination service.
#[derive(Debug)]
pub enum PathError {
    /// Any failure other than the path already being there.
    Backend(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Backend(msg) => write!(f, "path creation failed: {msg}"),
        }
    }
}

impl std::error::Error for PathError {}

/// The external coordination-service contract. Implementations that
/// report "already exists" should return `Ok(())`, so a retried
/// registration is a no-op rather than an error.
pub trait PathCreator {
    fn ensure_path(&mut self, path: &str) -> Result<(), PathError>;
}

/// Percent-encodes every byte that is not an unreserved URL character
/// (`ALPHA / DIGIT / "-" / "_" / "." / "~"`), matching `quote_plus`: a
/// literal space becomes `+`, everything else becomes an uppercase `%XX`.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Yields `/dubbo`, `/dubbo/<service>`, `/dubbo/<service>/providers`, then
/// the full path with the encoded provider URL appended, in that order:
/// the path-segment walk the registration flow drives `ensure_path` with.
fn path_segments(service_name: &str, encoded_url: &str) -> Vec<String> {
    let components = ["dubbo", service_name, "providers", encoded_url];
    (1..=components.len())
        .map(|n| format!("/{}", components[..n].join("/")))
        .collect()
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Builds the `dubbo://...` provider URL, not yet percent-encoded.
#[allow(clippy::too_many_arguments)]
fn provider_url(
    host: &str,
    port: u16,
    app: &str,
    dubbo_version: &str,
    service_name: &str,
    methods: &[String],
    pid: u32,
    revision: &str,
    group: Option<&str>,
    timestamp_ms: u64,
    version: &str,
) -> String {
    let group_field = match group {
        Some(g) => format!("&group={g}"),
        None => String::new(),
    };
    format!(
        "dubbo://{host}:{port}/{service}?anyhost=true&application={app}&dubbo={dv}{group_field}\
         &interface={service}&methods={methods}&pid={pid}&revision={revision}&side=provider\
         &timestamp={timestamp}&version={version}",
        host = host,
        port = port,
        service = service_name,
        app = app,
        dv = dubbo_version,
        group_field = group_field,
        methods = methods.join(","),
        pid = pid,
        revision = revision,
        timestamp = timestamp_ms,
        version = version,
    )
}

/// Tracks the services a provider exposes and publishes them to a
/// [`PathCreator`]. Holds only method names, not handlers: the handler
/// registry lives on the server side (`server::Registry`).
pub struct Registrar {
    host: String,
    port: u16,
    app: String,
    dubbo_version: String,
    services: Vec<(String, Vec<String>)>,
}

impl Registrar {
    pub fn new(host: impl Into<String>, port: u16, app: impl Into<String>) -> Self {
        Registrar {
            host: host.into(),
            port,
            app: app.into(),
            dubbo_version: "2.5.3".to_string(),
            services: Vec::new(),
        }
    }

    pub fn add_method(&mut self, service: impl Into<String>, method: impl Into<String>) {
        let service = service.into();
        let method = method.into();
        match self.services.iter_mut().find(|(s, _)| *s == service) {
            Some((_, methods)) => methods.push(method),
            None => self.services.push((service, vec![method])),
        }
    }

    /// Ensures a provider path for every currently registered service,
    /// using the real wall clock for `timestamp`.
    pub fn register(
        &self,
        creator: &mut impl PathCreator,
        version: &str,
        revision: &str,
        group: Option<&str>,
    ) -> Result<(), PathError> {
        self.register_at(creator, version, revision, group, current_timestamp_ms())
    }

    /// Same as [`Self::register`] but with an explicit timestamp, for
    /// deterministic tests.
    pub fn register_at(
        &self,
        creator: &mut impl PathCreator,
        version: &str,
        revision: &str,
        group: Option<&str>,
        timestamp_ms: u64,
    ) -> Result<(), PathError> {
        for (service_name, methods) in &self.services {
            let pid = next_pid();
            let url = provider_url(
                &self.host,
                self.port,
                &self.app,
                &self.dubbo_version,
                service_name,
                methods,
                pid,
                revision,
                group,
                timestamp_ms,
                version,
            );
            let encoded = percent_encode(&url);
            for path in path_segments(service_name, &encoded) {
                creator.ensure_path(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingCreator {
        paths: Vec<String>,
    }

    impl PathCreator for RecordingCreator {
        fn ensure_path(&mut self, path: &str) -> Result<(), PathError> {
            if !self.paths.contains(&path.to_string()) {
                self.paths.push(path.to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn percent_encoding_matches_quote_plus() {
        assert_eq!(percent_encode("10.0.1.120"), "10.0.1.120");
        assert_eq!(percent_encode("dubbo://"), "dubbo%3A%2F%2F");
        assert_eq!(percent_encode("a=b&c=d"), "a%3Db%26c%3Dd");
    }

    #[test]
    fn registration_path_walk() {
        let mut registrar = Registrar::new("10.0.1.120", 12345, "unit-test");
        registrar.add_method("a.service", "doGet");
        let mut creator = RecordingCreator { paths: Vec::new() };
        registrar
            .register_at(&mut creator, "1.0.0", "1.0.0", None, 1234567890)
            .unwrap();
        assert_eq!(creator.paths[0], "/dubbo");
        assert_eq!(creator.paths[1], "/dubbo/a.service");
        assert_eq!(creator.paths[2], "/dubbo/a.service/providers");
        assert!(creator.paths[3].starts_with("/dubbo/a.service/providers/dubbo%3A%2F%2F"));
        assert!(creator.paths[3].contains("%26methods%3DdoGet%26"));
    }
}
