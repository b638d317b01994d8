//! Scripted in-memory workers
//!
//! A [`FakeConnector`] hands out [`FakeSession`]s backed by one shared
//! [`FakeHost`] per worker. The host keeps a tiny remote filesystem and
//! understands exactly the commands the coordinator sends:
//!
//! - `echo ready` (health probe)
//! - the `.version` read command
//! - `rm -f <paths>`
//! - `cd <dir> && <translate argv>`; the translation is the input reversed
//!
//! Failures, delays and open errors are injectable per host, and every
//! host counts concurrent translations.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use bt_core::config::WorkerDescriptor;
use bt_core::{
    CommandOutput, RemoteSession, SessionConnector, SessionError, SessionMeta, SessionState, WorkerId,
};
use bt_protocol::{shell_split, TranslateCommand, NONE_SENTINEL};

/// Default translation: the input with its characters reversed
pub fn reverse(text: &str) -> String {
    text.chars().rev().collect()
}

/// Tracks a current and a high-water count
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current value
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest value observed
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

struct GaugeGuard<'a>(&'a [&'a Gauge]);

impl<'a> GaugeGuard<'a> {
    fn enter(gauges: &'a [&'a Gauge]) -> Self {
        for gauge in gauges {
            gauge.enter();
        }
        Self(gauges)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        for gauge in self.0 {
            gauge.exit();
        }
    }
}

/// One simulated worker host
pub struct FakeHost {
    id: WorkerId,
    files: Mutex<BTreeMap<String, (Bytes, u32)>>,
    log: Mutex<Vec<String>>,
    translator: Mutex<fn(&str) -> String>,
    translate_exit: AtomicU32,
    translate_delay: Mutex<Duration>,
    probe_fails: AtomicBool,
    upload_fails: AtomicBool,
    ignore_cancel: AtomicBool,
    channel_failures: AtomicUsize,
    open_error: Mutex<Option<SessionError>>,
    translations: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    in_flight: Gauge,
    cluster: Arc<Gauge>,
}

impl FakeHost {
    fn new(id: WorkerId, cluster: Arc<Gauge>) -> Self {
        Self {
            id,
            files: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            translator: Mutex::new(reverse),
            translate_exit: AtomicU32::new(0),
            translate_delay: Mutex::new(Duration::ZERO),
            probe_fails: AtomicBool::new(false),
            upload_fails: AtomicBool::new(false),
            ignore_cancel: AtomicBool::new(false),
            channel_failures: AtomicUsize::new(0),
            open_error: Mutex::new(None),
            translations: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: Gauge::default(),
            cluster,
        }
    }

    /// Worker identifier
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Make every translation exit with `code` (0 restores success)
    pub fn set_translate_exit(&self, code: u32) {
        self.translate_exit.store(code, Ordering::SeqCst);
    }

    /// Make every translation take at least `delay`
    pub fn set_translate_delay(&self, delay: Duration) {
        *self.translate_delay.lock().unwrap() = delay;
    }

    /// Replace the translation function
    pub fn set_translator(&self, translator: fn(&str) -> String) {
        *self.translator.lock().unwrap() = translator;
    }

    /// Make `echo ready` exit non-zero
    pub fn set_probe_fails(&self, fails: bool) {
        self.probe_fails.store(fails, Ordering::SeqCst);
    }

    /// Make every upload fail with a transfer error
    pub fn set_upload_fails(&self, fails: bool) {
        self.upload_fails.store(fails, Ordering::SeqCst);
    }

    /// Keep running translations after cancellation (a stuck remote process)
    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.ignore_cancel.store(ignore, Ordering::SeqCst);
    }

    /// Fail the next `count` commands at channel level
    pub fn fail_next_commands(&self, count: usize) {
        self.channel_failures.store(count, Ordering::SeqCst);
    }

    /// Make every open fail with `error` (`None` restores success)
    pub fn set_open_error(&self, error: Option<SessionError>) {
        *self.open_error.lock().unwrap() = error;
    }

    /// Write a remote file directly
    pub fn put_file(&self, path: &str, contents: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (contents.into(), 0o644));
    }

    /// Read a remote file
    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).map(|(data, _)| data.clone())
    }

    /// Mode of a remote file
    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.files.lock().unwrap().get(path).map(|(_, mode)| *mode)
    }

    /// Every remote file path
    pub fn file_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Every command and upload seen, in order
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Completed or failed translation invocations
    pub fn translations(&self) -> usize {
        self.translations.load(Ordering::SeqCst)
    }

    /// Sessions opened against this host
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sessions closed against this host
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Concurrent translations on this host
    pub fn in_flight(&self) -> &Gauge {
        &self.in_flight
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn take_channel_failure(&self) -> bool {
        self.channel_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read_version(&self, command: &str) -> Option<CommandOutput> {
        let rest = command.strip_prefix("cat ")?;
        let (quoted, _) = rest.split_once(" 2>/dev/null")?;
        let path = shell_split(quoted)?.pop()?;
        let stdout = match self.file(&path) {
            Some(data) if !data.is_empty() => data,
            _ => Bytes::from_static(NONE_SENTINEL.as_bytes()),
        };
        Some(ok(stdout))
    }

    fn remove(&self, command: &str) -> Option<CommandOutput> {
        let rest = command.strip_prefix("rm -f ")?;
        let mut files = self.files.lock().unwrap();
        for path in shell_split(rest)? {
            files.remove(&path);
        }
        Some(ok(Bytes::new()))
    }

    async fn translate(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Result<CommandOutput, SessionError>> {
        let words = shell_split(command)?;
        if words.len() < 4 || words[0] != "cd" || words[2] != "&&" {
            return None;
        }
        let translate = TranslateCommand::from_argv(&words[3..])?;

        let gauges = [&self.in_flight, self.cluster.as_ref()];
        let _gauge = GaugeGuard::enter(&gauges);
        self.translations.fetch_add(1, Ordering::SeqCst);

        let delay = *self.translate_delay.lock().unwrap();
        if !delay.is_zero() {
            let ignore_cancel = self.ignore_cancel.load(Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled(), if !ignore_cancel => {
                    return Some(Err(SessionError::Cancelled));
                }
                _ = tokio::time::sleep(timeout) => {
                    return Some(Err(SessionError::Timeout(format!("command exceeded {:?}", timeout))));
                }
            }
        }

        let code = self.translate_exit.load(Ordering::SeqCst);
        if code != 0 {
            return Some(Ok(CommandOutput {
                exit_code: code,
                stdout: Bytes::new(),
                stderr: Bytes::from(format!("translate: model crashed (exit {})", code)),
            }));
        }

        let Some(input) = self.file(&translate.input) else {
            return Some(Ok(CommandOutput {
                exit_code: 2,
                stdout: Bytes::new(),
                stderr: Bytes::from(format!("translate: {}: No such file", translate.input)),
            }));
        };
        let source = String::from_utf8_lossy(&input).into_owned();
        let translator = *self.translator.lock().unwrap();
        let translated = translator(&source);
        // model wrappers tend to append a newline
        self.put_file(&translate.output, format!("{}\n", translated));
        Some(Ok(ok(Bytes::from_static(b"done\n"))))
    }
}

fn ok(stdout: Bytes) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout,
        stderr: Bytes::new(),
    }
}

/// Connector producing [`FakeSession`]s
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<WorkerId, Arc<FakeHost>>>,
    cluster: Arc<Gauge>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Host handle for a worker, created on first use
    pub fn host(&self, id: &WorkerId) -> Arc<FakeHost> {
        let mut hosts = self.hosts.lock().unwrap();
        Arc::clone(
            hosts
                .entry(id.clone())
                .or_insert_with(|| Arc::new(FakeHost::new(id.clone(), Arc::clone(&self.cluster)))),
        )
    }

    /// Host handle for a worker descriptor
    pub fn host_for(&self, descriptor: &WorkerDescriptor) -> Arc<FakeHost> {
        self.host(&descriptor.worker_id())
    }

    /// Concurrent translations across every host
    pub fn cluster_in_flight(&self) -> &Gauge {
        &self.cluster
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(
        &self,
        descriptor: &WorkerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        if !descriptor.port_is_valid() {
            return Err(SessionError::InvalidPort(descriptor.port));
        }
        if descriptor.credentials().is_empty() {
            return Err(SessionError::AuthConfig(
                "a password or a private key is required".to_string(),
            ));
        }

        let host = self.host_for(descriptor);
        if let Some(error) = host.open_error.lock().unwrap().clone() {
            return Err(error);
        }
        host.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            meta: SessionMeta::new(descriptor.worker_id(), timeout),
            host,
        }))
    }
}

/// Session against a [`FakeHost`]
pub struct FakeSession {
    meta: SessionMeta,
    host: Arc<FakeHost>,
}

impl FakeSession {
    fn fail<T>(&mut self, error: SessionError) -> Result<T, SessionError> {
        self.meta.mark_broken();
        Err(error)
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SessionMeta {
        &mut self.meta
    }

    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        self.meta.ensure_usable()?;
        self.host.record(command.to_string());

        if self.host.take_channel_failure() {
            return self.fail(SessionError::Execution("connection reset by peer".to_string()));
        }

        if command == "echo ready" {
            if self.host.probe_fails.load(Ordering::SeqCst) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: Bytes::new(),
                    stderr: Bytes::from_static(b"probe failed"),
                });
            }
            return Ok(ok(Bytes::from_static(b"ready\n")));
        }
        if let Some(output) = self.host.read_version(command) {
            return Ok(output);
        }
        if let Some(output) = self.host.remove(command) {
            return Ok(output);
        }

        let host = Arc::clone(&self.host);
        match host.translate(command, timeout, cancel).await {
            Some(Ok(output)) => Ok(output),
            Some(Err(error)) => self.fail(error),
            None => Ok(CommandOutput {
                exit_code: 127,
                stdout: Bytes::new(),
                stderr: Bytes::from(format!("sh: command not found: {}", command)),
            }),
        }
    }

    async fn upload(&mut self, data: Bytes, remote_path: &str, mode: u32) -> Result<(), SessionError> {
        self.meta.ensure_usable()?;
        self.host.record(format!("upload {}", remote_path));
        if self.host.upload_fails.load(Ordering::SeqCst) {
            return self.fail(SessionError::Transfer(format!("write to {} failed", remote_path)));
        }
        self.host
            .files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), (data, mode));
        Ok(())
    }

    async fn download(&mut self, remote_path: &str) -> Result<Bytes, SessionError> {
        self.meta.ensure_usable()?;
        self.host.record(format!("download {}", remote_path));
        match self.host.file(remote_path) {
            Some(data) => Ok(data),
            None => self.fail(SessionError::NotFound(remote_path.to_string())),
        }
    }

    async fn close(&mut self) {
        if self.meta.state != SessionState::Closed {
            self.meta.state = SessionState::Closed;
            self.host.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
