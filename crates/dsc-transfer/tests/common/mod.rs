#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsc_common::types::TransferId;
use dsc_transfer::config::RetryConfig;
use dsc_transfer::sink::SinkCapabilities;
use dsc_transfer::{
    AdapterFactory, ChannelObserver, Chunk, CommitReceipt, Credentials, EndpointReference,
    HttpSinkMode, RecoveryManager, SessionControl, SinkHandle, SinkSpec, SourceHandle, SourceSpec,
    TransferConfig, TransferDescriptor, TransferError, TransferEvent, TransferStore, WriteResult,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

pub const KB: usize = 1024;

pub fn config(chunk_size: usize) -> TransferConfig {
    TransferConfig {
        chunk_size_bytes: chunk_size,
        retry: RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2,
        },
        call_timeout_secs: 5,
        ..TransferConfig::default()
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn manager(
    store: Arc<dyn TransferStore>,
) -> (Arc<RecoveryManager>, UnboundedReceiver<TransferEvent>) {
    let (observer, rx) = ChannelObserver::new();
    (Arc::new(RecoveryManager::new(store, Arc::new(observer))), rx)
}

pub fn drain(rx: &mut UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn endpoint(expires_at: Option<DateTime<Utc>>) -> EndpointReference {
    EndpointReference {
        endpoint: "http://origin.example/exports".into(),
        credentials: Credentials::Bearer {
            token: "edr-token".into(),
        },
        expires_at,
    }
}

pub fn descriptor(id: &str, source: SourceSpec, sink: SinkSpec) -> TransferDescriptor {
    TransferDescriptor::new(TransferId::new(id), source, sink, endpoint(None))
}

/// Descriptor for [`FakeAdapters`], which ignore the specs.
pub fn fake_descriptor(id: &str) -> TransferDescriptor {
    descriptor(
        id,
        SourceSpec::LocalFile {
            path: PathBuf::from("/exports/readings.csv"),
        },
        SinkSpec::Http {
            url: "http://lake.example/ingest".into(),
            mode: HttpSinkMode::Ranged,
            auth_key: None,
            part_name: None,
            resume_granularity: None,
        },
    )
}

/// Failures and quirks the fake adapters inject.
#[derive(Default)]
pub struct Script {
    /// Transient read failures left per offset
    pub read_failures: HashMap<u64, u32>,
    /// Transient write failures left per offset
    pub write_failures: HashMap<u64, u32>,
    /// Accept one byte less than offered at this offset
    pub partial_write_at: Option<u64>,
    /// Always serve the payload from offset 0
    pub ignore_offset: bool,
    pub commit_error: Option<String>,
    /// Delay before every write
    pub write_delay_ms: u64,
    pub capabilities: SinkCapabilities,
    /// Pause the session after this many successful writes
    pub pause_after_writes: Option<(usize, SessionControl)>,
}

/// Everything the fake adapters observed.
#[derive(Debug, Default)]
pub struct Observed {
    pub source_opens: u32,
    pub reads: Vec<u64>,
    pub sink_opens: Vec<u64>,
    pub write_attempts: Vec<u64>,
    pub writes: Vec<u64>,
    pub received: Vec<u8>,
    pub commits: Vec<u64>,
    pub closed_sources: u32,
    pub closed_sinks: u32,
}

#[derive(Clone)]
pub struct FakeAdapters {
    data: Arc<Vec<u8>>,
    pub script: Arc<Mutex<Script>>,
    pub observed: Arc<Mutex<Observed>>,
}

impl FakeAdapters {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            script: Arc::new(Mutex::new(Script {
                capabilities: SinkCapabilities {
                    idempotent_writes: true,
                    resume_granularity: None,
                },
                ..Script::default()
            })),
            observed: Arc::new(Mutex::new(Observed::default())),
        }
    }

    pub fn script<F: FnOnce(&mut Script)>(&self, f: F) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn observed(&self) -> std::sync::MutexGuard<'_, Observed> {
        self.observed.lock().unwrap()
    }
}

#[async_trait]
impl AdapterFactory for FakeAdapters {
    async fn open_source(
        &self,
        _spec: &SourceSpec,
        _endpoint: &EndpointReference,
    ) -> dsc_transfer::Result<Box<dyn SourceHandle>> {
        self.observed().source_opens += 1;
        Ok(Box::new(FakeSource {
            data: self.data.clone(),
            script: self.script.clone(),
            observed: self.observed.clone(),
        }))
    }

    async fn open_sink(
        &self,
        _spec: &SinkSpec,
        start_offset: u64,
    ) -> dsc_transfer::Result<Box<dyn SinkHandle>> {
        self.observed().sink_opens.push(start_offset);
        Ok(Box::new(FakeSink {
            script: self.script.clone(),
            observed: self.observed.clone(),
        }))
    }

    fn sink_capabilities(&self, _spec: &SinkSpec) -> SinkCapabilities {
        self.script.lock().unwrap().capabilities
    }
}

struct FakeSource {
    data: Arc<Vec<u8>>,
    script: Arc<Mutex<Script>>,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl SourceHandle for FakeSource {
    fn describe(&self) -> String {
        "fake source".into()
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn read_chunk(
        &mut self,
        offset: u64,
        max_len: usize,
    ) -> dsc_transfer::Result<Option<Chunk>> {
        self.observed.lock().unwrap().reads.push(offset);

        let serve_from = {
            let mut script = self.script.lock().unwrap();
            if let Some(left) = script.read_failures.get_mut(&offset) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransferError::SourceUnreachable("connection reset".into()));
                }
            }
            if script.ignore_offset {
                0
            } else {
                offset
            }
        };

        let start = serve_from as usize;
        if start >= self.data.len() {
            return Ok(None);
        }
        let end = (start + max_len).min(self.data.len());
        Ok(Some(Chunk::new(
            serve_from,
            self.data[start..end].to_vec(),
            Some("exports/readings.csv".into()),
        )))
    }

    async fn close(&mut self) -> dsc_transfer::Result<()> {
        self.observed.lock().unwrap().closed_sources += 1;
        Ok(())
    }
}

struct FakeSink {
    script: Arc<Mutex<Script>>,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl SinkHandle for FakeSink {
    fn describe(&self) -> String {
        "fake sink".into()
    }

    fn capabilities(&self) -> SinkCapabilities {
        self.script.lock().unwrap().capabilities
    }

    async fn write(&mut self, chunk: &Chunk) -> dsc_transfer::Result<WriteResult> {
        self.observed.lock().unwrap().write_attempts.push(chunk.offset);

        let delay = self.script.lock().unwrap().write_delay_ms;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(left) = script.write_failures.get_mut(&chunk.offset) {
            if *left > 0 {
                *left -= 1;
                return Err(TransferError::SinkUnreachable("503 from ingest".into()));
            }
        }
        if script.partial_write_at == Some(chunk.offset) {
            return Ok(WriteResult::accepted(chunk.len() - 1));
        }

        let writes = {
            let mut observed = self.observed.lock().unwrap();
            observed.writes.push(chunk.offset);
            observed.received.extend_from_slice(&chunk.data);
            observed.writes.len()
        };
        if let Some((after, control)) = &script.pause_after_writes {
            if writes == *after {
                control.pause();
            }
        }

        Ok(WriteResult::accepted(chunk.len()))
    }

    async fn commit(&mut self, total_bytes: u64) -> dsc_transfer::Result<CommitReceipt> {
        self.observed.lock().unwrap().commits.push(total_bytes);
        match &self.script.lock().unwrap().commit_error {
            Some(msg) => Err(TransferError::SinkValidationFailed(msg.clone())),
            None => Ok(CommitReceipt {
                total_bytes,
                reference: None,
            }),
        }
    }

    async fn close(&mut self) -> dsc_transfer::Result<()> {
        self.observed.lock().unwrap().closed_sinks += 1;
        Ok(())
    }
}

/// Wraps real adapters and pauses the session after a number of sink
/// writes.
pub struct PausingAdapters<A> {
    pub inner: A,
    pub after_writes: usize,
    pub control: SessionControl,
}

#[async_trait]
impl<A: AdapterFactory> AdapterFactory for PausingAdapters<A> {
    async fn open_source(
        &self,
        spec: &SourceSpec,
        endpoint: &EndpointReference,
    ) -> dsc_transfer::Result<Box<dyn SourceHandle>> {
        self.inner.open_source(spec, endpoint).await
    }

    async fn open_sink(
        &self,
        spec: &SinkSpec,
        start_offset: u64,
    ) -> dsc_transfer::Result<Box<dyn SinkHandle>> {
        let inner = self.inner.open_sink(spec, start_offset).await?;
        Ok(Box::new(PausingSink {
            inner,
            writes: 0,
            after_writes: self.after_writes,
            control: self.control.clone(),
        }))
    }

    fn sink_capabilities(&self, spec: &SinkSpec) -> SinkCapabilities {
        self.inner.sink_capabilities(spec)
    }
}

struct PausingSink {
    inner: Box<dyn SinkHandle>,
    writes: usize,
    after_writes: usize,
    control: SessionControl,
}

#[async_trait]
impl SinkHandle for PausingSink {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn capabilities(&self) -> SinkCapabilities {
        self.inner.capabilities()
    }

    async fn write(&mut self, chunk: &Chunk) -> dsc_transfer::Result<WriteResult> {
        let written = self.inner.write(chunk).await?;
        self.writes += 1;
        if self.writes == self.after_writes {
            self.control.pause();
        }
        Ok(written)
    }

    async fn commit(&mut self, total_bytes: u64) -> dsc_transfer::Result<CommitReceipt> {
        self.inner.commit(total_bytes).await
    }

    async fn close(&mut self) -> dsc_transfer::Result<()> {
        self.inner.close().await
    }
}
