//! Mock connections shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether::{Connection, Handle, HandleError};

/// How a mock handle behaves when closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    Ok,
    Fail,
    Hang,
}

/// Observations recorded by a mock connection and its channels.
#[derive(Debug, Default)]
pub struct Probe {
    pub closes: AtomicUsize,
    pub channel_opens: AtomicUsize,
    pub channel_closes: AtomicUsize,
    pub order: Mutex<Vec<&'static str>>,
}

impl Probe {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn channel_opens(&self) -> usize {
        self.channel_opens.load(Ordering::SeqCst)
    }

    pub fn channel_closes(&self) -> usize {
        self.channel_closes.load(Ordering::SeqCst)
    }
}

/// Stand-in for an authenticated remote-control connection.
pub struct MockConn {
    probe: Arc<Probe>,
    behavior: CloseBehavior,
    pub commands: Vec<String>,
}

impl MockConn {
    pub fn new() -> (Self, Arc<Probe>) {
        Self::with_behavior(CloseBehavior::Ok)
    }

    pub fn with_behavior(behavior: CloseBehavior) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let conn = Self {
            probe: Arc::clone(&probe),
            behavior,
            commands: Vec::new(),
        };
        (conn, probe)
    }

    pub fn run(&mut self, command: &str) -> String {
        self.commands.push(command.to_string());
        format!("ran {command}")
    }
}

#[async_trait]
impl Handle for MockConn {
    async fn close(&mut self) -> Result<(), HandleError> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.probe.order.lock().push("conn");
        match self.behavior {
            CloseBehavior::Ok => Ok(()),
            CloseBehavior::Fail => Err(HandleError::Remote("connection reset".into())),
            CloseBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn kind(&self) -> &'static str {
        "mock connection"
    }
}

#[async_trait]
impl Connection for MockConn {
    type Channel = MockChannel;

    async fn open_channel(&mut self) -> Result<MockChannel, HandleError> {
        self.probe.channel_opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            probe: Arc::clone(&self.probe),
            uploads: Vec::new(),
        })
    }
}

/// Stand-in for a file-transfer sub-channel.
pub struct MockChannel {
    probe: Arc<Probe>,
    pub uploads: Vec<String>,
}

impl MockChannel {
    pub fn upload(&mut self, path: &str) {
        self.uploads.push(path.to_string());
    }
}

#[async_trait]
impl Handle for MockChannel {
    async fn close(&mut self) -> Result<(), HandleError> {
        self.probe.channel_closes.fetch_add(1, Ordering::SeqCst);
        self.probe.order.lock().push("channel");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "mock channel"
    }
}

/// Installs a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
