//! Scripted in-memory driver for pool and transaction tests.
//!
//! Statements are interpreted by prefix: `FAIL ...` returns a non-fatal
//! error, `FATAL ...` a fatal one, anything else returns a single row
//! `{"1": 1}`. Faults can be injected per connection, in connect order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::driver::{ConnectOptions, ConnectionFault, Driver, DriverConnection, DriverError};
use crate::types::{Rows, Value};

#[derive(Default)]
struct MockState {
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    statements: AtomicUsize,
    fault_streams_taken: AtomicUsize,
    fail_connects: AtomicBool,
    fail_begin: AtomicBool,
    delay: Mutex<Duration>,
    batches: Mutex<Vec<String>>,
    fault_senders: Mutex<Vec<UnboundedSender<ConnectionFault>>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Parameterized statements that reached a connection.
    pub(crate) fn statements(&self) -> usize {
        self.state.statements.load(Ordering::SeqCst)
    }

    pub(crate) fn fault_streams_taken(&self) -> usize {
        self.state.fault_streams_taken.load(Ordering::SeqCst)
    }

    pub(crate) fn batches(&self) -> Vec<String> {
        self.state.batches.lock().clone()
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_begin(&self, fail: bool) {
        self.state.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Delay every statement and batch, BEGIN/COMMIT/ROLLBACK included.
    pub(crate) fn delay_statements(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Push a fault to the `index`-th connection ever opened.
    pub(crate) fn fault(&self, index: usize, fault: ConnectionFault) {
        let senders = self.state.fault_senders.lock();
        if let Some(sender) = senders.get(index) {
            let _ = sender.send(fault);
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(
        &self,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err(DriverError::new("ECONNREFUSED", "connection refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.fault_senders.lock().push(tx);

        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            faults: Some(rx),
            closed: false,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    faults: Option<UnboundedReceiver<ConnectionFault>>,
    closed: bool,
}

impl MockConnection {
    async fn run(&mut self, sql: &str) -> Result<Rows, DriverError> {
        if self.closed {
            return Err(DriverError::fatal("CONNECTION_CLOSED", "connection closed"));
        }
        self.state.statements.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if sql.starts_with("FATAL") {
            self.closed = true;
            return Err(DriverError::fatal("PROTOCOL_CONNECTION_LOST", "connection lost"));
        }
        if sql.starts_with("FAIL") {
            return Err(DriverError::new("ER_PARSE_ERROR", "syntax error"));
        }
        Ok(Rows::from_values(
            vec!["1".to_string()],
            vec![vec![Value::Integer(1)]],
        ))
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Rows, DriverError> {
        self.run(sql).await
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64, DriverError> {
        self.run(sql).await.map(|_| 1)
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::fatal("CONNECTION_CLOSED", "connection closed"));
        }
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if sql == "BEGIN" && self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DriverError::new("ER_LOCK_WAIT_TIMEOUT", "lock wait timeout"));
        }
        self.state.batches.lock().push(sql.to_string());
        Ok(())
    }

    fn take_fault_events(&mut self) -> Option<UnboundedReceiver<ConnectionFault>> {
        let events = self.faults.take();
        if events.is_some() {
            self.state.fault_streams_taken.fetch_add(1, Ordering::SeqCst);
        }
        events
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        Ok(())
    }
}
