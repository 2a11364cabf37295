//! Shared test doubles: a scriptable in-memory transport and event
//! recording helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use stream_runtime::{Connector, Dialed, TransportError, TransportEvent, TransportSink};

/// Control handle for one scripted transport link.
pub struct LinkControl {
    pub events: mpsc::Sender<TransportEvent>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl LinkControl {
    /// Push an inbound message through this link.
    pub async fn push_message(&self, data: &str) {
        self.events
            .send(TransportEvent::Message(data.to_owned()))
            .await
            .expect("link event channel open");
    }

    /// Drop the link abruptly (unclean close).
    pub async fn drop_abruptly(&self, details: &str) {
        self.events
            .send(TransportEvent::Closed {
                clean: false,
                details: details.to_owned(),
            })
            .await
            .expect("link event channel open");
    }
}

struct ScriptedSink {
    events: mpsc::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSink for ScriptedSink {
    async fn send(&mut self, data: String) -> Result<(), TransportError> {
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Closed {
                clean: true,
                details: "closed by peer".to_owned(),
            })
            .await;
        Ok(())
    }
}

/// In-memory [`Connector`]: every dial produces a controllable link.
#[derive(Default)]
pub struct ScriptedConnector {
    pub dials: AtomicUsize,
    /// Dial numbers (0-based) that are refused.
    pub fail_dials: Vec<usize>,
    /// Artificial dial latency.
    pub dial_delay: Option<Duration>,
    /// Every link produced so far, in dial order.
    pub links: Mutex<Vec<Arc<LinkControl>>>,
}

impl ScriptedConnector {
    pub fn link(&self, index: usize) -> Arc<LinkControl> {
        Arc::clone(&self.links.lock()[index])
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Dialed, TransportError> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_dials.contains(&dial) {
            return Err(TransportError::Dial(format!("dial {dial} refused")));
        }

        let (tx, rx) = mpsc::channel(64);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.links.lock().push(Arc::new(LinkControl {
            events: tx.clone(),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        }));

        Ok(Dialed {
            sink: Box::new(ScriptedSink {
                events: tx,
                sent,
                closed,
            }),
            events: rx,
        })
    }
}

/// Install a test-writer tracing subscriber; later calls are no-ops, so
/// every test can call this first.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, failing after ~2 seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
