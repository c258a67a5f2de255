//! Message handle and per-message broker I/O.
//!
//! The broker client's control operations are not safe to call from
//! arbitrary tasks, so each delivered message is adopted by a driver task
//! that exclusively owns the underlying broker message. Handler code holds a
//! cheap [`Delivery`] handle and posts `touch` / `finish` / `requeue` to the
//! driver over a channel.
//!
//! The driver also owns the liveness heartbeat: a 30 second ticker that
//! touches the message until its terminal transition. Exactly one terminal
//! transition happens per message, enforced by the has-responded flag.

use async_trait::async_trait;
use std::str::Utf8Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_nsq::{NSQMessage, NSQRequeueDelay};
use tracing::debug;

/// Heartbeat period for in-flight messages.
pub const TOUCH_INTERVAL: Duration = Duration::from_secs(30);

/// Control operations posted from handles to the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Touch,
    Finish,
    Requeue(Option<Duration>),
}

/// Control surface of a broker message, seam for the driver task.
#[async_trait]
pub(crate) trait BrokerMessage: Send + 'static {
    async fn touch(&mut self);
    async fn finish(self);
    async fn requeue(self, delay: Option<Duration>);
}

#[async_trait]
impl BrokerMessage for NSQMessage {
    async fn touch(&mut self) {
        NSQMessage::touch(self).await;
    }

    async fn finish(self) {
        NSQMessage::finish(self).await;
    }

    async fn requeue(self, delay: Option<Duration>) {
        let delay = match delay {
            Some(d) => NSQRequeueDelay::CustomDelay(d),
            None => NSQRequeueDelay::DefaultDelay,
        };
        NSQMessage::requeue(self, delay).await;
    }
}

/// Drive one message until its terminal transition, touching it every
/// [`TOUCH_INTERVAL`] in between. A closed control channel without a
/// terminal op finishes the message.
pub(crate) async fn drive<M: BrokerMessage>(
    mut message: M,
    mut control: mpsc::UnboundedReceiver<ControlOp>,
) {
    let mut heartbeat = tokio::time::interval(TOUCH_INTERVAL);
    // The first tick completes immediately
    heartbeat.tick().await;

    let verdict = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                debug!("sending touch event");
                message.touch().await;
            }
            op = control.recv() => match op {
                Some(ControlOp::Touch) => message.touch().await,
                Some(op) => break op,
                None => break ControlOp::Finish,
            },
        }
    };

    match verdict {
        ControlOp::Requeue(delay) => message.requeue(delay).await,
        _ => message.finish().await,
    }
}

struct DeliveryInner {
    id: String,
    attempt: u16,
    body: Vec<u8>,
    responded: AtomicBool,
    control: mpsc::UnboundedSender<ControlOp>,
}

/// Cheaply-clonable handle over one delivered message.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<DeliveryInner>,
}

impl Delivery {
    /// Adopt a broker message, spawning its driver task.
    pub fn adopt(mut message: NSQMessage) -> Self {
        let id = String::from_utf8_lossy(&message.id).into_owned();
        let attempt = message.attempt;
        let body = std::mem::take(&mut message.body);

        let (control, commands) = mpsc::unbounded_channel();
        tokio::spawn(drive(message, commands));

        Self {
            inner: Arc::new(DeliveryInner {
                id,
                attempt,
                body,
                responded: AtomicBool::new(false),
                control,
            }),
        }
    }

    /// A delivery with no broker behind it, handing the control stream back
    /// to the caller. Used by tests and local tooling to drive handlers
    /// without a broker.
    pub fn local(
        id: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlOp>) {
        let (control, commands) = mpsc::unbounded_channel();
        let delivery = Self {
            inner: Arc::new(DeliveryInner {
                id: id.into(),
                attempt: 1,
                body: body.into(),
                responded: AtomicBool::new(false),
                control,
            }),
        };
        (delivery, commands)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Delivery attempt counter, starting at 1.
    pub fn attempt(&self) -> u16 {
        self.inner.attempt
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.inner.body)
    }

    /// Whether a terminal transition has already been requested.
    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }

    /// Extend the message's visibility lease. A no-op once the message has
    /// completed.
    pub fn touch(&self) {
        if self.has_responded() {
            return;
        }
        let _ = self.inner.control.send(ControlOp::Touch);
    }

    /// Acknowledge terminal handling. Returns true when this call performed
    /// the terminal transition.
    pub fn finish(&self) -> bool {
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.control.send(ControlOp::Finish);
        true
    }

    /// Return the message for later redelivery. Returns true when this call
    /// performed the terminal transition.
    pub fn requeue(&self, delay: Option<Duration>) -> bool {
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.control.send(ControlOp::Requeue(delay));
        true
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.inner.id)
            .field("attempt", &self.inner.attempt)
            .field("responded", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeRaw {
        touches: Arc<AtomicUsize>,
        terminal: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl BrokerMessage for FakeRaw {
        async fn touch(&mut self) {
            self.touches.fetch_add(1, Ordering::SeqCst);
        }

        async fn finish(self) {
            *self.terminal.lock().unwrap() = Some("finish".to_string());
        }

        async fn requeue(self, delay: Option<Duration>) {
            *self.terminal.lock().unwrap() = Some(format!("requeue:{delay:?}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_heartbeats_every_thirty_seconds() {
        let touches = Arc::new(AtomicUsize::new(0));
        let terminal = Arc::new(Mutex::new(None));
        let raw = FakeRaw {
            touches: Arc::clone(&touches),
            terminal: Arc::clone(&terminal),
        };

        let (control, commands) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(raw, commands));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(touches.load(Ordering::SeqCst) >= 3);

        control.send(ControlOp::Finish).unwrap();
        driver.await.unwrap();
        assert_eq!(terminal.lock().unwrap().as_deref(), Some("finish"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_requeues_with_delay() {
        let raw = FakeRaw {
            touches: Arc::new(AtomicUsize::new(0)),
            terminal: Arc::new(Mutex::new(None)),
        };
        let terminal = Arc::clone(&raw.terminal);

        let (control, commands) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(raw, commands));

        control
            .send(ControlOp::Requeue(Some(Duration::from_secs(5))))
            .unwrap();
        driver.await.unwrap();
        assert_eq!(
            terminal.lock().unwrap().as_deref(),
            Some("requeue:Some(5s)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_finishes_when_handles_drop() {
        let raw = FakeRaw {
            touches: Arc::new(AtomicUsize::new(0)),
            terminal: Arc::new(Mutex::new(None)),
        };
        let terminal = Arc::clone(&raw.terminal);

        let (control, commands) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(raw, commands));

        drop(control);
        driver.await.unwrap();
        assert_eq!(terminal.lock().unwrap().as_deref(), Some("finish"));
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let (delivery, mut ops) = Delivery::local("m-1", "body");

        assert!(!delivery.has_responded());
        assert!(delivery.finish());
        assert!(delivery.has_responded());
        assert!(!delivery.finish());
        assert!(!delivery.requeue(None));

        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert!(ops.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requeue_carries_delay() {
        let (delivery, mut ops) = Delivery::local("m-2", "body");

        assert!(delivery.requeue(Some(Duration::from_millis(2000))));
        assert_eq!(
            ops.recv().await,
            Some(ControlOp::Requeue(Some(Duration::from_millis(2000))))
        );
    }

    #[tokio::test]
    async fn test_touch_after_finish_is_dropped() {
        let (delivery, mut ops) = Delivery::local("m-3", "body");

        delivery.touch();
        delivery.finish();
        delivery.touch();

        assert_eq!(ops.recv().await, Some(ControlOp::Touch));
        assert_eq!(ops.recv().await, Some(ControlOp::Finish));
        assert!(ops.try_recv().is_err());
    }

    #[test]
    fn test_body_accessors() {
        let (delivery, _ops) = Delivery::local("m-4", r#"{"name":"ping"}"#);
        assert_eq!(delivery.id(), "m-4");
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(delivery.body_str().unwrap(), r#"{"name":"ping"}"#);
    }
}
