//! Push delivery to a handler on a dedicated thread.
//!
//! The handler runs on the consumer's own thread after the queue lock has
//! been released, so it may call back into the broker freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::broker::{Broker, Delivery};
use crate::queue::ConsumerId;
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to do with a delivery once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Return the message to the head of its queue.
    Cancel,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, delivery: &Delivery) -> AckDecision;
}

impl<F> MessageHandler for F
where
    F: Fn(&Delivery) -> AckDecision + Send + Sync + 'static,
{
    fn on_message(&self, delivery: &Delivery) -> AckDecision {
        self(delivery)
    }
}

/// Running dispatch thread. Stops on drop.
pub struct DispatchHandle {
    consumer: ConsumerId,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    pub(crate) fn spawn(
        broker: Arc<Broker>,
        consumer: ConsumerId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("spillway-dispatch-{consumer}"))
            .spawn(move || run(&broker, consumer, handler.as_ref(), &thread_stop))?;
        Ok(Self {
            consumer,
            stop,
            thread: Some(thread),
        })
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Stop dispatching and wait for the thread. A delivery being handled
    /// finishes first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("dispatch thread of consumer {} panicked", self.consumer);
            }
        }
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(broker: &Broker, consumer: ConsumerId, handler: &dyn MessageHandler, stop: &AtomicBool) {
    debug!("dispatch started for consumer {}", consumer);
    while !stop.load(Ordering::Acquire) {
        let delivery = match broker.deliver(consumer, POLL_INTERVAL) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(Error::UnknownConsumer(_)) => break,
            Err(err) => {
                warn!("dispatch for consumer {} stopped: {}", consumer, err);
                break;
            }
        };
        let outcome = match handler.on_message(&delivery) {
            AckDecision::Ack => broker.acknowledge(consumer, delivery.tag, None),
            AckDecision::Cancel => broker.cancel(consumer, delivery.tag),
        };
        if let Err(err) = outcome {
            warn!(
                "consumer {} failed to settle delivery {}: {}",
                consumer, delivery.tag, err
            );
        }
    }
    debug!("dispatch stopped for consumer {}", consumer);
}
