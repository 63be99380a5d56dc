//! Publisher/subscriber content routing.
//!
//! A [`Publisher`] owns an ordered subscriber list and a transform applied to
//! every published value. Publishers are subscribers too, so routing graphs
//! are built by chaining filters from filters. Delivery is fail-open: a
//! subscriber error is logged and the subscriber stays subscribed.
//!
//! Subscriber lists are locked only to snapshot or prune them, never while a
//! subscriber runs, so publishing or subscribing from inside a callback is
//! allowed.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::Stream;
use kmux_protocol::{ClientError, ClientResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Result of delivering content to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Keep,
    Unsubscribe,
}

/// The sentinel a subscriber returns to cancel itself.
pub fn unsubscribe() -> Delivery {
    Delivery::Unsubscribe
}

pub trait Subscriber<T>: Send + Sync {
    fn deliver(&self, content: &T) -> Result<Delivery>;

    /// Subscribes `subscriber` to this node. Only publishers route content,
    /// so the default rejects it.
    fn subscribe(&self, _subscriber: Arc<dyn Subscriber<T>>) -> ClientResult<()> {
        Err(ClientError::SubscriptionMisuse)
    }

    /// Address identifying this subscriber for deduplication and removal.
    fn identity(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

struct FnSubscriber<F>(F);

impl<T, F> Subscriber<T> for FnSubscriber<F>
where
    F: Fn(&T) -> Result<Delivery> + Send + Sync,
{
    fn deliver(&self, content: &T) -> Result<Delivery> {
        (self.0)(content)
    }
}

/// Wraps `f` as a leaf subscriber.
pub fn subscriber<T, F>(f: F) -> Arc<dyn Subscriber<T>>
where
    T: 'static,
    F: Fn(&T) -> Result<Delivery> + Send + Sync + 'static,
{
    Arc::new(FnSubscriber(f))
}

/// Outcome of a publisher's transform for one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed<T> {
    /// Deliver nothing.
    Skip,
    Emit(T),
    /// Deliver, then cancel this publisher's upstream subscription.
    EmitAndUnsubscribe(T),
    Unsubscribe,
}

type Transform<T> = dyn Fn(T) -> Transformed<T> + Send + Sync;

struct PublisherInner<T> {
    subscribers: Mutex<Vec<Arc<dyn Subscriber<T>>>>,
    transform: Box<Transform<T>>,
}

pub struct Publisher<T> {
    inner: Arc<PublisherInner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl<T> Publisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(T) -> Transformed<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PublisherInner {
                subscribers: Mutex::new(Vec::new()),
                transform: Box::new(transform),
            }),
        }
    }

    /// A publisher that forwards every value unchanged.
    pub fn passthrough() -> Self {
        Self::new(Transformed::Emit)
    }

    /// Appends `subscriber` unless it is already subscribed.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let mut subscribers = self.inner.subscribers.lock();
        let id = subscriber.identity();
        if subscribers.iter().any(|existing| existing.identity() == id) {
            return;
        }
        subscribers.push(subscriber);
    }

    /// Subscribes another publisher, forming a chained route.
    pub fn subscribe_publisher(&self, downstream: &Publisher<T>) {
        self.subscribe(Arc::new(downstream.clone()));
    }

    /// Transforms `value` and delivers the result to a snapshot of the
    /// current subscribers, in subscription order.
    ///
    /// Returns [`Delivery::Unsubscribe`] when the transform asked to cancel
    /// this publisher's own upstream subscription.
    pub fn publish(&self, value: T) -> Delivery {
        match (self.inner.transform)(value) {
            Transformed::Skip => Delivery::Keep,
            Transformed::Emit(content) => {
                self.fan_out(&content);
                Delivery::Keep
            }
            Transformed::EmitAndUnsubscribe(content) => {
                self.fan_out(&content);
                Delivery::Unsubscribe
            }
            Transformed::Unsubscribe => Delivery::Unsubscribe,
        }
    }

    fn fan_out(&self, content: &T) {
        let snapshot = self.inner.subscribers.lock().clone();
        let mut cancelled = Vec::new();

        for subscriber in &snapshot {
            match subscriber.deliver(content) {
                Ok(Delivery::Keep) => {}
                Ok(Delivery::Unsubscribe) => cancelled.push(subscriber.identity()),
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "subscriber failed; subscription kept");
                }
            }
        }

        if !cancelled.is_empty() {
            self.inner
                .subscribers
                .lock()
                .retain(|subscriber| !cancelled.contains(&subscriber.identity()));
            debug!(removed = cancelled.len(), "subscribers unsubscribed");
        }
    }

    /// Removes `subscriber` from this publisher. Returns whether it was
    /// subscribed.
    pub fn remove(&self, subscriber: &Arc<dyn Subscriber<T>>) -> bool {
        self.remove_identity(subscriber.identity())
    }

    /// Removes a chained route created with [`Publisher::subscribe_publisher`]
    /// or [`filter_content`].
    pub fn remove_publisher(&self, downstream: &Publisher<T>) -> bool {
        self.remove_identity(<Self as Subscriber<T>>::identity(downstream))
    }

    fn remove_identity(&self, id: usize) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|existing| existing.identity() != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_subscribed(&self, subscriber: &Arc<dyn Subscriber<T>>) -> bool {
        let id = subscriber.identity();
        self.inner
            .subscribers
            .lock()
            .iter()
            .any(|existing| existing.identity() == id)
    }

    /// Every delivered value, as a stream. The backing subscriber cancels
    /// itself on the first delivery after the stream is dropped.
    pub fn stream(&self) -> impl Stream<Item = T> + Send + Unpin + use<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(subscriber(move |content: &T| {
            if tx.send(content.clone()).is_ok() {
                Ok(Delivery::Keep)
            } else {
                Ok(Delivery::Unsubscribe)
            }
        }));
        UnboundedReceiverStream::new(rx)
    }
}

impl<T> Subscriber<T> for Publisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn deliver(&self, content: &T) -> Result<Delivery> {
        Ok(self.publish(content.clone()))
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> ClientResult<()> {
        Publisher::subscribe(self, subscriber);
        Ok(())
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// Creates a publisher with `transform` and subscribes it to `upstream`.
pub fn filter_content<T, F>(upstream: &Publisher<T>, transform: F) -> Publisher<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Transformed<T> + Send + Sync + 'static,
{
    let filtered = Publisher::new(transform);
    upstream.subscribe_publisher(&filtered);
    filtered
}

/// Creates a leaf subscriber from `f` and subscribes it to `upstream`.
pub fn consume_content<T, F>(upstream: &Publisher<T>, f: F) -> Arc<dyn Subscriber<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) -> Result<Delivery> + Send + Sync + 'static,
{
    let consumer = subscriber(f);
    upstream.subscribe(Arc::clone(&consumer));
    consumer
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, bail};
    use futures_util::StreamExt;
    use parking_lot::Mutex;

    use super::*;

    fn recorder<T: Clone + Send + Sync + 'static>(
        seen: &Arc<Mutex<Vec<T>>>,
    ) -> Arc<dyn Subscriber<T>> {
        let seen = Arc::clone(seen);
        subscriber(move |value: &T| {
            seen.lock().push(value.clone());
            Ok(Delivery::Keep)
        })
    }

    #[test]
    fn delivers_every_item_once_in_publish_order() {
        let publisher = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.subscribe(recorder(&seen));

        for value in 0..5 {
            publisher.publish(value);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unsubscribe_after_threshold_stops_delivery() {
        let publisher = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = consume_content(&publisher, move |value: &i32| {
            if *value > 2 {
                return Ok(unsubscribe());
            }
            sink.lock().push(*value);
            Ok(Delivery::Keep)
        });

        publisher.publish(1);
        publisher.publish(2);
        publisher.publish(3);
        assert!(!publisher.is_subscribed(&subscriber));

        publisher.publish(4);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn subscriber_cancelled_at_kth_item_sees_prefix_only() {
        let publisher = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        consume_content(&publisher, move |value: &u32| {
            sink.lock().push(*value);
            if *value == 3 {
                Ok(Delivery::Unsubscribe)
            } else {
                Ok(Delivery::Keep)
            }
        });

        for value in 1..=6 {
            publisher.publish(value);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn failing_subscriber_is_retained_and_does_not_block_others() {
        let publisher = Publisher::passthrough();
        let failures = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&failures);
        let failing = consume_content(&publisher, move |_: &&str| -> Result<Delivery> {
            *counter.lock() += 1;
            bail!("boom")
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.subscribe(recorder(&seen));

        publisher.publish("a");
        publisher.publish("b");

        assert_eq!(*failures.lock(), 2);
        assert!(publisher.is_subscribed(&failing));
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn subscribe_deduplicates_by_identity() {
        let publisher = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = recorder(&seen);
        publisher.subscribe(Arc::clone(&subscriber));
        publisher.subscribe(subscriber);

        let downstream = Publisher::<i32>::passthrough();
        publisher.subscribe_publisher(&downstream);
        publisher.subscribe_publisher(&downstream);

        assert_eq!(publisher.subscriber_count(), 2);
        publisher.publish(7);
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn transform_skip_delivers_nothing() {
        let publisher = Publisher::new(|value: i32| {
            if value % 2 == 0 {
                Transformed::Emit(value * 10)
            } else {
                Transformed::Skip
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.subscribe(recorder(&seen));

        for value in 1..=4 {
            publisher.publish(value);
        }
        assert_eq!(*seen.lock(), vec![20, 40]);
    }

    #[test]
    fn plain_subscriber_rejects_subscriptions() {
        let leaf: Arc<dyn Subscriber<i32>> = subscriber(|_: &i32| Ok(Delivery::Keep));
        let other = subscriber(|_: &i32| Ok(Delivery::Keep));
        let error = leaf.subscribe(other).unwrap_err();
        assert!(matches!(error, ClientError::SubscriptionMisuse));
    }

    #[test]
    fn chained_filter_unsubscribes_itself_from_upstream() {
        let upstream = Publisher::passthrough();
        let filtered = filter_content(&upstream, |value: i32| {
            if value >= 3 {
                Transformed::EmitAndUnsubscribe(value)
            } else {
                Transformed::Emit(value)
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        filtered.subscribe(recorder(&seen));

        for value in 1..=5 {
            upstream.publish(value);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(upstream.subscriber_count(), 0);
    }

    #[test]
    fn removed_route_receives_nothing_further() {
        let upstream = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let evens = filter_content(&upstream, |value: i32| {
            if value % 2 == 0 {
                Transformed::Emit(value)
            } else {
                Transformed::Skip
            }
        });
        evens.subscribe(recorder(&seen));
        let other = consume_content(&upstream, |_: &i32| Ok(Delivery::Keep));

        upstream.publish(2);
        assert!(upstream.remove_publisher(&evens));
        assert!(!upstream.remove_publisher(&evens));
        upstream.publish(4);

        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(upstream.subscriber_count(), 1);
        assert!(upstream.remove(&other));
        assert_eq!(upstream.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_added_mid_pass_misses_in_flight_content() {
        let publisher = Publisher::passthrough();
        let late_seen = Arc::new(Mutex::new(Vec::new()));
        let route = publisher.clone();
        let late = recorder(&late_seen);
        consume_content(&publisher, move |_: &i32| {
            route.subscribe(Arc::clone(&late));
            Ok(Delivery::Keep)
        });

        publisher.publish(1);
        assert!(late_seen.lock().is_empty());
        publisher.publish(2);
        assert_eq!(*late_seen.lock(), vec![2]);
    }

    #[test]
    fn recursive_publish_from_callback_is_delivered() {
        let publisher = Publisher::passthrough();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let route = publisher.clone();
        consume_content(&publisher, move |value: &i32| {
            if *value < 3 {
                route.publish(value + 1);
            }
            Ok(Delivery::Keep)
        });
        publisher.subscribe(recorder(&seen));

        publisher.publish(1);
        assert_eq!(*seen.lock(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn stream_yields_published_values_and_cancels_when_dropped() {
        let publisher = Publisher::passthrough();
        let mut stream = publisher.stream();
        publisher.publish("x".to_owned());
        publisher.publish("y".to_owned());
        assert_eq!(stream.next().await.as_deref(), Some("x"));
        assert_eq!(stream.next().await.as_deref(), Some("y"));

        drop(stream);
        publisher.publish("z".to_owned());
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
