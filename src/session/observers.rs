use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::messaging::envelope::Envelope;


/// The application's view of a session's inbound traffic. Both callbacks default to doing
///  nothing, so an observer interested in one kind of traffic implements only that one.
///
/// Returning an error (or panicking) does not affect the session or other observers; it is logged.
#[async_trait]
pub trait SessionObserver: Send + Sync + 'static {
    async fn handle_msg(&self, _envelope: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_loc(&self, _envelope: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObservedTraffic {
    Message,
    Location,
}

/// An ordered list of observers. Observers are identified by their allocation, not by value:
///  two distinct observers that happen to be equal are still two observers.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverList {
    pub fn new(initial: Vec<Arc<dyn SessionObserver>>) -> ObserverList {
        ObserverList {
            observers: RwLock::new(initial),
        }
    }

    pub async fn add(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().await
            .push(observer);
    }

    /// returns `true` if the observer was registered
    pub async fn remove(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        let mut observers = self.observers.write().await;
        let len_before = observers.len();
        observers.retain(|o| !is_same_observer(o, observer));
        observers.len() != len_before
    }

    pub async fn len(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Calls all observers in registration order. The list is copied before the first call, so
    ///  observers may add or remove observers (including themselves) without affecting this
    ///  dispatch.
    pub async fn dispatch(&self, traffic: ObservedTraffic, envelope: &Envelope) {
        let snapshot = self.observers.read().await.clone();

        for observer in snapshot {
            let call = match traffic {
                ObservedTraffic::Message => observer.handle_msg(envelope),
                ObservedTraffic::Location => observer.handle_loc(envelope),
            };
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{:?} observer failed on {:?} from {:?} - continuing with the next one: {}", traffic, envelope.id, envelope.from, e),
                Err(_) => error!("{:?} observer panicked on {:?} from {:?} - continuing with the next one", traffic, envelope.id, envelope.from),
            }
        }
    }
}

/// NB: This compares data addresses only. Comparing fat pointers would compare vtable addresses
///      as well, and those are not guaranteed to be unique per type.
fn is_same_observer(a: &Arc<dyn SessionObserver>, b: &Arc<dyn SessionObserver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}


pub struct ObserverRegistry {
    pub messages: ObserverList,
    pub locations: ObserverList,
}

impl ObserverRegistry {
    pub fn new(message_observers: Vec<Arc<dyn SessionObserver>>, location_observers: Vec<Arc<dyn SessionObserver>>) -> ObserverRegistry {
        ObserverRegistry {
            messages: ObserverList::new(message_observers),
            locations: ObserverList::new(location_observers),
        }
    }

    pub fn list(&self, traffic: ObservedTraffic) -> &ObserverList {
        match traffic {
            ObservedTraffic::Message => &self.messages,
            ObservedTraffic::Location => &self.locations,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::test_util::observer::{PanickingObserver, RecordingObserver};

    fn envelope() -> Envelope {
        Envelope::message("me".into(), json!("x"))
    }

    /// removes another observer when it is called
    struct RemovingObserver {
        list: Arc<ObserverList>,
        target: Arc<dyn SessionObserver>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionObserver for RemovingObserver {
        async fn handle_msg(&self, _envelope: &Envelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.list.remove(&self.target).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order_despite_failures() {
        let first = RecordingObserver::failing();
        let second = RecordingObserver::new();
        let list = ObserverList::new(vec![first.clone() as Arc<dyn SessionObserver>, second.clone()]);

        list.dispatch(ObservedTraffic::Message, &envelope()).await;
        list.dispatch(ObservedTraffic::Location, &envelope()).await;

        assert_eq!(first.messages().len(), 1);
        assert_eq!(second.messages().len(), 1);
        assert_eq!(first.locations().len(), 1);
        assert_eq!(second.locations().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_dispatch() {
        let recording = RecordingObserver::new();
        let list = ObserverList::new(vec![PanickingObserver::new(json!(1)) as Arc<dyn SessionObserver>, recording.clone()]);

        list.dispatch(ObservedTraffic::Message, &Envelope::message("me".into(), json!(1))).await;
        list.dispatch(ObservedTraffic::Message, &Envelope::message("me".into(), json!(2))).await;

        assert_eq!(recording.messages().iter().map(|e| e.content.clone()).collect::<Vec<_>>(), vec![json!(1), json!(2)]);
        assert_eq!(list.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_by_identity_not_by_value() {
        let a = RecordingObserver::new();
        let b = RecordingObserver::new();
        let a_dyn: Arc<dyn SessionObserver> = a.clone();

        let list = ObserverList::default();
        list.add(a.clone()).await;
        list.add(b.clone()).await;

        assert!(list.remove(&a_dyn).await);
        assert!(!list.remove(&a_dyn).await);
        assert_eq!(list.len().await, 1);

        list.dispatch(ObservedTraffic::Message, &envelope()).await;
        assert!(a.messages().is_empty());
        assert_eq!(b.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_removal_during_dispatch_takes_effect_on_next_dispatch() {
        let list = Arc::new(ObserverList::default());
        let before = RecordingObserver::new();
        let target = RecordingObserver::new();
        let after = RecordingObserver::new();
        let remover = Arc::new(RemovingObserver {
            list: list.clone(),
            target: target.clone(),
            calls: AtomicUsize::new(0),
        });

        list.add(before.clone()).await;
        list.add(remover.clone()).await;
        list.add(target.clone()).await;
        list.add(after.clone()).await;

        list.dispatch(ObservedTraffic::Message, &envelope()).await;
        assert_eq!(before.messages().len(), 1);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.messages().len(), 1);
        assert_eq!(after.messages().len(), 1);

        list.dispatch(ObservedTraffic::Message, &envelope()).await;
        assert_eq!(before.messages().len(), 2);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 2);
        assert_eq!(target.messages().len(), 1);
        assert_eq!(after.messages().len(), 2);
    }
}
