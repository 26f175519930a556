//! Application callback surface and the single-consumer event pump.
//! Every handler invocation happens on the pump task, in queue order; that
//! FIFO is the only ordering guarantee the daemon makes.

use std::sync::Arc;

use peerio_core::session::{Event, PeerState};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Optional handlers registered by the embedding application. Unset handlers
/// mean the corresponding events are dropped.
#[derive(Default)]
pub struct Handlers {
    pub on_text: Option<Box<dyn FnMut(String) + Send>>,
    pub on_image: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
    pub on_peer_state: Option<Box<dyn FnMut(PeerState, String) + Send>>,
    pub on_disconnect: Option<Box<dyn FnMut() + Send>>,
    send_acknowledged: Option<Box<dyn FnOnce() + Send>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the one-shot send acknowledgment. Fires on the next `Checked`
    /// from any peer, then clears itself.
    pub fn set_send_callback(&mut self, f: impl FnOnce() + Send + 'static) {
        self.send_acknowledged = Some(Box::new(f));
    }
}

/// Drain the event queue, invoking handlers one at a time. Runs until every
/// sender is dropped.
pub async fn run_pump(mut rx: mpsc::UnboundedReceiver<Event>, handlers: Arc<Mutex<Handlers>>) {
    while let Some(event) = rx.recv().await {
        let mut h = handlers.lock().await;
        match event {
            Event::Text { from, body } => {
                debug!(%from, "text delivered");
                if let Some(f) = h.on_text.as_mut() {
                    f(body);
                }
            }
            Event::Image { from, bytes } => {
                debug!(%from, len = bytes.len(), "image delivered");
                if let Some(f) = h.on_image.as_mut() {
                    f(bytes);
                }
            }
            Event::PeerState {
                state,
                display_name,
                ..
            } => {
                if let Some(f) = h.on_peer_state.as_mut() {
                    f(state, display_name);
                }
            }
            Event::Acked { from } => {
                debug!(%from, "delivery acknowledged");
                if let Some(f) = h.send_acknowledged.take() {
                    f();
                }
            }
            Event::Disconnect { .. } => {
                if let Some(f) = h.on_disconnect.as_mut() {
                    f();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerio_core::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn peer() -> peerio_core::PeerId {
        Keypair::generate().peer_id()
    }

    #[tokio::test]
    async fn handlers_run_in_queue_order() {
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut handlers = Handlers::new();
        let l = log.clone();
        handlers.on_text = Some(Box::new(move |body| l.lock().unwrap().push(format!("t:{body}"))));
        let l = log.clone();
        handlers.on_image =
            Some(Box::new(move |bytes| l.lock().unwrap().push(format!("i:{}", bytes.len()))));
        let l = log.clone();
        handlers.on_peer_state =
            Some(Box::new(move |state, name| l.lock().unwrap().push(format!("s:{name}:{state}"))));

        let (tx, rx) = mpsc::unbounded_channel();
        let from = peer();
        tx.send(Event::PeerState {
            peer: from,
            display_name: "bob".into(),
            state: PeerState::Connected,
        })
        .unwrap();
        tx.send(Event::Text {
            from,
            body: "one".into(),
        })
        .unwrap();
        tx.send(Event::Image {
            from,
            bytes: vec![1, 2, 3],
        })
        .unwrap();
        tx.send(Event::Text {
            from,
            body: "two".into(),
        })
        .unwrap();
        drop(tx);

        run_pump(rx, Arc::new(Mutex::new(handlers))).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["s:bob:connected", "t:one", "i:3", "t:two"]
        );
    }

    #[tokio::test]
    async fn send_callback_fires_once_then_clears() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::new();
        let f = fired.clone();
        handlers.set_send_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let from = peer();
        tx.send(Event::Acked { from }).unwrap();
        tx.send(Event::Acked { from }).unwrap();
        drop(tx);

        run_pump(rx, Arc::new(Mutex::new(handlers))).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rearming_send_callback_fires_again() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(Mutex::new(Handlers::new()));
        let f = fired.clone();
        handlers.lock().await.set_send_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let from = peer();
        tx.send(Event::Acked { from }).unwrap();
        let pump = tokio::spawn(run_pump(rx, handlers.clone()));

        // Wait for the first ack to land, then arm again.
        while fired.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let f = fired.clone();
        handlers.lock().await.set_send_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tx.send(Event::Acked { from }).unwrap();
        drop(tx);
        pump.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unset_handlers_drop_events_without_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        let from = peer();
        tx.send(Event::Text {
            from,
            body: "ignored".into(),
        })
        .unwrap();
        tx.send(Event::Image {
            from,
            bytes: vec![0],
        })
        .unwrap();
        tx.send(Event::Acked { from }).unwrap();
        tx.send(Event::Disconnect { from }).unwrap();
        drop(tx);
        run_pump(rx, Arc::new(Mutex::new(Handlers::new()))).await;
    }

    #[tokio::test]
    async fn disconnect_event_invokes_handler() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::new();
        let f = fired.clone();
        handlers.on_disconnect = Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Event::Disconnect { from: peer() }).unwrap();
        drop(tx);
        run_pump(rx, Arc::new(Mutex::new(handlers))).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
