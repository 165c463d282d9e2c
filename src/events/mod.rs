use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

pub const PING_EVENT: &str = "ping";
pub const NODE_REGISTERED_EVENT: &str = "node-registered";
pub const CLIENT_REGISTERED_EVENT: &str = "client-registered";
pub const NODE_DISCONNECTED_EVENT: &str = "node-disconnected";
pub const CLIENT_DISCONNECTED_EVENT: &str = "client-disconnected";
pub const MESSAGE_FORWARDED_EVENT: &str = "message-forwarded";
pub const MESSAGE_QUEUED_EVENT: &str = "message-queued";

pub type ListenerResult = Result<(), String>;

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "sync listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(
                f,
                "sync listener #{listener_index} panicked for event '{event}'"
            ),
        }
    }
}

impl Error for EmitError {}

/// Fire-and-forget notification hub. Observers never influence broker
/// outcomes: emit failures are reported to the caller, who only logs them.
#[derive(Default)]
pub struct EventEmitter {
    sync_listeners: RwLock<HashMap<String, Vec<SyncListener>>>,
    async_listeners: RwLock<HashMap<String, Vec<AsyncListener>>>,
    running_async: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.sync_listeners
            .write()
            .expect("sync listener map lock poisoned")
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.async_listeners
            .write()
            .expect("async listener map lock poisoned")
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Channel-flavoured subscription: every matching event is copied into the
    /// returned receiver. A dropped receiver silently detaches.
    pub fn subscribe(&self, event_name: impl Into<String>) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        self.on(event_name, move |event| {
            let _ = tx
                .lock()
                .expect("subscription sender lock poisoned")
                .send(event.clone());
            Ok(())
        });
        rx
    }

    pub fn emit(&self, event_name: impl Into<String>, payload: Option<Value>) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);
        self.run_sync(&event)?;
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.dispatch_async(event);
        }
        Ok(())
    }

    /// Stops handing events to async listeners. Sync listeners keep running.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Waits for in-flight async listeners; returns false when `timeout` elapses first.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.running_async.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn run_sync(&self, event: &Event) -> Result<(), EmitError> {
        let listeners = self
            .sync_listeners
            .read()
            .expect("sync listener map lock poisoned");

        let Some(handlers) = listeners.get(&event.name) else {
            return Ok(());
        };

        for (idx, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }

    fn dispatch_async(&self, event: Event) {
        let listeners = self
            .async_listeners
            .read()
            .expect("async listener map lock poisoned");

        let Some(handlers) = listeners.get(&event.name) else {
            return;
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let listener = Arc::clone(handler);
            let event_for_listener = event.clone();
            let event_name = event.name.clone();
            let running = Arc::clone(&self.running_async);
            running.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                match catch_unwind(AssertUnwindSafe(|| listener(event_for_listener))) {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        eprintln!("async listener #{idx} failed for event '{event_name}': {message}");
                    }
                    Err(_) => {
                        eprintln!("async listener #{idx} panicked for event '{event_name}'");
                    }
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}
