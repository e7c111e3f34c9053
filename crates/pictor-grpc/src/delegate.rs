//! Application callbacks for generation requests.
//!
//! Every notification is marshaled onto one dedicated thread, whatever
//! thread produced it, so a delegate sees a single ordered sequence:
//!
//! ```text
//! did_receive_generation_request
//!   └─> did_update_generation_progress*
//!         └─> did_complete_generation_response   (exactly once)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use pictor_core::{CancellationController, DeviceType, Signpost};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Name of the thread delegate callbacks run on
pub const DELEGATE_THREAD_NAME: &str = "pictor-delegate";

/// Observer of generation requests
pub trait GenerationServiceDelegate: Send + Sync + 'static {
    /// A request passed validation and is about to be resolved and queued.
    ///
    /// `cancellation` may be kept to cancel the request from the application.
    fn did_receive_generation_request(
        &self,
        cancellation: CancellationController,
        signposts: BTreeSet<Signpost>,
        user: String,
        device: DeviceType,
    );

    /// The compute collaborator reached a milestone
    fn did_update_generation_progress(&self, signpost: Signpost, signposts: BTreeSet<Signpost>);

    /// The request finished; `success` is false for failures and cancellations
    fn did_complete_generation_response(&self, success: bool);
}

type Callback = Box<dyn FnOnce(&dyn GenerationServiceDelegate) + Send + 'static>;

/// Serializes delegate callbacks onto a dedicated thread
#[derive(Clone, Default)]
pub struct DelegateDispatcher {
    sender: Option<mpsc::UnboundedSender<Callback>>,
}

impl DelegateDispatcher {
    /// Dispatcher that drops every notification
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Start the callback thread for `delegate`
    pub fn new(delegate: Arc<dyn GenerationServiceDelegate>) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Callback>();
        thread::Builder::new()
            .name(DELEGATE_THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(callback) = receiver.blocking_recv() {
                    callback(delegate.as_ref());
                }
                debug!("Delegate dispatcher stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
        })
    }

    /// Whether a delegate is attached
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Announce a request and return the handle that completes it
    pub fn request_received(
        &self,
        cancellation: CancellationController,
        signposts: BTreeSet<Signpost>,
        user: String,
        device: DeviceType,
    ) -> RequestNotifier {
        self.dispatch(Box::new(move |delegate: &dyn GenerationServiceDelegate| {
            delegate.did_receive_generation_request(cancellation, signposts, user, device)
        }));
        RequestNotifier {
            dispatcher: self.clone(),
            completed: false,
        }
    }

    fn dispatch(&self, callback: Callback) {
        if let Some(ref sender) = self.sender {
            if sender.send(callback).is_err() {
                warn!("Delegate dispatcher is gone, dropping notification");
            }
        }
    }
}

impl std::fmt::Debug for DelegateDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateDispatcher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Completion handle of one announced request.
///
/// Completing consumes the handle. Dropping it without completing reports a
/// failure, so the delegate hears exactly one outcome per request.
#[derive(Debug)]
pub struct RequestNotifier {
    dispatcher: DelegateDispatcher,
    completed: bool,
}

impl RequestNotifier {
    /// Sender for progress notifications, usable from the worker thread
    pub fn progress(&self) -> ProgressNotifier {
        ProgressNotifier {
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Report the outcome
    pub fn complete(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.dispatcher.dispatch(Box::new(move |delegate: &dyn GenerationServiceDelegate| {
            delegate.did_complete_generation_response(success)
        }));
    }
}

impl Drop for RequestNotifier {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Progress side of a [`RequestNotifier`]
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    dispatcher: DelegateDispatcher,
}

impl ProgressNotifier {
    /// Report a milestone
    pub fn notify(&self, signpost: Signpost, signposts: BTreeSet<Signpost>) {
        self.dispatcher.dispatch(Box::new(move |delegate: &dyn GenerationServiceDelegate| {
            delegate.did_update_generation_progress(signpost, signposts)
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Received(String),
        Progress(Signpost),
        Completed(bool),
    }

    struct Recorder {
        events: Mutex<Vec<(Event, Option<String>)>>,
        done: Mutex<std_mpsc::Sender<()>>,
    }

    impl Recorder {
        fn record(&self, event: Event) {
            let thread = thread::current().name().map(str::to_string);
            self.events.lock().unwrap().push((event, thread));
        }
    }

    impl GenerationServiceDelegate for Recorder {
        fn did_receive_generation_request(
            &self,
            _cancellation: CancellationController,
            _signposts: BTreeSet<Signpost>,
            user: String,
            _device: DeviceType,
        ) {
            self.record(Event::Received(user));
        }

        fn did_update_generation_progress(&self, signpost: Signpost, _signposts: BTreeSet<Signpost>) {
            self.record(Event::Progress(signpost));
        }

        fn did_complete_generation_response(&self, success: bool) {
            self.record(Event::Completed(success));
            self.done.lock().unwrap().send(()).unwrap();
        }
    }

    fn recorder() -> (Arc<Recorder>, std_mpsc::Receiver<()>) {
        let (tx, rx) = std_mpsc::channel();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            done: Mutex::new(tx),
        });
        (recorder, rx)
    }

    #[test]
    fn test_callbacks_ordered_on_delegate_thread() {
        let (delegate, done) = recorder();
        let dispatcher = DelegateDispatcher::new(delegate.clone()).unwrap();

        let notifier = dispatcher.request_received(
            CancellationController::with_monitor("test", None),
            BTreeSet::new(),
            "alice".to_string(),
            DeviceType::Laptop,
        );
        let progress = notifier.progress();
        let worker = thread::spawn(move || {
            progress.notify(Signpost::TextEncoded, BTreeSet::new());
            progress.notify(Signpost::ImageDecoded, BTreeSet::new());
        });
        worker.join().unwrap();
        notifier.complete(true);

        done.recv_timeout(Duration::from_secs(5)).unwrap();
        let events = delegate.events.lock().unwrap().clone();
        let kinds: Vec<Event> = events.iter().map(|(e, _)| e.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Event::Received("alice".to_string()),
                Event::Progress(Signpost::TextEncoded),
                Event::Progress(Signpost::ImageDecoded),
                Event::Completed(true),
            ]
        );
        assert!(events
            .iter()
            .all(|(_, thread)| thread.as_deref() == Some(DELEGATE_THREAD_NAME)));
    }

    #[test]
    fn test_dropped_notifier_reports_failure_once() {
        let (delegate, done) = recorder();
        let dispatcher = DelegateDispatcher::new(delegate.clone()).unwrap();

        let notifier = dispatcher.request_received(
            CancellationController::with_monitor("test", None),
            BTreeSet::new(),
            String::new(),
            DeviceType::Phone,
        );
        drop(notifier);

        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done.recv_timeout(Duration::from_millis(100)).is_err());
        let completions = delegate
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| matches!(e, Event::Completed(_)))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_disabled_dispatcher_is_silent() {
        let dispatcher = DelegateDispatcher::disabled();
        assert!(!dispatcher.is_enabled());
        let notifier = dispatcher.request_received(
            CancellationController::with_monitor("test", None),
            BTreeSet::new(),
            String::new(),
            DeviceType::Tablet,
        );
        notifier.progress().notify(Signpost::TextEncoded, BTreeSet::new());
        notifier.complete(false);
    }
}
