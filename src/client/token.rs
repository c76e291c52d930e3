//! One-shot completion tokens for user operations.
//!
//! A token is created when an operation enters the client, registered with
//! the in-flight engine for ack-bearing operations, and completed exactly
//! once by the sender, receiver or teardown path.

use crate::core::error::{MqttError, MqttResult};
use crate::protocol::Message;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

/// Kind of operation a token tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
    Ping,
}

/// Callback fired exactly once when the token completes.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &Token);
    fn on_failure(&self, token: &Token, error: &MqttError);
}

#[derive(Default)]
struct TokenState {
    completed: bool,
    error: Option<MqttError>,
    topics: Vec<String>,
    message: Option<Message>,
    message_id: u16,
    granted_qos: Vec<u8>,
    session_present: bool,
    callback: Option<Arc<dyn ActionListener>>,
    user_context: Option<Arc<dyn Any + Send + Sync>>,
}

struct TokenInner {
    kind: OperationKind,
    state: Mutex<TokenState>,
    // watch instead of Notify: completion between a state check and the
    // await must not be lost.
    done: watch::Sender<bool>,
}

/// Handle to the eventual outcome of one client operation.
///
/// Clones observe the same completion. Owned jointly by the caller and the
/// in-flight engine; the engine drops its reference at completion.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Token {
    pub(crate) fn new(kind: OperationKind) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                kind,
                state: Mutex::new(TokenState::default()),
                done,
            }),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    /// Wait until the operation completes, returning its outcome.
    pub async fn wait(&self) -> MqttResult<()> {
        let mut done = self.inner.done.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                if state.completed {
                    return match &state.error {
                        Some(error) => Err(error.clone()),
                        None => Ok(()),
                    };
                }
            }
            if done.changed().await.is_err() {
                // Sender side lives in this token; unreachable in practice.
                continue;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().completed
    }

    /// Error stored at completion, if the operation failed.
    pub fn error(&self) -> Option<MqttError> {
        self.inner.state.lock().error.clone()
    }

    /// Topic names or filters the operation addressed.
    pub fn topics(&self) -> Vec<String> {
        self.inner.state.lock().topics.clone()
    }

    /// Message attached to a publish token.
    pub fn message(&self) -> Option<Message> {
        self.inner.state.lock().message.clone()
    }

    /// Message id assigned to a QoS > 0 publish, or 0.
    pub fn message_id(&self) -> u16 {
        self.inner.state.lock().message_id
    }

    /// Grants from the SUBACK, one byte per requested filter.
    pub fn granted_qos(&self) -> Vec<u8> {
        self.inner.state.lock().granted_qos.clone()
    }

    /// Whether the broker reported an existing session in its CONNACK.
    pub fn session_present(&self) -> bool {
        self.inner.state.lock().session_present
    }

    /// Attach a completion callback. Fires immediately if the token has
    /// already completed.
    pub fn set_action_callback(&self, callback: Arc<dyn ActionListener>) {
        let fire = {
            let mut state = self.inner.state.lock();
            if state.completed {
                Some(state.error.clone())
            } else {
                state.callback = Some(callback.clone());
                None
            }
        };
        if let Some(error) = fire {
            match error {
                Some(error) => callback.on_failure(self, &error),
                None => callback.on_success(self),
            }
        }
    }

    pub fn set_user_context(&self, context: Arc<dyn Any + Send + Sync>) {
        self.inner.state.lock().user_context = Some(context);
    }

    pub fn user_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.state.lock().user_context.clone()
    }

    pub(crate) fn set_topics(&self, topics: Vec<String>) {
        self.inner.state.lock().topics = topics;
    }

    pub(crate) fn set_message(&self, message: Message) {
        self.inner.state.lock().message = Some(message);
    }

    pub(crate) fn set_message_id(&self, id: u16) {
        self.inner.state.lock().message_id = id;
    }

    pub(crate) fn set_granted_qos(&self, granted: Vec<u8>) {
        self.inner.state.lock().granted_qos = granted;
    }

    pub(crate) fn set_session_present(&self, present: bool) {
        self.inner.state.lock().session_present = present;
    }

    /// Complete successfully. A second completion is a no-op.
    pub(crate) fn complete(&self) {
        self.finish(None);
    }

    /// Complete with a failure. A second completion is a no-op.
    pub(crate) fn fail(&self, error: MqttError) {
        self.finish(Some(error));
    }

    fn finish(&self, error: Option<MqttError>) {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.error = error.clone();
            state.callback.take()
        };
        self.inner.done.send_replace(true);
        if let Some(callback) = callback {
            match error {
                Some(error) => callback.on_failure(self, &error),
                None => callback.on_success(self),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ReasonCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                successes: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            })
        }
    }

    impl ActionListener for CountingListener {
        fn on_success(&self, _token: &Token) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _token: &Token, _error: &MqttError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn waiters_observe_success() {
        let token = Token::new(OperationKind::Publish);
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        token.complete();
        handle.await.unwrap().unwrap();
        assert!(token.is_complete());
        assert!(token.error().is_none());
    }

    #[tokio::test]
    async fn failure_is_returned_and_stored() {
        let token = Token::new(OperationKind::Subscribe);
        token.fail(MqttError::new(ReasonCode::SubscribeFailed));
        let err = token.wait().await.unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::SubscribeFailed);
        assert_eq!(token.error().unwrap().code(), 128);
    }

    #[test]
    fn completion_happens_exactly_once() {
        let token = Token::new(OperationKind::Publish);
        let listener = CountingListener::new();
        token.set_action_callback(listener.clone());
        token.complete();
        token.fail(MqttError::new(ReasonCode::ConnectionLost));
        token.complete();
        assert_eq!(listener.successes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.failures.load(Ordering::SeqCst), 0);
        assert!(token.error().is_none());
    }

    #[test]
    fn late_callback_fires_immediately() {
        let token = Token::new(OperationKind::Connect);
        token.fail(MqttError::new(ReasonCode::BrokerUnavailable));
        let listener = CountingListener::new();
        token.set_action_callback(listener.clone());
        assert_eq!(listener.failures.load(Ordering::SeqCst), 1);
    }
}
