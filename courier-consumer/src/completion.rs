use tokio::sync::oneshot;

use crate::policy::Outcome;

/// Create a single-shot completion pair.
///
/// The [`Completer`] settles at most once because settling consumes it; the
/// [`CompletionHandle`] is awaited at most once for the same reason. Dropping
/// the completer without settling resolves the handle as abandoned.
pub fn completion() -> (Completer, CompletionHandle) {
    let (sender, receiver) = oneshot::channel();
    (Completer { sender }, CompletionHandle { receiver })
}

#[derive(Debug)]
pub struct Completer {
    sender: oneshot::Sender<Outcome>,
}

impl Completer {
    /// Report success. Returns `false` when nobody is waiting any more.
    pub fn succeed(self) -> bool {
        self.sender.send(Outcome::Success).is_ok()
    }

    /// Report failure. Returns `false` when nobody is waiting any more.
    pub fn fail(self) -> bool {
        self.sender.send(Outcome::Failure).is_ok()
    }
}

#[derive(Debug)]
pub struct CompletionHandle {
    receiver: oneshot::Receiver<Outcome>,
}

impl CompletionHandle {
    /// Wait for the settlement. `None` means the completer was dropped unsettled.
    pub async fn wait(self) -> Option<Outcome> {
        self.receiver.await.ok()
    }
}

/// Explicit acknowledgment call handed to downstream in `explicit-signal` mode.
#[derive(Debug)]
pub struct Acknowledger {
    completer: Completer,
}

impl Acknowledger {
    pub(crate) fn new(completer: Completer) -> Self {
        Self { completer }
    }

    pub fn ack(self) -> bool {
        self.completer.succeed()
    }

    pub fn nack(self) -> bool {
        self.completer.fail()
    }
}
