//! Single-shot completion for asynchronous node operations
//!
//! `complete` consumes the handle, so a connect, disconnect or quiesce
//! answers its caller at most once; dropping an unanswered handle is
//! logged.

use flow_types::{Response, Status};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<Response>>,
    operation: &'static str,
}

impl Completion {
    /// A completion and the receiver the caller awaits
    pub fn channel(operation: &'static str) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                operation,
            },
            rx,
        )
    }

    /// A completion nobody waits for
    pub fn detached(operation: &'static str) -> Self {
        Self { tx: None, operation }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn complete(mut self, response: Response) {
        debug!(operation = self.operation, status = %response.status, "Operation completed");
        if let Some(tx) = self.tx.take() {
            // Receiver gone means the caller stopped waiting
            let _ = tx.send(response);
        }
    }

    pub fn fail(self, status: Status) {
        self.complete(Response::new(status));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!(operation = self.operation, "Completion dropped unanswered");
            let _ = tx.send(Response::new(Status::InternalError));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let (completion, rx) = Completion::channel("connect");
        completion.complete(Response::ok());
        assert!(rx.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_drop_reports_failure() {
        let (completion, rx) = Completion::channel("disconnect");
        drop(completion);
        assert_eq!(rx.await.unwrap().status, Status::InternalError);
    }
}
