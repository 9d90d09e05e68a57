use tokio::sync::oneshot;

use crate::common::function::FunctionCode;
use crate::common::pdu::Pdu;
use crate::error::RequestError;

/// Commands accepted by a channel, sent across the isolation boundary
pub(crate) enum Command {
    /// Issue an application-level request
    Request(Request),
    /// Stop the channel: cancel in-flight requests and tear down the transport
    Stop,
}

/// All of the information the session task needs to process a request
pub(crate) struct Request {
    pub(crate) pdu: Pdu,
    pub(crate) function: FunctionCode,
    pub(crate) promise: Promise,
}

impl Request {
    pub(crate) fn new(pdu: Pdu, function: FunctionCode, promise: Promise) -> Self {
        Self {
            pdu,
            function,
            promise,
        }
    }

    pub(crate) fn fail(self, err: RequestError) {
        self.promise.complete(Err(err));
    }
}

/// One-shot completion handle for a request.
///
/// If dropped without being completed, the waiting caller observes `Shutdown`.
pub(crate) struct Promise {
    sender: oneshot::Sender<Result<Pdu, RequestError>>,
}

impl Promise {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Result<Pdu, RequestError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: tx }, rx)
    }

    pub(crate) fn complete(self, result: Result<Pdu, RequestError>) {
        // the receiver may have given up waiting, which is not an error here
        self.sender.send(result).ok();
    }
}
