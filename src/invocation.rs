use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::messages::{Dict, ErrorType, List, Message, Reason, YieldOptions, URI};
use crate::{Id, UserHandlerError};

/// The payload stream a registered procedure handler returns. Each item is
/// one progressive response value; the stream's end marks completion.
pub type HandlerStream =
    Pin<Box<dyn Stream<Item = Result<(Option<List>, Option<Dict>), UserHandlerError>> + Send>>;

/// A registered procedure's handler: invoked once per `INVOCATION` with the
/// call's arguments, producing the response stream described in §4.5.
pub type Handler = Arc<dyn Fn(Option<List>, Option<Dict>) -> HandlerStream + Send + Sync>;

/// One running invocation. Tracks the spawned task so the driver can abort
/// it if the transport dies mid-flight (see `Session`'s close/failure path).
pub struct InvocationTask {
    handle: JoinHandle<()>,
}

impl InvocationTask {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        invocation_id: Id,
        receive_progress: bool,
        args: Option<List>,
        kwargs: Option<Dict>,
        handler: Handler,
        outbound: mpsc::UnboundedSender<Message>,
        done: mpsc::UnboundedSender<Id>,
        interrupts: UnboundedReceiverStream<Message>,
    ) -> InvocationTask {
        let handle = tokio::spawn(async move {
            run(invocation_id, receive_progress, args, kwargs, handler, &outbound, interrupts).await;
            let _ = done.send(invocation_id);
        });
        InvocationTask { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run(
    invocation_id: Id,
    receive_progress: bool,
    args: Option<List>,
    kwargs: Option<Dict>,
    handler: Handler,
    outbound: &mpsc::UnboundedSender<Message>,
    mut interrupts: UnboundedReceiverStream<Message>,
) {
    let mut stream = handler(args, kwargs);
    let mut last: Option<(Option<List>, Option<Dict>)> = None;

    loop {
        tokio::select! {
            biased;

            interrupt = interrupts.next() => {
                if interrupt.is_some() {
                    log::debug!("invocation {} interrupted, cancelling handler", invocation_id);
                    let _ = outbound.send(Message::Error(
                        ErrorType::Invocation,
                        invocation_id,
                        Dict::new(),
                        Reason::Cancelled,
                        Some(vec![json!("function call has been cancelled")]),
                        None,
                    ));
                    return;
                }
            }

            item = stream.next() => {
                match item {
                    Some(Ok((rargs, rkwargs))) => {
                        if receive_progress {
                            let _ = outbound.send(Message::Yield(
                                invocation_id,
                                YieldOptions::progress(),
                                rargs,
                                rkwargs,
                            ));
                        } else {
                            last = Some((rargs, rkwargs));
                        }
                    }
                    Some(Err(e)) => {
                        let reason = match e.uri.as_deref() {
                            Some(uri) => Reason::CustomReason(URI::new(uri)),
                            None => Reason::CustomReason(URI::new("wamp.error")),
                        };
                        // §4.5: the ERROR frame's args must never be empty, even
                        // when the handler's failure carries no message.
                        let args = match e.args {
                            Some(args) => Some(args),
                            None => Some(vec![json!({ "error": reason.to_string() })]),
                        };
                        let _ = outbound.send(Message::Error(
                            ErrorType::Invocation,
                            invocation_id,
                            Dict::new(),
                            reason,
                            args,
                            e.kwargs,
                        ));
                        return;
                    }
                    None => {
                        if receive_progress {
                            let _ = outbound.send(Message::Yield(
                                invocation_id,
                                YieldOptions::new(),
                                None,
                                None,
                            ));
                        } else {
                            let (a, k) = last.unwrap_or((None, None));
                            let _ = outbound.send(Message::Yield(invocation_id, YieldOptions::new(), a, k));
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_stream::wrappers::UnboundedReceiverStream as Rx;

    fn handler_for(values: Vec<(Option<List>, Option<Dict>)>) -> Handler {
        Arc::new(move |_args, _kwargs| {
            let values = values.clone();
            Box::pin(futures::stream::iter(values.into_iter().map(Ok)))
        })
    }

    #[tokio::test]
    async fn non_progressive_emits_only_last_value() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let handler = handler_for(vec![
            (Some(vec![json!(1)]), None),
            (Some(vec![json!(2)]), None),
        ]);
        run(1000, false, None, None, handler, &out_tx, Rx::new(interrupt_rx)).await;
        let _ = done_tx;

        match out_rx.recv().await.unwrap() {
            Message::Yield(id, options, args, _) => {
                assert_eq!(id, 1000);
                assert!(!options.progress);
                assert_eq!(args, Some(vec![json!(2)]));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn progressive_emits_each_value_then_terminal_yield() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let handler = handler_for(vec![(Some(vec![json!("a")]), None)]);
        run(1, true, None, None, handler, &out_tx, Rx::new(interrupt_rx)).await;
        let _ = done_tx;

        match out_rx.recv().await.unwrap() {
            Message::Yield(_, options, args, _) => {
                assert!(options.progress);
                assert_eq!(args, Some(vec![json!("a")]));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match out_rx.recv().await.unwrap() {
            Message::Yield(_, options, args, _) => {
                assert!(!options.progress);
                assert_eq!(args, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn interrupt_emits_cancelled_error() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        interrupt_tx
            .send(Message::Interrupt(1000, crate::messages::InterruptOptions { mode: None }))
            .unwrap();

        let handler: Handler = Arc::new(|_, _| Box::pin(futures::stream::pending()));
        run(1000, false, None, None, handler, &out_tx, Rx::new(interrupt_rx)).await;

        match out_rx.recv().await.unwrap() {
            Message::Error(ErrorType::Invocation, id, _, Reason::Cancelled, args, _) => {
                assert_eq!(id, 1000);
                assert_eq!(args, Some(vec![json!("function call has been cancelled")]));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_error_without_message_falls_back_to_non_empty_args() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let handler: Handler = Arc::new(|_, _| {
            Box::pin(futures::stream::once(async {
                Err(UserHandlerError::new("some.uri"))
            }))
        });
        run(1, false, None, None, handler, &out_tx, Rx::new(interrupt_rx)).await;

        match out_rx.recv().await.unwrap() {
            Message::Error(ErrorType::Invocation, id, _, reason, args, _) => {
                assert_eq!(id, 1);
                assert_eq!(reason, Reason::CustomReason(URI::new("some.uri")));
                let args = args.expect("fallback args must be present");
                assert_eq!(args.len(), 1);
                assert!(args[0].is_object());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_error_with_message_keeps_its_args() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let handler: Handler = Arc::new(|_, _| {
            Box::pin(futures::stream::once(async {
                Err(UserHandlerError::with_message("some.uri", "boom"))
            }))
        });
        run(1, false, None, None, handler, &out_tx, Rx::new(interrupt_rx)).await;

        match out_rx.recv().await.unwrap() {
            Message::Error(ErrorType::Invocation, _, _, _, args, _) => {
                assert_eq!(args, Some(vec![json!("boom")]));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
