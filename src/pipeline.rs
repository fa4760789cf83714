//! Serialises ATT requests on one transport; demultiplexes responses to
//! callers and notifications/indications to subscribers.
//!
//! At most one request is outstanding on the wire at a time; additional
//! requests queue FIFO (§4.3). The pipeline owns a dedicated task that
//! holds the only reader of the transport, so all demultiplexing happens
//! in one place with no locking needed around the queue itself.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;

use crate::{
    codec::{self, OP_ERROR_RSP, OP_HANDLE_VALUE_CONFIRMATION, OP_HANDLE_VALUE_INDICATION, OP_HANDLE_VALUE_NOTIFICATION},
    transport::TransportHandle,
    Error, ErrorKind, Result,
};

/// What [`demux`] needs from the transport: sending the lone PDU it ever
/// originates itself (the Indication confirmation). Boxed-future trait so
/// `demux` can be driven in tests against a fake sink instead of a live
/// L2CAP socket, the same seam [`crate::escalator::with_escalation`] uses
/// for security escalation.
trait PduSink: Send + Sync {
    fn send<'a>(&'a self, pdu: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl PduSink for TransportHandle {
    fn send<'a>(&'a self, pdu: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.send(pdu).await })
    }
}

/// A received notification or indication, demultiplexed and ready for the
/// service model's value-change dispatch (§4.6).
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    /// Attribute handle whose value changed.
    pub handle: u16,
    /// New value.
    pub value: Vec<u8>,
    /// `true` if this arrived as an Indication (already confirmed by the
    /// time the handler sees it).
    pub is_indication: bool,
}

struct PendingRequest {
    pdu: Vec<u8>,
    expected_opcode: u8,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

enum Command {
    Request { pdu: Vec<u8>, expected_opcode: u8, reply: oneshot::Sender<Result<Vec<u8>>> },
    RegisterNotifyHandler { tx: mpsc::UnboundedSender<NotificationEvent> },
}

/// A handle to a running pipeline task.
#[derive(Clone)]
pub struct Pipeline {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Pipeline {
    /// Spawns the pipeline task over `transport`. The task runs until the
    /// last clone of `Pipeline` (and thus the command channel) is dropped,
    /// or the transport fails.
    pub fn spawn(transport: TransportHandle) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded();
        tokio::spawn(run(transport, cmd_rx));
        Self { cmd_tx }
    }

    /// Issues a request and awaits its matching response. `expected_opcode`
    /// is the response opcode this request completes on (e.g. `0x0B` for a
    /// `0x0A` Read Request); an Error Response always completes it too.
    ///
    /// Returns the raw response PDU (including its opcode byte) on success,
    /// or `Err(AttError(code))` / a transport error.
    pub async fn request(&self, pdu: Vec<u8>, expected_opcode: u8) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .unbounded_send(Command::Request { pdu, expected_opcode, reply: reply_tx })
            .map_err(|_| Error::new(ErrorKind::Internal(crate::InternalErrorKind::TransportLost)))?;
        reply_rx.await.map_err(|_| Error::new(ErrorKind::Internal(crate::InternalErrorKind::TransportLost)))?
    }

    /// Registers a handler that receives every demultiplexed notification
    /// and indication (§4.7: watchers register both kinds together).
    pub fn register_notify_handler(&self) -> mpsc::UnboundedReceiver<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded();
        // Best-effort: if the pipeline task has already shut down there is
        // nothing to register against and the receiver simply never yields.
        let _ = self.cmd_tx.unbounded_send(Command::RegisterNotifyHandler { tx });
        rx
    }
}

async fn run(transport: TransportHandle, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut queue: VecDeque<PendingRequest> = VecDeque::new();
    let mut outstanding: Option<PendingRequest> = None;
    let mut handlers: Vec<mpsc::UnboundedSender<NotificationEvent>> = Vec::new();
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            cmd = cmd_rx.next() => {
                match cmd {
                    Some(Command::Request { pdu, expected_opcode, reply }) => {
                        queue.push_back(PendingRequest { pdu, expected_opcode, reply });
                        if outstanding.is_none() {
                            send_next(&transport, &mut queue, &mut outstanding).await;
                        }
                    }
                    Some(Command::RegisterNotifyHandler { tx }) => handlers.push(tx),
                    None => break,
                }
            }
            res = transport.recv(&mut buf) => {
                match res {
                    Ok(n) => {
                        demux(&buf[..n], &transport, &mut outstanding, &mut handlers).await;
                        if outstanding.is_none() {
                            send_next(&transport, &mut queue, &mut outstanding).await;
                        }
                    }
                    Err(err) => {
                        fail_all(outstanding.take(), &mut queue, err);
                        break;
                    }
                }
            }
        }
    }
}

async fn send_next(
    transport: &TransportHandle, queue: &mut VecDeque<PendingRequest>, outstanding: &mut Option<PendingRequest>,
) {
    let Some(req) = queue.pop_front() else { return };
    if let Err(err) = transport.send(&req.pdu).await {
        let _ = req.reply.send(Err(err));
        return;
    }
    *outstanding = Some(req);
}

async fn demux(
    pdu: &[u8], transport: &dyn PduSink, outstanding: &mut Option<PendingRequest>,
    handlers: &mut Vec<mpsc::UnboundedSender<NotificationEvent>>,
) {
    if pdu.is_empty() {
        log::warn!("dropping empty ATT PDU");
        return;
    }
    let opcode = pdu[0];

    match opcode {
        OP_HANDLE_VALUE_NOTIFICATION | OP_HANDLE_VALUE_INDICATION => {
            let is_indication = opcode == OP_HANDLE_VALUE_INDICATION;
            let hv = match codec::decode_handle_value(pdu) {
                Ok(hv) => hv,
                Err(_) => {
                    log::warn!("dropping malformed {} PDU", if is_indication { "indication" } else { "notification" });
                    return;
                }
            };
            if is_indication {
                // Sent regardless of whether any watcher is registered —
                // the remote is untrusted and must see the protocol stay
                // in sync (§4.6).
                if let Err(err) = transport.send(&[OP_HANDLE_VALUE_CONFIRMATION]).await {
                    log::warn!("failed to send handle value confirmation: {err}");
                }
            }
            let event = NotificationEvent { handle: hv.handle, value: hv.value, is_indication };
            handlers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
        }
        OP_ERROR_RSP => {
            let Some(req) = outstanding.take() else {
                log::warn!("dropping unexpected Error Response with no outstanding request");
                return;
            };
            match codec::decode_error_rsp(pdu) {
                Ok(err_rsp) => {
                    let _ = req.reply.send(Err(Error::new(ErrorKind::AttError(err_rsp.error_code))));
                }
                Err(err) => {
                    let _ = req.reply.send(Err(err));
                }
            }
        }
        op if outstanding.as_ref().is_some_and(|r| r.expected_opcode == op) => {
            let req = outstanding.take().unwrap();
            let _ = req.reply.send(Ok(pdu.to_vec()));
        }
        _ => {
            log::warn!("dropping PDU with unexpected opcode {opcode:#04x} and no matching outstanding request");
        }
    }
}

fn fail_all(outstanding: Option<PendingRequest>, queue: &mut VecDeque<PendingRequest>, err: Error) {
    if let Some(req) = outstanding {
        let _ = req.reply.send(Err(err.clone()));
    }
    for req in queue.drain(..) {
        let _ = req.reply.send(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every PDU it was asked to send; never fails.
    #[derive(Default)]
    struct FakeSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl PduSink for FakeSink {
        fn send<'a>(&'a self, pdu: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            self.sent.lock().unwrap().push(pdu.to_vec());
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn indication_gets_exactly_one_confirmation_then_dispatches() {
        let sink = FakeSink::default();
        let (tx, mut rx) = mpsc::unbounded();
        let mut handlers = vec![tx];
        let mut outstanding = None;

        let pdu = [codec::OP_HANDLE_VALUE_INDICATION, 0x12, 0x00, 0x77];
        demux(&pdu, &sink, &mut outstanding, &mut handlers).await;

        assert_eq!(*sink.sent.lock().unwrap(), vec![vec![codec::OP_HANDLE_VALUE_CONFIRMATION]]);

        let event = rx.try_next().unwrap().expect("handler receives the indication");
        assert!(event.is_indication);
        assert_eq!(event.handle, 0x0012);
        assert_eq!(event.value, vec![0x77]);
    }

    #[tokio::test]
    async fn notification_is_dispatched_without_a_confirmation() {
        let sink = FakeSink::default();
        let (tx, mut rx) = mpsc::unbounded();
        let mut handlers = vec![tx];
        let mut outstanding = None;

        let pdu = [codec::OP_HANDLE_VALUE_NOTIFICATION, 0x34, 0x00, 0xAA];
        demux(&pdu, &sink, &mut outstanding, &mut handlers).await;

        assert!(sink.sent.lock().unwrap().is_empty(), "notifications are never confirmed, only indications are");
        let event = rx.try_next().unwrap().expect("handler receives the notification");
        assert!(!event.is_indication);
        assert_eq!(event.handle, 0x0034);
    }

    #[tokio::test]
    async fn two_indications_confirm_and_dispatch_in_arrival_order() {
        let sink = FakeSink::default();
        let (tx, mut rx) = mpsc::unbounded();
        let mut handlers = vec![tx];
        let mut outstanding = None;

        demux(&[codec::OP_HANDLE_VALUE_INDICATION, 0x01, 0x00, 0x01], &sink, &mut outstanding, &mut handlers).await;
        demux(&[codec::OP_HANDLE_VALUE_INDICATION, 0x02, 0x00, 0x02], &sink, &mut outstanding, &mut handlers).await;

        assert_eq!(
            *sink.sent.lock().unwrap(),
            vec![vec![codec::OP_HANDLE_VALUE_CONFIRMATION], vec![codec::OP_HANDLE_VALUE_CONFIRMATION]],
            "exactly one confirmation per indication, no more"
        );

        let first = rx.try_next().unwrap().unwrap();
        let second = rx.try_next().unwrap().unwrap();
        assert_eq!((first.handle, second.handle), (0x0001, 0x0002), "dispatch order matches arrival order (FIFO)");
    }

    #[tokio::test]
    async fn dropped_handler_is_pruned_without_affecting_confirmation() {
        let sink = FakeSink::default();
        let (tx, rx) = mpsc::unbounded();
        drop(rx);
        let mut handlers = vec![tx];
        let mut outstanding = None;

        let pdu = [codec::OP_HANDLE_VALUE_INDICATION, 0x12, 0x00, 0x77];
        demux(&pdu, &sink, &mut outstanding, &mut handlers).await;

        assert_eq!(*sink.sent.lock().unwrap(), vec![vec![codec::OP_HANDLE_VALUE_CONFIRMATION]]);
        assert!(handlers.is_empty(), "a handler whose receiver was dropped is pruned from the fan-out list");
    }
}
