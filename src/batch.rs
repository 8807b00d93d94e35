//! Op batches: ordered operations submitted together under one tag.
//!
//! Receive operations carry an empty slot that the transport fills before it
//! completes the batch; the submitter reads the slots once the batch comes
//! back in its completion.

use bytes::Bytes;

use crate::{errors::SubmitError, metadata::Metadata, status::Status};

#[derive(Debug)]
pub enum Op {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendCloseFromClient,
    SendStatusFromServer { status: Status, trailers: Metadata },
    RecvInitialMetadata(Option<Metadata>),
    RecvMessage(Option<Bytes>),
    RecvStatusOnClient(Option<(Status, Metadata)>),
    RecvCloseOnServer { cancelled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    SendStatusFromServer,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

/// Which end of a call an op batch is valid on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
    Either,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            Op::SendMessage(_) => OpKind::SendMessage,
            Op::SendCloseFromClient => OpKind::SendCloseFromClient,
            Op::SendStatusFromServer { .. } => OpKind::SendStatusFromServer,
            Op::RecvInitialMetadata(_) => OpKind::RecvInitialMetadata,
            Op::RecvMessage(_) => OpKind::RecvMessage,
            Op::RecvStatusOnClient(_) => OpKind::RecvStatusOnClient,
            Op::RecvCloseOnServer { .. } => OpKind::RecvCloseOnServer,
        }
    }
}

impl OpKind {
    fn side(self) -> Side {
        match self {
            OpKind::SendCloseFromClient
            | OpKind::RecvInitialMetadata
            | OpKind::RecvStatusOnClient => Side::Client,
            OpKind::SendStatusFromServer | OpKind::RecvCloseOnServer => Side::Server,
            OpKind::SendInitialMetadata | OpKind::SendMessage | OpKind::RecvMessage => {
                Side::Either
            }
        }
    }
}

#[derive(Debug)]
pub struct OpBatch {
    ops: Vec<Op>,
    side: Side,
}

impl OpBatch {
    pub fn builder() -> BatchBuilder {
        BatchBuilder::default()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops.iter().any(|op| op.kind() == kind)
    }

    /// Rejects batches that cannot run on the given end of a call.
    pub fn check_side(&self, side: Side) -> Result<(), SubmitError> {
        if self.side == Side::Either || self.side == side {
            Ok(())
        } else {
            Err(SubmitError::InvalidBatch(format!(
                "{:?}-side batch submitted on a {side:?} call",
                self.side
            )))
        }
    }

    pub fn outgoing_metadata(&self) -> Option<&Metadata> {
        self.ops.iter().find_map(|op| match op {
            Op::SendInitialMetadata(metadata) => Some(metadata),
            _ => None,
        })
    }

    pub fn outgoing_message(&self) -> Option<&Bytes> {
        self.ops.iter().find_map(|op| match op {
            Op::SendMessage(message) => Some(message),
            _ => None,
        })
    }

    pub fn outgoing_status(&self) -> Option<(&Status, &Metadata)> {
        self.ops.iter().find_map(|op| match op {
            Op::SendStatusFromServer { status, trailers } => Some((status, trailers)),
            _ => None,
        })
    }

    pub fn received_initial_metadata(&self) -> Option<&Metadata> {
        self.ops.iter().find_map(|op| match op {
            Op::RecvInitialMetadata(metadata) => metadata.as_ref(),
            _ => None,
        })
    }

    pub fn received_status(&self) -> Option<&Status> {
        self.ops.iter().find_map(|op| match op {
            Op::RecvStatusOnClient(Some((status, _))) => Some(status),
            _ => None,
        })
    }

    /// Takes the received message out of the batch.
    pub fn take_message(&mut self) -> Option<Bytes> {
        self.ops.iter_mut().find_map(|op| match op {
            Op::RecvMessage(message) => message.take(),
            _ => None,
        })
    }

    pub fn take_initial_metadata(&mut self) -> Option<Metadata> {
        self.ops.iter_mut().find_map(|op| match op {
            Op::RecvInitialMetadata(metadata) => metadata.take(),
            _ => None,
        })
    }

    pub fn take_trailers(&mut self) -> Option<Metadata> {
        self.ops.iter_mut().find_map(|op| match op {
            Op::RecvStatusOnClient(Some((_, trailers))) => Some(std::mem::take(trailers)),
            _ => None,
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::RecvCloseOnServer { cancelled: true }))
    }

    /// Fills the client receive slots with what the server sent back.
    pub fn fill_client_reply(
        &mut self,
        initial_metadata: Metadata,
        message: Option<Bytes>,
        status: Status,
        trailers: Metadata,
    ) {
        let mut initial_metadata = Some(initial_metadata);
        let mut message = message;
        let mut status = Some((status, trailers));
        for op in &mut self.ops {
            match op {
                Op::RecvInitialMetadata(slot) => *slot = initial_metadata.take(),
                Op::RecvMessage(slot) => *slot = message.take(),
                Op::RecvStatusOnClient(slot) => *slot = status.take(),
                _ => {}
            }
        }
    }

    /// Records a locally generated status, e.g. for a cancelled or failed call.
    pub fn fill_status(&mut self, status: Status) {
        for op in &mut self.ops {
            if let Op::RecvStatusOnClient(slot) = op {
                *slot = Some((status.clone(), Metadata::new()));
            }
        }
    }

    pub fn fill_request_message(&mut self, message: Option<Bytes>) {
        let mut message = message;
        for op in &mut self.ops {
            if let Op::RecvMessage(slot) = op {
                *slot = message.take();
            }
        }
    }

    pub fn fill_close(&mut self, was_cancelled: bool) {
        for op in &mut self.ops {
            if let Op::RecvCloseOnServer { cancelled } = op {
                *cancelled = was_cancelled;
            }
        }
    }
}

/// Assembles an [`OpBatch`]. Each op kind may appear once, and client-only and
/// server-only ops cannot share a batch.
#[derive(Debug, Default)]
pub struct BatchBuilder {
    ops: Vec<Op>,
}

impl BatchBuilder {
    pub fn send_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.ops.push(Op::SendInitialMetadata(metadata));
        self
    }

    pub fn send_message(mut self, message: Bytes) -> Self {
        self.ops.push(Op::SendMessage(message));
        self
    }

    pub fn send_close_from_client(mut self) -> Self {
        self.ops.push(Op::SendCloseFromClient);
        self
    }

    pub fn send_status_from_server(mut self, status: Status, trailers: Metadata) -> Self {
        self.ops.push(Op::SendStatusFromServer { status, trailers });
        self
    }

    pub fn recv_initial_metadata(mut self) -> Self {
        self.ops.push(Op::RecvInitialMetadata(None));
        self
    }

    pub fn recv_message(mut self) -> Self {
        self.ops.push(Op::RecvMessage(None));
        self
    }

    pub fn recv_status_on_client(mut self) -> Self {
        self.ops.push(Op::RecvStatusOnClient(None));
        self
    }

    pub fn recv_close_on_server(mut self) -> Self {
        self.ops.push(Op::RecvCloseOnServer { cancelled: false });
        self
    }

    pub fn build(self) -> Result<OpBatch, SubmitError> {
        if self.ops.is_empty() {
            return Err(SubmitError::InvalidBatch("batch has no operations".to_string()));
        }

        let mut seen = Vec::with_capacity(self.ops.len());
        let mut side = Side::Either;
        for op in &self.ops {
            let kind = op.kind();
            if seen.contains(&kind) {
                return Err(SubmitError::InvalidBatch(format!(
                    "{kind:?} appears more than once"
                )));
            }
            seen.push(kind);

            side = match (side, kind.side()) {
                (Side::Either, op_side) => op_side,
                (current, Side::Either) => current,
                (current, op_side) if current == op_side => current,
                _ => {
                    return Err(SubmitError::InvalidBatch(
                        "client and server operations mixed in one batch".to_string(),
                    ))
                }
            };
        }

        Ok(OpBatch {
            ops: self.ops,
            side,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{OpBatch, OpKind, Side};
    use crate::{errors::SubmitError, metadata::Metadata, status::Status};

    fn unary_client_batch() -> OpBatch {
        OpBatch::builder()
            .send_initial_metadata(Metadata::new())
            .send_message(Bytes::from_static(b"\x01\x02\x03"))
            .send_close_from_client()
            .recv_initial_metadata()
            .recv_message()
            .recv_status_on_client()
            .build()
            .expect("valid client batch")
    }

    #[test]
    fn client_batch_keeps_submission_order() {
        let batch = unary_client_batch();
        let kinds: Vec<OpKind> = batch.ops().iter().map(|op| op.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::SendInitialMetadata,
                OpKind::SendMessage,
                OpKind::SendCloseFromClient,
                OpKind::RecvInitialMetadata,
                OpKind::RecvMessage,
                OpKind::RecvStatusOnClient,
            ]
        );
        assert_eq!(batch.side(), Side::Client);
        assert!(batch.check_side(Side::Server).is_err());
    }

    #[test]
    fn duplicate_and_mixed_operations_are_rejected() {
        let duplicate = OpBatch::builder().recv_message().recv_message().build();
        assert!(matches!(duplicate, Err(SubmitError::InvalidBatch(_))));

        let mixed = OpBatch::builder()
            .send_close_from_client()
            .send_status_from_server(Status::ok(), Metadata::new())
            .build();
        assert!(matches!(mixed, Err(SubmitError::InvalidBatch(_))));

        assert!(OpBatch::builder().build().is_err());
    }

    #[test]
    fn reply_fills_receive_slots() {
        let mut batch = unary_client_batch();
        let mut headers = Metadata::new();
        headers.insert("x-served-by", "test");
        batch.fill_client_reply(
            headers,
            Some(Bytes::from_static(b"pong")),
            Status::ok(),
            Metadata::new(),
        );

        assert!(batch.received_status().expect("status filled").is_ok());
        assert_eq!(
            batch
                .received_initial_metadata()
                .and_then(|md| md.get(b"x-served-by"))
                .map(|v| v.as_ref()),
            Some(&b"test"[..])
        );
        assert_eq!(batch.take_message(), Some(Bytes::from_static(b"pong")));
        assert_eq!(batch.take_message(), None);
    }

    #[test]
    fn server_batch_without_message_is_valid() {
        let batch = OpBatch::builder()
            .recv_close_on_server()
            .send_status_from_server(Status::unimplemented("nope"), Metadata::new())
            .build()
            .expect("valid server batch");
        assert_eq!(batch.side(), Side::Server);
        assert!(batch.outgoing_message().is_none());
        assert!(!batch.was_cancelled());
    }
}
