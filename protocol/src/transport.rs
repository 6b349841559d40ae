//! Boundary to the transaction transport.
//!
//! The transport owns the link to the device: connection management,
//! link-layer framing, retries and timeouts. A client hands it one command
//! frame together with a [`ResponseSink`], and the transport reports every
//! response frame and the end of the transaction through that sink, usually
//! from its own thread or I/O loop.

use crate::{Error, ProtocolError, Result, response::Transaction};
use log::{trace, warn};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

/// Transaction transport used by a [`PeekPoke`](crate::PeekPoke) client.
///
/// Implementations must end every submitted transaction exactly once by
/// calling [`ResponseSink::finish`], after delivering zero or more responses
/// with [`ResponseSink::respond`]. Dropping the sink without finishing
/// fails the transaction.
pub trait Transport {
    /// Transport-specific error reported at the end of a failed transaction.
    type Error: core::error::Error;

    /// Submits a command payload to the device at `address`.
    ///
    /// `protocol` identifies the service the payload is meant for.
    fn submit(
        &mut self,
        address: u8,
        protocol: u16,
        payload: Vec<u8>,
        sink: ResponseSink<Self::Error>,
    );
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn submit(
        &mut self,
        address: u8,
        protocol: u16,
        payload: Vec<u8>,
        sink: ResponseSink<Self::Error>,
    ) {
        (**self).submit(address, protocol, payload, sink);
    }
}

/// Single-use slot shared by the waiting client and the transport.
#[derive(Debug)]
pub(crate) struct Slot<E> {
    txn: Mutex<Transaction<E>>,
    sealed: Condvar,
}

impl<E> Slot<E> {
    pub(crate) fn new(txn: Transaction<E>) -> Arc<Self> {
        Arc::new(Self {
            txn: Mutex::new(txn),
            sealed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Transaction<E>> {
        self.txn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seal(&self, res: Result<(), E>) {
        self.lock().end(res);
        self.sealed.notify_all();
    }

    /// Blocks until the transaction has ended and takes its outcome.
    pub(crate) fn wait(&self) -> Result<Vec<u8>, E> {
        let mut txn = self
            .sealed
            .wait_while(self.lock(), |txn| !txn.is_ended())
            .unwrap_or_else(PoisonError::into_inner);

        txn.take_outcome()
    }
}

/// Receiver for the responses of one transaction.
///
/// Handed to [`Transport::submit`] together with the command payload.
/// Every delivery is validated against the submitted command.
/// Validation failures are recorded for the waiting client and never
/// propagate back into the transport.
#[derive(Debug)]
pub struct ResponseSink<E> {
    slot: Arc<Slot<E>>,
}

impl<E> ResponseSink<E> {
    pub(crate) fn new(slot: Arc<Slot<E>>) -> Self {
        Self { slot }
    }

    /// Delivers a response frame.
    ///
    /// `is_final` must be set for the last response of the transaction.
    pub fn respond(&self, payload: &[u8], is_final: bool) {
        trace!("Response received (final: {is_final}): {payload:02x?}");

        guard(&mut self.slot.lock(), |txn| {
            txn.handle_response(payload, is_final);
        });
    }

    /// Ends the transaction, releasing the waiting client.
    ///
    /// Pass the transport's error if the transaction failed on the link.
    pub fn finish(self, res: core::result::Result<(), E>) {
        self.slot.seal(res.map_err(Error::Transport));
    }
}

impl<E> Drop for ResponseSink<E> {
    fn drop(&mut self) {
        let ended = self.slot.lock().is_ended();

        if !ended {
            warn!("Transport dropped a transaction without ending it");

            self.slot.seal(Err(ProtocolError::Abandoned.into()));
        }
    }
}

/// Runs a step of the transaction, failing it if the step panics.
fn guard<E>(txn: &mut Transaction<E>, step: impl FnOnce(&mut Transaction<E>)) {
    if panic::catch_unwind(AssertUnwindSafe(|| step(txn))).is_err() {
        txn.fail(ProtocolError::HandlerFault.into());
    }
}
