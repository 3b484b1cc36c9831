use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::ProxyError;

const DIVERSION_CHANNEL_CAPACITY: usize = 4;

// Coordinates the response pump with out-of-band writers. Exactly one party
// may hold the slot at a time: a response reservation diverts origin bytes to
// its holder, a suspension drops them while the origin leg is rebuilt.
pub(crate) struct FlowControl {
    pass_through: AtomicBool,
    slot: Arc<Semaphore>,
    diversion: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl FlowControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pass_through: AtomicBool::new(true),
            slot: Arc::new(Semaphore::new(1)),
            diversion: Mutex::new(None),
        })
    }

    pub(crate) fn pass_through(&self) -> bool {
        self.pass_through.load(Ordering::Acquire)
    }

    pub(crate) fn diverted_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.diversion.lock().expect("lock poisoned").clone()
    }

    pub(crate) async fn reserve_response(
        self: &Arc<Self>,
        wait: Option<Duration>,
    ) -> Result<ResponseSlot, ProxyError> {
        let permit = self.acquire_slot(wait).await?;
        let (sender, receiver) = mpsc::channel(DIVERSION_CHANNEL_CAPACITY);
        *self.diversion.lock().expect("lock poisoned") = Some(sender);
        Ok(ResponseSlot {
            control: Arc::clone(self),
            receiver,
            permit: Some(permit),
        })
    }

    pub(crate) async fn suspend(
        self: &Arc<Self>,
        wait: Option<Duration>,
    ) -> Result<SuspendGuard, ProxyError> {
        let permit = self.acquire_slot(wait).await?;
        self.pass_through.store(false, Ordering::Release);
        Ok(SuspendGuard {
            control: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn acquire_slot(&self, wait: Option<Duration>) -> Result<OwnedSemaphorePermit, ProxyError> {
        let acquire = Arc::clone(&self.slot).acquire_owned();
        let acquired = match wait {
            Some(duration) => tokio::time::timeout(duration, acquire)
                .await
                .map_err(|_| ProxyError::GateTimeout)?,
            None => acquire.await,
        };
        acquired.map_err(|_| ProxyError::GateTimeout)
    }

    fn clear_diversion(&self) {
        *self.diversion.lock().expect("lock poisoned") = None;
    }
}

pub(crate) struct ResponseSlot {
    control: Arc<FlowControl>,
    receiver: mpsc::Receiver<Bytes>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ResponseSlot {
    // An empty chunk marks EOF on the origin leg.
    pub(crate) async fn next_chunk(&mut self, wait: Option<Duration>) -> Result<Bytes, ProxyError> {
        let receive = self.receiver.recv();
        let chunk = match wait {
            Some(duration) => tokio::time::timeout(duration, receive)
                .await
                .map_err(|_| ProxyError::GateTimeout)?,
            None => receive.await,
        };
        Ok(chunk.unwrap_or_default())
    }

    pub(crate) fn into_suspension(mut self) -> SuspendGuard {
        self.control.clear_diversion();
        self.control.pass_through.store(false, Ordering::Release);
        let permit = self.permit.take().expect("response slot permit already taken");
        SuspendGuard {
            control: Arc::clone(&self.control),
            _permit: permit,
        }
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        self.control.clear_diversion();
    }
}

pub(crate) struct SuspendGuard {
    control: Arc<FlowControl>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.control.pass_through.store(true, Ordering::Release);
    }
}
