use std::fmt;

use derive_more::{Display, From, Into};
use log::*;
use parking_lot::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
pub struct ConnectionId(pub u64);

pub type OnClose = Box<dyn FnOnce(Option<Error>) + Send>;

/// Reports the end of a flow to its owner exactly once.
///
/// The callback receives the first error that stopped the flow, or `None`
/// for an orderly close. A handler dropped without being closed reports
/// [`Error::Canceled`].
pub struct CloseHandler {
    id: ConnectionId,
    on_close: Mutex<Option<OnClose>>,
}

impl CloseHandler {
    pub fn new<F>(id: ConnectionId, on_close: F) -> Self
    where
        F: FnOnce(Option<Error>) + Send + 'static,
    {
        Self {
            id,
            on_close: Mutex::new(Some(Box::new(on_close))),
        }
    }

    /// Handler that only logs.
    pub fn noop(id: ConnectionId) -> Self {
        Self::new(id, move |err| {
            if let Some(err) = err {
                trace!("connection {} closed: {}", id, err);
            }
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.on_close.lock().is_none()
    }

    /// Later calls are ignored.
    pub fn close(&self, err: Option<Error>) {
        let on_close = self.on_close.lock().take();
        if let Some(on_close) = on_close {
            on_close(err);
        }
    }
}

impl fmt::Debug for CloseHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CloseHandler")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for CloseHandler {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.get_mut().take() {
            debug!("CloseHandler: {} dropped", self.id);
            on_close(Some(Error::Canceled));
        }
    }
}
