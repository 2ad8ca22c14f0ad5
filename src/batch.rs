//! Bookkeeping shared by every adapter's batch.
//!
//! `BatchStatus` owns the `Open -> Committed | Closed` state machine and the
//! byte counter. Engines with a native write batch feed it directly and keep
//! only a `BatchStatus`; the rest buffer into `PendingOps` and apply the list
//! under their own atomic primitive.
//!
//! A batch handed out by a closed store starts `Detached`: every call on it
//! fails with `StoreClosed`.

use crate::{check_key, check_value, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Committed,
    Closed,
    Detached,
}

#[derive(Debug)]
pub struct BatchStatus {
    state: State,
    size: usize,
}

impl Default for BatchStatus {
    fn default() -> Self {
        BatchStatus {
            state: State::Open,
            size: 0,
        }
    }
}

impl BatchStatus {
    pub fn detached() -> Self {
        BatchStatus {
            state: State::Detached,
            size: 0,
        }
    }

    /// `Open` for a live store, `Detached` otherwise.
    pub fn for_store(open: bool) -> Self {
        if open {
            BatchStatus::default()
        } else {
            BatchStatus::detached()
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Validates a set and accounts for its bytes. Returns the value to store.
    pub fn record_set<'v>(
        &mut self,
        key: &[u8],
        value: Option<&'v [u8]>,
    ) -> Result<&'v [u8], Error> {
        check_key(key)?;
        let value = check_value(value)?;
        self.ensure_open()?;
        self.size += key.len() + value.len();
        Ok(value)
    }

    pub fn record_delete(&mut self, key: &[u8]) -> Result<(), Error> {
        check_key(key)?;
        self.ensure_open()?;
        self.size += key.len();
        Ok(())
    }

    /// Moves to `Committed`. Happens exactly once, before the engine is asked
    /// to apply anything, so a failed commit still leaves the batch spent.
    pub fn begin_commit(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.state = State::Committed;
        self.size = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.state = State::Closed;
        self.size = 0;
        Ok(())
    }

    pub fn byte_size(&self) -> Result<usize, Error> {
        self.ensure_open()?;
        Ok(self.size)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.state {
            State::Open => Ok(()),
            State::Committed | State::Closed => Err(Error::BatchClosed),
            State::Detached => Err(Error::StoreClosed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered operation list plus its status.
#[derive(Debug, Default)]
pub struct PendingOps {
    ops: Vec<Operation>,
    status: BatchStatus,
}

impl PendingOps {
    pub fn with_capacity(size: usize) -> Self {
        PendingOps {
            ops: Vec::with_capacity(size),
            status: BatchStatus::default(),
        }
    }

    /// A list for a store that is already closed.
    pub fn detached() -> Self {
        PendingOps {
            ops: Vec::new(),
            status: BatchStatus::detached(),
        }
    }

    pub fn for_store(open: bool, size: usize) -> Self {
        if open {
            PendingOps::with_capacity(size)
        } else {
            PendingOps::detached()
        }
    }

    pub fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        let value = self.status.record_set(key, value)?;
        self.ops.push(Operation::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.status.record_delete(key)?;
        self.ops.push(Operation::Delete(key.to_vec()));
        Ok(())
    }

    /// Hands the buffered operations over for application, in insertion order.
    pub fn take(&mut self) -> Result<Vec<Operation>, Error> {
        self.status.begin_commit()?;
        Ok(std::mem::take(&mut self.ops))
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.status.close()?;
        self.ops = Vec::new();
        Ok(())
    }

    pub fn byte_size(&self) -> Result<usize, Error> {
        self.status.byte_size()
    }
}
