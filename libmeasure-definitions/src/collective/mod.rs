// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The inter-process primitives unification needs. Buffers are opaque
//! bytes; the transport (MPI, sockets, shared memory, threads) is up to the
//! implementation.

mod thread_group;

pub use thread_group::*;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("root rank {root} is out of range for a group of {size}")]
    InvalidRoot { root: usize, size: usize },
    #[error("rank {0} aborted the collective group")]
    PeerAborted(usize),
    #[error("timed out after {0:?} waiting for peers")]
    Timeout(Duration),
    #[error("collective transport failed: {0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

pub trait Collective {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), CollectiveError>;

    /// `root` sends `buffer`; every other rank has it replaced by root's.
    fn broadcast(&self, buffer: &mut Vec<u8>, root: usize) -> Result<(), CollectiveError>;

    /// Variable-sized gather. Root receives every rank's buffer in rank
    /// order, other ranks receive `None`.
    fn gather(&self, buffer: &[u8], root: usize) -> Result<Option<Vec<Vec<u8>>>, CollectiveError>;

    /// Root receives the reduction of every rank's value.
    fn reduce(&self, value: u64, op: ReduceOp, root: usize) -> Result<Option<u64>, CollectiveError>;
}

/// The trivial group of one process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

fn check_root(root: usize, size: usize) -> Result<(), CollectiveError> {
    if root < size {
        Ok(())
    } else {
        Err(CollectiveError::InvalidRoot { root, size })
    }
}

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut Vec<u8>, root: usize) -> Result<(), CollectiveError> {
        check_root(root, 1)
    }

    fn gather(&self, buffer: &[u8], root: usize) -> Result<Option<Vec<Vec<u8>>>, CollectiveError> {
        check_root(root, 1)?;
        Ok(Some(vec![buffer.to_vec()]))
    }

    fn reduce(
        &self,
        value: u64,
        _op: ReduceOp,
        root: usize,
    ) -> Result<Option<u64>, CollectiveError> {
        check_root(root, 1)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process() {
        let group = SingleProcess;
        assert_eq!((group.rank(), group.size()), (0, 1));
        group.barrier().unwrap();
        let mut buffer = vec![1, 2, 3];
        group.broadcast(&mut buffer, 0).unwrap();
        assert_eq!(buffer, [1, 2, 3]);
        assert_eq!(group.gather(&[9], 0).unwrap(), Some(vec![vec![9]]));
        assert_eq!(group.reduce(5, ReduceOp::Max, 0).unwrap(), Some(5));
        assert!(matches!(
            group.gather(&[], 1),
            Err(CollectiveError::InvalidRoot { root: 1, size: 1 })
        ));
    }

    #[test]
    fn reduce_ops() {
        assert_eq!(ReduceOp::Sum.apply(2, 3), 5);
        assert_eq!(ReduceOp::Min.apply(2, 3), 2);
        assert_eq!(ReduceOp::Max.apply(2, 3), 3);
    }
}
