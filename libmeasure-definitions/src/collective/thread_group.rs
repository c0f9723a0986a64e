// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{check_root, Collective, CollectiveError, ReduceOp};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A group of ranks living on threads of one process. Every collective is
/// an all-gather round: each rank deposits a buffer, the last arrival
/// publishes the full set, and the next round starts once every rank has
/// picked it up.
#[derive(Debug)]
pub struct ThreadRank {
    rank: usize,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    timeout: Duration,
    state: Mutex<State>,
    turnstile: Condvar,
}

#[derive(Debug)]
struct State {
    generation: u64,
    arrived: usize,
    deposits: Vec<Vec<u8>>,
    published: Option<Arc<[Vec<u8>]>>,
    readers: usize,
    aborted: Option<usize>,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates `size` connected ranks; hand one to each participating thread.
pub fn thread_group(size: usize, timeout: Duration) -> Vec<ThreadRank> {
    let shared = Arc::new(Shared {
        size,
        timeout,
        state: Mutex::new(State {
            generation: 0,
            arrived: 0,
            deposits: vec![Vec::new(); size],
            published: None,
            readers: 0,
            aborted: None,
        }),
        turnstile: Condvar::new(),
    });
    (0..size)
        .map(|rank| ThreadRank {
            rank,
            shared: shared.clone(),
        })
        .collect()
}

impl ThreadRank {
    /// Makes every pending and future collective of the group fail.
    pub fn abort(&self) {
        let mut state = self.shared.state.lock();
        state.aborted = state.aborted.or(Some(self.rank));
        self.shared.turnstile.notify_all();
    }

    fn all_gather(&self, deposit: Vec<u8>) -> Result<Arc<[Vec<u8>]>, CollectiveError> {
        let shared = &*self.shared;
        let deadline = Instant::now() + shared.timeout;
        let mut state = shared.state.lock();

        let fail = |state: &mut State, err: CollectiveError| -> Result<Arc<[Vec<u8>]>, _> {
            state.aborted = state.aborted.or(Some(self.rank));
            shared.turnstile.notify_all();
            Err(err)
        };

        while state.readers > 0 {
            if let Some(rank) = state.aborted {
                return Err(CollectiveError::PeerAborted(rank));
            }
            if shared.turnstile.wait_until(&mut state, deadline).timed_out() {
                return fail(&mut state, CollectiveError::Timeout(shared.timeout));
            }
        }
        if let Some(rank) = state.aborted {
            return Err(CollectiveError::PeerAborted(rank));
        }

        let generation = state.generation;
        state.deposits[self.rank] = deposit;
        state.arrived += 1;
        if state.arrived == shared.size {
            let deposits = std::mem::replace(&mut state.deposits, vec![Vec::new(); shared.size]);
            state.published = Some(Arc::from(deposits));
            state.arrived = 0;
            state.generation += 1;
            state.readers = shared.size;
            shared.turnstile.notify_all();
        } else {
            while state.generation == generation {
                if let Some(rank) = state.aborted {
                    return Err(CollectiveError::PeerAborted(rank));
                }
                if shared.turnstile.wait_until(&mut state, deadline).timed_out()
                    && state.generation == generation
                {
                    return fail(&mut state, CollectiveError::Timeout(shared.timeout));
                }
            }
        }

        let Some(published) = state.published.clone() else {
            return fail(
                &mut state,
                CollectiveError::Transport("round completed without data".into()),
            );
        };
        state.readers -= 1;
        if state.readers == 0 {
            state.published = None;
            shared.turnstile.notify_all();
        }
        Ok(published)
    }
}

impl Collective for ThreadRank {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.all_gather(Vec::new()).map(drop)
    }

    fn broadcast(&self, buffer: &mut Vec<u8>, root: usize) -> Result<(), CollectiveError> {
        check_root(root, self.size())?;
        let deposit = if self.rank == root {
            buffer.clone()
        } else {
            Vec::new()
        };
        let published = self.all_gather(deposit)?;
        if self.rank != root {
            buffer.clone_from(&published[root]);
        }
        Ok(())
    }

    fn gather(&self, buffer: &[u8], root: usize) -> Result<Option<Vec<Vec<u8>>>, CollectiveError> {
        check_root(root, self.size())?;
        let published = self.all_gather(buffer.to_vec())?;
        Ok((self.rank == root).then(|| published.to_vec()))
    }

    fn reduce(
        &self,
        value: u64,
        op: ReduceOp,
        root: usize,
    ) -> Result<Option<u64>, CollectiveError> {
        check_root(root, self.size())?;
        let published = self.all_gather(value.to_le_bytes().to_vec())?;
        if self.rank != root {
            return Ok(None);
        }
        let mut values = published.iter().map(|bytes| {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes.get(..8).unwrap_or(&[0; 8]));
            u64::from_le_bytes(word)
        });
        let first = values.next().unwrap_or_default();
        Ok(Some(values.fold(first, |acc, v| op.apply(acc, v))))
    }
}
