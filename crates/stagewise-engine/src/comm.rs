//! Worker communication used by evaluation and distributed optimizer hooks.
//!
//! Every operation here is a blocking collective: all workers of a group must
//! call it, in the same order, or the group deadlocks.

use crate::error::{EngineError, Result};
use stagewise_abstraction::Value;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

/// Collective operations across the workers of one run.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Rank 0 computes and reports metrics for the whole group.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Collect every worker's values on the coordinator, in rank order.
    ///
    /// Returns `Some` on the coordinator and `None` elsewhere.
    fn gather(&self, values: Vec<Value>) -> Result<Option<Vec<Vec<Value>>>>;

    /// Replace `values` with their element-wise mean across workers.
    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<()>;

    /// Block until every worker reaches the same point.
    fn barrier(&self) -> Result<()>;
}

/// The trivial group of one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn gather(&self, values: Vec<Value>) -> Result<Option<Vec<Vec<Value>>>> {
        Ok(Some(vec![values]))
    }

    fn all_reduce_mean(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    gather_slots: Mutex<Vec<Option<Vec<Value>>>>,
    reduce_slots: Mutex<Vec<Vec<f64>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| EngineError::Communication("worker group state poisoned".to_string()))
}

/// A group of in-process workers, one per thread.
#[derive(Debug)]
pub struct LocalGroup {
    members: Vec<LocalCommunicator>,
}

impl LocalGroup {
    /// Create `world_size` communicators sharing one barrier.
    pub fn new(world_size: usize) -> Self {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            gather_slots: Mutex::new(vec![None; world_size]),
            reduce_slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        let members = (0..world_size)
            .map(|rank| LocalCommunicator { rank, world_size, shared: Arc::clone(&shared) })
            .collect();
        Self { members }
    }

    pub fn into_members(self) -> Vec<LocalCommunicator> {
        self.members
    }
}

/// One worker's handle on a `LocalGroup`.
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn gather(&self, values: Vec<Value>) -> Result<Option<Vec<Vec<Value>>>> {
        // Errors surface only after both barrier rounds so no peer is left waiting.
        let stored = lock(&self.shared.gather_slots).map(|mut slots| {
            slots[self.rank] = Some(values);
        });
        self.shared.barrier.wait();

        let gathered = if self.is_coordinator() {
            lock(&self.shared.gather_slots)
                .map(|mut slots| Some(slots.iter_mut().map(|s| s.take().unwrap_or_default()).collect()))
        } else {
            Ok(None)
        };

        // Slots are reused by the next collective only after the coordinator drained them.
        self.shared.barrier.wait();
        stored?;
        gathered
    }

    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<()> {
        let stored = lock(&self.shared.reduce_slots).map(|mut slots| {
            slots[self.rank] = values.to_vec();
        });
        self.shared.barrier.wait();

        let reduced = lock(&self.shared.reduce_slots).and_then(|slots| {
            if slots.iter().all(|s| s.len() == values.len()) {
                let n = slots.len() as f64;
                Ok((0..values.len())
                    .map(|i| slots.iter().map(|s| s[i]).sum::<f64>() / n)
                    .collect::<Vec<_>>())
            } else {
                Err(EngineError::Communication(
                    "all_reduce_mean called with mismatched lengths".to_string(),
                ))
            }
        });

        self.shared.barrier.wait();
        stored?;
        values.copy_from_slice(&reduced?);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_gather_is_identity() {
        let comm = SingleProcess;
        let gathered = comm.gather(vec![Value::Scalar(1.0)]).unwrap().unwrap();
        assert_eq!(gathered, vec![vec![Value::Scalar(1.0)]]);
        assert!(comm.is_coordinator());
    }

    #[test]
    fn test_local_group_gathers_in_rank_order() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_members()
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank() as f64;
                    comm.gather(vec![Value::Scalar(rank)]).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let gathered = results[0].as_ref().unwrap();
        let ranks: Vec<f64> = gathered.iter().map(|v| v[0].mean()).collect();
        assert_eq!(ranks, vec![0.0, 1.0, 2.0]);
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }

    #[test]
    fn test_local_group_all_reduce_mean() {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_members()
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let mut grads = if comm.rank() == 0 { vec![1.0, 4.0] } else { vec![3.0, 0.0] };
                    comm.all_reduce_mean(&mut grads).unwrap();
                    grads
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![2.0, 2.0]);
        }
    }

    fn die_holding_locks(shared: &Shared) {
        let _gather = shared.gather_slots.lock().unwrap();
        let _reduce = shared.reduce_slots.lock().unwrap();
        panic!("worker died holding the group state");
    }

    #[test]
    fn test_failed_collective_still_meets_its_peers() {
        let members = LocalGroup::new(2).into_members();
        let shared = Arc::clone(&members[0].shared);
        let poisoned = thread::spawn(move || die_holding_locks(&shared)).join();
        assert!(poisoned.is_err());

        let mut members = members.into_iter();
        let (failing, peer) = (members.next().unwrap(), members.next().unwrap());

        // The peer takes part in two barrier rounds per collective and would
        // block forever if the failing worker returned early.
        let peer = thread::spawn(move || {
            for _ in 0..4 {
                peer.barrier().unwrap();
            }
        });

        let gathered = failing.gather(vec![Value::Scalar(1.0)]);
        assert!(matches!(gathered, Err(EngineError::Communication(_))));
        let mut grads = vec![1.0];
        let reduced = failing.all_reduce_mean(&mut grads);
        assert!(matches!(reduced, Err(EngineError::Communication(_))));
        assert_eq!(grads, vec![1.0]);

        peer.join().unwrap();
    }
}
