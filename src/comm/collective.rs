//! Collective operations built generically over [`Communicator`].
//!
//! Everything here follows the same discipline: post every receive first,
//! then every send, then drain all handles before returning. Combined with
//! per-call tags from [`Communicator::next_tag`] this makes each collective a
//! synchronous, self-contained round; ranks must call collectives in the same
//! order or the exchange deadlocks, which is the documented failure mode for
//! collective misuse.
//!
//! Data is moved as fixed-width POD records cast to bytes with `bytemuck`.

use bytemuck::Pod;
use log::trace;

use crate::comm::{Communicator, Wait};
use crate::error::MeshWeldError;

fn comm_error(neighbor: usize, reason: impl Into<String>) -> MeshWeldError {
    MeshWeldError::CommError {
        neighbor,
        reason: reason.into(),
    }
}

/// Variable-count all-to-all: `sends[r]` goes to rank `r`; the result's
/// element `r` holds the records received from rank `r`.
///
/// Two stages: an 8-byte count to every peer, then the data itself. Zero-count
/// messages are elided in the data stage, so an all-empty exchange still
/// completes without posting zero-length messages.
pub fn alltoallv<C, T>(comm: &C, sends: &[Vec<T>]) -> Result<Vec<Vec<T>>, MeshWeldError>
where
    C: Communicator,
    T: Pod,
{
    let p = comm.size();
    let me = comm.rank();
    assert_eq!(sends.len(), p, "one send list per rank");
    if p == 1 {
        return Ok(vec![sends[0].clone()]);
    }
    let count_tag = comm.next_tag();
    let data_tag = comm.next_tag();
    trace!(
        "alltoallv rank {me}/{p}: {} records out, tags ({count_tag}, {data_tag})",
        sends.iter().map(Vec::len).sum::<usize>()
    );

    // Stage 1: counts. Post all receives, then all sends, then drain.
    let mut count_recvs = Vec::with_capacity(p - 1);
    let mut count_buf = [0u8; 8];
    for peer in (0..p).filter(|&r| r != me) {
        let h = comm.irecv(peer, count_tag, &mut count_buf);
        count_recvs.push((peer, h));
    }
    let mut count_sends = Vec::with_capacity(p - 1);
    for peer in (0..p).filter(|&r| r != me) {
        let n = sends[peer].len() as u64;
        count_sends.push(comm.isend(peer, count_tag, &n.to_le_bytes()));
    }
    let mut recv_counts = vec![0usize; p];
    recv_counts[me] = sends[me].len();
    for (peer, h) in count_recvs {
        let data = h
            .wait()
            .ok_or_else(|| comm_error(peer, "count receive returned no data"))?;
        let bytes: [u8; 8] = data
            .as_slice()
            .try_into()
            .map_err(|_| comm_error(peer, format!("count header of {} bytes", data.len())))?;
        recv_counts[peer] = u64::from_le_bytes(bytes) as usize;
    }
    for h in count_sends {
        let _ = h.wait();
    }

    // Stage 2: data, sized by stage 1.
    let mut out: Vec<Vec<T>> = recv_counts
        .iter()
        .map(|&n| vec![T::zeroed(); n])
        .collect();
    let mut data_recvs = Vec::new();
    for peer in (0..p).filter(|&r| r != me) {
        if recv_counts[peer] == 0 {
            continue;
        }
        let buf = bytemuck::cast_slice_mut::<T, u8>(&mut out[peer]);
        let h = comm.irecv(peer, data_tag, buf);
        data_recvs.push((peer, h));
    }
    let mut data_sends = Vec::new();
    for peer in (0..p).filter(|&r| r != me) {
        if sends[peer].is_empty() {
            continue;
        }
        data_sends.push(comm.isend(peer, data_tag, bytemuck::cast_slice(&sends[peer])));
    }
    out[me] = sends[me].clone();
    for (peer, h) in data_recvs {
        let data = h
            .wait()
            .ok_or_else(|| comm_error(peer, "data receive returned no data"))?;
        let buf = bytemuck::cast_slice_mut::<T, u8>(&mut out[peer]);
        if data.len() != buf.len() {
            return Err(comm_error(
                peer,
                format!("expected {} payload bytes, got {}", buf.len(), data.len()),
            ));
        }
        buf.copy_from_slice(&data);
    }
    for h in data_sends {
        let _ = h.wait();
    }
    Ok(out)
}

/// Gather one record from every rank; result is indexed by rank.
pub fn allgather<C, T>(comm: &C, value: T) -> Result<Vec<T>, MeshWeldError>
where
    C: Communicator,
    T: Pod,
{
    let p = comm.size();
    let sends: Vec<Vec<T>> = (0..p).map(|_| vec![value]).collect();
    let recvd = alltoallv(comm, &sends)?;
    Ok(recvd.into_iter().map(|mut v| v.remove(0)).collect())
}

/// Logical AND over all ranks.
pub fn reduce_and<C: Communicator>(comm: &C, local: bool) -> Result<bool, MeshWeldError> {
    let flags = allgather(comm, u8::from(local))?;
    Ok(flags.iter().all(|&f| f != 0))
}

/// Maximum over all ranks.
pub fn allreduce_max<C: Communicator>(comm: &C, local: u64) -> Result<u64, MeshWeldError> {
    let values = allgather(comm, local)?;
    Ok(values.into_iter().max().unwrap_or(0))
}

/// Exclusive prefix sum over per-rank counts: the sum of `local` on all ranks
/// below this one.
pub fn exscan_sum<C: Communicator>(comm: &C, local: u64) -> Result<u64, MeshWeldError> {
    let counts = allgather(comm, local)?;
    Ok(counts[..comm.rank()].iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{NoComm, RayonComm};
    use serial_test::serial;

    fn spawn_world<F>(size: usize, f: F) -> Vec<std::thread::JoinHandle<()>>
    where
        F: Fn(RayonComm) + Send + Sync + Clone + 'static,
    {
        RayonComm::world(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect()
    }

    #[test]
    fn serial_alltoallv_is_identity() {
        let out = alltoallv(&NoComm, &[vec![1u64, 2, 3]]).unwrap();
        assert_eq!(out, vec![vec![1, 2, 3]]);
    }

    #[test]
    #[serial]
    fn alltoallv_three_ranks() {
        let handles = spawn_world(3, |comm| {
            let me = comm.rank() as u64;
            // Rank r sends [r*10 + peer] to each peer.
            let sends: Vec<Vec<u64>> = (0..3).map(|peer| vec![me * 10 + peer as u64]).collect();
            let recvd = alltoallv(&comm, &sends).unwrap();
            for peer in 0..3u64 {
                assert_eq!(recvd[peer as usize], vec![peer * 10 + me]);
            }
        });
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn empty_exchange_completes() {
        let handles = spawn_world(2, |comm| {
            let sends: Vec<Vec<u64>> = vec![Vec::new(), Vec::new()];
            let recvd = alltoallv(&comm, &sends).unwrap();
            assert!(recvd.iter().all(Vec::is_empty));
        });
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn reductions_and_scans() {
        let handles = spawn_world(3, |comm| {
            let me = comm.rank() as u64;
            assert_eq!(allgather(&comm, me).unwrap(), vec![0, 1, 2]);
            assert_eq!(allreduce_max(&comm, me * 5).unwrap(), 10);
            assert_eq!(exscan_sum(&comm, me + 1).unwrap(), (1..=me).sum::<u64>());
            assert!(reduce_and(&comm, true).unwrap());
            assert!(!reduce_and(&comm, me != 1).unwrap());
        });
        for h in handles {
            h.join().unwrap();
        }
    }
}
