//! Thin façade over intra-process (thread-rank) or inter-process (MPI)
//! message passing.
//!
//! Messages are contiguous byte slices; all handles are waitable. The
//! collective helpers in [`collective`] post every receive before any send
//! and drain every handle before returning, so a backend only has to deliver
//! matched point-to-point messages.
//!
//! Tags: every collective call consumes tags from the per-rank [`next_tag`]
//! counter. Participating ranks must issue collectives in the same order, so
//! the counters stay aligned without any coordination; a mismatch deadlocks,
//! which is the documented contract for collective misuse.
//!
//! [`next_tag`]: Communicator::next_tag

pub mod collective;

use std::sync::atomic::{AtomicU16, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use dashmap::DashMap;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// This process's rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of participating processes.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Next tag in this rank's collective sequence.
    fn next_tag(&self) -> u16;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Serial communicator for single-rank runs.
///
/// Unlike a silent no-op, any point-to-point call panics: single-rank code
/// paths are required to issue no communication at all, and this makes that
/// requirement observable in tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, peer: usize, _tag: u16, _buf: &[u8]) -> Self::SendHandle {
        panic!("NoComm cannot send to rank {peer}: serial paths must not communicate")
    }

    fn irecv(&self, peer: usize, _tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        panic!("NoComm cannot receive from rank {peer}: serial paths must not communicate")
    }

    fn next_tag(&self) -> u16 {
        0
    }
}

// --- RayonComm: intra-process, one simulated rank per thread ---

type Key = (usize, usize, u16); // (src, dst, tag)

/// Handle for an in-flight `RayonComm` receive.
pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock().unwrap();
        guard.take()
    }
}

/// Intra-process communicator: each rank is a thread, messages travel through
/// a mailbox shared by the world.
///
/// The mailbox is per-world rather than process-global so that independently
/// constructed worlds (e.g. concurrently running tests) cannot observe each
/// other's traffic.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<DashMap<Key, Bytes>>,
    tag: Arc<AtomicU16>,
}

impl RayonComm {
    /// Create a `size`-rank world; element `r` of the result is rank `r`'s
    /// communicator. Hand each one to its own thread.
    pub fn world(size: usize) -> Vec<RayonComm> {
        assert!(size > 0, "world size must be positive");
        let mailbox = Arc::new(DashMap::new());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                tag: Arc::new(AtomicU16::new(0)),
            })
            .collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.mailbox.insert(key, Bytes::from(buf.to_vec()));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        let mailbox = Arc::clone(&self.mailbox);
        let slot = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let buf_len = buf.len();
        let handle = std::thread::spawn(move || loop {
            if let Some(bytes) = mailbox.remove(&key).map(|(_, v)| v) {
                let mut guard = slot_clone.lock().unwrap();
                *guard = Some(bytes[..buf_len].to_vec());
                break;
            }
            std::thread::yield_now();
        });
        LocalHandle {
            buf: slot,
            handle: Some(handle),
        }
    }

    fn next_tag(&self) -> u16 {
        self.tag.fetch_add(1, Relaxed)
    }
}

// --- MPI backend (feature = "mpi-support") ---

#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::request::{Request, StaticScope};
    use mpi::traits::*;
    use std::sync::atomic::{AtomicU16, Ordering::Relaxed};

    /// Inter-process communicator over MPI.
    ///
    /// Both directions post immediate (non-blocking) operations; the request
    /// and its owned buffer travel in the handle until `wait`. The collective
    /// helpers can therefore post every send with no receive drained yet
    /// without risking a rendezvous deadlock.
    pub struct MpiComm {
        _universe: mpi::environment::Universe,
        world: mpi::topology::SimpleCommunicator,
        rank: usize,
        size: usize,
        tag: AtomicU16,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let universe = mpi::initialize().expect("MPI initialization failed");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
                tag: AtomicU16::new(0),
            }
        }
    }

    /// In-flight immediate send; the boxed payload outlives the request.
    pub struct MpiSendHandle {
        req: Request<'static, [u8]>,
        _buf: Box<[u8]>,
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            None
        }
    }

    /// In-flight immediate receive into a handle-owned buffer.
    pub struct MpiRecvHandle {
        req: Request<'static, [u8]>,
        buf: Box<[u8]>,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            Some(self.buf.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            let buf: Box<[u8]> = buf.to_vec().into_boxed_slice();
            // The payload is owned by the handle and not touched again until
            // the request completes, so the detached lifetime is sound.
            let payload: &'static [u8] = unsafe { &*(buf.as_ref() as *const [u8]) };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, payload, i32::from(tag));
            MpiSendHandle { req, _buf: buf }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
            let mut owned: Box<[u8]> = vec![0u8; buf.len()].into_boxed_slice();
            let slot: &'static mut [u8] = unsafe { &mut *(owned.as_mut() as *mut [u8]) };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slot, i32::from(tag));
            MpiRecvHandle { req, buf: owned }
        }

        fn next_tag(&self) -> u16 {
            self.tag.fetch_add(1, Relaxed)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_roundtrip_two_ranks() {
        let world = RayonComm::world(2);
        let comm0 = world[0].clone();
        let comm1 = world[1].clone();

        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);
        comm0.isend(1, 7, &[1, 2, 3, 4]);

        let data = recv_handle.wait().expect("expected data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn worlds_are_isolated() {
        let a = RayonComm::world(2);
        let b = RayonComm::world(2);
        a[0].isend(1, 3, &[9]);

        // The message sits in world a's mailbox; world b must not see it.
        let mut buf = [0u8; 1];
        let handle = b[1].irecv(0, 3, &mut buf);
        b[0].isend(1, 3, &[5]);
        assert_eq!(handle.wait().as_deref(), Some(&[5][..]));

        let mut buf_a = [0u8; 1];
        let handle_a = a[1].irecv(0, 3, &mut buf_a);
        assert_eq!(handle_a.wait().as_deref(), Some(&[9][..]));
    }

    #[test]
    #[should_panic(expected = "serial paths must not communicate")]
    fn nocomm_refuses_to_send() {
        NoComm.isend(0, 0, &[1]);
    }
}
