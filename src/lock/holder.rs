use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::constants::REQUEST_HOLDER_BIT;
use crate::utils::process::process_alive;
use crate::utils::time::timestamp_millis;

const SLOT_EMPTY: u32 = 0;
const SLOT_READ: u32 = 1;
const SLOT_WRITE_PENDING: u32 = 2;
const SLOT_WRITE: u32 = 3;

const SESSION_BITS: u32 = 40;
const SESSION_MASK: u64 = (1 << SESSION_BITS) - 1;
/// Thread tags fill the bits between the session id and the request bit
const THREAD_TAG_LIMIT: u64 = 1 << (63 - SESSION_BITS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// Identity recorded next to the pid in a holder slot.
///
/// Two acquisitions by the same process are told apart by this id, which is
/// how reentrancy is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

/// Tag of one live thread. Returned to the pool when the thread exits, so
/// no two live threads of a process share a tag.
struct ThreadTag(u64);

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);
static FREE_THREAD_TAGS: Mutex<Vec<u64>> = parking_lot::const_mutex(Vec::new());

impl ThreadTag {
    fn acquire() -> Self {
        if let Some(tag) = FREE_THREAD_TAGS.lock().pop() {
            return Self(tag);
        }
        let next = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
        Self(next % (THREAD_TAG_LIMIT - 1) + 1)
    }
}

impl Drop for ThreadTag {
    fn drop(&mut self) {
        FREE_THREAD_TAGS.lock().push(self.0);
    }
}

thread_local! {
    static THREAD_TAG: ThreadTag = ThreadTag::acquire();
}

/// 0 only while the thread's locals are being torn down
fn thread_tag() -> u64 {
    THREAD_TAG.try_with(|tag| tag.0).unwrap_or(0)
}

impl HolderId {
    /// Holder for calls issued by `session_id` on the current thread.
    pub fn for_session(session_id: u64) -> Self {
        Self((thread_tag() << SESSION_BITS) | (session_id & SESSION_MASK))
    }

    /// Holder for guards that belong to one delivery round rather than to a
    /// session, so callbacks of that round never look reentrant.
    pub fn for_request(request_id: u64) -> Self {
        Self(REQUEST_HOLDER_BIT | request_id)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Diagnostic copy of an occupied holder slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderRecord {
    /// Reader slot index; always 0 for the writer slot
    pub slot: usize,
    pub pid: u32,
    pub holder: u64,
    pub mode: LockMode,
    /// Writer claimed the slot but is still waiting for readers to drain
    pub pending: bool,
    pub acquired_at_ms: u64,
}

/// One holder slot of a shared region. `pid != 0` means the slot is held;
/// the other fields are only meaningful while it is.
#[repr(C)]
pub(crate) struct HolderSlot {
    pid: AtomicU32,
    state: AtomicU32,
    holder: AtomicU64,
    acquired_at_ms: AtomicU64,
}

impl HolderSlot {
    pub(crate) fn is_occupied(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn owned_by(
        &self,
        pid: u32,
        holder: HolderId,
    ) -> bool {
        self.pid.load(Ordering::Acquire) == pid && self.holder.load(Ordering::Acquire) == holder.raw()
    }

    /// Claims a free slot. The pid CAS is the linearization point.
    pub(crate) fn try_claim(
        &self,
        pid: u32,
        mode: LockMode,
        pending: bool,
        holder: HolderId,
    ) -> bool {
        if self
            .pid
            .compare_exchange(0, pid, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.holder.store(holder.raw(), Ordering::Release);
        self.acquired_at_ms.store(timestamp_millis(), Ordering::Release);
        self.state.store(encode_state(mode, pending), Ordering::Release);
        true
    }

    /// Turns a pending writer claim into a held one.
    pub(crate) fn promote(&self) {
        self.state.store(SLOT_WRITE, Ordering::Release);
    }

    /// Frees the slot if it still belongs to `pid`/`holder`.
    pub(crate) fn release(
        &self,
        pid: u32,
        holder: HolderId,
    ) -> bool {
        if !self.owned_by(pid, holder) {
            return false;
        }
        self.clear_fields();
        self.pid.store(0, Ordering::SeqCst);
        true
    }

    /// Frees the slot if its recorded process no longer exists.
    ///
    /// Reclaimers race on a CAS from the dead pid to their own; only the
    /// winner clears the slot, the others see it busy or free and move on.
    pub(crate) fn reclaim_if_dead(
        &self,
        index: usize,
        own_pid: u32,
    ) -> Option<HolderRecord> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 || pid == own_pid || process_alive(pid) {
            return None;
        }
        let record = self.record(index)?;
        if self
            .pid
            .compare_exchange(pid, own_pid, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.clear_fields();
        self.pid.store(0, Ordering::SeqCst);
        Some(HolderRecord { pid, ..record })
    }

    pub(crate) fn record(
        &self,
        index: usize,
    ) -> Option<HolderRecord> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return None;
        }
        let state = self.state.load(Ordering::Acquire);
        Some(HolderRecord {
            slot: index,
            pid,
            holder: self.holder.load(Ordering::Acquire),
            mode: if state == SLOT_READ {
                LockMode::Read
            } else {
                LockMode::Write
            },
            pending: state == SLOT_WRITE_PENDING,
            acquired_at_ms: self.acquired_at_ms.load(Ordering::Acquire),
        })
    }

    fn clear_fields(&self) {
        self.state.store(SLOT_EMPTY, Ordering::Release);
        self.holder.store(0, Ordering::Release);
        self.acquired_at_ms.store(0, Ordering::Release);
    }
}

fn encode_state(
    mode: LockMode,
    pending: bool,
) -> u32 {
    match (mode, pending) {
        (LockMode::Read, _) => SLOT_READ,
        (LockMode::Write, true) => SLOT_WRITE_PENDING,
        (LockMode::Write, false) => SLOT_WRITE,
    }
}
