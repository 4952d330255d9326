// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer groups: pools of reference-counted memory buffers.
//!
//! A [`BufferGroup`] is configured through a staged `buf_grp_cfg` object and
//! frozen by [`BufferGroup::setup`]. Buffers are handed out as [`BufRef`]s.
//! When the last reference of a buffer goes away it returns to the group's
//! unused list for reuse. Once the group is torn down, buffers that are still
//! referenced are destroyed by the authority chosen by the group's
//! [`ReleasePolicy`] when their last reference is released.
//!
//! Buffer life cycle:
//!
//! ```text
//! None -> Init -> InitToUsed -> Used <-> Unused
//!                                 |        |
//!                                 v        v
//!                          UsedToDeinit -> DeinitAtGrp | DeinitAtSrv
//! ```

use crate::{
    error::{Error, Result},
    object::Obj,
    registry::Registry,
    schemas::{KmppBufCfg, KmppBufGrpCfg},
};
use dma_buf::{DmaBuf, MappedDmaBuf};
use dma_heap::{Heap, HeapKind};
use libc::dup;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, info, warn};

/// Group names are limited to 63 bytes plus terminator.
pub const BUF_GRP_NAME_MAX: usize = 64;

fn dma_error(what: &str, e: impl fmt::Display) -> Error {
    Error::Io(std::io::Error::other(format!("dma buf {what}: {e}")))
}

/// CPU mapping of a DMA buffer, held for the life of its [`Memory`].
struct DmaMapping(MappedDmaBuf);

// SAFETY: the mapping is owned by a single Memory and only touched under its
// lock, so moving it between threads is sound.
unsafe impl Send for DmaMapping {}

/// Memory behind one buffer.
pub enum Memory {
    /// DMA buffer file descriptor with its CPU mapping.
    Dma {
        fd: OwnedFd,
        map: Mutex<DmaMapping>,
        size: usize,
    },
    /// Plain process memory.
    Host(Mutex<Vec<u8>>),
}

impl Memory {
    /// Wraps a DMA buffer allocated elsewhere and maps it once.
    pub fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        let raw = unsafe { dup(fd.as_raw_fd()) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let dma = unsafe { DmaBuf::from_raw_fd(raw) };
        let map = dma.memory_map().map_err(|e| dma_error("map", e))?;
        Ok(Memory::Dma {
            fd,
            map: Mutex::new(DmaMapping(map)),
            size,
        })
    }

    pub fn host(size: usize) -> Self {
        Memory::Host(Mutex::new(vec![0u8; size]))
    }

    pub fn size(&self) -> usize {
        match self {
            Memory::Dma { size, .. } => *size,
            Memory::Host(block) => block.lock().len(),
        }
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Memory::Dma { fd, .. } => Some(fd.as_fd()),
            Memory::Host(_) => None,
        }
    }

    /// File descriptor number, `-1` for host memory.
    pub fn raw_fd(&self) -> i32 {
        self.fd().map_or(-1, |fd| fd.as_raw_fd())
    }

    fn range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.size() {
            return Err(Error::state(format!(
                "buffer access {offset}+{len} beyond {}",
                self.size()
            )));
        }
        Ok(())
    }

    /// Reads `out.len()` bytes at `offset`. DMA reads are bracketed by the
    /// mapping's cache sync.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.range(offset, out.len())?;
        let end = offset + out.len();
        match self {
            Memory::Dma { map, .. } => {
                let bytes = map
                    .lock()
                    .0
                    .read(
                        |pix, _: Option<()>| match pix.get(offset..end) {
                            Some(src) => Ok(src.to_vec()),
                            None => Err("mapping shorter than buffer".into()),
                        },
                        None,
                    )
                    .map_err(|e| dma_error("read", e))?;
                out.copy_from_slice(&bytes);
            }
            Memory::Host(block) => {
                out.copy_from_slice(&block.lock()[offset..end]);
            }
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.range(offset, data.len())?;
        let end = offset + data.len();
        match self {
            Memory::Dma { map, .. } => map
                .lock()
                .0
                .write(
                    |pix, _: Option<()>| match pix.get_mut(offset..end) {
                        Some(dst) => {
                            dst.copy_from_slice(data);
                            Ok(())
                        }
                        None => Err("mapping shorter than buffer".into()),
                    },
                    None,
                )
                .map_err(|e| dma_error("write", e))?,
            Memory::Host(block) => {
                block.lock()[offset..end].copy_from_slice(data);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Memory::Dma { fd, size, .. } => f
                .debug_struct("Dma")
                .field("fd", &fd.as_raw_fd())
                .field("size", size)
                .finish(),
            Memory::Host(block) => f.debug_struct("Host").field("size", &block.lock().len()).finish(),
        }
    }
}

/// Physical memory provider used by a group.
pub trait Allocator: Send + Sync {
    fn name(&self) -> &str;

    fn alloc(&self, size: usize) -> Result<Memory>;

    fn free(&self, memory: Memory) -> Result<()> {
        drop(memory);
        Ok(())
    }
}

/// Allocates from a Linux DMA heap.
pub struct DmaHeapAllocator {
    heap: Heap,
    name: String,
}

impl DmaHeapAllocator {
    pub fn new(kind: HeapKind, name: &str) -> Result<Self> {
        let name = name.to_owned();
        let heap = Heap::new(kind)
            .map_err(|e| Error::Io(std::io::Error::other(format!("dma heap {name}: {e}"))))?;
        Ok(Self { heap, name })
    }

    pub fn cma() -> Result<Self> {
        Self::new(HeapKind::Cma, "cma")
    }

    pub fn system() -> Result<Self> {
        Self::new(HeapKind::System, "system")
    }
}

impl Allocator for DmaHeapAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, size: usize) -> Result<Memory> {
        let fd = self.heap.allocate(size).map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "dma heap {} allocate {size}: {e}",
                self.name
            )))
        })?;
        Memory::from_fd(fd, size)
    }
}

/// Allocates plain process memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl Allocator for HostAllocator {
    fn name(&self) -> &str {
        "host"
    }

    fn alloc(&self, size: usize) -> Result<Memory> {
        Ok(Memory::host(size))
    }
}

/// Buffer life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum BufState {
    None = 0,
    Init = 1,
    InitToUsed = 2,
    Used = 3,
    Unused = 4,
    UsedToDeinit = 5,
    DeinitAtGrp = 6,
    DeinitAtSrv = 7,
}

impl BufState {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => BufState::None,
            1 => BufState::Init,
            2 => BufState::InitToUsed,
            3 => BufState::Used,
            4 => BufState::Unused,
            5 => BufState::UsedToDeinit,
            6 => BufState::DeinitAtGrp,
            7 => BufState::DeinitAtSrv,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BufState::None => "none",
            BufState::Init => "init",
            BufState::InitToUsed => "init_to_used",
            BufState::Used => "used",
            BufState::Unused => "unused",
            BufState::UsedToDeinit => "used_to_deinit",
            BufState::DeinitAtGrp => "deinit_at_grp",
            BufState::DeinitAtSrv => "deinit_at_srv",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BufState::DeinitAtGrp | BufState::DeinitAtSrv)
    }

    /// Edges of the life cycle graph in the module docs.
    pub fn can_move_to(self, next: BufState) -> bool {
        use BufState::*;
        matches!(
            (self, next),
            (None, Init)
                | (Init, InitToUsed)
                | (InitToUsed, Used)
                | (Used, Unused)
                | (Unused, Used)
                | (Used, UsedToDeinit)
                | (Unused, UsedToDeinit)
                | (Unused, DeinitAtGrp)
                | (Unused, DeinitAtSrv)
                | (UsedToDeinit, DeinitAtGrp)
                | (UsedToDeinit, DeinitAtSrv)
        )
    }
}

impl fmt::Display for BufState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group allocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferMode {
    /// The group allocates its buffers on demand.
    Internal = 0,
    /// Buffers are created by the server and imported.
    External = 1,
}

impl BufferMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BufferMode::Internal),
            1 => Some(BufferMode::External),
            _ => None,
        }
    }
}

/// Side holding or releasing a buffer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Authority {
    Group,
    Server,
}

impl Authority {
    fn terminal(self) -> BufState {
        match self {
            Authority::Group => BufState::DeinitAtGrp,
            Authority::Server => BufState::DeinitAtSrv,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Authority::Group => 1,
            Authority::Server => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Authority::Group),
            2 => Some(Authority::Server),
            _ => None,
        }
    }
}

/// Decides which authority destroys a buffer of a torn down group.
pub trait ReleasePolicy: Send + Sync {
    /// `creator` made the buffer, `releaser` dropped its last reference.
    fn owner(&self, creator: Authority, releaser: Authority) -> Authority;
}

/// Only the creating side destroys a buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreatorReleases;

impl ReleasePolicy for CreatorReleases {
    fn owner(&self, creator: Authority, _releaser: Authority) -> Authority {
        creator
    }
}

static NEXT_GRP_ID: AtomicI32 = AtomicI32::new(1);
static NEXT_BUF_UID: AtomicI32 = AtomicI32::new(1);

struct BufferInner {
    index: usize,
    uid: i32,
    creator: Authority,
    state: AtomicU32,
    refs: AtomicU32,
    destroyed_by: AtomicU8,
    memory: Mutex<Option<Memory>>,
    size: usize,
    cfg: Obj,
    group: Weak<GroupInner>,
}

impl BufferInner {
    fn state(&self) -> BufState {
        BufState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(BufState::None)
    }

    fn transition(&self, from: BufState, to: BufState) -> Result<()> {
        if !from.can_move_to(to) {
            return Err(Error::state(format!(
                "buffer {} can not move {from} -> {to}",
                self.uid
            )));
        }
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|cur| {
                Error::state(format!(
                    "buffer {} is {} not {from}",
                    self.uid,
                    BufState::from_u32(cur).unwrap_or(BufState::None)
                ))
            })?;
        debug!("buffer {} {from} -> {to}", self.uid);
        Ok(())
    }

    fn with_memory<R>(&self, f: impl FnOnce(&Memory) -> Result<R>) -> Result<R> {
        match self.memory.lock().as_ref() {
            Some(memory) => f(memory),
            None => Err(Error::state(format!("buffer {} destroyed", self.uid))),
        }
    }

    /// Terminal transition. Returns false if another path got there first.
    fn destroy(&self, authority: Authority) -> bool {
        let from = self.state();
        if !matches!(from, BufState::Unused | BufState::UsedToDeinit) {
            return false;
        }
        if self.transition(from, authority.terminal()).is_err() {
            return false;
        }
        self.destroyed_by.store(authority.tag(), Ordering::Release);
        true
    }
}

/// Snapshot of group counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub count: usize,
    pub used: usize,
    pub unused: usize,
    pub deferred: usize,
    pub destroyed_at_grp: usize,
    pub destroyed_at_srv: usize,
}

struct GroupState {
    id: i32,
    name: String,
    ready: bool,
    finalizing: bool,
    mode: BufferMode,
    count: usize,
    size: usize,
    slots: Vec<Option<Arc<BufferInner>>>,
    used: BTreeSet<usize>,
    unused: BTreeSet<usize>,
    deferred: VecDeque<(usize, Authority)>,
    allocator: Arc<dyn Allocator>,
    policy: Arc<dyn ReleasePolicy>,
    destroyed_at_grp: usize,
    destroyed_at_srv: usize,
}

impl GroupState {
    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn stats(&self) -> GroupStats {
        GroupStats {
            count: self.live(),
            used: self.used.len(),
            unused: self.unused.len(),
            deferred: self.deferred.len(),
            destroyed_at_grp: self.destroyed_at_grp,
            destroyed_at_srv: self.destroyed_at_srv,
        }
    }

    fn finalize(&mut self, idx: usize, authority: Authority) -> Result<bool> {
        let Some(buf) = self.slots.get(idx).cloned().flatten() else {
            return Ok(false);
        };
        if !buf.destroy(authority) {
            return Ok(false);
        }
        self.used.remove(&idx);
        self.unused.remove(&idx);
        self.slots[idx] = None;
        match authority {
            Authority::Group => self.destroyed_at_grp += 1,
            Authority::Server => self.destroyed_at_srv += 1,
        }
        let memory = buf.memory.lock().take();
        if let Some(memory) = memory {
            self.allocator.free(memory)?;
        }
        debug!("group {} buffer {} destroyed by {:?}", self.id, buf.uid, authority);
        Ok(true)
    }

    /// Completes destructions deferred to `authority`.
    fn drain(&mut self, authority: Authority) -> Result<usize> {
        let (mine, rest): (VecDeque<_>, VecDeque<_>) =
            self.deferred.drain(..).partition(|(_, owner)| *owner == authority);
        self.deferred = rest;
        let mut done = 0;
        for (idx, owner) in mine {
            if self.finalize(idx, owner)? {
                done += 1;
            }
        }
        Ok(done)
    }

    fn dec_ref(&mut self, buf: &Arc<BufferInner>, releaser: Authority) -> Result<()> {
        let prev = buf
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map_err(|_| Error::state(format!("buffer {} over released", buf.uid)))?;
        if prev == 1 {
            match buf.state() {
                BufState::Used => {
                    buf.transition(BufState::Used, BufState::Unused)?;
                    self.used.remove(&buf.index);
                    self.unused.insert(buf.index);
                }
                BufState::UsedToDeinit => {
                    let owner = self.policy.owner(buf.creator, releaser);
                    if owner == releaser {
                        self.finalize(buf.index, owner)?;
                    } else {
                        debug!(
                            "group {} buffer {} released by {:?}, deferred to {:?}",
                            self.id, buf.uid, releaser, owner
                        );
                        self.deferred.push_back((buf.index, owner));
                    }
                }
                state => {
                    return Err(Error::state(format!(
                        "buffer {} released in state {state}",
                        buf.uid
                    )))
                }
            }
        }
        if self.finalizing {
            self.drain(releaser)?;
        }
        Ok(())
    }
}

struct GroupInner {
    state: Mutex<GroupState>,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        // last chance for destructions still waiting on their owner
        let state = self.state.get_mut();
        let pending: Vec<(usize, Authority)> = state.deferred.drain(..).collect();
        for (idx, owner) in pending {
            if let Err(e) = state.finalize(idx, owner) {
                warn!("group {} final release failed: {e}", state.id);
            }
        }
        debug!("group {} released", state.id);
    }
}

/// A counted reference to one buffer.
pub struct BufRef {
    buf: Arc<BufferInner>,
    group: Option<Arc<GroupInner>>,
    authority: Authority,
    released: bool,
}

impl BufRef {
    /// Wraps memory in a buffer that belongs to no group.
    pub fn standalone(registry: &Registry, memory: Memory, authority: Authority) -> Result<Self> {
        let cfg_def = KmppBufCfg::register(registry)?;
        let cfg = cfg_def.get_local()?;
        let uid = NEXT_BUF_UID.fetch_add(1, Ordering::Relaxed);
        let size = memory.size();
        cfg_def.set_size(&cfg, size as u32)?;
        cfg_def.set_fd(&cfg, memory.raw_fd())?;
        cfg_def.set_buf_uid(&cfg, uid)?;
        cfg_def.set_grp_id(&cfg, -1)?;

        let buf = Arc::new(BufferInner {
            index: 0,
            uid,
            creator: authority,
            state: AtomicU32::new(BufState::Init as u32),
            refs: AtomicU32::new(1),
            destroyed_by: AtomicU8::new(0),
            memory: Mutex::new(Some(memory)),
            size,
            cfg,
            group: Weak::new(),
        });
        buf.transition(BufState::Init, BufState::InitToUsed)?;
        buf.transition(BufState::InitToUsed, BufState::Used)?;
        Ok(Self {
            buf,
            group: None,
            authority,
            released: false,
        })
    }

    pub fn index(&self) -> usize {
        self.buf.index
    }

    pub fn uid(&self) -> i32 {
        self.buf.uid
    }

    pub fn size(&self) -> usize {
        self.buf.size
    }

    pub fn state(&self) -> BufState {
        self.buf.state()
    }

    pub fn refs(&self) -> u32 {
        self.buf.refs.load(Ordering::Acquire)
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn creator(&self) -> Authority {
        self.buf.creator
    }

    /// The buffer's `buf_cfg` object.
    pub fn cfg(&self) -> &Obj {
        &self.buf.cfg
    }

    pub fn has_group(&self) -> bool {
        self.buf.group.upgrade().is_some()
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.buf.with_memory(|m| m.read(offset, out))
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.buf.with_memory(|m| m.write(offset, data))
    }

    pub fn raw_fd(&self) -> Result<i32> {
        self.buf.with_memory(|m| Ok(m.raw_fd()))
    }

    /// DMA file descriptor as carried in frame metadata, `None` for host
    /// memory.
    pub fn dma_fd(&self) -> Result<Option<u32>> {
        Ok(u32::try_from(self.raw_fd()?).ok())
    }

    /// A new reference held by `authority`.
    pub fn inc_ref(&self, authority: Authority) -> Result<BufRef> {
        self.buf
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_add(1))
            .map_err(|_| Error::exhausted(format!("buffer {} reference count", self.buf.uid)))?;
        Ok(BufRef {
            buf: self.buf.clone(),
            group: self.group.clone(),
            authority,
            released: false,
        })
    }

    /// Observer that does not hold a reference.
    pub fn watch(&self) -> BufWatch {
        BufWatch(self.buf.clone())
    }

    /// Drops this reference, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.dec_ref()
    }

    fn dec_ref(&self) -> Result<()> {
        match &self.group {
            Some(group) => group.state.lock().dec_ref(&self.buf, self.authority),
            None => {
                let prev = self.buf.refs.fetch_sub(1, Ordering::AcqRel);
                if prev != 1 {
                    return Ok(());
                }
                self.buf.transition(BufState::Used, BufState::UsedToDeinit)?;
                if self.buf.destroy(self.buf.creator) {
                    let memory = self.buf.memory.lock().take();
                    drop(memory);
                }
                Ok(())
            }
        }
    }
}

impl Drop for BufRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.dec_ref() {
            warn!("buffer {} release failed: {e}", self.buf.uid);
        }
    }
}

impl fmt::Debug for BufRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufRef")
            .field("uid", &self.buf.uid)
            .field("index", &self.buf.index)
            .field("state", &self.state())
            .field("refs", &self.refs())
            .field("authority", &self.authority)
            .finish()
    }
}

/// Observes a buffer without keeping it referenced.
#[derive(Clone)]
pub struct BufWatch(Arc<BufferInner>);

impl BufWatch {
    pub fn state(&self) -> BufState {
        self.0.state()
    }

    pub fn refs(&self) -> u32 {
        self.0.refs.load(Ordering::Acquire)
    }

    /// Authority that destroyed the buffer, if it is destroyed.
    pub fn destroyed_by(&self) -> Option<Authority> {
        Authority::from_tag(self.0.destroyed_by.load(Ordering::Acquire))
    }
}

/// A pool of buffers with a staged configuration.
pub struct BufferGroup {
    inner: Arc<GroupInner>,
    cfg_def: KmppBufGrpCfg,
    buf_cfg_def: KmppBufCfg,
    cfg: Obj,
}

impl BufferGroup {
    /// Creates an unconfigured group. Configure it through [`Self::cfg_mut`]
    /// then call [`Self::setup`].
    pub fn get(registry: &Registry) -> Result<Self> {
        let cfg_def = KmppBufGrpCfg::register(registry)?;
        let buf_cfg_def = KmppBufCfg::register(registry)?;
        let cfg = cfg_def.get()?;
        let id = NEXT_GRP_ID.fetch_add(1, Ordering::Relaxed);
        cfg_def.set_grp_id(&cfg, id)?;
        cfg_def.set_mode(&cfg, BufferMode::Internal as u32)?;
        cfg_def.set_fd(&cfg, -1)?;

        let state = GroupState {
            id,
            name: format!("grp_{id}"),
            ready: false,
            finalizing: false,
            mode: BufferMode::Internal,
            count: 0,
            size: 0,
            slots: Vec::new(),
            used: BTreeSet::new(),
            unused: BTreeSet::new(),
            deferred: VecDeque::new(),
            allocator: Arc::new(HostAllocator),
            policy: Arc::new(CreatorReleases),
            destroyed_at_grp: 0,
            destroyed_at_srv: 0,
        };
        debug!("group {id} created");
        Ok(Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(state),
            }),
            cfg_def,
            buf_cfg_def,
            cfg,
        })
    }

    pub fn id(&self) -> i32 {
        self.inner.state.lock().id
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().name.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    /// Typed accessors for [`Self::cfg`].
    pub fn cfg_def(&self) -> &KmppBufGrpCfg {
        &self.cfg_def
    }

    /// The configuration object, read only after setup.
    pub fn cfg(&self) -> &Obj {
        &self.cfg
    }

    /// The staged configuration object.
    pub fn cfg_mut(&self) -> Result<&Obj> {
        self.staged()?;
        Ok(&self.cfg)
    }

    fn staged(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if state.ready {
            return Err(Error::state(format!("group {} already set up", state.id)));
        }
        Ok(())
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        if name.len() >= BUF_GRP_NAME_MAX {
            return Err(Error::exhausted(format!("group name {name}")));
        }
        let mut state = self.inner.state.lock();
        if state.ready {
            return Err(Error::state(format!("group {} already set up", state.id)));
        }
        state.name = name.to_owned();
        Ok(())
    }

    pub fn set_allocator(&self, allocator: Arc<dyn Allocator>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.ready {
            return Err(Error::state(format!("group {} already set up", state.id)));
        }
        state.allocator = allocator;
        Ok(())
    }

    pub fn set_release_policy(&self, policy: Arc<dyn ReleasePolicy>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.ready {
            return Err(Error::state(format!("group {} already set up", state.id)));
        }
        state.policy = policy;
        Ok(())
    }

    /// Applies the staged configuration. The group is immutable afterwards
    /// except for buffer checkout and return.
    pub fn setup(&self) -> Result<()> {
        let count = self.cfg_def.get_count(&self.cfg)? as usize;
        let size = self.cfg_def.get_size(&self.cfg)? as usize;
        let mode_raw = self.cfg_def.get_mode(&self.cfg)?;
        let mode = BufferMode::from_u32(mode_raw)
            .ok_or_else(|| Error::state(format!("buffer mode {mode_raw}")))?;
        if count == 0 {
            return Err(Error::state("buffer count is zero"));
        }
        if mode == BufferMode::Internal && size == 0 {
            return Err(Error::state("buffer size is zero"));
        }

        let mut state = self.inner.state.lock();
        if state.ready {
            return Err(Error::state(format!("group {} already set up", state.id)));
        }
        state.count = count;
        state.size = size;
        state.mode = mode;
        state.ready = true;
        info!(
            "group {} {} setup {:?} count {} size {} allocator {}",
            state.id,
            state.name,
            mode,
            count,
            size,
            state.allocator.name()
        );
        Ok(())
    }

    fn new_buffer(
        &self,
        state: &mut GroupState,
        memory: Memory,
        creator: Authority,
    ) -> Result<Arc<BufferInner>> {
        let index = state.slots.len();
        let uid = NEXT_BUF_UID.fetch_add(1, Ordering::Relaxed);
        let size = memory.size();
        let cfg = self.buf_cfg_def.get_local()?;
        self.buf_cfg_def.set_size(&cfg, size as u32)?;
        self.buf_cfg_def.set_fd(&cfg, memory.raw_fd())?;
        self.buf_cfg_def.set_index(&cfg, index as i32)?;
        self.buf_cfg_def.set_grp_id(&cfg, state.id)?;
        self.buf_cfg_def.set_buf_gid(&cfg, state.id)?;
        self.buf_cfg_def.set_buf_uid(&cfg, uid)?;

        let buf = Arc::new(BufferInner {
            index,
            uid,
            creator,
            state: AtomicU32::new(BufState::None as u32),
            refs: AtomicU32::new(0),
            destroyed_by: AtomicU8::new(0),
            memory: Mutex::new(Some(memory)),
            size,
            cfg,
            group: Arc::downgrade(&self.inner),
        });
        buf.transition(BufState::None, BufState::Init)?;
        state.slots.push(Some(buf.clone()));
        Ok(buf)
    }

    fn check_ready(state: &GroupState) -> Result<()> {
        if !state.ready {
            return Err(Error::state(format!("group {} not set up", state.id)));
        }
        if state.finalizing {
            return Err(Error::state(format!("group {} is released", state.id)));
        }
        Ok(())
    }

    fn sync_counts(&self, state: &GroupState) -> Result<()> {
        self.cfg_def.set_used(&self.cfg, state.used.len() as i32)?;
        self.cfg_def.set_unused(&self.cfg, state.unused.len() as i32)
    }

    /// Checks out a buffer: an unused one when available, otherwise a new
    /// one in internal mode up to the configured count.
    pub fn get_buffer(&self) -> Result<BufRef> {
        let mut state = self.inner.state.lock();
        Self::check_ready(&state)?;

        let buf = if let Some(idx) = state.unused.pop_first() {
            let buf = state.slots[idx]
                .clone()
                .ok_or_else(|| Error::state(format!("group {} slot {idx} empty", state.id)))?;
            if let Err(e) = buf.transition(BufState::Unused, BufState::Used) {
                state.unused.insert(idx);
                return Err(e);
            }
            buf
        } else if state.mode == BufferMode::Internal && state.live() < state.count {
            let memory = state.allocator.alloc(state.size)?;
            let buf = self.new_buffer(&mut state, memory, Authority::Group)?;
            buf.transition(BufState::Init, BufState::InitToUsed)?;
            buf.transition(BufState::InitToUsed, BufState::Used)?;
            buf
        } else {
            return Err(Error::exhausted(format!(
                "group {} has no free buffer ({} of {} used)",
                state.id,
                state.used.len(),
                state.count
            )));
        };

        buf.refs.store(1, Ordering::Release);
        state.used.insert(buf.index);
        self.sync_counts(&state)?;
        Ok(BufRef {
            buf,
            group: Some(self.inner.clone()),
            authority: Authority::Group,
            released: false,
        })
    }

    /// Adds a server-created buffer to the unused list (external mode).
    pub fn import(&self, memory: Memory) -> Result<usize> {
        let mut state = self.inner.state.lock();
        Self::check_ready(&state)?;
        if state.mode != BufferMode::External {
            return Err(Error::Unsupported(format!(
                "import into internal group {}",
                state.id
            )));
        }
        if state.live() >= state.count {
            return Err(Error::exhausted(format!(
                "group {} holds {} buffers",
                state.id, state.count
            )));
        }
        let buf = self.new_buffer(&mut state, memory, Authority::Server)?;
        buf.transition(BufState::Init, BufState::InitToUsed)?;
        buf.transition(BufState::InitToUsed, BufState::Used)?;
        buf.transition(BufState::Used, BufState::Unused)?;
        state.unused.insert(buf.index);
        self.sync_counts(&state)?;
        Ok(buf.index)
    }

    /// Completes destructions deferred to the group.
    pub fn collect(&self) -> Result<usize> {
        self.inner.state.lock().drain(Authority::Group)
    }

    /// Server-side handle on this group.
    pub fn server(&self) -> GroupServer {
        GroupServer {
            inner: self.inner.clone(),
        }
    }

    pub fn stats(&self) -> GroupStats {
        self.inner.state.lock().stats()
    }

    pub fn dump(&self) -> Value {
        dump_state(&self.inner.state.lock())
    }

    /// Tears the group down. Unused buffers the group may destroy go now,
    /// unused buffers owed to the server are deferred to it, and referenced
    /// ones follow the release policy when their last reference goes.
    pub fn put(self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.finalizing {
            return Ok(());
        }
        state.finalizing = true;

        let unused: Vec<usize> = state.unused.iter().copied().collect();
        for idx in unused {
            let Some(buf) = state.slots[idx].clone() else {
                continue;
            };
            let owner = state.policy.owner(buf.creator, Authority::Group);
            if owner == Authority::Group {
                state.finalize(idx, owner)?;
            } else {
                buf.transition(BufState::Unused, BufState::UsedToDeinit)?;
                state.unused.remove(&idx);
                state.deferred.push_back((idx, owner));
                debug!(
                    "group {} unused buffer {} deferred to {:?}",
                    state.id, buf.uid, owner
                );
            }
        }
        let used: Vec<usize> = state.used.iter().copied().collect();
        for idx in used {
            if let Some(buf) = state.slots[idx].clone() {
                buf.transition(BufState::Used, BufState::UsedToDeinit)?;
            }
        }
        state.drain(Authority::Group)?;
        info!(
            "group {} {} put with {} buffers still referenced",
            state.id,
            state.name,
            state.used.len()
        );
        Ok(())
    }
}

impl Drop for BufferGroup {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("group teardown failed: {e}");
        }
    }
}

/// The server side of a group.
#[derive(Clone)]
pub struct GroupServer {
    inner: Arc<GroupInner>,
}

impl GroupServer {
    /// Completes destructions deferred to the server.
    pub fn collect(&self) -> Result<usize> {
        self.inner.state.lock().drain(Authority::Server)
    }

    pub fn stats(&self) -> GroupStats {
        self.inner.state.lock().stats()
    }
}

fn dump_state(state: &GroupState) -> Value {
    let buffers: Vec<Value> = state
        .slots
        .iter()
        .flatten()
        .map(|buf| {
            json!({
                "index": buf.index,
                "uid": buf.uid,
                "state": buf.state().as_str(),
                "refs": buf.refs.load(Ordering::Acquire),
                "size": buf.size,
                "creator": format!("{:?}", buf.creator),
            })
        })
        .collect();
    json!({
        "id": state.id,
        "name": state.name,
        "ready": state.ready,
        "mode": format!("{:?}", state.mode),
        "count": state.count,
        "size": state.size,
        "allocator": state.allocator.name(),
        "used": state.used.len(),
        "unused": state.unused.len(),
        "deferred": state.deferred.len(),
        "buffers": buffers,
    })
}
