// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The privileged-side boundary.
//!
//! Everything that crosses from the user side to the privileged side goes
//! through a [`Transport`]: schema import and publication, shared memory
//! tokens and the synchronous transaction call. [`LoopbackTransport`] is an
//! in-process privileged side used by the demo and the tests.

use crate::{
    error::{Error, Result},
    registry::Registry,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Cross-boundary memory token. Never a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShmPtr {
    /// Opaque handle owned by the privileged side.
    pub handle: u64,
    /// Byte offset inside the handle.
    pub offset: u32,
    /// Byte size of the region.
    pub size: u32,
}

impl ShmPtr {
    pub const SIZE: usize = 16;

    pub fn is_null(&self) -> bool {
        self.handle == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.handle.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decodes a token; missing trailing bytes read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; Self::SIZE];
        let len = bytes.len().min(Self::SIZE);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self {
            handle: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            offset: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            size: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }
}

/// Operations exposed by the privileged side.
pub trait Transport: Send + Sync {
    /// Returns the sealed trie of an existing definition, if any.
    fn objdef_get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Publishes a sealed trie for import by other users.
    fn objdef_share(&self, name: &str, root: &[u8]) -> Result<()>;

    /// Allocates zeroed shared storage for one object of `def`.
    fn shm_alloc(&self, def: &str, size: usize) -> Result<ShmPtr>;

    fn shm_free(&self, shm: &ShmPtr) -> Result<()>;

    fn shm_read(&self, shm: &ShmPtr, offset: usize, out: &mut [u8]) -> Result<()>;

    fn shm_write(&self, shm: &ShmPtr, offset: usize, data: &[u8]) -> Result<()>;

    /// Writes `data` at `offset` and ORs `mask` into the flag byte at `flag`
    /// in a single transaction, so concurrent stores on one object never
    /// drop each other's change flags.
    fn shm_store(
        &self,
        shm: &ShmPtr,
        offset: usize,
        data: &[u8],
        flag: Option<(usize, u8)>,
    ) -> Result<()>;

    /// One synchronous transaction. The returned code is `0` on success.
    fn ioctl(
        &self,
        def: &str,
        cmd: u32,
        input: Option<&ShmPtr>,
        output: Option<&ShmPtr>,
    ) -> Result<i32>;
}

/// Privileged-side transaction handler. Receives the input object's storage
/// and the output object's storage, returns the transaction code.
pub type IoctlHandler = Arc<dyn Fn(Option<&[u8]>, Option<&mut [u8]>) -> i32 + Send + Sync>;

struct ShmBlock {
    def: String,
    data: Vec<u8>,
}

/// In-process privileged side.
pub struct LoopbackTransport {
    kernel: Registry,
    shared: RwLock<HashMap<String, Vec<u8>>>,
    memory: Mutex<HashMap<u64, ShmBlock>>,
    handlers: RwLock<HashMap<(String, u32), IoctlHandler>>,
    next_handle: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            kernel: Registry::new(),
            shared: RwLock::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The privileged side's own registry, where `objdef_register` happens.
    pub fn kernel(&self) -> &Registry {
        &self.kernel
    }

    /// Installs the handler for `cmd` on objects of `def`.
    pub fn add_ioctl(&self, def: &str, cmd: u32, handler: IoctlHandler) {
        self.handlers.write().insert((def.to_owned(), cmd), handler);
    }

    /// Number of live shared storage blocks.
    pub fn shm_count(&self) -> usize {
        self.memory.lock().len()
    }

    fn block_range(shm: &ShmPtr, offset: usize, len: usize, block: &ShmBlock) -> Result<usize> {
        let start = shm.offset as usize + offset;
        if offset + len > shm.size as usize || start + len > block.data.len() {
            return Err(Error::state(format!(
                "shm {:#x} access {offset}+{len} beyond {}",
                shm.handle, shm.size
            )));
        }
        Ok(start)
    }
}

impl Transport for LoopbackTransport {
    fn objdef_get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(def) = self.kernel.lookup(name) {
            return Ok(Some(def.trie().get_node_root().to_vec()));
        }
        Ok(self.shared.read().get(name).cloned())
    }

    fn objdef_share(&self, name: &str, root: &[u8]) -> Result<()> {
        let mut shared = self.shared.write();
        if shared.contains_key(name) || self.kernel.lookup(name).is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        debug!("objdef {name} shared with {} bytes", root.len());
        shared.insert(name.to_owned(), root.to_vec());
        Ok(())
    }

    fn shm_alloc(&self, def: &str, size: usize) -> Result<ShmPtr> {
        let size_u32 =
            u32::try_from(size).map_err(|_| Error::exhausted(format!("shm size {size}")))?;
        let mut data = vec![0u8; size];
        if let Some(kdef) = self.kernel.lookup(def) {
            if let Some(init) = &kdef.hooks().init {
                let entry_size = kdef.entry_size().min(size);
                init(&mut data[..entry_size])?;
            }
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.memory.lock().insert(
            handle,
            ShmBlock {
                def: def.to_owned(),
                data,
            },
        );
        debug!("shm {handle:#x} allocated for {def} size {size}");
        Ok(ShmPtr {
            handle,
            offset: 0,
            size: size_u32,
        })
    }

    fn shm_free(&self, shm: &ShmPtr) -> Result<()> {
        match self.memory.lock().remove(&shm.handle) {
            Some(block) => {
                debug!("shm {:#x} of {} freed", shm.handle, block.def);
                Ok(())
            }
            None => Err(Error::state(format!("shm {:#x} already freed", shm.handle))),
        }
    }

    fn shm_read(&self, shm: &ShmPtr, offset: usize, out: &mut [u8]) -> Result<()> {
        let memory = self.memory.lock();
        let block = memory
            .get(&shm.handle)
            .ok_or_else(|| Error::state(format!("shm {:#x} not allocated", shm.handle)))?;
        let start = Self::block_range(shm, offset, out.len(), block)?;
        out.copy_from_slice(&block.data[start..start + out.len()]);
        Ok(())
    }

    fn shm_write(&self, shm: &ShmPtr, offset: usize, data: &[u8]) -> Result<()> {
        let mut memory = self.memory.lock();
        let block = memory
            .get_mut(&shm.handle)
            .ok_or_else(|| Error::state(format!("shm {:#x} not allocated", shm.handle)))?;
        let start = Self::block_range(shm, offset, data.len(), block)?;
        block.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn shm_store(
        &self,
        shm: &ShmPtr,
        offset: usize,
        data: &[u8],
        flag: Option<(usize, u8)>,
    ) -> Result<()> {
        let mut memory = self.memory.lock();
        let block = memory
            .get_mut(&shm.handle)
            .ok_or_else(|| Error::state(format!("shm {:#x} not allocated", shm.handle)))?;
        let start = Self::block_range(shm, offset, data.len(), block)?;
        let flag = match flag {
            Some((byte, mask)) => Some((Self::block_range(shm, byte, 1, block)?, mask)),
            None => None,
        };
        block.data[start..start + data.len()].copy_from_slice(data);
        if let Some((byte, mask)) = flag {
            block.data[byte] |= mask;
        }
        Ok(())
    }

    fn ioctl(
        &self,
        def: &str,
        cmd: u32,
        input: Option<&ShmPtr>,
        output: Option<&ShmPtr>,
    ) -> Result<i32> {
        let handler = self
            .handlers
            .read()
            .get(&(def.to_owned(), cmd))
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("{def} ioctl {cmd:#x}")))?;

        let mut memory = self.memory.lock();
        let input = match input {
            Some(shm) => {
                let block = memory
                    .get(&shm.handle)
                    .ok_or_else(|| Error::state(format!("shm {:#x} not allocated", shm.handle)))?;
                let start = Self::block_range(shm, 0, shm.size as usize, block)?;
                Some(block.data[start..start + shm.size as usize].to_vec())
            }
            None => None,
        };
        let output = match output {
            Some(shm) => {
                let block = memory
                    .get_mut(&shm.handle)
                    .ok_or_else(|| Error::state(format!("shm {:#x} not allocated", shm.handle)))?;
                let start = Self::block_range(shm, 0, shm.size as usize, block)?;
                Some(&mut block.data[start..start + shm.size as usize])
            }
            None => None,
        };

        let ret = handler(input.as_deref(), output);
        if ret != 0 {
            warn!("{def} ioctl {cmd:#x} returned {ret}");
        }
        Ok(ret)
    }
}
