// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Object instances bound to a definition and a storage backend.
//!
//! Storage is laid out as `[data region][change bitmap]`. Every write through
//! an accessor sets the field's change flag, [`Obj::update`] copies exactly
//! the flagged fields to another object.

use crate::{
    error::{Error, Result},
    objdef::{ElemType, ElemValue, Entry, FieldLoc, ObjDef, Origin, UserPtr},
    registry::Registry,
    shm::{ShmPtr, Transport},
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Map, Value};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Backing memory of an object.
pub trait Storage: Send + Sync {
    fn size(&self) -> usize;

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()>;

    fn write(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Writes a field value and ORs `mask` into the change flag byte at
    /// `flag`, atomically with respect to other stores on the same storage.
    fn store(&self, offset: usize, data: &[u8], flag: Option<(usize, u8)>) -> Result<()>;

    /// Shared token when the storage lives on the privileged side.
    fn shm(&self) -> Option<ShmPtr>;

    fn release(&self) -> Result<()>;

    fn snapshot(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size()];
        self.read(0, &mut out)?;
        Ok(out)
    }
}

fn range_check(size: usize, offset: usize, len: usize) -> Result<()> {
    if offset + len > size {
        return Err(Error::mismatch(format!(
            "access {offset}+{len} beyond storage size {size}"
        )));
    }
    Ok(())
}

/// Directly addressable heap block.
pub struct LocalBackend {
    block: Mutex<Vec<u8>>,
}

impl LocalBackend {
    pub fn new(size: usize) -> Self {
        Self {
            block: Mutex::new(vec![0u8; size]),
        }
    }

    /// Runs `f` on the whole block under the backend lock.
    pub fn with_block<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.block.lock())
    }
}

impl Storage for LocalBackend {
    fn size(&self) -> usize {
        self.block.lock().len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let block = self.block.lock();
        range_check(block.len(), offset, out.len())?;
        out.copy_from_slice(&block[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut block = self.block.lock();
        range_check(block.len(), offset, data.len())?;
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn store(&self, offset: usize, data: &[u8], flag: Option<(usize, u8)>) -> Result<()> {
        let mut block = self.block.lock();
        range_check(block.len(), offset, data.len())?;
        if let Some((byte, _)) = flag {
            range_check(block.len(), byte, 1)?;
        }
        block[offset..offset + data.len()].copy_from_slice(data);
        if let Some((byte, mask)) = flag {
            block[byte] |= mask;
        }
        Ok(())
    }

    fn shm(&self) -> Option<ShmPtr> {
        None
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.block.lock().clone())
    }
}

/// Privileged-side storage reached through transactions.
pub struct SharedBackend {
    shm: ShmPtr,
    transport: Arc<dyn Transport>,
}

impl SharedBackend {
    pub fn new(shm: ShmPtr, transport: Arc<dyn Transport>) -> Self {
        Self { shm, transport }
    }
}

impl Storage for SharedBackend {
    fn size(&self) -> usize {
        self.shm.size as usize
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.transport.shm_read(&self.shm, offset, out)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.transport.shm_write(&self.shm, offset, data)
    }

    fn store(&self, offset: usize, data: &[u8], flag: Option<(usize, u8)>) -> Result<()> {
        self.transport.shm_store(&self.shm, offset, data, flag)
    }

    fn shm(&self) -> Option<ShmPtr> {
        Some(self.shm)
    }

    fn release(&self) -> Result<()> {
        self.transport.shm_free(&self.shm)
    }
}

fn flag_pos(entry: Entry) -> Option<(usize, u8)> {
    entry
        .flag_offset()
        .map(|bit| (bit as usize / 8, 1u8 << (bit % 8)))
}

/// Writes `value` into a raw storage block and sets the field's change flag.
///
/// Used by privileged-side transaction handlers that work on plain storage.
pub fn write_field<T: ElemValue>(block: &mut [u8], loc: &FieldLoc, value: T) -> Result<()> {
    let entry = loc.entry();
    if !T::accepts(entry.elem_type()) || entry.elem_size() != T::SIZE {
        return Err(Error::mismatch(format!(
            "{} value for {} field",
            T::ELEM,
            entry.elem_type()
        )));
    }
    range_check(block.len(), entry.elem_offset(), T::SIZE)?;
    value.write_to(&mut block[entry.elem_offset()..]);
    if let Some((byte, mask)) = flag_pos(entry) {
        range_check(block.len(), byte, 1)?;
        block[byte] |= mask;
    }
    Ok(())
}

/// Reads a field from a raw storage block.
pub fn read_field<T: ElemValue>(block: &[u8], loc: &FieldLoc) -> Result<T> {
    let entry = loc.entry();
    if !T::accepts(entry.elem_type()) || entry.elem_size() != T::SIZE {
        return Err(Error::mismatch(format!(
            "{} value for {} field",
            T::ELEM,
            entry.elem_type()
        )));
    }
    range_check(block.len(), entry.elem_offset(), T::SIZE)?;
    Ok(T::read_from(&block[entry.elem_offset()..]))
}

/// Whether the field's change flag is set in a raw storage block.
pub fn field_changed(block: &[u8], loc: &FieldLoc) -> bool {
    flag_pos(loc.entry())
        .and_then(|(byte, mask)| block.get(byte).map(|b| b & mask != 0))
        .unwrap_or(false)
}

/// A resolved field handle used by typed schemas: a table location when the
/// bound definition has one, otherwise a raw byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    Table(FieldLoc),
    Raw(usize),
}

/// An object instance.
///
/// Handles are `Send + Sync`; writers coordinate through change flags and
/// [`Obj::update`] rather than per-field locks.
pub struct Obj {
    def: Arc<ObjDef>,
    storage: Box<dyn Storage>,
    shadow: Option<LocalBackend>,
    private: Mutex<Vec<u8>>,
    name: String,
    owner: bool,
    released: AtomicBool,
}

impl Obj {
    fn with_storage(def: &Arc<ObjDef>, storage: Box<dyn Storage>, owner: bool) -> Self {
        // user-only fields of shared objects never leave this side
        let shadow = storage
            .shm()
            .map(|_| LocalBackend::new(def.storage_size()));
        Self {
            def: def.clone(),
            storage,
            shadow,
            private: Mutex::new(vec![0u8; def.priv_size()]),
            name: def.name().to_owned(),
            owner,
            released: AtomicBool::new(false),
        }
    }

    /// Creates an object of `def`: shared storage for definitions imported
    /// from the privileged side, local storage otherwise.
    pub fn get(def: &Arc<ObjDef>) -> Result<Self> {
        match def.origin() {
            Origin::Local => Self::get_local(def),
            Origin::Shared(transport) => {
                let shm = transport.shm_alloc(def.name(), def.storage_size())?;
                debug!("obj {} get shm {:#x}", def.name(), shm.handle);
                let storage = SharedBackend::new(shm, transport.clone());
                Ok(Self::with_storage(def, Box::new(storage), true))
            }
        }
    }

    /// Creates an object of `def` in local memory regardless of origin.
    pub fn get_local(def: &Arc<ObjDef>) -> Result<Self> {
        let storage = LocalBackend::new(def.storage_size());
        if let Some(init) = &def.hooks().init {
            storage.with_block(|block| init(&mut block[..def.entry_size()]))?;
        }
        debug!("obj {} get local", def.name());
        Ok(Self::with_storage(def, Box::new(storage), true))
    }

    pub fn get_by_name(registry: &Registry, name: &str) -> Result<Self> {
        Self::get(&registry.get(name)?)
    }

    /// Opens a second handle on existing shared storage. The handle does not
    /// own the storage.
    pub fn get_by_sptr(def: &Arc<ObjDef>, shm: ShmPtr) -> Result<Self> {
        let transport = match def.origin() {
            Origin::Shared(transport) => transport.clone(),
            Origin::Local => {
                return Err(Error::Unsupported(format!(
                    "{} is not a shared definition",
                    def.name()
                )))
            }
        };
        if shm.is_null() {
            return Err(Error::NullPointer);
        }
        if (shm.size as usize) < def.storage_size() {
            return Err(Error::mismatch(format!(
                "shm size {} for {} of size {}",
                shm.size,
                def.name(),
                def.storage_size()
            )));
        }
        let storage = SharedBackend::new(shm, transport);
        Ok(Self::with_storage(def, Box::new(storage), false))
    }

    /// Releases the handle and, if it owns it, the storage.
    pub fn put(self) -> Result<()> {
        let res = self.release_storage();
        self.released.store(true, Ordering::Release);
        res
    }

    /// Releases only the handle. Shared storage stays with its other owner.
    pub fn impl_put(self) {
        debug!("obj {} impl put", self.name);
        self.released.store(true, Ordering::Release);
    }

    fn release_storage(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::state(format!("obj {} already released", self.name)));
        }
        if !self.owner {
            return Ok(());
        }
        if self.storage.shm().is_none() {
            if let Some(deinit) = &self.def.hooks().deinit {
                let mut data = self.storage.snapshot()?;
                deinit(&mut data[..self.def.entry_size()])?;
            }
        }
        debug!("obj {} put", self.name);
        self.storage.release()
    }

    /// Validates the handle before any access.
    pub fn check(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::state(format!("obj {} used after put", self.name)));
        }
        if self.storage.size() < self.def.storage_size() {
            return Err(Error::mismatch(format!(
                "obj {} storage {} smaller than {}",
                self.name,
                self.storage.size(),
                self.def.storage_size()
            )));
        }
        Ok(())
    }

    /// Validates an optional handle.
    pub fn check_opt(obj: Option<&Obj>) -> Result<&Obj> {
        let obj = obj.ok_or(Error::NullPointer)?;
        obj.check()?;
        Ok(obj)
    }

    pub fn def(&self) -> &Arc<ObjDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    /// Whether the storage lives on the privileged side.
    pub fn is_kobj(&self) -> bool {
        self.storage.shm().is_some()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn to_shm(&self) -> Option<ShmPtr> {
        self.storage.shm()
    }

    pub fn to_offset(&self, name: &str) -> Result<usize> {
        self.def.get_offset(name)
    }

    /// Per-object private extension, sized by the definition's `priv_size`.
    pub fn private(&self) -> MutexGuard<'_, Vec<u8>> {
        self.private.lock()
    }

    fn backend_for(&self, entry: Entry) -> &dyn Storage {
        match &self.shadow {
            Some(shadow) if entry.elem_type().is_user_only() => shadow,
            _ => self.storage.as_ref(),
        }
    }

    fn loc_entry(&self, loc: &FieldLoc) -> Result<Entry> {
        if loc.def_id() != self.def.id() {
            return Err(Error::mismatch(format!(
                "field location of objdef {} used on {}",
                loc.def_id(),
                self.def.name()
            )));
        }
        Ok(loc.entry())
    }

    fn usable(&self, entry: Entry) -> Result<()> {
        let ty = entry.elem_type();
        if ty.is_kernel_only() || !entry.user_access() {
            return Err(Error::Unsupported(format!(
                "{} field on user side of {}",
                ty, self.name
            )));
        }
        Ok(())
    }

    fn store(&self, entry: Entry, data: &[u8]) -> Result<()> {
        if data.len() != entry.elem_size() {
            return Err(Error::mismatch(format!(
                "{} bytes for {} byte field of {}",
                data.len(),
                entry.elem_size(),
                self.name
            )));
        }
        self.backend_for(entry)
            .store(entry.elem_offset(), data, flag_pos(entry))
    }

    fn write_entry(&self, entry: Entry, data: &[u8]) -> Result<()> {
        self.check()?;
        self.usable(entry)?;
        if entry.is_readonly() {
            return Err(Error::Unsupported(format!(
                "read only field at {} of {}",
                entry.elem_offset(),
                self.name
            )));
        }
        self.store(entry, data)
    }

    fn read_entry(&self, entry: Entry, out: &mut [u8]) -> Result<()> {
        self.check()?;
        self.usable(entry)?;
        if out.len() != entry.elem_size() {
            return Err(Error::mismatch(format!(
                "{} bytes for {} byte field of {}",
                out.len(),
                entry.elem_size(),
                self.name
            )));
        }
        self.backend_for(entry).read(entry.elem_offset(), out)
    }

    fn set_entry<T: ElemValue>(&self, entry: Entry, value: T) -> Result<()> {
        if !T::accepts(entry.elem_type()) {
            return Err(Error::mismatch(format!(
                "{} value for {} field of {}",
                T::ELEM,
                entry.elem_type(),
                self.name
            )));
        }
        let mut buf = vec![0u8; T::SIZE];
        value.write_to(&mut buf);
        self.write_entry(entry, &buf)
    }

    fn get_entry<T: ElemValue>(&self, entry: Entry) -> Result<T> {
        if !T::accepts(entry.elem_type()) {
            return Err(Error::mismatch(format!(
                "{} value for {} field of {}",
                T::ELEM,
                entry.elem_type(),
                self.name
            )));
        }
        let mut buf = vec![0u8; T::SIZE];
        self.read_entry(entry, &mut buf)?;
        Ok(T::read_from(&buf))
    }

    fn resolve(&self, name: &str) -> Result<Entry> {
        self.check()?;
        self.def.get_entry(name).map(|loc| loc.entry())
    }

    /// Sets a field by name, resolving it through the trie.
    pub fn set_as<T: ElemValue>(&self, name: &str, value: T) -> Result<()> {
        self.set_entry(self.resolve(name)?, value)
    }

    pub fn get_as<T: ElemValue>(&self, name: &str) -> Result<T> {
        self.get_entry(self.resolve(name)?)
    }

    /// Sets a field through a pre-resolved location.
    pub fn tbl_set<T: ElemValue>(&self, loc: &FieldLoc, value: T) -> Result<()> {
        self.set_entry(self.loc_entry(loc)?, value)
    }

    pub fn tbl_get<T: ElemValue>(&self, loc: &FieldLoc) -> Result<T> {
        self.get_entry(self.loc_entry(loc)?)
    }

    /// Copies a plain structure field in.
    pub fn set_st(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_entry(self.resolve(name)?, data)
    }

    /// Copies a plain structure field out.
    pub fn get_st(&self, name: &str, out: &mut [u8]) -> Result<()> {
        self.read_entry(self.resolve(name)?, out)
    }

    pub fn tbl_set_st(&self, loc: &FieldLoc, data: &[u8]) -> Result<()> {
        self.write_entry(self.loc_entry(loc)?, data)
    }

    pub fn tbl_get_st(&self, loc: &FieldLoc, out: &mut [u8]) -> Result<()> {
        self.read_entry(self.loc_entry(loc)?, out)
    }

    /// Writes directly into the data region, bypassing the location table.
    /// No change flag is set.
    pub fn write_raw(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check()?;
        range_check(self.def.entry_size(), offset, data.len())?;
        self.storage.write(offset, data)
    }

    pub fn read_raw(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check()?;
        range_check(self.def.entry_size(), offset, out.len())?;
        self.storage.read(offset, out)
    }

    fn test_entry(&self, entry: Entry) -> Result<bool> {
        self.check()?;
        let Some((byte, mask)) = flag_pos(entry) else {
            return Ok(false);
        };
        let mut out = [0u8];
        self.backend_for(entry).read(byte, &mut out)?;
        Ok(out[0] & mask != 0)
    }

    /// Whether the field was written since the flags were last cleared.
    pub fn test(&self, name: &str) -> Result<bool> {
        self.test_entry(self.resolve(name)?)
    }

    pub fn tbl_test(&self, loc: &FieldLoc) -> Result<bool> {
        self.test_entry(self.loc_entry(loc)?)
    }

    /// Clears every change flag.
    pub fn clear_flags(&self) -> Result<()> {
        self.check()?;
        let zero = vec![0u8; self.def.flag_size()];
        self.storage.write(self.def.entry_size(), &zero)?;
        if let Some(shadow) = &self.shadow {
            shadow.write(self.def.entry_size(), &zero)?;
        }
        Ok(())
    }

    /// Typed schema accessor: table location or raw offset.
    pub fn slot_set<T: ElemValue>(&self, slot: &FieldSlot, value: T) -> Result<()> {
        match slot {
            FieldSlot::Table(loc) => self.tbl_set(loc, value),
            FieldSlot::Raw(offset) => {
                let mut buf = vec![0u8; T::SIZE];
                value.write_to(&mut buf);
                self.write_raw(*offset, &buf)
            }
        }
    }

    pub fn slot_get<T: ElemValue>(&self, slot: &FieldSlot) -> Result<T> {
        match slot {
            FieldSlot::Table(loc) => self.tbl_get(loc),
            FieldSlot::Raw(offset) => {
                let mut buf = vec![0u8; T::SIZE];
                self.read_raw(*offset, &mut buf)?;
                Ok(T::read_from(&buf))
            }
        }
    }

    pub fn slot_test(&self, slot: &FieldSlot) -> Result<bool> {
        match slot {
            FieldSlot::Table(loc) => self.tbl_test(loc),
            FieldSlot::Raw(_) => self.check().map(|_| false),
        }
    }

    fn snapshots(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let main = self.storage.snapshot()?;
        let shadow = match &self.shadow {
            Some(shadow) => Some(shadow.snapshot()?),
            None => None,
        };
        Ok((main, shadow))
    }

    /// Copies every field flagged on `src` into the field of the same name on
    /// `dst` and flags it there. Returns the number of fields copied.
    pub fn update(dst: &Obj, src: &Obj) -> Result<usize> {
        dst.check()?;
        src.check()?;
        let (main, shadow) = src.snapshots()?;
        let mut count = 0;

        for (name, entry) in src.def.entries() {
            let ty = entry.elem_type();
            if ty.is_kernel_only() {
                continue;
            }
            let block = match &shadow {
                Some(shadow) if ty.is_user_only() => shadow,
                _ => &main,
            };
            let Some((byte, mask)) = flag_pos(entry) else {
                continue;
            };
            if block.get(byte).map_or(true, |b| b & mask == 0) {
                continue;
            }
            let target = match dst.def.get_entry(name) {
                Ok(loc) => loc.entry(),
                Err(_) => continue,
            };
            if target.elem_type() != ty || target.elem_size() != entry.elem_size() {
                return Err(Error::mismatch(format!(
                    "{name} is {} on {} and {} on {}",
                    ty,
                    src.name,
                    target.elem_type(),
                    dst.name
                )));
            }
            let start = entry.elem_offset();
            dst.store(target, &block[start..start + entry.elem_size()])?;
            count += 1;
        }
        debug!("obj {} updated {count} fields from {}", dst.name, src.name);
        Ok(count)
    }

    /// Copies the whole storage of `src`, flags included. Both objects must
    /// use the same definition.
    pub fn copy_entry(dst: &Obj, src: &Obj) -> Result<()> {
        dst.check()?;
        src.check()?;
        if dst.def.id() != src.def.id() {
            return Err(Error::mismatch(format!(
                "copy {} into {}",
                src.def.name(),
                dst.def.name()
            )));
        }
        let (main, shadow) = src.snapshots()?;
        let size = dst.def.storage_size();
        dst.storage.write(0, &main[..size])?;
        if let (Some(to), Some(from)) = (&dst.shadow, shadow) {
            to.write(0, &from[..size])?;
        }
        Ok(())
    }

    /// One synchronous transaction on the privileged side.
    ///
    /// Blocks until the privileged side answers. A non-zero answer is
    /// returned as [`Error::TransactionFailure`].
    pub fn ioctl(&self, cmd: u32, input: Option<&Obj>, output: Option<&Obj>) -> Result<()> {
        self.check()?;
        let transport = match self.def.origin() {
            Origin::Shared(transport) if self.is_kobj() => transport,
            _ => {
                return Err(Error::Unsupported(format!(
                    "ioctl {cmd:#x} on local obj {}",
                    self.name
                )))
            }
        };
        let shm_of = |obj: Option<&Obj>| -> Result<Option<ShmPtr>> {
            match obj {
                Some(obj) => {
                    obj.check()?;
                    obj.to_shm().map(Some).ok_or_else(|| {
                        Error::Unsupported(format!("local obj {} in ioctl", obj.name))
                    })
                }
                None => Ok(None),
            }
        };
        let input = shm_of(input)?;
        let output = shm_of(output)?;

        let ret = transport.ioctl(self.def.name(), cmd, input.as_ref(), output.as_ref())?;
        if ret != 0 {
            warn!("obj {} ioctl {cmd:#x} failed {ret}", self.name);
            return Err(Error::TransactionFailure(ret));
        }
        Ok(())
    }

    /// Renders the object as JSON through the definition's dump hook, or
    /// field by field.
    pub fn dump(&self) -> Result<Value> {
        self.check()?;
        let (main, shadow) = self.snapshots()?;
        if let Some(dump) = &self.def.hooks().dump {
            return Ok(dump(&main[..self.def.entry_size()]));
        }

        let mut fields = Map::new();
        for (name, entry) in self.def.entries() {
            let ty = entry.elem_type();
            let block = match &shadow {
                Some(shadow) if ty.is_user_only() => shadow,
                _ => &main,
            };
            let bytes = &block[entry.elem_offset()..entry.elem_offset() + entry.elem_size()];
            let value = match ty {
                ElemType::S32 => json!(i32::read_from(bytes)),
                ElemType::U32 => json!(u32::read_from(bytes)),
                ElemType::S64 => json!(i64::read_from(bytes)),
                ElemType::U64 | ElemType::Ptr => json!(u64::read_from(bytes)),
                ElemType::Shm => {
                    let shm = ShmPtr::from_bytes(bytes);
                    json!({ "handle": shm.handle, "offset": shm.offset, "size": shm.size })
                }
                ElemType::Uobj | ElemType::Uptr | ElemType::Ufp => {
                    json!(UserPtr::read_from(bytes).0)
                }
                ElemType::St => json!(bytes),
                ElemType::Kobj | ElemType::Kptr | ElemType::Kfp => Value::Null,
            };
            fields.insert(name.to_owned(), value);
        }
        Ok(json!({
            "name": self.name,
            "objdef": self.def.name(),
            "shm": self.to_shm().map(|shm| shm.handle),
            "fields": fields,
        }))
    }
}

macro_rules! named_accessors {
    ($($suffix:ident: $ty:ty),* $(,)?) => {
        paste::paste! {
            impl Obj {
                $(
                    pub fn [<set_ $suffix>](&self, name: &str, value: $ty) -> Result<()> {
                        self.set_as(name, value)
                    }

                    pub fn [<get_ $suffix>](&self, name: &str) -> Result<$ty> {
                        self.get_as(name)
                    }

                    pub fn [<tbl_set_ $suffix>](&self, loc: &FieldLoc, value: $ty) -> Result<()> {
                        self.tbl_set(loc, value)
                    }

                    pub fn [<tbl_get_ $suffix>](&self, loc: &FieldLoc) -> Result<$ty> {
                        self.tbl_get(loc)
                    }
                )*
            }
        }
    };
}

named_accessors!(
    s32: i32,
    u32: u32,
    s64: i64,
    u64: u64,
    shm: ShmPtr,
    ptr: u64,
    fp: UserPtr,
);

impl Drop for Obj {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.release_storage() {
            warn!("obj {} release failed: {e}", self.name);
        }
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Obj")
            .field("name", &self.name)
            .field("objdef", &self.def.name())
            .field("shm", &self.to_shm())
            .field("owner", &self.owner)
            .finish()
    }
}
