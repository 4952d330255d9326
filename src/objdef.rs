// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Object definitions: named data layouts resolved through a [`Trie`].
//!
//! An [`ObjDef`] describes one shared structure: its data region size, the
//! location of every named field and the change-flag bit assigned to it. The
//! change bitmap starts right after the data region, so bit `entry_size * 8`
//! is the first flag bit.
//!
//! Flag bits are assigned by [`FlagAllocator`], a deterministic bump
//! allocator driven by the [`FlagDesc`] of each field. Two sides that declare
//! the same fields in the same order always converge on the same bitmap,
//! which is what allows one side to set flags and the other to read them
//! without exchanging the layout per object.

use crate::{
    error::{Error, Result},
    shm::{ShmPtr, Transport},
    trie::{info_size, Trie, INFO_STR_MAX},
};
use serde_json::{json, Value};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Element storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElemType {
    S32 = 0x0,
    U32 = 0x1,
    S64 = 0x2,
    U64 = 0x3,
    /// Pointer stored as 64 bits.
    Ptr = 0x4,
    /// Plain value structure copied as bytes.
    St = 0x5,
    /// Shared memory token.
    Shm = 0x6,
    /// Kernel object pointer, privileged side only.
    Kobj = 0x8,
    /// Kernel data pointer, privileged side only.
    Kptr = 0x9,
    /// Kernel function pointer, privileged side only.
    Kfp = 0xa,
    /// User object pointer, never transmitted.
    Uobj = 0xc,
    /// User data pointer, never transmitted.
    Uptr = 0xd,
    /// User function pointer, never transmitted.
    Ufp = 0xe,
}

impl ElemType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x0 => ElemType::S32,
            0x1 => ElemType::U32,
            0x2 => ElemType::S64,
            0x3 => ElemType::U64,
            0x4 => ElemType::Ptr,
            0x5 => ElemType::St,
            0x6 => ElemType::Shm,
            0x8 => ElemType::Kobj,
            0x9 => ElemType::Kptr,
            0xa => ElemType::Kfp,
            0xc => ElemType::Uobj,
            0xd => ElemType::Uptr,
            0xe => ElemType::Ufp,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElemType::S32 => "s32",
            ElemType::U32 => "u32",
            ElemType::S64 => "s64",
            ElemType::U64 => "u64",
            ElemType::Ptr => "ptr",
            ElemType::St => "st",
            ElemType::Shm => "shm",
            ElemType::Kobj => "kobj",
            ElemType::Kptr => "kptr",
            ElemType::Kfp => "kfp",
            ElemType::Uobj => "uobj",
            ElemType::Uptr => "uptr",
            ElemType::Ufp => "ufp",
        }
    }

    /// Storage size for fixed-size types, `None` for [`ElemType::St`].
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ElemType::S32 | ElemType::U32 => Some(4),
            ElemType::Shm => Some(ShmPtr::SIZE),
            ElemType::St => None,
            _ => Some(8),
        }
    }

    pub fn is_kernel_only(self) -> bool {
        matches!(self, ElemType::Kobj | ElemType::Kptr | ElemType::Kfp)
    }

    pub fn is_user_only(self) -> bool {
        matches!(self, ElemType::Uobj | ElemType::Uptr | ElemType::Ufp)
    }

    fn default_access(self) -> u8 {
        if self.is_kernel_only() {
            ACCESS_KERNEL
        } else if self.is_user_only() {
            ACCESS_USER
        } else {
            ACCESS_KERNEL | ACCESS_USER
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field is reachable from the privileged side.
pub const ACCESS_KERNEL: u8 = 0x1;
/// Field is reachable from the user side.
pub const ACCESS_USER: u8 = 0x2;
/// Field may not be written through accessors.
pub const ACCESS_READONLY: u8 = 0x4;

const ENTRY_TYPE_LOC_TBL: u64 = 0x3;

/// Location-table word stored as the trie context of every field.
///
/// ```text
/// bits  0..4   entry type (location table)
/// bits  4..8   access flags
/// bits  8..16  element type
/// bits 16..32  element size
/// bits 32..48  element offset
/// bits 48..64  flag bit offset, 0 when the field has no change flag
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(u64);

impl Entry {
    pub const SIZE: usize = 8;

    pub fn new(elem_type: ElemType, offset: u16, size: u16, flag_offset: u16, access: u8) -> Self {
        Entry(
            ENTRY_TYPE_LOC_TBL
                | ((access as u64 & 0xf) << 4)
                | ((elem_type.tag() as u64) << 8)
                | ((size as u64) << 16)
                | ((offset as u64) << 32)
                | ((flag_offset as u64) << 48),
        )
    }

    /// Validates and wraps a raw location-table word.
    pub fn from_bits(bits: u64) -> Result<Self> {
        if bits & 0xf != ENTRY_TYPE_LOC_TBL {
            return Err(Error::mismatch(format!(
                "entry type {:#x} is not a location table",
                bits & 0xf
            )));
        }
        let tag = ((bits >> 8) & 0xff) as u8;
        if ElemType::from_tag(tag).is_none() {
            return Err(Error::mismatch(format!("unknown element type {tag:#x}")));
        }
        Ok(Entry(bits))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::mismatch(format!("entry ctx is {} bytes", bytes.len())))?;
        Self::from_bits(u64::from_le_bytes(raw))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn elem_type(self) -> ElemType {
        // validated on construction
        ElemType::from_tag(((self.0 >> 8) & 0xff) as u8).unwrap_or(ElemType::St)
    }

    pub fn elem_size(self) -> usize {
        ((self.0 >> 16) & 0xffff) as usize
    }

    pub fn elem_offset(self) -> usize {
        ((self.0 >> 32) & 0xffff) as usize
    }

    pub fn flag_offset(self) -> Option<u16> {
        match (self.0 >> 48) as u16 {
            0 => None,
            bit => Some(bit),
        }
    }

    pub fn access(self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    pub fn is_readonly(self) -> bool {
        self.access() & ACCESS_READONLY != 0
    }

    pub fn user_access(self) -> bool {
        self.access() & ACCESS_USER != 0
    }

    pub fn kernel_access(self) -> bool {
        self.access() & ACCESS_KERNEL != 0
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Entry")
            .field("type", &self.elem_type())
            .field("offset", &self.elem_offset())
            .field("size", &self.elem_size())
            .field("flag", &self.flag_offset())
            .field("access", &self.access())
            .finish()
    }
}

/// A field location resolved once and reused on the fast path.
///
/// The definition id it carries lets accessors reject a location that was
/// resolved against another schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLoc {
    def_id: u32,
    entry: Entry,
}

impl FieldLoc {
    pub fn def_id(&self) -> u32 {
        self.def_id
    }

    pub fn entry(&self) -> Entry {
        self.entry
    }

    pub fn offset(&self) -> usize {
        self.entry.elem_offset()
    }

    pub fn size(&self) -> usize {
        self.entry.elem_size()
    }

    pub fn elem_type(&self) -> ElemType {
        self.entry.elem_type()
    }
}

/// Change-flag assignment operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlagOp {
    /// Field has no change flag.
    None = 0,
    /// Align to the next 32-bit word.
    StartWord32 = 1,
    /// Align to the next 64-bit word.
    StartWord64 = 2,
    /// Fixed index from the current word base.
    Offset = 3,
    /// One past the highest index used in the current word.
    Increment = 4,
    /// Share the previous field's flag.
    RepeatPrevious = 5,
}

impl FlagOp {
    fn from_bits(v: u32) -> Option<Self> {
        Some(match v {
            0 => FlagOp::None,
            1 => FlagOp::StartWord32,
            2 => FlagOp::StartWord64,
            3 => FlagOp::Offset,
            4 => FlagOp::Increment,
            5 => FlagOp::RepeatPrevious,
            _ => return None,
        })
    }
}

const FLAG_IDX_MASK: u32 = 0xff;
const FLAG_SLOT_SHIFT: u32 = 8;
const FLAG_SLOT_MASK: u32 = 0xf;
const FLAG_OP_SHIFT: u32 = 12;
const FLAG_OP_MASK: u32 = 0xf;
const FLAG_RECORD_BIT: u32 = 1 << 16;
const FLAG_REPLAY_BIT: u32 = 1 << 17;

/// Number of record / replay slots per registration.
pub const FLAG_RECORD_MAX: usize = 16;

/// Compact change-flag descriptor, only interpreted at registration.
///
/// ```text
/// bits  0..8   idx     index for Offset
/// bits  8..12  slot    record / replay slot
/// bits 12..16  op      FlagOp
/// bit  16      record  store the resolved offset in slot
/// bit  17      replay  return the offset stored in slot
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagDesc(u32);

impl FlagDesc {
    pub const NONE: FlagDesc = FlagDesc(0);

    const fn pack(idx: u32, slot: u32, op: FlagOp, record: bool, replay: bool) -> Self {
        FlagDesc(
            (idx & FLAG_IDX_MASK)
                | ((slot & FLAG_SLOT_MASK) << FLAG_SLOT_SHIFT)
                | ((op as u32 & FLAG_OP_MASK) << FLAG_OP_SHIFT)
                | if record { FLAG_RECORD_BIT } else { 0 }
                | if replay { FLAG_REPLAY_BIT } else { 0 },
        )
    }

    pub const fn from_bits(bits: u32) -> Self {
        FlagDesc(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Start a new 32-bit flag word.
    pub const fn base() -> Self {
        Self::pack(0, 0, FlagOp::StartWord32, false, false)
    }

    /// Start a new 64-bit flag word.
    pub const fn base64() -> Self {
        Self::pack(0, 0, FlagOp::StartWord64, false, false)
    }

    /// Flag at `idx` bits from the current word base.
    pub const fn at(idx: u32) -> Self {
        Self::pack(idx, 0, FlagOp::Offset, false, false)
    }

    pub const fn incr() -> Self {
        Self::pack(0, 0, FlagOp::Increment, false, false)
    }

    pub const fn prev() -> Self {
        Self::pack(0, 0, FlagOp::RepeatPrevious, false, false)
    }

    /// Flag at `idx`, remembered in `slot`.
    pub const fn rec(slot: u32, idx: u32) -> Self {
        Self::pack(idx, slot, FlagOp::Offset, true, false)
    }

    /// Next flag, remembered in `slot`.
    pub const fn rec_inc(slot: u32) -> Self {
        Self::pack(0, slot, FlagOp::Increment, true, false)
    }

    /// Reuse the flag remembered in `slot`.
    pub const fn replay(slot: u32) -> Self {
        Self::pack(0, slot, FlagOp::Offset, false, true)
    }

    pub fn idx(self) -> u32 {
        self.0 & FLAG_IDX_MASK
    }

    pub fn slot(self) -> usize {
        ((self.0 >> FLAG_SLOT_SHIFT) & FLAG_SLOT_MASK) as usize
    }

    pub fn op(self) -> Option<FlagOp> {
        FlagOp::from_bits((self.0 >> FLAG_OP_SHIFT) & FLAG_OP_MASK)
    }

    pub fn is_record(self) -> bool {
        self.0 & FLAG_RECORD_BIT != 0
    }

    pub fn is_replay(self) -> bool {
        self.0 & FLAG_REPLAY_BIT != 0
    }
}

/// Running state that turns [`FlagDesc`]s into flag bit offsets.
#[derive(Debug, Clone)]
pub struct FlagAllocator {
    base: u32,
    prev: u32,
    step: u32,
    record: [u16; FLAG_RECORD_MAX],
}

impl FlagAllocator {
    /// Seeds the allocator right after a data region of `entry_size` bytes.
    pub fn new(entry_size: usize) -> Self {
        Self {
            base: (entry_size * 8) as u32,
            prev: 0,
            step: 0,
            record: [0; FLAG_RECORD_MAX],
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn prev(&self) -> u32 {
        self.prev
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    fn start(&mut self, align: u32) {
        if self.prev > self.base {
            self.base = (self.prev + align - 1) & !(align - 1);
        } else if self.prev == self.base {
            self.base = (self.base + align) & !(align - 1);
        }
        self.step = 0;
        self.prev = self.base;
    }

    /// Resolves one descriptor. `0` means the field has no change flag.
    pub fn resolve(&mut self, name: &str, flag: FlagDesc) -> Result<u16> {
        let offset = match flag.op() {
            Some(FlagOp::StartWord32) => {
                self.start(32);
                self.base
            }
            Some(FlagOp::StartWord64) => {
                self.start(64);
                self.base
            }
            Some(FlagOp::Offset) => {
                self.prev = self.base + flag.idx();
                self.step = self.step.max(flag.idx());
                self.prev
            }
            Some(FlagOp::Increment) => {
                self.step += 1;
                self.prev = self.base + self.step;
                self.prev
            }
            Some(FlagOp::RepeatPrevious) => self.prev,
            Some(FlagOp::None) | None => 0,
        };
        let mut offset = u16::try_from(offset)
            .map_err(|_| Error::exhausted(format!("flag offset {offset} for {name}")))?;

        if flag.is_record() {
            self.record[flag.slot()] = offset;
        }
        if flag.is_replay() {
            offset = self.record[flag.slot()];
        }
        debug!(
            "{:<20} - ({:x}:{:x}:{:02x}) -> {:#4x} ({:2})",
            name,
            self.base,
            self.prev,
            self.step,
            offset,
            if offset != 0 {
                offset as i64 - self.base as i64
            } else {
                0
            }
        );
        Ok(offset)
    }
}

/// Declaration of one field handed to [`ObjDefBuilder::add_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    pub elem_type: ElemType,
    pub offset: usize,
    pub size: usize,
    pub flag: FlagDesc,
    pub access: u8,
}

impl FieldDesc {
    pub fn new(elem_type: ElemType, offset: usize, size: usize) -> Self {
        Self {
            elem_type,
            offset,
            size,
            flag: FlagDesc::NONE,
            access: elem_type.default_access(),
        }
    }

    pub fn flag(mut self, flag: FlagDesc) -> Self {
        self.flag = flag;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.access |= ACCESS_READONLY;
        self
    }
}

/// Value types that can be stored in a field.
pub trait ElemValue: Copy + Sized {
    const ELEM: ElemType;
    const SIZE: usize;
    /// Alignment used by [`Layout`].
    const ALIGN: usize = if Self::SIZE >= 8 { 8 } else { Self::SIZE };

    /// Whether a field of type `ty` can hold this value.
    fn accepts(ty: ElemType) -> bool {
        ty == Self::ELEM
    }

    fn write_to(&self, out: &mut [u8]);

    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! int_elem {
    ($ty:ty, $elem:expr, $($also:pat_param)|*) => {
        impl ElemValue for $ty {
            const ELEM: ElemType = $elem;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn accepts(ty: ElemType) -> bool {
                matches!(ty, $($also)|*)
            }

            fn write_to(&self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

int_elem!(i32, ElemType::S32, ElemType::S32 | ElemType::U32);
int_elem!(u32, ElemType::U32, ElemType::U32 | ElemType::S32);
int_elem!(i64, ElemType::S64, ElemType::S64 | ElemType::U64);
int_elem!(u64, ElemType::U64, ElemType::U64 | ElemType::S64 | ElemType::Ptr);

impl<const N: usize> ElemValue for [u8; N] {
    const ELEM: ElemType = ElemType::St;
    const SIZE: usize = N;
    const ALIGN: usize = 4;

    fn write_to(&self, out: &mut [u8]) {
        out[..N].copy_from_slice(self);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[..N]);
        out
    }
}

/// User-side pointer alias, kept out of shared storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserPtr(pub u64);

impl ElemValue for UserPtr {
    const ELEM: ElemType = ElemType::Uptr;
    const SIZE: usize = 8;

    fn accepts(ty: ElemType) -> bool {
        ty.is_user_only()
    }

    fn write_to(&self, out: &mut [u8]) {
        self.0.write_to(out)
    }

    fn read_from(bytes: &[u8]) -> Self {
        UserPtr(u64::read_from(bytes))
    }
}

impl ElemValue for ShmPtr {
    const ELEM: ElemType = ElemType::Shm;
    const SIZE: usize = ShmPtr::SIZE;

    fn write_to(&self, out: &mut [u8]) {
        out[..Self::SIZE].copy_from_slice(&self.to_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        ShmPtr::from_bytes(bytes)
    }
}

/// Ordered field list with sequentially assigned, naturally aligned
/// offsets. Used by typed schemas to describe their layout once.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    fields: Vec<(String, FieldDesc)>,
    size: usize,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: &str, desc: FieldDesc, align: usize) -> Self {
        let offset = (self.size + align - 1) & !(align - 1);
        self.size = offset + desc.size;
        self.fields.push((
            name.to_owned(),
            FieldDesc {
                offset,
                ..desc
            },
        ));
        self
    }

    /// Appends a value field.
    pub fn field<T: ElemValue>(self, name: &str, flag: FlagDesc) -> Self {
        let desc = FieldDesc::new(T::ELEM, 0, T::SIZE).flag(flag);
        self.push(name, desc, T::ALIGN)
    }

    /// Appends a plain structure field of `size` bytes.
    pub fn st(self, name: &str, size: usize, flag: FlagDesc) -> Self {
        let desc = FieldDesc::new(ElemType::St, 0, size).flag(flag);
        self.push(name, desc, 4)
    }

    /// Data region size rounded up to 32 bits.
    pub fn size(&self) -> usize {
        (self.size + 3) & !3
    }

    pub fn fields(&self) -> &[(String, FieldDesc)] {
        &self.fields
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, desc)| desc.offset)
    }

    /// Adds every field to `builder` in declaration order.
    pub fn apply(&self, builder: &mut ObjDefBuilder) -> Result<()> {
        for (name, desc) in &self.fields {
            builder.add_entry(name, *desc)?;
        }
        Ok(())
    }
}

/// Fills a freshly allocated local data region.
pub type InitHook = Arc<dyn Fn(&mut [u8]) -> Result<()> + Send + Sync>;
/// Runs on the data region before local storage is released.
pub type DeinitHook = Arc<dyn Fn(&mut [u8]) -> Result<()> + Send + Sync>;
/// Renders a data region for [`crate::Obj::dump`].
pub type DumpHook = Arc<dyn Fn(&[u8]) -> Value + Send + Sync>;

/// Optional per-schema hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub init: Option<InitHook>,
    pub deinit: Option<DeinitHook>,
    pub dump: Option<DumpHook>,
}

/// Where instances of a definition keep their storage.
#[derive(Clone)]
pub enum Origin {
    /// Registered on this side, instances use local memory.
    Local,
    /// Imported from the privileged side, instances use shared memory.
    Shared(Arc<dyn Transport>),
}

static NEXT_DEF_ID: AtomicU32 = AtomicU32::new(1);

const META_SIZE: usize = 16;

fn encode_meta(entry_size: usize, flag_size: usize, priv_size: usize, count: usize) -> [u8; META_SIZE] {
    let mut meta = [0u8; META_SIZE];
    for (i, v) in [entry_size, flag_size, priv_size, count].into_iter().enumerate() {
        meta[i * 4..i * 4 + 4].copy_from_slice(&(v as u32).to_le_bytes());
    }
    meta
}

fn decode_meta(meta: &[u8]) -> Result<[usize; 4]> {
    if meta.len() < META_SIZE {
        return Err(Error::mismatch(format!(
            "objdef meta is {} bytes",
            meta.len()
        )));
    }
    let mut out = [0usize; 4];
    for (i, v) in out.iter_mut().enumerate() {
        let raw = [meta[i * 4], meta[i * 4 + 1], meta[i * 4 + 2], meta[i * 4 + 3]];
        *v = u32::from_le_bytes(raw) as usize;
    }
    Ok(out)
}

fn check_imported(
    def: &str,
    field: &str,
    entry: Entry,
    entry_size: usize,
    flag_size: usize,
) -> Result<()> {
    if entry.elem_offset() + entry.elem_size() > entry_size {
        return Err(Error::mismatch(format!(
            "{def}:{field} at {}+{} exceeds entry size {entry_size}",
            entry.elem_offset(),
            entry.elem_size()
        )));
    }
    if let Some(size) = entry.elem_type().fixed_size() {
        if size != entry.elem_size() {
            return Err(Error::mismatch(format!(
                "{def}:{field} {} field is {} bytes",
                entry.elem_type(),
                entry.elem_size()
            )));
        }
    }
    if let Some(bit) = entry.flag_offset() {
        let flags = entry_size * 8..(entry_size + flag_size) * 8;
        if !flags.contains(&(bit as usize)) {
            return Err(Error::mismatch(format!(
                "{def}:{field} flag bit {bit} outside {flags:?}"
            )));
        }
    }
    Ok(())
}

/// A finished, immutable object definition.
pub struct ObjDef {
    id: u32,
    name: String,
    entry_size: usize,
    flag_size: usize,
    priv_size: usize,
    entry_count: usize,
    trie: Trie,
    origin: Origin,
    hooks: Hooks,
}

impl ObjDef {
    /// Rebuilds a definition from a sealed trie exported by the other side.
    pub fn import(root: Vec<u8>, transport: Arc<dyn Transport>) -> Result<Self> {
        let trie = Trie::from_root(root)?;
        let meta = trie
            .self_info()
            .ok_or_else(|| Error::state("imported trie is not sealed"))?;
        let [entry_size, flag_size, priv_size, entry_count] = decode_meta(meta.ctx())?;
        let name = trie.name().to_owned();

        // every entry must decode and fit the layout before the definition
        // becomes visible
        for info in trie.iter() {
            let entry = Entry::from_bytes(info.ctx())?;
            check_imported(&name, info.name(), entry, entry_size, flag_size)?;
        }

        debug!("{name} imported entry size {entry_size} flag size {flag_size}");
        Ok(Self {
            id: NEXT_DEF_ID.fetch_add(1, Ordering::Relaxed),
            name,
            entry_size,
            flag_size,
            priv_size,
            entry_count,
            trie,
            origin: Origin::Shared(transport),
            hooks: Hooks::default(),
        })
    }

    /// Process-unique id used to validate [`FieldLoc`]s.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data region size in bytes.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Bit position of the first change flag.
    pub fn flag_base(&self) -> usize {
        self.entry_size * 8
    }

    /// Change bitmap size in bytes.
    pub fn flag_size(&self) -> usize {
        self.flag_size
    }

    /// Data region plus change bitmap.
    pub fn storage_size(&self) -> usize {
        self.entry_size + self.flag_size
    }

    /// Size of the per-object private extension.
    pub fn priv_size(&self) -> usize {
        self.priv_size
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.origin, Origin::Shared(_))
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Resolves a field name through the trie.
    pub fn get_entry(&self, name: &str) -> Result<FieldLoc> {
        let info = self
            .trie
            .get_info(name)
            .filter(|info| !info.is_self())
            .ok_or_else(|| Error::NotFound(format!("{}:{name}", self.name)))?;
        Ok(FieldLoc {
            def_id: self.id,
            entry: Entry::from_bytes(info.ctx())?,
        })
    }

    /// Byte offset of a field in the data region.
    pub fn get_offset(&self, name: &str) -> Result<usize> {
        self.get_entry(name).map(|loc| loc.offset())
    }

    /// Every field in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Entry)> + '_ {
        self.trie
            .iter()
            .filter_map(|info| Entry::from_bytes(info.ctx()).ok().map(|e| (info.name(), e)))
    }

    pub fn dump(&self) -> Value {
        let fields: Vec<Value> = self
            .entries()
            .map(|(name, e)| {
                json!({
                    "name": name,
                    "type": e.elem_type().as_str(),
                    "offset": e.elem_offset(),
                    "size": e.elem_size(),
                    "flag": e.flag_offset(),
                    "access": e.access(),
                })
            })
            .collect();
        json!({
            "name": self.name,
            "shared": self.is_shared(),
            "entry_size": self.entry_size,
            "flag_base": self.flag_base(),
            "flag_size": self.flag_size,
            "priv_size": self.priv_size,
            "trie_size": self.trie.get_buf_size(),
            "fields": fields,
        })
    }
}

impl fmt::Debug for ObjDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entry_size", &self.entry_size)
            .field("flag_size", &self.flag_size)
            .field("shared", &self.is_shared())
            .finish()
    }
}

const REBUILD_MAX: usize = 8;

/// Staged registration of a local definition.
///
/// Nothing is visible to other users until [`crate::Registry::publish`]
/// succeeds, so an aborted registration leaves no partial schema behind.
pub struct ObjDefBuilder {
    name: String,
    entry_size: usize,
    priv_size: usize,
    alloc: FlagAllocator,
    fields: Vec<(String, Entry)>,
    flag_max: u16,
    trie: Trie,
    nodes: usize,
    info_bytes: usize,
    hooks: Hooks,
}

impl ObjDefBuilder {
    /// Starts a definition with a data region of `size` bytes, rounded up
    /// to 32 bits.
    pub fn new(name: &str, size: usize) -> Self {
        let entry_size = (size + 3) & !3;
        let nodes = 64;
        let info_bytes = 2048;
        Self {
            name: name.to_owned(),
            entry_size,
            priv_size: 0,
            alloc: FlagAllocator::new(entry_size),
            fields: Vec::new(),
            flag_max: 0,
            trie: Trie::new(name),
            nodes,
            info_bytes,
            hooks: Hooks::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Appends one field and resolves its change flag.
    ///
    /// On error the builder is left exactly as before the call.
    pub fn add_entry(&mut self, name: &str, field: FieldDesc) -> Result<Entry> {
        if field.offset + field.size > self.entry_size {
            return Err(Error::mismatch(format!(
                "{}:{name} at {}+{} exceeds entry size {}",
                self.name, field.offset, field.size, self.entry_size
            )));
        }
        if let Some(size) = field.elem_type.fixed_size() {
            if size != field.size {
                return Err(Error::mismatch(format!(
                    "{}:{name} {} field is {} bytes",
                    self.name, field.elem_type, field.size
                )));
            }
        }
        let (offset, size) = match (u16::try_from(field.offset), u16::try_from(field.size)) {
            (Ok(o), Ok(s)) => (o, s),
            _ => return Err(Error::exhausted(format!("{}:{name} location", self.name))),
        };
        if (name.len() + 4) & !3 > INFO_STR_MAX {
            return Err(Error::exhausted(format!("{}:{name} name length", self.name)));
        }

        let mut alloc = self.alloc.clone();
        let flag = alloc.resolve(name, field.flag)?;
        let entry = Entry::new(field.elem_type, offset, size, flag, field.access);

        self.insert(name, entry)?;
        self.alloc = alloc;
        self.flag_max = self.flag_max.max(flag);
        self.fields.push((name.to_owned(), entry));
        Ok(entry)
    }

    fn insert(&mut self, name: &str, entry: Entry) -> Result<()> {
        for _ in 0..REBUILD_MAX {
            match self.trie.add_info(name, &entry.to_bytes()) {
                Err(Error::ResourceExhausted(_)) => self.grow()?,
                res => return res.map(drop),
            }
        }
        Err(Error::exhausted(format!("{} trie rebuild", self.name)))
    }

    fn grow(&mut self) -> Result<()> {
        let mut nodes = self.nodes * 2;
        let mut info_bytes = (self.info_bytes * 2).max(
            self.fields
                .iter()
                .map(|(n, _)| info_size(n.len(), Entry::SIZE))
                .sum::<usize>()
                * 2,
        );
        for _ in 0..REBUILD_MAX {
            let mut trie = Trie::with_capacity(&self.name, nodes, info_bytes)?;
            let res = self
                .fields
                .iter()
                .try_for_each(|(n, e)| trie.add_info(n, &e.to_bytes()).map(drop));
            match res {
                Ok(()) => {
                    debug!(
                        "{} trie rebuilt with {nodes} nodes {info_bytes} info bytes",
                        self.name
                    );
                    self.trie = trie;
                    self.nodes = nodes;
                    self.info_bytes = info_bytes;
                    return Ok(());
                }
                Err(Error::ResourceExhausted(_)) => {
                    nodes *= 2;
                    info_bytes *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::exhausted(format!("{} trie rebuild", self.name)))
    }

    /// Registers a local init hook. Default objects are all zero.
    pub fn add_init(&mut self, init: InitHook) -> &mut Self {
        self.hooks.init = Some(init);
        self
    }

    pub fn add_deinit(&mut self, deinit: DeinitHook) -> &mut Self {
        self.hooks.deinit = Some(deinit);
        self
    }

    pub fn add_dump(&mut self, dump: DumpHook) -> &mut Self {
        self.hooks.dump = Some(dump);
        self
    }

    /// Sets a named definition property. Only `priv_size` is known.
    pub fn set_prop(&mut self, op: &str, value: usize) -> Result<()> {
        match op {
            "priv_size" => {
                self.priv_size = value;
                Ok(())
            }
            _ => Err(Error::Unsupported(format!("{} property {op}", self.name))),
        }
    }

    /// Seals the trie and produces the immutable definition.
    pub fn finish(mut self) -> Result<ObjDef> {
        let base = self.entry_size * 8;
        let bits = (self.flag_max as usize + 1).saturating_sub(base);
        let flag_size = if self.flag_max == 0 {
            0
        } else {
            ((bits + 31) & !31) / 8
        };
        let meta = encode_meta(self.entry_size, flag_size, self.priv_size, self.fields.len());

        let mut sealed = false;
        for _ in 0..REBUILD_MAX {
            match self.trie.seal(&meta) {
                Ok(()) => {
                    sealed = true;
                    break;
                }
                Err(Error::ResourceExhausted(_)) => self.grow()?,
                Err(e) => return Err(e),
            }
        }
        if !sealed {
            return Err(Error::exhausted(format!("{} trie seal", self.name)));
        }

        debug!(
            "{} registered entry size {} flag size {} fields {}",
            self.name,
            self.entry_size,
            flag_size,
            self.fields.len()
        );
        Ok(ObjDef {
            id: NEXT_DEF_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            entry_size: self.entry_size,
            flag_size,
            priv_size: self.priv_size,
            entry_count: self.fields.len(),
            trie: self.trie,
            origin: Origin::Local,
            hooks: self.hooks,
        })
    }
}
