// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Compact 16-way name trie shared across the privilege boundary.
//!
//! The whole trie lives in one byte buffer addressed by offsets only, so it
//! can be copied between address spaces and attached on the other side
//! without fixing up any pointer.
//!
//! ```text
//! +-----------------+  header: magic, node/info counters, capacities
//! |  header (32 B)  |
//! +-----------------+  node_max nodes of 16 little-endian u32 slots
//! |     nodes       |
//! +-----------------+  info records appended in insertion order
//! |     infos       |
//! +-----------------+
//!
//! info record: [index:12 | ctx_len:12 | str_len:8] [name\0 pad4] [ctx pad4]
//! ```
//!
//! Each key byte is consumed as two nibbles, high nibble first, with a
//! trailing NUL so that no key is a prefix of another. A slot is either
//! empty, a child node index, or a leaf (bit 31) pointing at an info record.
//! A leaf is stored at the shallowest unique position; when a new key lands
//! on an occupied leaf the old leaf is pushed down into freshly allocated
//! nodes until the two keys diverge.
//!
//! The buffer never grows. Callers size it up front and rebuild with a larger
//! capacity when [`Trie::add_info`] reports exhaustion.

use crate::error::{Error, Result};
use tracing::debug;

/// Bits consumed per trie level.
pub const TRIE_KEY_LEN: usize = 4;
/// Fan-out of every node.
pub const TRIE_KEY_MAX: usize = 1 << TRIE_KEY_LEN;

/// Largest entry index an info record can hold.
pub const INFO_INDEX_MAX: usize = (1 << 12) - 1;
/// Largest context blob an info record can hold.
pub const INFO_CTX_MAX: usize = (1 << 12) - 1;
/// Largest padded name an info record can hold.
pub const INFO_STR_MAX: usize = (1 << 8) - 1;

const TRIE_MAGIC: u32 = u32::from_le_bytes(*b"KTRI");
const HEADER_SIZE: usize = 32;
const NODE_SIZE: usize = TRIE_KEY_MAX * 4;
const INFO_HEAD_SIZE: usize = 4;

const SLOT_EMPTY: u32 = 0;
const SLOT_LEAF: u32 = 1 << 31;

const DEFAULT_NODES: usize = 64;
const DEFAULT_INFO_BYTES: usize = 2048;

const H_MAGIC: usize = 0;
const H_NODE_COUNT: usize = 1;
const H_NODE_MAX: usize = 2;
const H_INFO_COUNT: usize = 3;
const H_INFO_USED: usize = 4;
const H_INFO_MAX: usize = 5;
const H_NAME_MAX: usize = 6;
// offset + 1 of the self-descriptor, zero while the trie is open
const H_SELF: usize = 7;

const fn align4(v: usize) -> usize {
    (v + 3) & !3
}

/// Returns true for reserved self-descriptor names.
pub fn is_self_name(name: &str) -> bool {
    name.contains("__")
}

/// Bytes an info record with the given name and context occupies.
pub const fn info_size(name_len: usize, ctx_len: usize) -> usize {
    INFO_HEAD_SIZE + align4(name_len + 1) + align4(ctx_len)
}

fn word(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn put_word(buf: &mut [u8], pos: usize, val: u32) {
    buf[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
}

fn nibble(key: &[u8], depth: usize) -> usize {
    // past the end reads the NUL terminator
    let byte = key.get(depth / 2).copied().unwrap_or(0);
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0xf) as usize
    }
}

/// One resolved trie entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieInfo<'a> {
    index: usize,
    offset: usize,
    name: &'a str,
    ctx: &'a [u8],
}

impl<'a> TrieInfo<'a> {
    /// Insertion index of the entry.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Opaque context blob stored with the name.
    pub fn ctx(&self) -> &'a [u8] {
        self.ctx
    }

    pub fn ctx_len(&self) -> usize {
        self.ctx.len()
    }

    /// True for the trie's own metadata entry.
    pub fn is_self(&self) -> bool {
        is_self_name(self.name)
    }

    fn next_offset(&self) -> usize {
        self.offset + info_size(self.name.len(), self.ctx.len())
    }
}

/// Read-only view over a trie buffer, owned or imported.
#[derive(Debug, Clone, Copy)]
pub struct TrieView<'a> {
    buf: &'a [u8],
}

impl<'a> TrieView<'a> {
    /// Attaches to a trie buffer built elsewhere without copying it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the header is malformed or the
    /// buffer is shorter than the layout it describes.
    pub fn init_by_root(root: &'a [u8]) -> Result<Self> {
        let bad = |why: &str| Error::state(format!("bad trie root: {why}"));

        if root.len() < HEADER_SIZE {
            return Err(bad("short header"));
        }
        let view = TrieView { buf: root };
        if view.header(H_MAGIC) != TRIE_MAGIC {
            return Err(bad("magic"));
        }
        let node_max = view.header(H_NODE_MAX) as usize;
        let node_count = view.header(H_NODE_COUNT) as usize;
        let info_max = view.header(H_INFO_MAX) as usize;
        let info_used = view.header(H_INFO_USED) as usize;
        if node_count == 0 || node_count > node_max {
            return Err(bad("node count"));
        }
        if info_used > info_max {
            return Err(bad("info usage"));
        }
        let need = node_max
            .checked_mul(NODE_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE + info_max))
            .ok_or_else(|| bad("capacity"))?;
        if need > root.len() {
            return Err(bad("truncated"));
        }
        Ok(view)
    }

    fn header(&self, idx: usize) -> u32 {
        word(self.buf, idx * 4).unwrap_or(0)
    }

    fn info_base(&self) -> usize {
        HEADER_SIZE + self.header(H_NODE_MAX) as usize * NODE_SIZE
    }

    fn slot(&self, node: usize, nib: usize) -> u32 {
        word(self.buf, HEADER_SIZE + node * NODE_SIZE + nib * 4).unwrap_or(SLOT_EMPTY)
    }

    fn info_at(&self, offset: usize) -> Option<TrieInfo<'a>> {
        if offset >= self.header(H_INFO_USED) as usize {
            return None;
        }
        let base = self.info_base() + offset;
        let head = word(self.buf, base)?;
        let index = (head & 0xfff) as usize;
        let ctx_len = ((head >> 12) & 0xfff) as usize;
        let str_len = ((head >> 24) & 0xff) as usize;

        let name_pos = base + INFO_HEAD_SIZE;
        let raw = self.buf.get(name_pos..name_pos + str_len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let name = std::str::from_utf8(&raw[..end]).ok()?;
        let ctx_pos = name_pos + str_len;
        let ctx = self.buf.get(ctx_pos..ctx_pos + ctx_len)?;

        Some(TrieInfo {
            index,
            offset,
            name,
            ctx,
        })
    }

    /// Resolves `name` to its info record.
    pub fn get_info(&self, name: &str) -> Option<TrieInfo<'a>> {
        let key = name.as_bytes();
        if key.is_empty() || key.contains(&0) {
            return None;
        }
        let node_count = self.header(H_NODE_COUNT) as usize;
        let mut node = 0;

        for depth in 0..(key.len() + 1) * 2 {
            let slot = self.slot(node, nibble(key, depth));
            if slot == SLOT_EMPTY {
                return None;
            }
            if slot & SLOT_LEAF != 0 {
                let info = self.info_at((slot & !SLOT_LEAF) as usize)?;
                return (info.name == name).then_some(info);
            }
            node = slot as usize;
            if node >= node_count {
                return None;
            }
        }
        None
    }

    /// First entry in insertion order.
    pub fn get_info_first(&self) -> Option<TrieInfo<'a>> {
        if self.header(H_INFO_COUNT) == 0 {
            return None;
        }
        self.info_at(0).filter(|info| !info.is_self())
    }

    /// Entry following `info`, stopping at the self-descriptor.
    pub fn get_info_next(&self, info: &TrieInfo<'_>) -> Option<TrieInfo<'a>> {
        self.info_at(info.next_offset())
            .filter(|info| !info.is_self())
    }

    /// Iterates every regular entry in insertion order.
    pub fn iter(&self) -> TrieIter<'a> {
        TrieIter {
            view: *self,
            next: self.get_info_first(),
        }
    }

    /// The self-descriptor written by [`Trie::seal`], if any.
    pub fn self_info(&self) -> Option<TrieInfo<'a>> {
        match self.header(H_SELF) as usize {
            0 => None,
            pos => self.info_at(pos - 1),
        }
    }

    /// Name recorded in the self-descriptor.
    pub fn name(&self) -> Option<&'a str> {
        self.self_info().map(|info| info.name.trim_start_matches("__"))
    }

    pub fn is_sealed(&self) -> bool {
        self.header(H_SELF) != 0
    }

    pub fn get_node_count(&self) -> usize {
        self.header(H_NODE_COUNT) as usize
    }

    pub fn get_info_count(&self) -> usize {
        self.header(H_INFO_COUNT) as usize
    }

    pub fn get_name_max(&self) -> usize {
        self.header(H_NAME_MAX) as usize
    }

    pub fn get_buf_size(&self) -> usize {
        self.buf.len()
    }

    /// The position-independent buffer, suitable for a raw copy.
    pub fn get_node_root(&self) -> &'a [u8] {
        self.buf
    }

    /// Logs the layout and every entry at debug level.
    pub fn dump(&self, caller: &str) {
        debug!(
            "{caller}: trie {} nodes {}/{} infos {} used {}/{} bytes",
            self.name().unwrap_or("<open>"),
            self.get_node_count(),
            self.header(H_NODE_MAX),
            self.get_info_count(),
            self.header(H_INFO_USED),
            self.header(H_INFO_MAX),
        );
        for info in self.iter() {
            debug!(
                "{caller}: {:>4} {:<24} ctx {} bytes",
                info.index,
                info.name,
                info.ctx.len()
            );
        }
    }
}

/// Iterator over trie entries in insertion order.
pub struct TrieIter<'a> {
    view: TrieView<'a>,
    next: Option<TrieInfo<'a>>,
}

impl<'a> Iterator for TrieIter<'a> {
    type Item = TrieInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.next = self.view.get_info_next(&cur);
        Some(cur)
    }
}

/// One-shot lookup against an imported root buffer.
pub fn get_info_from_root<'a>(root: &'a [u8], name: &str) -> Option<TrieInfo<'a>> {
    TrieView::init_by_root(root).ok()?.get_info(name)
}

/// Owned, append-only trie.
#[derive(Debug, Clone)]
pub struct Trie {
    name: String,
    buf: Vec<u8>,
}

impl Trie {
    /// Creates a trie with a default capacity.
    pub fn new(name: &str) -> Self {
        Self::alloc(name, DEFAULT_NODES, DEFAULT_INFO_BYTES)
    }

    /// Creates a trie able to hold `nodes` nodes and `info_bytes` of info
    /// records (see [`info_size`]).
    pub fn with_capacity(name: &str, nodes: usize, info_bytes: usize) -> Result<Self> {
        if nodes == 0 || nodes >= SLOT_LEAF as usize {
            return Err(Error::exhausted(format!("trie {name} node capacity {nodes}")));
        }
        if info_bytes >= SLOT_LEAF as usize {
            return Err(Error::exhausted(format!(
                "trie {name} info capacity {info_bytes}"
            )));
        }
        Ok(Self::alloc(name, nodes, align4(info_bytes)))
    }

    fn alloc(name: &str, nodes: usize, info_bytes: usize) -> Self {
        let mut buf = vec![0u8; HEADER_SIZE + nodes * NODE_SIZE + info_bytes];
        put_word(&mut buf, H_MAGIC * 4, TRIE_MAGIC);
        put_word(&mut buf, H_NODE_COUNT * 4, 1);
        put_word(&mut buf, H_NODE_MAX * 4, nodes as u32);
        put_word(&mut buf, H_INFO_MAX * 4, info_bytes as u32);
        Self {
            name: name.to_owned(),
            buf,
        }
    }

    /// Takes ownership of a buffer imported from the other side without
    /// rebuilding it.
    pub fn from_root(root: Vec<u8>) -> Result<Self> {
        let name = TrieView::init_by_root(&root)?
            .name()
            .unwrap_or_default()
            .to_owned();
        Ok(Self { name, buf: root })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view(&self) -> TrieView<'_> {
        TrieView { buf: &self.buf }
    }

    pub fn get_info(&self, name: &str) -> Option<TrieInfo<'_>> {
        self.view().get_info(name)
    }

    pub fn get_info_first(&self) -> Option<TrieInfo<'_>> {
        self.view().get_info_first()
    }

    pub fn get_info_next(&self, info: &TrieInfo<'_>) -> Option<TrieInfo<'_>> {
        self.view().get_info_next(info)
    }

    pub fn iter(&self) -> TrieIter<'_> {
        self.view().iter()
    }

    pub fn self_info(&self) -> Option<TrieInfo<'_>> {
        self.view().self_info()
    }

    pub fn is_sealed(&self) -> bool {
        self.view().is_sealed()
    }

    pub fn get_node_count(&self) -> usize {
        self.view().get_node_count()
    }

    pub fn get_info_count(&self) -> usize {
        self.view().get_info_count()
    }

    pub fn get_name_max(&self) -> usize {
        self.view().get_name_max()
    }

    pub fn get_buf_size(&self) -> usize {
        self.buf.len()
    }

    pub fn get_node_root(&self) -> &[u8] {
        &self.buf
    }

    pub fn dump(&self, caller: &str) {
        self.view().dump(caller)
    }

    /// Appends `name` with its context blob and returns the entry index.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyExists`] if `name` is already present
    /// - [`Error::ResourceExhausted`] if the node or info area is full, or the
    ///   name or context exceeds the record field widths
    /// - [`Error::InvalidState`] if the trie is sealed or `name` is reserved
    pub fn add_info(&mut self, name: &str, ctx: &[u8]) -> Result<usize> {
        if is_self_name(name) {
            return Err(Error::state(format!("{name} is a reserved trie name")));
        }
        self.insert(name, ctx)
    }

    /// Terminates the trie with its self-descriptor `"__<name>"` carrying
    /// `meta`. Enumeration stops there and no entry can be added afterwards.
    pub fn seal(&mut self, meta: &[u8]) -> Result<()> {
        let name = format!("__{}", self.name);
        let offset = self.view().header(H_INFO_USED);
        self.insert(&name, meta)?;
        put_word(&mut self.buf, H_SELF * 4, offset + 1);
        Ok(())
    }

    fn insert(&mut self, name: &str, ctx: &[u8]) -> Result<usize> {
        let view = self.view();
        if view.is_sealed() {
            return Err(Error::state(format!("trie {} is sealed", self.name)));
        }
        let key = name.as_bytes();
        if key.is_empty() || key.contains(&0) {
            return Err(Error::state(format!("invalid trie name {name:?}")));
        }
        let str_len = align4(key.len() + 1);
        if str_len > INFO_STR_MAX {
            return Err(Error::exhausted(format!("trie name {name} too long")));
        }
        if ctx.len() > INFO_CTX_MAX {
            return Err(Error::exhausted(format!(
                "trie ctx for {name} is {} bytes",
                ctx.len()
            )));
        }
        let index = view.get_info_count();
        if index > INFO_INDEX_MAX {
            return Err(Error::exhausted(format!("trie {} entry count", self.name)));
        }
        if view.get_info(name).is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }

        let offset = view.header(H_INFO_USED) as usize;
        let size = info_size(key.len(), ctx.len());
        if offset + size > view.header(H_INFO_MAX) as usize {
            return Err(Error::exhausted(format!("trie {} info area", self.name)));
        }
        let needed = self.nodes_needed(key)?;
        if view.get_node_count() + needed > view.header(H_NODE_MAX) as usize {
            return Err(Error::exhausted(format!("trie {} node area", self.name)));
        }

        // capacity is checked above so placement can not fail half way
        self.place(key, offset)?;

        let base = self.view().info_base() + offset;
        let head = (index as u32 & 0xfff)
            | ((ctx.len() as u32 & 0xfff) << 12)
            | ((str_len as u32 & 0xff) << 24);
        put_word(&mut self.buf, base, head);
        let name_pos = base + INFO_HEAD_SIZE;
        self.buf[name_pos..name_pos + key.len()].copy_from_slice(key);
        let ctx_pos = name_pos + str_len;
        self.buf[ctx_pos..ctx_pos + ctx.len()].copy_from_slice(ctx);

        let name_max = self.view().get_name_max().max(key.len());
        put_word(&mut self.buf, H_INFO_COUNT * 4, index as u32 + 1);
        put_word(&mut self.buf, H_INFO_USED * 4, (offset + size) as u32);
        put_word(&mut self.buf, H_NAME_MAX * 4, name_max as u32);
        Ok(index)
    }

    fn leaf_key(&self, slot: u32) -> Result<Vec<u8>> {
        self.view()
            .info_at((slot & !SLOT_LEAF) as usize)
            .map(|info| info.name.as_bytes().to_vec())
            .ok_or_else(|| Error::state(format!("trie {} leaf is dangling", self.name)))
    }

    fn nodes_needed(&self, key: &[u8]) -> Result<usize> {
        let view = self.view();
        let mut node = 0;
        let mut depth = 0;
        loop {
            let slot = view.slot(node, nibble(key, depth));
            if slot == SLOT_EMPTY {
                return Ok(0);
            }
            if slot & SLOT_LEAF == 0 {
                node = slot as usize;
                depth += 1;
                continue;
            }
            let old = self.leaf_key(slot)?;
            let limit = (old.len().max(key.len()) + 1) * 2;
            let mut d = depth + 1;
            let mut count = 1;
            while d < limit && nibble(&old, d) == nibble(key, d) {
                d += 1;
                count += 1;
            }
            return Ok(count);
        }
    }

    fn set_slot(&mut self, node: usize, nib: usize, val: u32) {
        put_word(&mut self.buf, HEADER_SIZE + node * NODE_SIZE + nib * 4, val);
    }

    fn alloc_node(&mut self) -> usize {
        let node = self.view().get_node_count();
        put_word(&mut self.buf, H_NODE_COUNT * 4, node as u32 + 1);
        node
    }

    fn place(&mut self, key: &[u8], offset: usize) -> Result<()> {
        let leaf = SLOT_LEAF | offset as u32;
        let mut node = 0;
        let mut depth = 0;
        loop {
            let nib = nibble(key, depth);
            let slot = self.view().slot(node, nib);
            if slot == SLOT_EMPTY {
                self.set_slot(node, nib, leaf);
                return Ok(());
            }
            if slot & SLOT_LEAF == 0 {
                node = slot as usize;
                depth += 1;
                continue;
            }

            // push the old leaf down until both keys diverge
            let old = self.leaf_key(slot)?;
            let mut cur = node;
            let mut d = depth;
            loop {
                let child = self.alloc_node();
                self.set_slot(cur, nibble(&old, d), child as u32);
                d += 1;
                let (on, nn) = (nibble(&old, d), nibble(key, d));
                if on != nn {
                    self.set_slot(child, on, slot);
                    self.set_slot(child, nn, leaf);
                    return Ok(());
                }
                cur = child;
            }
        }
    }
}
