// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst KMPP Object and Buffer Library
//!
//! This library provides the named-property object system used to share
//! media structures (frames, packets, buffer and encoder configuration)
//! between a privileged context and user space, together with the
//! reference-counted buffer pools those structures point into.
//!
//! ## Features
//!
//! - **Compact Trie**: Position-independent name index that can be copied
//!   across the privilege boundary as raw bytes.
//! - **Object Definitions**: Field layouts with deterministic change-flag
//!   allocation, registered locally or imported from the privileged side.
//! - **Objects**: Typed access by name or by pre-resolved location, change
//!   tracking, diff propagation with [`Obj::update`] and synchronous
//!   transactions with [`Obj::ioctl`].
//! - **Buffer Groups**: DMA heap or host memory pools with an 8-state buffer
//!   life cycle and dual-authority release.
//! - **Ring Buffers**: FIFO packet staging inside one buffer.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_kmpp::{schemas::KmppFrame, Obj, Registry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new();
//! let frame = KmppFrame::register(&registry)?;
//!
//! let obj = frame.get()?;
//! frame.set_width(&obj, 1920)?;
//! obj.set_u32("height", 1080)?;
//!
//! let mirror = frame.get_local()?;
//! Obj::update(&mirror, &obj)?;
//! assert_eq!(frame.get_height(&mirror)?, 1080);
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! `unsafe` is limited to the DMA buffer mapping and cache maintenance ioctl
//! in [`buffer`].

pub mod buffer;
pub mod error;
mod macros;
pub mod object;
pub mod objdef;
pub mod registry;
pub mod ring;
pub mod schemas;
pub mod shm;
pub mod trie;

#[doc(hidden)]
pub use paste;

pub use buffer::{
    Allocator, Authority, BufRef, BufState, BufWatch, BufferGroup, BufferMode, CreatorReleases,
    DmaHeapAllocator, GroupServer, GroupStats, HostAllocator, Memory, ReleasePolicy,
};
pub use error::{Error, Result};
pub use object::{FieldSlot, LocalBackend, Obj, SharedBackend, Storage};
pub use objdef::{
    ElemType, ElemValue, Entry, FieldDesc, FieldLoc, FlagAllocator, FlagDesc, FlagOp, Layout,
    ObjDef, ObjDefBuilder, UserPtr,
};
pub use registry::Registry;
pub use ring::{RingBuf, RingBufPool};
pub use shm::{LoopbackTransport, ShmPtr, Transport};
pub use trie::{Trie, TrieInfo, TrieView};
