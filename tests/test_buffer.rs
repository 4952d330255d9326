// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_kmpp::{
    schemas::{KmppBufCfg, KmppBufGrpCfg},
    Allocator, Authority, BufRef, BufState, BufferGroup, BufferMode, DmaHeapAllocator, Error,
    HostAllocator, LoopbackTransport, Memory, Registry, ReleasePolicy,
};
use serial_test::serial;
use std::{
    error::Error as StdError,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

#[derive(Default)]
struct CountingAllocator {
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingAllocator {
    fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn name(&self) -> &str {
        "counting"
    }

    fn alloc(&self, size: usize) -> edgefirst_kmpp::Result<Memory> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(Memory::host(size))
    }

    fn free(&self, memory: Memory) -> edgefirst_kmpp::Result<()> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        drop(memory);
        Ok(())
    }
}

/// The side that drops the last reference destroys the buffer.
struct ReleaserDestroys;

impl ReleasePolicy for ReleaserDestroys {
    fn owner(&self, _creator: Authority, releaser: Authority) -> Authority {
        releaser
    }
}

fn internal_group(
    registry: &Registry,
    count: u32,
    size: u32,
) -> Result<BufferGroup, Box<dyn StdError>> {
    let group = BufferGroup::get(registry)?;
    let cfg = group.cfg_mut()?;
    group.cfg_def().set_count(cfg, count)?;
    group.cfg_def().set_size(cfg, size)?;
    Ok(group)
}

fn external_group(
    registry: &Registry,
    count: u32,
    alloc: Arc<CountingAllocator>,
) -> Result<BufferGroup, Box<dyn StdError>> {
    let group = BufferGroup::get(registry)?;
    let cfg = group.cfg_mut()?;
    group.cfg_def().set_count(cfg, count)?;
    group.cfg_def().set_mode(cfg, BufferMode::External as u32)?;
    group.set_allocator(alloc)?;
    Ok(group)
}

#[test]
fn test_state_order() {
    use BufState::*;

    let life = [None, Init, InitToUsed, Used, Unused, UsedToDeinit, DeinitAtGrp];
    for pair in life.windows(2) {
        assert!(pair[0].can_move_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        assert!(!pair[1].can_move_to(pair[0]) || pair[1] == Unused);
    }
    assert!(Unused.can_move_to(Used));
    assert!(Used.can_move_to(UsedToDeinit));
    assert!(Unused.can_move_to(DeinitAtSrv));
    assert!(UsedToDeinit.can_move_to(DeinitAtSrv));

    // no skipping ahead
    assert!(!None.can_move_to(InitToUsed));
    assert!(!Init.can_move_to(Used));
    assert!(!InitToUsed.can_move_to(Unused));
    assert!(!Init.can_move_to(DeinitAtGrp));
    assert!(!Used.can_move_to(DeinitAtGrp));
    assert!(!Used.can_move_to(DeinitAtSrv));

    assert!(!Used.can_move_to(Init));
    assert!(!Unused.can_move_to(InitToUsed));
    assert!(!Init.can_move_to(None));
    assert!(!DeinitAtGrp.can_move_to(DeinitAtSrv));
    assert!(!DeinitAtSrv.can_move_to(Used));

    for v in 0..8 {
        let state = BufState::from_u32(v).map(|s| s as u32);
        assert_eq!(state, Some(v));
    }
    assert_eq!(BufState::from_u32(8), Option::None);
    assert_eq!(UsedToDeinit.to_string(), "used_to_deinit");
}

#[test]
fn test_reuse() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let group = internal_group(&registry, 2, 4096)?;
    group.set_name("reuse")?;
    group.setup()?;
    assert!(group.is_ready());
    assert_eq!(group.name(), "reuse");

    let b0 = group.get_buffer()?;
    let b1 = group.get_buffer()?;
    assert_eq!((b0.index(), b1.index()), (0, 1));
    assert_eq!(b0.state(), BufState::Used);
    assert_eq!(b0.refs(), 1);
    assert_eq!(b0.size(), 4096);
    assert_eq!(b0.creator(), Authority::Group);
    assert!(b0.has_group());
    assert!(matches!(
        group.get_buffer(),
        Err(Error::ResourceExhausted(_))
    ));
    assert_eq!(group.cfg_def().get_used(group.cfg())?, 2);

    let uid = b0.uid();
    let watch = b0.watch();
    drop(b0);
    assert_eq!(watch.state(), BufState::Unused);
    assert_eq!(watch.refs(), 0);
    let stats = group.stats();
    assert_eq!((stats.count, stats.used, stats.unused), (2, 1, 1));
    assert_eq!(group.cfg_def().get_unused(group.cfg())?, 1);

    let b2 = group.get_buffer()?;
    assert_eq!(b2.uid(), uid);
    assert_eq!(b2.index(), 0);
    assert_eq!(watch.state(), BufState::Used);

    let buf_cfg = KmppBufCfg::register(&registry)?;
    assert_eq!(buf_cfg.get_size(b2.cfg())?, 4096);
    assert_eq!(buf_cfg.get_index(b2.cfg())?, 0);
    assert_eq!(buf_cfg.get_grp_id(b2.cfg())?, group.id());
    assert_eq!(buf_cfg.get_buf_uid(b2.cfg())?, uid);

    b2.write(16, b"kmpp")?;
    let mut out = [0u8; 4];
    b2.read(16, &mut out)?;
    assert_eq!(&out, b"kmpp");
    assert!(matches!(b2.write(4094, b"kmpp"), Err(Error::InvalidState(_))));
    assert_eq!(b2.raw_fd()?, -1);
    assert_eq!(b2.dma_fd()?, None);

    let dump = group.dump();
    assert_eq!(dump["name"], "reuse");
    assert_eq!(dump["buffers"][0]["state"], "used");
    assert_eq!(dump["allocator"], "host");

    b1.release()?;
    b2.release()?;
    assert_eq!(group.stats().unused, 2);
    Ok(())
}

#[test]
fn test_setup_rules() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();

    let group = BufferGroup::get(&registry)?;
    assert!(matches!(group.get_buffer(), Err(Error::InvalidState(_))));
    assert!(matches!(group.setup(), Err(Error::InvalidState(_))));
    group.cfg_def().set_count(group.cfg_mut()?, 1)?;
    assert!(matches!(group.setup(), Err(Error::InvalidState(_))));
    assert!(matches!(
        group.set_name(&"g".repeat(64)),
        Err(Error::ResourceExhausted(_))
    ));
    group.set_name(&"g".repeat(63))?;

    group.cfg_def().set_size(group.cfg_mut()?, 64)?;
    group.setup()?;
    assert!(matches!(group.setup(), Err(Error::InvalidState(_))));
    assert!(matches!(group.cfg_mut(), Err(Error::InvalidState(_))));
    assert!(matches!(group.set_name("late"), Err(Error::InvalidState(_))));
    assert!(matches!(
        group.set_allocator(Arc::new(HostAllocator)),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        group.import(Memory::host(64)),
        Err(Error::Unsupported(_))
    ));

    // external groups take their size from the imported memory
    let alloc = Arc::new(CountingAllocator::default());
    let external = external_group(&registry, 1, alloc.clone())?;
    external.setup()?;
    assert!(matches!(
        external.get_buffer(),
        Err(Error::ResourceExhausted(_))
    ));
    external.import(Memory::host(32))?;
    assert!(matches!(
        external.import(Memory::host(32)),
        Err(Error::ResourceExhausted(_))
    ));
    assert_eq!(alloc.allocs.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_shared_config() -> Result<(), Box<dyn StdError>> {
    let transport = Arc::new(LoopbackTransport::new());
    KmppBufGrpCfg::register(transport.kernel())?;
    let registry = Registry::with_transport(transport.clone());

    let group = internal_group(&registry, 1, 128)?;
    assert!(group.cfg().is_kobj());
    group.setup()?;
    let buf = group.get_buffer()?;
    assert!(!buf.cfg().is_kobj());
    drop(buf);

    group.put()?;
    assert_eq!(transport.shm_count(), 0);
    Ok(())
}

#[test]
fn test_teardown() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(CountingAllocator::default());
    let group = internal_group(&registry, 2, 256)?;
    group.set_allocator(alloc.clone())?;
    group.setup()?;

    let b0 = group.get_buffer()?;
    let b1 = group.get_buffer()?;
    assert_eq!(alloc.allocs.load(Ordering::SeqCst), 2);
    b1.release()?;

    let server = group.server();
    let watch = b0.watch();
    group.put()?;
    assert_eq!(alloc.frees(), 1);
    assert_eq!(watch.state(), BufState::UsedToDeinit);
    assert_eq!(watch.destroyed_by(), None);

    // memory stays usable until the last reference goes
    b0.write(0, &[1, 2, 3])?;
    b0.release()?;
    assert_eq!(watch.state(), BufState::DeinitAtGrp);
    assert_eq!(watch.destroyed_by(), Some(Authority::Group));
    assert_eq!(alloc.frees(), 2);

    let stats = server.stats();
    assert_eq!(stats.count, 0);
    assert_eq!(stats.destroyed_at_grp, 2);
    assert_eq!(stats.destroyed_at_srv, 0);
    Ok(())
}

#[test]
fn test_dual_authority() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 2, alloc.clone())?;
    group.setup()?;
    group.import(Memory::host(512))?;
    group.import(Memory::host(512))?;
    assert_eq!(group.stats().unused, 2);

    let buf = group.get_buffer()?;
    assert_eq!(buf.creator(), Authority::Server);
    assert_eq!(buf.authority(), Authority::Group);
    let srv = buf.inc_ref(Authority::Server)?;
    assert_eq!(buf.refs(), 2);

    let server = group.server();
    let watch = buf.watch();
    group.put()?;
    // the unused server-created buffer is owed to the server
    let stats = server.stats();
    assert_eq!((stats.unused, stats.deferred), (0, 1));
    assert_eq!(stats.destroyed_at_grp, 0);
    assert_eq!(alloc.frees(), 0);

    // a server release drains what the group deferred to it
    srv.release()?;
    assert_eq!(watch.state(), BufState::UsedToDeinit);
    let stats = server.stats();
    assert_eq!((stats.deferred, stats.destroyed_at_srv), (0, 1));
    assert_eq!(alloc.frees(), 1);

    // the group drops the last reference of a server-created buffer
    buf.release()?;
    assert_eq!(watch.state(), BufState::UsedToDeinit);
    assert_eq!(watch.refs(), 0);
    assert_eq!(server.stats().deferred, 1);
    assert_eq!(alloc.frees(), 1);

    assert_eq!(server.collect()?, 1);
    assert_eq!(watch.state(), BufState::DeinitAtSrv);
    assert_eq!(watch.destroyed_by(), Some(Authority::Server));
    assert_eq!(alloc.frees(), 2);
    assert_eq!(server.collect()?, 0);
    Ok(())
}

#[test]
fn test_teardown_authority() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();

    // creator releases: an unused imported buffer waits for the server
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 1, alloc.clone())?;
    group.setup()?;
    group.import(Memory::host(64))?;
    let buf = group.get_buffer()?;
    let watch = buf.watch();
    buf.release()?;
    assert_eq!(watch.state(), BufState::Unused);

    let server = group.server();
    group.put()?;
    assert_eq!(watch.state(), BufState::UsedToDeinit);
    assert_eq!(watch.destroyed_by(), None);
    assert_eq!(server.stats().deferred, 1);
    assert_eq!(alloc.frees(), 0);

    assert_eq!(server.collect()?, 1);
    assert_eq!(watch.state(), BufState::DeinitAtSrv);
    assert_eq!(watch.destroyed_by(), Some(Authority::Server));
    let stats = server.stats();
    assert_eq!((stats.count, stats.destroyed_at_grp, stats.destroyed_at_srv), (0, 0, 1));
    assert_eq!(alloc.frees(), 1);

    // releaser destroys: the group tearing down is the releaser
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 1, alloc.clone())?;
    group.set_release_policy(Arc::new(ReleaserDestroys))?;
    group.setup()?;
    group.import(Memory::host(64))?;
    let buf = group.get_buffer()?;
    let watch = buf.watch();
    buf.release()?;

    let server = group.server();
    group.put()?;
    assert_eq!(watch.state(), BufState::DeinitAtGrp);
    assert_eq!(watch.destroyed_by(), Some(Authority::Group));
    assert_eq!(server.stats().deferred, 0);
    assert_eq!(server.collect()?, 0);
    assert_eq!(alloc.frees(), 1);

    // an uncollected deferral completes when the last handle goes
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 2, alloc.clone())?;
    group.setup()?;
    group.import(Memory::host(64))?;
    group.import(Memory::host(64))?;
    let server = group.server();
    group.put()?;
    assert_eq!(server.stats().deferred, 2);
    drop(server);
    assert_eq!(alloc.frees(), 2);
    Ok(())
}

#[test]
fn test_deferred_drained_by_owner() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 2, alloc.clone())?;
    group.setup()?;
    group.import(Memory::host(64))?;
    group.import(Memory::host(64))?;

    let b0 = group.get_buffer()?;
    let b1 = group.get_buffer()?;
    let s1 = b1.inc_ref(Authority::Server)?;
    let (p0, p1) = (b0.watch(), b1.watch());
    let server = group.server();
    group.put()?;

    b0.release()?;
    b1.release()?;
    assert_eq!(server.stats().deferred, 1);
    assert_eq!(p0.state(), BufState::UsedToDeinit);

    s1.release()?;
    assert_eq!(p0.state(), BufState::DeinitAtSrv);
    assert_eq!(p1.state(), BufState::DeinitAtSrv);
    let stats = server.stats();
    assert_eq!((stats.deferred, stats.destroyed_at_srv), (0, 2));
    assert_eq!(alloc.frees(), 2);
    Ok(())
}

#[test]
fn test_deferred_at_group_drop() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 1, alloc.clone())?;
    group.setup()?;
    group.import(Memory::host(64))?;

    let buf = group.get_buffer()?;
    let watch = buf.watch();
    drop(group);
    drop(buf);
    assert_eq!(watch.state(), BufState::DeinitAtSrv);
    assert_eq!(alloc.frees(), 1);
    Ok(())
}

#[test]
fn test_release_policy() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(CountingAllocator::default());
    let group = external_group(&registry, 1, alloc.clone())?;
    group.set_release_policy(Arc::new(ReleaserDestroys))?;
    group.setup()?;
    group.import(Memory::host(64))?;

    let buf = group.get_buffer()?;
    let watch = buf.watch();
    let server = group.server();
    group.put()?;
    buf.release()?;

    assert_eq!(watch.destroyed_by(), Some(Authority::Group));
    assert_eq!(server.stats().deferred, 0);
    assert_eq!(alloc.frees(), 1);
    Ok(())
}

#[test]
fn test_concurrent_release() -> Result<(), Box<dyn StdError>> {
    for _ in 0..20 {
        let registry = Registry::new();
        let alloc = Arc::new(CountingAllocator::default());
        let group = internal_group(&registry, 1, 64)?;
        group.set_allocator(alloc.clone())?;
        group.set_release_policy(Arc::new(ReleaserDestroys))?;
        group.setup()?;

        let buf = group.get_buffer()?;
        let refs = (0..8)
            .map(|i| {
                let side = if i % 2 == 0 {
                    Authority::Server
                } else {
                    Authority::Group
                };
                buf.inc_ref(side)
            })
            .collect::<Result<Vec<BufRef>, _>>()?;
        let watch = buf.watch();
        let server = group.server();
        group.put()?;
        buf.release()?;

        let handles: Vec<_> = refs
            .into_iter()
            .map(|r| thread::spawn(move || r.release()))
            .collect();
        for handle in handles {
            handle.join().map_err(|_| "release thread panicked")??;
        }

        assert!(watch.state().is_terminal());
        assert!(watch.destroyed_by().is_some());
        let stats = server.stats();
        assert_eq!(stats.destroyed_at_grp + stats.destroyed_at_srv, 1);
        assert_eq!(alloc.frees(), 1);
    }
    Ok(())
}

#[test]
fn test_standalone() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let buf = BufRef::standalone(&registry, Memory::host(128), Authority::Server)?;
    assert!(!buf.has_group());
    assert_eq!(buf.state(), BufState::Used);
    assert_eq!(buf.creator(), Authority::Server);
    assert_eq!(KmppBufCfg::register(&registry)?.get_grp_id(buf.cfg())?, -1);

    let other = buf.inc_ref(Authority::Group)?;
    let watch = buf.watch();
    buf.release()?;
    assert_eq!(watch.state(), BufState::Used);

    other.write(0, &[7; 128])?;
    drop(other);
    assert_eq!(watch.state(), BufState::DeinitAtSrv);
    assert_eq!(watch.destroyed_by(), Some(Authority::Server));
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires /dev/dma_heap"]
fn test_dma_heap() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = Arc::new(DmaHeapAllocator::cma()?);
    let group = internal_group(&registry, 2, 1920 * 1080 * 3 / 2)?;
    group.set_allocator(alloc)?;
    group.setup()?;

    let buf = group.get_buffer()?;
    assert!(buf.raw_fd()? >= 0);
    assert_eq!(buf.dma_fd()?, Some(buf.raw_fd()? as u32));
    let pattern: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    buf.write(0, &pattern)?;

    let mut out = vec![0u8; pattern.len()];
    buf.read(0, &mut out)?;
    assert_eq!(out, pattern);
    println!("{}", group.dump());
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires /dev/dma_heap"]
fn test_dma_heap_standalone() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let alloc = DmaHeapAllocator::system()?;
    let buf = BufRef::standalone(&registry, alloc.alloc(65536)?, Authority::Group)?;
    assert_eq!(buf.size(), 65536);
    buf.write(65532, &[1, 2, 3, 4])?;
    let mut out = [0u8; 4];
    buf.read(65532, &mut out)?;
    assert_eq!(out, [1, 2, 3, 4]);
    Ok(())
}
