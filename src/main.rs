// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::{Args, HeapSetting};
use clap::Parser;
use edgefirst_kmpp::{
    error::KMPP_NOK,
    object::{read_field, write_field},
    schemas::{KmppBufCfg, KmppBufGrpCfg, KmppFrame, KmppPacket, KmppVencCfg},
    Allocator, Authority, BufRef, BufferGroup, DmaHeapAllocator, Error as KmppError,
    HostAllocator, LoopbackTransport, Obj, Registry, RingBuf, RingBufPool,
};
use std::{
    collections::VecDeque,
    error::Error,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod args;

/// Encode one frame into one packet.
const CMD_ENCODE: u32 = 0x1;

/// Smallest packet reservation in the ring.
const RING_MIN_BUF: usize = 64;

/// Packets kept staged before the oldest one is handed off.
const RING_DEPTH: usize = 4;

/// Bytes of each frame the producer fills with a test pattern.
const PATTERN_LEN: usize = 4096;

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / elapsed.as_nanos().max(1) as i64;
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

fn init_tracing(args: &Args) -> Result<Option<tracy_client::Client>, Box<dyn Error>> {
    tracing_log::LogTracer::init().ok();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let journald = tracing_journald::layer().ok();
    let tracy = if args.tracy {
        Some(tracy_client::Client::start())
    } else {
        None
    };
    let tracy_layer = tracy.as_ref().map(|_| tracing_tracy::TracyLayer::default());

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(journald)
        .with(tracy_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(tracy)
}

/// Registers the schemas and the encode transaction on the privileged side.
fn kernel_side(transport: &LoopbackTransport) -> Result<(), Box<dyn Error>> {
    let kernel = transport.kernel();
    let frame = KmppFrame::register(kernel)?;
    let packet = KmppPacket::register(kernel)?;

    let width = frame.def().get_entry("width")?;
    let height = frame.def().get_entry("height")?;
    let pts = frame.def().get_entry("pts")?;
    let buf_size = frame.def().get_entry("buf_size")?;
    let length = packet.def().get_entry("length")?;
    let size = packet.def().get_entry("size")?;
    let pkt_pts = packet.def().get_entry("pts")?;
    let pkt_dts = packet.def().get_entry("dts")?;
    let status = packet.def().get_entry("status")?;

    let encode = move |input: Option<&[u8]>, output: Option<&mut [u8]>| -> i32 {
        let (Some(input), Some(output)) = (input, output) else {
            return KMPP_NOK;
        };
        let res = (|| -> edgefirst_kmpp::Result<()> {
            let w: u32 = read_field(input, &width)?;
            let h: u32 = read_field(input, &height)?;
            let ts: i64 = read_field(input, &pts)?;
            let bytes: u32 = read_field(input, &buf_size)?;
            if w == 0 || h == 0 {
                return Err(KmppError::state("frame without resolution"));
            }
            // intra frames every 30, the rest compress harder
            let ratio = if ts % 30 == 0 { 8 } else { 32 };
            let len = (bytes / ratio).max(RING_MIN_BUF as u32) as i32;
            write_field(output, &size, len)?;
            write_field(output, &length, len)?;
            write_field(output, &pkt_pts, ts)?;
            write_field(output, &pkt_dts, ts)?;
            write_field(output, &status, u32::from(ts % 30 == 0))?;
            Ok(())
        })();
        match res {
            Ok(()) => 0,
            Err(e) => {
                warn!("encode failed: {e}");
                e.code()
            }
        }
    };
    transport.add_ioctl(KmppPacket::NAME, CMD_ENCODE, Arc::new(encode));
    info!("privileged side ready with {:?}", kernel.names());
    Ok(())
}

fn allocator(heap: HeapSetting) -> Result<Arc<dyn Allocator>, KmppError> {
    Ok(match heap {
        HeapSetting::Cma => Arc::new(DmaHeapAllocator::cma()?),
        HeapSetting::System => Arc::new(DmaHeapAllocator::system()?),
        HeapSetting::Memory => Arc::new(HostAllocator),
    })
}

fn produce(
    args: Args,
    frame: KmppFrame,
    group: Arc<BufferGroup>,
    tx: kanal::Sender<(Obj, BufRef)>,
) -> Result<(), KmppError> {
    let pattern: Vec<u8> = (0..PATTERN_LEN.min(args.frame_bytes() as usize))
        .map(|i| (i % 251) as u8)
        .collect();
    let mut pts = 0i64;

    while args.frames == 0 || (pts as u64) < args.frames {
        let buf = match group.get_buffer() {
            Ok(buf) => buf,
            Err(KmppError::ResourceExhausted(_)) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(e) => return Err(e),
        };
        buf.write(0, &pattern)?;

        let obj = frame.get()?;
        frame.set_width(&obj, args.width())?;
        frame.set_height(&obj, args.height())?;
        frame.set_hor_stride(&obj, args.width())?;
        frame.set_ver_stride(&obj, args.height())?;
        frame.set_pts(&obj, pts)?;
        frame.set_dts(&obj, pts)?;
        frame.set_buf_size(&obj, buf.size() as u32)?;
        if let Some(fd) = buf.dma_fd()? {
            frame.set_buf_fd(&obj, fd)?;
        }

        if tx.send((obj, buf)).is_err() {
            debug!("consumer gone after {pts} frames");
            break;
        }
        pts += 1;
    }
    Ok(())
}

fn stage(
    ring: &mut RingBufPool,
    staged: &mut VecDeque<RingBuf>,
    data: &[u8],
) -> Result<(), KmppError> {
    let mut slot = loop {
        match ring.reserve(data.len()) {
            Ok(slot) => break slot,
            Err(KmppError::BufferFull { .. }) if !staged.is_empty() => {
                if let Some(oldest) = staged.pop_front() {
                    ring.release(oldest)?;
                }
            }
            Err(e) => return Err(e),
        }
    };
    ring.write(&mut slot, data)?;
    ring.commit(&mut slot)?;
    staged.push_back(slot);

    while staged.len() > RING_DEPTH {
        if let Some(oldest) = staged.pop_front() {
            ring.release(oldest)?;
        }
    }
    Ok(())
}

async fn consume(
    args: Args,
    frame: KmppFrame,
    packet: KmppPacket,
    mut ring: RingBufPool,
    rx: kanal::AsyncReceiver<(Obj, BufRef)>,
) -> Result<u64, Box<dyn Error>> {
    let mirror = frame.get_local()?;
    let timeout = Duration::from_millis(args.timeout);
    let mut staged = VecDeque::new();
    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    let mut count = 0u64;

    while let Ok((frame_obj, buf)) = rx.recv().await {
        let pkt = packet.get()?;
        let job = tokio::task::spawn_blocking(move || {
            let res = pkt.ioctl(CMD_ENCODE, Some(&frame_obj), Some(&pkt));
            (frame_obj, pkt, res)
        });
        let (frame_obj, pkt, res) = tokio::time::timeout(timeout, job).await??;
        res?;

        let len = packet.get_length(&pkt)? as usize;
        let len = len.min(ring.len() / RING_DEPTH).min(buf.size());
        let mut data = vec![0u8; len];
        buf.read(0, &mut data)?;
        stage(&mut ring, &mut staged, &data)?;

        mirror.clear_flags()?;
        let copied = Obj::update(&mirror, &frame_obj)?;
        debug!(
            "frame {} -> packet {} bytes, {copied} fields mirrored",
            frame.get_pts(&mirror)?,
            len
        );

        frame_obj.put()?;
        pkt.put()?;
        buf.release()?;

        count += 1;
        let fps = update_fps(&mut prev, &mut history, &mut index);
        if count % 30 == 0 {
            info!(
                "frames {count} fps {fps} ring use {} max {}",
                ring.use_len(),
                ring.max_use_len()
            );
        }
    }

    while let Some(oldest) = staged.pop_front() {
        ring.release(oldest)?;
    }
    Ok(count)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _tracy = init_tracing(&args)?;

    let transport = Arc::new(LoopbackTransport::new());
    kernel_side(&transport)?;

    let registry = Registry::with_transport(transport.clone());
    let frame = KmppFrame::register(&registry)?;
    let packet = KmppPacket::register(&registry)?;

    if args.dump {
        KmppVencCfg::register(&registry)?;
        KmppBufGrpCfg::register(&registry)?;
        KmppBufCfg::register(&registry)?;
        println!("{}", serde_json::to_string_pretty(&registry.dump())?);
        return Ok(());
    }

    let alloc = allocator(args.heap)?;
    let group = BufferGroup::get(&registry)?;
    let cfg = group.cfg_mut()?;
    group.cfg_def().set_count(cfg, args.buf_count)?;
    group.cfg_def().set_size(cfg, args.frame_bytes())?;
    group.set_name("frames")?;
    group.set_allocator(alloc.clone())?;
    group.setup()?;
    let group = Arc::new(group);

    let ring_buf = BufRef::standalone(
        &registry,
        alloc.alloc(args.ring_size as usize)?,
        Authority::Group,
    )?;
    let ring = RingBufPool::new(ring_buf, RING_MIN_BUF)?;

    let (tx, rx) = kanal::bounded((args.buf_count as usize).saturating_sub(1).max(1));
    let producer = {
        let args = args.clone();
        let frame = frame.clone();
        let group = group.clone();
        thread::Builder::new()
            .name("producer".to_owned())
            .spawn(move || produce(args, frame, group, tx))?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;
    let start = Instant::now();
    let count = runtime.block_on(consume(args, frame, packet, ring, rx.to_async()))?;

    producer
        .join()
        .map_err(|_| "producer thread panicked")??;

    let elapsed = start.elapsed();
    info!(
        "encoded {count} frames in {:.2?} ({:.1} fps)",
        elapsed,
        count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    info!("group stats {:?}", group.stats());
    debug!("{}", group.dump());
    info!("{} shared objects left", transport.shm_count());
    Ok(())
}
