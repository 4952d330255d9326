// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;

/// Memory backing the demo buffer group.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum HeapSetting {
    /// Contiguous DMA heap (/dev/dma_heap/linux,cma)
    Cma,
    /// System DMA heap (/dev/dma_heap/system)
    System,
    /// Plain host memory, no device required
    Memory,
}

/// Command-line arguments for the KMPP object and buffer demo.
///
/// The demo runs a privileged side in process, imports its schemas, pushes
/// frames through an encode transaction and stages the resulting packets in
/// a ring buffer. Arguments can be specified via command line or
/// environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-kmpp --heap memory --frames 300 --frame-size 1280 720
///
/// # Via environment variables
/// export HEAP=cma
/// export BUF_COUNT=8
/// edgefirst-kmpp --dump
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of buffers in the frame group
    #[arg(long, env = "BUF_COUNT", default_value = "4")]
    pub buf_count: u32,

    /// Size in bytes of each frame buffer, 0 to derive from the frame size
    #[arg(long, env = "BUF_SIZE", default_value = "0")]
    pub buf_size: u32,

    /// Buffer memory source
    #[arg(long, env = "HEAP", default_value = "memory", value_enum)]
    pub heap: HeapSetting,

    /// Number of frames to push through the encoder, 0 to run forever
    #[arg(long, env = "FRAMES", default_value = "120")]
    pub frames: u64,

    /// Frame resolution in pixels (width height)
    #[arg(
        long,
        env = "FRAME_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub frame_size: Vec<u32>,

    /// Packet ring size in bytes
    #[arg(long, env = "RING_SIZE", default_value = "1048576")]
    pub ring_size: u32,

    /// Encode transaction timeout in milliseconds
    #[arg(long, env = "TIMEOUT", default_value = "1000")]
    pub timeout: u64,

    /// Print every registered schema as JSON and exit
    #[arg(long)]
    pub dump: bool,

    /// Verbose logging
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn width(&self) -> u32 {
        self.frame_size.first().copied().unwrap_or(1920)
    }

    pub fn height(&self) -> u32 {
        self.frame_size.get(1).copied().unwrap_or(1080)
    }

    /// NV12 frame size unless overridden.
    pub fn frame_bytes(&self) -> u32 {
        if self.buf_size != 0 {
            return self.buf_size;
        }
        self.width() * self.height() * 3 / 2
    }
}
