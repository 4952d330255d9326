// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Built-in object definitions.

use crate::{kmpp_objdef, FlagDesc, ShmPtr, UserPtr};

kmpp_objdef! {
    /// Raw picture handed to the encoder.
    pub struct KmppFrame: "frame" {
        width: u32 = FlagDesc::base(),
        height: u32 = FlagDesc::incr(),
        hor_stride: u32 = FlagDesc::incr(),
        ver_stride: u32 = FlagDesc::incr(),
        hor_stride_pixel: u32 = FlagDesc::prev(),
        offset_x: u32 = FlagDesc::incr(),
        offset_y: u32 = FlagDesc::prev(),
        poc: u32 = FlagDesc::incr(),
        pts: i64 = FlagDesc::incr(),
        dts: i64 = FlagDesc::incr(),
        eos: u32 = FlagDesc::incr(),
        color_range: u32 = FlagDesc::incr(),
        color_primaries: u32 = FlagDesc::prev(),
        color_trc: u32 = FlagDesc::prev(),
        colorspace: u32 = FlagDesc::prev(),
        chroma_location: u32 = FlagDesc::prev(),
        fmt: u32 = FlagDesc::incr(),
        buf_size: u32 = FlagDesc::incr(),
        buf_fd: u32 = FlagDesc::prev(),
        is_gray: u32 = FlagDesc::incr(),
        buffer: ShmPtr = FlagDesc::incr(),
        /// Sample aspect ratio as `{num: i32, den: i32}`.
        sar: [u8; 8] = FlagDesc::incr(),
    }
}

kmpp_objdef! {
    /// Encoded bitstream chunk.
    pub struct KmppPacket: "packet" {
        size: i32 = FlagDesc::base(),
        length: i32 = FlagDesc::incr(),
        pts: i64 = FlagDesc::incr(),
        dts: i64 = FlagDesc::incr(),
        status: u32 = FlagDesc::incr(),
        temporal_id: u32 = FlagDesc::incr(),
        data: ShmPtr = FlagDesc::incr(),
        buffer: ShmPtr = FlagDesc::incr(),
        pos: ShmPtr = FlagDesc::incr(),
        flag: u32 = FlagDesc::incr(),
    }
}

kmpp_objdef! {
    /// Staged buffer group configuration, frozen by `setup`.
    pub struct KmppBufGrpCfg: "buf_grp_cfg" {
        flag: u32 = FlagDesc::NONE,
        count: u32 = FlagDesc::NONE,
        size: u32 = FlagDesc::NONE,
        mode: u32 = FlagDesc::NONE,
        fd: i32 = FlagDesc::NONE,
        grp_id: i32 = FlagDesc::NONE,
        used: i32 = FlagDesc::NONE,
        unused: i32 = FlagDesc::NONE,
        name: ShmPtr = FlagDesc::NONE,
        allocator: ShmPtr = FlagDesc::NONE,
    }
}

kmpp_objdef! {
    /// Per-buffer configuration.
    pub struct KmppBufCfg: "buf_cfg" {
        size: u32 = FlagDesc::NONE,
        offset: u32 = FlagDesc::NONE,
        flag: u32 = FlagDesc::NONE,
        fd: i32 = FlagDesc::NONE,
        index: i32 = FlagDesc::NONE,
        grp_id: i32 = FlagDesc::NONE,
        buf_gid: i32 = FlagDesc::NONE,
        buf_uid: i32 = FlagDesc::NONE,
        sptr: ShmPtr = FlagDesc::NONE,
        group: ShmPtr = FlagDesc::NONE,
        uptr: UserPtr = FlagDesc::NONE,
        upriv: UserPtr = FlagDesc::NONE,
        ufp: UserPtr = FlagDesc::NONE,
    }
}

kmpp_objdef! {
    /// Encoder configuration subset: preprocess and rate control.
    pub struct KmppVencCfg: "venc_cfg" {
        prep_width("prep:width"): i32 = FlagDesc::base(),
        prep_height("prep:height"): i32 = FlagDesc::prev(),
        prep_hor_stride("prep:hor_stride"): i32 = FlagDesc::incr(),
        prep_ver_stride("prep:ver_stride"): i32 = FlagDesc::prev(),
        prep_format("prep:format"): i32 = FlagDesc::incr(),
        prep_rotation("prep:rotation"): i32 = FlagDesc::incr(),
        prep_mirroring("prep:mirroring"): i32 = FlagDesc::incr(),
        rc_mode("rc:mode"): i32 = FlagDesc::base64(),
        rc_bps_target("rc:bps_target"): i32 = FlagDesc::rec_inc(0),
        rc_bps_max("rc:bps_max"): i32 = FlagDesc::prev(),
        rc_bps_min("rc:bps_min"): i32 = FlagDesc::prev(),
        rc_fps_in_flex("rc:fps_in_flex"): i32 = FlagDesc::rec_inc(1),
        rc_fps_in_num("rc:fps_in_num"): i32 = FlagDesc::prev(),
        rc_fps_in_denom("rc:fps_in_denom"): i32 = FlagDesc::prev(),
        rc_fps_out_flex("rc:fps_out_flex"): i32 = FlagDesc::rec_inc(2),
        rc_fps_out_num("rc:fps_out_num"): i32 = FlagDesc::prev(),
        rc_fps_out_denom("rc:fps_out_denom"): i32 = FlagDesc::prev(),
        rc_gop("rc:gop"): i32 = FlagDesc::incr(),
        rc_drop_mode("rc:drop_mode"): u32 = FlagDesc::rec_inc(3),
        rc_drop_thd("rc:drop_thd"): u32 = FlagDesc::replay(3),
        rc_drop_gap("rc:drop_gap"): u32 = FlagDesc::replay(3),
        rc_qp_init("rc:qp_init"): i32 = FlagDesc::at(16),
        rc_qp_max("rc:qp_max"): i32 = FlagDesc::rec(4, 17),
        rc_qp_min("rc:qp_min"): i32 = FlagDesc::replay(4),
        rc_qp_max_i("rc:qp_max_i"): i32 = FlagDesc::at(18),
        rc_qp_min_i("rc:qp_min_i"): i32 = FlagDesc::replay(4),
        rc_debreath_en("rc:debreath_en"): i32 = FlagDesc::incr(),
        rc_debreath_strength("rc:debreath_strength"): i32 = FlagDesc::prev(),
        rc_max_reenc_times("rc:max_reenc_times"): i32 = FlagDesc::incr(),
    }
}

