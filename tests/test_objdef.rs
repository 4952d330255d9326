// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_kmpp::{
    objdef::{ACCESS_KERNEL, ACCESS_USER},
    schemas::{KmppFrame, KmppVencCfg},
    ElemType, Entry, Error, FieldDesc, FlagAllocator, FlagDesc, FlagOp, LoopbackTransport,
    Obj, ObjDef, ObjDefBuilder, Registry, Transport, Trie,
};
use std::{error::Error as StdError, sync::Arc};

fn flag(def: &edgefirst_kmpp::ObjDef, name: &str) -> Result<u16, Box<dyn StdError>> {
    Ok(def
        .get_entry(name)?
        .entry()
        .flag_offset()
        .ok_or("field has no flag")?)
}

#[test]
fn test_frame_flags() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let mut builder = registry.register("frame", 8)?;
    let width = builder.add_entry(
        "width",
        FieldDesc::new(ElemType::U32, 0, 4).flag(FlagDesc::base()),
    )?;
    let height = builder.add_entry(
        "height",
        FieldDesc::new(ElemType::U32, 4, 4).flag(FlagDesc::incr()),
    )?;
    assert_eq!(width.flag_offset(), Some(64));
    assert_eq!(height.flag_offset(), Some(65));

    let def = registry.publish(builder)?;
    assert_eq!(def.entry_size(), 8);
    assert_eq!(def.flag_base(), 64);
    assert_eq!(def.flag_size(), 4);
    assert_eq!(def.storage_size(), 12);
    assert_eq!(def.entry_count(), 2);
    assert_eq!(def.get_offset("height")?, 4);
    assert_eq!(flag(&def, "width")?, 64);
    assert_eq!(flag(&def, "height")?, 65);
    assert!(matches!(def.get_entry("depth"), Err(Error::NotFound(_))));
    assert!(matches!(def.get_entry("__frame"), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_word_rounding() -> Result<(), Box<dyn StdError>> {
    let mut alloc = FlagAllocator::new(8);
    assert_eq!(alloc.resolve("a", FlagDesc::base())?, 64);
    // an empty word still advances to the next one
    assert_eq!(alloc.resolve("b", FlagDesc::base())?, 96);
    assert_eq!(alloc.resolve("c", FlagDesc::incr())?, 97);
    assert_eq!(alloc.resolve("d", FlagDesc::base())?, 128);
    assert_eq!(alloc.resolve("e", FlagDesc::base64())?, 192);
    assert_eq!(alloc.resolve("f", FlagDesc::at(5))?, 197);
    assert_eq!(alloc.resolve("g", FlagDesc::incr())?, 198);
    assert_eq!(alloc.resolve("h", FlagDesc::prev())?, 198);
    assert_eq!(alloc.resolve("i", FlagDesc::NONE)?, 0);
    assert_eq!(alloc.prev(), 198);
    assert_eq!(alloc.step(), 6);

    let mut high = FlagAllocator::new(9000);
    assert!(matches!(
        high.resolve("x", FlagDesc::base()),
        Err(Error::ResourceExhausted(_))
    ));
    Ok(())
}

#[test]
fn test_record_replay() -> Result<(), Box<dyn StdError>> {
    let mut alloc = FlagAllocator::new(4);
    assert_eq!(alloc.resolve("grp", FlagDesc::base())?, 32);
    assert_eq!(alloc.resolve("first", FlagDesc::rec_inc(2))?, 33);
    assert_eq!(alloc.resolve("second", FlagDesc::incr())?, 34);
    assert_eq!(alloc.resolve("again", FlagDesc::replay(2))?, 33);
    assert_eq!(alloc.resolve("fixed", FlagDesc::rec(7, 20))?, 52);
    assert_eq!(alloc.resolve("next", FlagDesc::incr())?, 53);
    assert_eq!(alloc.resolve("fixed_again", FlagDesc::replay(7))?, 52);

    let desc = FlagDesc::rec(4, 17);
    assert_eq!(desc.idx(), 17);
    assert_eq!(desc.slot(), 4);
    assert_eq!(desc.op(), Some(FlagOp::Offset));
    assert!(desc.is_record());
    assert!(!desc.is_replay());
    assert_eq!(FlagDesc::from_bits(desc.bits()), desc);
    assert_eq!(desc.bits(), 17 | (4 << 8) | (3 << 12) | (1 << 16));

    let replay = FlagDesc::replay(3);
    assert_eq!(replay.slot(), 3);
    assert!(replay.is_replay());
    assert_eq!(FlagDesc::NONE.op(), Some(FlagOp::None));
    Ok(())
}

#[test]
fn test_venc_layout() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let venc = KmppVencCfg::register(&registry)?;
    let def = venc.def();

    assert_eq!(def.entry_size(), 116);
    assert_eq!(def.flag_base(), 928);
    assert_eq!(flag(def, "prep:width")?, 928);
    assert_eq!(flag(def, "prep:height")?, 928);
    assert_eq!(flag(def, "prep:hor_stride")?, 929);
    assert_eq!(flag(def, "prep:ver_stride")?, 929);
    assert_eq!(flag(def, "prep:mirroring")?, 932);
    assert_eq!(flag(def, "rc:mode")?, 960);
    assert_eq!(flag(def, "rc:bps_target")?, 961);
    assert_eq!(flag(def, "rc:bps_min")?, 961);
    assert_eq!(flag(def, "rc:fps_out_denom")?, 963);
    assert_eq!(flag(def, "rc:drop_mode")?, 965);
    assert_eq!(flag(def, "rc:drop_thd")?, 965);
    assert_eq!(flag(def, "rc:drop_gap")?, 965);
    assert_eq!(flag(def, "rc:qp_init")?, 976);
    assert_eq!(flag(def, "rc:qp_max")?, 977);
    assert_eq!(flag(def, "rc:qp_min")?, 977);
    assert_eq!(flag(def, "rc:qp_max_i")?, 978);
    assert_eq!(flag(def, "rc:qp_min_i")?, 977);
    assert_eq!(flag(def, "rc:max_reenc_times")?, 980);
    assert_eq!(def.flag_size(), 8);
    Ok(())
}

#[test]
fn test_deterministic_layout() -> Result<(), Box<dyn StdError>> {
    let a = KmppFrame::register(&Registry::new())?;
    let b = KmppFrame::register(&Registry::new())?;
    assert_ne!(a.def().id(), b.def().id());

    let fields_a: Vec<(String, Entry)> = a
        .def()
        .entries()
        .map(|(n, e)| (n.to_owned(), e))
        .collect();
    let fields_b: Vec<(String, Entry)> = b
        .def()
        .entries()
        .map(|(n, e)| (n.to_owned(), e))
        .collect();
    assert_eq!(fields_a, fields_b);
    assert_eq!(fields_a.len(), KmppFrame::layout().fields().len());
    assert_eq!(a.def().trie().get_node_root(), b.def().trie().get_node_root());
    Ok(())
}

#[test]
fn test_entry_word() -> Result<(), Box<dyn StdError>> {
    let entry = Entry::new(ElemType::S64, 24, 8, 300, ACCESS_KERNEL | ACCESS_USER);
    let bits = entry.bits();
    assert_eq!(bits & 0xf, 0x3);
    assert_eq!((bits >> 4) & 0xf, 0x3);
    assert_eq!((bits >> 8) & 0xff, ElemType::S64.tag() as u64);
    assert_eq!((bits >> 16) & 0xffff, 8);
    assert_eq!((bits >> 32) & 0xffff, 24);
    assert_eq!(bits >> 48, 300);

    let back = Entry::from_bytes(&entry.to_bytes())?;
    assert_eq!(back, entry);
    assert_eq!(back.elem_type(), ElemType::S64);
    assert_eq!(back.elem_offset(), 24);
    assert_eq!(back.elem_size(), 8);
    assert_eq!(back.flag_offset(), Some(300));
    assert!(back.user_access() && back.kernel_access() && !back.is_readonly());

    let no_flag = Entry::new(ElemType::U32, 0, 4, 0, ACCESS_USER);
    assert_eq!(no_flag.flag_offset(), None);

    assert!(Entry::from_bits(0).is_err());
    assert!(Entry::from_bits(0x3 | (0x7 << 8)).is_err());
    assert!(Entry::from_bytes(&[0x3, 0, 0]).is_err());
    Ok(())
}

#[test]
fn test_builder_rejects() -> Result<(), Box<dyn StdError>> {
    let mut builder = ObjDefBuilder::new("cfg", 10);
    assert_eq!(builder.entry_size(), 12);

    builder.add_entry("a", FieldDesc::new(ElemType::U32, 0, 4).flag(FlagDesc::base()))?;
    assert!(matches!(
        builder.add_entry("b", FieldDesc::new(ElemType::U64, 8, 8)),
        Err(Error::SchemaMismatch(_))
    ));
    assert!(matches!(
        builder.add_entry("c", FieldDesc::new(ElemType::S32, 4, 8)),
        Err(Error::SchemaMismatch(_))
    ));
    // a failed add must not advance the flag allocator
    assert!(matches!(
        builder.add_entry("a", FieldDesc::new(ElemType::U32, 4, 4).flag(FlagDesc::incr())),
        Err(Error::AlreadyExists(_))
    ));
    let d = builder.add_entry("d", FieldDesc::new(ElemType::U32, 4, 4).flag(FlagDesc::incr()))?;
    assert_eq!(d.flag_offset(), Some(97));
    let st = builder.add_entry("st", FieldDesc::new(ElemType::St, 8, 4).readonly())?;
    assert!(st.is_readonly());
    assert_eq!(st.flag_offset(), None);

    builder.set_prop("priv_size", 32)?;
    assert!(matches!(
        builder.set_prop("bogus", 1),
        Err(Error::Unsupported(_))
    ));

    let def = builder.finish()?;
    assert_eq!(def.entry_count(), 3);
    assert_eq!(def.priv_size(), 32);
    assert_eq!(
        def.entries().map(|(n, _)| n).collect::<Vec<_>>(),
        vec!["a", "d", "st"]
    );
    Ok(())
}

#[test]
fn test_no_flags() -> Result<(), Box<dyn StdError>> {
    let mut builder = ObjDefBuilder::new("plain", 8);
    builder.add_entry("x", FieldDesc::new(ElemType::S32, 0, 4))?;
    builder.add_entry("y", FieldDesc::new(ElemType::S32, 4, 4))?;
    let def = builder.finish()?;
    assert_eq!(def.flag_size(), 0);
    assert_eq!(def.storage_size(), 8);
    Ok(())
}

#[test]
fn test_trie_rebuild() -> Result<(), Box<dyn StdError>> {
    let count = 300;
    let mut builder = ObjDefBuilder::new("wide", count * 4);
    for i in 0..count {
        let name = format!("a_rather_long_parameter_name_{i:04}");
        let flag = if i == 0 {
            FlagDesc::base()
        } else {
            FlagDesc::incr()
        };
        builder.add_entry(&name, FieldDesc::new(ElemType::U32, i * 4, 4).flag(flag))?;
    }
    let def = builder.finish()?;

    assert_eq!(def.entry_count(), count);
    assert!(def.trie().get_buf_size() > 32 + 64 * 64 + 2048);
    for i in 0..count {
        let loc = def.get_entry(&format!("a_rather_long_parameter_name_{i:04}"))?;
        assert_eq!(loc.offset(), i * 4);
        assert_eq!(
            loc.entry().flag_offset(),
            Some((def.flag_base() + i) as u16)
        );
    }
    let first = def.entries().next().map(|(n, _)| n.to_owned());
    assert_eq!(first.as_deref(), Some("a_rather_long_parameter_name_0000"));
    Ok(())
}

#[test]
fn test_registry() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let frame = KmppFrame::register(&registry)?;
    let again = KmppFrame::register(&registry)?;
    assert_eq!(frame.def().id(), again.def().id());

    assert!(matches!(
        registry.register("frame", 8),
        Err(Error::AlreadyExists(_))
    ));

    // a registration that loses the race is discarded
    let first = registry.register("cfg", 4)?;
    let second = registry.register("cfg", 4)?;
    let def = registry.publish(first)?;
    assert!(matches!(
        registry.publish(second),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(registry.get("cfg")?.id(), def.id());

    assert!(matches!(registry.get("missing"), Err(Error::NotFound(_))));
    assert!(matches!(
        registry.share(&def),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(registry.names(), vec!["cfg", "frame"]);

    let dump = registry.dump();
    let names: Vec<&str> = dump
        .as_array()
        .ok_or("dump is not an array")?
        .iter()
        .filter_map(|d| d["name"].as_str())
        .collect();
    assert_eq!(names, vec!["cfg", "frame"]);

    let frame_dump = frame.def().dump();
    assert_eq!(
        frame_dump["fields"].as_array().map(|f| f.len()),
        Some(KmppFrame::layout().fields().len())
    );
    assert_eq!(frame_dump["fields"][0]["name"], "width");
    assert_eq!(frame_dump["fields"][0]["type"], "u32");

    assert!(registry.put(def));
    assert!(registry.lookup("cfg").is_none());
    assert!(registry.remove("frame").is_some());
    assert!(registry.lookup("frame").is_none());
    Ok(())
}

#[test]
fn test_registry_put() -> Result<(), Box<dyn StdError>> {
    let registry = Registry::new();
    let mut builder = registry.register("point", 8)?;
    builder.add_entry("x", FieldDesc::new(ElemType::S32, 0, 4))?;
    builder.add_entry("y", FieldDesc::new(ElemType::S32, 4, 4))?;
    let def = registry.publish(builder)?;
    let first_id = def.id();

    // a live object keeps the definition cached
    let extra = registry.get("point")?;
    let obj = Obj::get(&def)?;
    assert!(!registry.put(extra));
    assert!(!registry.put(def));
    assert_eq!(registry.get("point")?.id(), first_id);

    let def = obj.def().clone();
    drop(obj);
    assert!(registry.put(def));
    assert!(registry.lookup("point").is_none());
    assert!(matches!(registry.get("point"), Err(Error::NotFound(_))));

    // the name is free for a new registration
    let mut builder = registry.register("point", 4)?;
    builder.add_entry("x", FieldDesc::new(ElemType::S32, 0, 4))?;
    assert_ne!(registry.publish(builder)?.id(), first_id);
    Ok(())
}

#[test]
fn test_import() -> Result<(), Box<dyn StdError>> {
    let transport = Arc::new(LoopbackTransport::new());
    let kernel = KmppFrame::register(transport.kernel())?;
    assert!(!kernel.def().is_shared());

    let user = Registry::with_transport(transport.clone());
    let imported = user.get("frame")?;
    assert!(imported.is_shared());
    assert_eq!(imported.name(), "frame");
    assert_ne!(imported.id(), kernel.def().id());
    assert_eq!(imported.entry_size(), kernel.def().entry_size());
    assert_eq!(imported.flag_size(), kernel.def().flag_size());
    assert_eq!(imported.entry_count(), kernel.def().entry_count());

    let theirs: Vec<(String, Entry)> = kernel
        .def()
        .entries()
        .map(|(n, e)| (n.to_owned(), e))
        .collect();
    let ours: Vec<(String, Entry)> = imported
        .entries()
        .map(|(n, e)| (n.to_owned(), e))
        .collect();
    assert_eq!(theirs, ours);

    // the typed wrapper binds to the imported definition
    let frame = KmppFrame::register(&user)?;
    assert_eq!(frame.def().id(), imported.id());
    assert!(matches!(
        user.share(&imported),
        Err(Error::InvalidState(_))
    ));
    Ok(())
}

/// A sealed one-field trie for an 8 byte entry with one 32-bit flag word.
fn sealed_trie(entry: Entry) -> Result<Vec<u8>, Box<dyn StdError>> {
    let mut trie = Trie::new("crafted");
    trie.add_info("field", &entry.to_bytes())?;
    let mut meta = Vec::new();
    for v in [8u32, 4, 0, 1] {
        meta.extend_from_slice(&v.to_le_bytes());
    }
    trie.seal(&meta)?;
    Ok(trie.get_node_root().to_vec())
}

#[test]
fn test_import_rejects_bad_layout() -> Result<(), Box<dyn StdError>> {
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());

    let good = Entry::new(ElemType::U32, 4, 4, 64, ACCESS_USER);
    let def = ObjDef::import(sealed_trie(good)?, transport.clone())?;
    assert_eq!((def.entry_size(), def.flag_size()), (8, 4));
    assert_eq!(def.get_entry("field")?.entry(), good);

    let bad = [
        // data past the entry
        Entry::new(ElemType::U32, 6, 4, 64, ACCESS_USER),
        Entry::new(ElemType::St, 0, 16, 0, ACCESS_USER),
        // size disagrees with the type
        Entry::new(ElemType::U32, 0, 8, 64, ACCESS_USER),
        // flag bit outside the flag region
        Entry::new(ElemType::U32, 0, 4, 96, ACCESS_USER),
        Entry::new(ElemType::U32, 0, 4, 12, ACCESS_USER),
    ];
    for entry in bad {
        assert!(
            matches!(
                ObjDef::import(sealed_trie(entry)?, transport.clone()),
                Err(Error::SchemaMismatch(_))
            ),
            "{entry:?} accepted"
        );
    }
    Ok(())
}

#[test]
fn test_share() -> Result<(), Box<dyn StdError>> {
    let transport = Arc::new(LoopbackTransport::new());
    let producer = Registry::with_transport(transport.clone());
    let venc = KmppVencCfg::register(&producer)?;
    assert!(!venc.def().is_shared());
    producer.share(venc.def())?;
    assert!(matches!(
        producer.share(venc.def()),
        Err(Error::AlreadyExists(_))
    ));

    let consumer = Registry::with_transport(transport.clone());
    let def = consumer.get(KmppVencCfg::NAME)?;
    assert!(def.is_shared());
    assert_eq!(def.get_entry("rc:qp_min")?.entry(), venc.def().get_entry("rc:qp_min")?.entry());
    Ok(())
}
