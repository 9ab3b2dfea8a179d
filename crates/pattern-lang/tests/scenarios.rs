// End-to-end runs over a memory provider, plus the properties every run must keep

use pattern_lang::{
    ErrorCode, MemoryProvider, PatternValue, ProjectArchive, RunState, RunStatus, Runtime,
    RuntimeConfig, SectionId, Value, MAIN_SOURCE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime_with(config: RuntimeConfig, data: Vec<u8>) -> Runtime {
    let mut shared = pattern_lang::ExtensionRegistry::with_std();
    shared.freeze();
    let mut rt = Runtime::new(config, Arc::new(shared));
    rt.set_provider(Arc::new(MemoryProvider::new(data)));
    rt
}

fn runtime(data: Vec<u8>) -> Runtime {
    runtime_with(RuntimeConfig::default(), data)
}

/// Deterministic noise so the scan test does not need a random crate
fn noise(len: usize, mut seed: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as u8
        })
        .collect()
}

const LAYOUT: &str = r#"
struct Item {
    u8 kind;
    u16 value;
};

bitfield Flags {
    low : 4;
    high : 4;
};

struct Header {
    char magic[4];
    u8 count;
    Flags flags;
    Item items[count];
    u8 *next : u8;
};

Header header @ 0;
u32 tail @ 0x20;
u32 section_id = std::mem::create_section("copy");
std::mem::copy_to_section(0, 0, section_id, 0, 8);
u16 copied[4] @ 0 in section_id;
"#;

fn layout_data() -> Vec<u8> {
    let mut data = vec![0u8; 0x40];
    data[..4].copy_from_slice(b"HDR1");
    data[4] = 2;
    data[5] = 0x5A;
    data[6..9].copy_from_slice(&[1, 0x34, 0x12]);
    data[9..12].copy_from_slice(&[2, 0x78, 0x56]);
    data[12] = 0x30;
    data[0x20..0x24].copy_from_slice(&[1, 2, 3, 4]);
    data[0x30] = 0xEE;
    data
}

#[test]
fn test_s1_scalar_placement() {
    let data: Vec<u8> = (0..=0xFF).collect();
    let mut rt = runtime(data);
    assert!(rt.execute("u32 x @ 0x10;", MAIN_SOURCE, &[], &BTreeMap::new()));

    let roots = rt.tree().roots();
    assert_eq!(roots.len(), 1);
    let x = rt.pattern(roots[0]).unwrap();
    assert_eq!(x.name, "x");
    assert_eq!(x.offset, 0x10);
    assert_eq!(x.size, 4);
    assert_eq!(
        x.value,
        PatternValue::Unsigned(u32::from_le_bytes([0x10, 0x11, 0x12, 0x13]) as u128)
    );
    assert_eq!(rt.status(), Some(RunStatus::Success));
    assert_eq!(rt.state(), RunState::Success);
}

#[test]
fn test_s2_struct_with_endian_override() {
    let mut data = vec![0xCA, 0xFE, 0x04, 0x00, 0x00, 0x00];
    data.resize(16, 0);
    let mut rt = runtime(data);
    assert!(rt.execute(
        "struct H { be u16 magic; le u32 len; }; H h @ 0;",
        MAIN_SOURCE,
        &[],
        &BTreeMap::new()
    ));
    assert_eq!(
        rt.pattern_by_name("h.magic").unwrap().value,
        PatternValue::Unsigned(0xCAFE)
    );
    assert_eq!(
        rt.pattern_by_name("h.len").unwrap().value,
        PatternValue::Unsigned(4)
    );
    assert_eq!(rt.pattern_by_name("h").unwrap().size, 6);
}

#[test]
fn test_s3_array_with_sentinel() {
    let mut rt = runtime(b"hi\0garbage".to_vec());
    assert!(rt.execute(
        "char s[while(std::mem::read_unsigned($,1)!=0)] @ 0;",
        MAIN_SOURCE,
        &[],
        &BTreeMap::new()
    ));
    let s = rt.pattern_by_name("s").unwrap();
    assert_eq!(s.size, 3);
    assert_eq!(s.value, PatternValue::String("hi".to_string()));
}

#[test]
fn test_s4_runaway_guard() {
    let config = RuntimeConfig {
        pattern_limit: 100_000,
        ..RuntimeConfig::default()
    };
    let mut rt = runtime_with(config, vec![0; 1024]);
    assert!(!rt.execute("u8 x[0xFFFFFFFF] @ 0;", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.status(), Some(RunStatus::EvalFailed));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::RunawayGuard);
    assert!(rt.tree().is_empty());
}

#[test]
fn test_s5_breakpoint_then_abort() {
    let source = "u8 a @ 0;\nu8 b @ 1;\nu8 c @ 2;\nu8 d @ 3;\nu8 e @ 4;";
    let mut rt = runtime(vec![1, 2, 3, 4, 5]);
    rt.add_breakpoint(3);
    let control = rt.control();

    let worker = thread::spawn(move || {
        let ok = rt.execute(source, MAIN_SOURCE, &[], &BTreeMap::new());
        (ok, rt)
    });

    let state = control.wait_until(Duration::from_secs(5), |s| s == RunState::Suspended);
    assert_eq!(state, RunState::Suspended);
    assert_eq!(control.pause_line(), Some(3));
    assert!(control.is_running());

    let started = Instant::now();
    control.abort();
    assert!(!control.is_running());
    assert!(started.elapsed() < Duration::from_millis(100));

    let (ok, rt) = worker.join().unwrap();
    assert!(!ok);
    assert_eq!(rt.status(), Some(RunStatus::Aborted));
    assert_eq!(rt.state(), RunState::Aborted);
    // Lines before the breakpoint were placed
    assert!(rt.pattern_by_name("a").is_some());
    assert!(rt.pattern_by_name("b").is_some());
    assert!(rt.pattern_by_name("c").is_none());
}

#[test]
fn test_s6_in_out_variables() {
    let data = noise(1024, 0x1234_5678);
    let expected = data.iter().filter(|b| **b >= 0x80).count() as u128;
    let source = r#"
        in u32 threshold;
        out u32 count;
        count = 0;
        u32 i = 0;
        while (i < std::mem::size()) {
            if (std::mem::read_unsigned(i, 1) >= threshold)
                count += 1;
            i += 1;
        }
    "#;
    let mut rt = runtime(data);
    let in_vars = BTreeMap::from([("threshold".to_string(), Value::Unsigned(0x80))]);
    assert!(
        rt.execute(source, MAIN_SOURCE, &[], &in_vars),
        "{:?}",
        rt.eval_error()
    );
    assert_eq!(rt.out_variables()["count"].to_unsigned().unwrap(), expected);

    // In-variables persist; out-variables are kept when a later run fails
    assert!(!rt.execute("out u32 count; count = 1 / 0;", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.out_variables()["count"].to_unsigned().unwrap(), expected);
    assert!(rt.in_vars().contains_key("threshold"));
}

#[test]
fn test_placements_stay_inside_their_section() {
    let data = layout_data();
    let size = data.len() as u64;
    let mut rt = runtime(data);
    assert!(rt.execute(LAYOUT, MAIN_SOURCE, &[], &BTreeMap::new()), "{:?}", rt.eval_error());

    for (id, section, start, end) in rt.tree().ranges() {
        let limit = if section == SectionId::PROVIDER {
            size
        } else {
            rt.sections().get(section).unwrap().data.len() as u64
        };
        let p = rt.pattern(id).unwrap();
        assert!(start < limit, "{} starts outside its section", p.name);
        assert!(end <= limit, "{} ends outside its section", p.name);
        assert!(p.size > 0, "{} is empty", p.name);
    }
}

#[test]
fn test_children_inside_parent_unless_followed() {
    let mut rt = runtime(layout_data());
    assert!(rt.execute(LAYOUT, MAIN_SOURCE, &[], &BTreeMap::new()));

    let mut followed = 0;
    for (_, p) in rt.tree().iter() {
        let Some(parent) = p.parent.and_then(|id| rt.pattern(id)) else {
            continue;
        };
        if p.pointer_follow {
            followed += 1;
            continue;
        }
        assert!(
            parent.offset <= p.offset && p.end() <= parent.end(),
            "{} escapes {}",
            p.name,
            parent.name
        );
    }
    assert_eq!(followed, 1);
    assert_eq!(
        rt.pattern_by_name("header.next").unwrap().value,
        PatternValue::Pointer { address: 0x30 }
    );
}

#[test]
fn test_patterns_at_matches_brute_force() {
    let data = layout_data();
    let size = data.len() as u64;
    let mut rt = runtime(data);
    assert!(rt.execute(LAYOUT, MAIN_SOURCE, &[], &BTreeMap::new()));

    for section in [SectionId::PROVIDER, SectionId(1)] {
        for offset in 0..size + 2 {
            let found: BTreeSet<_> = rt.patterns_at(offset, section).into_iter().collect();
            let expected: BTreeSet<_> = rt
                .tree()
                .iter()
                .filter(|(_, p)| p.section == section && p.contains(offset))
                .map(|(id, _)| id)
                .collect();
            assert_eq!(found, expected, "section {:?} offset {:#x}", section, offset);
        }
    }
}

#[test]
fn test_runs_are_deterministic() {
    let run = || {
        let mut rt = runtime(layout_data());
        assert!(rt.execute(LAYOUT, MAIN_SOURCE, &[], &BTreeMap::new()));
        rt
    };
    let (first, second) = (run(), run());

    let a: Vec<_> = first.tree().iter().map(|(id, p)| (id, p.clone())).collect();
    let b: Vec<_> = second.tree().iter().map(|(id, p)| (id, p.clone())).collect();
    assert_eq!(a, b);
    assert_eq!(first.tree().roots(), second.tree().roots());

    let sections = |rt: &Runtime| -> Vec<(String, Vec<u8>)> {
        rt.sections()
            .iter()
            .map(|s| (s.name.clone(), s.data.clone()))
            .collect()
    };
    assert_eq!(sections(&first), sections(&second));
}

#[test]
fn test_breakpoint_suspends_every_run() {
    let source = "u8 a @ 0;\nu8 b @ 1;\nu8 c @ 2;";
    let mut rt = runtime(vec![1, 2, 3]);
    rt.add_breakpoint(2);
    let control = rt.control();

    let worker = thread::spawn(move || {
        let mut results = Vec::new();
        for _ in 0..2 {
            results.push(rt.execute(source, MAIN_SOURCE, &[], &BTreeMap::new()));
        }
        (results, rt)
    });

    for _ in 0..2 {
        let state = control.wait_until(Duration::from_secs(5), |s| s == RunState::Suspended);
        assert_eq!(state, RunState::Suspended);
        assert_eq!(control.pause_line(), Some(2));
        control.resume();
        control.wait_until(Duration::from_secs(5), |s| s != RunState::Suspended);
    }

    let (results, rt) = worker.join().unwrap();
    assert_eq!(results, vec![true, true]);
    assert_eq!(rt.tree().roots().len(), 3);
}

#[test]
fn test_project_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("project");

    let mut archive = ProjectArchive::new();
    archive.set_source("provider-1", Some("image.bin"), LAYOUT).unwrap();
    archive.save(&dir).unwrap();

    let loaded = ProjectArchive::load(&dir).unwrap();
    assert_eq!(loaded.source("provider-1"), Some(LAYOUT.trim_end()));

    // The loaded source still evaluates to the same tree
    let mut rt = runtime(layout_data());
    assert!(rt.execute(
        loaded.source("provider-1").unwrap(),
        MAIN_SOURCE,
        &[],
        &BTreeMap::new()
    ));
    assert!(rt.pattern_by_name("tail").is_some());
}
