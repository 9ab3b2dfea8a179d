// Integration tests for the pattern language runtime

use pattern_lang::{
    native, Arity, DangerousPolicy, EnvVar, ErrorCode, LogLevel, MapResolver, MemoryProvider,
    Pattern, PatternValue, RunStatus, Runtime, RuntimeConfig, SectionId, Value, Visibility,
    MAIN_SOURCE,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn runtime(data: &[u8]) -> Runtime {
    let mut rt = Runtime::default();
    rt.set_provider(Arc::new(MemoryProvider::new(data.to_vec())));
    rt
}

fn run(source: &str, data: &[u8]) -> Runtime {
    let mut rt = runtime(data);
    let ok = rt.execute(source, MAIN_SOURCE, &[], &BTreeMap::new());
    assert!(
        ok,
        "run failed: {:?} {:?}",
        rt.compile_errors(),
        rt.eval_error()
    );
    rt
}

fn run_err(source: &str, data: &[u8]) -> Runtime {
    let mut rt = runtime(data);
    assert!(!rt.execute(source, MAIN_SOURCE, &[], &BTreeMap::new()));
    rt
}

fn get<'a>(rt: &'a Runtime, path: &str) -> &'a Pattern {
    rt.pattern_by_name(path)
        .unwrap_or_else(|| panic!("no pattern named {}", path))
}

fn children<'a>(rt: &'a Runtime, path: &str) -> Vec<&'a Pattern> {
    get(rt, path)
        .children
        .iter()
        .map(|id| rt.pattern(*id).unwrap())
        .collect()
}

fn out_u128(rt: &Runtime, name: &str) -> u128 {
    rt.out_variables()
        .get(name)
        .unwrap_or_else(|| panic!("no out variable {}", name))
        .to_unsigned()
        .unwrap()
}

// ========== PNG Header Test ==========

#[test]
fn test_png_header() {
    let source = r#"
        struct PNGHeader {
            u32 magic;
            u32 reserved;
        };
        be PNGHeader header @ 0x00;
    "#;
    let data: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    let rt = run(source, data);

    assert_eq!(rt.tree().roots().len(), 1);
    let header = get(&rt, "header");
    assert_eq!(header.type_name, "PNGHeader");
    assert_eq!(header.value, PatternValue::Struct);
    let fields = children(&rt, "header");
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].value, PatternValue::Unsigned(0x89504E47));
    assert_eq!(fields[1].value, PatternValue::Unsigned(0x0D0A1A0A));
}

// ========== Simple Binary Format Test ==========

#[test]
fn test_simple_binary_format() {
    let source = r#"
        enum FileType : u8 {
            Text = 0,
            Binary = 1,
            Archive = 2
        };

        struct FileHeader {
            u32 magic;
            u8 version;
            FileType type;
            u16 entry_count;
        };

        FileHeader header @ 0x00;
    "#;
    let data: &[u8] = &[
        0x46, 0x4F, 0x4F, 0x00, // magic
        0x01, // version
        0x02, // type = Archive
        0x03, 0x00, // entry_count
    ];
    let rt = run(source, data);

    assert_eq!(children(&rt, "header").len(), 4);
    assert_eq!(get(&rt, "header.version").value, PatternValue::Unsigned(1));
    assert_eq!(
        get(&rt, "header.type").value,
        PatternValue::Enum {
            value: 2,
            member: Some("Archive".to_string())
        }
    );
    assert_eq!(get(&rt, "header.entry_count").value, PatternValue::Unsigned(3));
}

#[test]
fn test_enum_without_matching_member() {
    let source = r#"
        enum Kind : u8 { A = 1, B = 2 };
        Kind k @ 0;
    "#;
    let rt = run(source, &[0x07]);
    assert_eq!(
        get(&rt, "k").value,
        PatternValue::Enum {
            value: 7,
            member: None
        }
    );
}

// ========== Array of Structs Test ==========

#[test]
fn test_array_of_structs() {
    let source = r#"
        struct Entry {
            u16 id;
            u8 flags;
        };
        Entry entries[3] @ 0x00;
    "#;
    let data: &[u8] = &[0x01, 0x00, 0xAA, 0x02, 0x00, 0xBB, 0x03, 0x00, 0xCC];
    let rt = run(source, data);

    let entries = get(&rt, "entries");
    assert!(matches!(entries.value, PatternValue::Array));
    assert_eq!(entries.size, 9);
    assert_eq!(entries.children.len(), 3);
    assert_eq!(get(&rt, "entries[0].id").value, PatternValue::Unsigned(1));
    assert_eq!(get(&rt, "entries[1].flags").value, PatternValue::Unsigned(0xBB));
    assert_eq!(get(&rt, "entries[2].id").offset, 6);
}

// ========== Mixed Endianness Test ==========

#[test]
fn test_mixed_endianness() {
    let source = r#"
        struct MixedHeader {
            le u16 little;
            be u16 big;
        };
        MixedHeader header @ 0x00;
    "#;
    let rt = run(source, &[0x34, 0x12, 0x12, 0x34]);
    assert_eq!(get(&rt, "header.little").value, PatternValue::Unsigned(0x1234));
    assert_eq!(get(&rt, "header.big").value, PatternValue::Unsigned(0x1234));
}

// ========== Union Test ==========

#[test]
fn test_union_type() {
    let source = r#"
        union IntOrFloat {
            u32 as_int;
            float as_float;
        };
        IntOrFloat val @ 0x00;
    "#;
    let rt = run(source, &[0x00, 0x00, 0x80, 0x3F]);

    let val = get(&rt, "val");
    assert_eq!(val.value, PatternValue::Union);
    assert_eq!(val.size, 4);
    assert_eq!(get(&rt, "val.as_int").value, PatternValue::Unsigned(0x3F800000));
    assert_eq!(get(&rt, "val.as_float").value, PatternValue::Float(1.0));
    assert_eq!(get(&rt, "val.as_float").offset, 0);
}

// ========== Conditional Fields Test ==========

#[test]
fn test_conditional_fields() {
    let source = r#"
        struct Header {
            u8 version;
            u8 flags;
        };
        Header h @ 0x00;

        if (h.version == 2) {
            u16 extra @ 0x02;
        }
    "#;
    let rt = run(source, &[0x02, 0xFF, 0x42, 0x00]);
    assert_eq!(rt.tree().roots().len(), 2);
    assert_eq!(get(&rt, "h.version").value, PatternValue::Unsigned(2));
    assert_eq!(get(&rt, "extra").value, PatternValue::Unsigned(0x0042));

    let rt = run(source, &[0x01, 0xFF, 0x42, 0x00]);
    assert_eq!(rt.tree().roots().len(), 1);
    assert!(rt.pattern_by_name("extra").is_none());
}

#[test]
fn test_struct_field_conditions() {
    let source = r#"
        struct Record {
            u8 kind;
            if (kind == 1)
                u32 wide;
            else
                u8 narrow;
        };
        Record a @ 0;
        Record b @ 5;
    "#;
    let data: &[u8] = &[0x01, 0x78, 0x56, 0x34, 0x12, 0x00, 0x09];
    let rt = run(source, data);
    assert_eq!(get(&rt, "a.wide").value, PatternValue::Unsigned(0x12345678));
    assert_eq!(get(&rt, "a").size, 5);
    assert_eq!(get(&rt, "b.narrow").value, PatternValue::Unsigned(9));
    assert_eq!(get(&rt, "b").size, 2);
}

// ========== Using / Type Alias Test ==========

#[test]
fn test_type_alias() {
    let source = r#"
        using DWORD = u32;
        using WORD = u16;

        struct Header {
            DWORD magic;
            WORD version;
            WORD flags;
        };

        Header header @ 0x00;
    "#;
    let data: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x01, 0x00, 0x03, 0x00];
    let rt = run(source, data);

    assert_eq!(children(&rt, "header").len(), 3);
    assert_eq!(get(&rt, "header.magic").value, PatternValue::Unsigned(0x474E5089));
}

// ========== Function Call Test ==========

#[test]
fn test_function_in_pattern() {
    let source = r#"
        fn compute_count(u32 x) {
            return x + 1;
        };

        u32 raw @ 0x00;
        out u32 count;
        count = compute_count(raw);
    "#;
    let rt = run(source, &[0x05, 0x00, 0x00, 0x00]);

    assert_eq!(get(&rt, "raw").value, PatternValue::Unsigned(5));
    assert_eq!(out_u128(&rt, "count"), 6);
}

#[test]
fn test_main_function_result() {
    let source = r#"
        u8 first @ 0;
        fn main() {
            return first * 2;
        };
    "#;
    let rt = run(source, &[21]);
    assert_eq!(rt.main_result().unwrap().to_unsigned().unwrap(), 42);
}

// ========== Multiple Placements Test ==========

#[test]
fn test_multiple_placements() {
    let source = r#"
        u32 first @ 0x00;
        u32 second @ 0x04;
        u8 byte @ 0x02;
    "#;
    let data: &[u8] = &[0x01, 0x00, 0x42, 0x00, 0x02, 0x00, 0x00, 0x00];
    let rt = run(source, data);

    assert_eq!(rt.tree().roots().len(), 3);
    assert_eq!(get(&rt, "first").value, PatternValue::Unsigned(0x00420001));
    assert_eq!(get(&rt, "second").value, PatternValue::Unsigned(2));
    assert_eq!(get(&rt, "byte").value, PatternValue::Unsigned(0x42));

    // The byte overlaps `first`
    assert_eq!(rt.patterns_at(2, SectionId::PROVIDER).len(), 2);
    // Most recent placement
    assert_eq!(rt.last_address(), 2);
}

// ========== Signed Types Test ==========

#[test]
fn test_signed_types() {
    let source = r#"
        struct SignedData {
            s8 a;
            s16 b;
            s32 c;
        };
        SignedData d @ 0x00;
    "#;
    let data: &[u8] = &[0xFF, 0xFE, 0xFF, 0xFD, 0xFF, 0xFF, 0xFF];
    let rt = run(source, data);

    assert_eq!(get(&rt, "d.a").value, PatternValue::Signed(-1));
    assert_eq!(get(&rt, "d.b").value, PatternValue::Signed(-2));
    assert_eq!(get(&rt, "d.c").value, PatternValue::Signed(-3));
}

// ========== Double Test ==========

#[test]
fn test_double_type() {
    let rt = run("double val @ 0x00;", &1.5f64.to_le_bytes());
    let val = get(&rt, "val");
    assert_eq!(val.size, 8);
    assert_eq!(val.value, PatternValue::Float(1.5));
}

// ========== Parse-only Test ==========

#[test]
fn test_parse_only_keeps_previous_results() {
    let mut rt = run("u32 x @ 0x00;", &[1, 0, 0, 0]);
    assert!(rt.parse_only("u32 y @ 0x00;", MAIN_SOURCE).is_empty());
    assert!(rt.pattern_by_name("x").is_some());
    assert!(rt.pattern_by_name("y").is_none());

    let errors = rt.parse_only("u32 y @ ;", MAIN_SOURCE);
    assert!(!errors.is_empty());
    assert_eq!(rt.compile_errors().len(), errors.len());
    assert!(rt.pattern_by_name("x").is_some());
}

// ========== Struct Offset and Size Test ==========

#[test]
fn test_struct_offset_size() {
    let source = r#"
        struct Record {
            u32 id;
            u8 tag;
            u8 kind;
        };
        Record r @ 0x10;
    "#;
    let mut data = vec![0u8; 0x16];
    data[0x10..0x14].copy_from_slice(&[0xAA, 0, 0, 0]);
    data[0x14] = 0xBB;
    data[0x15] = 0xCC;
    let rt = run(source, &data);

    let r = get(&rt, "r");
    assert_eq!(r.offset, 0x10);
    assert_eq!(r.size, 6);
    let tag = get(&rt, "r.tag");
    assert_eq!(tag.offset, 0x14);
    assert_eq!(tag.size, 1);
    assert_eq!(tag.value, PatternValue::Unsigned(0xBB));
    assert_eq!(get(&rt, "r.kind").offset, 0x15);
}

#[test]
fn test_sizeof_and_addressof() {
    let source = r#"
        struct S {
            u8 a;
            u32 b;
        };
        S s @ 2;
        out u64 size;
        out u64 at;
        size = sizeof(s);
        at = addressof(s.b);
    "#;
    let rt = run(source, &[0; 8]);
    assert_eq!(out_u128(&rt, "size"), 5);
    assert_eq!(out_u128(&rt, "at"), 3);
}

// ========== Strings through reference parameters ==========

#[test]
fn test_string_search_through_ref_parameter() {
    let source = r#"
        struct SizedString16 {
            s32 size;
            char16 data[size];
        };

        struct Entry {
            s32 index;
            SizedString16 value;
        };

        struct Table {
            s32 count;
            Entry entries[count];
        };

        fn table_contains(ref Table t, str needle) {
            for (s32 i = 0, i < t.count, i = i + 1) {
                if (t.entries[i].value.data == needle)
                    return true;
            }
            return false;
        };

        be Table table @ 0x00;

        out bool found_bc;
        out bool found_zz;
        found_bc = table_contains(table, "BC");
        found_zz = table_contains(table, "ZZ");
    "#;
    let mut data = Vec::new();
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]);
    for (index, text) in [(0u8, "AB"), (1u8, "BC")] {
        data.extend_from_slice(&[0x00, 0x00, 0x00, index]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        for c in text.bytes() {
            data.extend_from_slice(&[0x00, c]);
        }
    }
    let rt = run(source, &data);

    assert_eq!(
        get(&rt, "table.entries[1].value.data").value,
        PatternValue::String("BC".to_string())
    );
    assert!(rt.out_variables()["found_bc"].to_bool().unwrap());
    assert!(!rt.out_variables()["found_zz"].to_bool().unwrap());
}

// ========== Bitfields ==========

#[test]
fn test_bitfield_right_to_left() {
    let source = r#"
        bitfield Flags {
            a : 1;
            b : 3;
            c : 4;
        };
        Flags f @ 0;
    "#;
    let rt = run(source, &[0xA5]);

    let f = get(&rt, "f");
    assert_eq!(f.value, PatternValue::Bitfield);
    assert_eq!(f.size, 1);
    assert_eq!(get(&rt, "f.a").value, PatternValue::Unsigned(1));
    assert_eq!(get(&rt, "f.b").value, PatternValue::Unsigned(2));
    assert_eq!(get(&rt, "f.c").value, PatternValue::Unsigned(0xA));
}

// ========== Pointers ==========

#[test]
fn test_pointer_follows_target() {
    let source = "u8 *p : u8 @ 0;";
    let rt = run(source, &[0x03, 0x00, 0x00, 0x7F]);

    let p = get(&rt, "p");
    assert_eq!(p.value, PatternValue::Pointer { address: 3 });
    assert_eq!(p.size, 1);
    assert_eq!(p.children.len(), 1);
    let target = rt.pattern(p.children[0]).unwrap();
    assert_eq!(target.offset, 3);
    assert_eq!(target.value, PatternValue::Unsigned(0x7F));
    assert!(target.pointer_follow);
}

// ========== Templates ==========

#[test]
fn test_template_struct() {
    let source = r#"
        struct Pair<T> {
            T first;
            T second;
        };
        Pair<u16> p @ 0;
    "#;
    let rt = run(source, &[0x01, 0x00, 0x02, 0x00]);
    assert_eq!(get(&rt, "p").size, 4);
    assert_eq!(get(&rt, "p.first").type_name, "u16");
    assert_eq!(get(&rt, "p.second").value, PatternValue::Unsigned(2));
}

// ========== Try / catch ==========

#[test]
fn test_try_catch_discards_failed_placements() {
    let source = r#"
        try {
            u8 marker @ 0;
            u32 big @ 2;
        } catch {
            u8 small @ 2;
        }
    "#;
    let rt = run(source, &[0, 0, 0x11, 0x22]);
    assert!(rt.pattern_by_name("marker").is_none());
    assert!(rt.pattern_by_name("big").is_none());
    assert_eq!(get(&rt, "small").value, PatternValue::Unsigned(0x11));
}

// ========== Attributes ==========

#[test]
fn test_attributes_and_doc_comments() {
    let source = r#"
        struct Header {
            u8 magic [[name("Magic"), comment("file magic")]];
            u8 secret [[hidden]];
        } [[color("FF0000")]];

        /// The main header
        Header header @ 0;
    "#;
    let rt = run(source, &[0xAB, 0xCD]);

    let header = get(&rt, "header");
    assert_eq!(header.color, 0xFF0000);
    assert!(header.explicit_color);
    assert!(header.comment.as_deref().unwrap_or("").contains("The main header"));

    let magic = get(&rt, "header.magic");
    assert_eq!(magic.label(), "Magic");
    assert_eq!(magic.comment.as_deref(), Some("file magic"));

    let secret = get(&rt, "header.secret");
    assert_eq!(secret.visibility, Visibility::Hidden);
    // Hidden patterns do not contribute tooltips
    let tips = rt.tooltips_at(1);
    assert!(tips.iter().all(|id| rt.pattern(*id).unwrap().name != "secret"));
}

// ========== Standard library ==========

#[test]
fn test_print_goes_to_console() {
    let rt = run(r#"std::print("value {}", 5);"#, &[]);
    let entries = rt.console().entries();
    assert!(entries
        .iter()
        .any(|(level, text)| *level == LogLevel::Info && text == "value 5"));
}

#[test]
fn test_failed_assertion() {
    let rt = run_err(r#"u8 x @ 0; std::assert(x == 1, "x must be one");"#, &[2]);
    assert_eq!(rt.status(), Some(RunStatus::EvalFailed));
    let err = rt.eval_error().unwrap();
    assert_eq!(err.code, ErrorCode::Assertion);
    assert!(err.message.contains("x must be one"));
}

#[test]
fn test_division_by_zero_reports_call_stack() {
    let source = r#"
        fn ratio(u8 d) {
            return 10 / d;
        };
        u8 zero @ 0;
        u8 r = ratio(zero);
    "#;
    let rt = run_err(source, &[0]);
    let err = rt.eval_error().unwrap();
    assert_eq!(err.code, ErrorCode::DivisionByZero);
    assert!(!err.call_stack.is_empty());
    assert!(err.location.is_some());
}

#[test]
fn test_environment_variables() {
    let mut rt = runtime(&[]);
    let env = [EnvVar::new("limit", Value::Unsigned(7))];
    let ok = rt.execute(
        r#"out u32 v; v = std::env("limit") + 1;"#,
        MAIN_SOURCE,
        &env,
        &BTreeMap::new(),
    );
    assert!(ok, "{:?}", rt.eval_error());
    assert_eq!(out_u128(&rt, "v"), 8);

    let ok = rt.execute(r#"u32 v = std::env("missing");"#, MAIN_SOURCE, &[], &BTreeMap::new());
    assert!(!ok);
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::UndefinedName);
}

#[test]
fn test_pragma_endian_big() {
    let rt = run("#pragma endian big\nu16 v @ 0;", &[0x12, 0x34]);
    assert_eq!(get(&rt, "v").value, PatternValue::Unsigned(0x1234));
}

#[test]
fn test_pragma_metadata() {
    let rt = run(
        "#pragma author someone\n#pragma description test format\nu8 v @ 0;",
        &[0],
    );
    assert_eq!(rt.metadata().get("author"), Some("someone"));
    assert_eq!(rt.metadata().get("description"), Some("test format"));
}

#[test]
fn test_loop_limit() {
    let source = "#pragma loop_limit 10\nu32 i = 0;\nwhile (true) { i += 1; }";
    let rt = run_err(source, &[]);
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::LoopLimit);
}

#[test]
fn test_oversized_lengths_are_out_of_bounds() {
    let sources = [
        "char s[0xFFFFFFFFFFFFFFFF] @ 0;",
        "char s[0x7FFFFFFFFFFF] @ 0;",
        "str s = std::mem::read_string(0, 0xFFFFFFFFFFFFFFFF);",
        r#"
            u32 s = std::mem::create_section("s");
            std::mem::copy_to_section(0, 0, s, 0x7FFFFFFFFFFFFFFF, 1);
        "#,
    ];
    for source in sources {
        let rt = run_err(source, &[0x41; 16]);
        assert_eq!(rt.status(), Some(RunStatus::EvalFailed), "{}", source);
        assert_eq!(rt.eval_error().unwrap().code, ErrorCode::OutOfBounds, "{}", source);
    }
}

#[test]
fn test_find_sequence_across_scan_chunks() {
    let mut data = vec![0u8; 0x20010];
    data[0x10..0x13].copy_from_slice(b"ABC");
    // straddles the first 64 KiB boundary
    data[0xFFFF..0x10002].copy_from_slice(b"ABC");
    data[0x1FFFE..0x20001].copy_from_slice(b"ABC");
    let source = r#"
        out s128 first;
        out s128 second;
        out s128 third;
        out s128 missing;
        first = std::mem::find_sequence(0, 0x41, 0x42, 0x43);
        second = std::mem::find_sequence(1, 0x41, 0x42, 0x43);
        third = std::mem::find_sequence(2, 0x41, 0x42, 0x43);
        missing = std::mem::find_sequence(3, 0x41, 0x42, 0x43);
    "#;
    let rt = run(source, &data);
    let out = |name: &str| rt.out_variables()[name].to_signed().unwrap();
    assert_eq!(out("first"), 0x10);
    assert_eq!(out("second"), 0xFFFF);
    assert_eq!(out("third"), 0x1FFFE);
    assert_eq!(out("missing"), -1);
}

#[test]
fn test_eval_depth_pragma_has_a_ceiling() {
    let source = r#"
        #pragma eval_depth 1000000
        fn f(u32 n) { return f(n + 1); };
        u32 x = f(0);
    "#;
    let rt = run_err(source, &[]);
    assert_eq!(rt.status(), Some(RunStatus::CompileFailed));
    assert!(!rt.compile_errors().is_empty());

    // Within the ceiling the recursion stops at the limit instead
    let rt = run_err(&source.replace("1000000", "16"), &[]);
    assert_eq!(rt.status(), Some(RunStatus::EvalFailed));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::RecursionLimit);
}

#[test]
fn test_std_math_array_counts() {
    let source = r#"
        u8 abs_array[std::math::abs(-3)] @ 0x00;
        u8 min_array[std::math::min(2, 5)] @ 0x03;
        u8 max_array[std::math::max(2, 5)] @ 0x00;
        u8 floor_array[std::math::floor(2.9)] @ 0x00;
        u8 ceil_array[std::math::ceil(1.1)] @ 0x00;
    "#;
    let data: &[u8] = &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let rt = run(source, data);

    assert_eq!(get(&rt, "abs_array").children.len(), 3);
    assert_eq!(get(&rt, "abs_array[2]").value, PatternValue::Unsigned(0x33));
    assert_eq!(get(&rt, "min_array").children.len(), 2);
    assert_eq!(get(&rt, "min_array[0]").value, PatternValue::Unsigned(0x44));
    assert_eq!(get(&rt, "max_array").children.len(), 5);
    assert_eq!(get(&rt, "floor_array").children.len(), 2);
    assert_eq!(get(&rt, "ceil_array").children.len(), 2);
}

#[test]
fn test_std_math_float_functions() {
    let source = r#"
        u8 rounded[std::math::round(2.6)] @ 0x00;
        u8 remainder[std::math::fmod(7, 3)] @ 0x00;
        u8 from_ln[std::math::round(std::math::ln(20.0855))] @ 0x00;
        u8 from_atan2[std::math::round(std::math::atan2(1, 1) * 4)] @ 0x00;
        u8 from_sin[std::math::round(std::math::sin(1.5707963) * 2)] @ 0x00;
        u8 from_cosh[std::math::round(std::math::cosh(0) * 5)] @ 0x00;
    "#;
    let rt = run(source, &[0u8; 8]);

    assert_eq!(get(&rt, "rounded").children.len(), 3);
    assert_eq!(get(&rt, "remainder").children.len(), 1);
    assert_eq!(get(&rt, "from_ln").children.len(), 3);
    assert_eq!(get(&rt, "from_atan2").children.len(), 3);
    assert_eq!(get(&rt, "from_sin").children.len(), 2);
    assert_eq!(get(&rt, "from_cosh").children.len(), 5);

    let rt = run_err("u8 x[std::math::ln(0)] @ 0;", &[0]);
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::NativeFailure);
}

#[test]
fn test_while_array_until_eof() {
    let data: &[u8] = &[0x11, 0x22, 0x33, 0x44, 0x55];
    let rt = run("u8 bytes[while(!std::mem::eof())] @ 0x00;", data);

    let bytes = get(&rt, "bytes");
    assert_eq!(bytes.value, PatternValue::Array);
    assert_eq!(bytes.size, 5);
    let values: Vec<_> = children(&rt, "bytes").iter().map(|p| p.value.clone()).collect();
    let expected: Vec<_> = data.iter().map(|b| PatternValue::Unsigned(*b as u128)).collect();
    assert_eq!(values, expected);
}

// ========== Includes ==========

#[test]
fn test_import_through_resolver() {
    let mut resolver = MapResolver::new();
    resolver.add(
        "lib/types.hexpat",
        "#pragma once\nstruct Point { u8 x; u8 y; };",
    );
    let mut rt = runtime(&[3, 4]);
    rt.set_include_resolver(resolver);
    let ok = rt.execute(
        "import lib.types;\n#include <lib/types.hexpat>\nPoint p @ 0;",
        MAIN_SOURCE,
        &[],
        &BTreeMap::new(),
    );
    assert!(ok, "{:?}", rt.compile_errors());
    assert_eq!(get(&rt, "p.y").value, PatternValue::Unsigned(4));
}

#[test]
fn test_missing_include_is_compile_error() {
    let rt = run_err("#include <nowhere.hexpat>\nu8 x @ 0;", &[0]);
    assert_eq!(rt.status(), Some(RunStatus::CompileFailed));
    assert!(!rt.compile_errors().is_empty());
}

#[test]
fn test_defines_from_host() {
    let mut rt = runtime(&[0x10, 0x20]);
    rt.add_define("OFFSET", Some("1"));
    assert!(rt.execute("u8 v @ OFFSET;", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(get(&rt, "v").value, PatternValue::Unsigned(0x20));
}

// ========== Sections ==========

#[test]
fn test_sections() {
    let source = r#"
        u32 sec = std::mem::create_section("copy");
        std::mem::copy_to_section(0, 0, sec, 0, 4);
        u32 inside @ 0 in sec;
        u8 outside @ 0;
    "#;
    let data: &[u8] = &[0x78, 0x56, 0x34, 0x12];
    let rt = run(source, data);

    let section = rt.sections().get(SectionId(1)).unwrap();
    assert_eq!(section.name, "copy");
    assert_eq!(section.data, data);

    let inside = get(&rt, "inside");
    assert_eq!(inside.section, SectionId(1));
    assert_eq!(inside.value, PatternValue::Unsigned(0x12345678));
    assert_eq!(rt.patterns(SectionId(1)).len(), 1);
    assert_eq!(rt.patterns_at(0, SectionId(1)).len(), 1);
    assert_eq!(rt.patterns_at(0, SectionId::PROVIDER).len(), 1);
}

#[test]
fn test_zlib_decompress_into_section() {
    let plain = b"pattern data, pattern data, pattern data";
    let packed = miniz_oxide::deflate::compress_to_vec_zlib(plain, 6);
    let source = r#"
        u8 packed[while(!std::mem::eof())] @ 0x00;
        u32 sec = std::mem::create_section("inflated");
        out u64 inflated;
        inflated = hex::dec::zlib_decompress(packed, sec);
        char head[7] @ 0 in sec;
    "#;
    let rt = run(source, &packed);

    assert_eq!(out_u128(&rt, "inflated"), plain.len() as u128);
    assert_eq!(rt.sections().get(SectionId(1)).unwrap().data, plain);
    assert_eq!(get(&rt, "head").value, PatternValue::String("pattern".into()));
}

#[test]
fn test_zlib_decompress_failures() {
    let source = r#"
        u8 packed[while(!std::mem::eof())] @ 0x00;
        u32 sec = std::mem::create_section("inflated");
        hex::dec::zlib_decompress(packed, sec);
    "#;
    let rt = run_err(source, &[1, 2, 3, 4]);
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::NativeFailure);

    // Output larger than the section limit is refused
    let config = RuntimeConfig {
        section_limit: 16,
        ..RuntimeConfig::default()
    };
    let mut shared = pattern_lang::ExtensionRegistry::with_std();
    shared.freeze();
    let mut rt = Runtime::new(config, Arc::new(shared));
    let bomb = miniz_oxide::deflate::compress_to_vec_zlib(&[0u8; 4096], 9);
    rt.set_provider(Arc::new(MemoryProvider::new(bomb)));
    assert!(!rt.execute(source, MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::OutOfBounds);
    assert!(rt.eval_error().unwrap().message.contains("section limit"));
}

// ========== Extensions and dangerous functions ==========

#[test]
fn test_local_extension_function() {
    let mut rt = runtime(&[]);
    rt.add_function(
        "host",
        "twice",
        Arity::Exactly(1),
        native(|_ctx, args| Ok(Value::Unsigned(args[0].to_unsigned()? * 2))),
    )
    .unwrap();
    assert!(rt.execute("out u32 v; v = host::twice(21);", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(out_u128(&rt, "v"), 42);
}

#[test]
fn test_panicking_extension_function_fails_the_run() {
    let mut rt = runtime(&[1]);
    rt.add_function("host", "explode", Arity::Exactly(0), native(|_ctx, _args| panic!("native bug")))
        .unwrap();
    assert!(!rt.execute("u8 a @ 0;\nhost::explode();", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.status(), Some(RunStatus::EvalFailed));
    let err = rt.eval_error().unwrap();
    assert_eq!(err.code, ErrorCode::NativeFailure);
    assert!(err.message.contains("native bug"));
    assert!(!rt.is_running());
}

fn dangerous_runtime(policy: DangerousPolicy) -> Runtime {
    let config = RuntimeConfig {
        dangerous_functions: policy,
        ..RuntimeConfig::default()
    };
    let mut shared = pattern_lang::ExtensionRegistry::with_std();
    shared.freeze();
    let mut rt = Runtime::new(config, Arc::new(shared));
    rt.add_dangerous_function(
        "host",
        "danger",
        Arity::Exactly(0),
        native(|_ctx, _args| Ok(Value::Unsigned(1))),
    )
    .unwrap();
    rt
}

#[test]
fn test_dangerous_function_denied() {
    let mut rt = dangerous_runtime(DangerousPolicy::Deny);
    assert!(!rt.execute("u8 v = host::danger();", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::PermissionDenied);
}

#[test]
fn test_dangerous_function_ask_without_handler_is_denied() {
    let mut rt = dangerous_runtime(DangerousPolicy::Ask);
    assert!(!rt.execute("u8 v = host::danger();", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::PermissionDenied);
}

#[test]
fn test_dangerous_function_ask_with_handler() {
    let mut rt = dangerous_runtime(DangerousPolicy::Ask);
    rt.set_dangerous_function_handler(Some(Arc::new(|_name: &str| true)));
    assert!(rt.execute(
        "out u8 v; v = host::danger();",
        MAIN_SOURCE,
        &[],
        &BTreeMap::new()
    ));
    assert_eq!(out_u128(&rt, "v"), 1);
}

#[test]
fn test_dangerous_function_allowed() {
    let mut rt = dangerous_runtime(DangerousPolicy::Allow);
    assert!(rt.execute("u8 v = host::danger();", MAIN_SOURCE, &[], &BTreeMap::new()));
}

#[test]
fn test_std_file_operations() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("scratch.bin");
    let source = r#"
        u32 h = std::file::open("PATH", 3);
        std::file::write(h, "hello world");
        std::file::flush(h);
        std::assert(std::file::size(h) == 11, "size after write");
        std::file::seek(h, 6);
        str tail = std::file::read(h, 5);
        std::assert(tail == "world", "read back");
        std::file::resize(h, 5);
        std::assert(std::file::size(h) == 5, "size after resize");
        std::file::close(h);
        u32 again = std::file::open("PATH", 1);
        std::assert(again == 2, "handles count up within a run");
        std::file::remove(again);
    "#
    .replace("PATH", &path.display().to_string());

    let mut rt = dangerous_runtime(DangerousPolicy::Allow);
    assert!(
        rt.execute(&source, MAIN_SOURCE, &[], &BTreeMap::new()),
        "{:?}",
        rt.eval_error()
    );
    assert!(!path.exists());
}

#[test]
fn test_std_file_handles_restart_every_run() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("left-open.txt");
    // The file is never closed by the program
    let source = r#"
        out u32 handle;
        handle = std::file::open("PATH", 3);
        std::file::write(handle, "x");
    "#
    .replace("PATH", &path.display().to_string());

    let mut rt = dangerous_runtime(DangerousPolicy::Allow);
    for _ in 0..2 {
        assert!(rt.execute(&source, MAIN_SOURCE, &[], &BTreeMap::new()));
        assert_eq!(out_u128(&rt, "handle"), 1);
    }
    assert_eq!(std::fs::read(&path).unwrap(), b"x");

    // A handle from an earlier run is not valid in the next one
    assert!(!rt.execute("std::file::close(1);", MAIN_SOURCE, &[], &BTreeMap::new()));
    assert_eq!(rt.eval_error().unwrap().code, ErrorCode::NativeFailure);
}
