//! End-to-end assembler tests over an in-memory VFS.

use super::save::SaveKind;
use super::{assemble, AssembleOptions, AssembleOutput};
use crate::errors::AsmError;
use crate::vfs::MemoryVfs;

fn asm(src: &str) -> AssembleOutput {
    let vfs = MemoryVfs::from_pairs([("main.asm", src)]);
    assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap()
}

fn asm_err(src: &str) -> AsmError {
    let vfs = MemoryVfs::from_pairs([("main.asm", src)]);
    assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap_err()
}

#[test]
fn forward_reference_two_pass() {
    // First pass leaves the target undefined and emits zeros; the second
    // emits the real address and converges.
    let out = asm("  NOP\n  JP later\nlater: RET\n");
    assert_eq!(out.output, vec![0x00, 0xC3, 0x04, 0x00, 0xC9]);
    assert_eq!(out.passes, 2);
    assert!(out.errors.is_empty());
}

#[test]
fn org_anchors_output() {
    let out = asm("  ORG $8000\nstart: LD A,5\n  JP start\n");
    assert_eq!(out.output_start, 0x8000);
    assert_eq!(out.output, vec![0x3E, 0x05, 0xC3, 0x00, 0x80]);
}

#[test]
fn forward_org_zero_fills() {
    let out = asm("  ORG 0\n  DB 1\n  ORG 4\n  DB 2\n");
    assert_eq!(out.output, vec![1, 0, 0, 0, 2]);
}

#[test]
fn equ_and_assignment() {
    let out = asm("val EQU 5\n  DB val\ntwo = val*2\n  DB two\n");
    assert_eq!(out.output, vec![5, 10]);
}

#[test]
fn defl_redefines() {
    let out = asm("v DEFL 1\n  DB v\nv DEFL v+1\n  DB v\n");
    assert_eq!(out.output, vec![1, 2]);
}

#[test]
fn data_directives() {
    assert_eq!(asm("  DB 1, 'A', \"BC\"\n").output, vec![1, 65, 66, 67]);
    assert_eq!(asm("  DW $1234, 5\n").output, vec![0x34, 0x12, 5, 0]);
    assert_eq!(asm("  DS 3, $AA\n").output, vec![0xAA; 3]);
    assert_eq!(asm("  DZ \"AB\"\n").output, vec![0x41, 0x42, 0]);
    assert_eq!(asm("  DC \"AB\"\n").output, vec![0x41, 0xC2]);
    assert_eq!(asm("  ABYTE 1, 1, 2\n").output, vec![2, 3]);
    assert_eq!(asm("  ABYTEC 0, \"AB\"\n").output, vec![0x41, 0xC2]);
    assert_eq!(asm("  ABYTEZ 1, 1\n").output, vec![2, 0]);
}

#[test]
fn align_pads_to_boundary() {
    let out = asm("  ORG $8001\n  ALIGN 4, $FF\n  DB 9\n");
    assert_eq!(out.output_start, 0x8001);
    assert_eq!(out.output, vec![0xFF, 0xFF, 0xFF, 9]);
}

#[test]
fn disp_splits_logical_from_physical() {
    let out = asm("  ORG $8000\n  DISP $C000\nvirt: LD HL,virt\n  ENT\n  DB 7\n");
    // Emitted at 0x8000 but assembled as if at 0xC000.
    assert_eq!(out.output_start, 0x8000);
    assert_eq!(out.output, vec![0x21, 0x00, 0xC0, 7]);
}

#[test]
fn conditionals() {
    let out = asm("  IF 1\n  DB 1\n  ELSE\n  DB 2\n  ENDIF\n");
    assert_eq!(out.output, vec![1]);
    let out = asm("  IF 0\n  DB 1\n  ELSEIF 1\n  DB 2\n  ELSE\n  DB 3\n  ENDIF\n");
    assert_eq!(out.output, vec![2]);
    let out = asm("k EQU 1\n  IFDEF k\n  DB 4\n  ENDIF\n  IFNDEF nope\n  DB 5\n  ENDIF\n");
    assert_eq!(out.output, vec![4, 5]);
    // Nested inactive blocks stay inactive.
    let out = asm("  IF 0\n  IF 1\n  DB 1\n  ENDIF\n  ENDIF\n  DB 9\n");
    assert_eq!(out.output, vec![9]);
}

#[test]
fn macro_expansion_with_params() {
    let src = "store MACRO val\n  LD A,val\n  ENDM\n  store 7\n  store 9\n";
    assert_eq!(asm(src).output, vec![0x3E, 7, 0x3E, 9]);
}

#[test]
fn macro_local_labels_do_not_collide() {
    let src = "wait MACRO\n.lp: DJNZ .lp\n  ENDM\n  wait\n  wait\n";
    let out = asm(src);
    assert_eq!(out.output, vec![0x10, 0xFE, 0x10, 0xFE]);
    assert!(out.errors.is_empty());
}

#[test]
fn rept_expands_count_copies() {
    assert_eq!(asm("  REPT 3\n  DB 5\n  ENDR\n").output, vec![5, 5, 5]);
    assert_eq!(asm("  DUP 2\n  DB 1,2\n  EDUP\n").output, vec![1, 2, 1, 2]);
}

#[test]
fn struct_definition_and_instantiation() {
    let src = "\
  STRUCT POINT
x BYTE 1
y BYTE 2
  ENDS
pt: POINT 7
  DB POINT
  DB POINT.y
";
    let out = asm(src);
    // Instance: x=7 (operand), y=2 (default); POINT = size 2; POINT.y = 1.
    assert_eq!(out.output, vec![7, 2, 2, 1]);
    assert!(out.symbols.iter().any(|(n, v)| n == "POINT" && *v == 2));
    assert!(out.symbols.iter().any(|(n, v)| n == "pt.y" && *v == 1));
}

#[test]
fn struct_text_field_pads() {
    let src = "\
  STRUCT HDR
name TEXT 4
len WORD 0
  ENDS
h: HDR \"AB\", $1234
";
    let out = asm(src);
    assert_eq!(out.output, vec![b'A', b'B', 0x20, 0x20, 0x34, 0x12]);
}

#[test]
fn module_prefixes_symbols() {
    let src = "  MODULE snd\nplay: RET\n  ENDMODULE\n  CALL snd.play\n";
    let out = asm(src);
    assert_eq!(out.output, vec![0xC9, 0xCD, 0x00, 0x00]);
    assert!(out.symbols.iter().any(|(n, _)| n == "snd.play"));
}

#[test]
fn temp_labels() {
    let src = "  ORG $8000\n1: DJNZ 1B\n  JR 1F\n1: RET\n";
    let out = asm(src);
    assert_eq!(out.output, vec![0x10, 0xFE, 0x18, 0x00, 0xC9]);
}

#[test]
fn include_files() {
    let vfs = MemoryVfs::from_pairs([
        ("main.asm", "  DB 1\n  INCLUDE \"inc.asm\"\n  DB 3\n"),
        ("inc.asm", "  DB 2\n"),
    ]);
    let out = assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap();
    assert_eq!(out.output, vec![1, 2, 3]);
}

#[test]
fn circular_include_is_fatal() {
    let vfs = MemoryVfs::from_pairs([("main.asm", "  INCLUDE \"main.asm\"\n")]);
    let err = assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap_err();
    assert!(matches!(err, AsmError::CircularInclude(_)));
}

#[test]
fn incbin_offset_and_length() {
    let vfs = MemoryVfs::from_pairs([
        ("main.asm", "  INCBIN \"data.bin\", 1, 2\n".as_bytes().to_vec()),
        ("data.bin", vec![1, 2, 3, 4]),
    ]);
    let out = assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap();
    assert_eq!(out.output, vec![2, 3]);
    // Over-long request warns and truncates.
    let vfs = MemoryVfs::from_pairs([
        ("main.asm", "  INCBIN \"data.bin\", 0, 99\n".as_bytes().to_vec()),
        ("data.bin", vec![1, 2]),
    ]);
    let out = assemble(&vfs, "main.asm", AssembleOptions::default()).unwrap();
    assert_eq!(out.output, vec![1, 2]);
    assert!(!out.warnings.is_empty());
}

#[test]
fn undefined_symbol_is_a_hard_error() {
    let err = asm_err("  JP nowhere\n");
    match err {
        AsmError::UndefinedSymbols { count, names } => {
            assert_eq!(count, 1);
            assert!(names.contains("nowhere"));
        }
        other => panic!("expected UndefinedSymbols, got {other:?}"),
    }
}

#[test]
fn undefined_count_is_monotone() {
    // Chained forward references still converge with the count shrinking.
    let out = asm("  JP a\na: JP b\nb: RET\n");
    assert!(out.errors.is_empty());
    assert!(out.passes <= 3);
}

#[test]
fn jr_out_of_range_warns_and_wraps() {
    let out = asm("  ORG 0\n  JR $300\n");
    assert_eq!(out.output[0], 0x18);
    assert!(out
        .warnings
        .iter()
        .any(|w| w.message.contains("relative jump")));
}

#[test]
fn assert_directive() {
    let out = asm("  ASSERT 1\n  DB 1\n");
    assert!(out.errors.is_empty());
    let out = asm("size EQU 3\n  ASSERT size < 2, \"too big\"\n");
    assert!(out.errors.iter().any(|e| e.message.contains("too big")));
}

#[test]
fn unused_labels_warn() {
    let out = asm("lonely: NOP\n");
    assert!(out
        .warnings
        .iter()
        .any(|w| w.message.contains("lonely")));
}

#[test]
fn cli_defines_are_equs() {
    let vfs = MemoryVfs::from_pairs([("main.asm", "  DB LEVEL\n")]);
    let out = assemble(
        &vfs,
        "main.asm",
        AssembleOptions {
            defines: vec![("LEVEL".to_string(), "7".to_string())],
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(out.output, vec![7]);
}

#[test]
fn savebin_snapshots_at_directive_time() {
    // The snapshot happens when the directive runs; later overwrites do
    // not affect it.
    let src = "\
  ORG $8000
  DB 1, 2
  SAVEBIN \"a.bin\", $8000, 2
  ORG $8000
  DB 9, 9
";
    let out = asm(src);
    assert_eq!(out.save_commands.len(), 1);
    let cmd = &out.save_commands[0];
    assert_eq!(cmd.kind, SaveKind::Bin);
    assert_eq!(cmd.filename, "a.bin");
    assert_eq!(cmd.data, vec![1, 2]);
    assert_eq!(out.output, vec![9, 9], "output itself was overwritten");
}

#[test]
fn savesna_builds_a_snapshot() {
    let out = asm("  ORG $8000\nstart: JR start\n  SAVESNA \"s.sna\", start\n");
    let cmd = &out.save_commands[0];
    assert_eq!(cmd.kind, SaveKind::Sna);
    assert_eq!(cmd.data.len(), 27 + 0xC000);
    // The code landed inside the 48K image.
    assert_eq!(cmd.data[27 + 0x4000], 0x18);
}

#[test]
fn save_tap_and_trd_commands() {
    let src = "\
  ORG $8000
  DB 1,2,3,4
  EMPTYTRD \"disk.trd\"
  SAVETRD \"disk.trd\", \"CODE.C\", $8000, 4
  SAVEBIN \"raw.bin\", $8000, 4 ; md5: ABC123
  MD5CHECK \"t.tap\", \"deadbeef\"
  SAVETAP \"t.tap\", CODE, \"code\", $8000, 4
  EMPTYTAP \"e.tap\"
";
    let out = asm(src);
    let kinds: Vec<SaveKind> = out.save_commands.iter().map(|c| c.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            SaveKind::EmptyTrd,
            SaveKind::Trd,
            SaveKind::Bin,
            SaveKind::Tap,
            SaveKind::EmptyTap
        ]
    );
    assert_eq!(out.save_commands[0].data.len(), 640 * 1024);
    assert_eq!(out.save_commands[1].member.as_deref(), Some("CODE.C"));
    assert_eq!(out.save_commands[1].data, vec![1, 2, 3, 4]);
    assert_eq!(
        out.save_commands[2].expected_md5.as_deref(),
        Some("abc123"),
        "trailing comment md5 is adopted"
    );
    assert_eq!(
        out.save_commands[3].expected_md5.as_deref(),
        Some("deadbeef"),
        "MD5CHECK association is adopted"
    );
}

#[test]
fn device_mirrors_output_into_memory() {
    let out = asm("  DEVICE ZXSPECTRUM48\n  ORG $8000\n  DB $AA\n");
    assert!(out.errors.is_empty());
}

#[test]
fn end_stops_processing() {
    let out = asm("  DB 1\n  END\n  DB 2\n");
    assert_eq!(out.output, vec![1]);
}

#[test]
fn unknown_mnemonic_reports() {
    let out = asm("  FROB 1\n");
    assert!(out.errors.iter().any(|e| e.message.contains("FROB")));
}
