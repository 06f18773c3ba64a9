use super::*;

fn parse_ok(src: &str) -> Module {
    match parse_str("test.ir", src) {
        Ok(m) => m,
        Err(e) => panic!("parse failed: {e}"),
    }
}

fn parse_err(src: &str) -> String {
    match parse_str("test.ir", src) {
        Ok(_) => panic!("expected a parse error"),
        Err(e) => e.to_string(),
    }
}

const SAMPLE: &str = r#"
; every instruction family once
fn @sample(i8 %a, <4 x i8> %v, ptr %p, i32 %i) -> i8 {
entry:
  %s = add i8 %a, i8 3
  %c = icmp slt i8 %s, i8 %a
  %x = select i1 %c, i8 %s, i8 %a
  %e = extractelement <4 x i8> %v, i32 %i
  %w = insertelement <4 x i8> %v, i8 %x, i32 1
  %l = load volatile i56, ptr %p, align 4
  store i56 %l, ptr %p, align 4
  %q = ptradd ptr %p, i64 8
  %z = sext i8 %x to i32
  %y = shufflevector <4 x i8> %w, <4 x i8> zeroinitializer, [0, 1, 2]
  %k = call i8 @callee(i8 %x, <4 x i8> <1, 2, 3, -4>)
  %r = subgroup.scan.exclusive.imax i8 %k
  %f = freeze i8 %r
  condbr i1 %c, %loop, %exit
loop:
  %ph = phi i8 [i8 %a, %entry], [i8 %n, %loop]
  %n = add i8 %ph, i8 1
  %again = icmp ne i8 %n, i8 0
  condbr i1 %again, %loop, %exit
exit:
  ret i8 %f
}
"#;

#[test]
fn test_parse_sample() {
    let m = parse_ok(SAMPLE);
    let f = m.function("sample").unwrap();
    assert_eq!(f.params.len(), 4);
    assert_eq!(f.block_count(), 3);
    assert_eq!(f.block_name(Block(1)), "loop");
    assert_eq!(f.live_inst_count(), 19);
    assert_eq!(crate::ir::verify::verify_function(f), Ok(()));
}

#[test]
fn test_print_parse_round_trip() {
    let m = parse_ok(SAMPLE);
    let printed = m.to_string();
    let again = parse_ok(&printed);
    assert_eq!(again.to_string(), printed);
}

#[test]
fn test_forward_reference_in_phi() {
    let m = parse_ok(SAMPLE);
    let f = m.function("sample").unwrap();
    let lp = Block(1);
    let phi = f.block_insts(lp)[0];
    let add = f.block_insts(lp)[1];
    assert_eq!(f.args(phi)[1], f.result(add).unwrap());
}

#[test]
fn test_negative_constant_is_masked() {
    let m = parse_ok("fn @f(i8 %a) -> i8 {\nentry:\n  %s = add i8 %a, i8 -1\n  ret i8 %s\n}\n");
    let f = m.function("f").unwrap();
    let add = f.block_insts(Block(0))[0];
    assert_eq!(f.const_int_value(f.args(add)[1]), Some(0xFF));
}

#[test]
fn test_undefined_value() {
    let err = parse_err("fn @f() -> i8 {\nentry:\n  ret i8 %nope\n}\n");
    assert!(err.contains("use of undefined value %nope"), "{err}");
}

#[test]
fn test_redefinition() {
    let err = parse_err("fn @f(i8 %a) -> void {\nentry:\n  %a = add i8 %a, i8 %a\n  ret void\n}\n");
    assert!(err.contains("redefinition of %a"), "{err}");
}

#[test]
fn test_type_mismatch_between_uses() {
    let err = parse_err("fn @f(i8 %a) -> void {\nentry:\n  %b = add i16 %a, i16 1\n  ret void\n}\n");
    assert!(err.contains("%a has type i8, used as i16"), "{err}");
}

#[test]
fn test_unknown_block() {
    let err = parse_err("fn @f() -> void {\nentry:\n  br %nowhere\n}\n");
    assert!(err.contains("unknown block %nowhere"), "{err}");
}

#[test]
fn test_unknown_instruction() {
    let err = parse_err("fn @f(i8 %a) -> void {\nentry:\n  %b = frobnicate i8 %a\n  ret void\n}\n");
    assert!(err.contains("unknown instruction `frobnicate`"), "{err}");
}

#[test]
fn test_bad_alignment() {
    let err = parse_err("fn @f(ptr %p) -> void {\nentry:\n  %l = load i8, ptr %p, align 3\n  ret void\n}\n");
    assert!(err.contains("alignment 3 is not a power of two"), "{err}");
}

#[test]
fn test_duplicate_function() {
    let src = "fn @f() -> void {\nentry:\n  ret void\n}\nfn @f() -> void {\nentry:\n  ret void\n}\n";
    assert!(parse_err(src).contains("duplicate function @f"));
}

#[test]
fn test_eof_error_points_at_end() {
    let src = "fn @f() -> void {\nentry:\n  ret void\n";
    let err = parse_str("t", src).unwrap_err();
    assert_eq!(err.span(), Some(Span::new(src.len(), src.len())));
}
