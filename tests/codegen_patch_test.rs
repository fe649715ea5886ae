//! Branch and call patching, checked by decoding the generated `.text`.

use bumpalo::Bump;
use dslc::core::CompilationSession;
use dslc::elf::CODE_VADDR;
use dslc::ir::parse_ir;
use dslc::CompiledProgram;
use hashbrown::HashSet;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};

fn compile(source: &str) -> CompiledProgram {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let ir = parse_ir(source, &session);
    assert!(!session.has_diagnostics(), "{:?}", session.diagnostics());
    dslc::compile_ir(&session, &ir).unwrap()
}

fn decode(program: &CompiledProgram) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, program.image.text(), CODE_VADDR, DecoderOptions::NONE);
    decoder.iter().collect()
}

fn address(program: &CompiledProgram, label: &str) -> u64 {
    let offset = program
        .symbol(label)
        .unwrap_or_else(|| panic!("label `{label}` not resolved"));
    CODE_VADDR + offset as u64
}

fn is_branch(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
    )
}

/// First conditional or unconditional jump at or after `from`.
fn first_jump_after(code: &[Instruction], from: u64) -> Instruction {
    *code
        .iter()
        .find(|i| {
            i.ip() >= from
                && matches!(
                    i.flow_control(),
                    FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch
                )
        })
        .unwrap()
}

const NESTED: &str = "
function main
  set r1, 3
  set r2, 1
  while r1 > 0, outer
    if r1 == 2, mid
      set r3, 5
      while r3 >= 1, inner
        sub r3, r2
      end_while
    end_if
    sub r1, r2
  end_while
end_function
";

#[test]
fn test_every_branch_lands_on_an_instruction() {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = compile(NESTED);
    let code = decode(&program);
    let starts: HashSet<u64> = code.iter().map(|i| i.ip()).collect();

    let end = CODE_VADDR + program.image.text().len() as u64;
    assert_eq!(code.last().map(|i| i.next_ip()), Some(end));

    for instruction in code.iter().filter(|i| is_branch(i)) {
        let target = instruction.near_branch_target();
        assert!(
            starts.contains(&target),
            "branch at {:#x} lands mid-instruction at {target:#x}",
            instruction.ip()
        );
    }
}

#[test]
fn test_loop_exits_patch_to_end_label() {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = compile(NESTED);
    let code = decode(&program);

    for label in ["outer", "inner"] {
        let head = address(&program, label);
        let exit = address(&program, &format!("end_loop_{label}"));

        let test = first_jump_after(&code, head);
        assert_eq!(test.flow_control(), FlowControl::ConditionalBranch);
        // target == source + length + displacement
        let field = (test.next_ip() - 4 - CODE_VADDR) as usize;
        let bytes = &program.image.text()[field..field + 4];
        let disp = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(exit as i64, test.ip() as i64 + test.len() as i64 + disp as i64);
        assert_eq!(test.near_branch_target(), exit);

        let back = code.iter().find(|i| i.next_ip() == exit).unwrap();
        assert_eq!(back.flow_control(), FlowControl::UnconditionalBranch);
        assert_eq!(back.near_branch_target(), head);
    }
}

#[test]
fn test_conditional_skips_to_end_label() {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = compile(NESTED);
    let code = decode(&program);

    let head = address(&program, "mid");
    let exit = address(&program, "end_if_mid");
    let test = first_jump_after(&code, head);
    assert_eq!(test.flow_control(), FlowControl::ConditionalBranch);
    assert_eq!(test.near_branch_target(), exit);

    // The inner loop closes before the conditional does.
    assert!(address(&program, "end_loop_inner") <= exit);
    assert!(exit < address(&program, "end_loop_outer"));
}

#[test]
fn test_forward_and_backward_calls_resolve() {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = compile(
        "
function helper
  set r1, 1
end_function
function main
  call helper
  call later
end_function
function later
  call helper
end_function
",
    );
    let code = decode(&program);
    let helper = address(&program, "helper");
    let later = address(&program, "later");
    let main = address(&program, "main");

    let calls_from = |start: u64, end: u64| -> Vec<u64> {
        code.iter()
            .filter(|i| i.ip() >= start && i.ip() < end)
            .filter(|i| i.flow_control() == FlowControl::Call)
            .map(|i| i.near_branch_target())
            .collect()
    };
    assert_eq!(calls_from(main, later), vec![helper, later]);
    assert_eq!(calls_from(later, program.image.entry()), vec![helper]);

    // Process entry: xor rbp, rbp; call main; call __exit.
    assert_eq!(calls_from(program.image.entry(), u64::MAX), vec![
        main,
        address(&program, "__exit"),
    ]);
}

#[test]
fn test_builtins_route_to_runtime() {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = compile(
        "
function main
  call scanf
  set r1, rax
  set rdi, r1
  call printf
  call exit_with, r1
end_function
",
    );
    let code = decode(&program);
    let main = address(&program, "main");
    let targets: Vec<u64> = code
        .iter()
        .filter(|i| i.ip() >= main && i.ip() < program.image.entry())
        .filter(|i| i.flow_control() == FlowControl::Call)
        .map(|i| i.near_branch_target())
        .collect();
    assert_eq!(
        targets,
        vec![
            address(&program, "__read_int"),
            address(&program, "__write_int"),
            address(&program, "__exit_with"),
        ]
    );
}
