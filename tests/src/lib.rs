//! Shared fixtures for the integration tests.

use murk_core::{Chunk, Constant, Instruction, Opcode};
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `LoadConst r0 c0; Add r0 r0 r1; Return r0`.
pub fn load_add_return() -> Chunk {
    let mut chunk = Chunk::new("load_add_return");
    chunk.push_constant(Constant::Number(2.5));
    chunk.push_instruction(Instruction::abx(Opcode::LoadConst, 0, 0));
    chunk.push_instruction(Instruction::abc(Opcode::Add, 0, 0, 1));
    chunk.push_instruction(Instruction::abc(Opcode::Return, 0, 2, 0));
    chunk.setup_references();
    chunk
}

/// An `if a == b then ... else ... end` shape with the `Eq`+`Jmp` pair at positions 5 and 6 and
/// the jump landing on position 9.
pub fn branching() -> Chunk {
    let mut chunk = Chunk::new("branching");
    chunk.push_constant(Constant::string("x"));
    for r in 0..4 {
        chunk.push_instruction(Instruction::abc(Opcode::Move, r, r + 1, 0));
    }
    chunk.push_instruction(Instruction::abx(Opcode::GetGlobal, 4, 0));
    chunk.push_instruction(Instruction::abc(Opcode::Eq, 0, 0, 4));
    chunk.push_instruction(Instruction::asbx(Opcode::Jmp, 0, 2));
    chunk.push_instruction(Instruction::abc(Opcode::Add, 1, 1, 2));
    chunk.push_instruction(Instruction::asbx(Opcode::Jmp, 0, 1));
    chunk.push_instruction(Instruction::abc(Opcode::Sub, 1, 1, 2));
    chunk.push_instruction(Instruction::abc(Opcode::Return, 1, 2, 0));
    chunk.setup_references();
    chunk
}

/// A main chunk holding a closure over a nested function that itself contains a loop.
pub fn program() -> Chunk {
    let mut inner = Chunk::new("counter");
    inner.parameter_count = 1;
    inner.upvalue_count = 1;
    inner.push_constant(Constant::Number(1.0));
    inner.push_constant(Constant::Number(10.0));
    inner.push_instruction(Instruction::abx(Opcode::LoadConst, 1, 0));
    inner.push_instruction(Instruction::abx(Opcode::LoadConst, 2, 1));
    inner.push_instruction(Instruction::abx(Opcode::LoadConst, 3, 0));
    inner.push_instruction(Instruction::asbx(Opcode::ForPrep, 1, 3));
    inner.push_instruction(Instruction::abc(Opcode::GetUpval, 5, 0, 0));
    inner.push_instruction(Instruction::abc(Opcode::Add, 5, 5, 4));
    inner.push_instruction(Instruction::abc(Opcode::SetUpval, 5, 0, 0));
    inner.push_instruction(Instruction::asbx(Opcode::ForLoop, 1, -4));
    inner.push_instruction(Instruction::abc(Opcode::Mul, 6, 0, 257));
    inner.push_instruction(Instruction::abc(Opcode::Return, 6, 2, 0));

    let mut main = Chunk::new("main");
    main.is_vararg = true;
    main.push_constant(Constant::string("print"));
    main.push_constant(Constant::Number(0.0));
    main.push_constant(Constant::Boolean(true));
    main.push_constant(Constant::Nil);
    main.push_instruction(Instruction::abx(Opcode::LoadConst, 0, 1));
    main.push_instruction(Instruction::abx(Opcode::Closure, 1, 0));
    main.push_instruction(Instruction::abc(Opcode::Move, 0, 0, 0));
    main.push_instruction(Instruction::abc(Opcode::Move, 2, 1, 0));
    main.push_instruction(Instruction::abc(Opcode::LoadBool, 3, 1, 0));
    main.push_instruction(Instruction::abc(Opcode::Call, 2, 2, 2));
    main.push_instruction(Instruction::abx(Opcode::GetGlobal, 3, 0));
    main.push_instruction(Instruction::abc(Opcode::Move, 4, 2, 0));
    main.push_instruction(Instruction::abc(Opcode::Mul, 4, 4, 4));
    main.push_instruction(Instruction::abc(Opcode::Sub, 4, 4, 0));
    main.push_instruction(Instruction::abc(Opcode::Call, 3, 2, 1));
    main.push_instruction(Instruction::abc(Opcode::Return, 0, 1, 0));
    main.push_child(inner);
    main
}
