use murk_core::cfg_ir::{BlockId, BlockType, ControlFlow};
use murk_core::{Chunk, Instruction, Opcode};
use murk_tests::{branching, init_tracing, program};
use std::collections::HashSet;

fn assert_partition(chunk: &mut Chunk) {
    let flow = ControlFlow::build(chunk).unwrap();
    let flat = flow.flatten();
    assert_eq!(flat, chunk.instruction_ids());
    let unique: HashSet<_> = flat.iter().collect();
    assert_eq!(unique.len(), flat.len());
}

#[test]
fn blocks_partition_the_instruction_order() {
    init_tracing();
    assert_partition(&mut branching());

    let mut main = program();
    for path in main.chunk_paths() {
        let chunk = main.descendant_mut(&path).unwrap();
        chunk.setup_references();
        assert_partition(chunk);
    }
}

#[test]
fn comparison_pair_scenario() {
    init_tracing();
    let mut chunk = branching();
    let flow = ControlFlow::build(&mut chunk).unwrap();

    let eq = chunk.instruction_at(5).unwrap();
    let jmp = chunk.instruction_at(6).unwrap();
    let comparison = flow.block(chunk[eq].block.unwrap()).unwrap();
    assert_eq!(comparison.kind, BlockType::Comparison);
    assert_eq!(comparison.instructions, [eq, jmp]);

    let target = flow.jump(comparison.id).unwrap();
    let landing = flow.block(target).unwrap().first().unwrap();
    assert_eq!(chunk.position(landing), Some(9));

    chunk.update_references(jmp).unwrap();
    assert_eq!(chunk[jmp].b, 9 - 6 - 1);
}

#[test]
fn displacements_resolve_back_to_their_targets() {
    let mut chunk = branching();
    let flow = ControlFlow::build(&mut chunk).unwrap();

    for block in flow.blocks() {
        let (Some(_), Some(branch)) = (flow.jump(block.id), block.branch_instruction()) else {
            continue;
        };
        let target = chunk[branch].jump_target().unwrap();
        chunk.update_references(branch).unwrap();

        let position = chunk.position(branch).unwrap() as i32;
        let landing = (position + chunk[branch].b + 1) as usize;
        assert_eq!(chunk.instruction_at(landing), Some(target));
    }
}

#[test]
fn closure_block_and_loops() {
    let mut main = program();
    main.setup_references();
    let flow = ControlFlow::build(&mut main).unwrap();
    let kinds: Vec<_> = flow.blocks().map(|b| b.kind).collect();
    assert_eq!(
        kinds,
        [
            BlockType::Straight,
            BlockType::Closure,
            BlockType::Straight,
            BlockType::Return
        ]
    );
    assert_eq!(flow.block(BlockId(1)).unwrap().len(), 2);

    let inner_id = main.child_at(0).unwrap();
    let inner = main.child_mut(inner_id).unwrap();
    inner.setup_references();
    let flow = ControlFlow::build(inner).unwrap();
    // ForPrep jumps to the ForLoop, which loops back to the body and falls out below.
    assert_eq!(flow.jump(BlockId(1)), Some(BlockId(3)));
    assert_eq!(flow.next(BlockId(1)), None);
    assert_eq!(flow.jump(BlockId(3)), Some(BlockId(2)));
    assert_eq!(flow.next(BlockId(3)), Some(BlockId(4)));
    assert_eq!(flow.incoming(BlockId(2)), [BlockId(3)]);
}

#[test]
fn retarget_moves_the_jump_edge() {
    let mut chunk = branching();
    let mut flow = ControlFlow::build(&mut chunk).unwrap();
    let comparison = BlockId(1);

    flow.retarget(&mut chunk, comparison, BlockId(5)).unwrap();

    assert_eq!(flow.jump(comparison), Some(BlockId(5)));
    let jmp = chunk.instruction_at(6).unwrap();
    assert_eq!(chunk[jmp].jump_target(), chunk.instruction_at(10));
}

#[test]
fn inserted_instruction_shifts_blocks_after_rebuild() {
    let mut chunk = branching();
    let mut flow = ControlFlow::build(&mut chunk).unwrap();
    chunk.insert_instruction(8, Instruction::abc(Opcode::Move, 3, 1, 0));
    chunk.refresh_indices();

    flow.rebuild(&mut chunk).unwrap();

    let jmp = chunk.instruction_at(6).unwrap();
    chunk.update_references(jmp).unwrap();
    assert_eq!(chunk[jmp].b, 3);
    assert_eq!(flow.block(BlockId(2)).unwrap().len(), 2);
}
