use murk_analysis::collect_metrics;
use murk_core::cfg_ir::ControlFlow;
use murk_core::decoder::decode_chunk;
use murk_core::encoder::WireFormat;
use murk_tests::{branching, init_tracing, program};
use murk_transform::context::ObfuscationContext;
use murk_transform::engine::ObfuscationEngine;
use murk_transform::serializer::serialize;
use murk_transform::shuffle::BlockShuffle;
use murk_transform::Transform;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_shuffle_reorders_blocks() {
    init_tracing();
    let mut chunk = branching();
    let before = collect_metrics(&ControlFlow::build(&mut chunk).unwrap()).unwrap();

    let changed = (0..8).any(|seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut candidate = chunk.clone();
        let changed = BlockShuffle.apply(&mut candidate, &mut rng).unwrap();
        if changed {
            chunk = candidate;
        }
        changed
    });
    assert!(changed, "Shuffle should reorder blocks");

    let after = collect_metrics(&ControlFlow::build(&mut chunk).unwrap()).unwrap();
    assert!(
        after.instruction_cnt >= before.instruction_cnt,
        "Shuffle never drops instructions"
    );
    assert_eq!(after.reachable_cnt, after.block_cnt);
}

#[test]
fn shuffled_program_serializes_every_chunk() {
    init_tracing();
    let mut main = program();
    let mut rng = StdRng::seed_from_u64(42);
    for path in main.chunk_paths() {
        let chunk = main.descendant_mut(&path).unwrap();
        chunk.setup_references();
        BlockShuffle.apply(chunk, &mut rng).unwrap();
    }

    let format = WireFormat::default();
    let mut ctx = ObfuscationContext::seeded(format.clone(), 42);
    let bytes = serialize(&mut main, &ObfuscationEngine::with_defaults(), &mut ctx).unwrap();
    let decoded = decode_chunk(&bytes, &format).unwrap();

    assert_eq!(decoded.instructions.len(), main.len());
    let inner = main.child(main.child_at(0).unwrap()).unwrap();
    assert_eq!(decoded.chunks[0].instructions.len(), inner.len());
}
