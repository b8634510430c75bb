use murk_core::decoder::decode_chunk;
use murk_core::encoder::{write_instruction, ByteWriter, WireFormat};
use murk_core::{Chunk, Instruction, ObfuscationType, Opcode};
use murk_tests::init_tracing;
use murk_transform::context::{HandlerKey, ObfuscationContext};
use murk_transform::engine::ObfuscationEngine;
use murk_transform::serializer::serialize;
use murk_transform::window::WindowLayout;

fn all_kinds() -> impl Iterator<Item = ObfuscationType> {
    ObfuscationType::PERMUTATIONS
        .into_iter()
        .chain([ObfuscationType::Polymorphic])
}

#[test]
fn mutating_twice_equals_mutating_once() {
    init_tracing();
    let engine = ObfuscationEngine::with_defaults();
    for kind in all_kinds() {
        let mut chunk = Chunk::new("twice");
        let mut ins = Instruction::abc(Opcode::Concat, 4, 5, 6);
        ins.e = 7;
        ins.f = 8;
        ins.obfuscation = Some(kind);
        let id = chunk.push_instruction(ins);
        let mut ctx = ObfuscationContext::seeded(WireFormat::default(), 12);

        engine.mutate(&mut chunk, id, &mut ctx).unwrap();
        let mut once = ByteWriter::new(0);
        write_instruction(&mut once, &chunk[id]);

        engine.mutate(&mut chunk, id, &mut ctx).unwrap();
        let mut twice = ByteWriter::new(0);
        write_instruction(&mut twice, &chunk[id]);

        assert_eq!(once.as_bytes(), twice.as_bytes(), "{kind}");
    }
}

/// Every window kind around a tagged payload, followed by a return.
fn windowed() -> Chunk {
    let mut chunk = Chunk::new("windows");
    let mut order = Vec::new();
    for (i, kind) in ObfuscationType::WINDOWS.into_iter().enumerate() {
        let mut payload = Instruction::abc(Opcode::Add, i as i32, 1, 2);
        payload.obfuscation = Some(ObfuscationType::RotateABC);
        let payload = chunk.allocate_instruction(payload);
        order.extend(WindowLayout::of(kind).unwrap().scaffold(&mut chunk, payload));
    }
    order.push(chunk.allocate_instruction(Instruction::abc(Opcode::Return, 0, 1, 0)));
    chunk.reorder(order);
    chunk.setup_references();
    chunk
}

#[test]
fn windows_serialize_with_skips_and_virtual_ids() {
    init_tracing();
    let mut chunk = windowed();
    let format = WireFormat::default();
    let mut ctx = ObfuscationContext::seeded(format.clone(), 31);
    let bytes = serialize(&mut chunk, &ObfuscationEngine::with_defaults(), &mut ctx).unwrap();
    let decoded = decode_chunk(&bytes, &format).unwrap();

    let virtual_id = ctx
        .virtual_opcodes
        .get(&HandlerKey::Permuted {
            opcode: Opcode::Add,
            permutation: ObfuscationType::RotateABC,
        })
        .unwrap();
    // All four payloads share one handler.
    assert_eq!(ctx.virtual_opcodes.len(), 1);

    let mut entry = 0;
    for kind in ObfuscationType::WINDOWS {
        let layout = WindowLayout::of(kind).unwrap();
        let window = &decoded.instructions[entry..entry + layout.len];

        assert_eq!(window[0].real_opcode(), kind.entry_opcode());
        assert_eq!(window[0].b, layout.skip_distance());
        let payload = window[layout.payload];
        assert!(payload.skip);
        assert_eq!(payload.opcode, virtual_id);
        assert!(window
            .iter()
            .enumerate()
            .all(|(k, ins)| ins.skip == (k == layout.payload)));

        entry += layout.len;
    }
    assert_eq!(entry + 1, decoded.instructions.len());
}

#[test]
fn second_serialization_is_identical() {
    let mut chunk = windowed();
    let engine = ObfuscationEngine::with_defaults();
    let mut ctx = ObfuscationContext::seeded(WireFormat::default(), 32);

    let first = serialize(&mut chunk, &engine, &mut ctx).unwrap();
    let second = serialize(&mut chunk, &engine, &mut ctx).unwrap();
    assert_eq!(first, second);
}
