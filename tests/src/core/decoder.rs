use murk_core::decoder::{decode_chunk, DecodedConstant};
use murk_core::encoder::{ChunkStep, ConstantTags, WireFormat};
use murk_core::{Opcode, Shape};
use murk_tests::{init_tracing, load_add_return, program};
use murk_transform::context::ObfuscationContext;
use murk_transform::engine::ObfuscationEngine;
use murk_transform::serializer::serialize;
use murk_utils::errors::DecodeError;

fn encode(chunk: &mut murk_core::Chunk, format: &WireFormat) -> Vec<u8> {
    let mut ctx = ObfuscationContext::seeded(format.clone(), 0);
    serialize(chunk, &ObfuscationEngine::with_defaults(), &mut ctx).unwrap()
}

#[test]
fn load_add_return_decodes_to_the_same_instructions() {
    init_tracing();
    let format = WireFormat::default();
    let bytes = encode(&mut load_add_return(), &format);
    let decoded = decode_chunk(&bytes, &format).unwrap();

    let ops: Vec<_> = decoded
        .instructions
        .iter()
        .map(|i| (i.real_opcode(), i.a, i.b, i.c))
        .collect();
    assert_eq!(
        ops,
        [
            (Some(Opcode::LoadConst), 0, 0, 0),
            (Some(Opcode::Add), 0, 0, 1),
            (Some(Opcode::Return), 0, 2, 0),
        ]
    );
    assert_eq!(decoded.constants, [DecodedConstant::Number(2.5)]);
}

#[test]
fn nested_program_round_trips_with_remapped_tags() {
    let format = WireFormat {
        key: 0xC3,
        mask_parameter_count: false,
        steps: vec![
            ChunkStep::Chunks,
            ChunkStep::Vararg,
            ChunkStep::Instructions,
            ChunkStep::ParameterCount,
            ChunkStep::Constants,
        ],
        constant_tags: ConstantTags {
            nil: 9,
            boolean: 8,
            number: 7,
            string: 6,
            tampered: 5,
        },
    };
    let mut chunk = program();
    for path in chunk.chunk_paths() {
        if let Some(c) = chunk.descendant_mut(&path) {
            c.setup_references();
        }
    }

    let bytes = encode(&mut chunk, &format);
    let decoded = decode_chunk(&bytes, &format).unwrap();

    assert_eq!(decoded.is_vararg, Some(true));
    assert_eq!(decoded.instructions.len(), chunk.len());
    assert_eq!(
        decoded.constants,
        [
            DecodedConstant::String(b"print".to_vec()),
            DecodedConstant::Number(0.0),
            DecodedConstant::Boolean(true),
            DecodedConstant::Nil,
        ]
    );
    let inner = &decoded.chunks[0];
    assert_eq!(inner.parameter_count, Some(1));
    let for_prep = inner.instructions[3];
    assert_eq!(for_prep.shape, Shape::AsBx);
    assert_eq!(for_prep.b, 3);
    assert_eq!(inner.instructions[7].b, -4);
}

#[test]
fn truncated_input_reports_offset() {
    let format = WireFormat::default();
    let bytes = encode(&mut load_add_return(), &format);

    let err = decode_chunk(&bytes[..bytes.len() - 3], &format).unwrap_err();
    assert!(matches!(err, DecodeError::UnexpectedEof(_)), "{err}");
}

#[test]
fn trailing_bytes_are_rejected() {
    let format = WireFormat::default();
    let mut bytes = encode(&mut load_add_return(), &format);
    bytes.push(0);

    assert!(matches!(
        decode_chunk(&bytes, &format),
        Err(DecodeError::TrailingBytes(1))
    ));
}

#[test]
fn bad_shape_byte_is_rejected() {
    let format = WireFormat {
        steps: vec![ChunkStep::Instructions],
        ..WireFormat::default()
    };
    let err = decode_chunk(&[0x01, 0x0E], &format).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::InvalidShape {
            byte: 0x0E,
            offset: 1
        }
    ));
}
