use murk_core::decoder::ByteReader;
use murk_core::encoder::{instruction_len, write_instruction, ByteWriter, WireFormat, DATA_BYTE};
use murk_core::{Instruction, Opcode, Shape};
use murk_tests::{init_tracing, load_add_return};
use murk_transform::context::ObfuscationContext;
use murk_transform::engine::ObfuscationEngine;
use murk_transform::serializer::serialize;

#[test]
fn every_opcode_serializes_to_its_shape_length() {
    init_tracing();
    for opcode in Opcode::ALL {
        let ins = Instruction::abc(opcode, 1, 2, 3);
        let mut w = ByteWriter::new(0x3C);
        write_instruction(&mut w, &ins);

        let expected = match opcode.shape() {
            Shape::Data => 1,
            shape => 1 + 1 + shape.operand_len(),
        };
        assert_eq!(w.len(), expected, "{opcode}");
        assert_eq!(instruction_len(&ins), expected, "{opcode}");
    }
}

#[test]
fn wide_virtual_ids_grow_the_opcode_varint() {
    let mut ins = Instruction::abc(Opcode::Add, 0, 0, 0);
    ins.virtual_opcode = Some(0xFFFF);
    let mut w = ByteWriter::new(0);
    write_instruction(&mut w, &ins);

    assert_eq!(w.len(), 1 + 3 + Shape::ABC.operand_len());
    assert_eq!(&w.as_bytes()[1..4], [0xFF, 0xFF, 0x03]);
}

#[test]
fn filler_is_a_single_masked_byte() {
    let mut w = ByteWriter::new(0xA5);
    write_instruction(&mut w, &Instruction::data());
    assert_eq!(w.as_bytes(), [DATA_BYTE ^ 0xA5]);
}

#[test]
fn load_add_return_bytes() {
    init_tracing();
    let mut chunk = load_add_return();
    let mut ctx = ObfuscationContext::seeded(WireFormat::default(), 0);
    let bytes = serialize(&mut chunk, &ObfuscationEngine::with_defaults(), &mut ctx).unwrap();

    #[rustfmt::skip]
    let expected: Vec<u8> = [
        vec![0x00],                                     // parameter count
        vec![0x01, 0x03],                               // one number constant
        2.5f64.to_le_bytes().to_vec(),
        vec![0x03],                                     // three instructions
        vec![0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],   // LoadConst 0 0
        vec![0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
             0x00, 0x00, 0x00, 0x00, 0x00, 0x00],       // Add 0 0 1
        vec![0x00, 0x25, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
             0x00, 0x00, 0x00, 0x00, 0x00, 0x00],       // Return 0 2
        vec![0x00],                                     // no nested chunks
    ]
    .concat();
    assert_eq!(bytes, expected, "{}", hex::encode(&bytes));
}

#[test]
fn masked_output_unmasks_to_the_same_bytes() {
    let key = 0x6B;
    let mut plain_chunk = load_add_return();
    let mut masked_chunk = load_add_return();
    let engine = ObfuscationEngine::with_defaults();

    let plain = serialize(
        &mut plain_chunk,
        &engine,
        &mut ObfuscationContext::seeded(WireFormat::default(), 0),
    )
    .unwrap();
    let masked = serialize(
        &mut masked_chunk,
        &engine,
        &mut ObfuscationContext::seeded(
            WireFormat {
                key,
                ..WireFormat::default()
            },
            0,
        ),
    )
    .unwrap();

    let mut reader = ByteReader::new(&masked, key);
    let unmasked: Vec<u8> = (0..masked.len()).map(|_| reader.read_u8().unwrap()).collect();
    assert_eq!(unmasked, plain);
}
