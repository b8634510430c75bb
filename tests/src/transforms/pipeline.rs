use anyhow::Result;
use murk_core::decoder::{decode_chunk, DecodedConstant};
use murk_core::encoder::{ChunkStep, WireFormat};
use murk_core::Opcode;
use murk_tests::{init_tracing, program};
use murk_transform::context::HandlerKey;
use murk_transform::obfuscator::{obfuscate, ObfuscationConfig};
use murk_transform::ObfuscationSettings;

/// Digest strings are 0x-prefixed 32-byte hex.
fn check_digest(digest: &str) {
    assert_eq!(digest.len(), 66);
    assert!(digest.starts_with("0x"));
    assert!(hex::decode(&digest[2..]).is_ok());
}

fn config(seed: u64) -> ObfuscationConfig {
    ObfuscationConfig {
        seed: Some(seed),
        settings: ObfuscationSettings {
            permutation_ratio: 0.5,
            polymorphic_ratio: 0.3,
            window_ratio: 0.5,
            ..ObfuscationSettings::default()
        },
        format: WireFormat {
            key: 0x9D,
            steps: vec![
                ChunkStep::ParameterCount,
                ChunkStep::Vararg,
                ChunkStep::Constants,
                ChunkStep::Instructions,
                ChunkStep::Chunks,
            ],
            ..WireFormat::default()
        },
        ..ObfuscationConfig::default()
    }
}

#[test]
fn fixed_seed_gives_identical_bytes() -> Result<()> {
    init_tracing();
    let first = obfuscate(&mut program(), &config(2024))?;
    let second = obfuscate(&mut program(), &config(2024))?;
    let other = obfuscate(&mut program(), &config(2025))?;

    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.digest, second.digest);
    assert_ne!(first.digest, other.digest);
    check_digest(&first.digest);
    Ok(())
}

#[test]
fn output_decodes_and_matches_the_tree() -> Result<()> {
    init_tracing();
    let cfg = config(7);
    let mut root = program();
    let result = obfuscate(&mut root, &cfg)?;
    let decoded = decode_chunk(&result.bytes, &cfg.format)?;
    tracing::debug!("report: {}", result.to_json()?);

    assert_eq!(decoded.instructions.len(), root.len());
    assert_eq!(decoded.is_vararg, Some(true));
    assert_eq!(decoded.constants[0], DecodedConstant::String(b"print".to_vec()));
    assert_eq!(decoded.chunks.len(), 1);
    assert_eq!(result.size, result.bytes.len());
    assert_eq!(result.hex, format!("0x{}", hex::encode(&result.bytes)));
    assert_eq!(result.metadata.chunks, 2);
    assert_eq!(result.metadata.unresolved_references, 0);

    // Every virtual id on the wire belongs to a reported handler.
    let ids: Vec<u32> = result.handlers.iter().map(|h| h.id).collect();
    let mut virtual_seen = 0;
    for ins in decoded
        .instructions
        .iter()
        .chain(&decoded.chunks[0].instructions)
    {
        if ins.opcode >= Opcode::COUNT {
            assert!(ids.contains(&ins.opcode), "unreported id {}", ins.opcode);
            virtual_seen += 1;
        }
    }
    assert_eq!(
        virtual_seen,
        result.metadata.permuted + result.metadata.polymorphic
    );
    for handler in &result.handlers {
        let opcode = match handler.key {
            HandlerKey::Permuted { opcode, .. } | HandlerKey::Polymorphic { opcode, .. } => opcode,
        };
        assert!(!opcode.is_internal());
    }
    Ok(())
}

#[test]
fn features_off_serializes_plainly() -> Result<()> {
    let cfg = ObfuscationConfig {
        seed: Some(1),
        settings: ObfuscationSettings {
            permute_operands: false,
            polymorphic_opcodes: false,
            structural_windows: false,
            shuffle_blocks: false,
            encrypt_strings: false,
            ..ObfuscationSettings::default()
        },
        ..ObfuscationConfig::default()
    };
    let mut root = program();
    let result = obfuscate(&mut root, &cfg)?;
    let decoded = decode_chunk(&result.bytes, &cfg.format)?;

    assert!(result.handlers.is_empty());
    assert!(result.metadata.transforms_applied.is_empty());
    assert!(decoded
        .instructions
        .iter()
        .all(|ins| ins.real_opcode().is_some() && !ins.skip));
    Ok(())
}

#[test]
fn result_reports_as_json() -> Result<()> {
    let result = obfuscate(&mut program(), &config(3))?;
    let json: serde_json::Value = serde_json::from_str(&result.to_json()?)?;

    assert_eq!(json["metadata"]["seed_used"], 3);
    assert_eq!(json["size"], result.size);
    assert!(json.get("bytes").is_none());
    assert!(json["handlers"].is_array());
    Ok(())
}
