use crate::polymorphic::random_modes;
use crate::window::WindowLayout;
use crate::{ObfuscationSettings, Transform};
use murk_core::cfg_ir::{BlockType, ControlFlow};
use murk_core::{Chunk, InstrId, ObfuscationType, Opcode, Shape};
use murk_utils::errors::TransformError;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{rngs::StdRng, Rng};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Assigns obfuscation tags and splices structural windows around payload instructions.
///
/// Tags are only assigned here; the strategies run when the serializer reaches each instruction.
pub struct Tagger {
    settings: ObfuscationSettings,
}

impl Tagger {
    pub fn new(settings: ObfuscationSettings) -> Self {
        Self { settings }
    }

    /// Straight-line instructions that can be lifted into a window.
    ///
    /// A `LoadBool` may skip the instruction after it, so neither it nor its follower qualifies.
    fn window_candidates(&self, chunk: &Chunk, flow: &ControlFlow) -> Vec<InstrId> {
        let mut candidates = Vec::new();
        for block in flow.blocks().filter(|b| b.kind == BlockType::Straight) {
            let mut after_load_bool = false;
            for &id in &block.instructions {
                let ins = &chunk[id];
                let opcode = ins.logical_opcode();
                if ins.shape() == Shape::ABC
                    && !opcode.is_internal()
                    && ins.obfuscation.is_none()
                    && opcode != Opcode::LoadBool
                    && !after_load_bool
                {
                    candidates.push(id);
                }
                after_load_bool = opcode == Opcode::LoadBool;
            }
        }
        candidates
    }

    fn splice_windows(&self, chunk: &mut Chunk, rng: &mut StdRng) -> Result<usize, TransformError> {
        let flow = ControlFlow::build(chunk)?;
        let mut candidates = self.window_candidates(chunk, &flow);
        let count = ((candidates.len() as f32) * self.settings.window_ratio.clamp(0.0, 1.0)).ceil()
            as usize;
        if count == 0 {
            return Ok(0);
        }
        candidates.shuffle(rng);
        candidates.truncate(count);

        let mut windows: HashMap<InstrId, Vec<InstrId>> = HashMap::with_capacity(count);
        for payload in candidates {
            let Some(&kind) = ObfuscationType::WINDOWS.choose(rng) else {
                continue;
            };
            let Some(layout) = WindowLayout::of(kind) else {
                continue;
            };
            windows.insert(payload, layout.scaffold(chunk, payload));
        }

        let mut order = Vec::with_capacity(chunk.len() + windows.len() * 6);
        for &id in chunk.instruction_ids() {
            match windows.get(&id) {
                Some(window) => order.extend_from_slice(window),
                None => order.push(id),
            }
        }
        chunk.reorder(order);

        // Jumps that landed on a payload now land on its window entry.
        let retargets: Vec<(InstrId, InstrId)> = chunk
            .instructions()
            .filter_map(|(id, ins)| {
                let target = ins.jump_target()?;
                let entry = windows.get(&target)?.first()?;
                Some((id, *entry))
            })
            .collect();
        for (id, entry) in retargets {
            chunk[id].set_jump_target(entry);
        }
        chunk.refresh_indices();

        debug!("spliced {} windows into `{}`", windows.len(), chunk.name);
        Ok(windows.len())
    }

    fn assign_tags(&self, chunk: &mut Chunk, rng: &mut StdRng) -> Result<usize, TransformError> {
        let flow = ControlFlow::build(chunk)?;
        // Closure captures are read by the closure itself, never executed.
        let eligible: Vec<InstrId> = flow
            .blocks()
            .filter(|b| b.kind != BlockType::Closure)
            .flat_map(|b| b.instructions.iter().copied())
            .filter(|&id| {
                let ins = &chunk[id];
                ins.shape() == Shape::ABC
                    && !ins.logical_opcode().is_internal()
                    && ins.obfuscation.is_none()
            })
            .collect();

        let polymorphic = f64::from(self.settings.polymorphic_ratio.clamp(0.0, 1.0));
        let permutation = f64::from(self.settings.permutation_ratio.clamp(0.0, 1.0));
        let mut tagged = HashSet::new();
        for id in eligible {
            if self.settings.polymorphic_opcodes && rng.random_bool(polymorphic) {
                let modes = random_modes(rng);
                let ins = &mut chunk[id];
                ins.obfuscation = Some(ObfuscationType::Polymorphic);
                ins.offset_modes = Some(modes);
                tagged.insert(id);
            } else if self.settings.permute_operands && rng.random_bool(permutation) {
                if let Some(&kind) = ObfuscationType::PERMUTATIONS.choose(rng) {
                    chunk[id].obfuscation = Some(kind);
                    tagged.insert(id);
                }
            }
        }
        Ok(tagged.len())
    }
}

impl Transform for Tagger {
    fn name(&self) -> &'static str {
        "Tagger"
    }

    fn apply(&self, chunk: &mut Chunk, rng: &mut StdRng) -> Result<bool, TransformError> {
        let windows = if self.settings.structural_windows {
            self.splice_windows(chunk, rng)?
        } else {
            0
        };
        let tags = self.assign_tags(chunk, rng)?;
        debug!(
            "tagged `{}`: {} windows, {} instruction tags",
            chunk.name, windows, tags
        );
        Ok(windows + tags > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murk_core::Instruction;
    use rand::SeedableRng;

    fn body() -> Chunk {
        let mut chunk = Chunk::new("body");
        chunk.push_instruction(Instruction::abc(Opcode::Move, 0, 1, 0));
        chunk.push_instruction(Instruction::asbx(Opcode::Jmp, 0, 0));
        chunk.push_instruction(Instruction::abc(Opcode::Add, 2, 0, 1));
        chunk.push_instruction(Instruction::abc(Opcode::Mul, 3, 2, 2));
        chunk.push_instruction(Instruction::abc(Opcode::LoadBool, 4, 1, 1));
        chunk.push_instruction(Instruction::abc(Opcode::LoadBool, 4, 0, 0));
        chunk.push_instruction(Instruction::abc(Opcode::Return, 0, 1, 0));
        chunk.setup_references();
        chunk
    }

    fn windows_only(ratio: f32) -> ObfuscationSettings {
        ObfuscationSettings {
            permute_operands: false,
            polymorphic_opcodes: false,
            structural_windows: true,
            window_ratio: ratio,
            ..ObfuscationSettings::default()
        }
    }

    #[test]
    fn load_bool_and_its_follower_are_never_payloads() {
        let mut chunk = body();
        let flow = ControlFlow::build(&mut chunk).unwrap();
        let candidates = Tagger::new(windows_only(1.0)).window_candidates(&chunk, &flow);

        let opcodes: Vec<_> = candidates.iter().map(|&id| chunk[id].opcode).collect();
        assert_eq!(opcodes, [Opcode::Move, Opcode::Add, Opcode::Mul]);
    }

    #[test]
    fn jump_into_payload_lands_on_window_entry() {
        let mut chunk = body();
        let add = chunk.instruction_at(2).unwrap();
        let jmp = chunk.instruction_at(1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        assert!(Tagger::new(windows_only(1.0)).apply(&mut chunk, &mut rng).unwrap());

        let entry = chunk[jmp].jump_target().unwrap();
        assert!(chunk[entry].opcode.is_window_entry());
        let kind = chunk[entry].obfuscation.unwrap();
        let layout = WindowLayout::of(kind).unwrap();
        let entry_pos = chunk.position(entry).unwrap();
        assert_eq!(chunk.instruction_at(entry_pos + layout.payload), Some(add));

        let flow = ControlFlow::build(&mut chunk).unwrap();
        let obfuscated = flow
            .blocks()
            .filter(|b| b.kind == BlockType::Obfuscated)
            .count();
        assert_eq!(obfuscated, 3);
    }

    #[test]
    fn zero_ratios_change_nothing() {
        let mut chunk = body();
        let before = chunk.instruction_ids().to_vec();
        let settings = ObfuscationSettings {
            permutation_ratio: 0.0,
            polymorphic_ratio: 0.0,
            window_ratio: 0.0,
            ..ObfuscationSettings::default()
        };
        let mut rng = StdRng::seed_from_u64(4);

        assert!(!Tagger::new(settings).apply(&mut chunk, &mut rng).unwrap());
        assert_eq!(chunk.instruction_ids(), before.as_slice());
    }

    #[test]
    fn tags_only_land_on_abc_instructions() {
        let mut chunk = body();
        let settings = ObfuscationSettings {
            structural_windows: false,
            permutation_ratio: 1.0,
            polymorphic_ratio: 0.5,
            ..ObfuscationSettings::default()
        };
        let mut rng = StdRng::seed_from_u64(5);

        Tagger::new(settings).apply(&mut chunk, &mut rng).unwrap();

        for (_, ins) in chunk.instructions() {
            match ins.shape() {
                Shape::ABC => assert!(ins.obfuscation.is_some(), "{ins}"),
                _ => assert!(ins.obfuscation.is_none(), "{ins}"),
            }
            if ins.obfuscation == Some(ObfuscationType::Polymorphic) {
                assert!(ins.offset_modes.is_some());
            }
        }
    }
}
