//! Legality table
//!
//! Maps a type to the action that makes it legal on the configured
//! platform. Answers are memoized in a concurrent map so one table can be
//! shared by every per-function pass instance.

use dashmap::DashMap;

use super::LegalizeError;
use crate::config::{LaneStrategy, PlatformConfig};
use crate::error::Result;
use crate::ir::{Elem, Type};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegalizeAction {
    Legal,
    /// Rewrite to this single wider type.
    Promote(Type),
    /// Ordered parts, low bits first, whose widths sum to the original width.
    Split(Vec<Type>),
}

/// One piece of a split memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryChunk {
    pub ty: Type,
    /// Byte offset from the original address.
    pub offset: u32,
}

#[derive(Debug)]
pub struct LegalityTable {
    config: PlatformConfig,
    cache: DashMap<Type, LegalizeAction>,
}

impl LegalityTable {
    pub fn new(config: PlatformConfig) -> Result<Self> {
        Ok(Self {
            config: config.normalized()?,
            cache: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn lane_strategy(&self) -> LaneStrategy {
        self.config.vector_lanes
    }

    pub fn classify(&self, ty: Type) -> std::result::Result<LegalizeAction, LegalizeError> {
        if let Some(hit) = self.cache.get(&ty) {
            return Ok(hit.clone());
        }
        let action = self.compute(ty)?;
        self.cache.insert(ty, action.clone());
        Ok(action)
    }

    pub fn is_legal(&self, ty: Type) -> bool {
        matches!(self.classify(ty), Ok(LegalizeAction::Legal))
    }

    /// Smallest ALU width that holds `width` bits.
    pub fn alu_width(&self, width: u32) -> Option<u32> {
        self.config.alu_widths.iter().copied().find(|&w| w >= width)
    }

    fn compute(&self, ty: Type) -> std::result::Result<LegalizeAction, LegalizeError> {
        match ty {
            Type::Int(w) => self.classify_int(w),
            Type::Vector(Elem::Int(1), _) => Ok(LegalizeAction::Legal),
            Type::Vector(Elem::Int(e), n) => match self.classify_int(e)? {
                LegalizeAction::Legal => Ok(LegalizeAction::Legal),
                LegalizeAction::Promote(Type::Int(p)) => {
                    if self.config.vector_lanes == LaneStrategy::Pack {
                        if let Some(packed) = self.alu_width(e * n) {
                            return Ok(LegalizeAction::Promote(Type::Int(packed)));
                        }
                    }
                    Ok(LegalizeAction::Promote(Type::Vector(Elem::Int(p), n)))
                }
                _ => Err(LegalizeError::UncoveredVectorElement { ty: ty.to_string() }),
            },
            Type::Vector(Elem::Float(_), _) | Type::Float(_) | Type::Ptr | Type::Void => Ok(LegalizeAction::Legal),
        }
    }

    fn classify_int(&self, w: u32) -> std::result::Result<LegalizeAction, LegalizeError> {
        if w == 1 || self.config.alu_widths.contains(&w) {
            return Ok(LegalizeAction::Legal);
        }
        if w == 0 {
            return Err(LegalizeError::UnsplittableWidth { width: w });
        }
        if let Some(p) = self.alu_width(w) {
            return Ok(LegalizeAction::Promote(Type::Int(p)));
        }
        let cap = self.config.max_alu_width();
        let parts = greedy(&self.config.memory_widths, w, cap).ok_or(LegalizeError::UnsplittableWidth { width: w })?;
        Ok(LegalizeAction::Split(parts.into_iter().map(Type::Int).collect()))
    }

    /// Chunks for a load or store of `ty`, or `None` when a single access
    /// of that width is legal.
    pub fn memory_chunks(&self, ty: Type) -> std::result::Result<Option<Vec<MemoryChunk>>, LegalizeError> {
        let Type::Int(w) = ty else { return Ok(None) };
        if w == 1 || self.config.memory_widths.contains(&w) {
            return Ok(None);
        }
        let parts = greedy(&self.config.memory_widths, w, u32::MAX).ok_or(LegalizeError::UnsplittableWidth { width: w })?;
        Ok(Some(chunks(&parts)))
    }

    /// Chunks of a split value, laid out at their byte offsets.
    pub fn split_chunks(parts: &[Type]) -> Vec<MemoryChunk> {
        let widths: Vec<u32> = parts.iter().map(|t| t.bit_width()).collect();
        chunks(&widths)
    }
}

fn chunks(widths: &[u32]) -> Vec<MemoryChunk> {
    let mut offset = 0;
    widths
        .iter()
        .map(|&w| {
            let chunk = MemoryChunk { ty: Type::Int(w), offset };
            offset += w / 8;
            chunk
        })
        .collect()
}

/// Repeatedly take the largest available width not exceeding what is left.
fn greedy(widths: &[u32], total: u32, cap: u32) -> Option<Vec<u32>> {
    let mut parts = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let w = widths.iter().copied().filter(|&w| w <= remaining && w <= cap).max()?;
        parts.push(w);
        remaining -= w;
    }
    Some(parts)
}

/// Alignment known for an access `offset` bytes past an `align`-aligned address.
pub fn min_align(align: u32, offset: u32) -> u32 {
    if offset == 0 {
        return align;
    }
    let combined = align | offset;
    combined & combined.wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(preset: &str) -> LegalityTable {
        LegalityTable::new(PlatformConfig::preset(preset).unwrap()).unwrap()
    }

    #[test]
    fn test_scalar_classification() {
        let t = table("int8-restricted");
        assert_eq!(t.classify(Type::I1), Ok(LegalizeAction::Legal));
        assert_eq!(t.classify(Type::Int(8)), Ok(LegalizeAction::Promote(Type::Int(16))));
        assert_eq!(t.classify(Type::Int(24)), Ok(LegalizeAction::Promote(Type::Int(32))));
        assert_eq!(t.classify(Type::Int(56)), Ok(LegalizeAction::Promote(Type::Int(64))));
        assert_eq!(t.classify(Type::I32), Ok(LegalizeAction::Legal));
        assert_eq!(t.classify(Type::Ptr), Ok(LegalizeAction::Legal));
        assert_eq!(t.classify(Type::Float(16)), Ok(LegalizeAction::Legal));
    }

    #[test]
    fn test_wide_integers_split_greedily() {
        let t = table("int8-restricted");
        assert_eq!(
            t.classify(Type::Int(128)),
            Ok(LegalizeAction::Split(vec![Type::I64, Type::I64]))
        );
        assert_eq!(
            t.classify(Type::Int(72)),
            Ok(LegalizeAction::Split(vec![Type::I64, Type::Int(8)]))
        );
        assert_eq!(t.classify(Type::Int(65)), Err(LegalizeError::UnsplittableWidth { width: 65 }));
    }

    #[test]
    fn test_split_widths_sum_to_original() {
        let t = table("int8-restricted");
        for w in (72..=128).step_by(8) {
            let Ok(LegalizeAction::Split(parts)) = t.classify(Type::Int(w)) else {
                panic!("i{w} should split");
            };
            assert_eq!(parts.iter().map(|p| p.bit_width()).sum::<u32>(), w);
            assert!(parts.iter().all(|p| p.bit_width() % 8 == 0));
        }
    }

    #[test]
    fn test_vector_classification() {
        let widen = table("int8-restricted");
        let pack = table("packed-lanes");
        let v4i8 = Type::Vector(Elem::Int(8), 4);
        assert_eq!(
            widen.classify(v4i8),
            Ok(LegalizeAction::Promote(Type::Vector(Elem::Int(16), 4)))
        );
        assert_eq!(pack.classify(v4i8), Ok(LegalizeAction::Promote(Type::I32)));
        // 16 lanes of i8 do not fit one ALU integer; fall back to widening.
        let v16i8 = Type::Vector(Elem::Int(8), 16);
        assert_eq!(
            pack.classify(v16i8),
            Ok(LegalizeAction::Promote(Type::Vector(Elem::Int(16), 16)))
        );
        assert_eq!(widen.classify(Type::Vector(Elem::Int(1), 4)), Ok(LegalizeAction::Legal));
        assert!(matches!(
            widen.classify(Type::Vector(Elem::Int(128), 2)),
            Err(LegalizeError::UncoveredVectorElement { .. })
        ));
    }

    #[test]
    fn test_byte_alu_keeps_i8_legal() {
        let t = table("byte-alu");
        assert!(t.is_legal(Type::Int(8)));
        assert!(t.is_legal(Type::Vector(Elem::Int(8), 4)));
        assert_eq!(t.classify(Type::Int(24)), Ok(LegalizeAction::Promote(Type::I32)));
    }

    #[test]
    fn test_memory_chunks_i56() {
        let t = table("int8-restricted");
        let chunks = t.memory_chunks(Type::Int(56)).unwrap().unwrap();
        let layout: Vec<(Type, u32)> = chunks.iter().map(|c| (c.ty, c.offset)).collect();
        assert_eq!(layout, vec![(Type::I32, 0), (Type::Int(16), 4), (Type::Int(8), 6)]);
        assert_eq!(t.memory_chunks(Type::Int(8)), Ok(None));
        assert_eq!(t.memory_chunks(Type::Vector(Elem::Int(8), 3)), Ok(None));
        assert_eq!(t.memory_chunks(Type::Int(12)), Err(LegalizeError::UnsplittableWidth { width: 12 }));
    }

    #[test]
    fn test_memory_chunks_cover_without_gaps() {
        let t = table("int8-restricted");
        for w in (8..=120).step_by(8) {
            let Some(chunks) = t.memory_chunks(Type::Int(w)).unwrap() else { continue };
            let mut expect = 0;
            for c in &chunks {
                assert_eq!(c.offset, expect);
                expect += c.ty.bit_width() / 8;
            }
            assert_eq!(expect * 8, w);
        }
    }

    #[test]
    fn test_min_align() {
        assert_eq!(min_align(4, 0), 4);
        assert_eq!(min_align(4, 4), 4);
        assert_eq!(min_align(4, 6), 2);
        assert_eq!(min_align(8, 1), 1);
        assert_eq!(min_align(16, 8), 8);
    }

    #[test]
    fn test_cache_is_shared_across_threads() {
        let t = table("int8-restricted");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for w in [8, 24, 56, 128] {
                        assert!(t.classify(Type::Int(w)).is_ok());
                    }
                });
            }
        });
        assert_eq!(t.cache.len(), 4);
    }
}
