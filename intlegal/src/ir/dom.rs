//! Dominator tree
//!
//! Immediate dominators are computed with the iterative two-finger
//! intersection over reverse post-order. Blocks unreachable from the entry
//! have no immediate dominator; they dominate nothing and are dominated by
//! nothing except themselves.

use std::collections::HashMap;

use super::{Block, Function, Inst};

/// Dominance queries used by the legalizer to decide whether a value
/// materialized at one point may be reused at another.
pub trait Dominance {
    /// Does block `a` dominate block `b`?
    fn block_dominates(&self, a: Block, b: Block) -> bool;

    /// Does instruction `a` dominate instruction `b`? An instruction
    /// dominates itself.
    fn dominates(&self, func: &Function, a: Inst, b: Inst) -> bool {
        let ba = func.inst(a).block;
        let bb = func.inst(b).block;
        if ba != bb {
            return self.block_dominates(ba, bb);
        }
        match (func.position(a), func.position(b)) {
            (Some(pa), Some(pb)) => pa <= pb,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomTree {
    idom: HashMap<Block, Block>,
    rpo_index: HashMap<Block, usize>,
    entry: Option<Block>,
}

impl DomTree {
    pub fn compute(func: &Function) -> Self {
        let entry = func.entry();
        let Some(entry) = entry else {
            return Self {
                idom: HashMap::new(),
                rpo_index: HashMap::new(),
                entry: None,
            };
        };

        let rpo = reverse_post_order(func, entry);
        let rpo_index: HashMap<Block, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let preds = func.predecessors();

        let mut idom: HashMap<Block, Block> = HashMap::new();
        idom.insert(entry, entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &p in preds.get(&b).map(|v| v.as_slice()).unwrap_or(&[]) {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_index, p, cur),
                    });
                }
                if let Some(n) = new_idom {
                    if idom.get(&b) != Some(&n) {
                        idom.insert(b, n);
                        changed = true;
                    }
                }
            }
        }

        Self {
            idom,
            rpo_index,
            entry: Some(entry),
        }
    }

    /// Immediate dominator; the entry and unreachable blocks have none.
    pub fn idom(&self, b: Block) -> Option<Block> {
        if Some(b) == self.entry {
            return None;
        }
        self.idom.get(&b).copied()
    }

    pub fn is_reachable(&self, b: Block) -> bool {
        self.rpo_index.contains_key(&b)
    }
}

impl Dominance for DomTree {
    fn block_dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        while let Some(up) = self.idom(cur) {
            if up == a {
                return true;
            }
            cur = up;
        }
        false
    }
}

fn intersect(idom: &HashMap<Block, Block>, order: &HashMap<Block, usize>, a: Block, b: Block) -> Block {
    let mut x = a;
    let mut y = b;
    while x != y {
        while order[&x] > order[&y] {
            x = idom[&x];
        }
        while order[&y] > order[&x] {
            y = idom[&y];
        }
    }
    x
}

fn reverse_post_order(func: &Function, entry: Block) -> Vec<Block> {
    let mut visited = vec![false; func.block_count()];
    let mut post = Vec::new();
    // (block, next successor index)
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    visited[entry.index() as usize] = true;
    while let Some((b, k)) = stack.pop() {
        let succs = func.successors(b);
        if k < succs.len() {
            stack.push((b, k + 1));
            let s = succs[k];
            if !visited[s.index() as usize] {
                visited[s.index() as usize] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(b);
        }
    }
    post.reverse();
    post
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InsertPoint, Opcode, Type};

    /// entry -> (left | right) -> join -> loop -> (loop | exit)
    fn make_diamond_loop() -> (Function, Vec<Block>) {
        let mut f = Function::new("d", Type::Void);
        let c = f.add_param(Type::I1, "c");
        let names = ["entry", "left", "right", "join", "loop", "exit"];
        let bs: Vec<Block> = names.iter().map(|n| f.add_block(*n)).collect();
        let end = |b: Block| InsertPoint::End(b);
        f.insert_inst(end(bs[0]), Opcode::CondBr(bs[1], bs[2]), vec![c], Type::Void, "");
        f.insert_inst(end(bs[1]), Opcode::Br(bs[3]), vec![], Type::Void, "");
        f.insert_inst(end(bs[2]), Opcode::Br(bs[3]), vec![], Type::Void, "");
        f.insert_inst(end(bs[3]), Opcode::Br(bs[4]), vec![], Type::Void, "");
        f.insert_inst(end(bs[4]), Opcode::CondBr(bs[4], bs[5]), vec![c], Type::Void, "");
        f.insert_inst(end(bs[5]), Opcode::Ret, vec![], Type::Void, "");
        (f, bs)
    }

    #[test]
    fn test_idoms() {
        let (f, bs) = make_diamond_loop();
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(bs[0]), None);
        assert_eq!(dom.idom(bs[1]), Some(bs[0]));
        assert_eq!(dom.idom(bs[2]), Some(bs[0]));
        assert_eq!(dom.idom(bs[3]), Some(bs[0]));
        assert_eq!(dom.idom(bs[4]), Some(bs[3]));
        assert_eq!(dom.idom(bs[5]), Some(bs[4]));
    }

    #[test]
    fn test_block_dominates() {
        let (f, bs) = make_diamond_loop();
        let dom = DomTree::compute(&f);
        assert!(dom.block_dominates(bs[0], bs[5]));
        assert!(dom.block_dominates(bs[3], bs[4]));
        assert!(!dom.block_dominates(bs[1], bs[3]));
        assert!(!dom.block_dominates(bs[4], bs[3]));
        assert!(dom.block_dominates(bs[4], bs[4]));
    }

    #[test]
    fn test_unreachable_block() {
        let (mut f, bs) = make_diamond_loop();
        let dead = f.add_block("dead");
        f.insert_inst(InsertPoint::End(dead), Opcode::Br(bs[5]), vec![], Type::Void, "");
        let dom = DomTree::compute(&f);
        assert!(!dom.is_reachable(dead));
        assert!(!dom.block_dominates(bs[0], dead));
        assert_eq!(dom.idom(bs[5]), Some(bs[4]));
    }

    #[test]
    fn test_inst_dominates_in_block() {
        let mut f = Function::new("f", Type::Void);
        let a = f.add_param(Type::Int(16), "a");
        let entry = f.add_block("entry");
        let x = f.insert_inst(InsertPoint::End(entry), Opcode::Freeze, vec![a], Type::Int(16), "x");
        let y = f.insert_inst(InsertPoint::End(entry), Opcode::Freeze, vec![a], Type::Int(16), "y");
        let dom = DomTree::compute(&f);
        assert!(dom.dominates(&f, x, y));
        assert!(!dom.dominates(&f, y, x));
        assert!(dom.dominates(&f, x, x));
    }
}
