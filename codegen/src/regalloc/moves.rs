//! Parallel-move scheduling.
//!
//! Register shuffles at block boundaries and call sites are permutations
//! plus copies over physical registers. The scheduler emits any move whose
//! destination is not read by a pending move; when only cycles remain it
//! breaks them with a swap, which the per-ISA layer lowers to `xchg`, a
//! scratch-register triangle or a stack scratch slot. The scratch contract
//! is the caller's: this module never picks registers itself, so
//! cycle-breaking is deterministic.

use smallvec::SmallVec;

/// One scheduled step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOp {
    /// `dst <- src`.
    Move {
        /// Destination physical id.
        dst: u8,
        /// Source physical id.
        src: u8,
    },
    /// Exchange two registers (breaks a cycle).
    Swap {
        /// One side.
        a: u8,
        /// The other side.
        b: u8,
    },
}

/// Schedule the parallel assignment `dst[i] <- src[i]`.
///
/// Duplicate destinations are not allowed; a source may feed any number of
/// destinations. Self-moves are dropped.
pub fn schedule(moves: &[(u8, u8)]) -> SmallVec<[MoveOp; 8]> {
    let mut pending: SmallVec<[(u8, u8); 8]> = moves
        .iter()
        .copied()
        .filter(|&(dst, src)| dst != src)
        .collect();
    debug_assert!(
        {
            let mut dsts: Vec<u8> = pending.iter().map(|&(d, _)| d).collect();
            dsts.sort_unstable();
            dsts.windows(2).all(|w| w[0] != w[1])
        },
        "duplicate destination in parallel move"
    );

    let mut out: SmallVec<[MoveOp; 8]> = SmallVec::new();
    while !pending.is_empty() {
        // Emit every move whose destination nobody still reads.
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            let (dst, _) = pending[i];
            let is_read = pending.iter().any(|&(_, s)| s == dst);
            if !is_read {
                let (dst, src) = pending.remove(i);
                out.push(MoveOp::Move { dst, src });
                progressed = true;
            } else {
                i += 1;
            }
        }
        if progressed {
            continue;
        }

        // Only cycles remain. Break one with a swap: exchanging the ends
        // of one edge resolves that edge and re-routes the rest.
        let (dst, src) = pending.remove(0);
        out.push(MoveOp::Swap { a: dst, b: src });
        for (_, s) in pending.iter_mut() {
            if *s == dst {
                *s = src;
            } else if *s == src {
                *s = dst;
            }
        }
        // The swapped edge is satisfied; drop any move that became a
        // self-move.
        pending.retain(|&mut (d, s)| d != s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Interpret the schedule over a register-to-value map and check it
    /// realizes the requested parallel assignment.
    fn check(moves: &[(u8, u8)]) {
        let mut state: HashMap<u8, u32> = HashMap::new();
        for r in 0..32u8 {
            state.insert(r, 1000 + u32::from(r));
        }
        let expected: Vec<(u8, u32)> =
            moves.iter().map(|&(dst, src)| (dst, state[&src])).collect();
        for op in schedule(moves) {
            match op {
                MoveOp::Move { dst, src } => {
                    let v = state[&src];
                    state.insert(dst, v);
                }
                MoveOp::Swap { a, b } => {
                    let (va, vb) = (state[&a], state[&b]);
                    state.insert(a, vb);
                    state.insert(b, va);
                }
            }
        }
        for (dst, value) in expected {
            assert_eq!(state[&dst], value, "wrong value in r{dst}");
        }
    }

    #[test]
    fn straight_chain() {
        check(&[(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn two_cycle() {
        check(&[(0, 1), (1, 0)]);
        let ops = schedule(&[(0, 1), (1, 0)]);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], MoveOp::Swap { .. }));
    }

    #[test]
    fn three_cycle() {
        check(&[(0, 1), (1, 2), (2, 0)]);
    }

    #[test]
    fn cycle_with_tail() {
        check(&[(0, 1), (1, 0), (2, 0), (3, 1)]);
    }

    #[test]
    fn fanout_source() {
        check(&[(2, 0), (3, 0), (4, 0)]);
    }

    #[test]
    fn argument_shuffle_six_regs() {
        // Six argument registers permuted at a call site.
        check(&[(7, 6), (6, 2), (2, 1), (1, 8), (8, 9), (9, 7)]);
    }

    #[test]
    fn self_moves_drop() {
        assert!(schedule(&[(3, 3)]).is_empty());
    }
}
