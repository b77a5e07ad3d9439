//! The LZMA symbol encoder.
//!
//! One symbol at a time: the parser (greedy with one-step lookahead, or the
//! price-based optimal parser in `optimal`) picks a literal, repeat or match
//! and this module serializes it through the range coder. The probability
//! model and the repeat-distance cache live in [`LzmaModel`] so the LZMA2
//! layer can reset them independently of the dictionary.

use std::collections::VecDeque;

use crate::model::{
    DIST_MODEL_END, DIST_MODEL_START, DIST_SLOT_BITS, DistanceModel, LEN_LOW_BITS,
    LEN_LOW_SYMBOLS, LEN_MID_BITS, LEN_MID_SYMBOLS, LengthModel, LzmaModel, LzmaProps,
    MATCH_LEN_MAX, MATCH_LEN_MIN, REPS, dist_slot, dist_state,
};
use crate::model::{ALIGN_BITS, LEN_HIGH_BITS};
use crate::optimal::OptNode;
use crate::range_coder::RangeEncoder;
use crate::window::{Match, MatchFinder};

/// Parser selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Greedy parsing with a one-byte lookahead. Cheap.
    Fast,
    /// Price-driven optimal parsing.
    Normal,
}

/// The `back` value that denotes a literal in parser decisions.
pub(crate) const BACK_LITERAL: u32 = u32::MAX;

/// Prefer a shorter match when its distance is over 128 times closer.
#[inline]
pub(crate) fn change_pair(small_dist: u32, big_dist: u32) -> bool {
    small_dist < (big_dist >> 7)
}

/// LZMA encoder state: model, parser scratch and the decision queue that
/// the optimal parser fills ahead of emission.
pub struct LzmaEncoder {
    pub(crate) model: LzmaModel,
    pub(crate) mode: Mode,
    pub(crate) nice_len: u32,
    /// Uncompressed position since the last dictionary reset.
    pub(crate) pos: u64,
    /// Match scratch shared with the match finder.
    pub(crate) matches: Vec<Match>,
    /// A lookahead search kept for the next decision.
    pub(crate) cached_len: u32,
    pub(crate) has_cached: bool,
    /// Optimal-parser node array.
    pub(crate) opt: Vec<OptNode>,
    /// Decisions already made but not yet emitted, front first.
    pub(crate) pending: VecDeque<(u32, u32)>,
}

impl LzmaEncoder {
    /// Create an encoder.
    pub fn new(props: LzmaProps, mode: Mode, nice_len: u32) -> Self {
        Self {
            model: LzmaModel::new(props),
            mode,
            nice_len,
            pos: 0,
            matches: Vec::with_capacity(MATCH_LEN_MAX + 2),
            cached_len: 0,
            has_cached: false,
            opt: match mode {
                Mode::Fast => Vec::new(),
                Mode::Normal => vec![OptNode::default(); crate::optimal::OPTS],
            },
            pending: VecDeque::new(),
        }
    }

    /// Reset probabilities and repeat distances, as after a LZMA2 state
    /// reset. The position context is preserved; it belongs to the
    /// dictionary.
    pub fn reset_state(&mut self) {
        self.model.reset();
    }

    /// Full reset including the position, for a dictionary reset.
    pub fn reset_all(&mut self) {
        self.reset_state();
        self.pos = 0;
        self.cached_len = 0;
        self.has_cached = false;
        self.pending.clear();
    }

    /// Uncompressed position since the last dictionary reset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether decisions are queued or a lookahead search is cached.
    pub fn has_lookahead(&self) -> bool {
        self.has_cached || !self.pending.is_empty()
    }

    /// Run one match search and remember the results in `self.matches`.
    pub(crate) fn find(&mut self, mf: &mut MatchFinder) -> u32 {
        mf.get_matches(&mut self.matches)
    }

    /// Encode one parser decision; returns the number of input bytes the
    /// emitted symbol covers. The caller must guarantee at least one byte
    /// is available.
    pub fn encode_one(&mut self, mf: &mut MatchFinder, rc: &mut RangeEncoder) -> usize {
        if self.pos == 0 {
            // The very first byte has no history to match against and is
            // always coded as a plain literal.
            mf.skip(1);
            let state_idx = self.model.state.index();
            rc.encode_bit(&mut self.model.is_match[state_idx][0], 0);
            self.encode_literal(rc, mf);
            self.model.state.update_literal();
            mf.forward(1);
            self.pos = 1;
            return 1;
        }

        let (back, len) = if let Some(decision) = self.pending.pop_front() {
            decision
        } else {
            match self.mode {
                Mode::Fast => self.optimum_fast(mf),
                Mode::Normal => self.optimum_normal(mf),
            }
        };

        self.encode_symbol(rc, mf, back, len);
        mf.forward(len as usize);
        self.pos += u64::from(len);
        len as usize
    }

    /// Emit the end-of-payload marker: a match with the all-ones distance.
    pub fn encode_marker(&mut self, rc: &mut RangeEncoder) {
        let pos_state = (self.pos & self.model.props.pos_mask()) as usize;
        let state_idx = self.model.state.index();
        rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 1);
        rc.encode_bit(&mut self.model.is_rep[state_idx], 0);
        encode_len(rc, &mut self.model.match_len, MATCH_LEN_MIN as u32, pos_state);
        self.encode_dist(rc, u32::MAX, MATCH_LEN_MIN);
        self.model.state.update_match();
    }

    fn encode_symbol(&mut self, rc: &mut RangeEncoder, mf: &MatchFinder, back: u32, len: u32) {
        let pos_state = (self.pos & self.model.props.pos_mask()) as usize;
        let state_idx = self.model.state.index();

        if back == BACK_LITERAL {
            debug_assert_eq!(len, 1);
            rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 0);
            self.encode_literal(rc, mf);
            self.model.state.update_literal();
            return;
        }

        rc.encode_bit(&mut self.model.is_match[state_idx][pos_state], 1);

        if back < REPS as u32 {
            // Repeat match.
            rc.encode_bit(&mut self.model.is_rep[state_idx], 1);
            let rep = back as usize;

            if rep == 0 {
                rc.encode_bit(&mut self.model.is_rep0[state_idx], 0);
                rc.encode_bit(
                    &mut self.model.is_rep0_long[state_idx][pos_state],
                    u32::from(len != 1),
                );
            } else {
                let dist = self.model.reps[rep];
                rc.encode_bit(&mut self.model.is_rep0[state_idx], 1);
                if rep == 1 {
                    rc.encode_bit(&mut self.model.is_rep1[state_idx], 0);
                } else {
                    rc.encode_bit(&mut self.model.is_rep1[state_idx], 1);
                    rc.encode_bit(&mut self.model.is_rep2[state_idx], u32::from(rep == 3));
                    if rep == 3 {
                        self.model.reps[3] = self.model.reps[2];
                    }
                    self.model.reps[2] = self.model.reps[1];
                }
                self.model.reps[1] = self.model.reps[0];
                self.model.reps[0] = dist;
            }

            if len == 1 {
                self.model.state.update_short_rep();
            } else {
                encode_len(rc, &mut self.model.rep_len, len, pos_state);
                self.model.state.update_rep();
            }
        } else {
            // New match.
            let dist = back - REPS as u32;
            rc.encode_bit(&mut self.model.is_rep[state_idx], 0);
            encode_len(rc, &mut self.model.match_len, len, pos_state);
            self.encode_dist(rc, dist, len as usize);

            self.model.reps = [
                dist,
                self.model.reps[0],
                self.model.reps[1],
                self.model.reps[2],
            ];
            self.model.state.update_match();
        }
    }

    fn encode_literal(&mut self, rc: &mut RangeEncoder, mf: &MatchFinder) {
        let byte = mf.byte_ahead(0);
        let prev = if self.pos == 0 { 0 } else { mf.byte_back(0) };
        let coder = self.model.props.literal_index(self.pos, prev);
        let probs = &mut self.model.literal[coder];

        if self.model.state.is_literal() {
            let mut symbol = usize::from(byte) | 0x100;
            let mut context = 1usize;
            while context < 0x100 {
                let bit = (symbol >> 7) & 1;
                symbol <<= 1;
                rc.encode_bit(&mut probs[context], bit as u32);
                context = (context << 1) | bit;
            }
        } else {
            let match_byte = mf.byte_back(self.model.reps[0]);
            let mut match_symbol = usize::from(match_byte) << 1;
            let mut symbol = usize::from(byte) | 0x100;
            let mut context = 1usize;

            loop {
                let match_bit = (match_symbol >> 8) & 1;
                match_symbol <<= 1;
                let bit = (symbol >> 7) & 1;
                symbol <<= 1;

                rc.encode_bit(&mut probs[0x100 + (match_bit << 8) + context], bit as u32);
                context = (context << 1) | bit;

                if context >= 0x100 {
                    break;
                }
                if match_bit != bit {
                    while context < 0x100 {
                        let bit = (symbol >> 7) & 1;
                        symbol <<= 1;
                        rc.encode_bit(&mut probs[context], bit as u32);
                        context = (context << 1) | bit;
                    }
                    break;
                }
            }
        }
    }

    fn encode_dist(&mut self, rc: &mut RangeEncoder, dist: u32, len: usize) {
        let slot = dist_slot(dist);
        rc.encode_bittree(
            &mut self.model.dist.slot[dist_state(len)],
            DIST_SLOT_BITS,
            slot,
        );

        if slot < DIST_MODEL_START {
            return;
        }

        let footer_bits = (slot >> 1) - 1;
        let base = (2 | (slot & 1)) << footer_bits;
        let low = dist - base;

        if slot < DIST_MODEL_END {
            let mut node = 1u32;
            for i in 0..footer_bits {
                let bit = (low >> i) & 1;
                let idx = DistanceModel::special_index(slot, node);
                rc.encode_bit(&mut self.model.dist.special[idx], bit);
                node = (node << 1) + bit;
            }
        } else {
            rc.encode_direct_bits(low >> ALIGN_BITS, footer_bits - ALIGN_BITS);
            rc.encode_bittree_reverse(
                &mut self.model.dist.align,
                ALIGN_BITS,
                low & (ALIGN_SIZE_MASK),
            );
        }
    }

    /// Greedy parser with a one-byte lookahead, ported decision for
    /// decision from the classic fast mode.
    fn optimum_fast(&mut self, mf: &mut MatchFinder) -> (u32, u32) {
        let nice_len = self.nice_len;

        let mut len_main = if self.has_cached {
            self.has_cached = false;
            self.cached_len
        } else {
            self.find(mf)
        };

        let buf_avail = mf.avail().min(MATCH_LEN_MAX);
        if buf_avail < 2 {
            return (BACK_LITERAL, 1);
        }

        // Check the cached repeat distances first; a long enough repeat is
        // taken immediately because it codes in very few bits.
        let mut rep_len = 0u32;
        let mut rep_index = 0u32;
        for i in 0..REPS {
            let dist = self.model.reps[i];
            debug_assert!(u64::from(dist) < self.pos);
            if mf.byte_ahead(0) != mf.byte_back(dist) {
                continue;
            }
            let len = mf.match_len(dist, 1, buf_avail) as u32;
            if len < 2 {
                continue;
            }
            if len >= nice_len {
                mf.skip(len as usize - 1);
                return (i as u32, len);
            }
            if len > rep_len {
                rep_len = len;
                rep_index = i as u32;
            }
        }

        if len_main >= nice_len {
            let back = self.matches.last().unwrap().dist + REPS as u32;
            mf.skip(len_main as usize - 1);
            return (back, len_main);
        }

        let mut back_main = 0u32;
        if len_main >= 2 {
            back_main = self.matches.last().unwrap().dist;
            // A one-byte-shorter match at a much closer distance is a
            // better deal.
            let mut count = self.matches.len();
            while count > 1 && len_main == self.matches[count - 2].len + 1 {
                if !change_pair(self.matches[count - 2].dist, back_main) {
                    break;
                }
                count -= 1;
                len_main = self.matches[count - 1].len;
                back_main = self.matches[count - 1].dist;
            }
            if len_main == 2 && back_main >= 0x80 {
                len_main = 1;
            }
        }

        if rep_len >= 2
            && (rep_len + 1 >= len_main
                || (rep_len + 2 >= len_main && back_main > (1 << 9))
                || (rep_len + 3 >= len_main && back_main > (1 << 15)))
        {
            mf.skip(rep_len as usize - 1);
            return (rep_index, rep_len);
        }

        if len_main < 2 || buf_avail <= 2 {
            return (BACK_LITERAL, 1);
        }

        // Look at the next byte; if it starts a clearly better match,
        // emitting a literal now is worth it.
        self.cached_len = self.find(mf);
        self.has_cached = true;

        if self.cached_len >= 2 {
            let new_dist = self.matches.last().unwrap().dist;
            if (self.cached_len >= len_main && new_dist < back_main)
                || (self.cached_len == len_main + 1 && !change_pair(back_main, new_dist))
                || (self.cached_len > len_main + 1)
                || (self.cached_len + 1 >= len_main
                    && len_main >= 3
                    && change_pair(new_dist, back_main))
            {
                return (BACK_LITERAL, 1);
            }
        }

        let limit = (len_main as usize - 1).max(2);
        if mf.match_len(back_main, 2, limit) < limit {
            return (BACK_LITERAL, 1);
        }

        mf.skip(len_main as usize - 2);
        (back_main + REPS as u32, len_main)
    }
}

const ALIGN_SIZE_MASK: u32 = (1 << ALIGN_BITS) - 1;

/// Encode a match or repeat length through the three-tier coder.
pub(crate) fn encode_len(
    rc: &mut RangeEncoder,
    model: &mut LengthModel,
    len: u32,
    pos_state: usize,
) {
    let len = len - MATCH_LEN_MIN as u32;

    if len < LEN_LOW_SYMBOLS as u32 {
        rc.encode_bit(&mut model.choice, 0);
        rc.encode_bittree(&mut model.low[pos_state], LEN_LOW_BITS, len);
    } else if len < (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32 {
        rc.encode_bit(&mut model.choice, 1);
        rc.encode_bit(&mut model.choice2, 0);
        rc.encode_bittree(
            &mut model.mid[pos_state],
            LEN_MID_BITS,
            len - LEN_LOW_SYMBOLS as u32,
        );
    } else {
        rc.encode_bit(&mut model.choice, 1);
        rc.encode_bit(&mut model.choice2, 1);
        rc.encode_bittree(
            &mut model.high,
            LEN_HIGH_BITS,
            len - (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32,
        );
    }
}
