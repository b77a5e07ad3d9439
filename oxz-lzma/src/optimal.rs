//! Price-based optimal parsing.
//!
//! Instead of committing to the longest match greedily, the normal mode
//! builds a table of the cheapest known way to reach each of the next few
//! hundred positions. A node records the price in 1/16 bit units, its
//! parent, and the symbol that got there; the codec state and repeat
//! distances are replayed along the winning path so every price uses the
//! correct context. When the window is exhausted (or a match reaches the
//! nice length, which is taken on the spot), the parent links are walked
//! backwards and the decisions queue up for emission.

use crate::encoder::{BACK_LITERAL, LzmaEncoder};
use crate::model::{
    ALIGN_BITS, DIST_MODEL_END, DIST_MODEL_START, DIST_SLOT_BITS, DistanceModel, LEN_LOW_BITS,
    LEN_LOW_SYMBOLS, LEN_MID_BITS, LEN_MID_SYMBOLS, LengthModel, LzmaModel, MATCH_LEN_MAX,
    MATCH_LEN_MIN, REPS, State, dist_slot, dist_state,
};
use crate::model::LEN_HIGH_BITS;
use crate::range_coder::{
    INFINITY_PRICE, bit_0_price, bit_1_price, bittree_price, bittree_reverse_price, direct_price,
};
use crate::window::MatchFinder;

/// Upper bound on how many positions one parse may look ahead.
pub(crate) const OPTS: usize = 1 << 12;

/// One node of the parse table.
#[derive(Debug, Clone, Copy)]
pub struct OptNode {
    pub(crate) price: u32,
    pub(crate) pos_prev: u32,
    pub(crate) back_prev: u32,
    pub(crate) state: State,
    pub(crate) reps: [u32; REPS],
}

impl Default for OptNode {
    fn default() -> Self {
        Self {
            price: INFINITY_PRICE,
            pos_prev: 0,
            back_prev: 0,
            state: State::new(),
            reps: [0; REPS],
        }
    }
}

/// Price of a literal given full context.
fn literal_price(
    model: &LzmaModel,
    pos: u64,
    prev_byte: u8,
    from_literal_state: bool,
    match_byte: u8,
    symbol: u8,
) -> u32 {
    let probs = &model.literal[model.props.literal_index(pos, prev_byte)];

    if from_literal_state {
        let mut price = 0;
        let mut symbol = u32::from(symbol) + 0x100;
        while symbol < 0x10000 {
            price += crate::range_coder::bit_price(
                probs[(symbol >> 8) as usize],
                (symbol >> 7) & 1,
            );
            symbol <<= 1;
        }
        price
    } else {
        // Mirror the bit-matched subtree, dropping to the plain tree once
        // the symbol diverges from the match byte.
        let mut price = 0;
        let mut offset = 0x100u32;
        let mut match_byte = u32::from(match_byte);
        let mut symbol = u32::from(symbol) + 0x100;
        while symbol < 0x10000 {
            match_byte <<= 1;
            let match_bit = match_byte & offset;
            let index = (offset + match_bit + (symbol >> 8)) as usize;
            let bit = (symbol >> 7) & 1;
            price += crate::range_coder::bit_price(probs[index], bit);
            symbol <<= 1;
            offset &= !(match_byte ^ symbol);
        }
        price
    }
}

/// Price of a match or repeat length.
fn len_price(model: &LengthModel, len: usize, pos_state: usize) -> u32 {
    let len = (len - MATCH_LEN_MIN) as u32;
    if len < LEN_LOW_SYMBOLS as u32 {
        bit_0_price(model.choice) + bittree_price(&model.low[pos_state], LEN_LOW_BITS, len)
    } else if len < (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32 {
        bit_1_price(model.choice)
            + bit_0_price(model.choice2)
            + bittree_price(
                &model.mid[pos_state],
                LEN_MID_BITS,
                len - LEN_LOW_SYMBOLS as u32,
            )
    } else {
        bit_1_price(model.choice)
            + bit_1_price(model.choice2)
            + bittree_price(
                &model.high,
                LEN_HIGH_BITS,
                len - (LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS) as u32,
            )
    }
}

/// Price of selecting repeat slot `rep` (after the is_match/is_rep bits),
/// for a repeat of length two or more.
fn rep_select_price(model: &LzmaModel, rep: usize, state: State, pos_state: usize) -> u32 {
    let s = state.index();
    match rep {
        0 => bit_0_price(model.is_rep0[s]) + bit_1_price(model.is_rep0_long[s][pos_state]),
        1 => bit_1_price(model.is_rep0[s]) + bit_0_price(model.is_rep1[s]),
        2 => {
            bit_1_price(model.is_rep0[s])
                + bit_1_price(model.is_rep1[s])
                + bit_0_price(model.is_rep2[s])
        }
        _ => {
            bit_1_price(model.is_rep0[s])
                + bit_1_price(model.is_rep1[s])
                + bit_1_price(model.is_rep2[s])
        }
    }
}

/// Price of coding `dist` for a match of length `len`, excluding the
/// is_match/is_rep and length bits.
fn dist_price(model: &LzmaModel, dist: u32, len: usize) -> u32 {
    let slot = dist_slot(dist);
    let mut price = bittree_price(
        &model.dist.slot[dist_state(len)],
        DIST_SLOT_BITS,
        slot,
    );

    if slot >= DIST_MODEL_START {
        let footer_bits = (slot >> 1) - 1;
        let base = (2 | (slot & 1)) << footer_bits;
        let low = dist - base;

        if slot < DIST_MODEL_END {
            let mut node = 1u32;
            for i in 0..footer_bits {
                let bit = (low >> i) & 1;
                let idx = DistanceModel::special_index(slot, node);
                price += crate::range_coder::bit_price(model.dist.special[idx], bit);
                node = (node << 1) + bit;
            }
        } else {
            price += direct_price(footer_bits - ALIGN_BITS);
            price += bittree_reverse_price(&model.dist.align, ALIGN_BITS, low & 0xF);
        }
    }

    price
}

impl LzmaEncoder {
    /// The price-driven parser. Returns the first decision and queues the
    /// rest of the winning path in `self.pending`.
    pub(crate) fn optimum_normal(&mut self, mf: &mut MatchFinder) -> (u32, u32) {
        debug_assert!(self.pending.is_empty());
        let nice_len = self.nice_len;

        let len_main = if self.has_cached {
            self.has_cached = false;
            self.cached_len
        } else {
            self.find(mf)
        };

        let avail_total = mf.avail();
        let buf_avail = avail_total.min(MATCH_LEN_MAX);
        if buf_avail < 2 {
            return (BACK_LITERAL, 1);
        }

        // Lengths reachable through the cached repeat distances.
        let mut rep_lens = [0u32; REPS];
        let mut rep_max = 0usize;
        for i in 0..REPS {
            let dist = self.model.reps[i];
            if mf.byte_ahead(0) != mf.byte_back(dist) {
                continue;
            }
            let len = mf.match_len(dist, 1, buf_avail) as u32;
            if len >= 2 {
                rep_lens[i] = len;
                if len > rep_lens[rep_max] {
                    rep_max = i;
                }
            }
        }

        if rep_lens[rep_max] >= nice_len {
            let len = rep_lens[rep_max];
            mf.skip(len as usize - 1);
            return (rep_max as u32, len);
        }

        if len_main >= nice_len {
            let back = self.matches.last().unwrap().dist + REPS as u32;
            mf.skip(len_main as usize - 1);
            return (back, len_main);
        }

        if len_main < 2 && rep_lens[rep_max] < 2 {
            return (BACK_LITERAL, 1);
        }

        // Seed the parse table with everything reachable from position 0.
        let pos_mask = self.model.props.pos_mask();
        let pos_state = (self.pos & pos_mask) as usize;
        let state0 = self.model.state;
        let s0 = state0.index();

        self.opt[0] = OptNode {
            price: 0,
            pos_prev: 0,
            back_prev: 0,
            state: state0,
            reps: self.model.reps,
        };

        let cur_byte = mf.byte_ahead(0);
        let prev_byte = mf.byte_back(0);
        let match_byte = mf.byte_back(self.model.reps[0]);

        let match_bit_0 = bit_0_price(self.model.is_match[s0][pos_state]);
        let match_bit_1 = bit_1_price(self.model.is_match[s0][pos_state]);

        self.opt[1] = OptNode {
            price: match_bit_0
                + literal_price(
                    &self.model,
                    self.pos,
                    prev_byte,
                    state0.is_literal(),
                    match_byte,
                    cur_byte,
                ),
            pos_prev: 0,
            back_prev: BACK_LITERAL,
            ..OptNode::default()
        };

        if match_byte == cur_byte {
            let short_rep = match_bit_1
                + bit_1_price(self.model.is_rep[s0])
                + bit_0_price(self.model.is_rep0[s0])
                + bit_0_price(self.model.is_rep0_long[s0][pos_state]);
            if short_rep < self.opt[1].price {
                self.opt[1].price = short_rep;
                self.opt[1].back_prev = 0;
            }
        }

        let mut len_end = (len_main.max(rep_lens[rep_max]) as usize).min(buf_avail);
        debug_assert!(len_end >= 2);

        for node in &mut self.opt[2..=len_end] {
            node.price = INFINITY_PRICE;
        }

        let rep_base = match_bit_1 + bit_1_price(self.model.is_rep[s0]);
        for i in 0..REPS {
            if rep_lens[i] < 2 {
                continue;
            }
            let base = rep_base + rep_select_price(&self.model, i, state0, pos_state);
            for len in 2..=rep_lens[i] as usize {
                let price = base + len_price(&self.model.rep_len, len, pos_state);
                if price < self.opt[len].price {
                    self.opt[len] = OptNode {
                        price,
                        pos_prev: 0,
                        back_prev: i as u32,
                        ..OptNode::default()
                    };
                }
            }
        }

        if len_main >= 2 {
            let match_base = match_bit_1 + bit_0_price(self.model.is_rep[s0]);
            let mut mi = 0usize;
            for len in 2..=len_main as usize {
                while self.matches[mi].len < len as u32 {
                    mi += 1;
                }
                let dist = self.matches[mi].dist;
                let price = match_base
                    + len_price(&self.model.match_len, len, pos_state)
                    + dist_price(&self.model, dist, len);
                if price < self.opt[len].price {
                    self.opt[len] = OptNode {
                        price,
                        pos_prev: 0,
                        back_prev: dist + REPS as u32,
                        ..OptNode::default()
                    };
                }
            }
        }

        // Walk the table forward, finalizing one position per iteration and
        // relaxing everything reachable from it.
        let mut cur = 1usize;
        loop {
            if cur == len_end {
                break;
            }

            let new_len = self.find(mf);
            if new_len >= nice_len {
                // A long match ahead: stop extending, emit what is decided,
                // and keep the search for the next round.
                self.cached_len = new_len;
                self.has_cached = true;
                break;
            }

            // Replay the winning step into this node to know its state.
            let parent = self.opt[cur].pos_prev as usize;
            let back = self.opt[cur].back_prev;
            let step = cur - parent;
            let mut state = self.opt[parent].state;
            let mut reps = self.opt[parent].reps;

            if back == BACK_LITERAL {
                state.update_literal();
            } else if back < REPS as u32 {
                if step == 1 && back == 0 {
                    state.update_short_rep();
                } else {
                    state.update_rep();
                }
                let dist = reps[back as usize];
                for k in (1..=back as usize).rev() {
                    reps[k] = reps[k - 1];
                }
                reps[0] = dist;
            } else {
                state.update_match();
                reps = [back - REPS as u32, reps[0], reps[1], reps[2]];
            }
            self.opt[cur].state = state;
            self.opt[cur].reps = reps;

            let s = state.index();
            let ps = ((self.pos + cur as u64) & pos_mask) as usize;
            let cur_price = self.opt[cur].price;
            let avail_cur = (avail_total - cur).min(MATCH_LEN_MAX);

            let cur_byte = mf.byte_ahead(cur);
            let prev_byte = mf.byte_ahead(cur - 1);
            let match_byte = mf.byte_back_at(cur, reps[0]);

            let match_bit_0 = bit_0_price(self.model.is_match[s][ps]);
            let match_bit_1 = bit_1_price(self.model.is_match[s][ps]);

            // Literal.
            let lit = cur_price
                + match_bit_0
                + literal_price(
                    &self.model,
                    self.pos + cur as u64,
                    prev_byte,
                    state.is_literal(),
                    match_byte,
                    cur_byte,
                );
            if lit < self.opt[cur + 1].price {
                self.opt[cur + 1].price = lit;
                self.opt[cur + 1].pos_prev = cur as u32;
                self.opt[cur + 1].back_prev = BACK_LITERAL;
            }

            // One-byte repeat.
            if match_byte == cur_byte {
                let short_rep = cur_price
                    + match_bit_1
                    + bit_1_price(self.model.is_rep[s])
                    + bit_0_price(self.model.is_rep0[s])
                    + bit_0_price(self.model.is_rep0_long[s][ps]);
                if short_rep < self.opt[cur + 1].price {
                    self.opt[cur + 1].price = short_rep;
                    self.opt[cur + 1].pos_prev = cur as u32;
                    self.opt[cur + 1].back_prev = 0;
                }
            }

            let head_room = (OPTS - 1 - cur).min(avail_cur);

            // Repeats.
            let rep_base = cur_price + match_bit_1 + bit_1_price(self.model.is_rep[s]);
            for i in 0..REPS {
                let dist = reps[i];
                if mf.byte_ahead(cur) != mf.byte_back_at(cur, dist) {
                    continue;
                }
                let rl = mf.match_len_at(cur, dist, 1, head_room).min(head_room);
                if rl < 2 {
                    continue;
                }

                while len_end < cur + rl {
                    len_end += 1;
                    self.opt[len_end].price = INFINITY_PRICE;
                }

                let base = rep_base + rep_select_price(&self.model, i, state, ps);
                for l in 2..=rl {
                    let price = base + len_price(&self.model.rep_len, l, ps);
                    if price < self.opt[cur + l].price {
                        self.opt[cur + l].price = price;
                        self.opt[cur + l].pos_prev = cur as u32;
                        self.opt[cur + l].back_prev = i as u32;
                    }
                }
            }

            // Fresh matches from this position's search.
            let new_len = (new_len as usize).min(head_room);
            if new_len >= 2 {
                while len_end < cur + new_len {
                    len_end += 1;
                    self.opt[len_end].price = INFINITY_PRICE;
                }

                let match_base = cur_price + match_bit_1 + bit_0_price(self.model.is_rep[s]);
                let mut mi = 0usize;
                for l in 2..=new_len {
                    while self.matches[mi].len < l as u32 {
                        mi += 1;
                    }
                    let dist = self.matches[mi].dist;
                    let price = match_base
                        + len_price(&self.model.match_len, l, ps)
                        + dist_price(&self.model, dist, l);
                    if price < self.opt[cur + l].price {
                        self.opt[cur + l].price = price;
                        self.opt[cur + l].pos_prev = cur as u32;
                        self.opt[cur + l].back_prev = dist + REPS as u32;
                    }
                }
            }

            cur += 1;
        }

        // Walk the parent links back to the start and queue the decisions.
        let mut node = cur;
        while node > 0 {
            let parent = self.opt[node].pos_prev as usize;
            let back = self.opt[node].back_prev;
            self.pending.push_front((back, (node - parent) as u32));
            node = parent;
        }
        self.pending.pop_front().expect("non-empty path")
    }
}
